//! Retention policy engine - pure sensitivity -> retention mapping.
//!
//! Only answers queries; the purge process that acts on expired records lives
//! outside this crate.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyLevel {
    Standard,
    High,
    Critical,
    Immutable,
}

impl PrivacyLevel {
    pub const ALL: [PrivacyLevel; 4] = [
        Self::Standard,
        Self::High,
        Self::Critical,
        Self::Immutable,
    ];

    /// Retention window in days. The critical window is the seven-year
    /// bookkeeping horizon; immutable records are kept for ten years.
    pub fn retention_days(&self) -> i64 {
        match self {
            Self::Standard => 730,
            Self::High => 1095,
            Self::Critical => 2555,
            Self::Immutable => 3650,
        }
    }

    /// Whether every state change at this level must carry an audit entry.
    pub fn requires_audit(&self) -> bool {
        !matches!(self, Self::Standard)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::High => "high",
            Self::Critical => "critical",
            Self::Immutable => "immutable",
        }
    }
}

impl std::fmt::Display for PrivacyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PrivacyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(Self::Standard),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            "immutable" => Ok(Self::Immutable),
            other => Err(format!("unknown privacy level: {other}")),
        }
    }
}

/// A record is expired once it has outlived its level's retention window.
pub fn is_expired(level: PrivacyLevel, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - created_at > Duration::days(level.retention_days())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_util;

    #[test]
    fn test_retention_days_table() {
        test_util::setup();
        assert_eq!(PrivacyLevel::Standard.retention_days(), 730);
        assert_eq!(PrivacyLevel::High.retention_days(), 1095);
        assert_eq!(PrivacyLevel::Critical.retention_days(), 2555);
        assert_eq!(PrivacyLevel::Immutable.retention_days(), 3650);
    }

    #[test]
    fn test_requires_audit() {
        test_util::setup();
        assert!(!PrivacyLevel::Standard.requires_audit());
        assert!(PrivacyLevel::High.requires_audit());
        assert!(PrivacyLevel::Critical.requires_audit());
        assert!(PrivacyLevel::Immutable.requires_audit());
    }

    #[test]
    fn test_expiry_boundaries() {
        test_util::setup();
        let now = Utc::now();

        let critical = PrivacyLevel::Critical;
        assert!(is_expired(critical, now - Duration::days(2556), now));
        assert!(!is_expired(critical, now - Duration::days(2555), now));
        assert!(!is_expired(critical, now - Duration::days(2554), now));
    }

    #[test]
    fn test_level_round_trip() {
        test_util::setup();
        for level in PrivacyLevel::ALL {
            assert_eq!(level.as_str().parse::<PrivacyLevel>().unwrap(), level);
        }
        assert!("essential".parse::<PrivacyLevel>().is_err());
    }
}
