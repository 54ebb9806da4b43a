//! Consent type registry - the code-declared source of truth for the
//! purposes a user can be asked to consent to. The persisted version store
//! snapshots this set; it never feeds back into it.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::ConsentError;
use crate::retention::PrivacyLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegalBasis {
    Consent,
    LegitimateInterest,
}

impl LegalBasis {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Consent => "consent",
            Self::LegitimateInterest => "legitimate_interest",
        }
    }
}

impl std::fmt::Display for LegalBasis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentTypeDef {
    pub slug: String,
    pub legal_basis: LegalBasis,
    pub required: bool,
    pub description: String,
    pub privacy_level: PrivacyLevel,
}

impl ConsentTypeDef {
    pub fn retention_days(&self) -> i64 {
        self.privacy_level.retention_days()
    }

    pub fn requires_audit(&self) -> bool {
        self.privacy_level.requires_audit()
    }
}

/// Read-only provider of the canonical consent purposes. Injected so the
/// engine can be pointed at a different declaration set in tests or when a
/// deployment ships its own purpose catalogue.
pub trait ConsentTypeRegistry: Send + Sync {
    fn available_types(&self) -> Vec<ConsentTypeDef>;

    fn get(&self, slug: &str) -> Option<ConsentTypeDef> {
        self.available_types().into_iter().find(|t| t.slug == slug)
    }

    fn slugs(&self) -> BTreeSet<String> {
        self.available_types()
            .into_iter()
            .map(|t| t.slug)
            .collect()
    }

    /// An empty registry means the deployment is misconfigured; nothing in
    /// the engine may proceed against it.
    fn ensure_usable(&self) -> Result<(), ConsentError> {
        if self.available_types().is_empty() {
            return Err(ConsentError::Configuration(
                "consent type registry declares no types".to_string(),
            ));
        }
        Ok(())
    }
}

static BUILTIN_TYPES: Lazy<Vec<ConsentTypeDef>> = Lazy::new(|| {
    vec![
        ConsentTypeDef {
            slug: "functional".to_string(),
            legal_basis: LegalBasis::LegitimateInterest,
            required: true,
            description: "Essential platform operations such as authentication and security"
                .to_string(),
            privacy_level: PrivacyLevel::Standard,
        },
        ConsentTypeDef {
            slug: "analytics".to_string(),
            legal_basis: LegalBasis::Consent,
            required: false,
            description: "Aggregated usage statistics used to improve the platform".to_string(),
            privacy_level: PrivacyLevel::Standard,
        },
        ConsentTypeDef {
            slug: "marketing".to_string(),
            legal_basis: LegalBasis::Consent,
            required: false,
            description: "Direct marketing communications and campaign personalization"
                .to_string(),
            privacy_level: PrivacyLevel::High,
        },
        ConsentTypeDef {
            slug: "profiling".to_string(),
            legal_basis: LegalBasis::Consent,
            required: false,
            description: "Automated profiling to tailor content and recommendations".to_string(),
            privacy_level: PrivacyLevel::Critical,
        },
        ConsentTypeDef {
            slug: "allow_personal_data_processing".to_string(),
            legal_basis: LegalBasis::Consent,
            required: false,
            description: "Processing of personal data beyond what the platform strictly needs"
                .to_string(),
            privacy_level: PrivacyLevel::Critical,
        },
    ]
});

/// The purposes this platform discloses, declared in code.
#[derive(Debug, Default, Clone)]
pub struct BuiltinRegistry;

impl ConsentTypeRegistry for BuiltinRegistry {
    fn available_types(&self) -> Vec<ConsentTypeDef> {
        BUILTIN_TYPES.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_util;

    #[test]
    fn test_builtin_registry_is_usable() {
        test_util::setup();
        let registry = BuiltinRegistry;
        assert!(registry.ensure_usable().is_ok());
        assert_eq!(registry.available_types().len(), 5);
    }

    #[test]
    fn test_builtin_slugs_are_unique() {
        test_util::setup();
        let registry = BuiltinRegistry;
        let types = registry.available_types();
        assert_eq!(registry.slugs().len(), types.len());
    }

    #[test]
    fn test_functional_is_required_legitimate_interest() {
        test_util::setup();
        let def = BuiltinRegistry.get("functional").unwrap();
        assert!(def.required);
        assert_eq!(def.legal_basis, LegalBasis::LegitimateInterest);
    }

    #[test]
    fn test_unknown_slug_is_absent() {
        test_util::setup();
        assert!(BuiltinRegistry.get("telemetry").is_none());
    }

    #[test]
    fn test_defs_expose_retention_obligations() {
        test_util::setup();
        let profiling = BuiltinRegistry.get("profiling").unwrap();
        assert_eq!(profiling.retention_days(), 2555);
        assert!(profiling.requires_audit());

        let analytics = BuiltinRegistry.get("analytics").unwrap();
        assert_eq!(analytics.retention_days(), 730);
        assert!(!analytics.requires_audit());
    }

    #[test]
    fn test_empty_registry_is_configuration_error() {
        test_util::setup();
        struct EmptyRegistry;
        impl ConsentTypeRegistry for EmptyRegistry {
            fn available_types(&self) -> Vec<ConsentTypeDef> {
                Vec::new()
            }
        }
        let err = EmptyRegistry.ensure_usable().unwrap_err();
        assert!(matches!(err, ConsentError::Configuration(_)));
    }
}
