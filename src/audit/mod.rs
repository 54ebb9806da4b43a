//! Append-only audit log. Entries are ordered by a monotonic `sequence`
//! assigned by the database, not by wall-clock time, so the order is
//! deterministic even under clock skew. Nothing in this crate updates or
//! deletes a written entry.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConsentError;
use crate::shared::models::{DbAuditLogEntry, NewAuditLogEntry};
use crate::shared::schema::audit_log;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ConsentGranted,
    ConsentRenewed,
    ConsentWithdrawn,
    DefaultsSeeded,
    ReconciliationRun,
    HealthCheck,
    BootstrapCompleted,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConsentGranted => "consent_granted",
            Self::ConsentRenewed => "consent_renewed",
            Self::ConsentWithdrawn => "consent_withdrawn",
            Self::DefaultsSeeded => "defaults_seeded",
            Self::ReconciliationRun => "reconciliation_run",
            Self::HealthCheck => "health_check",
            Self::BootstrapCompleted => "bootstrap_completed",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "consent_granted" => Ok(Self::ConsentGranted),
            "consent_renewed" => Ok(Self::ConsentRenewed),
            "consent_withdrawn" => Ok(Self::ConsentWithdrawn),
            "defaults_seeded" => Ok(Self::DefaultsSeeded),
            "reconciliation_run" => Ok(Self::ReconciliationRun),
            "health_check" => Ok(Self::HealthCheck),
            "bootstrap_completed" => Ok(Self::BootstrapCompleted),
            other => Err(format!("unknown audit action: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    System,
    User(Uuid),
}

impl Actor {
    pub fn as_string(&self) -> String {
        match self {
            Self::System => "system".to_string(),
            Self::User(id) => id.to_string(),
        }
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub user: Option<Uuid>,
    pub action: Option<AuditAction>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

/// Append one entry. Runs on the caller's connection so a mutation and its
/// audit entry share a transaction; a failed append must abort that
/// transaction, which is why the error is its own class and never downgraded.
pub fn append(
    conn: &mut PgConnection,
    actor: &Actor,
    action: AuditAction,
    context: serde_json::Value,
) -> Result<DbAuditLogEntry, ConsentError> {
    let entry = NewAuditLogEntry {
        actor: actor.as_string(),
        action: action.as_str().to_string(),
        context,
        created_at: Utc::now(),
    };

    diesel::insert_into(audit_log::table)
        .values(&entry)
        .get_result::<DbAuditLogEntry>(conn)
        .map_err(|e| ConsentError::AuditWrite(e.to_string()))
}

/// Read entries matching the filter, ascending by `sequence`.
pub fn query(
    conn: &mut PgConnection,
    filter: &AuditFilter,
) -> Result<Vec<DbAuditLogEntry>, ConsentError> {
    let mut q = audit_log::table.into_boxed();

    if let Some(user) = filter.user {
        q = q.filter(audit_log::actor.eq(user.to_string()));
    }
    if let Some(action) = filter.action {
        q = q.filter(audit_log::action.eq(action.as_str()));
    }
    if let Some(from) = filter.from {
        q = q.filter(audit_log::created_at.ge(from));
    }
    if let Some(to) = filter.to {
        q = q.filter(audit_log::created_at.le(to));
    }

    q = q.order(audit_log::sequence.asc());
    if let Some(limit) = filter.limit {
        q = q.limit(limit);
    }

    q.load::<DbAuditLogEntry>(conn).map_err(ConsentError::from)
}

/// Count entries for an action; used by reconciliation idempotence checks.
pub fn count_action(conn: &mut PgConnection, action: AuditAction) -> Result<i64, ConsentError> {
    audit_log::table
        .filter(audit_log::action.eq(action.as_str()))
        .count()
        .get_result(conn)
        .map_err(ConsentError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_util;

    #[test]
    fn test_action_round_trip() {
        test_util::setup();
        let actions = [
            AuditAction::ConsentGranted,
            AuditAction::ConsentRenewed,
            AuditAction::ConsentWithdrawn,
            AuditAction::DefaultsSeeded,
            AuditAction::ReconciliationRun,
            AuditAction::HealthCheck,
            AuditAction::BootstrapCompleted,
        ];
        for action in actions {
            assert_eq!(action.as_str().parse::<AuditAction>().unwrap(), action);
        }
        assert!("consent_revoked".parse::<AuditAction>().is_err());
    }

    #[test]
    fn test_actor_rendering() {
        test_util::setup();
        assert_eq!(Actor::System.as_string(), "system");

        let id = Uuid::new_v4();
        assert_eq!(Actor::User(id).as_string(), id.to_string());
    }
}
