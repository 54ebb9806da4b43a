use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::shared::schema::{audit_log, consent_versions, user_consents};

/// Immutable snapshot of the complete set of consent types in effect.
///
/// `type_slugs` is the authoritative ordered set; `type_definitions` freezes
/// the full slug -> definition map the registry declared when the version was
/// created. Superseded rows are never mutated, only flipped inactive.
#[derive(Debug, Clone, Queryable, Insertable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = consent_versions)]
pub struct DbConsentVersion {
    pub id: Uuid,
    pub version_label: String,
    pub type_slugs: Vec<String>,
    pub type_definitions: serde_json::Value,
    pub is_active: bool,
    pub effective_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl DbConsentVersion {
    pub fn covers(&self, slug: &str) -> bool {
        self.type_slugs.iter().any(|s| s == slug)
    }
}

/// One grant/withdraw episode for a (user, type) pair.
///
/// At most one row per pair has `withdrawn_at = NULL`; withdrawal is a state
/// transition, never a delete, so closed rows are the consent history.
#[derive(Debug, Clone, Queryable, Insertable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = user_consents)]
pub struct DbUserConsent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub type_slug: String,
    pub version_id: Option<Uuid>,
    pub granted: bool,
    pub legal_basis: String,
    pub granted_at: DateTime<Utc>,
    pub withdrawn_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DbUserConsent {
    /// Open means the record is the live state for its (user, type) pair.
    pub fn is_open(&self) -> bool {
        self.withdrawn_at.is_none()
    }
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = audit_log)]
#[diesel(primary_key(sequence))]
pub struct DbAuditLogEntry {
    pub sequence: i64,
    pub actor: String,
    pub action: String,
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Insert shape for the audit log; `sequence` is assigned by the database.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = audit_log)]
pub struct NewAuditLogEntry {
    pub actor: String,
    pub action: String,
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
