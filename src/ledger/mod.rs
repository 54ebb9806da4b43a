//! User consent ledger - per-user, per-type grant/withdraw history.
//!
//! Every mutation commits together with its audit entry or not at all.
//! Same-pair writes are serialized by locking the open row; different users
//! never contend.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::audit::{self, Actor, AuditAction};
use crate::error::ConsentError;
use crate::registry::{ConsentTypeDef, ConsentTypeRegistry};
use crate::shared::models::DbUserConsent;
use crate::shared::schema::user_consents;
use crate::shared::utils::DbPool;
use crate::versions;

/// UI-facing state of one consent type for one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentStatusEntry {
    pub type_slug: String,
    pub granted: bool,
    pub status: ConsentState,
    pub required: bool,
    pub legal_basis: String,
    pub version_id: Option<Uuid>,
    pub granted_at: Option<DateTime<Utc>>,
    pub withdrawn_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentState {
    Active,
    Withdrawn,
    NotGiven,
}

/// Grant or renew consent for a (user, type) pair, binding it to `version_id`.
///
/// If an open record exists it is reactivated in place (renew); otherwise a
/// fresh record is inserted, leaving any withdrawn predecessors as history.
pub fn grant(
    conn: &mut PgConnection,
    user_id: Uuid,
    def: &ConsentTypeDef,
    version_id: Uuid,
) -> Result<DbUserConsent, ConsentError> {
    conn.transaction::<_, ConsentError, _>(|conn| {
        let now = Utc::now();
        let open = lock_open_record(conn, user_id, &def.slug)?;

        let (record, action) = match open {
            Some(existing) => {
                let record = diesel::update(user_consents::table.find(existing.id))
                    .set((
                        user_consents::granted.eq(true),
                        user_consents::granted_at.eq(now),
                        user_consents::version_id.eq(version_id),
                        user_consents::updated_at.eq(now),
                    ))
                    .get_result::<DbUserConsent>(conn)?;
                (record, AuditAction::ConsentRenewed)
            }
            None => {
                let record = DbUserConsent {
                    id: Uuid::new_v4(),
                    user_id,
                    type_slug: def.slug.clone(),
                    version_id: Some(version_id),
                    granted: true,
                    legal_basis: def.legal_basis.as_str().to_string(),
                    granted_at: now,
                    withdrawn_at: None,
                    created_at: now,
                    updated_at: now,
                };
                // Two first-grants racing on the same pair both see no open
                // row; the partial unique index stops the loser, which
                // surfaces as a retryable conflict.
                diesel::insert_into(user_consents::table)
                    .values(&record)
                    .execute(conn)
                    .map_err(|e| match e {
                        diesel::result::Error::DatabaseError(
                            diesel::result::DatabaseErrorKind::UniqueViolation,
                            info,
                        ) => ConsentError::Concurrency(format!(
                            "concurrent grant for the same consent pair: {}",
                            info.message()
                        )),
                        other => ConsentError::Database(other),
                    })?;
                (record, AuditAction::ConsentGranted)
            }
        };

        audit::append(
            conn,
            &Actor::User(user_id),
            action,
            json!({
                "type_slug": &def.slug,
                "version_id": version_id,
                "legal_basis": def.legal_basis.as_str(),
            }),
        )?;

        info!("{} {} for user {}", action, def.slug, user_id);
        Ok(record)
    })
}

/// Withdraw consent for a (user, type) pair. Stamps `withdrawn_at` on the
/// open record; the row stays behind as history. Returns false when there is
/// nothing open to withdraw.
pub fn withdraw(
    conn: &mut PgConnection,
    user_id: Uuid,
    type_slug: &str,
) -> Result<bool, ConsentError> {
    conn.transaction::<_, ConsentError, _>(|conn| {
        let Some(open) = lock_open_record(conn, user_id, type_slug)? else {
            return Ok(false);
        };

        let now = Utc::now();
        diesel::update(user_consents::table.find(open.id))
            .set((
                user_consents::withdrawn_at.eq(now),
                user_consents::updated_at.eq(now),
            ))
            .execute(conn)?;

        audit::append(
            conn,
            &Actor::User(user_id),
            AuditAction::ConsentWithdrawn,
            json!({
                "type_slug": type_slug,
                "record_id": open.id,
            }),
        )?;

        info!("consent_withdrawn {} for user {}", type_slug, user_id);
        Ok(true)
    })
}

/// True iff the user has an open, granted record bound to the currently
/// active version. A grant left on a superseded version does not count until
/// reconciliation repairs it.
pub fn has_active_consent(
    conn: &mut PgConnection,
    user_id: Uuid,
    type_slug: &str,
) -> Result<bool, ConsentError> {
    let Some(active) = versions::get_active_version(conn)? else {
        return Ok(false);
    };

    let count: i64 = user_consents::table
        .filter(user_consents::user_id.eq(user_id))
        .filter(user_consents::type_slug.eq(type_slug))
        .filter(user_consents::withdrawn_at.is_null())
        .filter(user_consents::granted.eq(true))
        .filter(user_consents::version_id.eq(active.id))
        .count()
        .get_result(conn)?;

    Ok(count > 0)
}

/// Current state of every registry-declared type for one user.
pub fn consent_status(
    conn: &mut PgConnection,
    registry: &dyn ConsentTypeRegistry,
    user_id: Uuid,
) -> Result<Vec<ConsentStatusEntry>, ConsentError> {
    let rows: Vec<DbUserConsent> = user_consents::table
        .filter(user_consents::user_id.eq(user_id))
        .order(user_consents::created_at.desc())
        .load(conn)?;

    let mut latest_by_slug: HashMap<&str, &DbUserConsent> = HashMap::new();
    for row in &rows {
        latest_by_slug.entry(row.type_slug.as_str()).or_insert(row);
    }

    let entries = registry
        .available_types()
        .into_iter()
        .map(|def| {
            let latest = latest_by_slug.get(def.slug.as_str());
            let status = match latest {
                Some(row) if row.is_open() && row.granted => ConsentState::Active,
                Some(_) => ConsentState::Withdrawn,
                None => ConsentState::NotGiven,
            };
            ConsentStatusEntry {
                granted: status == ConsentState::Active,
                status,
                required: def.required,
                legal_basis: def.legal_basis.as_str().to_string(),
                version_id: latest.and_then(|r| r.version_id),
                granted_at: latest.map(|r| r.granted_at),
                withdrawn_at: latest.and_then(|r| r.withdrawn_at),
                type_slug: def.slug,
            }
        })
        .collect();

    Ok(entries)
}

/// Full grant/withdraw history for a user, newest first.
pub fn consent_history(
    conn: &mut PgConnection,
    user_id: Uuid,
    limit: i64,
) -> Result<Vec<DbUserConsent>, ConsentError> {
    user_consents::table
        .filter(user_consents::user_id.eq(user_id))
        .order(user_consents::created_at.desc())
        .limit(limit)
        .load(conn)
        .map_err(ConsentError::from)
}

/// Create registration-time records for every registry type the user does
/// not already have an open record for. Required types are always granted;
/// the rest default to declined unless `overrides` grants them.
pub fn seed_defaults(
    conn: &mut PgConnection,
    registry: &dyn ConsentTypeRegistry,
    user_id: Uuid,
    overrides: &HashMap<String, bool>,
) -> Result<HashMap<String, bool>, ConsentError> {
    registry.ensure_usable()?;
    let Some(active) = versions::get_active_version(conn)? else {
        return Err(ConsentError::Configuration(
            "no active consent version; run bootstrap first".to_string(),
        ));
    };

    conn.transaction::<_, ConsentError, _>(|conn| {
        let now = Utc::now();
        let mut seeded = HashMap::new();

        for def in registry.available_types() {
            if lock_open_record(conn, user_id, &def.slug)?.is_some() {
                continue;
            }

            let granted =
                def.required || overrides.get(def.slug.as_str()).copied().unwrap_or(false);

            let record = DbUserConsent {
                id: Uuid::new_v4(),
                user_id,
                type_slug: def.slug.clone(),
                version_id: Some(active.id),
                granted,
                legal_basis: def.legal_basis.as_str().to_string(),
                granted_at: now,
                withdrawn_at: None,
                created_at: now,
                updated_at: now,
            };
            diesel::insert_into(user_consents::table)
                .values(&record)
                .execute(conn)?;

            seeded.insert(def.slug, granted);
        }

        if !seeded.is_empty() {
            audit::append(
                conn,
                &Actor::User(user_id),
                AuditAction::DefaultsSeeded,
                json!({
                    "version_id": active.id,
                    "seeded": &seeded,
                }),
            )?;
        }

        Ok(seeded)
    })
}

/// Lock and return the open record for a pair, if any. `FOR UPDATE` is what
/// serializes concurrent writers on the same pair.
fn lock_open_record(
    conn: &mut PgConnection,
    user_id: Uuid,
    type_slug: &str,
) -> Result<Option<DbUserConsent>, ConsentError> {
    user_consents::table
        .filter(user_consents::user_id.eq(user_id))
        .filter(user_consents::type_slug.eq(type_slug))
        .filter(user_consents::withdrawn_at.is_null())
        .for_update()
        .first::<DbUserConsent>(conn)
        .optional()
        .map_err(ConsentError::from)
}

/// Async facade over the ledger for the authorization layer and other
/// in-process consumers. Database work runs on the blocking pool.
#[derive(Clone)]
pub struct ConsentService {
    pool: DbPool,
    registry: Arc<dyn ConsentTypeRegistry>,
}

impl ConsentService {
    pub fn new(pool: DbPool, registry: Arc<dyn ConsentTypeRegistry>) -> Self {
        Self { pool, registry }
    }

    pub fn registry(&self) -> &dyn ConsentTypeRegistry {
        self.registry.as_ref()
    }

    /// Disclosed purposes with their retention obligations, for consumers
    /// that render the consent surface.
    pub fn available_types(&self) -> Vec<ConsentTypeDef> {
        self.registry.available_types()
    }

    pub async fn grant(&self, user_id: Uuid, type_slug: &str) -> Result<(), ConsentError> {
        let def = self.known_type(type_slug)?;
        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(|e| ConsentError::Pool(e.to_string()))?;
            conn.transaction::<_, ConsentError, _>(|conn| {
                let active = versions::get_active_version(conn)?.ok_or_else(|| {
                    ConsentError::Configuration(
                        "no active consent version; run bootstrap first".to_string(),
                    )
                })?;
                grant(conn, user_id, &def, active.id)?;
                Ok(())
            })
        })
        .await
        .map_err(|e| ConsentError::Internal(e.to_string()))?
    }

    /// Withdraw a consent. Required types cannot be withdrawn; the call is
    /// refused and reported as false.
    pub async fn withdraw(&self, user_id: Uuid, type_slug: &str) -> Result<bool, ConsentError> {
        let def = self.known_type(type_slug)?;
        if def.required {
            warn!(
                "refusing withdrawal of required consent {} for user {}",
                def.slug, user_id
            );
            return Ok(false);
        }

        let pool = self.pool.clone();
        let slug = def.slug;
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(|e| ConsentError::Pool(e.to_string()))?;
            withdraw(&mut conn, user_id, &slug)
        })
        .await
        .map_err(|e| ConsentError::Internal(e.to_string()))?
    }

    /// Errors propagate to the caller, which must treat them as "no consent".
    pub async fn has_active_consent(
        &self,
        user_id: Uuid,
        type_slug: &str,
    ) -> Result<bool, ConsentError> {
        let pool = self.pool.clone();
        let slug = type_slug.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(|e| ConsentError::Pool(e.to_string()))?;
            has_active_consent(&mut conn, user_id, &slug)
        })
        .await
        .map_err(|e| ConsentError::Internal(e.to_string()))?
    }

    pub async fn consent_status(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<ConsentStatusEntry>, ConsentError> {
        let pool = self.pool.clone();
        let registry = self.registry.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(|e| ConsentError::Pool(e.to_string()))?;
            consent_status(&mut conn, registry.as_ref(), user_id)
        })
        .await
        .map_err(|e| ConsentError::Internal(e.to_string()))?
    }

    pub async fn consent_history(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<DbUserConsent>, ConsentError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(|e| ConsentError::Pool(e.to_string()))?;
            consent_history(&mut conn, user_id, limit)
        })
        .await
        .map_err(|e| ConsentError::Internal(e.to_string()))?
    }

    pub async fn seed_defaults(
        &self,
        user_id: Uuid,
        overrides: HashMap<String, bool>,
    ) -> Result<HashMap<String, bool>, ConsentError> {
        let pool = self.pool.clone();
        let registry = self.registry.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(|e| ConsentError::Pool(e.to_string()))?;
            seed_defaults(&mut conn, registry.as_ref(), user_id, &overrides)
        })
        .await
        .map_err(|e| ConsentError::Internal(e.to_string()))?
    }

    fn known_type(&self, type_slug: &str) -> Result<ConsentTypeDef, ConsentError> {
        self.registry
            .get(type_slug)
            .ok_or_else(|| ConsentError::Validation(format!("unknown consent type: {type_slug}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_util;

    #[test]
    fn test_consent_state_serializes_snake_case() {
        test_util::setup();
        assert_eq!(
            serde_json::to_value(ConsentState::NotGiven).unwrap(),
            serde_json::Value::String("not_given".to_string())
        );
    }
}
