//! Reconciliation engine. Detects drift between the code-declared registry
//! and the persisted active version, repairs the version store and any
//! stale ledger bindings, and writes one summarizing audit entry per run
//! that changed anything.
//!
//! The whole repair executes in a single transaction holding a Postgres
//! advisory lock, so two overlapping triggers can never mint two active
//! versions or double-count repairs.

use std::collections::BTreeSet;
use std::time::Duration;

use diesel::prelude::*;
use diesel::sql_types::{BigInt, Bool};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::audit::{self, Actor, AuditAction};
use crate::error::ConsentError;
use crate::registry::ConsentTypeRegistry;
use crate::shared::schema::user_consents;
use crate::versions;

/// Advisory lock key for the "consent_reconciliation" resource; the bytes of
/// the word "consent" as a 64-bit integer.
const RECONCILE_LOCK_KEY: i64 = 0x636f_6e73_656e_74;

const MAX_LOCK_ATTEMPTS: u32 = 3;
const LOCK_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Id and label of the successor version, when one was created.
    pub version_id: Option<Uuid>,
    pub version_label: Option<String>,
    pub types_added: Vec<String>,
    pub types_removed: Vec<String>,
    /// Ledger rows whose version binding was repaired.
    pub records_repaired: usize,
    /// Registry-dropped types still referenced by open grants. Never removed
    /// without an operator decision.
    pub unrepairable: Vec<String>,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        self.version_id.is_some() || self.records_repaired > 0
    }

    pub fn is_clean(&self) -> bool {
        self.unrepairable.is_empty()
    }
}

/// Registry/store set difference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drift {
    pub missing: BTreeSet<String>,
    pub extra: BTreeSet<String>,
}

impl Drift {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty()
    }
}

pub fn compute_drift(registry: &BTreeSet<String>, persisted: &BTreeSet<String>) -> Drift {
    Drift {
        missing: registry.difference(persisted).cloned().collect(),
        extra: persisted.difference(registry).cloned().collect(),
    }
}

/// The merged set the successor version must cover: the registry always
/// wins, except that a dropped type still referenced by open grants is kept
/// until an operator confirms its removal.
pub fn merge_sets(registry: &BTreeSet<String>, kept: &BTreeSet<String>) -> BTreeSet<String> {
    registry.union(kept).cloned().collect()
}

/// Run one reconciliation pass. Retries briefly when another pass holds the
/// lock, then surfaces the contention as a transient error.
pub fn run(
    conn: &mut PgConnection,
    registry: &dyn ConsentTypeRegistry,
    actor: &Actor,
) -> Result<ReconcileReport, ConsentError> {
    registry.ensure_usable()?;

    let mut attempt = 0;
    loop {
        attempt += 1;
        match run_locked(conn, registry, actor) {
            Err(ConsentError::Concurrency(msg)) if attempt < MAX_LOCK_ATTEMPTS => {
                debug!(
                    "reconciliation lock busy (attempt {}/{}): {}",
                    attempt, MAX_LOCK_ATTEMPTS, msg
                );
                std::thread::sleep(LOCK_BACKOFF * 2u32.pow(attempt - 1));
            }
            other => return other,
        }
    }
}

fn run_locked(
    conn: &mut PgConnection,
    registry: &dyn ConsentTypeRegistry,
    actor: &Actor,
) -> Result<ReconcileReport, ConsentError> {
    conn.transaction::<_, ConsentError, _>(|conn| {
        if !try_advisory_lock(conn)? {
            return Err(ConsentError::Concurrency(
                "another reconciliation holds the advisory lock".to_string(),
            ));
        }

        let registry_slugs = registry.slugs();
        let active = versions::get_active_version(conn)?;
        let persisted: BTreeSet<String> = active
            .as_ref()
            .map(|v| v.type_slugs.iter().cloned().collect())
            .unwrap_or_default();

        let drift = compute_drift(&registry_slugs, &persisted);
        let kept = still_referenced(conn, &drift.extra)?;
        let merged = merge_sets(&registry_slugs, &kept);

        if !kept.is_empty() {
            warn!(
                "registry dropped types still referenced by open consents: {}",
                kept.iter().cloned().collect::<Vec<_>>().join(", ")
            );
        }

        let mut report = ReconcileReport {
            types_added: drift.missing.iter().cloned().collect(),
            types_removed: drift.extra.difference(&kept).cloned().collect(),
            unrepairable: kept.iter().cloned().collect(),
            ..ReconcileReport::default()
        };

        let target = if merged != persisted {
            let definitions = snapshot_definitions(registry, &merged, active.as_ref());
            let successor = versions::create_version(conn, &merged, definitions)?;
            report.version_id = Some(successor.id);
            report.version_label = Some(successor.version_label.clone());
            Some(successor)
        } else {
            // Set already matches; nothing to supersede, but stale or NULL
            // ledger bindings may still need pointing at the active version.
            active
        };

        if let Some(version) = &target {
            report.records_repaired = repair_ledger_bindings(conn, version.id, &merged)?;
        }

        if report.changed() {
            audit::append(
                conn,
                actor,
                AuditAction::ReconciliationRun,
                json!({
                    "version_id": report.version_id,
                    "version_label": &report.version_label,
                    "types_added": &report.types_added,
                    "types_removed": &report.types_removed,
                    "records_repaired": report.records_repaired,
                    "unrepairable": &report.unrepairable,
                }),
            )?;
            info!(
                "reconciliation: +{} -{} types, {} records repaired{}",
                report.types_added.len(),
                report.types_removed.len(),
                report.records_repaired,
                if report.is_clean() {
                    String::new()
                } else {
                    format!(", {} unrepairable", report.unrepairable.len())
                }
            );
        } else {
            debug!("reconciliation: no drift, nothing to do");
        }

        Ok(report)
    })
}

/// Dropped slugs that open, granted ledger rows still reference.
pub(crate) fn still_referenced(
    conn: &mut PgConnection,
    extra: &BTreeSet<String>,
) -> Result<BTreeSet<String>, ConsentError> {
    if extra.is_empty() {
        return Ok(BTreeSet::new());
    }

    let slugs: Vec<String> = extra.iter().cloned().collect();
    let referenced: Vec<String> = user_consents::table
        .filter(user_consents::type_slug.eq_any(&slugs))
        .filter(user_consents::withdrawn_at.is_null())
        .filter(user_consents::granted.eq(true))
        .select(user_consents::type_slug)
        .distinct()
        .load(conn)?;

    Ok(referenced.into_iter().collect())
}

/// Point stale ledger rows at `target`: every open row covered by the merged
/// set, plus closed rows that never got a version binding. Closed rows with
/// a binding keep it - that is the historical record.
fn repair_ledger_bindings(
    conn: &mut PgConnection,
    target: Uuid,
    merged: &BTreeSet<String>,
) -> Result<usize, ConsentError> {
    let slugs: Vec<String> = merged.iter().cloned().collect();
    let now = chrono::Utc::now();

    let repaired = diesel::update(
        user_consents::table
            .filter(user_consents::type_slug.eq_any(&slugs))
            .filter(
                user_consents::withdrawn_at
                    .is_null()
                    .or(user_consents::version_id.is_null()),
            )
            .filter(
                user_consents::version_id
                    .is_null()
                    .or(user_consents::version_id.ne(target)),
            ),
    )
    .set((
        user_consents::version_id.eq(target),
        user_consents::updated_at.eq(now),
    ))
    .execute(conn)?;

    Ok(repaired)
}

/// Freeze the registry definitions for the merged set. A kept type the
/// registry no longer declares carries its definition forward from the
/// superseded version's snapshot.
fn snapshot_definitions(
    registry: &dyn ConsentTypeRegistry,
    merged: &BTreeSet<String>,
    previous: Option<&crate::shared::models::DbConsentVersion>,
) -> serde_json::Value {
    let mut map = serde_json::Map::new();

    for def in registry.available_types() {
        if merged.contains(&def.slug) {
            let slug = def.slug.clone();
            if let Ok(value) = serde_json::to_value(&def) {
                map.insert(slug, value);
            }
        }
    }

    if let Some(prev) = previous {
        if let Some(prev_map) = prev.type_definitions.as_object() {
            for slug in merged {
                if !map.contains_key(slug) {
                    if let Some(def) = prev_map.get(slug) {
                        map.insert(slug.clone(), def.clone());
                    }
                }
            }
        }
    }

    serde_json::Value::Object(map)
}

#[derive(QueryableByName)]
struct LockRow {
    #[diesel(sql_type = Bool)]
    locked: bool,
}

/// Transaction-scoped advisory lock; released automatically at commit or
/// rollback.
pub(crate) fn try_advisory_lock(conn: &mut PgConnection) -> Result<bool, ConsentError> {
    let row: LockRow = diesel::sql_query("SELECT pg_try_advisory_xact_lock($1) AS locked")
        .bind::<BigInt, _>(RECONCILE_LOCK_KEY)
        .get_result(conn)?;
    Ok(row.locked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_util;

    fn set(slugs: &[&str]) -> BTreeSet<String> {
        slugs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_no_drift() {
        test_util::setup();
        let drift = compute_drift(
            &set(&["marketing", "analytics"]),
            &set(&["analytics", "marketing"]),
        );
        assert!(drift.is_empty());
    }

    #[test]
    fn test_missing_and_extra() {
        test_util::setup();
        let drift = compute_drift(
            &set(&["marketing", "analytics"]),
            &set(&["marketing", "profiling"]),
        );
        assert_eq!(drift.missing, set(&["analytics"]));
        assert_eq!(drift.extra, set(&["profiling"]));
    }

    #[test]
    fn test_empty_persisted_set_means_everything_missing() {
        test_util::setup();
        let drift = compute_drift(&set(&["marketing"]), &BTreeSet::new());
        assert_eq!(drift.missing, set(&["marketing"]));
        assert!(drift.extra.is_empty());
    }

    #[test]
    fn test_merge_keeps_referenced_extras() {
        test_util::setup();
        // Registry dropped "profiling" but open grants still reference it:
        // the merged set must keep it rather than guess at removal.
        let merged = merge_sets(&set(&["marketing", "analytics"]), &set(&["profiling"]));
        assert_eq!(merged, set(&["analytics", "marketing", "profiling"]));
    }

    #[test]
    fn test_merge_without_kept_is_registry() {
        test_util::setup();
        let registry = set(&["marketing", "analytics"]);
        assert_eq!(merge_sets(&registry, &BTreeSet::new()), registry);
    }

    #[test]
    fn test_report_changed() {
        test_util::setup();
        let mut report = ReconcileReport::default();
        assert!(!report.changed());
        report.records_repaired = 3;
        assert!(report.changed());
    }
}
