//! Health checks over the consent store. Checks are read-mostly, run
//! independently, and degrade independently: one failing check never stops
//! the others. With `fix = true`, a failing check that offers a remediation
//! gets one repair attempt and one re-evaluation.

use std::collections::BTreeSet;

use diesel::prelude::*;
use diesel::sql_types::{Nullable, Text};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::audit::{self, Actor, AuditAction, AuditFilter};
use crate::error::ConsentError;
use crate::reconcile;
use crate::registry::ConsentTypeRegistry;
use crate::shared::schema::user_consents;
use crate::shared::utils::{self, DbPool};
use crate::versions;

const REQUIRED_TABLES: [&str; 3] = ["consent_versions", "user_consents", "audit_log"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Remediation {
    ApplyMigrations,
    RunReconciliation,
    RepairOrphans,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub message: String,
    pub remediation: Option<Remediation>,
}

impl CheckResult {
    fn pass(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            message: message.into(),
            remediation: None,
        }
    }

    fn fail(name: &str, message: impl Into<String>, remediation: Option<Remediation>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            message: message.into(),
            remediation,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthReport {
    pub checks: Vec<CheckResult>,
    /// Names of checks that recovered after their remediation ran.
    pub fixed: Vec<String>,
}

impl HealthReport {
    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }
}

/// Run every check; with `fix`, apply offered remediations once each and
/// re-evaluate the check once.
pub fn run(pool: &DbPool, registry: &dyn ConsentTypeRegistry, fix: bool) -> HealthReport {
    let mut report = HealthReport::default();

    let checks: [(&str, fn(&DbPool, &dyn ConsentTypeRegistry) -> CheckResult); 4] = [
        ("schema", check_schema),
        ("drift", check_drift),
        ("audit_writability", check_audit_writability),
        ("orphaned_records", check_orphaned_records),
    ];

    for (name, check) in checks {
        let mut result = check(pool, registry);

        if !result.passed {
            if let (true, Some(remediation)) = (fix, result.remediation) {
                info!("health: {} failed, applying remediation {:?}", name, remediation);
                match apply_remediation(pool, registry, remediation) {
                    Ok(()) => {
                        result = check(pool, registry);
                        if result.passed {
                            report.fixed.push(name.to_string());
                        }
                    }
                    Err(e) => {
                        error!("health: remediation for {} failed: {}", name, e);
                        result.message = format!("{} (remediation failed: {})", result.message, e);
                    }
                }
            } else {
                warn!("health: {} failed: {}", name, result.message);
            }
        }

        report.checks.push(result);
    }

    report
}

fn apply_remediation(
    pool: &DbPool,
    registry: &dyn ConsentTypeRegistry,
    remediation: Remediation,
) -> Result<(), ConsentError> {
    match remediation {
        Remediation::ApplyMigrations => utils::run_migrations(pool)
            .map_err(|e| ConsentError::Configuration(format!("migration failed: {e}"))),
        Remediation::RunReconciliation => {
            let mut conn = pool.get().map_err(|e| ConsentError::Pool(e.to_string()))?;
            reconcile::run(&mut conn, registry, &Actor::System).map(|_| ())
        }
        Remediation::RepairOrphans => {
            let mut conn = pool.get().map_err(|e| ConsentError::Pool(e.to_string()))?;
            repair_orphans(&mut conn)
        }
    }
}

fn check_schema(pool: &DbPool, _registry: &dyn ConsentTypeRegistry) -> CheckResult {
    let name = "schema";
    let mut conn = match pool.get() {
        Ok(conn) => conn,
        Err(e) => return CheckResult::fail(name, format!("no database connection: {e}"), None),
    };

    let mut missing = Vec::new();
    for table in REQUIRED_TABLES {
        match table_exists(&mut conn, table) {
            Ok(true) => {}
            Ok(false) => missing.push(table),
            Err(e) => {
                return CheckResult::fail(name, format!("schema probe failed: {e}"), None);
            }
        }
    }

    if missing.is_empty() {
        CheckResult::pass(name, "all consent tables present")
    } else {
        CheckResult::fail(
            name,
            format!("missing tables: {}", missing.join(", ")),
            Some(Remediation::ApplyMigrations),
        )
    }
}

/// Compare the registry against the active version in one transaction so a
/// reconciliation committing between the two reads cannot produce a torn
/// comparison.
fn check_drift(pool: &DbPool, registry: &dyn ConsentTypeRegistry) -> CheckResult {
    let name = "drift";
    let mut conn = match pool.get() {
        Ok(conn) => conn,
        Err(e) => return CheckResult::fail(name, format!("no database connection: {e}"), None),
    };

    let outcome = conn.transaction::<_, ConsentError, _>(|conn| {
        let registry_slugs = registry.slugs();
        let active = versions::get_active_version(conn)?;
        let persisted: BTreeSet<String> = active
            .map(|v| v.type_slugs.into_iter().collect())
            .unwrap_or_default();
        let drift = reconcile::compute_drift(&registry_slugs, &persisted);
        let kept = reconcile::still_referenced(conn, &drift.extra)?;
        // A reconciliation holding the advisory lock means the drift we just
        // observed may already be mid-repair.
        let in_repair = !drift.is_empty() && !reconcile::try_advisory_lock(conn)?;
        Ok((drift, kept, in_repair))
    });

    match outcome {
        Ok((drift, _, _)) if drift.is_empty() => {
            CheckResult::pass(name, "active version matches the registry")
        }
        Ok((_, _, true)) => CheckResult::pass(
            name,
            "drift observed while a reconciliation is in progress; treating as transient",
        ),
        Ok((drift, kept, _)) if drift.missing.is_empty() && drift.extra == kept => {
            // Nothing reconciliation may repair on its own: removal of a
            // still-referenced type needs an operator decision.
            CheckResult::fail(
                name,
                format!(
                    "unrepairable drift, types dropped from the registry but still referenced: {}",
                    kept.into_iter().collect::<Vec<_>>().join(", ")
                ),
                None,
            )
        }
        Ok((drift, _, _)) => CheckResult::fail(
            name,
            format!(
                "drift detected: {} missing, {} extra",
                drift.missing.len(),
                drift.extra.len()
            ),
            Some(Remediation::RunReconciliation),
        ),
        Err(e) => CheckResult::fail(name, format!("drift probe failed: {e}"), None),
    }
}

/// Round-trip write: the probe entry is a permanent part of the audit trail,
/// never retracted.
fn check_audit_writability(pool: &DbPool, _registry: &dyn ConsentTypeRegistry) -> CheckResult {
    let name = "audit_writability";
    let mut conn = match pool.get() {
        Ok(conn) => conn,
        Err(e) => return CheckResult::fail(name, format!("no database connection: {e}"), None),
    };

    let written = match audit::append(
        &mut conn,
        &Actor::System,
        AuditAction::HealthCheck,
        json!({ "probe": "audit_writability" }),
    ) {
        Ok(entry) => entry,
        Err(e) => return CheckResult::fail(name, format!("audit append failed: {e}"), None),
    };

    let read_back = audit::query(
        &mut conn,
        &AuditFilter {
            action: Some(AuditAction::HealthCheck),
            from: Some(written.created_at),
            ..AuditFilter::default()
        },
    );

    match read_back {
        Ok(entries) if entries.iter().any(|e| e.sequence == written.sequence) => {
            CheckResult::pass(name, format!("audit round-trip ok (sequence {})", written.sequence))
        }
        Ok(_) => CheckResult::fail(name, "written audit entry not readable", None),
        Err(e) => CheckResult::fail(name, format!("audit read-back failed: {e}"), None),
    }
}

fn check_orphaned_records(pool: &DbPool, _registry: &dyn ConsentTypeRegistry) -> CheckResult {
    let name = "orphaned_records";
    let mut conn = match pool.get() {
        Ok(conn) => conn,
        Err(e) => return CheckResult::fail(name, format!("no database connection: {e}"), None),
    };

    match count_orphans(&mut conn) {
        Ok(0) => CheckResult::pass(name, "no orphaned version references"),
        Ok(n) => CheckResult::fail(
            name,
            format!("{n} open consent records not bound to the active version"),
            Some(Remediation::RepairOrphans),
        ),
        Err(e) => CheckResult::fail(name, format!("orphan probe failed: {e}"), None),
    }
}

/// Open rows not bound to the active version (NULL or stale binding).
fn count_orphans(conn: &mut PgConnection) -> Result<i64, ConsentError> {
    let Some(active) = versions::get_active_version(conn)? else {
        // No version at all: every open row with a NULL binding is orphaned.
        return user_consents::table
            .filter(user_consents::withdrawn_at.is_null())
            .filter(user_consents::version_id.is_null())
            .count()
            .get_result(conn)
            .map_err(ConsentError::from);
    };

    user_consents::table
        .filter(user_consents::withdrawn_at.is_null())
        .filter(
            user_consents::version_id
                .is_null()
                .or(user_consents::version_id.ne(active.id)),
        )
        .count()
        .get_result(conn)
        .map_err(ConsentError::from)
}

/// Bind open rows covered by the active set to the active version. Rows for
/// types outside the active set are left for reconciliation to classify.
fn repair_orphans(conn: &mut PgConnection) -> Result<(), ConsentError> {
    conn.transaction::<_, ConsentError, _>(|conn| {
        let Some(active) = versions::get_active_version(conn)? else {
            return Err(ConsentError::Configuration(
                "no active consent version to bind records to".to_string(),
            ));
        };

        let repaired = diesel::update(
            user_consents::table
                .filter(user_consents::type_slug.eq_any(active.type_slugs.clone()))
                .filter(user_consents::withdrawn_at.is_null())
                .filter(
                    user_consents::version_id
                        .is_null()
                        .or(user_consents::version_id.ne(active.id)),
                ),
        )
        .set((
            user_consents::version_id.eq(active.id),
            user_consents::updated_at.eq(chrono::Utc::now()),
        ))
        .execute(conn)?;

        info!("health: bound {} orphaned records to the active version", repaired);
        Ok(())
    })
}

#[derive(QueryableByName)]
struct RegClassRow {
    #[diesel(sql_type = Nullable<Text>)]
    oid: Option<String>,
}

fn table_exists(conn: &mut PgConnection, table: &str) -> Result<bool, ConsentError> {
    let row: RegClassRow = diesel::sql_query("SELECT to_regclass($1)::text AS oid")
        .bind::<Text, _>(format!("public.{table}"))
        .get_result(conn)?;
    Ok(row.oid.is_some())
}
