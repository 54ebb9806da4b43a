//! Idempotent system bootstrap: schema, initial version, final health pass.
//! Safe to run repeatedly; a run against a healthy system changes nothing.

use std::sync::Arc;

use log::{error, info};
use serde_json::json;

use crate::audit::{self, Actor, AuditAction};
use crate::error::ConsentError;
use crate::health;
use crate::reconcile::{self, ReconcileReport};
use crate::registry::ConsentTypeRegistry;
use crate::shared::utils::{self, DbPool};

pub struct BootstrapManager {
    pool: DbPool,
    registry: Arc<dyn ConsentTypeRegistry>,
}

impl BootstrapManager {
    pub fn new(pool: DbPool, registry: Arc<dyn ConsentTypeRegistry>) -> Self {
        Self { pool, registry }
    }

    /// Bring the system to a known-good state:
    /// schema -> reconciliation (seeds the initial version) -> health check.
    pub fn run(&self) -> Result<ReconcileReport, ConsentError> {
        self.registry.ensure_usable()?;

        info!("bootstrap: applying database migrations");
        utils::run_migrations(&self.pool)
            .map_err(|e| ConsentError::Configuration(format!("migration failed: {e}")))?;

        info!("bootstrap: reconciling registry against the version store");
        let mut conn = self
            .pool
            .get()
            .map_err(|e| ConsentError::Pool(e.to_string()))?;
        let report = reconcile::run(&mut conn, self.registry.as_ref(), &Actor::System)?;

        if report.changed() {
            info!(
                "bootstrap: reconciliation created version {:?}, repaired {} records",
                report.version_label, report.records_repaired
            );
        } else {
            info!("bootstrap: store already matches the registry");
        }

        audit::append(
            &mut conn,
            &Actor::System,
            AuditAction::BootstrapCompleted,
            json!({
                "version_id": report.version_id,
                "types_added": &report.types_added,
                "records_repaired": report.records_repaired,
            }),
        )?;
        drop(conn);

        if !report.is_clean() {
            error!(
                "bootstrap: unrepairable drift, operator decision required for: {}",
                report.unrepairable.join(", ")
            );
            return Err(ConsentError::DriftUnrepairable {
                slugs: report.unrepairable,
            });
        }

        info!("bootstrap: running final health check");
        let health = health::run(&self.pool, self.registry.as_ref(), false);
        for check in &health.checks {
            info!(
                "bootstrap: check {} -> {}",
                check.name,
                if check.passed {
                    "ok"
                } else {
                    check.message.as_str()
                }
            );
        }
        if !health.all_passed() {
            return Err(ConsentError::Configuration(
                "bootstrap finished but the health check still reports failures".to_string(),
            ));
        }

        Ok(report)
    }
}
