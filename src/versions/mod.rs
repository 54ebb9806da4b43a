//! Consent version store. Exactly one version is active at any time; a
//! registry change produces a successor row and flips the predecessor
//! inactive in the same transaction. Superseded rows are immutable.

use std::collections::BTreeSet;

use chrono::Utc;
use diesel::prelude::*;
use log::info;
use uuid::Uuid;

use crate::error::ConsentError;
use crate::shared::models::DbConsentVersion;
use crate::shared::schema::consent_versions;

pub fn get_active_version(
    conn: &mut PgConnection,
) -> Result<Option<DbConsentVersion>, ConsentError> {
    consent_versions::table
        .filter(consent_versions::is_active.eq(true))
        .first::<DbConsentVersion>(conn)
        .optional()
        .map_err(ConsentError::from)
}

/// All versions, oldest first. Effective dates are the total order.
pub fn list_versions(conn: &mut PgConnection) -> Result<Vec<DbConsentVersion>, ConsentError> {
    consent_versions::table
        .order(consent_versions::effective_date.asc())
        .load::<DbConsentVersion>(conn)
        .map_err(ConsentError::from)
}

/// Create the successor version covering `slugs` and make it the single
/// active one. `definitions` is the frozen slug -> definition snapshot that
/// travels with the version.
pub fn create_version(
    conn: &mut PgConnection,
    slugs: &BTreeSet<String>,
    definitions: serde_json::Value,
) -> Result<DbConsentVersion, ConsentError> {
    validate_type_set(slugs)?;

    conn.transaction::<_, ConsentError, _>(|conn| {
        let label = next_label(conn)?;

        diesel::update(consent_versions::table.filter(consent_versions::is_active.eq(true)))
            .set(consent_versions::is_active.eq(false))
            .execute(conn)?;

        let now = Utc::now();
        let version = DbConsentVersion {
            id: Uuid::new_v4(),
            version_label: label,
            type_slugs: slugs.iter().cloned().collect(),
            type_definitions: definitions,
            is_active: true,
            effective_date: now,
            created_at: now,
        };

        diesel::insert_into(consent_versions::table)
            .values(&version)
            .execute(conn)?;

        info!(
            "created consent version {} covering {} types",
            version.version_label,
            version.type_slugs.len()
        );

        Ok(version)
    })
}

/// Labels count up from "1.0"; versions are never deleted, so the count is
/// a monotonic generation number.
fn next_label(conn: &mut PgConnection) -> Result<String, ConsentError> {
    let existing: i64 = consent_versions::table.count().get_result(conn)?;
    Ok(format_label(existing + 1))
}

fn format_label(generation: i64) -> String {
    format!("{}.0", generation)
}

fn validate_type_set(slugs: &BTreeSet<String>) -> Result<(), ConsentError> {
    if slugs.is_empty() {
        return Err(ConsentError::EmptyTypeSet);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_util;

    #[test]
    fn test_label_succession() {
        test_util::setup();
        assert_eq!(format_label(1), "1.0");
        assert_eq!(format_label(2), "2.0");
        assert_eq!(format_label(17), "17.0");
    }

    #[test]
    fn test_empty_type_set_is_rejected() {
        test_util::setup();
        let err = validate_type_set(&BTreeSet::new()).unwrap_err();
        assert!(matches!(err, ConsentError::EmptyTypeSet));

        let one: BTreeSet<String> = ["marketing".to_string()].into_iter().collect();
        assert!(validate_type_set(&one).is_ok());
    }
}
