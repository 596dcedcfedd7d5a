use crate::{
    error::Result,
    protocol::DecodedWorkout,
    store::Store,
    types::WorkoutRecord,
};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

/// A single upgrade rule for stored workout records
///
/// Rules must be idempotent: applying one to a record it already upgraded
/// returns `false` and leaves the record untouched.
pub trait Migration: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Upgrade `record` in place, returning whether anything changed
    fn apply(&self, record: &mut WorkoutRecord, decoded: &DecodedWorkout) -> bool;
}

/// Fill a missing receipt time from the monitor's log-entry timestamp
#[derive(Debug, Default)]
pub struct BackfillCreatedAt;

impl Migration for BackfillCreatedAt {
    fn name(&self) -> &'static str {
        "backfill_created_at"
    }

    fn apply(&self, record: &mut WorkoutRecord, decoded: &DecodedWorkout) -> bool {
        if record.created_at.is_some() {
            return false;
        }
        record.created_at = Some(decoded.log_entry.with_timezone(&Utc));
        true
    }
}

/// Attribute ownerless workouts to the default operator
#[derive(Debug)]
pub struct AssignDefaultOperator {
    default_uuid: String,
}

impl AssignDefaultOperator {
    /// Create the rule for the given operator
    #[must_use]
    pub fn new(default_uuid: impl Into<String>) -> Self {
        Self {
            default_uuid: default_uuid.into(),
        }
    }
}

impl Migration for AssignDefaultOperator {
    fn name(&self) -> &'static str {
        "assign_default_operator"
    }

    fn apply(&self, record: &mut WorkoutRecord, _decoded: &DecodedWorkout) -> bool {
        if !record.user_uuid.is_empty() {
            return false;
        }
        record.user_uuid.clone_from(&self.default_uuid);
        true
    }
}

/// Outcome of one migration run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Records inspected
    pub examined: usize,
    /// Records rewritten
    pub updated: usize,
    /// Records whose packet could not be decoded
    pub skipped: usize,
}

/// Applies an ordered list of rules to every stored workout
pub struct Migrator {
    store: Store,
    migrations: Vec<Box<dyn Migration>>,
}

impl Migrator {
    /// Migrator with the standard rule set, oldest rule first
    #[must_use]
    pub fn new(store: Store, default_operator: &str) -> Self {
        Self::with_migrations(
            store,
            vec![
                Box::new(BackfillCreatedAt),
                Box::new(AssignDefaultOperator::new(default_operator)),
            ],
        )
    }

    /// Migrator with a custom rule set
    #[must_use]
    pub fn with_migrations(store: Store, migrations: Vec<Box<dyn Migration>>) -> Self {
        Self { store, migrations }
    }

    /// Run every rule over every record, persisting records that changed
    ///
    /// Records whose packet cannot be decoded are left alone.
    ///
    /// # Errors
    ///
    /// Returns the first store error; records already rewritten stay rewritten.
    pub fn migrate(&self) -> Result<MigrationReport> {
        let mut report = MigrationReport::default();

        for mut record in self.store.get_all_workouts()? {
            report.examined += 1;

            let decoded = match record.decode() {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!(id = record.id, error = %e, "cannot decode workout, skipping");
                    report.skipped += 1;
                    continue;
                }
            };

            if self.migrate_record(&mut record, &decoded) {
                info!(id = record.id, "saving migrations");
                self.store.update_workout(&record)?;
                report.updated += 1;
            } else {
                debug!(id = record.id, "no migrations applied");
            }
        }

        info!(
            examined = report.examined,
            updated = report.updated,
            skipped = report.skipped,
            "migration complete"
        );
        Ok(report)
    }

    fn migrate_record(&self, record: &mut WorkoutRecord, decoded: &DecodedWorkout) -> bool {
        let mut changed = false;
        for migration in &self.migrations {
            if migration.apply(record, decoded) {
                debug!(id = record.id, migration = migration.name(), "applied migration");
                changed = true;
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PACKET: [u8; 20] = [
        89, 42, 38, 17, 162, 93, 0, 20, 30, 0, 28, 0, 0, 0, 0, 122, 0, 1, 20, 6,
    ];

    fn legacy_store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("ergbook.redb")).unwrap();

        let id = store.create_workout(&PACKET, "").unwrap();
        let mut record = store.get_workout(id).unwrap();
        record.created_at = None;
        store.update_workout(&record).unwrap();

        store.create_workout(&PACKET, "alice").unwrap();
        (dir, store)
    }

    #[test]
    fn test_migration_upgrades_legacy_records() {
        let (_dir, store) = legacy_store();
        let migrator = Migrator::new(store.clone(), "default");

        let report = migrator.migrate().unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.updated, 1);
        assert_eq!(report.skipped, 0);

        let upgraded = store.get_workout(1).unwrap();
        assert_eq!(upgraded.user_uuid, "default");
        let expected = DecodedWorkout::from_bytes(&PACKET)
            .unwrap()
            .log_entry
            .with_timezone(&Utc);
        assert_eq!(upgraded.created_at, Some(expected));

        assert_eq!(store.get_workout(2).unwrap().user_uuid, "alice");
    }

    #[test]
    fn test_migration_is_idempotent() {
        let (_dir, store) = legacy_store();
        let migrator = Migrator::new(store.clone(), "default");

        migrator.migrate().unwrap();
        let first = store.get_all_workouts().unwrap();

        let report = migrator.migrate().unwrap();
        assert_eq!(report.updated, 0);
        assert_eq!(store.get_all_workouts().unwrap(), first);
    }

    #[test]
    fn test_undecodable_record_skipped() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("ergbook.redb")).unwrap();
        store.create_workout(&[1, 2, 3], "").unwrap();

        let report = Migrator::new(store.clone(), "default").migrate().unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.updated, 0);
        assert!(store.get_workout(1).unwrap().user_uuid.is_empty());
    }

    #[test]
    fn test_rules_leave_complete_record_alone() {
        let decoded = DecodedWorkout::from_bytes(&PACKET).unwrap();
        let mut record = WorkoutRecord {
            id: 1,
            raw_data: PACKET.to_vec(),
            user_uuid: "bob".to_string(),
            created_at: Some(Utc::now()),
            sent_at: None,
        };
        let before = record.clone();

        assert!(!BackfillCreatedAt.apply(&mut record, &decoded));
        assert!(!AssignDefaultOperator::new("default").apply(&mut record, &decoded));
        assert_eq!(record, before);
    }
}
