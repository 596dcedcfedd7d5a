//! Durable workout and credential store
//!
//! A single [redb](https://docs.rs/redb) file holds three tables:
//!
//! - `workouts`: `u64` id → MessagePack-encoded [`WorkoutRecord`]
//! - `users`: operator uuid → MessagePack-encoded [`UserCredential`]
//! - `meta`: named sequence counters
//!
//! Records are encoded as maps keyed by field name, so a record written by an
//! older build decodes with any newer fields left at their zero value.

use crate::{
    error::{ErgbookError, Result},
    types::{StoreStats, UserCredential, WorkoutRecord},
};
use chrono::Utc;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{de::DeserializeOwned, Serialize};
use std::{path::Path, sync::Arc};
use tracing::{debug, info};

const WORKOUTS_TABLE: TableDefinition<'_, u64, &[u8]> = TableDefinition::new("workouts");
const USERS_TABLE: TableDefinition<'_, &str, &[u8]> = TableDefinition::new("users");
const META_TABLE: TableDefinition<'_, &str, u64> = TableDefinition::new("meta");

const WORKOUT_SEQUENCE: &str = "workout_seq";

/// Handle to the embedded database
///
/// Cloning is cheap and every clone shares the same file. Each operation runs
/// in its own transaction.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    /// Open the store, creating the file and its parent directories if needed
    ///
    /// # Errors
    ///
    /// Returns [`ErgbookError::Io`] if the directory cannot be created or
    /// [`ErgbookError::Store`] if the database cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        {
            txn.open_table(WORKOUTS_TABLE)?;
            txn.open_table(USERS_TABLE)?;
            txn.open_table(META_TABLE)?;
        }
        txn.commit()?;

        info!(path = %path.display(), "opened store");
        Ok(Self { db: Arc::new(db) })
    }

    /// Persist a newly received packet and return its id
    ///
    /// The id comes from a sequence that only grows, so ids are never reused.
    ///
    /// # Errors
    ///
    /// Returns [`ErgbookError::Store`] or [`ErgbookError::Encode`].
    pub fn create_workout(&self, raw_data: &[u8], user_uuid: &str) -> Result<u64> {
        let txn = self.db.begin_write()?;
        let id = {
            let mut meta = txn.open_table(META_TABLE)?;
            let id = meta.get(WORKOUT_SEQUENCE)?.map_or(0, |seq| seq.value()) + 1;
            meta.insert(WORKOUT_SEQUENCE, id)?;

            let record = WorkoutRecord {
                id,
                raw_data: raw_data.to_vec(),
                user_uuid: user_uuid.to_string(),
                created_at: Some(Utc::now()),
                sent_at: None,
            };
            let encoded = encode(&record)?;

            let mut workouts = txn.open_table(WORKOUTS_TABLE)?;
            workouts.insert(id, encoded.as_slice())?;
            id
        };
        txn.commit()?;

        debug!(id, user = %user_uuid, "stored workout");
        Ok(id)
    }

    /// Overwrite an existing workout record
    ///
    /// # Errors
    ///
    /// Returns [`ErgbookError::NotFound`] if `record.id` is zero or unknown.
    pub fn update_workout(&self, record: &WorkoutRecord) -> Result<()> {
        if record.id == 0 {
            return Err(workout_not_found(0));
        }

        let txn = self.db.begin_write()?;
        {
            let mut workouts = txn.open_table(WORKOUTS_TABLE)?;
            if workouts.get(record.id)?.is_none() {
                return Err(workout_not_found(record.id));
            }
            let encoded = encode(record)?;
            workouts.insert(record.id, encoded.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Record that a workout reached the Logbook
    ///
    /// The first delivery time is kept if the record was already sent.
    ///
    /// # Errors
    ///
    /// Returns [`ErgbookError::NotFound`] if no workout has this id.
    pub fn mark_sent(&self, id: u64) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut workouts = txn.open_table(WORKOUTS_TABLE)?;
            let mut record: WorkoutRecord = match workouts.get(id)? {
                Some(bytes) => decode(bytes.value())?,
                None => return Err(workout_not_found(id)),
            };
            if record.sent_at.is_none() {
                record.sent_at = Some(Utc::now());
                let encoded = encode(&record)?;
                workouts.insert(id, encoded.as_slice())?;
            }
        }
        txn.commit()?;

        debug!(id, "marked workout sent");
        Ok(())
    }

    /// Fetch one workout
    ///
    /// # Errors
    ///
    /// Returns [`ErgbookError::NotFound`] if no workout has this id.
    pub fn get_workout(&self, id: u64) -> Result<WorkoutRecord> {
        let txn = self.db.begin_read()?;
        let workouts = txn.open_table(WORKOUTS_TABLE)?;
        let bytes = workouts.get(id)?.ok_or_else(|| workout_not_found(id))?;
        decode(bytes.value())
    }

    /// Workouts not yet delivered, in id order
    ///
    /// # Errors
    ///
    /// Returns [`ErgbookError::Store`] or [`ErgbookError::Decode`].
    pub fn get_pending_workouts(&self) -> Result<Vec<WorkoutRecord>> {
        Ok(self
            .get_all_workouts()?
            .into_iter()
            .filter(WorkoutRecord::is_pending)
            .collect())
    }

    /// Every workout, in id order
    ///
    /// # Errors
    ///
    /// Returns [`ErgbookError::Store`] or [`ErgbookError::Decode`].
    pub fn get_all_workouts(&self) -> Result<Vec<WorkoutRecord>> {
        let txn = self.db.begin_read()?;
        let workouts = txn.open_table(WORKOUTS_TABLE)?;

        let mut records = Vec::new();
        for entry in workouts.iter()? {
            let (_, bytes) = entry?;
            records.push(decode(bytes.value())?);
        }
        Ok(records)
    }

    /// Number of stored workouts
    ///
    /// # Errors
    ///
    /// Returns [`ErgbookError::Store`].
    pub fn count(&self) -> Result<u64> {
        let txn = self.db.begin_read()?;
        let workouts = txn.open_table(WORKOUTS_TABLE)?;
        Ok(workouts.len()?)
    }

    /// Insert or replace an operator's credentials
    ///
    /// # Errors
    ///
    /// Returns [`ErgbookError::Validation`] if the uuid is empty.
    pub fn upsert_user(&self, user: &UserCredential) -> Result<()> {
        if user.uuid.is_empty() {
            return Err(ErgbookError::Validation("user is missing uuid".to_string()));
        }

        let txn = self.db.begin_write()?;
        {
            let mut users = txn.open_table(USERS_TABLE)?;
            let encoded = encode(user)?;
            users.insert(user.uuid.as_str(), encoded.as_slice())?;
        }
        txn.commit()?;

        debug!(user = %user.uuid, "upserted user");
        Ok(())
    }

    /// Fetch an operator's credentials
    ///
    /// # Errors
    ///
    /// Returns [`ErgbookError::NotFound`] if the uuid is unknown.
    pub fn get_user(&self, uuid: &str) -> Result<UserCredential> {
        let txn = self.db.begin_read()?;
        let users = txn.open_table(USERS_TABLE)?;
        let bytes = users.get(uuid)?.ok_or_else(|| ErgbookError::NotFound {
            kind: "user",
            key: uuid.to_string(),
        })?;
        decode(bytes.value())
    }

    /// Every registered operator
    ///
    /// # Errors
    ///
    /// Returns [`ErgbookError::Store`] or [`ErgbookError::Decode`].
    pub fn get_all_users(&self) -> Result<Vec<UserCredential>> {
        let txn = self.db.begin_read()?;
        let users = txn.open_table(USERS_TABLE)?;

        let mut result = Vec::new();
        for entry in users.iter()? {
            let (_, bytes) = entry?;
            result.push(decode(bytes.value())?);
        }
        Ok(result)
    }

    /// Record counts
    ///
    /// # Errors
    ///
    /// Returns [`ErgbookError::Store`] or [`ErgbookError::Decode`].
    pub fn stats(&self) -> Result<StoreStats> {
        let txn = self.db.begin_read()?;
        let workouts = txn.open_table(WORKOUTS_TABLE)?;

        let mut pending = 0;
        for entry in workouts.iter()? {
            let (_, bytes) = entry?;
            let record: WorkoutRecord = decode(bytes.value())?;
            if record.is_pending() {
                pending += 1;
            }
        }

        Ok(StoreStats {
            workouts: workouts.len()?,
            pending,
            users: txn.open_table(USERS_TABLE)?.len()?,
        })
    }
}

fn workout_not_found(id: u64) -> ErgbookError {
    ErgbookError::NotFound {
        kind: "workout",
        key: id.to_string(),
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("nested").join("ergbook.redb")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_ids_count_from_one() {
        let (_dir, store) = open_temp();

        let ids: Vec<u64> = (0..5u8)
            .map(|n| store.create_workout(&[n], "alice").unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(store.count().unwrap(), 5);
    }

    #[test]
    fn test_pending_after_marking_odd_ids() {
        let (_dir, store) = open_temp();
        for n in 0..5u8 {
            store.create_workout(&[n], "alice").unwrap();
        }
        for id in [1, 3, 5] {
            store.mark_sent(id).unwrap();
        }

        let pending: Vec<u64> = store
            .get_pending_workouts()
            .unwrap()
            .into_iter()
            .map(|w| w.id)
            .collect();
        assert_eq!(pending, vec![2, 4]);

        for id in [2, 4] {
            store.mark_sent(id).unwrap();
        }
        assert!(store.get_pending_workouts().unwrap().is_empty());
        assert_eq!(store.stats().unwrap().pending, 0);
        assert_eq!(store.count().unwrap(), 5);
    }

    #[test]
    fn test_ids_strictly_increase() {
        let (_dir, store) = open_temp();

        let first = store.create_workout(&[1, 2, 3], "alice").unwrap();
        let second = store.create_workout(&[4, 5, 6], "alice").unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(store.count().unwrap(), 2);

        let record = store.get_workout(first).unwrap();
        assert_eq!(record.raw_data, vec![1, 2, 3]);
        assert_eq!(record.user_uuid, "alice");
        assert!(record.created_at.is_some());
        assert!(record.is_pending());
    }

    #[test]
    fn test_ids_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ergbook.redb");

        {
            let store = Store::open(&path).unwrap();
            store.create_workout(&[1], "alice").unwrap();
        }

        let store = Store::open(&path).unwrap();
        assert_eq!(store.create_workout(&[2], "alice").unwrap(), 2);
    }

    #[test]
    fn test_pending_excludes_sent() {
        let (_dir, store) = open_temp();

        let a = store.create_workout(&[1], "alice").unwrap();
        let b = store.create_workout(&[2], "alice").unwrap();
        let c = store.create_workout(&[3], "alice").unwrap();
        store.mark_sent(b).unwrap();

        let pending: Vec<u64> = store
            .get_pending_workouts()
            .unwrap()
            .into_iter()
            .map(|w| w.id)
            .collect();
        assert_eq!(pending, vec![a, c]);

        let all: Vec<u64> = store
            .get_all_workouts()
            .unwrap()
            .into_iter()
            .map(|w| w.id)
            .collect();
        assert_eq!(all, vec![a, b, c]);
    }

    #[test]
    fn test_mark_sent_keeps_first_timestamp() {
        let (_dir, store) = open_temp();
        let id = store.create_workout(&[1], "alice").unwrap();

        store.mark_sent(id).unwrap();
        let first = store.get_workout(id).unwrap().sent_at;
        store.mark_sent(id).unwrap();
        assert_eq!(store.get_workout(id).unwrap().sent_at, first);
    }

    #[test]
    fn test_missing_workout() {
        let (_dir, store) = open_temp();

        assert!(matches!(
            store.mark_sent(99),
            Err(ErgbookError::NotFound { kind: "workout", .. })
        ));
        assert!(matches!(
            store.get_workout(99),
            Err(ErgbookError::NotFound { .. })
        ));

        let ghost = WorkoutRecord {
            id: 0,
            ..WorkoutRecord::default()
        };
        assert!(matches!(
            store.update_workout(&ghost),
            Err(ErgbookError::NotFound { .. })
        ));

        let absent = WorkoutRecord {
            id: 7,
            ..WorkoutRecord::default()
        };
        assert!(store.update_workout(&absent).is_err());
    }

    #[test]
    fn test_update_workout() {
        let (_dir, store) = open_temp();
        let id = store.create_workout(&[1], "").unwrap();

        let mut record = store.get_workout(id).unwrap();
        record.user_uuid = "bob".to_string();
        store.update_workout(&record).unwrap();

        assert_eq!(store.get_workout(id).unwrap().user_uuid, "bob");
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_user_upsert_replaces() {
        let (_dir, store) = open_temp();

        store
            .upsert_user(&UserCredential::new("alice", "a1", "r1"))
            .unwrap();
        store
            .upsert_user(&UserCredential::new("alice", "a2", "r2"))
            .unwrap();

        let user = store.get_user("alice").unwrap();
        assert_eq!(user.access_token, "a2");
        assert_eq!(user.refresh_token, "r2");
        assert_eq!(store.get_all_users().unwrap().len(), 1);
    }

    #[test]
    fn test_user_validation_and_lookup() {
        let (_dir, store) = open_temp();

        assert!(matches!(
            store.upsert_user(&UserCredential::new("", "a", "r")),
            Err(ErgbookError::Validation(_))
        ));
        assert!(matches!(
            store.get_user("nobody"),
            Err(ErgbookError::NotFound { kind: "user", .. })
        ));
    }

    #[test]
    fn test_stats() {
        let (_dir, store) = open_temp();
        store.create_workout(&[1], "alice").unwrap();
        let sent = store.create_workout(&[2], "alice").unwrap();
        store.mark_sent(sent).unwrap();
        store
            .upsert_user(&UserCredential::new("alice", "a", "r"))
            .unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.workouts, 2);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.users, 1);
    }

    #[test]
    fn test_stats_is_one_snapshot() {
        let (_dir, store) = open_temp();

        // each workout lands before its user, so a consistent view never has more users
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for n in 0..200u32 {
                    let uuid = format!("user-{n}");
                    store.create_workout(&[1], &uuid).unwrap();
                    store
                        .upsert_user(&UserCredential::new(uuid, "a", "r"))
                        .unwrap();
                }
            })
        };

        while !writer.is_finished() {
            let stats = store.stats().unwrap();
            assert!(stats.users <= stats.workouts, "{stats:?}");
            assert!(stats.workouts <= stats.users + 1, "{stats:?}");
        }
        writer.join().unwrap();

        let stats = store.stats().unwrap();
        assert_eq!((stats.workouts, stats.pending, stats.users), (200, 200, 200));
    }

    #[test]
    fn test_older_record_shape_decodes() {
        #[derive(Serialize, Deserialize)]
        struct LegacyWorkout {
            id: u64,
            raw_data: Vec<u8>,
        }

        let bytes = rmp_serde::to_vec_named(&LegacyWorkout {
            id: 3,
            raw_data: vec![9, 9],
        })
        .unwrap();

        let record: WorkoutRecord = decode(&bytes).unwrap();
        assert_eq!(record.id, 3);
        assert_eq!(record.raw_data, vec![9, 9]);
        assert!(record.user_uuid.is_empty());
        assert!(record.created_at.is_none());
        assert!(record.is_pending());
    }
}
