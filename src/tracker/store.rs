//! Record store abstraction with optimistic versioning.
//!
//! Every save names the version it read. `expected_version == 0` creates the record; any other
//! value must match the stored version. A successful save stores `expected_version + 1`.

use crate::error::StorageError;
use crate::job::{Job, Unit};
use crate::regeneration::RegenerationRecord;
use crate::tracker::event::JobEvent;
use crate::types::{JobId, RegenerationId, UnitId};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;

/// A record carrying its own optimistic concurrency version.
pub trait Versioned: Serialize + DeserializeOwned + Clone + Send + Sync {
    fn record_key(&self) -> String;
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
}

impl Versioned for Job {
    fn record_key(&self) -> String {
        self.id.to_string()
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

impl Versioned for Unit {
    fn record_key(&self) -> String {
        self.id.to_string()
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

impl Versioned for RegenerationRecord {
    fn record_key(&self) -> String {
        self.id.to_string()
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// Persistence collaborator for job, unit and regeneration records plus the event log.
pub trait RecordStore: Send + Sync {
    fn load_job(&self, id: &JobId) -> Result<Option<Job>, StorageError>;
    /// Returns the stored version.
    fn save_job(&self, job: &Job, expected_version: u64) -> Result<u64, StorageError>;
    fn list_jobs(&self) -> Result<Vec<Job>, StorageError>;

    fn load_unit(&self, id: &UnitId) -> Result<Option<Unit>, StorageError>;
    fn save_unit(&self, unit: &Unit, expected_version: u64) -> Result<u64, StorageError>;
    fn list_units(&self, job_id: &JobId) -> Result<Vec<Unit>, StorageError>;

    fn load_regeneration(&self, id: &RegenerationId) -> Result<Option<RegenerationRecord>, StorageError>;
    fn save_regeneration(
        &self,
        record: &RegenerationRecord,
        expected_version: u64,
    ) -> Result<u64, StorageError>;
    fn list_regenerations(&self, job_id: &JobId) -> Result<Vec<RegenerationRecord>, StorageError>;

    fn append_event(&self, event: &JobEvent) -> Result<(), StorageError>;
    /// Events with `seq > after_seq`, in order.
    fn read_events(&self, job_id: &JobId, after_seq: u64) -> Result<Vec<JobEvent>, StorageError>;

    fn last_event_seq(&self, job_id: &JobId) -> Result<u64, StorageError> {
        Ok(self
            .read_events(job_id, 0)?
            .last()
            .map(|event| event.seq)
            .unwrap_or(0))
    }

    fn flush(&self) -> Result<(), StorageError>;
}

pub(crate) fn check_version(key: &str, expected: u64, found: u64) -> Result<(), StorageError> {
    if found == expected {
        return Ok(());
    }
    if expected == 0 {
        return Err(StorageError::AlreadyExists(key.to_string()));
    }
    Err(StorageError::VersionConflict {
        key: key.to_string(),
        expected,
        found,
    })
}

/// In-process store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryRecordStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    units: RwLock<HashMap<UnitId, Unit>>,
    regenerations: RwLock<HashMap<RegenerationId, RegenerationRecord>>,
    events: RwLock<HashMap<JobId, Vec<JobEvent>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn put_versioned<K, T>(
    map: &RwLock<HashMap<K, T>>,
    key: K,
    record: &T,
    expected_version: u64,
) -> Result<u64, StorageError>
where
    K: Hash + Eq + Display,
    T: Versioned,
{
    let mut map = map.write();
    let found = map.get(&key).map(|r| r.version()).unwrap_or(0);
    check_version(&key.to_string(), expected_version, found)?;
    let mut stored = record.clone();
    stored.set_version(expected_version + 1);
    map.insert(key, stored);
    Ok(expected_version + 1)
}

impl RecordStore for MemoryRecordStore {
    fn load_job(&self, id: &JobId) -> Result<Option<Job>, StorageError> {
        Ok(self.jobs.read().get(id).cloned())
    }

    fn save_job(&self, job: &Job, expected_version: u64) -> Result<u64, StorageError> {
        put_versioned(&self.jobs, job.id, job, expected_version)
    }

    fn list_jobs(&self) -> Result<Vec<Job>, StorageError> {
        let mut jobs: Vec<Job> = self.jobs.read().values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    fn load_unit(&self, id: &UnitId) -> Result<Option<Unit>, StorageError> {
        Ok(self.units.read().get(id).cloned())
    }

    fn save_unit(&self, unit: &Unit, expected_version: u64) -> Result<u64, StorageError> {
        put_versioned(&self.units, unit.id, unit, expected_version)
    }

    fn list_units(&self, job_id: &JobId) -> Result<Vec<Unit>, StorageError> {
        let mut units: Vec<Unit> = self
            .units
            .read()
            .values()
            .filter(|u| u.job_id == *job_id)
            .cloned()
            .collect();
        units.sort_by_key(|u| u.created_at);
        Ok(units)
    }

    fn load_regeneration(&self, id: &RegenerationId) -> Result<Option<RegenerationRecord>, StorageError> {
        Ok(self.regenerations.read().get(id).cloned())
    }

    fn save_regeneration(
        &self,
        record: &RegenerationRecord,
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        put_versioned(&self.regenerations, record.id, record, expected_version)
    }

    fn list_regenerations(&self, job_id: &JobId) -> Result<Vec<RegenerationRecord>, StorageError> {
        let mut records: Vec<RegenerationRecord> = self
            .regenerations
            .read()
            .values()
            .filter(|r| r.job_id == *job_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.requested_at);
        Ok(records)
    }

    fn append_event(&self, event: &JobEvent) -> Result<(), StorageError> {
        self.events
            .write()
            .entry(event.job_id)
            .or_default()
            .push(event.clone());
        Ok(())
    }

    fn read_events(&self, job_id: &JobId, after_seq: u64) -> Result<Vec<JobEvent>, StorageError> {
        let mut events: Vec<JobEvent> = self
            .events
            .read()
            .get(job_id)
            .map(|events| events.iter().filter(|e| e.seq > after_seq).cloned().collect())
            .unwrap_or_default();
        events.sort_by_key(|e| e.seq);
        Ok(events)
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
