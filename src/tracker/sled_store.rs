//! Durable sled-backed record store.

use std::io;
use std::path::Path;

use sled::{Db, Tree};

use crate::error::StorageError;
use crate::job::{Job, Unit};
use crate::regeneration::RegenerationRecord;
use crate::tracker::event::JobEvent;
use crate::tracker::store::{check_version, RecordStore, Versioned};
use crate::types::{JobId, RegenerationId, UnitId};

const TREE_JOBS: &str = "jobs";
const TREE_UNITS: &str = "units";
const TREE_JOB_UNITS: &str = "job_units";
const TREE_REGENERATIONS: &str = "regenerations";
const TREE_JOB_REGENERATIONS: &str = "job_regenerations";
const TREE_EVENTS: &str = "events";
const EVENT_KEY_PAD: usize = 20;

#[derive(Clone)]
pub struct SledRecordStore {
    db: Db,
    jobs: Tree,
    units: Tree,
    job_units: Tree,
    regenerations: Tree,
    job_regenerations: Tree,
    events: Tree,
}

impl SledRecordStore {
    pub fn new(db: Db) -> Result<Self, StorageError> {
        let jobs = db.open_tree(TREE_JOBS).map_err(to_storage_io)?;
        let units = db.open_tree(TREE_UNITS).map_err(to_storage_io)?;
        let job_units = db.open_tree(TREE_JOB_UNITS).map_err(to_storage_io)?;
        let regenerations = db.open_tree(TREE_REGENERATIONS).map_err(to_storage_io)?;
        let job_regenerations = db
            .open_tree(TREE_JOB_REGENERATIONS)
            .map_err(to_storage_io)?;
        let events = db.open_tree(TREE_EVENTS).map_err(to_storage_io)?;
        Ok(Self {
            db,
            jobs,
            units,
            job_units,
            regenerations,
            job_regenerations,
            events,
        })
    }

    pub fn open(path: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(path)?;
        let db = sled::open(path).map_err(to_storage_io)?;
        Self::new(db)
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn encode_event_key(job_id: &JobId, seq: u64) -> String {
        encode_event_key(job_id, seq)
    }

    fn put_versioned<T: Versioned>(
        tree: &Tree,
        record: &T,
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        let key = record.record_key();
        let current = tree.get(key.as_bytes()).map_err(to_storage_io)?;
        let found = stored_version::<T>(current.as_deref())?;
        check_version(&key, expected_version, found)?;

        let mut stored = record.clone();
        stored.set_version(expected_version + 1);
        let encoded = serde_json::to_vec(&stored).map_err(to_storage_data)?;

        // compare_and_swap against the bytes read above; a concurrent writer makes this fail
        match tree
            .compare_and_swap(key.as_bytes(), current.as_deref(), Some(encoded))
            .map_err(to_storage_io)?
        {
            Ok(()) => Ok(expected_version + 1),
            Err(cas) => {
                let found = stored_version::<T>(cas.current.as_deref())?;
                Err(StorageError::VersionConflict {
                    key,
                    expected: expected_version,
                    found,
                })
            }
        }
    }

    fn get_record<T: Versioned>(tree: &Tree, key: &str) -> Result<Option<T>, StorageError> {
        let Some(raw) = tree.get(key.as_bytes()).map_err(to_storage_io)? else {
            return Ok(None);
        };
        let parsed = serde_json::from_slice(&raw).map_err(to_storage_data)?;
        Ok(Some(parsed))
    }

    fn list_indexed<T: Versioned>(index: &Tree, records: &Tree, job_id: &JobId) -> Result<Vec<T>, StorageError> {
        let prefix = format!("{job_id}:");
        let mut out = Vec::new();
        for result in index.scan_prefix(prefix.as_bytes()) {
            let (_, record_key) = result.map_err(to_storage_io)?;
            let key = String::from_utf8_lossy(&record_key).to_string();
            if let Some(record) = Self::get_record::<T>(records, &key)? {
                out.push(record);
            }
        }
        Ok(out)
    }
}

impl RecordStore for SledRecordStore {
    fn load_job(&self, id: &JobId) -> Result<Option<Job>, StorageError> {
        Self::get_record(&self.jobs, &id.to_string())
    }

    fn save_job(&self, job: &Job, expected_version: u64) -> Result<u64, StorageError> {
        Self::put_versioned(&self.jobs, job, expected_version)
    }

    fn list_jobs(&self) -> Result<Vec<Job>, StorageError> {
        let mut out = Vec::new();
        for result in self.jobs.iter() {
            let (_, value) = result.map_err(to_storage_io)?;
            let job: Job = serde_json::from_slice(&value).map_err(to_storage_data)?;
            out.push(job);
        }
        out.sort_by_key(|j| j.created_at);
        Ok(out)
    }

    fn load_unit(&self, id: &UnitId) -> Result<Option<Unit>, StorageError> {
        Self::get_record(&self.units, &id.to_string())
    }

    fn save_unit(&self, unit: &Unit, expected_version: u64) -> Result<u64, StorageError> {
        let version = Self::put_versioned(&self.units, unit, expected_version)?;
        if expected_version == 0 {
            let index_key = format!("{}:{}", unit.job_id, unit.id);
            self.job_units
                .insert(index_key.as_bytes(), unit.id.to_string().as_bytes())
                .map_err(to_storage_io)?;
        }
        Ok(version)
    }

    fn list_units(&self, job_id: &JobId) -> Result<Vec<Unit>, StorageError> {
        let mut units: Vec<Unit> = Self::list_indexed(&self.job_units, &self.units, job_id)?;
        units.sort_by_key(|u| u.created_at);
        Ok(units)
    }

    fn load_regeneration(&self, id: &RegenerationId) -> Result<Option<RegenerationRecord>, StorageError> {
        Self::get_record(&self.regenerations, &id.to_string())
    }

    fn save_regeneration(
        &self,
        record: &RegenerationRecord,
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        let version = Self::put_versioned(&self.regenerations, record, expected_version)?;
        if expected_version == 0 {
            let index_key = format!("{}:{}", record.job_id, record.id);
            self.job_regenerations
                .insert(index_key.as_bytes(), record.id.to_string().as_bytes())
                .map_err(to_storage_io)?;
        }
        Ok(version)
    }

    fn list_regenerations(&self, job_id: &JobId) -> Result<Vec<RegenerationRecord>, StorageError> {
        let mut records: Vec<RegenerationRecord> =
            Self::list_indexed(&self.job_regenerations, &self.regenerations, job_id)?;
        records.sort_by_key(|r| r.requested_at);
        Ok(records)
    }

    fn append_event(&self, event: &JobEvent) -> Result<(), StorageError> {
        let key = encode_event_key(&event.job_id, event.seq);
        let value = serde_json::to_vec(event).map_err(to_storage_data)?;
        self.events
            .insert(key.as_bytes(), value)
            .map_err(to_storage_io)?;
        Ok(())
    }

    fn read_events(&self, job_id: &JobId, after_seq: u64) -> Result<Vec<JobEvent>, StorageError> {
        let prefix = format!("{job_id}:");
        let mut out = Vec::new();
        for result in self.events.scan_prefix(prefix.as_bytes()) {
            let (_, value) = result.map_err(to_storage_io)?;
            let parsed: JobEvent = serde_json::from_slice(&value).map_err(to_storage_data)?;
            if parsed.seq > after_seq {
                out.push(parsed);
            }
        }
        out.sort_by_key(|e| e.seq);
        Ok(out)
    }

    fn last_event_seq(&self, job_id: &JobId) -> Result<u64, StorageError> {
        let prefix = format!("{job_id}:");
        let Some(last) = self.events.scan_prefix(prefix.as_bytes()).next_back() else {
            return Ok(0);
        };
        let (_, value) = last.map_err(to_storage_io)?;
        let parsed: JobEvent = serde_json::from_slice(&value).map_err(to_storage_data)?;
        Ok(parsed.seq)
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map_err(to_storage_io)?;
        Ok(())
    }
}

fn stored_version<T: Versioned>(raw: Option<&[u8]>) -> Result<u64, StorageError> {
    match raw {
        Some(raw) => {
            let record: T = serde_json::from_slice(raw).map_err(to_storage_data)?;
            Ok(record.version())
        }
        None => Ok(0),
    }
}

fn encode_event_key(job_id: &JobId, seq: u64) -> String {
    format!("{job_id}:{seq:0EVENT_KEY_PAD$}")
}

fn to_storage_io(err: sled::Error) -> StorageError {
    StorageError::IoError(io::Error::new(io::ErrorKind::Other, err.to_string()))
}

fn to_storage_data(err: serde_json::Error) -> StorageError {
    StorageError::Serialization(err.to_string())
}
