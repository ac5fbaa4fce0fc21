use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{bail, Result};
use dashmap::DashMap;

use crate::record::KeyedRecord;

use super::StorageDao;

/// In-process storage keyed by record id.
///
/// Can be switched into a failing state to exercise the persistence retry
/// path.
#[derive(Default)]
pub struct MemoryDao {
    records: DashMap<String, KeyedRecord>,
    failing: AtomicBool,
    reads: AtomicUsize,
    upserts: AtomicUsize,
}

impl MemoryDao {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn get(&self, id: &str) -> Option<KeyedRecord> {
        self.records.get(id).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of `get_by_id` calls served.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of successful `upsert` batches.
    pub fn upserts(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("storage unavailable");
        }
        Ok(())
    }
}

impl StorageDao for MemoryDao {
    async fn get_by_id(&self, id: &str) -> Result<Option<KeyedRecord>> {
        self.check()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.get(id))
    }

    async fn upsert(&self, records: Vec<KeyedRecord>) -> Result<()> {
        self.check()?;
        for record in records {
            self.records.insert(record.id().to_string(), record);
        }
        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
