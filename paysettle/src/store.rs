use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Field name to value, as held in one invoice record.
pub type Fields = BTreeMap<String, String>;

/// Invoices promoted on payment, waiting for confirmation depth.
pub const AWAITING_CONFIRMATION: &str = "awaiting_confirmation";
/// Invoices that expired and still need refund evaluation.
pub const EXPIRED_INVOICES: &str = "expired_invoices";
/// Invoices in `new`. Removing an id from this set is the claim that decides
/// between promotion and expiry.
pub const OPEN_INVOICES: &str = "open_invoices";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {0} not found")]
    NotFound(String),
    #[error("field {field} of {id} is not an integer")]
    NotAnInteger { id: String, field: String },
    #[error("record {id} is corrupt: {reason}")]
    Corrupt { id: String, reason: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence facade for invoice records and the index sets.
///
/// Every call is atomic on its own. Nothing is atomic across calls: an
/// increment followed by a read may observe writes from other callers.
pub trait InvoiceStore: Send + Sync {
    /// Writes a whole record, replacing any previous one under `id`.
    fn create(&self, id: &str, fields: &Fields) -> Result<(), StoreError>;
    /// Returns the requested fields that are present. `NotFound` if the record is absent.
    fn get_fields(&self, id: &str, names: &[&str]) -> Result<Fields, StoreError>;
    /// Merges `fields` into an existing record.
    fn set_fields(&self, id: &str, fields: &Fields) -> Result<(), StoreError>;
    /// Atomically adds `delta` to an integer field (missing counts as zero) and returns the new value.
    fn increment_field(&self, id: &str, name: &str, delta: u64) -> Result<u64, StoreError>;
    /// Returns whether the id was newly added.
    fn add_to_set(&self, set: &str, id: &str) -> Result<bool, StoreError>;
    /// Returns whether the id was a member. Only one concurrent caller sees `true`.
    fn remove_from_set(&self, set: &str, id: &str) -> Result<bool, StoreError>;
    fn members_of(&self, set: &str) -> Result<BTreeSet<String>, StoreError>;
    /// Schedules deletion of the whole record `ttl` from now.
    fn expire_after(&self, id: &str, ttl: Duration) -> Result<(), StoreError>;
    fn delete(&self, id: &str) -> Result<(), StoreError>;
    /// Drops records whose TTL has elapsed and returns how many went away.
    fn purge_expired(&self) -> Result<usize, StoreError>;
}

pub type Store = Arc<dyn InvoiceStore>;

pub fn memory_store() -> Store {
    Arc::new(MemoryStore::default())
}

#[derive(Default)]
struct MemoryInner {
    records: HashMap<String, Fields>,
    sets: HashMap<String, BTreeSet<String>>,
    deadlines: HashMap<String, Instant>,
}

impl MemoryInner {
    /// Drops `id` if its deadline has passed and reports whether it is still live.
    fn live(&mut self, id: &str, now: Instant) -> bool {
        if self.deadlines.get(id).is_some_and(|deadline| *deadline <= now) {
            self.deadlines.remove(id);
            self.records.remove(id);
        }
        self.records.contains_key(id)
    }
}

/// Mutex-guarded in-process backend.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Unavailable("memory store poisoned".into()))
    }
}

impl InvoiceStore for MemoryStore {
    fn create(&self, id: &str, fields: &Fields) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.deadlines.remove(id);
        inner.records.insert(id.to_string(), fields.clone());
        Ok(())
    }

    fn get_fields(&self, id: &str, names: &[&str]) -> Result<Fields, StoreError> {
        let mut inner = self.lock()?;
        if !inner.live(id, Instant::now()) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let record = &inner.records[id];
        Ok(names.iter().filter_map(|name| record.get(*name).map(|v| (name.to_string(), v.clone()))).collect())
    }

    fn set_fields(&self, id: &str, fields: &Fields) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if !inner.live(id, Instant::now()) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let record = inner.records.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    fn increment_field(&self, id: &str, name: &str, delta: u64) -> Result<u64, StoreError> {
        let mut inner = self.lock()?;
        if !inner.live(id, Instant::now()) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let record = inner.records.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let next = add_to_field(id, name, record.get(name).map(String::as_str), delta)?;
        record.insert(name.to_string(), next.to_string());
        Ok(next)
    }

    fn add_to_set(&self, set: &str, id: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        Ok(inner.sets.entry(set.to_string()).or_default().insert(id.to_string()))
    }

    fn remove_from_set(&self, set: &str, id: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        Ok(inner.sets.get_mut(set).is_some_and(|members| members.remove(id)))
    }

    fn members_of(&self, set: &str) -> Result<BTreeSet<String>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.sets.get(set).cloned().unwrap_or_default())
    }

    fn expire_after(&self, id: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if inner.records.contains_key(id) {
            inner.deadlines.insert(id.to_string(), Instant::now() + ttl);
        }
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.records.remove(id);
        inner.deadlines.remove(id);
        Ok(())
    }

    fn purge_expired(&self) -> Result<usize, StoreError> {
        let mut inner = self.lock()?;
        let now = Instant::now();
        let due: Vec<String> =
            inner.deadlines.iter().filter(|(_, deadline)| **deadline <= now).map(|(id, _)| id.clone()).collect();
        for id in &due {
            inner.deadlines.remove(id);
            inner.records.remove(id);
        }
        Ok(due.len())
    }
}

/// Shared by the backends: parses the current value and adds `delta`.
pub(crate) fn add_to_field(id: &str, name: &str, current: Option<&str>, delta: u64) -> Result<u64, StoreError> {
    let not_int = || StoreError::NotAnInteger { id: id.to_string(), field: name.to_string() };
    let current = match current {
        Some(raw) => raw.parse::<u64>().map_err(|_| not_int())?,
        None => 0,
    };
    current.checked_add(delta).ok_or_else(not_int)
}
