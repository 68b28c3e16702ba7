use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::Tree;

use crate::store::{add_to_field, Fields, InvoiceStore, StoreError};

pub const STORE_SCHEMA_VERSION: u32 = 1;
const META_TREE: &str = "__meta";
const RECORDS_TREE: &str = "records";
const TTL_TREE: &str = "ttl";
const SET_TREE_PREFIX: &str = "set:";
const SCHEMA_KEY: &[u8] = b"schema_version";

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// On-disk backend. Records are borsh encoded field maps in `records`,
/// TTL deadlines (unix millis) in `ttl`, and every index set is its own tree.
pub struct SledStore {
    db: sled::Db,
    records: Tree,
    ttl: Tree,
}

impl SledStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let db = sled::Config::new().path(path).open()?;
        ensure_schema(&db)?;
        let records = db.open_tree(RECORDS_TREE)?;
        let ttl = db.open_tree(TTL_TREE)?;
        Ok(Self { db, records, ttl })
    }

    pub fn schema_version(&self) -> Result<u32, StoreError> {
        let meta = self.db.open_tree(META_TREE)?;
        let Some(raw) = meta.get(SCHEMA_KEY)? else {
            return Err(invalid_marker());
        };
        let arr: [u8; 4] = raw.as_ref().try_into().map_err(|_| invalid_marker())?;
        Ok(u32::from_le_bytes(arr))
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn set_tree(&self, set: &str) -> Result<Tree, StoreError> {
        Ok(self.db.open_tree(format!("{SET_TREE_PREFIX}{set}"))?)
    }

    /// Removes `id` if its deadline has passed. Returns true if it was removed.
    fn purge_one(&self, id: &str, now: u64) -> Result<bool, StoreError> {
        (&self.records, &self.ttl)
            .transaction(|(records, ttl)| {
                let Some(raw) = ttl.get(id.as_bytes())? else {
                    return Ok(false);
                };
                let deadline = decode_deadline(id, &raw).map_err(ConflictableTransactionError::Abort)?;
                if deadline > now {
                    return Ok(false);
                }
                ttl.remove(id.as_bytes())?;
                records.remove(id.as_bytes())?;
                Ok(true)
            })
            .map_err(transaction_error)
    }

    fn is_live(&self, id: &str) -> Result<bool, StoreError> {
        if self.ttl.contains_key(id.as_bytes())? {
            self.purge_one(id, now_millis())?;
        }
        Ok(self.records.contains_key(id.as_bytes())?)
    }

    /// Read-modify-write of one record through sled's compare-and-swap loop.
    fn update_record<T>(
        &self,
        id: &str,
        mut apply: impl FnMut(&mut Fields) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        if !self.is_live(id)? {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let mut outcome: Option<Result<T, StoreError>> = None;
        self.records.update_and_fetch(id.as_bytes(), |old| {
            let Some(old) = old else {
                outcome = None;
                return None;
            };
            let mut fields = match decode_record(id, old) {
                Ok(fields) => fields,
                Err(err) => {
                    outcome = Some(Err(err));
                    return Some(old.to_vec());
                }
            };
            match apply(&mut fields).and_then(|value| encode_record(id, &fields).map(|bytes| (value, bytes))) {
                Ok((value, bytes)) => {
                    outcome = Some(Ok(value));
                    Some(bytes)
                }
                Err(err) => {
                    outcome = Some(Err(err));
                    Some(old.to_vec())
                }
            }
        })?;
        outcome.unwrap_or_else(|| Err(StoreError::NotFound(id.to_string())))
    }
}

impl InvoiceStore for SledStore {
    fn create(&self, id: &str, fields: &Fields) -> Result<(), StoreError> {
        let bytes = encode_record(id, fields)?;
        (&self.records, &self.ttl)
            .transaction(|(records, ttl)| {
                ttl.remove(id.as_bytes())?;
                records.insert(id.as_bytes(), bytes.clone())?;
                Ok::<_, ConflictableTransactionError<StoreError>>(())
            })
            .map_err(transaction_error)
    }

    fn get_fields(&self, id: &str, names: &[&str]) -> Result<Fields, StoreError> {
        if !self.is_live(id)? {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let Some(raw) = self.records.get(id.as_bytes())? else {
            return Err(StoreError::NotFound(id.to_string()));
        };
        let record = decode_record(id, &raw)?;
        Ok(names.iter().filter_map(|name| record.get(*name).map(|v| (name.to_string(), v.clone()))).collect())
    }

    fn set_fields(&self, id: &str, fields: &Fields) -> Result<(), StoreError> {
        self.update_record(id, |record| {
            record.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            Ok(())
        })
    }

    fn increment_field(&self, id: &str, name: &str, delta: u64) -> Result<u64, StoreError> {
        self.update_record(id, |record| {
            let next = add_to_field(id, name, record.get(name).map(String::as_str), delta)?;
            record.insert(name.to_string(), next.to_string());
            Ok(next)
        })
    }

    fn add_to_set(&self, set: &str, id: &str) -> Result<bool, StoreError> {
        Ok(self.set_tree(set)?.insert(id.as_bytes(), Vec::<u8>::new())?.is_none())
    }

    fn remove_from_set(&self, set: &str, id: &str) -> Result<bool, StoreError> {
        Ok(self.set_tree(set)?.remove(id.as_bytes())?.is_some())
    }

    fn members_of(&self, set: &str) -> Result<BTreeSet<String>, StoreError> {
        let mut members = BTreeSet::new();
        for entry in self.set_tree(set)?.iter() {
            let (key, _) = entry?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|_| StoreError::Corrupt { id: set.to_string(), reason: "non utf-8 member".into() })?;
            members.insert(id);
        }
        Ok(members)
    }

    fn expire_after(&self, id: &str, ttl: Duration) -> Result<(), StoreError> {
        if self.records.contains_key(id.as_bytes())? {
            let deadline = now_millis().saturating_add(ttl.as_millis() as u64);
            self.ttl.insert(id.as_bytes(), deadline.to_be_bytes().to_vec())?;
        }
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        (&self.records, &self.ttl)
            .transaction(|(records, ttl)| {
                ttl.remove(id.as_bytes())?;
                records.remove(id.as_bytes())?;
                Ok::<_, ConflictableTransactionError<StoreError>>(())
            })
            .map_err(transaction_error)
    }

    fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = now_millis();
        let mut due = Vec::new();
        for entry in self.ttl.iter() {
            let (key, raw) = entry?;
            let id = String::from_utf8_lossy(&key).into_owned();
            if decode_deadline(&id, &raw)? <= now {
                due.push(id);
            }
        }
        let mut purged = 0;
        for id in due {
            if self.purge_one(&id, now)? {
                purged += 1;
            }
        }
        Ok(purged)
    }
}

fn ensure_schema(db: &sled::Db) -> Result<(), StoreError> {
    let meta = db.open_tree(META_TREE)?;
    match meta.get(SCHEMA_KEY)? {
        Some(raw) => {
            let arr: [u8; 4] = raw.as_ref().try_into().map_err(|_| invalid_marker())?;
            let version = u32::from_le_bytes(arr);
            if version != STORE_SCHEMA_VERSION {
                return Err(StoreError::Corrupt {
                    id: META_TREE.to_string(),
                    reason: format!("unsupported store schema version {version}"),
                });
            }
        }
        None => {
            meta.insert(SCHEMA_KEY, STORE_SCHEMA_VERSION.to_le_bytes().to_vec())?;
            db.flush()?;
        }
    }
    Ok(())
}

fn invalid_marker() -> StoreError {
    StoreError::Corrupt { id: META_TREE.to_string(), reason: "invalid schema marker".into() }
}

fn encode_record(id: &str, fields: &Fields) -> Result<Vec<u8>, StoreError> {
    borsh::to_vec(fields).map_err(|e| StoreError::Corrupt { id: id.to_string(), reason: e.to_string() })
}

fn decode_record(id: &str, raw: &[u8]) -> Result<Fields, StoreError> {
    borsh::from_slice::<Fields>(raw).map_err(|e| StoreError::Corrupt { id: id.to_string(), reason: e.to_string() })
}

fn decode_deadline(id: &str, raw: &[u8]) -> Result<u64, StoreError> {
    let arr: [u8; 8] =
        raw.try_into().map_err(|_| StoreError::Corrupt { id: id.to_string(), reason: "bad ttl deadline".into() })?;
    Ok(u64::from_be_bytes(arr))
}

fn transaction_error(err: TransactionError<StoreError>) -> StoreError {
    match err {
        TransactionError::Abort(err) => err,
        TransactionError::Storage(err) => err.into(),
    }
}

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}
