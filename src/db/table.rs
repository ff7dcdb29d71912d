//! Typed table views over a database.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use super::Database;
use crate::store::ListOpts;
use crate::types::Result;

/// A record type stored in one named table.
pub trait Record: Serialize + DeserializeOwned + Send + Sync {
    const TABLE: &'static str;

    /// Checked before every write.
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

pub struct Table<'a, R> {
    db: &'a Database,
    _record: PhantomData<fn() -> R>,
}

impl<'a, R: Record> Table<'a, R> {
    pub fn new(db: &'a Database) -> Self {
        Self {
            db,
            _record: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        R::TABLE
    }

    pub async fn get(&self, key: &str) -> Result<Option<R>> {
        match self.db.store().get(R::TABLE, key).await? {
            Some(entry) => entry.decode(),
            None => Ok(None),
        }
    }

    pub async fn put(&self, key: &str, record: &R) -> Result<u64> {
        record.validate()?;
        let value = serde_json::to_value(record)?;
        self.db.store().put(R::TABLE, key, value).await
    }

    pub async fn del(&self, key: &str) -> Result<u64> {
        self.db.store().del(R::TABLE, key).await
    }

    /// Decoded records in key order. Entries that fail to decode are skipped;
    /// they come from logs this node does not control.
    pub async fn list(&self, opts: &ListOpts) -> Result<Vec<(String, R)>> {
        let entries = self.db.store().list(R::TABLE, opts).await?;
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry.decode::<R>() {
                Ok(Some(record)) => records.push((entry.key, record)),
                Ok(None) => {}
                Err(e) => warn!(
                    db = %self.db.url(),
                    table = R::TABLE,
                    key = %entry.key,
                    error = %e,
                    "Skipping malformed record"
                ),
            }
        }
        Ok(records)
    }

    pub fn record_url(&self, key: &str) -> String {
        self.db.record_url(R::TABLE, key)
    }
}

/// Decode a raw value as a record, validating it.
pub fn decode_record<R: Record>(value: serde_json::Value) -> Result<R> {
    let record: R = serde_json::from_value(value)?;
    record.validate()?;
    Ok(record)
}
