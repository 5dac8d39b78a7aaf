//! Durable keyed storage the engine warms from and appends to.
//!
//! The engine needs only get-all-by-namespace, put-by-key and a
//! per-watershed listing. No transactional guarantees are assumed: every
//! put is independent and last-writer-wins.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Namespace holding accepted change events.
pub const EVENTS_NAMESPACE: &str = "sentinel-events";

/// Namespace holding per-source ingestion health.
pub const HEALTH_NAMESPACE: &str = "sentinel-health";

/// One keyed record. `value` is a JSON document.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub key: String,
    pub watershed: Option<String>,
    pub value: String,
}

impl StoredRecord {
    /// Encode `value` as JSON under `key`.
    pub fn encode<T: Serialize>(
        key: &str,
        watershed: Option<&str>,
        value: &T,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            key: key.to_string(),
            watershed: watershed.map(|w| w.to_string()),
            value: serde_json::to_string(value)?,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(serde_json::from_str(&self.value)?)
    }
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Every record in `namespace`, ordered by key.
    async fn get_all(&self, namespace: &str) -> Result<Vec<StoredRecord>, StoreError>;

    /// Insert or overwrite the record at `(namespace, record.key)`.
    async fn put(&self, namespace: &str, record: StoredRecord) -> Result<(), StoreError>;

    /// Records in `namespace` tagged with `huc8`, ordered by key.
    async fn list_by_watershed(
        &self,
        namespace: &str,
        huc8: &str,
    ) -> Result<Vec<StoredRecord>, StoreError>;
}
