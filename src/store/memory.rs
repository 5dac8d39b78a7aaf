//! Volatile in-process store, for `store.path = "memory"` deployments and tests.

use async_trait::async_trait;
use dashmap::DashMap;

use super::{EventStore, StoredRecord};
use crate::error::StoreError;

#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<(String, String), StoredRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn collect(&self, keep: impl Fn(&(String, String), &StoredRecord) -> bool) -> Vec<StoredRecord> {
        let mut rows: Vec<StoredRecord> = self
            .records
            .iter()
            .filter(|entry| keep(entry.key(), entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        rows
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn get_all(&self, namespace: &str) -> Result<Vec<StoredRecord>, StoreError> {
        Ok(self.collect(|(ns, _), _| ns == namespace))
    }

    async fn put(&self, namespace: &str, record: StoredRecord) -> Result<(), StoreError> {
        self.records
            .insert((namespace.to_string(), record.key.clone()), record);
        Ok(())
    }

    async fn list_by_watershed(
        &self,
        namespace: &str,
        huc8: &str,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        Ok(self.collect(|(ns, _), record| {
            ns == namespace && record.watershed.as_deref() == Some(huc8)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let store = MemoryStore::new();
        let record = StoredRecord {
            key: "k".into(),
            watershed: Some("02070010".into()),
            value: "{}".into(),
        };
        store.put("events", record.clone()).await.expect("put");
        store.put("health", record).await.expect("put");

        assert_eq!(store.len(), 2);
        assert_eq!(store.get_all("events").await.expect("get").len(), 1);
        assert_eq!(
            store
                .list_by_watershed("health", "02070010")
                .await
                .expect("list")
                .len(),
            1
        );
        assert!(store
            .list_by_watershed("events", "99999999")
            .await
            .expect("list")
            .is_empty());
    }
}
