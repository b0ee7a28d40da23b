use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::{BlobStore, ListPage, ObjectInfo, StoreError};

#[derive(Debug, Clone)]
struct MemoryObject {
    data: Bytes,
    uploaded: DateTime<Utc>,
}

/// Process-local blob store. Nothing survives a restart.
///
/// `put_if_absent` holds the write lock for the whole check-and-insert.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, MemoryObject>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys, across all prefixes.
    pub fn len(&self) -> usize {
        self.objects.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let objects = self.objects.read().unwrap();
        Ok(objects.get(key).map(|obj| obj.data.clone()))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        let mut objects = self.objects.write().unwrap();
        objects.insert(
            key.to_string(),
            MemoryObject {
                data,
                uploaded: Utc::now(),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut objects = self.objects.write().unwrap();
        objects.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str, limit: usize) -> Result<ListPage, StoreError> {
        let objects = self.objects.read().unwrap();
        let mut page = ListPage::default();

        let matching = objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix));
        for (key, obj) in matching {
            if page.objects.len() == limit {
                page.truncated = true;
                break;
            }
            page.objects.push(ObjectInfo {
                key: key.clone(),
                size: obj.data.len() as u64,
                uploaded: obj.uploaded,
            });
        }
        Ok(page)
    }

    fn supports_conditional_put(&self) -> bool {
        true
    }

    async fn put_if_absent(&self, key: &str, data: Bytes) -> Result<Option<Bytes>, StoreError> {
        let mut objects = self.objects.write().unwrap();
        if let Some(existing) = objects.get(key) {
            return Ok(Some(existing.data.clone()));
        }
        objects.insert(
            key.to_string(),
            MemoryObject {
                data,
                uploaded: Utc::now(),
            },
        );
        Ok(None)
    }
}
