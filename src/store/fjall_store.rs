use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use fjall::{
    Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode, TxKeyspace,
    TxPartitionHandle,
};
use tracing::debug;

use super::{BlobStore, Durability, ListPage, StoreError, StoreOp, StoredObject};

/// All objects live in a single partition; the key carries the namespace.
const OBJECTS_PARTITION: &str = "objects";

fn decode(op: StoreOp, key: &str, raw: &[u8]) -> Result<StoredObject, StoreError> {
    StoredObject::from_slice(raw).map_err(|e| StoreError::new(op, key, e))
}

fn encode(op: StoreOp, key: &str, data: &[u8]) -> Result<Vec<u8>, StoreError> {
    StoredObject::new(data)
        .to_vec()
        .map_err(|e| StoreError::new(op, key, e))
}

/// Collects one page from a fjall prefix scan.
fn collect_page<I, K, V>(prefix: &str, limit: usize, iter: I) -> Result<ListPage, StoreError>
where
    I: Iterator<Item = fjall::Result<(K, V)>>,
    K: AsRef<[u8]>,
    V: AsRef<[u8]>,
{
    let mut page = ListPage::default();
    for item in iter {
        let (key, value) = item.map_err(|e| StoreError::new(StoreOp::List, prefix, e))?;
        if page.objects.len() == limit {
            page.truncated = true;
            break;
        }
        let key = String::from_utf8_lossy(key.as_ref()).into_owned();
        let obj = decode(StoreOp::List, &key, value.as_ref())?;
        page.objects.push(obj.info(key));
    }
    Ok(page)
}

/// Blob store on a transactional fjall keyspace.
///
/// `put_if_absent` runs inside a write transaction. Write transactions are
/// serialized by the keyspace, so the check and the insert are atomic.
pub struct FjallStore {
    keyspace: TxKeyspace,
    objects: TxPartitionHandle,
    persist_mode: Option<PersistMode>,
}

impl FjallStore {
    pub fn new(path: PathBuf, durability: Option<Durability>) -> Result<Self, StoreError> {
        let path_str = path.display().to_string();
        let keyspace = Config::new(&path)
            .open_transactional()
            .map_err(|e| StoreError::new(StoreOp::Open, &path_str, e))?;
        let objects = keyspace
            .open_partition(OBJECTS_PARTITION, PartitionCreateOptions::default())
            .map_err(|e| StoreError::new(StoreOp::Open, &path_str, e))?;
        debug!(path = %path_str, "opened transactional fjall keyspace");

        Ok(Self {
            keyspace,
            objects,
            persist_mode: durability.map(PersistMode::from),
        })
    }

    fn persist(&self, op: StoreOp, key: &str) -> Result<(), StoreError> {
        if let Some(mode) = self.persist_mode {
            self.keyspace
                .persist(mode)
                .map_err(|e| StoreError::new(op, key, e))?;
        }
        Ok(())
    }
}

impl fmt::Debug for FjallStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FjallStore")
            .field("persist_mode", &self.persist_mode)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BlobStore for FjallStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        match self
            .objects
            .get(key)
            .map_err(|e| StoreError::new(StoreOp::Get, key, e))?
        {
            Some(raw) => Ok(Some(Bytes::from(decode(StoreOp::Get, key, &raw)?.data))),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        let raw = encode(StoreOp::Put, key, &data)?;
        self.objects
            .insert(key, raw)
            .map_err(|e| StoreError::new(StoreOp::Put, key, e))?;
        self.persist(StoreOp::Put, key)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.objects
            .remove(key)
            .map_err(|e| StoreError::new(StoreOp::Delete, key, e))?;
        self.persist(StoreOp::Delete, key)
    }

    async fn list(&self, prefix: &str, limit: usize) -> Result<ListPage, StoreError> {
        let snapshot = self.keyspace.read_tx();
        collect_page(prefix, limit, snapshot.prefix(&self.objects, prefix))
    }

    fn supports_conditional_put(&self) -> bool {
        true
    }

    async fn put_if_absent(&self, key: &str, data: Bytes) -> Result<Option<Bytes>, StoreError> {
        let raw = encode(StoreOp::PutIfAbsent, key, &data)?;

        let mut tx = self.keyspace.write_tx();
        let existing = tx
            .get(&self.objects, key)
            .map_err(|e| StoreError::new(StoreOp::PutIfAbsent, key, e))?;
        if let Some(existing) = existing {
            // Dropping the transaction rolls it back.
            let obj = decode(StoreOp::PutIfAbsent, key, &existing)?;
            return Ok(Some(Bytes::from(obj.data)));
        }
        tx.insert(&self.objects, key, raw);
        tx.commit()
            .map_err(|e| StoreError::new(StoreOp::PutIfAbsent, key, e))?;

        self.persist(StoreOp::PutIfAbsent, key)?;
        Ok(None)
    }
}

/// Blob store on a plain fjall keyspace.
///
/// There is no conditional put here: `put_if_absent` falls back to the racy
/// get-then-put of the trait.
pub struct FjallStoreNotx {
    keyspace: Keyspace,
    objects: PartitionHandle,
    persist_mode: Option<PersistMode>,
}

impl FjallStoreNotx {
    pub fn new(path: PathBuf, durability: Option<Durability>) -> Result<Self, StoreError> {
        let path_str = path.display().to_string();
        let keyspace = Config::new(&path)
            .open()
            .map_err(|e| StoreError::new(StoreOp::Open, &path_str, e))?;
        let objects = keyspace
            .open_partition(OBJECTS_PARTITION, PartitionCreateOptions::default())
            .map_err(|e| StoreError::new(StoreOp::Open, &path_str, e))?;
        debug!(path = %path_str, "opened fjall keyspace without transactions");

        Ok(Self {
            keyspace,
            objects,
            persist_mode: durability.map(PersistMode::from),
        })
    }

    fn persist(&self, op: StoreOp, key: &str) -> Result<(), StoreError> {
        if let Some(mode) = self.persist_mode {
            self.keyspace
                .persist(mode)
                .map_err(|e| StoreError::new(op, key, e))?;
        }
        Ok(())
    }
}

impl fmt::Debug for FjallStoreNotx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FjallStoreNotx")
            .field("persist_mode", &self.persist_mode)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BlobStore for FjallStoreNotx {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        match self
            .objects
            .get(key)
            .map_err(|e| StoreError::new(StoreOp::Get, key, e))?
        {
            Some(raw) => Ok(Some(Bytes::from(decode(StoreOp::Get, key, &raw)?.data))),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        let raw = encode(StoreOp::Put, key, &data)?;
        self.objects
            .insert(key, raw)
            .map_err(|e| StoreError::new(StoreOp::Put, key, e))?;
        self.persist(StoreOp::Put, key)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.objects
            .remove(key)
            .map_err(|e| StoreError::new(StoreOp::Delete, key, e))?;
        self.persist(StoreOp::Delete, key)
    }

    async fn list(&self, prefix: &str, limit: usize) -> Result<ListPage, StoreError> {
        collect_page(prefix, limit, self.objects.prefix(prefix))
    }
}
