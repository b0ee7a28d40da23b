use std::fmt::{self, Debug};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

mod fjall_store;
mod memory;

pub use fjall_store::{FjallStore, FjallStoreNotx};
pub use memory::MemoryStore;

/// Boxed error from a storage binding.
pub type BackendError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Metadata about a stored object, as returned by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub uploaded: DateTime<Utc>,
}

/// A single page of a prefix listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectInfo>,
    /// Set when more objects matched the prefix than fit in the page.
    pub truncated: bool,
}

/// BlobStore is the flat key space that holds state blobs and lock records.
///
/// Implementations give read-your-writes per key and nothing across keys.
/// Values are returned exactly as they were put.
#[async_trait]
pub trait BlobStore: Send + Sync + Debug + 'static {
    /// Gets the value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Stores `data` under `key`, replacing any previous value.
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError>;

    /// Removes `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Lists at most `limit` objects whose key starts with `prefix`, in key order.
    async fn list(&self, prefix: &str, limit: usize) -> Result<ListPage, StoreError>;

    /// Whether `put_if_absent` is atomic for this binding.
    fn supports_conditional_put(&self) -> bool {
        false
    }

    /// Stores `data` under `key` only if the key is absent.
    ///
    /// Returns the existing value when the key is taken, `None` when the write
    /// happened. The default implementation is a plain get followed by a put:
    /// two concurrent callers can both observe the key as absent and both
    /// write. Bindings with a real conditional put override this and report it
    /// through `supports_conditional_put`.
    async fn put_if_absent(&self, key: &str, data: Bytes) -> Result<Option<Bytes>, StoreError> {
        if let Some(existing) = self.get(key).await? {
            return Ok(Some(existing));
        }
        self.put(key, data).await?;
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Open,
    Get,
    Put,
    PutIfAbsent,
    Delete,
    List,
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreOp::Open => "open",
            StoreOp::Get => "get",
            StoreOp::Put => "put",
            StoreOp::PutIfAbsent => "put_if_absent",
            StoreOp::Delete => "delete",
            StoreOp::List => "list",
        };
        f.write_str(name)
    }
}

/// A failed storage call, with the operation and key it was made for.
#[derive(Debug)]
pub struct StoreError {
    op: StoreOp,
    key: String,
    source: BackendError,
}

impl StoreError {
    pub fn new(op: StoreOp, key: impl Into<String>, source: impl Into<BackendError>) -> Self {
        Self {
            op,
            key: key.into(),
            source: source.into(),
        }
    }

    pub fn op(&self) -> StoreOp {
        self.op
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "storage {} failed for '{}': {}", self.op, self.key, self.source)
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Value layout used by the persistent bindings: the blob plus its upload time.
#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub(crate) struct StoredObject {
    pub uploaded_ms: i64,
    pub data: Vec<u8>,
}

impl StoredObject {
    pub fn new(data: &[u8]) -> Self {
        Self {
            uploaded_ms: Utc::now().timestamp_millis(),
            data: data.to_vec(),
        }
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, bincode::config::standard())
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        let (obj, _len) = bincode::decode_from_slice(raw, bincode::config::standard())?;
        Ok(obj)
    }

    pub fn uploaded(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.uploaded_ms).unwrap_or_default()
    }

    pub fn info(&self, key: String) -> ObjectInfo {
        ObjectInfo {
            key,
            size: self.data.len() as u64,
            uploaded: self.uploaded(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageEngine {
    Fjall,
    FjallNotx,
    Memory,
}

impl FromStr for StorageEngine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fjall" => Ok(StorageEngine::Fjall),
            "fjall_notx" => Ok(StorageEngine::FjallNotx),
            "memory" => Ok(StorageEngine::Memory),
            _ => Err(format!("Unknown storage engine: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    Buffer,
    Fsync,
    Fdatasync,
}

impl FromStr for Durability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "buffer" => Ok(Durability::Buffer),
            "fsync" => Ok(Durability::Fsync),
            "fdatasync" => Ok(Durability::Fdatasync),
            _ => Err(format!("Unknown durability option: {}", s)),
        }
    }
}

impl From<Durability> for fjall::PersistMode {
    fn from(durability: Durability) -> Self {
        match durability {
            Durability::Buffer => fjall::PersistMode::Buffer,
            Durability::Fsync => fjall::PersistMode::SyncAll,
            Durability::Fdatasync => fjall::PersistMode::SyncData,
        }
    }
}

/// Opens the blob store for the selected engine.
///
/// `path` is the keyspace directory for the fjall engines and is ignored for
/// the memory engine.
pub fn open_store(
    engine: StorageEngine,
    path: PathBuf,
    durability: Option<Durability>,
) -> Result<Arc<dyn BlobStore>, StoreError> {
    let store: Arc<dyn BlobStore> = match engine {
        StorageEngine::Fjall => Arc::new(FjallStore::new(path, durability)?),
        StorageEngine::FjallNotx => Arc::new(FjallStoreNotx::new(path, durability)?),
        StorageEngine::Memory => Arc::new(MemoryStore::new()),
    };
    Ok(store)
}
