//! The state and lock protocol.
//!
//! Every operation canonicalizes the state id, asks the authorization policy,
//! and only then talks to the blob store. The engine keeps nothing in memory
//! between calls; all coordination goes through the store.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::SecondsFormat;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::auth::{Action, AuthPolicy, Identity, RejectReason, ANY_RESOURCE};
use crate::lock::LockInfo;
use crate::metrics::{Operation, Outcome, SharedMetrics};
use crate::state_id::{StateId, LOCKS_PREFIX, STATES_PREFIX};
use crate::store::{BlobStore, ObjectInfo, StoreError};

/// Objects returned per namespace by `list`.
pub const DEFAULT_LIST_LIMIT: usize = 1000;

/// Listing entry for a state blob or a lock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InfoItem {
    pub id: String,
    pub size: u64,
    pub uploaded: String,
}

impl From<ObjectInfo> for InfoItem {
    fn from(obj: ObjectInfo) -> Self {
        Self {
            id: obj.key,
            size: obj.size,
            uploaded: obj.uploaded.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Listing {
    pub states: Vec<InfoItem>,
    pub locks: Vec<InfoItem>,
}

/// Successful lock release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Released {
    /// Released without an owner check because no lock record was presented.
    Forced,
    /// Released by its owner. Holds the record that was deleted.
    Owned(Bytes),
}

#[derive(Debug)]
pub enum EngineError {
    /// The authorization policy rejected the request.
    Unauthorized(RejectReason),
    /// The state is already locked. Holds the current lock record.
    Locked(Bytes),
    /// Unlock was requested but there is no lock.
    NotLocked,
    /// The lock is held by someone else. Holds the current lock record.
    LockMismatch(Bytes),
    /// The presented lock record is not valid JSON or has no `ID`.
    MalformedLock(serde_json::Error),
    Storage(StoreError),
}

impl EngineError {
    fn outcome(&self) -> Outcome {
        match self {
            EngineError::Unauthorized(_) => Outcome::Unauthorized,
            EngineError::Locked(_) | EngineError::NotLocked | EngineError::LockMismatch(_) => {
                Outcome::Conflict
            }
            EngineError::MalformedLock(_) => Outcome::Malformed,
            EngineError::Storage(_) => Outcome::StorageError,
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Unauthorized(_) => write!(f, "Unauthorized"),
            EngineError::Locked(_) => write!(f, "state is locked"),
            EngineError::NotLocked => write!(f, "attempting to unlock but resource not locked"),
            EngineError::LockMismatch(_) => write!(f, "lock is held by another owner"),
            EngineError::MalformedLock(e) => write!(f, "malformed lock record: {}", e),
            EngineError::Storage(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::MalformedLock(e) => Some(e),
            EngineError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Storage(e)
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// StateEngine implements the Terraform HTTP backend protocol on a blob store.
#[derive(Debug, Clone)]
pub struct StateEngine {
    store: Arc<dyn BlobStore>,
    auth: Arc<AuthPolicy>,
    metrics: SharedMetrics,
    list_limit: usize,
}

impl StateEngine {
    pub fn new(store: Arc<dyn BlobStore>, auth: Arc<AuthPolicy>, metrics: SharedMetrics) -> Self {
        if !store.supports_conditional_put() {
            warn!("blob store has no conditional put, concurrent lock acquisition can race");
        }
        Self {
            store,
            auth,
            metrics,
            list_limit: DEFAULT_LIST_LIMIT,
        }
    }

    /// Sets the number of objects `list` returns per namespace.
    /// A limit of 0 is raised to 1.
    pub fn with_list_limit(mut self, limit: usize) -> Self {
        self.list_limit = limit.max(1);
        self
    }

    pub fn auth(&self) -> &AuthPolicy {
        &self.auth
    }

    /// Lists every state blob and every lock record.
    ///
    /// Each namespace returns a single page of at most `list_limit` entries.
    /// There is no continuation, so large deployments get an incomplete view.
    pub async fn list(&self, identity: &Identity) -> EngineResult<Listing> {
        let result = self.try_list(identity).await;
        self.observe(Operation::List, &result);
        result
    }

    /// Reads a state blob. `None` when the state does not exist.
    pub async fn read_state(&self, identity: &Identity, id: &StateId) -> EngineResult<Option<Bytes>> {
        let result = self.try_read_state(identity, id).await;
        match &result {
            Ok(None) => {
                debug!(state = %id, "state not found");
                self.metrics.operation(Operation::ReadState, Outcome::NotFound);
            }
            Ok(Some(data)) => {
                self.metrics.bytes_sent(data.len());
                self.observe(Operation::ReadState, &result);
            }
            Err(_) => self.observe(Operation::ReadState, &result),
        }
        result
    }

    /// Overwrites a state blob.
    ///
    /// Lock possession is not checked: clients coordinate through LOCK and
    /// UNLOCK, and a write without a lock is accepted.
    pub async fn write_state(&self, identity: &Identity, id: &StateId, data: Bytes) -> EngineResult<()> {
        let result = self.try_write_state(identity, id, data).await;
        self.observe(Operation::WriteState, &result);
        result
    }

    /// Deletes a state blob. Deleting a missing state succeeds.
    pub async fn delete_state(&self, identity: &Identity, id: &StateId) -> EngineResult<()> {
        let result = self.try_delete_state(identity, id).await;
        self.observe(Operation::DeleteState, &result);
        result
    }

    /// Takes the lock on a state, storing `record` as the lock record.
    ///
    /// Returns `record` unchanged on success, or `Locked` with the current
    /// record when the state is already locked. The check and the write are
    /// only atomic if the store has a conditional put; otherwise two
    /// concurrent callers can both take the lock.
    pub async fn acquire_lock(&self, identity: &Identity, id: &StateId, record: Bytes) -> EngineResult<Bytes> {
        let result = self.try_acquire_lock(identity, id, record).await;
        self.observe(Operation::AcquireLock, &result);
        result
    }

    /// Releases the lock on a state.
    ///
    /// An empty `presented` body force-unlocks without any owner check, which
    /// is what `terraform force-unlock` sends. Otherwise the presented record's
    /// `ID` must match the stored one.
    pub async fn release_lock(&self, identity: &Identity, id: &StateId, presented: &[u8]) -> EngineResult<Released> {
        let result = self.try_release_lock(identity, id, presented).await;
        self.observe(Operation::ReleaseLock, &result);
        result
    }

    /// Runs only the write authorization of `op` on `id`.
    ///
    /// Lets a transport reject a request before it reads the body. A rejection
    /// is counted against `op`; the operation itself checks again when called.
    pub fn authorize_write(&self, identity: &Identity, op: Operation, id: &StateId) -> EngineResult<()> {
        let result = self.authorize(identity, Action::Write, id.as_str());
        if result.is_err() {
            self.observe(op, &result);
        }
        result
    }

    fn authorize(&self, identity: &Identity, action: Action, resource: &str) -> EngineResult<()> {
        self.auth
            .authorize(identity, action, resource)
            .map_err(EngineError::Unauthorized)
    }

    fn observe<T>(&self, op: Operation, result: &EngineResult<T>) {
        match result {
            Ok(_) => self.metrics.operation(op, Outcome::Ok),
            Err(e) => {
                if let EngineError::Storage(source) = e {
                    error!(operation = op.as_str(), error = %source, "storage failure");
                }
                self.metrics.operation(op, e.outcome());
            }
        }
    }

    async fn list_prefix(&self, prefix: &str) -> EngineResult<Vec<InfoItem>> {
        let page = self.store.list(prefix, self.list_limit).await?;
        if page.truncated {
            warn!(
                prefix,
                limit = self.list_limit,
                "listing truncated, only the first page is returned"
            );
        }
        Ok(page.objects.into_iter().map(InfoItem::from).collect())
    }

    async fn try_list(&self, identity: &Identity) -> EngineResult<Listing> {
        self.authorize(identity, Action::List, ANY_RESOURCE)?;
        let states = self.list_prefix(STATES_PREFIX).await?;
        let locks = self.list_prefix(LOCKS_PREFIX).await?;
        Ok(Listing { states, locks })
    }

    async fn try_read_state(&self, identity: &Identity, id: &StateId) -> EngineResult<Option<Bytes>> {
        self.authorize(identity, Action::Read, id.as_str())?;
        Ok(self.store.get(&id.state_key()).await?)
    }

    async fn try_write_state(&self, identity: &Identity, id: &StateId, data: Bytes) -> EngineResult<()> {
        self.authorize(identity, Action::Write, id.as_str())?;
        let len = data.len();
        self.store.put(&id.state_key(), data).await?;
        self.metrics.bytes_received(len);
        debug!(state = %id, size = len, "state written");
        Ok(())
    }

    async fn try_delete_state(&self, identity: &Identity, id: &StateId) -> EngineResult<()> {
        self.authorize(identity, Action::Delete, id.as_str())?;
        self.store.delete(&id.state_key()).await?;
        debug!(state = %id, "state deleted");
        Ok(())
    }

    async fn try_acquire_lock(&self, identity: &Identity, id: &StateId, record: Bytes) -> EngineResult<Bytes> {
        self.authorize(identity, Action::Write, id.as_str())?;
        match self.store.put_if_absent(&id.lock_key(), record.clone()).await? {
            Some(existing) => {
                info!(state = %id, "lock refused, state already locked");
                Err(EngineError::Locked(existing))
            }
            None => {
                debug!(state = %id, "lock acquired");
                Ok(record)
            }
        }
    }

    async fn try_release_lock(&self, identity: &Identity, id: &StateId, presented: &[u8]) -> EngineResult<Released> {
        self.authorize(identity, Action::Write, id.as_str())?;
        let lock_key = id.lock_key();

        if presented.is_empty() {
            self.store.delete(&lock_key).await?;
            info!(state = %id, "lock force-released");
            return Ok(Released::Forced);
        }

        let presented_id = LockInfo::owner_id(presented).map_err(EngineError::MalformedLock)?;

        let existing = match self.store.get(&lock_key).await? {
            Some(existing) => existing,
            None => {
                info!(state = %id, "unlock refused, state not locked");
                return Err(EngineError::NotLocked);
            }
        };

        // A stored record we cannot read proves no ownership.
        let owned = match LockInfo::owner_id(&existing) {
            Ok(existing_id) => existing_id == presented_id,
            Err(e) => {
                warn!(state = %id, error = %e, "stored lock record is not valid JSON");
                false
            }
        };
        if !owned {
            info!(state = %id, presented = %presented_id, "unlock refused, lock held by another owner");
            return Err(EngineError::LockMismatch(existing));
        }

        self.store.delete(&lock_key).await?;
        debug!(state = %id, owner = %presented_id, "lock released");
        Ok(Released::Owned(existing))
    }
}
