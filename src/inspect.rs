use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use crate::engine::{InfoItem, Listing};
use crate::lock::LockInfo;
use crate::state_id::{LOCKS_PREFIX, STATES_PREFIX};
use crate::store::{open_store, BlobStore, StorageEngine};

#[derive(Parser, Debug)]
pub struct InspectConfig {
    #[arg(long, default_value = ".")]
    pub meta_root: PathBuf,

    #[arg(
        long,
        default_value = "fjall",
        help = "Storage engine (fjall, fjall_notx)"
    )]
    pub storage_engine: StorageEngine,

    #[command(subcommand)]
    pub command: InspectCommand,
}

#[derive(Debug, Subcommand)]
pub enum InspectCommand {
    /// Number of stored states and locks
    NumKeys,
    /// Full listing as JSON, without the page limit of the server
    List,
    /// Current lock holders
    Locks,
}

fn open(config: &InspectConfig) -> Result<Arc<dyn BlobStore>> {
    if config.storage_engine == StorageEngine::Memory {
        bail!("the memory engine has nothing to inspect");
    }
    Ok(open_store(config.storage_engine, config.meta_root.clone(), None)?)
}

/// Lists both namespaces without a page limit.
pub async fn full_listing(store: &dyn BlobStore) -> Result<Listing> {
    let states = store.list(STATES_PREFIX, usize::MAX).await?;
    let locks = store.list(LOCKS_PREFIX, usize::MAX).await?;
    Ok(Listing {
        states: states.objects.into_iter().map(InfoItem::from).collect(),
        locks: locks.objects.into_iter().map(InfoItem::from).collect(),
    })
}

/// One line per lock: state key, owner and who took it.
pub async fn lock_holders(store: &dyn BlobStore) -> Result<Vec<String>> {
    let page = store.list(LOCKS_PREFIX, usize::MAX).await?;
    let mut lines = Vec::with_capacity(page.objects.len());
    for obj in page.objects {
        let line = match store.get(&obj.key).await? {
            Some(raw) => match LockInfo::from_slice(&raw) {
                Ok(lock) => format!(
                    "{}\tid={}\twho={}\toperation={}\tcreated={}",
                    obj.key,
                    lock.id,
                    lock.who.as_deref().unwrap_or("-"),
                    lock.operation.as_deref().unwrap_or("-"),
                    lock.created.as_deref().unwrap_or("-"),
                ),
                Err(e) => format!("{}\tunreadable lock record: {}", obj.key, e),
            },
            // released between list and get
            None => continue,
        };
        lines.push(line);
    }
    Ok(lines)
}

#[tokio::main]
pub async fn inspect(config: InspectConfig) -> Result<()> {
    let store = open(&config)?;

    match config.command {
        InspectCommand::NumKeys => {
            let listing = full_listing(store.as_ref()).await?;
            println!("States: {}", listing.states.len());
            println!("Locks: {}", listing.locks.len());
        }
        InspectCommand::List => {
            let listing = full_listing(store.as_ref()).await?;
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
        InspectCommand::Locks => {
            for line in lock_holders(store.as_ref()).await? {
                println!("{line}");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_full_listing_has_no_limit() {
        let store = MemoryStore::new();
        for i in 0..1200 {
            store
                .put(&format!("states/{i}.tfstate"), Bytes::from_static(b"x"))
                .await
                .unwrap();
        }
        let listing = full_listing(&store).await.unwrap();
        assert_eq!(listing.states.len(), 1200);
        assert!(listing.locks.is_empty());
    }

    #[tokio::test]
    async fn test_lock_holders() {
        let store = MemoryStore::new();
        let mut lock = LockInfo::new("abc");
        lock.who = Some("alice@ci".to_string());
        store
            .put("locks/net.tfstate", Bytes::from(lock.to_vec().unwrap()))
            .await
            .unwrap();
        store
            .put("locks/bad.tfstate", Bytes::from_static(b"?"))
            .await
            .unwrap();

        let lines = lock_holders(&store).await.unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("locks/bad.tfstate\tunreadable"));
        assert_eq!(
            lines[1],
            "locks/net.tfstate\tid=abc\twho=alice@ci\toperation=-\tcreated=-"
        );
    }
}
