use super::{prepare_swap, LockInfo, StateSnapshot, StateStore};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

/// A state store that keeps the snapshot in memory.
///
/// Useful for tests and for embedding the engine where durability is handled
/// elsewhere.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    snapshot: Mutex<StateSnapshot>,
    lock: Mutex<Option<LockInfo>>,
}

impl MemoryStateStore {
    /// Create a store holding an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with a snapshot.
    pub fn with_snapshot(snapshot: StateSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
            lock: Mutex::new(None),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn read(&self) -> Result<StateSnapshot> {
        Ok(self.snapshot.lock().await.clone())
    }

    async fn compare_and_swap(&self, expected_version: u64, snapshot: StateSnapshot) -> Result<u64> {
        let mut stored = self.snapshot.lock().await;
        let next = prepare_swap(&stored, expected_version, snapshot)?;
        let version = next.version;
        *stored = next;
        debug!(version, "State snapshot written");
        Ok(version)
    }

    async fn lock(&self, holder: &str) -> Result<LockInfo> {
        let mut current = self.lock.lock().await;
        if let Some(existing) = current.as_ref() {
            return Err(EngineError::StateLocked {
                holder: existing.holder.clone(),
                lock_id: existing.id.clone(),
            });
        }
        let info = LockInfo::new(holder);
        *current = Some(info.clone());
        Ok(info)
    }

    async fn unlock(&self, lock: &LockInfo) -> Result<()> {
        let mut current = self.lock.lock().await;
        match current.as_ref() {
            Some(existing) if existing.id == lock.id => {
                *current = None;
                Ok(())
            },
            Some(existing) => Err(EngineError::StateLocked {
                holder: existing.holder.clone(),
                lock_id: existing.id.clone(),
            }),
            None => Ok(()),
        }
    }
}
