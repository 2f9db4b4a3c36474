use super::{prepare_swap, LockInfo, StateSnapshot, StateStore};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A state store backed by a JSON file on local disk.
///
/// Writes go to a temporary file that is renamed over the state file, so a
/// crash never leaves a half-written snapshot behind. The state lock is a
/// sibling `<state>.lock` file created exclusively.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    lock_path: PathBuf,
    // Serializes compare-and-swap within this process; other processes are
    // caught by the version check.
    write_guard: Mutex<()>,
    // Lineage handed out while the file does not exist yet.
    fresh: StateSnapshot,
}

impl FileStateStore {
    /// Create a store for the given state file path.
    ///
    /// The file is created on the first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.file_name().unwrap_or_default().to_os_string();
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        Self {
            path,
            lock_path,
            write_guard: Mutex::new(()),
            fresh: StateSnapshot::empty(),
        }
    }

    /// The state file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<StateSnapshot> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(self.fresh.clone()),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, snapshot: &StateSnapshot) -> Result<()> {
        let mut tmp_name = self.path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = self.path.with_file_name(tmp_name);

        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&bytes).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn read(&self) -> Result<StateSnapshot> {
        self.load().await
    }

    async fn compare_and_swap(&self, expected_version: u64, snapshot: StateSnapshot) -> Result<u64> {
        let _guard = self.write_guard.lock().await;
        let stored = self.load().await?;
        let next = prepare_swap(&stored, expected_version, snapshot)?;
        self.store(&next).await?;
        debug!(path = %self.path.display(), version = next.version, "State file written");
        Ok(next.version)
    }

    async fn lock(&self, holder: &str) -> Result<LockInfo> {
        let info = LockInfo::new(holder);
        let bytes = serde_json::to_vec(&info)?;

        // Written in full under a unique name, then linked into place, so a
        // failed write never leaves a lock file behind.
        let mut pending_name = self.lock_path.file_name().unwrap_or_default().to_os_string();
        pending_name.push(format!(".{}", info.id));
        let pending_path = self.lock_path.with_file_name(pending_name);
        let written = write_synced(&pending_path, &bytes).await;
        let linked = match written {
            Ok(()) => fs::hard_link(&pending_path, &self.lock_path).await,
            Err(e) => Err(e),
        };
        if let Err(err) = fs::remove_file(&pending_path).await {
            if err.kind() != ErrorKind::NotFound {
                warn!(path = %pending_path.display(), error = %err, "Failed to remove pending lock file");
            }
        }

        match linked {
            Ok(()) => {
                info!(holder, lock_id = %info.id, "State lock acquired");
                Ok(info)
            },
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let existing = fs::read(&self.lock_path).await?;
                match serde_json::from_slice::<LockInfo>(&existing) {
                    Ok(other) => Err(EngineError::StateLocked {
                        holder: other.holder,
                        lock_id: other.id,
                    }),
                    Err(err) => {
                        warn!(error = %err, "Unreadable state lock file");
                        Err(EngineError::StateLocked {
                            holder: "unknown".to_string(),
                            lock_id: String::new(),
                        })
                    },
                }
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn unlock(&self, lock: &LockInfo) -> Result<()> {
        let existing = match fs::read(&self.lock_path).await {
            Ok(bytes) => serde_json::from_slice::<LockInfo>(&bytes)?,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if existing.id != lock.id {
            return Err(EngineError::StateLocked {
                holder: existing.holder,
                lock_id: existing.id,
            });
        }
        fs::remove_file(&self.lock_path).await?;
        info!(lock_id = %lock.id, "State lock released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{InstanceAddress, ResourceInstance};
    use crate::value::{AttributeMap, Value};

    #[tokio::test]
    async fn test_missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("state.json"));
        let first = store.read().await.unwrap();
        let second = store.read().await.unwrap();
        assert_eq!(first.version, 0);
        assert!(first.is_empty());
        assert_eq!(first.lineage, second.lineage);
    }

    #[tokio::test]
    async fn test_write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = FileStateStore::new(&path);

        let mut snapshot = store.read().await.unwrap();
        let mut attrs = AttributeMap::new();
        attrs.insert("size".to_string(), Value::from(2));
        snapshot.put(ResourceInstance::new(
            InstanceAddress::new("disk", "data"),
            "disk-9",
            attrs,
        ));
        let version = store.compare_and_swap(0, snapshot).await.unwrap();
        assert_eq!(version, 1);

        // A second store on the same file sees the write
        let reopened = FileStateStore::new(&path);
        let read = reopened.read().await.unwrap();
        assert_eq!(read.version, 1);
        let instance = read.get(&InstanceAddress::new("disk", "data")).unwrap();
        assert_eq!(instance.id.as_deref(), Some("disk-9"));
    }

    #[tokio::test]
    async fn test_conflicting_writers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let a = FileStateStore::new(&path);
        let b = FileStateStore::new(&path);

        let snapshot = a.read().await.unwrap();
        a.compare_and_swap(0, snapshot).await.unwrap();

        let stale = b.read().await.unwrap();
        b.compare_and_swap(1, stale.clone()).await.unwrap();
        let err = a.compare_and_swap(1, stale).await.unwrap_err();
        assert!(matches!(err, EngineError::StateConflict { expected: 1, found: 2 }));
    }

    #[tokio::test]
    async fn test_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("state.json"));

        let lock = store.lock("apply").await.unwrap();
        assert!(dir.path().join("state.json.lock").exists());

        match store.lock("other").await {
            Err(EngineError::StateLocked { holder, .. }) => assert_eq!(holder, "apply"),
            other => panic!("expected lock conflict, got {:?}", other),
        }

        store.unlock(&lock).await.unwrap();
        assert!(!dir.path().join("state.json.lock").exists());
    }

    fn file_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_lock_leaves_only_the_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("state.json"));

        let lock = store.lock("apply").await.unwrap();
        assert!(store.lock("other").await.is_err());
        assert_eq!(file_names(dir.path()), vec!["state.json.lock".to_string()]);

        let written: LockInfo =
            serde_json::from_slice(&std::fs::read(dir.path().join("state.json.lock")).unwrap())
                .unwrap();
        assert_eq!(written, lock);

        store.unlock(&lock).await.unwrap();
        assert!(file_names(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_failed_lock_write_leaves_state_unlocked() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let store = FileStateStore::new(missing.join("state.json"));

        assert!(matches!(store.lock("apply").await, Err(EngineError::Io(_))));
        std::fs::create_dir(&missing).unwrap();
        let lock = store.lock("apply").await.unwrap();
        assert_eq!(file_names(&missing), vec!["state.json.lock".to_string()]);
        store.unlock(&lock).await.unwrap();
    }
}
