use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::error::SandboxError;
use super::types::SandboxSnapshot;

/// Persistence for sandbox state that must outlive a single call
/// (guest details, container list).
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save(&self, snapshot: &SandboxSnapshot) -> Result<(), SandboxError>;
    async fn load(&self, id: &str) -> Result<Option<SandboxSnapshot>, SandboxError>;
    /// Returns whether anything was stored for `id`.
    async fn remove(&self, id: &str) -> Result<bool, SandboxError>;
    async fn list(&self) -> Result<Vec<SandboxSnapshot>, SandboxError>;
}

/// Process-local store. State is lost on exit.
#[derive(Default)]
pub struct MemoryStateStore {
    snapshots: RwLock<HashMap<String, SandboxSnapshot>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save(&self, snapshot: &SandboxSnapshot) -> Result<(), SandboxError> {
        self.snapshots
            .write()
            .await
            .insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<SandboxSnapshot>, SandboxError> {
        Ok(self.snapshots.read().await.get(id).cloned())
    }

    async fn remove(&self, id: &str) -> Result<bool, SandboxError> {
        Ok(self.snapshots.write().await.remove(id).is_some())
    }

    async fn list(&self) -> Result<Vec<SandboxSnapshot>, SandboxError> {
        Ok(self.snapshots.read().await.values().cloned().collect())
    }
}

/// One JSON file per sandbox under `<state_dir>/sandboxes/`.
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: state_dir.as_ref().join("sandboxes"),
        }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn save(&self, snapshot: &SandboxSnapshot) -> Result<(), SandboxError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&snapshot.id);
        let content = serde_json::to_string_pretty(snapshot)?;

        // Atomic write via temp file + rename
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, content).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<SandboxSnapshot>, SandboxError> {
        let path = self.path_for(id);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, id: &str) -> Result<bool, SandboxError> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<SandboxSnapshot>, SandboxError> {
        let mut snapshots = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(snapshots),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => match serde_json::from_str::<SandboxSnapshot>(&content) {
                    Ok(snapshot) => snapshots.push(snapshot),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "failed to parse sandbox state file");
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to read sandbox state file");
                }
            }
        }
        Ok(snapshots)
    }
}
