use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use super::error::SandboxError;
use super::instance::Sandbox;

/// How a [`SandboxLock`] holds its sandbox ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Lifecycle operations that mutate the sandbox.
    Exclusive,
    /// Read-only queries.
    Shared,
}

struct Entry {
    lock: Arc<RwLock<()>>,
    /// `None` while a creation holds the ID reserved.
    sandbox: Option<Arc<Sandbox>>,
}

/// Live sandboxes by ID, each with its own lifecycle lock.
///
/// Locks are per ID: operations on different sandboxes never wait on each
/// other. The map itself is only held for short synchronous lookups, never
/// across an await.
pub struct Registry {
    entries: Mutex<HashMap<String, Entry>>,
    lock_timeout: Option<Duration>,
}

#[derive(Debug)]
enum Guard {
    Exclusive(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
    Shared(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
}

/// Held lock on one sandbox ID. Released when dropped, on every exit path.
#[derive(Debug)]
pub struct SandboxLock {
    id: String,
    lock: Arc<RwLock<()>>,
    guard: Guard,
}

impl SandboxLock {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> LockMode {
        match self.guard {
            Guard::Exclusive(_) => LockMode::Exclusive,
            Guard::Shared(_) => LockMode::Shared,
        }
    }
}

impl Drop for SandboxLock {
    fn drop(&mut self) {
        tracing::trace!(sandbox_id = %self.id, mode = ?self.mode(), "sandbox lock released");
    }
}

/// An ID claimed by an in-flight creation.
///
/// Invisible to [`Registry::fetch`]. Dropping it without calling
/// [`Reservation::publish`] frees the ID again.
pub struct Reservation {
    registry: Arc<Registry>,
    id: String,
    lock: Arc<RwLock<()>>,
    _guard: OwnedRwLockWriteGuard<()>,
    published: bool,
}

impl Reservation {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Make the sandbox visible under the reserved ID.
    pub fn publish(mut self, sandbox: Arc<Sandbox>) {
        let mut entries = self.registry.entries();
        if let Some(entry) = entries.get_mut(&self.id) {
            if Arc::ptr_eq(&entry.lock, &self.lock) {
                entry.sandbox = Some(sandbox);
                self.published = true;
            }
        }
        drop(entries);
        tracing::debug!(sandbox_id = %self.id, "sandbox registered");
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        let mut entries = self.registry.entries();
        let ours = entries
            .get(&self.id)
            .is_some_and(|e| Arc::ptr_eq(&e.lock, &self.lock) && e.sandbox.is_none());
        if ours {
            entries.remove(&self.id);
            tracing::debug!(sandbox_id = %self.id, "sandbox reservation released");
        }
    }
}

impl Registry {
    pub fn new(lock_timeout: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            lock_timeout,
        })
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim a fresh ID for creation. Fails if the ID is live or reserved.
    pub fn reserve(self: &Arc<Self>, id: &str) -> Result<Reservation, SandboxError> {
        if id.is_empty() {
            return Err(SandboxError::NeedSandboxId);
        }
        let mut entries = self.entries();
        if entries.contains_key(id) {
            return Err(SandboxError::AlreadyExists(id.to_string()));
        }
        let lock = Arc::new(RwLock::new(()));
        let guard = lock
            .clone()
            .try_write_owned()
            .map_err(|_| SandboxError::AlreadyExists(id.to_string()))?;
        entries.insert(
            id.to_string(),
            Entry {
                lock: lock.clone(),
                sandbox: None,
            },
        );
        Ok(Reservation {
            registry: Arc::clone(self),
            id: id.to_string(),
            lock,
            _guard: guard,
            published: false,
        })
    }

    /// Acquire the lock for a known sandbox ID.
    ///
    /// Unknown IDs fail with `NotFound` without waiting. A reserved ID is
    /// known: the caller waits until the creation publishes or gives up.
    pub async fn lock(&self, id: &str, mode: LockMode) -> Result<SandboxLock, SandboxError> {
        if id.is_empty() {
            return Err(SandboxError::NeedSandboxId);
        }
        let lock = {
            let entries = self.entries();
            let entry = entries
                .get(id)
                .ok_or_else(|| SandboxError::NotFound(id.to_string()))?;
            Arc::clone(&entry.lock)
        };

        let acquire = async {
            match mode {
                LockMode::Exclusive => Guard::Exclusive(Arc::clone(&lock).write_owned().await),
                LockMode::Shared => Guard::Shared(Arc::clone(&lock).read_owned().await),
            }
        };
        let guard = match self.lock_timeout {
            Some(timeout) => tokio::time::timeout(timeout, acquire)
                .await
                .map_err(|_| SandboxError::LockTimeout(id.to_string()))?,
            None => acquire.await,
        };

        tracing::trace!(sandbox_id = %id, ?mode, "sandbox lock acquired");
        Ok(SandboxLock {
            id: id.to_string(),
            lock,
            guard,
        })
    }

    /// Look up the sandbox the held lock protects.
    ///
    /// Fails with `NotFound` if the sandbox was deleted (or its creation
    /// abandoned) while the caller waited, including when a newer sandbox
    /// has since taken the same ID under a different lock.
    pub fn fetch(&self, held: &SandboxLock) -> Result<Arc<Sandbox>, SandboxError> {
        let entries = self.entries();
        entries
            .get(&held.id)
            .filter(|e| Arc::ptr_eq(&e.lock, &held.lock))
            .and_then(|e| e.sandbox.clone())
            .ok_or_else(|| SandboxError::NotFound(held.id.clone()))
    }

    /// Remove the sandbox from the registry. Requires its exclusive lock.
    pub fn deregister(&self, held: &SandboxLock) -> Result<Arc<Sandbox>, SandboxError> {
        if held.mode() != LockMode::Exclusive {
            return Err(SandboxError::InvalidState(format!(
                "deregistering sandbox {} requires an exclusive lock",
                held.id
            )));
        }
        let mut entries = self.entries();
        let ours = entries
            .get(&held.id)
            .is_some_and(|e| Arc::ptr_eq(&e.lock, &held.lock) && e.sandbox.is_some());
        if !ours {
            return Err(SandboxError::NotFound(held.id.clone()));
        }
        let entry = entries
            .remove(&held.id)
            .and_then(|e| e.sandbox)
            .ok_or_else(|| SandboxError::NotFound(held.id.clone()))?;
        tracing::debug!(sandbox_id = %held.id, "sandbox deregistered");
        Ok(entry)
    }

    /// Whether a published sandbox exists under `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.entries().get(id).is_some_and(|e| e.sandbox.is_some())
    }

    /// Published sandboxes, in no particular order.
    pub fn sandboxes(&self) -> Vec<Arc<Sandbox>> {
        self.entries()
            .values()
            .filter_map(|e| e.sandbox.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries().values().filter(|e| e.sandbox.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
