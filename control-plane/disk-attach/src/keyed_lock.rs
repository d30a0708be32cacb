//! Keyed Lock Module
//!
//! Cloud disk attach and detach requests for the same disk must never run concurrently as the
//! provider's per instance disk list is read, modified and written back as a whole. Likewise
//! the local mount, bind mount and mount reference inspection for the same global mount path
//! must be atomic with respect to other pods using the same disk.
//! A `KeyedLock` hands out one mutex per key: holders of distinct keys never wait on each
//! other, holders of the same key are serialized.
//!
//! A `KeyedLock` only serializes the tasks of one process. The `HostLock` extends the same
//! guarantee to every process of the node through advisory file locks.
//!
//! Recursive locking of the same key from the same task deadlocks and must be avoided.
use once_cell::sync::OnceCell;
use std::{
    collections::HashMap,
    future::Future,
    path::{Path, PathBuf},
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

/// A registry of per key mutexes.
#[derive(Debug, Default)]
pub struct KeyedLock {
    inventory: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLock {
    /// Returns a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other holder has the given key and then takes it.
    /// The key is released when the returned guard is dropped.
    pub async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let entry = {
            let mut inventory = self.inventory.lock().expect("not poisoned");
            inventory
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        trace!(key, "Waiting for key");
        let guard = Waiter {
            registry: self,
            key,
            acquire: Some(Box::pin(entry.lock_owned())),
        }
        .await;
        trace!(key, "Key acquired");
        KeyGuard {
            registry: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    /// Releases the key held by the guard.
    pub fn unlock(guard: KeyGuard<'_>) {
        drop(guard);
    }

    /// Number of keys currently held or waited upon.
    pub fn len(&self) -> usize {
        self.inventory.lock().expect("not poisoned").len()
    }

    /// Whether no key is currently held or waited upon.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, key: &str) {
        let mut inventory = self.inventory.lock().expect("not poisoned");
        // only the registry itself references the mutex: nobody holds it or waits for it
        if let Some(entry) = inventory.get(key) {
            if Arc::strong_count(entry) == 1 {
                inventory.remove(key);
            }
        }
    }
}

/// A pending acquisition of a key. When dropped before completion the registry entry is
/// released, so that cancelled waiters don't leave their key behind.
struct Waiter<'a> {
    registry: &'a KeyedLock,
    key: &'a str,
    acquire: Option<Pin<Box<dyn Future<Output = OwnedMutexGuard<()>> + Send + 'a>>>,
}

impl Future for Waiter<'_> {
    type Output = OwnedMutexGuard<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(acquire) = self.acquire.as_mut() else {
            panic!("key acquisition polled after completion");
        };
        match acquire.as_mut().poll(cx) {
            Poll::Ready(guard) => {
                self.acquire = None;
                Poll::Ready(guard)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        // the pending acquisition holds a reference to the entry, drop it first
        if self.acquire.take().is_some() {
            self.registry.release(self.key);
            trace!(key = self.key, "Gave up waiting for key");
        }
    }
}

/// Exclusive hold of a key in a `KeyedLock`.
pub struct KeyGuard<'a> {
    registry: &'a KeyedLock,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyGuard<'_> {
    /// The held key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Debug for KeyGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyGuard").field("key", &self.key).finish()
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.registry.release(&self.key);
        trace!(key = %self.key, "Key released");
    }
}

/// Returns or inits the process wide registry which serializes attach and detach
/// operations of the same disk.
pub fn attach_detach_lock() -> &'static KeyedLock {
    static ATTACH_DETACH_LOCK: OnceCell<KeyedLock> = OnceCell::new();
    ATTACH_DETACH_LOCK.get_or_init(KeyedLock::new)
}

/// Advisory file locks, one lock file per key, shared by every process of the node.
#[derive(Debug, Clone)]
pub struct HostLock {
    dir: PathBuf,
}

impl HostLock {
    /// Returns a lock keeping its lock files under `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory holding the lock files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", key.replace('/', "~")))
    }

    /// Waits until no other process, or other `HostLock` of this process, holds the key and
    /// then takes it. The key is released when the returned guard is dropped.
    /// Lock files are left in place: removing one could split holders between two inodes.
    pub async fn lock(&self, key: &str) -> std::io::Result<HostGuard> {
        let path = self.path(key);
        let dir = self.dir.clone();
        trace!(key, path = %path.display(), "Waiting for host key");
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
            use std::os::fd::AsRawFd;

            std::fs::create_dir_all(&dir)?;
            let file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .open(&path)?;
            nix::fcntl::flock(file.as_raw_fd(), nix::fcntl::FlockArg::LockExclusive)
                .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;
            Ok(file)
        })
        .await
        .map_err(|error| std::io::Error::new(std::io::ErrorKind::Other, error))??;
        trace!(key, "Host key acquired");
        Ok(HostGuard {
            key: key.to_string(),
            _file: file,
        })
    }
}

/// Exclusive hold of a key in a `HostLock`, released by closing the lock file.
#[derive(Debug)]
pub struct HostGuard {
    key: String,
    _file: std::fs::File,
}

impl HostGuard {
    /// The held key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[cfg(test)]
mod tests {
    use super::{HostLock, KeyedLock};
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    #[tokio::test]
    async fn distinct_keys_do_not_block() {
        let lock = Arc::new(KeyedLock::new());
        let _disk1 = lock.lock("disk-1").await;

        let other = lock.clone();
        let acquired = tokio::time::timeout(Duration::from_secs(1), async move {
            let _disk2 = other.lock("disk-2").await;
        })
        .await;
        assert!(acquired.is_ok(), "a different key must not wait");
    }

    #[tokio::test]
    async fn same_key_is_serialized() {
        let lock = Arc::new(KeyedLock::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let tasks = (0 .. 8)
            .map(|_| {
                let lock = lock.clone();
                let inside = inside.clone();
                let overlaps = overlaps.clone();
                tokio::spawn(async move {
                    let _guard = lock.lock("disk").await;
                    if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert!(lock.is_empty(), "released keys are removed from the registry");
    }

    #[tokio::test]
    async fn waiter_gets_the_key_after_unlock() {
        let lock = Arc::new(KeyedLock::new());
        let guard = lock.lock("disk").await;

        let other = lock.clone();
        let waiter = tokio::spawn(async move {
            let guard = other.lock("disk").await;
            guard.key().to_string()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        KeyedLock::unlock(guard);
        assert_eq!(waiter.await.unwrap(), "disk");
        assert!(lock.is_empty());
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_no_entry() {
        let lock = Arc::new(KeyedLock::new());
        let guard = lock.lock("disk").await;

        let other = lock.clone();
        let waiter = tokio::spawn(async move {
            let _guard = other.lock("disk").await;
            std::future::pending::<()>().await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());
        assert_eq!(lock.len(), 1, "the holder still has the key");

        drop(guard);
        assert!(lock.is_empty());
    }

    #[tokio::test]
    async fn waiter_cancelled_after_release() {
        let lock = Arc::new(KeyedLock::new());
        let guard = lock.lock("disk").await;

        let other = lock.clone();
        let waiter = tokio::spawn(async move {
            let _guard = other.lock("disk").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        // woken up by the release but aborted before it could take the key
        KeyedLock::unlock(guard);
        waiter.abort();
        let _ = waiter.await;
        assert!(lock.is_empty());
    }

    #[tokio::test]
    async fn host_lock_spans_instances() {
        let dir = tempfile::tempdir().unwrap();
        let first = HostLock::new(dir.path().join("locks"));
        let second = HostLock::new(dir.path().join("locks"));

        let guard = first.lock("10.0.0.5:3260/iqn.2016-01.com.example:a/lun-0").await.unwrap();
        assert!(dir
            .path()
            .join("locks/10.0.0.5:3260~iqn.2016-01.com.example:a~lun-0.lock")
            .exists());

        let waiter = tokio::spawn(async move {
            let guard = second
                .lock("10.0.0.5:3260/iqn.2016-01.com.example:a/lun-0")
                .await
                .unwrap();
            guard.key().to_string()
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "the key is held through another open file");

        let _other_key = first.lock("disk-b").await.unwrap();
        drop(guard);
        assert_eq!(
            waiter.await.unwrap(),
            "10.0.0.5:3260/iqn.2016-01.com.example:a/lun-0"
        );
    }
}
