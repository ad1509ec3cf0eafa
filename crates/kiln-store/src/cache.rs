use crate::CacheError;
use kiln_schema::{CacheMetadata, Digest};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Content-addressed layer cache shared across builds.
///
/// Implementations stage writes and expose them to readers immediately, but
/// only [`commit`](CacheStore::commit) makes them the state the next build
/// starts from. Putting a digest that is already present is a no-op success.
/// Nothing here locks across processes: two runs committing the same cache
/// race and the last commit wins.
pub trait CacheStore: Send + Sync {
    /// Human-readable backend name for logs.
    fn name(&self) -> String;

    fn put_layer(&self, digest: &Digest, data: &[u8]) -> Result<(), CacheError>;

    /// Fetch layer content. A miss is [`CacheError::NotFound`].
    fn get_layer(&self, digest: &Digest) -> Result<Vec<u8>, CacheError>;

    fn has_layer(&self, digest: &Digest) -> Result<bool, CacheError>;

    /// Keep an already committed layer in the next committed state without
    /// re-sending its content.
    fn reuse_layer(&self, digest: &Digest) -> Result<(), CacheError>;

    fn set_metadata(&self, metadata: &CacheMetadata) -> Result<(), CacheError>;

    /// Metadata of the committed state. An empty cache yields empty metadata.
    fn retrieve_metadata(&self) -> Result<CacheMetadata, CacheError>;

    fn commit(&self) -> Result<(), CacheError>;
}

/// Serializes work on the same digest within one process. The table only
/// holds digests that are in use.
#[derive(Debug, Default)]
pub struct DigestLocks {
    locks: Mutex<HashMap<Digest, Arc<Mutex<()>>>>,
}

impl DigestLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `digest`. Distinct digests do not contend.
    pub fn with<T>(&self, digest: &Digest, f: impl FnOnce() -> T) -> T {
        let entry = {
            let mut table = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(table.entry(digest.clone()).or_default())
        };
        let value = {
            let _held = entry.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };
        let mut table = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // the table and this call hold the only references
        if Arc::strong_count(&entry) == 2 {
            table.remove(digest);
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn same_digest_is_serialized() {
        let locks = Arc::new(DigestLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let digest = Digest::of(b"layer");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                let digest = digest.clone();
                thread::spawn(move || {
                    locks.with(&digest, || {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(std::time::Duration::from_millis(2));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    });
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn table_is_empty_once_work_finishes() {
        let locks = Arc::new(DigestLocks::new());
        for i in 0..100u32 {
            locks.with(&Digest::of(&i.to_le_bytes()), || ());
        }
        assert!(locks.locks.lock().unwrap().is_empty());

        let digest = Digest::of(b"shared");
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let digest = digest.clone();
                thread::spawn(move || {
                    locks.with(&digest, || thread::sleep(std::time::Duration::from_millis(1)));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(locks.locks.lock().unwrap().is_empty());
    }

    #[test]
    fn returns_closure_value() {
        let locks = DigestLocks::new();
        let v = locks.with(&Digest::of(b"x"), || 42);
        assert_eq!(v, 42);
    }
}
