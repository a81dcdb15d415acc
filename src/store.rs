//! External content-addressed store interface

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::cid::ContentId;
use crate::error::StoreError;

/// Content-addressed store the checkpoint layer can pin capsules to
pub trait ContentStore: Send + Sync + std::fmt::Debug {
    /// Cheap connectivity probe
    fn is_available(&self) -> bool;

    /// Store bytes and return their content identifier
    fn add(&self, bytes: &[u8], pin: bool) -> Result<String, StoreError>;

    /// Fetch bytes by content identifier
    fn cat(&self, id: &str) -> Result<Vec<u8>, StoreError>;

    /// Keep content from being garbage collected
    fn pin(&self, id: &str) -> Result<(), StoreError>;
}

/// Bounded retry policy for pinning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    /// Wall-clock budget across all attempts
    pub deadline_ms: u64,
}

impl Default for PinPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 50,
            deadline_ms: 2_000,
        }
    }
}

/// Add and pin `bytes`, retrying infrastructure failures until the policy runs out
pub fn pin_with_retry(store: &dyn ContentStore, bytes: &[u8], policy: &PinPolicy) -> Result<String, StoreError> {
    let started = Instant::now();
    let deadline = Duration::from_millis(policy.deadline_ms);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let result = if store.is_available() {
            store.add(bytes, true)
        } else {
            Err(StoreError::Unavailable {
                reason: "store reported unavailable".to_string(),
            })
        };

        match result {
            Ok(id) => {
                debug!(content_id = %id, attempt, "Pinned content");
                return Ok(id);
            }
            Err(e) if !e.is_infrastructure() => return Err(e),
            Err(e) => {
                let elapsed = started.elapsed();
                if attempt >= policy.max_attempts.max(1) {
                    return Err(e);
                }
                if elapsed >= deadline {
                    return Err(StoreError::Timeout {
                        after_ms: elapsed.as_millis() as u64,
                    });
                }
                warn!(attempt, error = %e, "Pin attempt failed, retrying");
                let backoff = Duration::from_millis(policy.backoff_ms.saturating_mul(u64::from(attempt)));
                std::thread::sleep(backoff.min(deadline.saturating_sub(elapsed)));
            }
        }
    }
}

/// In-process store under the same content-identifier contract
#[derive(Debug)]
pub struct MemoryContentStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
    pinned: Mutex<BTreeSet<String>>,
    available: AtomicBool,
}

impl MemoryContentStore {
    /// Create a new, available, empty store
    pub fn new() -> Self {
        Self {
            blobs: Mutex::new(BTreeMap::new()),
            pinned: Mutex::new(BTreeSet::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate losing or regaining connectivity
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_pinned(&self, id: &str) -> bool {
        self.pinned.lock().map(|p| p.contains(id)).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite stored bytes in place, bypassing the identifier check
    pub fn corrupt(&self, id: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let mut blobs = self.blobs.lock().map_err(poisoned)?;
        match blobs.get_mut(id) {
            Some(slot) => {
                *slot = bytes;
                Ok(())
            }
            None => Err(StoreError::NotFound { id: id.to_string() }),
        }
    }

    /// Drop content and its pin, as a garbage collection would
    pub fn evict(&self, id: &str) -> Result<bool, StoreError> {
        let removed = self.blobs.lock().map_err(poisoned)?.remove(id).is_some();
        self.pinned.lock().map_err(poisoned)?.remove(id);
        Ok(removed)
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable {
                reason: "memory store switched off".to_string(),
            })
        }
    }
}

impl Default for MemoryContentStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Unavailable {
        reason: "store lock poisoned".to_string(),
    }
}

impl ContentStore for MemoryContentStore {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn add(&self, bytes: &[u8], pin: bool) -> Result<String, StoreError> {
        self.ensure_available()?;
        let id = ContentId::for_bytes(bytes).encode();
        self.blobs
            .lock()
            .map_err(poisoned)?
            .entry(id.clone())
            .or_insert_with(|| bytes.to_vec());
        if pin {
            self.pinned.lock().map_err(poisoned)?.insert(id.clone());
        }
        Ok(id)
    }

    fn cat(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        self.ensure_available()?;
        self.blobs
            .lock()
            .map_err(poisoned)?
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    fn pin(&self, id: &str) -> Result<(), StoreError> {
        self.ensure_available()?;
        if !self.blobs.lock().map_err(poisoned)?.contains_key(id) {
            return Err(StoreError::NotFound { id: id.to_string() });
        }
        self.pinned.lock().map_err(poisoned)?.insert(id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cid;

    fn fast() -> PinPolicy {
        PinPolicy {
            max_attempts: 2,
            backoff_ms: 1,
            deadline_ms: 100,
        }
    }

    #[test]
    fn test_add_returns_content_identifier() {
        let store = MemoryContentStore::new();
        let id = store.add(b"{\"a\":1}", true).unwrap();

        assert!(cid::verify_bytes(&id, b"{\"a\":1}"));
        assert!(store.is_pinned(&id));
        assert_eq!(store.cat(&id).unwrap(), b"{\"a\":1}");
    }

    #[test]
    fn test_unavailable_store_is_classified() {
        let store = MemoryContentStore::new();
        store.set_available(false);

        let err = pin_with_retry(&store, b"x", &fast()).unwrap_err();
        assert!(err.is_infrastructure());
        assert!(store.is_empty());
    }

    #[test]
    fn test_missing_content() {
        let store = MemoryContentStore::new();
        assert!(matches!(store.cat("bmissing"), Err(StoreError::NotFound { .. })));
        assert!(matches!(store.pin("bmissing"), Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn test_evicted_content_is_gone() {
        let store = MemoryContentStore::new();
        let id = store.add(b"payload", true).unwrap();

        assert!(store.evict(&id).unwrap());
        assert!(!store.evict(&id).unwrap());
        assert!(!store.is_pinned(&id));
        assert!(matches!(store.cat(&id), Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn test_retry_succeeds_when_available() {
        let store = MemoryContentStore::new();
        let id = pin_with_retry(&store, b"payload", &fast()).unwrap();
        assert!(store.is_pinned(&id));
    }
}
