//! In-memory store
//!
//! Holds the latest value per key, like the real store. Clones share the same
//! map, so a test can keep one handle while the orchestrator owns another.
//! Failures can be injected to exercise the retry path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{KeyValueStore, StoreError};

#[derive(Default)]
struct Inner {
    entries: Mutex<HashMap<String, String>>,
    pending_failures: AtomicU32,
    pending_write_failures: AtomicU32,
    pending_read_rejections: AtomicU32,
    unreachable: AtomicBool,
    writes: AtomicU64,
}

/// Shared in-memory key-value store
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a raw value directly (bypasses failure injection)
    pub fn insert(&self, key: &str, value: impl Into<String>) {
        self.entries().insert(key.to_string(), value.into());
    }

    /// Read a raw value directly (bypasses failure injection)
    pub fn value(&self, key: &str) -> Option<String> {
        self.entries().get(key).cloned()
    }

    /// Make the next `count` get/set calls fail
    pub fn fail_next(&self, count: u32) {
        self.inner.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` set calls fail, leaving gets alone
    pub fn fail_next_writes(&self, count: u32) {
        self.inner.pending_write_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` get calls fail the way a read of a non-string
    /// or non-UTF-8 value does: the store answers, the command is refused
    pub fn reject_next_reads(&self, count: u32) {
        self.inner.pending_read_rejections.store(count, Ordering::SeqCst);
    }

    /// Make `ping` report the store as down
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of successful `set` calls
    pub fn write_count(&self) -> u64 {
        self.inner.writes.load(Ordering::SeqCst)
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.inner.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn injected_failure(&self) -> Result<(), StoreError> {
        take_failure(&self.inner.pending_failures)
    }
}

fn take_failure(counter: &AtomicU32) -> Result<(), StoreError> {
    match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
        Ok(_) => Err(StoreError::Connection("injected failure".to_string())),
        Err(_) => Ok(()),
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.injected_failure()?;
        if take_failure(&self.inner.pending_read_rejections).is_err() {
            return Err(StoreError::Command("WRONGTYPE value is not a string".to_string()));
        }
        Ok(self.value(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.injected_failure()?;
        take_failure(&self.inner.pending_write_failures)?;
        self.insert(key, value);
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self) -> Result<bool, StoreError> {
        Ok(!self.inner.unreachable.load(Ordering::SeqCst))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
