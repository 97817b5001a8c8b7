//! In-memory object store with fault injection.
//!
//! Used by tests to model an eventually consistent, occasionally failing
//! object store: injected transient failures, objects that stay unlisted
//! for a number of list calls after being written, and hard failures on
//! writes under a chosen prefix.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{ObjectStore, PutMode};
use crate::error::{Result, VexError};

#[derive(Debug)]
struct Object {
    bytes: Arc<Vec<u8>>,
    /// Remaining list calls that will not see this object.
    hidden_lists: u32,
}

#[derive(Debug, Default)]
struct FaultPlan {
    transient_failures: u32,
    list_lag: u32,
    failing_put_prefix: Option<String>,
}

/// Request counters, for asserting on I/O patterns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub puts: u64,
    pub gets: u64,
    pub range_gets: u64,
    pub bytes_read: u64,
    pub lists: u64,
    pub deletes: u64,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, Object>>,
    faults: Mutex<FaultPlan>,
    puts: AtomicU64,
    gets: AtomicU64,
    range_gets: AtomicU64,
    bytes_read: AtomicU64,
    lists: AtomicU64,
    deletes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls (of any kind) with a transient error.
    pub fn inject_transient_failures(&self, n: u32) {
        self.faults.lock().transient_failures = n;
    }

    /// Objects written from now on stay out of `list` results for the
    /// next `lists` list calls.
    pub fn set_list_lag(&self, lists: u32) {
        self.faults.lock().list_lag = lists;
    }

    /// Make every put under `prefix` fail with a non-retryable error.
    pub fn fail_puts_with_prefix(&self, prefix: Option<&str>) {
        self.faults.lock().failing_put_prefix = prefix.map(str::to_string);
    }

    /// Replace an object's bytes in place, bypassing write-once rules.
    pub fn corrupt(&self, path: &str, f: impl FnOnce(&mut Vec<u8>)) -> bool {
        let mut objects = self.objects.write();
        match objects.get_mut(path) {
            Some(obj) => {
                let mut bytes = obj.bytes.as_ref().clone();
                f(&mut bytes);
                obj.bytes = Arc::new(bytes);
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            puts: self.puts.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            range_gets: self.range_gets.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            lists: self.lists.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    fn maybe_fail(&self, op: &str, path: &str) -> Result<()> {
        let mut faults = self.faults.lock();
        if faults.transient_failures > 0 {
            faults.transient_failures -= 1;
            return Err(VexError::TransientStorage(format!(
                "injected failure: {} {}",
                op, path
            )));
        }
        Ok(())
    }

    fn lookup(&self, path: &str) -> Result<Arc<Vec<u8>>> {
        self.objects
            .read()
            .get(path)
            .map(|o| Arc::clone(&o.bytes))
            .ok_or_else(|| VexError::ObjectNotFound {
                path: path.to_string(),
            })
    }
}

impl ObjectStore for MemoryStore {
    fn put_file(&self, path: &str, bytes: &[u8], mode: PutMode) -> Result<()> {
        self.maybe_fail("put", path)?;
        let lag = {
            let faults = self.faults.lock();
            if let Some(prefix) = &faults.failing_put_prefix {
                if path.starts_with(prefix.as_str()) {
                    return Err(VexError::Storage(format!("injected write failure: {}", path)));
                }
            }
            faults.list_lag
        };
        let mut objects = self.objects.write();
        if mode == PutMode::Create && objects.contains_key(path) {
            return Err(VexError::AlreadyExists {
                path: path.to_string(),
            });
        }
        objects.insert(
            path.to_string(),
            Object {
                bytes: Arc::new(bytes.to_vec()),
                hidden_lists: lag,
            },
        );
        self.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.maybe_fail("get", path)?;
        let bytes = self.lookup(path)?;
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(bytes.as_ref().clone())
    }

    fn get_range(&self, path: &str, range: Range<u64>) -> Result<Vec<u8>> {
        self.maybe_fail("get_range", path)?;
        let bytes = self.lookup(path)?;
        if range.start > range.end || range.end > bytes.len() as u64 {
            return Err(VexError::Storage(format!(
                "range {:?} outside object {} of {} bytes",
                range,
                path,
                bytes.len()
            )));
        }
        self.range_gets.fetch_add(1, Ordering::Relaxed);
        self.bytes_read
            .fetch_add(range.end - range.start, Ordering::Relaxed);
        Ok(bytes[range.start as usize..range.end as usize].to_vec())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.maybe_fail("list", prefix)?;
        self.lists.fetch_add(1, Ordering::Relaxed);
        let mut objects = self.objects.write();
        let mut out = Vec::new();
        for (path, obj) in objects.range_mut(prefix.to_string()..) {
            if !path.starts_with(prefix) {
                break;
            }
            if obj.hidden_lists > 0 {
                obj.hidden_lists -= 1;
                continue;
            }
            out.push(path.clone());
        }
        Ok(out)
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.maybe_fail("delete", path)?;
        self.objects.write().remove(path);
        self.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn head(&self, path: &str) -> Result<Option<u64>> {
        self.maybe_fail("head", path)?;
        Ok(self.objects.read().get(path).map(|o| o.bytes.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_operations() {
        let store = MemoryStore::new();
        store.put_file("a/1", b"abc", PutMode::Create).unwrap();
        store.put_file("a/2", b"defg", PutMode::Create).unwrap();
        store.put_file("b/1", b"", PutMode::Create).unwrap();

        assert_eq!(store.get("a/1").unwrap(), b"abc");
        assert_eq!(store.get_range("a/2", 1..3).unwrap(), b"ef");
        assert_eq!(store.list("a/").unwrap(), vec!["a/1", "a/2"]);
        assert_eq!(store.head("a/2").unwrap(), Some(4));

        store.delete("a/1").unwrap();
        assert_eq!(store.head("a/1").unwrap(), None);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_create_is_conditional() {
        let store = MemoryStore::new();
        store.put_file("k", b"1", PutMode::Create).unwrap();
        assert!(matches!(
            store.put_file("k", b"2", PutMode::Create),
            Err(VexError::AlreadyExists { .. })
        ));
        store.put_file("k", b"3", PutMode::Overwrite).unwrap();
        assert_eq!(store.get("k").unwrap(), b"3");
    }

    #[test]
    fn test_transient_failures_run_out() {
        let store = MemoryStore::new();
        store.inject_transient_failures(2);
        assert!(store.get("x").unwrap_err().is_transient());
        assert!(store.put_file("x", b"", PutMode::Create).unwrap_err().is_transient());
        store.put_file("x", b"", PutMode::Create).unwrap();
    }

    #[test]
    fn test_list_lag_still_readable_by_path() {
        let store = MemoryStore::new();
        store.set_list_lag(2);
        store.put_file("v/1", b"one", PutMode::Create).unwrap();

        assert!(store.list("v/").unwrap().is_empty());
        assert_eq!(store.get("v/1").unwrap(), b"one");
        assert!(store.list("v/").unwrap().is_empty());
        assert_eq!(store.list("v/").unwrap(), vec!["v/1"]);
    }

    #[test]
    fn test_range_counters() {
        let store = MemoryStore::new();
        store.put_file("f", &[0u8; 100], PutMode::Create).unwrap();
        store.get_range("f", 10..20).unwrap();
        let stats = store.stats();
        assert_eq!(stats.range_gets, 1);
        assert_eq!(stats.bytes_read, 10);
        assert_eq!(stats.gets, 0);
    }
}
