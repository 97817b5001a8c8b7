//! The version manager: compare-and-swap publication of version
//! descriptors, the in-process descriptor table, and version pins.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::thread;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::descriptor::VersionDescriptor;
use crate::config::RetryConfig;
use crate::distance::DistanceMetric;
use crate::error::{Result, VexError};
use crate::storage::serialization::{from_json, to_json};
use crate::storage::{paths, ObjectStore, PutMode};

/// Pin reference counts, shared with outstanding [`PinHandle`]s.
#[derive(Debug, Default)]
struct PinTable {
    counts: Mutex<BTreeMap<u64, usize>>,
}

impl PinTable {
    fn acquire(&self, version_id: u64) {
        *self.counts.lock().entry(version_id).or_insert(0) += 1;
    }

    fn release(&self, version_id: u64) {
        let mut counts = self.counts.lock();
        if let Some(n) = counts.get_mut(&version_id) {
            *n -= 1;
            if *n == 0 {
                counts.remove(&version_id);
            }
        }
    }
}

/// Keeps a version's files alive until dropped.
#[derive(Debug)]
pub struct PinHandle {
    descriptor: Arc<VersionDescriptor>,
    table: Arc<PinTable>,
}

impl PinHandle {
    pub fn version_id(&self) -> u64 {
        self.descriptor.version_id
    }

    pub fn descriptor(&self) -> &Arc<VersionDescriptor> {
        &self.descriptor
    }
}

impl Clone for PinHandle {
    fn clone(&self) -> Self {
        self.table.acquire(self.descriptor.version_id);
        Self {
            descriptor: Arc::clone(&self.descriptor),
            table: Arc::clone(&self.table),
        }
    }
}

impl Drop for PinHandle {
    fn drop(&mut self) {
        self.table.release(self.descriptor.version_id);
    }
}

#[derive(Debug)]
pub struct VersionManager {
    store: Arc<dyn ObjectStore>,
    dimension: usize,
    metric: DistanceMetric,
    current: ArcSwap<VersionDescriptor>,
    /// Append-only table of every descriptor this process has seen.
    table: RwLock<BTreeMap<u64, Arc<VersionDescriptor>>>,
    pins: Arc<PinTable>,
    backoff: RetryConfig,
}

impl VersionManager {
    /// Resolve the latest published version and load it.
    ///
    /// The `latest` hint and the listing both only give a lower bound: a
    /// freshly written descriptor may be missing from either. Resolution
    /// then probes `version_<n+1>` by known path until one is absent.
    pub fn open(
        store: Arc<dyn ObjectStore>,
        dimension: usize,
        metric: DistanceMetric,
        backoff: RetryConfig,
    ) -> Result<Self> {
        let hint = match store.get(paths::LATEST) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).trim().parse::<u64>().unwrap_or(0),
            Err(VexError::ObjectNotFound { .. }) => 0,
            Err(e) => return Err(e),
        };
        let listed = store
            .list(paths::VERSION_PREFIX)?
            .iter()
            .filter_map(|p| paths::parse_version_file(p))
            .max()
            .unwrap_or(0);

        let empty = Arc::new(VersionDescriptor::empty(dimension, metric));
        let manager = Self {
            store,
            dimension,
            metric,
            current: ArcSwap::new(Arc::clone(&empty)),
            table: RwLock::new(BTreeMap::from([(0, empty)])),
            pins: Arc::new(PinTable::default()),
            backoff,
        };

        let start = hint.max(listed);
        if start > 0 {
            let descriptor = manager.load(start)?;
            manager.install(descriptor);
        }
        manager.refresh()?;
        info!(
            version = manager.current().version_id,
            hint, listed, "resolved latest version"
        );
        Ok(manager)
    }

    /// The latest version this process knows about.
    pub fn current(&self) -> Arc<VersionDescriptor> {
        self.current.load_full()
    }

    /// Descriptor for `version_id`, from the table or from storage.
    pub fn get(&self, version_id: u64) -> Result<Arc<VersionDescriptor>> {
        if let Some(d) = self.table.read().get(&version_id) {
            return Ok(Arc::clone(d));
        }
        let descriptor = self.load(version_id)?;
        self.table.write().insert(version_id, Arc::clone(&descriptor));
        Ok(descriptor)
    }

    fn load(&self, version_id: u64) -> Result<Arc<VersionDescriptor>> {
        let path = paths::version_file(version_id);
        let bytes = self.store.get(&path)?;
        let descriptor: VersionDescriptor = from_json(&bytes)?;
        if descriptor.version_id != version_id {
            return Err(VexError::Storage(format!(
                "{} holds version {}",
                path, descriptor.version_id
            )));
        }
        if descriptor.dimension as usize != self.dimension || descriptor.metric != self.metric {
            return Err(VexError::Config(format!(
                "version {} was written for dimension {} / {}, engine is configured for {} / {}",
                version_id, descriptor.dimension, descriptor.metric, self.dimension, self.metric
            )));
        }
        Ok(Arc::new(descriptor))
    }

    /// Record a descriptor and advance `current` if it is newer.
    fn install(&self, descriptor: Arc<VersionDescriptor>) {
        self.table
            .write()
            .insert(descriptor.version_id, Arc::clone(&descriptor));
        self.current.rcu(|cur| {
            if descriptor.version_id > cur.version_id {
                Arc::clone(&descriptor)
            } else {
                Arc::clone(cur)
            }
        });
    }

    /// Catch up with versions published by other writers, probing by path.
    pub fn refresh(&self) -> Result<Arc<VersionDescriptor>> {
        loop {
            let next = self.current().version_id + 1;
            if self.store.head(&paths::version_file(next))?.is_none() {
                return Ok(self.current());
            }
            let descriptor = self.get(next)?;
            self.install(descriptor);
        }
    }

    /// Conditionally write `descriptor` as the next version.
    ///
    /// Fails with [`VexError::VersionConflict`] if that version id is taken.
    pub fn publish(&self, descriptor: VersionDescriptor) -> Result<Arc<VersionDescriptor>> {
        let version_id = descriptor.version_id;
        if version_id == 0 {
            return Err(VexError::InvalidArgument("version 0 is implicit".into()));
        }
        let bytes = to_json(&descriptor)?;
        match self
            .store
            .put_file(&paths::version_file(version_id), &bytes, PutMode::Create)
        {
            Ok(()) => {}
            Err(VexError::AlreadyExists { .. }) => {
                return Err(VexError::VersionConflict {
                    expected: version_id,
                })
            }
            Err(e) => return Err(e),
        }

        let descriptor = Arc::new(descriptor);
        self.install(Arc::clone(&descriptor));
        if let Err(e) = self.store.put_file(
            paths::LATEST,
            version_id.to_string().as_bytes(),
            PutMode::Overwrite,
        ) {
            warn!(version = version_id, error = %e, "failed to update latest hint");
        }
        debug!(
            version = version_id,
            data_files = descriptor.data_files.len(),
            tombstones = descriptor.deleted_ids.len(),
            "published version"
        );
        Ok(descriptor)
    }

    /// Publish `mutator(current)` as the next version, retrying on conflict.
    ///
    /// The mutator sees a fresh base on every attempt and must rebuild its
    /// change from it. Returning an error from the mutator aborts.
    pub fn commit<F>(&self, mut mutator: F) -> Result<Arc<VersionDescriptor>>
    where
        F: FnMut(&VersionDescriptor) -> Result<VersionDescriptor>,
    {
        let mut attempt = 0u32;
        loop {
            let base = self.current();
            let mut next = mutator(&base)?;
            let successor = base.successor();
            next.version_id = successor.version_id;
            next.created_at = successor.created_at;
            match self.publish(next) {
                Err(VexError::VersionConflict { expected }) => {
                    let delay = self.backoff.delay(attempt.min(16));
                    debug!(expected, attempt, ?delay, "version conflict, retrying");
                    thread::sleep(delay);
                    attempt = attempt.saturating_add(1);
                    self.refresh()?;
                }
                other => return other,
            }
        }
    }

    /// Pin `version_id` against garbage collection.
    pub fn pin(&self, version_id: u64) -> Result<PinHandle> {
        let descriptor = self.get(version_id)?;
        self.pins.acquire(version_id);
        Ok(PinHandle {
            descriptor,
            table: Arc::clone(&self.pins),
        })
    }

    /// Pin a descriptor already in hand.
    pub fn pin_descriptor(&self, descriptor: Arc<VersionDescriptor>) -> PinHandle {
        self.pins.acquire(descriptor.version_id);
        PinHandle {
            descriptor,
            table: Arc::clone(&self.pins),
        }
    }

    pub fn pinned_versions(&self) -> Vec<u64> {
        self.pins.counts.lock().keys().copied().collect()
    }

    pub fn pin_count(&self) -> usize {
        self.pins.counts.lock().values().sum()
    }

    /// Paths referenced by any version from `floor` (or the oldest pinned
    /// version, if lower) up to the current one.
    pub fn protected_paths(&self, floor: u64) -> Result<HashSet<String>> {
        let oldest_pin = self.pins.counts.lock().keys().next().copied();
        let low = oldest_pin.map_or(floor, |p| p.min(floor));
        let high = self.current().version_id;
        let mut out = HashSet::new();
        for version_id in low..=high {
            match self.get(version_id) {
                Ok(d) => out.extend(d.referenced_paths().map(str::to_string)),
                Err(VexError::ObjectNotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::version::descriptor::FileRef;

    fn fast() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    fn open(store: &Arc<MemoryStore>) -> VersionManager {
        VersionManager::open(store.clone(), 4, DistanceMetric::L2, fast()).unwrap()
    }

    fn file(seq: u64) -> FileRef {
        FileRef {
            path: paths::data_file(0, seq),
            seq,
            partition: 0,
            rows: 1,
            size_bytes: 1,
        }
    }

    #[test]
    fn test_starts_at_version_zero() {
        let store = Arc::new(MemoryStore::new());
        let vm = open(&store);
        assert_eq!(vm.current().version_id, 0);
        assert!(vm.current().data_files.is_empty());
    }

    #[test]
    fn test_publish_and_conflict() {
        let store = Arc::new(MemoryStore::new());
        let vm = open(&store);
        let v1 = vm.current().successor();
        vm.publish(v1.clone()).unwrap();
        assert_eq!(vm.current().version_id, 1);
        assert!(matches!(
            vm.publish(v1),
            Err(VexError::VersionConflict { expected: 1 })
        ));
    }

    #[test]
    fn test_commit_retries_against_foreign_writer() {
        let store = Arc::new(MemoryStore::new());
        let a = open(&store);
        let b = open(&store);

        a.commit(|base| {
            let mut next = base.clone();
            next.data_files.push(file(1));
            Ok(next)
        })
        .unwrap();

        // b still believes version 0 is current; its first attempt conflicts
        let v = b
            .commit(|base| {
                let mut next = base.clone();
                next.data_files.push(file(2));
                Ok(next)
            })
            .unwrap();
        assert_eq!(v.version_id, 2);
        let seqs: Vec<u64> = v.data_files.iter().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn test_mutator_error_aborts() {
        let store = Arc::new(MemoryStore::new());
        let vm = open(&store);
        let result = vm.commit(|_| Err(VexError::CompactionAborted("input vanished".into())));
        assert!(matches!(result, Err(VexError::CompactionAborted(_))));
        assert_eq!(vm.current().version_id, 0);
    }

    #[test]
    fn test_reopen_finds_unlisted_versions() {
        let store = Arc::new(MemoryStore::new());
        let vm = open(&store);
        for _ in 0..3 {
            vm.commit(|base| Ok(base.clone())).unwrap();
        }
        // simulate a lagging listing and a stale hint
        store.set_list_lag(u32::MAX);
        vm.commit(|base| Ok(base.clone())).unwrap();
        store
            .put_file(paths::LATEST, b"1", PutMode::Overwrite)
            .unwrap();

        let reopened = open(&store);
        assert_eq!(reopened.current().version_id, 4);
    }

    #[test]
    fn test_pins_are_reference_counted() {
        let store = Arc::new(MemoryStore::new());
        let vm = open(&store);
        vm.commit(|base| Ok(base.clone())).unwrap();

        let p1 = vm.pin(1).unwrap();
        let p2 = p1.clone();
        assert_eq!(vm.pinned_versions(), vec![1]);
        assert_eq!(vm.pin_count(), 2);
        drop(p1);
        assert_eq!(vm.pinned_versions(), vec![1]);
        drop(p2);
        assert!(vm.pinned_versions().is_empty());
    }

    #[test]
    fn test_protected_paths_cover_pinned_versions() {
        let store = Arc::new(MemoryStore::new());
        let vm = open(&store);
        vm.commit(|base| {
            let mut next = base.clone();
            next.data_files.push(file(1));
            Ok(next)
        })
        .unwrap();
        let pin = vm.pin(1).unwrap();
        vm.commit(|base| {
            let mut next = base.clone();
            next.data_files = vec![file(2)];
            Ok(next)
        })
        .unwrap();

        let protected = vm.protected_paths(2).unwrap();
        assert!(protected.contains(&paths::data_file(0, 1)));
        drop(pin);
        let protected = vm.protected_paths(2).unwrap();
        assert!(!protected.contains(&paths::data_file(0, 1)));
        assert!(protected.contains(&paths::data_file(0, 2)));
    }

    #[test]
    fn test_reopen_with_other_dimension_fails() {
        let store = Arc::new(MemoryStore::new());
        let vm = open(&store);
        vm.commit(|base| Ok(base.clone())).unwrap();
        let err = VersionManager::open(store.clone(), 8, DistanceMetric::L2, fast()).unwrap_err();
        assert!(matches!(err, VexError::Config(_)));
    }
}
