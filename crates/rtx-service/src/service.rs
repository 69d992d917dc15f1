//! The transactional resource service.
//!
//! Loaded domain objects stay resident while anyone holds a reference to
//! them. The last release writes the object back through a read-write
//! transaction, unloads it and evicts it. Every transaction the service
//! opens is retried on lock conflict according to the configured
//! [`RetryPolicy`].

use std::sync::{Arc, PoisonError, RwLock};

use rtx_store::Listing;
use rtx_transact::{
    ReadOnlyTransaction, ReadTransaction, ReadWriteTransaction, TransactError, TransactionBuilder,
    TransactionalPersistence, Unlink,
};
use rtx_types::{NodeId, Path, ResourceId, TransactionId};
use tracing::{debug, info, warn};

use crate::cache::ResidentCache;
use crate::cleanup::CleanupChain;
use crate::config::{RetryPolicy, ServiceConfig};
use crate::error::{ServiceError, ServiceResult};
use crate::resource::{Release, Resource, ResourceLoader, TransactionalResource};

enum ServiceState {
    Stopped,
    Running(Arc<ResidentCache>),
}

struct Inner {
    persistence: TransactionalPersistence,
    loader: Arc<dyn ResourceLoader>,
    node: NodeId,
    retry: RetryPolicy,
    state: RwLock<ServiceState>,
}

/// Reference-counted access to the resources of one node.
///
/// Cheap to clone; clones share the resident cache.
#[derive(Clone)]
pub struct TransactionalResourceService {
    inner: Arc<Inner>,
}

impl TransactionalResourceService {
    /// Create a stopped service. `persistence` must be started before any
    /// operation that writes.
    pub fn new(
        persistence: TransactionalPersistence,
        loader: Arc<dyn ResourceLoader>,
        config: &ServiceConfig,
    ) -> ServiceResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                persistence,
                loader,
                node: config.node_id,
                retry: config.conflict_retry.clone(),
                state: RwLock::new(ServiceState::Stopped),
            }),
        })
    }

    pub fn start(&self) -> ServiceResult<()> {
        let mut state = self.inner.state.write().unwrap_or_else(PoisonError::into_inner);
        if matches!(*state, ServiceState::Running(_)) {
            return Err(ServiceError::AlreadyRunning);
        }
        *state = ServiceState::Running(Arc::new(ResidentCache::new()));
        info!(node = %self.inner.node, "resource service started");
        Ok(())
    }

    /// Drop the resident cache. Objects still referenced stay usable through
    /// their acquisitions and are written back when those release.
    pub fn stop(&self) -> ServiceResult<()> {
        let mut state = self.inner.state.write().unwrap_or_else(PoisonError::into_inner);
        match std::mem::replace(&mut *state, ServiceState::Stopped) {
            ServiceState::Running(context) => {
                let resident = context.len();
                if resident > 0 {
                    warn!(resident, "resource service stopped with resident resources");
                }
                info!(node = %self.inner.node, "resource service stopped");
                Ok(())
            }
            ServiceState::Stopped => Err(ServiceError::NotRunning),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(
            *self.inner.state.read().unwrap_or_else(PoisonError::into_inner),
            ServiceState::Running(_)
        )
    }

    pub fn node_id(&self) -> &NodeId {
        &self.inner.node
    }

    pub fn persistence(&self) -> &TransactionalPersistence {
        &self.inner.persistence
    }

    fn context(&self) -> ServiceResult<Arc<ResidentCache>> {
        match &*self.inner.state.read().unwrap_or_else(PoisonError::into_inner) {
            ServiceState::Running(context) => Ok(Arc::clone(context)),
            ServiceState::Stopped => Err(ServiceError::NotRunning),
        }
    }

    /// Scope a path without a context to this node.
    fn normalize(&self, path: &Path) -> ServiceResult<Path> {
        Ok(path.with_node_if_absent(&self.inner.node)?)
    }

    fn ro(&self) -> TransactionBuilder<ReadOnlyTransaction> {
        self.inner.persistence.build_ro(self.inner.node)
    }

    fn rw(&self) -> TransactionBuilder<ReadWriteTransaction> {
        self.inner.persistence.build_rw(self.inner.node)
    }

    fn load<T: ReadTransaction>(&self, txn: &mut T, resource_id: &ResourceId) -> ServiceResult<Arc<dyn Resource>> {
        let contents = txn.load_resource_contents(resource_id)?;
        let mut reader = contents.reader();
        self.inner.loader.load(resource_id, &mut reader)
    }

    fn missing(resource_id: &ResourceId) -> ServiceError {
        TransactError::NotFound(format!("resource {resource_id}")).into()
    }

    // ---- queries ----

    pub fn exists(&self, resource_id: &ResourceId) -> ServiceResult<bool> {
        self.inner.retry.run(|| {
            let mut txn = self.ro().with_resource_id(*resource_id).begin()?;
            Ok(txn.exists_resource(resource_id)?)
        })
    }

    pub fn list(&self, pattern: &Path) -> ServiceResult<Vec<Listing>> {
        let pattern = self.normalize(pattern)?;
        self.inner.retry.run(|| {
            let mut txn = self.ro().with_path(pattern.clone()).begin()?;
            Ok(txn.list(&pattern)?)
        })
    }

    /// Number of objects currently resident.
    pub fn in_memory_resource_count(&self) -> usize {
        self.context().map(|context| context.len()).unwrap_or(0)
    }

    // ---- acquisition ----

    /// Acquire the resource linked at `path`, loading it if necessary.
    pub fn acquire(&self, path: &Path) -> ServiceResult<ResourceAcquisition> {
        let context = self.context()?;
        let path = self.normalize(path)?;
        let resource = self.inner.retry.run(|| {
            let mut txn = self.ro().with_path(path.clone()).begin()?;
            let resource_id = txn.get_resource_id(&path)?;
            context.acquire(&resource_id, || self.load(&mut txn, &resource_id))
        })?;
        Ok(ResourceAcquisition::new(self.clone(), context, resource))
    }

    pub fn acquire_by_id(&self, resource_id: &ResourceId) -> ServiceResult<ResourceAcquisition> {
        let context = self.context()?;
        let resource = self.inner.retry.run(|| {
            let mut txn = self.ro().with_resource_id(*resource_id).begin()?;
            if !txn.exists_resource(resource_id)? {
                return Err(Self::missing(resource_id));
            }
            context.acquire(resource_id, || self.load(&mut txn, resource_id))
        })?;
        Ok(ResourceAcquisition::new(self.clone(), context, resource))
    }

    /// Acquire the resource linked at `path` together with a read-write
    /// transaction scoped to that path. Committing the transaction writes
    /// the object back and releases it.
    pub fn acquire_with_transaction(&self, path: &Path) -> ServiceResult<ResourceTransaction> {
        let context = self.context()?;
        let path = self.normalize(path)?;
        self.inner.retry.run(|| {
            let mut txn = self.rw().with_path(path.clone()).begin()?;
            let resource_id = txn.get_resource_id(&path)?;
            let resource = context.acquire(&resource_id, || self.load(&mut txn, &resource_id))?;
            Ok(ResourceTransaction::new(txn, Arc::clone(&context), resource))
        })
    }

    pub fn acquire_with_transaction_by_id(&self, resource_id: &ResourceId) -> ServiceResult<ResourceTransaction> {
        let context = self.context()?;
        self.inner.retry.run(|| {
            let mut txn = self.rw().with_resource_id(*resource_id).begin()?;
            if !txn.exists_resource(resource_id)? {
                return Err(Self::missing(resource_id));
            }
            let resource = context.acquire(resource_id, || self.load(&mut txn, resource_id))?;
            Ok(ResourceTransaction::new(txn, Arc::clone(&context), resource))
        })
    }

    /// Drop one reference. The last one writes the object back if it still
    /// exists, then unloads and evicts it.
    ///
    /// The count drops before any transaction is opened. If the write-back
    /// transaction cannot be opened the object is still unloaded and evicted,
    /// and its unsaved state is lost.
    fn release(&self, context: &ResidentCache, resource: &Arc<TransactionalResource>) -> ServiceResult<Release> {
        let outcome = context.release(resource);
        if outcome != Release::Final {
            return Ok(outcome);
        }

        let resource_id = *resource.resource_id();
        let begun = self
            .inner
            .retry
            .run(|| Ok(self.rw().with_resource_id(resource_id).begin()?));
        let mut txn = match begun {
            Ok(txn) => txn,
            Err(e) => {
                context.finalize(resource, move |_| {
                    warn!(resource = %resource_id, error = %e, "write-back lost on release");
                    Err(e)
                })?;
                return Ok(outcome);
            }
        };

        let finalized = context.finalize(resource, |delegate| {
            if txn.exists_resource(&resource_id)? {
                let mut out = txn.update_resource(&resource_id)?;
                delegate.serialize(&mut out)?;
            }
            Ok(())
        })?;
        if finalized {
            txn.commit()?;
        } else {
            txn.rollback()?;
        }
        Ok(outcome)
    }

    // ---- creation ----

    /// Link `resource` at `path` and keep it resident with one reference.
    ///
    /// A wildcard-terminated `path` gets a random last component. Returns the
    /// path the resource was linked at. The object is made resident before
    /// the link commits, so one that is already resident fails with
    /// [`ServiceError::AlreadyResident`] and leaves the store untouched.
    pub fn add_and_acquire_resource(
        &self,
        path: &Path,
        resource: Arc<dyn Resource>,
    ) -> ServiceResult<(Path, ResourceAcquisition)> {
        let context = self.context()?;
        let path = self.normalize(path)?.append_uuid_if_wildcard();
        let resource_id = *resource.id();
        let resident = context.insert(resource)?;
        let linked = self.inner.retry.run(|| {
            let mut txn = self
                .rw()
                .with_path(path.clone())
                .with_resource_id(resource_id)
                .begin()?;
            txn.link_new_resource(resource_id, &path)?;
            txn.commit()?;
            Ok(())
        });
        if let Err(e) = linked {
            context.remove(&resource_id);
            return Err(e);
        }
        debug!(resource = %resource_id, path = %path, "resource added and acquired");
        Ok((path, ResourceAcquisition::new(self.clone(), context, resident)))
    }

    /// Persist `resource` at `path` and unload it straight away.
    pub fn add_and_release_resource(&self, path: &Path, resource: Arc<dyn Resource>) -> ServiceResult<Path> {
        self.context()?;
        let path = self.normalize(path)?.append_uuid_if_wildcard();
        let resource_id = *resource.id();
        let _unload = CleanupChain::new().then(|| resource.unload());
        self.inner.retry.run(|| {
            let mut txn = self
                .rw()
                .with_path(path.clone())
                .with_resource_id(resource_id)
                .begin()?;
            {
                let mut out = txn.save_new_resource(&path, resource_id)?;
                resource.serialize(&mut out)?;
            }
            txn.commit()?;
            Ok(())
        })?;
        debug!(resource = %resource_id, path = %path, "resource added and released");
        Ok(path)
    }

    // ---- linking ----

    /// Link an additional path to an existing resource.
    pub fn link(&self, resource_id: &ResourceId, destination: &Path) -> ServiceResult<()> {
        let destination = self.normalize(destination)?;
        self.inner.retry.run(|| {
            let mut txn = self
                .rw()
                .with_resource_id(*resource_id)
                .with_path(destination.clone())
                .begin()?;
            txn.link_existing_resource(resource_id, &destination)?;
            txn.commit()?;
            Ok(())
        })
    }

    /// Link `destination` to the resource at `source`. Returns its id.
    pub fn link_path(&self, source: &Path, destination: &Path) -> ServiceResult<ResourceId> {
        let source = self.normalize(source)?;
        let destination = self.normalize(destination)?;
        self.inner.retry.run(|| {
            let mut txn = self
                .rw()
                .with_path(source.clone())
                .with_path(destination.clone())
                .begin()?;
            let resource_id = txn.get_resource_id(&source)?;
            txn.link_existing_resource(&resource_id, &destination)?;
            txn.commit()?;
            Ok(resource_id)
        })
    }

    // ---- removal ----

    /// Unlink `path`. If that deleted the resource and it was resident,
    /// `on_removed` receives the evicted object.
    pub fn unlink_path<F>(&self, path: &Path, on_removed: F) -> ServiceResult<Unlink>
    where
        F: FnOnce(Arc<dyn Resource>),
    {
        let context = self.context()?;
        let path = self.normalize(path)?;
        let unlink = self.inner.retry.run(|| {
            let mut txn = self.rw().with_path(path.clone()).begin()?;
            let unlink = txn.unlink_path(&path)?;
            txn.commit()?;
            Ok(unlink)
        })?;
        if unlink.removed {
            if let Some(delegate) = context.remove(&unlink.resource_id) {
                on_removed(delegate);
            }
        }
        Ok(unlink)
    }

    /// Unlink up to `max` of the paths listed under `pattern`.
    pub fn unlink_multiple<F>(&self, pattern: &Path, max: usize, mut on_removed: F) -> ServiceResult<Vec<Unlink>>
    where
        F: FnMut(Arc<dyn Resource>),
    {
        let context = self.context()?;
        let mut listings = self.list(pattern)?;
        listings.truncate(max);
        if listings.is_empty() {
            return Ok(Vec::new());
        }

        let unlinks = self.inner.retry.run(|| {
            let mut txn = self
                .rw()
                .with_paths(listings.iter().map(|l| l.path.clone()))
                .with_resource_ids(listings.iter().map(|l| l.resource_id))
                .begin()?;
            let mut unlinks = Vec::with_capacity(listings.len());
            for listing in &listings {
                if txn.exists(&listing.path)? {
                    unlinks.push(txn.unlink_path(&listing.path)?);
                }
            }
            txn.commit()?;
            Ok(unlinks)
        })?;

        for unlink in unlinks.iter().filter(|u| u.removed) {
            if let Some(delegate) = context.remove(&unlink.resource_id) {
                on_removed(delegate);
            }
        }
        Ok(unlinks)
    }

    /// Delete a resource with every path linked to it. Returns the evicted
    /// object if it was resident.
    pub fn remove_resource(&self, resource_id: &ResourceId) -> ServiceResult<Option<Arc<dyn Resource>>> {
        let context = self.context()?;
        self.inner.retry.run(|| {
            let mut txn = self.rw().with_resource_id(*resource_id).begin()?;
            txn.remove_resource(resource_id)?;
            txn.commit()?;
            Ok(())
        })?;
        Ok(context.remove(resource_id))
    }

    /// Delete up to `max` of the resources listed under `pattern`.
    pub fn remove_resources<F>(&self, pattern: &Path, max: usize, mut on_removed: F) -> ServiceResult<Vec<ResourceId>>
    where
        F: FnMut(Arc<dyn Resource>),
    {
        let context = self.context()?;
        let pattern = self.normalize(pattern)?;
        let removed = self.inner.retry.run(|| {
            let mut txn = self.rw().with_path(pattern.clone()).begin()?;
            let removed = txn.remove_resources(&pattern, max)?;
            txn.commit()?;
            Ok(removed)
        })?;
        for resource_id in &removed {
            if let Some(delegate) = context.remove(resource_id) {
                on_removed(delegate);
            }
        }
        Ok(removed)
    }

    /// Delete every resource of this node under an exclusive transaction and
    /// start over with an empty resident cache. Returns the objects that were
    /// resident.
    pub fn remove_all_resources(&self) -> ServiceResult<Vec<Arc<dyn Resource>>> {
        let exclusive = self.inner.persistence.open_exclusive_rw()?;
        let previous = {
            let mut state = self.inner.state.write().unwrap_or_else(PoisonError::into_inner);
            match &*state {
                ServiceState::Running(context) => {
                    let previous = Arc::clone(context);
                    *state = ServiceState::Running(Arc::new(ResidentCache::new()));
                    previous
                }
                ServiceState::Stopped => return Err(ServiceError::NotRunning),
            }
        };
        let node = self.inner.node;
        let removed = exclusive.compute_operation(|store| Ok(store.remove_all_resources(&node)?))?;
        exclusive.close();
        let resident = previous.drain();
        info!(node = %node, removed = removed.len(), resident = resident.len(), "removed all resources");
        Ok(resident)
    }
}

impl std::fmt::Debug for TransactionalResourceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionalResourceService")
            .field("node", &self.inner.node)
            .field("running", &self.is_running())
            .finish()
    }
}

/// One reference to a resident resource. Released on [`close`](Self::close)
/// or drop.
pub struct ResourceAcquisition {
    service: TransactionalResourceService,
    context: Arc<ResidentCache>,
    resource: Arc<TransactionalResource>,
    released: bool,
}

impl ResourceAcquisition {
    fn new(
        service: TransactionalResourceService,
        context: Arc<ResidentCache>,
        resource: Arc<TransactionalResource>,
    ) -> Self {
        Self {
            service,
            context,
            resource,
            released: false,
        }
    }

    pub fn resource_id(&self) -> &ResourceId {
        self.resource.resource_id()
    }

    pub fn resource(&self) -> &Arc<dyn Resource> {
        self.resource.delegate()
    }

    /// Release this reference, writing the object back if it was the last.
    pub fn close(mut self) -> ServiceResult<Release> {
        self.released = true;
        self.service.release(&self.context, &self.resource)
    }
}

impl Drop for ResourceAcquisition {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.service.release(&self.context, &self.resource) {
            warn!(resource = %self.resource.resource_id(), error = %e, "release on drop failed");
        }
    }
}

impl std::fmt::Debug for ResourceAcquisition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceAcquisition")
            .field("resource", &self.resource)
            .field("released", &self.released)
            .finish()
    }
}

/// Releases a reference without writing the object back.
struct ReleaseGuard {
    context: Arc<ResidentCache>,
    resource: Arc<TransactionalResource>,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if self.context.release(&self.resource) != Release::Final {
            return;
        }
        if let Err(e) = self.context.finalize(&self.resource, |_| Ok(())) {
            warn!(resource = %self.resource.resource_id(), error = %e, "release failed");
        }
    }
}

/// A resident resource bound to an open read-write transaction.
///
/// Dropping it without committing rolls the transaction back and releases
/// the reference; if that was the last reference the object is evicted
/// without being written.
pub struct ResourceTransaction {
    txn: ReadWriteTransaction,
    guard: ReleaseGuard,
}

impl ResourceTransaction {
    fn new(txn: ReadWriteTransaction, context: Arc<ResidentCache>, resource: Arc<TransactionalResource>) -> Self {
        Self {
            txn,
            guard: ReleaseGuard { context, resource },
        }
    }

    pub fn resource_id(&self) -> &ResourceId {
        self.guard.resource.resource_id()
    }

    pub fn resource(&self) -> &Arc<dyn Resource> {
        self.guard.resource.delegate()
    }

    pub fn transaction(&mut self) -> &mut ReadWriteTransaction {
        &mut self.txn
    }

    /// Write the object into the transaction, commit, then release.
    pub fn commit(self) -> ServiceResult<TransactionId> {
        let Self { mut txn, guard } = self;
        let resource_id = *guard.resource.resource_id();
        if txn.exists_resource(&resource_id)? {
            let mut out = txn.update_resource(&resource_id)?;
            guard.resource.delegate().serialize(&mut out)?;
        }
        let committed = txn.commit()?;
        drop(guard);
        Ok(committed)
    }

    pub fn rollback(self) -> ServiceResult<()> {
        let Self { txn, guard } = self;
        txn.rollback()?;
        drop(guard);
        Ok(())
    }
}

impl std::fmt::Debug for ResourceTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceTransaction")
            .field("txn", &self.txn)
            .field("resource", &self.guard.resource)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtx_store::{DataStore, InMemoryDataStore};
    use rtx_transact::{JournalConfig, TransactConfig};
    use std::io::{self, Read, Write};
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::{Barrier, Mutex};

    #[derive(Default)]
    struct Stats {
        loads: AtomicUsize,
        serializes: AtomicUsize,
        unloads: AtomicUsize,
        loaded: Mutex<Vec<Arc<Counter>>>,
    }

    struct Counter {
        id: ResourceId,
        value: AtomicU64,
        stats: Arc<Stats>,
    }

    impl Resource for Counter {
        fn id(&self) -> &ResourceId {
            &self.id
        }

        fn serialize(&self, out: &mut dyn Write) -> io::Result<()> {
            self.stats.serializes.fetch_add(1, Ordering::SeqCst);
            write!(out, "{}", self.value.load(Ordering::SeqCst))
        }

        fn unload(&self) {
            self.stats.unloads.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CounterLoader(Arc<Stats>);

    impl ResourceLoader for CounterLoader {
        fn load(&self, resource_id: &ResourceId, contents: &mut dyn Read) -> ServiceResult<Arc<dyn Resource>> {
            let mut text = String::new();
            contents.read_to_string(&mut text)?;
            let value = text.trim().parse().map_err(|e| ServiceError::Load {
                resource_id: *resource_id,
                reason: format!("{e}"),
            })?;
            let counter = Arc::new(Counter {
                id: *resource_id,
                value: AtomicU64::new(value),
                stats: Arc::clone(&self.0),
            });
            self.0.loads.fetch_add(1, Ordering::SeqCst);
            self.0.loaded.lock().unwrap().push(Arc::clone(&counter));
            Ok(counter)
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        persistence: TransactionalPersistence,
        service: TransactionalResourceService,
        stats: Arc<Stats>,
        node: NodeId,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_retry(RetryPolicy::default())
        }

        fn with_retry(retry: RetryPolicy) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store: Arc<dyn DataStore> = Arc::new(InMemoryDataStore::new());
            let config = TransactConfig {
                max_concurrent_transactions: 16,
                journal: JournalConfig {
                    path: dir.path().join("journal.log"),
                    ..JournalConfig::default()
                },
            };
            let persistence = TransactionalPersistence::open(store, &config).unwrap();
            persistence.start().unwrap();

            let stats = Arc::new(Stats::default());
            let node = NodeId::random();
            let service = TransactionalResourceService::new(
                persistence.clone(),
                Arc::new(CounterLoader(Arc::clone(&stats))),
                &ServiceConfig {
                    node_id: node,
                    conflict_retry: retry,
                },
            )
            .unwrap();
            service.start().unwrap();
            Self {
                _dir: dir,
                persistence,
                service,
                stats,
                node,
            }
        }

        fn counter(&self, value: u64) -> Arc<Counter> {
            Arc::new(Counter {
                id: ResourceId::new(self.node),
                value: AtomicU64::new(value),
                stats: Arc::clone(&self.stats),
            })
        }

        fn stored(&self, path: &Path) -> String {
            let path = path.with_node_if_absent(&self.node).unwrap();
            let mut txn = self.persistence.build_ro(self.node).with_path(path.clone()).begin().unwrap();
            let contents = txn.load_resource_contents_at(&path).unwrap();
            String::from_utf8(contents.bytes().to_vec()).unwrap()
        }

        fn last_loaded(&self) -> Arc<Counter> {
            self.stats.loaded.lock().unwrap().last().cloned().unwrap()
        }

        fn count(&self, counter: &AtomicUsize) -> usize {
            counter.load(Ordering::SeqCst)
        }
    }

    fn path(s: &str) -> Path {
        s.parse().unwrap()
    }

    // ---- lifecycle ----

    #[test]
    fn start_stop_state_machine() {
        let fx = Fixture::new();
        assert!(fx.service.is_running());
        assert!(matches!(fx.service.start(), Err(ServiceError::AlreadyRunning)));

        fx.service.stop().unwrap();
        assert!(!fx.service.is_running());
        assert!(matches!(fx.service.stop(), Err(ServiceError::NotRunning)));
        assert!(matches!(
            fx.service.acquire(&path("/a")),
            Err(ServiceError::NotRunning)
        ));
        assert_eq!(fx.service.in_memory_resource_count(), 0);

        fx.service.start().unwrap();
        assert!(fx.service.is_running());
    }

    // ---- creation ----

    #[test]
    fn add_and_release_persists_and_unloads() {
        let fx = Fixture::new();
        let stored_at = fx
            .service
            .add_and_release_resource(&path("/counters/a"), fx.counter(7))
            .unwrap();
        assert_eq!(stored_at.context(), Some(fx.node.to_string().as_str()));
        assert_eq!(fx.count(&fx.stats.serializes), 1);
        assert_eq!(fx.count(&fx.stats.unloads), 1);
        assert_eq!(fx.service.in_memory_resource_count(), 0);
        assert_eq!(fx.stored(&path("/counters/a")), "7");

        let acquisition = fx.service.acquire(&path("/counters/a")).unwrap();
        assert_eq!(fx.count(&fx.stats.loads), 1);
        assert_eq!(fx.service.in_memory_resource_count(), 1);
        assert_eq!(acquisition.close().unwrap(), Release::Final);
        assert_eq!(fx.count(&fx.stats.serializes), 2);
        assert_eq!(fx.count(&fx.stats.unloads), 2);
        assert_eq!(fx.service.in_memory_resource_count(), 0);
    }

    #[test]
    fn add_and_acquire_keeps_resident() {
        let fx = Fixture::new();
        let counter = fx.counter(3);
        let (linked, acquisition) = fx
            .service
            .add_and_acquire_resource(&path("/counters/*"), counter.clone())
            .unwrap();
        assert_eq!(linked.len(), 2);
        assert!(!linked.is_wildcard());
        assert_eq!(acquisition.resource_id(), &counter.id);
        assert_eq!(fx.service.in_memory_resource_count(), 1);
        assert_eq!(fx.count(&fx.stats.serializes), 0);

        let again = fx.service.add_and_acquire_resource(&path("/counters/other"), counter.clone());
        assert!(matches!(again, Err(ServiceError::AlreadyResident(_))));
        assert_eq!(fx.service.list(&path("/counters/*")).unwrap().len(), 1);

        // Resident already, so no load.
        let second = fx.service.acquire(&linked).unwrap();
        assert_eq!(fx.count(&fx.stats.loads), 0);
        assert_eq!(second.close().unwrap(), Release::Remaining(1));

        counter.value.store(11, Ordering::SeqCst);
        assert_eq!(acquisition.close().unwrap(), Release::Final);
        assert_eq!(fx.stored(&linked), "11");
        assert_eq!(fx.count(&fx.stats.unloads), 1);
    }

    // ---- reference counting ----

    #[test]
    fn last_release_serializes_once() {
        let fx = Fixture::new();
        fx.service
            .add_and_release_resource(&path("/rc"), fx.counter(1))
            .unwrap();
        let serialized = fx.count(&fx.stats.serializes);

        let a = fx.service.acquire(&path("/rc")).unwrap();
        let b = fx.service.acquire(&path("/rc")).unwrap();
        assert_eq!(fx.count(&fx.stats.loads), 1);

        assert_eq!(a.close().unwrap(), Release::Remaining(1));
        assert_eq!(fx.count(&fx.stats.serializes), serialized);
        assert_eq!(b.close().unwrap(), Release::Final);
        assert_eq!(fx.count(&fx.stats.serializes), serialized + 1);
        assert_eq!(fx.service.in_memory_resource_count(), 0);
    }

    #[test]
    fn drop_releases() {
        let fx = Fixture::new();
        fx.service
            .add_and_release_resource(&path("/dropped"), fx.counter(4))
            .unwrap();
        {
            let _acquisition = fx.service.acquire(&path("/dropped")).unwrap();
            fx.last_loaded().value.store(5, Ordering::SeqCst);
            assert_eq!(fx.service.in_memory_resource_count(), 1);
        }
        assert_eq!(fx.service.in_memory_resource_count(), 0);
        assert_eq!(fx.stored(&path("/dropped")), "5");
    }

    #[test]
    fn concurrent_acquire_loads_once() {
        let fx = Fixture::with_retry(RetryPolicy {
            max_attempts: 10_000,
            backoff_ms: 1,
        });
        fx.service
            .add_and_release_resource(&path("/shared"), fx.counter(9))
            .unwrap();

        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let service = fx.service.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    service.acquire(&path("/shared")).unwrap()
                })
            })
            .collect();
        let acquisitions: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(fx.count(&fx.stats.loads), 1);
        assert_eq!(fx.service.in_memory_resource_count(), 1);

        let serialized = fx.count(&fx.stats.serializes);
        let finals = acquisitions
            .into_iter()
            .map(|a| a.close().unwrap())
            .filter(|r| *r == Release::Final)
            .count();
        assert_eq!(finals, 1);
        assert_eq!(fx.count(&fx.stats.serializes), serialized + 1);
    }

    #[test]
    fn acquire_missing_is_not_found() {
        let fx = Fixture::new();
        let err = fx.service.acquire(&path("/nothing")).unwrap_err();
        assert!(err.is_not_found());
        let err = fx
            .service
            .acquire_by_id(&ResourceId::new(fx.node))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    // ---- transactions ----

    #[test]
    fn transaction_commit_writes_back_and_releases() {
        let fx = Fixture::new();
        fx.service
            .add_and_release_resource(&path("/txn"), fx.counter(1))
            .unwrap();

        let rt = fx.service.acquire_with_transaction(&path("/txn")).unwrap();
        fx.last_loaded().value.store(42, Ordering::SeqCst);
        assert_eq!(fx.service.in_memory_resource_count(), 1);
        rt.commit().unwrap();

        assert_eq!(fx.stored(&path("/txn")), "42");
        assert_eq!(fx.service.in_memory_resource_count(), 0);
        assert_eq!(fx.count(&fx.stats.unloads), 2);
    }

    #[test]
    fn transaction_drop_discards_changes() {
        let fx = Fixture::new();
        let id = fx.counter(0).id;
        let counter = Arc::new(Counter {
            id,
            value: AtomicU64::new(8),
            stats: Arc::clone(&fx.stats),
        });
        fx.service
            .add_and_release_resource(&path("/keep"), counter)
            .unwrap();
        let serialized = fx.count(&fx.stats.serializes);

        {
            let mut rt = fx.service.acquire_with_transaction_by_id(&id).unwrap();
            fx.last_loaded().value.store(99, Ordering::SeqCst);
            assert!(rt.transaction().exists_resource(&id).unwrap());
        }

        assert_eq!(fx.count(&fx.stats.serializes), serialized);
        assert_eq!(fx.service.in_memory_resource_count(), 0);
        assert_eq!(fx.stored(&path("/keep")), "8");
    }

    // ---- release under contention ----

    #[test]
    fn release_while_transaction_holds_the_id() {
        let fx = Fixture::new();
        let (linked, a) = fx
            .service
            .add_and_acquire_resource(&path("/leak"), fx.counter(1))
            .unwrap();
        let rt = fx.service.acquire_with_transaction(&linked).unwrap();

        let journal_size = fx.persistence.journal().log_size();
        assert_eq!(a.close().unwrap(), Release::Remaining(1));
        assert_eq!(fx.persistence.journal().log_size(), journal_size);
        assert_eq!(fx.count(&fx.stats.serializes), 0);

        rt.rollback().unwrap();
        assert_eq!(fx.service.in_memory_resource_count(), 0);
        assert_eq!(fx.count(&fx.stats.unloads), 1);
    }

    #[test]
    fn blocked_final_release_still_evicts() {
        let fx = Fixture::with_retry(RetryPolicy::none());
        fx.service
            .add_and_release_resource(&path("/blocked"), fx.counter(1))
            .unwrap();
        let acquisition = fx.service.acquire(&path("/blocked")).unwrap();
        let id = *acquisition.resource_id();
        fx.last_loaded().value.store(2, Ordering::SeqCst);
        let unloads = fx.count(&fx.stats.unloads);

        let holder = fx
            .persistence
            .build_rw(fx.node)
            .with_resource_id(id)
            .begin()
            .unwrap();
        let err = acquisition.close().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(fx.count(&fx.stats.unloads), unloads + 1);
        assert_eq!(fx.service.in_memory_resource_count(), 0);
        drop(holder);

        // The unsaved value is gone; the next acquire reloads the stored one.
        assert_eq!(fx.stored(&path("/blocked")), "1");
        let again = fx.service.acquire_by_id(&id).unwrap();
        assert_eq!(fx.last_loaded().value.load(Ordering::SeqCst), 1);
        assert_eq!(again.close().unwrap(), Release::Final);
    }

    #[test]
    fn failed_link_leaves_nothing_resident() {
        let fx = Fixture::new();
        fx.service
            .add_and_release_resource(&path("/taken"), fx.counter(1))
            .unwrap();

        let counter = fx.counter(2);
        let result = fx.service.add_and_acquire_resource(&path("/taken"), counter.clone());
        assert!(matches!(
            result,
            Err(ServiceError::Transact(TransactError::Duplicate(_)))
        ));
        assert_eq!(fx.service.in_memory_resource_count(), 0);
        assert!(!fx.service.exists(&counter.id).unwrap());

        // The same object can still be added elsewhere.
        let (_, acquisition) = fx
            .service
            .add_and_acquire_resource(&path("/free"), counter)
            .unwrap();
        assert_eq!(fx.service.in_memory_resource_count(), 1);
        drop(acquisition);
    }

    // ---- linking and removal ----

    #[test]
    fn unlink_reports_removed_resident() {
        let fx = Fixture::new();
        let (_, acquisition) = fx
            .service
            .add_and_acquire_resource(&path("/a"), fx.counter(1))
            .unwrap();
        let id = *acquisition.resource_id();
        assert_eq!(fx.service.link_path(&path("/a"), &path("/b")).unwrap(), id);

        let mut evicted = Vec::new();
        let first = fx
            .service
            .unlink_path(&path("/a"), |r| evicted.push(*r.id()))
            .unwrap();
        assert!(!first.removed);
        assert!(evicted.is_empty());
        assert!(fx.service.exists(&id).unwrap());

        let second = fx
            .service
            .unlink_path(&path("/b"), |r| evicted.push(*r.id()))
            .unwrap();
        assert!(second.removed);
        assert_eq!(evicted, vec![id]);
        assert!(!fx.service.exists(&id).unwrap());
        assert_eq!(fx.service.in_memory_resource_count(), 0);

        assert_eq!(acquisition.close().unwrap(), Release::AlreadyZero);
    }

    #[test]
    fn link_by_id_shares_resource() {
        let fx = Fixture::new();
        let counter = fx.counter(6);
        let id = counter.id;
        fx.service
            .add_and_release_resource(&path("/original"), counter)
            .unwrap();
        fx.service.link(&id, &path("/alias")).unwrap();

        let acquisition = fx.service.acquire(&path("/alias")).unwrap();
        assert_eq!(acquisition.resource_id(), &id);
        acquisition.close().unwrap();
        assert_eq!(fx.service.list(&path("/*")).unwrap().len(), 2);
    }

    #[test]
    fn unlink_multiple_is_bounded() {
        let fx = Fixture::new();
        for value in 0..3 {
            fx.service
                .add_and_release_resource(&path("/multi/*"), fx.counter(value))
                .unwrap();
        }

        let unlinks = fx.service.unlink_multiple(&path("/multi/*"), 2, |_| {}).unwrap();
        assert_eq!(unlinks.len(), 2);
        assert!(unlinks.iter().all(|u| u.removed));
        assert_eq!(fx.service.list(&path("/multi/*")).unwrap().len(), 1);
    }

    #[test]
    fn remove_resources_reports_resident_only() {
        let fx = Fixture::new();
        for value in 0..3 {
            fx.service
                .add_and_release_resource(&path("/batch/*"), fx.counter(value))
                .unwrap();
        }
        let (_, held) = fx
            .service
            .add_and_acquire_resource(&path("/batch/*"), fx.counter(3))
            .unwrap();

        let mut evicted = Vec::new();
        let removed = fx
            .service
            .remove_resources(&path("/batch/*"), 10, |r| evicted.push(*r.id()))
            .unwrap();
        assert_eq!(removed.len(), 4);
        assert_eq!(evicted, vec![*held.resource_id()]);
        assert!(fx.service.list(&path("/batch/*")).unwrap().is_empty());
        assert_eq!(held.close().unwrap(), Release::AlreadyZero);
    }

    #[test]
    fn remove_resource_returns_resident() {
        let fx = Fixture::new();
        let (_, acquisition) = fx
            .service
            .add_and_acquire_resource(&path("/gone"), fx.counter(1))
            .unwrap();
        let id = *acquisition.resource_id();
        let removed = fx.service.remove_resource(&id).unwrap();
        assert_eq!(removed.map(|r| *r.id()), Some(id));
        assert!(!fx.service.exists(&id).unwrap());
        assert!(fx.service.remove_resource(&id).err().unwrap().is_not_found());
        drop(acquisition);
    }

    #[test]
    fn remove_all_swaps_context() {
        let fx = Fixture::new();
        let (_, a) = fx
            .service
            .add_and_acquire_resource(&path("/all/a"), fx.counter(1))
            .unwrap();
        let (_, b) = fx
            .service
            .add_and_acquire_resource(&path("/all/b"), fx.counter(2))
            .unwrap();
        fx.service
            .add_and_release_resource(&path("/all/c"), fx.counter(3))
            .unwrap();

        let resident = fx.service.remove_all_resources().unwrap();
        assert_eq!(resident.len(), 2);
        assert_eq!(fx.service.in_memory_resource_count(), 0);
        assert!(fx.service.list(&path("/all/*")).unwrap().is_empty());
        assert!(!fx.service.exists(a.resource_id()).unwrap());

        assert_eq!(a.close().unwrap(), Release::AlreadyZero);
        assert_eq!(b.close().unwrap(), Release::AlreadyZero);
    }
}
