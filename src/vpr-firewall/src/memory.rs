//! In-memory filter engine
//!
//! A faithful stand-in for the kernel filter subsystem: sessions share one
//! object store and one transaction lock, mutations are staged per
//! transaction and published atomically on commit.
//!
//! [`MemoryObserver`] looks at the committed store from the outside (what
//! the network would see), classifies sample packets against it, and injects
//! faults: failing filter inserts, failing commits, a foreign lock holder.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use crate::engine::{
    next_holder_id, FilterEngine, FilterId, LockTimeout, ObjectStore, Owner,
    Provider, Sublayer, TransactionLock,
};
use crate::error::EngineError;
use crate::filter::{classify, Action, FilterSpec, Packet};

/// Lock wait used when the caller asks for the engine default
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Every capability call, successful or not
    pub calls: usize,
    pub sessions_opened: usize,
    pub sessions_closed: usize,
    pub transactions: usize,
    pub commits: usize,
    pub aborts: usize,
}

#[derive(Debug, Default)]
struct Faults {
    fail_add_after: Option<usize>,
    fail_commit: bool,
}

#[derive(Debug, Default)]
struct StoreState {
    committed: ObjectStore,
    next_id: u64,
    faults: Faults,
    stats: EngineStats,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<StoreState>,
    lock: TransactionLock,
    default_timeout: Duration,
}

/// One session on an in-memory filter engine.
#[derive(Debug)]
pub struct MemoryEngine {
    shared: Arc<Shared>,
    holder: u64,
    open: bool,
    pending: Option<ObjectStore>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::with_default_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    /// Engine whose "default" lock wait is `timeout`.
    pub fn with_default_timeout(timeout: Duration) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(StoreState::default()),
            lock: TransactionLock::new(),
            default_timeout: timeout,
        });
        Self::attach(shared)
    }

    fn attach(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            holder: next_holder_id(),
            open: false,
            pending: None,
        }
    }

    /// A new, unopened session on the same engine.
    pub fn session(&self) -> MemoryEngine {
        Self::attach(self.shared.clone())
    }

    pub fn observer(&self) -> MemoryObserver {
        MemoryObserver {
            shared: self.shared.clone(),
        }
    }

    fn count_call(&self) {
        self.shared.state.lock().stats.calls += 1;
    }

    fn require_open(&self) -> Result<(), EngineError> {
        if !self.open {
            return Err(EngineError::SessionClosed);
        }
        Ok(())
    }

    fn pending(&mut self) -> Result<&mut ObjectStore, EngineError> {
        self.require_open()?;
        self.pending.as_mut().ok_or(EngineError::NoTransaction)
    }

    fn finish(&mut self) {
        self.pending = None;
        self.shared.lock.release(self.holder);
    }
}

impl Drop for MemoryEngine {
    fn drop(&mut self) {
        if self.pending.is_some() {
            self.finish();
        }
    }
}

impl FilterEngine for MemoryEngine {
    fn open_session(&mut self) -> Result<(), EngineError> {
        self.count_call();
        if self.open {
            return Err(EngineError::SessionOpen);
        }
        self.open = true;
        self.shared.state.lock().stats.sessions_opened += 1;
        Ok(())
    }

    fn close_session(&mut self) -> Result<(), EngineError> {
        self.count_call();
        self.require_open()?;
        if self.pending.is_some() {
            debug!("closing session with an open transaction; aborting it");
            self.finish();
            self.shared.state.lock().stats.aborts += 1;
        }
        self.open = false;
        self.shared.state.lock().stats.sessions_closed += 1;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn begin(&mut self, timeout: LockTimeout) -> Result<(), EngineError> {
        self.count_call();
        self.require_open()?;
        if self.pending.is_some() {
            return Err(EngineError::TransactionActive);
        }
        let wait = timeout.resolve(self.shared.default_timeout);
        self.shared.lock.acquire(self.holder, wait)?;
        let mut state = self.shared.state.lock();
        state.stats.transactions += 1;
        self.pending = Some(state.committed.clone());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), EngineError> {
        self.count_call();
        self.require_open()?;
        let staged = self.pending.take().ok_or(EngineError::NoTransaction)?;
        {
            let mut state = self.shared.state.lock();
            if std::mem::take(&mut state.faults.fail_commit) {
                drop(state);
                // the transaction stays open; the caller is expected to abort
                self.pending = Some(staged);
                return Err(EngineError::Commit("injected commit failure".into()));
            }
            state.committed = staged;
            state.stats.commits += 1;
        }
        self.shared.lock.release(self.holder);
        Ok(())
    }

    fn abort(&mut self) -> Result<(), EngineError> {
        self.count_call();
        self.require_open()?;
        if self.pending.is_none() {
            return Err(EngineError::NoTransaction);
        }
        self.finish();
        self.shared.state.lock().stats.aborts += 1;
        Ok(())
    }

    fn register_provider(&mut self, provider: &Provider) -> Result<(), EngineError> {
        self.count_call();
        self.pending()?.put_provider(provider);
        Ok(())
    }

    fn register_sublayer(&mut self, sublayer: &Sublayer) -> Result<(), EngineError> {
        self.count_call();
        self.pending()?.put_sublayer(sublayer)
    }

    fn add_filter(&mut self, owner: &Owner, filter: &FilterSpec) -> Result<FilterId, EngineError> {
        self.count_call();
        let shared = self.shared.clone();
        let pending = self.pending()?;
        pending.ensure_sublayer(owner)?;
        let mut state = shared.state.lock();
        match state.faults.fail_add_after {
            Some(0) => {
                state.faults.fail_add_after = None;
                return Err(EngineError::Rejected(format!(
                    "injected failure adding {:?}",
                    filter.name
                )));
            }
            Some(n) => state.faults.fail_add_after = Some(n - 1),
            None => {}
        }
        state.next_id += 1;
        let id = FilterId(state.next_id);
        drop(state);
        trace!(%id, name = %filter.name, "staging filter");
        pending.put_filter(id, owner, filter);
        Ok(id)
    }

    fn remove_filter(&mut self, id: FilterId) -> Result<(), EngineError> {
        self.count_call();
        self.pending()?.take_filter(id)
    }

    fn owned_filters(&self, owner: &Owner) -> Result<Vec<FilterId>, EngineError> {
        self.count_call();
        self.require_open()?;
        Ok(match &self.pending {
            Some(pending) => pending.owned_ids(owner),
            None => self.shared.state.lock().committed.owned_ids(owner),
        })
    }

    fn remove_owned_objects(&mut self, owner: &Owner) -> Result<(), EngineError> {
        self.count_call();
        self.pending()?.remove_owned(owner);
        Ok(())
    }
}

/// Outside view of a [`MemoryEngine`].
#[derive(Debug, Clone)]
pub struct MemoryObserver {
    shared: Arc<Shared>,
}

impl MemoryObserver {
    /// Snapshot of the committed objects.
    pub fn committed(&self) -> ObjectStore {
        self.shared.state.lock().committed.clone()
    }

    /// Committed filters of `owner`.
    pub fn owned_filters(&self, owner: &Owner) -> Vec<FilterSpec> {
        self.shared.state.lock().committed.owned(owner)
    }

    /// Verdict the committed filter set gives `packet`.
    pub fn classify(&self, packet: &Packet) -> Action {
        let state = self.shared.state.lock();
        classify(state.committed.filters.values().map(|f| &f.spec), packet)
    }

    pub fn stats(&self) -> EngineStats {
        self.shared.state.lock().stats
    }

    /// Fail the filter insert that follows `successful` more inserts.
    pub fn fail_add_after(&self, successful: usize) {
        self.shared.state.lock().faults.fail_add_after = Some(successful);
    }

    /// Fail the next commit.
    pub fn fail_next_commit(&self) {
        self.shared.state.lock().faults.fail_commit = true;
    }

    /// Take the transaction lock as another process would, until dropped.
    pub fn hold_lock(&self) -> LockHold {
        let holder = next_holder_id();
        let acquired = self
            .shared
            .lock
            .acquire(holder, Duration::ZERO)
            .is_ok();
        LockHold {
            lock: self.shared.lock.clone(),
            holder,
            acquired,
        }
    }

    /// Commit a filter that belongs to other software.
    pub fn install_foreign(&self, owner: &Owner, spec: FilterSpec) -> FilterId {
        let mut state = self.shared.state.lock();
        state.next_id += 1;
        let id = FilterId(state.next_id);
        let committed = &mut state.committed;
        committed.put_provider(&owner.provider);
        committed
            .sublayers
            .insert(owner.sublayer.key.clone(), owner.sublayer.clone());
        committed.put_filter(id, owner, &spec);
        id
    }
}

/// Foreign hold on the transaction lock.
#[derive(Debug)]
pub struct LockHold {
    lock: TransactionLock,
    holder: u64,
    acquired: bool,
}

impl LockHold {
    pub fn is_held(&self) -> bool {
        self.acquired
    }
}

impl Drop for LockHold {
    fn drop(&mut self) {
        if self.acquired {
            self.lock.release(self.holder);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{Layer, Weight};

    fn spec(name: &str) -> FilterSpec {
        FilterSpec::block(name, Layer::ConnectV4, Weight::BlockAll)
    }

    fn registered(engine: &mut MemoryEngine, owner: &Owner) {
        engine.register_provider(&owner.provider).unwrap();
        engine.register_sublayer(&owner.sublayer).unwrap();
    }

    #[test]
    fn mutations_need_a_transaction() {
        let mut engine = MemoryEngine::new();
        let owner = Owner::default();
        assert!(matches!(
            engine.register_provider(&owner.provider),
            Err(EngineError::SessionClosed)
        ));
        engine.open_session().unwrap();
        assert!(matches!(
            engine.register_provider(&owner.provider),
            Err(EngineError::NoTransaction)
        ));
    }

    #[test]
    fn staged_changes_invisible_until_commit() {
        let mut engine = MemoryEngine::new();
        let observer = engine.observer();
        let owner = Owner::default();
        engine.open_session().unwrap();
        engine.begin(LockTimeout::Default).unwrap();
        registered(&mut engine, &owner);
        engine.add_filter(&owner, &spec("a")).unwrap();
        assert!(observer.committed().filters.is_empty());
        engine.commit().unwrap();
        assert_eq!(observer.owned_filters(&owner), vec![spec("a")]);
    }

    #[test]
    fn abort_discards_staged_changes() {
        let mut engine = MemoryEngine::new();
        let observer = engine.observer();
        let owner = Owner::default();
        engine.open_session().unwrap();
        engine.begin(LockTimeout::Default).unwrap();
        registered(&mut engine, &owner);
        engine.add_filter(&owner, &spec("a")).unwrap();
        engine.abort().unwrap();
        assert_eq!(observer.committed(), ObjectStore::default());
        assert_eq!(observer.stats().aborts, 1);
    }

    #[test]
    fn filter_requires_registered_sublayer() {
        let mut engine = MemoryEngine::new();
        engine.open_session().unwrap();
        engine.begin(LockTimeout::Default).unwrap();
        let err = engine.add_filter(&Owner::default(), &spec("a")).unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn second_session_times_out_on_held_lock() {
        let mut first = MemoryEngine::new();
        let mut second = first.session();
        first.open_session().unwrap();
        second.open_session().unwrap();
        first.begin(LockTimeout::Default).unwrap();
        let err = second
            .begin(LockTimeout::After(Duration::from_millis(10)))
            .unwrap_err();
        assert!(matches!(err, EngineError::LockTimeout));
        first.abort().unwrap();
        second
            .begin(LockTimeout::After(Duration::from_millis(10)))
            .unwrap();
    }

    #[test]
    fn removing_owned_objects_spares_foreign_ones() {
        let mut engine = MemoryEngine::new();
        let observer = engine.observer();
        let ours = Owner::default();
        let theirs = Owner::new("other-provider", "other-sublayer");
        let foreign = observer.install_foreign(&theirs, spec("foreign"));

        engine.open_session().unwrap();
        engine.begin(LockTimeout::Default).unwrap();
        registered(&mut engine, &ours);
        engine.add_filter(&ours, &spec("ours")).unwrap();
        engine.commit().unwrap();

        engine.begin(LockTimeout::Default).unwrap();
        engine.remove_owned_objects(&ours).unwrap();
        engine.commit().unwrap();

        let store = observer.committed();
        assert!(!store.has_objects_of(&ours));
        assert!(store.filters.contains_key(&foreign));
        assert!(store.providers.contains_key("other-provider"));
    }

    #[test]
    fn injected_commit_failure_keeps_transaction_open() {
        let mut engine = MemoryEngine::new();
        let observer = engine.observer();
        let owner = Owner::default();
        engine.open_session().unwrap();
        engine.begin(LockTimeout::Default).unwrap();
        registered(&mut engine, &owner);
        observer.fail_next_commit();
        assert!(matches!(engine.commit(), Err(EngineError::Commit(_))));
        engine.abort().unwrap();
        assert!(observer.committed().providers.is_empty());
    }
}
