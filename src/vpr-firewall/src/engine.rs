//! Filter engine capability set
//!
//! The kernel filter subsystem is an external engine. This module defines the
//! narrow set of operations the policy engine needs from it: sessions,
//! all-or-nothing transactions, provider/sublayer registration, and filter
//! add/remove scoped to an [`Owner`].
//!
//! Mutations are only legal between [`FilterEngine::begin`] and
//! [`FilterEngine::commit`]/[`FilterEngine::abort`]. Observers of the engine
//! never see a half-applied transaction.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::EngineError;
use crate::filter::FilterSpec;

pub const DEFAULT_PROVIDER_KEY: &str = "vpr-firewall-provider";
pub const DEFAULT_SUBLAYER_KEY: &str = "vpr-firewall-sublayer";

/// How long `begin` may wait for the transaction lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockTimeout {
    /// Let the engine decide
    #[default]
    Default,
    After(Duration),
}

impl LockTimeout {
    /// ABI convention: seconds, `0` selects the engine default.
    pub fn from_secs(secs: u32) -> Self {
        match secs {
            0 => LockTimeout::Default,
            n => LockTimeout::After(Duration::from_secs(u64::from(n))),
        }
    }

    pub fn resolve(&self, engine_default: Duration) -> Duration {
        match self {
            LockTimeout::Default => engine_default,
            LockTimeout::After(d) => *d,
        }
    }
}

impl fmt::Display for LockTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockTimeout::Default => f.write_str("default"),
            LockTimeout::After(d) => write!(f, "{}ms", d.as_millis()),
        }
    }
}

/// Engine-assigned filter identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FilterId(pub u64);

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Ownership scope for everything this engine registers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Provider {
    pub key: String,
    pub name: String,
}

/// Sublayer grouping our filters under a provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sublayer {
    pub key: String,
    pub name: String,
    pub provider_key: String,
    /// Priority of the sublayer relative to other software's sublayers
    pub weight: u16,
}

/// Provider + sublayer identity every filter is tagged with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Owner {
    pub provider: Provider,
    pub sublayer: Sublayer,
}

impl Owner {
    pub fn new(provider_key: impl Into<String>, sublayer_key: impl Into<String>) -> Self {
        let provider_key = provider_key.into();
        Self {
            provider: Provider {
                key: provider_key.clone(),
                name: "VPR firewall".to_string(),
            },
            sublayer: Sublayer {
                key: sublayer_key.into(),
                name: "VPR firewall filters".to_string(),
                provider_key,
                weight: u16::MAX,
            },
        }
    }

    pub fn provider_key(&self) -> &str {
        &self.provider.key
    }

    pub fn sublayer_key(&self) -> &str {
        &self.sublayer.key
    }
}

impl Default for Owner {
    fn default() -> Self {
        Owner::new(DEFAULT_PROVIDER_KEY, DEFAULT_SUBLAYER_KEY)
    }
}

/// A filter as stored by an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledFilter {
    pub provider_key: String,
    pub sublayer_key: String,
    pub spec: FilterSpec,
}

impl InstalledFilter {
    pub fn is_owned_by(&self, owner: &Owner) -> bool {
        self.provider_key == owner.provider_key() && self.sublayer_key == owner.sublayer_key()
    }
}

/// Every object an engine knows about. Engines stage a copy per transaction
/// and swap it in on commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectStore {
    pub providers: BTreeMap<String, Provider>,
    pub sublayers: BTreeMap<String, Sublayer>,
    pub filters: BTreeMap<FilterId, InstalledFilter>,
}

impl ObjectStore {
    /// Specs of the filters tagged with `owner`, in registration order.
    pub fn owned(&self, owner: &Owner) -> Vec<FilterSpec> {
        self.filters
            .values()
            .filter(|f| f.is_owned_by(owner))
            .map(|f| f.spec.clone())
            .collect()
    }

    pub fn owned_ids(&self, owner: &Owner) -> Vec<FilterId> {
        self.filters
            .iter()
            .filter(|(_, f)| f.is_owned_by(owner))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Whether anything at all belongs to `owner`.
    pub fn has_objects_of(&self, owner: &Owner) -> bool {
        self.providers.contains_key(owner.provider_key())
            || self.sublayers.contains_key(owner.sublayer_key())
            || self.filters.values().any(|f| f.is_owned_by(owner))
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty() && self.sublayers.is_empty() && self.filters.is_empty()
    }

    pub(crate) fn put_provider(&mut self, provider: &Provider) {
        self.providers.insert(provider.key.clone(), provider.clone());
    }

    pub(crate) fn put_sublayer(&mut self, sublayer: &Sublayer) -> Result<(), EngineError> {
        if !self.providers.contains_key(&sublayer.provider_key) {
            return Err(EngineError::NotFound(format!(
                "provider {}",
                sublayer.provider_key
            )));
        }
        self.sublayers.insert(sublayer.key.clone(), sublayer.clone());
        Ok(())
    }

    /// Filters can only be added under a registered sublayer.
    pub(crate) fn ensure_sublayer(&self, owner: &Owner) -> Result<(), EngineError> {
        if !self.sublayers.contains_key(owner.sublayer_key()) {
            return Err(EngineError::NotFound(format!(
                "sublayer {}",
                owner.sublayer_key()
            )));
        }
        Ok(())
    }

    pub(crate) fn put_filter(&mut self, id: FilterId, owner: &Owner, spec: &FilterSpec) {
        self.filters.insert(
            id,
            InstalledFilter {
                provider_key: owner.provider_key().to_string(),
                sublayer_key: owner.sublayer_key().to_string(),
                spec: spec.clone(),
            },
        );
    }

    pub(crate) fn take_filter(&mut self, id: FilterId) -> Result<(), EngineError> {
        self.filters
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(format!("filter {id}")))
    }

    /// Drop filters, sublayer and provider of `owner`; foreign objects stay.
    pub(crate) fn remove_owned(&mut self, owner: &Owner) {
        self.filters.retain(|_, f| !f.is_owned_by(owner));
        self.sublayers.remove(owner.sublayer_key());
        self.providers.remove(owner.provider_key());
    }
}

/// Capability set of a kernel packet filter.
pub trait FilterEngine: Send {
    /// Open the session; later transactions run on it.
    fn open_session(&mut self) -> Result<(), EngineError>;

    /// Close the session. Committed objects stay in place.
    fn close_session(&mut self) -> Result<(), EngineError>;

    fn is_open(&self) -> bool;

    /// Acquire the transaction lock (bounded by `timeout`) and start a transaction.
    fn begin(&mut self, timeout: LockTimeout) -> Result<(), EngineError>;

    /// Atomically publish every mutation since `begin` and release the lock.
    fn commit(&mut self) -> Result<(), EngineError>;

    /// Discard every mutation since `begin` and release the lock.
    fn abort(&mut self) -> Result<(), EngineError>;

    /// Register the provider; an identical existing provider is accepted.
    fn register_provider(&mut self, provider: &Provider) -> Result<(), EngineError>;

    /// Register the sublayer; an identical existing sublayer is accepted.
    fn register_sublayer(&mut self, sublayer: &Sublayer) -> Result<(), EngineError>;

    fn add_filter(&mut self, owner: &Owner, filter: &FilterSpec) -> Result<FilterId, EngineError>;

    fn remove_filter(&mut self, id: FilterId) -> Result<(), EngineError>;

    /// Filters tagged with `owner`, as seen by the current transaction.
    fn owned_filters(&self, owner: &Owner) -> Result<Vec<FilterId>, EngineError>;

    /// Remove all filters, the sublayer and the provider belonging to `owner`.
    fn remove_owned_objects(&mut self, owner: &Owner) -> Result<(), EngineError>;
}

impl<E: FilterEngine + ?Sized> FilterEngine for Box<E> {
    fn open_session(&mut self) -> Result<(), EngineError> {
        (**self).open_session()
    }

    fn close_session(&mut self) -> Result<(), EngineError> {
        (**self).close_session()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn begin(&mut self, timeout: LockTimeout) -> Result<(), EngineError> {
        (**self).begin(timeout)
    }

    fn commit(&mut self) -> Result<(), EngineError> {
        (**self).commit()
    }

    fn abort(&mut self) -> Result<(), EngineError> {
        (**self).abort()
    }

    fn register_provider(&mut self, provider: &Provider) -> Result<(), EngineError> {
        (**self).register_provider(provider)
    }

    fn register_sublayer(&mut self, sublayer: &Sublayer) -> Result<(), EngineError> {
        (**self).register_sublayer(sublayer)
    }

    fn add_filter(&mut self, owner: &Owner, filter: &FilterSpec) -> Result<FilterId, EngineError> {
        (**self).add_filter(owner, filter)
    }

    fn remove_filter(&mut self, id: FilterId) -> Result<(), EngineError> {
        (**self).remove_filter(id)
    }

    fn owned_filters(&self, owner: &Owner) -> Result<Vec<FilterId>, EngineError> {
        (**self).owned_filters(owner)
    }

    fn remove_owned_objects(&mut self, owner: &Owner) -> Result<(), EngineError> {
        (**self).remove_owned_objects(owner)
    }
}

static NEXT_HOLDER: AtomicU64 = AtomicU64::new(1);

/// Unique identity for a lock holder (one per session).
pub fn next_holder_id() -> u64 {
    NEXT_HOLDER.fetch_add(1, Ordering::Relaxed)
}

/// Exclusive transaction lock with bounded waiting, shared by every session
/// of one engine.
#[derive(Debug, Clone, Default)]
pub struct TransactionLock {
    inner: Arc<(Mutex<Option<u64>>, Condvar)>,
}

impl TransactionLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `timeout` for the lock.
    pub fn acquire(&self, holder: u64, timeout: Duration) -> Result<(), EngineError> {
        let (lock, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut current = lock.lock();
        while let Some(other) = *current {
            if other == holder {
                return Err(EngineError::TransactionActive);
            }
            debug!(holder, other, "waiting for transaction lock");
            if cvar.wait_until(&mut current, deadline).timed_out() && current.is_some() {
                return Err(EngineError::LockTimeout);
            }
        }
        *current = Some(holder);
        Ok(())
    }

    /// Release the lock if `holder` owns it.
    pub fn release(&self, holder: u64) {
        let (lock, cvar) = &*self.inner;
        let mut current = lock.lock();
        if *current == Some(holder) {
            *current = None;
            cvar.notify_all();
        }
    }

    pub fn holder(&self) -> Option<u64> {
        *self.inner.0.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn lock_timeout_from_secs() {
        assert_eq!(LockTimeout::from_secs(0), LockTimeout::Default);
        assert_eq!(
            LockTimeout::from_secs(3),
            LockTimeout::After(Duration::from_secs(3))
        );
        assert_eq!(
            LockTimeout::Default.resolve(Duration::from_millis(10)),
            Duration::from_millis(10)
        );
    }

    #[test]
    fn lock_times_out_while_held() {
        let lock = TransactionLock::new();
        lock.acquire(1, Duration::ZERO).unwrap();
        let err = lock.acquire(2, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, EngineError::LockTimeout));
        assert_eq!(lock.holder(), Some(1));
    }

    #[test]
    fn reentrant_acquire_is_an_error() {
        let lock = TransactionLock::new();
        lock.acquire(1, Duration::ZERO).unwrap();
        assert!(matches!(
            lock.acquire(1, Duration::ZERO),
            Err(EngineError::TransactionActive)
        ));
    }

    #[test]
    fn waiter_gets_lock_after_release() {
        let lock = TransactionLock::new();
        lock.acquire(1, Duration::ZERO).unwrap();
        let waiter = {
            let lock = lock.clone();
            thread::spawn(move || lock.acquire(2, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        lock.release(1);
        waiter.join().unwrap().unwrap();
        assert_eq!(lock.holder(), Some(2));
    }

    #[test]
    fn release_by_non_holder_is_ignored() {
        let lock = TransactionLock::new();
        lock.acquire(1, Duration::ZERO).unwrap();
        lock.release(2);
        assert_eq!(lock.holder(), Some(1));
    }
}
