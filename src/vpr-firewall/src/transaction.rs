//! Transaction coordinator
//!
//! The only writer of filter engine state. Every update runs inside one
//! engine transaction:
//!
//! 1. wait for the transaction lock (bounded by the lock timeout)
//! 2. remove the filters this engine owns
//! 3. install the new filter set
//! 4. commit, or abort on the first failure
//!
//! A lock timeout happens before anything is staged, so it never changes
//! state. Any failure after `begin` aborts, leaving the previous filters in
//! force.

use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::engine::{FilterEngine, LockTimeout, Owner};
use crate::error::{PolicyError, Result};
use crate::filter::FilterSpec;

/// An open engine transaction. Aborts on drop unless committed.
pub struct Transaction<'e, E: FilterEngine + ?Sized> {
    engine: &'e mut E,
    finished: bool,
}

impl<'e, E: FilterEngine + ?Sized> Transaction<'e, E> {
    pub fn begin(engine: &'e mut E, timeout: LockTimeout) -> Result<Self> {
        let started = Instant::now();
        engine.begin(timeout).map_err(|e| {
            warn!(%timeout, error = %e, "could not start transaction");
            PolicyError::from(e)
        })?;
        debug!(
            waited_ms = started.elapsed().as_millis() as u64,
            "transaction lock acquired"
        );
        Ok(Self {
            engine,
            finished: false,
        })
    }

    pub fn engine(&mut self) -> &mut E {
        self.engine
    }

    pub fn commit(mut self) -> Result<()> {
        self.engine.commit()?;
        self.finished = true;
        Ok(())
    }

    pub fn abort(mut self) {
        self.abort_in_place();
    }

    fn abort_in_place(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        match self.engine.abort() {
            Ok(()) => debug!("transaction aborted"),
            Err(e) => error!(error = %e, "failed to abort transaction"),
        }
    }
}

impl<E: FilterEngine + ?Sized> Drop for Transaction<'_, E> {
    fn drop(&mut self) {
        self.abort_in_place();
    }
}

/// Runs atomic updates on behalf of one owner.
#[derive(Debug, Clone)]
pub struct TransactionCoordinator {
    owner: Owner,
    timeout: LockTimeout,
}

impl TransactionCoordinator {
    pub fn new(owner: Owner, timeout: LockTimeout) -> Self {
        Self { owner, timeout }
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    pub fn timeout(&self) -> LockTimeout {
        self.timeout
    }

    /// Run `f` inside one transaction; commit on `Ok`, abort on `Err`.
    pub fn execute<E, T, F>(&self, engine: &mut E, label: &str, f: F) -> Result<T>
    where
        E: FilterEngine + ?Sized,
        F: FnOnce(&mut E, &Owner) -> Result<T>,
    {
        let mut txn = Transaction::begin(engine, self.timeout)?;
        let value = match f(txn.engine(), &self.owner) {
            Ok(value) => value,
            Err(e) => {
                warn!(operation = label, error = %e, "aborting transaction");
                txn.abort();
                return Err(e);
            }
        };
        txn.commit().map_err(|e| {
            warn!(operation = label, error = %e, "commit failed, transaction aborted");
            e
        })?;
        Ok(value)
    }

    /// Register provider and sublayer, dropping filters a previous run left
    /// under the same owner so that nothing stays enforced.
    pub fn register<E: FilterEngine + ?Sized>(&self, engine: &mut E) -> Result<()> {
        let removed = self.execute(engine, "register", |engine, owner| {
            register(engine, owner)?;
            clear_owned(engine, owner)
        })?;
        if removed > 0 {
            info!(removed, "stale filters from a previous run removed");
        }
        Ok(())
    }

    /// Replace whatever this owner has installed with `filters`.
    pub fn apply<E: FilterEngine + ?Sized>(
        &self,
        engine: &mut E,
        filters: &[FilterSpec],
    ) -> Result<()> {
        self.execute(engine, "apply", |engine, owner| {
            replace_owned(engine, owner, filters)
        })?;
        info!(filters = filters.len(), "filter set committed");
        Ok(())
    }

    /// Register and install `filters` in the same transaction.
    pub fn register_and_apply<E: FilterEngine + ?Sized>(
        &self,
        engine: &mut E,
        filters: &[FilterSpec],
    ) -> Result<()> {
        self.execute(engine, "register+apply", |engine, owner| {
            register(engine, owner)?;
            replace_owned(engine, owner, filters)
        })?;
        info!(filters = filters.len(), "registered and filter set committed");
        Ok(())
    }

    /// Remove every filter this owner installed; provider and sublayer stay.
    pub fn clear<E: FilterEngine + ?Sized>(&self, engine: &mut E) -> Result<()> {
        let removed = self.execute(engine, "clear", |engine, owner| clear_owned(engine, owner))?;
        info!(removed, "owned filters removed");
        Ok(())
    }

    /// Remove filters, sublayer and provider.
    pub fn remove_all<E: FilterEngine + ?Sized>(&self, engine: &mut E) -> Result<()> {
        self.execute(engine, "remove-all", |engine, owner| {
            engine.remove_owned_objects(owner).map_err(PolicyError::from)
        })?;
        info!("all owned objects removed");
        Ok(())
    }
}

fn register<E: FilterEngine + ?Sized>(engine: &mut E, owner: &Owner) -> Result<()> {
    engine.register_provider(&owner.provider)?;
    engine.register_sublayer(&owner.sublayer)?;
    debug!(
        provider = owner.provider_key(),
        sublayer = owner.sublayer_key(),
        "provider and sublayer registered"
    );
    Ok(())
}

fn clear_owned<E: FilterEngine + ?Sized>(engine: &mut E, owner: &Owner) -> Result<usize> {
    let ids = engine.owned_filters(owner)?;
    for id in &ids {
        engine.remove_filter(*id)?;
    }
    Ok(ids.len())
}

fn replace_owned<E: FilterEngine + ?Sized>(
    engine: &mut E,
    owner: &Owner,
    filters: &[FilterSpec],
) -> Result<()> {
    let removed = clear_owned(engine, owner)?;
    debug!(removed, "stale filters removed");
    for filter in filters {
        engine.add_filter(owner, filter).map_err(|e| {
            warn!(filter = %filter.name, error = %e, "filter rejected");
            PolicyError::from(e)
        })?;
    }
    Ok(())
}
