//! Policy state controller
//!
//! Tracks which policy is enforced and pushes every transition through the
//! [`TransactionCoordinator`]. The state label changes only after a commit,
//! so it always names the filter set the engine actually holds.

use tracing::{info, warn};

use crate::compiler::{self, Policy};
use crate::engine::FilterEngine;
use crate::error::Result;
use crate::transaction::TransactionCoordinator;
use crate::types::PolicyState;

pub struct PolicyController<E: FilterEngine> {
    engine: E,
    coordinator: TransactionCoordinator,
    state: PolicyState,
}

impl<E: FilterEngine> PolicyController<E> {
    pub(crate) fn new(engine: E, coordinator: TransactionCoordinator, state: PolicyState) -> Self {
        Self {
            engine,
            coordinator,
            state,
        }
    }

    pub fn state(&self) -> PolicyState {
        self.state
    }

    pub fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }

    /// Any initialized state may move to any policy.
    pub fn apply(&mut self, policy: &Policy) -> Result<()> {
        let target = policy.kind();
        info!(from = %self.state, to = %target, "applying policy");

        let filters = compiler::compile(policy).map_err(|e| {
            warn!(policy = %target, error = %e, "policy rejected");
            e
        })?;

        match self.coordinator.apply(&mut self.engine, &filters) {
            Ok(()) => {
                self.state = target.into();
                info!(policy = %target, filters = filters.len(), "policy applied");
                Ok(())
            }
            Err(e) => {
                warn!(
                    policy = %target,
                    current = %self.state,
                    error = %e,
                    "policy not applied, previous policy remains in force"
                );
                Err(e)
            }
        }
    }

    /// Remove every owned filter; the provider and sublayer stay registered.
    pub fn reset(&mut self) -> Result<()> {
        info!(from = %self.state, "resetting firewall");
        match self.coordinator.clear(&mut self.engine) {
            Ok(()) => {
                self.state = PolicyState::None;
                Ok(())
            }
            Err(e) => {
                warn!(current = %self.state, error = %e, "reset failed");
                Err(e)
            }
        }
    }

    pub(crate) fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub(crate) fn into_engine(self) -> E {
        self.engine
    }
}
