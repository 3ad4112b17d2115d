//! Lifecycle manager
//!
//! [`Firewall`] owns the engine session, the provider/sublayer registration
//! and the policy controller. Calls are serialized by an internal mutex;
//! the engine's transaction lock is the only place a call can wait.
//!
//! ```text
//! initialize ──────────────► None ─┐
//! initialize_blocked ──────► Blocked ◄──► Connecting ◄──► Connected
//!                              │  apply_* / reset from any state │
//! deinitialize(cleanup) ───► Uninitialized
//! ```

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::compiler::{self, Policy};
use crate::config::FirewallConfig;
use crate::controller::PolicyController;
use crate::engine::FilterEngine;
use crate::error::{PolicyError, Result};
use crate::transaction::TransactionCoordinator;
use crate::types::{CleanupPolicy, PingableHosts, PolicyState, Relay, Settings, TunnelContext};

/// An initialized firewall bound to one engine session.
pub struct Firewall<E: FilterEngine> {
    controller: Mutex<Option<PolicyController<E>>>,
}

impl<E: FilterEngine> Firewall<E> {
    /// Open a session and register provider and sublayer. No policy is
    /// installed; filters left by a previous run are removed in the same
    /// transaction, so the engine holds exactly what `None` describes.
    pub fn initialize(mut engine: E, config: &FirewallConfig) -> Result<Self> {
        let coordinator = coordinator_for(config);
        info!(
            provider = coordinator.owner().provider_key(),
            timeout = %coordinator.timeout(),
            "initializing firewall"
        );
        open(&mut engine)?;
        if let Err(e) = coordinator.register(&mut engine) {
            error!(error = %e, "registration failed");
            close_quietly(&mut engine);
            return Err(e);
        }
        Ok(Self::with_controller(PolicyController::new(
            engine,
            coordinator,
            PolicyState::None,
        )))
    }

    /// Open a session, register, and install the blocked policy in a single
    /// transaction.
    pub fn initialize_blocked(
        mut engine: E,
        config: &FirewallConfig,
        settings: &Settings,
    ) -> Result<Self> {
        let coordinator = coordinator_for(config);
        info!(
            provider = coordinator.owner().provider_key(),
            timeout = %coordinator.timeout(),
            ?settings,
            "initializing firewall with blocked policy"
        );
        let filters = compiler::compile_blocked(settings);
        open(&mut engine)?;
        if let Err(e) = coordinator.register_and_apply(&mut engine, &filters) {
            error!(error = %e, "blocked initialization failed");
            close_quietly(&mut engine);
            return Err(e);
        }
        info!(filters = filters.len(), "blocked policy active");
        Ok(Self::with_controller(PolicyController::new(
            engine,
            coordinator,
            PolicyState::Blocked,
        )))
    }

    fn with_controller(controller: PolicyController<E>) -> Self {
        Self {
            controller: Mutex::new(Some(controller)),
        }
    }

    pub fn state(&self) -> PolicyState {
        self.controller
            .lock()
            .as_ref()
            .map_or(PolicyState::Uninitialized, |ctl| ctl.state())
    }

    pub fn is_initialized(&self) -> bool {
        self.controller.lock().is_some()
    }

    pub fn apply(&self, policy: &Policy) -> Result<()> {
        self.with_initialized(|ctl| ctl.apply(policy))
    }

    pub fn apply_policy_connecting(
        &self,
        settings: &Settings,
        relay: &Relay,
        relay_client: &str,
        pingable_hosts: &PingableHosts,
    ) -> Result<()> {
        self.apply(&Policy::Connecting {
            settings: *settings,
            relay: relay.clone(),
            relay_client: relay_client.to_string(),
            pingable_hosts: pingable_hosts.clone(),
        })
    }

    pub fn apply_policy_connected(
        &self,
        settings: &Settings,
        relay: &Relay,
        relay_client: &str,
        tunnel: &TunnelContext,
    ) -> Result<()> {
        self.apply(&Policy::Connected {
            settings: *settings,
            relay: relay.clone(),
            relay_client: relay_client.to_string(),
            tunnel: tunnel.clone(),
        })
    }

    pub fn apply_policy_blocked(&self, settings: &Settings) -> Result<()> {
        self.apply(&Policy::Blocked {
            settings: *settings,
        })
    }

    pub fn reset(&self) -> Result<()> {
        self.with_initialized(|ctl| ctl.reset())
    }

    /// Tear down the instance.
    ///
    /// `ContinueBlocking` keeps the filters only while the blocked policy is
    /// active; any other state is reset. The instance is gone afterwards even
    /// when removal fails, so the error only reports that objects may remain.
    pub fn deinitialize(&self, cleanup: CleanupPolicy) -> Result<()> {
        let mut slot = self.controller.lock();
        let Some(mut ctl) = slot.take() else {
            warn!("deinitialize called on an uninitialized firewall");
            return Err(PolicyError::NotInitialized);
        };
        let state = ctl.state();
        info!(?cleanup, %state, "deinitializing firewall");

        let result = match cleanup {
            CleanupPolicy::ContinueBlocking if state == PolicyState::Blocked => {
                info!("leaving blocked policy in force");
                Ok(())
            }
            _ => {
                let coordinator = ctl.coordinator().clone();
                coordinator.remove_all(ctl.engine_mut())
            }
        };
        if let Err(e) = &result {
            error!(error = %e, "failed to remove firewall objects");
        }

        let mut engine = ctl.into_engine();
        close_quietly(&mut engine);
        result
    }

    fn with_initialized<T>(
        &self,
        f: impl FnOnce(&mut PolicyController<E>) -> Result<T>,
    ) -> Result<T> {
        let mut slot = self.controller.lock();
        match slot.as_mut() {
            Some(ctl) => f(ctl),
            None => {
                warn!("firewall is not initialized");
                Err(PolicyError::NotInitialized)
            }
        }
    }
}

fn coordinator_for(config: &FirewallConfig) -> TransactionCoordinator {
    TransactionCoordinator::new(config.owner(), config.lock_timeout())
}

fn open<E: FilterEngine>(engine: &mut E) -> Result<()> {
    engine.open_session().map_err(|e| {
        error!(error = %e, "could not open filter engine session");
        PolicyError::from(e)
    })
}

fn close_quietly<E: FilterEngine>(engine: &mut E) {
    if let Err(e) = engine.close_session() {
        warn!(error = %e, "failed to close filter engine session");
    }
}
