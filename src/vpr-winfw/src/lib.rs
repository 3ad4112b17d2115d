//! # VPR WinFw ABI
//!
//! Fixed C ABI over the firewall policy engine, see `include/winfw.h`.
//!
//! The signatures carry no handle, so the library keeps one instance per
//! process behind a mutex. Every entry point:
//!
//! 1. copies its arguments into owned, validated values
//! 2. runs with the instance's log dispatcher as the default
//! 3. converts the outcome into `bool` / [`PolicyStatus`]
//!
//! Panics never cross the boundary; they are reported as failures.
//!
//! Set `VPR_FIREWALL_CONFIG` to a JSON file to override the engine
//! configuration; the `timeout` argument always wins over the file.

#![allow(non_snake_case)]

pub mod abi;
pub mod logging;

use parking_lot::Mutex;
use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use tracing::{debug, error, info, Dispatch};

use abi::{WChar, WinFwPingableHosts, WinFwRelay, WinFwSettings};
use logging::LogSink;
use vpr_firewall::{
    CleanupPolicy, FilterEngine, Firewall, FirewallConfig, PolicyStatus, TunnelContext,
};

type BoxedEngine = Box<dyn FilterEngine>;

/// Environment variable naming an optional JSON config file
pub const CONFIG_ENV: &str = "VPR_FIREWALL_CONFIG";

struct Instance {
    firewall: Firewall<BoxedEngine>,
    dispatch: Dispatch,
}

static INSTANCE: Mutex<Option<Instance>> = Mutex::new(None);

#[cfg(test)]
static TEST_ENGINE: Mutex<Option<vpr_firewall::MemoryEngine>> = Mutex::new(None);

fn platform_engine(config: &FirewallConfig) -> Option<BoxedEngine> {
    #[cfg(test)]
    if let Some(engine) = TEST_ENGINE.lock().take() {
        return Some(Box::new(engine));
    }

    #[cfg(target_os = "linux")]
    return Some(Box::new(vpr_firewall::NftEngine::system(config.nft.clone())));

    #[cfg(not(target_os = "linux"))]
    {
        let _ = config;
        None
    }
}

fn load_config(timeout_secs: u32) -> vpr_firewall::Result<FirewallConfig> {
    let config = match std::env::var_os(CONFIG_ENV) {
        Some(path) => {
            info!(path = %Path::new(&path).display(), "loading firewall config");
            FirewallConfig::load(Path::new(&path))?
        }
        None => FirewallConfig::default(),
    };
    Ok(config.with_lock_timeout_secs(timeout_secs))
}

/// Run `f`, turning a panic into `fallback`.
fn guard<T>(fallback: T, f: impl FnOnce() -> T) -> T {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or(fallback)
}

fn initialize(
    op: &'static str,
    timeout_secs: u32,
    sink: LogSink,
    ctx: *mut c_void,
    init: impl FnOnce(BoxedEngine, &FirewallConfig) -> vpr_firewall::Result<Firewall<BoxedEngine>>,
) -> bool {
    let dispatch = logging::dispatch(sink, ctx);
    guard(false, || {
        tracing::dispatcher::with_default(&dispatch, || {
            let mut slot = INSTANCE.lock();
            if slot.is_some() {
                error!(op, "firewall is already initialized");
                return false;
            }
            let config = match load_config(timeout_secs) {
                Ok(config) => config,
                Err(e) => {
                    error!(op, error = %e, "invalid firewall configuration");
                    return false;
                }
            };
            let Some(engine) = platform_engine(&config) else {
                error!(op, "no filter engine available on this platform");
                return false;
            };
            match init(engine, &config) {
                Ok(firewall) => {
                    info!(op, "firewall initialized");
                    *slot = Some(Instance {
                        firewall,
                        dispatch: dispatch.clone(),
                    });
                    true
                }
                Err(e) => {
                    error!(op, error = %e, "initialization failed");
                    false
                }
            }
        })
    })
}

/// Run `f` against the live instance under its log dispatcher.
fn with_instance(
    op: &'static str,
    f: impl FnOnce(&Firewall<BoxedEngine>) -> vpr_firewall::Result<()>,
) -> PolicyStatus {
    guard(PolicyStatus::GeneralFailure, || {
        let slot = INSTANCE.lock();
        let Some(instance) = slot.as_ref() else {
            return PolicyStatus::GeneralFailure;
        };
        tracing::dispatcher::with_default(&instance.dispatch, || {
            let result = f(&instance.firewall);
            match &result {
                Ok(()) => debug!(op, "call succeeded"),
                Err(e) => error!(op, error = %e, "call failed"),
            }
            PolicyStatus::from(&result)
        })
    })
}

/// Initialize with no policy installed.
///
/// # Safety
/// `log_sink`, if non-null, must stay callable with `log_context` from any
/// thread until [`WinFw_Deinitialize`] returns.
#[no_mangle]
pub unsafe extern "system" fn WinFw_Initialize(
    timeout: u32,
    log_sink: LogSink,
    log_context: *mut c_void,
) -> bool {
    initialize("Initialize", timeout, log_sink, log_context, |engine, config| {
        Firewall::initialize(engine, config)
    })
}

/// Initialize and apply the blocked policy in the same transaction.
///
/// # Safety
/// `settings` must be null or valid for reads; `log_sink` as for
/// [`WinFw_Initialize`].
#[no_mangle]
pub unsafe extern "system" fn WinFw_InitializeBlocked(
    timeout: u32,
    settings: *const WinFwSettings,
    log_sink: LogSink,
    log_context: *mut c_void,
) -> bool {
    initialize(
        "InitializeBlocked",
        timeout,
        log_sink,
        log_context,
        |engine, config| {
            let settings = unsafe { abi::read_settings(settings) }?;
            Firewall::initialize_blocked(engine, config, &settings)
        },
    )
}

/// Tear down the instance according to `cleanup_policy` (0 continue
/// blocking, 1 reset firewall).
///
/// # Safety
/// Always safe to call; `unsafe` only for ABI symmetry.
#[no_mangle]
pub unsafe extern "system" fn WinFw_Deinitialize(cleanup_policy: i32) -> bool {
    guard(false, || {
        let mut slot = INSTANCE.lock();
        let Some(instance) = slot.as_ref() else {
            return false;
        };
        let dispatch = instance.dispatch.clone();
        tracing::dispatcher::with_default(&dispatch, || {
            let cleanup = match CleanupPolicy::try_from(cleanup_policy) {
                Ok(cleanup) => cleanup,
                Err(value) => {
                    error!(value, "unknown cleanup policy");
                    return false;
                }
            };
            let Some(instance) = slot.take() else {
                return false;
            };
            match instance.firewall.deinitialize(cleanup) {
                Ok(()) => {
                    info!(?cleanup, "firewall deinitialized");
                    true
                }
                Err(e) => {
                    error!(error = %e, "deinitialization left objects behind");
                    false
                }
            }
        })
    })
}

/// # Safety
/// Every pointer must be null or valid for reads as documented in
/// `winfw.h`; strings must be NUL-terminated.
#[no_mangle]
pub unsafe extern "system" fn WinFw_ApplyPolicyConnecting(
    settings: *const WinFwSettings,
    relay: *const WinFwRelay,
    relay_client: *const WChar,
    pingable_hosts: *const WinFwPingableHosts,
) -> PolicyStatus {
    with_instance("ApplyPolicyConnecting", |fw| {
        let (settings, relay, relay_client, pingable_hosts) = unsafe {
            (
                abi::read_settings(settings)?,
                abi::read_relay(relay)?,
                abi::read_wide("relay client", relay_client)?,
                abi::read_pingable_hosts(pingable_hosts)?,
            )
        };
        fw.apply_policy_connecting(&settings, &relay, &relay_client, &pingable_hosts)
    })
}

/// # Safety
/// Every pointer must be null or valid for reads as documented in
/// `winfw.h`; strings must be NUL-terminated. `v4_dns` and `v6_dns` may be
/// null.
#[no_mangle]
pub unsafe extern "system" fn WinFw_ApplyPolicyConnected(
    settings: *const WinFwSettings,
    relay: *const WinFwRelay,
    relay_client: *const WChar,
    tunnel_interface_alias: *const WChar,
    v4_dns: *const WChar,
    v6_dns: *const WChar,
) -> PolicyStatus {
    with_instance("ApplyPolicyConnected", |fw| {
        let (settings, relay, relay_client, alias, dns_v4, dns_v6) = unsafe {
            (
                abi::read_settings(settings)?,
                abi::read_relay(relay)?,
                abi::read_wide("relay client", relay_client)?,
                abi::read_wide("tunnel interface alias", tunnel_interface_alias)?,
                abi::read_optional_wide("IPv4 DNS server", v4_dns)?,
                abi::read_optional_wide("IPv6 DNS server", v6_dns)?,
            )
        };
        let mut tunnel = TunnelContext::new(alias);
        tunnel.dns_v4 = dns_v4;
        tunnel.dns_v6 = dns_v6;
        fw.apply_policy_connected(&settings, &relay, &relay_client, &tunnel)
    })
}

/// # Safety
/// `settings` must be null or valid for reads.
#[no_mangle]
pub unsafe extern "system" fn WinFw_ApplyPolicyBlocked(
    settings: *const WinFwSettings,
) -> PolicyStatus {
    with_instance("ApplyPolicyBlocked", |fw| {
        let settings = unsafe { abi::read_settings(settings) }?;
        fw.apply_policy_blocked(&settings)
    })
}

/// Remove every filter; provider and sublayer stay registered.
///
/// # Safety
/// Always safe to call; `unsafe` only for ABI symmetry.
#[no_mangle]
pub unsafe extern "system" fn WinFw_Reset() -> PolicyStatus {
    with_instance("Reset", |fw| fw.reset())
}
