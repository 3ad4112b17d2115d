//! # VPR Firewall
//!
//! Leak-free firewall policy engine for the VPR client. Turns the connection
//! lifecycle into packet filter rules and swaps them atomically.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Firewall (lifecycle)   init / deinit / cleanup policy   │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │  PolicyController   None→Blocked→Connecting→...    │  │
//! │  └──────────┬─────────────────────────┬───────────────┘  │
//! │             │                         │                  │
//! │  ┌──────────▼─────────┐   ┌───────────▼──────────────┐   │
//! │  │  compiler (pure)   │   │  TransactionCoordinator  │   │
//! │  │  policy → filters  │   │  lock→clear→add→commit   │   │
//! │  └────────────────────┘   └───────────┬──────────────┘   │
//! └───────────────────────────────────────┼──────────────────┘
//!                                         │ FilterEngine
//!                      ┌──────────────────┴─────────────┐
//!                      │ MemoryEngine    │  NftEngine   │
//!                      └────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - **Atomic**: every transition is one engine transaction
//! - **Fail-closed**: a failed call leaves the previous filters enforced
//! - **Scoped**: cleanup touches only objects tagged with our owner identity

pub mod compiler;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod filter;
pub mod lifecycle;
pub mod memory;
pub mod nft;
pub mod transaction;
pub mod types;

pub use compiler::{compile, Policy};
pub use config::{FirewallConfig, NftConfig};
pub use controller::PolicyController;
pub use engine::{FilterEngine, FilterId, LockTimeout, ObjectStore, Owner};
pub use error::{EngineError, PolicyError, Result};
pub use filter::{Action, Condition, FilterSpec, Layer, Packet, Weight};
pub use lifecycle::Firewall;
pub use memory::{MemoryEngine, MemoryObserver};
pub use nft::{CommandRunner, DryRunRunner, NftEngine, SystemRunner};
pub use transaction::TransactionCoordinator;
pub use types::{
    CleanupPolicy, PingableHosts, PolicyKind, PolicyState, PolicyStatus, Protocol, Relay,
    Settings, TunnelContext,
};
