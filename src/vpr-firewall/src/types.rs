//! Caller-facing value types.
//!
//! These are built fresh for every call and dropped once the compiler has
//! turned them into filters.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Host exemptions that apply to every policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Permit outbound DHCP requests and inbound DHCP responses on all interfaces
    #[serde(default)]
    pub permit_dhcp: bool,
    /// Permit all traffic to and from private address ranges
    #[serde(default)]
    pub permit_lan: bool,
}

impl Settings {
    pub fn new(permit_dhcp: bool, permit_lan: bool) -> Self {
        Self {
            permit_dhcp,
            permit_lan,
        }
    }
}

/// Transport protocol used to reach the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Protocol {
    Tcp = 0,
    Udp = 1,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl TryFrom<u8> for Protocol {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Protocol::Tcp),
            1 => Ok(Protocol::Udp),
            other => Err(other),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!("unknown protocol: {other}")),
        }
    }
}

/// The VPN server endpoint that stays reachable while connecting/connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relay {
    /// Textual IP address, validated by the compiler
    pub address: String,
    pub port: u16,
    pub protocol: Protocol,
}

impl Relay {
    pub fn new(address: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        Self {
            address: address.into(),
            port,
            protocol,
        }
    }
}

/// Hosts that must answer ICMP echo while the tunnel is being negotiated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingableHosts {
    /// Restrict the exemption to this interface when set
    #[serde(default)]
    pub tunnel_interface_alias: Option<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
}

impl PingableHosts {
    pub fn new(hosts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            tunnel_interface_alias: None,
            hosts: hosts.into_iter().map(Into::into).collect(),
        }
    }

    pub fn on_interface(mut self, alias: impl Into<String>) -> Self {
        self.tunnel_interface_alias = Some(alias.into());
        self
    }
}

/// Tunnel parameters for the connected policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelContext {
    pub tunnel_interface_alias: String,
    #[serde(default)]
    pub dns_v4: Option<String>,
    #[serde(default)]
    pub dns_v6: Option<String>,
}

impl TunnelContext {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            tunnel_interface_alias: alias.into(),
            dns_v4: None,
            dns_v6: None,
        }
    }

    pub fn with_dns_v4(mut self, dns: impl Into<String>) -> Self {
        self.dns_v4 = Some(dns.into());
        self
    }

    pub fn with_dns_v6(mut self, dns: impl Into<String>) -> Self {
        self.dns_v6 = Some(dns.into());
        self
    }
}

/// Policies a caller can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    Blocked,
    Connecting,
    Connected,
}

impl PolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::Blocked => "blocked",
            PolicyKind::Connecting => "connecting",
            PolicyKind::Connected => "connected",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Controller state, including the two meta-states never requested directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyState {
    Uninitialized,
    /// Initialized, no policy installed
    None,
    Blocked,
    Connecting,
    Connected,
}

impl PolicyState {
    pub fn is_initialized(&self) -> bool {
        !matches!(self, PolicyState::Uninitialized)
    }

    /// The installed policy, if any.
    pub fn policy(&self) -> Option<PolicyKind> {
        match self {
            PolicyState::Blocked => Some(PolicyKind::Blocked),
            PolicyState::Connecting => Some(PolicyKind::Connecting),
            PolicyState::Connected => Some(PolicyKind::Connected),
            PolicyState::Uninitialized | PolicyState::None => None,
        }
    }
}

impl From<PolicyKind> for PolicyState {
    fn from(kind: PolicyKind) -> Self {
        match kind {
            PolicyKind::Blocked => PolicyState::Blocked,
            PolicyKind::Connecting => PolicyState::Connecting,
            PolicyKind::Connected => PolicyState::Connected,
        }
    }
}

impl fmt::Display for PolicyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyState::Uninitialized => f.write_str("uninitialized"),
            PolicyState::None => f.write_str("none"),
            PolicyState::Blocked => f.write_str("blocked"),
            PolicyState::Connecting => f.write_str("connecting"),
            PolicyState::Connected => f.write_str("connected"),
        }
    }
}

/// What happens to installed filters on deinitialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(C)]
pub enum CleanupPolicy {
    /// Keep blocking if the blocked policy is active, otherwise reset
    ContinueBlocking = 0,
    /// Remove every object this engine registered
    ResetFirewall = 1,
}

impl TryFrom<i32> for CleanupPolicy {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CleanupPolicy::ContinueBlocking),
            1 => Ok(CleanupPolicy::ResetFirewall),
            other => Err(other),
        }
    }
}

/// Outcome of a policy call as seen across the ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub enum PolicyStatus {
    Success = 0,
    GeneralFailure = 1,
    LockTimeout = 2,
}

impl<T> From<&crate::Result<T>> for PolicyStatus {
    fn from(result: &crate::Result<T>) -> Self {
        match result {
            Ok(_) => PolicyStatus::Success,
            Err(e) => e.status(),
        }
    }
}
