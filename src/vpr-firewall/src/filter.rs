//! Abstract filter specifications
//!
//! A [`FilterSpec`] is a conjunction of [`Condition`]s evaluated at a
//! [`Layer`], carrying an [`Action`] and a [`Weight`]. Within our sublayer the
//! heaviest matching filter decides; on equal weight a block wins.
//!
//! [`classify`] evaluates a sample [`Packet`] against a filter set with these
//! rules. Engines that cannot express weights directly (nftables) order rules
//! with [`evaluation_order`] so first-match gives the same answer.

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::net::IpAddr;

use crate::types::Protocol;

/// Traffic direction as seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
}

/// IP version a layer applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }
}

/// Filtering layer: connection authorization (outbound) or receive/accept
/// authorization (inbound), per IP version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    ConnectV4,
    ConnectV6,
    RecvAcceptV4,
    RecvAcceptV6,
}

impl Layer {
    pub const ALL: [Layer; 4] = [
        Layer::ConnectV4,
        Layer::ConnectV6,
        Layer::RecvAcceptV4,
        Layer::RecvAcceptV6,
    ];

    pub fn new(direction: Direction, family: IpFamily) -> Self {
        match (direction, family) {
            (Direction::Outbound, IpFamily::V4) => Layer::ConnectV4,
            (Direction::Outbound, IpFamily::V6) => Layer::ConnectV6,
            (Direction::Inbound, IpFamily::V4) => Layer::RecvAcceptV4,
            (Direction::Inbound, IpFamily::V6) => Layer::RecvAcceptV6,
        }
    }

    /// Outbound layer for the family of `addr`.
    pub fn connect_for(addr: &IpAddr) -> Self {
        Layer::new(Direction::Outbound, IpFamily::of(addr))
    }

    /// Inbound layer for the family of `addr`.
    pub fn recv_for(addr: &IpAddr) -> Self {
        Layer::new(Direction::Inbound, IpFamily::of(addr))
    }

    pub fn direction(&self) -> Direction {
        match self {
            Layer::ConnectV4 | Layer::ConnectV6 => Direction::Outbound,
            Layer::RecvAcceptV4 | Layer::RecvAcceptV6 => Direction::Inbound,
        }
    }

    pub fn family(&self) -> IpFamily {
        match self {
            Layer::ConnectV4 | Layer::RecvAcceptV4 => IpFamily::V4,
            Layer::ConnectV6 | Layer::RecvAcceptV6 => IpFamily::V6,
        }
    }
}

/// Verdict of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Permit,
    Block,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Permit => f.write_str("permit"),
            Action::Block => f.write_str("block"),
        }
    }
}

/// Filter weights, lowest first. The relative order is what keeps DNS from
/// leaking through the tunnel-wide permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Weight {
    /// Default block
    BlockAll = 0,
    /// Everything on the tunnel interface
    Tunnel = 4,
    /// DNS to anywhere
    BlockDns = 8,
    /// Loopback, DHCP, LAN, relay and ping exemptions
    Exemption = 12,
    /// DNS to the configured tunnel resolvers
    DnsServer = 15,
}

impl Weight {
    pub fn value(&self) -> u8 {
        *self as u8
    }
}

/// Transport matched by a filter or carried by a sample packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
    Icmp,
    IcmpV6,
}

impl From<Protocol> for Transport {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Tcp => Transport::Tcp,
            Protocol::Udp => Transport::Udp,
        }
    }
}

/// One predicate term. All conditions of a filter must hold.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Protocol(Transport),
    RemoteNetwork(IpNetwork),
    RemotePort(u16),
    LocalPort(u16),
    IcmpType(u8),
    /// Traffic on the named interface
    Interface(String),
    /// Traffic on any interface except the named one
    NotInterface(String),
    /// Traffic to or from a loopback address
    Loopback,
    /// Traffic originated by (or destined to) the named application
    Application(String),
}

impl Condition {
    fn matches(&self, packet: &Packet) -> bool {
        match self {
            Condition::Protocol(t) => packet.transport == *t,
            Condition::RemoteNetwork(net) => net.contains(packet.remote),
            Condition::RemotePort(port) => packet.remote_port == Some(*port),
            Condition::LocalPort(port) => packet.local_port == Some(*port),
            Condition::IcmpType(ty) => packet.icmp_type == Some(*ty),
            Condition::Interface(alias) => packet.interface.as_deref() == Some(alias.as_str()),
            Condition::NotInterface(alias) => packet.interface.as_deref() != Some(alias.as_str()),
            Condition::Loopback => packet.remote.is_loopback(),
            Condition::Application(app) => packet.application.as_deref() == Some(app.as_str()),
        }
    }
}

/// A compiled rule, prior to registration with an engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterSpec {
    pub name: String,
    pub layer: Layer,
    pub action: Action,
    pub weight: Weight,
    pub conditions: Vec<Condition>,
}

impl FilterSpec {
    pub fn permit(name: impl Into<String>, layer: Layer, weight: Weight) -> Self {
        Self {
            name: name.into(),
            layer,
            action: Action::Permit,
            weight,
            conditions: Vec::new(),
        }
    }

    pub fn block(name: impl Into<String>, layer: Layer, weight: Weight) -> Self {
        Self {
            name: name.into(),
            layer,
            action: Action::Block,
            weight,
            conditions: Vec::new(),
        }
    }

    pub fn with(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Whether this filter applies to `packet`.
    pub fn matches(&self, packet: &Packet) -> bool {
        self.layer.direction() == packet.direction
            && self.layer.family() == IpFamily::of(&packet.remote)
            && self.conditions.iter().all(|c| c.matches(packet))
    }
}

/// Precedence between two filters: heavier first, blocks before permits on
/// equal weight.
pub fn precedence(a: &FilterSpec, b: &FilterSpec) -> Ordering {
    b.weight.cmp(&a.weight).then_with(|| match (a.action, b.action) {
        (Action::Block, Action::Permit) => Ordering::Less,
        (Action::Permit, Action::Block) => Ordering::Greater,
        _ => Ordering::Equal,
    })
}

/// Filters sorted so that the first match is the deciding one.
pub fn evaluation_order<'a>(filters: impl IntoIterator<Item = &'a FilterSpec>) -> Vec<&'a FilterSpec> {
    let mut ordered: Vec<_> = filters.into_iter().collect();
    ordered.sort_by(|a, b| precedence(a, b));
    ordered
}

/// Decide the fate of `packet`. Traffic no filter matches is not ours to
/// judge and is permitted.
pub fn classify<'a>(filters: impl IntoIterator<Item = &'a FilterSpec>, packet: &Packet) -> Action {
    filters
        .into_iter()
        .filter(|f| f.matches(packet))
        .min_by(|a, b| precedence(a, b))
        .map(|f| f.action)
        .unwrap_or(Action::Permit)
}

/// Sample packet used to reason about a filter set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub direction: Direction,
    pub remote: IpAddr,
    pub transport: Transport,
    pub remote_port: Option<u16>,
    pub local_port: Option<u16>,
    pub icmp_type: Option<u8>,
    pub interface: Option<String>,
    pub application: Option<String>,
}

impl Packet {
    fn new(direction: Direction, transport: Transport, remote: IpAddr) -> Self {
        Self {
            direction,
            remote,
            transport,
            remote_port: None,
            local_port: None,
            icmp_type: None,
            interface: None,
            application: None,
        }
    }

    pub fn outbound(transport: Transport, remote: IpAddr, port: u16) -> Self {
        let mut packet = Self::new(Direction::Outbound, transport, remote);
        packet.remote_port = Some(port);
        packet
    }

    pub fn inbound(transport: Transport, remote: IpAddr, port: u16) -> Self {
        let mut packet = Self::new(Direction::Inbound, transport, remote);
        packet.remote_port = Some(port);
        packet
    }

    pub fn outbound_tcp(remote: IpAddr, port: u16) -> Self {
        Self::outbound(Transport::Tcp, remote, port)
    }

    pub fn outbound_udp(remote: IpAddr, port: u16) -> Self {
        Self::outbound(Transport::Udp, remote, port)
    }

    /// ICMP echo request to `remote` (ICMPv6 for IPv6 addresses).
    pub fn echo_request(remote: IpAddr) -> Self {
        let (transport, ty) = match remote {
            IpAddr::V4(_) => (Transport::Icmp, crate::compiler::ICMP_ECHO_REQUEST),
            IpAddr::V6(_) => (Transport::IcmpV6, crate::compiler::ICMPV6_ECHO_REQUEST),
        };
        let mut packet = Self::new(Direction::Outbound, transport, remote);
        packet.icmp_type = Some(ty);
        packet
    }

    /// ICMP echo reply arriving from `remote`.
    pub fn echo_reply(remote: IpAddr) -> Self {
        let (transport, ty) = match remote {
            IpAddr::V4(_) => (Transport::Icmp, crate::compiler::ICMP_ECHO_REPLY),
            IpAddr::V6(_) => (Transport::IcmpV6, crate::compiler::ICMPV6_ECHO_REPLY),
        };
        let mut packet = Self::new(Direction::Inbound, transport, remote);
        packet.icmp_type = Some(ty);
        packet
    }

    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    pub fn on(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn from_app(mut self, app: impl Into<String>) -> Self {
        self.application = Some(app.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn heavier_filter_wins() {
        let filters = vec![
            FilterSpec::block("block", Layer::ConnectV4, Weight::BlockAll),
            FilterSpec::permit("permit", Layer::ConnectV4, Weight::Exemption)
                .with(Condition::RemotePort(443)),
        ];
        assert_eq!(
            classify(&filters, &Packet::outbound_tcp(ip("1.1.1.1"), 443)),
            Action::Permit
        );
        assert_eq!(
            classify(&filters, &Packet::outbound_tcp(ip("1.1.1.1"), 80)),
            Action::Block
        );
    }

    #[test]
    fn block_wins_on_equal_weight() {
        let filters = vec![
            FilterSpec::permit("permit", Layer::ConnectV4, Weight::Tunnel),
            FilterSpec::block("block", Layer::ConnectV4, Weight::Tunnel),
        ];
        assert_eq!(
            classify(&filters, &Packet::outbound_udp(ip("10.0.0.1"), 53)),
            Action::Block
        );
        let ordered = evaluation_order(&filters);
        assert_eq!(ordered[0].action, Action::Block);
    }

    #[test]
    fn layer_family_must_match() {
        let filters = vec![FilterSpec::block("v6", Layer::ConnectV6, Weight::BlockAll)];
        assert_eq!(
            classify(&filters, &Packet::outbound_tcp(ip("8.8.8.8"), 443)),
            Action::Permit
        );
        assert_eq!(
            classify(&filters, &Packet::outbound_tcp(ip("2001:db8::1"), 443)),
            Action::Block
        );
    }

    #[test]
    fn interface_conditions() {
        let on_tun = FilterSpec::permit("tun", Layer::ConnectV4, Weight::Tunnel)
            .with(Condition::Interface("wg0".into()));
        let off_tun = FilterSpec::permit("phys", Layer::ConnectV4, Weight::Tunnel)
            .with(Condition::NotInterface("wg0".into()));
        let packet = Packet::outbound_tcp(ip("1.2.3.4"), 1).on("wg0");
        assert!(on_tun.matches(&packet));
        assert!(!off_tun.matches(&packet));
        let unbound = Packet::outbound_tcp(ip("1.2.3.4"), 1);
        assert!(!on_tun.matches(&unbound));
        assert!(off_tun.matches(&unbound));
    }

    #[test]
    fn weights_are_ordered() {
        assert!(Weight::DnsServer > Weight::Exemption);
        assert!(Weight::Exemption > Weight::BlockDns);
        assert!(Weight::BlockDns > Weight::Tunnel);
        assert!(Weight::Tunnel > Weight::BlockAll);
        assert_eq!(Weight::DnsServer.value(), 15);
    }
}
