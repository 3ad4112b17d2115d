//! Rule compiler
//!
//! Pure mapping from a requested [`Policy`] to an ordered filter set. Nothing
//! here touches an engine; the same input always yields the same output, and
//! validation happens up front so a request either compiles completely or
//! fails before any filter exists.
//!
//! # Composition
//! - **Blocked**: block everything; loopback always, DHCP and LAN on request
//! - **Connecting**: blocked + relay endpoint for the relay client + ICMP echo
//!   to pingable hosts
//! - **Connected**: blocked + relay (off-tunnel only) + all tunnel traffic,
//!   with DNS restricted to the configured resolvers on every interface

use ipnetwork::IpNetwork;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{PolicyError, Result};
use crate::filter::{Condition, Direction, FilterSpec, IpFamily, Layer, Transport, Weight};
use crate::types::{PingableHosts, PolicyKind, Relay, Settings, TunnelContext};

pub const DNS_PORT: u16 = 53;
pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;
pub const DHCPV6_CLIENT_PORT: u16 = 546;
pub const DHCPV6_SERVER_PORT: u16 = 547;

pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_ECHO_REPLY: u8 = 129;

/// Interface aliases longer than this are rejected
const MAX_ALIAS_LEN: usize = 256;

const LAN_V4: [(Ipv4Addr, u8); 4] = [
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
    (Ipv4Addr::new(169, 254, 0, 0), 16),
];

/// Outbound-only: local network control block, SSDP, limited broadcast
const LAN_MULTICAST_V4: [(Ipv4Addr, u8); 3] = [
    (Ipv4Addr::new(224, 0, 0, 0), 24),
    (Ipv4Addr::new(239, 255, 255, 250), 32),
    (Ipv4Addr::new(255, 255, 255, 255), 32),
];

const LAN_V6: [(Ipv6Addr, u8); 2] = [
    (Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10),
    (Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7),
];

/// All_DHCP_Relay_Agents_and_Servers
const DHCPV6_AGENTS: (Ipv6Addr, u8) = (Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 1, 2), 128);

/// Outbound-only: link-local multicast
const LAN_MULTICAST_V6: [(Ipv6Addr, u8); 1] = [(Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0), 16)];

/// A fully specified policy request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Policy {
    Blocked {
        settings: Settings,
    },
    Connecting {
        settings: Settings,
        relay: Relay,
        relay_client: String,
        pingable_hosts: PingableHosts,
    },
    Connected {
        settings: Settings,
        relay: Relay,
        relay_client: String,
        tunnel: TunnelContext,
    },
}

impl Policy {
    pub fn kind(&self) -> PolicyKind {
        match self {
            Policy::Blocked { .. } => PolicyKind::Blocked,
            Policy::Connecting { .. } => PolicyKind::Connecting,
            Policy::Connected { .. } => PolicyKind::Connected,
        }
    }
}

/// Compile any policy.
pub fn compile(policy: &Policy) -> Result<Vec<FilterSpec>> {
    match policy {
        Policy::Blocked { settings } => Ok(compile_blocked(settings)),
        Policy::Connecting {
            settings,
            relay,
            relay_client,
            pingable_hosts,
        } => compile_connecting(settings, relay, relay_client, pingable_hosts),
        Policy::Connected {
            settings,
            relay,
            relay_client,
            tunnel,
        } => compile_connected(settings, relay, relay_client, tunnel),
    }
}

/// Block everything except loopback and what `settings` exempts.
pub fn compile_blocked(settings: &Settings) -> Vec<FilterSpec> {
    let mut filters = base_exemptions(settings);
    filters.extend(block_all());
    filters
}

/// Blocked plus the relay endpoint and ICMP echo to the pingable hosts.
pub fn compile_connecting(
    settings: &Settings,
    relay: &Relay,
    relay_client: &str,
    pingable_hosts: &PingableHosts,
) -> Result<Vec<FilterSpec>> {
    let relay_addr = validate_relay(relay)?;
    validate_relay_client(relay_client)?;
    let ping_alias = pingable_hosts
        .tunnel_interface_alias
        .as_deref()
        .map(|alias| validate_alias("tunnel interface alias", alias))
        .transpose()?;
    let hosts = pingable_hosts
        .hosts
        .iter()
        .map(|host| parse_ip("pingable host", host))
        .collect::<Result<Vec<_>>>()?;

    let mut filters = base_exemptions(settings);
    filters.extend(relay_exemption(relay, relay_addr, relay_client, None));
    for host in hosts {
        filters.extend(ping_exemption(host, ping_alias));
    }
    filters.extend(block_all());
    Ok(filters)
}

/// Blocked plus the relay (off-tunnel), the tunnel itself, and DNS only to
/// the configured resolvers.
pub fn compile_connected(
    settings: &Settings,
    relay: &Relay,
    relay_client: &str,
    tunnel: &TunnelContext,
) -> Result<Vec<FilterSpec>> {
    let relay_addr = validate_relay(relay)?;
    validate_relay_client(relay_client)?;
    let alias = validate_alias("tunnel interface alias", &tunnel.tunnel_interface_alias)?;
    let dns_v4 = tunnel
        .dns_v4
        .as_deref()
        .map(|dns| parse_dns(dns, IpFamily::V4))
        .transpose()?;
    let dns_v6 = tunnel
        .dns_v6
        .as_deref()
        .map(|dns| parse_dns(dns, IpFamily::V6))
        .transpose()?;

    let mut filters = base_exemptions(settings);
    filters.extend(relay_exemption(relay, relay_addr, relay_client, Some(alias)));
    filters.extend(permit_tunnel(alias));
    filters.extend(block_dns());
    for server in dns_v4.into_iter().chain(dns_v6) {
        filters.extend(permit_dns_server(server, alias));
    }
    filters.extend(block_all());
    Ok(filters)
}

// ============================================================================
// Validation
// ============================================================================

fn parse_ip(what: &str, text: &str) -> Result<IpAddr> {
    text.trim()
        .parse::<IpAddr>()
        .map_err(|_| PolicyError::invalid(format!("{what} is not an IP address: {text:?}")))
}

fn validate_relay(relay: &Relay) -> Result<IpAddr> {
    if relay.port == 0 {
        return Err(PolicyError::invalid("relay port 0 is not allowed"));
    }
    let addr = parse_ip("relay address", &relay.address)?;
    if addr.is_unspecified() {
        return Err(PolicyError::invalid("unspecified relay address"));
    }
    if addr.is_multicast() {
        return Err(PolicyError::invalid("multicast relay address"));
    }
    if let IpAddr::V4(v4) = addr {
        if v4.is_broadcast() {
            return Err(PolicyError::invalid("broadcast relay address"));
        }
    }
    Ok(addr)
}

fn validate_relay_client(relay_client: &str) -> Result<()> {
    if relay_client.trim().is_empty() {
        return Err(PolicyError::invalid("relay client must not be empty"));
    }
    Ok(())
}

/// Aliases end up inside engine rule text, so quoting characters are refused.
pub(crate) fn validate_alias<'a>(what: &str, alias: &'a str) -> Result<&'a str> {
    if alias.is_empty() {
        return Err(PolicyError::invalid(format!("{what} must not be empty")));
    }
    if alias.len() > MAX_ALIAS_LEN {
        return Err(PolicyError::invalid(format!("{what} is too long")));
    }
    if alias
        .chars()
        .any(|c| c.is_control() || c == '"' || c == '\\')
    {
        return Err(PolicyError::invalid(format!(
            "{what} contains forbidden characters: {alias:?}"
        )));
    }
    Ok(alias)
}

fn parse_dns(text: &str, family: IpFamily) -> Result<IpAddr> {
    let addr = parse_ip("DNS server", text)?;
    if IpFamily::of(&addr) != family {
        return Err(PolicyError::invalid(format!(
            "DNS server {addr} is not an {family:?} address"
        )));
    }
    Ok(addr)
}

// ============================================================================
// Building blocks
// ============================================================================

fn block_all() -> impl Iterator<Item = FilterSpec> {
    Layer::ALL
        .into_iter()
        .map(|layer| FilterSpec::block(format!("Block all ({layer:?})"), layer, Weight::BlockAll))
}

fn base_exemptions(settings: &Settings) -> Vec<FilterSpec> {
    let mut filters: Vec<FilterSpec> = Layer::ALL
        .into_iter()
        .map(|layer| {
            FilterSpec::permit(format!("Permit loopback ({layer:?})"), layer, Weight::Exemption)
                .with(Condition::Loopback)
        })
        .collect();
    if settings.permit_dhcp {
        filters.extend(dhcp_exemption());
    }
    if settings.permit_lan {
        filters.extend(lan_exemption());
    }
    filters
}

fn dhcp_exemption() -> Vec<FilterSpec> {
    let udp = Condition::Protocol(Transport::Udp);
    vec![
        FilterSpec::permit("Permit DHCP request", Layer::ConnectV4, Weight::Exemption)
            .with(udp.clone())
            .with(Condition::LocalPort(DHCP_CLIENT_PORT))
            .with(Condition::RemotePort(DHCP_SERVER_PORT)),
        FilterSpec::permit("Permit DHCP response", Layer::RecvAcceptV4, Weight::Exemption)
            .with(udp.clone())
            .with(Condition::LocalPort(DHCP_CLIENT_PORT))
            .with(Condition::RemotePort(DHCP_SERVER_PORT)),
        FilterSpec::permit("Permit DHCPv6 request", Layer::ConnectV6, Weight::Exemption)
            .with(udp.clone())
            .with(Condition::RemoteNetwork(v6_net(DHCPV6_AGENTS)))
            .with(Condition::LocalPort(DHCPV6_CLIENT_PORT))
            .with(Condition::RemotePort(DHCPV6_SERVER_PORT)),
        FilterSpec::permit("Permit DHCPv6 response", Layer::RecvAcceptV6, Weight::Exemption)
            .with(udp)
            .with(Condition::RemoteNetwork(v6_net(LAN_V6[0])))
            .with(Condition::LocalPort(DHCPV6_CLIENT_PORT))
            .with(Condition::RemotePort(DHCPV6_SERVER_PORT)),
    ]
}

fn v4_net((addr, prefix): (Ipv4Addr, u8)) -> IpNetwork {
    net(IpAddr::V4(addr), prefix)
}

fn v6_net((addr, prefix): (Ipv6Addr, u8)) -> IpNetwork {
    net(IpAddr::V6(addr), prefix)
}

// prefixes come from the tables above and are always in range
fn net(addr: IpAddr, prefix: u8) -> IpNetwork {
    IpNetwork::new(addr, prefix).unwrap_or_else(|_| IpNetwork::from(addr))
}

fn lan_exemption() -> Vec<FilterSpec> {
    let mut filters = Vec::new();
    let private = LAN_V4
        .into_iter()
        .map(v4_net)
        .chain(LAN_V6.into_iter().map(v6_net));
    for net in private {
        let family = IpFamily::of(&net.network());
        for direction in [Direction::Outbound, Direction::Inbound] {
            filters.push(
                FilterSpec::permit(
                    format!("Permit LAN {net} ({direction:?})"),
                    Layer::new(direction, family),
                    Weight::Exemption,
                )
                .with(Condition::RemoteNetwork(net)),
            );
        }
    }
    let multicast = LAN_MULTICAST_V4
        .into_iter()
        .map(v4_net)
        .chain(LAN_MULTICAST_V6.into_iter().map(v6_net));
    for net in multicast {
        filters.push(
            FilterSpec::permit(
                format!("Permit LAN multicast {net}"),
                Layer::connect_for(&net.network()),
                Weight::Exemption,
            )
            .with(Condition::RemoteNetwork(net)),
        );
    }
    filters
}

fn relay_exemption(
    relay: &Relay,
    addr: IpAddr,
    relay_client: &str,
    tunnel_alias: Option<&str>,
) -> Vec<FilterSpec> {
    let spec = |name: &str, layer: Layer| {
        let filter = FilterSpec::permit(name, layer, Weight::Exemption)
            .with(Condition::RemoteNetwork(IpNetwork::from(addr)))
            .with(Condition::RemotePort(relay.port))
            .with(Condition::Protocol(relay.protocol.into()))
            .with(Condition::Application(relay_client.to_string()));
        match tunnel_alias {
            Some(alias) => filter.with(Condition::NotInterface(alias.to_string())),
            None => filter,
        }
    };
    vec![
        spec("Permit outbound relay traffic", Layer::connect_for(&addr)),
        spec("Permit inbound relay traffic", Layer::recv_for(&addr)),
    ]
}

fn ping_exemption(host: IpAddr, alias: Option<&str>) -> Vec<FilterSpec> {
    let (transport, request, reply) = match host {
        IpAddr::V4(_) => (Transport::Icmp, ICMP_ECHO_REQUEST, ICMP_ECHO_REPLY),
        IpAddr::V6(_) => (Transport::IcmpV6, ICMPV6_ECHO_REQUEST, ICMPV6_ECHO_REPLY),
    };
    let spec = |name: String, layer: Layer, icmp_type: u8| {
        let filter = FilterSpec::permit(name, layer, Weight::Exemption)
            .with(Condition::Protocol(transport))
            .with(Condition::IcmpType(icmp_type))
            .with(Condition::RemoteNetwork(IpNetwork::from(host)));
        match alias {
            Some(alias) => filter.with(Condition::Interface(alias.to_string())),
            None => filter,
        }
    };
    vec![
        spec(format!("Permit echo request to {host}"), Layer::connect_for(&host), request),
        spec(format!("Permit echo reply from {host}"), Layer::recv_for(&host), reply),
    ]
}

fn permit_tunnel(alias: &str) -> impl Iterator<Item = FilterSpec> + '_ {
    Layer::ALL.into_iter().map(move |layer| {
        FilterSpec::permit(format!("Permit tunnel traffic ({layer:?})"), layer, Weight::Tunnel)
            .with(Condition::Interface(alias.to_string()))
    })
}

fn block_dns() -> Vec<FilterSpec> {
    let mut filters = Vec::new();
    for layer in [Layer::ConnectV4, Layer::ConnectV6] {
        for transport in [Transport::Udp, Transport::Tcp] {
            filters.push(
                FilterSpec::block(
                    format!("Block DNS ({layer:?}, {transport:?})"),
                    layer,
                    Weight::BlockDns,
                )
                .with(Condition::Protocol(transport))
                .with(Condition::RemotePort(DNS_PORT)),
            );
        }
    }
    filters
}

fn permit_dns_server(server: IpAddr, alias: &str) -> Vec<FilterSpec> {
    [Transport::Udp, Transport::Tcp]
        .into_iter()
        .map(|transport| {
            FilterSpec::permit(
                format!("Permit DNS to {server} ({transport:?})"),
                Layer::connect_for(&server),
                Weight::DnsServer,
            )
            .with(Condition::Interface(alias.to_string()))
            .with(Condition::RemoteNetwork(IpNetwork::from(server)))
            .with(Condition::Protocol(transport))
            .with(Condition::RemotePort(DNS_PORT))
        })
        .collect()
}
