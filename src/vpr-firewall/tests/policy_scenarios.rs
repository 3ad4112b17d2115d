//! End-to-end policy scenarios
//!
//! Drives a `Firewall` over the in-memory engine and checks the committed
//! filter set with packets, the way traffic would hit the kernel filter.

use std::net::IpAddr;

use vpr_firewall::filter::Transport;
use vpr_firewall::{
    compile, Action, CleanupPolicy, Firewall, FirewallConfig, MemoryEngine, MemoryObserver,
    Packet, PingableHosts, Policy, PolicyState, Protocol, Relay, Settings, TunnelContext,
};

const RELAY_CLIENT: &str = "vpr-client";

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn relay() -> Relay {
    Relay::new("1.2.3.4", 443, Protocol::Tcp)
}

fn firewall() -> (Firewall<MemoryEngine>, MemoryObserver) {
    let engine = MemoryEngine::new();
    let observer = engine.observer();
    let fw = Firewall::initialize(engine, &FirewallConfig::default()).unwrap();
    (fw, observer)
}

fn connecting(fw: &Firewall<MemoryEngine>, settings: Settings) {
    fw.apply_policy_connecting(&settings, &relay(), RELAY_CLIENT, &PingableHosts::default())
        .unwrap();
}

fn connected(fw: &Firewall<MemoryEngine>, settings: Settings) {
    let tunnel = TunnelContext::new("wg0").with_dns_v4("10.0.0.1");
    fw.apply_policy_connected(&settings, &relay(), RELAY_CLIENT, &tunnel)
        .unwrap();
}

/// Apart from loopback, which every policy exempts, the relay client's
/// connection to the relay is the only outbound traffic allowed.
#[test]
fn test_connecting_permits_only_relay_client_to_relay() {
    let (fw, observer) = firewall();
    connecting(&fw, Settings::default());
    assert_eq!(fw.state(), PolicyState::Connecting);

    let to_relay = Packet::outbound_tcp(ip("1.2.3.4"), 443);
    assert_eq!(
        observer.classify(&to_relay.clone().from_app(RELAY_CLIENT)),
        Action::Permit
    );
    assert_eq!(
        observer.classify(&to_relay.from_app("browser")),
        Action::Block
    );
    assert_eq!(
        observer.classify(&Packet::outbound_tcp(ip("1.2.3.5"), 443).from_app(RELAY_CLIENT)),
        Action::Block
    );
    assert_eq!(
        observer.classify(&Packet::outbound_udp(ip("1.2.3.4"), 443).from_app(RELAY_CLIENT)),
        Action::Block
    );
    assert_eq!(
        observer.classify(&Packet::outbound_tcp(ip("1.2.3.4"), 444).from_app(RELAY_CLIENT)),
        Action::Block
    );
    for other in [
        Packet::outbound_tcp(ip("8.8.8.8"), 443),
        Packet::outbound_udp(ip("9.9.9.9"), 53).from_app(RELAY_CLIENT),
        Packet::outbound_tcp(ip("2001:db8::1"), 80).from_app("browser"),
        Packet::echo_request(ip("1.1.1.1")),
    ] {
        assert_eq!(observer.classify(&other), Action::Block, "{other:?}");
    }
    assert_eq!(
        observer.classify(&Packet::outbound_tcp(ip("127.0.0.1"), 8080)),
        Action::Permit
    );
}

#[test]
fn test_connecting_return_traffic_from_relay() {
    let (fw, observer) = firewall();
    connecting(&fw, Settings::default());
    let inbound = Packet::inbound(Transport::Tcp, ip("1.2.3.4"), 443)
        .from_app(RELAY_CLIENT);
    assert_eq!(observer.classify(&inbound), Action::Permit);
}

#[test]
fn test_connecting_allows_ping_to_pingable_hosts() {
    let (fw, observer) = firewall();
    let hosts = PingableHosts::new(["10.64.0.1"]).on_interface("wg0");
    fw.apply_policy_connecting(&Settings::default(), &relay(), RELAY_CLIENT, &hosts)
        .unwrap();

    assert_eq!(
        observer.classify(&Packet::echo_request(ip("10.64.0.1")).on("wg0")),
        Action::Permit
    );
    assert_eq!(
        observer.classify(&Packet::echo_request(ip("10.64.0.1")).on("eth0")),
        Action::Block
    );
    assert_eq!(
        observer.classify(&Packet::echo_request(ip("8.8.8.8")).on("wg0")),
        Action::Block
    );

    assert_eq!(
        observer.classify(&Packet::echo_reply(ip("10.64.0.1")).on("wg0")),
        Action::Permit
    );
    assert_eq!(
        observer.classify(&Packet::echo_reply(ip("10.64.0.1")).on("eth0")),
        Action::Block
    );
    assert_eq!(
        observer.classify(&Packet::echo_reply(ip("8.8.8.8")).on("wg0")),
        Action::Block
    );
}

#[test]
fn test_connected_dns_only_to_configured_resolver() {
    let (fw, observer) = firewall();
    connected(&fw, Settings::default());
    assert_eq!(fw.state(), PolicyState::Connected);

    assert_eq!(
        observer.classify(&Packet::outbound_udp(ip("10.0.0.1"), 53).on("wg0")),
        Action::Permit
    );
    assert_eq!(
        observer.classify(&Packet::outbound_tcp(ip("10.0.0.1"), 53).on("wg0")),
        Action::Permit
    );
    assert_eq!(
        observer.classify(&Packet::outbound_udp(ip("8.8.8.8"), 53).on("wg0")),
        Action::Block
    );
    assert_eq!(
        observer.classify(&Packet::outbound_udp(ip("8.8.8.8"), 53).on("eth0")),
        Action::Block
    );
    assert_eq!(
        observer.classify(&Packet::outbound_udp(ip("10.0.0.1"), 53).on("eth0")),
        Action::Block
    );
}

#[test]
fn test_connected_tunnel_carries_everything_else() {
    let (fw, observer) = firewall();
    connected(&fw, Settings::default());

    assert_eq!(
        observer.classify(&Packet::outbound_tcp(ip("8.8.8.8"), 443).on("wg0")),
        Action::Permit
    );
    assert_eq!(
        observer.classify(&Packet::outbound_tcp(ip("8.8.8.8"), 443).on("eth0")),
        Action::Block
    );
    assert_eq!(
        observer.classify(&Packet::outbound_tcp(ip("1.2.3.4"), 443).on("eth0").from_app(RELAY_CLIENT)),
        Action::Permit
    );
}

#[test]
fn test_lan_exemption_follows_settings() {
    let (fw, observer) = firewall();
    let lan = Packet::outbound_tcp(ip("192.168.1.1"), 445);
    let from_lan = Packet::inbound(Transport::Tcp, ip("192.168.1.1"), 50000).with_local_port(22);
    let internet = Packet::outbound_tcp(ip("8.8.8.8"), 443);
    let from_internet = Packet::inbound(Transport::Tcp, ip("8.8.8.8"), 50000).with_local_port(22);

    fw.apply_policy_blocked(&Settings::new(false, true)).unwrap();
    assert_eq!(observer.classify(&lan), Action::Permit);
    assert_eq!(observer.classify(&from_lan), Action::Permit);
    assert_eq!(observer.classify(&internet), Action::Block);
    assert_eq!(observer.classify(&from_internet), Action::Block);

    fw.apply_policy_blocked(&Settings::new(false, false)).unwrap();
    assert_eq!(observer.classify(&lan), Action::Block);
    assert_eq!(observer.classify(&from_lan), Action::Block);
    assert_eq!(observer.classify(&internet), Action::Block);
}

#[test]
fn test_dhcp_exemption_follows_settings() {
    let (fw, observer) = firewall();
    let discover = Packet::outbound_udp(ip("255.255.255.255"), 67).with_local_port(68);
    let offer = Packet::inbound(Transport::Udp, ip("192.168.1.1"), 67).with_local_port(68);

    fw.apply_policy_blocked(&Settings::new(true, false)).unwrap();
    assert_eq!(observer.classify(&discover), Action::Permit);
    assert_eq!(observer.classify(&offer), Action::Permit);

    fw.apply_policy_blocked(&Settings::new(false, false)).unwrap();
    assert_eq!(observer.classify(&discover), Action::Block);
    assert_eq!(observer.classify(&offer), Action::Block);
}

#[test]
fn test_only_latest_policy_is_enforced() {
    let (fw, observer) = firewall();
    let owner = FirewallConfig::default().owner();

    connecting(&fw, Settings::default());
    connected(&fw, Settings::default());
    fw.apply_policy_blocked(&Settings::default()).unwrap();

    let expected = compile(&Policy::Blocked {
        settings: Settings::default(),
    })
    .unwrap();
    assert_eq!(observer.owned_filters(&owner), expected);
    assert_eq!(
        observer.classify(&Packet::outbound_tcp(ip("1.2.3.4"), 443).from_app(RELAY_CLIENT)),
        Action::Block
    );
}

#[test]
fn test_connecting_straight_to_connected() {
    let (fw, observer) = firewall();
    connecting(&fw, Settings::default());
    connected(&fw, Settings::default());
    assert_eq!(fw.state(), PolicyState::Connected);
    assert_eq!(
        observer.classify(&Packet::outbound_tcp(ip("8.8.8.8"), 443).on("wg0")),
        Action::Permit
    );
}

#[test]
fn test_reset_lets_traffic_through() {
    let (fw, observer) = firewall();
    fw.apply_policy_blocked(&Settings::default()).unwrap();
    fw.reset().unwrap();
    assert_eq!(fw.state(), PolicyState::None);
    assert_eq!(
        observer.classify(&Packet::outbound_tcp(ip("8.8.8.8"), 443)),
        Action::Permit
    );
    fw.deinitialize(CleanupPolicy::ResetFirewall).unwrap();
}
