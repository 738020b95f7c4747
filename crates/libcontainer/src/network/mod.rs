//! Per-container virtual networks: address assignment inside a CIDR,
//! gateway and DNS resolution, and attach/detach of container interfaces.
//!
//! Creating a [`Network`] realizes the configuration (chooses an address,
//! resolves gateway and DNS); the kernel interface itself is expected to
//! pre-exist or be created by the orchestrator. Exactly one live network per
//! name can exist in the kernel at any time.

pub mod dhcp;
pub mod dns;
pub mod netlink;
pub mod probe;

use std::collections::HashMap;
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use nix::net::if_::if_nametoindex;

use crate::error::ErrorKind;
use dns::DnsError;
use netlink::NetlinkError;
use probe::{AddressProbe, ArpProbe};

/// How many random candidates are probed before the CIDR is declared
/// exhausted. The bound is small because a dense-network miss is recoverable
/// by retrying the whole launch.
const ADDRESS_PROBE_ATTEMPTS: usize = 10;

/// An IPv4 network in CIDR notation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv4Net {
    addr: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Net {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Ipv4Net {
        Ipv4Net {
            addr,
            prefix: prefix.min(32),
        }
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix)
        }
    }

    /// The network base address (host bits cleared).
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) & self.mask())
    }

    pub fn host_bits(&self) -> u32 {
        32 - u32::from(self.prefix)
    }

    /// Number of addresses spanned by the host bits.
    pub fn host_space(&self) -> u64 {
        1u64 << self.host_bits()
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & self.mask() == u32::from(self.network())
    }
}

impl FromStr for Ipv4Net {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NetworkError::InvalidCidr {
            input: s.to_owned(),
        };

        let (addr, prefix) = s.split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        if prefix > 32 {
            return Err(invalid());
        }

        Ok(Ipv4Net { addr, prefix })
    }
}

impl Display for Ipv4Net {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Configuration for a container network.
#[derive(Clone, Debug, Default)]
pub struct NetworkConfig {
    pub name: String,
    pub cidr: Option<Ipv4Net>,
    pub gateway: Option<Ipv4Addr>,
    pub dns: Option<Vec<IpAddr>>,
    pub dhcp: bool,
    pub dhcp_args: Vec<String>,
}

/// A realized container network: the configuration with a chosen address
/// and resolved gateway and DNS.
#[derive(Clone, Debug)]
pub struct Network {
    pub name: String,
    pub cidr: Ipv4Net,
    /// The assigned address; absent for DHCP-managed networks.
    pub address: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub dns: Vec<IpAddr>,
    pub dhcp: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum NetworkError {
    #[error("invalid network configuration")]
    InvalidConfig,
    #[error("invalid CIDR {input:?}")]
    InvalidCidr { input: String },
    #[error("network {name} already exists")]
    AlreadyExists { name: String },
    #[error("network interface {name} not found")]
    InterfaceNotFound { name: String },
    #[error("no available address in {cidr}")]
    Exhausted { cidr: Ipv4Net },
    #[error("netlink operation failed: {0}")]
    Netlink(#[from] NetlinkError),
    #[error("dns check failed: {0}")]
    Dns(#[from] DnsError),
    #[error("failed to start DHCP listener: {0}")]
    Dhcp(#[source] std::io::Error),
    #[error("failed to enumerate interfaces: {0}")]
    Interfaces(#[source] nix::Error),
}

impl NetworkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NetworkError::InvalidConfig | NetworkError::InvalidCidr { .. } => ErrorKind::InvalidSpec,
            NetworkError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            NetworkError::InterfaceNotFound { .. } => ErrorKind::NotFound,
            NetworkError::Exhausted { .. } => ErrorKind::ResourceExhausted,
            NetworkError::Dns(err) => err.kind(),
            NetworkError::Netlink(_) | NetworkError::Dhcp(_) | NetworkError::Interfaces(_) => {
                ErrorKind::KernelIo
            }
        }
    }
}

fn interface_index(name: &str) -> Option<u32> {
    if_nametoindex(name).ok()
}

/// Realizes a network from its configuration.
///
/// With DHCP the address stays unassigned and a log-only DHCPv6 listener is
/// started; otherwise a free address is chosen by randomized ARP probing.
/// The gateway falls back to [`default_gateway`], DNS to [`default_dns`].
pub fn create(config: &NetworkConfig) -> Result<Network, NetworkError> {
    let cidr = config.cidr.ok_or(NetworkError::InvalidConfig)?;
    if config.name.is_empty() {
        return Err(NetworkError::InvalidConfig);
    }
    if interface_index(&config.name).is_some() {
        return Err(NetworkError::AlreadyExists {
            name: config.name.clone(),
        });
    }

    let address = if config.dhcp {
        dhcp::spawn_listener().map_err(NetworkError::Dhcp)?;
        None
    } else {
        Some(available_address(&cidr)?)
    };

    let gateway = match config.gateway {
        Some(gateway) => Some(gateway),
        None => default_gateway(&cidr)?,
    };

    let dns = match &config.dns {
        Some(servers) if !servers.is_empty() => servers.clone(),
        _ => dns::default_dns()?.into_iter().collect(),
    };

    tracing::debug!(name = %config.name, ?address, ?gateway, "created network");
    Ok(Network {
        name: config.name.clone(),
        cidr,
        address,
        gateway,
        dns,
        dhcp: config.dhcp,
    })
}

/// Deletes the kernel interface backing the named network.
pub fn delete(network_name: &str) -> Result<(), NetworkError> {
    let index = interface_index(network_name).ok_or_else(|| NetworkError::InterfaceNotFound {
        name: network_name.to_owned(),
    })?;
    netlink::delete_link(index)?;

    tracing::info!(network = network_name, "deleted network");
    Ok(())
}

/// Attaches a container to the realized network: the chosen address is
/// added to the link, the default route installed via the gateway, and the
/// first DNS server is probed with a live query. Any failing step aborts
/// the connect and leaves the link addressless.
pub fn connect(container_id: &str, network: &Network) -> Result<(), NetworkError> {
    let index = interface_index(&network.name).ok_or_else(|| NetworkError::InterfaceNotFound {
        name: network.name.clone(),
    })?;
    let address = network.address.ok_or(NetworkError::InvalidConfig)?;

    netlink::add_address(index, address, network.cidr.prefix())?;
    if let Some(gateway) = network.gateway {
        netlink::add_default_route(gateway)?;
    }
    if let Some(server) = network.dns.first() {
        dns::check_server(*server)?;
    }

    tracing::info!(
        container = container_id,
        network = %network.name,
        "connected container to network"
    );
    Ok(())
}

/// Detaches a container by bringing the link down. Addresses and routes are
/// left in place; tearing the interface down entirely is [`delete`]'s job.
pub fn disconnect(container_id: &str, network_name: &str) -> Result<(), NetworkError> {
    if network_name.is_empty() {
        return Err(NetworkError::InvalidConfig);
    }
    let index = interface_index(network_name).ok_or_else(|| NetworkError::InterfaceNotFound {
        name: network_name.to_owned(),
    })?;
    netlink::set_link_down(index)?;

    tracing::info!(
        container = container_id,
        network = network_name,
        "disconnected container from network"
    );
    Ok(())
}

/// Finds a free address within `cidr` using the real ARP probe.
pub fn available_address(cidr: &Ipv4Net) -> Result<Ipv4Addr, NetworkError> {
    available_address_with(cidr, &ArpProbe)
}

/// Randomized probing: up to ten uniform draws over the host space; the
/// first candidate the probe reports free wins. Random candidates avoid
/// adjacent-address collisions between concurrent launches.
pub fn available_address_with(
    cidr: &Ipv4Net,
    probe: &dyn AddressProbe,
) -> Result<Ipv4Addr, NetworkError> {
    use rand::Rng;

    let host_space = cidr.host_space();
    if host_space <= 1 {
        // No host bits to draw from.
        return Err(NetworkError::Exhausted { cidr: *cidr });
    }

    let base = u32::from(cidr.network());
    let mut rng = rand::thread_rng();
    for _ in 0..ADDRESS_PROBE_ATTEMPTS {
        let offset = rng.gen_range(0..host_space) as u32;
        let candidate = Ipv4Addr::from(base.wrapping_add(offset));
        if !probe.in_use(candidate) {
            return Ok(candidate);
        }
    }

    Err(NetworkError::Exhausted { cidr: *cidr })
}

/// Reports whether `addr` answers an ARP probe on the local segment.
pub fn is_in_use(addr: Ipv4Addr) -> bool {
    ArpProbe.in_use(addr)
}

/// Default-gateway discovery: the lowest-index non-loopback interface is
/// taken as the default; if one of its IPv4 networks contains the target,
/// the kernel routing table is scanned for the first route whose
/// destination contains the target. `None` (not an error) when nothing
/// matches.
pub fn default_gateway(cidr: &Ipv4Net) -> Result<Option<Ipv4Addr>, NetworkError> {
    let target = cidr.network();
    let interfaces = interfaces().map_err(NetworkError::Interfaces)?;
    let Some(default_iface) = default_interface(&interfaces) else {
        return Ok(None);
    };
    if !default_iface.ipv4.iter().any(|net| net.contains(target)) {
        return Ok(None);
    }

    let routes = netlink::route_dump()?;
    Ok(first_matching_gateway(&routes, target))
}

/// The default interface is the lowest-index one that is not loopback;
/// `interfaces()` sorts ascending by index, so the first candidate wins.
fn default_interface(interfaces: &[Interface]) -> Option<&Interface> {
    interfaces.iter().find(|iface| !iface.loopback)
}

/// Gateway of the first route whose destination network contains `target`.
/// Routes without a destination (default routes) are skipped.
fn first_matching_gateway(routes: &[netlink::Route], target: Ipv4Addr) -> Option<Ipv4Addr> {
    routes.iter().find_map(|route| {
        let destination = route.destination?;
        if destination.contains(target) {
            route.gateway
        } else {
            None
        }
    })
}

/// Default-DNS discovery; the first nameserver in `/etc/resolv.conf`.
pub fn default_dns() -> Result<Option<IpAddr>, NetworkError> {
    Ok(dns::default_dns()?)
}

/// A host interface with its addresses, as seen by getifaddrs, sorted by
/// interface index.
pub(crate) struct Interface {
    pub name: String,
    pub index: u32,
    pub mac: Option<[u8; 6]>,
    pub ipv4: Vec<Ipv4Net>,
    pub loopback: bool,
}

pub(crate) fn interfaces() -> Result<Vec<Interface>, nix::Error> {
    use nix::net::if_::InterfaceFlags;

    let mut by_name: HashMap<String, Interface> = HashMap::new();
    for ifaddr in nix::ifaddrs::getifaddrs()? {
        let entry = by_name
            .entry(ifaddr.interface_name.clone())
            .or_insert_with(|| Interface {
                name: ifaddr.interface_name.clone(),
                index: 0,
                mac: None,
                ipv4: Vec::new(),
                loopback: ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK),
            });

        let Some(address) = ifaddr.address else {
            continue;
        };
        if let Some(link) = address.as_link_addr() {
            entry.index = link.ifindex() as u32;
            entry.mac = link.addr();
        } else if let Some(sin) = address.as_sockaddr_in() {
            let prefix = ifaddr
                .netmask
                .and_then(|mask| mask.as_sockaddr_in().map(|m| m.ip().leading_ones() as u8))
                .unwrap_or(32);
            entry.ipv4.push(Ipv4Net::new(Ipv4Addr::from(sin.ip()), prefix));
        }
    }

    let mut interfaces: Vec<Interface> = by_name.into_values().collect();
    for iface in &mut interfaces {
        if iface.index == 0 {
            if let Ok(index) = if_nametoindex(iface.name.as_str()) {
                iface.index = index;
            }
        }
    }
    interfaces.sort_by_key(|iface| iface.index);
    Ok(interfaces)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubProbe {
        in_use: fn(Ipv4Addr) -> bool,
    }

    impl AddressProbe for StubProbe {
        fn in_use(&self, addr: Ipv4Addr) -> bool {
            (self.in_use)(addr)
        }
    }

    #[test]
    fn test_cidr_parses() {
        let net: Ipv4Net = "192.168.0.0/24".parse().unwrap();
        assert_eq!(net.network(), Ipv4Addr::new(192, 168, 0, 0));
        assert_eq!(net.prefix(), 24);
        assert_eq!(net.host_bits(), 8);
        assert_eq!(net.host_space(), 256);
        assert_eq!(net.to_string(), "192.168.0.0/24");
    }

    #[test]
    fn test_cidr_normalizes_host_bits() {
        let net: Ipv4Net = "10.1.2.3/8".parse().unwrap();
        assert_eq!(net.network(), Ipv4Addr::new(10, 0, 0, 0));
    }

    #[test]
    fn test_cidr_rejects_malformed_input() {
        for input in ["", "10.0.0.0", "10.0.0.0/33", "10.0.0/8", "a.b.c.d/8"] {
            assert!(
                input.parse::<Ipv4Net>().is_err(),
                "{input:?} must be rejected"
            );
        }
    }

    #[test]
    fn test_cidr_containment() {
        let net: Ipv4Net = "192.168.0.0/24".parse().unwrap();
        assert!(net.contains(Ipv4Addr::new(192, 168, 0, 200)));
        assert!(!net.contains(Ipv4Addr::new(192, 168, 1, 1)));

        let all: Ipv4Net = "0.0.0.0/0".parse().unwrap();
        assert!(all.contains(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn test_available_address_stays_inside_cidr() {
        let cidr: Ipv4Net = "10.5.0.0/16".parse().unwrap();
        let probe = StubProbe { in_use: |_| false };

        for _ in 0..32 {
            let addr = available_address_with(&cidr, &probe).unwrap();
            assert!(cidr.contains(addr), "{addr} escaped {cidr}");
        }
    }

    #[test]
    fn test_available_address_exhausts_on_dense_network() {
        let cidr: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        let probe = StubProbe { in_use: |_| true };

        let err = available_address_with(&cidr, &probe).unwrap_err();
        assert!(matches!(err, NetworkError::Exhausted { .. }));
    }

    #[test]
    fn test_available_address_rejects_host_route() {
        let cidr: Ipv4Net = "10.0.0.0/32".parse().unwrap();
        let probe = StubProbe { in_use: |_| false };

        let err = available_address_with(&cidr, &probe).unwrap_err();
        assert!(matches!(err, NetworkError::Exhausted { .. }));
    }

    #[test]
    fn test_create_requires_cidr() {
        let config = NetworkConfig {
            name: "br-test".into(),
            ..Default::default()
        };

        let err = create(&config).unwrap_err();
        assert!(matches!(err, NetworkError::InvalidConfig));
    }

    #[test]
    fn test_create_requires_name() {
        let config = NetworkConfig {
            cidr: Some("10.0.0.0/24".parse().unwrap()),
            ..Default::default()
        };

        let err = create(&config).unwrap_err();
        assert!(matches!(err, NetworkError::InvalidConfig));
    }

    #[test]
    fn test_create_rejects_existing_interface() {
        // Loopback exists on any test host.
        let config = NetworkConfig {
            name: "lo".into(),
            cidr: Some("10.0.0.0/24".parse().unwrap()),
            ..Default::default()
        };

        let err = create(&config).unwrap_err();
        assert!(matches!(err, NetworkError::AlreadyExists { .. }));
    }

    #[test]
    fn test_delete_unknown_interface() {
        let err = delete("spocker-does-not-exist0").unwrap_err();
        assert!(matches!(err, NetworkError::InterfaceNotFound { .. }));
    }

    #[test]
    fn test_disconnect_rejects_empty_name() {
        let err = disconnect("c1", "").unwrap_err();
        assert!(matches!(err, NetworkError::InvalidConfig));
    }

    fn sample_iface(name: &str, index: u32, loopback: bool, ipv4: &[&str]) -> Interface {
        Interface {
            name: name.into(),
            index,
            mac: None,
            ipv4: ipv4.iter().map(|net| net.parse().unwrap()).collect(),
            loopback,
        }
    }

    #[test]
    fn test_default_interface_skips_loopback() {
        let interfaces = vec![
            sample_iface("lo", 1, true, &["127.0.0.1/8"]),
            sample_iface("eth0", 2, false, &["192.168.0.10/24"]),
            sample_iface("eth1", 3, false, &["10.0.0.10/8"]),
        ];

        let chosen = default_interface(&interfaces).expect("default interface");
        assert_eq!(chosen.name, "eth0");
    }

    #[test]
    fn test_default_interface_requires_a_candidate() {
        let interfaces = vec![sample_iface("lo", 1, true, &["127.0.0.1/8"])];
        assert!(default_interface(&interfaces).is_none());
        assert!(default_interface(&[]).is_none());
    }

    #[test]
    fn test_first_matching_gateway_picks_first_containing_route() {
        let routes = vec![
            // A default route has no destination and must be skipped.
            netlink::Route {
                destination: None,
                gateway: Some(Ipv4Addr::new(10, 0, 0, 1)),
            },
            netlink::Route {
                destination: Some("172.16.0.0/12".parse().unwrap()),
                gateway: Some(Ipv4Addr::new(172, 16, 0, 1)),
            },
            netlink::Route {
                destination: Some("192.168.0.0/16".parse().unwrap()),
                gateway: Some(Ipv4Addr::new(192, 168, 0, 1)),
            },
            netlink::Route {
                destination: Some("192.168.0.0/24".parse().unwrap()),
                gateway: Some(Ipv4Addr::new(192, 168, 0, 254)),
            },
        ];

        assert_eq!(
            first_matching_gateway(&routes, Ipv4Addr::new(192, 168, 0, 0)),
            Some(Ipv4Addr::new(192, 168, 0, 1))
        );
        assert_eq!(
            first_matching_gateway(&routes, Ipv4Addr::new(8, 8, 8, 8)),
            None
        );
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            NetworkError::InvalidConfig.kind(),
            crate::error::ErrorKind::InvalidSpec
        );
        assert_eq!(
            NetworkError::Exhausted {
                cidr: "10.0.0.0/32".parse().unwrap()
            }
            .kind(),
            crate::error::ErrorKind::ResourceExhausted
        );
        assert_eq!(
            NetworkError::AlreadyExists { name: "br0".into() }.kind(),
            crate::error::ErrorKind::AlreadyExists
        );
    }
}
