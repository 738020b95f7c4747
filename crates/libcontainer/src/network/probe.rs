//! Address-in-use detection via ARP.
//!
//! Before an address is handed to a container, a broadcast ARP request is
//! sent on the default interface; a reply within one second means the
//! address is claimed. Probe failures count as "in use" so that collisions
//! are preferred over false negatives.

use std::io;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::{Duration, Instant};

const ARP_PACKET_LEN: usize = 28;
const ARP_OPERATION_REQUEST: u16 = 1;
const ARP_OPERATION_REPLY: u16 = 2;
const BROADCAST_MAC: [u8; 6] = [0xFF; 6];
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Test seam for address probing; the launch path uses [`ArpProbe`].
pub trait AddressProbe {
    /// Reports whether `addr` is already claimed on the local segment.
    fn in_use(&self, addr: Ipv4Addr) -> bool;
}

/// The real probe. Any interface or socket error is reported as "in use".
#[derive(Clone, Copy, Debug, Default)]
pub struct ArpProbe;

impl AddressProbe for ArpProbe {
    fn in_use(&self, addr: Ipv4Addr) -> bool {
        match probe(addr) {
            Ok(in_use) => in_use,
            Err(err) => {
                tracing::warn!("arp probe failed, treating {addr} as in use: {err}");
                true
            }
        }
    }
}

#[derive(thiserror::Error, Debug)]
enum ProbeError {
    #[error("no non-loopback interface with an IPv4 address and MAC")]
    NoInterface,
    #[error("failed to enumerate interfaces: {0}")]
    Interfaces(#[source] nix::Error),
    #[error("failed to {op}: {err}")]
    Socket {
        op: &'static str,
        #[source]
        err: io::Error,
    },
}

fn probe(target: Ipv4Addr) -> Result<bool, ProbeError> {
    let (ifindex, source_mac, source_ip) = probe_interface()?;
    let socket = ArpSocket::open(ifindex)?;

    let request = build_request(source_mac, source_ip, target);
    socket.send_broadcast(&request)?;

    // Collect replies until the window closes; anything that is not a
    // matching reply is ignored.
    let deadline = Instant::now() + PROBE_TIMEOUT;
    let mut buf = [0u8; 64];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(false);
        }
        match socket.recv(&mut buf, remaining)? {
            None => return Ok(false),
            Some(n) => {
                if let Some(reply) = parse_packet(&buf[..n]) {
                    if reply.operation == ARP_OPERATION_REPLY && reply.target_ip == target {
                        return Ok(true);
                    }
                }
            }
        }
    }
}

/// The probe runs on the lowest-index interface that is not loopback and
/// carries both an IPv4 address and a hardware address.
fn probe_interface() -> Result<(u32, [u8; 6], Ipv4Addr), ProbeError> {
    let interfaces = super::interfaces().map_err(ProbeError::Interfaces)?;
    interfaces
        .iter()
        .filter(|iface| !iface.loopback)
        .find_map(|iface| {
            let mac = iface.mac?;
            let net = iface.ipv4.first()?;
            Some((iface.index, mac, net.addr))
        })
        .ok_or(ProbeError::NoInterface)
}

/// A datagram AF_PACKET socket bound to one interface: the kernel supplies
/// the ethernet framing, so payloads are bare ARP packets.
struct ArpSocket {
    fd: OwnedFd,
    ifindex: u32,
}

impl ArpSocket {
    fn open(ifindex: u32) -> Result<ArpSocket, ProbeError> {
        let proto = (libc::ETH_P_ARP as u16).to_be() as i32;
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
                proto,
            )
        };
        if fd < 0 {
            return Err(ProbeError::Socket {
                op: "open packet socket",
                err: io::Error::last_os_error(),
            });
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_protocol = (libc::ETH_P_ARP as u16).to_be();
        sll.sll_ifindex = ifindex as i32;
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(ProbeError::Socket {
                op: "bind packet socket",
                err: io::Error::last_os_error(),
            });
        }

        Ok(ArpSocket { fd, ifindex })
    }

    fn send_broadcast(&self, packet: &[u8]) -> Result<(), ProbeError> {
        let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_protocol = (libc::ETH_P_ARP as u16).to_be();
        sll.sll_ifindex = self.ifindex as i32;
        sll.sll_halen = 6;
        sll.sll_addr[..6].copy_from_slice(&BROADCAST_MAC);

        let rc = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                packet.as_ptr() as *const libc::c_void,
                packet.len(),
                0,
                &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(ProbeError::Socket {
                op: "send arp request",
                err: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    /// Receives one packet, waiting at most `timeout`. `None` on timeout.
    fn recv(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>, ProbeError> {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        let rc = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(ProbeError::Socket {
                op: "set receive timeout",
                err: io::Error::last_os_error(),
            });
        }

        let n = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Ok(None),
                io::ErrorKind::Interrupted => Ok(Some(0)),
                _ => Err(ProbeError::Socket {
                    op: "receive arp reply",
                    err,
                }),
            };
        }
        Ok(Some(n as usize))
    }
}

struct ArpPacket {
    operation: u16,
    target_ip: Ipv4Addr,
}

/// Ethernet/IPv4 ARP request: hardware type 1, protocol 0x0800, targeting
/// the candidate with the broadcast destination.
fn build_request(source_mac: [u8; 6], source_ip: Ipv4Addr, target: Ipv4Addr) -> Vec<u8> {
    let mut packet = Vec::with_capacity(ARP_PACKET_LEN);
    packet.extend_from_slice(&1u16.to_be_bytes()); // ethernet
    packet.extend_from_slice(&(libc::ETH_P_IP as u16).to_be_bytes());
    packet.push(6); // hardware address length
    packet.push(4); // protocol address length
    packet.extend_from_slice(&ARP_OPERATION_REQUEST.to_be_bytes());
    packet.extend_from_slice(&source_mac);
    packet.extend_from_slice(&source_ip.octets());
    packet.extend_from_slice(&BROADCAST_MAC);
    packet.extend_from_slice(&target.octets());
    packet
}

fn parse_packet(packet: &[u8]) -> Option<ArpPacket> {
    if packet.len() < ARP_PACKET_LEN {
        return None;
    }
    let operation = u16::from_be_bytes([packet[6], packet[7]]);
    let target_ip = Ipv4Addr::new(packet[24], packet[25], packet[26], packet[27]);
    Some(ArpPacket {
        operation,
        target_ip,
    })
}
