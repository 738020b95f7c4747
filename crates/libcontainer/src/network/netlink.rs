//! Minimal rtnetlink client.
//!
//! Spocker needs five route-socket operations (address add, default-route
//! add, route dump, link down, link delete), so the messages are serialized
//! by hand over a raw NETLINK_ROUTE socket instead of pulling in a netlink
//! stack. Encoding and decoding are plain byte manipulation and unit-tested
//! without a socket.

use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, OwnedFd};

use nix::errno::Errno;
use nix::sys::socket::{
    bind, recv, send, socket, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol,
    SockType,
};

use super::Ipv4Net;

const NLMSG_HDRLEN: usize = 16;
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;

const RTM_NEWLINK: u16 = 16;
const RTM_DELLINK: u16 = 17;
const RTM_NEWADDR: u16 = 20;
const RTM_NEWROUTE: u16 = 24;
const RTM_GETROUTE: u16 = 26;

const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_ACK: u16 = 0x04;
const NLM_F_EXCL: u16 = 0x200;
const NLM_F_CREATE: u16 = 0x400;
// NLM_F_ROOT | NLM_F_MATCH
const NLM_F_DUMP: u16 = 0x300;

const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;

const RTA_DST: u16 = 1;
const RTA_GATEWAY: u16 = 5;

const RT_TABLE_MAIN: u8 = 254;
const RTPROT_BOOT: u8 = 3;
const RT_SCOPE_UNIVERSE: u8 = 0;
const RTN_UNICAST: u8 = 1;

#[derive(thiserror::Error, Debug)]
pub enum NetlinkError {
    #[error("netlink socket failure: {0}")]
    Socket(#[from] nix::Error),
    #[error("kernel rejected netlink request: {0}")]
    Kernel(Errno),
    #[error("truncated netlink response")]
    Truncated,
}

/// One entry of the kernel routing table, reduced to the fields gateway
/// discovery needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub destination: Option<Ipv4Net>,
    pub gateway: Option<Ipv4Addr>,
}

/// Adds `addr/prefix` to the link with the given interface index.
pub fn add_address(ifindex: u32, addr: Ipv4Addr, prefix: u8) -> Result<(), NetlinkError> {
    let mut conn = Connection::open()?;
    let message = encode_add_address(conn.next_seq(), ifindex, addr, prefix);
    conn.send(&message)?;
    conn.read_ack()
}

/// Installs a default route via `gateway` into the main table.
pub fn add_default_route(gateway: Ipv4Addr) -> Result<(), NetlinkError> {
    let mut conn = Connection::open()?;
    let message = encode_add_default_route(conn.next_seq(), gateway);
    conn.send(&message)?;
    conn.read_ack()
}

/// Dumps the IPv4 routing table.
pub fn route_dump() -> Result<Vec<Route>, NetlinkError> {
    let mut conn = Connection::open()?;
    let message = encode_route_dump(conn.next_seq());
    conn.send(&message)?;

    let mut routes = Vec::new();
    loop {
        let buf = conn.recv()?;
        let done = parse_route_messages(&buf, &mut routes)?;
        if done {
            return Ok(routes);
        }
    }
}

/// Clears IFF_UP on the link.
pub fn set_link_down(ifindex: u32) -> Result<(), NetlinkError> {
    let mut conn = Connection::open()?;
    let message = encode_link_flags(conn.next_seq(), ifindex, 0, libc::IFF_UP as u32);
    conn.send(&message)?;
    conn.read_ack()
}

/// Deletes the link from the kernel.
pub fn delete_link(ifindex: u32) -> Result<(), NetlinkError> {
    let mut conn = Connection::open()?;
    let message = encode_delete_link(conn.next_seq(), ifindex);
    conn.send(&message)?;
    conn.read_ack()
}

struct Connection {
    fd: OwnedFd,
    seq: u32,
}

impl Connection {
    fn open() -> Result<Connection, NetlinkError> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkRoute,
        )?;
        bind(fd.as_raw_fd(), &NetlinkAddr::new(0, 0))?;
        Ok(Connection { fd, seq: 0 })
    }

    fn next_seq(&mut self) -> u32 {
        self.seq += 1;
        self.seq
    }

    fn send(&self, message: &[u8]) -> Result<(), NetlinkError> {
        send(self.fd.as_raw_fd(), message, MsgFlags::empty())?;
        Ok(())
    }

    fn recv(&self) -> Result<Vec<u8>, NetlinkError> {
        let mut buf = vec![0u8; 8192];
        let n = recv(self.fd.as_raw_fd(), &mut buf, MsgFlags::empty())?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Reads one response and expects an ACK (an NLMSG_ERROR with code 0).
    fn read_ack(&self) -> Result<(), NetlinkError> {
        let buf = self.recv()?;
        let mut messages = MessageIter::new(&buf);
        while let Some(message) = messages.next()? {
            if message.msg_type == NLMSG_ERROR {
                if message.payload.len() < 4 {
                    return Err(NetlinkError::Truncated);
                }
                let code = i32::from_ne_bytes(message.payload[..4].try_into().unwrap());
                if code == 0 {
                    return Ok(());
                }
                return Err(NetlinkError::Kernel(Errno::from_i32(-code)));
            }
        }
        Err(NetlinkError::Truncated)
    }
}

fn align(len: usize) -> usize {
    (len + 3) & !3
}

/// Serialized netlink message: a 16-byte nlmsghdr whose length is patched
/// on finish, followed by the ancillary header and attributes.
struct MessageBuilder {
    buf: Vec<u8>,
}

impl MessageBuilder {
    fn new(msg_type: u16, flags: u16, seq: u32) -> MessageBuilder {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&0u32.to_ne_bytes()); // length, patched later
        buf.extend_from_slice(&msg_type.to_ne_bytes());
        buf.extend_from_slice(&flags.to_ne_bytes());
        buf.extend_from_slice(&seq.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes()); // pid, kernel fills it in
        MessageBuilder { buf }
    }

    fn raw(mut self, bytes: &[u8]) -> MessageBuilder {
        self.buf.extend_from_slice(bytes);
        self
    }

    fn attr(mut self, kind: u16, payload: &[u8]) -> MessageBuilder {
        let len = 4 + payload.len();
        self.buf.extend_from_slice(&(len as u16).to_ne_bytes());
        self.buf.extend_from_slice(&kind.to_ne_bytes());
        self.buf.extend_from_slice(payload);
        self.buf.resize(align(self.buf.len()), 0);
        self
    }

    fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[..4].copy_from_slice(&len.to_ne_bytes());
        self.buf
    }
}

// struct ifaddrmsg
fn ifaddrmsg(family: u8, prefixlen: u8, index: u32) -> [u8; 8] {
    let mut header = [0u8; 8];
    header[0] = family;
    header[1] = prefixlen;
    // flags and scope stay zero
    header[4..8].copy_from_slice(&index.to_ne_bytes());
    header
}

// struct rtmsg
fn rtmsg(family: u8, dst_len: u8, table: u8, protocol: u8, scope: u8, rtype: u8) -> [u8; 12] {
    let mut header = [0u8; 12];
    header[0] = family;
    header[1] = dst_len;
    header[4] = table;
    header[5] = protocol;
    header[6] = scope;
    header[7] = rtype;
    header
}

// struct ifinfomsg
fn ifinfomsg(index: u32, flags: u32, change: u32) -> [u8; 16] {
    let mut header = [0u8; 16];
    header[0] = libc::AF_UNSPEC as u8;
    header[4..8].copy_from_slice(&(index as i32).to_ne_bytes());
    header[8..12].copy_from_slice(&flags.to_ne_bytes());
    header[12..16].copy_from_slice(&change.to_ne_bytes());
    header
}

fn encode_add_address(seq: u32, ifindex: u32, addr: Ipv4Addr, prefix: u8) -> Vec<u8> {
    MessageBuilder::new(
        RTM_NEWADDR,
        NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
        seq,
    )
    .raw(&ifaddrmsg(libc::AF_INET as u8, prefix, ifindex))
    .attr(IFA_LOCAL, &addr.octets())
    .attr(IFA_ADDRESS, &addr.octets())
    .finish()
}

fn encode_add_default_route(seq: u32, gateway: Ipv4Addr) -> Vec<u8> {
    MessageBuilder::new(
        RTM_NEWROUTE,
        NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
        seq,
    )
    .raw(&rtmsg(
        libc::AF_INET as u8,
        0,
        RT_TABLE_MAIN,
        RTPROT_BOOT,
        RT_SCOPE_UNIVERSE,
        RTN_UNICAST,
    ))
    .attr(RTA_GATEWAY, &gateway.octets())
    .finish()
}

fn encode_route_dump(seq: u32) -> Vec<u8> {
    MessageBuilder::new(RTM_GETROUTE, NLM_F_REQUEST | NLM_F_DUMP, seq)
        .raw(&rtmsg(libc::AF_UNSPEC as u8, 0, 0, 0, 0, 0))
        .finish()
}

fn encode_link_flags(seq: u32, ifindex: u32, flags: u32, change: u32) -> Vec<u8> {
    MessageBuilder::new(RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK, seq)
        .raw(&ifinfomsg(ifindex, flags, change))
        .finish()
}

fn encode_delete_link(seq: u32, ifindex: u32) -> Vec<u8> {
    MessageBuilder::new(RTM_DELLINK, NLM_F_REQUEST | NLM_F_ACK, seq)
        .raw(&ifinfomsg(ifindex, 0, 0))
        .finish()
}

struct ParsedMessage<'a> {
    msg_type: u16,
    payload: &'a [u8],
}

struct MessageIter<'a> {
    buf: &'a [u8],
}

impl<'a> MessageIter<'a> {
    fn new(buf: &'a [u8]) -> MessageIter<'a> {
        MessageIter { buf }
    }

    #[allow(clippy::should_implement_trait)]
    fn next(&mut self) -> Result<Option<ParsedMessage<'a>>, NetlinkError> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        if self.buf.len() < NLMSG_HDRLEN {
            return Err(NetlinkError::Truncated);
        }

        let len = u32::from_ne_bytes(self.buf[..4].try_into().unwrap()) as usize;
        let msg_type = u16::from_ne_bytes(self.buf[4..6].try_into().unwrap());
        if len < NLMSG_HDRLEN || len > self.buf.len() {
            return Err(NetlinkError::Truncated);
        }

        let payload = &self.buf[NLMSG_HDRLEN..len];
        self.buf = &self.buf[align(len).min(self.buf.len())..];
        Ok(Some(ParsedMessage { msg_type, payload }))
    }
}

/// Parses the RTM_NEWROUTE messages in one datagram into `routes`. Returns
/// true once NLMSG_DONE ends the dump.
fn parse_route_messages(buf: &[u8], routes: &mut Vec<Route>) -> Result<bool, NetlinkError> {
    let mut messages = MessageIter::new(buf);
    while let Some(message) = messages.next()? {
        match message.msg_type {
            NLMSG_DONE => return Ok(true),
            NLMSG_ERROR => {
                if message.payload.len() < 4 {
                    return Err(NetlinkError::Truncated);
                }
                let code = i32::from_ne_bytes(message.payload[..4].try_into().unwrap());
                if code != 0 {
                    return Err(NetlinkError::Kernel(Errno::from_i32(-code)));
                }
            }
            RTM_NEWROUTE => {
                if let Some(route) = parse_route(message.payload)? {
                    routes.push(route);
                }
            }
            _ => {}
        }
    }
    Ok(false)
}

/// Reduces one route message to destination and gateway; non-IPv4 routes
/// are skipped.
fn parse_route(payload: &[u8]) -> Result<Option<Route>, NetlinkError> {
    if payload.len() < 12 {
        return Err(NetlinkError::Truncated);
    }
    let family = payload[0];
    let dst_len = payload[1];
    if u16::from(family) != libc::AF_INET as u16 {
        return Ok(None);
    }

    let mut destination = None;
    let mut gateway = None;
    let mut attrs = &payload[12..];
    while attrs.len() >= 4 {
        let len = u16::from_ne_bytes(attrs[..2].try_into().unwrap()) as usize;
        let kind = u16::from_ne_bytes(attrs[2..4].try_into().unwrap());
        if len < 4 || len > attrs.len() {
            return Err(NetlinkError::Truncated);
        }
        let value = &attrs[4..len];

        match kind {
            RTA_DST if value.len() == 4 => {
                let addr = Ipv4Addr::new(value[0], value[1], value[2], value[3]);
                destination = Some(Ipv4Net::new(addr, dst_len));
            }
            RTA_GATEWAY if value.len() == 4 => {
                gateway = Some(Ipv4Addr::new(value[0], value[1], value[2], value[3]));
            }
            _ => {}
        }

        attrs = &attrs[align(len).min(attrs.len())..];
    }

    Ok(Some(Route {
        destination,
        gateway,
    }))
}
