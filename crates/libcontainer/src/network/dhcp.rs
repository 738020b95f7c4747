//! Log-only DHCPv6 listener.
//!
//! DHCP-flagged networks start a listener on the DHCPv6 server port that
//! decodes and logs every incoming message; no leases are served. The
//! listener thread lives for the rest of the process.

use std::io;
use std::net::UdpSocket;
use std::thread;

const DHCPV6_SERVER_PORT: u16 = 547;

/// Binds the DHCPv6 server port on the IPv6 loopback and spawns the
/// listener thread. Fails when the port is taken, which doubles as the
/// one-listener-per-host guard.
pub fn spawn_listener() -> Result<(), io::Error> {
    let socket = UdpSocket::bind(("::1", DHCPV6_SERVER_PORT))?;
    thread::Builder::new()
        .name("dhcp6-listener".into())
        .spawn(move || listen(socket))?;
    Ok(())
}

fn listen(socket: UdpSocket) {
    let mut buf = [0u8; 1500];
    loop {
        match socket.recv_from(&mut buf) {
            Ok((n, peer)) => {
                tracing::info!(%peer, "dhcpv6: {}", summarize(&buf[..n]));
            }
            Err(err) => {
                tracing::warn!("dhcpv6 listener read failed: {err}");
                return;
            }
        }
    }
}

/// DHCPv6 messages open with a one-byte type and a three-byte transaction
/// id.
fn summarize(message: &[u8]) -> String {
    if message.len() < 4 {
        return format!("short message ({} bytes)", message.len());
    }
    let xid = u32::from_be_bytes([0, message[1], message[2], message[3]]);
    format!(
        "{} (xid {:#08x}, {} bytes)",
        message_type_name(message[0]),
        xid,
        message.len()
    )
}

fn message_type_name(typ: u8) -> &'static str {
    match typ {
        1 => "solicit",
        2 => "advertise",
        3 => "request",
        4 => "confirm",
        5 => "renew",
        6 => "rebind",
        7 => "reply",
        8 => "release",
        9 => "decline",
        10 => "reconfigure",
        11 => "information-request",
        12 => "relay-forw",
        13 => "relay-repl",
        _ => "unknown",
    }
}
