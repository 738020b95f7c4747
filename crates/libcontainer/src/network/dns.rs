//! DNS discovery and server validation.
//!
//! The default resolver comes from `/etc/resolv.conf`; before a container is
//! attached to a network its DNS server is exercised with a real A query so
//! a dead resolver fails the connect instead of the workload.

use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ErrorKind;

const RESOLV_CONF: &str = "/etc/resolv.conf";
const DNS_PORT: u16 = 53;
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Queried during the server self-test; any resolvable name works.
const PROBE_DOMAIN: &str = "example.com";

const TYPE_A: u16 = 1;
const TYPE_AAAA: u16 = 28;
const CLASS_IN: u16 = 1;

#[derive(thiserror::Error, Debug)]
pub enum DnsError {
    #[error("failed to read {path}: {err}")]
    Read {
        path: PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("failed to exchange with DNS server {server}: {err}")]
    Io {
        server: IpAddr,
        #[source]
        err: io::Error,
    },
    #[error("timed out waiting for a response from DNS server {server}")]
    Timeout { server: IpAddr },
    #[error("malformed DNS response: {reason}")]
    Malformed { reason: &'static str },
    #[error("DNS response is not a reply")]
    NotAResponse,
    #[error("DNS server answered with rcode {rcode}")]
    Rcode { rcode: u8 },
}

impl DnsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DnsError::Timeout { .. } => ErrorKind::Timeout,
            _ => ErrorKind::KernelIo,
        }
    }
}

/// Returns the first nameserver listed in `/etc/resolv.conf`, or `None`
/// when no directive parses.
pub fn default_dns() -> Result<Option<IpAddr>, DnsError> {
    let content = fs::read_to_string(RESOLV_CONF).map_err(|err| DnsError::Read {
        path: PathBuf::from(RESOLV_CONF),
        err,
    })?;
    Ok(parse_resolv_conf(&content))
}

fn parse_resolv_conf(content: &str) -> Option<IpAddr> {
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        if fields.next() != Some("nameserver") {
            continue;
        }
        if let Some(addr) = fields.next().and_then(|token| token.parse().ok()) {
            return Some(addr);
        }
    }
    None
}

/// Self-test against a DNS server: send an A query for a well-known name
/// and require a well-formed reply within the timeout.
pub fn check_server(server: IpAddr) -> Result<(), DnsError> {
    let local: SocketAddr = match server {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let io_err = |err| DnsError::Io { server, err };

    let socket = UdpSocket::bind(local).map_err(io_err)?;
    socket.connect((server, DNS_PORT)).map_err(io_err)?;
    socket
        .set_read_timeout(Some(RESPONSE_TIMEOUT))
        .map_err(io_err)?;

    let query = build_query(PROBE_DOMAIN, TYPE_A);
    socket.send(&query).map_err(io_err)?;

    let mut buf = [0u8; 512];
    let n = socket.recv(&mut buf).map_err(|err| {
        if matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        ) {
            DnsError::Timeout { server }
        } else {
            DnsError::Io { server, err }
        }
    })?;

    for answer in parse_response(&buf[..n])? {
        if answer.rtype == TYPE_A {
            tracing::debug!(name = %answer.name, data = ?answer.data, ttl = answer.ttl, "dns answer");
        }
    }
    Ok(())
}

/// A single query with a random id and recursion desired.
fn build_query(domain: &str, qtype: u16) -> Vec<u8> {
    let id: u16 = rand::random();

    let mut message = Vec::with_capacity(12 + domain.len() + 6);
    message.extend_from_slice(&id.to_be_bytes());
    message.extend_from_slice(&[0x01, 0x00]); // recursion desired
    message.extend_from_slice(&1u16.to_be_bytes()); // one question
    message.extend_from_slice(&[0u8; 6]); // no answer/authority/additional

    for label in domain.split('.') {
        message.push(label.len() as u8);
        message.extend_from_slice(label.as_bytes());
    }
    message.push(0);
    message.extend_from_slice(&qtype.to_be_bytes());
    message.extend_from_slice(&CLASS_IN.to_be_bytes());
    message
}

#[derive(Debug, PartialEq, Eq)]
struct Answer {
    name: String,
    rtype: u16,
    ttl: u32,
    data: Option<IpAddr>,
}

fn be16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

fn parse_response(response: &[u8]) -> Result<Vec<Answer>, DnsError> {
    if response.len() < 12 {
        return Err(DnsError::Malformed {
            reason: "response shorter than the header",
        });
    }
    if response[2] & 0x80 == 0 {
        return Err(DnsError::NotAResponse);
    }
    let rcode = response[3] & 0x0F;
    if rcode != 0 {
        return Err(DnsError::Rcode { rcode });
    }

    let qdcount = be16(&response[4..6]);
    let ancount = be16(&response[6..8]);

    let mut offset = 12;
    for _ in 0..qdcount {
        let (_, end) = read_name(response, offset)?;
        // QTYPE and QCLASS trail every question.
        offset = end + 4;
    }

    let mut answers = Vec::with_capacity(ancount as usize);
    for _ in 0..ancount {
        let (name, end) = read_name(response, offset)?;
        if response.len() < end + 10 {
            return Err(DnsError::Malformed {
                reason: "truncated answer record",
            });
        }
        let rtype = be16(&response[end..end + 2]);
        let ttl = u32::from_be_bytes([
            response[end + 4],
            response[end + 5],
            response[end + 6],
            response[end + 7],
        ]);
        let rdlength = be16(&response[end + 8..end + 10]) as usize;
        let rdata_start = end + 10;
        if response.len() < rdata_start + rdlength {
            return Err(DnsError::Malformed {
                reason: "truncated rdata",
            });
        }
        let rdata = &response[rdata_start..rdata_start + rdlength];

        let data = match (rtype, rdlength) {
            (TYPE_A, 4) => {
                Some(IpAddr::V4(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3])))
            }
            (TYPE_AAAA, 16) => {
                let octets: [u8; 16] = rdata.try_into().unwrap();
                Some(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            _ => None,
        };

        answers.push(Answer {
            name,
            rtype,
            ttl,
            data,
        });
        offset = rdata_start + rdlength;
    }

    Ok(answers)
}

/// Reads a possibly compressed domain name, returning the name and the
/// offset just past it.
fn read_name(data: &[u8], mut offset: usize) -> Result<(String, usize), DnsError> {
    let overrun = || DnsError::Malformed {
        reason: "name runs past the end of the message",
    };

    let mut labels = Vec::new();
    loop {
        let length = *data.get(offset).ok_or_else(overrun)? as usize;
        if length == 0 {
            offset += 1;
            break;
        }
        if length & 0xC0 == 0xC0 {
            let second = *data.get(offset + 1).ok_or_else(overrun)? as usize;
            let pointer = ((length & 0x3F) << 8) | second;
            if pointer >= offset {
                return Err(DnsError::Malformed {
                    reason: "compression pointer does not point backwards",
                });
            }
            let (suffix, _) = read_name(data, pointer)?;
            labels.push(suffix);
            return Ok((labels.join("."), offset + 2));
        }

        offset += 1;
        let label = data.get(offset..offset + length).ok_or_else(overrun)?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        offset += length;
    }

    Ok((labels.join("."), offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resolv_conf_first_nameserver() {
        let content = "\
# generated by NetworkManager
search example.internal
nameserver 10.0.0.53
nameserver 10.0.0.54";
        assert_eq!(
            parse_resolv_conf(content),
            Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 53)))
        );
    }

    #[test]
    fn test_parse_resolv_conf_skips_unparseable_entries() {
        let content = "nameserver not-an-address\nnameserver ::1\n";
        assert_eq!(parse_resolv_conf(content), Some(IpAddr::V6(Ipv6Addr::LOCALHOST)));
    }

    #[test]
    fn test_parse_resolv_conf_without_directive() {
        assert_eq!(parse_resolv_conf("search example.internal\n"), None);
    }

    #[test]
    fn test_build_query_layout() {
        let query = build_query("example.com", TYPE_A);

        // header flags: recursion desired, one question
        assert_eq!(&query[2..4], &[0x01, 0x00]);
        assert_eq!(be16(&query[4..6]), 1);
        // question: 7"example"3"com"0 + type + class
        assert_eq!(query[12], 7);
        assert_eq!(&query[13..20], b"example");
        assert_eq!(query[20], 3);
        assert_eq!(&query[21..24], b"com");
        assert_eq!(query[24], 0);
        assert_eq!(be16(&query[25..27]), TYPE_A);
        assert_eq!(be16(&query[27..29]), CLASS_IN);
        assert_eq!(query.len(), 29);
    }

    /// A response for example.com with one A answer using name compression.
    fn sample_response() -> Vec<u8> {
        let mut response = Vec::new();
        response.extend_from_slice(&0x1234u16.to_be_bytes());
        response.extend_from_slice(&[0x81, 0x80]); // response, recursion available
        response.extend_from_slice(&1u16.to_be_bytes()); // one question
        response.extend_from_slice(&1u16.to_be_bytes()); // one answer
        response.extend_from_slice(&[0u8; 4]);
        // question
        response.push(7);
        response.extend_from_slice(b"example");
        response.push(3);
        response.extend_from_slice(b"com");
        response.push(0);
        response.extend_from_slice(&TYPE_A.to_be_bytes());
        response.extend_from_slice(&CLASS_IN.to_be_bytes());
        // answer, name compressed to offset 12
        response.extend_from_slice(&[0xC0, 0x0C]);
        response.extend_from_slice(&TYPE_A.to_be_bytes());
        response.extend_from_slice(&CLASS_IN.to_be_bytes());
        response.extend_from_slice(&300u32.to_be_bytes());
        response.extend_from_slice(&4u16.to_be_bytes());
        response.extend_from_slice(&[93, 184, 216, 34]);
        response
    }

    #[test]
    fn test_parse_response_with_compression() {
        let answers = parse_response(&sample_response()).expect("parse response");

        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].name, "example.com");
        assert_eq!(answers[0].rtype, TYPE_A);
        assert_eq!(answers[0].ttl, 300);
        assert_eq!(
            answers[0].data,
            Some(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)))
        );
    }

    #[test]
    fn test_parse_response_rejects_query() {
        let query = build_query("example.com", TYPE_A);
        assert!(matches!(
            parse_response(&query).unwrap_err(),
            DnsError::NotAResponse
        ));
    }

    #[test]
    fn test_parse_response_surfaces_rcode() {
        let mut response = sample_response();
        response[3] |= 0x03; // NXDOMAIN
        assert!(matches!(
            parse_response(&response).unwrap_err(),
            DnsError::Rcode { rcode: 3 }
        ));
    }

    #[test]
    fn test_parse_response_rejects_forward_pointer() {
        let mut response = sample_response();
        // Redirect the answer name pointer forward into itself.
        let pointer_at = 12 + 17; // question is 17 bytes
        response[pointer_at] = 0xC0;
        response[pointer_at + 1] = 0xFF;
        assert!(parse_response(&response).is_err());
    }

    #[test]
    fn test_parse_short_response() {
        assert!(matches!(
            parse_response(&[0u8; 5]).unwrap_err(),
            DnsError::Malformed { .. }
        ));
    }
}
