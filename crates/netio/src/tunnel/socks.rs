//! SOCKS4/4A/5 frame building and reply parsing.
//!
//! Builders return complete request frames; parsers work on a borrowed
//! prefix of the receive buffer and report how many bytes a complete reply
//! occupies, so unrelated bytes behind it are never touched.

use std::net::Ipv4Addr;

use crate::error::ProxyError;

/// SOCKS command: outbound connection.
pub(crate) const CMD_CONNECT: u8 = 1;
/// SOCKS command: listen for one inbound connection.
pub(crate) const CMD_BIND: u8 = 2;

/// SOCKS4 reply code for a granted request.
const SOCKS4_GRANTED: u8 = 90;

/// Progress of parsing one reply frame.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Parsed<T> {
    /// The buffer does not hold a complete frame yet.
    NeedMore,
    /// A complete frame: its value and how many bytes it consumed.
    Done(T, usize),
    /// The frame is complete and reports failure.
    Failed(ProxyError),
}

impl<T> Parsed<T> {
    /// Drops the payload, keeping completion and consumption.
    pub(crate) fn map_value(self) -> Parsed<()> {
        match self {
            Parsed::NeedMore => Parsed::NeedMore,
            Parsed::Failed(p) => Parsed::Failed(p),
            Parsed::Done(_, n) => Parsed::Done((), n),
        }
    }
}

/// `[4][cmd][port][ipv4][user]\0`
pub(crate) fn socks4_request(cmd: u8, ip: Ipv4Addr, port: u16, user: Option<&str>) -> Vec<u8> {
    let user = user.unwrap_or("");
    let mut frame = Vec::with_capacity(9 + user.len());
    frame.push(4);
    frame.push(cmd);
    frame.extend_from_slice(&port.to_be_bytes());
    frame.extend_from_slice(&ip.octets());
    push_truncated(&mut frame, user);
    frame.push(0);
    frame
}

/// SOCKS4A variant: the address field is the `0.0.0.1` sentinel and the
/// hostname follows the user field, both NUL-terminated.
pub(crate) fn socks4a_request(cmd: u8, host: &str, port: u16, user: Option<&str>) -> Vec<u8> {
    let user = user.unwrap_or("");
    let mut frame = Vec::with_capacity(10 + user.len() + host.len());
    frame.push(4);
    frame.push(cmd);
    frame.extend_from_slice(&port.to_be_bytes());
    frame.extend_from_slice(&[0, 0, 0, 1]);
    push_truncated(&mut frame, user);
    frame.push(0);
    push_truncated(&mut frame, host);
    frame.push(0);
    frame
}

/// Eight-byte SOCKS4 reply. Carries the proxy-assigned address, which only
/// BIND replies put to use.
pub(crate) fn parse_socks4_reply(buf: &[u8]) -> Parsed<(Ipv4Addr, u16)> {
    if buf.len() < 8 {
        return Parsed::NeedMore;
    }
    if buf[0] != 0 {
        return Parsed::Failed(ProxyError::UnexpectedReply);
    }
    if buf[1] != SOCKS4_GRANTED {
        return Parsed::Failed(ProxyError::Socks4Refused(buf[1]));
    }
    let port = u16::from_be_bytes([buf[2], buf[3]]);
    let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
    Parsed::Done((ip, port), 8)
}

/// Method offer: just "no authentication", or that plus username/password.
pub(crate) fn socks5_method_offer(with_login: bool) -> Vec<u8> {
    if with_login {
        vec![5, 2, 0, 2]
    } else {
        vec![5, 1, 0]
    }
}

/// Server's method selection. `Done` carries the chosen method byte.
pub(crate) fn parse_socks5_method(buf: &[u8]) -> Parsed<u8> {
    if buf.len() < 2 {
        return Parsed::NeedMore;
    }
    if buf[0] != 5 {
        return Parsed::Failed(ProxyError::UnexpectedReply);
    }
    Parsed::Done(buf[1], 2)
}

/// RFC 1929 username/password request.
pub(crate) fn socks5_auth_request(user: &str, password: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(3 + user.len() + password.len());
    frame.push(1);
    let ulen = user.len().min(255);
    frame.push(ulen as u8);
    frame.extend_from_slice(&user.as_bytes()[..ulen]);
    let plen = password.len().min(255);
    frame.push(plen as u8);
    frame.extend_from_slice(&password.as_bytes()[..plen]);
    frame
}

/// Two-byte auth status reply; any non-zero status is a rejection.
pub(crate) fn parse_socks5_auth_reply(buf: &[u8]) -> Parsed<()> {
    if buf.len() < 2 {
        return Parsed::NeedMore;
    }
    if buf[1] != 0 {
        return Parsed::Failed(ProxyError::AuthRejected);
    }
    Parsed::Done((), 2)
}

/// CONNECT/BIND request addressed by IPv4.
pub(crate) fn socks5_request_ip(cmd: u8, ip: Ipv4Addr, port: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(10);
    frame.extend_from_slice(&[5, cmd, 0, 1]);
    frame.extend_from_slice(&ip.octets());
    frame.extend_from_slice(&port.to_be_bytes());
    frame
}

/// CONNECT request addressed by hostname; the proxy resolves it.
pub(crate) fn socks5_request_host(cmd: u8, host: &str, port: u16) -> Vec<u8> {
    let len = host.len().min(255);
    let mut frame = Vec::with_capacity(7 + len);
    frame.extend_from_slice(&[5, cmd, 0, 3]);
    frame.push(len as u8);
    frame.extend_from_slice(&host.as_bytes()[..len]);
    frame.extend_from_slice(&port.to_be_bytes());
    frame
}

/// Ten-byte SOCKS5 reply with an IPv4 bound address.
///
/// A failure code is reported as soon as the first four header bytes are
/// in; a reply with any other address type is unexpected, replies here are
/// always IPv4.
pub(crate) fn parse_socks5_reply(buf: &[u8]) -> Parsed<(Ipv4Addr, u16)> {
    if buf.len() < 4 {
        return Parsed::NeedMore;
    }
    if buf[0] != 5 {
        return Parsed::Failed(ProxyError::UnexpectedReply);
    }
    if buf[1] != 0 {
        return Parsed::Failed(ProxyError::Socks5Refused(buf[1]));
    }
    if buf[3] != 1 {
        return Parsed::Failed(ProxyError::UnexpectedReply);
    }
    if buf.len() < 10 {
        return Parsed::NeedMore;
    }
    let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
    let port = u16::from_be_bytes([buf[8], buf[9]]);
    Parsed::Done((ip, port), 10)
}

fn push_truncated(frame: &mut Vec<u8>, text: &str) {
    let len = text.len().min(255);
    frame.extend_from_slice(&text.as_bytes()[..len]);
}
