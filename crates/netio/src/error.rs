//! Error types for socket operations and proxy negotiation.

use std::io;

/// Failure reported by a proxy negotiation.
///
/// Each variant corresponds to a distinct point of failure in the tunnel
/// handshake. `Display` texts are what callers surface to the user, so a
/// server-reported refusal keeps the raw code alongside its description.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProxyError {
    /// The target hostname could not be resolved to an IPv4 address.
    #[error("cannot resolve target host address")]
    ResolveFailed,
    /// Sending a handshake frame to the proxy failed.
    #[error("sending data to the proxy server failed")]
    SendFailed,
    /// The proxy closed the connection or a receive failed mid-handshake.
    #[error("receiving data from the proxy server failed")]
    ReceiveFailed,
    /// The proxy sent bytes that do not form a valid reply.
    #[error("unexpected reply from the proxy server")]
    UnexpectedReply,
    /// The proxy insists on an authentication method we cannot speak.
    #[error("user/password authentication not supported")]
    AuthUnsupported,
    /// The proxy rejected the supplied credentials.
    #[error("proxy server rejected the login")]
    AuthRejected,
    /// The proxy type cannot open listening connections.
    #[error("listening is not supported through this proxy type")]
    ListenUnsupported,
    /// A SOCKS4 server answered with a non-granted reply code.
    #[error("{}", socks4_reply_text(*.0))]
    Socks4Refused(u8),
    /// A SOCKS5 server answered with a non-zero reply code.
    #[error("{}", socks5_reply_text(*.0))]
    Socks5Refused(u8),
    /// An HTTP proxy answered CONNECT with a non-2xx status line.
    #[error("{0}")]
    HttpRejected(String),
}

/// Human-readable text for a SOCKS4 reply code.
fn socks4_reply_text(code: u8) -> String {
    match code {
        91 => "request rejected or failed (91)".to_owned(),
        92 => "request failed, client identd not reachable (92)".to_owned(),
        93 => "request failed, identd reported a different user id (93)".to_owned(),
        other => format!("request failed with unknown reply code {other}"),
    }
}

/// Human-readable text for a SOCKS5 reply code.
fn socks5_reply_text(code: u8) -> String {
    match code {
        1 => "general SOCKS server failure (1)".to_owned(),
        2 => "connection not allowed by ruleset (2)".to_owned(),
        3 => "network unreachable (3)".to_owned(),
        4 => "host unreachable (4)".to_owned(),
        5 => "connection refused (5)".to_owned(),
        6 => "TTL expired (6)".to_owned(),
        7 => "command not supported (7)".to_owned(),
        8 => "address type not supported (8)".to_owned(),
        other => format!("request failed with unknown reply code {other}"),
    }
}

/// Error returned by socket object operations.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    /// The socket already holds an open handle.
    #[error("socket is already open")]
    AlreadyOpen,
    /// The operation needs an open handle and there is none.
    #[error("socket is not open")]
    NotOpen,
    /// The operation needs an established connection.
    #[error("socket is not connected")]
    NotConnected,
    /// The socket was never bound to a reactor slot.
    #[error("socket is not registered with a reactor")]
    NotRegistered,
    /// A caller-supplied endpoint cannot be used.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    /// The target hostname did not resolve to an IPv4 address.
    #[error("cannot resolve host address")]
    ResolveFailed,
    /// Tunnel negotiation through a proxy failed.
    #[error("proxy handshake failed: {0}")]
    Proxy(#[from] ProxyError),
    /// An OS-level socket call failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SocketError {
    /// Proxy failure carried by this error, if that is what it is.
    pub fn as_proxy(&self) -> Option<&ProxyError> {
        match self {
            SocketError::Proxy(p) => Some(p),
            _ => None,
        }
    }
}
