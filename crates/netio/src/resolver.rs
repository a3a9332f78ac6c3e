//! Blocking hostname resolution kept off the reactor thread.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread;

use tracing::{debug, trace};

use crate::socket::SocketCore;

/// Resolves `host` on a helper thread and reports back through
/// `SocketCore::complete_resolution`, which posts into the reactor.
pub(crate) fn spawn(core: Arc<SocketCore>, host: String) {
    let on_thread = Arc::clone(&core);
    let spawned = thread::Builder::new()
        .name("netio-resolve".to_owned())
        .spawn(move || {
            let outcome = resolve_ipv4(&host);
            match &outcome {
                Ok(ip) => trace!(host = %host, ip = %ip, "host resolved"),
                Err(e) => debug!(host = %host, error = %e, "host resolution failed"),
            }
            on_thread.complete_resolution(outcome);
        });
    if let Err(e) = spawned {
        core.complete_resolution(Err(e));
    }
}

/// First IPv4 address of `host`. The engine speaks IPv4 on the wire
/// (PORT/PASV carry dotted quads), so IPv6 records are skipped.
fn resolve_ipv4(host: &str) -> io::Result<Ipv4Addr> {
    let addrs = (host, 0u16).to_socket_addrs()?;
    for addr in addrs {
        if let SocketAddr::V4(v4) = addr {
            return Ok(*v4.ip());
        }
    }
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        "host has no IPv4 address",
    ))
}
