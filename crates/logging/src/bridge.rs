//! Bridge from session lines to `tracing`.

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::line::{LineKind, SessionLine};
use crate::sink::SessionSink;

/// Forwards every session line as a `tracing` event under the
/// `ftp::session` target.
///
/// Commands and replies are emitted at `info` with the conventional `>` and
/// `<` direction markers, errors at `warn`, notes at `debug`. The
/// connection id travels as the `conn` field, so filtered subscribers can
/// still separate interleaved sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl SessionSink for TracingSink {
    fn append(&self, line: SessionLine) {
        match line.kind {
            LineKind::Command => {
                info!(target: "ftp::session", conn = line.conn, "> {}", line.text);
            }
            LineKind::Reply => {
                info!(target: "ftp::session", conn = line.conn, "< {}", line.text);
            }
            LineKind::Error => {
                warn!(target: "ftp::session", conn = line.conn, "{}", line.text);
            }
            LineKind::Info => {
                debug!(target: "ftp::session", conn = line.conn, "{}", line.text);
            }
        }
    }
}

/// Installs a global formatted subscriber honoring `RUST_LOG`.
///
/// Meant for binaries, examples, and tests; does nothing if a subscriber is
/// already installed.
pub fn init_subscriber() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
