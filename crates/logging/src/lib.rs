//! Per-connection session logs.
//!
//! Every FTP connection keeps a transcript of what happened on its control
//! channel: the commands it sent, the replies the server returned, errors,
//! and the occasional bookkeeping note. This crate holds the pieces that
//! record that transcript.
//!
//! # Overview
//!
//! A [`SessionLine`] is one entry of the transcript, tagged with a
//! [`LineKind`] and the numeric identity of the connection that produced it.
//! Lines flow into a [`SessionSink`], a cheap append-only receiver shared
//! between connections. [`MemorySink`] is the stock implementation: a
//! mutex-guarded ring that keeps the newest lines and drops the oldest once
//! a capacity is reached.
//!
//! Connections do not talk to sinks directly. Each one holds a
//! [`SessionLog`], a clonable handle that pairs a shared sink with the
//! connection's id and stamps that id on every line it emits:
//!
//! ```
//! use logging::{LineKind, MemorySink, SessionLog};
//!
//! let sink = MemorySink::new(100);
//! let log = SessionLog::new(sink.clone(), 7);
//!
//! log.command("TYPE I");
//! log.reply("200 Type set to I.");
//!
//! let lines = sink.snapshot();
//! assert_eq!(lines.len(), 2);
//! assert_eq!(lines[0].kind, LineKind::Command);
//! assert_eq!(lines[0].conn, 7);
//! assert_eq!(lines[1].text, "200 Type set to I.");
//! ```
//!
//! # Tracing bridge
//!
//! With the `tracing` feature enabled, [`TracingSink`] forwards each line as
//! a `tracing` event under the `ftp::session` target, and
//! [`init_subscriber`] installs a formatted subscriber honoring `RUST_LOG`
//! for binaries and examples.
//!
//! Sinks run on the reactor thread, so implementations must never block;
//! masking of secrets (login passwords) is the caller's job and happens
//! before a line reaches a sink.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

#[cfg(feature = "tracing")]
mod bridge;
mod line;
mod sink;

#[cfg(feature = "tracing")]
pub use bridge::{TracingSink, init_subscriber};
pub use line::{LineKind, SessionLine};
pub use sink::{MemorySink, SessionLog, SessionSink};
