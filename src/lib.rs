#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `ftpkit` is the transport and protocol engine of an FTP client,
//! assembled from five layers:
//!
//! - [`reactor`] — a single-threaded readiness loop multiplexing sockets,
//!   timers, and cross-thread messages over one slot table.
//! - [`netio`] — non-blocking socket objects with buffered reads, queued
//!   writes, and SOCKS4/4A/5 and HTTP CONNECT tunnels negotiated invisibly
//!   before the owner hears "connected".
//! - [`datacon`] — FTP data connections: disk-bound and in-memory
//!   downloads, staged uploads, MODE Z compression, and throughput
//!   metering, coordinating with their worker purely by posted messages.
//! - [`worker`] — the per-connection state machine: login, queue items,
//!   command/reply cycles, retry budgets, and conflict reporting.
//! - [`logging`] — per-session command/reply logs behind a pluggable sink.
//!
//! The crate root re-exports each layer as a module; embedders typically
//! build a [`worker::Worker`] per concurrent connection, share one
//! [`reactor::Reactor`] and one [`worker::DiskThread`], and feed items
//! through a [`worker::WorkQueue`] implementation.

pub use datacon;
pub use logging;
pub use netio;
pub use reactor;
pub use worker;
