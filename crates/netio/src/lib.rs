#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `netio` supplies the socket objects the transfer engine runs on: plain
//! TCP connects, local listeners, and tunneled connections negotiated
//! through SOCKS4, SOCKS4A, SOCKS5 or HTTP CONNECT proxies, all driven by
//! `reactor` readiness events.
//!
//! # Design
//!
//! A [`SocketCore`] keeps every mutable piece — handle, phase, read and
//! send buffers, tunnel progress — behind one mutex. Objects that embed a
//! core forward their reactor callbacks into [`SocketCore::handle_event`];
//! the core consumes what belongs to the connection machinery (connect
//! completion, tunnel replies, queued-send drains) and translates the rest
//! into [`OwnerEvent`]s. Handlers never call back into the reactor while
//! the lock is held: deferred work travels out as [`Action`]s and is
//! executed by [`run_actions`] afterwards, which keeps the lock order
//! one-directional.
//!
//! Tunnel negotiation is invisible to owners. Between `connect_via_proxy`
//! and [`OwnerEvent::Connected`] the handshake machines own the byte
//! stream; they consume reply frames exactly and leave any bytes behind
//! them (an eager server banner, say) buffered for the owner. Readiness
//! edges swallowed during the handshake are replayed once the stream is
//! handed over.

mod error;
mod resolver;
mod secure;
mod socket;
mod tunnel;

pub use crate::error::{ProxyError, SocketError};
pub use crate::secure::SecureChannel;
pub use crate::socket::{
    Action, CloseOutcome, Fill, MSG_HOST_RESOLVED, OWNER_MSG_BASE, OwnerEvent, ProxyKind,
    ProxySetup, SocketCore, run_actions,
};
