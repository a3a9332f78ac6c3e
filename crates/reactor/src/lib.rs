//! Single-threaded readiness reactor for the FTP engine.
//!
//! # Overview
//!
//! One dedicated thread multiplexes every socket the engine owns: OS
//! readiness notifications, absolute-deadline timers, and cross-thread
//! posted messages all funnel through the same loop and are delivered to
//! [`ReactorSocket`] implementations one callback at a time. Concurrency
//! between FTP operations is multiplexing on this thread, never parallelism.
//!
//! # Design
//!
//! Sockets register into a slot table and are addressed by `(SlotId,
//! SocketUid)` everywhere. Slots are reused; uids are not. Every queue in
//! the crate re-validates the pair immediately before dispatch and drops
//! entries whose owner has been deregistered or replaced — a stale event is
//! traced and discarded, never delivered to a slot's new occupant.
//!
//! # Lock order
//!
//! The reactor's state lock is the outermost lock in the process:
//! reactor → socket → worker, never the reverse. The loop releases the state
//! lock before every callback, and callback code must release its own state
//! guard before calling back into the reactor (the socket crates arrange
//! this by computing follow-up actions under their lock and executing them
//! after it is dropped).

#![deny(unsafe_code)]
#![deny(missing_docs)]

mod event;
mod post;
mod reactor;
mod slots;
mod timer;

pub use event::{
    DeregisterMode, MsgKind, NetEvent, Readiness, ReactorSocket, SlotId, SocketUid, TimerKind,
};
pub use reactor::Reactor;
