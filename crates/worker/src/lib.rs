#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `worker` is the operation layer of the FTP engine: each [`Worker`]
//! owns one control connection, logs in (plain or scripted, with optional
//! MODE Z negotiation), pulls [`WorkItem`]s from a shared [`WorkQueue`],
//! and drives each through its command/reply cycle — deletes, directory
//! creation, attribute changes, link probes, directory listings, and
//! resumable downloads and uploads over `datacon` data connections.
//!
//! # Design
//!
//! A worker is a reactor object like the sockets it manages: every state
//! transition runs inside a reactor callback, and its collaborators reach
//! it only by posted messages. The data connection posts transfer
//! progress with its uid as payload; the disk thread parks each file
//! outcome in a result cell and posts [`MSG_DISK_DONE`] with the request's
//! sequence number; external callers post work notifications and stop
//! requests. Stale messages fail their payload check and are dropped, so
//! a worker that moved on never acts on a dead collaborator's behalf.
//! Failures are classified: conflicts go to the [`WorkerObserver`],
//! transient errors return the item to the queue, and permanent ones drop
//! it. A command abandoned mid-flight marks its server-side effect as
//! in-doubt on the way back.

mod config;
mod control;
mod disk;
mod error;
mod item;
mod queue;
mod reply;
mod worker;

pub use crate::config::{
    Credentials, KeepAliveCommand, KeepAliveConfig, ServerProfile, WorkerConfig,
};
pub use crate::control::{ControlChannel, SentCommand};
pub use crate::disk::{
    DiskCell, DiskExecutor, DiskNotify, DiskOutcome, DiskRequest, DiskThread, FileToken, ListSink,
    MSG_DISK_DONE, disk_cell, list_sink,
};
pub use crate::error::{ErrorClass, WorkerError, sanitize_error_text};
pub use crate::item::{ForcedAction, InDoubtFlags, ItemId, ItemKind, TransferMode, WorkItem};
pub use crate::queue::{MemoryQueue, WorkQueue};
pub use crate::reply::{
    Reply, ReplyAssembler, ReplyCategory, directory_from_reply, passive_endpoint, size_from_reply,
    size_in_parens,
};
pub use crate::worker::{
    DiscardObserver, ItemOutcome, MSG_STOP, MSG_WORK_AVAILABLE, Worker, WorkerObserver,
    WorkerState, WorkerStatus,
};
