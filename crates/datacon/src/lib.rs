#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `datacon` runs FTP data connections: downloads that double-buffer
//! received bytes toward a disk writer or collect them in memory, and
//! uploads that stage file bytes and send them in adaptively sized
//! chunks. Both directions speak MODE Z (deflate) streaming compression,
//! meter their throughput over a sliding window, and support pausing at
//! an exact byte offset.
//!
//! # Design
//!
//! A connection owns a `netio` [`SocketCore`](netio::SocketCore) and is
//! registered with the reactor like any other socket; the worker that
//! drives it is another reactor object, so all coordination happens by
//! posted messages ([`MSG_DATA_CONNECTED`], [`MSG_FLUSH_DATA`], and
//! friends) with the data connection's uid as the payload. Bytes cross
//! the disk boundary by buffer checkout: exactly one [`FlushBuffer`] (or
//! [`PrepareBuffer`] for uploads) is out at a time, and handing it back
//! swaps the next batch in, so the socket never waits for the disk and
//! the disk never waits for the socket. Readiness that arrives while the
//! other side of the swap is busy, or while the transfer is paused, is
//! remembered and replayed instead of dropped; a deferred close is never
//! downgraded by a later read or write.

mod conn;
mod download;
mod error;
mod packet;
mod speed;
mod upload;

pub use crate::conn::{
    DownloadStatus, MSG_DATA_CLOSED, MSG_DATA_CONNECTED, MSG_FLUSH_DATA, MSG_LISTEN_READY,
    MSG_PREPARE_DATA, MSG_TRANSFER_FINISHED, OwnerTarget, TransferPhase, UploadStatus,
};
pub use crate::download::{DownloadConfig, DownloadConnection, FlushBuffer};
pub use crate::error::DataConError;
pub use crate::packet::PacketTuning;
pub use crate::speed::{SharedMeter, TransferSpeedMeter, shared_meter};
pub use crate::upload::{PrepareBuffer, UploadConfig, UploadConnection};
