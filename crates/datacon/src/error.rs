//! Transfer-level error taxonomy layered over the socket errors.

use std::io;

use netio::SocketError;
use thiserror::Error;

/// What ended a transfer early. Fetched once via the `take_error`
/// accessors; a fetch clears the stored error.
#[derive(Debug, Error)]
pub enum DataConError {
    /// No byte moved for longer than the configured timeout.
    #[error("no data transferred for too long")]
    NoDataTimeout,
    /// The MODE Z stream could not be decompressed.
    #[error("compressed data stream is corrupted")]
    Decompress,
    /// Opening or negotiating the connection failed.
    #[error(transparent)]
    Socket(#[from] SocketError),
    /// The established stream died.
    #[error("data connection lost: {0}")]
    Net(io::ErrorKind),
}

impl DataConError {
    /// Whether the receiver should discard what it wrote so far. True for
    /// decompression errors, where the file tail would be garbage.
    pub fn poisons_target(&self) -> bool {
        matches!(self, DataConError::Decompress)
    }
}
