//! Worker-level error taxonomy and the error-text normalizer.

use std::io;

use datacon::DataConError;
use netio::SocketError;
use thiserror::Error;

/// What went wrong with a worker's connection or its current item.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The control connection could not be opened and the retry budget is
    /// spent.
    #[error("cannot connect to the server: {0}")]
    ConnectFailed(String),
    /// The server's replies do not form FTP replies at all.
    #[error("the server does not answer like an FTP server: {0}")]
    NotFtp(String),
    /// Login was rejected permanently.
    #[error("login failed: {0}")]
    LoginRejected(String),
    /// The established control connection died.
    #[error("control connection lost: {0}")]
    ConnectionLost(String),
    /// A reply arrived with no command pending; the session is
    /// unrecoverable.
    #[error("protocol desync: unexpected server reply: {0}")]
    Desync(String),
    /// The per-command deadline fired with no reply.
    #[error("no reply from the server in time")]
    CommandTimeout,
    /// The worker was never registered with a reactor.
    #[error("worker is not registered with a reactor")]
    NotRegistered,
    /// Socket-level failure.
    #[error(transparent)]
    Socket(#[from] SocketError),
    /// Data connection failure.
    #[error(transparent)]
    Data(#[from] DataConError),
    /// Local file I/O failure reported by the disk thread.
    #[error("local file error: {0}")]
    Disk(#[from] io::Error),
}

/// How a failed item should be handled, for the caller.
///
/// Only [`UserChoice`](Self::UserChoice) surfaces outside the worker; the
/// other two stay internal (the worker retries or gives up on the item by
/// itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorClass {
    /// Ambiguous outcome needing a user decision, such as an existing
    /// target or an attribute conflict.
    UserChoice,
    /// Transient failure; retrying the item later may succeed.
    Retry,
    /// Permanent rejection of this item.
    Fatal,
}

/// Flattens server text into a one-line description: CR and LF become
/// spaces, trailing periods and blanks are trimmed.
#[must_use]
pub fn sanitize_error_text(text: &str) -> String {
    let flat: String = text
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect();
    flat.trim_end_matches(['.', ' ']).to_owned()
}
