//! The disk collaborator: blocking file work kept off the reactor thread.
//!
//! Workers never touch `std::fs` directly. They queue a [`DiskRequest`]
//! with a result cell and a notify target; the disk thread executes it,
//! parks the outcome in the cell, and posts [`MSG_DISK_DONE`] through the
//! reactor. Buffer ownership travels with the request, so a block being
//! written belongs to exactly one side at any moment.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, unbounded};
use datacon::FlushBuffer;
use reactor::{MsgKind, Reactor, SlotId, SocketUid};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

/// A finished disk request is waiting in the requester's cell.
pub const MSG_DISK_DONE: MsgKind = MsgKind(netio::OWNER_MSG_BASE + 6);

/// Token for a file opened and owned by the disk thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileToken(u64);

/// Where directory listings accumulate.
pub type ListSink = Arc<Mutex<Vec<u8>>>;

/// Creates an empty list sink.
#[must_use]
pub fn list_sink() -> ListSink {
    Arc::new(Mutex::new(Vec::new()))
}

/// One unit of file work.
#[derive(Debug)]
pub enum DiskRequest {
    /// Report whether `path` exists and how long it is.
    Stat {
        /// File to look at.
        path: PathBuf,
    },
    /// Open `path` for reading, positioned at `offset`.
    OpenRead {
        /// File to open.
        path: PathBuf,
        /// Initial cursor position.
        offset: u64,
    },
    /// Open `path` for writing. `resume_at: Some(n)` keeps the first `n`
    /// bytes and continues there; `None` truncates.
    OpenWrite {
        /// File to open or create.
        path: PathBuf,
        /// Resume position, or `None` to start over.
        resume_at: Option<u64>,
    },
    /// Read up to `max` bytes at the token's cursor.
    ReadBlock {
        /// Open file to read from.
        file: FileToken,
        /// Most bytes to return.
        max: usize,
    },
    /// Write a checked-out flush buffer; ownership travels with the
    /// request and comes back in the outcome.
    WriteBlock {
        /// Open file to append to.
        file: FileToken,
        /// The buffer to write.
        buffer: FlushBuffer,
    },
    /// Close the file, deleting it when the written data is poisoned.
    CloseFile {
        /// Open file to release.
        file: FileToken,
        /// Remove the file after closing.
        delete: bool,
    },
    /// Append listing bytes to a shared sink.
    ListAppend {
        /// Destination sink.
        sink: ListSink,
        /// Bytes to append.
        bytes: Vec<u8>,
    },
}

/// What a finished request produced.
#[derive(Debug)]
pub enum DiskOutcome {
    /// Stat result; length when the file exists.
    Stat {
        /// `None` means the file is absent.
        len: Option<u64>,
    },
    /// The file is open; `len` is its current length.
    Opened {
        /// Token for follow-up requests.
        file: FileToken,
        /// File length at open time.
        len: u64,
    },
    /// Bytes read; `eof` when the source is exhausted.
    ReadBlock {
        /// The bytes.
        bytes: Vec<u8>,
        /// Whether the cursor reached the end.
        eof: bool,
    },
    /// The flush buffer, written out and handed back.
    Written {
        /// The buffer that was written.
        buffer: FlushBuffer,
    },
    /// The file is closed, and deleted when that was asked.
    Closed,
    /// The listing bytes were appended.
    ListAppended,
}

/// Parking spot for one request's outcome, owned by the requester.
pub type DiskCell = Arc<Mutex<Option<io::Result<DiskOutcome>>>>;

/// Creates an empty result cell.
#[must_use]
pub fn disk_cell() -> DiskCell {
    Arc::new(Mutex::new(None))
}

/// Where the completion message goes.
#[derive(Clone)]
pub struct DiskNotify {
    /// Reactor to post through.
    pub reactor: Reactor,
    /// Requester's slot.
    pub slot: SlotId,
    /// Requester's uid.
    pub uid: SocketUid,
    /// Payload delivered with [`MSG_DISK_DONE`]; requesters use a
    /// sequence number here so stale completions can be dropped.
    pub payload: u64,
}

/// Executes file work off the reactor thread.
///
/// Implementations must not call back into the requester synchronously;
/// completion is reported only through the cell and the posted message.
pub trait DiskExecutor: Send + Sync {
    /// Queues `request`; its outcome lands in `cell` and `notify` fires.
    /// Returns `false` when the executor has shut down.
    fn submit(&self, request: DiskRequest, cell: DiskCell, notify: DiskNotify) -> bool;
}

struct Job {
    request: DiskRequest,
    cell: DiskCell,
    notify: DiskNotify,
}

/// An open file owned by the disk thread, remembered with its path so a
/// close can also delete it.
struct OpenFile {
    file: File,
    path: PathBuf,
}

/// The shipped executor: one thread, a request pipe, `std::fs` calls.
pub struct DiskThread {
    tx: Mutex<Option<Sender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DiskThread {
    /// Spawns the worker thread.
    ///
    /// # Errors
    ///
    /// Returns the OS error when the thread cannot be created.
    pub fn spawn() -> io::Result<Arc<Self>> {
        let (tx, rx) = unbounded::<Job>();
        let handle = thread::Builder::new()
            .name("ftp-disk".to_owned())
            .spawn(move || {
                let mut files: FxHashMap<u64, OpenFile> = FxHashMap::default();
                let mut next_token: u64 = 1;
                while let Ok(job) = rx.recv() {
                    let outcome = execute(&mut files, &mut next_token, job.request);
                    if let Err(e) = &outcome {
                        debug!(error = %e, "disk request failed");
                    }
                    *job.cell.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome);
                    let n = job.notify;
                    if !n.reactor.post(n.slot, n.uid, MSG_DISK_DONE, n.payload) {
                        trace!("disk completion post dropped");
                    }
                }
                if !files.is_empty() {
                    warn!(open = files.len(), "disk thread exiting with open files");
                }
            })?;
        Ok(Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        }))
    }

    /// Stops the thread once the queued work has finished.
    pub fn shutdown(&self) {
        drop(
            self.tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(h) = handle {
            if h.join().is_err() {
                warn!("disk thread panicked");
            }
        }
    }
}

impl Drop for DiskThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl DiskExecutor for DiskThread {
    fn submit(&self, request: DiskRequest, cell: DiskCell, notify: DiskNotify) -> bool {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match tx.as_ref() {
            Some(tx) => tx
                .send(Job {
                    request,
                    cell,
                    notify,
                })
                .is_ok(),
            None => false,
        }
    }
}

fn stale_token() -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, "unknown file token")
}

/// Runs one request on the disk thread.
fn execute(
    files: &mut FxHashMap<u64, OpenFile>,
    next_token: &mut u64,
    request: DiskRequest,
) -> io::Result<DiskOutcome> {
    match request {
        DiskRequest::Stat { path } => match std::fs::metadata(&path) {
            Ok(md) => Ok(DiskOutcome::Stat { len: Some(md.len()) }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(DiskOutcome::Stat { len: None }),
            Err(e) => Err(e),
        },
        DiskRequest::OpenRead { path, offset } => {
            let mut file = File::open(&path)?;
            let len = file.metadata()?.len();
            if offset > 0 {
                file.seek(SeekFrom::Start(offset))?;
            }
            let token = *next_token;
            *next_token += 1;
            debug!(path = %path.display(), offset, "source file opened");
            files.insert(token, OpenFile { file, path });
            Ok(DiskOutcome::Opened {
                file: FileToken(token),
                len,
            })
        }
        DiskRequest::OpenWrite { path, resume_at } => {
            let mut opts = OpenOptions::new();
            opts.write(true).create(true);
            if resume_at.is_none() {
                opts.truncate(true);
            }
            let mut file = opts.open(&path)?;
            let len = match resume_at {
                None => 0,
                Some(n) => {
                    // Anything past the resume point is a stale tail.
                    file.set_len(n)?;
                    file.seek(SeekFrom::Start(n))?;
                    n
                }
            };
            let token = *next_token;
            *next_token += 1;
            debug!(path = %path.display(), len, "target file opened");
            files.insert(token, OpenFile { file, path });
            Ok(DiskOutcome::Opened {
                file: FileToken(token),
                len,
            })
        }
        DiskRequest::ReadBlock { file, max } => {
            let open = files.get_mut(&file.0).ok_or_else(stale_token)?;
            let mut bytes = vec![0u8; max];
            let mut filled = 0usize;
            while filled < max {
                match open.file.read(&mut bytes[filled..]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
            bytes.truncate(filled);
            Ok(DiskOutcome::ReadBlock {
                eof: filled < max,
                bytes,
            })
        }
        DiskRequest::WriteBlock { file, buffer } => {
            let open = files.get_mut(&file.0).ok_or_else(stale_token)?;
            open.file.write_all(buffer.bytes())?;
            Ok(DiskOutcome::Written { buffer })
        }
        DiskRequest::CloseFile { file, delete } => {
            let open = files.remove(&file.0).ok_or_else(stale_token)?;
            let path = open.path;
            drop(open.file);
            if delete {
                debug!(path = %path.display(), "removing poisoned target");
                std::fs::remove_file(&path)?;
            }
            Ok(DiskOutcome::Closed)
        }
        DiskRequest::ListAppend { sink, bytes } => {
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(&bytes);
            Ok(DiskOutcome::ListAppended)
        }
    }
}
