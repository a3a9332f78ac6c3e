//! The control connection: command send, reply assembly, deadline timers.
//!
//! A [`ControlChannel`] wraps the worker's `netio` socket core. The worker
//! forwards readiness into it and gets complete [`Reply`] values back; the
//! channel keeps the per-command deadline timer armed while a command is
//! outstanding and writes both directions to the session log.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use logging::SessionLog;
use netio::{Fill, SocketCore, SocketError};
use reactor::{Reactor, SlotId, SocketUid, TimerKind};
use tracing::{debug, trace};

use crate::error::WorkerError;
use crate::reply::{Reply, ReplyAssembler};

/// Per-command reply deadline. Payload is the command sequence number.
pub const TIMER_REPLY: TimerKind = TimerKind(10);
/// Delay between reconnect attempts.
pub const TIMER_RECONNECT: TimerKind = TimerKind(11);
/// Next keep-alive command while sleeping.
pub const TIMER_KEEP_ALIVE: TimerKind = TimerKind(12);

/// Bytes asked from the socket per control read.
const CTRL_READ_CHUNK: usize = 4 * 1024;

/// A command whose reply has not arrived yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentCommand {
    /// The verb, upper-cased: `RETR`, `DELE`, and so on.
    pub verb: String,
    /// Sequence number carried in the deadline timer payload.
    pub seq: u64,
}

struct CtrlState {
    assembler: ReplyAssembler,
    pending: Option<SentCommand>,
    next_seq: u64,
    binding: Option<(Reactor, SlotId)>,
}

/// Command/reply half of a worker: owns the socket core the worker
/// registers under and the reply assembler fed from it.
pub struct ControlChannel {
    core: Arc<SocketCore>,
    log: SessionLog,
    st: Mutex<CtrlState>,
}

impl ControlChannel {
    /// Fresh channel logging under the socket's uid.
    pub fn new(sink: Arc<dyn logging::SessionSink>) -> Self {
        let core = SocketCore::new();
        let log = SessionLog::new(sink, core.uid().value());
        Self {
            core,
            log,
            st: Mutex::new(CtrlState {
                assembler: ReplyAssembler::new(),
                pending: None,
                next_seq: 1,
                binding: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CtrlState> {
        self.st.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The socket core; the worker registers this object's events.
    pub fn core(&self) -> &Arc<SocketCore> {
        &self.core
    }

    /// Identity the worker registers under.
    pub fn uid(&self) -> SocketUid {
        self.core.uid()
    }

    /// Session log attributed to this connection.
    pub fn log(&self) -> &SessionLog {
        &self.log
    }

    /// Wires the channel to its reactor slot.
    pub fn bind(&self, reactor: &Reactor, slot: SlotId) {
        self.core.bind(reactor, slot);
        self.lock().binding = Some((reactor.clone(), slot));
    }

    pub(crate) fn binding(&self) -> Option<(Reactor, SlotId)> {
        self.lock().binding.clone()
    }

    /// Sends one command line and arms its reply deadline.
    ///
    /// Returns the command's sequence number; the deadline timer fires with
    /// it as payload so a late timer for a finished command is recognizable.
    ///
    /// # Errors
    ///
    /// Fails when a command is already outstanding (the control dialog is
    /// strictly one command, one reply) or on a hard send failure.
    pub fn send_command(&self, line: &str, timeout: Duration) -> Result<u64, WorkerError> {
        let (reactor, slot, seq) = {
            let mut st = self.lock();
            if let Some(p) = &st.pending {
                return Err(WorkerError::Desync(format!(
                    "command sent while {} is awaiting its reply",
                    p.verb
                )));
            }
            let Some((reactor, slot)) = st.binding.clone() else {
                return Err(WorkerError::NotRegistered);
            };
            let seq = st.next_seq;
            st.next_seq += 1;
            let verb = line
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_ascii_uppercase();
            st.pending = Some(SentCommand { verb, seq });
            (reactor, slot, seq)
        };
        self.log.command(loggable_line(line));
        let mut wire = Vec::with_capacity(line.len() + 2);
        wire.extend_from_slice(line.as_bytes());
        wire.extend_from_slice(b"\r\n");
        if let Err(e) = self.core.write(&wire) {
            self.lock().pending = None;
            return Err(WorkerError::Socket(e));
        }
        reactor.add_timer(slot, self.uid(), Instant::now() + timeout, TIMER_REPLY, seq);
        trace!(uid = %self.uid(), line = %loggable_line(line), seq, "command sent");
        Ok(seq)
    }

    /// The command currently awaiting its reply.
    pub fn pending(&self) -> Option<SentCommand> {
        self.lock().pending.clone()
    }

    /// Pushes the reply deadline of the outstanding command back by
    /// `timeout` from now. Used while a data connection is demonstrably
    /// still moving bytes.
    pub fn extend_deadline(&self, timeout: Duration) {
        let st = self.lock();
        let (Some((reactor, slot)), Some(p)) = (st.binding.clone(), st.pending.clone()) else {
            return;
        };
        drop(st);
        reactor.delete_timer(self.uid(), TIMER_REPLY);
        reactor.add_timer(
            slot,
            self.uid(),
            Instant::now() + timeout,
            TIMER_REPLY,
            p.seq,
        );
    }

    /// Drains socket bytes into the assembler and hands out every complete
    /// reply, logged line by line.
    ///
    /// # Errors
    ///
    /// Surfaces hard socket read failures; `WouldBlock` and EOF end the
    /// drain quietly (EOF is reported separately through the close event).
    pub fn on_readable(&self) -> Result<Vec<Reply>, WorkerError> {
        loop {
            match self.core.fill(CTRL_READ_CHUNK) {
                Ok(Fill::Bytes { maybe_more, .. }) => {
                    if !maybe_more {
                        break;
                    }
                }
                Ok(Fill::WouldBlock | Fill::Eof) => break,
                Err(SocketError::NotConnected) => break,
                Err(e) => return Err(WorkerError::Socket(e)),
            }
        }
        Ok(self.drain_buffered())
    }

    /// Regroups whatever is buffered on the socket into complete replies.
    /// Also used after a close to pick up the final words of the server.
    pub fn drain_buffered(&self) -> Vec<Reply> {
        let n = self.core.buffered_len();
        if n > 0 {
            let mut st = self.lock();
            self.core.with_buffered(|b| st.assembler.push(b));
            self.core.consume(n);
        }
        let mut out = Vec::new();
        {
            let mut st = self.lock();
            while let Some(reply) = st.assembler.next_reply() {
                out.push(reply);
            }
        }
        for reply in &out {
            for line in reply.lines() {
                self.log.reply(line);
            }
        }
        out
    }

    /// Marks the outstanding command as answered and disarms its deadline.
    /// Returns what was pending, `None` when nothing was.
    pub fn complete_command(&self) -> Option<SentCommand> {
        let taken = self.lock().pending.take();
        if taken.is_some() {
            if let Some((reactor, _)) = self.binding() {
                reactor.delete_timer(self.uid(), TIMER_REPLY);
            }
        }
        taken
    }

    /// Whether `seq` is still the outstanding command. Stale deadline
    /// timers fail this check and are dropped.
    pub fn is_current(&self, seq: u64) -> bool {
        self.lock().pending.as_ref().is_some_and(|p| p.seq == seq)
    }

    /// Closes the socket and resets the dialog for a later reconnect.
    pub fn reset(&self) {
        if let Some((reactor, _)) = self.binding() {
            reactor.delete_timer(self.uid(), TIMER_REPLY);
        }
        self.core.close();
        let mut st = self.lock();
        st.assembler.clear();
        st.pending = None;
        debug!(uid = %self.uid(), "control channel reset");
    }
}

/// The command line as it goes to the log: `PASS` and `ACCT` arguments are
/// masked.
fn loggable_line(line: &str) -> String {
    let verb = line.split_whitespace().next().unwrap_or_default();
    if verb.eq_ignore_ascii_case("PASS") || verb.eq_ignore_ascii_case("ACCT") {
        format!("{verb} ****")
    } else {
        line.to_owned()
    }
}
