//! The reactor thread and its cross-thread handle.
//!
//! # Overview
//!
//! One OS thread owns a `mio::Poll` and loops over four phases: collect
//! readiness, dispatch readiness, dispatch due timers, dispatch posted
//! messages. Every callback a socket ever receives runs on this thread, one
//! at a time, so owner logic needs no synchronization against itself.
//!
//! # Design
//!
//! The handle is a cheap clone (`Arc` inside). Cross-thread operations
//! (`post`, `add_timer`, `repost`, registration) mutate shared state under
//! one lock and nudge the sleeping poll through a `mio::Waker`. The poll
//! timeout is re-derived every pass from the earliest timer deadline.
//!
//! # Invariants
//!
//! - The state lock is never held while a socket callback runs; dispatch
//!   validates, clones the target reference, releases the lock, then calls.
//! - Every dispatch re-validates `(slot, uid)` against the table. Stale
//!   events for reused slots are dropped with a trace, never delivered to
//!   the new occupant. Timers and messages additionally fall back to a
//!   sequential uid scan so an owner that changed slots still gets them.
//! - Readiness events can outpace timers; a due timer waiting longer than
//!   [`STARVATION_GRACE`] is serviced before the next readiness batch.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, trace, warn};

use crate::event::{
    DeregisterMode, MsgKind, NetEvent, Readiness, ReactorSocket, SlotId, SocketUid, TimerKind,
};
use crate::post::PostQueue;
use crate::slots::SlotTable;
use crate::timer::{Armed, TimerQueue};

/// Wakeups from other threads arrive under this token.
const WAKER_TOKEN: Token = Token(0);
/// Socket tokens start here; token = base + slot index.
const TOKEN_BASE: usize = 1;
/// Readiness batch size per poll.
const MAX_EVENTS: usize = 128;
/// How long a due timer may wait behind readiness traffic before the loop
/// services timers out of order.
const STARVATION_GRACE: Duration = Duration::from_millis(500);

fn token_for(slot: SlotId) -> Token {
    Token(TOKEN_BASE + slot.index())
}

fn slot_of(token: Token) -> SlotId {
    SlotId((token.0 - TOKEN_BASE) as u32)
}

struct ReadyEvent {
    slot: SlotId,
    uid: SocketUid,
    event: NetEvent,
}

struct Inner {
    table: SlotTable,
    timers: TimerQueue,
    posted: PostQueue,
    ready: VecDeque<ReadyEvent>,
    stopping: bool,
}

impl Inner {
    fn new() -> Self {
        Self {
            table: SlotTable::new(),
            timers: TimerQueue::new(),
            posted: PostQueue::new(),
            ready: VecDeque::new(),
            stopping: false,
        }
    }
}

struct Shared {
    state: Mutex<Inner>,
    registry: mio::Registry,
    waker: Waker,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, Inner> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to the reactor. Clones share one thread and one slot table.
pub struct Reactor {
    shared: Arc<Shared>,
}

impl Clone for Reactor {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Reactor {
    /// Starts the reactor thread.
    ///
    /// # Errors
    ///
    /// Fails only on OS resource exhaustion (poll or thread creation).
    pub fn spawn() -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let shared = Arc::new(Shared {
            state: Mutex::new(Inner::new()),
            registry,
            waker,
            thread: Mutex::new(None),
        });
        let handle = Self {
            shared: Arc::clone(&shared),
        };
        let loop_handle = handle.clone();
        let joiner = thread::Builder::new()
            .name("ftpkit-reactor".to_string())
            .spawn(move || run(poll, loop_handle))?;
        *shared
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(joiner);
        Ok(handle)
    }

    /// Assigns `socket` the lowest free slot. `None` once the reactor is
    /// shutting down.
    pub fn register(&self, socket: Arc<dyn ReactorSocket>) -> Option<SlotId> {
        let mut inner = self.shared.lock_state();
        if inner.stopping {
            return None;
        }
        let uid = socket.uid();
        let slot = inner.table.add(socket);
        trace!(slot = %slot, uid = %uid, "socket registered");
        Some(slot)
    }

    /// Frees `slot` after confirming `uid` still occupies it.
    ///
    /// [`DeregisterMode::Drop`] also discards the socket's pending timers
    /// and messages; [`DeregisterMode::Detach`] leaves them for a later
    /// re-registration (the uid scan finds the new slot). Returns whether
    /// the slot was freed.
    pub fn deregister(&self, slot: SlotId, uid: SocketUid, mode: DeregisterMode) -> bool {
        let mut inner = self.shared.lock_state();
        if inner.table.uid_at(slot) != Some(uid) {
            trace!(slot = %slot, uid = %uid, "deregister skipped: slot not owned");
            return false;
        }
        inner.table.remove(slot);
        if mode == DeregisterMode::Drop {
            inner.timers.remove_all_for(uid);
            inner.posted.purge(uid);
        }
        trace!(slot = %slot, uid = %uid, ?mode, "socket deregistered");
        true
    }

    /// Posts an event to `(slot, uid)` from any thread. FIFO with respect to
    /// other posted events. `false` once the reactor is shutting down.
    pub fn post(&self, slot: SlotId, uid: SocketUid, kind: MsgKind, payload: u64) -> bool {
        {
            let mut inner = self.shared.lock_state();
            if inner.stopping {
                return false;
            }
            inner.posted.push(slot, uid, kind, payload);
        }
        self.wake();
        true
    }

    /// Arms a timer for `(slot, uid)`. An already-passed deadline fires on
    /// the next loop pass. `false` once the reactor is shutting down.
    pub fn add_timer(
        &self,
        slot: SlotId,
        uid: SocketUid,
        deadline: Instant,
        kind: TimerKind,
        payload: u64,
    ) -> bool {
        let new_head = {
            let mut inner = self.shared.lock_state();
            if inner.stopping {
                return false;
            }
            inner.timers.insert(slot, uid, deadline, kind, payload) == Armed::NewHead
        };
        if new_head {
            // The poll may be sleeping on a later (or no) deadline.
            self.wake();
        }
        true
    }

    /// Cancels every pending timer of `kind` for `uid`. Returns whether any
    /// entry was cancelled.
    ///
    /// A removed head leaves the poll with a too-early deadline; that costs
    /// one empty pass and nothing else, so no wakeup is issued.
    pub fn delete_timer(&self, uid: SocketUid, kind: TimerKind) -> bool {
        let mut inner = self.shared.lock_state();
        if inner.stopping {
            return false;
        }
        inner.timers.remove(uid, kind) > 0
    }

    /// Queues a synthetic readiness event behind everything already queued.
    ///
    /// Sockets use this to replay readiness they had to defer (paused
    /// transfers, tunnel writability, close-after-drain).
    pub fn repost(&self, slot: SlotId, uid: SocketUid, event: NetEvent) -> bool {
        {
            let mut inner = self.shared.lock_state();
            if inner.stopping {
                return false;
            }
            inner.ready.push_back(ReadyEvent { slot, uid, event });
        }
        self.wake();
        true
    }

    /// Registers an OS source for readiness under `slot`'s token, with both
    /// interests. Called by a socket right after it opens its stream.
    pub fn attach<S>(&self, slot: SlotId, source: &mut S) -> io::Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        self.shared
            .registry
            .register(source, token_for(slot), Interest::READABLE | Interest::WRITABLE)
    }

    /// Moves an already-registered source to `slot`'s token. Used when two
    /// sockets exchange their streams.
    pub fn reattach<S>(&self, slot: SlotId, source: &mut S) -> io::Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        self.shared
            .registry
            .reregister(source, token_for(slot), Interest::READABLE | Interest::WRITABLE)
    }

    /// Removes an OS source from the poll. Called by a socket when it closes
    /// its stream.
    pub fn detach<S>(&self, source: &mut S) -> io::Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        self.shared.registry.deregister(source)
    }

    /// Whether the loop is still accepting work.
    pub fn is_running(&self) -> bool {
        !self.shared.lock_state().stopping
    }

    /// Stops the loop and joins the thread.
    ///
    /// Safe to call repeatedly and from socket callbacks; a call from the
    /// reactor thread itself only raises the stop flag (the loop exits when
    /// the current dispatch returns).
    pub fn shutdown(&self) {
        self.shared.lock_state().stopping = true;
        self.wake();
        let joiner = self
            .shared
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(j) = joiner {
            if j.thread().id() == thread::current().id() {
                // Cannot join ourselves; the stop flag ends the loop.
                *self
                    .shared
                    .thread
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(j);
            } else if j.join().is_err() {
                warn!("reactor thread panicked");
            }
        }
    }

    fn wake(&self) {
        if let Err(e) = self.shared.waker.wake() {
            trace!(error = %e, "waker failed");
        }
    }
}

fn run(mut poll: Poll, handle: Reactor) {
    let mut events = Events::with_capacity(MAX_EVENTS);
    debug!("reactor loop running");
    loop {
        let timeout = {
            let inner = handle.shared.lock_state();
            if inner.stopping {
                break;
            }
            if inner.ready.is_empty() && inner.posted.is_empty() {
                inner
                    .timers
                    .next_deadline()
                    .map(|d| d.saturating_duration_since(Instant::now()))
            } else {
                Some(Duration::ZERO)
            }
        };
        if let Err(e) = poll.poll(&mut events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!(error = %e, "poll failed; reactor stopping");
            break;
        }
        collect_readiness(&handle, &events);
        if handle
            .shared
            .lock_state()
            .timers
            .starving(Instant::now(), STARVATION_GRACE)
        {
            service_timers(&handle);
        }
        dispatch_ready(&handle);
        service_timers(&handle);
        dispatch_posted(&handle);
    }
    let mut inner = handle.shared.lock_state();
    inner.table.clear();
    inner.ready.clear();
    debug!("reactor loop stopped");
}

/// Translates one poll batch into the ready queue, capturing the uid of the
/// slot's occupant at observation time.
fn collect_readiness(handle: &Reactor, events: &Events) {
    let mut inner = handle.shared.lock_state();
    for event in events.iter() {
        if event.token() == WAKER_TOKEN {
            continue;
        }
        let slot = slot_of(event.token());
        let Some(uid) = inner.table.uid_at(slot) else {
            trace!(slot = %slot, "lost readiness: slot empty");
            continue;
        };
        if event.is_readable() {
            inner.ready.push_back(ReadyEvent {
                slot,
                uid,
                event: NetEvent::new(Readiness::Readable),
            });
        }
        if event.is_writable() {
            inner.ready.push_back(ReadyEvent {
                slot,
                uid,
                event: NetEvent::new(Readiness::Writable),
            });
        }
        if event.is_read_closed() || event.is_write_closed() || event.is_error() {
            inner.ready.push_back(ReadyEvent {
                slot,
                uid,
                event: NetEvent::new(Readiness::Closed),
            });
        }
    }
}

/// Delivers the readiness queue as it stood at phase start; later arrivals
/// wait for the next pass so one chatty socket cannot monopolize the loop.
fn dispatch_ready(handle: &Reactor) {
    let budget = handle.shared.lock_state().ready.len();
    for _ in 0..budget {
        let Some(ev) = handle.shared.lock_state().ready.pop_front() else {
            break;
        };
        let target = handle.shared.lock_state().table.validate(ev.slot, ev.uid);
        if let Some(socket) = target {
            socket.on_ready(handle, ev.event);
        }
    }
}

fn service_timers(handle: &Reactor) {
    let now = Instant::now();
    let count = {
        let mut inner = handle.shared.lock_state();
        if inner.stopping || inner.timers.next_deadline().is_none_or(|d| d > now) {
            return;
        }
        inner.timers.begin_dispatch(now)
    };
    for i in 0..count {
        let target = {
            let inner = handle.shared.lock_state();
            inner.timers.protected_entry(i).map(|(slot, uid, kind, payload)| {
                let socket = inner
                    .table
                    .peek(slot, uid)
                    .or_else(|| inner.table.find_by_uid(uid).map(|(_, s)| s));
                (socket, uid, kind, payload)
            })
        };
        match target {
            Some((Some(socket), _, kind, payload)) => socket.on_timer(handle, kind, payload),
            Some((None, uid, kind, _)) => {
                trace!(uid = %uid, kind = ?kind, "dropped timer: owner gone");
            }
            // Abandoned mid-dispatch by a delete_timer call.
            None => {}
        }
    }
    handle.shared.lock_state().timers.end_dispatch();
}

fn dispatch_posted(handle: &Reactor) {
    let budget = handle.shared.lock_state().posted.len();
    for _ in 0..budget {
        let Some(msg) = handle.shared.lock_state().posted.pop() else {
            break;
        };
        let target = {
            let inner = handle.shared.lock_state();
            inner
                .table
                .peek(msg.slot, msg.uid)
                .or_else(|| inner.table.find_by_uid(msg.uid).map(|(_, s)| s))
        };
        match target {
            Some(socket) => socket.on_message(handle, msg.kind, msg.payload),
            None => {
                trace!(slot = %msg.slot, uid = %msg.uid, kind = ?msg.kind, "dropped message: owner gone");
            }
        }
    }
}
