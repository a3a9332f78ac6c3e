//! The worker state machine: one concurrent FTP operation executor.
//!
//! A [`Worker`] owns a control connection, pulls items from the shared
//! queue, and runs each through connect, login, command/reply, and data
//! transfer. It registers itself as a reactor socket; every state
//! transition happens inside reactor callbacks, so worker logic is
//! multiplexed with every other socket rather than running on its own
//! thread. Data connections and the disk thread coordinate with it purely
//! through posted messages.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use datacon::{
    DownloadConnection, MSG_DATA_CLOSED, MSG_DATA_CONNECTED, MSG_FLUSH_DATA, MSG_LISTEN_READY,
    MSG_PREPARE_DATA, MSG_TRANSFER_FINISHED, OwnerTarget, PrepareBuffer, UploadConnection,
};
use netio::{OWNER_MSG_BASE, OwnerEvent, run_actions};
use reactor::{
    DeregisterMode, MsgKind, NetEvent, Reactor, ReactorSocket, SlotId, SocketUid, TimerKind,
};
use tracing::{debug, info, trace, warn};

use crate::config::{ServerProfile, WorkerConfig};
use crate::control::{ControlChannel, TIMER_KEEP_ALIVE, TIMER_RECONNECT, TIMER_REPLY};
use crate::disk::{
    DiskCell, DiskExecutor, DiskNotify, DiskOutcome, DiskRequest, FileToken, ListSink,
    MSG_DISK_DONE, disk_cell, list_sink,
};
use crate::error::{ErrorClass, WorkerError, sanitize_error_text};
use crate::item::{ForcedAction, InDoubtFlags, ItemKind, WorkItem};
use crate::queue::WorkQueue;
use crate::reply::{
    Reply, ReplyCategory, directory_from_reply, passive_endpoint, size_from_reply, size_in_parens,
};

/// New work may be waiting in the queue; also the worker's own wakeup.
pub const MSG_WORK_AVAILABLE: MsgKind = MsgKind(OWNER_MSG_BASE + 7);
/// A stop was requested; teardown runs on the reactor thread.
pub const MSG_STOP: MsgKind = MsgKind(OWNER_MSG_BASE + 8);

/// Where a worker is in its life-cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WorkerState {
    /// Between items, about to consult the queue.
    #[default]
    LookingForWork,
    /// Running per-item readiness checks before touching the network.
    Preparing,
    /// Connecting and logging in.
    Connecting,
    /// Driving an item's command/reply/transfer cycle.
    Working,
    /// The queue is empty; the connection idles (with optional keep-alive).
    Sleeping,
    /// A connection attempt failed; the retry timer is running.
    WaitingForReconnect,
    /// The retry budget is spent; external intervention is needed.
    ConnectionError,
    /// Shut down; the current item was returned to the queue.
    Stopped,
}

/// Point-in-time snapshot for UI polling.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WorkerStatus {
    /// Life-cycle state.
    pub state: WorkerState,
    /// Summary of the current item, when one is held.
    pub item: Option<String>,
    /// Bytes moved by the active transfer.
    pub transferred: u64,
    /// Expected transfer total; never trails `transferred`.
    pub total: u64,
    /// Recent transfer throughput in bytes per second.
    pub speed: u64,
    /// Time since the transfer last moved a byte.
    pub idle: Duration,
    /// Last error description, for the status line.
    pub error: Option<String>,
}

/// How an item ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Ran to completion.
    Done,
    /// Left alone on a `Skip` decision.
    Skipped,
    /// A link probe finished; `CWD` success means the target is a
    /// directory.
    LinkResolved {
        /// Whether the link points at a directory.
        is_dir: bool,
    },
    /// Transient failure; the item went back to the queue.
    TransientFailure(String),
    /// Permanent rejection; the item was dropped.
    Failed(String),
}

/// Receives what the worker cannot decide by itself.
///
/// Callbacks run on the reactor thread with no worker lock held; they may
/// call back into the worker (for example to push a resolved conflict item
/// and wake it), but must not block.
pub trait WorkerObserver: Send + Sync {
    /// An item finished, one way or the other.
    fn item_finished(&self, item: &WorkItem, outcome: &ItemOutcome) {
        let _ = (item, outcome);
    }

    /// An ambiguous outcome needs a decision. The item travels with the
    /// notification; re-queue it with an updated forced action to retry.
    fn conflict(&self, item: WorkItem, text: String);

    /// The retry budget is spent; the worker is in `ConnectionError`.
    fn connection_error(&self, text: &str) {
        let _ = text;
    }
}

/// Observer that drops conflicts on the floor, for embeddings that only
/// ever queue non-conflicting work.
pub struct DiscardObserver;

impl WorkerObserver for DiscardObserver {
    fn conflict(&self, item: WorkItem, text: String) {
        warn!(item = %item.summary(), %text, "conflict discarded, no resolver attached");
    }
}

/// Login/negotiation progress on the control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Login {
    /// Not connected; nothing sent.
    NotConnected,
    /// TCP (and tunnel) is up; waiting for the `220` greeting.
    Welcome,
    /// Scripted login; index of the step awaiting its reply.
    Script(usize),
    User,
    Pass,
    Acct,
    /// `MODE Z` sent; a refusal silently disables compression.
    ModeZ,
    /// Init command at this index awaiting its reply.
    Init(usize),
    /// Logged in and negotiated; the session is usable.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DlPhase {
    StatLocal,
    OpenLocal,
    Type,
    Size,
    Pasv,
    PortReply,
    AwaitListen,
    Rest,
    Retr,
    Transfer,
    CloseFile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UlPhase {
    StatLocal,
    Type,
    SizeRemote,
    OpenLocal,
    Pasv,
    PortReply,
    AwaitListen,
    Stor,
    Transfer,
    CloseFile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExPhase {
    Cwd,
    Pwd,
    TypeA,
    Pasv,
    PortReply,
    AwaitListen,
    List,
    Transfer,
    AppendList,
}

struct DownloadJob {
    phase: DlPhase,
    file: Option<FileToken>,
    resume_at: u64,
    total: u64,
    got_final: bool,
    data_done: bool,
    close_submitted: bool,
    failed: Option<(String, ErrorClass)>,
    /// Written data is garbage (decompression error); delete the target.
    poisoned: bool,
}

struct UploadJob {
    phase: UlPhase,
    file: Option<FileToken>,
    resume_at: u64,
    local_len: u64,
    /// `APPE` instead of `STOR` (resume in force).
    append: bool,
    /// Prepare buffer parked while a disk read is outstanding.
    prep: Option<PrepareBuffer>,
    got_final: bool,
    data_done: bool,
    close_submitted: bool,
    failed: Option<(String, ErrorClass)>,
}

struct ExploreJob {
    phase: ExPhase,
    got_final: bool,
    data_done: bool,
    appended: bool,
    failed: Option<(String, ErrorClass)>,
}

/// Per-item sub-state machine.
enum Job {
    /// One-command items: delete, mkdir, chmod, link probe.
    Simple,
    Explore(ExploreJob),
    Download(DownloadJob),
    Upload(UploadJob),
}

/// The data connection attached to the current transfer.
enum DataLink {
    Down {
        conn: Arc<DownloadConnection>,
        slot: SlotId,
    },
    Up {
        conn: Arc<UploadConnection>,
        slot: SlotId,
    },
}

impl DataLink {
    fn uid(&self) -> SocketUid {
        match self {
            DataLink::Down { conn, .. } => conn.uid(),
            DataLink::Up { conn, .. } => conn.uid(),
        }
    }

    fn pause(&self, paused: bool) {
        match self {
            DataLink::Down { conn, .. } => conn.pause(paused),
            DataLink::Up { conn, .. } => conn.pause(paused),
        }
    }

    fn cancel(&self) {
        match self {
            DataLink::Down { conn, .. } => conn.cancel(),
            DataLink::Up { conn, .. } => conn.cancel(),
        }
    }

    fn take_error(&self) -> Option<datacon::DataConError> {
        match self {
            DataLink::Down { conn, .. } => conn.take_error(),
            DataLink::Up { conn, .. } => conn.take_error(),
        }
    }

    fn activate(&self) {
        match self {
            DataLink::Down { conn, .. } => conn.activate(),
            DataLink::Up { conn, .. } => conn.activate(),
        }
    }

    fn listen_endpoint(&self) -> Option<(Ipv4Addr, u16)> {
        match self {
            DataLink::Down { conn, .. } => conn.listen_endpoint(),
            DataLink::Up { conn, .. } => conn.listen_endpoint(),
        }
    }

    fn progress(&self) -> (u64, u64, u64, Duration, Option<Instant>, bool) {
        match self {
            DataLink::Down { conn, .. } => {
                let s = conn.status();
                (
                    s.downloaded,
                    s.total,
                    s.speed,
                    s.idle,
                    conn.closed_at(),
                    conn.is_connected(),
                )
            }
            DataLink::Up { conn, .. } => {
                let s = conn.status();
                (
                    s.uploaded,
                    s.total,
                    s.speed,
                    s.idle,
                    conn.closed_at(),
                    conn.is_connected(),
                )
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiskPurpose {
    StatLocal,
    OpenLocal,
    WriteFlush,
    ReadPrep,
    CloseFile,
    AppendList,
}

struct PendingDisk {
    seq: u64,
    cell: DiskCell,
    purpose: DiskPurpose,
}

struct WorkerInner {
    state: WorkerState,
    login: Login,
    item: Option<WorkItem>,
    job: Option<Job>,
    data: Option<DataLink>,
    disk: Option<PendingDisk>,
    disk_seq: u64,
    attempts: u32,
    paused: bool,
    stop_requested: bool,
    /// Work arrived while the worker was busy; consult the queue at the
    /// next idle point.
    work_waiting: bool,
    /// A queue consult was suppressed by pause.
    deferred_look: bool,
    /// A job command held back by pause, sent on resume.
    held_command: Option<String>,
    /// MODE Z accepted by this server.
    compress_on: bool,
    expect_keep_alive: bool,
    sleep_since: Option<Instant>,
    error: Option<String>,
}

impl WorkerInner {
    fn new() -> Self {
        Self {
            state: WorkerState::LookingForWork,
            login: Login::NotConnected,
            item: None,
            job: None,
            data: None,
            disk: None,
            disk_seq: 0,
            attempts: 0,
            paused: false,
            stop_requested: false,
            work_waiting: false,
            deferred_look: false,
            held_command: None,
            compress_on: false,
            expect_keep_alive: false,
            sleep_since: None,
            error: None,
        }
    }
}

/// One concurrent FTP operation executor.
pub struct Worker {
    profile: ServerProfile,
    cfg: WorkerConfig,
    control: ControlChannel,
    queue: Arc<dyn WorkQueue>,
    disk: Arc<dyn DiskExecutor>,
    observer: Arc<dyn WorkerObserver>,
    listings: ListSink,
    st: Mutex<WorkerInner>,
}

impl Worker {
    /// Creates a detached worker. Register it, then [`start`](Self::start).
    pub fn new(
        profile: ServerProfile,
        cfg: WorkerConfig,
        queue: Arc<dyn WorkQueue>,
        disk: Arc<dyn DiskExecutor>,
        observer: Arc<dyn WorkerObserver>,
        sink: Arc<dyn logging::SessionSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            profile,
            cfg,
            control: ControlChannel::new(sink),
            queue,
            disk,
            observer,
            listings: list_sink(),
            st: Mutex::new(WorkerInner::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, WorkerInner> {
        self.st.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers the worker in the reactor and binds its control channel.
    ///
    /// # Errors
    ///
    /// Fails when the reactor is shutting down and assigns no slot.
    pub fn register(self: &Arc<Self>, reactor: &Reactor) -> Result<SlotId, WorkerError> {
        let slot = reactor
            .register(Arc::clone(self) as Arc<dyn ReactorSocket>)
            .ok_or(WorkerError::NotRegistered)?;
        self.control.bind(reactor, slot);
        Ok(slot)
    }

    /// Kicks the worker off: it connects, logs in, and starts pulling work.
    pub fn start(&self) {
        self.post_self(MSG_WORK_AVAILABLE);
    }

    /// Tells the worker that the queue may have new items.
    pub fn notify_work(&self) {
        self.post_self(MSG_WORK_AVAILABLE);
    }

    /// Where `ExploreDir` items accumulate their listing bytes.
    pub fn listings(&self) -> ListSink {
        Arc::clone(&self.listings)
    }

    /// Freezes or resumes the worker. Pausing stops new commands and
    /// pauses an active data connection; resuming continues at the exact
    /// point reached, without reconnecting.
    pub fn pause(&self, paused: bool) {
        let kick = {
            let mut st = self.lock();
            if st.paused == paused {
                return;
            }
            st.paused = paused;
            if let Some(link) = &st.data {
                link.pause(paused);
            }
            !paused && (st.deferred_look || st.held_command.is_some())
        };
        info!(uid = %self.uid_val(), paused, "worker pause toggled");
        if kick {
            self.post_self(MSG_WORK_AVAILABLE);
        }
    }

    /// Requests shutdown. Teardown runs on the reactor thread: sockets are
    /// force-closed and the current item goes back to the queue with its
    /// in-doubt effects marked.
    pub fn stop(&self) {
        self.lock().stop_requested = true;
        if !self.post_self(MSG_STOP) {
            // Reactor already gone; tear down on the caller's thread.
            self.do_stop();
        }
    }

    /// Clears the retry budget after external intervention and tries the
    /// connection again.
    pub fn retry_connection(&self) {
        {
            let mut st = self.lock();
            if st.state != WorkerState::ConnectionError {
                return;
            }
            st.state = WorkerState::LookingForWork;
            st.attempts = 0;
            st.error = None;
        }
        self.post_self(MSG_WORK_AVAILABLE);
    }

    /// Cheap status snapshot for UI polling.
    pub fn status(&self) -> WorkerStatus {
        let st = self.lock();
        let (transferred, total, speed, idle) = match &st.data {
            Some(link) => {
                let (t, tot, speed, idle, _, _) = link.progress();
                (t, tot, speed, idle)
            }
            None => (0, 0, 0, Duration::ZERO),
        };
        WorkerStatus {
            state: st.state,
            item: st.item.as_ref().map(WorkItem::summary),
            transferred,
            total,
            speed,
            idle,
            error: st.error.clone(),
        }
    }

    /// Current life-cycle state.
    pub fn state(&self) -> WorkerState {
        self.lock().state
    }

    fn uid_val(&self) -> u64 {
        self.control.uid().value()
    }

    fn binding(&self) -> Option<(Reactor, SlotId)> {
        self.control.binding()
    }

    fn post_self(&self, kind: MsgKind) -> bool {
        match self.binding() {
            Some((reactor, slot)) => reactor.post(slot, self.control.uid(), kind, 0),
            None => false,
        }
    }

    // ---- connect and login ----

    fn begin_connect(&self) {
        {
            let mut st = self.lock();
            st.state = WorkerState::Connecting;
            st.login = Login::NotConnected;
            st.compress_on = false;
            st.error = None;
        }
        self.control.log().info(format!(
            "connecting to {}:{}",
            self.profile.host, self.profile.port
        ));
        let res = match &self.profile.proxy {
            Some(setup) => {
                let ip = self.profile.host.parse::<Ipv4Addr>().ok();
                self.control.core().connect_via_proxy(
                    setup.clone(),
                    &self.profile.host,
                    ip,
                    self.profile.port,
                )
            }
            None => self
                .control
                .core()
                .connect_to_host(&self.profile.host, self.profile.port),
        };
        if let Err(e) = res {
            self.connect_failed(&e.to_string());
            return;
        }
        // One deadline covers the TCP/tunnel connect and the greeting;
        // payload 0 is never a real command sequence number.
        if let Some((reactor, slot)) = self.binding() {
            reactor.add_timer(
                slot,
                self.control.uid(),
                Instant::now() + self.cfg.command_timeout,
                TIMER_REPLY,
                0,
            );
        }
    }

    /// A connect or login attempt failed; burn one retry.
    fn connect_failed(&self, text: &str) {
        let text = sanitize_error_text(text);
        self.control.reset();
        let exhausted = {
            let mut st = self.lock();
            st.attempts += 1;
            st.error = Some(text.clone());
            st.login = Login::NotConnected;
            if st.attempts > self.cfg.retry_budget {
                st.state = WorkerState::ConnectionError;
                true
            } else {
                st.state = WorkerState::WaitingForReconnect;
                false
            }
        };
        if exhausted {
            self.control
                .log()
                .error(format!("cannot connect: {text}; giving up"));
            self.observer.connection_error(&text);
            return;
        }
        self.control.log().error(format!(
            "cannot connect: {text}; retrying in {} s",
            self.cfg.reconnect_delay.as_secs()
        ));
        if let Some((reactor, slot)) = self.binding() {
            reactor.add_timer(
                slot,
                self.control.uid(),
                Instant::now() + self.cfg.reconnect_delay,
                TIMER_RECONNECT,
                0,
            );
        }
    }

    /// The login stopped on a permanent rejection; retrying with the same
    /// credentials cannot help.
    fn login_rejected(&self, text: &str) {
        let text = sanitize_error_text(text);
        self.control.reset();
        {
            let mut st = self.lock();
            st.state = WorkerState::ConnectionError;
            st.login = Login::NotConnected;
            st.error = Some(format!("login failed: {text}"));
        }
        self.control.log().error(format!("login failed: {text}"));
        self.observer.connection_error(&text);
    }

    /// The established connection died mid-session. The current item goes
    /// back to the queue with its in-doubt effects marked, then the
    /// reconnect path takes over.
    fn connection_lost(&self, text: &str) {
        let in_doubt = self.current_in_doubt();
        self.abandon_item(in_doubt);
        self.connect_failed(text);
    }

    /// In-doubt server-side effects of the outstanding command, if its
    /// reply was never seen.
    fn current_in_doubt(&self) -> InDoubtFlags {
        let mut flags = InDoubtFlags::default();
        if let Some(p) = self.control.pending() {
            match p.verb.as_str() {
                "DELE" | "RMD" => flags.deleted = true,
                "MKD" => flags.created_dir = true,
                "STOR" | "APPE" => flags.stored = true,
                _ => {}
            }
        }
        flags
    }

    /// Returns the current item (if any) to the queue and clears the job.
    fn abandon_item(&self, in_doubt: InDoubtFlags) {
        self.teardown_data();
        let item = {
            let mut st = self.lock();
            st.job = None;
            st.disk = None;
            st.held_command = None;
            st.item.take()
        };
        if let Some(item) = item {
            debug!(uid = %self.uid_val(), item = %item.summary(), ?in_doubt, "returning item to the queue");
            self.queue.return_item(item, in_doubt);
        }
    }

    fn send_login_command(&self, line: &str, next: Login) {
        self.lock().login = next;
        if let Err(e) = self.control.send_command(line, self.cfg.command_timeout) {
            self.connect_failed(&e.to_string());
        }
    }

    fn on_welcome(&self, reply: &Reply) {
        if let Some((reactor, _)) = self.binding() {
            reactor.delete_timer(self.control.uid(), TIMER_REPLY);
        }
        if !reply.is_welcome() {
            let text = sanitize_error_text(&reply.text);
            match reply.category() {
                Some(ReplyCategory::Transient) => self.connect_failed(&text),
                _ => self.login_rejected(&text),
            }
            return;
        }
        if let Some(script) = &self.profile.login_script {
            match script.first() {
                Some(line) => {
                    let line = line.clone();
                    self.send_login_command(&line, Login::Script(0));
                }
                None => self.post_login(),
            }
            return;
        }
        let user = format!("USER {}", self.profile.credentials.user);
        self.send_login_command(&user, Login::User);
    }

    fn advance_login(&self, login: Login, reply: &Reply) {
        let cat = reply.category();
        let text = sanitize_error_text(&reply.text);
        match login {
            Login::NotConnected | Login::Welcome | Login::Done => {
                // Routed elsewhere; nothing to advance.
            }
            Login::Script(i) => match cat {
                Some(ReplyCategory::Success | ReplyCategory::Intermediate) => {
                    let next = self
                        .profile
                        .login_script
                        .as_ref()
                        .and_then(|s| s.get(i + 1))
                        .cloned();
                    match next {
                        Some(line) => self.send_login_command(&line, Login::Script(i + 1)),
                        None => self.post_login(),
                    }
                }
                Some(ReplyCategory::Transient) => self.connect_failed(&text),
                _ => self.login_rejected(&text),
            },
            Login::User => match cat {
                Some(ReplyCategory::Success) => self.post_login(),
                Some(ReplyCategory::Intermediate) => {
                    if reply.code == Some(332) {
                        self.send_acct();
                    } else {
                        let pass = format!("PASS {}", &*self.profile.credentials.password);
                        self.send_login_command(&pass, Login::Pass);
                    }
                }
                Some(ReplyCategory::Transient) => self.connect_failed(&text),
                _ => self.login_rejected(&text),
            },
            Login::Pass => match cat {
                Some(ReplyCategory::Success) => self.post_login(),
                Some(ReplyCategory::Intermediate) => self.send_acct(),
                Some(ReplyCategory::Transient) => self.connect_failed(&text),
                _ => self.login_rejected(&text),
            },
            Login::Acct => match cat {
                Some(ReplyCategory::Success) => self.post_login(),
                Some(ReplyCategory::Transient) => self.connect_failed(&text),
                _ => self.login_rejected(&text),
            },
            Login::ModeZ => {
                if cat == Some(ReplyCategory::Success) {
                    self.lock().compress_on = true;
                    self.control.log().info("MODE Z compression enabled");
                } else {
                    self.control
                        .log()
                        .info("server refused MODE Z, compression disabled");
                }
                self.start_init_commands();
            }
            Login::Init(i) => {
                if !matches!(cat, Some(ReplyCategory::Success)) {
                    self.control
                        .log()
                        .info(format!("init command failed: {text}"));
                }
                self.send_init_command(i + 1);
            }
        }
    }

    fn send_acct(&self) {
        match &self.profile.credentials.account {
            Some(acct) => {
                let line = format!("ACCT {acct}");
                self.send_login_command(&line, Login::Acct);
            }
            None => self.login_rejected("server requires an ACCT and none is configured"),
        }
    }

    fn post_login(&self) {
        if self.profile.compress {
            self.send_login_command("MODE Z", Login::ModeZ);
        } else {
            self.start_init_commands();
        }
    }

    fn start_init_commands(&self) {
        self.send_init_command(0);
    }

    fn send_init_command(&self, i: usize) {
        match self.profile.init_commands.get(i) {
            Some(line) => {
                let line = line.clone();
                self.send_login_command(&line, Login::Init(i));
            }
            None => {
                {
                    let mut st = self.lock();
                    st.login = Login::Done;
                    st.attempts = 0;
                    st.state = WorkerState::LookingForWork;
                }
                self.control.log().info("login complete");
                self.look_for_work();
            }
        }
    }

    // ---- queue consultation ----

    fn look_for_work(&self) {
        let item = {
            let mut st = self.lock();
            if st.stop_requested {
                drop(st);
                self.do_stop();
                return;
            }
            if st.paused {
                st.deferred_look = true;
                return;
            }
            if st.login != Login::Done {
                return;
            }
            st.work_waiting = false;
            st.deferred_look = false;
            match self.queue.next_item() {
                Some(item) => {
                    st.state = WorkerState::Preparing;
                    st.item = Some(item.clone());
                    st.error = None;
                    Some(item)
                }
                None => {
                    st.state = WorkerState::Sleeping;
                    st.sleep_since = Some(Instant::now());
                    None
                }
            }
        };
        match item {
            Some(item) => self.start_item(&item),
            None => self.enter_sleep(),
        }
    }

    fn enter_sleep(&self) {
        trace!(uid = %self.uid_val(), "queue empty, sleeping");
        if let Some(ka) = &self.cfg.keep_alive {
            if let Some((reactor, slot)) = self.binding() {
                reactor.add_timer(
                    slot,
                    self.control.uid(),
                    Instant::now() + ka.send_every,
                    TIMER_KEEP_ALIVE,
                    0,
                );
            }
        }
    }

    fn start_item(&self, item: &WorkItem) {
        self.control
            .log()
            .info(format!("starting: {}", item.summary()));
        match &item.kind {
            ItemKind::DeleteFile { path } => {
                self.begin_simple(&format!("DELE {path}"));
            }
            ItemKind::DeleteDir { path } => {
                self.begin_simple(&format!("RMD {path}"));
            }
            ItemKind::MakeDir { path } => {
                self.begin_simple(&format!("MKD {path}"));
            }
            ItemKind::ChangeAttrs { path, mode } => {
                self.begin_simple(&format!("SITE CHMOD {mode:o} {path}"));
            }
            ItemKind::ResolveLink { path } => {
                self.begin_simple(&format!("CWD {path}"));
            }
            ItemKind::ExploreDir { path } => {
                {
                    let mut st = self.lock();
                    st.state = WorkerState::Working;
                    st.job = Some(Job::Explore(ExploreJob {
                        phase: ExPhase::Cwd,
                        got_final: false,
                        data_done: false,
                        appended: false,
                        failed: None,
                    }));
                }
                self.send_job_command(&format!("CWD {path}"));
            }
            ItemKind::Download { local, .. } => {
                self.lock().job = Some(Job::Download(DownloadJob {
                    phase: DlPhase::StatLocal,
                    file: None,
                    resume_at: 0,
                    total: 0,
                    got_final: false,
                    data_done: false,
                    close_submitted: false,
                    failed: None,
                    poisoned: false,
                }));
                self.submit_disk(
                    DiskRequest::Stat {
                        path: local.clone(),
                    },
                    DiskPurpose::StatLocal,
                );
            }
            ItemKind::Upload { local, .. } => {
                self.lock().job = Some(Job::Upload(UploadJob {
                    phase: UlPhase::StatLocal,
                    file: None,
                    resume_at: 0,
                    local_len: 0,
                    append: false,
                    prep: None,
                    got_final: false,
                    data_done: false,
                    close_submitted: false,
                    failed: None,
                }));
                self.submit_disk(
                    DiskRequest::Stat {
                        path: local.clone(),
                    },
                    DiskPurpose::StatLocal,
                );
            }
        }
    }

    fn begin_simple(&self, line: &str) {
        {
            let mut st = self.lock();
            st.state = WorkerState::Working;
            st.job = Some(Job::Simple);
        }
        self.send_job_command(line);
    }

    /// Sends a job command, or holds it back while paused.
    fn send_job_command(&self, line: &str) {
        {
            let mut st = self.lock();
            if st.paused {
                trace!(uid = %self.uid_val(), line, "command held back by pause");
                st.held_command = Some(line.to_owned());
                return;
            }
        }
        if let Err(e) = self.control.send_command(line, self.cfg.command_timeout) {
            self.connection_lost(&e.to_string());
        }
    }

    // ---- disk collaborator ----

    fn submit_disk(&self, request: DiskRequest, purpose: DiskPurpose) {
        let Some((reactor, slot)) = self.binding() else {
            self.fail_item("worker is not registered with a reactor", ErrorClass::Fatal);
            return;
        };
        let cell = disk_cell();
        let seq = {
            let mut st = self.lock();
            st.disk_seq += 1;
            let seq = st.disk_seq;
            st.disk = Some(PendingDisk {
                seq,
                cell: Arc::clone(&cell),
                purpose,
            });
            seq
        };
        let notify = DiskNotify {
            reactor,
            slot,
            uid: self.control.uid(),
            payload: seq,
        };
        if !self.disk.submit(request, cell, notify) {
            self.lock().disk = None;
            self.fail_item("disk thread is not running", ErrorClass::Fatal);
        }
    }

    fn on_disk_done(&self, seq: u64) {
        let pending = {
            let mut st = self.lock();
            match &st.disk {
                Some(p) if p.seq == seq => st.disk.take(),
                _ => {
                    trace!(uid = %self.uid_val(), seq, "stale disk completion dropped");
                    return;
                }
            }
        };
        let Some(pending) = pending else { return };
        let outcome = pending
            .cell
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(outcome) = outcome else {
            warn!(uid = %self.uid_val(), "disk completion carried no result");
            return;
        };
        match outcome {
            Ok(done) => self.on_disk_outcome(pending.purpose, done),
            Err(e) => self.on_disk_error(pending.purpose, &e.to_string()),
        }
    }

    fn on_disk_error(&self, purpose: DiskPurpose, text: &str) {
        self.control.log().error(format!("local file error: {text}"));
        match purpose {
            DiskPurpose::WriteFlush | DiskPurpose::ReadPrep => {
                // Mid-transfer: tear the data stream down and let the
                // failure path close (and for downloads poison) the file.
                self.fail_transfer(&format!("local file error: {text}"), ErrorClass::Fatal, true);
            }
            DiskPurpose::CloseFile => {
                // The close itself failed; finish with whatever the job
                // already recorded, or this error.
                self.finish_after_close(Some(text));
            }
            _ => self.fail_item(&format!("local file error: {text}"), ErrorClass::Fatal),
        }
    }

    fn on_disk_outcome(&self, purpose: DiskPurpose, outcome: DiskOutcome) {
        match purpose {
            DiskPurpose::StatLocal => self.on_stat_local(outcome),
            DiskPurpose::OpenLocal => self.on_open_local(outcome),
            DiskPurpose::WriteFlush => self.on_flush_written(outcome),
            DiskPurpose::ReadPrep => self.on_prep_read(outcome),
            DiskPurpose::CloseFile => self.finish_after_close(None),
            DiskPurpose::AppendList => self.on_list_appended(),
        }
    }

    fn on_stat_local(&self, outcome: DiskOutcome) {
        let DiskOutcome::Stat { len } = outcome else {
            self.fail_item("unexpected disk outcome", ErrorClass::Fatal);
            return;
        };
        let (kind, forced) = {
            let st = self.lock();
            let Some(item) = &st.item else { return };
            (item.kind.clone(), item.forced)
        };
        match kind {
            ItemKind::Download { local, .. } => match len {
                Some(existing) if existing > 0 => match forced {
                    ForcedAction::Ask => self.raise_conflict(format!(
                        "target file {} already exists ({existing} bytes)",
                        local.display()
                    )),
                    ForcedAction::Skip | ForcedAction::UseExisting => {
                        self.finish_item(ItemOutcome::Skipped);
                    }
                    ForcedAction::Resume => {
                        if let Some(Job::Download(job)) = self.lock().job.as_mut() {
                            job.phase = DlPhase::OpenLocal;
                            job.resume_at = existing;
                        }
                        self.submit_disk(
                            DiskRequest::OpenWrite {
                                path: local,
                                resume_at: Some(existing),
                            },
                            DiskPurpose::OpenLocal,
                        );
                    }
                    ForcedAction::Overwrite => {
                        if let Some(Job::Download(job)) = self.lock().job.as_mut() {
                            job.phase = DlPhase::OpenLocal;
                        }
                        self.submit_disk(
                            DiskRequest::OpenWrite {
                                path: local,
                                resume_at: None,
                            },
                            DiskPurpose::OpenLocal,
                        );
                    }
                },
                _ => {
                    if let Some(Job::Download(job)) = self.lock().job.as_mut() {
                        job.phase = DlPhase::OpenLocal;
                    }
                    self.submit_disk(
                        DiskRequest::OpenWrite {
                            path: local,
                            resume_at: None,
                        },
                        DiskPurpose::OpenLocal,
                    );
                }
            },
            ItemKind::Upload { local, mode, .. } => match len {
                Some(local_len) => {
                    {
                        let mut st = self.lock();
                        st.state = WorkerState::Working;
                        if let Some(Job::Upload(job)) = st.job.as_mut() {
                            job.local_len = local_len;
                            job.phase = UlPhase::Type;
                        }
                    }
                    self.send_job_command(&format!("TYPE {}", mode.type_arg()));
                }
                None => self.fail_item(
                    &format!("local file {} does not exist", local.display()),
                    ErrorClass::Fatal,
                ),
            },
            _ => self.fail_item("stat finished for a non-transfer item", ErrorClass::Fatal),
        }
    }

    fn on_open_local(&self, outcome: DiskOutcome) {
        let DiskOutcome::Opened { file, len } = outcome else {
            self.fail_item("unexpected disk outcome", ErrorClass::Fatal);
            return;
        };
        let mode = {
            let mut st = self.lock();
            let st = &mut *st;
            let Some(item) = &st.item else { return };
            match (&item.kind, st.job.as_mut()) {
                (ItemKind::Download { mode, .. }, Some(Job::Download(job))) => {
                    job.file = Some(file);
                    job.resume_at = len;
                    job.phase = DlPhase::Type;
                    st.state = WorkerState::Working;
                    Some(*mode)
                }
                (ItemKind::Upload { .. }, Some(Job::Upload(job))) => {
                    job.file = Some(file);
                    job.phase = if self.profile.passive {
                        UlPhase::Pasv
                    } else {
                        UlPhase::PortReply
                    };
                    None
                }
                _ => {
                    warn!(uid = %self.uid_val(), "file opened for a job that moved on");
                    return;
                }
            }
        };
        match mode {
            // Download: the command chain starts with TYPE.
            Some(mode) => self.send_job_command(&format!("TYPE {}", mode.type_arg())),
            // Upload: TYPE and SIZE already ran; open the data path.
            None => self.open_upload_data_path(),
        }
    }

    // ---- reply routing ----

    fn handle_reply(&self, reply: &Reply) {
        if reply.code.is_none() {
            self.connection_lost(&format!(
                "the server does not answer like an FTP server: {}",
                sanitize_error_text(&reply.text)
            ));
            return;
        }
        let login = {
            let st = self.lock();
            st.login.clone()
        };
        if login == Login::Welcome {
            self.on_welcome(reply);
            return;
        }
        // Preliminary replies leave the command outstanding; transfer jobs
        // use them to arm the data path.
        if reply.category() == Some(ReplyCategory::Preliminary) {
            self.on_preliminary(reply);
            return;
        }
        let Some(sent) = self.control.complete_command() else {
            self.connection_lost(&format!(
                "unexpected server reply: {}",
                sanitize_error_text(&reply.text)
            ));
            return;
        };
        if self.lock().expect_keep_alive {
            self.lock().expect_keep_alive = false;
            trace!(uid = %self.uid_val(), verb = %sent.verb, "keep-alive reply consumed");
            if self.lock().work_waiting {
                self.look_for_work();
            }
            return;
        }
        if login != Login::Done {
            self.advance_login(login, reply);
            return;
        }
        self.advance_job(reply);
    }

    fn on_preliminary(&self, reply: &Reply) {
        let size_note = size_in_parens(&reply.text);
        let mut st = self.lock();
        match st.job.as_mut() {
            Some(Job::Download(job)) if job.phase == DlPhase::Retr => {
                job.phase = DlPhase::Transfer;
                if let Some(n) = size_note {
                    job.total = job.total.max(n);
                    if let Some(DataLink::Down { conn, .. }) = &st.data {
                        conn.set_total_size(n);
                    }
                }
                if let Some(link) = &st.data {
                    link.activate();
                }
            }
            Some(Job::Upload(job)) if job.phase == UlPhase::Stor => {
                job.phase = UlPhase::Transfer;
                if let Some(link) = &st.data {
                    link.activate();
                }
            }
            Some(Job::Explore(job)) if job.phase == ExPhase::List => {
                job.phase = ExPhase::Transfer;
                if let Some(link) = &st.data {
                    link.activate();
                }
            }
            _ => trace!(uid = %self.uid_val(), "preliminary reply outside a transfer"),
        }
    }

    fn advance_job(&self, reply: &Reply) {
        let job_kind = {
            let st = self.lock();
            match &st.job {
                Some(Job::Simple) => 0,
                Some(Job::Explore(_)) => 1,
                Some(Job::Download(_)) => 2,
                Some(Job::Upload(_)) => 3,
                None => {
                    drop(st);
                    self.connection_lost(&format!(
                        "unexpected server reply: {}",
                        sanitize_error_text(&reply.text)
                    ));
                    return;
                }
            }
        };
        match job_kind {
            0 => self.advance_simple(reply),
            1 => self.advance_explore(reply),
            2 => self.advance_download(reply),
            _ => self.advance_upload(reply),
        }
    }

    fn advance_simple(&self, reply: &Reply) {
        let (kind, forced) = {
            let st = self.lock();
            let Some(item) = &st.item else { return };
            (item.kind.clone(), item.forced)
        };
        let cat = reply.category();
        let text = sanitize_error_text(&reply.text);
        match kind {
            ItemKind::ResolveLink { .. } => {
                // CWD success means the link target is a directory.
                let is_dir = cat == Some(ReplyCategory::Success);
                self.finish_item(ItemOutcome::LinkResolved { is_dir });
            }
            ItemKind::MakeDir { .. } => match cat {
                Some(ReplyCategory::Success) => self.finish_item(ItemOutcome::Done),
                Some(ReplyCategory::Transient) => {
                    self.finish_item(ItemOutcome::TransientFailure(text));
                }
                _ => match forced {
                    ForcedAction::UseExisting | ForcedAction::Skip => {
                        self.finish_item(ItemOutcome::Skipped);
                    }
                    ForcedAction::Ask => {
                        self.raise_conflict(format!("cannot create directory: {text}"));
                    }
                    _ => self.finish_item(ItemOutcome::Failed(text)),
                },
            },
            ItemKind::ChangeAttrs { .. } => match cat {
                Some(ReplyCategory::Success) => self.finish_item(ItemOutcome::Done),
                Some(ReplyCategory::Transient) => {
                    self.finish_item(ItemOutcome::TransientFailure(text));
                }
                _ => {
                    if forced == ForcedAction::Ask {
                        self.raise_conflict(format!("cannot change attributes: {text}"));
                    } else {
                        self.finish_item(ItemOutcome::Failed(text));
                    }
                }
            },
            _ => match cat {
                Some(ReplyCategory::Success) => self.finish_item(ItemOutcome::Done),
                Some(ReplyCategory::Transient) => {
                    self.finish_item(ItemOutcome::TransientFailure(text));
                }
                _ => self.finish_item(ItemOutcome::Failed(text)),
            },
        }
    }

    fn advance_explore(&self, reply: &Reply) {
        let phase = {
            let st = self.lock();
            match &st.job {
                Some(Job::Explore(job)) => job.phase,
                _ => return,
            }
        };
        let cat = reply.category();
        let text = sanitize_error_text(&reply.text);
        let ok = cat == Some(ReplyCategory::Success);
        match phase {
            ExPhase::Cwd => {
                if ok {
                    self.send_job_command_with(|st| {
                        if let Some(Job::Explore(job)) = st.job.as_mut() {
                            job.phase = ExPhase::Pwd;
                        }
                    }, "PWD");
                } else {
                    self.fail_item(&text, class_of(cat));
                }
            }
            ExPhase::Pwd => {
                if ok {
                    match directory_from_reply(&reply.text) {
                        Some(dir) => self.control.log().info(format!("remote directory is {dir}")),
                        None => self
                            .control
                            .log()
                            .info("PWD reply carried no quoted directory"),
                    }
                } else {
                    self.control.log().info(format!("PWD failed: {text}"));
                }
                self.send_job_command_with(|st| {
                    if let Some(Job::Explore(job)) = st.job.as_mut() {
                        job.phase = ExPhase::TypeA;
                    }
                }, "TYPE A");
            }
            ExPhase::TypeA => {
                if ok {
                    self.open_data_path_explore();
                } else {
                    self.fail_item(&text, class_of(cat));
                }
            }
            ExPhase::Pasv => {
                if let Some(endpoint) = passive_endpoint(&reply.text).filter(|_| ok) {
                    self.connect_explore_data(endpoint);
                } else {
                    self.fail_item(
                        &format!("cannot enter passive mode: {text}"),
                        class_of(cat),
                    );
                }
            }
            ExPhase::PortReply => {
                if ok {
                    self.send_job_command_with(|st| {
                        if let Some(Job::Explore(job)) = st.job.as_mut() {
                            job.phase = ExPhase::List;
                        }
                    }, "LIST");
                } else {
                    self.fail_item(&format!("PORT rejected: {text}"), class_of(cat));
                }
            }
            ExPhase::AwaitListen => {
                // No command is outstanding in this phase.
                warn!(uid = %self.uid_val(), "reply while waiting for the proxy listen endpoint");
            }
            ExPhase::List | ExPhase::Transfer => {
                if ok {
                    {
                        let mut st = self.lock();
                        if let Some(Job::Explore(job)) = st.job.as_mut() {
                            job.got_final = true;
                        }
                    }
                    self.maybe_finish_explore();
                } else {
                    self.fail_transfer(&text, class_of(cat), false);
                }
            }
            ExPhase::AppendList => {
                warn!(uid = %self.uid_val(), "reply while appending the listing");
            }
        }
    }

    fn advance_download(&self, reply: &Reply) {
        let phase = {
            let st = self.lock();
            match &st.job {
                Some(Job::Download(job)) => job.phase,
                _ => return,
            }
        };
        let cat = reply.category();
        let text = sanitize_error_text(&reply.text);
        let ok = cat == Some(ReplyCategory::Success);
        match phase {
            DlPhase::Type => {
                if ok {
                    let remote = self.current_remote_path();
                    self.send_job_command_with(|st| {
                        if let Some(Job::Download(job)) = st.job.as_mut() {
                            job.phase = DlPhase::Size;
                        }
                    }, &format!("SIZE {remote}"));
                } else {
                    self.fail_item(&text, class_of(cat));
                }
            }
            DlPhase::Size => {
                // SIZE is advisory; servers without it still transfer fine.
                if ok {
                    if let Some(n) = size_from_reply(&reply.text) {
                        if let Some(Job::Download(job)) = self.lock().job.as_mut() {
                            job.total = n;
                        }
                    }
                }
                self.open_data_path_download();
            }
            DlPhase::Pasv => {
                if let Some(endpoint) = passive_endpoint(&reply.text).filter(|_| ok) {
                    self.connect_download_data(endpoint);
                } else {
                    self.fail_item(
                        &format!("cannot enter passive mode: {text}"),
                        class_of(cat),
                    );
                }
            }
            DlPhase::PortReply => {
                if ok {
                    self.send_retr_or_rest();
                } else {
                    self.fail_item(&format!("PORT rejected: {text}"), class_of(cat));
                }
            }
            DlPhase::AwaitListen => {
                warn!(uid = %self.uid_val(), "reply while waiting for the proxy listen endpoint");
            }
            DlPhase::Rest => {
                if cat == Some(ReplyCategory::Intermediate) {
                    let remote = self.current_remote_path();
                    self.send_job_command_with(|st| {
                        if let Some(Job::Download(job)) = st.job.as_mut() {
                            job.phase = DlPhase::Retr;
                        }
                    }, &format!("RETR {remote}"));
                } else {
                    self.fail_transfer(
                        &format!("server refuses to resume: {text}"),
                        class_of(cat),
                        false,
                    );
                }
            }
            DlPhase::Retr | DlPhase::Transfer => {
                if ok {
                    {
                        let mut st = self.lock();
                        if let Some(Job::Download(job)) = st.job.as_mut() {
                            job.got_final = true;
                        }
                    }
                    self.maybe_finish_download();
                } else {
                    self.fail_transfer(&text, class_of(cat), false);
                }
            }
            DlPhase::StatLocal | DlPhase::OpenLocal | DlPhase::CloseFile => {
                warn!(uid = %self.uid_val(), ?phase, "reply during a disk phase");
            }
        }
    }

    fn advance_upload(&self, reply: &Reply) {
        let phase = {
            let st = self.lock();
            match &st.job {
                Some(Job::Upload(job)) => job.phase,
                _ => return,
            }
        };
        let cat = reply.category();
        let text = sanitize_error_text(&reply.text);
        let ok = cat == Some(ReplyCategory::Success);
        match phase {
            UlPhase::Type => {
                if ok {
                    let remote = self.current_remote_path();
                    self.send_job_command_with(|st| {
                        if let Some(Job::Upload(job)) = st.job.as_mut() {
                            job.phase = UlPhase::SizeRemote;
                        }
                    }, &format!("SIZE {remote}"));
                } else {
                    self.fail_item(&text, class_of(cat));
                }
            }
            UlPhase::SizeRemote => self.on_upload_size_reply(reply),
            UlPhase::Pasv => {
                if let Some(endpoint) = passive_endpoint(&reply.text).filter(|_| ok) {
                    self.connect_upload_data(endpoint);
                } else {
                    self.fail_item(
                        &format!("cannot enter passive mode: {text}"),
                        class_of(cat),
                    );
                }
            }
            UlPhase::PortReply => {
                if ok {
                    self.send_stor();
                } else {
                    self.fail_item(&format!("PORT rejected: {text}"), class_of(cat));
                }
            }
            UlPhase::AwaitListen => {
                warn!(uid = %self.uid_val(), "reply while waiting for the proxy listen endpoint");
            }
            UlPhase::Stor | UlPhase::Transfer => {
                if ok {
                    {
                        let mut st = self.lock();
                        if let Some(Job::Upload(job)) = st.job.as_mut() {
                            job.got_final = true;
                        }
                        if let Some(DataLink::Up { conn, .. }) = &st.data {
                            conn.upload_finished();
                        }
                    }
                    self.maybe_finish_upload();
                } else {
                    self.fail_transfer(&text, class_of(cat), false);
                }
            }
            UlPhase::StatLocal | UlPhase::OpenLocal | UlPhase::CloseFile => {
                warn!(uid = %self.uid_val(), ?phase, "reply during a disk phase");
            }
        }
    }

    /// Routes the `SIZE` probe of an upload: an existing remote file is the
    /// overwrite/resume conflict, a missing one means a plain `STOR`.
    fn on_upload_size_reply(&self, reply: &Reply) {
        let (local, forced) = {
            let st = self.lock();
            let Some(item) = &st.item else { return };
            match &item.kind {
                ItemKind::Upload { local, .. } => (local.clone(), item.forced),
                _ => return,
            }
        };
        let remote_len = if reply.category() == Some(ReplyCategory::Success) {
            size_from_reply(&reply.text)
        } else {
            None
        };
        match remote_len {
            Some(existing) if existing > 0 => match forced {
                ForcedAction::Ask => self.raise_conflict(format!(
                    "remote file already exists ({existing} bytes)"
                )),
                ForcedAction::Skip | ForcedAction::UseExisting => {
                    self.finish_item(ItemOutcome::Skipped);
                }
                ForcedAction::Resume => {
                    let whole = {
                        let mut st = self.lock();
                        match st.job.as_mut() {
                            Some(Job::Upload(job)) => {
                                job.resume_at = existing.min(job.local_len);
                                job.append = true;
                                job.phase = UlPhase::OpenLocal;
                                job.local_len <= existing
                            }
                            _ => return,
                        }
                    };
                    if whole {
                        // Nothing left to send.
                        self.finish_item(ItemOutcome::Done);
                        return;
                    }
                    let offset = existing;
                    self.submit_disk(
                        DiskRequest::OpenRead {
                            path: local,
                            offset,
                        },
                        DiskPurpose::OpenLocal,
                    );
                }
                ForcedAction::Overwrite => {
                    if let Some(Job::Upload(job)) = self.lock().job.as_mut() {
                        job.phase = UlPhase::OpenLocal;
                    }
                    self.submit_disk(
                        DiskRequest::OpenRead {
                            path: local,
                            offset: 0,
                        },
                        DiskPurpose::OpenLocal,
                    );
                }
            },
            _ => {
                if let Some(Job::Upload(job)) = self.lock().job.as_mut() {
                    job.phase = UlPhase::OpenLocal;
                }
                self.submit_disk(
                    DiskRequest::OpenRead {
                        path: local,
                        offset: 0,
                    },
                    DiskPurpose::OpenLocal,
                );
            }
        }
    }

    /// Applies `mutate` under the lock, then sends `line` (or holds it
    /// while paused). The phase is advanced before the send so the reply
    /// router sees consistent state whenever the reply arrives.
    fn send_job_command_with(&self, mutate: impl FnOnce(&mut WorkerInner), line: &str) {
        {
            let mut st = self.lock();
            mutate(&mut st);
        }
        self.send_job_command(line);
    }

    fn current_remote_path(&self) -> String {
        let st = self.lock();
        match st.item.as_ref().map(|i| &i.kind) {
            Some(ItemKind::Download { remote, .. } | ItemKind::Upload { remote, .. }) => {
                remote.clone()
            }
            _ => String::new(),
        }
    }

    // ---- data path setup ----

    fn owner_target(&self) -> Option<OwnerTarget> {
        let (_, slot) = self.binding()?;
        Some(OwnerTarget {
            slot,
            uid: self.control.uid(),
        })
    }

    fn make_download_conn(&self, to_disk: bool, total: u64) -> Option<Arc<DownloadConnection>> {
        let (reactor, _) = self.binding()?;
        let mut cfg = self.cfg.download.clone();
        cfg.compress = self.lock().compress_on;
        cfg.flush_to_disk = to_disk;
        let conn = DownloadConnection::new(cfg);
        let slot = reactor.register(Arc::clone(&conn) as Arc<dyn ReactorSocket>)?;
        conn.bind(&reactor, slot);
        conn.set_owner(self.owner_target());
        if total > 0 {
            conn.set_total_size(total);
        }
        self.lock().data = Some(DataLink::Down {
            conn: Arc::clone(&conn),
            slot,
        });
        Some(conn)
    }

    fn make_upload_conn(&self, total: u64) -> Option<Arc<UploadConnection>> {
        let (reactor, _) = self.binding()?;
        let mut cfg = self.cfg.upload.clone();
        cfg.compress = self.lock().compress_on;
        let conn = UploadConnection::new(cfg);
        let slot = reactor.register(Arc::clone(&conn) as Arc<dyn ReactorSocket>)?;
        conn.bind(&reactor, slot);
        conn.set_owner(self.owner_target());
        if total > 0 {
            conn.set_total_size(total);
        }
        self.lock().data = Some(DataLink::Up {
            conn: Arc::clone(&conn),
            slot,
        });
        Some(conn)
    }

    fn open_data_path_download(&self) {
        if self.profile.passive {
            self.send_job_command_with(|st| {
                if let Some(Job::Download(job)) = st.job.as_mut() {
                    job.phase = DlPhase::Pasv;
                }
            }, "PASV");
            return;
        }
        let total = match &self.lock().job {
            Some(Job::Download(job)) => job.total,
            _ => 0,
        };
        let Some(conn) = self.make_download_conn(true, total) else {
            self.fail_item("cannot register the data connection", ErrorClass::Fatal);
            return;
        };
        self.arm_active_listener(
            |st, endpoint| {
                if let Some(Job::Download(job)) = st.job.as_mut() {
                    job.phase = match endpoint {
                        Some(_) => DlPhase::PortReply,
                        None => DlPhase::AwaitListen,
                    };
                }
            },
            &ActiveArm::Down(conn),
        );
    }

    fn open_data_path_explore(&self) {
        if self.profile.passive {
            self.send_job_command_with(|st| {
                if let Some(Job::Explore(job)) = st.job.as_mut() {
                    job.phase = ExPhase::Pasv;
                }
            }, "PASV");
            return;
        }
        let Some(conn) = self.make_download_conn(false, 0) else {
            self.fail_item("cannot register the data connection", ErrorClass::Fatal);
            return;
        };
        self.arm_active_listener(
            |st, endpoint| {
                if let Some(Job::Explore(job)) = st.job.as_mut() {
                    job.phase = match endpoint {
                        Some(_) => ExPhase::PortReply,
                        None => ExPhase::AwaitListen,
                    };
                }
            },
            &ActiveArm::Down(conn),
        );
    }

    fn open_upload_data_path(&self) {
        if self.profile.passive {
            self.send_job_command_with(|st| {
                if let Some(Job::Upload(job)) = st.job.as_mut() {
                    job.phase = UlPhase::Pasv;
                }
            }, "PASV");
            return;
        }
        let total = match &self.lock().job {
            Some(Job::Upload(job)) => job.local_len.saturating_sub(job.resume_at),
            _ => 0,
        };
        let Some(conn) = self.make_upload_conn(total) else {
            self.fail_item("cannot register the data connection", ErrorClass::Fatal);
            return;
        };
        self.arm_active_listener(
            |st, endpoint| {
                if let Some(Job::Upload(job)) = st.job.as_mut() {
                    job.phase = match endpoint {
                        Some(_) => UlPhase::PortReply,
                        None => UlPhase::AwaitListen,
                    };
                }
            },
            &ActiveArm::Up(conn),
        );
    }

    /// Opens the active-mode listener: a local bind reports its endpoint
    /// synchronously and the `PORT` goes out now; a proxied BIND reports
    /// later through [`MSG_LISTEN_READY`].
    fn arm_active_listener(
        &self,
        set_phase: impl FnOnce(&mut WorkerInner, Option<(Ipv4Addr, u16)>),
        arm: &ActiveArm,
    ) {
        match &self.profile.proxy {
            Some(setup) => {
                let target = SocketAddrV4::new(
                    self.profile.host.parse().unwrap_or(Ipv4Addr::UNSPECIFIED),
                    self.profile.port,
                );
                let res = match arm {
                    ActiveArm::Down(conn) => conn.listen_via_proxy(setup.clone(), target),
                    ActiveArm::Up(conn) => conn.listen_via_proxy(setup.clone(), target),
                };
                if let Err(e) = res {
                    self.fail_item(&e.to_string(), ErrorClass::Retry);
                    return;
                }
                let mut st = self.lock();
                set_phase(&mut st, None);
            }
            None => {
                let local_ip = self
                    .control
                    .core()
                    .local_addr()
                    .map_or(Ipv4Addr::UNSPECIFIED, |a| *a.ip());
                let bind = SocketAddrV4::new(local_ip, 0);
                let endpoint = match arm {
                    ActiveArm::Down(conn) => conn.listen_on(bind),
                    ActiveArm::Up(conn) => conn.listen_on(bind),
                };
                match endpoint {
                    Ok((ip, port)) => {
                        let ip = if ip.is_unspecified() { local_ip } else { ip };
                        {
                            let mut st = self.lock();
                            set_phase(&mut st, Some((ip, port)));
                        }
                        self.send_job_command(&port_command(ip, port));
                    }
                    Err(e) => self.fail_item(&e.to_string(), ErrorClass::Retry),
                }
            }
        }
    }

    fn connect_download_data(&self, endpoint: (Ipv4Addr, u16)) {
        let total = match &self.lock().job {
            Some(Job::Download(job)) => job.total,
            _ => 0,
        };
        let Some(conn) = self.make_download_conn(true, total) else {
            self.fail_item("cannot register the data connection", ErrorClass::Fatal);
            return;
        };
        if let Err(e) = self.dial_data(&ActiveArm::Down(conn), endpoint) {
            self.fail_item(&e, ErrorClass::Retry);
            return;
        }
        self.send_retr_or_rest();
    }

    fn connect_upload_data(&self, endpoint: (Ipv4Addr, u16)) {
        let total = match &self.lock().job {
            Some(Job::Upload(job)) => job.local_len.saturating_sub(job.resume_at),
            _ => 0,
        };
        let Some(conn) = self.make_upload_conn(total) else {
            self.fail_item("cannot register the data connection", ErrorClass::Fatal);
            return;
        };
        if let Err(e) = self.dial_data(&ActiveArm::Up(conn), endpoint) {
            self.fail_item(&e, ErrorClass::Retry);
            return;
        }
        self.send_stor();
    }

    fn connect_explore_data(&self, endpoint: (Ipv4Addr, u16)) {
        let Some(conn) = self.make_download_conn(false, 0) else {
            self.fail_item("cannot register the data connection", ErrorClass::Fatal);
            return;
        };
        if let Err(e) = self.dial_data(&ActiveArm::Down(conn), endpoint) {
            self.fail_item(&e, ErrorClass::Retry);
            return;
        }
        self.send_job_command_with(|st| {
            if let Some(Job::Explore(job)) = st.job.as_mut() {
                job.phase = ExPhase::List;
            }
        }, "LIST");
    }

    fn dial_data(&self, arm: &ActiveArm, endpoint: (Ipv4Addr, u16)) -> Result<(), String> {
        let addr = SocketAddrV4::new(endpoint.0, endpoint.1);
        let res = match (&self.profile.proxy, arm) {
            (Some(setup), ActiveArm::Down(conn)) => conn.connect_via_proxy(setup.clone(), addr),
            (Some(setup), ActiveArm::Up(conn)) => conn.connect_via_proxy(setup.clone(), addr),
            (None, ActiveArm::Down(conn)) => conn.connect(addr),
            (None, ActiveArm::Up(conn)) => conn.connect(addr),
        };
        res.map_err(|e| e.to_string())
    }

    fn send_retr_or_rest(&self) {
        let (resume_at, remote) = {
            let st = self.lock();
            let resume = match &st.job {
                Some(Job::Download(job)) => job.resume_at,
                _ => 0,
            };
            drop(st);
            (resume, self.current_remote_path())
        };
        if resume_at > 0 {
            self.send_job_command_with(|st| {
                if let Some(Job::Download(job)) = st.job.as_mut() {
                    job.phase = DlPhase::Rest;
                }
            }, &format!("REST {resume_at}"));
        } else {
            self.send_job_command_with(|st| {
                if let Some(Job::Download(job)) = st.job.as_mut() {
                    job.phase = DlPhase::Retr;
                }
            }, &format!("RETR {remote}"));
        }
    }

    fn send_stor(&self) {
        let (append, remote) = {
            let st = self.lock();
            let append = match &st.job {
                Some(Job::Upload(job)) => job.append,
                _ => false,
            };
            drop(st);
            (append, self.current_remote_path())
        };
        let verb = if append { "APPE" } else { "STOR" };
        self.send_job_command_with(|st| {
            if let Some(Job::Upload(job)) = st.job.as_mut() {
                job.phase = UlPhase::Stor;
            }
        }, &format!("{verb} {remote}"));
    }

    // ---- data connection messages ----

    fn on_data_message(&self, kind: MsgKind, payload: u64) {
        {
            let st = self.lock();
            match &st.data {
                Some(link) if link.uid().value() == payload => {}
                _ => {
                    trace!(uid = %self.uid_val(), kind = kind.0, payload, "stale data message dropped");
                    return;
                }
            }
        }
        match kind {
            MSG_DATA_CONNECTED => {
                trace!(uid = %self.uid_val(), "data connection established");
                self.control.extend_deadline(self.cfg.command_timeout);
            }
            MSG_LISTEN_READY => self.on_listen_ready(),
            MSG_FLUSH_DATA => self.on_flush_data(),
            MSG_PREPARE_DATA => self.on_prepare_data(),
            MSG_DATA_CLOSED => self.on_data_closed(),
            MSG_TRANSFER_FINISHED => self.on_transfer_finished(),
            _ => trace!(uid = %self.uid_val(), kind = kind.0, "unhandled data message"),
        }
    }

    /// A proxied BIND settled; the proxy's endpoint goes into the `PORT`.
    fn on_listen_ready(&self) {
        let endpoint = {
            let st = self.lock();
            st.data.as_ref().and_then(DataLink::listen_endpoint)
        };
        let Some((ip, port)) = endpoint else {
            self.fail_item("proxy listen failed", ErrorClass::Retry);
            return;
        };
        self.send_job_command_with(|st| match st.job.as_mut() {
            Some(Job::Download(job)) if job.phase == DlPhase::AwaitListen => {
                job.phase = DlPhase::PortReply;
            }
            Some(Job::Upload(job)) if job.phase == UlPhase::AwaitListen => {
                job.phase = UlPhase::PortReply;
            }
            Some(Job::Explore(job)) if job.phase == ExPhase::AwaitListen => {
                job.phase = ExPhase::PortReply;
            }
            _ => {}
        }, &port_command(ip, port));
    }

    /// A flush buffer is staged; check it out and ship it to the disk
    /// thread. Ownership of the buffer travels with the request.
    fn on_flush_data(&self) {
        let (buffer, file) = {
            let st = self.lock();
            let conn = match &st.data {
                Some(DataLink::Down { conn, .. }) => Arc::clone(conn),
                _ => return,
            };
            let file = match &st.job {
                Some(Job::Download(job)) => job.file,
                _ => None,
            };
            drop(st);
            (conn.give_flush_data(), file)
        };
        let Some(buffer) = buffer else { return };
        let Some(file) = file else {
            warn!(uid = %self.uid_val(), "flush data with no open target file");
            return;
        };
        self.control.extend_deadline(self.cfg.command_timeout);
        self.submit_disk(
            DiskRequest::WriteBlock { file, buffer },
            DiskPurpose::WriteFlush,
        );
    }

    fn on_flush_written(&self, outcome: DiskOutcome) {
        let DiskOutcome::Written { buffer } = outcome else {
            self.fail_transfer("unexpected disk outcome", ErrorClass::Fatal, true);
            return;
        };
        let conn = {
            let st = self.lock();
            match &st.data {
                Some(DataLink::Down { conn, .. }) => Some(Arc::clone(conn)),
                _ => None,
            }
        };
        match conn {
            Some(conn) => {
                conn.flush_done(buffer);
                // After a close the swap side no longer self-drives; kick
                // out whatever tail is still buffered.
                if !conn.is_connected() {
                    conn.all_data_flushed(false);
                }
            }
            // The transfer was torn down while the write was out; the
            // buffer is simply dropped here, the connection forgot it.
            None => trace!(uid = %self.uid_val(), "flush completed after teardown"),
        }
    }

    /// The upload staged out; check out the prepare buffer and ask the
    /// disk thread for the next block.
    fn on_prepare_data(&self) {
        let (conn, file) = {
            let st = self.lock();
            let conn = match &st.data {
                Some(DataLink::Up { conn, .. }) => Arc::clone(conn),
                _ => return,
            };
            let file = match &st.job {
                Some(Job::Upload(job)) => job.file,
                _ => None,
            };
            (conn, file)
        };
        let Some(file) = file else {
            warn!(uid = %self.uid_val(), "prepare request with no open source file");
            return;
        };
        let Some(prep) = conn.give_buffer_for_data() else {
            return;
        };
        let max = prep.capacity();
        {
            let mut st = self.lock();
            if let Some(Job::Upload(job)) = st.job.as_mut() {
                if job.prep.is_some() {
                    warn!(uid = %self.uid_val(), "prepare buffer already parked");
                }
                job.prep = Some(prep);
            }
        }
        self.control.extend_deadline(self.cfg.command_timeout);
        self.submit_disk(DiskRequest::ReadBlock { file, max }, DiskPurpose::ReadPrep);
    }

    fn on_prep_read(&self, outcome: DiskOutcome) {
        let DiskOutcome::ReadBlock { bytes, eof } = outcome else {
            self.fail_transfer("unexpected disk outcome", ErrorClass::Fatal, false);
            return;
        };
        let (conn, prep) = {
            let mut st = self.lock();
            let conn = match &st.data {
                Some(DataLink::Up { conn, .. }) => Some(Arc::clone(conn)),
                _ => None,
            };
            let prep = match st.job.as_mut() {
                Some(Job::Upload(job)) => job.prep.take(),
                _ => None,
            };
            (conn, prep)
        };
        let (Some(conn), Some(mut prep)) = (conn, prep) else {
            trace!(uid = %self.uid_val(), "file block read after teardown");
            return;
        };
        *prep.buf_mut() = bytes;
        conn.data_prepared(prep, eof);
    }

    fn on_data_closed(&self) {
        let (error, flush_kick) = {
            let st = self.lock();
            let error = st.data.as_ref().and_then(DataLink::take_error);
            let kick = match (&st.data, &st.job) {
                (Some(DataLink::Down { conn, .. }), Some(Job::Download(_))) => {
                    Some(Arc::clone(conn))
                }
                _ => None,
            };
            (error, kick)
        };
        if let Some(e) = error {
            let poison = e.poisons_target();
            self.fail_transfer(&e.to_string(), ErrorClass::Retry, poison);
            return;
        }
        // A clean close fires MSG_TRANSFER_FINISHED once every byte is
        // handed over; a disk-bound download may still hold a tail that
        // needs one more flush cycle to get there.
        if let Some(conn) = flush_kick {
            conn.all_data_flushed(false);
        }
    }

    fn on_transfer_finished(&self) {
        let kind = {
            let mut st = self.lock();
            match st.job.as_mut() {
                Some(Job::Download(job)) => {
                    job.data_done = true;
                    0
                }
                Some(Job::Upload(job)) => {
                    job.data_done = true;
                    1
                }
                Some(Job::Explore(job)) => {
                    job.data_done = true;
                    2
                }
                _ => return,
            }
        };
        match kind {
            0 => self.maybe_finish_download(),
            1 => self.maybe_finish_upload(),
            _ => self.collect_listing(),
        }
    }

    // ---- completion ----

    fn maybe_finish_download(&self) {
        let submit_close = {
            let mut st = self.lock();
            match st.job.as_mut() {
                Some(Job::Download(job)) => {
                    if !(job.got_final && job.data_done) || job.close_submitted {
                        return;
                    }
                    job.close_submitted = true;
                    job.phase = DlPhase::CloseFile;
                    job.file.take().map(|f| (f, job.poisoned))
                }
                _ => return,
            }
        };
        match submit_close {
            Some((file, delete)) => {
                self.submit_disk(DiskRequest::CloseFile { file, delete }, DiskPurpose::CloseFile);
            }
            None => self.finish_after_close(None),
        }
    }

    fn maybe_finish_upload(&self) {
        let submit_close = {
            let mut st = self.lock();
            match st.job.as_mut() {
                Some(Job::Upload(job)) => {
                    if !(job.got_final && job.data_done) || job.close_submitted {
                        return;
                    }
                    job.close_submitted = true;
                    job.phase = UlPhase::CloseFile;
                    job.file.take()
                }
                _ => return,
            }
        };
        match submit_close {
            Some(file) => self.submit_disk(
                DiskRequest::CloseFile {
                    file,
                    delete: false,
                },
                DiskPurpose::CloseFile,
            ),
            None => self.finish_after_close(None),
        }
    }

    /// Hands the collected listing bytes to the disk thread's list sink.
    fn collect_listing(&self) {
        let conn = {
            let st = self.lock();
            match &st.data {
                Some(DataLink::Down { conn, .. }) => Some(Arc::clone(conn)),
                _ => None,
            }
        };
        let Some(conn) = conn else { return };
        match conn.take_collected() {
            Ok(bytes) => {
                {
                    let mut st = self.lock();
                    if let Some(Job::Explore(job)) = st.job.as_mut() {
                        job.phase = ExPhase::AppendList;
                    }
                }
                self.submit_disk(
                    DiskRequest::ListAppend {
                        sink: Arc::clone(&self.listings),
                        bytes,
                    },
                    DiskPurpose::AppendList,
                );
            }
            Err(e) => self.fail_transfer(&e.to_string(), ErrorClass::Retry, false),
        }
    }

    fn on_list_appended(&self) {
        {
            let mut st = self.lock();
            if let Some(Job::Explore(job)) = st.job.as_mut() {
                job.appended = true;
            }
        }
        self.maybe_finish_explore();
    }

    fn maybe_finish_explore(&self) {
        let done = {
            let st = self.lock();
            match &st.job {
                Some(Job::Explore(job)) => job.got_final && job.data_done && job.appended,
                _ => false,
            }
        };
        if done {
            self.finish_item(ItemOutcome::Done);
        }
    }

    /// The target/source file is closed; report the item's outcome.
    fn finish_after_close(&self, close_error: Option<&str>) {
        let failed = {
            let mut st = self.lock();
            match st.job.as_mut() {
                Some(Job::Download(job)) => job.failed.take(),
                Some(Job::Upload(job)) => job.failed.take(),
                _ => None,
            }
        };
        match (failed, close_error) {
            (Some((text, ErrorClass::Retry)), _) => {
                self.finish_item(ItemOutcome::TransientFailure(text));
            }
            (Some((text, _)), _) => self.finish_item(ItemOutcome::Failed(text)),
            (None, Some(text)) => {
                self.finish_item(ItemOutcome::Failed(format!("local file error: {text}")));
            }
            (None, None) => self.finish_item(ItemOutcome::Done),
        }
    }

    /// A transfer failed mid-flight: cancel the data stream and, when a
    /// file is open, close it (deleting a poisoned download target) before
    /// reporting.
    fn fail_transfer(&self, text: &str, class: ErrorClass, poison: bool) {
        let text = sanitize_error_text(text);
        self.control.log().error(format!("transfer failed: {text}"));
        self.teardown_data();
        let close = {
            let mut st = self.lock();
            st.error = Some(text.clone());
            match st.job.as_mut() {
                Some(Job::Download(job)) => {
                    job.failed = Some((text.clone(), class));
                    job.poisoned = job.poisoned || poison;
                    if job.close_submitted {
                        None
                    } else {
                        job.close_submitted = true;
                        let delete = job.poisoned;
                        job.file.take().map(|f| (f, delete))
                    }
                }
                Some(Job::Upload(job)) => {
                    job.failed = Some((text.clone(), class));
                    job.prep = None;
                    if job.close_submitted {
                        None
                    } else {
                        job.close_submitted = true;
                        job.file.take().map(|f| (f, false))
                    }
                }
                Some(Job::Explore(_)) | Some(Job::Simple) | None => {
                    drop(st);
                    match class {
                        ErrorClass::Retry => {
                            self.finish_item(ItemOutcome::TransientFailure(text.clone()));
                        }
                        _ => self.finish_item(ItemOutcome::Failed(text.clone())),
                    }
                    return;
                }
            }
        };
        match close {
            Some((file, delete)) => {
                self.submit_disk(DiskRequest::CloseFile { file, delete }, DiskPurpose::CloseFile);
            }
            None => self.finish_after_close(None),
        }
    }

    /// A non-transfer item failed.
    fn fail_item(&self, text: &str, class: ErrorClass) {
        let text = sanitize_error_text(text);
        self.control.log().error(text.clone());
        self.teardown_data();
        {
            let mut st = self.lock();
            st.error = Some(text.clone());
        }
        match class {
            ErrorClass::Retry => self.finish_item(ItemOutcome::TransientFailure(text)),
            _ => self.finish_item(ItemOutcome::Failed(text)),
        }
    }

    /// An ambiguous outcome: hand the item to the resolver and move on.
    fn raise_conflict(&self, text: String) {
        self.teardown_data();
        let item = {
            let mut st = self.lock();
            st.job = None;
            st.disk = None;
            st.held_command = None;
            st.item.take()
        };
        let Some(item) = item else { return };
        self.control
            .log()
            .info(format!("needs a decision: {text} ({})", item.summary()));
        self.observer.conflict(item, text);
        self.after_item();
    }

    fn finish_item(&self, outcome: ItemOutcome) {
        self.teardown_data();
        let item = {
            let mut st = self.lock();
            st.job = None;
            st.disk = None;
            st.held_command = None;
            st.item.take()
        };
        let Some(item) = item else {
            self.after_item();
            return;
        };
        match &outcome {
            ItemOutcome::Done | ItemOutcome::LinkResolved { .. } => {
                self.control.log().info(format!("done: {}", item.summary()));
            }
            ItemOutcome::Skipped => {
                self.control
                    .log()
                    .info(format!("skipped: {}", item.summary()));
            }
            ItemOutcome::TransientFailure(text) | ItemOutcome::Failed(text) => {
                self.control
                    .log()
                    .error(format!("failed: {} ({text})", item.summary()));
            }
        }
        if let ItemOutcome::TransientFailure(_) = &outcome {
            self.queue.return_item(item.clone(), InDoubtFlags::default());
        }
        self.observer.item_finished(&item, &outcome);
        self.after_item();
    }

    fn after_item(&self) {
        {
            let mut st = self.lock();
            if st.state == WorkerState::Working || st.state == WorkerState::Preparing {
                st.state = WorkerState::LookingForWork;
            }
        }
        self.look_for_work();
    }

    fn teardown_data(&self) {
        let link = self.lock().data.take();
        let Some(link) = link else { return };
        link.cancel();
        if let Some((reactor, _)) = self.binding() {
            let (slot, uid) = match &link {
                DataLink::Down { conn, slot } => (*slot, conn.uid()),
                DataLink::Up { conn, slot } => (*slot, conn.uid()),
            };
            reactor.deregister(slot, uid, DeregisterMode::Drop);
        }
    }

    // ---- timers ----

    fn on_reply_deadline(&self, seq: u64) {
        if seq == 0 {
            // The connect/greeting deadline.
            let relevant = {
                let st = self.lock();
                st.state == WorkerState::Connecting
                    && matches!(st.login, Login::NotConnected | Login::Welcome)
            };
            if relevant {
                self.connect_failed("timed out waiting for the server");
            }
            return;
        }
        if !self.control.is_current(seq) {
            trace!(uid = %self.uid_val(), seq, "stale reply deadline dropped");
            return;
        }
        // A busy data connection keeps the final reply legitimately late;
        // push the deadline back instead of giving up.
        let data_active = {
            let st = self.lock();
            st.data.as_ref().is_some_and(|link| {
                let (_, _, _, idle, closed_at, connected) = link.progress();
                (connected && idle < self.cfg.command_timeout)
                    || closed_at
                        .is_some_and(|t| t.elapsed() < self.cfg.command_timeout)
            })
        };
        if data_active {
            trace!(uid = %self.uid_val(), seq, "reply deadline extended, data is moving");
            self.control.extend_deadline(self.cfg.command_timeout);
            return;
        }
        self.control.log().error("no reply from the server in time");
        self.connection_lost(&WorkerError::CommandTimeout.to_string());
    }

    fn on_reconnect_timer(&self) {
        if self.lock().state == WorkerState::WaitingForReconnect {
            self.begin_connect();
        }
    }

    fn on_keep_alive_timer(&self) {
        let Some(ka) = &self.cfg.keep_alive else { return };
        let send = {
            let mut st = self.lock();
            if st.state != WorkerState::Sleeping || !self.control.core().is_ready() {
                return;
            }
            let idle = st.sleep_since.map_or(Duration::ZERO, |t| t.elapsed());
            if idle >= ka.stop_after {
                info!(uid = %self.uid_val(), "keep-alive window over, letting the connection age out");
                return;
            }
            if self.control.pending().is_some() {
                false
            } else {
                st.expect_keep_alive = true;
                true
            }
        };
        if send {
            if let Err(e) = self
                .control
                .send_command(ka.command.line(), self.cfg.command_timeout)
            {
                self.lock().expect_keep_alive = false;
                debug!(uid = %self.uid_val(), error = %e, "keep-alive send failed");
            }
        }
        if let Some((reactor, slot)) = self.binding() {
            reactor.add_timer(
                slot,
                self.control.uid(),
                Instant::now() + ka.send_every,
                TIMER_KEEP_ALIVE,
                0,
            );
        }
    }

    // ---- control events, wakeups, stop ----

    fn on_control_event(&self, ev: OwnerEvent) {
        match ev {
            OwnerEvent::Connected => {
                self.lock().login = Login::Welcome;
                self.control.log().info("connected, waiting for the greeting");
            }
            OwnerEvent::ConnectFailed(e) => self.connect_failed(&e.to_string()),
            OwnerEvent::Readable => match self.control.on_readable() {
                Ok(replies) => {
                    for reply in &replies {
                        self.handle_reply(reply);
                    }
                }
                Err(e) => self.connection_lost(&e.to_string()),
            },
            OwnerEvent::Closed { error } => {
                // Pick up any final words before reporting the loss.
                let replies = self.control.drain_buffered();
                for reply in &replies {
                    self.handle_reply(reply);
                }
                let still_lost = {
                    let st = self.lock();
                    !matches!(
                        st.state,
                        WorkerState::WaitingForReconnect
                            | WorkerState::ConnectionError
                            | WorkerState::Stopped
                    )
                };
                if still_lost {
                    let text = match error {
                        Some(kind) => format!("control connection lost: {kind:?}"),
                        None => "control connection closed by the server".to_owned(),
                    };
                    self.connection_lost(&text);
                }
            }
            OwnerEvent::Writable | OwnerEvent::WriteDrained => {}
            other => {
                trace!(uid = %self.uid_val(), ?other, "event has no meaning on a control connection");
            }
        }
    }

    fn on_work_available(&self) {
        let (state, login, held) = {
            let mut st = self.lock();
            if st.stop_requested {
                drop(st);
                self.do_stop();
                return;
            }
            if st.paused {
                st.deferred_look = true;
                return;
            }
            let held = st.held_command.take();
            (st.state, st.login.clone(), held)
        };
        // Resume first: a held job command continues the current item.
        if let Some(line) = held {
            self.send_job_command(&line);
            return;
        }
        match state {
            WorkerState::LookingForWork if login == Login::NotConnected => self.begin_connect(),
            WorkerState::LookingForWork => self.look_for_work(),
            WorkerState::Sleeping => {
                if let Some((reactor, _)) = self.binding() {
                    reactor.delete_timer(self.control.uid(), TIMER_KEEP_ALIVE);
                }
                self.lock().sleep_since = None;
                self.look_for_work();
            }
            WorkerState::Stopped | WorkerState::ConnectionError => {
                trace!(uid = %self.uid_val(), ?state, "work notification ignored");
            }
            _ => {
                self.lock().work_waiting = true;
            }
        }
    }

    fn do_stop(&self) {
        let in_doubt = self.current_in_doubt();
        if let Some((reactor, _)) = self.binding() {
            reactor.delete_timer(self.control.uid(), TIMER_RECONNECT);
            reactor.delete_timer(self.control.uid(), TIMER_KEEP_ALIVE);
        }
        self.control.reset();
        self.abandon_item(in_doubt);
        {
            let mut st = self.lock();
            st.state = WorkerState::Stopped;
            st.login = Login::NotConnected;
            st.disk = None;
        }
        self.control.log().info("worker stopped");
    }
}

/// Which direction of data connection an active-mode arm works on.
enum ActiveArm {
    Down(Arc<DownloadConnection>),
    Up(Arc<UploadConnection>),
}

impl ReactorSocket for Worker {
    fn uid(&self) -> SocketUid {
        self.control.uid()
    }

    fn on_ready(&self, _reactor: &Reactor, event: NetEvent) {
        let (owner, actions) = self.control.core().handle_event(event);
        run_actions(self.control.core(), actions);
        if let Some(ev) = owner {
            self.on_control_event(ev);
        }
    }

    fn on_timer(&self, _reactor: &Reactor, kind: TimerKind, payload: u64) {
        match kind {
            TIMER_REPLY => self.on_reply_deadline(payload),
            TIMER_RECONNECT => self.on_reconnect_timer(),
            TIMER_KEEP_ALIVE => self.on_keep_alive_timer(),
            _ => trace!(uid = %self.uid_val(), kind = kind.0, "unhandled timer"),
        }
    }

    fn on_message(&self, _reactor: &Reactor, kind: MsgKind, payload: u64) {
        if let Some((owner, actions)) = self.control.core().handle_message(kind, payload) {
            run_actions(self.control.core(), actions);
            if let Some(ev) = owner {
                self.on_control_event(ev);
            }
            return;
        }
        match kind {
            MSG_WORK_AVAILABLE => self.on_work_available(),
            MSG_STOP => self.do_stop(),
            MSG_DISK_DONE => self.on_disk_done(payload),
            MSG_DATA_CONNECTED | MSG_DATA_CLOSED | MSG_FLUSH_DATA | MSG_PREPARE_DATA
            | MSG_TRANSFER_FINISHED | MSG_LISTEN_READY => self.on_data_message(kind, payload),
            _ => trace!(uid = %self.uid_val(), kind = kind.0, "unhandled message"),
        }
    }
}

/// `PORT h1,h2,h3,h4,p1,p2` for an active-mode endpoint.
fn port_command(ip: Ipv4Addr, port: u16) -> String {
    let o = ip.octets();
    format!(
        "PORT {},{},{},{},{},{}",
        o[0],
        o[1],
        o[2],
        o[3],
        port >> 8,
        port & 0xff
    )
}

/// Failure class from a final reply's category: transient codes are worth
/// a retry, everything else is final for this item.
fn class_of(cat: Option<ReplyCategory>) -> ErrorClass {
    match cat {
        Some(ReplyCategory::Transient) => ErrorClass::Retry,
        _ => ErrorClass::Fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_command_splits_the_endpoint() {
        assert_eq!(
            port_command(Ipv4Addr::new(192, 168, 0, 12), 1045),
            "PORT 192,168,0,12,4,21"
        );
        assert_eq!(
            port_command(Ipv4Addr::new(10, 0, 0, 1), 255),
            "PORT 10,0,0,1,0,255"
        );
    }

    #[test]
    fn failure_class_follows_the_reply_category() {
        assert_eq!(class_of(Some(ReplyCategory::Transient)), ErrorClass::Retry);
        assert_eq!(class_of(Some(ReplyCategory::Permanent)), ErrorClass::Fatal);
        assert_eq!(class_of(None), ErrorClass::Fatal);
    }

    #[test]
    fn fresh_worker_reports_looking_for_work() {
        let inner = WorkerInner::new();
        assert_eq!(inner.state, WorkerState::LookingForWork);
        assert_eq!(inner.login, Login::NotConnected);
        assert!(inner.item.is_none());
        assert!(!inner.paused);
    }
}
