//! Upload side of a data connection.
//!
//! File bytes arrive in prepare buffers and move, optionally through a
//! deflate stream, into a staging buffer; staging and the socket-facing
//! write buffer swap whenever the write side drains, so disk reads and
//! socket writes overlap. Send sizes follow the adaptive packet sizer:
//! some links collapse under large writes, and the sizer backs off and
//! remembers the size that broke them.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use flate2::{Compress, Compression, FlushCompress, Status};
use netio::{OwnerEvent, ProxySetup, SocketCore, SocketError, run_actions};
use reactor::{MsgKind, NetEvent, Readiness, Reactor, ReactorSocket, SlotId, SocketUid, TimerKind};
use tracing::{debug, info, trace, warn};

use crate::conn::{
    ConnBinding, MSG_DATA_CLOSED, MSG_DATA_CONNECTED, MSG_LISTEN_READY, MSG_PREPARE_DATA,
    MSG_TRANSFER_FINISHED, NO_DATA_PERIOD, OwnerTarget, Postponed, TIMER_NO_DATA, TransferPhase,
    UploadStatus, post_to_owner,
};
use crate::error::DataConError;
use crate::packet::{PacketSizer, PacketTuning};
use crate::speed::{self, SharedMeter, TransferSpeedMeter};

/// Behavior knobs for an upload data connection.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UploadConfig {
    /// Size of the prepare and staging buffers.
    pub flush_buffer_size: usize,
    /// Closes the stream as lost when no byte moves for this long.
    pub no_data_timeout: Option<Duration>,
    /// Deflate the stream on the way out (MODE Z).
    pub compress: bool,
    /// Packet sizing ladder and probe timing.
    pub packet: PacketTuning,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            flush_buffer_size: 64 * 1024,
            no_data_timeout: Some(Duration::from_secs(180)),
            compress: false,
            packet: PacketTuning::default(),
        }
    }
}

/// An empty buffer checked out to be filled with the next batch of file
/// bytes and handed back through [`UploadConnection::data_prepared`].
/// Fill up to [`capacity`](Self::capacity) bytes per batch.
#[derive(Debug)]
pub struct PrepareBuffer {
    pub(crate) buf: Vec<u8>,
}

impl PrepareBuffer {
    /// The buffer to fill.
    pub fn buf_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    /// Suggested batch size.
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }
}

struct UpState {
    phase: TransferPhase,
    owner: Option<OwnerTarget>,
    passive: Option<SocketAddrV4>,
    proxy: Option<ProxySetup>,
    received_connected: bool,
    paused: bool,
    postponed: Postponed,
    /// Socket-facing buffer; `write_off` is the send position within it.
    to_write: Vec<u8>,
    write_off: usize,
    /// Decompressed bytes the unsent part of `to_write` represents.
    decompr_in_to_write: usize,
    /// Staging buffer; in plain mode also the prepare buffer, so `None`
    /// while checked out.
    staged: Option<Vec<u8>>,
    /// Published byte count of the staging buffer; 0 until a batch is
    /// complete.
    staged_valid: usize,
    decompr_in_staged: usize,
    /// MODE Z source batch; `None` while checked out.
    compr_src: Option<Vec<u8>>,
    compr_out: bool,
    /// Bytes of the source batch already deflated; a batch with a
    /// remainder is continued when staging space frees up.
    src_consumed: usize,
    deflater: Option<Compress>,
    /// EOF was handed in; every further deflate call must finish the
    /// stream.
    finishing: bool,
    eof_reached: bool,
    closed_on_eof: bool,
    prepare_sent: bool,
    waiting_for_write: bool,
    first_write: bool,
    first_write_time: Option<Instant>,
    /// Warmup bytes excluded from the meters, credited at the end.
    skipped: u64,
    sizer: PacketSizer,
    no_data_timeout_hit: bool,
    net_error: Option<io::ErrorKind>,
    socket_error: Option<SocketError>,
    total_written: u64,
    total_size: u64,
    last_activity: Option<Instant>,
    closed_at: Option<Instant>,
    meter: TransferSpeedMeter,
    /// Wire-side meter for MODE Z; packet sizing follows the wire.
    compr_meter: TransferSpeedMeter,
    global_meter: Option<SharedMeter>,
    listen_endpoint: Option<(Ipv4Addr, u16)>,
}

impl UpState {
    fn new(tuning: PacketTuning) -> Self {
        Self {
            phase: TransferPhase::Idle,
            owner: None,
            passive: None,
            proxy: None,
            received_connected: false,
            paused: false,
            postponed: Postponed::None,
            to_write: Vec::new(),
            write_off: 0,
            decompr_in_to_write: 0,
            staged: Some(Vec::new()),
            staged_valid: 0,
            decompr_in_staged: 0,
            compr_src: None,
            compr_out: false,
            src_consumed: 0,
            deflater: None,
            finishing: false,
            eof_reached: false,
            closed_on_eof: false,
            prepare_sent: false,
            waiting_for_write: true,
            first_write: false,
            first_write_time: None,
            skipped: 0,
            sizer: PacketSizer::new(tuning),
            no_data_timeout_hit: false,
            net_error: None,
            socket_error: None,
            total_written: 0,
            total_size: 0,
            last_activity: None,
            closed_at: None,
            meter: TransferSpeedMeter::new(),
            compr_meter: TransferSpeedMeter::new(),
            global_meter: None,
            listen_endpoint: None,
        }
    }

    fn delayed_pending(&self) -> bool {
        self.compr_src
            .as_ref()
            .is_some_and(|s| self.src_consumed < s.len())
    }

    fn write_pending(&self) -> bool {
        self.write_off < self.to_write.len()
    }
}

/// Sending half of an FTP data connection.
///
/// Register with a reactor, [`bind`](Self::bind), then dial or listen.
/// The owner feeds file bytes through
/// [`give_buffer_for_data`](Self::give_buffer_for_data)/
/// [`data_prepared`](Self::data_prepared); a prepare request is posted
/// whenever the connection runs dry before EOF.
pub struct UploadConnection {
    core: Arc<SocketCore>,
    binding: Mutex<Option<ConnBinding>>,
    cfg: UploadConfig,
    st: Mutex<UpState>,
}

impl UploadConnection {
    /// Creates a detached upload connection.
    pub fn new(cfg: UploadConfig) -> Arc<Self> {
        let st = UpState::new(cfg.packet.clone());
        Arc::new(Self {
            core: SocketCore::new(),
            binding: Mutex::new(None),
            cfg,
            st: Mutex::new(st),
        })
    }

    /// Identity this connection registers under.
    pub fn uid(&self) -> SocketUid {
        self.core.uid()
    }

    /// Wires the connection to its reactor slot. Call right after
    /// registering.
    pub fn bind(&self, reactor: &Reactor, slot: SlotId) {
        self.core.bind(reactor, slot);
        *self.binding.lock().unwrap_or_else(PoisonError::into_inner) = Some(ConnBinding {
            reactor: reactor.clone(),
            slot,
        });
    }

    /// Directs notifications to the owning worker.
    pub fn set_owner(&self, owner: Option<OwnerTarget>) {
        self.lock_state().owner = owner;
    }

    /// Shares the process-wide aggregate meter.
    pub fn set_global_meter(&self, meter: Option<SharedMeter>) {
        self.lock_state().global_meter = meter;
    }

    /// Expected transfer size, used to clamp the status total.
    pub fn set_total_size(&self, total: u64) {
        self.lock_state().total_size = total;
    }

    /// Dials the passive-mode endpoint.
    pub fn connect(&self, addr: SocketAddrV4) -> Result<(), DataConError> {
        {
            let mut st = self.lock_state();
            reset_attempt(&mut st, self.cfg.compress);
            st.passive = Some(addr);
            st.proxy = None;
            st.phase = TransferPhase::Connecting;
        }
        self.core.connect(addr)?;
        Ok(())
    }

    /// Dials the passive-mode endpoint through a proxy.
    pub fn connect_via_proxy(
        &self,
        setup: ProxySetup,
        addr: SocketAddrV4,
    ) -> Result<(), DataConError> {
        {
            let mut st = self.lock_state();
            reset_attempt(&mut st, self.cfg.compress);
            st.passive = Some(addr);
            st.proxy = Some(setup.clone());
            st.phase = TransferPhase::Connecting;
        }
        self.core
            .connect_via_proxy(setup, &addr.ip().to_string(), Some(*addr.ip()), addr.port())?;
        Ok(())
    }

    /// Opens a local listener for active mode and reports its endpoint.
    pub fn listen_on(&self, addr: SocketAddrV4) -> Result<(Ipv4Addr, u16), DataConError> {
        {
            let mut st = self.lock_state();
            reset_attempt(&mut st, self.cfg.compress);
            st.listen_endpoint = None;
            st.phase = TransferPhase::Connecting;
        }
        let got = self.core.listen(addr)?;
        self.lock_state().listen_endpoint = Some(got);
        Ok(got)
    }

    /// Asks a SOCKS proxy to listen on our behalf; the endpoint arrives
    /// via [`MSG_LISTEN_READY`].
    pub fn listen_via_proxy(
        &self,
        setup: ProxySetup,
        target: SocketAddrV4,
    ) -> Result<(), DataConError> {
        {
            let mut st = self.lock_state();
            reset_attempt(&mut st, self.cfg.compress);
            st.listen_endpoint = None;
            st.proxy = Some(setup.clone());
            st.phase = TransferPhase::Connecting;
        }
        self.core.listen_via_proxy(setup, target)?;
        Ok(())
    }

    /// Marks the transfer command as sent; retries a refused passive dial.
    pub fn activate(&self) {
        let (addr, proxy) = {
            let st = self.lock_state();
            let failed = st.socket_error.is_some() || st.net_error.is_some();
            if !st.received_connected && failed {
                (st.passive, st.proxy.clone())
            } else {
                (None, None)
            }
        };
        let Some(addr) = addr else { return };
        info!(uid = %self.core.uid(), %addr, "retrying refused passive data connection");
        let res = match proxy {
            Some(setup) => self.connect_via_proxy(setup, addr),
            None => self.connect(addr),
        };
        if let Err(e) = res {
            warn!(uid = %self.core.uid(), error = %e, "passive retry failed to start");
            if let DataConError::Socket(SocketError::Io(io_err)) = &e {
                self.lock_state().net_error = Some(io_err.kind());
            }
        }
    }

    /// Endpoint a listen settled on, once known.
    pub fn listen_endpoint(&self) -> Option<(Ipv4Addr, u16)> {
        self.lock_state().listen_endpoint
    }

    /// Whether the data stream is up.
    pub fn is_connected(&self) -> bool {
        self.core.is_ready()
    }

    /// Whether every byte went out and the connection closed on EOF.
    pub fn all_data_transferred(&self) -> bool {
        self.lock_state().closed_on_eof
    }

    /// When the stream closed, if it has.
    pub fn closed_at(&self) -> Option<Instant> {
        self.lock_state().closed_at
    }

    /// First error recorded on the transfer; fetching clears it.
    pub fn take_error(&self) -> Option<DataConError> {
        let mut st = self.lock_state();
        if mem::take(&mut st.no_data_timeout_hit) {
            return Some(DataConError::NoDataTimeout);
        }
        if let Some(e) = st.socket_error.take() {
            return Some(DataConError::Socket(e));
        }
        st.net_error.take().map(DataConError::Net)
    }

    /// Progress snapshot. Throughput is reported in decompressed bytes
    /// even for MODE Z.
    pub fn status(&self) -> UploadStatus {
        let st = self.lock_state();
        let now = Instant::now();
        UploadStatus {
            phase: st.phase,
            uploaded: st.total_written,
            total: st.total_size.max(st.total_written),
            idle: st.last_activity.map_or(Duration::ZERO, |t| now.duration_since(t)),
            speed: st.meter.speed(now),
        }
    }

    /// Pauses or resumes the transfer. Resuming replays readiness that
    /// arrived while paused and restarts the meter windows.
    pub fn pause(&self, paused: bool) {
        let b = self.conn_binding();
        let mut guard = self.lock_state();
        let st = &mut *guard;
        if st.paused == paused {
            return;
        }
        st.paused = paused;
        if paused {
            if st.postponed != Postponed::None {
                warn!(uid = %self.core.uid(), "pausing with readiness already postponed");
            }
            return;
        }
        let now = Instant::now();
        st.last_activity = Some(now);
        st.meter.clear();
        st.meter.start(now);
        if self.cfg.compress {
            st.compr_meter.clear();
            st.compr_meter.start(now);
        }
        match mem::take(&mut st.postponed) {
            Postponed::Writable => self.repost_event(b.as_ref(), NetEvent::new(Readiness::Writable)),
            Postponed::Readable => self.repost_event(b.as_ref(), NetEvent::new(Readiness::Readable)),
            Postponed::Close(Some(kind)) => {
                self.repost_event(b.as_ref(), NetEvent::with_error(Readiness::Closed, kind));
            }
            Postponed::Close(None) => {
                self.repost_event(b.as_ref(), NetEvent::new(Readiness::Closed));
            }
            Postponed::None => {}
        }
    }

    /// Checks out the prepare buffer. `None` while the previous batch is
    /// still staged, checked out, or being deflated; a MODE Z batch with a
    /// compressed remainder is continued here instead of handing out a new
    /// buffer.
    pub fn give_buffer_for_data(&self) -> Option<PrepareBuffer> {
        let b = self.conn_binding();
        let mut guard = self.lock_state();
        let st = &mut *guard;
        if st.staged_valid > 0 {
            return None;
        }
        if self.cfg.compress {
            if st.compr_out {
                warn!(uid = %self.core.uid(), "prepare buffer is already checked out");
                return None;
            }
            if st.delayed_pending() {
                self.resume_delayed(st, b.as_ref());
                return None;
            }
            let mut buf = st.compr_src.take().unwrap_or_default();
            buf.clear();
            ensure_cap(&mut buf, self.cfg.flush_buffer_size);
            st.src_consumed = 0;
            st.compr_out = true;
            Some(PrepareBuffer { buf })
        } else {
            let Some(mut buf) = st.staged.take() else {
                warn!(uid = %self.core.uid(), "prepare buffer is already checked out");
                return None;
            };
            buf.clear();
            ensure_cap(&mut buf, self.cfg.flush_buffer_size);
            Some(PrepareBuffer { buf })
        }
    }

    /// Hands back a filled prepare buffer. `eof` marks the last batch; an
    /// empty batch with `eof` is the usual end-of-file signal. Stages the
    /// bytes (deflating under MODE Z), swaps staging into the write buffer
    /// when the socket side is drained, and kicks sending off again.
    pub fn data_prepared(&self, buffer: PrepareBuffer, eof: bool) {
        let b = self.conn_binding();
        let mut guard = self.lock_state();
        let st = &mut *guard;
        st.prepare_sent = false;
        let PrepareBuffer { buf } = buffer;
        if self.cfg.compress {
            if !st.compr_out {
                warn!(uid = %self.core.uid(), "prepared buffer matches no outstanding checkout");
                if st.delayed_pending() {
                    warn!(uid = %self.core.uid(), "losing staged upload bytes");
                }
            }
            st.compr_src = Some(buf);
            st.compr_out = false;
            st.src_consumed = 0;
            if eof {
                st.finishing = true;
            }
            self.deflate_step(st, b.as_ref());
        } else {
            if st.staged.is_some() {
                warn!(uid = %self.core.uid(), "prepared buffer matches no outstanding checkout");
            }
            st.staged_valid = buf.len();
            st.decompr_in_staged = st.staged_valid;
            st.staged = Some(buf);
            if eof {
                st.eof_reached = true;
            }
        }
        self.after_prepare(st, b.as_ref());
    }

    /// Force-closes the transfer and discards buffered data.
    pub fn cancel(&self) {
        let b = self.conn_binding();
        let mut guard = self.lock_state();
        let st = &mut *guard;
        debug!(uid = %self.core.uid(), "canceling upload data connection");
        self.core.close();
        if let Some(b) = &b {
            b.reactor.delete_timer(self.core.uid(), TIMER_NO_DATA);
        }
        st.postponed = Postponed::None;
        free_buffered(st);
    }

    /// Folds warmup-window bytes into the meters once the upload went
    /// through. Small files fit almost entirely into local socket buffers;
    /// without this their reported speed is absurdly low.
    pub fn upload_finished(&self) {
        let mut st = self.lock_state();
        if st.closed_on_eof && st.skipped > 0 {
            let now = Instant::now();
            let skipped = mem::take(&mut st.skipped);
            st.meter.record(skipped, now);
            if let Some(g) = &st.global_meter {
                speed::record_into(g, skipped, now);
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, UpState> {
        self.st.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn conn_binding(&self) -> Option<ConnBinding> {
        self.binding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn repost_event(&self, b: Option<&ConnBinding>, ev: NetEvent) {
        if let Some(b) = b {
            if !b.reactor.repost(b.slot, self.core.uid(), ev) {
                trace!(uid = %self.core.uid(), "event repost dropped");
            }
        }
    }

    fn just_connected(&self, b: Option<&ConnBinding>, st: &mut UpState) {
        if st.received_connected {
            return;
        }
        st.received_connected = true;
        st.phase = TransferPhase::Transferring;
        st.first_write = true;
        st.skipped = 0;
        let now = Instant::now();
        st.last_activity = Some(now);
        st.meter.start(now);
        if self.cfg.compress {
            st.compr_meter.start(now);
        }
        debug!(uid = %self.core.uid(), "data connection established");
        post_to_owner(b, st.owner, MSG_DATA_CONNECTED, self.core.uid());
        if self.cfg.no_data_timeout.is_some() {
            if let Some(b) = b {
                b.reactor
                    .add_timer(b.slot, self.core.uid(), now + NO_DATA_PERIOD, TIMER_NO_DATA, 0);
            }
        }
    }

    /// Swaps the published staging buffer into the write buffer; the old
    /// write allocation becomes the next staging buffer.
    fn move_staged_to_write(&self, st: &mut UpState) {
        let staged = st.staged.take().unwrap_or_default();
        let mut old = mem::replace(&mut st.to_write, staged);
        st.write_off = 0;
        st.decompr_in_to_write = st.decompr_in_staged;
        old.clear();
        st.staged = Some(old);
        st.staged_valid = 0;
        st.decompr_in_staged = 0;
    }

    /// Deflates the pending part of the source batch into staging.
    /// Publishes staging when it fills or the stream finishes; asks for
    /// more input while there is room and no EOF.
    fn deflate_step(&self, st: &mut UpState, b: Option<&ConnBinding>) {
        let Some(src) = st.compr_src.as_ref() else {
            warn!(uid = %self.core.uid(), "no source batch to compress");
            return;
        };
        let staged = st.staged.get_or_insert_with(Vec::new);
        ensure_cap(staged, self.cfg.flush_buffer_size);
        let input = &src[st.src_consumed..];
        let flush = if st.finishing {
            FlushCompress::Finish
        } else {
            FlushCompress::None
        };
        let deflater = st
            .deflater
            .get_or_insert_with(|| Compress::new(Compression::new(6), true));
        let before_in = deflater.total_in();
        let res = deflater.compress_vec(input, staged, flush);
        let consumed = (deflater.total_in() - before_in) as usize;
        st.src_consumed += consumed;
        st.decompr_in_staged += consumed;
        let status = match res {
            Ok(Status::BufError) | Err(_) => {
                warn!(uid = %self.core.uid(), "deflate failed on upload data");
                return;
            }
            Ok(s) => s,
        };
        if status == Status::StreamEnd {
            st.eof_reached = true;
        }
        let staged_len = st.staged.as_ref().map_or(0, Vec::len);
        if st.delayed_pending() {
            // Staging filled up mid-batch; the remainder continues once
            // the batch is sent.
            st.staged_valid = staged_len;
        } else if !st.eof_reached && staged_len < self.cfg.flush_buffer_size {
            st.prepare_sent = true;
            post_to_owner(b, st.owner, MSG_PREPARE_DATA, self.core.uid());
        } else {
            st.staged_valid = staged_len;
        }
    }

    /// Continues a deflate batch that was cut short by full staging.
    fn resume_delayed(&self, st: &mut UpState, b: Option<&ConnBinding>) {
        st.prepare_sent = false;
        self.deflate_step(st, b);
        self.after_prepare(st, b);
    }

    /// Common tail of every prepare round: move a complete batch to the
    /// write side and make sure a write event is on its way.
    fn after_prepare(&self, st: &mut UpState, b: Option<&ConnBinding>) {
        if st.staged_valid > 0 && !st.write_pending() {
            self.move_staged_to_write(st);
            if !st.eof_reached {
                st.prepare_sent = true;
                post_to_owner(b, st.owner, MSG_PREPARE_DATA, self.core.uid());
            }
        }
        if !st.waiting_for_write && (st.write_pending() || st.eof_reached) {
            self.repost_event(b, NetEvent::new(Readiness::Writable));
            st.waiting_for_write = true;
        }
    }

    fn error_close(&self, b: Option<&ConnBinding>, st: &mut UpState, err: SocketError) {
        warn!(uid = %self.core.uid(), error = %err, "data connection write failed");
        match err {
            SocketError::Io(e) => st.net_error = Some(e.kind()),
            other => st.socket_error = Some(other),
        }
        self.core.close();
        st.closed_at = Some(Instant::now());
        if let Some(b) = b {
            b.reactor.delete_timer(self.core.uid(), TIMER_NO_DATA);
        }
        free_buffered(st);
        post_to_owner(b, st.owner, MSG_DATA_CLOSED, self.core.uid());
    }

    /// One send round. Sends in sizer-tuned chunks until the socket queues
    /// a tail or everything staged has gone out; closes the connection
    /// once EOF is fully sent.
    fn on_writable(&self) {
        let b = self.conn_binding();
        let mut guard = self.lock_state();
        let st = &mut *guard;
        if st.paused {
            st.postponed.note(Postponed::Writable);
            return;
        }
        st.waiting_for_write = false;
        if st.passive.is_some() && !st.received_connected {
            self.just_connected(b.as_ref(), st);
        }
        if st.first_write {
            st.first_write = false;
            let now = Instant::now();
            st.first_write_time = Some(now);
            st.sizer.begin(now);
        }
        while st.write_pending() {
            let remaining = st.to_write.len() - st.write_off;
            let chunk = st.sizer.chunk().min(remaining);
            let queued_all = match self.core.write(&st.to_write[st.write_off..st.write_off + chunk])
            {
                Ok(drained) => drained,
                Err(e) => {
                    self.error_close(b.as_ref(), st, e);
                    return;
                }
            };
            let now = Instant::now();
            // Attribute decompressed bytes to this chunk proportionally,
            // before the offset moves.
            let decompr_sent = if self.cfg.compress {
                ((chunk as u64 * st.decompr_in_to_write as u64) / remaining as u64) as usize
            } else {
                chunk
            };
            st.decompr_in_to_write -= decompr_sent;
            st.write_off += chunk;
            st.total_written += decompr_sent as u64;
            st.last_activity = Some(now);
            let warm = st
                .first_write_time
                .is_some_and(|t| now.duration_since(t) <= self.cfg.packet.warmup);
            if warm {
                // Local socket buffers swallow the first writes instantly;
                // metering them would inflate the speed.
                st.skipped += decompr_sent as u64;
            } else {
                st.meter.record(decompr_sent as u64, now);
                if self.cfg.compress {
                    st.compr_meter.record(chunk as u64, now);
                }
                st.sizer.note_sent(chunk as u64, now);
                if st.sizer.probe_due(now) {
                    let speed = if self.cfg.compress {
                        st.compr_meter.speed(now)
                    } else {
                        st.meter.speed(now)
                    };
                    st.sizer.recalibrate(speed, now);
                }
                if let Some(g) = &st.global_meter {
                    speed::record_into(g, decompr_sent as u64, now);
                }
            }
            if !queued_all {
                // The tail went into the send queue; resume on the
                // drained notification.
                st.waiting_for_write = true;
                break;
            }
            if !st.write_pending() {
                if st.staged_valid > 0 {
                    self.move_staged_to_write(st);
                } else {
                    break;
                }
            }
        }
        if !st.write_pending() && st.staged_valid == 0 && st.eof_reached && !st.closed_on_eof {
            if let Some(b) = &b {
                b.reactor.delete_timer(self.core.uid(), TIMER_NO_DATA);
            }
            st.closed_on_eof = true;
            st.phase = TransferPhase::Finished;
            debug!(uid = %self.core.uid(), total = st.total_written, "upload sent completely, closing");
            self.core.close();
            st.closed_at = Some(Instant::now());
            post_to_owner(b.as_ref(), st.owner, MSG_DATA_CLOSED, self.core.uid());
            post_to_owner(b.as_ref(), st.owner, MSG_TRANSFER_FINISHED, self.core.uid());
        }
        if self.core.is_ready() && st.staged_valid == 0 && !st.prepare_sent && !st.eof_reached {
            st.prepare_sent = true;
            post_to_owner(b.as_ref(), st.owner, MSG_PREPARE_DATA, self.core.uid());
        }
    }

    fn on_watchdog(&self) {
        let b = self.conn_binding();
        let mut guard = self.lock_state();
        let st = &mut *guard;
        if !self.core.is_open() {
            return;
        }
        let Some(timeout) = self.cfg.no_data_timeout else {
            return;
        };
        let now = Instant::now();
        let idle = st.last_activity.map_or(Duration::ZERO, |t| now.duration_since(t));
        if !st.paused && idle >= timeout {
            st.no_data_timeout_hit = true;
            warn!(
                uid = %self.core.uid(),
                idle_secs = idle.as_secs(),
                "no data transferred, closing the data connection"
            );
            st.net_error = Some(io::ErrorKind::ConnectionReset);
            self.core.close();
            st.closed_at = Some(now);
            post_to_owner(b.as_ref(), st.owner, MSG_DATA_CLOSED, self.core.uid());
        } else if let Some(b) = &b {
            b.reactor
                .add_timer(b.slot, self.core.uid(), now + NO_DATA_PERIOD, TIMER_NO_DATA, 0);
        }
    }

    fn on_connect_failed(&self, e: SocketError) {
        let b = self.conn_binding();
        let mut guard = self.lock_state();
        let st = &mut *guard;
        warn!(uid = %self.core.uid(), error = %e, "data connection failed to open");
        st.socket_error = Some(e);
        self.core.close();
        st.closed_at = Some(Instant::now());
        free_buffered(st);
        post_to_owner(b.as_ref(), st.owner, MSG_DATA_CLOSED, self.core.uid());
    }

    fn on_listen_outcome(&self, ep: Result<(Ipv4Addr, u16), SocketError>) {
        let b = self.conn_binding();
        let mut guard = self.lock_state();
        let st = &mut *guard;
        match ep {
            Ok((ip, port)) => {
                debug!(uid = %self.core.uid(), %ip, port, "listen endpoint ready");
                st.listen_endpoint = Some((ip, port));
            }
            Err(e) => {
                warn!(uid = %self.core.uid(), error = %e, "proxy listen failed");
                st.socket_error = Some(e);
            }
        }
        post_to_owner(b.as_ref(), st.owner, MSG_LISTEN_READY, self.core.uid());
    }

    fn on_accepted(&self, res: Result<(), SocketError>) {
        let b = self.conn_binding();
        let mut guard = self.lock_state();
        let st = &mut *guard;
        match res {
            Ok(()) => {
                st.socket_error = None;
                st.net_error = None;
                self.just_connected(b.as_ref(), st);
            }
            Err(e) => {
                warn!(uid = %self.core.uid(), error = %e, "inbound data connection failed");
                st.socket_error = Some(e);
            }
        }
    }

    fn on_closed(&self, error: Option<io::ErrorKind>) {
        let b = self.conn_binding();
        let mut guard = self.lock_state();
        let st = &mut *guard;
        if st.passive.is_some() && !st.received_connected {
            self.just_connected(b.as_ref(), st);
        }
        if st.paused {
            st.postponed.note(Postponed::Close(error));
            return;
        }
        self.core.close();
        st.closed_at = Some(Instant::now());
        if let Some(kind) = error {
            st.net_error = Some(kind);
        }
        if let Some(b) = &b {
            b.reactor.delete_timer(self.core.uid(), TIMER_NO_DATA);
        }
        post_to_owner(b.as_ref(), st.owner, MSG_DATA_CLOSED, self.core.uid());
    }

    fn dispatch(&self, ev: OwnerEvent) {
        match ev {
            OwnerEvent::Connected => {
                let b = self.conn_binding();
                let mut guard = self.lock_state();
                self.just_connected(b.as_ref(), &mut guard);
            }
            OwnerEvent::ConnectFailed(e) => self.on_connect_failed(e),
            OwnerEvent::ListenReady { ip, port } => self.on_listen_outcome(Ok((ip, port))),
            OwnerEvent::ListenFailed(e) => self.on_listen_outcome(Err(e)),
            OwnerEvent::Accepted(res) => self.on_accepted(res),
            OwnerEvent::Writable | OwnerEvent::WriteDrained => self.on_writable(),
            OwnerEvent::Closed { error } => self.on_closed(error),
            OwnerEvent::Readable => {}
        }
    }
}

impl ReactorSocket for UploadConnection {
    fn uid(&self) -> SocketUid {
        self.core.uid()
    }

    fn on_ready(&self, _rt: &Reactor, event: NetEvent) {
        let (owner, actions) = self.core.handle_event(event);
        run_actions(&self.core, actions);
        if let Some(ev) = owner {
            self.dispatch(ev);
        }
    }

    fn on_timer(&self, _rt: &Reactor, kind: TimerKind, _payload: u64) {
        if kind == TIMER_NO_DATA {
            self.on_watchdog();
        }
    }

    fn on_message(&self, _rt: &Reactor, kind: MsgKind, payload: u64) {
        if let Some((owner, actions)) = self.core.handle_message(kind, payload) {
            run_actions(&self.core, actions);
            if let Some(ev) = owner {
                self.dispatch(ev);
            }
        }
    }
}

fn ensure_cap(buf: &mut Vec<u8>, size: usize) {
    if buf.capacity() < size {
        buf.reserve_exact(size - buf.len());
    }
}

/// Discards everything buffered for sending; used by the error paths.
fn free_buffered(st: &mut UpState) {
    st.to_write.clear();
    st.write_off = 0;
    st.staged_valid = 0;
    if let Some(s) = &mut st.staged {
        s.clear();
    }
    if let Some(s) = &mut st.compr_src {
        s.clear();
    }
    st.src_consumed = 0;
    st.decompr_in_to_write = 0;
    st.decompr_in_staged = 0;
    st.eof_reached = false;
    st.finishing = false;
}

/// Clears per-attempt state before a dial.
fn reset_attempt(st: &mut UpState, compress: bool) {
    st.received_connected = false;
    st.net_error = None;
    st.socket_error = None;
    st.no_data_timeout_hit = false;
    st.postponed = Postponed::None;
    st.closed_at = None;
    st.to_write.clear();
    st.write_off = 0;
    st.total_written = 0;
    st.staged_valid = 0;
    st.decompr_in_to_write = 0;
    st.decompr_in_staged = 0;
    st.src_consumed = 0;
    if let Some(s) = &mut st.staged {
        s.clear();
    }
    st.eof_reached = false;
    st.finishing = false;
    st.closed_on_eof = false;
    st.prepare_sent = false;
    st.waiting_for_write = true;
    st.first_write = false;
    st.skipped = 0;
    if compress {
        st.deflater = Some(Compress::new(Compression::new(6), true));
    }
}
