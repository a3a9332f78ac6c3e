//! Download side of a data connection.
//!
//! Socket bytes land in a read buffer. Disk-bound transfers hand them over
//! in flush buffers: the read buffer and the flush buffer swap when the
//! read side fills or the flush timer fires, so the socket keeps draining
//! while the disk side writes. Listing-sized transfers skip the swap
//! machinery and collect everything in memory. MODE Z interposes a
//! streaming inflater between the two buffers.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use flate2::{Decompress, FlushDecompress, Status};
use netio::{Fill, OwnerEvent, ProxySetup, SocketCore, SocketError, run_actions};
use reactor::{MsgKind, NetEvent, Readiness, Reactor, ReactorSocket, SlotId, SocketUid, TimerKind};
use tracing::{debug, info, trace, warn};

use crate::conn::{
    ConnBinding, DownloadStatus, MSG_DATA_CLOSED, MSG_DATA_CONNECTED, MSG_FLUSH_DATA,
    MSG_LISTEN_READY, MSG_TRANSFER_FINISHED, NO_DATA_PERIOD, OwnerTarget, Postponed, TIMER_FLUSH,
    TIMER_NO_DATA, TransferPhase, post_to_owner,
};
use crate::error::DataConError;
use crate::speed::{self, SharedMeter, TransferSpeedMeter};

/// Behavior knobs for a download data connection.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DownloadConfig {
    /// Bytes asked from the socket per read.
    pub read_chunk_size: usize,
    /// Flush buffer size; the read buffer's high-water mark in disk mode
    /// and the growth step of a memory collect.
    pub flush_buffer_size: usize,
    /// How long received bytes may sit before they are flushed anyway.
    pub flush_period: Duration,
    /// Closes the stream as lost when no byte moves for this long.
    pub no_data_timeout: Option<Duration>,
    /// The peer sends a MODE Z deflate stream.
    pub compress: bool,
    /// Hand data out in flush buffers instead of collecting in memory.
    pub flush_to_disk: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: 8 * 1024,
            flush_buffer_size: 64 * 1024,
            flush_period: Duration::from_millis(1000),
            no_data_timeout: Some(Duration::from_secs(180)),
            compress: false,
            flush_to_disk: false,
        }
    }
}

/// A batch of received bytes checked out to the disk side. Exactly one can
/// be outstanding; hand it back with [`DownloadConnection::flush_done`].
///
/// `bytes()` can be empty even mid-transfer: MODE Z defers undersized
/// decompressed output, and the empty checkout still has to make the round
/// trip so the pipeline keeps moving.
#[derive(Debug)]
pub struct FlushBuffer {
    pub(crate) buf: Vec<u8>,
    pub(crate) valid: usize,
}

impl FlushBuffer {
    /// The bytes to write.
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.valid]
    }

    /// Number of bytes to write.
    pub fn len(&self) -> usize {
        self.valid
    }

    /// Whether there is nothing to write this round.
    pub fn is_empty(&self) -> bool {
        self.valid == 0
    }
}

/// Why further socket reads are deferred while a checkout is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum NeedFlush {
    #[default]
    None,
    /// Flush timer fired with the flush side busy.
    Timer,
    /// A read stalled on a full buffer; replay it once drained.
    Read,
    /// A close arrived with the flush side busy; replay it once drained.
    Close(Option<io::ErrorKind>),
}

impl NeedFlush {
    fn note_timer(&mut self) {
        if matches!(self, NeedFlush::None) {
            *self = NeedFlush::Timer;
        }
    }

    fn note_read(&mut self) {
        if matches!(self, NeedFlush::None | NeedFlush::Timer) {
            *self = NeedFlush::Read;
        }
    }

    fn note_close(&mut self, error: Option<io::ErrorKind>) {
        *self = NeedFlush::Close(error);
    }
}

#[derive(Default)]
struct DownState {
    phase: TransferPhase,
    owner: Option<OwnerTarget>,
    /// Passive-mode endpoint, kept for the `activate` retry.
    passive: Option<SocketAddrV4>,
    proxy: Option<ProxySetup>,
    received_connected: bool,
    paused: bool,
    postponed: Postponed,
    /// Bytes pulled off the socket; the memory collect in collect mode.
    read_buf: Vec<u8>,
    /// Spare flush buffer; `None` while checked out or never allocated.
    flush_buf: Option<Vec<u8>>,
    /// Published byte count of the flush buffer; stays set while a plain
    /// checkout is outstanding.
    flush_valid: usize,
    /// Bytes of the flush buffer already run through the inflater.
    inflated_to: usize,
    need_flush: NeedFlush,
    flush_timer_armed: bool,
    inflater: Option<Decompress>,
    /// Decompressed output buffer; `None` while checked out.
    decompr_buf: Option<Vec<u8>>,
    decompr_out: bool,
    /// Decompressed bytes withheld from the last checkout.
    delayed: usize,
    decompress_error: bool,
    no_data_timeout_hit: bool,
    net_error: Option<io::ErrorKind>,
    socket_error: Option<SocketError>,
    total_read: u64,
    total_size: u64,
    last_activity: Option<Instant>,
    closed_at: Option<Instant>,
    meter: TransferSpeedMeter,
    global_meter: Option<SharedMeter>,
    finished: bool,
    listen_endpoint: Option<(Ipv4Addr, u16)>,
}

enum PumpKind {
    Read,
    Close(Option<io::ErrorKind>),
}

/// Receiving half of an FTP data connection.
///
/// Register with a reactor, [`bind`](Self::bind), then dial (passive) or
/// listen (active). Progress flows to the owner as messages; data flows
/// out through [`give_flush_data`](Self::give_flush_data)/
/// [`flush_done`](Self::flush_done) in disk mode or
/// [`take_collected`](Self::take_collected) in memory mode.
pub struct DownloadConnection {
    core: Arc<SocketCore>,
    binding: Mutex<Option<ConnBinding>>,
    cfg: DownloadConfig,
    st: Mutex<DownState>,
}

impl DownloadConnection {
    /// Creates a detached download connection.
    pub fn new(cfg: DownloadConfig) -> Arc<Self> {
        Arc::new(Self {
            core: SocketCore::new(),
            binding: Mutex::new(None),
            cfg,
            st: Mutex::new(DownState::default()),
        })
    }

    /// Identity this connection registers under.
    pub fn uid(&self) -> SocketUid {
        self.core.uid()
    }

    /// Wires the connection to its reactor slot. Call right after
    /// registering; dialing, timers, and owner posts all need it.
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

    /// Dials the passive-mode endpoint. The endpoint is remembered so
    /// [`activate`](Self::activate) can retry a refused dial.
    pub fn connect(&self, addr: SocketAddrV4) -> Result<(), DataConError> {
        {
            let mut st = self.lock_state();
            reset_attempt(&mut st);
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
            reset_attempt(&mut st);
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
            reset_attempt(&mut st);
            st.listen_endpoint = None;
            st.phase = TransferPhase::Connecting;
        }
        let got = self.core.listen(addr)?;
        self.lock_state().listen_endpoint = Some(got);
        Ok(got)
    }

    /// Asks a SOCKS proxy to listen on our behalf. The endpoint arrives
    /// later via [`MSG_LISTEN_READY`] and [`listen_endpoint`](Self::listen_endpoint).
    pub fn listen_via_proxy(
        &self,
        setup: ProxySetup,
        target: SocketAddrV4,
    ) -> Result<(), DataConError> {
        {
            let mut st = self.lock_state();
            reset_attempt(&mut st);
            st.listen_endpoint = None;
            st.proxy = Some(setup.clone());
            st.phase = TransferPhase::Connecting;
        }
        self.core.listen_via_proxy(setup, target)?;
        Ok(())
    }

    /// Marks the transfer command as sent. A passive dial that already
    /// failed is dialed once more; some servers refuse the data connection
    /// until the command arrives.
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

    /// Whether the stream closed and every byte was handed over.
    pub fn transfer_finished(&self) -> bool {
        self.lock_state().finished
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
        if mem::take(&mut st.decompress_error) {
            return Some(DataConError::Decompress);
        }
        if let Some(e) = st.socket_error.take() {
            return Some(DataConError::Socket(e));
        }
        st.net_error.take().map(DataConError::Net)
    }

    /// Progress snapshot.
    pub fn status(&self) -> DownloadStatus {
        let st = self.lock_state();
        let now = Instant::now();
        DownloadStatus {
            phase: st.phase,
            downloaded: st.total_read,
            total: st.total_size.max(st.total_read),
            idle: st.last_activity.map_or(Duration::ZERO, |t| now.duration_since(t)),
            speed: st.meter.speed(now),
        }
    }

    /// Pauses or resumes the transfer. Resuming replays readiness that
    /// arrived while paused and restarts the meter window.
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
        match mem::take(&mut st.postponed) {
            Postponed::Readable => self.repost_event(b.as_ref(), NetEvent::new(Readiness::Readable)),
            Postponed::Writable => self.repost_event(b.as_ref(), NetEvent::new(Readiness::Writable)),
            Postponed::Close(Some(kind)) => {
                self.repost_event(b.as_ref(), NetEvent::with_error(Readiness::Closed, kind));
            }
            Postponed::Close(None) => {
                self.repost_event(b.as_ref(), NetEvent::new(Readiness::Closed));
            }
            Postponed::None => {}
        }
    }

    /// Checks out the flush buffer for the disk side. At most one checkout
    /// can be outstanding; `None` while nothing is staged.
    ///
    /// A corrupt MODE Z stream closes the connection here; the error shows
    /// up through [`take_error`](Self::take_error) and poisons the target.
    pub fn give_flush_data(&self) -> Option<FlushBuffer> {
        let b = self.conn_binding();
        let mut guard = self.lock_state();
        let st = &mut *guard;
        let fetchable =
            st.flush_valid > 0 && (!self.cfg.compress || st.inflated_to < st.flush_valid);
        let slot_busy = if self.cfg.compress {
            st.decompr_out
        } else {
            st.flush_buf.is_none()
        };
        if !fetchable || slot_busy {
            if fetchable {
                warn!(uid = %self.core.uid(), "flush buffer is already checked out");
            }
            return None;
        }
        if !self.cfg.compress {
            let buf = st.flush_buf.take()?;
            return Some(FlushBuffer {
                buf,
                valid: st.flush_valid,
            });
        }
        let mut out = st
            .decompr_buf
            .take()
            .unwrap_or_else(|| Vec::with_capacity(self.cfg.flush_buffer_size));
        let inflater = st.inflater.get_or_insert_with(|| Decompress::new(true));
        let src = st.flush_buf.as_ref()?;
        let input = &src[st.inflated_to..st.flush_valid];
        let before_in = inflater.total_in();
        let before_out = inflater.total_out();
        let res = inflater.decompress_vec(input, &mut out, FlushDecompress::None);
        let consumed = (inflater.total_in() - before_in) as usize;
        let produced = (inflater.total_out() - before_out) as usize;
        let status = match res {
            Ok(Status::BufError) | Err(_) => {
                warn!(uid = %self.core.uid(), "MODE Z stream is corrupted, closing the transfer");
                st.decompress_error = true;
                self.core.close();
                self.disarm_timers(b.as_ref(), st);
                self.free_flush_locked(b.as_ref(), st);
                return None;
            }
            Ok(s) => s,
        };
        let out_len = out.len();
        let is_first = st.inflated_to == 0;
        st.inflated_to += consumed;
        if status == Status::StreamEnd && st.inflated_to < st.flush_valid {
            trace!(
                uid = %self.core.uid(),
                extra = st.flush_valid - st.inflated_to,
                "ignoring bytes received after the end of the compressed stream"
            );
            st.inflated_to = st.flush_valid;
        }
        // The transferred total tracks decompressed bytes; square up the
        // difference this inflate round introduced.
        if produced != consumed {
            let now = Instant::now();
            if produced > consumed {
                let delta = (produced - consumed) as u64;
                st.total_read += delta;
                st.meter.record(delta, now);
                if let Some(g) = &st.global_meter {
                    speed::record_into(g, delta, now);
                }
            } else {
                let delta = (consumed - produced) as u64;
                if st.total_read < delta {
                    warn!(uid = %self.core.uid(), "transferred byte total would go negative");
                }
                st.total_read = st.total_read.saturating_sub(delta);
            }
        }
        // Withhold undersized output so disk writes stay buffer-sized,
        // except for the first round of a flush buffer or at stream end.
        let valid = if status != Status::StreamEnd && !is_first && out_len < self.cfg.flush_buffer_size
        {
            st.delayed = out_len;
            0
        } else {
            st.delayed = 0;
            out_len
        };
        st.decompr_out = true;
        Some(FlushBuffer { buf: out, valid })
    }

    /// Returns a checked-out buffer and keeps the pipeline moving: swaps
    /// in the next batch, continues a half-inflated one, and replays any
    /// readiness deferred while the flush side was busy.
    pub fn flush_done(&self, buffer: FlushBuffer) {
        let b = self.conn_binding();
        let mut guard = self.lock_state();
        let st = &mut *guard;
        let FlushBuffer { mut buf, .. } = buffer;
        if self.cfg.compress {
            if st.decompr_out {
                buf.truncate(st.delayed);
                st.decompr_buf = Some(buf);
                st.decompr_out = false;
            } else {
                warn!(uid = %self.core.uid(), "returned buffer matches no outstanding checkout");
                if st.delayed > 0 {
                    warn!(uid = %self.core.uid(), "losing deferred decompressed bytes");
                }
            }
        } else if st.flush_buf.is_none() && st.flush_valid > 0 {
            buf.clear();
            st.flush_buf = Some(buf);
        } else {
            warn!(uid = %self.core.uid(), "returned buffer matches no outstanding checkout");
        }
        if self.cfg.compress && st.inflated_to < st.flush_valid {
            post_to_owner(b.as_ref(), st.owner, MSG_FLUSH_DATA, self.core.uid());
            return;
        }
        if (st.need_flush != NeedFlush::None || st.read_buf.len() >= self.cfg.flush_buffer_size)
            && !st.read_buf.is_empty()
        {
            self.swap_and_post(b.as_ref(), st);
        } else {
            st.flush_valid = 0;
            st.inflated_to = 0;
        }
        match mem::take(&mut st.need_flush) {
            NeedFlush::Read => self.repost_event(b.as_ref(), NetEvent::new(Readiness::Readable)),
            NeedFlush::Close(Some(kind)) => {
                self.repost_event(b.as_ref(), NetEvent::with_error(Readiness::Closed, kind));
            }
            NeedFlush::Close(None) => {
                self.repost_event(b.as_ref(), NetEvent::new(Readiness::Closed));
            }
            NeedFlush::None | NeedFlush::Timer => {}
        }
        // A close with unflushed data defers the finished signal; the
        // cycle that empties the buffers fires it.
        if !self.core.is_ready() && st.read_buf.is_empty() && st.flush_valid == 0 {
            self.set_finished(b.as_ref(), st);
        }
    }

    /// Whether both buffers are drained. With `only_test` false, a ready
    /// read buffer is swapped out and announced as a side effect.
    pub fn all_data_flushed(&self, only_test: bool) -> bool {
        let b = self.conn_binding();
        let mut guard = self.lock_state();
        let st = &mut *guard;
        if !self.cfg.flush_to_disk {
            warn!(uid = %self.core.uid(), "all_data_flushed applies to disk-bound downloads only");
            return false;
        }
        if st.read_buf.is_empty() && st.flush_valid == 0 {
            return true;
        }
        if !only_test && st.flush_valid == 0 {
            self.swap_and_post(b.as_ref(), st);
        }
        false
    }

    /// Discards all buffered data instead of flushing it.
    pub fn free_flush_data(&self) {
        let b = self.conn_binding();
        let mut guard = self.lock_state();
        self.free_flush_locked(b.as_ref(), &mut guard);
    }

    /// Force-closes the transfer and discards buffered data. A buffer
    /// checked out to the disk side stays owned by it; a late
    /// [`flush_done`](Self::flush_done) is accepted and dropped quietly.
    pub fn cancel(&self) {
        let b = self.conn_binding();
        let mut guard = self.lock_state();
        let st = &mut *guard;
        debug!(uid = %self.core.uid(), "canceling download data connection");
        self.core.close();
        self.disarm_timers(b.as_ref(), st);
        st.postponed = Postponed::None;
        self.free_flush_locked(b.as_ref(), st);
    }

    /// Hands out everything a memory-backed download collected,
    /// decompressing MODE Z in one pass. The collect is consumed either
    /// way; a truncated stream keeps what did inflate.
    pub fn take_collected(&self) -> Result<Vec<u8>, DataConError> {
        let mut guard = self.lock_state();
        let st = &mut *guard;
        if self.cfg.flush_to_disk {
            warn!(uid = %self.core.uid(), "take_collected applies to memory-backed downloads only");
            return Ok(Vec::new());
        }
        let raw = mem::take(&mut st.read_buf);
        if !self.cfg.compress {
            let mut data = raw;
            data.shrink_to_fit();
            return Ok(data);
        }
        let mut inflater = Decompress::new(true);
        let mut data = Vec::with_capacity(2 * self.cfg.flush_buffer_size);
        let mut offset = 0usize;
        loop {
            let before_in = inflater.total_in();
            let res = inflater.decompress_vec(&raw[offset..], &mut data, FlushDecompress::None);
            offset += (inflater.total_in() - before_in) as usize;
            match res {
                Ok(Status::StreamEnd) => break,
                Ok(Status::Ok) => {
                    if offset >= raw.len() {
                        // Terminator missing; tolerate and keep the output.
                        break;
                    }
                    if data.len() == data.capacity() {
                        data.reserve(self.cfg.flush_buffer_size);
                    }
                }
                Ok(Status::BufError) => {
                    if offset >= raw.len() {
                        // Truncated stream; keep what inflated.
                        break;
                    }
                    if data.len() == data.capacity() {
                        data.reserve(self.cfg.flush_buffer_size);
                        continue;
                    }
                    st.decompress_error = true;
                    warn!(uid = %self.core.uid(), "MODE Z stream is corrupted");
                    return Err(DataConError::Decompress);
                }
                Err(_) => {
                    st.decompress_error = true;
                    warn!(uid = %self.core.uid(), "MODE Z stream is corrupted");
                    return Err(DataConError::Decompress);
                }
            }
        }
        data.shrink_to_fit();
        Ok(data)
    }

    fn lock_state(&self) -> MutexGuard<'_, DownState> {
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

    fn disarm_timers(&self, b: Option<&ConnBinding>, st: &mut DownState) {
        if let Some(b) = b {
            b.reactor.delete_timer(self.core.uid(), TIMER_NO_DATA);
            if st.flush_timer_armed {
                b.reactor.delete_timer(self.core.uid(), TIMER_FLUSH);
            }
        }
        st.flush_timer_armed = false;
    }

    fn set_finished(&self, b: Option<&ConnBinding>, st: &mut DownState) {
        if !st.finished {
            st.finished = true;
            st.phase = TransferPhase::Finished;
            post_to_owner(b, st.owner, MSG_TRANSFER_FINISHED, self.core.uid());
        }
    }

    /// Swaps the filled read buffer into the flush slot and announces it.
    fn swap_and_post(&self, b: Option<&ConnBinding>, st: &mut DownState) {
        if st.flush_timer_armed {
            if let Some(b) = b {
                b.reactor.delete_timer(self.core.uid(), TIMER_FLUSH);
            }
            st.flush_timer_armed = false;
        }
        let filled = mem::take(&mut st.read_buf);
        st.flush_valid = filled.len();
        st.inflated_to = 0;
        let mut spare = st.flush_buf.take().unwrap_or_default();
        spare.clear();
        st.read_buf = spare;
        st.flush_buf = Some(filled);
        post_to_owner(b, st.owner, MSG_FLUSH_DATA, self.core.uid());
    }

    fn free_flush_locked(&self, b: Option<&ConnBinding>, st: &mut DownState) {
        st.read_buf.clear();
        st.flush_valid = 0;
        st.inflated_to = 0;
        st.need_flush = NeedFlush::None;
        st.delayed = 0;
        if let Some(buf) = &mut st.decompr_buf {
            buf.clear();
        }
        if !self.core.is_ready() {
            self.set_finished(b, st);
        }
    }

    /// Bookkeeping once the stream is gone: record the error, stop the
    /// timers, tell the owner, and mark the transfer finished if nothing
    /// is left to flush.
    fn finalize_close(&self, b: Option<&ConnBinding>, st: &mut DownState, error: Option<io::ErrorKind>) {
        self.core.close();
        if let Some(kind) = error {
            st.net_error = Some(kind);
        }
        st.closed_at = Some(Instant::now());
        self.disarm_timers(b, st);
        post_to_owner(b, st.owner, MSG_DATA_CLOSED, self.core.uid());
        if !self.cfg.flush_to_disk || (st.read_buf.is_empty() && st.flush_valid == 0) {
            self.set_finished(b, st);
        }
    }

    fn just_connected(&self, b: Option<&ConnBinding>, st: &mut DownState) {
        if st.received_connected {
            return;
        }
        st.received_connected = true;
        st.phase = TransferPhase::Transferring;
        let now = Instant::now();
        st.last_activity = Some(now);
        st.meter.start(now);
        debug!(uid = %self.core.uid(), "data connection established");
        post_to_owner(b, st.owner, MSG_DATA_CONNECTED, self.core.uid());
        if self.cfg.no_data_timeout.is_some() {
            if let Some(b) = b {
                b.reactor
                    .add_timer(b.slot, self.core.uid(), now + NO_DATA_PERIOD, TIMER_NO_DATA, 0);
            }
        }
    }

    /// One read round: pull bytes into the read buffer, then either swap a
    /// full buffer out, defer on a busy flush side, or finalize a drained
    /// close.
    fn pump(&self, kind: PumpKind) {
        let b = self.conn_binding();
        let mut guard = self.lock_state();
        let st = &mut *guard;
        if st.paused {
            st.postponed.note(match kind {
                PumpKind::Read => Postponed::Readable,
                PumpKind::Close(e) => Postponed::Close(e),
            });
            return;
        }
        let free = if self.cfg.flush_to_disk {
            let free = self.cfg.flush_buffer_size.saturating_sub(st.read_buf.len());
            if free == 0 {
                match kind {
                    PumpKind::Read => st.need_flush.note_read(),
                    PumpKind::Close(e) => st.need_flush.note_close(e),
                }
                return;
            }
            free
        } else {
            if st.read_buf.capacity() - st.read_buf.len() < self.cfg.read_chunk_size {
                st.read_buf.reserve(self.cfg.read_chunk_size * 2);
            }
            self.cfg.read_chunk_size
        };
        let want = free.min(self.cfg.read_chunk_size);
        let mut maybe_more = false;
        if matches!(kind, PumpKind::Read) {
            match self.core.fill(want) {
                Ok(Fill::Bytes { maybe_more: m, .. }) => maybe_more = m,
                Ok(Fill::WouldBlock | Fill::Eof) => {}
                Err(e) => {
                    self.read_error(b.as_ref(), st, e);
                    return;
                }
            }
        }
        let pulled = self.core.pull_into(&mut st.read_buf, want);
        if pulled > 0 {
            let now = Instant::now();
            st.total_read += pulled as u64;
            st.last_activity = Some(now);
            st.meter.record(pulled as u64, now);
            if let Some(g) = &st.global_meter {
                speed::record_into(g, pulled as u64, now);
            }
        }
        let more = maybe_more || self.core.buffered_len() > 0;
        if self.cfg.flush_to_disk && st.read_buf.len() >= self.cfg.flush_buffer_size {
            if st.flush_valid == 0 {
                self.swap_and_post(b.as_ref(), st);
                match kind {
                    PumpKind::Read => {
                        if more {
                            self.repost_event(b.as_ref(), NetEvent::new(Readiness::Readable));
                        }
                    }
                    PumpKind::Close(Some(kind)) => {
                        self.repost_event(b.as_ref(), NetEvent::with_error(Readiness::Closed, kind));
                    }
                    PumpKind::Close(None) => {
                        self.repost_event(b.as_ref(), NetEvent::new(Readiness::Closed));
                    }
                }
            } else {
                match kind {
                    PumpKind::Read => st.need_flush.note_read(),
                    PumpKind::Close(e) => st.need_flush.note_close(e),
                }
            }
            return;
        }
        match kind {
            PumpKind::Read => {
                if self.cfg.flush_to_disk
                    && pulled > 0
                    && !st.flush_timer_armed
                    && st.need_flush == NeedFlush::None
                {
                    if let Some(b) = &b {
                        st.flush_timer_armed = b.reactor.add_timer(
                            b.slot,
                            self.core.uid(),
                            Instant::now() + self.cfg.flush_period,
                            TIMER_FLUSH,
                            0,
                        );
                    }
                }
                if more {
                    self.repost_event(b.as_ref(), NetEvent::new(Readiness::Readable));
                }
            }
            PumpKind::Close(error) => {
                if more {
                    match error {
                        Some(kind) => self.repost_event(
                            b.as_ref(),
                            NetEvent::with_error(Readiness::Closed, kind),
                        ),
                        None => self.repost_event(b.as_ref(), NetEvent::new(Readiness::Closed)),
                    }
                } else {
                    self.finalize_close(b.as_ref(), st, error);
                }
            }
        }
    }

    fn read_error(&self, b: Option<&ConnBinding>, st: &mut DownState, err: SocketError) {
        warn!(uid = %self.core.uid(), error = %err, "data connection read failed");
        match err {
            SocketError::Io(e) => st.net_error = Some(e.kind()),
            other => st.socket_error = Some(other),
        }
        self.finalize_close(b, st, None);
    }

    fn on_flush_timer(&self) {
        let b = self.conn_binding();
        let mut guard = self.lock_state();
        let st = &mut *guard;
        if !st.flush_timer_armed {
            return;
        }
        st.flush_timer_armed = false;
        if st.read_buf.is_empty() {
            return;
        }
        if st.flush_valid == 0 {
            self.swap_and_post(b.as_ref(), st);
        } else {
            st.need_flush.note_timer();
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
            self.finalize_close(b.as_ref(), st, Some(io::ErrorKind::ConnectionReset));
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
        st.closed_at = Some(Instant::now());
        self.core.close();
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
        {
            let b = self.conn_binding();
            let mut guard = self.lock_state();
            let st = &mut *guard;
            if st.passive.is_some() && !st.received_connected {
                // Stream opened and closed before any readiness: an empty
                // transfer still counts as connected.
                self.just_connected(b.as_ref(), st);
            }
        }
        self.pump(PumpKind::Close(error));
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
            OwnerEvent::Readable => self.pump(PumpKind::Read),
            OwnerEvent::Closed { error } => self.on_closed(error),
            OwnerEvent::Writable | OwnerEvent::WriteDrained => {}
        }
    }
}

impl ReactorSocket for DownloadConnection {
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
        match kind {
            TIMER_FLUSH => self.on_flush_timer(),
            TIMER_NO_DATA => self.on_watchdog(),
            _ => {}
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

/// Clears per-attempt state before a dial.
fn reset_attempt(st: &mut DownState) {
    st.received_connected = false;
    st.net_error = None;
    st.socket_error = None;
    st.no_data_timeout_hit = false;
    st.postponed = Postponed::None;
    st.closed_at = None;
}
