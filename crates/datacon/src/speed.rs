//! Sliding-window transfer speed metering.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Closed steps kept, plus the step being filled.
const STEPS: usize = 61;

/// Width of one accounting step in milliseconds.
const STEP_MS: u64 = 1000;

const STEP: Duration = Duration::from_millis(STEP_MS);

/// Byte counter bucketed into one-second steps over a sliding window of up
/// to a minute.
///
/// [`record`](Self::record) files byte counts into the step containing
/// their timestamp, zeroing any steps skipped by a pause;
/// [`speed`](Self::speed) averages the closed steps plus the elapsed part
/// of the open one, so stalls drag the reading down within seconds while a
/// single burst cannot dominate a long transfer.
#[derive(Debug)]
pub struct TransferSpeedMeter {
    /// Circular buffer of per-step byte counts.
    slots: [u64; STEPS],
    /// Index of the step currently being filled.
    head: usize,
    /// End of the step at `head`; `None` until the window opens.
    step_end: Option<Instant>,
    /// Valid entries in `slots`, head included.
    count: usize,
}

impl TransferSpeedMeter {
    /// Creates an idle meter with no open window.
    pub fn new() -> Self {
        Self {
            slots: [0; STEPS],
            head: 0,
            step_end: None,
            count: 0,
        }
    }

    /// Forgets all history; the next `start` or `record` reopens the window.
    pub fn clear(&mut self) {
        self.head = 0;
        self.step_end = None;
        self.count = 0;
    }

    /// Opens the first step at `now`. Recording auto-starts on a cleared
    /// meter, but transfers call this on connect so the window begins at
    /// the handshake rather than the first payload byte.
    pub fn start(&mut self, now: Instant) {
        self.slots[0] = 0;
        self.head = 0;
        self.step_end = Some(now + STEP);
        self.count = 1;
    }

    /// Files `bytes` into the step containing `now`.
    pub fn record(&mut self, bytes: u64, now: Instant) {
        let Some(step_end) = self.step_end else {
            self.start(now);
            self.slots[0] = bytes;
            return;
        };
        if now < step_end {
            self.slots[self.head] += bytes;
            return;
        }
        // The current step closed some time ago; zero the steps the idle
        // span covers, then open a fresh one for this count.
        let behind_ms = now.duration_since(step_end).as_millis() as u64;
        let empty = behind_ms / STEP_MS;
        let skip = empty.min(STEPS as u64 - 1) as usize;
        if skip > 0 && self.count <= STEPS - 1 {
            self.count = STEPS.min(self.count + skip);
        }
        for _ in 0..skip {
            self.head = (self.head + 1) % STEPS;
            self.slots[self.head] = 0;
        }
        self.step_end = Some(step_end + Duration::from_millis((empty + 1) * STEP_MS));
        self.head = (self.head + 1) % STEPS;
        if self.count <= STEPS - 1 {
            self.count += 1;
        }
        self.slots[self.head] = bytes;
    }

    /// Average bytes per second over the window as of `now`.
    pub fn speed(&self, now: Instant) -> u64 {
        let Some(step_end) = self.step_end else {
            return 0;
        };
        if self.count == 0 {
            return 0;
        }
        let mut total: u64 = 0;
        let mut head_in_total = 0usize;
        let empty;
        let rest_ms;
        if now >= step_end {
            let behind_ms = now.duration_since(step_end).as_millis() as u64;
            rest_ms = behind_ms % STEP_MS;
            empty = ((behind_ms / STEP_MS) as usize).min(STEPS - 1);
            if empty < STEPS - 1 {
                total = self.slots[self.head];
                head_in_total = 1;
            }
        } else {
            // Inside the open step: weight it by its elapsed part.
            rest_ms = STEP_MS - now.duration_since(step_end - STEP).as_millis() as u64;
            empty = 0;
            total = self.slots[self.head];
        }
        let add_from = if now >= step_end {
            (STEPS - 1 - head_in_total - empty).min(self.count - 1)
        } else {
            self.count - 1
        };
        let mut idx = self.head;
        for _ in 0..add_from {
            idx = if idx == 0 { STEPS - 1 } else { idx - 1 };
            total += self.slots[idx];
        }
        let window_ms = (add_from + head_in_total + empty) as u64 * STEP_MS + rest_ms;
        if window_ms > 0 {
            total.saturating_mul(1000) / window_ms
        } else {
            0
        }
    }
}

impl Default for TransferSpeedMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Meter shared by several transfers, typically the process-wide aggregate.
pub type SharedMeter = Arc<Mutex<TransferSpeedMeter>>;

/// Creates a fresh shared meter.
pub fn shared_meter() -> SharedMeter {
    Arc::new(Mutex::new(TransferSpeedMeter::new()))
}

/// Records into a shared meter, riding over poisoning.
pub fn record_into(meter: &SharedMeter, bytes: u64, now: Instant) {
    meter
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .record(bytes, now);
}
