//! Adaptive packet sizing for uploads.
//!
//! Send sizes follow a speed ladder recalibrated from the meters. After
//! every size change a short verification window compares throughput
//! against the speed that justified the change; a collapse marks the new
//! size as too big and backs the ladder off below it. Links that silently
//! drop oversized writes (some satellite and VPN paths) stabilize on the
//! largest size that still moves data.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Packet sizing knobs. Everything the ladder and the probes use is
/// configuration so odd links can be accommodated without a rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PacketTuning {
    /// Speed ladder as `(below_speed, chunk)` rungs, ascending. A rung is
    /// picked when the observed speed is below its bound or when the next
    /// rung's chunk already proved too big; the last rung is the cap.
    pub rungs: Vec<(u64, usize)>,
    /// Chunk used from the first write until the first calibration.
    pub initial_chunk: usize,
    /// Delay from the first write to the first calibration.
    pub first_probe: Duration,
    /// Calibration period after the first probe.
    pub probe_period: Duration,
    /// Window after a size change in which throughput is verified.
    pub verify_window: Duration,
    /// A change collapsed when the prior speed exceeds the bytes moved in
    /// the verification window by this factor.
    pub collapse_ratio: u32,
    /// Bytes sent this close to the first write are not metered.
    pub warmup: Duration,
}

impl Default for PacketTuning {
    fn default() -> Self {
        Self {
            rungs: vec![
                (4 * 1024, 512),
                (8 * 1024, 1024),
                (32 * 1024, 4 * 1024),
                (64 * 1024, 8 * 1024),
                (u64::MAX, 32 * 1024),
            ],
            initial_chunk: 4 * 1024,
            first_probe: Duration::from_secs(1),
            probe_period: Duration::from_secs(5),
            verify_window: Duration::from_millis(1000),
            collapse_ratio: 3,
            warmup: Duration::from_millis(100),
        }
    }
}

impl PacketTuning {
    /// Picks the chunk for `speed`, staying below a known-bad size.
    pub fn estimate(&self, speed: u64, too_big: Option<usize>) -> usize {
        let cap = too_big.unwrap_or(usize::MAX);
        for pair in self.rungs.windows(2) {
            if speed < pair[0].0 || cap <= pair[1].1 {
                return pair[0].1;
            }
        }
        self.rungs.last().map_or(512, |r| r.1)
    }
}

/// Verification armed by a size change.
#[derive(Debug)]
struct Verify {
    since: Instant,
    /// Speed that justified the change.
    speed_before: u64,
    /// Bytes moved inside the window so far.
    sent: u64,
}

/// Per-upload packet size state.
#[derive(Debug)]
pub(crate) struct PacketSizer {
    tuning: PacketTuning,
    chunk: usize,
    too_big: Option<usize>,
    next_probe: Option<Instant>,
    verify: Option<Verify>,
}

impl PacketSizer {
    pub(crate) fn new(tuning: PacketTuning) -> Self {
        let chunk = tuning.initial_chunk;
        Self {
            tuning,
            chunk,
            too_big: None,
            next_probe: None,
            verify: None,
        }
    }

    /// Arms the sizer at the first write after connect. A `too_big` size
    /// recorded by an earlier attempt survives and caps the restart.
    pub(crate) fn begin(&mut self, now: Instant) {
        self.chunk = self.tuning.initial_chunk;
        if self.too_big.is_some_and(|tb| self.chunk >= tb) {
            self.chunk = self.tuning.rungs.first().map_or(512, |r| r.1);
        }
        self.next_probe = Some(now + self.tuning.first_probe);
        self.verify = None;
    }

    /// Current send chunk.
    pub(crate) fn chunk(&self) -> usize {
        self.chunk
    }

    #[cfg(test)]
    pub(crate) fn too_big(&self) -> Option<usize> {
        self.too_big
    }

    /// Accounts bytes handed to the transport and resolves the
    /// verification window once it elapses.
    pub(crate) fn note_sent(&mut self, sent: u64, now: Instant) {
        let Some(v) = &mut self.verify else {
            return;
        };
        if now.duration_since(v.since) <= self.tuning.verify_window {
            v.sent += sent;
            return;
        }
        let speed_before = v.speed_before;
        let floor = speed_before / u64::from(self.tuning.collapse_ratio.max(1));
        if floor <= v.sent {
            self.verify = None;
            return;
        }
        // Throughput collapsed right after the size change: the new size
        // does not fit through this link.
        self.too_big = Some(self.chunk);
        let next = self.tuning.estimate(speed_before, self.too_big);
        if next != self.chunk {
            debug!(from = self.chunk, to = next, "packet size collapsed throughput, backing off");
            self.chunk = next;
            self.next_probe = Some(now + self.tuning.probe_period);
            self.verify = Some(Verify {
                since: now,
                speed_before,
                sent: 0,
            });
        } else {
            warn!(chunk = self.chunk, "throughput collapsed but the packet size cannot shrink");
            self.verify = None;
        }
    }

    /// Whether a calibration probe is due.
    pub(crate) fn probe_due(&self, now: Instant) -> bool {
        self.next_probe.is_some_and(|t| now >= t)
    }

    /// Recalibrates from the metered `speed`; arms verification when the
    /// size changes.
    pub(crate) fn recalibrate(&mut self, speed: u64, now: Instant) {
        self.next_probe = Some(now + self.tuning.probe_period);
        let next = self.tuning.estimate(speed, self.too_big);
        if next != self.chunk {
            debug!(from = self.chunk, to = next, speed, "packet size recalibrated");
            self.chunk = next;
            self.verify = Some(Verify {
                since: now,
                speed_before: speed,
                sent: 0,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn ladder_follows_speed() {
        let t = PacketTuning::default();
        assert_eq!(t.estimate(0, None), 512);
        assert_eq!(t.estimate(4095, None), 512);
        assert_eq!(t.estimate(4096, None), 1024);
        assert_eq!(t.estimate(8192, None), 4096);
        assert_eq!(t.estimate(32_768, None), 8192);
        assert_eq!(t.estimate(65_536, None), 32_768);
        assert_eq!(t.estimate(u64::MAX - 1, None), 32_768);
    }

    #[test]
    fn too_big_caps_the_ladder() {
        let t = PacketTuning::default();
        assert_eq!(t.estimate(1_000_000, Some(1024)), 512);
        assert_eq!(t.estimate(1_000_000, Some(4096)), 1024);
        assert_eq!(t.estimate(1_000_000, Some(8192)), 4096);
        assert_eq!(t.estimate(1_000_000, Some(32_768)), 8192);
        assert_eq!(t.estimate(1_000_000, Some(512)), 512);
    }

    #[test]
    fn collapse_backs_off_and_remembers() {
        let t0 = Instant::now();
        let mut s = PacketSizer::new(PacketTuning::default());
        s.begin(t0);
        assert_eq!(s.chunk(), 4096);
        s.recalibrate(100_000, t0 + Duration::from_secs(1));
        assert_eq!(s.chunk(), 32_768);
        // 2000 bytes in the verification second, against 100 kB/s before.
        s.note_sent(2000, t0 + Duration::from_millis(1500));
        s.note_sent(100, t0 + Duration::from_millis(2200));
        assert_eq!(s.chunk(), 8192);
        assert_eq!(s.too_big(), Some(32_768));
    }

    #[test]
    fn collapse_at_the_floor_stops_shrinking() {
        let t0 = Instant::now();
        let mut s = PacketSizer::new(PacketTuning::default());
        s.begin(t0);
        s.recalibrate(5000, t0 + Duration::from_secs(1));
        assert_eq!(s.chunk(), 1024);
        // Nothing moved in the window: collapse down to the 512 floor.
        s.note_sent(0, t0 + Duration::from_millis(2200));
        assert_eq!(s.chunk(), 512);
        assert_eq!(s.too_big(), Some(1024));
        // A second collapse cannot shrink further; verification disarms.
        s.note_sent(0, t0 + Duration::from_millis(3500));
        assert_eq!(s.chunk(), 512);
        assert_eq!(s.too_big(), Some(512));
        s.note_sent(0, t0 + Duration::from_millis(60_000));
        assert_eq!(s.chunk(), 512);
    }

    #[test]
    fn restart_respects_recorded_too_big() {
        let t0 = Instant::now();
        let mut s = PacketSizer::new(PacketTuning::default());
        s.begin(t0);
        s.recalibrate(5000, t0 + Duration::from_secs(1));
        s.note_sent(0, t0 + Duration::from_millis(2200));
        assert_eq!(s.too_big(), Some(1024));
        s.begin(t0 + Duration::from_secs(10));
        // initial_chunk 4096 >= too_big 1024, so restart at the floor.
        assert_eq!(s.chunk(), 512);
    }

    proptest! {
        #[test]
        fn estimate_is_monotone_in_speed(
            s1 in 0u64..200_000,
            s2 in 0u64..200_000,
            cap in prop::option::of(256usize..100_000),
        ) {
            let t = PacketTuning::default();
            let (lo, hi) = if s1 <= s2 { (s1, s2) } else { (s2, s1) };
            prop_assert!(t.estimate(lo, cap) <= t.estimate(hi, cap));
        }

        #[test]
        fn cap_never_grows_the_estimate(
            speed in 0u64..200_000,
            cap in 256usize..100_000,
        ) {
            let t = PacketTuning::default();
            prop_assert!(t.estimate(speed, Some(cap)) <= t.estimate(speed, None));
        }
    }
}
