//! Per-source sliding-window statistics: loss, delay, jitter, duplication
//! and reordering derived from raw probe sequence numbers and timestamps.
//!
//! Windows close every [`PACKETS_PERIOD`] counted packets; only a closed
//! window publishes averages, so a source reports nothing until it has been
//! heard long enough to be meaningful.

use crate::util::seq_distance;

/// Packets per measurement window.
pub const PACKETS_PERIOD: u32 = 40;
/// A sequence this far from the last one means the stream restarted.
pub const PACKETS_VERY_OLD: u32 = 150;

/// Duplicate-detection cache: one slot more than the window length.
const SEQ_CACHE: usize = (PACKETS_PERIOD + 1) as usize;

/// Published averages for one multicast mode of one source.
///
/// Starts out invalid; becomes valid when a window completes and is
/// invalidated again by [`Stats::check_validity`] once updates stop.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Stats {
    pub valid: bool,
    /// Sender-reported timestamp of the last counted packet (low 32 bits of
    /// its millisecond clock).
    pub timestamp: u64,
    /// Local receipt time of the last counted packet.
    pub lastupdate: u64,
    pub avgdelay: f32,
    pub avgjitter: f32,
    pub avgloss: f32,
    pub avgdup: f32,
    pub avgooo: f32,
    /// TTL of the most recent packet as received.
    pub rttl: u8,
}

impl Stats {
    /// Clears `valid` once the stats have gone `timeout_ms` without an
    /// update. Driven by periodic garbage collection, not the update path.
    pub fn check_validity(&mut self, now: u64, timeout_ms: u64) {
        if now.saturating_sub(self.lastupdate) > timeout_ms {
            self.valid = false;
        }
    }
}

/// In-progress window state for one multicast mode (ASM or SSM).
#[derive(Debug, Clone)]
pub struct McastState {
    pub lastseq: u32,
    packetcount: u32,
    packetcountreal: u32,
    pointer: u32,
    lastdelay: i64,
    lastjitter: i64,
    lastloss: i64,
    lastdup: i64,
    lastooo: i64,
    cache: [u32; SEQ_CACHE],
    pub s: Stats,
}

impl Default for McastState {
    fn default() -> Self {
        Self {
            lastseq: 0,
            packetcount: 0,
            packetcountreal: 0,
            pointer: 0,
            lastdelay: 0,
            lastjitter: 0,
            lastloss: 0,
            lastdup: 0,
            lastooo: 0,
            cache: [0; SEQ_CACHE],
            s: Stats::default(),
        }
    }
}

impl McastState {
    /// Treats `seq` as the start of a new stream: all window state is
    /// discarded and the published stats are invalidated.
    fn refresh(&mut self, seq: u32, now: u64) {
        self.lastseq = seq;
        self.packetcount = 0;
        self.packetcountreal = 0;
        self.pointer = 0;
        self.lastdelay = 0;
        self.lastjitter = 0;
        self.lastloss = 0;
        self.lastdup = 0;
        self.lastooo = 0;
        self.s.timestamp = 0;
        self.s.lastupdate = now;
        self.s.avgdelay = 0.0;
        self.s.avgjitter = 0.0;
        self.s.avgloss = 0.0;
        self.s.avgdup = 0.0;
        self.s.avgooo = 0.0;
        self.s.valid = false;
    }

    /// Accounts one received probe.
    ///
    /// `timestamp` is the 32-bit sender clock from the wire, `now` the local
    /// receipt time in milliseconds. Sequence comparisons intentionally use
    /// plain unsigned arithmetic; see [`seq_distance`].
    pub fn update(&mut self, ttl: u8, seqnum: u32, timestamp: u64, now: u64) {
        // Delay is measured against the low 32 bits of the local clock, the
        // same width the probe carries.
        let now32 = (now & 0xffff_ffff) as i64;
        let diff = now32 - timestamp as i64;
        let absdiff = diff.abs();

        if seq_distance(seqnum, self.lastseq) > PACKETS_VERY_OLD {
            self.refresh(seqnum.wrapping_sub(1), now);
        }

        // Older than anything the current window still tracks.
        if seqnum < self.lastseq && (self.lastseq - seqnum) >= self.packetcount {
            return;
        }

        self.s.timestamp = timestamp;
        self.s.lastupdate = now;
        self.s.rttl = ttl;

        let expect = self.lastseq.wrapping_add(1);

        let mut dup = false;
        if seqnum < expect {
            let cached = self.pointer.min(SEQ_CACHE as u32) as usize;
            dup = self.cache[..cached].contains(&seqnum);
        }

        if dup {
            self.lastdup += 1;
        } else {
            self.packetcountreal += 1;

            self.cache[self.pointer as usize % SEQ_CACHE] = seqnum;
            self.pointer += 1;

            self.lastdelay += diff;

            // RFC 3550 style jitter: EMA of the change in one-way delay.
            let newjitter = (absdiff - self.lastjitter).abs();
            self.lastjitter = absdiff;
            self.s.avgjitter = 15.0 / 16.0 * self.s.avgjitter + 1.0 / 16.0 * newjitter as f32;

            if seqnum == expect {
                self.packetcount += 1;
            } else if seqnum > expect {
                // Unsigned wraparound arithmetic, like the rest of the
                // sequence handling.
                let gap = seqnum.wrapping_sub(self.lastseq);
                self.packetcount = self.packetcount.wrapping_add(gap);
                self.lastloss += gap.wrapping_sub(1) as i64;
            } else {
                // Late arrival that is not a duplicate: reordered.
                self.lastloss -= 1;
                self.lastooo += 1;
            }

            if expect <= seqnum {
                self.lastseq = seqnum;
            }
        }

        if self.packetcount >= PACKETS_PERIOD {
            self.s.avgdelay = self.lastdelay as f32 / self.packetcountreal as f32;
            self.s.avgloss = self.lastloss as f32 / self.packetcount as f32;
            self.s.avgooo = self.lastooo as f32 / self.packetcount as f32;
            self.s.avgdup = self.lastdup as f32 / self.packetcount as f32;
            self.s.valid = true;

            self.packetcount = 0;
            self.packetcountreal = 0;
            self.pointer = 0;
            self.lastdelay = 0;
            self.lastloss = 0;
            self.lastdup = 0;
            self.lastooo = 0;
        }
    }

    #[cfg(test)]
    fn window_count(&self) -> u32 {
        self.packetcount
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(st: &mut McastState, seqs: impl IntoIterator<Item = u32>) {
        for seq in seqs {
            // Zero one-way delay: sender clock equals local clock.
            st.update(64, seq, 1000, 1000);
        }
    }

    #[test]
    fn test_window_completion_clean_stream() {
        let mut st = McastState::default();
        feed(&mut st, 1..=40);

        assert!(st.s.valid);
        assert_eq!(st.s.avgloss, 0.0);
        assert_eq!(st.s.avgdup, 0.0);
        assert_eq!(st.s.avgooo, 0.0);
        assert_eq!(st.s.avgdelay, 0.0);
        assert_eq!(st.s.rttl, 64);
        // Window counters reset for the next period.
        assert_eq!(st.window_count(), 0);
    }

    #[test]
    fn test_loss_accounting_single_gap() {
        let mut st = McastState::default();
        feed(&mut st, 1..=19);
        feed(&mut st, 21..=41);

        assert!(st.s.valid);
        assert!((st.s.avgloss - 1.0 / 40.0).abs() < 1e-6);
        assert_eq!(st.s.avgdup, 0.0);
        assert_eq!(st.s.avgooo, 0.0);
    }

    #[test]
    fn test_duplicate_detection() {
        let mut st = McastState::default();
        feed(&mut st, 1..=10);
        let before = st.window_count();
        // Re-deliver a sequence the cache still remembers.
        feed(&mut st, [7]);
        assert_eq!(st.window_count(), before, "duplicate must not count");
        feed(&mut st, 11..=40);

        assert!(st.s.valid);
        assert!((st.s.avgdup - 1.0 / 40.0).abs() < 1e-6);
        assert_eq!(st.s.avgloss, 0.0);
        assert_eq!(st.s.avgooo, 0.0);
    }

    #[test]
    fn test_reorder_accounting() {
        let mut st = McastState::default();
        // 5 arrives early (counts a loss), then 4 arrives late (repays it).
        feed(&mut st, [1, 2, 3, 5, 4]);
        feed(&mut st, 6..=40);

        assert!(st.s.valid);
        assert_eq!(st.s.avgloss, 0.0);
        assert!((st.s.avgooo - 1.0 / 40.0).abs() < 1e-6);
    }

    #[test]
    fn test_very_old_jump_resets_window() {
        let mut st = McastState::default();
        feed(&mut st, 1..=40);
        assert!(st.s.valid);

        // A jump beyond PACKETS_VERY_OLD starts a fresh stream in either
        // direction.
        feed(&mut st, [400]);
        assert!(!st.s.valid);
        assert_eq!(st.lastseq, 400);
        assert_eq!(st.window_count(), 1);

        feed(&mut st, [5]);
        assert!(!st.s.valid);
        assert_eq!(st.lastseq, 5);
    }

    #[test]
    fn test_delay_average() {
        let mut st = McastState::default();
        for seq in 1..=40u32 {
            // Constant 25ms one-way delay.
            st.update(64, seq, 1000, 1025);
        }
        assert!(st.s.valid);
        assert!((st.s.avgdelay - 25.0).abs() < 1e-3);
        // Constant delay means the jitter estimator decays toward zero.
        assert!(st.s.avgjitter < 25.0);
    }

    #[test]
    fn test_stale_window_packet_dropped() {
        let mut st = McastState::default();
        feed(&mut st, 100..=110);
        let snapshot = st.s;
        // Older than the window tracks, closer than PACKETS_VERY_OLD.
        st.update(64, 30, 1000, 1000);
        assert_eq!(st.s, snapshot, "stale packet must have no effect");
    }

    #[test]
    fn test_check_validity_timeout() {
        let mut st = McastState::default();
        feed(&mut st, 1..=40);
        assert!(st.s.valid);

        st.s.check_validity(1000 + 30_000, 30_000);
        assert!(st.s.valid, "exactly at the timeout is still fresh");
        st.s.check_validity(1000 + 30_001, 30_000);
        assert!(!st.s.valid);
    }
}
