//! Relative-delta timer queue driving all periodic behavior.
//!
//! Each entry stores only the increment over its predecessor, so advancing
//! time touches the head entry alone: no per-tick scan, no absolute
//! deadlines. Re-arming is the caller's job; firing removes a timer.

use smallvec::SmallVec;
use std::collections::VecDeque;

/// Wait returned when the queue is empty. The engine always keeps timers
/// armed, so this is a fallback, not a steady state.
const IDLE_WAIT_MS: u64 = 1000;

/// The periodic and one-shot actions the beacon engine schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Send one probe of the current burst to the ASM group.
    ProbeSend,
    /// Randomized pause between probe bursts.
    ProbeBurstGap,
    /// Send one probe of the current burst to the SSM channel.
    SsmProbeSend,
    /// Randomized pause between SSM probe bursts.
    SsmProbeBurstGap,
    StatsReport,
    SsmReport,
    MapReport,
    WebsiteReport,
    GarbageCollect,
    Dump,
    /// 10-second bandwidth window roll-over and interval adaptation.
    BandwidthTick,
    /// 10-minute aggregate bandwidth summary.
    BandwidthSummary,
}

#[derive(Debug, Clone, Copy)]
struct Timer {
    kind: TimerKind,
    /// Milliseconds after the predecessor in the queue.
    delta: u64,
}

/// Delta-queue scheduler.
///
/// All methods take the current time in milliseconds so tests can drive a
/// synthetic clock; wall-clock deltas accumulate in `elapsed` until they are
/// charged against the head timer.
#[derive(Debug)]
pub struct EventScheduler {
    queue: VecDeque<Timer>,
    elapsed: u64,
    last_check: u64,
}

impl EventScheduler {
    pub fn new(now: u64) -> Self {
        Self {
            queue: VecDeque::new(),
            elapsed: 0,
            last_check: now,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Arms `kind` to fire `interval` milliseconds from the last clock
    /// advance, splicing it into the delta chain.
    pub fn insert(&mut self, kind: TimerKind, interval: u64) {
        if self.queue.is_empty() {
            self.elapsed = 0;
        }

        let mut acc = 0u64;
        let mut idx = self.queue.len();
        for (i, t) in self.queue.iter().enumerate() {
            if acc + t.delta > interval {
                idx = i;
                break;
            }
            acc += t.delta;
        }

        let delta = interval - acc;
        if let Some(next) = self.queue.get_mut(idx) {
            // The successor now fires relative to the new entry.
            next.delta -= delta;
        }
        self.queue.insert(idx, Timer { kind, delta });
    }

    fn advance(&mut self, now: u64) {
        self.elapsed += now.saturating_sub(self.last_check);
        self.last_check = now;
    }

    /// Timeout for the next blocking wait, clamped to at least 1 ms.
    ///
    /// Consumes as much of the elapsed accumulator as the head delta covers,
    /// so repeated calls converge instead of double-counting wall time.
    pub fn time_until_next(&mut self, now: u64) -> u64 {
        self.advance(now);
        let Some(head) = self.queue.front_mut() else {
            return IDLE_WAIT_MS;
        };
        let take = head.delta.min(self.elapsed);
        head.delta -= take;
        self.elapsed -= take;
        head.delta.max(1)
    }

    /// Pops and returns every timer already covered by elapsed time, in
    /// firing order. The wait primitive may oversleep past several
    /// deadlines; all of them fire in one call.
    pub fn fire_due(&mut self, now: u64) -> SmallVec<[TimerKind; 4]> {
        self.advance(now);
        let mut fired = SmallVec::new();
        while self
            .queue
            .front()
            .is_some_and(|head| head.delta <= self.elapsed)
        {
            if let Some(t) = self.queue.pop_front() {
                self.elapsed -= t.delta;
                fired.push(t.kind);
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_firing_order_across_one_wait() {
        let mut sched = EventScheduler::new(0);
        sched.insert(TimerKind::StatsReport, 30_000);
        sched.insert(TimerKind::ProbeSend, 100);
        sched.insert(TimerKind::GarbageCollect, 10_000);

        let fired = sched.fire_due(10_100);
        assert_eq!(
            fired.as_slice(),
            &[TimerKind::ProbeSend, TimerKind::GarbageCollect]
        );
        // The 30s timer is still pending.
        assert_eq!(sched.len(), 1);
        let fired = sched.fire_due(30_000);
        assert_eq!(fired.as_slice(), &[TimerKind::StatsReport]);
    }

    #[test]
    fn test_insert_splices_deltas() {
        let mut sched = EventScheduler::new(0);
        sched.insert(TimerKind::StatsReport, 5000);
        sched.insert(TimerKind::ProbeSend, 2000);
        // Head fires after its own interval, the tail after the remainder.
        assert_eq!(sched.time_until_next(0), 2000);
        assert!(sched.fire_due(2000).contains(&TimerKind::ProbeSend));
        assert_eq!(sched.time_until_next(2000), 3000);
    }

    #[test]
    fn test_ties_fire_in_insertion_order() {
        let mut sched = EventScheduler::new(0);
        sched.insert(TimerKind::ProbeSend, 100);
        sched.insert(TimerKind::SsmProbeSend, 100);
        let fired = sched.fire_due(100);
        assert_eq!(
            fired.as_slice(),
            &[TimerKind::ProbeSend, TimerKind::SsmProbeSend]
        );
    }

    #[test]
    fn test_wait_clamped_to_one_ms() {
        let mut sched = EventScheduler::new(0);
        sched.insert(TimerKind::ProbeSend, 5);
        // The wait already overshot the deadline; the caller still gets a
        // positive timeout and the timer fires on the next drain.
        assert_eq!(sched.time_until_next(50), 1);
        assert_eq!(sched.fire_due(50).as_slice(), &[TimerKind::ProbeSend]);
    }

    #[test]
    fn test_nothing_fires_early() {
        let mut sched = EventScheduler::new(0);
        sched.insert(TimerKind::Dump, 1000);
        assert!(sched.fire_due(999).is_empty());
        assert_eq!(sched.fire_due(1000).as_slice(), &[TimerKind::Dump]);
    }

    #[test]
    fn test_elapsed_resets_when_queue_refills() {
        let mut sched = EventScheduler::new(0);
        sched.insert(TimerKind::Dump, 100);
        assert_eq!(sched.fire_due(5000).as_slice(), &[TimerKind::Dump]);

        // Idle time while the queue was empty must not count against a
        // newly armed timer.
        sched.insert(TimerKind::Dump, 100);
        assert!(sched.fire_due(5050).is_empty());
        assert_eq!(sched.fire_due(5100).as_slice(), &[TimerKind::Dump]);
    }
}
