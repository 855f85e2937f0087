use crate::seq::SeqNo;
use rustc_hash::FxHashMap;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;
use tokio::time::Instant;

pub type TimerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// per in-flight segment, re-sends the slot when it fires
    Retransmit(SeqNo),
    /// drives SYN / SYN_ACK / FIN retries
    HandshakeRetry,
    /// releases the connection at the end of TIME_WAIT
    TimeWait,
}

/// A small scheduler of named, resettable, one-shot timers.
///
/// Entries live in a min-heap of `(deadline, id)`; the authoritative set of armed timers
///  is the id map. Cancellation just removes the map entry - the heap entry becomes a
///  tombstone that is skipped when it surfaces. Each timer fires at most once per
///  arming.
///
/// The time source is [tokio::time::Instant], which is monotonic - wall-clock
///  adjustments never affect pending timers - and controllable from paused-runtime
///  tests.
pub struct TimerWheel {
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    armed: FxHashMap<TimerId, TimerKind>,
    next_id: TimerId,
}

impl TimerWheel {
    pub fn new() -> TimerWheel {
        TimerWheel {
            heap: BinaryHeap::new(),
            armed: FxHashMap::default(),
            next_id: 0,
        }
    }

    pub fn arm(&mut self, kind: TimerKind, delay: Duration) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;

        self.armed.insert(id, kind);
        self.heap.push(Reverse((Instant::now() + delay, id)));
        id
    }

    pub fn cancel(&mut self, id: TimerId) {
        self.armed.remove(&id);
    }

    pub fn cancel_all(&mut self) {
        self.armed.clear();
        self.heap.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    /// The earliest pending deadline, with tombstones of cancelled timers discarded on
    ///  the way.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(&Reverse((deadline, id))) = self.heap.peek() {
            if self.armed.contains_key(&id) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// All timers whose deadline has passed, in firing order. Fired timers are disarmed.
    pub fn poll_expired(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut fired = Vec::new();

        while let Some(&Reverse((deadline, id))) = self.heap.peek() {
            if deadline > now {
                break;
            }
            self.heap.pop();

            if let Some(kind) = self.armed.remove(&id) {
                fired.push(kind);
            }
        }

        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn now() -> Instant {
        Instant::now()
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_and_expire_in_order() {
        let mut timers = TimerWheel::new();
        timers.arm(TimerKind::TimeWait, Duration::from_millis(30));
        timers.arm(TimerKind::Retransmit(SeqNo::from_raw(1)), Duration::from_millis(10));
        timers.arm(TimerKind::HandshakeRetry, Duration::from_millis(20));

        assert_eq!(timers.poll_expired(now()), vec![]);

        tokio::time::advance(Duration::from_millis(25)).await;
        assert_eq!(
            timers.poll_expired(now()),
            vec![TimerKind::Retransmit(SeqNo::from_raw(1)), TimerKind::HandshakeRetry]
        );

        tokio::time::advance(Duration::from_millis(10)).await;
        assert_eq!(timers.poll_expired(now()), vec![TimerKind::TimeWait]);
        assert!(timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_does_not_fire() {
        let mut timers = TimerWheel::new();
        let id = timers.arm(TimerKind::Retransmit(SeqNo::from_raw(7)), Duration::from_millis(10));
        timers.arm(TimerKind::HandshakeRetry, Duration::from_millis(10));
        timers.cancel(id);

        tokio::time::advance(Duration::from_millis(15)).await;
        assert_eq!(timers.poll_expired(now()), vec![TimerKind::HandshakeRetry]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_deadline_skips_tombstones() {
        let mut timers = TimerWheel::new();
        let early = timers.arm(TimerKind::HandshakeRetry, Duration::from_millis(5));
        timers.arm(TimerKind::TimeWait, Duration::from_millis(50));

        let first = timers.next_deadline().unwrap();
        timers.cancel(early);
        let second = timers.next_deadline().unwrap();
        assert!(second > first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_at_most_once_per_arming() {
        let mut timers = TimerWheel::new();
        timers.arm(TimerKind::TimeWait, Duration::from_millis(5));

        tokio::time::advance(Duration::from_millis(10)).await;
        assert_eq!(timers.poll_expired(now()), vec![TimerKind::TimeWait]);
        assert_eq!(timers.poll_expired(now()), vec![]);

        tokio::time::advance(Duration::from_secs(100)).await;
        assert_eq!(timers.poll_expired(now()), vec![]);
    }

    #[rstest]
    #[case::none(vec![], None)]
    #[case::single(vec![10], Some(10))]
    #[case::earliest_wins(vec![30, 10, 20], Some(10))]
    fn test_next_deadline(#[case] delays_millis: Vec<u64>, #[case] expected_millis: Option<u64>) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let start = Instant::now();
            let mut timers = TimerWheel::new();
            for delay in delays_millis {
                timers.arm(TimerKind::HandshakeRetry, Duration::from_millis(delay));
            }
            assert_eq!(
                timers.next_deadline(),
                expected_millis.map(|m| start + Duration::from_millis(m))
            );
        });
    }
}
