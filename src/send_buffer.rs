use crate::seq::SeqNo;
use crate::timer::TimerId;
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// One in-flight (or not yet transmitted) segment of the send window.
pub struct SendSlot {
    pub seq: SeqNo,
    pub payload: Bytes,
    pub first_sent_at: Option<Instant>,
    pub last_sent_at: Option<Instant>,
    /// number of re-transmissions so far, bounded by the configured retry limit
    pub retries: u32,
    /// Karn flag: once a slot was retransmitted, its RTT measurement is ambiguous and
    ///  must not feed the estimator
    pub retransmitted: bool,
    pub timer: Option<TimerId>,
}

/// The sliding send window: a contiguous run of sequence-numbered slots starting at
///  `snd_una`.
///
/// The buffer holds at most `window` slots, so everything buffered lies inside
///  `[snd_una, snd_una + W)` by construction; slots beyond the window stay with the
///  caller until acknowledgments free capacity. Sequence numbers are assigned per
///  segment (not per byte), one per slot.
pub struct SendBuffer {
    slots: VecDeque<SendSlot>,
    snd_una: SeqNo,
    snd_nxt: SeqNo,
    window: usize,
    payload_max: usize,
    dup_acks: u64,
}

/// Result of processing a cumulative acknowledgment.
#[derive(Debug, PartialEq, Eq)]
pub enum AckOutcome {
    /// `snd_una` advanced; the caller must cancel the returned retransmission timers
    ///  and feed the sample (if any) into the RTT estimator
    Advanced {
        cancelled_timers: Vec<TimerId>,
        rtt_sample: Option<Duration>,
    },
    /// ack equals `snd_una` - counted, but fast retransmit is deliberately not part of
    ///  this protocol, so nothing else happens
    Duplicate,
    /// outside `(snd_una, snd_nxt]` (wrap-aware) - stale, or acknowledging data that
    ///  was never sent
    Invalid,
}

impl SendBuffer {
    pub fn new(window: usize, payload_max: usize) -> SendBuffer {
        SendBuffer {
            slots: VecDeque::new(),
            snd_una: SeqNo::ZERO,
            snd_nxt: SeqNo::ZERO,
            window,
            payload_max,
            dup_acks: 0,
        }
    }

    /// Called once the handshake fixes the first data sequence number (`iss + 1`).
    pub fn init(&mut self, start: SeqNo) {
        debug_assert!(self.slots.is_empty());
        self.snd_una = start;
        self.snd_nxt = start;
    }

    pub fn snd_una(&self) -> SeqNo {
        self.snd_una
    }

    pub fn snd_nxt(&self) -> SeqNo {
        self.snd_nxt
    }

    pub fn in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn has_capacity(&self) -> bool {
        self.slots.len() < self.window
    }

    pub fn dup_acks(&self) -> u64 {
        self.dup_acks
    }

    /// Cut a message into per-segment chunks of at most `payload_max` bytes.
    ///
    /// End-of-message is marked by a final chunk shorter than `payload_max`; when the
    ///  message length is an exact multiple (including the empty message), an empty
    ///  trailing chunk carries the marker.
    pub fn fragment(&self, message: &[u8]) -> VecDeque<Bytes> {
        let mut chunks: VecDeque<Bytes> = message
            .chunks(self.payload_max)
            .map(Bytes::copy_from_slice)
            .collect();

        if message.len() % self.payload_max == 0 {
            chunks.push_back(Bytes::new());
        }
        chunks
    }

    /// Append a chunk as the next slot, assigning it the next sequence number. The
    ///  caller must have checked `has_capacity`.
    pub fn push_chunk(&mut self, payload: Bytes) -> SeqNo {
        debug_assert!(self.has_capacity());

        let seq = self.snd_nxt;
        self.snd_nxt = self.snd_nxt.next();
        self.slots.push_back(SendSlot {
            seq,
            payload,
            first_sent_at: None,
            last_sent_at: None,
            retries: 0,
            retransmitted: false,
            timer: None,
        });
        seq
    }

    /// Slots that were never transmitted, in sequence order.
    pub fn unsent(&self) -> Vec<(SeqNo, Bytes)> {
        self.slots.iter()
            .filter(|slot| slot.last_sent_at.is_none())
            .map(|slot| (slot.seq, slot.payload.clone()))
            .collect()
    }

    pub fn mark_sent(&mut self, seq: SeqNo, now: Instant, timer: TimerId) {
        if let Some(slot) = self.slot_mut(seq) {
            if slot.first_sent_at.is_none() {
                slot.first_sent_at = Some(now);
            }
            slot.last_sent_at = Some(now);
            slot.timer = Some(timer);
        }
    }

    pub fn slot_mut(&mut self, seq: SeqNo) -> Option<&mut SendSlot> {
        self.slots.iter_mut().find(|slot| slot.seq == seq)
    }

    /// Process a cumulative acknowledgment: everything with `seq < ack` has arrived.
    pub fn on_ack(&mut self, ack: SeqNo, now: Instant) -> AckOutcome {
        if ack == self.snd_una {
            self.dup_acks += 1;
            return AckOutcome::Duplicate;
        }
        if !self.snd_una.is_before(ack) || self.snd_nxt.is_before(ack) {
            return AckOutcome::Invalid;
        }

        let mut cancelled_timers = Vec::new();
        let mut rtt_sample = None;

        while let Some(front) = self.slots.front() {
            if !front.seq.is_before(ack) {
                break;
            }
            let slot = self.slots.pop_front().expect("checked by front()");
            if let Some(timer) = slot.timer {
                cancelled_timers.push(timer);
            }
            if !slot.retransmitted {
                if let Some(first_sent_at) = slot.first_sent_at {
                    rtt_sample = Some(now.saturating_duration_since(first_sent_at));
                }
            }
        }

        self.snd_una = ack;
        AckOutcome::Advanced { cancelled_timers, rtt_sample }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn buffer(window: usize, payload_max: usize, start: u32) -> SendBuffer {
        let mut buf = SendBuffer::new(window, payload_max);
        buf.init(SeqNo::from_raw(start));
        buf
    }

    #[rstest]
    #[case::short("HELLO", 3, vec!["HEL", "LO"])]
    #[case::exact_multiple("ABCD", 2, vec!["AB", "CD", ""])]
    #[case::single_full("AB", 2, vec!["AB", ""])]
    #[case::shorter_than_max("A", 2, vec!["A"])]
    #[case::empty_message("", 5, vec![""])]
    fn test_fragment(#[case] message: &str, #[case] payload_max: usize, #[case] expected: Vec<&str>) {
        let buf = buffer(8, payload_max, 0);
        let chunks = buf.fragment(message.as_bytes());
        let actual: Vec<&[u8]> = chunks.iter().map(|c| c.as_ref()).collect();
        let expected: Vec<&[u8]> = expected.iter().map(|s| s.as_bytes()).collect();
        assert_eq!(actual, expected);
    }

    #[rstest]
    #[case::from_zero(100)]
    #[case::across_wrap(u32::MAX - 1)]
    fn test_push_assigns_consecutive_seqs(#[case] start: u32) {
        let mut buf = buffer(4, 10, start);

        let s1 = buf.push_chunk(Bytes::from_static(b"a"));
        let s2 = buf.push_chunk(Bytes::from_static(b"b"));
        let s3 = buf.push_chunk(Bytes::from_static(b"c"));

        assert_eq!(s1, SeqNo::from_raw(start));
        assert_eq!(s2, SeqNo::from_raw(start) + 1);
        assert_eq!(s3, SeqNo::from_raw(start) + 2);
        assert_eq!(buf.snd_nxt(), SeqNo::from_raw(start) + 3);
        assert_eq!(buf.in_flight(), 3);
    }

    #[test]
    fn test_window_bound() {
        let mut buf = buffer(2, 10, 0);
        buf.push_chunk(Bytes::from_static(b"a"));
        assert!(buf.has_capacity());
        buf.push_chunk(Bytes::from_static(b"b"));
        assert!(!buf.has_capacity());

        buf.on_ack(SeqNo::from_raw(1), Instant::now());
        assert!(buf.has_capacity());
    }

    #[rstest]
    #[case::from_zero(0)]
    #[case::across_wrap(u32::MAX - 1)]
    fn test_cumulative_ack_advances(#[case] start: u32) {
        let mut buf = buffer(8, 10, start);
        for payload in [b"a", b"b", b"c"] {
            let seq = buf.push_chunk(Bytes::copy_from_slice(payload));
            buf.mark_sent(seq, Instant::now(), seq.to_raw() as u64);
        }

        let ack = SeqNo::from_raw(start) + 2;
        match buf.on_ack(ack, Instant::now()) {
            AckOutcome::Advanced { cancelled_timers, .. } => {
                assert_eq!(cancelled_timers.len(), 2);
            }
            other => panic!("expected Advanced, got {:?}", other),
        }
        assert_eq!(buf.snd_una(), ack);
        assert_eq!(buf.in_flight(), 1);
    }

    #[test]
    fn test_duplicate_acks_are_counted_not_acted_on() {
        let mut buf = buffer(8, 10, 5);
        buf.push_chunk(Bytes::from_static(b"a"));

        assert_eq!(buf.on_ack(SeqNo::from_raw(5), Instant::now()), AckOutcome::Duplicate);
        assert_eq!(buf.on_ack(SeqNo::from_raw(5), Instant::now()), AckOutcome::Duplicate);
        assert_eq!(buf.dup_acks(), 2);
        assert_eq!(buf.in_flight(), 1);
    }

    #[rstest]
    #[case::stale(3)]
    #[case::beyond_snd_nxt(9)]
    fn test_invalid_ack_is_ignored(#[case] ack: u32) {
        let mut buf = buffer(8, 10, 5);
        buf.push_chunk(Bytes::from_static(b"a"));

        assert_eq!(buf.on_ack(SeqNo::from_raw(ack), Instant::now()), AckOutcome::Invalid);
        assert_eq!(buf.snd_una(), SeqNo::from_raw(5));
        assert_eq!(buf.in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rtt_sample_only_for_unretransmitted_slots() {
        let mut buf = buffer(8, 10, 0);

        let s1 = buf.push_chunk(Bytes::from_static(b"a"));
        let s2 = buf.push_chunk(Bytes::from_static(b"b"));
        buf.mark_sent(s1, Instant::now(), 1);
        buf.mark_sent(s2, Instant::now(), 2);
        buf.slot_mut(s2).unwrap().retransmitted = true;

        tokio::time::advance(Duration::from_millis(40)).await;

        match buf.on_ack(SeqNo::from_raw(2), Instant::now()) {
            AckOutcome::Advanced { rtt_sample, .. } => {
                // s2 is Karn-excluded, so the sample comes from s1
                assert_eq!(rtt_sample, Some(Duration::from_millis(40)));
            }
            other => panic!("expected Advanced, got {:?}", other),
        }
    }

    #[test]
    fn test_unsent_tracks_transmission() {
        let mut buf = buffer(8, 10, 0);
        let s1 = buf.push_chunk(Bytes::from_static(b"a"));
        let s2 = buf.push_chunk(Bytes::from_static(b"b"));

        assert_eq!(buf.unsent().len(), 2);
        buf.mark_sent(s1, Instant::now(), 1);
        let unsent = buf.unsent();
        assert_eq!(unsent.len(), 1);
        assert_eq!(unsent[0].0, s2);
    }
}
