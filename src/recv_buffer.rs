use crate::seq::SeqNo;
use std::collections::VecDeque;
use tracing::debug;

/// How an inbound DATA segment was handled. Every one of these outcomes elicits a
///  cumulative acknowledgment - the receiver acknowledges `rcv_nxt` unconditionally, so
///  lost acknowledgments are repaired by the sender's retransmissions.
#[derive(Debug, PartialEq, Eq)]
pub enum DataOutcome {
    /// the segment was the next expected one and its payload was appended
    Accepted { message_complete: bool },
    /// `seq < rcv_nxt` - already delivered, payload dropped
    Duplicate,
    /// `seq > rcv_nxt` - the receiver only accepts in order, payload dropped
    OutOfOrder,
}

/// In-order reassembly of messages on the receiving side.
///
/// Payload bytes are appended to the current message as consecutive DATA segments
///  arrive; a segment shorter than `payload_max` (the empty segment included) closes the
///  message and queues it for `recv`. There is no out-of-order buffering - anything but
///  the next expected sequence number is dropped and repaired by retransmission.
pub struct ReceiveBuffer {
    rcv_nxt: SeqNo,
    current: Vec<u8>,
    completed: VecDeque<Vec<u8>>,
    payload_max: usize,
    eof: bool,
}

impl ReceiveBuffer {
    pub fn new(payload_max: usize) -> ReceiveBuffer {
        ReceiveBuffer {
            rcv_nxt: SeqNo::ZERO,
            current: Vec::new(),
            completed: VecDeque::new(),
            payload_max,
            eof: false,
        }
    }

    /// Called when the handshake fixes the peer's first data sequence number
    ///  (`iss_peer + 1`).
    pub fn init(&mut self, rcv_nxt: SeqNo) {
        self.rcv_nxt = rcv_nxt;
    }

    /// The cumulative acknowledgment value: all sequence numbers strictly below it have
    ///  been received in order. Successive values are monotonically non-decreasing.
    pub fn ack_value(&self) -> SeqNo {
        self.rcv_nxt
    }

    pub fn on_data(&mut self, seq: SeqNo, payload: &[u8]) -> DataOutcome {
        if seq == self.rcv_nxt {
            self.current.extend_from_slice(payload);
            self.rcv_nxt = self.rcv_nxt.next();

            let message_complete = payload.len() < self.payload_max;
            if message_complete {
                self.completed.push_back(std::mem::take(&mut self.current));
            }
            DataOutcome::Accepted { message_complete }
        }
        else if seq.is_before(self.rcv_nxt) {
            debug!("duplicate DATA {:?} below rcv_nxt {:?} - dropping payload", seq, self.rcv_nxt);
            DataOutcome::Duplicate
        }
        else {
            debug!("out-of-order DATA {:?} ahead of rcv_nxt {:?} - dropping payload", seq, self.rcv_nxt);
            DataOutcome::OutOfOrder
        }
    }

    /// A FIN with the next expected sequence number consumes it and marks end-of-stream.
    pub fn on_fin(&mut self, seq: SeqNo) -> bool {
        if seq != self.rcv_nxt {
            return false;
        }
        self.rcv_nxt = self.rcv_nxt.next();
        self.eof = true;
        true
    }

    pub fn pop_message(&mut self) -> Option<Vec<u8>> {
        self.completed.pop_front()
    }

    pub fn has_message(&self) -> bool {
        !self.completed.is_empty()
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }
}
