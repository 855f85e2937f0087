use crate::error::CapError;
use crate::seq::SeqNo;
use bytes::{BufMut, Bytes};
use std::fmt::{Debug, Formatter};

/// Fixed header size of every CAP segment: one 32-bit word holding the segment type in
///  its high nibble (the remaining 28 bits are reserved, zero on send and ignored on
///  receive), followed by `seq` and `ack` as u32 in network byte order.
pub const HEADER_LEN: usize = 12;

#[derive(Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum SegmentKind {
    Syn = 1,
    SynAck = 2,
    Data = 3,
    DataAck = 4,
    Fin = 5,
    FinAck = 6,
}

impl SegmentKind {
    fn from_nibble(nibble: u8) -> Option<SegmentKind> {
        match nibble {
            1 => Some(SegmentKind::Syn),
            2 => Some(SegmentKind::SynAck),
            3 => Some(SegmentKind::Data),
            4 => Some(SegmentKind::DataAck),
            5 => Some(SegmentKind::Fin),
            6 => Some(SegmentKind::FinAck),
            _ => None,
        }
    }

    /// Only SYN_ACK, DATA_ACK and FIN_ACK carry a meaningful `ack` field - all other
    ///  kinds write zero on the wire.
    pub fn carries_ack(self) -> bool {
        matches!(self, SegmentKind::SynAck | SegmentKind::DataAck | SegmentKind::FinAck)
    }
}

impl Debug for SegmentKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SegmentKind::Syn => "SYN",
            SegmentKind::SynAck => "SYN_ACK",
            SegmentKind::Data => "DATA",
            SegmentKind::DataAck => "DATA_ACK",
            SegmentKind::Fin => "FIN",
            SegmentKind::FinAck => "FIN_ACK",
        };
        write!(f, "{}", s)
    }
}

/// The CAP protocol data unit carried in one datagram. Only DATA (and in a symmetric
///  extension DATA_ACK) segments carry a non-empty payload.
#[derive(Clone, Eq, PartialEq)]
pub struct Segment {
    pub kind: SegmentKind,
    pub seq: SeqNo,
    pub ack: SeqNo,
    pub payload: Bytes,
}

impl Segment {
    pub fn syn(seq: SeqNo) -> Segment {
        Segment { kind: SegmentKind::Syn, seq, ack: SeqNo::ZERO, payload: Bytes::new() }
    }

    pub fn syn_ack(seq: SeqNo, ack: SeqNo) -> Segment {
        Segment { kind: SegmentKind::SynAck, seq, ack, payload: Bytes::new() }
    }

    pub fn data(seq: SeqNo, payload: Bytes) -> Segment {
        Segment { kind: SegmentKind::Data, seq, ack: SeqNo::ZERO, payload }
    }

    /// a pure acknowledgment - in unidirectional CAP the receiver has no outbound data
    ///  to piggyback on, so the payload is always empty
    pub fn data_ack(ack: SeqNo) -> Segment {
        Segment { kind: SegmentKind::DataAck, seq: SeqNo::ZERO, ack, payload: Bytes::new() }
    }

    pub fn fin(seq: SeqNo) -> Segment {
        Segment { kind: SegmentKind::Fin, seq, ack: SeqNo::ZERO, payload: Bytes::new() }
    }

    pub fn fin_ack(ack: SeqNo) -> Segment {
        Segment { kind: SegmentKind::FinAck, seq: SeqNo::ZERO, ack, payload: Bytes::new() }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32((self.kind as u32) << 28);
        buf.put_u32(self.seq.to_raw());
        buf.put_u32(self.ack.to_raw());
        buf.put_slice(&self.payload);
    }

    pub fn deser(buf: &[u8]) -> Result<Segment, CapError> {
        if buf.len() < HEADER_LEN {
            return Err(CapError::MalformedSegment("datagram shorter than the fixed header"));
        }

        let first_word = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let kind = SegmentKind::from_nibble((first_word >> 28) as u8)
            .ok_or(CapError::MalformedSegment("unknown segment type"))?;

        let seq = SeqNo::from_raw(u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]));
        let ack = SeqNo::from_raw(u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]));

        Ok(Segment {
            kind,
            seq,
            ack,
            payload: Bytes::copy_from_slice(&buf[HEADER_LEN..]),
        })
    }
}

impl Debug for Segment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.kind.carries_ack() {
            write!(f, "{:?}(seq={:?},ack={:?})", self.kind, self.seq, self.ack)?;
        }
        else {
            write!(f, "{:?}(seq={:?})", self.kind, self.seq)?;
        }
        if !self.payload.is_empty() {
            write!(f, "[{}b]", self.payload.len())?;
        }
        Ok(())
    }
}
