//! CAP - the Cumulative ACK Protocol: a connection-oriented, unicast, reliable
//!  message-delivery protocol layered on top of UDP.
//!
//! The application hands a whole message to the sender and the peer receives the
//!  identical byte sequence, despite datagram loss, duplication, reordering and delay.
//!  The design levers - segmentation, cumulative acknowledgment, timeout-driven
//!  retransmission, three-way handshake - are kept compact enough to study and to
//!  benchmark against alternative reliable-transmission schemes (selective ACK,
//!  erasure-coded variants).
//!
//! ## Design
//!
//! * Connection-oriented and asymmetric: one active sender, one passive receiver per
//!   connection. Three-way open (SYN / SYN_ACK / DATA_ACK), unilateral FIN close with
//!   TIME_WAIT on the active side.
//! * The abstraction is sending / receiving *messages* (defined-length chunks of data,
//!   not a byte stream). Messages are fragmented into segments of at most
//!   `payload_max` bytes, each consuming one sequence number; a final segment shorter
//!   than `payload_max` (possibly empty) marks end-of-message.
//! * Acknowledgment is strictly cumulative: an ack value `A` means every sequence
//!   number below `A` has been received in order. The receiver buffers nothing out of
//!   order - gaps are repaired exclusively by sender-side retransmission on timeout.
//! * The send window is bounded: at most `window` unacknowledged segments in flight,
//!   with per-segment retransmission timers driven by a Karn/Jacobson RTO estimate.
//! * One single-threaded event loop per connection owns all mutable state; application
//!   threads interact through a mailbox and completion signals.
//!
//! Flow control, congestion control, cryptographic protection, multicast and
//!  bidirectional payload are out of scope.
//!
//! ## Wire format
//!
//! Every CAP datagram is a 12-byte header followed by the payload, all numbers in
//!  network byte order (BE):
//!
//! ```ascii
//! 0:  4 bits segment type:
//!       0001 SYN        0010 SYN_ACK
//!       0011 DATA       0100 DATA_ACK
//!       0101 FIN        0110 FIN_ACK
//!     28 bits reserved - zero on send, ignored on receive
//! 4:  sequence number (u32)
//! 8:  acknowledgment number (u32) - meaningful for SYN_ACK, DATA_ACK and FIN_ACK,
//!     zero on the wire otherwise
//! 12: payload (up to the configured per-segment maximum, default 1024 bytes)
//! ```
//!
//! Sequence numbers wrap around, so 0 follows after FFFFFFFF; all comparisons use
//!  signed 32-bit differences.

pub mod config;
pub mod error;
pub mod segment;
pub mod seq;
pub mod socket;

mod connection;
mod isn;
mod recv_buffer;
mod rtt;
mod send_buffer;
mod timer;
mod transport;
