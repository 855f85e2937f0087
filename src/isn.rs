use crate::seq::SeqNo;
use rand::RngCore;

/// A uniformly distributed initial sequence number.
///
/// Randomizing the ISN keeps segments of an earlier incarnation of a connection from
///  being mistaken for segments of the current one.
pub fn random_isn() -> SeqNo {
    SeqNo::from_raw(rand::rng().next_u32())
}
