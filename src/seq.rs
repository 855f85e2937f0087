use std::fmt::{Debug, Formatter};
use std::ops::Add;

/// A 32-bit sequence number with wrap-around semantics.
///
/// Sequence numbers live on a circle: 0 follows after `u32::MAX`. Ordering between two
///  sequence numbers is therefore not total but relative, based on the signed distance
///  between them - `a` precedes `b` iff `(a - b) as i32` is negative. This works as long
///  as compared numbers are less than 2^31 apart, which the bounded send window
///  guarantees by a wide margin.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct SeqNo(u32);

impl SeqNo {
    pub const ZERO: SeqNo = SeqNo(0);

    pub fn from_raw(raw: u32) -> SeqNo {
        SeqNo(raw)
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    pub fn next(self) -> SeqNo {
        SeqNo(self.0.wrapping_add(1))
    }

    /// wrap-aware 'strictly precedes'
    pub fn is_before(self, other: SeqNo) -> bool {
        (self.0.wrapping_sub(other.0) as i32) < 0
    }

    /// wrap-aware 'strictly follows'
    pub fn is_after(self, other: SeqNo) -> bool {
        other.is_before(self)
    }

    /// the number of steps from `from` up to self, assuming self does not precede `from`
    pub fn distance_from(self, from: SeqNo) -> u32 {
        self.0.wrapping_sub(from.0)
    }
}

impl Add<u32> for SeqNo {
    type Output = SeqNo;

    fn add(self, rhs: u32) -> SeqNo {
        SeqNo(self.0.wrapping_add(rhs))
    }
}

impl Debug for SeqNo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::adjacent(0, 1, true)]
    #[case::same(7, 7, false)]
    #[case::reversed(1, 0, false)]
    #[case::far(0, 0x7fff_ffff, true)]
    #[case::wrap_boundary(u32::MAX, 0, true)]
    #[case::wrap_boundary_reversed(0, u32::MAX, false)]
    #[case::wrap_window(u32::MAX - 2, 5, true)]
    #[case::wrap_window_reversed(5, u32::MAX - 2, false)]
    fn test_is_before(#[case] a: u32, #[case] b: u32, #[case] expected: bool) {
        assert_eq!(SeqNo::from_raw(a).is_before(SeqNo::from_raw(b)), expected);
        if a != b {
            assert_eq!(SeqNo::from_raw(b).is_after(SeqNo::from_raw(a)), expected);
        }
    }

    #[rstest]
    #[case::zero(0, 0, 0)]
    #[case::regular(3, 10, 7)]
    #[case::wrapping(u32::MAX - 1, 3, 5)]
    fn test_distance_from(#[case] from: u32, #[case] to: u32, #[case] expected: u32) {
        assert_eq!(SeqNo::from_raw(to).distance_from(SeqNo::from_raw(from)), expected);
    }

    #[rstest]
    #[case::regular(5, 1, 6)]
    #[case::wrap(u32::MAX, 1, 0)]
    #[case::wrap_further(u32::MAX - 1, 4, 2)]
    fn test_add(#[case] base: u32, #[case] offset: u32, #[case] expected: u32) {
        assert_eq!(SeqNo::from_raw(base) + offset, SeqNo::from_raw(expected));
    }

    #[test]
    fn test_next_wraps() {
        assert_eq!(SeqNo::from_raw(u32::MAX).next(), SeqNo::ZERO);
    }
}
