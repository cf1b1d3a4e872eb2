use std::fmt::{Display, Formatter};

/// A packet sequence number as carried on the wire: unsigned 32 bit,
/// monotonically increasing per (peer, session), wrapping modulo 2^32.
///
/// There is no total order on sequence numbers - ordering is only meaningful
/// between numbers less than half the sequence space apart, via [`Seq::diff`].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Seq(u32);

impl Display for Seq {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Seq {
    pub const ZERO: Seq = Seq(0);

    pub const fn from_raw(value: u32) -> Seq {
        Seq(value)
    }

    pub const fn to_raw(self) -> u32 {
        self.0
    }

    pub fn next(self) -> Seq {
        Seq(self.0.wrapping_add(1))
    }

    /// Signed distance from `other` to `self`.
    ///
    /// Positive means `self` is ahead of `other`. The result is meaningful
    /// while the two numbers are less than 2^31 apart; the transport's
    /// out-of-window guard keeps live state well inside that bound.
    pub fn diff(self, other: Seq) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }
}

/// An inclusive range of sequence numbers, as carried in NAK bodies and
/// `Loss` events.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct SeqRange {
    pub from: Seq,
    pub to: Seq,
}

impl Display for SeqRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..={}", self.from, self.to)
    }
}

impl SeqRange {
    pub fn single(seq: Seq) -> SeqRange {
        SeqRange { from: seq, to: seq }
    }

    /// Number of sequence numbers covered, valid for ranges shorter than half
    /// the sequence space.
    pub fn len(&self) -> u32 {
        (self.to.diff(self.from) as u32).wrapping_add(1)
    }

    pub fn contains(&self, seq: Seq) -> bool {
        let offset = seq.diff(self.from);
        offset >= 0 && offset <= self.to.diff(self.from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(5, 3, 2)]
    #[case(3, 5, -2)]
    #[case(7, 7, 0)]
    #[case(2, 0xffff_fffe, 4)] // forward across the wrap
    #[case(0xffff_fffe, 2, -4)] // backward across the wrap
    #[case(0, u32::MAX, 1)]
    fn test_diff(#[case] a: u32, #[case] b: u32, #[case] expected: i32) {
        assert_eq!(Seq::from_raw(a).diff(Seq::from_raw(b)), expected);
    }

    #[test]
    fn test_next_wraps() {
        assert_eq!(Seq::from_raw(u32::MAX).next(), Seq::ZERO);
    }

    #[rstest]
    #[case(3, 7, 5)]
    #[case(3, 3, 3)]
    #[case(0xffff_fffe, 1, 0xffff_ffff)] // range across the wrap
    fn test_range_contains(#[case] from: u32, #[case] to: u32, #[case] inside: u32) {
        let range = SeqRange { from: Seq::from_raw(from), to: Seq::from_raw(to) };
        assert!(range.contains(Seq::from_raw(inside)));
    }

    #[rstest]
    #[case(3, 7, 2)]
    #[case(3, 7, 8)]
    #[case(0xffff_fffe, 1, 2)]
    fn test_range_does_not_contain(#[case] from: u32, #[case] to: u32, #[case] outside: u32) {
        let range = SeqRange { from: Seq::from_raw(from), to: Seq::from_raw(to) };
        assert!(!range.contains(Seq::from_raw(outside)));
    }

    #[rstest]
    #[case(3, 3, 1)]
    #[case(3, 7, 5)]
    #[case(0xffff_fffe, 1, 4)]
    fn test_range_len(#[case] from: u32, #[case] to: u32, #[case] expected: u32) {
        let range = SeqRange { from: Seq::from_raw(from), to: Seq::from_raw(to) };
        assert_eq!(range.len(), expected);
    }
}
