//! Per-pair ordering of avatar updates
//!
//! Each sender stamps its updates with a 16-bit sequence number that wraps.
//! For every (receiver, sender) pair the mixer remembers the last sequence it
//! forwarded, and compares it with the sender's latest to decide whether
//! there is anything new to send.
//!
//! All arithmetic is modular: 65535 -> 0 is a single step forward.

/// Sequence number of an avatar update
pub type SequenceNumber = u16;

/// Last-sent value that never flags an out-of-order anomaly
pub const SEQUENCE_SENTINEL_MAX: SequenceNumber = SequenceNumber::MAX;

/// Outcome of comparing what a receiver has with what a sender produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceClass {
    /// Receiver already has this exact update; send nothing
    HeldBack,
    /// Send, but at least one intermediate update never reached the receiver
    Gap,
    /// Send
    Normal,
}

impl SequenceClass {
    #[inline]
    pub fn should_send(&self) -> bool {
        !matches!(self, SequenceClass::HeldBack)
    }
}

/// Full classification of one pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceDecision {
    pub class: SequenceClass,
    /// Receiver was sent a sequence that is numerically ahead of the sender's
    /// latest. Diagnostic only.
    pub out_of_order: bool,
}

/// Number of steps from `from` forward to `to`, modulo 2^16
#[inline]
pub fn sequence_distance(from: SequenceNumber, to: SequenceNumber) -> u16 {
    to.wrapping_sub(from)
}

/// True if `a` is newer than `b` within half the sequence space
#[inline]
pub fn sequence_newer(a: SequenceNumber, b: SequenceNumber) -> bool {
    let d = sequence_distance(b, a);
    d != 0 && d < 0x8000
}

/// Classify the pair (`last_sent_to_receiver`, `last_produced_by_sender`).
pub fn classify(
    last_sent_to_receiver: SequenceNumber,
    last_produced_by_sender: SequenceNumber,
) -> SequenceDecision {
    let out_of_order = last_sent_to_receiver > last_produced_by_sender
        && last_sent_to_receiver != SEQUENCE_SENTINEL_MAX;

    let class = if last_sent_to_receiver == last_produced_by_sender && last_sent_to_receiver != 0 {
        SequenceClass::HeldBack
    } else if sequence_distance(last_sent_to_receiver, last_produced_by_sender) > 1 {
        SequenceClass::Gap
    } else {
        SequenceClass::Normal
    };

    SequenceDecision { class, out_of_order }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_held_back_when_nothing_new() {
        let d = classify(5, 5);
        assert_eq!(d.class, SequenceClass::HeldBack);
        assert!(!d.class.should_send());
        assert!(!d.out_of_order);
    }

    #[test]
    fn test_zero_is_never_held_back() {
        // A fresh pair starts at 0 on both sides and must still send
        assert_eq!(classify(0, 0).class, SequenceClass::Normal);
    }

    #[test]
    fn test_next_is_normal() {
        assert_eq!(classify(5, 6).class, SequenceClass::Normal);
    }

    #[test]
    fn test_jump_is_gap() {
        let d = classify(5, 8);
        assert_eq!(d.class, SequenceClass::Gap);
        assert!(d.class.should_send());
        assert!(!d.out_of_order);
    }

    #[test]
    fn test_wrap_boundary_is_one_step() {
        let d = classify(65535, 0);
        assert_eq!(d.class, SequenceClass::Normal);
        // The sentinel never flags out-of-order
        assert!(!d.out_of_order);
    }

    #[test]
    fn test_gap_across_wrap() {
        assert_eq!(classify(65534, 1).class, SequenceClass::Gap);
        assert_eq!(sequence_distance(65534, 1), 3);
    }

    #[test]
    fn test_backwards_is_out_of_order() {
        let d = classify(10, 7);
        assert!(d.out_of_order);
        // Modular distance 7 - 10 is huge, so it is still sent as a gap
        assert_eq!(d.class, SequenceClass::Gap);
    }

    #[test]
    fn test_max_equal_is_held_back() {
        assert_eq!(classify(65535, 65535).class, SequenceClass::HeldBack);
    }

    #[test]
    fn test_sequence_newer() {
        assert!(sequence_newer(6, 5));
        assert!(sequence_newer(0, 65535));
        assert!(!sequence_newer(5, 6));
        assert!(!sequence_newer(5, 5));
        assert!(!sequence_newer(65535, 0));
    }
}
