//! Calculated channel weight
//!
//! A channel's raw weight is the sum of packet weights it still has to
//! confirm. Packets force-discarded under the discard-oldest policy are gone
//! from the log but still represent lost work for that channel, so they are
//! charged at a fixed per-packet factor:
//!
//! ```text
//! calculated = raw + discarded_packets * discarded_packet_weight
//! ```

/// Combine raw weight and discarded-packet count into a single figure
///
/// Saturates instead of wrapping.
pub fn calculated_weight(raw_weight: u64, discarded_packets: u64, discarded_packet_weight: u64) -> u64 {
    raw_weight.saturating_add(discarded_packets.saturating_mul(discarded_packet_weight))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_discards_is_raw_weight() {
        assert_eq!(calculated_weight(42, 0, 10), 42);
    }

    #[test]
    fn test_discards_are_charged_per_packet() {
        assert_eq!(calculated_weight(6, 3, 1), 9);
        assert_eq!(calculated_weight(0, 4, 5), 20);
    }

    #[test]
    fn test_zero_factor_ignores_discards() {
        assert_eq!(calculated_weight(7, 1_000, 0), 7);
    }

    #[test]
    fn test_saturates() {
        assert_eq!(calculated_weight(u64::MAX - 1, 2, u64::MAX), u64::MAX);
    }
}
