//! Source-side view of one target channel

use super::batch::BatchAccumulator;
use crate::handshake::ChannelState;
use std::collections::VecDeque;

/// Where the channel's next packets come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// Reading retained packets from the log, starting at `next_key`
    CatchingUp {
        /// Next key to read
        next_key: u64,
    },
    /// Caught up; new packets arrive through the accumulator
    Live,
}

/// Outbound delivery state of one channel
#[derive(Debug)]
pub(crate) struct OutboundChannel {
    pub(crate) state: ChannelState,
    pub(crate) cursor: Cursor,
    pub(crate) accumulator: BatchAccumulator,
    /// Sent, not yet confirmed: (key, weight)
    pub(crate) in_flight: VecDeque<(u64, u32)>,
    pub(crate) last_sent: u64,
    pub(crate) resync_required: bool,
    /// Blob the target reported at its last handshake
    pub(crate) consumer_state: Option<Vec<u8>>,
    /// Blob handed to the target at handshake
    pub(crate) producer_state: Option<Vec<u8>>,
    pub(crate) handshakes: u64,
}

impl OutboundChannel {
    pub(crate) fn new(accumulator: BatchAccumulator) -> Self {
        Self {
            state: ChannelState::Disconnected,
            cursor: Cursor::Live,
            accumulator,
            in_flight: VecDeque::new(),
            last_sent: 0,
            resync_required: false,
            consumer_state: None,
            producer_state: None,
            handshakes: 0,
        }
    }

    /// Restart delivery at `start_key`
    pub(crate) fn reset(&mut self, start_key: u64) {
        self.cursor = Cursor::CatchingUp {
            next_key: start_key,
        };
        self.accumulator.clear();
        self.in_flight.clear();
        self.last_sent = start_key.saturating_sub(1);
        self.resync_required = false;
    }

    /// Record a shipped batch
    pub(crate) fn record_sent(&mut self, sent: impl IntoIterator<Item = (u64, u32)>) {
        for (key, weight) in sent {
            self.in_flight.push_back((key, weight));
            self.last_sent = self.last_sent.max(key);
        }
    }

    /// Pop in-flight entries up to `key`; returns their weight
    pub(crate) fn confirm_in_flight(&mut self, key: u64) -> u64 {
        let mut weight = 0u64;
        while let Some(&(k, w)) = self.in_flight.front() {
            if k > key {
                break;
            }
            weight += w as u64;
            self.in_flight.pop_front();
        }
        weight
    }

    /// Drop accumulated and in-flight packets up to `key` (discarded)
    pub(crate) fn prune_discarded(&mut self, key: u64) {
        self.accumulator.prune_up_to(key);
        self.in_flight.retain(|(k, _)| *k > key);
        if let Cursor::CatchingUp { next_key } = self.cursor {
            if next_key <= key {
                self.cursor = Cursor::CatchingUp {
                    next_key: key + 1,
                };
            }
        }
    }
}

/// Status of one channel as reported by the backlog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStatus {
    /// Target name
    pub name: String,
    /// Lifecycle state
    pub state: ChannelState,
    /// Delivery cursor
    pub cursor: Cursor,
    /// Highest confirmed key
    pub last_confirmed_key: u64,
    /// Highest key shipped
    pub last_sent_key: u64,
    /// Packets shipped but not confirmed
    pub in_flight: usize,
    /// Packets waiting in the accumulator
    pub accumulated: usize,
    /// Weight still to be confirmed
    pub weight: u64,
    /// Packets discarded before confirmation
    pub discarded_packets_count: u64,
    /// Weight including the discarded-packet charge
    pub calculated_weight: u64,
    /// Packets were discarded under this channel; a full resync is due
    pub resync_required: bool,
    /// Key of the pending error, if any
    pub pending_error_key: Option<u64>,
    /// Completed handshakes
    pub handshakes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn channel() -> OutboundChannel {
        OutboundChannel::new(BatchAccumulator::new(10, Duration::from_secs(1)))
    }

    #[test]
    fn test_confirm_in_flight_returns_weight() {
        let mut ch = channel();
        ch.reset(5);
        ch.record_sent([(5, 2), (6, 3), (7, 4)]);
        assert_eq!(ch.last_sent, 7);
        assert_eq!(ch.confirm_in_flight(6), 5);
        assert_eq!(ch.in_flight.len(), 1);
    }

    #[test]
    fn test_prune_moves_catch_up_cursor() {
        let mut ch = channel();
        ch.reset(2);
        ch.prune_discarded(4);
        assert_eq!(ch.cursor, Cursor::CatchingUp { next_key: 5 });
    }
}
