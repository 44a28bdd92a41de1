//! Transmit sequencing.

use sid_wire::beacon::TxIdFormat;
use sid_wire::MAX_LL_SEQN;

/// Largest send counter value
pub const MAX_COUNTER_VALUE: u32 = 0x7FFF_FFFF;

/// Sequence values stamped on one outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxSequence {
    /// Link sequence
    pub ll_seqn: u32,
    /// Send counter
    pub counter: u32,
}

/// Per-link transmit counters
#[derive(Debug, Clone)]
pub struct TxSequencer {
    format: TxIdFormat,
    ll_seqn: u32,
    counter: u32,
}

impl TxSequencer {
    /// Start both counters at zero
    pub fn new(format: TxIdFormat) -> Self {
        Self::with_start(format, 0, 0)
    }

    /// Start from explicit values, e.g. restored ones
    pub fn with_start(format: TxIdFormat, ll_seqn: u32, counter: u32) -> Self {
        Self {
            format,
            ll_seqn: ll_seqn & MAX_LL_SEQN,
            counter: counter & MAX_COUNTER_VALUE,
        }
    }

    /// Current link sequence
    pub fn ll_seqn(&self) -> u32 {
        self.ll_seqn
    }

    /// Current send counter
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Format that selects which counter advances
    pub fn format(&self) -> TxIdFormat {
        self.format
    }

    /// Hand out the current values and advance the counter the format selects
    pub fn next(&mut self) -> TxSequence {
        let seq = TxSequence {
            ll_seqn: self.ll_seqn,
            counter: self.counter,
        };

        match self.format {
            TxIdFormat::Counter => {
                self.counter = if self.counter >= MAX_COUNTER_VALUE {
                    0
                } else {
                    self.counter + 1
                };
            }
            TxIdFormat::TimeSync | TxIdFormat::Smsn => {
                self.ll_seqn = if self.ll_seqn >= MAX_LL_SEQN {
                    0
                } else {
                    self.ll_seqn + 1
                };
            }
        }

        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ll_seqn_wraps_after_full_cycle() {
        let mut seq = TxSequencer::new(TxIdFormat::TimeSync);
        assert_eq!(seq.ll_seqn(), 0);

        for _ in 0..=MAX_LL_SEQN {
            seq.next();
        }
        assert_eq!(seq.ll_seqn(), 0);
        assert_eq!(seq.counter(), 0);
    }

    #[test]
    fn test_counter_wraps_at_max() {
        let mut seq = TxSequencer::with_start(TxIdFormat::Counter, 5, MAX_COUNTER_VALUE - 1);

        assert_eq!(seq.next().counter, MAX_COUNTER_VALUE - 1);
        assert_eq!(seq.next().counter, MAX_COUNTER_VALUE);
        assert_eq!(seq.next().counter, 0);
        assert_eq!(seq.ll_seqn(), 5);
    }

    #[test]
    fn test_values_are_handed_out_before_advancing() {
        let mut seq = TxSequencer::new(TxIdFormat::Smsn);
        let first = seq.next();
        let second = seq.next();
        assert_eq!(first, TxSequence { ll_seqn: 0, counter: 0 });
        assert_eq!(second, TxSequence { ll_seqn: 1, counter: 0 });
    }
}
