//! Failure detection for the ring neighbor.
//!
//! Every heartbeat interval the server pings its neighbor and records the outcome here.
//! The neighbor is reported failed after a number of consecutive missed pings.

use protocol::NodeAddress;

#[derive(Debug)]
pub struct Detector {
    threshold: u32,
    missed: u32,
    target: Option<NodeAddress>,
}

impl Detector {
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            missed: 0,
            target: None,
        }
    }

    /// Consecutive misses of the current target
    #[must_use]
    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// Record one ping to `neighbor`. Returns the neighbor when it has just crossed the
    /// threshold, which happens once per failure. A different neighbor starts from zero.
    pub fn record(&mut self, neighbor: &NodeAddress, alive: bool) -> Option<NodeAddress> {
        if self.target.as_ref() != Some(neighbor) {
            self.target = Some(neighbor.clone());
            self.missed = 0;
        }
        if alive {
            self.missed = 0;
            return None;
        }

        self.missed += 1;
        if self.missed < self.threshold {
            return None;
        }
        self.missed = 0;
        self.target.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(n: u8) -> NodeAddress {
        NodeAddress::new(format!("10.0.0.{n}"), 10001)
    }

    #[test]
    fn reports_after_threshold_misses() {
        let mut detector = Detector::new(5);
        for _ in 0..4 {
            assert_eq!(detector.record(&address(2), false), None);
        }
        assert_eq!(detector.missed(), 4);
        assert_eq!(detector.record(&address(2), false), Some(address(2)));
        assert_eq!(detector.missed(), 0);
    }

    #[test]
    fn successful_ping_resets_count() {
        let mut detector = Detector::new(5);
        for _ in 0..4 {
            detector.record(&address(2), false);
        }
        assert_eq!(detector.record(&address(2), true), None);
        for _ in 0..4 {
            assert_eq!(detector.record(&address(2), false), None);
        }
    }

    #[test]
    fn new_neighbor_starts_from_zero() {
        let mut detector = Detector::new(3);
        detector.record(&address(2), false);
        detector.record(&address(2), false);
        assert_eq!(detector.record(&address(3), false), None);
        assert_eq!(detector.missed(), 1);
    }

    #[test]
    fn count_restarts_after_report() {
        let mut detector = Detector::new(2);
        let reports = (0..5)
            .filter_map(|_| detector.record(&address(2), false))
            .count();
        // A neighbor that stays in place after a report needs a full new run of misses
        assert_eq!(reports, 2);
        assert_eq!(detector.missed(), 1);
    }
}
