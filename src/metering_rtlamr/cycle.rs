use log::debug;
use std::collections::{HashMap, HashSet};

use crate::models::RawReading;

/// State of the cycle currently collecting readings.
/// `pending` starts with every configured meter and only shrinks.
#[derive(Debug)]
pub struct CycleState {
    pending: HashSet<String>,
    latest: HashMap<String, RawReading>,
}

impl CycleState {
    fn new(meter_ids: &[String]) -> Self {
        return CycleState {
            pending: meter_ids.iter().cloned().collect(),
            latest: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleProgress {
    Waiting { pending: usize },
    Complete,
}

/// Waits until every configured meter reported once, keeping the last value per meter
pub struct CycleCoordinator {
    meter_ids: Vec<String>,
    state: CycleState,
    cycle: u64,
}

impl CycleCoordinator {
    pub fn new<I: IntoIterator<Item = String>>(meter_ids: I) -> Self {
        let mut meter_ids: Vec<String> = meter_ids.into_iter().collect();
        meter_ids.sort();
        meter_ids.dedup();
        let state = CycleState::new(&meter_ids);
        return CycleCoordinator { meter_ids, state, cycle: 1 };
    }

    pub fn record(&mut self, reading: RawReading) -> CycleProgress {
        if !self.meter_ids.contains(&reading.meter_id) {
            debug!("Ignoring reading of unconfigured meter {}", reading.meter_id);
            return self.progress();
        }

        if self.state.pending.remove(&reading.meter_id) {
            debug!("Cycle {}: meter {} reported, {} pending", self.cycle, reading.meter_id, self.state.pending.len());
        } else {
            debug!("Cycle {}: meter {} reported again, keeping the newer value", self.cycle, reading.meter_id);
        }
        self.state.latest.insert(reading.meter_id.clone(), reading);

        return self.progress();
    }

    pub fn progress(&self) -> CycleProgress {
        if self.state.pending.is_empty() {
            return CycleProgress::Complete;
        }
        return CycleProgress::Waiting { pending: self.state.pending.len() };
    }

    pub fn is_complete(&self) -> bool {
        return self.state.pending.is_empty();
    }

    /// Meters still missing in this cycle, sorted
    pub fn pending(&self) -> Vec<String> {
        let mut pending: Vec<String> = self.state.pending.iter().cloned().collect();
        pending.sort();
        return pending;
    }

    pub fn cycle(&self) -> u64 {
        return self.cycle;
    }

    /// Hands over the readings of the current cycle and starts a fresh one
    pub fn start_next_cycle(&mut self) -> HashMap<String, RawReading> {
        let finished = std::mem::replace(&mut self.state, CycleState::new(&self.meter_ids));
        self.cycle += 1;
        return finished.latest;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MeterProtocol;
    use chrono::Utc;

    fn reading(id: &str, value: u64) -> RawReading {
        RawReading {
            meter_id: id.to_string(),
            protocol: MeterProtocol::Scm,
            raw_value: value,
            received_at: Utc::now(),
        }
    }

    fn coordinator() -> CycleCoordinator {
        CycleCoordinator::new(vec!["7823010".to_string(), "6567984".to_string()])
    }

    #[test]
    fn test_cycle_completes_when_all_reported() {
        let mut c = coordinator();
        assert_eq!(c.record(reading("6567984", 1)), CycleProgress::Waiting { pending: 1 });
        assert_eq!(c.pending(), vec!["7823010".to_string()]);
        assert_eq!(c.record(reading("7823010", 2)), CycleProgress::Complete);

        let latest = c.start_next_cycle();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest["6567984"].raw_value, 1);
        assert_eq!(latest["7823010"].raw_value, 2);
    }

    #[test]
    fn test_duplicate_before_completion_wins() {
        let mut c = coordinator();
        c.record(reading("6567984", 1));
        assert_eq!(c.record(reading("6567984", 5)), CycleProgress::Waiting { pending: 1 });
        assert_eq!(c.record(reading("7823010", 2)), CycleProgress::Complete);
        assert_eq!(c.start_next_cycle()["6567984"].raw_value, 5);
    }

    #[test]
    fn test_duplicate_after_completion_goes_to_next_cycle() {
        let mut c = coordinator();
        c.record(reading("6567984", 1));
        assert_eq!(c.record(reading("7823010", 2)), CycleProgress::Complete);
        let first = c.start_next_cycle();
        assert_eq!(first["6567984"].raw_value, 1);

        assert_eq!(c.cycle(), 2);
        assert_eq!(c.record(reading("6567984", 3)), CycleProgress::Waiting { pending: 1 });
        assert!(!c.is_complete());
    }

    #[test]
    fn test_unknown_meter_does_not_touch_pending() {
        let mut c = coordinator();
        assert_eq!(c.record(reading("1", 1)), CycleProgress::Waiting { pending: 2 });
        assert!(c.start_next_cycle().is_empty());
    }

    #[test]
    fn test_partial_cycle_hand_over() {
        let mut c = coordinator();
        c.record(reading("7823010", 9));
        let partial = c.start_next_cycle();
        assert_eq!(partial.len(), 1);
        assert_eq!(c.pending().len(), 2);
    }
}
