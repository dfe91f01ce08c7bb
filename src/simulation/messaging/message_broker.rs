use std::collections::BinaryHeap;

use nohash_hasher::IntSet;
use tracing::{trace, warn};

use crate::simulation::messaging::messages::BorderTraffic;

/// Caches the border traffic received from fellows until the records of all connected fellows
/// for a step are present. Fellows may run ahead, so records of later steps wait in the cache.
#[derive(Debug)]
pub struct BorderTrafficBroker {
    rank: u32,
    run: u64,
    fellows: IntSet<u32>,
    cache: BinaryHeap<BorderTraffic>,
}

impl BorderTrafficBroker {
    pub fn new(rank: u32, run: u64, fellows: impl IntoIterator<Item = u32>) -> Self {
        BorderTrafficBroker {
            rank,
            run,
            fellows: fellows.into_iter().collect(),
            cache: BinaryHeap::new(),
        }
    }

    pub fn run(&self) -> u64 {
        self.run
    }

    /// Drops everything cached and only accepts records of `run` from now on.
    pub fn reset(&mut self, run: u64) {
        self.run = run;
        self.cache.clear();
    }

    /// Caches a record. Records of other runs and from workers which are not fellows are dropped.
    pub fn add(&mut self, record: BorderTraffic) -> bool {
        if record.run != self.run {
            warn!(
                "Worker #{}: dropping border traffic of run {} from #{} while in run {}",
                self.rank, record.run, record.sender, self.run
            );
            return false;
        }
        if !self.fellows.contains(&record.sender) {
            warn!(
                "Worker #{}: dropping border traffic from #{}, which is not a fellow",
                self.rank, record.sender
            );
            return false;
        }
        trace!(
            "Worker #{}: cached border traffic of step {} from #{}",
            self.rank,
            record.step,
            record.sender
        );
        self.cache.push(record);
        true
    }

    /// Whether all connected fellows sent their records for `step`.
    fn is_complete(&self, step: u64) -> bool {
        let senders: IntSet<u32> = self
            .cache
            .iter()
            .filter(|r| r.step == step)
            .map(|r| r.sender)
            .collect();
        self.fellows.iter().all(|f| senders.contains(f))
    }

    /// Senders whose records for `step` are present.
    pub fn received_from(&self, step: u64) -> Vec<u32> {
        let mut senders: Vec<u32> = self
            .cache
            .iter()
            .filter(|r| r.step == step)
            .map(|r| r.sender)
            .collect();
        senders.sort_unstable();
        senders.dedup();
        senders
    }

    /// Returns the records of `step` ordered by sender once all fellows sent theirs. Left over
    /// records of earlier steps are discarded.
    pub fn take_step(&mut self, step: u64) -> Option<Vec<BorderTraffic>> {
        if !self.is_complete(step) {
            return None;
        }
        let mut records = Vec::with_capacity(self.fellows.len());
        while self.cache.peek().is_some_and(|r| r.step <= step) {
            let Some(record) = self.cache.pop() else {
                break;
            };
            if record.step < step {
                warn!(
                    "Worker #{}: discarding stale border traffic of step {} from #{}",
                    self.rank, record.step, record.sender
                );
                continue;
            }
            records.push(record);
        }
        Some(records)
    }
}

#[cfg(test)]
mod tests {
    use crate::simulation::messaging::message_broker::BorderTrafficBroker;
    use crate::simulation::messaging::messages::BorderTraffic;

    #[test]
    fn waits_for_all_fellows() {
        let mut broker = BorderTrafficBroker::new(0, 1, [1, 2]);
        assert!(broker.add(BorderTraffic::new(1, 0, 2, 0)));
        assert_eq!(None, broker.take_step(0));
        assert_eq!(vec![2], broker.received_from(0));

        assert!(broker.add(BorderTraffic::new(1, 0, 1, 0)));
        let records = broker.take_step(0).unwrap();
        let senders: Vec<u32> = records.iter().map(|r| r.sender).collect();
        assert_eq!(vec![1, 2], senders);
        assert!(!broker.is_complete(0));
    }

    #[test]
    fn keeps_records_of_later_steps() {
        let mut broker = BorderTrafficBroker::new(0, 1, [1]);
        broker.add(BorderTraffic::new(1, 2, 1, 0));
        broker.add(BorderTraffic::new(1, 1, 1, 0));

        assert_eq!(1, broker.take_step(1).unwrap()[0].step);
        assert_eq!(None, broker.take_step(3));
        assert_eq!(2, broker.take_step(2).unwrap()[0].step);
    }

    #[test]
    fn drops_foreign_records() {
        let mut broker = BorderTrafficBroker::new(0, 2, [1]);
        assert!(!broker.add(BorderTraffic::new(1, 0, 1, 0)));
        assert!(!broker.add(BorderTraffic::new(2, 0, 5, 0)));
        assert!(!broker.is_complete(0));

        broker.add(BorderTraffic::new(2, 0, 1, 0));
        broker.reset(3);
        assert_eq!(3, broker.run());
        assert!(!broker.is_complete(0));
    }

    #[test]
    fn no_fellows_is_always_complete() {
        let mut broker = BorderTrafficBroker::new(0, 1, Vec::new());
        assert_eq!(Some(vec![]), broker.take_step(5));
    }
}
