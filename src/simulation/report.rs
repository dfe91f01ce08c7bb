use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::simulation::id::Id;
use crate::simulation::network::road_network::Edge;
use crate::simulation::traffic::lights::Phase;
use crate::simulation::traffic::{TrafficStats, VehicleCounts};
use crate::simulation::vehicles::{DriverKind, Vehicle, VehicleType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleSnapshot {
    pub id: Id<Vehicle>,
    pub vehicle_type: VehicleType,
    pub driver: DriverKind,
    pub edge: Id<Edge>,
    pub lane_index: u32,
    pub head_position: f64,
    pub speed: f64,
    pub acceleration: f64,
    pub remaining_legs: usize,
    pub active: bool,
    pub foreground: bool,
}

impl VehicleSnapshot {
    pub fn new(vehicle: &Vehicle, lane_index: u32) -> Self {
        VehicleSnapshot {
            id: vehicle.id,
            vehicle_type: vehicle.vehicle_type,
            driver: vehicle.profile.kind,
            edge: vehicle.current_edge(),
            lane_index,
            head_position: vehicle.head_position,
            speed: vehicle.speed,
            acceleration: vehicle.acceleration,
            remaining_legs: vehicle.remaining_legs(),
            active: vehicle.active,
            foreground: vehicle.foreground,
        }
    }
}

/// Route of a newly created vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSummary {
    pub id: Id<Vehicle>,
    pub vehicle_type: VehicleType,
    pub edges: Vec<Id<Edge>>,
    pub external: bool,
    pub foreground: bool,
}

impl From<&Vehicle> for RouteSummary {
    fn from(vehicle: &Vehicle) -> Self {
        RouteSummary {
            id: vehicle.id,
            vehicle_type: vehicle.vehicle_type,
            edges: vehicle.route.iter().map(|l| l.edge).collect(),
            external: vehicle.external,
            foreground: vehicle.foreground,
        }
    }
}

/// Travel time of a vehicle which reached its destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TravelTime {
    pub id: Id<Vehicle>,
    pub vehicle_type: VehicleType,
    pub departure: f64,
    pub seconds: f64,
    pub num_reroutes: u32,
}

impl From<&Vehicle> for TravelTime {
    fn from(vehicle: &Vehicle) -> Self {
        TravelTime {
            id: vehicle.id,
            vehicle_type: vehicle.vehicle_type,
            departure: vehicle.route_start_time,
            seconds: vehicle.travel_time,
            num_reroutes: vehicle.num_reroutes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightSnapshot {
    pub group: u64,
    pub nodes: Vec<u64>,
    pub active_street: String,
    pub phase: Phase,
}

/// What one worker reports after simulating a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficReport {
    pub worker: u32,
    pub run: u64,
    pub step: u64,
    pub time: f64,
    /// Random vehicles per category currently on the worker.
    pub counts: VehicleCounts,
    pub active: u64,
    pub parked: u64,
    pub stats: TrafficStats,
    pub new_routes: Vec<RouteSummary>,
    pub travel_times: Vec<TravelTime>,
    /// Only filled in steps which are a multiple of the report interval.
    pub vehicles: Vec<VehicleSnapshot>,
    pub lights: Vec<LightSnapshot>,
}

/// Reports of all workers for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub run: u64,
    pub step: u64,
    /// Ordered by worker rank.
    pub workers: Vec<TrafficReport>,
}

impl StepReport {
    pub fn new(run: u64, step: u64, mut workers: Vec<TrafficReport>) -> Self {
        workers.sort_by_key(|r| r.worker);
        StepReport { run, step, workers }
    }

    pub fn counts(&self) -> VehicleCounts {
        let mut counts = VehicleCounts::default();
        for report in &self.workers {
            counts.add(&report.counts);
        }
        counts
    }

    pub fn stats(&self) -> TrafficStats {
        let mut stats = TrafficStats::default();
        for report in &self.workers {
            stats.add(&report.stats);
        }
        stats
    }

    pub fn active(&self) -> u64 {
        self.workers.iter().map(|r| r.active).sum()
    }

    pub fn parked(&self) -> u64 {
        self.workers.iter().map(|r| r.parked).sum()
    }

    pub fn summary(&self) -> RunSummary {
        let stats = self.stats();
        RunSummary {
            run: self.run,
            steps: self.step + 1,
            created: stats.created,
            completed: stats.completed,
            removed: stats.removed,
            active: self.active(),
            parked: self.parked(),
            in_transit: stats.sent.saturating_sub(stats.received),
        }
    }
}

/// Vehicle bookkeeping of a run. Every created vehicle is active, parked, completed, removed or
/// on its way to a fellow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run: u64,
    pub steps: u64,
    pub created: u64,
    pub completed: u64,
    pub removed: u64,
    pub active: u64,
    pub parked: u64,
    pub in_transit: u64,
}

impl RunSummary {
    pub fn is_conserved(&self) -> bool {
        self.created == self.active + self.parked + self.completed + self.removed + self.in_transit
    }

    /// Checks the conservation of vehicles and logs a warning if it is violated.
    pub fn check(&self) -> bool {
        let conserved = self.is_conserved();
        if !conserved {
            warn!("Vehicle conservation violated: {self:?}");
        }
        conserved
    }
}

/// Receives the reports of every step in step order. Formatting and persisting them is up to the
/// implementation.
pub trait ReportSink: Send {
    fn publish(&mut self, report: &StepReport);
}

/// Keeps all reports in memory. Clones share the same storage, so one clone can be handed to the
/// controller and another one kept for reading.
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    reports: Arc<Mutex<Vec<StepReport>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        CollectingSink::default()
    }

    pub fn reports(&self) -> Vec<StepReport> {
        self.reports.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.lock().is_empty()
    }

    pub fn last(&self) -> Option<StepReport> {
        self.reports.lock().last().cloned()
    }
}

impl ReportSink for CollectingSink {
    fn publish(&mut self, report: &StepReport) {
        self.reports.lock().push(report.clone());
    }
}

/// Logs one summary line every `interval` steps.
#[derive(Debug, Clone)]
pub struct LoggingSink {
    interval: u64,
}

impl LoggingSink {
    pub fn new(interval: u64) -> Self {
        LoggingSink {
            interval: interval.max(1),
        }
    }
}

impl ReportSink for LoggingSink {
    fn publish(&mut self, report: &StepReport) {
        if report.step % self.interval != 0 {
            return;
        }
        let summary = report.summary();
        let travel_times: Vec<f64> = report
            .workers
            .iter()
            .flat_map(|w| w.travel_times.iter().map(|t| t.seconds))
            .collect();
        let mean_travel_time = if travel_times.is_empty() {
            0.
        } else {
            travel_times.iter().sum::<f64>() / travel_times.len() as f64
        };
        info!(
            "Run {} step {}: {} active, {} parked, {} completed, {} removed, {} in transit, mean travel time {:.1}s",
            summary.run,
            report.step,
            summary.active,
            summary.parked,
            summary.completed,
            summary.removed,
            summary.in_transit,
            mean_travel_time
        );
    }
}

#[cfg(test)]
mod tests {
    use crate::simulation::report::{
        CollectingSink, ReportSink, StepReport, TrafficReport,
    };
    use crate::simulation::traffic::{TrafficStats, VehicleCounts};

    fn report(worker: u32, active: u64, stats: TrafficStats) -> TrafficReport {
        TrafficReport {
            worker,
            run: 1,
            step: 4,
            time: 0.8,
            counts: VehicleCounts {
                private: active as u32,
                trams: 0,
                buses: 0,
            },
            active,
            parked: 0,
            stats,
            new_routes: vec![],
            travel_times: vec![],
            vehicles: vec![],
            lights: vec![],
        }
    }

    #[test]
    fn conservation_over_workers() {
        // worker 1 created 5, completed 1 and handed 2 to worker 0, of which 1 arrived
        let w0 = report(
            0,
            1,
            TrafficStats {
                received: 1,
                ..TrafficStats::default()
            },
        );
        let w1 = report(
            1,
            2,
            TrafficStats {
                created: 5,
                completed: 1,
                sent: 2,
                ..TrafficStats::default()
            },
        );
        let step = StepReport::new(1, 4, vec![w1, w0]);
        assert_eq!(0, step.workers[0].worker);
        assert_eq!(3, step.counts().private);

        let summary = step.summary();
        assert_eq!(1, summary.in_transit);
        assert_eq!(5, summary.steps);
        assert!(summary.is_conserved());
        assert!(summary.check());
    }

    #[test]
    fn collecting_sink_shares_storage() {
        let sink = CollectingSink::new();
        let mut writer = sink.clone();
        writer.publish(&StepReport::new(1, 0, vec![]));
        writer.publish(&StepReport::new(1, 1, vec![]));

        assert_eq!(2, sink.len());
        assert_eq!(Some(1), sink.last().map(|r| r.step));
    }
}
