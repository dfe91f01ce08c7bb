use std::collections::BTreeMap;
use std::sync::Arc;

use rand::rngs::SmallRng;
use tracing::{debug, info, instrument};

use crate::simulation::config::Config;
use crate::simulation::dynamics::{move_vehicles, reserve_priority_lanes, DriveSettings, PassOutcome};
use crate::simulation::error::SetupError;
use crate::simulation::fellow::{border_edges, find_fellows, Fellow};
use crate::simulation::id::Id;
use crate::simulation::io::routes::ExternalRoute;
use crate::simulation::messaging::messages::{BorderTraffic, ControlCommand, SetupRecord, StepTrigger};
use crate::simulation::network::partitioning::Partition;
use crate::simulation::network::road_network::{Edge, RoadNetwork};
use crate::simulation::network::routing::{EdgeRouter, Router};
use crate::simulation::random::{stream_rng, Stream};
use crate::simulation::report::TrafficReport;
use crate::simulation::traffic::generation::VehicleGenerator;
use crate::simulation::traffic::lights::LightCoordinator;
use crate::simulation::traffic::TrafficNetwork;
use crate::simulation::vehicles::Vehicle;
use crate::simulation::workload::WorkerMeta;

/// The step engine of one worker. It owns the traffic of the worker's area and knows its
/// fellows, but does no messaging itself: border traffic is handed in and out by the caller.
pub struct Simulation {
    traffic: TrafficNetwork,
    router: Box<dyn Router>,
    generator: VehicleGenerator,
    routes: Vec<ExternalRoute>,
    fellows: Vec<Fellow>,
    settings: DriveSettings,
    border_edges: Vec<Id<Edge>>,
    inner_edges: Vec<Id<Edge>>,
    outbox: BTreeMap<u32, Vec<Vehicle>>,
    rnd: SmallRng,
    config: Arc<Config>,
    meta: WorkerMeta,
    run: u64,
    step: u64,
}

impl Simulation {
    pub fn new(network: Arc<RoadNetwork>, setup: SetupRecord) -> Result<Self, SetupError> {
        let SetupRecord {
            run,
            worker,
            mut roster,
            config,
            routes,
        } = setup;
        if roster.is_empty() {
            return Err(SetupError::NoWorkers);
        }
        roster.sort_by_key(|m| m.rank);
        let meta = roster
            .iter()
            .find(|m| m.rank == worker)
            .cloned()
            .ok_or(SetupError::UnknownWorker(worker))?;

        let workareas: Vec<_> = roster.iter().map(|m| m.workarea.clone()).collect();
        let partition = Arc::new(Partition::from_workareas(network.grid.len(), &workareas));
        let config = Arc::new(config);

        let lights = LightCoordinator::new(network.clone(), partition.clone(), worker, &config);
        let traffic = TrafficNetwork::new(network.clone(), partition.clone(), worker, lights);
        let router: Box<dyn Router> = Box::new(EdgeRouter::new(
            network.clone(),
            config.routing.algorithm,
            config.routing.priority_uses_tram_track,
        ));
        let generator = VehicleGenerator::new(&traffic, &config, meta.quota, routes.clone());

        let fellows = find_fellows(&network, &partition, worker);
        let border_edges = border_edges(&network, &fellows);
        let inner_edges = traffic
            .local_edges()
            .iter()
            .copied()
            .filter(|e| border_edges.binary_search(e).is_err())
            .collect::<Vec<_>>();

        info!(
            "{}: run {run}, {} local edges ({} at the border), fellows {:?}",
            meta.name,
            traffic.local_edges().len(),
            border_edges.len(),
            fellows.iter().map(|f| f.rank).collect::<Vec<_>>()
        );

        Ok(Simulation {
            traffic,
            router,
            generator,
            routes,
            fellows,
            settings: DriveSettings::from(config.as_ref()),
            border_edges,
            inner_edges,
            outbox: BTreeMap::new(),
            rnd: stream_rng(config.simulation.seed, Stream::Dynamics(worker)),
            config,
            meta,
            run,
            step: 0,
        })
    }

    pub fn rank(&self) -> u32 {
        self.meta.rank
    }

    pub fn run(&self) -> u64 {
        self.run
    }

    /// The next step to simulate.
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn fellow_ranks(&self) -> Vec<u32> {
        self.fellows.iter().map(|f| f.rank).collect()
    }

    pub fn traffic(&self) -> &TrafficNetwork {
        &self.traffic
    }

    /// Marks the border traffic of `senders` for the current step as received. True once
    /// traffic went out to and came in from every fellow.
    pub fn mark_shared_with(&mut self, senders: &[u32]) -> bool {
        for fellow in self.fellows.iter_mut().filter(|f| senders.contains(&f.rank)) {
            fellow.mark_received();
        }
        self.fellows.iter().all(Fellow::is_shared)
    }

    /// Builds one record per fellow for the data produced by `step`: the vehicles handed off,
    /// the ghosts of vehicles which came in through the fellow's lanes and the light states.
    pub fn take_border_traffic(&mut self, step: u64) -> Vec<BorderTraffic> {
        let rank = self.rank();
        let mut records = Vec::with_capacity(self.fellows.len());
        for fellow in &mut self.fellows {
            let mut record = BorderTraffic::new(self.run, step, rank, fellow.rank);
            record.vehicles = self.outbox.remove(&fellow.rank).unwrap_or_default();
            record.lane_ghosts = fellow
                .inward_lanes(self.traffic.network())
                .filter_map(|lane| self.traffic.arrival_ghost(lane).map(|g| (lane, g)))
                .collect();
            let (colors, detections) = self.traffic.lights.take_outgoing(fellow.rank);
            record.light_colors = colors;
            record.detections = detections;
            fellow.mark_sent();
            records.push(record);
        }
        records
    }

    /// Applies the records of fellows, ordered by sender.
    #[instrument(level = "trace", skip(self, records), fields(rank = self.meta.rank))]
    pub fn apply_border_traffic(&mut self, mut records: Vec<BorderTraffic>) {
        records.sort_by_key(|r| r.sender);
        for record in records {
            debug!(
                "Worker #{}: {} vehicles from #{} for step {}",
                self.rank(),
                record.vehicles.len(),
                record.sender,
                record.step
            );
            for vehicle in record.vehicles {
                self.traffic.add_transferred_vehicle(vehicle);
            }
            for (lane, ghost) in record.lane_ghosts {
                self.traffic.apply_lane_ghost(lane, ghost);
            }
            self.traffic.apply_light_colors(&record.light_colors);
            self.traffic.apply_detections(&record.detections);
            if let Some(fellow) = self.fellows.iter_mut().find(|f| f.rank == record.sender) {
                fellow.mark_received();
            }
        }
    }

    /// Simulates one step in the fixed phase order and returns the report for it. The records
    /// are the border traffic the fellows produced in the previous step.
    #[instrument(level = "trace", skip(self, records), fields(rank = self.meta.rank, step = trigger.step))]
    pub fn run_step(&mut self, trigger: &StepTrigger, records: Vec<BorderTraffic>) -> TrafficReport {
        let step = trigger.step;
        let now = step as f64 * self.settings.step_size;

        self.apply_border_traffic(records);
        reserve_priority_lanes(&mut self.traffic, &self.settings);

        let mut outcome = PassOutcome::default();
        for edges in [&self.border_edges, &self.inner_edges] {
            outcome.append(move_vehicles(
                &mut self.traffic,
                self.router.as_ref(),
                edges,
                step,
                &self.settings,
                &mut self.rnd,
            ));
        }
        for (owner, vehicle) in outcome.handoffs {
            self.outbox.entry(owner).or_default().push(vehicle);
        }

        self.traffic.update_lights();
        self.traffic.update_tram_stops(self.settings.step_size);
        self.traffic.release_parked(now, self.settings.drive_on_left);

        self.generator.create_due_vehicles(&mut self.traffic, step, now);
        self.generator.create_random_vehicles(
            &mut self.traffic,
            self.router.as_ref(),
            |c| trigger.allows(c),
            now,
        );

        for fellow in &mut self.fellows {
            fellow.reset();
        }
        self.step = step + 1;
        self.report(step, now)
    }

    fn report(&mut self, step: u64, now: f64) -> TrafficReport {
        let output = &self.config.output;
        let full = step % output.report_interval_steps.max(1) == 0;
        TrafficReport {
            worker: self.rank(),
            run: self.run,
            step,
            time: now,
            counts: self.traffic.counters(),
            active: self.traffic.num_active() as u64,
            parked: self.traffic.num_parked() as u64,
            stats: self.traffic.stats(),
            new_routes: self.traffic.take_new_routes(),
            travel_times: self.traffic.take_travel_times(),
            vehicles: if full {
                self.traffic.vehicle_snapshots(output.foreground_only)
            } else {
                Vec::new()
            },
            lights: if full {
                self.traffic.lights.snapshots()
            } else {
                Vec::new()
            },
        }
    }

    /// Applies an operator command between two steps. Commands about the run itself are
    /// handled by the caller.
    pub fn apply_control(&mut self, command: &ControlCommand) {
        match command {
            ControlCommand::BlockLane { lane, blocked } => {
                info!("Worker #{}: lane {lane} blocked: {blocked}", self.rank());
                self.traffic.set_lane_blocked(*lane, *blocked);
            }
            ControlCommand::SetTrafficLight { node, enabled } => {
                self.traffic.set_signal(*node, *enabled);
            }
            ControlCommand::SetStepPause { .. }
            | ControlCommand::Pause
            | ControlCommand::Resume
            | ControlCommand::Stop => {}
        }
    }

    /// Drops all traffic of the current run. The environment stays set up, so the worker can
    /// start over with step 0.
    pub fn reset(&mut self) {
        info!("Worker #{}: reset after step {}", self.rank(), self.step);
        self.traffic.reset_traffic();
        self.generator = VehicleGenerator::new(
            &self.traffic,
            &self.config,
            self.meta.quota,
            self.routes.clone(),
        );
        self.outbox.clear();
        for fellow in &mut self.fellows {
            fellow.reset();
        }
        self.step = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::simulation::config::Config;
    use crate::simulation::id::Id;
    use crate::simulation::io::routes::ExternalRoute;
    use crate::simulation::messaging::messages::{ControlCommand, SetupRecord, StepTrigger};
    use crate::simulation::network::partitioning::Partition;
    use crate::simulation::network::road_network::RoadNetwork;
    use crate::simulation::simulation::Simulation;
    use crate::simulation::vehicles::{RouteLeg, VehicleType};
    use crate::simulation::workload::build_roster;
    use crate::test_utils::create_grid_network;

    /// 1x6 corridor in both directions, split in the middle.
    fn split_corridor(config: &Config) -> (Arc<RoadNetwork>, Vec<SetupRecord>) {
        let network = Arc::new(create_grid_network(1, 6, 100., 1).finish(100.));
        let partition = Partition {
            num_workers: 2,
            cell_owner: network
                .grid
                .cells
                .iter()
                .map(|c| if c.col < 3 { 0 } else { 1 })
                .collect(),
        };
        let roster = build_roster(&network.grid, &partition, &config.vehicles);
        let setups = (0..2)
            .map(|worker| SetupRecord {
                run: 1,
                worker,
                roster: roster.clone(),
                config: config.clone(),
                routes: vec![],
            })
            .collect();
        (network, setups)
    }

    fn eastbound(network: &RoadNetwork) -> Vec<RouteLeg> {
        // forward edges of the corridor, one per node pair
        (0..5)
            .map(|i| {
                let from = network.nodes[i].id;
                let to = network.nodes[i + 1].id;
                let edge = network
                    .edges
                    .iter()
                    .find(|e| e.from == from && e.to == to)
                    .unwrap();
                RouteLeg::new(edge.id)
            })
            .collect()
    }

    #[test]
    fn unknown_worker() {
        let (network, mut setups) = split_corridor(&Config::default());
        let mut setup = setups.remove(0);
        setup.worker = 5;
        assert!(Simulation::new(network, setup).is_err());
    }

    #[test]
    fn vehicle_crosses_to_fellow() {
        let config = Config::default();
        let (network, setups) = split_corridor(&config);
        let mut route_setups = setups;
        route_setups[0].routes = vec![ExternalRoute {
            id: Id::new(1),
            vehicle_type: VehicleType::Car,
            departure_step: 0,
            legs: eastbound(&network),
            foreground: true,
        }];
        let mut sims: Vec<Simulation> = route_setups
            .into_iter()
            .map(|s| Simulation::new(network.clone(), s).unwrap())
            .collect();
        assert_eq!(vec![1], sims[0].fellow_ranks());
        assert_eq!(vec![0], sims[1].fellow_ranks());

        let mut handed_over_at = None;
        let mut inbox: Vec<Vec<_>> = vec![vec![], vec![]];
        for step in 0..400 {
            let trigger = StepTrigger {
                allow_private: false,
                allow_trams: false,
                allow_buses: false,
                ..StepTrigger::allow_all(1, step)
            };
            let reports: Vec<_> = (0..2)
                .map(|w| sims[w].run_step(&trigger, std::mem::take(&mut inbox[w])))
                .collect();

            // the vehicle is never active on both workers
            assert!(reports[0].active + reports[1].active <= 1);

            for w in 0..2 {
                for record in sims[w].take_border_traffic(step + 1) {
                    if !record.vehicles.is_empty() && handed_over_at.is_none() {
                        handed_over_at = Some(step);
                    }
                    inbox[record.receiver as usize].push(record);
                }
            }
            if reports[1].stats.completed == 1 {
                assert_eq!(1, reports[0].stats.sent);
                assert_eq!(1, reports[1].stats.received);
                assert!(handed_over_at.is_some());
                return;
            }
        }
        panic!("vehicle did not reach its destination");
    }

    #[test]
    fn shared_once_traffic_went_both_ways() {
        let config = Config::default();
        let (network, mut setups) = split_corridor(&config);
        let mut sim = Simulation::new(network, setups.remove(0)).unwrap();

        assert_eq!(1, sim.take_border_traffic(0).len());
        assert!(!sim.mark_shared_with(&[]));
        assert!(!sim.mark_shared_with(&[7]));
        assert!(sim.mark_shared_with(&[1]));

        // every step starts over
        sim.run_step(&StepTrigger::allow_all(1, 0), vec![]);
        sim.take_border_traffic(1);
        assert!(!sim.mark_shared_with(&[]));
        assert!(sim.mark_shared_with(&[1]));
    }

    #[test]
    fn control_and_reset() {
        let config = Config::default();
        let (network, mut setups) = split_corridor(&config);
        let mut sim = Simulation::new(network.clone(), setups.remove(0)).unwrap();
        let lane = network.edges[0].lanes[0];

        sim.apply_control(&ControlCommand::BlockLane { lane, blocked: true });
        assert!(sim.traffic().lane(lane).blocked);

        sim.run_step(&StepTrigger::allow_all(1, 0), vec![]);
        assert_eq!(1, sim.step());
        sim.reset();
        assert_eq!(0, sim.step());
        assert_eq!(0, sim.traffic().vehicles().count());
    }
}
