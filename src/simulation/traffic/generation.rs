use nohash_hasher::IntSet;
use rand::rngs::SmallRng;
use rand::Rng;
use tracing::{debug, info};

use crate::simulation::config::{Config, GridWindow};
use crate::simulation::id::Id;
use crate::simulation::io::routes::ExternalRoute;
use crate::simulation::network::road_network::{Edge, RoadNetwork};
use crate::simulation::network::routing::Router;
use crate::simulation::random::{stream_rng, Stream};
use crate::simulation::time_queue::TimeQueue;
use crate::simulation::traffic::{NewVehicle, TrafficNetwork, VehicleCounts};
use crate::simulation::vehicles::{DriverProfile, RouteLeg, VehicleCategory, VehicleType};

/// Creates the vehicles of one worker: vehicles from route definitions when they are due and
/// random background traffic up to the worker's quota.
pub struct VehicleGenerator {
    rnd: SmallRng,
    quota: VehicleCounts,
    max_per_step: u32,
    bus_stop_seconds: f64,
    private_sources: Vec<Id<Edge>>,
    tram_sources: Vec<Id<Edge>>,
    bus_sources: Vec<Id<Edge>>,
    road_destinations: Vec<Id<Edge>>,
    tram_destinations: Vec<Id<Edge>>,
    external: TimeQueue<ExternalRoute>,
}

impl VehicleGenerator {
    pub fn new(
        traffic: &TrafficNetwork,
        config: &Config,
        quota: VehicleCounts,
        routes: Vec<ExternalRoute>,
    ) -> Self {
        let network = traffic.network();
        let sources = &config.vehicles.source_windows;
        let destinations = &config.vehicles.destination_windows;

        let local = |filter: &dyn Fn(&Edge) -> bool| -> Vec<Id<Edge>> {
            traffic
                .local_edges()
                .iter()
                .map(|e| network.edge(*e))
                .filter(|e| in_windows(network, e, sources) && filter(e))
                .map(|e| e.id)
                .collect()
        };
        let private_sources = local(&|e| !e.tram_track);
        let tram_sources = local(&|e| e.tram_track);
        let mut bus_sources = local(&|e| e.bus_route && !e.tram_track);
        if !network.edges.iter().any(|e| e.bus_route) {
            bus_sources = private_sources.clone();
        }

        let global = |tram: bool| -> Vec<Id<Edge>> {
            network
                .edges
                .iter()
                .filter(|e| e.tram_track == tram && in_windows(network, e, destinations))
                .map(|e| e.id)
                .collect()
        };

        let mut external = TimeQueue::new();
        for route in routes {
            external.add(route);
        }

        info!(
            "Worker #{}: vehicle generator with quota {:?}, {} private sources, {} tram sources, {} routes",
            traffic.rank(),
            quota,
            private_sources.len(),
            tram_sources.len(),
            external.len()
        );

        VehicleGenerator {
            rnd: stream_rng(config.simulation.seed, Stream::Vehicles(traffic.rank())),
            quota,
            max_per_step: config.simulation.max_new_vehicles_per_step,
            bus_stop_seconds: config.simulation.bus_stop_seconds,
            private_sources,
            tram_sources,
            bus_sources,
            road_destinations: global(false),
            tram_destinations: global(true),
            external,
        }
    }

    /// Creates the vehicles of all route definitions due at `step`.
    pub fn create_due_vehicles(&mut self, traffic: &mut TrafficNetwork, step: u64, now: f64) -> usize {
        let mut created = 0;
        for route in self.external.pop(step) {
            let new_vehicle = NewVehicle {
                id: Some(route.id),
                vehicle_type: route.vehicle_type,
                profile: DriverProfile::random(&mut self.rnd),
                route: route.legs,
                external: true,
                foreground: route.foreground,
            };
            match traffic.create_vehicle(new_vehicle, now) {
                Ok(_) => created += 1,
                Err(e) => debug!("Vehicle {} from route definitions not created: {e}", route.id),
            }
        }
        created
    }

    /// Creates random vehicles for every category `allowed` permits while the local count is
    /// below the quota, at most `max_new_vehicles_per_step` in total.
    pub fn create_random_vehicles(
        &mut self,
        traffic: &mut TrafficNetwork,
        router: &dyn Router,
        allowed: impl Fn(VehicleCategory) -> bool,
        now: f64,
    ) -> usize {
        let mut created = 0;
        let mut attempts = 0;
        let max = self.max_per_step as usize;
        let categories = [
            VehicleCategory::Private,
            VehicleCategory::Tram,
            VehicleCategory::Bus,
        ];

        while created < max && attempts < 2 * max {
            attempts += 1;
            let open: Vec<VehicleCategory> = categories
                .iter()
                .copied()
                .filter(|c| allowed(*c) && traffic.counters().get(*c) < self.quota.get(*c))
                .collect();
            if open.is_empty() {
                break;
            }
            let category = open[self.rnd.random_range(0..open.len())];
            if let Some(new_vehicle) = self.random_vehicle(traffic.network(), router, category) {
                match traffic.create_vehicle(new_vehicle, now) {
                    Ok(_) => created += 1,
                    Err(e) => debug!("Random vehicle not created: {e}"),
                }
            }
        }
        created
    }

    fn random_vehicle(
        &mut self,
        network: &RoadNetwork,
        router: &dyn Router,
        category: VehicleCategory,
    ) -> Option<NewVehicle> {
        let (sources, destinations, vehicle_type) = match category {
            VehicleCategory::Private => {
                let draw: f64 = self.rnd.random();
                let vehicle_type = if draw < 0.85 {
                    VehicleType::Car
                } else if draw < 0.95 {
                    VehicleType::Truck
                } else {
                    VehicleType::Bike
                };
                (&self.private_sources, &self.road_destinations, vehicle_type)
            }
            VehicleCategory::Tram => (&self.tram_sources, &self.tram_destinations, VehicleType::Tram),
            VehicleCategory::Bus => (&self.bus_sources, &self.road_destinations, VehicleType::Bus),
        };
        if sources.is_empty() || destinations.is_empty() {
            return None;
        }
        let start = sources[self.rnd.random_range(0..sources.len())];
        let end = destinations[self.rnd.random_range(0..destinations.len())];
        if start == end {
            return None;
        }

        let Some(mut route) = router.create_complete_route(start, end, vehicle_type, &IntSet::default())
        else {
            debug!("No route from edge {start} to edge {end} for {vehicle_type:?}. Dropping vehicle.");
            return None;
        };
        if vehicle_type == VehicleType::Bus {
            let last = route.len() - 1;
            for leg in route.iter_mut().take(last) {
                if network.node(network.edge(leg.edge).to).bus_stop {
                    *leg = RouteLeg::with_stopover(leg.edge, self.bus_stop_seconds);
                }
            }
        }

        Some(NewVehicle {
            id: None,
            vehicle_type,
            profile: DriverProfile::random(&mut self.rnd),
            route,
            external: false,
            foreground: false,
        })
    }
}

fn in_windows(network: &RoadNetwork, edge: &Edge, windows: &[GridWindow]) -> bool {
    if windows.is_empty() {
        return true;
    }
    let cell = &network.grid.cells[network.node(edge.from).cell.index()];
    windows.iter().any(|w| w.contains(cell.row, cell.col))
}
