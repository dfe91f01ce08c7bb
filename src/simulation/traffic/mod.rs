pub mod generation;
pub mod lights;
pub mod parking;

use std::sync::Arc;

use nohash_hasher::IntMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::simulation::error::CreateVehicleError;
use crate::simulation::id::Id;
use crate::simulation::network::partitioning::Partition;
use crate::simulation::network::road_network::{Edge, Lane, Node, RoadNetwork};
use crate::simulation::report::{RouteSummary, TravelTime, VehicleSnapshot};
use crate::simulation::traffic::lights::{Detection, LightColor, LightCoordinator};
use crate::simulation::vehicles::{
    DriverProfile, RouteLeg, Vehicle, VehicleCategory, VehicleType,
};

/// Position and speed of a vehicle which left this worker through a lane, as seen on the edge it
/// entered. Used as a front vehicle by drivers following it on the border lane.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BorderGhost {
    pub vehicle: Id<Vehicle>,
    /// Edge the departed vehicle entered.
    pub edge: Id<Edge>,
    /// Rear end of the departed vehicle, measured from the start of `edge`.
    pub end_position: f64,
    pub speed: f64,
}

impl BorderGhost {
    const FAR_AWAY: f64 = 1.0e6;
    const FAST: f64 = 1.0e3;

    /// The vehicle has moved on and no longer constrains anybody behind the border.
    pub fn sentinel(vehicle: Id<Vehicle>, edge: Id<Edge>) -> Self {
        BorderGhost {
            vehicle,
            edge,
            end_position: Self::FAR_AWAY,
            speed: Self::FAST,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.end_position >= Self::FAR_AWAY
    }
}

#[derive(Debug, Clone, Default)]
pub struct LaneState {
    /// Vehicles on the lane, closest to the end of the edge first.
    pub vehicles: Vec<Id<Vehicle>>,
    pub blocked: bool,
    /// Reserved for an approaching priority vehicle during the current step.
    pub priority: bool,
    pub last_vehicle_left: Option<BorderGhost>,
    /// Last vehicle which arrived from a fellow through this lane and the leg it arrived on.
    pub last_arrived: Option<(Id<Vehicle>, usize)>,
}

#[derive(Debug, Clone, Default)]
pub struct EdgeState {
    /// Color of the signal at the end of the edge, `None` if there is no signal.
    pub light: Option<LightColor>,
    pub waiting_detected: bool,
    pub priority_detected: bool,
    pub dwelling_tram: Option<Id<Vehicle>>,
    pub tram_stop_countdown: f64,
    pub parked: Vec<Id<Vehicle>>,
}

/// Randomly generated vehicles currently on this worker, per quota category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleCounts {
    pub private: u32,
    pub trams: u32,
    pub buses: u32,
}

impl VehicleCounts {
    pub fn get(&self, category: VehicleCategory) -> u32 {
        match category {
            VehicleCategory::Private => self.private,
            VehicleCategory::Tram => self.trams,
            VehicleCategory::Bus => self.buses,
        }
    }

    fn get_mut(&mut self, category: VehicleCategory) -> &mut u32 {
        match category {
            VehicleCategory::Private => &mut self.private,
            VehicleCategory::Tram => &mut self.trams,
            VehicleCategory::Bus => &mut self.buses,
        }
    }

    pub fn add(&mut self, other: &VehicleCounts) {
        self.private += other.private;
        self.trams += other.trams;
        self.buses += other.buses;
    }
}

/// Lifetime counters of one worker. Summed over all workers they satisfy
/// `created = active + parked + completed + removed + sent - received`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficStats {
    pub created: u64,
    pub completed: u64,
    pub removed: u64,
    pub sent: u64,
    pub received: u64,
}

impl TrafficStats {
    pub fn add(&mut self, other: &TrafficStats) {
        self.created += other.created;
        self.completed += other.completed;
        self.removed += other.removed;
        self.sent += other.sent;
        self.received += other.received;
    }
}

/// Why a vehicle leaves the active set of this worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Completed,
    RerouteLimit,
    Transferred,
}

/// A vehicle to be created on this worker.
#[derive(Debug, Clone)]
pub struct NewVehicle {
    /// Predefined id of vehicles loaded from route definitions.
    pub id: Option<Id<Vehicle>>,
    pub vehicle_type: VehicleType,
    pub profile: DriverProfile,
    pub route: Vec<RouteLeg>,
    pub external: bool,
    pub foreground: bool,
}

/// Simulation state owned by one worker: the vehicles on its edges, lane occupancy, parked
/// vehicles and traffic lights.
pub struct TrafficNetwork {
    network: Arc<RoadNetwork>,
    partition: Arc<Partition>,
    rank: u32,
    lanes: Vec<LaneState>,
    edges: Vec<EdgeState>,
    vehicles: IntMap<Id<Vehicle>, Vehicle>,
    local_edges: Vec<Id<Edge>>,
    counters: VehicleCounts,
    stats: TrafficStats,
    new_routes: Vec<RouteSummary>,
    travel_times: Vec<TravelTime>,
    next_vehicle: u64,
    pub lights: LightCoordinator,
}

impl TrafficNetwork {
    pub fn new(
        network: Arc<RoadNetwork>,
        partition: Arc<Partition>,
        rank: u32,
        lights: LightCoordinator,
    ) -> Self {
        let local_edges = network
            .edges
            .iter()
            .filter(|e| partition.edge_owner(&network, e.id) == rank)
            .map(|e| e.id)
            .collect();
        let mut traffic = TrafficNetwork {
            lanes: vec![LaneState::default(); network.lanes.len()],
            edges: vec![EdgeState::default(); network.edges.len()],
            network,
            partition,
            rank,
            vehicles: IntMap::default(),
            local_edges,
            counters: VehicleCounts::default(),
            stats: TrafficStats::default(),
            new_routes: Vec::new(),
            travel_times: Vec::new(),
            next_vehicle: 0,
            lights,
        };
        traffic.lights.init_colors(&mut traffic.edges);
        traffic
    }

    pub fn network(&self) -> &RoadNetwork {
        &self.network
    }

    pub fn network_arc(&self) -> Arc<RoadNetwork> {
        self.network.clone()
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn is_local(&self, edge: Id<Edge>) -> bool {
        self.owner(edge) == self.rank
    }

    pub fn owner(&self, edge: Id<Edge>) -> u32 {
        self.partition.edge_owner(&self.network, edge)
    }

    pub fn local_edges(&self) -> &[Id<Edge>] {
        &self.local_edges
    }

    pub fn lane(&self, id: Id<Lane>) -> &LaneState {
        &self.lanes[id.index()]
    }

    pub fn lane_mut(&mut self, id: Id<Lane>) -> &mut LaneState {
        &mut self.lanes[id.index()]
    }

    pub fn edge(&self, id: Id<Edge>) -> &EdgeState {
        &self.edges[id.index()]
    }

    pub fn edge_mut(&mut self, id: Id<Edge>) -> &mut EdgeState {
        &mut self.edges[id.index()]
    }

    pub fn vehicle(&self, id: Id<Vehicle>) -> Option<&Vehicle> {
        self.vehicles.get(&id)
    }

    pub fn vehicle_mut(&mut self, id: Id<Vehicle>) -> Option<&mut Vehicle> {
        self.vehicles.get_mut(&id)
    }

    pub fn vehicles(&self) -> impl Iterator<Item = &Vehicle> {
        self.vehicles.values()
    }

    pub fn counters(&self) -> VehicleCounts {
        self.counters
    }

    pub fn stats(&self) -> TrafficStats {
        self.stats
    }

    pub fn num_active(&self) -> usize {
        self.vehicles.values().filter(|v| v.active).count()
    }

    pub fn num_parked(&self) -> usize {
        self.vehicles.values().filter(|v| !v.active).count()
    }

    /// Whether every lane of the edge is blocked.
    pub fn is_edge_blocked(&self, edge: Id<Edge>) -> bool {
        self.network
            .edge(edge)
            .lanes
            .iter()
            .all(|l| self.lanes[l.index()].blocked)
    }

    /// Closest vehicle on the lane at or ahead of `head`, other than `exclude`.
    pub fn leader_on_lane(&self, lane: Id<Lane>, head: f64, exclude: Id<Vehicle>) -> Option<&Vehicle> {
        self.lanes[lane.index()]
            .vehicles
            .iter()
            .rev()
            .filter(|id| **id != exclude)
            .map(|id| &self.vehicles[id])
            .find(|v| v.head_position >= head)
    }

    /// Closest vehicle on the lane behind `head`, other than `exclude`.
    pub fn follower_on_lane(&self, lane: Id<Lane>, head: f64, exclude: Id<Vehicle>) -> Option<&Vehicle> {
        self.lanes[lane.index()]
            .vehicles
            .iter()
            .filter(|id| **id != exclude)
            .map(|id| &self.vehicles[id])
            .find(|v| v.head_position < head)
    }

    /// Vehicle which entered the lane last.
    pub fn rearmost_on_lane(&self, lane: Id<Lane>) -> Option<&Vehicle> {
        self.lanes[lane.index()]
            .vehicles
            .last()
            .map(|id| &self.vehicles[id])
    }

    /// Vehicles on the lanes of the given edges, closest to the end first per lane.
    pub fn vehicles_on_edges(&self, edges: &[Id<Edge>]) -> Vec<Id<Vehicle>> {
        edges
            .iter()
            .flat_map(|e| self.network.edge(*e).lanes.iter())
            .flat_map(|l| self.lanes[l.index()].vehicles.iter().copied())
            .collect()
    }

    pub fn create_vehicle(
        &mut self,
        new_vehicle: NewVehicle,
        now: f64,
    ) -> Result<Id<Vehicle>, CreateVehicleError> {
        if new_vehicle.route.is_empty() {
            return Err(CreateVehicleError::EmptyRoute);
        }
        if new_vehicle.vehicle_type == VehicleType::Virtual {
            return Err(CreateVehicleError::VirtualVehicle);
        }
        let start = new_vehicle.route[0].edge;
        if !self.is_local(start) {
            return Err(CreateVehicleError::NotOwned(start.internal()));
        }

        let id = new_vehicle.id.unwrap_or_else(|| {
            self.next_vehicle += 1;
            Id::new(((self.rank as u64 + 1) << 40) | self.next_vehicle)
        });
        let edge = self.network.edge(start);
        let mut vehicle = Vehicle::new(
            id,
            new_vehicle.vehicle_type,
            new_vehicle.profile,
            new_vehicle.route,
            edge.lanes[0],
        );
        vehicle.head_position = vehicle.length().min(edge.length);
        vehicle.external = new_vehicle.external;
        vehicle.foreground = new_vehicle.foreground;
        vehicle.route_start_time = now;
        vehicle.earliest_departure = now;

        if !vehicle.external {
            if let Some(category) = vehicle.vehicle_type.category() {
                *self.counters.get_mut(category) += 1;
            }
        }
        self.stats.created += 1;
        self.new_routes.push(RouteSummary::from(&vehicle));
        self.edges[start.index()].parked.push(id);
        self.vehicles.insert(id, vehicle);
        Ok(id)
    }

    /// Takes over a vehicle handed off by a fellow and puts it on its lane.
    pub fn add_transferred_vehicle(&mut self, mut vehicle: Vehicle) {
        let id = vehicle.id;
        if self.vehicles.contains_key(&id) {
            debug!("Vehicle {id} was already handed over to worker {}", self.rank);
            return;
        }
        vehicle.active = true;
        if let Some(previous) = vehicle.previous_lane {
            self.lanes[previous.index()].last_arrived = Some((id, vehicle.leg));
        }
        if !vehicle.external {
            if let Some(category) = vehicle.vehicle_type.category() {
                *self.counters.get_mut(category) += 1;
            }
        }
        self.stats.received += 1;
        self.vehicles.insert(id, vehicle);
        self.attach(id);
    }

    /// Takes vehicles off their lanes and out of this worker.
    pub fn remove_active_vehicles(&mut self, ids: &[Id<Vehicle>], reason: Removal) -> Vec<Vehicle> {
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if self.vehicles.get(id).is_some_and(|v| v.active) {
                self.detach(*id);
            }
            let Some(mut vehicle) = self.vehicles.remove(id) else {
                continue;
            };
            vehicle.active = false;
            if !vehicle.external {
                if let Some(category) = vehicle.vehicle_type.category() {
                    let count = self.counters.get_mut(category);
                    *count = count.saturating_sub(1);
                }
            }
            match reason {
                Removal::Completed => {
                    self.stats.completed += 1;
                    self.travel_times.push(TravelTime::from(&vehicle));
                }
                Removal::RerouteLimit => {
                    debug!("Vehicle {} exceeded the reroute limit", vehicle.id);
                    self.stats.removed += 1;
                }
                Removal::Transferred => self.stats.sent += 1,
            }
            removed.push(vehicle);
        }
        removed
    }

    /// Inserts the vehicle into its lane, keeping the order by position.
    pub(crate) fn attach(&mut self, id: Id<Vehicle>) {
        let vehicles = &self.vehicles;
        let vehicle = &vehicles[&id];
        let head = vehicle.head_position;
        let lane = &mut self.lanes[vehicle.lane.index()].vehicles;
        let position = lane.partition_point(|other| vehicles[other].head_position >= head);
        lane.insert(position, id);
    }

    pub(crate) fn detach(&mut self, id: Id<Vehicle>) {
        let lane = self.vehicles[&id].lane;
        let list = &mut self.lanes[lane.index()].vehicles;
        if let Some(position) = list.iter().position(|v| *v == id) {
            list.remove(position);
        }
    }

    /// Restores the order of the lanes of the given edges after positions changed.
    pub(crate) fn sort_lanes(&mut self, edges: &[Id<Edge>]) {
        let vehicles = &self.vehicles;
        for edge in edges {
            for lane in &self.network.edge(*edge).lanes {
                self.lanes[lane.index()].vehicles.sort_by(|a, b| {
                    vehicles[b].head_position.total_cmp(&vehicles[a].head_position)
                });
            }
        }
    }

    pub fn set_lane_blocked(&mut self, lane: Id<Lane>, blocked: bool) {
        if let Some(state) = self.lanes.get_mut(lane.index()) {
            state.blocked = blocked;
        }
    }

    pub fn clear_priority_lanes(&mut self) {
        for lane in &mut self.lanes {
            lane.priority = false;
        }
    }

    /// Applies the signal colors computed by fellows for approach edges owned here.
    pub fn apply_light_colors(&mut self, colors: &[(Id<Edge>, LightColor)]) {
        for (edge, color) in colors {
            self.edges[edge.index()].light = Some(*color);
        }
    }

    /// Detections reported by fellows for approaches of light groups homed here.
    pub fn apply_detections(&mut self, detections: &[Detection]) {
        LightCoordinator::apply_detections(&mut self.edges, detections);
    }

    /// Advances the signal programs homed here by one step and collects the detections which
    /// have to go to fellows.
    pub fn update_lights(&mut self) {
        self.lights.update(&mut self.edges);
        self.lights.collect_and_reset_detections(&mut self.edges);
    }

    pub fn set_signal(&mut self, node: Id<Node>, enabled: bool) {
        self.lights.set_signal(node, enabled, &mut self.edges);
    }

    /// Updates the ghost of a lane with the state reported by the fellow simulating the vehicle.
    /// Reports about a vehicle which is not the last one that left through the lane are stale.
    pub fn apply_lane_ghost(&mut self, lane: Id<Lane>, ghost: BorderGhost) {
        let state = &mut self.lanes[lane.index()];
        if state
            .last_vehicle_left
            .map_or(true, |current| current.vehicle == ghost.vehicle)
        {
            state.last_vehicle_left = Some(ghost);
        }
    }

    /// Ghost of the last vehicle which arrived here through the given lane of a fellow.
    pub fn arrival_ghost(&self, lane: Id<Lane>) -> Option<BorderGhost> {
        let (id, leg) = self.lanes[lane.index()].last_arrived?;
        match self.vehicles.get(&id) {
            Some(vehicle) if vehicle.active && vehicle.leg == leg => Some(BorderGhost {
                vehicle: id,
                edge: vehicle.current_edge(),
                end_position: vehicle.rear_position(),
                speed: vehicle.speed,
            }),
            Some(vehicle) => Some(BorderGhost::sentinel(id, vehicle.current_edge())),
            None => Some(BorderGhost::sentinel(id, self.network.lane(lane).edge)),
        }
    }

    pub fn take_new_routes(&mut self) -> Vec<RouteSummary> {
        std::mem::take(&mut self.new_routes)
    }

    pub fn take_travel_times(&mut self) -> Vec<TravelTime> {
        std::mem::take(&mut self.travel_times)
    }

    pub fn vehicle_snapshots(&self, foreground_only: bool) -> Vec<VehicleSnapshot> {
        let mut snapshots: Vec<VehicleSnapshot> = self
            .vehicles
            .values()
            .filter(|v| !foreground_only || v.foreground)
            .map(|v| VehicleSnapshot::new(v, self.network.lane(v.lane).index))
            .collect();
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }

    /// Clears all vehicles and per-step state. The static structure and the light programs stay.
    pub fn reset_traffic(&mut self) {
        self.vehicles.clear();
        for lane in &mut self.lanes {
            *lane = LaneState::default();
        }
        for edge in &mut self.edges {
            *edge = EdgeState::default();
        }
        self.counters = VehicleCounts::default();
        self.stats = TrafficStats::default();
        self.new_routes.clear();
        self.travel_times.clear();
        self.next_vehicle = 0;
        self.lights.reset();
        self.lights.init_colors(&mut self.edges);
    }
}
