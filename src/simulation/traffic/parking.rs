use tracing::trace;

use crate::simulation::id::Id;
use crate::simulation::network::road_network::{Edge, Lane, Turn};
use crate::simulation::traffic::TrafficNetwork;
use crate::simulation::vehicles::Vehicle;

impl TrafficNetwork {
    /// Takes an active vehicle off its lane and parks it at its current position on the current
    /// edge until `until`.
    pub fn park_vehicle(&mut self, id: Id<Vehicle>, until: f64) {
        let Some(vehicle) = self.vehicles.get(&id) else {
            return;
        };
        if vehicle.active {
            self.detach(id);
        }
        let Some(vehicle) = self.vehicles.get_mut(&id) else {
            return;
        };
        vehicle.active = false;
        vehicle.speed = 0.;
        vehicle.acceleration = 0.;
        vehicle.jam_time = 0.;
        vehicle.earliest_departure = until;
        let edge = vehicle.current_edge();
        self.edges[edge.index()].parked.push(id);
        trace!("Vehicle {id} parked on edge {edge} until {until}");
    }

    /// Starts parked vehicles whose departure time has come and which find a gap on a lane.
    /// Vehicles which find no gap stay parked and try again in the next step.
    pub fn release_parked(&mut self, now: f64, drive_on_left: bool) -> Vec<Id<Vehicle>> {
        let mut released = Vec::new();
        for index in 0..self.local_edges.len() {
            let edge = self.local_edges[index];
            let candidates: Vec<Id<Vehicle>> = self.edges[edge.index()]
                .parked
                .iter()
                .filter(|id| self.vehicles[*id].earliest_departure <= now)
                .copied()
                .collect();
            for id in candidates {
                if let Some((leg, lane, head)) = self.find_departure_lane(id, drive_on_left) {
                    self.start_vehicle(id, leg, lane, head);
                    released.push(id);
                }
            }
        }
        released
    }

    fn start_vehicle(&mut self, id: Id<Vehicle>, leg: usize, lane: Id<Lane>, head: f64) {
        let edge = self.vehicles[&id].current_edge();
        let parked = &mut self.edges[edge.index()].parked;
        if let Some(position) = parked.iter().position(|p| *p == id) {
            parked.remove(position);
        }
        let Some(vehicle) = self.vehicles.get_mut(&id) else {
            return;
        };
        if leg != vehicle.leg {
            vehicle.previous_lane = Some(vehicle.lane);
        }
        vehicle.leg = leg;
        vehicle.lane = lane;
        vehicle.head_position = head;
        vehicle.speed = 0.;
        vehicle.acceleration = 0.;
        vehicle.active = true;
        self.attach(id);
        trace!("Vehicle {id} left the parking on lane {lane}");
    }

    /// Probes the lanes of the current edge at the parking position, then the lanes of the next
    /// edge if the vehicle is parked at the end of its edge.
    fn find_departure_lane(
        &self,
        id: Id<Vehicle>,
        drive_on_left: bool,
    ) -> Option<(usize, Id<Lane>, f64)> {
        let vehicle = &self.vehicles[&id];
        let edge = self.network.edge(vehicle.current_edge());
        let head = vehicle.head_position.min(edge.length);

        let turn = vehicle
            .next_edge()
            .map(|next| self.network.turn(edge.id, next, drive_on_left));
        if let Some(lane) = self.free_lane(vehicle, edge.id, turn, head) {
            return Some((vehicle.leg, lane, head));
        }

        if head >= edge.length && !vehicle.is_last_leg() {
            let next_edge = vehicle.route[vehicle.leg + 1].edge;
            if !self.is_local(next_edge) {
                return None;
            }
            let next_length = self.network.edge(next_edge).length;
            let turn = vehicle
                .route
                .get(vehicle.leg + 2)
                .map(|after| self.network.turn(next_edge, after.edge, drive_on_left));
            let head = vehicle.length().min(next_length);
            if let Some(lane) = self.free_lane(vehicle, next_edge, turn, head) {
                return Some((vehicle.leg + 1, lane, head));
            }
        }
        None
    }

    fn free_lane(
        &self,
        vehicle: &Vehicle,
        edge: Id<Edge>,
        turn: Option<Turn>,
        head: f64,
    ) -> Option<Id<Lane>> {
        let e = self.network.edge(edge);
        let preferred = turn.map_or(0..e.num_lanes(), |t| e.lanes_for_turn(t));
        let order = preferred
            .clone()
            .chain((0..e.num_lanes()).filter(|i| !preferred.contains(i)));

        order
            .map(|index| e.lanes[index])
            .filter(|lane| !self.lanes[lane.index()].blocked)
            .find(|lane| self.has_gap(vehicle, *lane, head))
    }

    fn has_gap(&self, vehicle: &Vehicle, lane: Id<Lane>, head: f64) -> bool {
        let s0 = vehicle.profile.min_gap;
        if let Some(leader) = self.leader_on_lane(lane, head, vehicle.id) {
            if leader.rear_position() - head < s0 {
                return false;
            }
        }
        if let Some(follower) = self.follower_on_lane(lane, head, vehicle.id) {
            let needed = s0.max(follower.speed * follower.profile.time_headway);
            if head - vehicle.length() - follower.head_position < needed {
                return false;
            }
        }
        true
    }

    /// Marks the tram as dwelling at the stop at the end of `edge`.
    pub fn start_dwelling(&mut self, edge: Id<Edge>, tram: Id<Vehicle>, seconds: f64) {
        let state = &mut self.edges[edge.index()];
        if state.dwelling_tram.is_none() {
            state.dwelling_tram = Some(tram);
            state.tram_stop_countdown = seconds;
            trace!("Tram {tram} dwelling at the end of edge {edge}");
        }
    }

    /// Counts down the dwell times of trams at stops. A tram whose time is up is marked as having
    /// served the stop and may leave.
    pub fn update_tram_stops(&mut self, dt: f64) {
        for edge in &self.local_edges {
            let state = &mut self.edges[edge.index()];
            let Some(tram) = state.dwelling_tram else {
                continue;
            };
            state.tram_stop_countdown -= dt;
            let gone = self
                .vehicles
                .get(&tram)
                .map_or(true, |v| !v.active || v.current_edge() != *edge);
            if state.tram_stop_countdown <= 0. || gone {
                state.dwelling_tram = None;
                state.tram_stop_countdown = 0.;
                if let Some(vehicle) = self.vehicles.get_mut(&tram) {
                    vehicle.served_stop = Some(*edge);
                }
            }
        }
    }
}
