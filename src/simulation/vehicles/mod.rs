use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::simulation::id::Id;
use crate::simulation::network::road_network::{Edge, Lane};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VehicleType {
    Car,
    Bike,
    Truck,
    Bus,
    Tram,
    /// Emergency vehicle. Ignores lights and gets lanes reserved ahead of it.
    Priority,
    /// Stand-in for a vehicle simulated by another worker.
    Virtual,
}

/// Categories of randomly generated background traffic, each with its own quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VehicleCategory {
    Private,
    Tram,
    Bus,
}

impl VehicleType {
    pub fn length(&self) -> f64 {
        match self {
            VehicleType::Car => 4.5,
            VehicleType::Bike => 1.8,
            VehicleType::Truck => 10.,
            VehicleType::Bus => 12.,
            VehicleType::Tram => 30.,
            VehicleType::Priority => 5.5,
            VehicleType::Virtual => 0.,
        }
    }

    pub fn max_speed(&self) -> f64 {
        match self {
            VehicleType::Car => 33.,
            VehicleType::Bike => 6.,
            VehicleType::Truck => 25.,
            VehicleType::Bus => 22.,
            VehicleType::Tram => 20.,
            VehicleType::Priority => 36.,
            VehicleType::Virtual => f64::MAX,
        }
    }

    pub fn max_acceleration(&self) -> f64 {
        match self {
            VehicleType::Car => 2.5,
            VehicleType::Bike => 1.,
            VehicleType::Truck | VehicleType::Bus => 1.5,
            VehicleType::Tram => 1.2,
            VehicleType::Priority => 3.,
            VehicleType::Virtual => 0.,
        }
    }

    pub fn comfortable_deceleration(&self) -> f64 {
        match self {
            VehicleType::Car => 3.,
            VehicleType::Bike => 2.,
            VehicleType::Truck | VehicleType::Bus => 2.5,
            VehicleType::Tram => 2.,
            VehicleType::Priority => 4.,
            VehicleType::Virtual => 0.,
        }
    }

    pub fn category(&self) -> Option<VehicleCategory> {
        match self {
            VehicleType::Car | VehicleType::Bike | VehicleType::Truck => {
                Some(VehicleCategory::Private)
            }
            VehicleType::Bus => Some(VehicleCategory::Bus),
            VehicleType::Tram => Some(VehicleCategory::Tram),
            VehicleType::Priority | VehicleType::Virtual => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverKind {
    Normal,
    Timid,
    Aggressive,
}

/// Parameters of the car following and lane changing models for one driver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriverProfile {
    pub kind: DriverKind,
    /// IDM desired time headway in seconds.
    pub time_headway: f64,
    /// IDM minimum gap to the vehicle in front in meters.
    pub min_gap: f64,
    pub acceleration_factor: f64,
    pub desired_speed_factor: f64,
    /// MOBIL politeness.
    pub politeness: f64,
    /// MOBIL acceleration gain needed for a lane change.
    pub lane_change_threshold: f64,
    /// Seconds between two lane changes.
    pub min_lane_change_interval: f64,
    /// Seconds spent in a jam before the driver looks for another route.
    pub jam_patience: f64,
}

impl DriverProfile {
    pub fn normal() -> Self {
        DriverProfile {
            kind: DriverKind::Normal,
            time_headway: 1.5,
            min_gap: 3.,
            acceleration_factor: 1.,
            desired_speed_factor: 1.,
            politeness: 0.3,
            lane_change_threshold: 0.2,
            min_lane_change_interval: 3.,
            jam_patience: 60.,
        }
    }

    pub fn timid() -> Self {
        DriverProfile {
            kind: DriverKind::Timid,
            time_headway: 2.,
            min_gap: 4.,
            acceleration_factor: 0.8,
            desired_speed_factor: 0.9,
            politeness: 0.5,
            lane_change_threshold: 0.4,
            min_lane_change_interval: 5.,
            jam_patience: 120.,
        }
    }

    pub fn aggressive() -> Self {
        DriverProfile {
            kind: DriverKind::Aggressive,
            time_headway: 1.,
            min_gap: 2.5,
            acceleration_factor: 1.2,
            desired_speed_factor: 1.1,
            politeness: 0.1,
            lane_change_threshold: 0.1,
            min_lane_change_interval: 1.5,
            jam_patience: 30.,
        }
    }

    pub fn random(rnd: &mut impl Rng) -> Self {
        let draw: f64 = rnd.random();
        if draw < 0.6 {
            DriverProfile::normal()
        } else if draw < 0.8 {
            DriverProfile::timid()
        } else {
            DriverProfile::aggressive()
        }
    }
}

impl Default for DriverProfile {
    fn default() -> Self {
        DriverProfile::normal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RouteLeg {
    pub edge: Id<Edge>,
    /// Seconds to stay parked at the end of this edge, 0 for none.
    pub stopover: f64,
}

impl RouteLeg {
    pub fn new(edge: Id<Edge>) -> Self {
        RouteLeg { edge, stopover: 0. }
    }

    pub fn with_stopover(edge: Id<Edge>, stopover: f64) -> Self {
        RouteLeg { edge, stopover }
    }
}

/// Full state of one vehicle. This is also what is sent to a fellow worker on handoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: Id<Vehicle>,
    pub vehicle_type: VehicleType,
    pub profile: DriverProfile,
    pub route: Vec<RouteLeg>,
    pub leg: usize,
    pub lane: Id<Lane>,
    /// Lane the vehicle used before entering the current edge.
    pub previous_lane: Option<Id<Lane>>,
    pub head_position: f64,
    pub speed: f64,
    pub acceleration: f64,
    pub active: bool,
    /// Created from a route definition instead of being generated randomly.
    pub external: bool,
    pub foreground: bool,
    pub num_reroutes: u32,
    /// Simulation time in seconds when the route was started.
    pub route_start_time: f64,
    pub travel_time: f64,
    pub jam_time: f64,
    pub last_lane_change: f64,
    /// Id of the last light group passed, 0 for none.
    pub last_light_group_passed: u64,
    /// Edge at whose end the tram stop was already served.
    pub served_stop: Option<Id<Edge>>,
    pub earliest_departure: f64,
    pub last_moved_step: Option<u64>,
}

impl Vehicle {
    pub fn new(
        id: Id<Vehicle>,
        vehicle_type: VehicleType,
        profile: DriverProfile,
        route: Vec<RouteLeg>,
        lane: Id<Lane>,
    ) -> Self {
        Vehicle {
            id,
            vehicle_type,
            profile,
            route,
            leg: 0,
            lane,
            previous_lane: None,
            head_position: 0.,
            speed: 0.,
            acceleration: 0.,
            active: false,
            external: false,
            foreground: false,
            num_reroutes: 0,
            route_start_time: 0.,
            travel_time: 0.,
            jam_time: 0.,
            last_lane_change: f64::MIN,
            last_light_group_passed: 0,
            served_stop: None,
            earliest_departure: 0.,
            last_moved_step: None,
        }
    }

    pub fn length(&self) -> f64 {
        self.vehicle_type.length()
    }

    pub fn rear_position(&self) -> f64 {
        self.head_position - self.length()
    }

    pub fn current_edge(&self) -> Id<Edge> {
        self.route[self.leg].edge
    }

    pub fn current_leg(&self) -> &RouteLeg {
        &self.route[self.leg]
    }

    pub fn next_edge(&self) -> Option<Id<Edge>> {
        self.route.get(self.leg + 1).map(|l| l.edge)
    }

    pub fn destination(&self) -> Id<Edge> {
        self.route[self.route.len() - 1].edge
    }

    pub fn is_last_leg(&self) -> bool {
        self.leg + 1 >= self.route.len()
    }

    pub fn remaining_legs(&self) -> usize {
        self.route.len() - self.leg
    }

    pub fn is_priority(&self) -> bool {
        self.vehicle_type == VehicleType::Priority
    }

    pub fn is_tram(&self) -> bool {
        self.vehicle_type == VehicleType::Tram
    }

    pub fn max_acceleration(&self) -> f64 {
        self.vehicle_type.max_acceleration() * self.profile.acceleration_factor
    }

    pub fn comfortable_deceleration(&self) -> f64 {
        self.vehicle_type.comfortable_deceleration()
    }

    /// Speed the driver wants to go on a road with the given free flow speed. Never above the
    /// free flow speed, so the profile factor only makes drivers slower.
    pub fn desired_speed(&self, free_flow_speed: f64) -> f64 {
        (free_flow_speed * self.profile.desired_speed_factor)
            .min(free_flow_speed)
            .min(self.vehicle_type.max_speed())
    }

    /// Replaces everything after the current leg with `legs`, keeping the stopover of the final
    /// destination.
    pub fn replace_remaining_route(&mut self, legs: &[RouteLeg]) {
        let final_stopover = self.route[self.route.len() - 1].stopover;
        self.route.truncate(self.leg + 1);
        self.route.extend_from_slice(legs);
        if let Some(last) = self.route.last_mut() {
            last.stopover = final_stopover;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::simulation::id::Id;
    use crate::simulation::vehicles::{
        DriverProfile, RouteLeg, Vehicle, VehicleCategory, VehicleType,
    };

    #[test]
    fn replace_remaining_route() {
        let route = vec![
            RouteLeg::new(Id::new(0)),
            RouteLeg::new(Id::new(1)),
            RouteLeg::with_stopover(Id::new(2), 30.),
        ];
        let mut vehicle = Vehicle::new(
            Id::new(1),
            VehicleType::Car,
            DriverProfile::normal(),
            route,
            Id::new(0),
        );
        vehicle.leg = 1;
        vehicle.replace_remaining_route(&[RouteLeg::new(Id::new(5)), RouteLeg::new(Id::new(2))]);

        let edges: Vec<u64> = vehicle.route.iter().map(|l| l.edge.internal()).collect();
        assert_eq!(vec![0, 1, 5, 2], edges);
        assert_eq!(30., vehicle.route[3].stopover);
        assert_eq!(Some(Id::new(5)), vehicle.next_edge());
        assert_eq!(3, vehicle.remaining_legs());
    }

    #[test]
    fn categories() {
        assert_eq!(Some(VehicleCategory::Private), VehicleType::Truck.category());
        assert_eq!(Some(VehicleCategory::Tram), VehicleType::Tram.category());
        assert_eq!(None, VehicleType::Priority.category());
    }

    #[test]
    fn desired_speed_is_capped_by_vehicle_and_road() {
        let mut vehicle = Vehicle::new(
            Id::new(1),
            VehicleType::Bike,
            DriverProfile::aggressive(),
            vec![RouteLeg::new(Id::new(0))],
            Id::new(0),
        );
        assert_eq!(6., vehicle.desired_speed(13.89));
        vehicle.vehicle_type = VehicleType::Car;
        assert_eq!(10., vehicle.desired_speed(10.));
        vehicle.profile = DriverProfile::timid();
        assert!((vehicle.desired_speed(10.) - 9.).abs() < 1e-9);
    }
}
