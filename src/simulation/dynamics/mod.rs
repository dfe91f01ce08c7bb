pub mod car_following;
pub mod lane_change;
pub mod reroute;

use rand::Rng;
use tracing::trace;

use crate::simulation::config::Config;
use crate::simulation::dynamics::car_following::{compute_drive, entry_lane, is_at_stop_line, Drive};
use crate::simulation::dynamics::lane_change::LaneChangeDecision;
use crate::simulation::dynamics::reroute::{reroute, update_jam_time, RerouteOutcome};
use crate::simulation::id::Id;
use crate::simulation::network::road_network::{Edge, Lane};
use crate::simulation::network::routing::Router;
use crate::simulation::traffic::{BorderGhost, Removal, TrafficNetwork};
use crate::simulation::vehicles::Vehicle;

/// Parameters of the vehicle dynamics, taken from the configuration once per run.
#[derive(Debug, Clone, PartialEq)]
pub struct DriveSettings {
    pub step_size: f64,
    pub look_ahead: f64,
    pub min_safety_gap: f64,
    pub min_safe_crossing_time: f64,
    pub jam_speed: f64,
    pub priority_lane_distance: f64,
    pub detection_range: f64,
    pub turn_speed: f64,
    pub tram_yielding: bool,
    pub tram_stop_seconds: f64,
    pub drive_on_left: bool,
    pub reroute_enabled: bool,
    pub max_num_reroute: u32,
}

impl From<&Config> for DriveSettings {
    fn from(config: &Config) -> Self {
        let simulation = &config.simulation;
        DriveSettings {
            step_size: config.step_size(),
            look_ahead: simulation.look_ahead_distance,
            min_safety_gap: simulation.min_safety_gap,
            min_safe_crossing_time: simulation.min_safe_crossing_time,
            jam_speed: simulation.jam_speed,
            priority_lane_distance: simulation.priority_lane_distance,
            detection_range: simulation.detection_range,
            turn_speed: simulation.turn_speed,
            tram_yielding: simulation.tram_yielding,
            tram_stop_seconds: simulation.tram_stop_seconds,
            drive_on_left: simulation.drive_on_left,
            reroute_enabled: config.reroute.enabled,
            max_num_reroute: config.reroute.max_num_reroute,
        }
    }
}

impl Default for DriveSettings {
    fn default() -> Self {
        DriveSettings::from(&Config::default())
    }
}

/// What happened to the vehicles of one pass, apart from plain movement.
#[derive(Debug, Default)]
pub struct PassOutcome {
    /// Vehicles which crossed onto an edge of a fellow, with the fellow's rank.
    pub handoffs: Vec<(u32, Vehicle)>,
    pub completed: usize,
    pub removed: usize,
    pub parked: usize,
}

impl PassOutcome {
    pub fn append(&mut self, other: PassOutcome) {
        self.handoffs.extend(other.handoffs);
        self.completed += other.completed;
        self.removed += other.removed;
        self.parked += other.parked;
    }
}

/// Reserves the lanes ahead of every priority vehicle for the current step.
pub fn reserve_priority_lanes(traffic: &mut TrafficNetwork, settings: &DriveSettings) {
    traffic.clear_priority_lanes();
    let network = traffic.network_arc();
    let mut reserved: Vec<Id<Lane>> = Vec::new();
    for vehicle in traffic.vehicles().filter(|v| v.active && v.is_priority()) {
        reserved.push(vehicle.lane);
        let index = network.lane(vehicle.lane).index as usize;
        let mut distance = network.edge(vehicle.current_edge()).length - vehicle.head_position;
        for leg in &vehicle.route[vehicle.leg + 1..] {
            if distance > settings.priority_lane_distance || !traffic.is_local(leg.edge) {
                break;
            }
            let edge = network.edge(leg.edge);
            reserved.push(edge.lane_at(index));
            distance += edge.length;
        }
    }
    for lane in reserved {
        traffic.lane_mut(lane).priority = true;
    }
}

/// Moves every active vehicle on `edges` which has not been moved in this step yet: detection,
/// jam timer and rerouting first, then the accelerations of all vehicles from the same state,
/// then positions, lane changes and finally the transitions at the ends of edges.
pub fn move_vehicles(
    traffic: &mut TrafficNetwork,
    router: &dyn Router,
    edges: &[Id<Edge>],
    step: u64,
    settings: &DriveSettings,
    rnd: &mut impl Rng,
) -> PassOutcome {
    let now = step as f64 * settings.step_size;
    let mut outcome = PassOutcome::default();

    let mut ids: Vec<Id<Vehicle>> = traffic
        .vehicles_on_edges(edges)
        .into_iter()
        .filter(|id| {
            traffic
                .vehicle(*id)
                .is_some_and(|v| v.active && v.last_moved_step != Some(step))
        })
        .collect();

    let mut over_limit = Vec::new();
    for id in &ids {
        detect(traffic, *id, settings);
        if let Some(vehicle) = traffic.vehicle_mut(*id) {
            update_jam_time(vehicle, settings);
        }
        if reroute(traffic, router, *id, settings) == RerouteOutcome::LimitExceeded {
            over_limit.push(*id);
        }
    }
    if !over_limit.is_empty() {
        outcome.removed += traffic
            .remove_active_vehicles(&over_limit, Removal::RerouteLimit)
            .len();
        ids.retain(|id| !over_limit.contains(id));
    }

    let drives: Vec<(Id<Vehicle>, Drive)> = ids
        .iter()
        .filter_map(|id| {
            let vehicle = traffic.vehicle(*id)?;
            Some((*id, compute_drive(traffic, vehicle, settings)))
        })
        .collect();

    for (id, drive) in &drives {
        if let Some(vehicle) = traffic.vehicle_mut(*id) {
            integrate(vehicle, drive, step, settings);
        }
    }
    traffic.sort_lanes(edges);

    for (id, drive) in &drives {
        let Some(vehicle) = traffic.vehicle(*id) else {
            continue;
        };
        let decision =
            lane_change::decide(traffic, vehicle, drive.desired_speed, now, settings, rnd);
        if decision != LaneChangeDecision::Same {
            change_lane(traffic, *id, decision, now);
        }
    }

    for id in &ids {
        end_of_edge(traffic, *id, now, settings, &mut outcome);
    }
    outcome
}

/// Sets the detection flags of the light at the end of the vehicle's edge and of lights ahead
/// of priority vehicles.
fn detect(traffic: &mut TrafficNetwork, id: Id<Vehicle>, settings: &DriveSettings) {
    let Some(vehicle) = traffic.vehicle(id) else {
        return;
    };
    let network = traffic.network_arc();
    let edge = network.edge(vehicle.current_edge());
    let remaining = edge.length - vehicle.head_position;

    let mut waiting = None;
    let mut priority = Vec::new();
    if traffic.edge(edge.id).light.is_some() && remaining <= settings.detection_range {
        waiting = Some(edge.id);
    }
    if vehicle.is_priority() {
        let mut distance = remaining;
        for (offset, leg) in vehicle.route[vehicle.leg..].iter().enumerate() {
            if offset > 0 {
                distance += network.edge(leg.edge).length;
            }
            if distance > settings.look_ahead || !traffic.is_local(leg.edge) {
                break;
            }
            if traffic.edge(leg.edge).light.is_some() {
                priority.push(leg.edge);
            }
        }
    }

    if let Some(edge) = waiting {
        traffic.edge_mut(edge).waiting_detected = true;
    }
    for edge in priority {
        traffic.edge_mut(edge).priority_detected = true;
    }
}

fn integrate(vehicle: &mut Vehicle, drive: &Drive, step: u64, settings: &DriveSettings) {
    let dt = settings.step_size;
    let mut speed = (vehicle.speed + drive.acceleration * dt).clamp(0., drive.desired_speed.max(0.));
    let mut acceleration = drive.acceleration;
    if let Some(limit) = drive.limit {
        let projected_gap = limit.distance - speed * dt + limit.speed * dt;
        if projected_gap < settings.min_safety_gap {
            speed = 0.;
            acceleration = 0.;
        }
    }
    vehicle.speed = speed;
    vehicle.acceleration = acceleration;
    vehicle.head_position += speed * dt;
    vehicle.travel_time += dt;
    vehicle.last_moved_step = Some(step);
}

fn change_lane(traffic: &mut TrafficNetwork, id: Id<Vehicle>, decision: LaneChangeDecision, now: f64) {
    let Some(vehicle) = traffic.vehicle(id) else {
        return;
    };
    let network = traffic.network_arc();
    let edge = network.edge(vehicle.current_edge());
    let index = network.lane(vehicle.lane).index as usize;
    let target = match decision {
        LaneChangeDecision::Same => return,
        LaneChangeDecision::TowardRoadside if index > 0 => edge.lanes[index - 1],
        LaneChangeDecision::AwayFromRoadside if index + 1 < edge.num_lanes() => edge.lanes[index + 1],
        _ => return,
    };

    traffic.detach(id);
    if let Some(vehicle) = traffic.vehicle_mut(id) {
        vehicle.lane = target;
        vehicle.last_lane_change = now;
    }
    traffic.attach(id);
    trace!("Vehicle {id} changed to lane {target}");
}

/// Stops at tram stops and stopovers, and moves vehicles which passed the end of their edge on
/// to the next edge, out of the simulation, or to a fellow.
fn end_of_edge(
    traffic: &mut TrafficNetwork,
    id: Id<Vehicle>,
    now: f64,
    settings: &DriveSettings,
    outcome: &mut PassOutcome,
) {
    let network = traffic.network_arc();
    loop {
        let Some(vehicle) = traffic.vehicle(id) else {
            return;
        };
        if !vehicle.active {
            return;
        }
        let edge = network.edge(vehicle.current_edge());
        let at_stop_line = is_at_stop_line(vehicle, edge.length);

        if vehicle.is_tram()
            && at_stop_line
            && network.node(edge.to).tram_stop
            && vehicle.served_stop != Some(edge.id)
        {
            traffic.start_dwelling(edge.id, id, settings.tram_stop_seconds);
            return;
        }

        let stopover = vehicle.current_leg().stopover;
        if stopover > 0. && (at_stop_line || vehicle.head_position >= edge.length) {
            if let Some(vehicle) = traffic.vehicle_mut(id) {
                let leg = vehicle.leg;
                vehicle.route[leg].stopover = 0.;
                vehicle.head_position = vehicle.head_position.min(edge.length);
            }
            traffic.park_vehicle(id, now + stopover);
            outcome.parked += 1;
            return;
        }

        if vehicle.head_position <= edge.length {
            return;
        }
        if vehicle.is_last_leg() {
            traffic.remove_active_vehicles(&[id], Removal::Completed);
            outcome.completed += 1;
            return;
        }

        let overshoot = vehicle.head_position - edge.length;
        let next = vehicle.route[vehicle.leg + 1].edge;
        let old_lane = vehicle.lane;
        let index = network.lane(old_lane).index as usize;
        let passed_group = traffic.lights.groups().approach(edge.id).map(|(g, _)| g);

        let lane = entry_lane(traffic, next, index).unwrap_or(network.edge(next).lane_at(index));
        if !traffic.is_local(next) {
            let owner = traffic.owner(next);
            let ghost = BorderGhost {
                vehicle: id,
                edge: next,
                end_position: overshoot - vehicle.length(),
                speed: vehicle.speed,
            };
            traffic.lane_mut(old_lane).last_vehicle_left = Some(ghost);
            for mut moved in traffic.remove_active_vehicles(&[id], Removal::Transferred) {
                moved.leg += 1;
                moved.previous_lane = Some(old_lane);
                moved.lane = lane;
                moved.head_position = overshoot;
                moved.active = true;
                if let Some(group) = passed_group {
                    moved.last_light_group_passed = group.internal();
                }
                outcome.handoffs.push((owner, moved));
            }
            return;
        }

        traffic.detach(id);
        if let Some(vehicle) = traffic.vehicle_mut(id) {
            vehicle.leg += 1;
            vehicle.previous_lane = Some(old_lane);
            vehicle.lane = lane;
            vehicle.head_position = overshoot;
            if let Some(group) = passed_group {
                vehicle.last_light_group_passed = group.internal();
            }
        }
        traffic.attach(id);
    }
}
