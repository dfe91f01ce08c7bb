use rand::Rng;

use crate::simulation::dynamics::car_following::vehicle_acceleration;
use crate::simulation::dynamics::DriveSettings;
use crate::simulation::id::Id;
use crate::simulation::network::road_network::{Edge, Lane};
use crate::simulation::traffic::TrafficNetwork;
use crate::simulation::vehicles::Vehicle;

const TURN_INCENTIVE: f64 = 10.;
const PRIORITY_INCENTIVE: f64 = 20.;
const BLOCKED_INCENTIVE: f64 = 30.;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneChangeDecision {
    Same,
    TowardRoadside,
    AwayFromRoadside,
}

/// MOBIL lane change decision for one vehicle. Compares the acceleration on the current lane
/// with the adjacent lanes, weighing in the disadvantage of the new follower and the incentives
/// to be on a lane which allows the next turn, to clear a lane reserved for a priority vehicle
/// and to leave a blocked lane.
pub fn decide(
    traffic: &TrafficNetwork,
    vehicle: &Vehicle,
    desired_speed: f64,
    now: f64,
    settings: &DriveSettings,
    rnd: &mut impl Rng,
) -> LaneChangeDecision {
    let network = traffic.network();
    let edge = network.edge(vehicle.current_edge());
    if vehicle.is_tram()
        || edge.num_lanes() < 2
        || now - vehicle.last_lane_change < vehicle.profile.min_lane_change_interval
    {
        return LaneChangeDecision::Same;
    }

    let index = network.lane(vehicle.lane).index as usize;
    let current_acceleration = lane_acceleration(traffic, vehicle, vehicle.lane, desired_speed);
    let current_incentive = incentive(traffic, vehicle, edge, index, settings);

    let mut candidates = Vec::with_capacity(2);
    if index > 0 {
        candidates.push((LaneChangeDecision::TowardRoadside, index - 1));
    }
    if index + 1 < edge.num_lanes() {
        candidates.push((LaneChangeDecision::AwayFromRoadside, index + 1));
    }

    let gains: Vec<(LaneChangeDecision, f64)> = candidates
        .into_iter()
        .filter_map(|(decision, target)| {
            let gain = gain(traffic, vehicle, edge.lanes[target], desired_speed)?;
            let total = gain - current_acceleration - vehicle.profile.lane_change_threshold
                + incentive(traffic, vehicle, edge, target, settings)
                - current_incentive;
            (total > 0.).then_some((decision, total))
        })
        .collect();

    match gains.as_slice() {
        [] => LaneChangeDecision::Same,
        [(decision, _)] => *decision,
        [(first, a), (second, b)] => {
            if a > b {
                *first
            } else if b > a {
                *second
            } else if rnd.random_bool(0.5) {
                *first
            } else {
                *second
            }
        }
        _ => LaneChangeDecision::Same,
    }
}

/// Acceleration on `lane` minus the politeness weighted disadvantage for the new follower there.
/// `None` if the change is unsafe.
fn gain(
    traffic: &TrafficNetwork,
    vehicle: &Vehicle,
    lane: Id<Lane>,
    desired_speed: f64,
) -> Option<f64> {
    if traffic.lane(lane).blocked {
        return None;
    }
    let min_gap = vehicle.profile.min_gap;
    let head = vehicle.head_position;

    if let Some(front) = traffic.leader_on_lane(lane, head, vehicle.id) {
        if front.rear_position() - head < min_gap {
            return None;
        }
    }

    let mut disadvantage = 0.;
    if let Some(back) = traffic.follower_on_lane(lane, head, vehicle.id) {
        let back_gap = vehicle.rear_position() - back.head_position;
        if back_gap < min_gap {
            return None;
        }
        let back_edge = traffic.network().edge(back.current_edge());
        let back_desired = back.desired_speed(back_edge.free_flow_speed);
        let old = lane_acceleration(traffic, back, lane, back_desired);
        let new = vehicle_acceleration(back, back_desired, Some((back_gap, vehicle.speed)));
        if new < -back.comfortable_deceleration() {
            return None;
        }
        disadvantage = old - new;
    }

    let acceleration = lane_acceleration(traffic, vehicle, lane, desired_speed);
    Some(acceleration - vehicle.profile.politeness * disadvantage)
}

/// Acceleration of `vehicle` behind the vehicle in front of it on `lane`, on this edge only.
fn lane_acceleration(
    traffic: &TrafficNetwork,
    vehicle: &Vehicle,
    lane: Id<Lane>,
    desired_speed: f64,
) -> f64 {
    let front = traffic
        .leader_on_lane(lane, vehicle.head_position, vehicle.id)
        .map(|f| (f.rear_position() - vehicle.head_position, f.speed));
    vehicle_acceleration(vehicle, desired_speed, front)
}

fn incentive(
    traffic: &TrafficNetwork,
    vehicle: &Vehicle,
    edge: &Edge,
    index: usize,
    settings: &DriveSettings,
) -> f64 {
    let lane = traffic.lane(edge.lanes[index]);
    let mut incentive = 0.;
    if let Some(next) = vehicle.next_edge() {
        let turn = traffic.network().turn(edge.id, next, settings.drive_on_left);
        let allowed = edge.lanes_for_turn(turn);
        let lanes_off = if index < allowed.start {
            allowed.start - index
        } else if index >= allowed.end {
            index + 1 - allowed.end
        } else {
            0
        };
        incentive -= TURN_INCENTIVE * lanes_off as f64;
    }
    if lane.priority && !vehicle.is_priority() {
        incentive -= PRIORITY_INCENTIVE;
    }
    if lane.blocked {
        incentive -= BLOCKED_INCENTIVE;
    }
    incentive
}

#[cfg(test)]
mod tests {
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    use crate::simulation::dynamics::lane_change::{decide, LaneChangeDecision};
    use crate::simulation::dynamics::DriveSettings;
    use crate::simulation::id::Id;
    use crate::simulation::vehicles::VehicleType;
    use crate::test_utils::{corridor_traffic, place_vehicle, place_vehicle_on_lane};

    fn decision(traffic: &crate::simulation::traffic::TrafficNetwork, id: u64) -> LaneChangeDecision {
        let vehicle = traffic.vehicle(Id::new(id)).unwrap();
        decide(
            traffic,
            vehicle,
            13.89,
            100.,
            &DriveSettings::default(),
            &mut SmallRng::seed_from_u64(1),
        )
    }

    #[test]
    fn overtake_slow_leader() {
        let mut traffic = corridor_traffic(2, 300., 2);
        place_vehicle(&mut traffic, 1, VehicleType::Car, &[0, 1], 0, 50., 12.);
        place_vehicle(&mut traffic, 2, VehicleType::Truck, &[0, 1], 0, 70., 0.);

        assert_eq!(LaneChangeDecision::AwayFromRoadside, decision(&traffic, 1));
    }

    #[test]
    fn refuse_with_vehicle_close_behind() {
        let mut traffic = corridor_traffic(2, 300., 2);
        place_vehicle(&mut traffic, 1, VehicleType::Car, &[0, 1], 0, 50., 12.);
        place_vehicle(&mut traffic, 2, VehicleType::Truck, &[0, 1], 0, 70., 0.);
        // head 2m behind the rear of vehicle 1 on the target lane
        place_vehicle_on_lane(&mut traffic, 3, VehicleType::Car, &[0, 1], 0, 1, 43.5, 12.);

        assert_eq!(LaneChangeDecision::Same, decision(&traffic, 1));
    }

    #[test]
    fn leave_blocked_lane() {
        let mut traffic = corridor_traffic(2, 300., 2);
        let lane = traffic.network().edge(Id::new(0)).lanes[0];
        traffic.set_lane_blocked(lane, true);
        place_vehicle(&mut traffic, 1, VehicleType::Car, &[0, 1], 0, 50., 5.);

        assert_eq!(LaneChangeDecision::AwayFromRoadside, decision(&traffic, 1));
    }

    #[test]
    fn respect_interval_and_trams() {
        let mut traffic = corridor_traffic(2, 300., 2);
        let lane = traffic.network().edge(Id::new(0)).lanes[0];
        traffic.set_lane_blocked(lane, true);
        place_vehicle(&mut traffic, 1, VehicleType::Car, &[0, 1], 0, 50., 5.);
        place_vehicle(&mut traffic, 2, VehicleType::Tram, &[0, 1], 0, 150., 5.);
        traffic.vehicle_mut(Id::new(1)).unwrap().last_lane_change = 99.;

        assert_eq!(LaneChangeDecision::Same, decision(&traffic, 1));
        assert_eq!(LaneChangeDecision::Same, decision(&traffic, 2));
    }

    #[test]
    fn stay_on_free_road() {
        let mut traffic = corridor_traffic(2, 300., 2);
        place_vehicle(&mut traffic, 1, VehicleType::Car, &[0, 1], 0, 50., 12.);
        assert_eq!(LaneChangeDecision::Same, decision(&traffic, 1));
    }
}
