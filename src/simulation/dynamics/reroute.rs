use nohash_hasher::IntSet;
use tracing::debug;

use crate::simulation::dynamics::DriveSettings;
use crate::simulation::id::Id;
use crate::simulation::network::routing::Router;
use crate::simulation::traffic::TrafficNetwork;
use crate::simulation::vehicles::Vehicle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RerouteOutcome {
    /// No reason to look for another route.
    Unchanged,
    Rerouted,
    /// A reroute was triggered, but no usable alternative exists.
    NoAlternative,
    /// The vehicle exceeded the maximum number of reroutes and has to be removed.
    LimitExceeded,
}

/// Why a driver looks for another route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Jam,
    Blocked,
}

/// Advances the jam timer of the vehicle. It accumulates while the vehicle is slower than the
/// jam speed and starts over as soon as it is faster.
pub fn update_jam_time(vehicle: &mut Vehicle, settings: &DriveSettings) {
    if vehicle.speed < settings.jam_speed {
        vehicle.jam_time += settings.step_size;
    } else {
        vehicle.jam_time = 0.;
    }
}

/// Looks for a new route if the vehicle waited too long in a jam or a fully blocked edge lies
/// ahead. Jam triggers and route changes count against the reroute limit. A blocked road without
/// an alternative does not, the driver waits for it to clear.
pub fn reroute(
    traffic: &mut TrafficNetwork,
    router: &dyn Router,
    id: Id<Vehicle>,
    settings: &DriveSettings,
) -> RerouteOutcome {
    let Some(vehicle) = traffic.vehicle(id) else {
        return RerouteOutcome::Unchanged;
    };
    if !settings.reroute_enabled || vehicle.is_tram() || vehicle.is_last_leg() {
        return RerouteOutcome::Unchanged;
    }
    let trigger = if vehicle.jam_time > vehicle.profile.jam_patience {
        Trigger::Jam
    } else if blocked_edge_ahead(traffic, vehicle, settings) {
        Trigger::Blocked
    } else {
        return RerouteOutcome::Unchanged;
    };

    let num_reroutes = vehicle.num_reroutes + 1;
    if num_reroutes > settings.max_num_reroute {
        if let Some(vehicle) = traffic.vehicle_mut(id) {
            vehicle.num_reroutes = num_reroutes;
        }
        return RerouteOutcome::LimitExceeded;
    }

    let current = vehicle.current_edge();
    let old_next = vehicle.next_edge();
    let mut excluded: IntSet<_> = traffic
        .network()
        .edges
        .iter()
        .filter(|e| e.id != current && traffic.is_edge_blocked(e.id))
        .map(|e| e.id)
        .collect();
    if trigger == Trigger::Jam {
        excluded.extend(old_next);
    }
    let route = router.create_complete_route(
        current,
        vehicle.destination(),
        vehicle.vehicle_type,
        &excluded,
    );

    let Some(vehicle) = traffic.vehicle_mut(id) else {
        return RerouteOutcome::Unchanged;
    };
    if trigger == Trigger::Jam {
        vehicle.jam_time = 0.;
        vehicle.num_reroutes = num_reroutes;
    }
    match route {
        Some(legs) if legs.len() > 1 && Some(legs[1].edge) != old_next => {
            debug!(
                "Vehicle {id} rerouted after {trigger:?}, {} legs left",
                legs.len() - 1
            );
            vehicle.num_reroutes = num_reroutes;
            vehicle.replace_remaining_route(&legs[1..]);
            RerouteOutcome::Rerouted
        }
        _ => RerouteOutcome::NoAlternative,
    }
}

/// Whether a fully blocked local edge lies on the route within the look ahead distance.
fn blocked_edge_ahead(traffic: &TrafficNetwork, vehicle: &Vehicle, settings: &DriveSettings) -> bool {
    let network = traffic.network();
    let mut distance = network.edge(vehicle.current_edge()).length - vehicle.head_position;
    for leg in &vehicle.route[vehicle.leg + 1..] {
        if distance > settings.look_ahead || !traffic.is_local(leg.edge) {
            return false;
        }
        if traffic.is_edge_blocked(leg.edge) {
            return true;
        }
        distance += network.edge(leg.edge).length;
    }
    false
}

#[cfg(test)]
mod tests {
    use crate::simulation::dynamics::reroute::{reroute, update_jam_time, RerouteOutcome};
    use crate::simulation::dynamics::DriveSettings;
    use crate::simulation::id::Id;
    use crate::simulation::network::routing::EdgeRouter;
    use crate::simulation::vehicles::VehicleType;
    use crate::test_utils::{create_diamond_traffic, create_fork_traffic, place_vehicle};

    fn settings(max_num_reroute: u32) -> DriveSettings {
        DriveSettings {
            max_num_reroute,
            ..DriveSettings::default()
        }
    }

    #[test]
    fn jam_timer() {
        let mut traffic = create_diamond_traffic();
        let id = place_vehicle(&mut traffic, 1, VehicleType::Car, &[0, 1, 3, 5], 0, 50., 0.5);
        let settings = settings(3);

        let vehicle = traffic.vehicle_mut(id).unwrap();
        update_jam_time(vehicle, &settings);
        update_jam_time(vehicle, &settings);
        assert!((vehicle.jam_time - 2. * settings.step_size).abs() < 1e-9);
        vehicle.speed = 5.;
        update_jam_time(vehicle, &settings);
        assert_eq!(0., vehicle.jam_time);
    }

    #[test]
    fn reroute_around_blocked_edge() {
        let mut traffic = create_diamond_traffic();
        let router = EdgeRouter::new(traffic.network_arc(), Default::default(), false);
        let id = place_vehicle(&mut traffic, 1, VehicleType::Car, &[0, 1, 3, 5], 0, 80., 10.);
        assert_eq!(RerouteOutcome::Unchanged, reroute(&mut traffic, &router, id, &settings(3)));

        let lane = traffic.network().edge(Id::new(1)).lanes[0];
        traffic.set_lane_blocked(lane, true);
        assert_eq!(RerouteOutcome::Rerouted, reroute(&mut traffic, &router, id, &settings(3)));

        let vehicle = traffic.vehicle(id).unwrap();
        let edges: Vec<u64> = vehicle.route.iter().map(|l| l.edge.internal()).collect();
        assert_eq!(vec![0, 2, 4, 5], edges);
        assert_eq!(1, vehicle.num_reroutes);
    }

    #[test]
    fn reroute_cap_removes_vehicle() {
        let mut traffic = create_diamond_traffic();
        let router = EdgeRouter::new(traffic.network_arc(), Default::default(), false);
        let id = place_vehicle(&mut traffic, 1, VehicleType::Car, &[0, 1, 3, 5], 0, 20., 0.);
        let settings = settings(2);

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            let vehicle = traffic.vehicle_mut(id).unwrap();
            vehicle.jam_time = vehicle.profile.jam_patience + 1.;
            outcomes.push(reroute(&mut traffic, &router, id, &settings));
        }
        assert_eq!(RerouteOutcome::Rerouted, outcomes[0]);
        assert_ne!(RerouteOutcome::LimitExceeded, outcomes[1]);
        assert_eq!(RerouteOutcome::LimitExceeded, outcomes[2]);
        assert_eq!(3, traffic.vehicle(id).unwrap().num_reroutes);
    }

    #[test]
    fn keeps_route_when_next_edge_stays() {
        // the detour around the blocked edge starts after the next edge
        let mut traffic = create_fork_traffic();
        let router = EdgeRouter::new(traffic.network_arc(), Default::default(), false);
        let id = place_vehicle(&mut traffic, 1, VehicleType::Car, &[0, 1, 2, 4, 6], 0, 90., 5.);
        let lane = traffic.network().edge(Id::new(2)).lanes[0];
        traffic.set_lane_blocked(lane, true);

        for _ in 0..10 {
            assert_eq!(RerouteOutcome::NoAlternative, reroute(&mut traffic, &router, id, &settings(2)));
        }
        let vehicle = traffic.vehicle(id).unwrap();
        let edges: Vec<u64> = vehicle.route.iter().map(|l| l.edge.internal()).collect();
        assert_eq!(vec![0, 1, 2, 4, 6], edges);
        // waiting in front of the block does not use up reroutes
        assert_eq!(0, vehicle.num_reroutes);
    }

    #[test]
    fn disabled_reroute() {
        let mut traffic = create_diamond_traffic();
        let router = EdgeRouter::new(traffic.network_arc(), Default::default(), false);
        let id = place_vehicle(&mut traffic, 1, VehicleType::Car, &[0, 1, 3, 5], 0, 20., 0.);
        traffic.vehicle_mut(id).unwrap().jam_time = 1000.;
        let settings = DriveSettings {
            reroute_enabled: false,
            ..DriveSettings::default()
        };
        assert_eq!(RerouteOutcome::Unchanged, reroute(&mut traffic, &router, id, &settings));
    }
}
