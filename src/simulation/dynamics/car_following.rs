use crate::simulation::dynamics::DriveSettings;
use crate::simulation::id::Id;
use crate::simulation::network::road_network::{Edge, Lane, RoadNetwork, Turn};
use crate::simulation::traffic::lights::LightColor;
use crate::simulation::traffic::TrafficNetwork;
use crate::simulation::vehicles::Vehicle;

/// Strongest braking the model ever applies, in m/s².
pub const MAX_DECELERATION: f64 = 9.;

/// Below this speed a vehicle counts as standing.
pub const STOPPED_SPEED: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImpedimentKind {
    Vehicle,
    Block,
    Light,
    Intersection,
    TramStop,
    Stopover,
}

/// Something the driver has to keep a gap to. `distance` is the gap between the head of the
/// vehicle and the obstacle, `speed` the speed of the obstacle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Impediment {
    pub kind: ImpedimentKind,
    pub distance: f64,
    pub speed: f64,
}

impl Impediment {
    fn standing(kind: ImpedimentKind, distance: f64) -> Self {
        Impediment {
            kind,
            distance,
            speed: 0.,
        }
    }
}

/// Outcome of the car following model for one vehicle in one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Drive {
    pub acceleration: f64,
    /// Desired speed after the cap for an upcoming turn.
    pub desired_speed: f64,
    /// The closest impediment, if any.
    pub limit: Option<Impediment>,
}

/// Intelligent driver model. `front` is the gap to and the speed of the vehicle in front.
pub fn idm_acceleration(
    speed: f64,
    desired_speed: f64,
    max_acceleration: f64,
    comfortable_deceleration: f64,
    min_gap: f64,
    time_headway: f64,
    front: Option<(f64, f64)>,
) -> f64 {
    let free = 1. - (speed / desired_speed.max(STOPPED_SPEED)).powi(4);
    let interaction = match front {
        None => 0.,
        Some((gap, _)) if gap <= 0. => return -MAX_DECELERATION,
        Some((gap, front_speed)) => {
            let dynamic = speed * time_headway
                + speed * (speed - front_speed)
                    / (2. * (max_acceleration * comfortable_deceleration).sqrt());
            let desired_gap = min_gap + dynamic.max(0.);
            (desired_gap / gap).powi(2)
        }
    };
    (max_acceleration * (free - interaction)).max(-MAX_DECELERATION)
}

/// IDM with the parameters of `vehicle`.
pub fn vehicle_acceleration(vehicle: &Vehicle, desired_speed: f64, front: Option<(f64, f64)>) -> f64 {
    idm_acceleration(
        vehicle.speed,
        desired_speed,
        vehicle.max_acceleration(),
        vehicle.comfortable_deceleration(),
        vehicle.profile.min_gap,
        vehicle.profile.time_headway,
        front,
    )
}

/// Computes the acceleration of `vehicle` against the closest thing it has to react to within
/// the look ahead distance. An upcoming turn lowers the desired speed instead. Pure function of
/// the current traffic state.
pub fn compute_drive(traffic: &TrafficNetwork, vehicle: &Vehicle, settings: &DriveSettings) -> Drive {
    let network = traffic.network();
    let edge = network.edge(vehicle.current_edge());
    let remaining = edge.length - vehicle.head_position;

    let mut desired_speed = vehicle.desired_speed(edge.free_flow_speed);
    if let Some(next) = vehicle.next_edge() {
        if remaining < settings.look_ahead
            && network.turn(edge.id, next, settings.drive_on_left) != Turn::Straight
        {
            let turn_speed = settings.turn_speed.min(desired_speed);
            let cap = (turn_speed.powi(2) + 2. * vehicle.comfortable_deceleration() * remaining.max(0.))
                .sqrt();
            desired_speed = desired_speed.min(cap);
        }
    }

    let limit = closest(find_impediments(traffic, vehicle, settings));
    Drive {
        acceleration: vehicle_acceleration(
            vehicle,
            desired_speed,
            limit.map(|i| (i.distance, i.speed)),
        ),
        desired_speed,
        limit,
    }
}

/// The impediment closest to the driver. Of two at the same distance the slower one counts.
fn closest(impediments: Vec<Impediment>) -> Option<Impediment> {
    impediments.into_iter().min_by(|a, b| {
        a.distance
            .total_cmp(&b.distance)
            .then(a.speed.total_cmp(&b.speed))
    })
}

/// Collects the impediments on the current edge and on the following legs of the route until
/// the look ahead distance, the end of the route or the first edge of another worker.
pub fn find_impediments(
    traffic: &TrafficNetwork,
    vehicle: &Vehicle,
    settings: &DriveSettings,
) -> Vec<Impediment> {
    let network = traffic.network();
    let edge = network.edge(vehicle.current_edge());
    let remaining = edge.length - vehicle.head_position;
    let mut impediments = Vec::new();

    let mut found_vehicle = false;
    if let Some(leader) = traffic.leader_on_lane(vehicle.lane, vehicle.head_position, vehicle.id) {
        impediments.push(Impediment {
            kind: ImpedimentKind::Vehicle,
            distance: leader.rear_position() - vehicle.head_position,
            speed: leader.speed,
        });
        found_vehicle = true;
    }
    if traffic.lane(vehicle.lane).blocked {
        impediments.push(Impediment::standing(ImpedimentKind::Block, remaining));
    }
    impediments.extend(end_of_edge_impediments(traffic, vehicle, vehicle.leg, remaining));
    impediments.extend(intersection_impediment(traffic, vehicle, remaining, settings));
    impediments.extend(tram_yield_impediment(traffic, vehicle, settings));

    let mut offset = remaining;
    let mut leg = vehicle.leg;
    let mut last_lane = vehicle.lane;
    let lane_index = network.lane(vehicle.lane).index as usize;
    while !found_vehicle && offset < settings.look_ahead && leg + 1 < vehicle.route.len() {
        let next = vehicle.route[leg + 1].edge;
        if !traffic.is_local(next) {
            if let Some(ghost) = traffic.lane(last_lane).last_vehicle_left {
                if ghost.edge == next && !ghost.is_sentinel() {
                    impediments.push(Impediment {
                        kind: ImpedimentKind::Vehicle,
                        distance: offset + ghost.end_position,
                        speed: ghost.speed,
                    });
                }
            }
            break;
        }

        let Some(lane) = entry_lane(traffic, next, lane_index) else {
            impediments.push(Impediment::standing(ImpedimentKind::Block, offset));
            break;
        };
        if let Some(rear) = traffic.rearmost_on_lane(lane) {
            impediments.push(Impediment {
                kind: ImpedimentKind::Vehicle,
                distance: offset + rear.rear_position(),
                speed: rear.speed,
            });
            found_vehicle = true;
        }

        let next_length = network.edge(next).length;
        leg += 1;
        if offset + next_length < settings.look_ahead {
            impediments.extend(end_of_edge_impediments(
                traffic,
                vehicle,
                leg,
                offset + next_length,
            ));
        }
        offset += next_length;
        last_lane = lane;
    }
    impediments
}

/// Lane a vehicle coming from lane `index` of the previous edge takes on `edge`: the lane with the
/// same offset from the roadside, or the closest one which is not blocked.
pub fn entry_lane(traffic: &TrafficNetwork, edge: Id<Edge>, index: usize) -> Option<Id<Lane>> {
    let e = traffic.network().edge(edge);
    let preferred = index.min(e.num_lanes() - 1);
    (0..e.num_lanes())
        .filter(|i| !traffic.lane(e.lanes[*i]).blocked)
        .min_by_key(|i| i.abs_diff(preferred))
        .map(|i| e.lanes[i])
}

/// Lights, tram stops and stopovers at the end of the edge of `leg`, `distance` meters ahead.
fn end_of_edge_impediments(
    traffic: &TrafficNetwork,
    vehicle: &Vehicle,
    leg: usize,
    distance: f64,
) -> Vec<Impediment> {
    let network = traffic.network();
    let edge = network.edge(vehicle.route[leg].edge);
    let mut impediments = Vec::new();

    if let Some(color) = traffic.edge(edge.id).light {
        if let Some(impediment) = light_impediment(vehicle, color, distance) {
            impediments.push(impediment);
        }
    }
    if vehicle.is_tram()
        && network.node(edge.to).tram_stop
        && vehicle.served_stop != Some(edge.id)
    {
        impediments.push(Impediment::standing(ImpedimentKind::TramStop, distance));
    }
    if vehicle.route[leg].stopover > 0. {
        impediments.push(Impediment::standing(ImpedimentKind::Stopover, distance));
    }
    impediments
}

/// Red means stop. Yellow means stop if the vehicle can do so comfortably. Priority vehicles
/// ignore lights.
pub fn light_impediment(vehicle: &Vehicle, color: LightColor, distance: f64) -> Option<Impediment> {
    if vehicle.is_priority() {
        return None;
    }
    let stops = match color {
        LightColor::Green => false,
        LightColor::Red | LightColor::KeepRed => true,
        LightColor::Yellow => can_stop_comfortably(vehicle, distance),
    };
    stops.then(|| Impediment::standing(ImpedimentKind::Light, distance))
}

fn can_stop_comfortably(vehicle: &Vehicle, distance: f64) -> bool {
    vehicle.speed.powi(2) / (2. * vehicle.comfortable_deceleration()) <= distance
}

/// Checks the other approaches of an unsignalled intersection at the end of the current edge
/// for vehicles the driver has to give way to.
fn intersection_impediment(
    traffic: &TrafficNetwork,
    vehicle: &Vehicle,
    remaining: f64,
    settings: &DriveSettings,
) -> Option<Impediment> {
    let network = traffic.network();
    let edge = network.edge(vehicle.current_edge());
    if vehicle.is_priority()
        || vehicle.is_last_leg()
        || remaining > settings.look_ahead
        || traffic.edge(edge.id).light.is_some()
        || !can_stop_comfortably(vehicle, remaining)
    {
        return None;
    }
    let node = network.node(edge.to);
    if node.in_edges.len() < 2 {
        return None;
    }
    let standing = is_at_stop_line(vehicle, edge.length);

    for other in node.in_edges.iter().filter(|e| **e != edge.id) {
        if !traffic.is_local(*other) {
            continue;
        }
        let other_edge = network.edge(*other);
        let yields = must_yield(network, edge, other_edge, settings.drive_on_left);
        for lane in &other_edge.lanes {
            let Some(front) = traffic.lane(*lane).vehicles.first() else {
                continue;
            };
            let Some(front) = traffic.vehicle(*front) else {
                continue;
            };
            let distance = other_edge.length - front.head_position;
            if distance > settings.look_ahead {
                continue;
            }
            if front.is_priority() {
                return Some(Impediment::standing(ImpedimentKind::Intersection, remaining));
            }
            if standing && is_at_stop_line(front, other_edge.length) {
                // both wait at their stop lines, the lower id goes first
                if front.id < vehicle.id {
                    return Some(Impediment::standing(ImpedimentKind::Intersection, remaining));
                }
                continue;
            }
            let arrival = distance / front.speed.max(STOPPED_SPEED);
            if yields && arrival < settings.min_safe_crossing_time {
                return Some(Impediment::standing(ImpedimentKind::Intersection, remaining));
            }
        }
    }
    None
}

/// Right of way at unsignalled intersections: roundabouts first, then the higher road class,
/// then whoever comes from the roadside.
pub fn must_yield(network: &RoadNetwork, mine: &Edge, other: &Edge, drive_on_left: bool) -> bool {
    if mine.roundabout != other.roundabout {
        return !mine.roundabout;
    }
    if mine.class.rank() != other.class.rank() {
        return mine.class.rank() < other.class.rank();
    }
    let from = network.node(other.from);
    network.is_on_roadside(mine.id, from.x, from.y, drive_on_left)
}

/// Vehicles stop behind a tram dwelling at a stop on their edge or on the tram track alongside,
/// to let passengers cross.
fn tram_yield_impediment(
    traffic: &TrafficNetwork,
    vehicle: &Vehicle,
    settings: &DriveSettings,
) -> Option<Impediment> {
    if vehicle.is_tram() || !settings.tram_yielding {
        return None;
    }
    let network = traffic.network();
    let edge = network.edge(vehicle.current_edge());

    let tracks = std::iter::once((edge.id, 1.)).chain(
        edge.parallel_tram_edge
            .map(|p| (p, edge.length / network.edge(p).length)),
    );
    tracks
        .filter_map(|(track, scale)| {
            let tram = traffic.vehicle(traffic.edge(track).dwelling_tram?)?;
            let rear = tram.rear_position() * scale;
            (vehicle.head_position <= rear)
                .then(|| Impediment::standing(ImpedimentKind::TramStop, rear - vehicle.head_position))
        })
        .min_by(|a, b| a.distance.total_cmp(&b.distance))
}

/// Whether a standing vehicle has reached a stop line at the end of its edge.
pub fn is_at_stop_line(vehicle: &Vehicle, edge_length: f64) -> bool {
    vehicle.speed < STOPPED_SPEED
        && edge_length - vehicle.head_position <= vehicle.profile.min_gap + 2.
}

#[cfg(test)]
mod tests {
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    use crate::simulation::dynamics::car_following::{
        compute_drive, find_impediments, idm_acceleration, must_yield, vehicle_acceleration,
        ImpedimentKind, MAX_DECELERATION,
    };
    use crate::simulation::dynamics::{move_vehicles, DriveSettings};
    use crate::simulation::id::Id;
    use crate::simulation::network::routing::EdgeRouter;
    use crate::simulation::traffic::lights::LightColor;
    use crate::simulation::vehicles::VehicleType;
    use crate::test_utils::{corridor_traffic, create_t_junction, place_vehicle};
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn idm_free_road() {
        assert_approx_eq!(2., idm_acceleration(0., 10., 2., 3., 2., 1.5, None));
        assert_approx_eq!(0., idm_acceleration(10., 10., 2., 3., 2., 1.5, None));
        assert!(idm_acceleration(12., 10., 2., 3., 2., 1.5, None) < 0.);
    }

    #[test]
    fn idm_brakes_for_standing_obstacle() {
        let far = idm_acceleration(10., 15., 2., 3., 2., 1.5, Some((200., 10.)));
        let close = idm_acceleration(10., 15., 2., 3., 2., 1.5, Some((10., 0.)));
        assert!(far > 0.);
        assert!(close < -3.);
        assert_eq!(-MAX_DECELERATION, idm_acceleration(10., 15., 2., 3., 2., 1.5, Some((0., 0.))));
    }

    #[test]
    fn leader_on_next_edge() {
        let mut traffic = corridor_traffic(3, 100., 1);
        let id = place_vehicle(&mut traffic, 1, VehicleType::Car, &[0, 1, 2], 0, 90., 10.);
        place_vehicle(&mut traffic, 2, VehicleType::Car, &[1, 2], 0, 24.5, 3.);

        let vehicle = traffic.vehicle(id).unwrap();
        let impediments = find_impediments(&traffic, vehicle, &DriveSettings::default());
        assert_eq!(1, impediments.len());
        assert_eq!(ImpedimentKind::Vehicle, impediments[0].kind);
        assert_approx_eq!(30., impediments[0].distance);
        assert_eq!(3., impediments[0].speed);
    }

    #[test]
    fn stop_at_red_light() {
        let mut traffic = corridor_traffic(2, 100., 1);
        traffic.edge_mut(Id::new(0)).light = Some(LightColor::Red);
        let id = place_vehicle(&mut traffic, 1, VehicleType::Car, &[0, 1], 0, 60., 10.);
        let settings = DriveSettings::default();

        let drive = compute_drive(&traffic, traffic.vehicle(id).unwrap(), &settings);
        assert_eq!(Some(ImpedimentKind::Light), drive.limit.map(|l| l.kind));
        assert!(drive.acceleration < 0.);

        let router = EdgeRouter::new(traffic.network_arc(), Default::default(), false);
        let edges = traffic.local_edges().to_vec();
        let mut rnd = SmallRng::seed_from_u64(1);
        for step in 0..200 {
            move_vehicles(&mut traffic, &router, &edges, step, &settings, &mut rnd);
            let vehicle = traffic.vehicle(id).unwrap();
            assert_eq!(0, vehicle.leg, "ran the red light in step {step}");
            assert!(vehicle.head_position <= 100.);
            assert!(vehicle.speed >= 0.);
        }
        let vehicle = traffic.vehicle(id).unwrap();
        assert!(vehicle.speed < 0.1);
        assert!(vehicle.head_position > 90.);
    }

    #[test]
    fn closest_impediment_sets_the_gap() {
        // a fast leader close ahead and a red light further away, which alone would demand
        // harder braking
        let mut traffic = corridor_traffic(2, 100., 1);
        traffic.edge_mut(Id::new(0)).light = Some(LightColor::Red);
        let id = place_vehicle(&mut traffic, 1, VehicleType::Car, &[0, 1], 0, 60., 10.);
        place_vehicle(&mut traffic, 2, VehicleType::Car, &[0, 1], 0, 80., 15.);
        let settings = DriveSettings::default();
        let vehicle = traffic.vehicle(id).unwrap();

        let drive = compute_drive(&traffic, vehicle, &settings);
        let limit = drive.limit.unwrap();
        assert_eq!(ImpedimentKind::Vehicle, limit.kind);
        assert_approx_eq!(15.5, limit.distance);

        let behind_leader = vehicle_acceleration(vehicle, drive.desired_speed, Some((15.5, 15.)));
        let before_light = vehicle_acceleration(vehicle, drive.desired_speed, Some((40., 0.)));
        assert!(before_light < behind_leader);
        assert_approx_eq!(behind_leader, drive.acceleration);
    }

    #[test]
    fn yellow_is_passed_when_too_close() {
        let mut traffic = corridor_traffic(2, 100., 1);
        traffic.edge_mut(Id::new(0)).light = Some(LightColor::Yellow);
        let close = place_vehicle(&mut traffic, 1, VehicleType::Car, &[0, 1], 0, 95., 12.);
        let far = place_vehicle(&mut traffic, 2, VehicleType::Car, &[0, 1], 0, 20., 12.);
        let settings = DriveSettings::default();

        let impediments = find_impediments(&traffic, traffic.vehicle(close).unwrap(), &settings);
        assert!(impediments.iter().all(|i| i.kind != ImpedimentKind::Light));
        let impediments = find_impediments(&traffic, traffic.vehicle(far).unwrap(), &settings);
        assert!(impediments.iter().any(|i| i.kind == ImpedimentKind::Light));
    }

    #[test]
    fn priority_vehicle_ignores_red() {
        let mut traffic = corridor_traffic(2, 100., 1);
        traffic.edge_mut(Id::new(0)).light = Some(LightColor::Red);
        let id = place_vehicle(&mut traffic, 1, VehicleType::Priority, &[0, 1], 0, 80., 10.);
        let impediments =
            find_impediments(&traffic, traffic.vehicle(id).unwrap(), &DriveSettings::default());
        assert!(impediments.is_empty());
    }

    #[test]
    fn blocked_edge_ahead() {
        let mut traffic = corridor_traffic(3, 100., 1);
        let lane = traffic.network().edge(Id::new(1)).lanes[0];
        traffic.set_lane_blocked(lane, true);
        let id = place_vehicle(&mut traffic, 1, VehicleType::Car, &[0, 1, 2], 0, 70., 10.);

        let impediments =
            find_impediments(&traffic, traffic.vehicle(id).unwrap(), &DriveSettings::default());
        assert_eq!(ImpedimentKind::Block, impediments[0].kind);
        assert_approx_eq!(30., impediments[0].distance);
    }

    #[test]
    fn lower_id_goes_first_at_stop_lines() {
        let (mut traffic, side, main_in, main_out) = create_t_junction();
        let settings = DriveSettings::default();

        let route = [side.internal(), main_out.internal()];
        let first = place_vehicle(&mut traffic, 1, VehicleType::Car, &route, 0, 97., 0.);
        let route = [main_in.internal(), main_out.internal()];
        let second = place_vehicle(&mut traffic, 2, VehicleType::Car, &route, 0, 97., 0.);

        let yields = |id| {
            find_impediments(&traffic, traffic.vehicle(id).unwrap(), &settings)
                .iter()
                .any(|i| i.kind == ImpedimentKind::Intersection)
        };
        // the side street vehicle goes first, although it comes from the lower road class
        assert!(!yields(first));
        assert!(yields(second));
    }

    #[test]
    fn give_way_at_junction() {
        // side street 0 joins the main street 1 -> 2 at the junction node
        let (mut traffic, side, main_in, main_out) = create_t_junction();
        let settings = DriveSettings::default();
        let network = traffic.network_arc();
        assert!(must_yield(&network, network.edge(side), network.edge(main_in), false));
        assert!(!must_yield(&network, network.edge(main_in), network.edge(side), false));

        let route = [side.internal(), main_out.internal()];
        let mine = place_vehicle(&mut traffic, 1, VehicleType::Car, &route, 0, 80., 3.);
        let impediments = find_impediments(&traffic, traffic.vehicle(mine).unwrap(), &settings);
        assert!(impediments.is_empty());

        let route = [main_in.internal(), main_out.internal()];
        place_vehicle(&mut traffic, 2, VehicleType::Car, &route, 0, 80., 10.);
        let impediments = find_impediments(&traffic, traffic.vehicle(mine).unwrap(), &settings);
        assert_eq!(Some(ImpedimentKind::Intersection), impediments.first().map(|i| i.kind));
    }
}
