use std::sync::Arc;

use crate::simulation::config::Config;
use crate::simulation::id::Id;
use crate::simulation::network::partitioning::Partition;
use crate::simulation::network::road_network::{Edge, EdgeAttributes, Node, RoadClass, RoadNetwork};
use crate::simulation::traffic::lights::LightCoordinator;
use crate::simulation::traffic::TrafficNetwork;
use crate::simulation::vehicles::{DriverProfile, RouteLeg, Vehicle, VehicleType};

/// Grid of `rows` x `cols` nodes with edges in both directions between neighbours. Nodes are
/// numbered row by row. The network is not finished yet.
pub fn create_grid_network(rows: u32, cols: u32, spacing: f64, lanes: u32) -> RoadNetwork {
    let mut network = RoadNetwork::new();
    for row in 0..rows {
        for col in 0..cols {
            network.add_node(Node::new(col as f64 * spacing, row as f64 * spacing));
        }
    }
    let attributes = || EdgeAttributes {
        num_lanes: lanes,
        ..Default::default()
    };
    for row in 0..rows {
        for col in 0..cols {
            let node = Id::new((row * cols + col) as u64);
            if col + 1 < cols {
                let right = Id::new((row * cols + col + 1) as u64);
                network.add_edge(node, right, attributes());
                network.add_edge(right, node, attributes());
            }
            if row + 1 < rows {
                let down = Id::new(((row + 1) * cols + col) as u64);
                network.add_edge(node, down, attributes());
                network.add_edge(down, node, attributes());
            }
        }
    }
    network
}

/// Straight one way road of `n` edges, each `len` meters long, simulated by a single worker.
pub fn corridor_traffic(n: u32, len: f64, lanes: u32) -> TrafficNetwork {
    let mut network = RoadNetwork::new();
    for i in 0..=n {
        network.add_node(Node::new(i as f64 * len, 0.));
    }
    for i in 0..n {
        network.add_edge(
            Id::new(i as u64),
            Id::new(i as u64 + 1),
            EdgeAttributes {
                num_lanes: lanes,
                length: Some(len),
                ..Default::default()
            },
        );
    }
    single_worker(network.finish(len))
}

/// Puts a vehicle on the roadside lane of `route[leg]`.
pub fn place_vehicle(
    traffic: &mut TrafficNetwork,
    id: u64,
    vehicle_type: VehicleType,
    route: &[u64],
    leg: usize,
    head: f64,
    speed: f64,
) -> Id<Vehicle> {
    place_vehicle_on_lane(traffic, id, vehicle_type, route, leg, 0, head, speed)
}

#[allow(clippy::too_many_arguments)]
pub fn place_vehicle_on_lane(
    traffic: &mut TrafficNetwork,
    id: u64,
    vehicle_type: VehicleType,
    route: &[u64],
    leg: usize,
    lane_index: usize,
    head: f64,
    speed: f64,
) -> Id<Vehicle> {
    let legs: Vec<RouteLeg> = route.iter().map(|e| RouteLeg::new(Id::new(*e))).collect();
    let lane = traffic.network().edge(legs[leg].edge).lane_at(lane_index);
    let mut vehicle = Vehicle::new(
        Id::new(id),
        vehicle_type,
        DriverProfile::normal(),
        legs,
        lane,
    );
    vehicle.leg = leg;
    vehicle.head_position = head;
    vehicle.speed = speed;
    let id = vehicle.id;
    traffic.add_transferred_vehicle(vehicle);
    id
}

/// Signalled node with four arms of length `len`, one street along each axis. The network is
/// not finished yet.
pub fn create_signalled_crossing(len: f64) -> RoadNetwork {
    let mut network = RoadNetwork::new();
    let center = network.add_node(Node::new(0., 0.).with_signal());
    for (x, y) in [(-len, 0.), (len, 0.), (0., -len), (0., len)] {
        let arm = network.add_node(Node::new(x, y));
        network.add_edge(arm, center, EdgeAttributes::default());
        network.add_edge(center, arm, EdgeAttributes::default());
    }
    network
}

/// Residential side street joining a primary main street at an unsignalled junction. Returns
/// the traffic network with the side street edge, the main street edge into the junction and
/// the one out of it.
pub fn create_t_junction() -> (TrafficNetwork, Id<Edge>, Id<Edge>, Id<Edge>) {
    let mut network = RoadNetwork::new();
    let side_start = network.add_node(Node::new(100., 100.));
    let main_start = network.add_node(Node::new(0., 0.));
    let junction = network.add_node(Node::new(100., 0.));
    let main_end = network.add_node(Node::new(200., 0.));

    let main = || EdgeAttributes {
        class: RoadClass::Primary,
        ..Default::default()
    };
    let side = network.add_edge(side_start, junction, EdgeAttributes::default());
    let main_in = network.add_edge(main_start, junction, main());
    let main_out = network.add_edge(junction, main_end, main());
    (single_worker(network.finish(1000.)), side, main_in, main_out)
}

/// Two alternative paths between B and E:
/// ```text
///            C
///          /   \
///  A --- B       E --- F
///          \   /
///            D
/// ```
/// Edges are A-B 0, B-C 1, B-D 2, C-E 3, D-E 4 and E-F 5.
pub fn create_diamond_traffic() -> TrafficNetwork {
    let mut network = RoadNetwork::new();
    let a = network.add_node(Node::new(0., 0.));
    let b = network.add_node(Node::new(100., 0.));
    let c = network.add_node(Node::new(200., 100.));
    let d = network.add_node(Node::new(200., -100.));
    let e = network.add_node(Node::new(300., 0.));
    let f = network.add_node(Node::new(400., 0.));
    for (from, to) in [(a, b), (b, c), (b, d), (c, e), (d, e), (e, f)] {
        network.add_edge(from, to, EdgeAttributes::default());
    }
    single_worker(network.finish(1000.))
}

/// A short edge B-C before a fork:
/// ```text
///                    D
///                  /   \
///  A ---- B -- C       F ---- G
///                  \   /
///                    E
/// ```
/// Edges are A-B 0, B-C 1, C-D 2, C-E 3, D-F 4, E-F 5 and F-G 6.
pub fn create_fork_traffic() -> TrafficNetwork {
    let mut network = RoadNetwork::new();
    let a = network.add_node(Node::new(0., 0.));
    let b = network.add_node(Node::new(100., 0.));
    let c = network.add_node(Node::new(120., 0.));
    let d = network.add_node(Node::new(220., 50.));
    let e = network.add_node(Node::new(220., -50.));
    let f = network.add_node(Node::new(320., 0.));
    let g = network.add_node(Node::new(420., 0.));
    for (from, to) in [(a, b), (b, c), (c, d), (c, e), (d, f), (e, f), (f, g)] {
        network.add_edge(from, to, EdgeAttributes::default());
    }
    single_worker(network.finish(1000.))
}

/// Corridor of `n` edges split in the middle. Worker 0 owns the first half of the edges,
/// worker 1 the second.
pub fn two_worker_corridor(n: u32, len: f64, lanes: u32) -> (TrafficNetwork, TrafficNetwork) {
    let mut network = RoadNetwork::new();
    for i in 0..=n {
        network.add_node(Node::new(i as f64 * len, 0.));
    }
    for i in 0..n {
        network.add_edge(
            Id::new(i as u64),
            Id::new(i as u64 + 1),
            EdgeAttributes {
                num_lanes: lanes,
                ..Default::default()
            },
        );
    }
    let network = Arc::new(network.finish(len));
    let partition = Arc::new(Partition {
        num_workers: 2,
        cell_owner: network
            .grid
            .cells
            .iter()
            .map(|c| u32::from(c.col >= n / 2))
            .collect(),
    });
    let config = Config::default();
    let traffic = |rank| {
        let lights = LightCoordinator::new(network.clone(), partition.clone(), rank, &config);
        TrafficNetwork::new(network.clone(), partition.clone(), rank, lights)
    };
    (traffic(0), traffic(1))
}

fn single_worker(network: RoadNetwork) -> TrafficNetwork {
    let network = Arc::new(network);
    let partition = Arc::new(Partition {
        num_workers: 1,
        cell_owner: vec![0; network.grid.len()],
    });
    let lights = LightCoordinator::new(network.clone(), partition.clone(), 0, &Config::default());
    TrafficNetwork::new(network, partition, 0, lights)
}
