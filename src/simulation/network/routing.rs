use std::cmp::Ordering;
use std::sync::Arc;

use keyed_priority_queue::KeyedPriorityQueue;
use nohash_hasher::{IntMap, IntSet};

use crate::simulation::config::RoutingAlgorithm;
use crate::simulation::id::Id;
use crate::simulation::network::road_network::{Edge, RoadNetwork};
use crate::simulation::vehicles::{RouteLeg, VehicleType};

/// Pluggable path computation used for vehicle creation and rerouting.
pub trait Router: Send {
    /// Computes the legs from `start` to `end`, both included, avoiding `excluded` edges.
    /// Returns `None` if the destination can't be reached.
    fn create_complete_route(
        &self,
        start: Id<Edge>,
        end: Id<Edge>,
        vehicle_type: VehicleType,
        excluded: &IntSet<Id<Edge>>,
    ) -> Option<Vec<RouteLeg>>;
}

#[derive(Eq, PartialEq)]
struct Cost(u64);

// reversed, so that the queue pops the cheapest entry first
impl Ord for Cost {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0).reverse()
    }
}

impl PartialOrd for Cost {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Shortest travel time search over the edge graph. With [RoutingAlgorithm::AStar] the search
/// is directed by the straight line distance to the destination.
pub struct EdgeRouter {
    network: Arc<RoadNetwork>,
    algorithm: RoutingAlgorithm,
    priority_uses_tram_track: bool,
    max_speed: f64,
}

impl EdgeRouter {
    pub fn new(
        network: Arc<RoadNetwork>,
        algorithm: RoutingAlgorithm,
        priority_uses_tram_track: bool,
    ) -> Self {
        let max_speed = network
            .edges
            .iter()
            .map(|e| e.free_flow_speed)
            .fold(1., f64::max);
        EdgeRouter {
            network,
            algorithm,
            priority_uses_tram_track,
            max_speed,
        }
    }

    fn may_use(&self, edge: Id<Edge>, vehicle_type: VehicleType) -> bool {
        let tram = vehicle_type == VehicleType::Tram;
        let tram_track =
            self.priority_uses_tram_track && vehicle_type == VehicleType::Priority;
        self.network.allows(edge, tram, tram_track)
    }

    /// travel time in milliseconds
    fn cost(&self, edge: Id<Edge>) -> u64 {
        let e = self.network.edge(edge);
        (e.length / e.free_flow_speed.max(0.1) * 1000.).round() as u64
    }

    fn heuristic(&self, edge: Id<Edge>, end: Id<Edge>) -> u64 {
        match self.algorithm {
            RoutingAlgorithm::Dijkstra => 0,
            RoutingAlgorithm::AStar => {
                let here = self.network.node(self.network.edge(edge).to);
                let target = self.network.node(self.network.edge(end).from);
                (here.distance_to(target) / self.max_speed * 1000.).floor() as u64
            }
        }
    }
}

impl Router for EdgeRouter {
    fn create_complete_route(
        &self,
        start: Id<Edge>,
        end: Id<Edge>,
        vehicle_type: VehicleType,
        excluded: &IntSet<Id<Edge>>,
    ) -> Option<Vec<RouteLeg>> {
        if excluded.contains(&end) || !self.may_use(end, vehicle_type) {
            return None;
        }
        if start == end {
            return Some(vec![RouteLeg::new(start)]);
        }

        // costs are measured at the end of an edge, the start edge is already being travelled
        let mut costs: IntMap<Id<Edge>, u64> = IntMap::default();
        let mut parents: IntMap<Id<Edge>, Id<Edge>> = IntMap::default();
        let mut queue: KeyedPriorityQueue<Id<Edge>, Cost> = KeyedPriorityQueue::new();
        costs.insert(start, 0);
        queue.push(start, Cost(self.heuristic(start, end)));

        while let Some((current, _)) = queue.pop() {
            if current == end {
                return Some(self.collect_route(&parents, start, end));
            }
            let current_cost = costs[&current];
            let to = self.network.edge(current).to;

            for next in &self.network.node(to).out_edges {
                if excluded.contains(next) || !self.may_use(*next, vehicle_type) {
                    continue;
                }
                let next_cost = current_cost + self.cost(*next);
                if costs.get(next).is_some_and(|c| *c <= next_cost) {
                    continue;
                }
                costs.insert(*next, next_cost);
                parents.insert(*next, current);
                // pushing an existing key updates its priority
                queue.push(*next, Cost(next_cost + self.heuristic(*next, end)));
            }
        }
        None
    }
}

impl EdgeRouter {
    fn collect_route(
        &self,
        parents: &IntMap<Id<Edge>, Id<Edge>>,
        start: Id<Edge>,
        end: Id<Edge>,
    ) -> Vec<RouteLeg> {
        let mut route = vec![RouteLeg::new(end)];
        let mut current = end;
        while current != start {
            current = parents[&current];
            route.push(RouteLeg::new(current));
        }
        route.reverse();
        route
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use nohash_hasher::IntSet;

    use crate::simulation::config::RoutingAlgorithm;
    use crate::simulation::id::Id;
    use crate::simulation::network::road_network::{Edge, EdgeAttributes, Node, RoadNetwork};
    use crate::simulation::network::routing::{EdgeRouter, Router};
    use crate::simulation::vehicles::VehicleType;

    /// a -> b -> d is short, a -> c -> d is long, plus a tram track a -> d
    fn diamond() -> Arc<RoadNetwork> {
        let mut net = RoadNetwork::new();
        let a = net.add_node(Node::new(0., 0.));
        let b = net.add_node(Node::new(100., 10.));
        let c = net.add_node(Node::new(100., -300.));
        let d = net.add_node(Node::new(200., 0.));
        let start = net.add_node(Node::new(-100., 0.));
        net.add_edge(start, a, EdgeAttributes::default());
        net.add_edge(a, b, EdgeAttributes::default());
        net.add_edge(b, d, EdgeAttributes::default());
        net.add_edge(a, c, EdgeAttributes::default());
        net.add_edge(c, d, EdgeAttributes::default());
        net.add_edge(
            a,
            d,
            EdgeAttributes {
                tram_track: true,
                ..EdgeAttributes::default()
            },
        );
        let end = net.add_node(Node::new(300., 0.));
        net.add_edge(d, end, EdgeAttributes::default());
        Arc::new(net.finish(1000.))
    }

    fn edges(route: &[crate::simulation::vehicles::RouteLeg]) -> Vec<u64> {
        route.iter().map(|l| l.edge.internal()).collect()
    }

    #[test]
    fn shortest_route() {
        for algorithm in [RoutingAlgorithm::Dijkstra, RoutingAlgorithm::AStar] {
            let router = EdgeRouter::new(diamond(), algorithm, false);
            let route = router
                .create_complete_route(Id::new(0), Id::new(6), VehicleType::Car, &IntSet::default())
                .unwrap();
            assert_eq!(vec![0, 1, 2, 6], edges(&route));
            assert!(route.iter().all(|l| l.stopover == 0.));
        }
    }

    #[test]
    fn excluded_edges_are_avoided() {
        let router = EdgeRouter::new(diamond(), RoutingAlgorithm::Dijkstra, false);
        let excluded: IntSet<Id<Edge>> = [Id::new(1)].into_iter().collect();
        let route = router
            .create_complete_route(Id::new(0), Id::new(6), VehicleType::Car, &excluded)
            .unwrap();
        assert_eq!(vec![0, 3, 4, 6], edges(&route));
    }

    #[test]
    fn tram_track_access() {
        let router = EdgeRouter::new(diamond(), RoutingAlgorithm::Dijkstra, true);
        let route = router
            .create_complete_route(Id::new(0), Id::new(6), VehicleType::Priority, &IntSet::default())
            .unwrap();
        assert_eq!(vec![0, 5, 6], edges(&route));

        let router = EdgeRouter::new(diamond(), RoutingAlgorithm::Dijkstra, false);
        let route = router
            .create_complete_route(Id::new(0), Id::new(6), VehicleType::Priority, &IntSet::default())
            .unwrap();
        assert_eq!(vec![0, 1, 2, 6], edges(&route));

        // trams may only use tram tracks
        assert!(router
            .create_complete_route(Id::new(0), Id::new(6), VehicleType::Tram, &IntSet::default())
            .is_none());
    }

    #[test]
    fn unreachable_destination() {
        let router = EdgeRouter::new(diamond(), RoutingAlgorithm::AStar, false);
        assert!(router
            .create_complete_route(Id::new(6), Id::new(0), VehicleType::Car, &IntSet::default())
            .is_none());
    }
}
