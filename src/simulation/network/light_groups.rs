use std::collections::BTreeMap;
use std::f64::consts::PI;

use nohash_hasher::IntMap;
use serde::{Deserialize, Serialize};

use crate::simulation::id::Id;
use crate::simulation::network::road_network::{Edge, Node, RoadNetwork};

/// A cluster of signalled nodes switched together. The approaches into the cluster are split
/// into street sub-groups, of which exactly one can be green or yellow at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightGroup {
    pub id: Id<LightGroup>,
    pub nodes: Vec<Id<Node>>,
    /// Worker which runs the signal program of this group.
    pub home: u32,
    pub subgroups: Vec<SubGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubGroup {
    pub street: String,
    pub approaches: Vec<Id<Edge>>,
}

/// Static light group structure of the whole network. Group ids start at 1, 0 stands for "no group".
#[derive(Debug, Clone, Default)]
pub struct LightGroups {
    groups: Vec<LightGroup>,
    node_group: IntMap<Id<Node>, Id<LightGroup>>,
    approach_group: IntMap<Id<Edge>, (Id<LightGroup>, usize)>,
}

impl LightGroups {
    /// Clusters signalled nodes which are connected by an edge not longer than `radius` and owned
    /// by the same worker. `signal_overrides` replaces the signal flag of individual nodes.
    pub fn build(
        network: &RoadNetwork,
        signal_overrides: &IntMap<Id<Node>, bool>,
        node_owner: impl Fn(Id<Node>) -> u32,
        radius: f64,
    ) -> Self {
        let has_signal = |node: Id<Node>| {
            signal_overrides
                .get(&node)
                .copied()
                .unwrap_or(network.node(node).signal)
        };

        let mut parents: Vec<usize> = (0..network.nodes.len()).collect();
        for edge in &network.edges {
            if edge.length <= radius
                && has_signal(edge.from)
                && has_signal(edge.to)
                && node_owner(edge.from) == node_owner(edge.to)
            {
                union(&mut parents, edge.from.index(), edge.to.index());
            }
        }

        // ordered by root, so that group ids are stable for a given network
        let mut clusters: BTreeMap<usize, Vec<Id<Node>>> = BTreeMap::new();
        for node in &network.nodes {
            if has_signal(node.id) {
                let root = find(&mut parents, node.id.index());
                clusters.entry(root).or_default().push(node.id);
            }
        }
        let mut clusters: Vec<Vec<Id<Node>>> = clusters.into_values().collect();
        clusters.sort_by_key(|nodes| nodes[0]);

        let mut result = LightGroups::default();
        for nodes in clusters {
            let id = Id::new(result.groups.len() as u64 + 1);
            for node in &nodes {
                result.node_group.insert(*node, id);
            }
            let home = node_owner(nodes[0]);
            let subgroups = Self::subgroups(network, &nodes);
            for (index, subgroup) in subgroups.iter().enumerate() {
                for approach in &subgroup.approaches {
                    result.approach_group.insert(*approach, (id, index));
                }
            }
            result.groups.push(LightGroup {
                id,
                nodes,
                home,
                subgroups,
            });
        }
        result
    }

    fn subgroups(network: &RoadNetwork, nodes: &[Id<Node>]) -> Vec<SubGroup> {
        let mut streets: BTreeMap<String, Vec<Id<Edge>>> = BTreeMap::new();
        for node in nodes {
            for edge_id in &network.node(*node).in_edges {
                let edge = network.edge(*edge_id);
                if nodes.contains(&edge.from) {
                    continue;
                }
                let street = if edge.name.is_empty() {
                    // opposite directions of the same axis share a sub-group
                    let axis = network.heading(*edge_id).rem_euclid(PI);
                    format!("axis-{}", ((axis / (PI / 4.)).round() as u32) % 4)
                } else {
                    edge.name.clone()
                };
                streets.entry(street).or_default().push(*edge_id);
            }
        }
        streets
            .into_iter()
            .map(|(street, approaches)| SubGroup { street, approaches })
            .collect()
    }

    pub fn groups(&self) -> &[LightGroup] {
        &self.groups
    }

    pub fn group(&self, id: Id<LightGroup>) -> &LightGroup {
        &self.groups[id.index() - 1]
    }

    pub fn group_of_node(&self, node: Id<Node>) -> Option<Id<LightGroup>> {
        self.node_group.get(&node).copied()
    }

    /// Group and sub-group index if the edge is a signalled approach.
    pub fn approach(&self, edge: Id<Edge>) -> Option<(Id<LightGroup>, usize)> {
        self.approach_group.get(&edge).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

fn find(parents: &mut [usize], mut i: usize) -> usize {
    while parents[i] != i {
        parents[i] = parents[parents[i]];
        i = parents[i];
    }
    i
}

fn union(parents: &mut [usize], a: usize, b: usize) {
    let ra = find(parents, a);
    let rb = find(parents, b);
    if ra != rb {
        let (low, high) = if ra < rb { (ra, rb) } else { (rb, ra) };
        parents[high] = low;
    }
}
