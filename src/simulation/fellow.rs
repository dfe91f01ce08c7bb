use std::collections::BTreeMap;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::simulation::id::Id;
use crate::simulation::network::partitioning::Partition;
use crate::simulation::network::road_network::{Edge, Lane, RoadNetwork};

/// Progress of the border data exchange with one fellow in the current step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FellowState {
    #[default]
    New,
    SharingDataSent,
    SharingDataReceived,
    Shared,
}

/// A worker whose area touches ours through at least one edge.
#[derive(Debug, Clone, PartialEq)]
pub struct Fellow {
    pub rank: u32,
    /// Edges we own which end in the fellow's area.
    pub outward_edges: Vec<Id<Edge>>,
    /// Edges the fellow owns which end in our area.
    pub inward_edges: Vec<Id<Edge>>,
    pub state: FellowState,
}

impl Fellow {
    pub fn is_connected(&self) -> bool {
        !self.outward_edges.is_empty() || !self.inward_edges.is_empty()
    }

    /// Lanes through which vehicles arrive from the fellow.
    pub fn inward_lanes<'a>(&'a self, network: &'a RoadNetwork) -> impl Iterator<Item = Id<Lane>> + 'a {
        self.inward_edges
            .iter()
            .flat_map(move |e| network.edge(*e).lanes.iter().copied())
    }

    pub fn mark_sent(&mut self) {
        self.state = match self.state {
            FellowState::New | FellowState::SharingDataSent => FellowState::SharingDataSent,
            FellowState::SharingDataReceived | FellowState::Shared => FellowState::Shared,
        }
    }

    pub fn mark_received(&mut self) {
        self.state = match self.state {
            FellowState::New | FellowState::SharingDataReceived => FellowState::SharingDataReceived,
            FellowState::SharingDataSent | FellowState::Shared => FellowState::Shared,
        }
    }

    pub fn is_shared(&self) -> bool {
        self.state == FellowState::Shared
    }

    pub fn reset(&mut self) {
        self.state = FellowState::New;
    }
}

/// All workers connected to `rank`, ordered by rank.
pub fn find_fellows(network: &RoadNetwork, partition: &Partition, rank: u32) -> Vec<Fellow> {
    let mut fellows: BTreeMap<u32, Fellow> = BTreeMap::new();
    for edge in &network.edges {
        let owner = partition.edge_owner(network, edge.id);
        let end_owner = partition.node_owner(network, edge.to);
        if owner == end_owner {
            continue;
        }
        if owner == rank {
            fellow_entry(&mut fellows, end_owner).outward_edges.push(edge.id);
        } else if end_owner == rank {
            fellow_entry(&mut fellows, owner).inward_edges.push(edge.id);
        }
    }
    fellows.into_values().filter(Fellow::is_connected).collect()
}

fn fellow_entry(fellows: &mut BTreeMap<u32, Fellow>, rank: u32) -> &mut Fellow {
    fellows.entry(rank).or_insert_with(|| Fellow {
        rank,
        outward_edges: Vec::new(),
        inward_edges: Vec::new(),
        state: FellowState::New,
    })
}

/// Local edges next to the border: our outward edges and the edges leaving the nodes where
/// inward edges land. These are simulated before all other edges of a step.
pub fn border_edges(network: &RoadNetwork, fellows: &[Fellow]) -> Vec<Id<Edge>> {
    fellows
        .iter()
        .flat_map(|f| {
            f.outward_edges.iter().copied().chain(
                f.inward_edges
                    .iter()
                    .flat_map(|e| network.node(network.edge(*e).to).out_edges.iter().copied()),
            )
        })
        .sorted()
        .dedup()
        .collect()
}

#[cfg(test)]
mod tests {
    use crate::simulation::fellow::{border_edges, find_fellows, FellowState};
    use crate::simulation::id::Id;
    use crate::simulation::network::partitioning::Partition;
    use crate::test_utils::create_grid_network;

    #[test]
    fn fellows_of_split_corridor() {
        // 1x4 nodes, both directions, split between the second and third node
        let network = create_grid_network(1, 4, 100., 1).finish(100.);
        let partition = Partition {
            num_workers: 2,
            cell_owner: network
                .grid
                .cells
                .iter()
                .map(|c| if c.col < 2 { 0 } else { 1 })
                .collect(),
        };

        let left = find_fellows(&network, &partition, 0);
        assert_eq!(1, left.len());
        assert_eq!(1, left[0].rank);
        assert_eq!(1, left[0].outward_edges.len());
        assert_eq!(1, left[0].inward_edges.len());

        let right = find_fellows(&network, &partition, 1);
        assert_eq!(left[0].outward_edges, right[0].inward_edges);
        assert_eq!(left[0].inward_edges, right[0].outward_edges);

        let border = border_edges(&network, &left);
        assert!(border.contains(&left[0].outward_edges[0]));
        for edge in &border {
            assert_eq!(0, partition.edge_owner(&network, *edge));
        }
        assert!(border.len() < network.edges.len());
    }

    #[test]
    fn sharing_states() {
        let network = create_grid_network(1, 2, 100., 1).finish(50.);
        let partition = Partition {
            num_workers: 2,
            cell_owner: vec![0, 1],
        };
        let mut fellow = find_fellows(&network, &partition, 0).remove(0);
        assert_eq!(FellowState::New, fellow.state);

        fellow.mark_received();
        assert_eq!(FellowState::SharingDataReceived, fellow.state);
        fellow.mark_sent();
        assert!(fellow.is_shared());

        fellow.reset();
        fellow.mark_sent();
        assert_eq!(FellowState::SharingDataSent, fellow.state);
        fellow.mark_received();
        assert!(fellow.is_shared());
        assert_eq!(Some(Id::new(0)), fellow.outward_edges.first().copied());
    }
}
