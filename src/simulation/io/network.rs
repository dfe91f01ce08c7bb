use std::path::Path;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::simulation::error::IoError;
use crate::simulation::id::Id;
use crate::simulation::io::read_json;
use crate::simulation::network::road_network::{
    Edge, EdgeAttributes, Node, RoadClass, RoadNetwork,
};

/// Road network as it is stored on disk. Nodes and edges reference each other by string ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkFile {
    pub nodes: Vec<NodeRecord>,
    pub edges: Vec<EdgeRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub signal: bool,
    #[serde(default)]
    pub tram_stop: bool,
    #[serde(default)]
    pub bus_stop: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub class: RoadClass,
    /// Falls back to the distance between the nodes.
    #[serde(default)]
    pub length: Option<f64>,
    #[serde(default = "default_free_flow_speed")]
    pub free_flow_speed: f64,
    #[serde(default = "default_lanes")]
    pub lanes: u32,
    #[serde(default)]
    pub roadside_turn_lanes: u32,
    #[serde(default)]
    pub away_turn_lanes: u32,
    #[serde(default = "default_one_way")]
    pub one_way: bool,
    #[serde(default)]
    pub roundabout: bool,
    #[serde(default)]
    pub tram_track: bool,
    #[serde(default)]
    pub bus_route: bool,
}

fn default_free_flow_speed() -> f64 {
    13.89
}

fn default_lanes() -> u32 {
    1
}

fn default_one_way() -> bool {
    true
}

/// A finished network together with the mapping from external edge ids to arena ids.
#[derive(Debug)]
pub struct LoadedNetwork {
    pub network: RoadNetwork,
    pub edge_ids: AHashMap<String, Id<Edge>>,
}

impl NetworkFile {
    pub fn from_file(path: &Path) -> Result<Self, IoError> {
        let file: NetworkFile = read_json(path)?;
        info!(
            "Read network file {path:?} with {} nodes and {} edges",
            file.nodes.len(),
            file.edges.len()
        );
        Ok(file)
    }

    /// Builds the arena network and its grid.
    pub fn build(self, max_cell_size: f64) -> Result<LoadedNetwork, IoError> {
        let mut network = RoadNetwork::new();
        let mut node_ids: AHashMap<String, Id<Node>> = AHashMap::with_capacity(self.nodes.len());
        for record in self.nodes {
            let mut node = Node::new(record.x, record.y);
            node.signal = record.signal;
            node.tram_stop = record.tram_stop;
            node.bus_stop = record.bus_stop;
            let id = network.add_node(node);
            if node_ids.insert(record.id.clone(), id).is_some() {
                return Err(IoError::DuplicateId {
                    kind: "node",
                    id: record.id,
                });
            }
        }

        let mut edge_ids: AHashMap<String, Id<Edge>> = AHashMap::with_capacity(self.edges.len());
        for record in self.edges {
            let lookup = |node: &String| {
                node_ids.get(node).copied().ok_or_else(|| IoError::UnknownNode {
                    edge: record.id.clone(),
                    node: node.clone(),
                })
            };
            let from = lookup(&record.from)?;
            let to = lookup(&record.to)?;
            if edge_ids.contains_key(&record.id) {
                return Err(IoError::DuplicateId {
                    kind: "edge",
                    id: record.id,
                });
            }
            let id = network.add_edge(
                from,
                to,
                EdgeAttributes {
                    class: record.class,
                    name: record.name,
                    length: record.length,
                    free_flow_speed: record.free_flow_speed,
                    num_lanes: record.lanes,
                    roadside_turn_lanes: record.roadside_turn_lanes,
                    away_turn_lanes: record.away_turn_lanes,
                    one_way: record.one_way,
                    roundabout: record.roundabout,
                    tram_track: record.tram_track,
                    bus_route: record.bus_route,
                },
            );
            edge_ids.insert(record.id, id);
        }

        let network = network.finish(max_cell_size);
        info!(
            "Built network with {} lanes on a {}x{} grid",
            network.lanes.len(),
            network.grid.rows,
            network.grid.cols
        );
        Ok(LoadedNetwork { network, edge_ids })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use crate::simulation::error::IoError;
    use crate::simulation::io::network::NetworkFile;
    use crate::simulation::network::road_network::RoadClass;

    const NETWORK: &str = r#"{
        "nodes": [
            {"id": "a", "x": 0, "y": 0},
            {"id": "b", "x": 300, "y": 0, "signal": true},
            {"id": "c", "x": 300, "y": 400, "tram_stop": true}
        ],
        "edges": [
            {"id": "ab", "from": "a", "to": "b", "name": "Main", "class": "Primary", "lanes": 2},
            {"id": "bc", "from": "b", "to": "c", "length": 450.5, "tram_track": true}
        ]
    }"#;

    #[test]
    fn build_from_json() {
        let file: NetworkFile = serde_json::from_str(NETWORK).unwrap();
        let loaded = file.build(250.).unwrap();
        let network = &loaded.network;

        assert_eq!(3, network.nodes.len());
        assert_eq!(3, network.lanes.len());
        let ab = network.edge(loaded.edge_ids["ab"]);
        assert_eq!(RoadClass::Primary, ab.class);
        assert_eq!(300., ab.length);
        assert_eq!(2, ab.num_lanes());
        assert!(ab.one_way);

        let bc = network.edge(loaded.edge_ids["bc"]);
        assert_eq!(450.5, bc.length);
        assert!(bc.tram_track);
        assert!(network.node(bc.from).signal);
        assert!(network.node(bc.to).tram_stop);
        assert!(network.grid.len() >= 2);
    }

    #[test]
    fn unknown_node() {
        let json = r#"{"nodes": [{"id": "a", "x": 0, "y": 0}],
            "edges": [{"id": "ax", "from": "a", "to": "x"}]}"#;
        let file: NetworkFile = serde_json::from_str(json).unwrap();
        assert!(matches!(
            file.build(100.),
            Err(IoError::UnknownNode { .. })
        ));
    }

    #[test]
    fn duplicate_node() {
        let json = r#"{"nodes": [{"id": "a", "x": 0, "y": 0}, {"id": "a", "x": 1, "y": 0}],
            "edges": []}"#;
        let file: NetworkFile = serde_json::from_str(json).unwrap();
        assert!(matches!(
            file.build(100.),
            Err(IoError::DuplicateId { kind: "node", .. })
        ));
    }

    #[test]
    fn read_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(NETWORK.as_bytes()).unwrap();
        let network = NetworkFile::from_file(file.path()).unwrap();
        assert_eq!(2, network.edges.len());

        assert!(NetworkFile::from_file(std::path::Path::new("/does/not/exist.json")).is_err());
    }
}
