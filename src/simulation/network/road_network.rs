use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::simulation::id::Id;
use crate::simulation::network::grid::{Grid, GridCell};

/// Immutable road graph. Nodes, edges and lanes live in flat arenas and reference each other
/// by [Id] only. Everything that changes during a run (light colors, blocks, vehicles) is kept
/// in the per-worker traffic state instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoadNetwork {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub lanes: Vec<Lane>,
    pub grid: Grid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: Id<Node>,
    pub x: f64,
    pub y: f64,
    pub signal: bool,
    pub tram_stop: bool,
    pub bus_stop: bool,
    pub in_edges: Vec<Id<Edge>>,
    pub out_edges: Vec<Id<Edge>>,
    pub cell: Id<GridCell>,
}

/// Road classes ordered by right of way. A higher rank wins at unsignalled intersections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RoadClass {
    Motorway,
    Primary,
    Secondary,
    Tertiary,
    #[default]
    Residential,
    Service,
    TramTrack,
}

impl RoadClass {
    pub fn rank(&self) -> u8 {
        match self {
            RoadClass::Motorway => 6,
            RoadClass::Primary => 5,
            RoadClass::Secondary => 4,
            RoadClass::Tertiary => 3,
            RoadClass::Residential => 2,
            RoadClass::Service => 1,
            RoadClass::TramTrack => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: Id<Edge>,
    pub from: Id<Node>,
    pub to: Id<Node>,
    pub class: RoadClass,
    pub name: String,
    pub length: f64,
    pub free_flow_speed: f64,
    /// Lanes ordered from the roadside outwards.
    pub lanes: Vec<Id<Lane>>,
    /// Number of lanes at the roadside reserved for turns towards the roadside.
    pub roadside_turn_lanes: u32,
    /// Number of lanes away from the roadside reserved for turns across traffic.
    pub away_turn_lanes: u32,
    pub one_way: bool,
    pub roundabout: bool,
    pub tram_track: bool,
    pub bus_route: bool,
    /// A tram track running alongside this road, if any.
    pub parallel_tram_edge: Option<Id<Edge>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lane {
    pub id: Id<Lane>,
    pub edge: Id<Edge>,
    /// 0 is the lane next to the roadside.
    pub index: u32,
}

/// Attributes of an edge which are not derived from the graph structure.
#[derive(Debug, Clone)]
pub struct EdgeAttributes {
    pub class: RoadClass,
    pub name: String,
    pub length: Option<f64>,
    pub free_flow_speed: f64,
    pub num_lanes: u32,
    pub roadside_turn_lanes: u32,
    pub away_turn_lanes: u32,
    pub one_way: bool,
    pub roundabout: bool,
    pub tram_track: bool,
    pub bus_route: bool,
}

impl Default for EdgeAttributes {
    fn default() -> Self {
        EdgeAttributes {
            class: RoadClass::Residential,
            name: String::new(),
            length: None,
            free_flow_speed: 13.89,
            num_lanes: 1,
            roadside_turn_lanes: 0,
            away_turn_lanes: 0,
            one_way: true,
            roundabout: false,
            tram_track: false,
            bus_route: false,
        }
    }
}

/// Direction of a turn, relative to the side of the road vehicles drive on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Turn {
    Straight,
    TowardRoadside,
    AwayFromRoadside,
}

impl Node {
    pub fn new(x: f64, y: f64) -> Self {
        Node {
            id: Id::new(0),
            x,
            y,
            signal: false,
            tram_stop: false,
            bus_stop: false,
            in_edges: Vec::new(),
            out_edges: Vec::new(),
            cell: Id::new(0),
        }
    }

    pub fn with_signal(mut self) -> Self {
        self.signal = true;
        self
    }

    pub fn distance_to(&self, other: &Node) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

impl Edge {
    pub fn num_lanes(&self) -> usize {
        self.lanes.len()
    }

    pub fn lane_at(&self, index: usize) -> Id<Lane> {
        self.lanes[index.min(self.lanes.len() - 1)]
    }

    /// Total length of all lanes of this edge.
    pub fn lane_length(&self) -> f64 {
        self.length * self.lanes.len() as f64
    }

    /// Lane indices a vehicle may use before making `turn` at the end of this edge.
    pub fn lanes_for_turn(&self, turn: Turn) -> std::ops::Range<usize> {
        let n = self.lanes.len();
        let roadside = (self.roadside_turn_lanes as usize).min(n);
        let away = (self.away_turn_lanes as usize).min(n);
        match turn {
            Turn::TowardRoadside => 0..roadside.max(1),
            Turn::AwayFromRoadside => n - away.max(1)..n,
            Turn::Straight => {
                if roadside + away < n {
                    roadside..n - away
                } else {
                    0..n
                }
            }
        }
    }
}

impl RoadNetwork {
    pub fn new() -> Self {
        RoadNetwork::default()
    }

    pub fn add_node(&mut self, mut node: Node) -> Id<Node> {
        let id = Id::from(self.nodes.len());
        node.id = id;
        self.nodes.push(node);
        id
    }

    pub fn add_edge(&mut self, from: Id<Node>, to: Id<Node>, attributes: EdgeAttributes) -> Id<Edge> {
        let id: Id<Edge> = Id::from(self.edges.len());
        let length = attributes
            .length
            .unwrap_or_else(|| self.node(from).distance_to(self.node(to)))
            .max(1.);

        let num_lanes = attributes.num_lanes.max(1);
        let mut lanes = Vec::with_capacity(num_lanes as usize);
        for index in 0..num_lanes {
            let lane_id = Id::from(self.lanes.len());
            self.lanes.push(Lane {
                id: lane_id,
                edge: id,
                index,
            });
            lanes.push(lane_id);
        }

        self.edges.push(Edge {
            id,
            from,
            to,
            class: attributes.class,
            name: attributes.name,
            length,
            free_flow_speed: attributes.free_flow_speed,
            lanes,
            roadside_turn_lanes: attributes.roadside_turn_lanes,
            away_turn_lanes: attributes.away_turn_lanes,
            one_way: attributes.one_way,
            roundabout: attributes.roundabout,
            tram_track: attributes.tram_track,
            bus_route: attributes.bus_route,
            parallel_tram_edge: None,
        });

        self.nodes[from.index()].out_edges.push(id);
        self.nodes[to.index()].in_edges.push(id);
        id
    }

    /// Builds the spatial grid and assigns nodes to cells. Also derives data which depends on
    /// the whole graph. Must be called once all nodes and edges are added.
    pub fn finish(mut self, max_cell_size: f64) -> Self {
        self.grid = Grid::build(&self, max_cell_size);
        for cell in &self.grid.cells {
            for node in &cell.nodes {
                self.nodes[node.index()].cell = cell.id;
            }
        }
        self.link_parallel_tram_edges();
        self
    }

    pub fn node(&self, id: Id<Node>) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn edge(&self, id: Id<Edge>) -> &Edge {
        &self.edges[id.index()]
    }

    pub fn lane(&self, id: Id<Lane>) -> &Lane {
        &self.lanes[id.index()]
    }

    pub fn total_lane_length(&self) -> f64 {
        self.edges.iter().map(|e| e.lane_length()).sum()
    }

    /// Heading of an edge in radians, counter-clockwise from the x-axis.
    pub fn heading(&self, edge: Id<Edge>) -> f64 {
        let e = self.edge(edge);
        let from = self.node(e.from);
        let to = self.node(e.to);
        (to.y - from.y).atan2(to.x - from.x)
    }

    /// Classifies the turn from `from_edge` into `to_edge`.
    pub fn turn(&self, from_edge: Id<Edge>, to_edge: Id<Edge>, drive_on_left: bool) -> Turn {
        let mut angle = self.heading(to_edge) - self.heading(from_edge);
        while angle > PI {
            angle -= 2. * PI;
        }
        while angle <= -PI {
            angle += 2. * PI;
        }

        if angle.abs() < PI / 6. {
            return Turn::Straight;
        }
        // positive angles turn left. u-turns cross the opposite traffic as well
        let is_left = angle > 0. || angle.abs() > 5. * PI / 6.;
        match (is_left, drive_on_left) {
            (true, false) | (false, true) => Turn::AwayFromRoadside,
            _ => Turn::TowardRoadside,
        }
    }

    /// Whether `point` lies on the roadside of a vehicle travelling along `edge` towards its end.
    pub fn is_on_roadside(&self, edge: Id<Edge>, x: f64, y: f64, drive_on_left: bool) -> bool {
        let e = self.edge(edge);
        let from = self.node(e.from);
        let to = self.node(e.to);
        let cross = (to.x - from.x) * (y - to.y) - (to.y - from.y) * (x - to.x);
        // cross < 0 means right of the direction of travel
        if drive_on_left {
            cross > 0.
        } else {
            cross < 0.
        }
    }

    /// Whether a vehicle of the given kind may travel on `edge`.
    pub fn allows(&self, edge: Id<Edge>, tram: bool, may_use_tram_track: bool) -> bool {
        let e = self.edge(edge);
        if tram {
            e.tram_track
        } else {
            !e.tram_track || may_use_tram_track
        }
    }

    fn link_parallel_tram_edges(&mut self) {
        const MAX_OFFSET: f64 = 15.;
        let tram_edges: Vec<Id<Edge>> = self
            .edges
            .iter()
            .filter(|e| e.tram_track)
            .map(|e| e.id)
            .collect();
        if tram_edges.is_empty() {
            return;
        }

        for i in 0..self.edges.len() {
            if self.edges[i].tram_track {
                continue;
            }
            let from = self.node(self.edges[i].from);
            let to = self.node(self.edges[i].to);
            let parallel = tram_edges.iter().copied().find(|t| {
                let tram = self.edge(*t);
                self.node(tram.from).distance_to(from) <= MAX_OFFSET
                    && self.node(tram.to).distance_to(to) <= MAX_OFFSET
            });
            self.edges[i].parallel_tram_edge = parallel;
        }
    }
}
