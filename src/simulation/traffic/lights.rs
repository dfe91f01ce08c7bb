use std::collections::BTreeMap;
use std::sync::Arc;

use nohash_hasher::IntMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::simulation::config::{Config, LightTiming, Lights};
use crate::simulation::id::Id;
use crate::simulation::network::light_groups::{LightGroup, LightGroups};
use crate::simulation::network::partitioning::Partition;
use crate::simulation::network::road_network::{Edge, Node, RoadNetwork};
use crate::simulation::report::LightSnapshot;
use crate::simulation::traffic::EdgeState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LightColor {
    Green,
    Yellow,
    Red,
    /// Red of a sub-group which is waiting for its turn.
    KeepRed,
}

impl LightColor {
    pub fn is_red(&self) -> bool {
        matches!(self, LightColor::Red | LightColor::KeepRed)
    }
}

/// Color state of the active sub-group of a light group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Green,
    Yellow,
    Red,
}

impl From<Phase> for LightColor {
    fn from(value: Phase) -> Self {
        match value {
            Phase::Green => LightColor::Green,
            Phase::Yellow => LightColor::Yellow,
            Phase::Red => LightColor::Red,
        }
    }
}

/// Vehicle detection on a signalled approach, reported to the worker running the signal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub edge: Id<Edge>,
    pub waiting: bool,
    pub priority: bool,
}

#[derive(Debug, Clone)]
struct SignalProgram {
    group: Id<LightGroup>,
    active: usize,
    phase: Phase,
    remaining: f64,
    green_elapsed: f64,
}

/// Runs the signal programs of all light groups homed on this worker.
pub struct LightCoordinator {
    network: Arc<RoadNetwork>,
    partition: Arc<Partition>,
    rank: u32,
    settings: Lights,
    step_size: f64,
    groups: LightGroups,
    programs: Vec<SignalProgram>,
    signal_overrides: IntMap<Id<Node>, bool>,
    outgoing_colors: BTreeMap<u32, Vec<(Id<Edge>, LightColor)>>,
    outgoing_detections: BTreeMap<u32, Vec<Detection>>,
}

impl LightCoordinator {
    pub fn new(
        network: Arc<RoadNetwork>,
        partition: Arc<Partition>,
        rank: u32,
        config: &Config,
    ) -> Self {
        let mut coordinator = LightCoordinator {
            network,
            partition,
            rank,
            settings: config.lights.clone(),
            step_size: config.step_size(),
            groups: LightGroups::default(),
            programs: Vec::new(),
            signal_overrides: IntMap::default(),
            outgoing_colors: BTreeMap::new(),
            outgoing_detections: BTreeMap::new(),
        };
        coordinator.rebuild_groups();
        coordinator
    }

    fn rebuild_groups(&mut self) {
        let network = &self.network;
        let partition = &self.partition;
        self.groups = LightGroups::build(
            network,
            &self.signal_overrides,
            |node| partition.node_owner(network, node),
            self.settings.group_radius,
        );
        self.reset();
    }

    /// Restarts all programs homed here with the first sub-group green.
    pub fn reset(&mut self) {
        self.programs = self
            .groups
            .groups()
            .iter()
            .filter(|g| g.home == self.rank)
            .map(|g| SignalProgram {
                group: g.id,
                active: 0,
                phase: Phase::Green,
                remaining: self.settings.green_seconds,
                green_elapsed: 0.,
            })
            .collect();
        self.outgoing_colors.clear();
        self.outgoing_detections.clear();
    }

    pub fn groups(&self) -> &LightGroups {
        &self.groups
    }

    /// Adds or removes the signal at a node and rebuilds all groups.
    pub fn set_signal(&mut self, node: Id<Node>, enabled: bool, edges: &mut [EdgeState]) {
        info!("Worker #{}: signal at node {node} set to {enabled}", self.rank);
        self.signal_overrides.insert(node, enabled);
        self.rebuild_groups();
        self.init_colors(edges);
    }

    /// Writes the initial colors to the approach edges owned by this worker. Approaches of
    /// groups homed elsewhere stay red until the first colors arrive.
    pub fn init_colors(&mut self, edges: &mut [EdgeState]) {
        for edge in edges.iter_mut() {
            edge.light = None;
        }
        for group in self.groups.groups() {
            for subgroup in &group.subgroups {
                for approach in &subgroup.approaches {
                    if self.partition.edge_owner(&self.network, *approach) == self.rank {
                        edges[approach.index()].light = Some(LightColor::KeepRed);
                    }
                }
            }
        }
        self.write_colors(edges);
    }

    /// Advances all signal programs by one step and publishes the new colors.
    pub fn update(&mut self, edges: &mut [EdgeState]) {
        let dt = self.step_size;
        for program in &mut self.programs {
            let group = self.groups.group(program.group);
            let num_subgroups = group.subgroups.len();
            if num_subgroups == 0 {
                continue;
            }
            let carries_priority = |index: usize| {
                group.subgroups[index]
                    .approaches
                    .iter()
                    .any(|e| edges[e.index()].priority_detected)
            };
            let has_demand = |index: usize| {
                group.subgroups[index]
                    .approaches
                    .iter()
                    .any(|e| edges[e.index()].waiting_detected)
            };

            let active_priority = carries_priority(program.active);
            let inactive_priority =
                (0..num_subgroups).find(|i| *i != program.active && carries_priority(*i));

            match (active_priority, inactive_priority) {
                (false, Some(index)) => {
                    program.active = index;
                    program.phase = Phase::Green;
                    program.remaining = self.settings.green_seconds;
                    program.green_elapsed = 0.;
                }
                (true, None) => {
                    if program.phase != Phase::Green {
                        program.green_elapsed = 0.;
                    }
                    program.phase = Phase::Green;
                    program.remaining = program.remaining.max(self.settings.green_seconds);
                }
                _ => {
                    program.remaining -= dt;
                    match program.phase {
                        Phase::Green => {
                            program.green_elapsed += dt;
                            if program.remaining <= 0. {
                                let switch = match self.settings.timing {
                                    LightTiming::Fixed => true,
                                    LightTiming::Dynamic => {
                                        let conflicting = (0..num_subgroups)
                                            .any(|i| i != program.active && has_demand(i));
                                        conflicting
                                            || program.green_elapsed
                                                >= self.settings.max_green_seconds
                                    }
                                };
                                if switch {
                                    program.phase = Phase::Yellow;
                                    program.remaining = self.settings.yellow_seconds;
                                }
                            }
                        }
                        Phase::Yellow => {
                            if program.remaining <= 0. {
                                program.phase = Phase::Red;
                                program.remaining = self.settings.red_seconds;
                            }
                        }
                        Phase::Red => {
                            if program.remaining <= 0. {
                                program.active = (program.active + 1) % num_subgroups;
                                program.phase = Phase::Green;
                                program.remaining = self.settings.green_seconds;
                                program.green_elapsed = 0.;
                            }
                        }
                    }
                }
            }
        }
        self.write_colors(edges);
    }

    fn write_colors(&mut self, edges: &mut [EdgeState]) {
        for program in &self.programs {
            let group = self.groups.group(program.group);
            for (index, subgroup) in group.subgroups.iter().enumerate() {
                let color = if index == program.active {
                    LightColor::from(program.phase)
                } else {
                    LightColor::KeepRed
                };
                for approach in &subgroup.approaches {
                    let owner = self.partition.edge_owner(&self.network, *approach);
                    if owner == self.rank {
                        edges[approach.index()].light = Some(color);
                    } else {
                        self.outgoing_colors
                            .entry(owner)
                            .or_default()
                            .push((*approach, color));
                    }
                }
            }
        }
    }

    /// Collects the detections on approaches of groups homed at fellows, then resets all
    /// detection flags.
    pub fn collect_and_reset_detections(&mut self, edges: &mut [EdgeState]) {
        for group in self.groups.groups().iter().filter(|g| g.home != self.rank) {
            for subgroup in &group.subgroups {
                for approach in &subgroup.approaches {
                    let state = &edges[approach.index()];
                    if state.waiting_detected || state.priority_detected {
                        self.outgoing_detections
                            .entry(group.home)
                            .or_default()
                            .push(Detection {
                                edge: *approach,
                                waiting: state.waiting_detected,
                                priority: state.priority_detected,
                            });
                    }
                }
            }
        }
        for edge in edges.iter_mut() {
            edge.waiting_detected = false;
            edge.priority_detected = false;
        }
    }

    /// Detections reported by fellows for approaches of groups homed here.
    pub fn apply_detections(edges: &mut [EdgeState], detections: &[Detection]) {
        for detection in detections {
            let state = &mut edges[detection.edge.index()];
            state.waiting_detected |= detection.waiting;
            state.priority_detected |= detection.priority;
        }
    }

    /// Colors and detections which have to be sent to the given fellow.
    pub fn take_outgoing(&mut self, fellow: u32) -> (Vec<(Id<Edge>, LightColor)>, Vec<Detection>) {
        (
            self.outgoing_colors.remove(&fellow).unwrap_or_default(),
            self.outgoing_detections.remove(&fellow).unwrap_or_default(),
        )
    }

    pub fn snapshots(&self) -> Vec<LightSnapshot> {
        self.programs
            .iter()
            .map(|program| {
                let group = self.groups.group(program.group);
                LightSnapshot {
                    group: group.id.internal(),
                    nodes: group.nodes.iter().map(|n| n.internal()).collect(),
                    active_street: group
                        .subgroups
                        .get(program.active)
                        .map(|s| s.street.clone())
                        .unwrap_or_default(),
                    phase: program.phase,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    use crate::simulation::config::{Config, LightTiming};
    use crate::simulation::network::partitioning::Partition;
    use crate::simulation::network::road_network::RoadNetwork;
    use crate::simulation::traffic::lights::{LightColor, LightCoordinator, Phase};
    use crate::simulation::traffic::EdgeState;
    use crate::test_utils::create_signalled_crossing;

    fn setup(timing: LightTiming) -> (Arc<RoadNetwork>, LightCoordinator, Vec<EdgeState>) {
        let network = Arc::new(create_signalled_crossing(100.).finish(1000.));
        let partition = Arc::new(Partition {
            num_workers: 1,
            cell_owner: vec![0; network.grid.len()],
        });
        let mut config = Config::default();
        config.simulation.steps_per_second = 1;
        config.lights.timing = timing;
        config.lights.green_seconds = 5.;
        config.lights.yellow_seconds = 2.;
        config.lights.red_seconds = 1.;
        config.lights.max_green_seconds = 10.;
        let mut coordinator = LightCoordinator::new(network.clone(), partition, 0, &config);
        let mut edges = vec![EdgeState::default(); network.edges.len()];
        coordinator.init_colors(&mut edges);
        (network, coordinator, edges)
    }

    fn non_red_subgroups(coordinator: &LightCoordinator, edges: &[EdgeState]) -> usize {
        let group = &coordinator.groups().groups()[0];
        group
            .subgroups
            .iter()
            .filter(|s| {
                s.approaches
                    .iter()
                    .any(|e| edges[e.index()].light.is_some_and(|c| !c.is_red()))
            })
            .count()
    }

    #[test]
    fn fixed_cycle() {
        let (_, mut coordinator, mut edges) = setup(LightTiming::Fixed);
        let group = coordinator.groups().groups()[0].clone();
        assert_eq!(2, group.subgroups.len());
        let first = group.subgroups[0].approaches[0];
        let second = group.subgroups[1].approaches[0];

        assert_eq!(Some(LightColor::Green), edges[first.index()].light);
        assert_eq!(Some(LightColor::KeepRed), edges[second.index()].light);

        let mut colors = Vec::new();
        for _ in 0..9 {
            coordinator.update(&mut edges);
            colors.push((edges[first.index()].light, edges[second.index()].light));
        }
        // 5s green, 2s yellow, 1s red, then the second street gets green
        assert_eq!((Some(LightColor::Green), Some(LightColor::KeepRed)), colors[3]);
        assert_eq!((Some(LightColor::Yellow), Some(LightColor::KeepRed)), colors[4]);
        assert_eq!((Some(LightColor::Red), Some(LightColor::KeepRed)), colors[6]);
        assert_eq!((Some(LightColor::KeepRed), Some(LightColor::Green)), colors[7]);
    }

    #[test]
    fn dynamic_green_extends_without_demand() {
        let (_, mut coordinator, mut edges) = setup(LightTiming::Dynamic);
        for _ in 0..8 {
            coordinator.update(&mut edges);
            coordinator.collect_and_reset_detections(&mut edges);
        }
        assert_eq!(Phase::Green, coordinator.snapshots()[0].phase);

        // max green reached
        for _ in 0..3 {
            coordinator.update(&mut edges);
        }
        assert_eq!(Phase::Yellow, coordinator.snapshots()[0].phase);
    }

    #[test]
    fn dynamic_green_ends_on_conflicting_demand() {
        let (_, mut coordinator, mut edges) = setup(LightTiming::Dynamic);
        let second = coordinator.groups().groups()[0].subgroups[1].approaches[0];
        for _ in 0..5 {
            edges[second.index()].waiting_detected = true;
            coordinator.update(&mut edges);
            coordinator.collect_and_reset_detections(&mut edges);
        }
        assert_eq!(Phase::Yellow, coordinator.snapshots()[0].phase);
        assert!(!edges[second.index()].waiting_detected);
    }

    #[test]
    fn priority_vehicle_takes_over() {
        let (_, mut coordinator, mut edges) = setup(LightTiming::Fixed);
        let group = coordinator.groups().groups()[0].clone();
        let second = group.subgroups[1].approaches[0];

        edges[second.index()].priority_detected = true;
        coordinator.update(&mut edges);
        assert_eq!(Some(LightColor::Green), edges[second.index()].light);
        assert_eq!(group.subgroups[1].street, coordinator.snapshots()[0].active_street);

        // the active street keeps green while the priority vehicle is on it
        for _ in 0..20 {
            edges[second.index()].priority_detected = true;
            coordinator.update(&mut edges);
        }
        assert_eq!(Some(LightColor::Green), edges[second.index()].light);
    }

    #[test]
    fn at_most_one_subgroup_is_not_red() {
        let (_, mut coordinator, mut edges) = setup(LightTiming::Dynamic);
        let mut rnd = SmallRng::seed_from_u64(7);
        for _ in 0..500 {
            for edge in edges.iter_mut() {
                edge.waiting_detected = rnd.random_bool(0.3);
                edge.priority_detected = rnd.random_bool(0.05);
            }
            coordinator.update(&mut edges);
            assert!(non_red_subgroups(&coordinator, &edges) <= 1);
            coordinator.collect_and_reset_detections(&mut edges);
        }
    }
}
