use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::simulation::config::Config;
use crate::simulation::error::CommunicationError;
use crate::simulation::id::Id;
use crate::simulation::io::routes::ExternalRoute;
use crate::simulation::network::road_network::{Edge, Lane, Node};
use crate::simulation::report::TrafficReport;
use crate::simulation::traffic::lights::{Detection, LightColor};
use crate::simulation::traffic::BorderGhost;
use crate::simulation::vehicles::{Vehicle, VehicleCategory};
use crate::simulation::workload::WorkerMeta;

/// Everything exchanged between the server and the workers, and between workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Sets up a new environment on a worker. Sent by the server.
    Setup(Box<SetupRecord>),
    /// Starts the border exchange of a step. Sent by the server in synchronous mode.
    ShareTraffic { run: u64, step: u64 },
    /// Simulates one step, or in partially synchronous mode, starts the free run.
    SimulateOneStep(StepTrigger),
    Control(ControlCommand),
    /// Ends the current run. Workers reset and answer with `Finished`.
    Stop,
    /// Terminates the receiving participant.
    Kill,
    /// A worker is set up and waits for steps.
    Ready { worker: u32 },
    /// A worker received the border traffic of all its fellows.
    Shared { worker: u32, step: u64 },
    Report(Box<TrafficReport>),
    Finished { worker: u32, step: u64 },
    BorderTraffic(Box<BorderTraffic>),
}

impl Message {
    pub fn serialize(&self) -> Result<Vec<u8>, CommunicationError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CommunicationError::Encode(e.to_string()))
    }

    pub fn deserialize(data: &[u8]) -> Result<Message, CommunicationError> {
        bincode::serde::decode_from_slice(data, bincode::config::standard())
            .map(|(message, _)| message)
            .map_err(|e| CommunicationError::Decode(e.to_string()))
    }
}

/// What a worker needs to build its simulation, apart from the shared road network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupRecord {
    pub run: u64,
    pub worker: u32,
    pub roster: Vec<WorkerMeta>,
    pub config: Config,
    /// Route definitions starting on this worker's area.
    pub routes: Vec<ExternalRoute>,
}

/// Start of a step. In synchronous mode the server decides for each vehicle category whether
/// workers may create random vehicles in this step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTrigger {
    pub run: u64,
    pub step: u64,
    pub allow_private: bool,
    pub allow_trams: bool,
    pub allow_buses: bool,
}

impl StepTrigger {
    pub fn allow_all(run: u64, step: u64) -> Self {
        StepTrigger {
            run,
            step,
            allow_private: true,
            allow_trams: true,
            allow_buses: true,
        }
    }

    pub fn allows(&self, category: VehicleCategory) -> bool {
        match category {
            VehicleCategory::Private => self.allow_private,
            VehicleCategory::Tram => self.allow_trams,
            VehicleCategory::Bus => self.allow_buses,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlCommand {
    /// Wall clock pause after every step.
    SetStepPause { millis: u64 },
    BlockLane { lane: Id<Lane>, blocked: bool },
    SetTrafficLight { node: Id<Node>, enabled: bool },
    Pause,
    Resume,
    Stop,
}

/// Data a worker sends to one fellow after a step: the vehicles crossing over, the ghosts of
/// vehicles which arrived through the fellow's lanes, signal colors for the fellow's approach
/// edges and detections on our approaches of the fellow's light groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BorderTraffic {
    pub run: u64,
    pub step: u64,
    pub sender: u32,
    pub receiver: u32,
    pub vehicles: Vec<Vehicle>,
    pub lane_ghosts: Vec<(Id<Lane>, BorderGhost)>,
    pub light_colors: Vec<(Id<Edge>, LightColor)>,
    pub detections: Vec<Detection>,
}

impl BorderTraffic {
    pub fn new(run: u64, step: u64, sender: u32, receiver: u32) -> Self {
        BorderTraffic {
            run,
            step,
            sender,
            receiver,
            vehicles: Vec::new(),
            lane_ghosts: Vec::new(),
            light_colors: Vec::new(),
            detections: Vec::new(),
        }
    }
}

// Records are cached in a max heap. Reverse ordering pops the earliest step first, and within
// a step the lowest sender.
impl PartialOrd for BorderTraffic {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Eq for BorderTraffic {}

impl Ord for BorderTraffic {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .step
            .cmp(&self.step)
            .then_with(|| other.sender.cmp(&self.sender))
    }
}
