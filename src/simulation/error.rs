use std::path::PathBuf;

use thiserror::Error;

use crate::simulation::messaging::communication::Address;

/// Violations which prevent an environment from being set up. A run never starts when one of
/// these is returned.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("at least one worker is required")]
    NoWorkers,
    #[error("the grid has {cells} cells, which is fewer than the {workers} requested workers")]
    TooFewCells { cells: usize, workers: u32 },
    #[error("the road network has no nodes")]
    EmptyNetwork,
    #[error("graph partitioning failed: {0}")]
    Metis(String),
    #[error("route {route} references unknown edge {edge}")]
    UnknownEdge { route: usize, edge: String },
    #[error("route {0} has no legs")]
    EmptyRoute(usize),
    #[error("worker {0} is not part of the roster")]
    UnknownWorker(u32),
    #[error("could not start the environment: {0}")]
    Start(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Communication(#[from] CommunicationError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config file {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Error)]
pub enum IoError {
    #[error("could not read {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("edge {edge} references unknown node {node}")]
    UnknownNode { edge: String, node: String },
    #[error("duplicate {kind} id {id}")]
    DuplicateId { kind: &'static str, id: String },
}

#[derive(Debug, Error)]
pub enum CommunicationError {
    #[error("endpoint {0:?} is not reachable anymore")]
    Disconnected(Address),
    #[error("no endpoint registered for {0:?}")]
    UnknownAddress(Address),
    #[error("could not encode message: {0}")]
    Encode(String),
    #[error("could not decode message: {0}")]
    Decode(String),
}

/// Reasons why a vehicle could not be created. These are always recovered by the caller.
#[derive(Debug, Error, PartialEq)]
pub enum CreateVehicleError {
    #[error("route has no legs")]
    EmptyRoute,
    #[error("no route from the start edge to the destination")]
    Unreachable,
    #[error("start edge {0} is not owned by this worker")]
    NotOwned(u64),
    #[error("virtual vehicles can't be created")]
    VirtualVehicle,
}
