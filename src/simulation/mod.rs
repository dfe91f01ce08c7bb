pub mod config;
pub mod controller;
pub mod dynamics;
pub mod error;
pub mod fellow;
pub mod id;
pub mod io;
pub mod logging;
pub mod messaging;
pub mod network;
pub mod random;
pub mod report;
pub mod scenario;
#[allow(clippy::module_inception)]
pub mod simulation;
pub mod time_queue;
pub mod traffic;
pub mod vehicles;
pub mod workload;
