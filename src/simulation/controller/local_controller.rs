use std::thread::{self, JoinHandle};

use derive_builder::Builder;
use nohash_hasher::IntMap;
use tracing::{info, warn};

use crate::simulation::controller::server::Server;
use crate::simulation::controller::{execute_worker, try_join, WorkerArgumentsBuilder};
use crate::simulation::error::SetupError;
use crate::simulation::logging;
use crate::simulation::messaging::communication::{
    Address, ChannelSimCommunicator, ControlHandle, SimCommunicator,
};
use crate::simulation::report::{LoggingSink, ReportSink, RunSummary};
use crate::simulation::scenario::Scenario;

/// Runs a scenario with the server and every worker on threads of this process.
#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct LocalController {
    scenario: Scenario,
    #[builder(default = "Box::new(LoggingSink::new(100))")]
    sink: Box<dyn ReportSink>,
}

impl LocalController {
    /// Spawns all participants. The run starts right away; use the returned handle to control
    /// and to join it.
    pub fn start(self) -> Result<RunningEnvironment, SetupError> {
        let num_workers = self.scenario.num_workers();
        info!("Starting local environment with {num_workers} workers");
        let (server_comm, worker_comms) = ChannelSimCommunicator::create_n_2_n(num_workers);
        let control = server_comm.control_handle()?;

        let mut workers = IntMap::default();
        for comm in worker_comms {
            let Address::Worker(rank) = comm.address() else {
                continue;
            };
            let args = WorkerArgumentsBuilder::default()
                .rank(rank)
                .communicator(comm)
                .network(self.scenario.network.clone())
                .config(self.scenario.config.clone())
                .build()
                .map_err(|e| SetupError::Start(e.to_string()))?;
            let handle = thread::Builder::new()
                .name(format!("traffic-sim-{rank}"))
                .spawn(move || execute_worker(args))
                .map_err(|e| SetupError::Start(e.to_string()))?;
            workers.insert(rank, handle);
        }

        let server = Server::new(server_comm, self.scenario.setup_records(), self.sink)?;
        let server = thread::Builder::new()
            .name("traffic-sim-server".to_string())
            .spawn(move || {
                let _guard = logging::init_std_out_logging_thread_local();
                server.run()
            })
            .map_err(|e| SetupError::Start(e.to_string()))?;

        Ok(RunningEnvironment {
            control,
            server,
            workers,
        })
    }

    /// Runs the scenario to its end.
    pub fn run(self) -> Result<RunSummary, SetupError> {
        self.start()?.join()
    }
}

/// Threads of a started environment.
pub struct RunningEnvironment {
    control: ControlHandle,
    server: JoinHandle<Result<RunSummary, SetupError>>,
    workers: IntMap<u32, JoinHandle<Result<(), SetupError>>>,
}

impl RunningEnvironment {
    pub fn control(&self) -> &ControlHandle {
        &self.control
    }

    /// Waits for all participants. If a worker fails, the server is killed, as it can't finish
    /// the run without it.
    pub fn join(self) -> Result<RunSummary, SetupError> {
        let RunningEnvironment {
            control,
            server,
            workers,
        } = self;
        if let Err(e) = try_join(workers) {
            if control.kill().is_err() {
                warn!("Server is already gone");
            }
            return Err(e);
        }
        match server.join() {
            Ok(result) => result,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::simulation::config::Config;
    use crate::simulation::controller::local_controller::LocalControllerBuilder;
    use crate::simulation::report::CollectingSink;
    use crate::simulation::scenario::Scenario;
    use crate::test_utils::create_grid_network;

    #[test]
    fn single_worker_run() {
        let mut config = Config::default();
        config.simulation.max_num_steps = 20;
        config.partitioning.max_cell_size = 100.;
        config.vehicles.num_private = 4;
        let network = create_grid_network(3, 3, 100., 1).finish(100.);
        let scenario = Scenario::build(config, network, vec![]).unwrap();

        let sink = CollectingSink::new();
        let summary = LocalControllerBuilder::default()
            .scenario(scenario)
            .sink(Box::new(sink.clone()))
            .build()
            .unwrap()
            .run()
            .unwrap();

        assert_eq!(20, summary.steps);
        assert_eq!(20, sink.len());
        assert!(summary.is_conserved());
        assert!(summary.created > 0);
    }
}
