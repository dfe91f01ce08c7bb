use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use rust_traffic_sim::simulation::config::CommandLineArgs;
use rust_traffic_sim::simulation::controller::local_controller::LocalControllerBuilder;
use rust_traffic_sim::simulation::logging;
use rust_traffic_sim::simulation::report::LoggingSink;
use rust_traffic_sim::simulation::scenario::Scenario;

fn main() -> ExitCode {
    let _guard = logging::init_std_out_logging_thread_local();
    let args = CommandLineArgs::parse();
    info!("Started with args: {args:?}");

    let scenario = match Scenario::load(args) {
        Ok(scenario) => scenario,
        Err(e) => {
            error!("Could not set up the scenario: {e}");
            return ExitCode::FAILURE;
        }
    };
    let interval = scenario.config.output.report_interval_steps;

    let result = LocalControllerBuilder::default()
        .scenario(scenario)
        .sink(Box::new(LoggingSink::new(interval)))
        .build()
        .map_err(|e| e.to_string())
        .and_then(|controller| controller.run().map_err(|e| e.to_string()));

    match result {
        Ok(summary) => {
            info!(
                "Run {} finished after {} steps. Created {}, completed {}, removed {}, still active {}, parked {}",
                summary.run,
                summary.steps,
                summary.created,
                summary.completed,
                summary.removed,
                summary.active,
                summary.parked
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Simulation failed: {e}");
            ExitCode::FAILURE
        }
    }
}
