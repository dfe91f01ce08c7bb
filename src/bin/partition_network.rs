use std::process::ExitCode;

use clap::Parser;

use rust_traffic_sim::simulation::config::CommandLineArgs;
use rust_traffic_sim::simulation::fellow::{border_edges, find_fellows};
use rust_traffic_sim::simulation::scenario::Scenario;

fn main() -> ExitCode {
    let args = CommandLineArgs::parse();
    println!("Partition network {} with config {}", args.network, args.config);

    let scenario = match Scenario::load(args) {
        Ok(scenario) => scenario,
        Err(e) => {
            eprintln!("Could not partition the network: {e}");
            return ExitCode::FAILURE;
        }
    };
    let network = &scenario.network;
    let partition = &scenario.partition;
    println!(
        "Network is loaded with {} edges and {} nodes on a grid of {} x {} cells.",
        network.edges.len(),
        network.nodes.len(),
        network.grid.rows,
        network.grid.cols
    );

    for meta in &scenario.roster {
        let fellows = find_fellows(network, partition, meta.rank);
        let border = border_edges(network, &fellows);
        println!(
            "{}: {} cells, {:.0}m lanes ({:.1}%), {} fellows, {} border edges, quota {:?}",
            meta.name,
            meta.workarea.len(),
            meta.lane_length,
            meta.lane_length_ratio * 100.,
            fellows.len(),
            border.len(),
            meta.quota
        );
    }
    ExitCode::SUCCESS
}
