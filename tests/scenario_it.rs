use std::fs;

use rust_traffic_sim::simulation::config::{CommandLineArgs, Config, PartitionMethod, SyncMode};
use rust_traffic_sim::simulation::fellow::find_fellows;
use rust_traffic_sim::simulation::scenario::Scenario;
use rust_traffic_sim::test_utils::create_grid_network;

const NETWORK: &str = r#"{
  "nodes": [
    {"id": "a", "x": 0, "y": 0},
    {"id": "b", "x": 300, "y": 0, "signal": true},
    {"id": "c", "x": 600, "y": 0},
    {"id": "d", "x": 300, "y": 300}
  ],
  "edges": [
    {"id": "ab", "from": "a", "to": "b", "lanes": 2},
    {"id": "ba", "from": "b", "to": "a", "lanes": 2},
    {"id": "bc", "from": "b", "to": "c"},
    {"id": "cb", "from": "c", "to": "b"},
    {"id": "db", "from": "d", "to": "b"}
  ]
}"#;

const CONFIG: &str = r#"
partitioning:
  num_workers: 1
  max_cell_size: 150
simulation:
  steps_per_second: 2
  max_num_steps: 100
vehicles:
  num_private: 5
"#;

#[test]
fn scenario_from_files_with_overrides() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("network.json"), NETWORK).unwrap();
    fs::write(dir.path().join("config.yml"), CONFIG).unwrap();
    fs::write(
        dir.path().join("routes.json"),
        r#"{"routes": [{"departure": 2, "legs": ["ab", "bc"]}, {"departure": 0, "legs": ["db", "ba"]}]}"#,
    )
    .unwrap();

    let mut args = CommandLineArgs::new_with_paths(
        dir.path().join("config.yml").display(),
        "network.json",
    );
    args.routes = Some("routes.json".to_string());
    args.overrides = vec![
        ("partitioning.num_workers".to_string(), "2".to_string()),
        ("simulation.sync".to_string(), "psp".to_string()),
    ];
    let scenario = Scenario::load(args).unwrap();

    assert_eq!(2, scenario.num_workers());
    assert_eq!(SyncMode::Psp, scenario.config.simulation.sync);
    assert_eq!(4, scenario.network.nodes.len());
    assert_eq!(5, scenario.network.edges.len());
    assert_eq!(2, scenario.routes.len());
    // seconds are converted into steps
    assert_eq!(4, scenario.routes[0].departure_step);

    let setups = scenario.setup_records();
    assert_eq!(2, setups.len());
    assert_eq!(2, setups.iter().map(|s| s.routes.len()).sum::<usize>());
    assert_eq!(
        5,
        scenario.roster.iter().map(|m| m.quota.private).sum::<u32>()
    );
}

#[test]
fn missing_config_file_fails() {
    let args = CommandLineArgs::new_with_paths("/does/not/exist.yml", "network.json");
    assert!(Scenario::load(args).is_err());
}

#[test]
fn metis_partition_has_connected_workers() {
    let mut config = Config::default();
    config.partitioning.num_workers = 3;
    config.partitioning.method = PartitionMethod::Metis;
    config.partitioning.max_cell_size = 100.;
    let network = create_grid_network(6, 6, 100., 1).finish(100.);
    let scenario = Scenario::build(config, network, vec![]).unwrap();

    let mut owners = scenario.partition.cell_owner.clone();
    owners.sort();
    owners.dedup();
    assert_eq!(vec![0, 1, 2], owners);
    for worker in 0..3 {
        let fellows = find_fellows(&scenario.network, &scenario.partition, worker);
        assert!(!fellows.is_empty(), "worker {worker} has no fellows");
        assert!(fellows.iter().all(|f| f.rank != worker));
    }
}

#[test]
fn lane_length_partition_is_balanced() {
    let mut config = Config::default();
    config.partitioning.num_workers = 2;
    config.partitioning.max_cell_size = 100.;
    let network = create_grid_network(5, 5, 100., 1).finish(100.);
    let scenario = Scenario::build(config, network, vec![]).unwrap();

    let total = scenario.network.grid.total_lane_length();
    for meta in &scenario.roster {
        let share = meta.lane_length / total;
        assert!((share - 0.5).abs() < 0.2, "{} owns {share}", meta.name);
        assert!((meta.lane_length_ratio - share).abs() < 1e-9);
    }
}
