use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::simulation::config::{CommandLineArgs, Config};
use crate::simulation::error::SetupError;
use crate::simulation::io::network::NetworkFile;
use crate::simulation::io::resolve_path;
use crate::simulation::io::routes::{ExternalRoute, RouteFile};
use crate::simulation::messaging::messages::SetupRecord;
use crate::simulation::network::partitioning::{self, Partition};
use crate::simulation::network::road_network::RoadNetwork;
use crate::simulation::workload::{build_roster, WorkerMeta};

/// A fully set up simulation environment: the network, its partition and the roster of workers
/// with their quotas. Building a scenario fails before anything is simulated if the
/// configuration can't be satisfied.
#[derive(Debug)]
pub struct Scenario {
    pub config: Arc<Config>,
    pub network: Arc<RoadNetwork>,
    pub partition: Partition,
    pub roster: Vec<WorkerMeta>,
    pub routes: Vec<ExternalRoute>,
    pub run: u64,
}

impl Scenario {
    /// Reads config, network and optional route definitions from disk.
    pub fn load(args: CommandLineArgs) -> Result<Self, SetupError> {
        let network_path = args.network.clone();
        let routes_path = args.routes.clone();
        let config = Config::try_from(args)?;

        let network_path = resolve_path(config.context(), Path::new(&network_path));
        let loaded =
            NetworkFile::from_file(&network_path)?.build(config.partitioning.max_cell_size)?;

        let routes = match routes_path {
            Some(path) => {
                let path = resolve_path(config.context(), Path::new(&path));
                RouteFile::from_file(&path)?
                    .resolve(&loaded.edge_ids, config.simulation.steps_per_second)?
            }
            None => Vec::new(),
        };

        Scenario::build(config, loaded.network, routes)
    }

    /// Partitions a finished network and apportions the vehicle quotas.
    pub fn build(
        config: Config,
        network: RoadNetwork,
        routes: Vec<ExternalRoute>,
    ) -> Result<Self, SetupError> {
        if network.nodes.is_empty() {
            return Err(SetupError::EmptyNetwork);
        }
        let partition = partitioning::partition(
            &network,
            &config.partitioning,
            config.simulation.seed,
        )?;
        let roster = build_roster(&network.grid, &partition, &config.vehicles);
        info!(
            "Scenario with {} nodes, {} edges and {} routes on {} workers",
            network.nodes.len(),
            network.edges.len(),
            routes.len(),
            partition.num_workers
        );
        Ok(Scenario {
            config: Arc::new(config),
            network: Arc::new(network),
            partition,
            roster,
            routes,
            run: 1,
        })
    }

    pub fn num_workers(&self) -> u32 {
        self.partition.num_workers
    }

    /// One setup record per worker. Every route goes to the worker owning its first edge.
    pub fn setup_records(&self) -> Vec<SetupRecord> {
        let mut routes_per_worker: Vec<Vec<ExternalRoute>> =
            vec![Vec::new(); self.num_workers() as usize];
        for route in &self.routes {
            if let Some(first) = route.legs.first() {
                let owner = self.partition.edge_owner(&self.network, first.edge);
                routes_per_worker[owner as usize].push(route.clone());
            }
        }

        routes_per_worker
            .into_iter()
            .enumerate()
            .map(|(worker, routes)| SetupRecord {
                run: self.run,
                worker: worker as u32,
                roster: self.roster.clone(),
                config: self.config.as_ref().clone(),
                routes,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use crate::simulation::config::{CommandLineArgs, Config};
    use crate::simulation::error::SetupError;
    use crate::simulation::id::Id;
    use crate::simulation::io::routes::ExternalRoute;
    use crate::simulation::network::road_network::RoadNetwork;
    use crate::simulation::scenario::Scenario;
    use crate::simulation::vehicles::{RouteLeg, VehicleType};
    use crate::test_utils::create_grid_network;

    fn config(num_workers: u32) -> Config {
        let mut config = Config::default();
        config.partitioning.num_workers = num_workers;
        config.partitioning.max_cell_size = 100.;
        config.vehicles.num_private = 9;
        config
    }

    #[test]
    fn routes_go_to_owner_of_first_edge() {
        let network = create_grid_network(1, 6, 100., 1).finish(100.);
        let last_edge = network.edges.last().unwrap().id;
        let routes = vec![
            ExternalRoute {
                id: Id::new(0),
                vehicle_type: VehicleType::Car,
                departure_step: 3,
                legs: vec![RouteLeg::new(Id::new(0))],
                foreground: true,
            },
            ExternalRoute {
                id: Id::new(1),
                vehicle_type: VehicleType::Priority,
                departure_step: 0,
                legs: vec![RouteLeg::new(last_edge)],
                foreground: true,
            },
        ];
        let scenario = Scenario::build(config(2), network, routes).unwrap();
        let setups = scenario.setup_records();

        assert_eq!(2, setups.len());
        assert_eq!(9, scenario.roster.iter().map(|m| m.quota.private).sum::<u32>());
        let owner_first = scenario.partition.edge_owner(&scenario.network, Id::new(0));
        let owner_last = scenario.partition.edge_owner(&scenario.network, last_edge);
        assert_ne!(owner_first, owner_last);
        assert_eq!(Id::new(0), setups[owner_first as usize].routes[0].id);
        assert_eq!(Id::new(1), setups[owner_last as usize].routes[0].id);
        assert!(setups.iter().all(|s| s.roster.len() == 2 && s.run == 1));
    }

    #[test]
    fn invalid_setups_fail() {
        assert!(matches!(
            Scenario::build(config(1), RoadNetwork::new(), vec![]),
            Err(SetupError::EmptyNetwork)
        ));

        let network = create_grid_network(1, 2, 100., 1).finish(100.);
        assert!(matches!(
            Scenario::build(config(10), network.clone(), vec![]),
            Err(SetupError::TooFewCells { .. })
        ));
        assert!(matches!(
            Scenario::build(config(0), network, vec![]),
            Err(SetupError::NoWorkers)
        ));
    }

    #[test]
    fn load_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut network = std::fs::File::create(dir.path().join("network.json")).unwrap();
        network
            .write_all(
                br#"{"nodes": [{"id": "a", "x": 0, "y": 0}, {"id": "b", "x": 500, "y": 0}],
                     "edges": [{"id": "ab", "from": "a", "to": "b"}]}"#,
            )
            .unwrap();
        let mut routes = std::fs::File::create(dir.path().join("routes.json")).unwrap();
        routes
            .write_all(br#"{"routes": [{"departure": 1, "legs": ["ab"]}]}"#)
            .unwrap();
        let mut config = std::fs::File::create(dir.path().join("config.yml")).unwrap();
        config
            .write_all(b"partitioning:\n  num_workers: 1\n  max_cell_size: 100\n")
            .unwrap();

        let mut args = CommandLineArgs::new_with_paths(
            dir.path().join("config.yml").display(),
            "network.json",
        );
        args.routes = Some("routes.json".to_string());
        args.num_workers = Some(2);
        let scenario = Scenario::load(args).unwrap();

        assert_eq!(2, scenario.num_workers());
        assert_eq!(1, scenario.routes.len());
        assert_eq!(5, scenario.routes[0].departure_step);
        assert_eq!(2, scenario.network.nodes.len());
    }
}
