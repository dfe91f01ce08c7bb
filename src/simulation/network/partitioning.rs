use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::simulation::config::{PartitionMethod, Partitioning};
use crate::simulation::error::SetupError;
use crate::simulation::id::Id;
use crate::simulation::network::grid::{Grid, GridCell};
use crate::simulation::network::metis_partitioning;
use crate::simulation::network::road_network::{Edge, Node, RoadNetwork};
use crate::simulation::random::{stream_rng, Stream};

/// Assignment of every grid cell to exactly one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub num_workers: u32,
    /// Owning worker per cell, indexed like `Grid::cells`.
    pub cell_owner: Vec<u32>,
}

impl Partition {
    /// Rebuilds the partition from the cells listed per worker.
    pub fn from_workareas(num_cells: usize, workareas: &[Vec<Id<GridCell>>]) -> Self {
        let mut cell_owner = vec![0; num_cells];
        for (worker, area) in workareas.iter().enumerate() {
            for cell in area {
                cell_owner[cell.index()] = worker as u32;
            }
        }
        Partition {
            num_workers: workareas.len() as u32,
            cell_owner,
        }
    }

    pub fn workarea(&self, worker: u32) -> Vec<Id<GridCell>> {
        self.cell_owner
            .iter()
            .enumerate()
            .filter(|(_, owner)| **owner == worker)
            .map(|(cell, _)| Id::from(cell))
            .collect()
    }

    pub fn node_owner(&self, network: &RoadNetwork, node: Id<Node>) -> u32 {
        self.cell_owner[network.node(node).cell.index()]
    }

    /// Edges belong to the worker which owns their start node.
    pub fn edge_owner(&self, network: &RoadNetwork, edge: Id<Edge>) -> u32 {
        self.node_owner(network, network.edge(edge).from)
    }

    /// Total lane length of the edges starting in the worker's area.
    pub fn lane_length(&self, grid: &Grid, worker: u32) -> f64 {
        grid.cells
            .iter()
            .filter(|c| self.cell_owner[c.id.index()] == worker)
            .map(|c| c.lane_length)
            .sum()
    }
}

/// Checks the invariants every partitioning method relies on.
pub fn validate(grid: &Grid, num_workers: u32) -> Result<(), SetupError> {
    if num_workers == 0 {
        return Err(SetupError::NoWorkers);
    }
    if grid.len() < num_workers as usize {
        return Err(SetupError::TooFewCells {
            cells: grid.len(),
            workers: num_workers,
        });
    }
    Ok(())
}

pub fn partition(
    network: &RoadNetwork,
    config: &Partitioning,
    seed: u64,
) -> Result<Partition, SetupError> {
    validate(&network.grid, config.num_workers)?;

    let partition = match config.method {
        PartitionMethod::Metis if config.num_workers > 1 => {
            metis_partitioning::partition(network, config.num_workers)?
        }
        _ => {
            let mut rnd = stream_rng(seed, Stream::Partitioning);
            partition_by_lane_length(&network.grid, config.num_workers, &mut rnd)?
        }
    };

    for worker in 0..partition.num_workers {
        info!(
            "Worker #{worker} owns {} cells with {:.0}m of lanes",
            partition.workarea(worker).len(),
            partition.lane_length(&network.grid, worker)
        );
    }
    Ok(partition)
}

/// Walks the cells in row-major order and fills one worker after the other until its share of
/// the total lane length is reached. The cell crossing the share goes to the current or to the
/// next worker by coin flip. Every worker receives at least one cell, the last worker takes
/// whatever remains.
pub fn partition_by_lane_length(
    grid: &Grid,
    num_workers: u32,
    rnd: &mut impl Rng,
) -> Result<Partition, SetupError> {
    validate(grid, num_workers)?;

    let target = grid.total_lane_length() / num_workers as f64;
    let last = num_workers - 1;
    let num_cells = grid.len();

    let mut cell_owner = vec![0; num_cells];
    let mut worker = 0;
    let mut accumulated = 0.;
    let mut cells_of_worker = 0;

    for (i, cell) in grid.cells.iter().enumerate() {
        let cells_left = num_cells - i;
        let workers_after = (last - worker) as usize;

        if worker < last && cells_of_worker > 0 {
            let full = accumulated >= target;
            let must_move_on = cells_left <= workers_after;
            if full || must_move_on {
                worker += 1;
                accumulated = 0.;
                cells_of_worker = 0;
            } else if accumulated + cell.lane_length > target && rnd.random_bool(0.5) {
                worker += 1;
                accumulated = 0.;
                cells_of_worker = 0;
            }
        }

        cell_owner[i] = worker;
        accumulated += cell.lane_length;
        cells_of_worker += 1;
    }

    Ok(Partition {
        num_workers,
        cell_owner,
    })
}

#[cfg(test)]
mod tests {
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    use crate::simulation::error::SetupError;
    use crate::simulation::id::Id;
    use crate::simulation::network::grid::{Grid, GridCell};
    use crate::simulation::network::partitioning::{partition_by_lane_length, Partition};

    fn uniform_grid(rows: u32, cols: u32, weight: f64) -> Grid {
        let mut cells = Vec::new();
        for row in 0..rows {
            for col in 0..cols {
                cells.push(GridCell {
                    id: Id::from(cells.len()),
                    row,
                    col,
                    nodes: vec![],
                    lane_length: weight,
                });
            }
        }
        Grid {
            rows,
            cols,
            min_x: 0.,
            min_y: 0.,
            cell_width: 100.,
            cell_height: 100.,
            cells,
        }
    }

    #[test]
    fn balanced_split_of_uniform_grid() {
        let grid = uniform_grid(4, 4, 100.);
        for seed in 0..20 {
            let mut rnd = SmallRng::seed_from_u64(seed);
            let partition = partition_by_lane_length(&grid, 2, &mut rnd).unwrap();
            let first = partition.workarea(0).len();
            let second = partition.workarea(1).len();
            assert_eq!(16, first + second);
            assert!((7..=9).contains(&first), "worker 0 got {first} cells");
        }
    }

    #[test]
    fn every_cell_has_exactly_one_owner() {
        let grid = uniform_grid(5, 7, 10.);
        let mut rnd = SmallRng::seed_from_u64(3);
        let partition = partition_by_lane_length(&grid, 4, &mut rnd).unwrap();

        let mut seen = vec![0; grid.len()];
        for worker in 0..4 {
            let area = partition.workarea(worker);
            assert!(!area.is_empty());
            for cell in area {
                seen[cell.index()] += 1;
            }
        }
        assert!(seen.iter().all(|count| *count == 1));
    }

    #[test]
    fn balance_within_tolerance() {
        let grid = uniform_grid(10, 10, 250.);
        let mut rnd = SmallRng::seed_from_u64(11);
        let partition = partition_by_lane_length(&grid, 4, &mut rnd).unwrap();
        let share = grid.total_lane_length() / 4.;
        for worker in 0..4 {
            let deviation = (partition.lane_length(&grid, worker) - share).abs() / share;
            assert!(deviation < 0.1, "worker {worker} deviates by {deviation}");
        }
    }

    #[test]
    fn skewed_weights_still_give_every_worker_a_cell() {
        let mut grid = uniform_grid(1, 4, 0.);
        grid.cells[0].lane_length = 1000.;
        let mut rnd = SmallRng::seed_from_u64(1);
        let partition = partition_by_lane_length(&grid, 4, &mut rnd).unwrap();
        assert_eq!(vec![0, 1, 2, 3], partition.cell_owner);
    }

    #[test]
    fn invalid_worker_counts() {
        let grid = uniform_grid(2, 2, 1.);
        let mut rnd = SmallRng::seed_from_u64(1);
        assert!(matches!(
            partition_by_lane_length(&grid, 0, &mut rnd),
            Err(SetupError::NoWorkers)
        ));
        assert!(matches!(
            partition_by_lane_length(&grid, 5, &mut rnd),
            Err(SetupError::TooFewCells { cells: 4, workers: 5 })
        ));
    }

    #[test]
    fn rebuild_from_workareas() {
        let areas = vec![vec![Id::new(1), Id::new(2)], vec![Id::new(0), Id::new(3)]];
        let partition = Partition::from_workareas(4, &areas);
        assert_eq!(vec![1, 0, 0, 1], partition.cell_owner);
        assert_eq!(2, partition.num_workers);
    }
}
