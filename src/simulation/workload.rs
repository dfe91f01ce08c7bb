use serde::{Deserialize, Serialize};
use tracing::info;

use crate::simulation::config::Vehicles;
use crate::simulation::id::Id;
use crate::simulation::network::grid::{Grid, GridCell};
use crate::simulation::network::partitioning::Partition;
use crate::simulation::traffic::VehicleCounts;

/// Everything the other participants need to know about one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMeta {
    pub name: String,
    pub rank: u32,
    pub workarea: Vec<Id<GridCell>>,
    pub lane_length: f64,
    pub lane_length_ratio: f64,
    /// Maximum number of random vehicles per category this worker may have at once.
    pub quota: VehicleCounts,
}

/// Splits `total` according to `ratios`. Every worker but the last gets the rounded down share,
/// the last one gets the remainder, so the parts always sum up to `total`.
pub fn apportion(total: u32, ratios: &[f64]) -> Vec<u32> {
    let Some(last) = ratios.len().checked_sub(1) else {
        return Vec::new();
    };
    let mut result = Vec::with_capacity(ratios.len());
    let mut assigned = 0u32;
    for ratio in &ratios[..last] {
        let share = ((total as f64 * ratio.clamp(0., 1.)).floor() as u32).min(total - assigned);
        assigned += share;
        result.push(share);
    }
    result.push(total - assigned);
    result
}

/// Share of each worker in the random traffic. With source windows, this is the fraction of
/// windowed cells inside the worker's area, otherwise its fraction of the total lane length.
pub fn spawn_ratios(grid: &Grid, partition: &Partition, vehicles: &Vehicles) -> Vec<f64> {
    let workers = 0..partition.num_workers;
    if vehicles.source_windows.is_empty() {
        let total = grid.total_lane_length();
        return workers
            .map(|w| {
                if total > 0. {
                    partition.lane_length(grid, w) / total
                } else {
                    1. / partition.num_workers as f64
                }
            })
            .collect();
    }

    let windowed: Vec<&GridCell> = grid
        .cells
        .iter()
        .filter(|c| {
            vehicles
                .source_windows
                .iter()
                .any(|w| w.contains(c.row, c.col))
        })
        .collect();
    if windowed.is_empty() {
        return workers.map(|_| 0.).collect();
    }
    workers
        .map(|w| {
            let inside = windowed
                .iter()
                .filter(|c| partition.cell_owner[c.id.index()] == w)
                .count();
            inside as f64 / windowed.len() as f64
        })
        .collect()
}

/// Builds the roster of all workers from a partition. Quotas are only computed here, so they
/// change only when a new environment is set up.
pub fn build_roster(grid: &Grid, partition: &Partition, vehicles: &Vehicles) -> Vec<WorkerMeta> {
    let total = grid.total_lane_length();
    let ratios = spawn_ratios(grid, partition, vehicles);
    let private = apportion(vehicles.num_private, &ratios);
    let trams = apportion(vehicles.num_trams, &ratios);
    let buses = apportion(vehicles.num_buses, &ratios);

    (0..partition.num_workers)
        .map(|rank| {
            let lane_length = partition.lane_length(grid, rank);
            let i = rank as usize;
            let meta = WorkerMeta {
                name: format!("worker-{rank}"),
                rank,
                workarea: partition.workarea(rank),
                lane_length,
                lane_length_ratio: if total > 0. { lane_length / total } else { 0. },
                quota: VehicleCounts {
                    private: private[i],
                    trams: trams[i],
                    buses: buses[i],
                },
            };
            info!(
                "{}: {} cells, {:.1}% of lane length, quota {:?}",
                meta.name,
                meta.workarea.len(),
                meta.lane_length_ratio * 100.,
                meta.quota
            );
            meta
        })
        .collect()
}
