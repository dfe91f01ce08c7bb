use std::collections::BTreeMap;

use metis::{Graph, Idx};
use tracing::info;

use crate::simulation::error::SetupError;
use crate::simulation::network::partitioning::Partition;
use crate::simulation::network::road_network::RoadNetwork;

/// Partitions the grid cells with metis. Vertices are cells weighted by their lane length,
/// graph edges connect cells which are linked by at least one road. The weight of a graph edge
/// is the number of lanes crossing between the two cells.
pub fn partition(network: &RoadNetwork, num_workers: u32) -> Result<Partition, SetupError> {
    let num_cells = network.grid.len();
    if num_workers <= 1 {
        return Ok(Partition {
            num_workers: 1,
            cell_owner: vec![0; num_cells],
        });
    }

    info!("Converting cell graph into Metis format");
    let mut adjacency: Vec<BTreeMap<usize, Idx>> = vec![BTreeMap::new(); num_cells];
    for edge in &network.edges {
        let from = network.node(edge.from).cell.index();
        let to = network.node(edge.to).cell.index();
        if from == to {
            continue;
        }
        let lanes = edge.num_lanes() as Idx;
        // metis requires a symmetric graph
        *adjacency[from].entry(to).or_insert(0) += lanes;
        *adjacency[to].entry(from).or_insert(0) += lanes;
    }

    let mut xadj: Vec<Idx> = Vec::from([0]);
    let mut adjncy: Vec<Idx> = Vec::new();
    let mut adjwgt: Vec<Idx> = Vec::new();
    let mut vwgt: Vec<Idx> = Vec::with_capacity(num_cells);

    for (cell, neighbors) in adjacency.iter().enumerate() {
        for (neighbor, weight) in neighbors {
            adjncy.push(*neighbor as Idx);
            adjwgt.push(*weight);
        }
        xadj.push(adjncy.len() as Idx);
        // empty cells must not have a weight of zero, otherwise metis treats them as free riders
        vwgt.push((network.grid.cells[cell].lane_length.round() as Idx).max(1));
    }

    let mut result: Vec<Idx> = vec![0; num_cells];

    info!("Calling Metis Partitioning Library");
    Graph::new(1, num_workers as Idx, &xadj, &adjncy)
        .map_err(|e| SetupError::Metis(format!("{e:?}")))?
        .set_vwgt(&vwgt)
        .set_adjwgt(&adjwgt)
        .set_option(metis::option::Seed(4711))
        .part_kway(&mut result)
        .map_err(|e| SetupError::Metis(format!("{e:?}")))?;

    let mut cell_owner: Vec<u32> = result.into_iter().map(|p| p as u32).collect();
    fill_empty_workers(&mut cell_owner, num_workers);

    Ok(Partition {
        num_workers,
        cell_owner,
    })
}

/// Metis does not guarantee non-empty parts. Workers without cells take one from the worker
/// owning the most cells.
fn fill_empty_workers(cell_owner: &mut [u32], num_workers: u32) {
    loop {
        let mut counts = vec![0usize; num_workers as usize];
        for owner in cell_owner.iter() {
            counts[*owner as usize] += 1;
        }
        let Some(empty) = counts.iter().position(|c| *c == 0) else {
            return;
        };
        let Some((largest, _)) = counts.iter().enumerate().max_by_key(|(_, c)| **c) else {
            return;
        };
        if let Some(cell) = cell_owner.iter().rposition(|o| *o as usize == largest) {
            cell_owner[cell] = empty as u32;
        }
    }
}
