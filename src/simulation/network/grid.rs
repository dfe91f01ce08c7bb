use serde::{Deserialize, Serialize};

use crate::simulation::id::Id;
use crate::simulation::network::road_network::{Node, RoadNetwork};

/// Uniform grid laid over the road network. Cells are the unit of partitioning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Grid {
    pub rows: u32,
    pub cols: u32,
    pub min_x: f64,
    pub min_y: f64,
    pub cell_width: f64,
    pub cell_height: f64,
    /// Cells in row-major order.
    pub cells: Vec<GridCell>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridCell {
    pub id: Id<GridCell>,
    pub row: u32,
    pub col: u32,
    pub nodes: Vec<Id<Node>>,
    /// Accumulated length of all lanes leaving nodes inside this cell.
    pub lane_length: f64,
}

impl Grid {
    pub fn build(network: &RoadNetwork, max_cell_size: f64) -> Self {
        if network.nodes.is_empty() {
            return Grid::default();
        }

        let (min_x, max_x) = min_max(network.nodes.iter().map(|n| n.x));
        let (min_y, max_y) = min_max(network.nodes.iter().map(|n| n.y));
        let width = max_x - min_x;
        let height = max_y - min_y;

        let cols = ((width / max_cell_size).ceil() as u32).max(1);
        let rows = ((height / max_cell_size).ceil() as u32).max(1);
        let cell_width = if width > 0. { width / cols as f64 } else { max_cell_size };
        let cell_height = if height > 0. { height / rows as f64 } else { max_cell_size };

        let mut grid = Grid {
            rows,
            cols,
            min_x,
            min_y,
            cell_width,
            cell_height,
            cells: Vec::with_capacity((rows * cols) as usize),
        };

        for row in 0..rows {
            for col in 0..cols {
                grid.cells.push(GridCell {
                    id: Id::from(grid.cells.len()),
                    row,
                    col,
                    nodes: Vec::new(),
                    lane_length: 0.,
                });
            }
        }

        for node in &network.nodes {
            let cell = grid.cell_index(node.x, node.y);
            let lane_length: f64 = node
                .out_edges
                .iter()
                .map(|e| network.edge(*e).lane_length())
                .sum();
            grid.cells[cell].nodes.push(node.id);
            grid.cells[cell].lane_length += lane_length;
        }

        grid
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn cell(&self, id: Id<GridCell>) -> &GridCell {
        &self.cells[id.index()]
    }

    pub fn total_lane_length(&self) -> f64 {
        self.cells.iter().map(|c| c.lane_length).sum()
    }

    /// Row-major index of the cell containing the coordinate. Coordinates outside the grid are
    /// clamped to the border cells.
    pub fn cell_index(&self, x: f64, y: f64) -> usize {
        let col = clamp_index((x - self.min_x) / self.cell_width, self.cols);
        let row = clamp_index((y - self.min_y) / self.cell_height, self.rows);
        (row * self.cols + col) as usize
    }

    /// Nearest node to the coordinate, searching rings of cells around the containing cell.
    pub fn nearest_node(&self, network: &RoadNetwork, x: f64, y: f64) -> Option<Id<Node>> {
        if self.cells.is_empty() {
            return None;
        }
        let center = &self.cells[self.cell_index(x, y)];
        let max_ring = self.rows.max(self.cols) as i64;

        let mut best: Option<(f64, Id<Node>)> = None;
        for ring in 0..=max_ring {
            for cell in self.ring(center.row as i64, center.col as i64, ring) {
                for node in &cell.nodes {
                    let n = network.node(*node);
                    let dist = ((n.x - x).powi(2) + (n.y - y).powi(2)).sqrt();
                    if best.map_or(true, |(d, _)| dist < d) {
                        best = Some((dist, *node));
                    }
                }
            }
            // anything in the next ring is at least this far away
            let ring_reach = ring as f64 * self.cell_width.min(self.cell_height);
            if let Some((d, _)) = best {
                if d <= ring_reach {
                    break;
                }
            }
        }
        best.map(|(_, id)| id)
    }

    fn ring(&self, row: i64, col: i64, ring: i64) -> impl Iterator<Item = &GridCell> {
        let rows = self.rows as i64;
        let cols = self.cols as i64;
        (row - ring..=row + ring)
            .flat_map(move |r| (col - ring..=col + ring).map(move |c| (r, c)))
            .filter(move |(r, c)| {
                (r - row).abs() == ring || (c - col).abs() == ring
            })
            .filter(move |(r, c)| *r >= 0 && *c >= 0 && *r < rows && *c < cols)
            .map(move |(r, c)| &self.cells[(r * cols + c) as usize])
    }
}

fn clamp_index(value: f64, count: u32) -> u32 {
    if value <= 0. {
        0
    } else {
        (value.floor() as u32).min(count - 1)
    }
}

fn min_max(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::MAX, f64::MIN), |(min, max), v| (min.min(v), max.max(v)))
}
