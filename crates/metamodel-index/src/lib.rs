//! Spatial topologies backing cell-network range queries.
//!
//! A topology only decides which cells exist and how they are wired; cell
//! contents (utility, payload) and ownership live in `metamodel-core`.

use ordered_float::OrderedFloat;
use rand::Rng;
use rand::seq::index;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

/// Errors emitted by topology implementations and builders.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., an empty grid).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// A successor list references a cell that does not exist.
    #[error("cell {cell} is out of bounds for a topology of {len} cells")]
    OutOfBounds { cell: usize, len: usize },
}

/// Discrete coordinates of a grid cell.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct GridPoint {
    pub x: i64,
    pub y: i64,
}

impl GridPoint {
    #[must_use]
    pub const fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance between two points.
    #[must_use]
    pub fn distance(&self, other: &GridPoint) -> f32 {
        let dx = (self.x - other.x) as f32;
        let dy = (self.y - other.y) as f32;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Common behaviour exposed by cell topologies.
///
/// Cells are addressed by their dense index in `0..len()`.
pub trait NeighborhoodIndex: Send + Sync {
    /// Number of cells in the topology.
    fn len(&self) -> usize;

    /// Returns true when the topology holds no cells.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grid coordinates of `cell`, when the topology is embedded in a grid.
    fn locate(&self, cell: usize) -> Option<GridPoint>;

    /// Static adjacency of `cell` (the `CELL_SUCCESSOR` edges).
    fn successors(&self, cell: usize) -> Vec<usize>;

    /// Visit every cell reachable from `cell` within `range`, `cell` included.
    fn neighbors_within(&self, cell: usize, range: u32, visitor: &mut dyn FnMut(usize));
}

/// Rectangular grid using the Moore (Chebyshev) neighborhood.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MooreGridIndex {
    width: u32,
    height: u32,
}

impl MooreGridIndex {
    /// Create a `width * height` grid.
    pub fn new(width: u32, height: u32) -> Result<Self, IndexError> {
        if width == 0 || height == 0 {
            return Err(IndexError::InvalidConfig(
                "grid dimensions must be non-zero",
            ));
        }
        Ok(Self { width, height })
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Dense index of the cell at `point`, if it lies on the grid.
    #[must_use]
    pub fn index_of(&self, point: GridPoint) -> Option<usize> {
        if point.x < 0 || point.y < 0 {
            return None;
        }
        let (x, y) = (point.x as u64, point.y as u64);
        if x >= u64::from(self.width) || y >= u64::from(self.height) {
            return None;
        }
        Some((y * u64::from(self.width) + x) as usize)
    }

    fn point_of(&self, cell: usize) -> GridPoint {
        let width = self.width as usize;
        GridPoint::new((cell % width) as i64, (cell / width) as i64)
    }
}

impl NeighborhoodIndex for MooreGridIndex {
    fn len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    fn locate(&self, cell: usize) -> Option<GridPoint> {
        (cell < self.len()).then(|| self.point_of(cell))
    }

    fn successors(&self, cell: usize) -> Vec<usize> {
        let mut out = Vec::with_capacity(8);
        self.neighbors_within(cell, 1, &mut |neighbor| {
            if neighbor != cell {
                out.push(neighbor);
            }
        });
        out
    }

    fn neighbors_within(&self, cell: usize, range: u32, visitor: &mut dyn FnMut(usize)) {
        let Some(center) = self.locate(cell) else {
            return;
        };
        let range = i64::from(range);
        for y in (center.y - range)..=(center.y + range) {
            for x in (center.x - range)..=(center.x + range) {
                if let Some(index) = self.index_of(GridPoint::new(x, y)) {
                    visitor(index);
                }
            }
        }
    }
}

/// Arbitrary directed cell graph; ranges are successor hop counts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GraphIndex {
    successors: Vec<Vec<usize>>,
}

impl GraphIndex {
    /// Wrap explicit successor lists, validating every target.
    pub fn from_successors(successors: Vec<Vec<usize>>) -> Result<Self, IndexError> {
        let len = successors.len();
        if len == 0 {
            return Err(IndexError::InvalidConfig("graph must hold at least one cell"));
        }
        if let Some(&cell) = successors.iter().flatten().find(|&&target| target >= len) {
            return Err(IndexError::OutOfBounds { cell, len });
        }
        Ok(Self { successors })
    }

    /// Every cell links to `degree` distinct, uniformly chosen other cells.
    pub fn uniform<R: Rng + ?Sized>(
        num_cells: usize,
        degree: usize,
        rng: &mut R,
    ) -> Result<Self, IndexError> {
        check_graph_params(num_cells, degree)?;
        let amount = degree.min(num_cells - 1);
        let successors = (0..num_cells)
            .map(|cell| {
                index::sample(rng, num_cells - 1, amount)
                    .into_iter()
                    .map(|target| if target >= cell { target + 1 } else { target })
                    .collect()
            })
            .collect();
        Self::from_successors(successors)
    }

    /// Cells are scattered in the unit square and link to their `degree`
    /// nearest neighbors, which yields a spatially clustered graph.
    pub fn clustered<R: Rng + ?Sized>(
        num_cells: usize,
        degree: usize,
        rng: &mut R,
    ) -> Result<Self, IndexError> {
        check_graph_params(num_cells, degree)?;
        let points: Vec<(f32, f32)> = (0..num_cells)
            .map(|_| (rng.random::<f32>(), rng.random::<f32>()))
            .collect();
        let amount = degree.min(num_cells - 1);
        let successors = points
            .iter()
            .enumerate()
            .map(|(cell, &(x, y))| {
                let mut others: Vec<(OrderedFloat<f32>, usize)> = points
                    .iter()
                    .enumerate()
                    .filter(|&(other, _)| other != cell)
                    .map(|(other, &(ox, oy))| {
                        let dist_sq = (ox - x) * (ox - x) + (oy - y) * (oy - y);
                        (OrderedFloat(dist_sq), other)
                    })
                    .collect();
                others.sort_unstable();
                others.truncate(amount);
                others.into_iter().map(|(_, other)| other).collect()
            })
            .collect();
        Self::from_successors(successors)
    }

    /// Watts-Strogatz construction: a ring lattice where each cell links to
    /// `degree / 2` cells on each side, every link being rewired to a random
    /// target with probability `p`.
    pub fn small_world<R: Rng + ?Sized>(
        num_cells: usize,
        degree: usize,
        p: f32,
        rng: &mut R,
    ) -> Result<Self, IndexError> {
        check_graph_params(num_cells, degree)?;
        if !(0.0..=1.0).contains(&p) {
            return Err(IndexError::InvalidConfig(
                "rewiring probability must lie in [0, 1]",
            ));
        }
        let half = (degree / 2).max(1).min((num_cells - 1) / 2).max(1);
        let mut successors: Vec<Vec<usize>> = (0..num_cells)
            .map(|cell| {
                let mut targets = Vec::with_capacity(2 * half);
                for offset in 1..=half {
                    for target in [
                        (cell + offset) % num_cells,
                        (cell + num_cells - offset % num_cells) % num_cells,
                    ] {
                        if target != cell && !targets.contains(&target) {
                            targets.push(target);
                        }
                    }
                }
                targets
            })
            .collect();

        if num_cells > 2 {
            for (cell, targets) in successors.iter_mut().enumerate() {
                for slot in 0..targets.len() {
                    if !rng.random_bool(f64::from(p)) {
                        continue;
                    }
                    // Bounded retries keep dense lattices from spinning forever.
                    for _ in 0..num_cells {
                        let candidate = rng.random_range(0..num_cells);
                        if candidate != cell && !targets.contains(&candidate) {
                            targets[slot] = candidate;
                            break;
                        }
                    }
                }
            }
        }
        Self::from_successors(successors)
    }
}

fn check_graph_params(num_cells: usize, degree: usize) -> Result<(), IndexError> {
    if num_cells < 2 {
        return Err(IndexError::InvalidConfig(
            "graph environments need at least two cells",
        ));
    }
    if degree == 0 {
        return Err(IndexError::InvalidConfig("output degree must be positive"));
    }
    Ok(())
}

impl NeighborhoodIndex for GraphIndex {
    fn len(&self) -> usize {
        self.successors.len()
    }

    fn locate(&self, _cell: usize) -> Option<GridPoint> {
        None
    }

    fn successors(&self, cell: usize) -> Vec<usize> {
        self.successors.get(cell).cloned().unwrap_or_default()
    }

    fn neighbors_within(&self, cell: usize, range: u32, visitor: &mut dyn FnMut(usize)) {
        if cell >= self.len() {
            return;
        }
        let mut seen = vec![false; self.len()];
        let mut queue = VecDeque::from([(cell, 0u32)]);
        seen[cell] = true;
        while let Some((current, depth)) = queue.pop_front() {
            visitor(current);
            if depth == range {
                continue;
            }
            for &next in &self.successors[current] {
                if !seen[next] {
                    seen[next] = true;
                    queue.push_back((next, depth + 1));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::SmallRng};

    fn collect(index: &dyn NeighborhoodIndex, cell: usize, range: u32) -> Vec<usize> {
        let mut out = Vec::new();
        index.neighbors_within(cell, range, &mut |neighbor| out.push(neighbor));
        out
    }

    #[test]
    fn moore_range_is_clipped_at_borders() {
        let grid = MooreGridIndex::new(5, 4).expect("grid");
        assert_eq!(grid.len(), 20);
        assert_eq!(collect(&grid, 0, 1), vec![0, 1, 5, 6]);
        let center = grid.index_of(GridPoint::new(2, 2)).expect("center");
        assert_eq!(collect(&grid, center, 1).len(), 9);
        assert_eq!(collect(&grid, center, 2).len(), 20);
        assert!(collect(&grid, center, 1).contains(&center));
    }

    #[test]
    fn moore_successors_exclude_the_cell_itself() {
        let grid = MooreGridIndex::new(3, 3).expect("grid");
        let successors = grid.successors(4);
        assert_eq!(successors.len(), 8);
        assert!(!successors.contains(&4));
        assert_eq!(grid.successors(0).len(), 3);
        assert_eq!(grid.locate(5), Some(GridPoint::new(2, 1)));
        assert_eq!(grid.locate(9), None);
    }

    #[test]
    fn empty_grid_is_rejected() {
        assert_eq!(
            MooreGridIndex::new(0, 3),
            Err(IndexError::InvalidConfig("grid dimensions must be non-zero"))
        );
    }

    #[test]
    fn graph_range_counts_hops() {
        let graph =
            GraphIndex::from_successors(vec![vec![1], vec![2], vec![3], vec![0]]).expect("graph");
        assert_eq!(collect(&graph, 0, 0), vec![0]);
        assert_eq!(collect(&graph, 0, 1), vec![0, 1]);
        assert_eq!(collect(&graph, 0, 2), vec![0, 1, 2]);
        assert_eq!(collect(&graph, 0, 10), vec![0, 1, 2, 3]);
    }

    #[test]
    fn dangling_successor_is_rejected() {
        let err = GraphIndex::from_successors(vec![vec![1], vec![7]]).unwrap_err();
        assert_eq!(err, IndexError::OutOfBounds { cell: 7, len: 2 });
    }

    #[test]
    fn uniform_graph_has_requested_degree_without_self_loops() {
        let mut rng = SmallRng::seed_from_u64(7);
        let graph = GraphIndex::uniform(50, 4, &mut rng).expect("graph");
        for cell in 0..graph.len() {
            let successors = graph.successors(cell);
            assert_eq!(successors.len(), 4);
            assert!(!successors.contains(&cell));
            let mut dedup = successors.clone();
            dedup.sort_unstable();
            dedup.dedup();
            assert_eq!(dedup.len(), successors.len());
        }
    }

    #[test]
    fn clustered_graph_links_nearest_cells() {
        let mut rng = SmallRng::seed_from_u64(11);
        let graph = GraphIndex::clustered(30, 3, &mut rng).expect("graph");
        assert!((0..graph.len()).all(|cell| graph.successors(cell).len() == 3));
    }

    #[test]
    fn small_world_without_rewiring_is_a_ring_lattice() {
        let mut rng = SmallRng::seed_from_u64(3);
        let graph = GraphIndex::small_world(10, 4, 0.0, &mut rng).expect("graph");
        let mut successors = graph.successors(0);
        successors.sort_unstable();
        assert_eq!(successors, vec![1, 2, 8, 9]);
        assert!(GraphIndex::small_world(10, 4, 1.5, &mut rng).is_err());
    }
}
