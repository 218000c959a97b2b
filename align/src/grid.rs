//! Dilated occupancy grid used to cheaply reject points that cannot possibly
//! overlap the other set before paying for a k-d tree query.

use common::Aabb;
use nalgebra::Point3;
use rayon::prelude::*;

/// Cells per axis.
const GRID_SIZE: usize = 16;
const GRID_CELLS: usize = GRID_SIZE * GRID_SIZE * GRID_SIZE;

/// 16^3 occupancy over the bounding box of the input, dilated by one cell in
/// all 26 neighbor directions. A lookup answers "is there an input point
/// within roughly one cell of here".
pub struct OccGrid {
    bbox: Aabb,
    /// Cells per world unit along the largest box side.
    scale: f64,
    cells: Vec<bool>,
}

impl OccGrid {
    pub fn build(points: &[Point3<f64>]) -> Self {
        let bbox = Aabb::from_points(points);
        let max_extent = bbox.extent().max();
        let scale = if max_extent > 0.0 {
            GRID_SIZE as f64 / max_extent
        } else {
            1.0
        };

        let mut marked = vec![false; GRID_CELLS];
        for p in points {
            marked[cell_index(cell_coords(&bbox, scale, p))] = true;
        }

        let cells = (0..GRID_CELLS)
            .into_par_iter()
            .map(|idx| {
                let (x, y, z) = cell_of_index(idx);
                neighborhood(x).any(|nx| {
                    neighborhood(y).any(|ny| {
                        neighborhood(z).any(|nz| marked[cell_index((nx, ny, nz))])
                    })
                })
            })
            .collect();

        Self { bbox, scale, cells }
    }

    /// True iff `p` is inside the bounding box and its (dilated) cell is
    /// occupied.
    pub fn overlaps(&self, p: &Point3<f64>) -> bool {
        if !self.bbox.contains(p) {
            return false;
        }
        self.cells[cell_index(cell_coords(&self.bbox, self.scale, p))]
    }

    /// Diagonal length of the underlying bounding box.
    pub fn bbox_size(&self) -> f64 {
        self.bbox.diagonal()
    }
}

fn cell_coords(bbox: &Aabb, scale: f64, p: &Point3<f64>) -> (usize, usize, usize) {
    let v = (p - bbox.min) * scale;
    // the float -> usize cast saturates, so points on the max face clamp in
    let clamp = |c: f64| (c as usize).min(GRID_SIZE - 1);
    (clamp(v.x), clamp(v.y), clamp(v.z))
}

fn cell_index((x, y, z): (usize, usize, usize)) -> usize {
    (x * GRID_SIZE + y) * GRID_SIZE + z
}

fn cell_of_index(idx: usize) -> (usize, usize, usize) {
    (
        idx / (GRID_SIZE * GRID_SIZE),
        (idx / GRID_SIZE) % GRID_SIZE,
        idx % GRID_SIZE,
    )
}

/// The clamped one-cell neighborhood of a coordinate.
fn neighborhood(c: usize) -> impl Iterator<Item = usize> + Clone {
    c.saturating_sub(1)..=(c + 1).min(GRID_SIZE - 1)
}
