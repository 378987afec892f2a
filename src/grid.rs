// src/grid.rs

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{LlbError, Result};

static NEXT_MESH_ID: AtomicU64 = AtomicU64::new(1);

/// Rectangular 3D finite-difference mesh with optional per-axis periodicity.
///
/// Every constructed mesh gets a fresh, process-unique `id`. Copies keep the id,
/// so two values with the same id describe the same mesh; caches key off it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Grid3D {
    pub nx: usize,
    pub ny: usize,
    pub nz: usize,
    pub dx: f64,
    pub dy: f64,
    pub dz: f64,
    pub periodic: [bool; 3],
    id: u64,
}

impl Grid3D {
    /// Create a new non-periodic grid with nx × ny × nz cells and spacings dx, dy, dz.
    pub fn new(nx: usize, ny: usize, nz: usize, dx: f64, dy: f64, dz: f64) -> Result<Self> {
        if nx == 0 || ny == 0 || nz == 0 {
            return Err(LlbError::config(format!(
                "mesh dimensions must be positive (got {}x{}x{})",
                nx, ny, nz
            )));
        }
        if !(dx > 0.0 && dy > 0.0 && dz > 0.0) {
            return Err(LlbError::config(format!(
                "mesh cell edges must be positive (got {:e}, {:e}, {:e})",
                dx, dy, dz
            )));
        }
        Ok(Self {
            nx,
            ny,
            nz,
            dx,
            dy,
            dz,
            periodic: [false; 3],
            id: NEXT_MESH_ID.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// Same cell layout, periodic along the flagged axes. Gets a new id.
    pub fn with_periodic(mut self, x: bool, y: bool, z: bool) -> Self {
        self.periodic = [x, y, z];
        self.id = NEXT_MESH_ID.fetch_add(1, Ordering::Relaxed);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Total number of cells.
    pub fn n_cells(&self) -> usize {
        self.nx * self.ny * self.nz
    }

    /// Volume of one cell. All cells of a rectangular mesh share it.
    pub fn cell_volume(&self) -> f64 {
        self.dx * self.dy * self.dz
    }

    /// Convert (i, j, k) indices to a flat index (x fastest, z slowest).
    #[inline]
    pub fn idx(&self, i: usize, j: usize, k: usize) -> usize {
        debug_assert!(i < self.nx && j < self.ny && k < self.nz);
        (k * self.ny + j) * self.nx + i
    }

    /// Inverse of [`Grid3D::idx`].
    #[inline]
    pub fn coords(&self, index: usize) -> (usize, usize, usize) {
        debug_assert!(index < self.n_cells());
        let nxy = self.nx * self.ny;
        let k = index / nxy;
        let rem = index - k * nxy;
        let j = rem / self.nx;
        let i = rem - j * self.nx;
        (i, j, k)
    }

    /// Cell-centre coordinates in metres, origin at the lower mesh corner.
    pub fn center(&self, index: usize) -> [f64; 3] {
        let (i, j, k) = self.coords(index);
        [
            (i as f64 + 0.5) * self.dx,
            (j as f64 + 0.5) * self.dy,
            (k as f64 + 0.5) * self.dz,
        ]
    }

    /// Physical extent of the mesh.
    pub fn extent(&self) -> [f64; 3] {
        [
            self.nx as f64 * self.dx,
            self.ny as f64 * self.dy,
            self.nz as f64 * self.dz,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_indexing_is_consistent() {
        let g = Grid3D::new(4, 3, 2, 1.0, 1.0, 1.0).unwrap();
        assert_eq!(g.idx(0, 0, 0), 0);
        assert_eq!(g.idx(1, 0, 0), 1);
        assert_eq!(g.idx(0, 1, 0), 4);
        assert_eq!(g.idx(3, 2, 1), 23);
        assert_eq!(g.n_cells(), 24);
        for n in 0..g.n_cells() {
            let (i, j, k) = g.coords(n);
            assert_eq!(g.idx(i, j, k), n);
        }
    }

    #[test]
    fn copies_share_id_and_new_meshes_do_not() {
        let a = Grid3D::new(2, 2, 1, 1e-9, 1e-9, 1e-9).unwrap();
        let b = a;
        let c = Grid3D::new(2, 2, 1, 1e-9, 1e-9, 1e-9).unwrap();
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_ne!(a.id(), a.with_periodic(true, false, false).id());
    }

    #[test]
    fn centers_sit_mid_cell() {
        let g = Grid3D::new(2, 1, 1, 2.0, 1.0, 1.0).unwrap();
        assert_eq!(g.center(1), [3.0, 0.5, 0.5]);
    }

    #[test]
    fn rejects_empty_mesh() {
        assert!(Grid3D::new(0, 1, 1, 1.0, 1.0, 1.0).is_err());
        assert!(Grid3D::new(1, 1, 1, 0.0, 1.0, 1.0).is_err());
    }
}
