// src/atlas.rs
//
// Region atlas: classifies points in space into named material regions.
//
// Conventions:
// - Region ids are dense, 0..region_count(), in declaration order.
// - Points outside every region have no id (None). Consumers that need full
//   coverage (region map, fixed-spin lists) turn that into a geometry error.
// - `revision()` changes whenever the atlas geometry changes, so caches can key
//   off (mesh id, atlas revision) instead of object identity.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{LlbError, Result};
use crate::grid::Grid3D;

static NEXT_ATLAS_REVISION: AtomicU64 = AtomicU64::new(1);

fn next_revision() -> u64 {
    NEXT_ATLAS_REVISION.fetch_add(1, Ordering::Relaxed)
}

/// Spatial-to-region classifier consumed by the exchange term and the evolver.
pub trait RegionAtlas: Send + Sync {
    fn name(&self) -> &str;

    fn region_count(&self) -> usize;

    /// Region containing `point` (metres), if any.
    fn region_id(&self, point: [f64; 3]) -> Option<usize>;

    fn region_id_by_name(&self, name: &str) -> Option<usize>;

    fn region_names(&self) -> Vec<String>;

    /// Token that changes whenever the region geometry changes.
    fn revision(&self) -> u64;
}

/// Axis-aligned box region, corners in metres.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionBox {
    pub name: String,
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl RegionBox {
    #[inline]
    fn contains(&self, p: [f64; 3]) -> bool {
        (0..3).all(|a| p[a] >= self.min[a] && p[a] <= self.max[a])
    }
}

/// Atlas built from a list of boxes. The first box containing a point wins.
#[derive(Debug)]
pub struct BoxAtlas {
    name: String,
    regions: RwLock<Vec<RegionBox>>,
    revision: AtomicU64,
}

impl BoxAtlas {
    pub fn new(name: &str, regions: Vec<RegionBox>) -> Result<Self> {
        if regions.is_empty() {
            return Err(LlbError::config(format!(
                "atlas \"{}\" must contain at least one region",
                name
            )));
        }
        for (k, r) in regions.iter().enumerate() {
            if regions[..k].iter().any(|o| o.name == r.name) {
                return Err(LlbError::config(format!(
                    "atlas \"{}\" declares region \"{}\" twice",
                    name, r.name
                )));
            }
            check_box(r)?;
        }
        Ok(Self {
            name: name.to_string(),
            regions: RwLock::new(regions),
            revision: AtomicU64::new(next_revision()),
        })
    }

    /// Single region covering the whole mesh.
    pub fn whole_mesh(name: &str, region: &str, grid: &Grid3D) -> Result<Self> {
        Self::new(
            name,
            vec![RegionBox {
                name: region.to_string(),
                min: [0.0; 3],
                max: grid.extent(),
            }],
        )
    }

    /// Move/resize an existing region. Bumps the revision.
    pub fn set_region_bounds(&self, region: &str, min: [f64; 3], max: [f64; 3]) -> Result<()> {
        let mut regions = self.regions.write().expect("atlas lock poisoned");
        let r = regions
            .iter_mut()
            .find(|r| r.name == region)
            .ok_or_else(|| unknown_region(&self.name, region, &[]))?;
        let updated = RegionBox {
            name: r.name.clone(),
            min,
            max,
        };
        check_box(&updated)?;
        *r = updated;
        self.revision.store(next_revision(), Ordering::Release);
        Ok(())
    }
}

fn check_box(r: &RegionBox) -> Result<()> {
    if (0..3).any(|a| !(r.min[a] <= r.max[a])) {
        return Err(LlbError::config(format!(
            "region \"{}\" has inverted or NaN bounds {:?}..{:?}",
            r.name, r.min, r.max
        )));
    }
    Ok(())
}

fn unknown_region(atlas: &str, region: &str, known: &[String]) -> LlbError {
    let mut msg = format!("\"{}\" is not a known region in atlas \"{}\".", region, atlas);
    if !known.is_empty() {
        msg.push_str("  Known regions:");
        for k in known {
            msg.push(' ');
            msg.push_str(k);
        }
    }
    LlbError::config(msg)
}

impl RegionAtlas for BoxAtlas {
    fn name(&self) -> &str {
        &self.name
    }

    fn region_count(&self) -> usize {
        self.regions.read().expect("atlas lock poisoned").len()
    }

    fn region_id(&self, point: [f64; 3]) -> Option<usize> {
        let regions = self.regions.read().expect("atlas lock poisoned");
        regions.iter().position(|r| r.contains(point))
    }

    fn region_id_by_name(&self, name: &str) -> Option<usize> {
        let regions = self.regions.read().expect("atlas lock poisoned");
        regions.iter().position(|r| r.name == name)
    }

    fn region_names(&self) -> Vec<String> {
        let regions = self.regions.read().expect("atlas lock poisoned");
        regions.iter().map(|r| r.name.clone()).collect()
    }

    fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }
}

/// Cells whose centres fall inside any of the named regions (sorted, unique).
///
/// Used for pinned spins. Unknown names are a configuration error.
pub fn cells_in_regions(grid: &Grid3D, atlas: &dyn RegionAtlas, names: &[String]) -> Result<Vec<usize>> {
    if names.is_empty() {
        return Ok(Vec::new());
    }
    let mut wanted = vec![false; atlas.region_count()];
    for name in names {
        let id = atlas
            .region_id_by_name(name)
            .ok_or_else(|| unknown_region(atlas.name(), name, &atlas.region_names()))?;
        wanted[id] = true;
    }
    let cells = (0..grid.n_cells())
        .filter(|&i| matches!(atlas.region_id(grid.center(i)), Some(id) if wanted[id]))
        .collect();
    Ok(cells)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_slabs() -> (Grid3D, BoxAtlas) {
        let g = Grid3D::new(4, 1, 1, 1.0, 1.0, 1.0).unwrap();
        let a = BoxAtlas::new(
            "slabs",
            vec![
                RegionBox {
                    name: "left".into(),
                    min: [0.0, 0.0, 0.0],
                    max: [2.0, 1.0, 1.0],
                },
                RegionBox {
                    name: "right".into(),
                    min: [2.0, 0.0, 0.0],
                    max: [4.0, 1.0, 1.0],
                },
            ],
        )
        .unwrap();
        (g, a)
    }

    #[test]
    fn classifies_cell_centres() {
        let (g, a) = two_slabs();
        let ids: Vec<_> = (0..4).map(|i| a.region_id(g.center(i))).collect();
        assert_eq!(ids, vec![Some(0), Some(0), Some(1), Some(1)]);
        assert_eq!(a.region_id([10.0, 0.5, 0.5]), None);
        assert_eq!(a.region_id_by_name("right"), Some(1));
    }

    #[test]
    fn moving_a_region_bumps_revision() {
        let (_, a) = two_slabs();
        let r0 = a.revision();
        a.set_region_bounds("left", [0.0; 3], [1.0, 1.0, 1.0]).unwrap();
        assert_ne!(a.revision(), r0);
        assert!(a.set_region_bounds("nowhere", [0.0; 3], [1.0; 3]).is_err());
    }

    #[test]
    fn fixed_cells_follow_regions() {
        let (g, a) = two_slabs();
        let cells = cells_in_regions(&g, &a, &["right".to_string()]).unwrap();
        assert_eq!(cells, vec![2, 3]);
        let err = cells_in_regions(&g, &a, &["middle".to_string()]).unwrap_err();
        match err {
            LlbError::Config(msg) => assert!(msg.contains("Known regions: left right")),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
