// src/region_map.rs
//
// Lazily built cell -> region id map.
//
// The map is valid for one (mesh id, atlas revision) token. The first worker
// that sees a stale token rebuilds the map while holding the cache mutex; every
// other worker blocks on the same mutex and, once released, finds the fresh
// token and reuses the result. A failed rebuild is stored against its token, so
// waiters get the same error without rebuilding a second time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::atlas::RegionAtlas;
use crate::error::{LlbError, Result};
use crate::grid::Grid3D;

/// Cache validity token, compared by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheToken {
    pub mesh_id: u64,
    pub atlas_revision: u64,
}

impl CacheToken {
    pub fn of(grid: &Grid3D, atlas: &dyn RegionAtlas) -> Self {
        Self {
            mesh_id: grid.id(),
            atlas_revision: atlas.revision(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegionMap {
    pub token: CacheToken,
    pub ids: Vec<usize>,
}

impl RegionMap {
    /// Classify every cell centre. Any centre outside the atlas is a geometry error.
    pub fn build(grid: &Grid3D, atlas: &dyn RegionAtlas, owner: &str) -> Result<Self> {
        let token = CacheToken::of(grid, atlas);
        let mut ids = Vec::with_capacity(grid.n_cells());
        for i in 0..grid.n_cells() {
            let c = grid.center(i);
            match atlas.region_id(c) {
                Some(id) => ids.push(id),
                None => {
                    return Err(LlbError::geometry(format!(
                        "mesh given to {} has points outside atlas \"{}\" (cell {} at {:?})",
                        owner,
                        atlas.name(),
                        i,
                        c
                    )))
                }
            }
        }
        Ok(Self { token, ids })
    }

    #[inline]
    pub fn region(&self, cell: usize) -> usize {
        self.ids[cell]
    }
}

#[derive(Debug, Default)]
struct Slot {
    token: Option<CacheToken>,
    outcome: Option<std::result::Result<Arc<RegionMap>, LlbError>>,
}

#[derive(Debug, Default)]
pub struct RegionMapCache {
    slot: Mutex<Slot>,
    rebuilds: AtomicUsize,
}

impl RegionMapCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current map for (grid, atlas), rebuilding at most once per token.
    pub fn get_or_build(&self, grid: &Grid3D, atlas: &dyn RegionAtlas, owner: &str) -> Result<Arc<RegionMap>> {
        let token = CacheToken::of(grid, atlas);
        let mut slot = self.slot.lock().expect("region map mutex poisoned");

        if slot.token == Some(token) {
            if let Some(outcome) = &slot.outcome {
                return outcome.clone();
            }
        }

        self.rebuilds.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "[exchange] {}: rebuilding region map (mesh {}, atlas revision {})",
            owner,
            token.mesh_id,
            token.atlas_revision
        );
        let outcome = RegionMap::build(grid, atlas, owner).map(Arc::new);
        slot.token = Some(token);
        slot.outcome = Some(outcome.clone());
        outcome
    }

    /// Number of rebuilds performed so far.
    pub fn rebuild_count(&self) -> usize {
        self.rebuilds.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::{BoxAtlas, RegionBox};
    use rayon::prelude::*;

    fn atlas_for(grid: &Grid3D) -> BoxAtlas {
        BoxAtlas::whole_mesh("film", "film", grid).unwrap()
    }

    #[test]
    fn rebuild_happens_once_per_token() {
        let g = Grid3D::new(8, 4, 2, 1.0, 1.0, 1.0).unwrap();
        let a = atlas_for(&g);
        let cache = RegionMapCache::new();

        let maps: Vec<_> = (0..16)
            .into_par_iter()
            .map(|_| cache.get_or_build(&g, &a, "test").unwrap())
            .collect();
        assert_eq!(cache.rebuild_count(), 1);
        assert!(maps.iter().all(|m| Arc::ptr_eq(m, &maps[0])));

        // New mesh id -> one more rebuild.
        let g2 = Grid3D::new(8, 4, 2, 1.0, 1.0, 1.0).unwrap();
        cache.get_or_build(&g2, &a, "test").unwrap();
        cache.get_or_build(&g2, &a, "test").unwrap();
        assert_eq!(cache.rebuild_count(), 2);

        // Atlas revision change -> one more.
        a.set_region_bounds("film", [0.0; 3], [8.0, 4.0, 2.0]).unwrap();
        cache.get_or_build(&g2, &a, "test").unwrap();
        assert_eq!(cache.rebuild_count(), 3);
    }

    #[test]
    fn failure_is_shared_without_second_rebuild() {
        let g = Grid3D::new(4, 1, 1, 1.0, 1.0, 1.0).unwrap();
        let a = BoxAtlas::new(
            "half",
            vec![RegionBox {
                name: "left".into(),
                min: [0.0; 3],
                max: [2.0, 1.0, 1.0],
            }],
        )
        .unwrap();
        let cache = RegionMapCache::new();
        let errs: Vec<_> = (0..8)
            .into_par_iter()
            .map(|_| cache.get_or_build(&g, &a, "test").unwrap_err())
            .collect();
        assert_eq!(cache.rebuild_count(), 1);
        assert!(errs.iter().all(|e| matches!(e, LlbError::Geometry(_))));
        assert!(errs.iter().all(|e| e == &errs[0]));
    }
}
