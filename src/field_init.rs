// src/field_init.rs
//
// Per-cell field initializers ("fill mesh value").
//
// Scalar fields carry material parameters (Ms, J, atomic moment, alpha, gamma);
// vector fields carry the starting spin configuration. Both are described in the
// run config and filled onto a concrete mesh here.
//
// Conventions:
// - Coordinates are cell centres with the origin at the lower mesh corner.
// - Region-based specs resolve region names through the atlas; unknown names
//   are configuration errors, cells outside every region take the default.
// - Vector initializers do NOT normalise. `SimState::initial` normalises spins
//   when the first state is built.

use std::collections::BTreeMap;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::atlas::RegionAtlas;
use crate::error::{LlbError, Result};
use crate::grid::Grid3D;
use crate::vec3::normalize;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScalarFieldSpec {
    Uniform {
        value: f64,
    },
    /// Per-region values; cells in unlisted regions (or outside the atlas) get `default`.
    Regions {
        values: BTreeMap<String, f64>,
        #[serde(default)]
        default: f64,
    },
    /// value(r) = base + gradient · r
    Linear {
        base: f64,
        gradient: [f64; 3],
    },
}

impl ScalarFieldSpec {
    pub fn uniform(value: f64) -> Self {
        ScalarFieldSpec::Uniform { value }
    }

    pub fn fill_mesh_value(&self, grid: &Grid3D, atlas: &dyn RegionAtlas) -> Result<Vec<f64>> {
        let n = grid.n_cells();
        match self {
            ScalarFieldSpec::Uniform { value } => Ok(vec![*value; n]),
            ScalarFieldSpec::Regions { values, default } => {
                let table = region_table(atlas, values, *default)?;
                Ok((0..n)
                    .map(|i| match atlas.region_id(grid.center(i)) {
                        Some(id) => table[id],
                        None => *default,
                    })
                    .collect())
            }
            ScalarFieldSpec::Linear { base, gradient } => Ok((0..n)
                .map(|i| {
                    let c = grid.center(i);
                    base + gradient[0] * c[0] + gradient[1] * c[1] + gradient[2] * c[2]
                })
                .collect()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VectorFieldSpec {
    Uniform {
        value: [f64; 3],
    },
    Regions {
        values: BTreeMap<String, [f64; 3]>,
        default: [f64; 3],
    },
    /// Base direction plus a seeded random tilt of the given amplitude per component.
    Noisy {
        direction: [f64; 3],
        amplitude: f64,
        seed: u64,
    },
    /// Two domains split by a plane normal to `axis` (0, 1 or 2) at `position` metres.
    TwoDomain {
        axis: usize,
        position: f64,
        below: [f64; 3],
        above: [f64; 3],
    },
}

impl VectorFieldSpec {
    pub fn uniform(value: [f64; 3]) -> Self {
        VectorFieldSpec::Uniform { value }
    }

    pub fn fill_mesh_value(&self, grid: &Grid3D, atlas: &dyn RegionAtlas) -> Result<Vec<[f64; 3]>> {
        let n = grid.n_cells();
        match self {
            VectorFieldSpec::Uniform { value } => Ok(vec![*value; n]),
            VectorFieldSpec::Regions { values, default } => {
                let table = region_table(atlas, values, *default)?;
                Ok((0..n)
                    .map(|i| match atlas.region_id(grid.center(i)) {
                        Some(id) => table[id],
                        None => *default,
                    })
                    .collect())
            }
            VectorFieldSpec::Noisy {
                direction,
                amplitude,
                seed,
            } => {
                let base = normalize(*direction);
                let mut rng = ChaCha8Rng::seed_from_u64(*seed);
                Ok((0..n)
                    .map(|_| {
                        let mut v = base;
                        for c in &mut v {
                            *c += amplitude * rng.gen_range(-1.0..=1.0);
                        }
                        v
                    })
                    .collect())
            }
            VectorFieldSpec::TwoDomain {
                axis,
                position,
                below,
                above,
            } => {
                if *axis > 2 {
                    return Err(LlbError::config(format!(
                        "two_domain axis must be 0, 1 or 2 (got {})",
                        axis
                    )));
                }
                Ok((0..n)
                    .map(|i| {
                        if grid.center(i)[*axis] < *position {
                            *below
                        } else {
                            *above
                        }
                    })
                    .collect())
            }
        }
    }
}

/// Resolve name -> value pairs into a dense per-region-id table.
fn region_table<T: Copy>(
    atlas: &dyn RegionAtlas,
    values: &BTreeMap<String, T>,
    default: T,
) -> Result<Vec<T>> {
    let mut table = vec![default; atlas.region_count()];
    for (name, v) in values {
        let id = atlas.region_id_by_name(name).ok_or_else(|| {
            LlbError::config(format!(
                "field initializer names region \"{}\", which is not a known region in atlas \"{}\".  Known regions: {}",
                name,
                atlas.name(),
                atlas.region_names().join(" ")
            ))
        })?;
        table[id] = *v;
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::{BoxAtlas, RegionBox};

    fn setup() -> (Grid3D, BoxAtlas) {
        let g = Grid3D::new(4, 1, 1, 1.0, 1.0, 1.0).unwrap();
        let a = BoxAtlas::new(
            "a",
            vec![
                RegionBox {
                    name: "fe".into(),
                    min: [0.0; 3],
                    max: [2.0, 1.0, 1.0],
                },
                RegionBox {
                    name: "gd".into(),
                    min: [2.0, 0.0, 0.0],
                    max: [4.0, 1.0, 1.0],
                },
            ],
        )
        .unwrap();
        (g, a)
    }

    #[test]
    fn region_scalar_fill() {
        let (g, a) = setup();
        let mut values = BTreeMap::new();
        values.insert("gd".to_string(), 5.0);
        let spec = ScalarFieldSpec::Regions { values, default: 1.0 };
        assert_eq!(spec.fill_mesh_value(&g, &a).unwrap(), vec![1.0, 1.0, 5.0, 5.0]);
    }

    #[test]
    fn unknown_region_is_rejected() {
        let (g, a) = setup();
        let mut values = BTreeMap::new();
        values.insert("co".to_string(), 5.0);
        let spec = ScalarFieldSpec::Regions { values, default: 1.0 };
        assert!(matches!(spec.fill_mesh_value(&g, &a), Err(LlbError::Config(_))));
    }

    #[test]
    fn linear_and_two_domain() {
        let (g, a) = setup();
        let lin = ScalarFieldSpec::Linear {
            base: 1.0,
            gradient: [2.0, 0.0, 0.0],
        };
        assert_eq!(lin.fill_mesh_value(&g, &a).unwrap(), vec![2.0, 4.0, 6.0, 8.0]);

        let wall = VectorFieldSpec::TwoDomain {
            axis: 0,
            position: 2.0,
            below: [0.0, 0.0, 1.0],
            above: [0.0, 0.0, -1.0],
        };
        let v = wall.fill_mesh_value(&g, &a).unwrap();
        assert_eq!(v[1], [0.0, 0.0, 1.0]);
        assert_eq!(v[2], [0.0, 0.0, -1.0]);
    }

    #[test]
    fn noisy_fill_is_reproducible() {
        let (g, a) = setup();
        let spec = VectorFieldSpec::Noisy {
            direction: [0.0, 0.0, 1.0],
            amplitude: 0.1,
            seed: 7,
        };
        let v1 = spec.fill_mesh_value(&g, &a).unwrap();
        let v2 = spec.fill_mesh_value(&g, &a).unwrap();
        assert_eq!(v1, v2);
        assert!(v1.iter().all(|m| (m[2] - 1.0).abs() <= 0.1 + 1e-12));
    }

    #[test]
    fn specs_parse_from_json() {
        let s: ScalarFieldSpec = serde_json::from_str(r#"{"type":"uniform","value":3.5}"#).unwrap();
        assert_eq!(s, ScalarFieldSpec::uniform(3.5));
        let v: VectorFieldSpec =
            serde_json::from_str(r#"{"type":"uniform","value":[1.0,0.0,0.0]}"#).unwrap();
        assert_eq!(v, VectorFieldSpec::uniform([1.0, 0.0, 0.0]));
    }
}
