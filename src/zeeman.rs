// src/zeeman.rs
//
// Uniform applied field, one vector per stage (A/m). Stages past the end of the
// list reuse the last entry. The field is stepwise constant in time, so pE/pt = 0.

use std::ops::Range;
use std::sync::atomic::AtomicBool;

use crate::energy::{ChunkAux, ChunkOutputs, EnergyContributor, EnergyInput};
use crate::error::{LlbError, Result};
use crate::params::MU0;
use crate::vec3::{axpy, cross, dot, CompensatedSum};

pub struct UniformZeeman {
    name: String,
    fields: Vec<[f64; 3]>,
}

impl UniformZeeman {
    pub fn new(name: &str, fields: Vec<[f64; 3]>) -> Result<Self> {
        if fields.is_empty() {
            return Err(LlbError::config(format!(
                "{}: applied field list must have at least one entry",
                name
            )));
        }
        Ok(Self {
            name: name.to_string(),
            fields,
        })
    }

    /// Applied field for `stage`.
    pub fn field_at(&self, stage: u32) -> [f64; 3] {
        let k = (stage as usize).min(self.fields.len() - 1);
        self.fields[k]
    }

    /// Number of stages this term asks for.
    pub fn stage_count(&self) -> usize {
        self.fields.len()
    }
}

impl EnergyContributor for UniformZeeman {
    fn name(&self) -> &str {
        &self.name
    }

    fn compute_chunk(
        &self,
        input: &EnergyInput,
        range: Range<usize>,
        out: &mut ChunkOutputs,
        aux: &mut ChunkAux,
        _abort: &AtomicBool,
    ) -> Result<()> {
        let state = input.state;
        let h_ext = self.field_at(state.stage_number);
        let mut sum = CompensatedSum::new();
        for (k, i) in range.enumerate() {
            let ms = state.ms[i];
            // Zero-Ms cells carry no field.
            if ms == 0.0 {
                continue;
            }
            let m = state.spin[i];
            let e = -MU0 * ms * dot(m, h_ext);
            out.energy[k] += e;
            axpy(&mut out.h[k], 1.0, h_ext);
            axpy(&mut out.mxh[k], 1.0, cross(m, h_ext));
            sum.add(e);
        }
        aux.energy_total.add(sum.value() * state.grid.cell_volume());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energy::compute_energy;
    use crate::grid::Grid3D;
    use crate::state::{Lattice, SimState, StateStore};
    use std::sync::Arc;

    #[test]
    fn stage_list_repeats_last_entry() {
        let z = UniformZeeman::new("z", vec![[0.0, 0.0, 1.0], [0.0, 0.0, 2.0]]).unwrap();
        assert_eq!(z.field_at(0), [0.0, 0.0, 1.0]);
        assert_eq!(z.field_at(7), [0.0, 0.0, 2.0]);
        assert!(UniformZeeman::new("z", vec![]).is_err());
    }

    #[test]
    fn energy_and_torque() {
        let g = Grid3D::new(2, 1, 1, 1.0, 1.0, 1.0).unwrap();
        let s1 = SimState::initial(Lattice::One, g, vec![2.0, 0.0], vec![[1.0, 0.0, 0.0]; 2]).unwrap();
        let s2 = SimState::initial(Lattice::Two, g, vec![2.0, 0.0], vec![[1.0, 0.0, 0.0]; 2]).unwrap();
        let store = StateStore::default();
        let input = EnergyInput {
            state: &s1,
            partner: &s2,
            store: &store,
        };
        let terms: Vec<Arc<dyn EnergyContributor>> =
            vec![Arc::new(UniformZeeman::new("z", vec![[3.0, 0.0, 1.0]]).unwrap())];
        let r = compute_energy(&terms, &input).unwrap();
        assert!((r.energy[0] + MU0 * 2.0 * 3.0).abs() < 1e-18);
        assert_eq!(r.mxh[0], [0.0, -1.0, 0.0]);
        assert_eq!(r.h[1], [0.0; 3]);
        assert_eq!(r.energy[1], 0.0);
        assert_eq!(r.pe_pt, 0.0);
    }
}
