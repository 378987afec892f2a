// src/energy.rs
//
// Chunked, threaded energy evaluation.
//
// Every energy term implements `EnergyContributor`. One evaluation:
//  1. initialize_chunk()    once, on the calling thread
//  2. compute_chunk()       once per contiguous cell range, in parallel (rayon)
//  3. finalize_chunk()      once, on the calling thread, with every chunk's aux data
//
// Chunk outputs accumulate (+=) into shared energy / H / mxH buffers, so several
// terms can be summed in one pass. Worker errors are returned as values, joined
// after the parallel section, and the first one is surfaced to the caller. A
// shared abort flag lets the remaining chunks bail out early.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;

use crate::error::Result;
use crate::state::{SimState, StateStore};
use crate::vec3::CompensatedSum;

/// Everything a contributor may read during one evaluation.
#[derive(Clone, Copy)]
pub struct EnergyInput<'a> {
    /// Sublattice state being evaluated.
    pub state: &'a SimState,
    /// The other sublattice of the same step.
    pub partner: &'a SimState,
    /// Lookup for previous states (stage/run statistics).
    pub store: &'a StateStore,
}

/// Mutable per-chunk output slices; index 0 is cell `range.start`.
pub struct ChunkOutputs<'a> {
    pub energy: &'a mut [f64],
    pub h: &'a mut [[f64; 3]],
    pub mxh: &'a mut [[f64; 3]],
}

/// Per-chunk side results of one contributor.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkAux {
    /// Volume-integrated energy of the chunk (J).
    pub energy_total: CompensatedSum,
    /// Largest |m_j - m_i|^2 over neighbour pairs seen by the chunk.
    pub max_dot: f64,
}

pub trait EnergyContributor: Send + Sync {
    fn name(&self) -> &str;

    /// Per-evaluation setup (stage-dependent parameters, caches).
    fn initialize_chunk(&self, _input: &EnergyInput) -> Result<()> {
        Ok(())
    }

    /// Accumulate energy density, H and m x H for `range` into `out`.
    fn compute_chunk(
        &self,
        input: &EnergyInput,
        range: Range<usize>,
        out: &mut ChunkOutputs,
        aux: &mut ChunkAux,
        abort: &AtomicBool,
    ) -> Result<()>;

    /// Reduce chunk aux data and record derived values on the state.
    fn finalize_chunk(&self, _input: &EnergyInput, _aux: &[ChunkAux]) -> Result<()> {
        Ok(())
    }

    /// Explicit time derivative of the energy (J/s) at this state.
    fn pe_pt(&self, _state: &SimState) -> f64 {
        0.0
    }
}

#[derive(Debug, Clone)]
pub struct EnergyResult {
    /// Energy density per cell (J/m^3).
    pub energy: Vec<f64>,
    /// Effective field per cell (A/m).
    pub h: Vec<[f64; 3]>,
    /// m x H per cell (A/m).
    pub mxh: Vec<[f64; 3]>,
    /// Total energy (J).
    pub total_energy: f64,
    /// Sum of explicit time derivatives (J/s).
    pub pe_pt: f64,
    /// (term name, term energy) in registration order.
    pub term_energies: Vec<(String, f64)>,
}

/// Number of chunks used for a mesh of `n` cells.
fn chunk_len(n: usize) -> usize {
    let threads = rayon::current_num_threads().max(1);
    ((n + threads - 1) / threads).max(1)
}

/// Evaluate all terms on one sublattice state.
pub fn compute_energy(terms: &[Arc<dyn EnergyContributor>], input: &EnergyInput) -> Result<EnergyResult> {
    let n = input.state.grid.n_cells();

    for term in terms {
        term.initialize_chunk(input)?;
    }

    let mut energy = vec![0.0; n];
    let mut h = vec![[0.0; 3]; n];
    let mut mxh = vec![[0.0; 3]; n];
    let abort = AtomicBool::new(false);
    let len = chunk_len(n);

    let per_chunk: Vec<Result<Vec<ChunkAux>>> = energy
        .par_chunks_mut(len)
        .zip_eq(h.par_chunks_mut(len))
        .zip_eq(mxh.par_chunks_mut(len))
        .enumerate()
        .map(|(c, ((e, hc), tc))| {
            let start = c * len;
            let range = start..start + e.len();
            let mut out = ChunkOutputs {
                energy: e,
                h: hc,
                mxh: tc,
            };
            let mut auxes = Vec::with_capacity(terms.len());
            for term in terms {
                let mut aux = ChunkAux::default();
                if let Err(err) = term.compute_chunk(input, range.clone(), &mut out, &mut aux, &abort) {
                    abort.store(true, Ordering::Release);
                    return Err(err);
                }
                auxes.push(aux);
            }
            Ok(auxes)
        })
        .collect();

    // Join point: surface the first worker error, if any.
    let mut chunks = Vec::with_capacity(per_chunk.len());
    for r in per_chunk {
        chunks.push(r?);
    }

    let mut total = CompensatedSum::new();
    let mut term_energies = Vec::with_capacity(terms.len());
    let mut pe_pt = 0.0;
    for (k, term) in terms.iter().enumerate() {
        let aux: Vec<ChunkAux> = chunks.iter().map(|c| c[k]).collect();
        term.finalize_chunk(input, &aux)?;
        let mut term_total = CompensatedSum::new();
        for a in &aux {
            term_total.merge(&a.energy_total);
        }
        total.merge(&term_total);
        term_energies.push((term.name().to_string(), term_total.value()));
        pe_pt += term.pe_pt(input.state);
    }

    Ok(EnergyResult {
        energy,
        h,
        mxh,
        total_energy: total.value(),
        pe_pt,
        term_energies,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlbError;
    use crate::grid::Grid3D;
    use crate::state::Lattice;

    /// Constant field along +x; energy density = -|H| m_x per cell.
    struct Constant;

    impl EnergyContributor for Constant {
        fn name(&self) -> &str {
            "constant"
        }

        fn compute_chunk(
            &self,
            input: &EnergyInput,
            range: Range<usize>,
            out: &mut ChunkOutputs,
            aux: &mut ChunkAux,
            _abort: &AtomicBool,
        ) -> Result<()> {
            let vol = input.state.grid.cell_volume();
            for (k, i) in range.enumerate() {
                let e = -input.state.spin[i][0];
                out.energy[k] += e;
                out.h[k][0] += 1.0;
                aux.energy_total.add(e * vol);
            }
            Ok(())
        }

        fn pe_pt(&self, _state: &SimState) -> f64 {
            0.5
        }
    }

    struct Failing;

    impl EnergyContributor for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn compute_chunk(
            &self,
            _input: &EnergyInput,
            range: Range<usize>,
            _out: &mut ChunkOutputs,
            _aux: &mut ChunkAux,
            _abort: &AtomicBool,
        ) -> Result<()> {
            if range.contains(&3) {
                return Err(LlbError::geometry("cell 3 is bad"));
            }
            Ok(())
        }
    }

    fn pair_states(n: usize) -> (SimState, SimState) {
        let g = Grid3D::new(n, 1, 1, 2.0, 1.0, 1.0).unwrap();
        let a = SimState::initial(Lattice::One, g, vec![1.0; n], vec![[1.0, 0.0, 0.0]; n]).unwrap();
        let b = SimState::initial(Lattice::Two, g, vec![1.0; n], vec![[1.0, 0.0, 0.0]; n]).unwrap();
        (a, b)
    }

    #[test]
    fn terms_accumulate_and_totals_reduce() {
        let (a, b) = pair_states(37);
        let store = StateStore::default();
        let input = EnergyInput {
            state: &a,
            partner: &b,
            store: &store,
        };
        let terms: Vec<Arc<dyn EnergyContributor>> = vec![Arc::new(Constant), Arc::new(Constant)];
        let r = compute_energy(&terms, &input).unwrap();
        assert!(r.energy.iter().all(|&e| e == -2.0));
        assert!(r.h.iter().all(|h| h[0] == 2.0));
        assert!((r.total_energy + 2.0 * 37.0 * 2.0).abs() < 1e-12);
        assert_eq!(r.pe_pt, 1.0);
        assert_eq!(r.term_energies.len(), 2);
    }

    #[test]
    fn worker_error_reaches_caller() {
        let (a, b) = pair_states(8);
        let store = StateStore::default();
        let input = EnergyInput {
            state: &a,
            partner: &b,
            store: &store,
        };
        let terms: Vec<Arc<dyn EnergyContributor>> = vec![Arc::new(Failing)];
        assert!(matches!(compute_energy(&terms, &input), Err(LlbError::Geometry(_))));
    }
}
