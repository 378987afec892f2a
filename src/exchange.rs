// src/exchange.rs
//
// Two-sublattice six-neighbour exchange.
//
// For a sublattice state with spins m and inverse saturation Ms^-1, each cell i
// with Ms_i != 0 sums over its six face neighbours j (periodic wrap only along
// periodic axes):
//
//   S_i = sum_j A(r_i, r_j) * (-1/d_axis^2) * (m_j - m_i)
//
// skipping pairs with A = 0 or Ms_j = 0. Then
//
//   energy density  e_i = m_i . S_i
//   field           H_i = S_i * (-2/mu0) * Ms^-1_i
//   torque          m_i x H_i
//
// A comes from the coefficient table of the state's own lattice. The
// cross-lattice table is built and validated but does not enter the sum yet.
//
// Every undirected neighbour pair is visited once from its higher-index cell
// (the negative-direction neighbours) for the max spin angle bookkeeping.
//
// Per-stage work (once per stage, both lattices together): Tc = J/(3 kB), and the
// equilibrium m_e / chi_l at each lattice's stage temperature. The results are
// attached to both states of the pair.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::atlas::RegionAtlas;
use crate::coef_matrix::{CoefMatrix, ExchangeCoefType};
use crate::energy::{ChunkAux, ChunkOutputs, EnergyContributor, EnergyInput};
use crate::equilibrium::{thermal_params, DEFAULT_TOLERANCE};
use crate::error::{LlbError, Result};
use crate::field_init::ScalarFieldSpec;
use crate::params::{EPS, MU0};
use crate::region_map::RegionMapCache;
use crate::state::{Lattice, SimState, ThermalParams};
use crate::vec3::{cross, dot, norm2, sub, CompensatedSum};

/// Coefficient lists for the three coupling channels.
#[derive(Debug, Clone, PartialEq)]
pub struct CoefLists {
    pub coef_type: ExchangeCoefType,
    /// Flat (regionA, regionB, value) triples for lattice 1, lattice 2, cross.
    pub lattice1: Vec<String>,
    pub lattice2: Vec<String>,
    pub cross: Vec<String>,
    /// Defaults for unspecified pairs: lattice 1, lattice 2, cross.
    pub defaults: [f64; 3],
}

/// Per-lattice mean-field material parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct MeanFieldParams {
    /// Exchange energy J (J) per lattice.
    pub j: [ScalarFieldSpec; 2],
    /// Atomic magnetic moment per lattice.
    pub atom_moment: [ScalarFieldSpec; 2],
}

#[derive(Debug)]
struct StageThermal {
    stage: u32,
    mesh_id: u64,
    lattice: [Arc<ThermalParams>; 2],
}

#[derive(Debug)]
struct MaterialArrays {
    mesh_id: u64,
    j: [Vec<f64>; 2],
    mu: [Vec<f64>; 2],
}

pub struct TwoLatticeExchange {
    name: String,
    atlas: Arc<dyn RegionAtlas>,
    coef_type: ExchangeCoefType,
    /// Lattice 1, lattice 2, cross. The cross table is validated and held but
    /// not yet summed into the field.
    coef: [CoefMatrix; 3],
    mean_field: MeanFieldParams,
    tolerance: f64,
    region_map: RegionMapCache,
    material: Mutex<Option<MaterialArrays>>,
    stage_thermal: Mutex<Option<StageThermal>>,
}

impl TwoLatticeExchange {
    pub fn new(name: &str, atlas: Arc<dyn RegionAtlas>, coefs: &CoefLists, mean_field: MeanFieldParams) -> Result<Self> {
        let key = coefs.coef_type.key();
        let coef1 = CoefMatrix::build(atlas.as_ref(), &format!("{}1", key), coefs.defaults[0], &coefs.lattice1)?;
        let coef2 = CoefMatrix::build(atlas.as_ref(), &format!("{}2", key), coefs.defaults[1], &coefs.lattice2)?;
        let coef12 = CoefMatrix::build(atlas.as_ref(), &format!("{}12", key), coefs.defaults[2], &coefs.cross)?;
        Ok(Self {
            name: name.to_string(),
            atlas,
            coef_type: coefs.coef_type,
            coef: [coef1, coef2, coef12],
            mean_field,
            tolerance: DEFAULT_TOLERANCE,
            region_map: RegionMapCache::new(),
            material: Mutex::new(None),
            stage_thermal: Mutex::new(None),
        })
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn region_map_rebuilds(&self) -> usize {
        self.region_map.rebuild_count()
    }

    pub fn max_spin_angle_name(&self) -> String {
        format!("{}:Max Spin Angle", self.name)
    }

    pub fn stage_max_spin_angle_name(&self) -> String {
        format!("{}:Stage Max Spin Angle", self.name)
    }

    pub fn run_max_spin_angle_name(&self) -> String {
        format!("{}:Run Max Spin Angle", self.name)
    }

    /// Record the max spin angle (degrees) on `state`.
    ///
    /// A repeat with a value that matches the stored one to within round-off on
    /// the cosine is accepted silently; anything else is an invariant error.
    pub fn record_max_spin_angle(&self, state: &SimState, maxang: f64) -> Result<()> {
        let msa_name = self.max_spin_angle_name();
        match state.derived.get(&msa_name) {
            Some(old) => {
                log::debug!("[exchange] {} max spin angle set twice on state {}", self.name, state.id());
                // Compare cosines: relative error of acos is large for nearly parallel spins.
                let diff = (old - maxang).to_radians();
                let mut sum = (old + maxang).to_radians();
                if sum > std::f64::consts::PI {
                    sum = 2.0 * std::f64::consts::PI - sum;
                }
                if (diff * sum).abs() > 8.0 * EPS {
                    return Err(LlbError::invariant(format!(
                        "{} max spin angle set to two different values; orig val={:.17e}, new val={:.17e}",
                        self.name, old, maxang
                    )));
                }
            }
            None => state.derived.add(&msa_name, maxang)?,
        }
        Ok(())
    }

    /// Stage and run maxima, carried over from the previous state when it is
    /// still available. Written only if absent.
    fn record_stage_and_run_angles(&self, input: &EnergyInput, maxang: f64) {
        let state = input.state;
        let smsa_name = self.stage_max_spin_angle_name();
        let rmsa_name = self.run_max_spin_angle_name();

        let mut stage_maxang = -1.0_f64;
        let mut run_maxang = -1.0_f64;
        if let Some(old) = input.store.find(state.previous_state_id) {
            if old.stage_number != state.stage_number {
                stage_maxang = 0.0;
            } else if let Some(v) = old.derived.get(&smsa_name) {
                stage_maxang = v;
            }
            if let Some(v) = old.derived.get(&rmsa_name) {
                run_maxang = v;
            }
        }
        stage_maxang = stage_maxang.max(maxang);
        run_maxang = run_maxang.max(maxang);

        state.derived.add_if_absent(&smsa_name, stage_maxang);
        state.derived.add_if_absent(&rmsa_name, run_maxang);
    }

    fn ensure_material(&self, input: &EnergyInput) -> Result<()> {
        let grid = &input.state.grid;
        let mut material = self.material.lock().expect("exchange material mutex poisoned");
        if matches!(&*material, Some(m) if m.mesh_id == grid.id()) {
            return Ok(());
        }
        let atlas = self.atlas.as_ref();
        let fill = |spec: &ScalarFieldSpec| spec.fill_mesh_value(grid, atlas);
        *material = Some(MaterialArrays {
            mesh_id: grid.id(),
            j: [fill(&self.mean_field.j[0])?, fill(&self.mean_field.j[1])?],
            mu: [fill(&self.mean_field.atom_moment[0])?, fill(&self.mean_field.atom_moment[1])?],
        });
        Ok(())
    }

    /// Re-solve m_e / chi_l when the stage (or mesh) changes, then attach to both states.
    fn update_stage_thermal(&self, input: &EnergyInput) -> Result<()> {
        self.ensure_material(input)?;
        let state = input.state;
        let mesh_id = state.grid.id();

        let mut slot = self.stage_thermal.lock().expect("exchange stage mutex poisoned");
        let stale = match &*slot {
            Some(t) => t.stage != state.stage_number || t.mesh_id != mesh_id,
            None => true,
        };
        if stale {
            let material = self.material.lock().expect("exchange material mutex poisoned");
            let m = material
                .as_ref()
                .ok_or_else(|| LlbError::invariant("exchange material arrays missing"))?;
            let (one, two) = match state.lattice {
                Lattice::One => (state, input.partner),
                Lattice::Two => (input.partner, state),
            };
            let t1 = thermal_params(state.stage_number, one.temperature, &m.j[0], &m.mu[0], self.tolerance);
            let t2 = thermal_params(state.stage_number, two.temperature, &m.j[1], &m.mu[1], self.tolerance);
            log::info!(
                "[exchange] {}: stage {} equilibrium update (T1 = {} K, T2 = {} K)",
                self.name,
                state.stage_number,
                one.temperature,
                two.temperature
            );
            *slot = Some(StageThermal {
                stage: state.stage_number,
                mesh_id,
                lattice: [Arc::new(t1), Arc::new(t2)],
            });
        }

        if let Some(t) = &*slot {
            state.attach_thermal(Arc::clone(&t.lattice[state.lattice.index()]));
            input
                .partner
                .attach_thermal(Arc::clone(&t.lattice[input.partner.lattice.index()]));
        }
        Ok(())
    }

    fn record_thermal_means(&self, state: &SimState) {
        if let Some(t) = state.thermal() {
            let mean = |v: &[f64]| {
                if v.is_empty() {
                    0.0
                } else {
                    v.iter().sum::<f64>() / v.len() as f64
                }
            };
            state.derived.add_if_absent(&format!("{}:m_e", self.name), mean(&t.m_e));
            state.derived.add_if_absent(&format!("{}:chi_l", self.name), mean(&t.chi_l));
            state.derived.add_if_absent(&format!("{}:Tc", self.name), mean(&t.tc));
        }
    }
}

/// Max neighbour angle (degrees) from the largest |m_j - m_i|^2.
pub fn max_angle_from_dot(max_dot: f64) -> f64 {
    let arg = 0.5 * max_dot.sqrt();
    if arg >= 1.0 {
        180.0
    } else {
        arg.asin() * (360.0 / std::f64::consts::PI)
    }
}

impl EnergyContributor for TwoLatticeExchange {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize_chunk(&self, input: &EnergyInput) -> Result<()> {
        self.update_stage_thermal(input)
    }

    fn compute_chunk(
        &self,
        input: &EnergyInput,
        range: Range<usize>,
        out: &mut ChunkOutputs,
        aux: &mut ChunkAux,
        abort: &AtomicBool,
    ) -> Result<()> {
        let state = input.state;
        let grid = &state.grid;
        let size = grid.n_cells();
        if range.start > range.end || range.end > size {
            return Err(LlbError::invariant(format!(
                "invalid chunk range {}..{} for mesh of {} cells",
                range.start, range.end, size
            )));
        }
        if range.is_empty() {
            return Ok(());
        }

        let regions = self.region_map.get_or_build(grid, self.atlas.as_ref(), &self.name)?;
        let coef = &self.coef[state.lattice.index()];
        let spin = &state.spin;
        let ms = &state.ms;
        let ms_inv = &state.ms_inverse;

        let (xdim, ydim, zdim) = (grid.nx, grid.ny, grid.nz);
        let xydim = xdim * ydim;
        let xyzdim = xydim * zdim;
        let [xper, yper, zper] = grid.periodic;

        let wgtx = -1.0 / (grid.dx * grid.dx);
        let wgty = -1.0 / (grid.dy * grid.dy);
        let wgtz = -1.0 / (grid.dz * grid.dz);
        let hcoef = -2.0 / MU0;
        let lex_type = self.coef_type == ExchangeCoefType::ExchangeLength;

        let mut energy_sum = CompensatedSum::new();
        let mut max_dot = 0.0_f64;

        let (mut x, mut y, mut z) = grid.coords(range.start);
        for i in range.clone() {
            if x == 0 && abort.load(Ordering::Relaxed) {
                return Ok(());
            }
            let k = i - range.start;
            let base = spin[i];
            let msii = ms_inv[i];

            if msii != 0.0 {
                let row = coef.row(regions.region(i));
                // lex -> A: A = mu0 Ms^2 lex^2 / 2, using this cell's Ms.
                let pair_coef = |j: usize| {
                    let c = row[regions.region(j)];
                    if lex_type {
                        0.5 * MU0 * ms[i] * ms[i] * c * c
                    } else {
                        c
                    }
                };
                let mut sum = [0.0_f64; 3];
                let mut couple = |j: usize, wgt: f64, track: bool, sum: &mut [f64; 3]| {
                    let a = pair_coef(j);
                    if a == 0.0 || ms_inv[j] == 0.0 {
                        return;
                    }
                    let diff = sub(spin[j], base);
                    let s = a * wgt;
                    sum[0] += s * diff[0];
                    sum[1] += s * diff[1];
                    sum[2] += s * diff[2];
                    if track {
                        let d = norm2(diff);
                        if d > max_dot {
                            max_dot = d;
                        }
                    }
                };

                // -z, -y, -x (tracked for max angle), then +x, +y, +z.
                if z > 0 || zper {
                    let j = if z == 0 { i + xyzdim - xydim } else { i - xydim };
                    couple(j, wgtz, true, &mut sum);
                }
                if y > 0 || yper {
                    let j = if y == 0 { i + xydim - xdim } else { i - xdim };
                    couple(j, wgty, true, &mut sum);
                }
                if x > 0 || xper {
                    let j = if x == 0 { i + xdim - 1 } else { i - 1 };
                    couple(j, wgtx, true, &mut sum);
                }
                if x + 1 < xdim || xper {
                    let j = if x + 1 == xdim { i + 1 - xdim } else { i + 1 };
                    couple(j, wgtx, false, &mut sum);
                }
                if y + 1 < ydim || yper {
                    let j = if y + 1 == ydim { i + xdim - xydim } else { i + xdim };
                    couple(j, wgty, false, &mut sum);
                }
                if z + 1 < zdim || zper {
                    let j = if z + 1 == zdim { i + xydim - xyzdim } else { i + xydim };
                    couple(j, wgtz, false, &mut sum);
                }

                let ei = dot(base, sum);
                let hmult = hcoef * msii;
                let h = [sum[0] * hmult, sum[1] * hmult, sum[2] * hmult];
                let t = cross(base, h);

                energy_sum.add(ei);
                out.energy[k] += ei;
                for c in 0..3 {
                    out.h[k][c] += h[c];
                    out.mxh[k][c] += t[c];
                }
            }

            x += 1;
            if x == xdim {
                x = 0;
                y += 1;
                if y == ydim {
                    y = 0;
                    z += 1;
                }
            }
        }

        // All cells of a rectangular mesh share one volume.
        aux.energy_total.add(energy_sum.value() * grid.cell_volume());
        aux.max_dot = aux.max_dot.max(max_dot);
        Ok(())
    }

    fn finalize_chunk(&self, input: &EnergyInput, aux: &[ChunkAux]) -> Result<()> {
        let total_max_dot = aux.iter().fold(0.0_f64, |m, a| m.max(a.max_dot));
        let maxang = max_angle_from_dot(total_max_dot);
        self.record_max_spin_angle(input.state, maxang)?;
        self.record_stage_and_run_angles(input, maxang);
        self.record_thermal_means(input.state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::BoxAtlas;
    use crate::energy::compute_energy;
    use crate::grid::Grid3D;
    use crate::state::StateStore;

    fn a_lists(a: f64) -> CoefLists {
        let v = |s: f64| vec!["film".to_string(), "film".to_string(), format!("{:e}", s)];
        CoefLists {
            coef_type: ExchangeCoefType::Stiffness,
            lattice1: v(a),
            lattice2: v(a),
            cross: v(0.0),
            defaults: [0.0; 3],
        }
    }

    fn mean_field() -> MeanFieldParams {
        MeanFieldParams {
            j: [ScalarFieldSpec::uniform(1e-21), ScalarFieldSpec::uniform(1e-21)],
            atom_moment: [ScalarFieldSpec::uniform(1.0), ScalarFieldSpec::uniform(1.0)],
        }
    }

    #[test]
    fn max_angle_conversion() {
        assert!((max_angle_from_dot(2.0) - 90.0).abs() < 1e-12);
        assert_eq!(max_angle_from_dot(4.0), 180.0);
        assert_eq!(max_angle_from_dot(0.0), 0.0);
    }

    #[test]
    fn lex_coefficients_scale_with_ms() {
        let g = Grid3D::new(2, 1, 1, 1e-9, 1e-9, 1e-9).unwrap();
        let atlas: Arc<dyn RegionAtlas> = Arc::new(BoxAtlas::whole_mesh("a", "film", &g).unwrap());
        let mut lists = a_lists(5e-9);
        lists.coef_type = ExchangeCoefType::ExchangeLength;
        let ex = TwoLatticeExchange::new("ex", Arc::clone(&atlas), &lists, mean_field()).unwrap();
        let ms = 8e5;
        let s1 = SimState::initial(Lattice::One, g, vec![ms; 2], vec![[0.0, 0.0, 1.0], [1.0, 0.0, 0.0]]).unwrap();
        let s2 = SimState::initial(Lattice::Two, g, vec![ms; 2], vec![[0.0, 0.0, 1.0]; 2]).unwrap();
        let store = StateStore::default();
        let input = EnergyInput {
            state: &s1,
            partner: &s2,
            store: &store,
        };
        let terms: Vec<Arc<dyn EnergyContributor>> = vec![Arc::new(ex)];
        let r = compute_energy(&terms, &input).unwrap();
        let a_eff = 0.5 * MU0 * ms * ms * 5e-9 * 5e-9;
        let expected = 2.0 * a_eff / (MU0 * ms * 1e-18);
        assert!((r.h[0][0] - expected).abs() <= 1e-9 * expected);
    }

    #[test]
    fn repeated_angle_tolerated_and_conflict_rejected() {
        let g = Grid3D::new(1, 1, 1, 1e-9, 1e-9, 1e-9).unwrap();
        let atlas: Arc<dyn RegionAtlas> = Arc::new(BoxAtlas::whole_mesh("a", "film", &g).unwrap());
        let ex = TwoLatticeExchange::new("ex", atlas, &a_lists(1e-12), mean_field()).unwrap();
        let s = SimState::initial(Lattice::One, g, vec![1.0], vec![[0.0, 0.0, 1.0]]).unwrap();
        ex.record_max_spin_angle(&s, 30.0).unwrap();
        ex.record_max_spin_angle(&s, 30.0 + 1e-15).unwrap();
        assert!(matches!(ex.record_max_spin_angle(&s, 31.0), Err(LlbError::Invariant(_))));
    }

    #[test]
    fn thermal_params_attach_to_both_lattices() {
        let g = Grid3D::new(2, 1, 1, 1e-9, 1e-9, 1e-9).unwrap();
        let atlas: Arc<dyn RegionAtlas> = Arc::new(BoxAtlas::whole_mesh("a", "film", &g).unwrap());
        let ex = TwoLatticeExchange::new("ex", atlas, &a_lists(1e-12), mean_field()).unwrap();
        let mut s1 = SimState::initial(Lattice::One, g, vec![1.0; 2], vec![[0.0, 0.0, 1.0]; 2]).unwrap();
        let mut s2 = SimState::initial(Lattice::Two, g, vec![1.0; 2], vec![[0.0, 0.0, 1.0]; 2]).unwrap();
        s1.temperature = 10.0;
        s2.temperature = 20.0;
        let store = StateStore::default();
        let input = EnergyInput {
            state: &s1,
            partner: &s2,
            store: &store,
        };
        let terms: Vec<Arc<dyn EnergyContributor>> = vec![Arc::new(ex)];
        compute_energy(&terms, &input).unwrap();
        let t1 = s1.thermal().unwrap();
        let t2 = s2.thermal().unwrap();
        assert_eq!(t1.temperature, 10.0);
        assert_eq!(t2.temperature, 20.0);
        assert!(t1.m_e[0] > t2.m_e[0]);
        assert!(s1.derived.contains("ex:Tc"));
    }
}
