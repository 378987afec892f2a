// src/evolver.rs
//
// Adaptive first-order stepper for the stochastic two-lattice LLB system.
//
// One attempted step:
//  1. Trial dt = last suggestion, or start_dm / max dm/dt on a fresh start,
//     clamped to [min_timestep, max_timestep]. A dt pushed up to min_timestep
//     (or to the round-off lower bound) is "forced" and cannot be rejected.
//  2. Both lattices advance with the norm-preserving update
//       d = dm_t dt,  a = |d|^2 / 2,  d <- (d - a m0) / (1 + a),  m1 = (m0 + d) / |m0 + d|
//     and the longitudinal channel advances the polarisation track.
//  3. Energy and derivative are re-evaluated at the trial pair.
//  4. error = max_i |dm_old - dm_new| / 2, checked against the tightest of
//     error_rate, absolute_step_error / dt and relative_step_error * max dm/dt.
//  5. The energy may only rise by what pE/pt allows, plus a round-off margin.
//  6. Reject (shrink by no more than max_step_decrease) or accept (grow by no
//     more than max_step_increase).
//
// At nonzero temperature the step bounds collapse onto the noise timestep, so
// a rejected step is always retried as a forced one.

use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::atlas::{cells_in_regions, RegionAtlas};
use crate::energy::{compute_energy, EnergyContributor, EnergyInput, EnergyResult};
use crate::error::{LlbError, Result};
use crate::field_init::ScalarFieldSpec;
use crate::grid::Grid3D;
use crate::llb::{compute_derivative, Derivative, DerivativeOptions, LatticeDynamics};
use crate::params::{rad_per_s_to_deg_per_ns, EPS, GAMMA_LL};
use crate::state::{Lattice, LatticePair, SimState, StateStore};
use crate::thermal::ThermalField;
use crate::vec3::{add, dot, norm2, normalize, scale, sub};

pub const MAX_DM_DT: &str = "Max dm/dt";
pub const DE_DT: &str = "dE/dt";
pub const DELTA_E: &str = "Delta E";
pub const PE_PT: &str = "pE/pt";
pub const TIMESTEP_LOWER_BOUND: &str = "Timestep lower bound";
pub const TOTAL_ENERGY: &str = "Total energy";

const STEP_OUTPUTS: [&str; 5] = [MAX_DM_DT, DE_DT, DELTA_E, PE_PT, TIMESTEP_LOWER_BOUND];

/// Max step used at T = 0, where the step bounds are free.
const ZERO_TEMPERATURE_MAX_TIMESTEP: f64 = 1e-10;

#[derive(Debug, Clone)]
pub struct EvolverSettings {
    /// Step used at T > 0; also the noise normalisation timestep (s).
    pub fixed_timestep: f64,
    /// Max error rate (rad/s); negative disables.
    pub error_rate: f64,
    /// Max error per step (rad); negative disables.
    pub absolute_step_error: f64,
    /// Max error relative to max dm/dt; negative disables.
    pub relative_step_error: f64,
    pub step_headroom: f64,
    /// Spin rotation targeted by the first step (rad).
    pub start_dm: f64,
    pub max_step_increase: f64,
    pub max_step_decrease: f64,
    pub do_precess: bool,
    pub ito_calculus: bool,
    pub uniform_seed: Option<u64>,
    /// Bath temperature per stage (K); the last entry repeats.
    pub stage_temperatures: Vec<f64>,
}

impl Default for EvolverSettings {
    fn default() -> Self {
        Self {
            fixed_timestep: 1e-16,
            error_rate: -1.0,
            absolute_step_error: 0.2_f64.to_radians(),
            relative_step_error: 0.2,
            step_headroom: 0.85,
            start_dm: 0.01_f64.to_radians(),
            max_step_increase: 1.25,
            max_step_decrease: 0.5,
            do_precess: true,
            ito_calculus: false,
            uniform_seed: None,
            stage_temperatures: vec![300.0],
        }
    }
}

impl EvolverSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.fixed_timestep > 0.0) || !self.fixed_timestep.is_finite() {
            return Err(LlbError::config(format!(
                "invalid fixed_timestep {}: must be > 0",
                self.fixed_timestep
            )));
        }
        if !(self.step_headroom > 0.0) {
            return Err(LlbError::config(format!(
                "invalid step_headroom {}: must be > 0",
                self.step_headroom
            )));
        }
        if !(self.max_step_increase >= 1.0) {
            return Err(LlbError::config(format!(
                "invalid max_step_increase {}: must be >= 1",
                self.max_step_increase
            )));
        }
        if !(self.max_step_decrease > 0.0 && self.max_step_decrease < 1.0) {
            return Err(LlbError::config(format!(
                "invalid max_step_decrease {}: must lie in (0, 1)",
                self.max_step_decrease
            )));
        }
        if self.stage_temperatures.is_empty() {
            return Err(LlbError::config("stage temperature list is empty"));
        }
        if let Some(t) = self.stage_temperatures.iter().find(|t| !t.is_finite()) {
            return Err(LlbError::config(format!("invalid stage temperature {}", t)));
        }
        Ok(())
    }

    /// Bath temperature for `stage` (K).
    pub fn stage_temperature(&self, stage: u32) -> f64 {
        match self.stage_temperatures.len() {
            0 => 0.0,
            len => self.stage_temperatures[(stage as usize).min(len - 1)].abs(),
        }
    }

    /// (min_timestep, max_timestep). Any heated stage pins both to the noise
    /// timestep; a fully athermal run steps freely up to 1e-10 s.
    pub fn timestep_bounds(&self) -> (f64, f64) {
        if self.stage_temperatures.iter().all(|&t| t == 0.0) {
            (0.0, ZERO_TEMPERATURE_MAX_TIMESTEP)
        } else {
            (self.fixed_timestep, self.fixed_timestep)
        }
    }

    /// Error ceiling (rad/s) after applying every enabled control.
    pub fn working_allowed_error(&self, max_error: f64, stepsize: f64, max_dm_dt: f64) -> f64 {
        let mut w = self.max_step_increase * max_error / self.step_headroom;
        if self.error_rate >= 0.0 && w > self.error_rate {
            w = self.error_rate;
        }
        if self.absolute_step_error >= 0.0 && stepsize * w > self.absolute_step_error {
            w = self.absolute_step_error / stepsize;
        }
        if self.relative_step_error >= 0.0 && w > self.relative_step_error * max_dm_dt {
            w = self.relative_step_error * max_dm_dt;
        }
        w
    }

    /// Accept/reject decision and the next step suggestion.
    pub fn judge(&self, a: &StepAssessment) -> Verdict {
        let w = self.working_allowed_error(a.max_error, a.stepsize, a.max_dm_dt);
        if !a.forced {
            let mut ratio = 1.0;
            if a.max_error > w {
                ratio = self.step_headroom * w / a.max_error;
            } else if a.delta_e > a.max_allowed_delta_e {
                ratio = 0.5;
            }
            if ratio < 1.0 {
                let ratio = ratio.max(self.max_step_decrease);
                return Verdict::Reject {
                    next_timestep: ratio * a.stepsize,
                    allowed_error: w,
                };
            }
        }
        let mut ratio = self.max_step_increase;
        if ratio * a.max_error > self.step_headroom * w {
            ratio = self.step_headroom * w / a.max_error;
        }
        Verdict::Accept {
            next_timestep: ratio.max(self.max_step_decrease) * a.stepsize,
        }
    }
}

/// Inputs to [`EvolverSettings::judge`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepAssessment {
    /// max_i |dm_old - dm_new| / 2 (rad/s)
    pub max_error: f64,
    /// Max dm/dt at the start of the step (rad/s).
    pub max_dm_dt: f64,
    pub stepsize: f64,
    pub delta_e: f64,
    pub max_allowed_delta_e: f64,
    pub forced: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    Accept { next_timestep: f64 },
    Reject { next_timestep: f64, allowed_error: f64 },
}

/// Damping and gyromagnetic parameters of one lattice as configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicsSpec {
    pub alpha: ScalarFieldSpec,
    pub alpha_l: ScalarFieldSpec,
    /// Landau-Lifshitz gamma, m/(A s).
    pub gamma: f64,
}

impl Default for DynamicsSpec {
    fn default() -> Self {
        Self {
            alpha: ScalarFieldSpec::uniform(0.5),
            alpha_l: ScalarFieldSpec::uniform(0.0),
            gamma: GAMMA_LL,
        }
    }
}

impl DynamicsSpec {
    pub fn fill(&self, grid: &Grid3D, atlas: &dyn RegionAtlas) -> Result<LatticeDynamics> {
        Ok(LatticeDynamics {
            alpha_t: self.alpha.fill_mesh_value(grid, atlas)?,
            alpha_l: self.alpha_l.fill_mesh_value(grid, atlas)?,
            gamma: vec![self.gamma; grid.n_cells()],
        })
    }
}

/// Hooks a driver uses to build the successor state of a step.
pub trait StepHooks {
    /// Fresh state chained to `current`.
    fn fill_state(&self, current: &SimState) -> SimState {
        current.successor()
    }

    /// Adjust a work state after its timing has been filled in (e.g. clip the
    /// last step of a stage).
    fn fill_state_supplemental(&self, _work: &mut SimState) {}
}

/// Hooks with no stage boundaries.
#[derive(Debug, Clone, Copy, Default)]
pub struct FreeRun;

impl StepHooks for FreeRun {}

#[derive(Debug, Clone)]
pub enum StepOutcome {
    Accepted(LatticePair),
    Rejected { next_timestep: f64 },
}

/// Values reported for a state pair by [`LlbEulerEvolver::update_derived_outputs`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReportedOutputs {
    /// deg/ns
    pub max_dm_dt: f64,
    pub de_dt: f64,
    pub delta_e: f64,
}

/// Energy densities and derivatives of one state pair.
#[derive(Debug, Clone)]
struct Evaluation {
    ids: [u64; 2],
    energy: [Vec<f64>; 2],
    deriv: [Derivative; 2],
    pe_pt: f64,
    max_dm_dt: f64,
    de_dt: f64,
    lower_bound: f64,
}

#[derive(Debug, Clone)]
struct MeshMaterial {
    mesh_id: u64,
    dynamics: [LatticeDynamics; 2],
    fixed: Vec<usize>,
}

pub struct LlbEulerEvolver {
    settings: EvolverSettings,
    specs: [DynamicsSpec; 2],
    atlas: Arc<dyn RegionAtlas>,
    fixed_regions: Vec<String>,
    terms: Vec<Arc<dyn EnergyContributor>>,
    store: Arc<StateStore>,
    thermal: [ThermalField; 2],
    material: Option<MeshMaterial>,
    cache: Option<Evaluation>,
    next_timestep: f64,
}

impl LlbEulerEvolver {
    pub fn new(
        settings: EvolverSettings,
        specs: [DynamicsSpec; 2],
        atlas: Arc<dyn RegionAtlas>,
        fixed_regions: Vec<String>,
        terms: Vec<Arc<dyn EnergyContributor>>,
        store: Arc<StateStore>,
    ) -> Result<Self> {
        settings.validate()?;
        let seeds = match settings.uniform_seed {
            Some(s) => [Some(s), Some(s.wrapping_add(1))],
            None => [None, None],
        };
        Ok(Self {
            thermal: [ThermalField::new(seeds[0]), ThermalField::new(seeds[1])],
            settings,
            specs,
            atlas,
            fixed_regions,
            terms,
            store,
            material: None,
            cache: None,
            next_timestep: 0.0,
        })
    }

    pub fn settings(&self) -> &EvolverSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Step size suggested for the next attempt (0 = none yet).
    pub fn next_timestep(&self) -> f64 {
        self.next_timestep
    }

    /// Cells pinned on the current mesh.
    pub fn fixed_cells(&self) -> &[usize] {
        self.material.as_ref().map(|m| m.fixed.as_slice()).unwrap_or(&[])
    }

    fn options(&self) -> DerivativeOptions {
        DerivativeOptions {
            do_precess: self.settings.do_precess,
            ito_calculus: self.settings.ito_calculus,
            noise_timestep: self.settings.fixed_timestep,
        }
    }

    fn ensure_mesh(&mut self, grid: &Grid3D) -> Result<()> {
        if self.material.as_ref().map(|m| m.mesh_id) == Some(grid.id()) {
            return Ok(());
        }
        let atlas = self.atlas.as_ref();
        let dynamics = [self.specs[0].fill(grid, atlas)?, self.specs[1].fill(grid, atlas)?];
        let fixed = cells_in_regions(grid, atlas, &self.fixed_regions)?;
        if !fixed.is_empty() {
            log::info!("[llb] {} fixed cells in {:?}", fixed.len(), self.fixed_regions);
        }
        self.material = Some(MeshMaterial {
            mesh_id: grid.id(),
            dynamics,
            fixed,
        });
        Ok(())
    }

    fn evaluate(&mut self, pair: &LatticePair) -> Result<Evaluation> {
        self.ensure_mesh(&pair.one.grid)?;
        let opts = self.options();
        let material = self
            .material
            .as_ref()
            .ok_or_else(|| LlbError::invariant("evolver material not initialised"))?;

        let (e1, d1) = evaluate_lattice(
            &self.terms,
            &self.store,
            material,
            &mut self.thermal[0],
            &opts,
            pair,
            Lattice::One,
        )?;
        let (e2, d2) = evaluate_lattice(
            &self.terms,
            &self.store,
            material,
            &mut self.thermal[1],
            &opts,
            pair,
            Lattice::Two,
        )?;

        let pe_pt = e1.pe_pt + e2.pe_pt;
        let max_dm_dt = d1.max_dm_dt.max(d2.max_dm_dt);
        let lower_bound = if d1.max_dm_dt >= d2.max_dm_dt {
            d1.timestep_lower_bound
        } else {
            d2.timestep_lower_bound
        };
        // Each lattice's dE/dt already carries its own pE/pt.
        let de_dt = d1.de_dt + d2.de_dt;
        Ok(Evaluation {
            ids: [pair.one.id(), pair.two.id()],
            energy: [e1.energy, e2.energy],
            deriv: [d1, d2],
            pe_pt,
            max_dm_dt,
            de_dt,
            lower_bound,
        })
    }

    fn cache_matches(&self, pair: &LatticePair) -> bool {
        self.cache.as_ref().map(|c| c.ids) == Some([pair.one.id(), pair.two.id()])
    }

    /// Make sure `pair` carries every step output, computing whatever is missing.
    pub fn update_derived_outputs(&mut self, pair: &LatticePair) -> Result<ReportedOutputs> {
        let complete = self.cache_matches(pair)
            && STEP_OUTPUTS
                .iter()
                .all(|name| pair.one.derived.contains(name) && pair.two.derived.contains(name));

        if !complete {
            let ev = match self.cache.take() {
                Some(c) if c.ids == [pair.one.id(), pair.two.id()] => c,
                _ => self.evaluate(pair)?,
            };
            for state in [&pair.one, &pair.two] {
                state.derived.add_if_absent(PE_PT, ev.pe_pt);
                state.derived.add_if_absent(MAX_DM_DT, ev.max_dm_dt);
                state.derived.add_if_absent(DE_DT, ev.de_dt);
                state.derived.add_if_absent(TIMESTEP_LOWER_BOUND, ev.lower_bound);
                if !state.derived.contains(DELTA_E) {
                    if state.previous_state_id != 0 && state.stage_iteration_count > 0 {
                        return Err(LlbError::invariant(format!(
                            "can't derive Delta E from single state ({} state {})",
                            state.lattice.label(),
                            state.id()
                        )));
                    }
                    state.derived.add(DELTA_E, 0.0)?;
                }
            }
            self.cache = Some(ev);
        }

        let get = |name: &str| {
            pair.one
                .derived
                .get(name)
                .ok_or_else(|| LlbError::invariant(format!("derived output \"{}\" missing", name)))
        };
        Ok(ReportedOutputs {
            max_dm_dt: rad_per_s_to_deg_per_ns(get(MAX_DM_DT)?),
            de_dt: get(DE_DT)?,
            delta_e: get(DELTA_E)?,
        })
    }

    /// Attempt one step from `current`.
    pub fn step(&mut self, hooks: &dyn StepHooks, current: &LatticePair) -> Result<StepOutcome> {
        let mut work = [hooks.fill_state(&current.one), hooks.fill_state(&current.two)];
        for (w, c) in work.iter().zip([&current.one, &current.two]) {
            if c.grid.id() != w.grid.id() {
                return Err(LlbError::invariant("mesh not fixed across steps"));
            }
            if c.id() != w.previous_state_id {
                return Err(LlbError::invariant(format!(
                    "state continuity break detected on {} (state {} follows {}, expected {})",
                    w.lattice.label(),
                    w.id(),
                    w.previous_state_id,
                    c.id()
                )));
            }
        }
        self.store.insert_pair(current);

        if !self.cache_matches(current) {
            self.update_derived_outputs(current)?;
        }
        let cached = |name: &str| -> Result<f64> {
            match (current.one.derived.get(name), current.two.derived.contains(name)) {
                (Some(v), true) => Ok(v),
                _ => Err(LlbError::invariant(format!("invalid data cache: \"{}\" missing", name))),
            }
        };
        let max_dm_dt = cached(MAX_DM_DT)?;
        let pe_pt = cached(PE_PT)?;
        let lower_bound = cached(TIMESTEP_LOWER_BOUND)?;
        cached(DE_DT)?;
        cached(DELTA_E)?;
        let old = match self.cache.take() {
            Some(c) if c.ids == [current.one.id(), current.two.id()] => c,
            _ => return Err(LlbError::invariant("invalid data cache: no derivative for current state")),
        };

        // Trial step size.
        let (min_timestep, max_timestep) = self.settings.timestep_bounds();
        let mut stepsize = self.next_timestep;
        if stepsize <= 0.0 {
            let ceiling = (f64::MAX / 4.0).sqrt();
            stepsize = if self.settings.start_dm < ceiling * max_dm_dt {
                self.settings.start_dm / max_dm_dt
            } else {
                ceiling
            };
        }
        let mut forced = false;
        if stepsize < min_timestep {
            stepsize = min_timestep;
            forced = true;
        }
        if stepsize > max_timestep {
            stepsize = max_timestep;
        }

        for (w, c) in work.iter_mut().zip([&current.one, &current.two]) {
            w.last_timestep = stepsize.max(lower_bound);
            if c.stage_number != w.stage_number {
                w.stage_start_time = c.total_time();
                w.stage_elapsed_time = w.last_timestep;
                w.temperature = self.settings.stage_temperature(w.stage_number);
            } else {
                w.stage_start_time = c.stage_start_time;
                w.stage_elapsed_time = c.stage_elapsed_time + w.last_timestep;
            }
            w.iteration_count = c.iteration_count + 1;
            w.stage_iteration_count = c.stage_iteration_count + 1;
            hooks.fill_state_supplemental(w);
        }
        let dt = work[0].last_timestep;
        if work[1].last_timestep != dt {
            self.cache = Some(old);
            return Err(LlbError::invariant("sublattice step sizes diverged"));
        }
        if dt > stepsize {
            forced = true;
        }
        let stepsize = dt;

        for (k, (w, c)) in work.iter_mut().zip([&current.one, &current.two]).enumerate() {
            let d = &old.deriv[k];
            w.spin
                .par_iter_mut()
                .zip_eq(c.spin.par_iter())
                .zip_eq(d.dm_t.par_iter())
                .for_each(|((m1, &m0), &dm)| {
                    let mut delta = scale(dm, stepsize);
                    let adj = 0.5 * norm2(delta);
                    delta = scale(sub(delta, scale(m0, adj)), 1.0 / (1.0 + adj));
                    *m1 = normalize(add(m0, delta));
                });
            for ((p, &m0), &dl) in w.polarization.iter_mut().zip(c.spin.iter()).zip(d.dm_l.iter()) {
                *p += dot(m0, dl) * stepsize;
            }
        }

        let [w1, w2] = work;
        let next = LatticePair::new(w1, w2)?;
        let new = match self.evaluate(&next) {
            Ok(ev) => ev,
            Err(e) => {
                self.cache = Some(old);
                return Err(e);
            }
        };

        let mut delta_e = 0.0;
        let mut var_de = 0.0;
        let mut total_e = 0.0;
        for k in 0..2 {
            let vol = current.one.grid.cell_volume();
            for (&e, &new_e) in old.energy[k].iter().zip(new.energy[k].iter()) {
                total_e += e * vol;
                delta_e += (new_e - e) * vol;
                var_de += (new_e * new_e + e * e) * vol * vol;
            }
        }
        var_de *= 256.0 * EPS * EPS / 3.0;

        let max_error = old.deriv[0]
            .max_difference(&new.deriv[0])
            .max(old.deriv[1].max_difference(&new.deriv[1]))
            / 2.0;
        let max_allowed_delta_e =
            0.5 * (pe_pt + new.pe_pt) * stepsize + (EPS * total_e.abs()).max(2.0 * var_de.sqrt());

        let assessment = StepAssessment {
            max_error,
            max_dm_dt,
            stepsize,
            delta_e,
            max_allowed_delta_e,
            forced,
        };
        match self.settings.judge(&assessment) {
            Verdict::Reject {
                next_timestep,
                allowed_error,
            } => {
                log::debug!(
                    "[llb] step rejected: dt = {:e} s, error = {:e} rad/s (allowed {:e}), dE = {:e} J (allowed {:e})",
                    stepsize,
                    max_error,
                    allowed_error,
                    delta_e,
                    max_allowed_delta_e
                );
                self.next_timestep = next_timestep;
                self.cache = Some(old);
                Ok(StepOutcome::Rejected { next_timestep })
            }
            Verdict::Accept { next_timestep } => {
                for state in [&next.one, &next.two] {
                    state.derived.add(TIMESTEP_LOWER_BOUND, new.lower_bound)?;
                    state.derived.add(MAX_DM_DT, new.max_dm_dt)?;
                    state.derived.add(DE_DT, new.de_dt)?;
                    state.derived.add(DELTA_E, delta_e)?;
                    state.derived.add(PE_PT, new.pe_pt)?;
                }
                self.next_timestep = next_timestep;
                self.cache = Some(new);
                Ok(StepOutcome::Accepted(next))
            }
        }
    }
}

fn evaluate_lattice(
    terms: &[Arc<dyn EnergyContributor>],
    store: &StateStore,
    material: &MeshMaterial,
    thermal: &mut ThermalField,
    opts: &DerivativeOptions,
    pair: &LatticePair,
    lattice: Lattice,
) -> Result<(EnergyResult, Derivative)> {
    let (state, partner) = pair.with_partner(lattice);
    let input = EnergyInput { state, partner, store };
    let result = compute_energy(terms, &input)?;
    state.derived.add_if_absent(TOTAL_ENERGY, result.total_energy);
    let deriv = compute_derivative(
        state,
        &result.h,
        &result.mxh,
        result.pe_pt,
        &material.dynamics[lattice.index()],
        thermal,
        opts,
        &material.fixed,
    )?;
    Ok((result, deriv))
}
