// src/llb.rs
//
// Stochastic Landau-Lifshitz-Bloch right-hand side for one sublattice.
//
// Per cell with Ms != 0 (unit spin m, effective field H, thermal fields h_t, h_l):
//
//   p        = -|gamma| (m x H)                       precession
//   f        = -|gamma| (m x h_t)                     stochastic precession
//   dm_t     = [p + f]  - |alpha_t| ((p + f) x m)     (first bracket only if do_precess)
//            + drift_t                                 (unless Ito)
//   dm_l     = gamma alpha_l (m . (H + h_l)) m  + drift_l
//
//   sigma_t^2 = 2 kB T |alpha_t| / ((1 + alpha_t^2) mu0 gamma Ms V dt)
//   sigma_l^2 = 2 kB T |alpha_l| / (mu0 gamma Ms V dt)
//   drift_x   = -gamma (1 + alpha_x^2) * 2 kB T / (mu0 Ms V) * m
//
// The variances use |gamma|, the drift keeps the sign of gamma.
//
// The longitudinal drift only exists when the longitudinal noise does
// (alpha_l != 0). Fixed cells get a zero derivative after everything else.
//
// Aggregates:
//   max_dm_dt = sqrt(max_i |dm_t|^2 + |dm_l|^2)
//   dE/dt     = sum_i -mu0 |gamma alpha_t| |m x H|^2 Ms V + pE/pt
//   At T = 0, the smallest step that can still change the fastest spin under
//   f64 round-off becomes the timestep lower bound, measured with the same
//   combined dm_t + dm_l that picks the fastest cell; otherwise the lower bound
//   is the noise timestep.

use rayon::prelude::*;

use crate::error::{LlbError, Result};
use crate::params::{EPS, KB, MU0};
use crate::state::SimState;
use crate::thermal::ThermalField;
use crate::vec3::{add, cross, dot, norm2, scale};

/// Per-cell damping and gyromagnetic parameters of one lattice.
#[derive(Debug, Clone, PartialEq)]
pub struct LatticeDynamics {
    pub alpha_t: Vec<f64>,
    pub alpha_l: Vec<f64>,
    pub gamma: Vec<f64>,
}

impl LatticeDynamics {
    pub fn uniform(n: usize, alpha_t: f64, alpha_l: f64, gamma: f64) -> Self {
        Self {
            alpha_t: vec![alpha_t; n],
            alpha_l: vec![alpha_l; n],
            gamma: vec![gamma; n],
        }
    }

    pub fn len(&self) -> usize {
        self.gamma.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gamma.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivativeOptions {
    pub do_precess: bool,
    pub ito_calculus: bool,
    /// Time step the noise variance is normalised to (s).
    pub noise_timestep: f64,
}

#[derive(Debug, Clone)]
pub struct Derivative {
    pub dm_t: Vec<[f64; 3]>,
    pub dm_l: Vec<[f64; 3]>,
    /// rad/s
    pub max_dm_dt: f64,
    /// J/s
    pub de_dt: f64,
    pub timestep_lower_bound: f64,
}

impl Derivative {
    /// Max over cells of |a - b| across both channels.
    pub fn max_difference(&self, other: &Derivative) -> f64 {
        self.dm_t
            .par_iter()
            .zip_eq(self.dm_l.par_iter())
            .zip_eq(other.dm_t.par_iter().zip_eq(other.dm_l.par_iter()))
            .map(|((at, al), (bt, bl))| {
                let dt = [at[0] - bt[0], at[1] - bt[1], at[2] - bt[2]];
                let dl = [al[0] - bl[0], al[1] - bl[1], al[2] - bl[2]];
                norm2(dt) + norm2(dl)
            })
            .reduce(|| 0.0, f64::max)
            .sqrt()
    }
}

/// Per-cell thermal standard deviations (transverse, longitudinal).
pub fn thermal_sigmas(state: &SimState, dynamics: &LatticeDynamics, noise_timestep: f64) -> (Vec<f64>, Vec<f64>) {
    let kbt = KB * state.temperature.abs();
    let var_const = 2.0 * kbt / MU0;
    let vol = state.grid.cell_volume();
    let n = state.grid.n_cells();
    let mut sigma_t = vec![0.0; n];
    let mut sigma_l = vec![0.0; n];
    if var_const == 0.0 || noise_timestep <= 0.0 {
        return (sigma_t, sigma_l);
    }
    for i in 0..n {
        let ms = state.ms[i];
        let g = dynamics.gamma[i].abs();
        if ms == 0.0 || g == 0.0 {
            continue;
        }
        let at = dynamics.alpha_t[i];
        let al = dynamics.alpha_l[i];
        let m_local = ms.abs() * vol;
        sigma_t[i] = (var_const * at.abs() / (1.0 + at * at) / (g * m_local) / noise_timestep).sqrt();
        sigma_l[i] = (var_const * al.abs() / (g * m_local) / noise_timestep).sqrt();
    }
    (sigma_t, sigma_l)
}

/// Full stochastic derivative of `state` under field `h` (with `mxh = m x h`).
#[allow(clippy::too_many_arguments)]
pub fn compute_derivative(
    state: &SimState,
    h: &[[f64; 3]],
    mxh: &[[f64; 3]],
    pe_pt: f64,
    dynamics: &LatticeDynamics,
    thermal: &mut ThermalField,
    opts: &DerivativeOptions,
    fixed: &[usize],
) -> Result<Derivative> {
    let n = state.grid.n_cells();
    if h.len() != n || mxh.len() != n || dynamics.len() != n {
        return Err(LlbError::invariant(format!(
            "derivative inputs do not match mesh size {} (H {}, mxH {}, params {})",
            n,
            h.len(),
            mxh.len(),
            dynamics.len()
        )));
    }

    let (sigma_t, sigma_l) = thermal_sigmas(state, dynamics, opts.noise_timestep);
    thermal.refresh(state.grid.id(), state.iteration_count + 1, &sigma_t, &sigma_l);

    let vol = state.grid.cell_volume();
    let drift_const = 2.0 * KB * state.temperature.abs() / MU0;
    let h_t = &thermal.h_t;
    let h_l = &thermal.h_l;

    let mut dm_t = vec![[0.0; 3]; n];
    let mut dm_l = vec![[0.0; 3]; n];
    dm_t.par_iter_mut()
        .zip_eq(dm_l.par_iter_mut())
        .enumerate()
        .for_each(|(i, (dt, dl))| {
            let ms = state.ms[i];
            if ms == 0.0 {
                return;
            }
            let m = state.spin[i];
            let g = dynamics.gamma[i];
            let ga = g.abs();
            let at = dynamics.alpha_t[i];
            let al = dynamics.alpha_l[i];

            let p = scale(mxh[i], -ga);
            let f = scale(cross(m, h_t[i]), -ga);
            let mut d = if opts.do_precess { add(p, f) } else { [0.0; 3] };
            d = add(d, scale(cross(p, m), -at.abs()));
            d = add(d, scale(cross(f, m), -at.abs()));

            let mut l = scale(m, g * al * dot(m, add(h[i], h_l[i])));

            if !opts.ito_calculus && drift_const > 0.0 && g != 0.0 {
                let per_moment = drift_const / (ms.abs() * vol);
                d = add(d, scale(m, -g * (1.0 + at * at) * per_moment));
                if al != 0.0 {
                    l = add(l, scale(m, -g * (1.0 + al * al) * per_moment));
                }
            }
            *dt = d;
            *dl = l;
        });

    for &i in fixed {
        if i < n {
            dm_t[i] = [0.0; 3];
            dm_l[i] = [0.0; 3];
        }
    }

    let mut max_sq = 0.0_f64;
    let mut max_index = 0usize;
    let mut de_dt_sum = 0.0_f64;
    for i in 0..n {
        let sq = norm2(dm_t[i]) + norm2(dm_l[i]);
        if sq > 0.0 {
            de_dt_sum += -MU0 * (dynamics.gamma[i] * dynamics.alpha_t[i]).abs() * norm2(mxh[i]) * state.ms[i] * vol;
            if sq > max_sq {
                max_sq = sq;
                max_index = i;
            }
        }
    }

    // A state with nothing moving puts no floor on the step.
    let timestep_lower_bound = if state.temperature != 0.0 {
        opts.noise_timestep
    } else if max_sq > 0.0 {
        min_representable_step(state.spin[max_index], add(dm_t[max_index], dm_l[max_index]))
    } else {
        0.0
    };

    Ok(Derivative {
        dm_t,
        dm_l,
        max_dm_dt: max_sq.sqrt(),
        de_dt: de_dt_sum + pe_pt,
        timestep_lower_bound,
    })
}

/// Smallest step for which m + dm*dt differs from m in f64.
fn min_representable_step(m: [f64; 3], dm: [f64; 3]) -> f64 {
    let mut min_ratio = f64::MAX / 2.0;
    for c in 0..3 {
        if dm[c].abs() >= 1.0 || min_ratio * dm[c].abs() > m[c].abs() {
            min_ratio = (m[c] / dm[c]).abs();
        }
    }
    min_ratio * EPS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Grid3D;
    use crate::state::Lattice;

    fn one_cell(temperature: f64, m: [f64; 3]) -> SimState {
        let g = Grid3D::new(1, 1, 1, 1e-9, 1e-9, 1e-9).unwrap();
        let mut s = SimState::initial(Lattice::One, g, vec![1e6], vec![m]).unwrap();
        s.temperature = temperature;
        s
    }

    fn opts() -> DerivativeOptions {
        DerivativeOptions {
            do_precess: true,
            ito_calculus: false,
            noise_timestep: 1e-15,
        }
    }

    #[test]
    fn precession_and_damping_at_zero_temperature() {
        let s = one_cell(0.0, [1.0, 0.0, 0.0]);
        let h = vec![[0.0, 0.0, 1e5]];
        let mxh = vec![cross(s.spin[0], h[0])];
        let dynamics = LatticeDynamics::uniform(1, 0.1, 0.0, 2.211e5);
        let mut th = ThermalField::new(Some(1));
        let d = compute_derivative(&s, &h, &mxh, 0.0, &dynamics, &mut th, &opts(), &[]).unwrap();
        let gh = 2.211e5 * 1e5;
        // m x H = (0,-1e5,0): precession along +y, damping pulls toward +z.
        assert!((d.dm_t[0][1] - gh).abs() < 1e-6 * gh);
        assert!((d.dm_t[0][2] - 0.1 * gh).abs() < 1e-6 * gh);
        assert_eq!(d.dm_l[0], [0.0; 3]);
        assert!(d.de_dt < 0.0);
        // m_z = 0 against a nonzero dm_z: zero floor.
        assert_eq!(d.timestep_lower_bound, 0.0);

        let tilted = one_cell(0.0, [0.6, 0.0, 0.8]);
        let mxh = vec![cross(tilted.spin[0], h[0])];
        let d = compute_derivative(&tilted, &h, &mxh, 0.0, &dynamics, &mut th, &opts(), &[]).unwrap();
        assert!(d.timestep_lower_bound > 0.0 && d.timestep_lower_bound < 1e-20);
    }

    #[test]
    fn fixed_and_empty_cells_do_not_move() {
        let g = Grid3D::new(2, 1, 1, 1e-9, 1e-9, 1e-9).unwrap();
        let s = SimState::initial(Lattice::One, g, vec![1e6, 0.0], vec![[1.0, 0.0, 0.0]; 2]).unwrap();
        let h = vec![[0.0, 0.0, 1e5]; 2];
        let mxh: Vec<_> = h.iter().map(|&hh| cross([1.0, 0.0, 0.0], hh)).collect();
        let dynamics = LatticeDynamics::uniform(2, 0.1, 0.0, 2.211e5);
        let mut th = ThermalField::new(Some(1));
        let d = compute_derivative(&s, &h, &mxh, 0.0, &dynamics, &mut th, &opts(), &[0]).unwrap();
        assert_eq!(d.dm_t, vec![[0.0; 3]; 2]);
        assert_eq!(d.max_dm_dt, 0.0);
        assert_eq!(d.de_dt, 0.0);
    }

    #[test]
    fn longitudinal_channel_follows_field_projection() {
        let s = one_cell(0.0, [0.0, 0.0, 1.0]);
        let h = vec![[0.0, 0.0, 2.0]];
        let mxh = vec![[0.0; 3]];
        let dynamics = LatticeDynamics::uniform(1, 0.0, 0.5, 3.0);
        let mut th = ThermalField::new(Some(1));
        let d = compute_derivative(&s, &h, &mxh, 0.0, &dynamics, &mut th, &opts(), &[]).unwrap();
        assert_eq!(d.dm_l[0], [0.0, 0.0, 3.0]);
        assert_eq!(d.max_dm_dt, 3.0);
    }

    #[test]
    fn longitudinal_motion_sets_the_round_off_floor() {
        let s = one_cell(0.0, [0.0, 0.0, 1.0]);
        let h = vec![[0.0, 0.0, 1e5]];
        let mxh = vec![[0.0; 3]];
        let dynamics = LatticeDynamics::uniform(1, 0.1, 0.5, 2.211e5);
        let mut th = ThermalField::new(Some(1));
        let d = compute_derivative(&s, &h, &mxh, 0.0, &dynamics, &mut th, &opts(), &[]).unwrap();
        let rate = 2.211e5 * 0.5 * 1e5;
        assert_eq!(d.dm_t[0], [0.0; 3]);
        assert!((d.max_dm_dt - rate).abs() < 1e-9 * rate);
        let expected = EPS / rate;
        assert!((d.timestep_lower_bound - expected).abs() < 1e-9 * expected);
    }

    #[test]
    fn drift_follows_the_sign_of_gamma() {
        let s = one_cell(300.0, [0.0, 0.0, 1.0]);
        let h = vec![[0.0; 3]];
        let mxh = vec![[0.0; 3]];
        let ito = DerivativeOptions {
            ito_calculus: true,
            ..opts()
        };
        for (gamma, drift_sign) in [(2.211e5, -1.0), (-2.211e5, 1.0)] {
            let dynamics = LatticeDynamics::uniform(1, 0.1, 0.0, gamma);
            let mut th = ThermalField::new(Some(9));
            let with = compute_derivative(&s, &h, &mxh, 0.0, &dynamics, &mut th, &opts(), &[]).unwrap();
            let without = compute_derivative(&s, &h, &mxh, 0.0, &dynamics, &mut th, &ito, &[]).unwrap();
            let drift_z = with.dm_t[0][2] - without.dm_t[0][2];
            let expected = -gamma * 1.01 * 2.0 * KB * 300.0 / (MU0 * 1e6 * 1e-27);
            assert!(drift_z * drift_sign > 0.0);
            assert!((drift_z - expected).abs() < 1e-6 * expected.abs());
        }
    }

    #[test]
    fn noise_is_reused_within_an_iteration() {
        let s = one_cell(300.0, [0.0, 0.0, 1.0]);
        let h = vec![[0.0; 3]];
        let mxh = vec![[0.0; 3]];
        let dynamics = LatticeDynamics::uniform(1, 0.1, 0.0, 2.211e5);
        let mut th = ThermalField::new(Some(5));
        let a = compute_derivative(&s, &h, &mxh, 0.0, &dynamics, &mut th, &opts(), &[]).unwrap();
        let b = compute_derivative(&s, &h, &mxh, 0.0, &dynamics, &mut th, &opts(), &[]).unwrap();
        assert_eq!(a.dm_t, b.dm_t);
        assert!(a.max_dm_dt > 0.0);
        assert_eq!(a.timestep_lower_bound, 1e-15);

        let ito = DerivativeOptions {
            ito_calculus: true,
            ..opts()
        };
        let c = compute_derivative(&s, &h, &mxh, 0.0, &dynamics, &mut th, &ito, &[]).unwrap();
        // Same noise, no drift: the difference is purely along m.
        let diff = [
            a.dm_t[0][0] - c.dm_t[0][0],
            a.dm_t[0][1] - c.dm_t[0][1],
            a.dm_t[0][2] - c.dm_t[0][2],
        ];
        assert!(diff[0].abs() < 1e-12 * diff[2].abs());
        assert!(diff[2] < 0.0);
    }

    #[test]
    fn sigma_scales_with_temperature() {
        let s = one_cell(400.0, [0.0, 0.0, 1.0]);
        let dynamics = LatticeDynamics::uniform(1, 1.0, 0.0, 2.0);
        let (st, sl) = thermal_sigmas(&s, &dynamics, 1e-15);
        let expected = (2.0 * KB * 400.0 / MU0 * 0.5 / (2.0 * 1e6 * 1e-27) / 1e-15).sqrt();
        assert!((st[0] - expected).abs() < 1e-9 * expected);
        assert_eq!(sl[0], 0.0);
    }
}
