// src/equilibrium.rs
//
// Mean-field equilibrium polarisation and longitudinal susceptibility.
//
// With A = kT/J the ordered solution of the Langevin self-consistency
//   L(x) = A x,  m_e = A x
// exists only for 0 < A < 1/3. Outside that window m_e = 0 and
// chi_l = mu0 mu / J.
//
// Newton starts at x0 = 1/A, to the right of the root. f(x) = L(x) - A x is
// concave on x > 0, so iterates decrease monotonically onto the root. Close to
// A = 1/3 the root approaches 0 and convergence slows; the loop is capped and
// falls back to the last iterate with a warning.

use rayon::prelude::*;

use crate::params::{KB, MU0};
use crate::state::ThermalParams;

/// Newton tolerance used for the per-stage update.
pub const DEFAULT_TOLERANCE: f64 = 1e-4;

/// Newton iteration cap.
pub const MAX_NEWTON_ITERATIONS: usize = 200;

/// Langevin function coth(x) - 1/x.
pub fn langevin(x: f64) -> f64 {
    if x.abs() < 1e-4 {
        // x/3 - x^3/45 + O(x^5)
        return x / 3.0 - x * x * x / 45.0;
    }
    1.0 / x.tanh() - 1.0 / x
}

/// L'(x) = 1/x^2 - 1/sinh^2(x).
pub fn langevin_deriv(x: f64) -> f64 {
    if x.abs() < 1e-3 {
        let x2 = x * x;
        return 1.0 / 3.0 - x2 / 15.0 + 2.0 * x2 * x2 / 189.0;
    }
    let s = x.sinh();
    1.0 / (x * x) - 1.0 / (s * s)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Equilibrium {
    pub m_e: f64,
    pub chi_l: f64,
    /// Newton iterations spent (0 outside the ordered window).
    pub iterations: usize,
    pub converged: bool,
}

/// Solve for (m_e, chi_l) given exchange energy `j` (J), thermal energy `kt` (J)
/// and atomic moment `mu`.
pub fn solve_equilibrium(j: f64, kt: f64, mu: f64, tolerance: f64) -> Equilibrium {
    let tol = tolerance.abs();
    let a = kt / j;

    if !(a > 0.0 && a < 1.0 / 3.0) {
        let chi_l = if j == 0.0 { 0.0 } else { MU0 * mu / j };
        return Equilibrium {
            m_e: 0.0,
            chi_l,
            iterations: 0,
            converged: true,
        };
    }

    let mut x = 1.0 / a;
    let mut y = langevin(x) - a * x;
    let mut iterations = 0;
    while y.abs() > tol && iterations < MAX_NEWTON_ITERATIONS {
        let dy = langevin_deriv(x) - a;
        if dy == 0.0 || !dy.is_finite() {
            break;
        }
        x -= y / dy;
        y = langevin(x) - a * x;
        iterations += 1;
    }
    let converged = y.abs() <= tol;
    if !converged {
        log::warn!(
            "[equilibrium] Newton solve did not reach tolerance {:e} for A = {} after {} iterations (residual {:e}); using last iterate",
            tol,
            a,
            iterations,
            y
        );
    }

    let m_e = a * x;
    let beta = 1.0 / kt;
    let dl = langevin_deriv(j * m_e / kt);
    let chi_l = MU0 * mu * beta * dl / (1.0 - beta * j * dl);

    Equilibrium {
        m_e,
        chi_l,
        iterations,
        converged,
    }
}

/// Per-cell thermal parameters of one lattice at `temperature` for `stage`.
pub fn thermal_params(stage: u32, temperature: f64, j: &[f64], mu: &[f64], tolerance: f64) -> ThermalParams {
    let kt = KB * temperature;
    let (m_e, chi_l): (Vec<f64>, Vec<f64>) = j
        .par_iter()
        .zip_eq(mu.par_iter())
        .map(|(&jj, &mm)| {
            let eq = solve_equilibrium(jj, kt, mm, tolerance);
            (eq.m_e, eq.chi_l)
        })
        .unzip();
    let tc = j.iter().map(|&jj| jj / (3.0 * KB)).collect();
    ThermalParams {
        stage,
        temperature,
        m_e,
        chi_l,
        tc,
    }
}
