// src/params.rs

/// Vacuum permeability (T·m/A).
pub const MU0: f64 = 4.0e-7 * std::f64::consts::PI;

/// Boltzmann constant (J/K), the value used by the stochastic evolver.
pub const KB: f64 = 1.38062e-23;

/// Landau-Lifshitz gyromagnetic ratio for a free electron, m/(A·s).
pub const GAMMA_LL: f64 = 2.211e5;

/// Machine epsilon shorthand used by the step-size and energy checks.
pub const EPS: f64 = f64::EPSILON;

/// Convert deg/ns to rad/s.
#[inline]
pub fn deg_per_ns_to_rad_per_s(v: f64) -> f64 {
    v * std::f64::consts::PI * 1e9 / 180.0
}

/// Convert rad/s to deg/ns.
#[inline]
pub fn rad_per_s_to_deg_per_ns(v: f64) -> f64 {
    v * 180e-9 / std::f64::consts::PI
}
