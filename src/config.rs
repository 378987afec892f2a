// src/config.rs
//
// Run configuration: JSON in, `config.json` provenance out.
//
// Units follow the input conventions of the stepper: angles in degrees,
// error rates in deg/ns, times in seconds, fields in A/m. `build_simulation`
// converts to SI/radians and wires the atlas, energy terms, evolver and driver.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::atlas::{BoxAtlas, RegionAtlas, RegionBox};
use crate::coef_matrix::ExchangeCoefType;
use crate::driver::{DriverSettings, TwoLatticeDriver};
use crate::energy::EnergyContributor;
use crate::equilibrium::DEFAULT_TOLERANCE;
use crate::error::{LlbError, Result};
use crate::evolver::{DynamicsSpec, EvolverSettings, LlbEulerEvolver};
use crate::exchange::{CoefLists, MeanFieldParams, TwoLatticeExchange};
use crate::field_init::{ScalarFieldSpec, VectorFieldSpec};
use crate::grid::Grid3D;
use crate::params::{deg_per_ns_to_rad_per_s, GAMMA_LL};
use crate::state::{Lattice, LatticePair, SimState, StateStore};
use crate::zeeman::UniformZeeman;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub mesh: MeshConfig,
    #[serde(default)]
    pub atlas: AtlasConfig,
    /// Lattice 1, lattice 2.
    pub lattices: [LatticeConfig; 2],
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub zeeman: Option<ZeemanConfig>,
    #[serde(default)]
    pub evolver: EvolverConfig,
    pub driver: DriverConfig,
    #[serde(default)]
    pub run: RunInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeshConfig {
    pub nx: usize,
    pub ny: usize,
    pub nz: usize,
    pub dx: f64,
    pub dy: f64,
    pub dz: f64,
    #[serde(default)]
    pub periodic: [bool; 3],
}

/// Box regions. With no regions the whole mesh is one region named "main".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtlasConfig {
    #[serde(default = "default_atlas_name")]
    pub name: String,
    #[serde(default)]
    pub regions: Vec<RegionBox>,
}

impl Default for AtlasConfig {
    fn default() -> Self {
        Self {
            name: default_atlas_name(),
            regions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatticeConfig {
    /// Saturation magnetisation (A/m).
    pub ms: ScalarFieldSpec,
    /// Initial spin direction (normalised on load).
    pub m0: VectorFieldSpec,
    #[serde(default = "default_alpha")]
    pub alpha: ScalarFieldSpec,
    #[serde(default = "default_alpha_l")]
    pub alpha_l: ScalarFieldSpec,
    #[serde(rename = "gamma_LL", default)]
    pub gamma_ll: Option<f64>,
    #[serde(rename = "gamma_G", default)]
    pub gamma_g: Option<f64>,
    /// Mean-field exchange energy J (J).
    #[serde(rename = "J")]
    pub j: ScalarFieldSpec,
    /// Atomic moment entering chi_l.
    pub atom_moment: ScalarFieldSpec,
}

impl LatticeConfig {
    fn dynamics(&self, lattice: Lattice) -> Result<DynamicsSpec> {
        let gamma = match (self.gamma_ll, self.gamma_g) {
            (Some(_), Some(_)) => {
                return Err(LlbError::config(format!(
                    "{}: both gamma_G and gamma_LL specified",
                    lattice.label()
                )))
            }
            (None, Some(_)) => {
                return Err(LlbError::config(format!(
                    "{}: gamma_G is not supported; give gamma_LL",
                    lattice.label()
                )))
            }
            (Some(g), None) => g,
            (None, None) => GAMMA_LL,
        };
        Ok(DynamicsSpec {
            alpha: self.alpha.clone(),
            alpha_l: self.alpha_l.clone(),
            gamma,
        })
    }
}

/// (regionA, regionB, value) triples per channel plus the defaults for
/// unlisted pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoefChannels {
    pub lattice1: Vec<String>,
    pub lattice2: Vec<String>,
    pub cross: Vec<String>,
    #[serde(default)]
    pub defaults: [f64; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_exchange_name")]
    pub name: String,
    /// Stiffness tables (J/m).
    #[serde(rename = "A", default)]
    pub a: Option<CoefChannels>,
    /// Exchange length tables (m).
    #[serde(default)]
    pub lex: Option<CoefChannels>,
    #[serde(default = "default_newton_tolerance")]
    pub newton_tolerance: f64,
}

impl ExchangeConfig {
    pub fn coef_lists(&self) -> Result<CoefLists> {
        let (coef_type, c) = match (&self.a, &self.lex) {
            (Some(_), Some(_)) => {
                return Err(LlbError::config(format!(
                    "{}: A and lex are mutually exclusive",
                    self.name
                )))
            }
            (None, None) => {
                return Err(LlbError::config(format!("{}: one of A or lex is required", self.name)))
            }
            (Some(a), None) => (ExchangeCoefType::Stiffness, a),
            (None, Some(l)) => (ExchangeCoefType::ExchangeLength, l),
        };
        Ok(CoefLists {
            coef_type,
            lattice1: c.lattice1.clone(),
            lattice2: c.lattice2.clone(),
            cross: c.cross.clone(),
            defaults: c.defaults,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZeemanConfig {
    #[serde(default = "default_zeeman_name")]
    pub name: String,
    /// Applied field per stage (A/m); the last entry repeats.
    pub fields: Vec<[f64; 3]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolverConfig {
    #[serde(default = "default_fixed_timestep")]
    pub fixed_timestep: f64,
    /// deg/ns, negative disables.
    #[serde(default = "default_error_rate")]
    pub error_rate: f64,
    /// deg, negative disables.
    #[serde(default = "default_absolute_step_error")]
    pub absolute_step_error: f64,
    #[serde(default = "default_relative_step_error")]
    pub relative_step_error: f64,
    #[serde(default = "default_step_headroom")]
    pub step_headroom: f64,
    /// deg
    #[serde(default = "default_start_dm")]
    pub start_dm: f64,
    #[serde(default = "default_true")]
    pub do_precess: bool,
    #[serde(default)]
    pub ito_calculus: bool,
    #[serde(default)]
    pub uniform_seed: Option<u64>,
    /// Single bath temperature (K). Defaults to 300 K when no stage list is given.
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub stage_temperatures: Option<Vec<f64>>,
    /// Pinned regions.
    #[serde(default)]
    pub fixed_spins: Vec<String>,
}

impl Default for EvolverConfig {
    fn default() -> Self {
        Self {
            fixed_timestep: default_fixed_timestep(),
            error_rate: default_error_rate(),
            absolute_step_error: default_absolute_step_error(),
            relative_step_error: default_relative_step_error(),
            step_headroom: default_step_headroom(),
            start_dm: default_start_dm(),
            do_precess: true,
            ito_calculus: false,
            uniform_seed: None,
            temperature: None,
            stage_temperatures: None,
            fixed_spins: Vec::new(),
        }
    }
}

impl EvolverConfig {
    pub fn to_settings(&self) -> Result<EvolverSettings> {
        let stage_temperatures = match (self.temperature, &self.stage_temperatures) {
            (Some(_), Some(_)) => {
                return Err(LlbError::config(
                    "cannot specify both temperature and stage_temperatures",
                ))
            }
            (Some(t), None) => vec![t],
            (None, Some(list)) => list.clone(),
            (None, None) => vec![default_temperature()],
        };
        let error_rate = if self.error_rate > 0.0 {
            deg_per_ns_to_rad_per_s(self.error_rate)
        } else {
            self.error_rate
        };
        let absolute_step_error = if self.absolute_step_error > 0.0 {
            self.absolute_step_error.to_radians()
        } else {
            self.absolute_step_error
        };
        let settings = EvolverSettings {
            fixed_timestep: self.fixed_timestep,
            error_rate,
            absolute_step_error,
            relative_step_error: self.relative_step_error,
            step_headroom: self.step_headroom,
            start_dm: self.start_dm.to_radians(),
            do_precess: self.do_precess,
            ito_calculus: self.ito_calculus,
            uniform_seed: self.uniform_seed,
            stage_temperatures,
            ..EvolverSettings::default()
        };
        settings.validate()?;
        Ok(settings)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default = "default_stage_iteration_limit")]
    pub stage_iteration_limit: Vec<u64>,
    #[serde(default)]
    pub total_iteration_limit: u64,
    /// Derived from the longest per-stage list when absent.
    #[serde(default)]
    pub number_of_stages: Option<u32>,
    #[serde(default = "default_stopping_time")]
    pub stopping_time: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub binary: String,
    pub run_id: String,
    /// Table/plot output every `output_stride` accepted steps.
    #[serde(default = "default_output_stride")]
    pub output_stride: usize,
}

impl Default for RunInfo {
    fn default() -> Self {
        Self {
            binary: "ferri_run".to_string(),
            run_id: "ferri_run".to_string(),
            output_stride: default_output_stride(),
        }
    }
}

fn default_atlas_name() -> String {
    "atlas".to_string()
}
fn default_exchange_name() -> String {
    "exchange".to_string()
}
fn default_zeeman_name() -> String {
    "zeeman".to_string()
}
fn default_alpha() -> ScalarFieldSpec {
    ScalarFieldSpec::uniform(0.5)
}
fn default_alpha_l() -> ScalarFieldSpec {
    ScalarFieldSpec::uniform(0.0)
}
fn default_newton_tolerance() -> f64 {
    DEFAULT_TOLERANCE
}
fn default_fixed_timestep() -> f64 {
    1e-16
}
fn default_error_rate() -> f64 {
    -1.0
}
fn default_absolute_step_error() -> f64 {
    0.2
}
fn default_relative_step_error() -> f64 {
    0.2
}
fn default_step_headroom() -> f64 {
    0.85
}
fn default_start_dm() -> f64 {
    0.01
}
fn default_temperature() -> f64 {
    300.0
}
fn default_true() -> bool {
    true
}
fn default_stage_iteration_limit() -> Vec<u64> {
    vec![0]
}
fn default_stopping_time() -> Vec<f64> {
    vec![0.0]
}
fn default_output_stride() -> usize {
    1
}

impl SimulationConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| LlbError::config(format!("invalid config JSON: {}", e)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| LlbError::config(format!("cannot open config {}: {}", path.display(), e)))?;
        serde_json::from_reader(file)
            .map_err(|e| LlbError::config(format!("invalid config {}: {}", path.display(), e)))
    }

    pub fn write_to_dir(&self, out_dir: &Path) -> std::io::Result<()> {
        let path = out_dir.join("config.json");
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    /// Cross-field checks that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.exchange.coef_lists()?;
        for (lattice, l) in [Lattice::One, Lattice::Two].into_iter().zip(self.lattices.iter()) {
            l.dynamics(lattice)?;
        }
        self.evolver.to_settings()?;
        if let Some(z) = &self.zeeman {
            if z.fields.is_empty() {
                return Err(LlbError::config(format!("{}: fields must not be empty", z.name)));
            }
        }
        self.driver_settings().validate()
    }

    /// Stage count: explicit, or the longest per-stage list.
    pub fn number_of_stages(&self) -> u32 {
        if let Some(n) = self.driver.number_of_stages {
            return n;
        }
        let mut n = self.driver.stage_iteration_limit.len().max(self.driver.stopping_time.len());
        if let Some(z) = &self.zeeman {
            n = n.max(z.fields.len());
        }
        if let Some(t) = &self.evolver.stage_temperatures {
            n = n.max(t.len());
        }
        n.max(1) as u32
    }

    pub fn driver_settings(&self) -> DriverSettings {
        DriverSettings {
            stage_iteration_limit: self.driver.stage_iteration_limit.clone(),
            total_iteration_limit: self.driver.total_iteration_limit,
            number_of_stages: self.number_of_stages(),
            stopping_time: self.driver.stopping_time.clone(),
        }
    }

    pub fn grid(&self) -> Result<Grid3D> {
        let m = &self.mesh;
        let [px, py, pz] = m.periodic;
        Ok(Grid3D::new(m.nx, m.ny, m.nz, m.dx, m.dy, m.dz)?.with_periodic(px, py, pz))
    }
}

/// Everything a run needs, wired together.
pub struct Simulation {
    pub grid: Grid3D,
    pub atlas: Arc<dyn RegionAtlas>,
    pub exchange: Arc<TwoLatticeExchange>,
    pub zeeman: Option<Arc<UniformZeeman>>,
    pub driver: TwoLatticeDriver,
}

pub fn build_simulation(cfg: &SimulationConfig) -> Result<Simulation> {
    cfg.validate()?;
    let grid = cfg.grid()?;

    let atlas: Arc<dyn RegionAtlas> = if cfg.atlas.regions.is_empty() {
        Arc::new(BoxAtlas::whole_mesh(&cfg.atlas.name, "main", &grid)?)
    } else {
        Arc::new(BoxAtlas::new(&cfg.atlas.name, cfg.atlas.regions.clone())?)
    };

    let [l1, l2] = &cfg.lattices;
    let exchange = Arc::new(
        TwoLatticeExchange::new(
            &cfg.exchange.name,
            Arc::clone(&atlas),
            &cfg.exchange.coef_lists()?,
            MeanFieldParams {
                j: [l1.j.clone(), l2.j.clone()],
                atom_moment: [l1.atom_moment.clone(), l2.atom_moment.clone()],
            },
        )?
        .with_tolerance(cfg.exchange.newton_tolerance),
    );
    let zeeman = match &cfg.zeeman {
        Some(z) => Some(Arc::new(UniformZeeman::new(&z.name, z.fields.clone())?)),
        None => None,
    };

    let mut terms: Vec<Arc<dyn EnergyContributor>> = vec![exchange.clone()];
    if let Some(z) = &zeeman {
        terms.push(z.clone());
    }

    let settings = cfg.evolver.to_settings()?;
    let temperature = settings.stage_temperature(0);
    let store = Arc::new(StateStore::default());
    let evolver = LlbEulerEvolver::new(
        settings,
        [l1.dynamics(Lattice::One)?, l2.dynamics(Lattice::Two)?],
        Arc::clone(&atlas),
        cfg.evolver.fixed_spins.clone(),
        terms,
        store,
    )?;

    let initial_state = |lattice: Lattice, l: &LatticeConfig| -> Result<SimState> {
        let ms = l.ms.fill_mesh_value(&grid, atlas.as_ref())?;
        let m0 = l.m0.fill_mesh_value(&grid, atlas.as_ref())?;
        let mut s = SimState::initial(lattice, grid, ms, m0)?;
        s.temperature = temperature;
        Ok(s)
    };
    let pair = LatticePair::new(initial_state(Lattice::One, l1)?, initial_state(Lattice::Two, l2)?)?;

    let driver = TwoLatticeDriver::new(cfg.driver_settings(), evolver, pair)?;
    log::info!(
        "[driver] {} x {} x {} mesh, {} regions, {} stages, T0 = {} K",
        grid.nx,
        grid.ny,
        grid.nz,
        atlas.region_count(),
        cfg.number_of_stages(),
        temperature
    );

    Ok(Simulation {
        grid,
        atlas,
        exchange,
        zeeman,
        driver,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = r#"{
        "mesh": { "nx": 4, "ny": 1, "nz": 1, "dx": 2e-9, "dy": 2e-9, "dz": 2e-9 },
        "lattices": [
            {
                "ms": { "type": "uniform", "value": 8e5 },
                "m0": { "type": "uniform", "value": [0.1, 0.0, 1.0] },
                "J": { "type": "uniform", "value": 1e-20 },
                "atom_moment": { "type": "uniform", "value": 1e-23 }
            },
            {
                "ms": { "type": "uniform", "value": 4e5 },
                "m0": { "type": "uniform", "value": [0.0, 0.0, -1.0] },
                "alpha": { "type": "uniform", "value": 0.1 },
                "gamma_LL": 1.76e5,
                "J": { "type": "uniform", "value": 1e-20 },
                "atom_moment": { "type": "uniform", "value": 1e-23 }
            }
        ],
        "exchange": {
            "A": {
                "lattice1": ["main", "main", "1e-11"],
                "lattice2": ["main", "main", "5e-12"],
                "cross": ["main", "main", "0"]
            }
        },
        "zeeman": { "fields": [[0.0, 0.0, 1e5]] },
        "evolver": { "temperature": 0.0 },
        "driver": { "stage_iteration_limit": [20] }
    }"#;

    #[test]
    fn sample_parses_with_defaults() {
        let cfg = SimulationConfig::from_json_str(SAMPLE).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.evolver.step_headroom, 0.85);
        assert_eq!(cfg.number_of_stages(), 1);
        assert_eq!(cfg.lattices[1].gamma_ll, Some(1.76e5));
        let s = cfg.evolver.to_settings().unwrap();
        assert_eq!(s.stage_temperatures, vec![0.0]);
        assert!((s.start_dm - 0.01_f64.to_radians()).abs() < 1e-18);
    }

    #[test]
    fn conflicting_options_are_rejected() {
        let mut cfg = SimulationConfig::from_json_str(SAMPLE).unwrap();
        cfg.exchange.lex = cfg.exchange.a.clone();
        assert!(matches!(cfg.validate(), Err(LlbError::Config(_))));

        let mut cfg = SimulationConfig::from_json_str(SAMPLE).unwrap();
        cfg.evolver.stage_temperatures = Some(vec![10.0]);
        assert!(cfg.validate().is_err());

        let mut cfg = SimulationConfig::from_json_str(SAMPLE).unwrap();
        cfg.lattices[0].gamma_g = Some(2.2e5);
        assert!(cfg.validate().is_err());
        cfg.lattices[0].gamma_ll = None;
        assert!(cfg.validate().is_err());

        let mut cfg = SimulationConfig::from_json_str(SAMPLE).unwrap();
        cfg.evolver.step_headroom = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn error_rate_converts_only_when_positive() {
        let cfg = EvolverConfig {
            error_rate: 1.0,
            ..EvolverConfig::default()
        };
        let s = cfg.to_settings().unwrap();
        assert!((s.error_rate - std::f64::consts::PI * 1e9 / 180.0).abs() < 1e-3);
        let s = EvolverConfig::default().to_settings().unwrap();
        assert_eq!(s.error_rate, -1.0);
        assert_eq!(s.stage_temperatures, vec![300.0]);
    }

    #[test]
    fn builds_a_runnable_simulation() {
        let cfg = SimulationConfig::from_json_str(SAMPLE).unwrap();
        let sim = build_simulation(&cfg).unwrap();
        let pair = sim.driver.current();
        assert_eq!(pair.one.spin.len(), 4);
        assert_eq!(pair.two.spin[0], [0.0, 0.0, -1.0]);
        assert_eq!(pair.one.temperature, 0.0);
        assert_eq!(sim.atlas.region_count(), 1);
        assert!(sim.zeeman.is_some());
    }
}
