// src/state.rs
//
// Simulation state snapshots.
//
// A state is built (and mutated) by exactly one owner, then frozen behind an Arc
// and shared read-only by the energy workers, the evolver and the state store.
// The only things that may still change after freezing are:
//  - `derived`: write-once named scalars (energy, max spin angle, dE/dt, ...)
//  - `thermal`: the per-stage m_e / chi_l / Tc arrays, attached once
//
// A two-sublattice run carries one state per lattice per step (`LatticePair`);
// cross-lattice terms read the partner through the pair rather than through
// back-pointers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use serde::{Deserialize, Serialize};

use crate::error::{LlbError, Result};
use crate::grid::Grid3D;
use crate::vec3::normalize;

static NEXT_STATE_ID: AtomicU64 = AtomicU64::new(1);

fn next_state_id() -> u64 {
    NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lattice {
    One,
    Two,
}

impl Lattice {
    pub fn index(self) -> usize {
        match self {
            Lattice::One => 0,
            Lattice::Two => 1,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Lattice::One => "lattice1",
            Lattice::Two => "lattice2",
        }
    }
}

/// Append-only map of named scalars attached to a state.
#[derive(Debug, Default)]
pub struct DerivedData {
    values: Mutex<BTreeMap<String, f64>>,
}

impl DerivedData {
    pub fn get(&self, name: &str) -> Option<f64> {
        let values = self.values.lock().expect("derived data mutex poisoned");
        values.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Insert a new value. A name that is already present is an invariant error.
    pub fn add(&self, name: &str, value: f64) -> Result<()> {
        let mut values = self.values.lock().expect("derived data mutex poisoned");
        if let Some(old) = values.get(name) {
            return Err(LlbError::invariant(format!(
                "derived data \"{}\" already set (old value {}, new value {})",
                name, old, value
            )));
        }
        values.insert(name.to_string(), value);
        Ok(())
    }

    /// Insert only if absent. Returns true when the value was stored.
    pub fn add_if_absent(&self, name: &str, value: f64) -> bool {
        let mut values = self.values.lock().expect("derived data mutex poisoned");
        if values.contains_key(name) {
            return false;
        }
        values.insert(name.to_string(), value);
        true
    }
}

/// Per-cell temperature-dependent parameters for one lattice, valid for one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct ThermalParams {
    pub stage: u32,
    pub temperature: f64,
    /// Equilibrium spin polarisation.
    pub m_e: Vec<f64>,
    /// Longitudinal susceptibility.
    pub chi_l: Vec<f64>,
    /// Mean-field Curie temperature J/(3 kB).
    pub tc: Vec<f64>,
}

#[derive(Debug)]
pub struct SimState {
    id: u64,
    /// 0 when there is no predecessor.
    pub previous_state_id: u64,
    pub lattice: Lattice,
    pub grid: Grid3D,

    pub ms: Arc<Vec<f64>>,
    pub ms_inverse: Arc<Vec<f64>>,
    /// Unit spin directions.
    pub spin: Vec<[f64; 3]>,
    /// Longitudinal magnitude track. Advanced by the evolver but not fed back into Ms.
    pub polarization: Vec<f64>,
    /// Bath temperature (K) for this state's stage.
    pub temperature: f64,

    pub iteration_count: u64,
    pub stage_number: u32,
    pub stage_iteration_count: u64,
    pub stage_start_time: f64,
    pub stage_elapsed_time: f64,
    pub last_timestep: f64,

    pub derived: DerivedData,
    thermal: OnceLock<Arc<ThermalParams>>,
}

impl SimState {
    /// First state of a run. Spins are normalised; negative Ms is rejected and
    /// Ms = 0 cells get Ms_inverse = 0.
    pub fn initial(lattice: Lattice, grid: Grid3D, ms: Vec<f64>, spin: Vec<[f64; 3]>) -> Result<Self> {
        let n = grid.n_cells();
        if ms.len() != n || spin.len() != n {
            return Err(LlbError::invariant(format!(
                "state arrays do not match mesh size {} (Ms {}, spin {})",
                n,
                ms.len(),
                spin.len()
            )));
        }
        let ms_inverse = inverse_ms(&ms, lattice)?;
        Ok(Self {
            id: next_state_id(),
            previous_state_id: 0,
            lattice,
            grid,
            ms: Arc::new(ms),
            ms_inverse: Arc::new(ms_inverse),
            spin: spin.into_iter().map(normalize).collect(),
            polarization: vec![1.0; n],
            temperature: 0.0,
            iteration_count: 0,
            stage_number: 0,
            stage_iteration_count: 0,
            stage_start_time: 0.0,
            stage_elapsed_time: 0.0,
            last_timestep: 0.0,
            derived: DerivedData::default(),
            thermal: OnceLock::new(),
        })
    }

    /// New state chained to `self`: fresh id, same material, copied spins and
    /// counters, empty derived data.
    pub fn successor(&self) -> Self {
        Self {
            id: next_state_id(),
            previous_state_id: self.id,
            lattice: self.lattice,
            grid: self.grid,
            ms: Arc::clone(&self.ms),
            ms_inverse: Arc::clone(&self.ms_inverse),
            spin: self.spin.clone(),
            polarization: self.polarization.clone(),
            temperature: self.temperature,
            iteration_count: self.iteration_count,
            stage_number: self.stage_number,
            stage_iteration_count: self.stage_iteration_count,
            stage_start_time: self.stage_start_time,
            stage_elapsed_time: self.stage_elapsed_time,
            last_timestep: self.last_timestep,
            derived: DerivedData::default(),
            thermal: OnceLock::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Simulation time at this state.
    pub fn total_time(&self) -> f64 {
        self.stage_start_time + self.stage_elapsed_time
    }

    pub fn thermal(&self) -> Option<&Arc<ThermalParams>> {
        self.thermal.get()
    }

    /// Attach per-stage thermal parameters. Returns false if already attached.
    pub fn attach_thermal(&self, params: Arc<ThermalParams>) -> bool {
        self.thermal.set(params).is_ok()
    }

    /// Ms-weighted mean spin direction.
    pub fn average_m(&self) -> [f64; 3] {
        let mut acc = [0.0; 3];
        let mut wsum = 0.0;
        for (m, &ms) in self.spin.iter().zip(self.ms.iter()) {
            let w = ms.abs();
            acc[0] += w * m[0];
            acc[1] += w * m[1];
            acc[2] += w * m[2];
            wsum += w;
        }
        if wsum > 0.0 {
            [acc[0] / wsum, acc[1] / wsum, acc[2] / wsum]
        } else {
            [0.0; 3]
        }
    }
}

fn inverse_ms(ms: &[f64], lattice: Lattice) -> Result<Vec<f64>> {
    ms.iter()
        .enumerate()
        .map(|(i, &v)| {
            if v < 0.0 || v.is_nan() {
                Err(LlbError::config(format!(
                    "negative Ms value ({}) detected on {} at mesh index {}",
                    v,
                    lattice.label(),
                    i
                )))
            } else if v == 0.0 {
                Ok(0.0)
            } else {
                Ok(1.0 / v)
            }
        })
        .collect()
}

/// The two sublattice states of one step.
#[derive(Debug, Clone)]
pub struct LatticePair {
    pub one: Arc<SimState>,
    pub two: Arc<SimState>,
}

impl LatticePair {
    pub fn new(one: SimState, two: SimState) -> Result<Self> {
        if one.lattice != Lattice::One || two.lattice != Lattice::Two {
            return Err(LlbError::invariant("lattice pair built with mislabelled states"));
        }
        if one.grid.id() != two.grid.id() {
            return Err(LlbError::invariant("sublattice states live on different meshes"));
        }
        Ok(Self {
            one: Arc::new(one),
            two: Arc::new(two),
        })
    }

    /// (state, partner) for the given lattice.
    pub fn with_partner(&self, lattice: Lattice) -> (&SimState, &SimState) {
        match lattice {
            Lattice::One => (&self.one, &self.two),
            Lattice::Two => (&self.two, &self.one),
        }
    }
}

/// Bounded id -> state lookup used for previous-state queries.
#[derive(Debug)]
pub struct StateStore {
    states: Mutex<BTreeMap<u64, Arc<SimState>>>,
    capacity: usize,
}

impl StateStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            states: Mutex::new(BTreeMap::new()),
            capacity: capacity.max(2),
        }
    }

    /// Keep `state`; drops the oldest entries beyond capacity. Ids increase
    /// monotonically, so the oldest is the smallest key.
    pub fn insert(&self, state: Arc<SimState>) {
        let mut states = self.states.lock().expect("state store mutex poisoned");
        states.insert(state.id(), state);
        while states.len() > self.capacity {
            let oldest = match states.keys().next() {
                Some(&k) => k,
                None => break,
            };
            states.remove(&oldest);
        }
    }

    pub fn insert_pair(&self, pair: &LatticePair) {
        self.insert(Arc::clone(&pair.one));
        self.insert(Arc::clone(&pair.two));
    }

    pub fn find(&self, id: u64) -> Option<Arc<SimState>> {
        if id == 0 {
            return None;
        }
        let states = self.states.lock().expect("state store mutex poisoned");
        states.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.states.lock().expect("state store mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_state(ms: Vec<f64>) -> Result<SimState> {
        let g = Grid3D::new(ms.len(), 1, 1, 1e-9, 1e-9, 1e-9).unwrap();
        let n = ms.len();
        SimState::initial(Lattice::One, g, ms, vec![[0.0, 0.0, 2.0]; n])
    }

    #[test]
    fn derived_data_is_write_once() {
        let s = small_state(vec![1.0]).unwrap();
        s.derived.add("Max dm/dt", 1.0).unwrap();
        assert!(matches!(s.derived.add("Max dm/dt", 1.0), Err(LlbError::Invariant(_))));
        assert!(!s.derived.add_if_absent("Max dm/dt", 2.0));
        assert_eq!(s.derived.get("Max dm/dt"), Some(1.0));
    }

    #[test]
    fn zero_ms_has_zero_inverse_and_negative_ms_fails() {
        let s = small_state(vec![2.0, 0.0]).unwrap();
        assert_eq!(*s.ms_inverse, vec![0.5, 0.0]);
        assert_eq!(s.spin[0], [0.0, 0.0, 1.0]);
        assert!(matches!(small_state(vec![1.0, -1.0]), Err(LlbError::Config(_))));
    }

    #[test]
    fn successor_chains_ids_and_drops_derived() {
        let s = small_state(vec![1.0]).unwrap();
        s.derived.add("x", 1.0).unwrap();
        let n = s.successor();
        assert_eq!(n.previous_state_id, s.id());
        assert_ne!(n.id(), s.id());
        assert!(!n.derived.contains("x"));
        assert!(Arc::ptr_eq(&n.ms, &s.ms));
    }

    #[test]
    fn store_evicts_oldest() {
        let store = StateStore::new(2);
        let a = Arc::new(small_state(vec![1.0]).unwrap());
        let b = Arc::new(a.successor());
        let c = Arc::new(b.successor());
        store.insert(Arc::clone(&a));
        store.insert(Arc::clone(&b));
        store.insert(Arc::clone(&c));
        assert_eq!(store.len(), 2);
        assert!(store.find(a.id()).is_none());
        assert!(store.find(c.id()).is_some());
        assert!(store.find(0).is_none());
    }

    #[test]
    fn thermal_params_attach_once() {
        let s = small_state(vec![1.0]).unwrap();
        let p = Arc::new(ThermalParams {
            stage: 0,
            temperature: 10.0,
            m_e: vec![0.9],
            chi_l: vec![1e-3],
            tc: vec![500.0],
        });
        assert!(s.attach_thermal(Arc::clone(&p)));
        assert!(!s.attach_thermal(p));
        assert_eq!(s.thermal().map(|t| t.stage), Some(0));
    }
}
