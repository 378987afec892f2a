// src/driver.rs
//
// Two-lattice stage driver.
//
// Problem status machine:
//
//   StageStart -> InsideStage -> ... -> StageEnd -> StageStart -> ... -> Done
//
// StageEnd builds the first pair of the next stage and falls straight through
// to StageStart. Every pair that becomes current gets its status recorded as
// "Problem Status" derived data on both states.
//
// Stage limits (checked on lattice 1, the two lattices step together):
//  - total_iteration_limit (0 = none) ends stage and run
//  - stage_iteration_limit per stage, last entry repeats (0 = none)
//  - stopping_time per stage, last entry repeats (0 = none); the step that
//    would overshoot is clipped to land on the boundary

use serde::{Deserialize, Serialize};

use crate::error::{LlbError, Result};
use crate::evolver::{LlbEulerEvolver, StepHooks, StepOutcome};
use crate::params::EPS;
use crate::state::{LatticePair, SimState};

pub const PROBLEM_STATUS: &str = "Problem Status";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProblemStatus {
    StageStart,
    InsideStage,
    StageEnd,
    Done,
}

impl ProblemStatus {
    /// Numeric code stored in derived data.
    pub fn code(self) -> f64 {
        match self {
            ProblemStatus::StageStart => 0.0,
            ProblemStatus::InsideStage => 1.0,
            ProblemStatus::StageEnd => 2.0,
            ProblemStatus::Done => 3.0,
        }
    }

    pub fn from_code(code: f64) -> Option<Self> {
        match code as i64 {
            0 => Some(ProblemStatus::StageStart),
            1 => Some(ProblemStatus::InsideStage),
            2 => Some(ProblemStatus::StageEnd),
            3 => Some(ProblemStatus::Done),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    Step,
    StageDone,
    RunDone,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DriverSettings {
    /// Iterations per stage; last entry repeats, 0 = no limit.
    pub stage_iteration_limit: Vec<u64>,
    /// 0 = no limit.
    pub total_iteration_limit: u64,
    /// 0 = unbounded.
    pub number_of_stages: u32,
    /// Stage duration (s); last entry repeats, 0 = no limit.
    pub stopping_time: Vec<f64>,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            stage_iteration_limit: vec![0],
            total_iteration_limit: 0,
            number_of_stages: 1,
            stopping_time: vec![0.0],
        }
    }
}

impl DriverSettings {
    pub fn validate(&self) -> Result<()> {
        if let Some(t) = self.stopping_time.iter().find(|t| !(**t >= 0.0) || !t.is_finite()) {
            return Err(LlbError::config(format!("invalid stopping_time {}: must be >= 0", t)));
        }
        let stage_bounded = self.stage_iteration_limit.last().copied().unwrap_or(0) > 0
            || self.stopping_time.last().copied().unwrap_or(0.0) > 0.0;
        let stages_end = self.number_of_stages > 0 && stage_bounded;
        if self.total_iteration_limit == 0 && !stages_end {
            return Err(LlbError::config(
                "no stopping criterion: set total_iteration_limit, or number_of_stages with a stage iteration limit or stopping time",
            ));
        }
        Ok(())
    }

    fn stage_limit(&self, stage: u32) -> u64 {
        pick(&self.stage_iteration_limit, stage).unwrap_or(0)
    }
}

fn pick<T: Copy>(list: &[T], stage: u32) -> Option<T> {
    if list.is_empty() {
        return None;
    }
    Some(list[(stage as usize).min(list.len() - 1)])
}

/// Per-stage stopping time: step clipping and the time-based stage criterion.
#[derive(Debug, Clone, PartialEq)]
pub struct StageClock {
    stopping_time: Vec<f64>,
}

impl StageClock {
    pub fn new(stopping_time: Vec<f64>) -> Self {
        Self { stopping_time }
    }

    pub fn stopping_time(&self, stage: u32) -> f64 {
        pick(&self.stopping_time, stage).unwrap_or(0.0)
    }

    pub fn is_stage_done(&self, state: &SimState) -> bool {
        let stop = self.stopping_time(state.stage_number);
        stop > 0.0 && state.stage_elapsed_time >= stop * (1.0 - 16.0 * EPS)
    }
}

impl StepHooks for StageClock {
    fn fill_state_supplemental(&self, work: &mut SimState) {
        let stop = self.stopping_time(work.stage_number);
        if stop <= 0.0 {
            return;
        }
        let start = work.stage_elapsed_time - work.last_timestep;
        let remaining = stop - start;
        if remaining > 0.0 && remaining <= work.last_timestep {
            work.last_timestep = remaining;
            work.stage_elapsed_time = stop;
        }
    }
}

/// Attempt bookkeeping across `run` calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepInfo {
    pub total_attempt_count: u64,
    pub current_attempt_count: u64,
    pub rejected_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunReport {
    pub accepted_steps: u64,
    pub rejected_steps: u64,
    pub stages_completed: u32,
    pub final_time: f64,
}

pub struct TwoLatticeDriver {
    settings: DriverSettings,
    clock: StageClock,
    evolver: LlbEulerEvolver,
    current: LatticePair,
    status: ProblemStatus,
    step_info: StepInfo,
}

impl TwoLatticeDriver {
    pub fn new(settings: DriverSettings, evolver: LlbEulerEvolver, initial: LatticePair) -> Result<Self> {
        settings.validate()?;
        let status = match (
            initial.one.derived.get(PROBLEM_STATUS),
            initial.two.derived.get(PROBLEM_STATUS),
        ) {
            (Some(a), Some(_)) => ProblemStatus::from_code(a)
                .ok_or_else(|| LlbError::invariant(format!("unknown problem status code {}", a)))?,
            _ => ProblemStatus::StageStart,
        };
        evolver.store().insert_pair(&initial);
        Ok(Self {
            clock: StageClock::new(settings.stopping_time.clone()),
            settings,
            evolver,
            current: initial,
            status,
            step_info: StepInfo::default(),
        })
    }

    pub fn current(&self) -> &LatticePair {
        &self.current
    }

    pub fn status(&self) -> ProblemStatus {
        self.status
    }

    pub fn step_info(&self) -> StepInfo {
        self.step_info
    }

    pub fn evolver(&self) -> &LlbEulerEvolver {
        &self.evolver
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    pub fn is_stage_done(&self, pair: &LatticePair) -> bool {
        let (s1, s2) = (&pair.one, &pair.two);
        let total = self.settings.total_iteration_limit;
        if total > 0 && (s1.iteration_count >= total || s2.iteration_count >= total) {
            return true;
        }
        let stop = self.settings.stage_limit(s1.stage_number);
        if stop > 0 && s1.stage_iteration_count + 1 >= stop {
            return true;
        }
        self.clock.is_stage_done(s1)
    }

    pub fn is_run_done(&self, pair: &LatticePair) -> bool {
        let (s1, s2) = (&pair.one, &pair.two);
        let total = self.settings.total_iteration_limit;
        if total > 0 && (s1.iteration_count >= total || s2.iteration_count >= total) {
            return true;
        }
        let n = self.settings.number_of_stages;
        n > 0 && (s1.stage_number >= n || (s1.stage_number + 1 == n && self.is_stage_done(pair)))
    }

    /// First state of `stage`, chained to `old`.
    pub fn fill_new_stage_state(&self, old: &SimState, stage: u32) -> SimState {
        let mut s = old.successor();
        s.stage_number = stage;
        s.stage_iteration_count = 0;
        s.stage_start_time = old.total_time();
        s.stage_elapsed_time = 0.0;
        s.temperature = self.evolver.settings().stage_temperature(stage);
        s
    }

    /// Advance by at most one accepted step (two attempts) or one stage
    /// transition. Returns the events that happened.
    pub fn run(&mut self) -> Result<Vec<RunEvent>> {
        const MAX_STEPS: u32 = 1;
        const ALLOWED_STEP_CALLS: u32 = 2;

        let mut step_events = 0;
        let mut stage_events = 0;
        let mut done_event = 0;
        let mut step_calls = 0;

        while step_events < MAX_STEPS && step_calls < ALLOWED_STEP_CALLS && self.status != ProblemStatus::Done {
            let mut step_taken = false;
            match self.status {
                ProblemStatus::InsideStage => {
                    match self.evolver.step(&self.clock, &self.current)? {
                        StepOutcome::Accepted(next) => {
                            self.evolver.store().insert_pair(&next);
                            self.current = next;
                            step_taken = true;
                            self.step_info.current_attempt_count = 0;
                        }
                        StepOutcome::Rejected { .. } => {
                            self.step_info.current_attempt_count += 1;
                            self.step_info.rejected_count += 1;
                        }
                    }
                    self.step_info.total_attempt_count += 1;
                    step_calls += 1;
                }
                ProblemStatus::StageEnd | ProblemStatus::StageStart => {
                    if self.status == ProblemStatus::StageEnd {
                        let stage = self.current.one.stage_number + 1;
                        let one = self.fill_new_stage_state(&self.current.one, stage);
                        let two = self.fill_new_stage_state(&self.current.two, stage);
                        let next = LatticePair::new(one, two)?;
                        log::info!(
                            "[driver] stage {} -> {} at t = {:e} s (T = {} K)",
                            stage - 1,
                            stage,
                            next.one.stage_start_time,
                            next.one.temperature
                        );
                        self.evolver.store().insert_pair(&next);
                        self.current = next;
                    }
                    step_taken = true;
                    self.step_info.total_attempt_count += 1;
                    self.step_info.current_attempt_count = 0;
                }
                ProblemStatus::Done => {
                    return Err(LlbError::invariant("invalid problem status inside run loop"));
                }
            }

            if step_taken {
                step_events += 1;
                self.status = ProblemStatus::InsideStage;
                if self.is_stage_done(&self.current) {
                    stage_events += 1;
                    self.status = ProblemStatus::StageEnd;
                    if self.is_run_done(&self.current) {
                        done_event += 1;
                        self.status = ProblemStatus::Done;
                    }
                }
                let code = self.status.code();
                for state in [&self.current.one, &self.current.two] {
                    match state.derived.get(PROBLEM_STATUS) {
                        None => state.derived.add(PROBLEM_STATUS, code)?,
                        Some(old) if old == code => {}
                        Some(old) => {
                            return Err(LlbError::invariant(format!(
                                "problem status already set on {} state {}; old value {}, new value {}",
                                state.lattice.label(),
                                state.id(),
                                old,
                                code
                            )));
                        }
                    }
                }
            }
        }

        let mut events = Vec::new();
        if step_events > 0 {
            events.push(RunEvent::Step);
        }
        if stage_events > 0 {
            events.push(RunEvent::StageDone);
        }
        if done_event > 0 {
            events.push(RunEvent::RunDone);
        }
        Ok(events)
    }

    /// Call `run` until the problem is done, handing every event batch to
    /// `observer` together with the current pair.
    pub fn run_to_completion<F>(&mut self, mut observer: F) -> Result<RunReport>
    where
        F: FnMut(&LatticePair, &[RunEvent]) -> Result<()>,
    {
        let start_iteration = self.current.one.iteration_count;
        let start_rejected = self.step_info.rejected_count;
        let mut stages_completed = 0;
        while self.status != ProblemStatus::Done {
            let events = self.run()?;
            if events.contains(&RunEvent::StageDone) {
                stages_completed += 1;
            }
            if !events.is_empty() {
                observer(&self.current, &events)?;
            }
        }
        Ok(RunReport {
            accepted_steps: self.current.one.iteration_count - start_iteration,
            rejected_steps: self.step_info.rejected_count - start_rejected,
            stages_completed,
            final_time: self.current.one.total_time(),
        })
    }
}
