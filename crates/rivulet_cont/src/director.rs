//! The continuous-time director.
//!
//! Owns the adaptive-step integration loop: each iteration picks a
//! candidate step size, clips it against the breakpoint table so the step
//! lands exactly on the earliest pending breakpoint, drives the ODE solver
//! through its rounds, then polls every step-size-control actor for
//! accuracy. An inaccurate step rolls the model time back to the start of
//! the iteration, restores every stateful actor, and retries with the
//! minimum of the refinements the control actors suggest. A refined step
//! that falls below half the time resolution is clamped to exactly the
//! resolution once; a second consecutive failure is unrecoverable.

use std::time::Instant;

use tracing::{debug, trace};

use rivulet_core::{CoreError, ExecutionMode, FiringEnv, ModelGraph, ModelTime, TimeResolution};

use crate::breakpoints::BreakpointTable;
use crate::config::ContConfig;
use crate::scheduler::{ContScheduler, Schedule, SchedulerError};
use crate::solver::OdeSolver;

// Real-time synchronization tolerates this much wall-clock slack before
// sleeping.
const REAL_TIME_SLACK_MS: u64 = 20;

/// Continuous-time director error
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContError {
    /// The model is structurally unschedulable
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// The refined step size fell below the time resolution twice in a row
    #[error("refined step size fell below the time resolution at model time {time_seconds}s")]
    StepSizeTooSmall {
        /// Model time at which refinement failed, in seconds
        time_seconds: f64,
    },

    /// Configuration or actor failure
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Drives a model graph through adaptive-step continuous-time execution
pub struct ContDirector {
    config: ContConfig,
    resolution: TimeResolution,
    embedded: bool,

    current_time: ModelTime,
    start_time: ModelTime,
    stop_time: ModelTime,
    iteration_begin: ModelTime,
    iteration_end: ModelTime,

    current_step: f64,
    suggested_next: f64,
    tried_minimum_step: bool,
    discrete_phase: bool,

    breakpoints: BreakpointTable,
    solver: OdeSolver,
    schedule_cache: Option<(u64, Schedule)>,

    stop_requested: bool,
    pending_refire: Option<ModelTime>,
    wall_base: Option<Instant>,
}

impl ContDirector {
    /// Create a director from a validated configuration
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid [`ContConfig`].
    pub fn new(config: ContConfig, embedded: bool) -> Result<Self, ContError> {
        config.validate()?;
        let resolution = TimeResolution::new(config.time_resolution())?;
        let start_time = resolution.time_from_seconds(config.start_time());
        let stop_time = resolution.time_from_seconds(config.stop_time());
        let solver_kind = config.solver();
        let init_step = config.init_step_size();

        Ok(Self {
            config,
            resolution,
            embedded,
            current_time: start_time,
            start_time,
            stop_time,
            iteration_begin: start_time,
            iteration_end: stop_time,
            current_step: init_step,
            suggested_next: init_step,
            tried_minimum_step: false,
            discrete_phase: true,
            breakpoints: BreakpointTable::new(),
            solver: OdeSolver::new(solver_kind),
            schedule_cache: None,
            stop_requested: false,
            pending_refire: None,
            wall_base: None,
        })
    }

    /// The configuration in effect
    #[must_use]
    pub const fn config(&self) -> &ContConfig {
        &self.config
    }

    /// Current model time
    #[must_use]
    pub const fn current_time(&self) -> ModelTime {
        self.current_time
    }

    /// Current model time in seconds
    #[must_use]
    pub fn current_time_seconds(&self) -> f64 {
        self.resolution.seconds(self.current_time)
    }

    /// The step size of the iteration in progress (or just committed)
    #[must_use]
    pub const fn current_step_size(&self) -> f64 {
        self.current_step
    }

    /// The predicted step size for the next iteration
    #[must_use]
    pub const fn suggested_next_step_size(&self) -> f64 {
        self.suggested_next
    }

    /// Begin time of the in-progress integration attempt
    #[must_use]
    pub const fn iteration_begin_time(&self) -> ModelTime {
        self.iteration_begin
    }

    /// End time of the in-progress integration attempt
    #[must_use]
    pub const fn iteration_end_time(&self) -> ModelTime {
        self.iteration_end
    }

    /// True while processing a breakpoint exactly at the current time
    #[must_use]
    pub const fn is_discrete_phase(&self) -> bool {
        self.discrete_phase
    }

    /// Number of pending breakpoints
    #[must_use]
    pub fn breakpoint_count(&self) -> usize {
        self.breakpoints.len()
    }

    /// Request cooperative cancellation; polled at round boundaries
    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    /// The refire request surfaced to an enclosing director, if any
    pub fn take_refire_request(&mut self) -> Option<ModelTime> {
        self.pending_refire.take()
    }

    /// Register a breakpoint on behalf of `requester`
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::FireAtInPast`] if `time` is earlier than the
    /// current model time.
    pub fn fire_at(&mut self, requester: &str, time: ModelTime) -> Result<(), ContError> {
        trace!(requester, %time, "breakpoint requested");
        self.breakpoints
            .insert(requester, self.current_time, time)?;
        Ok(())
    }

    /// Register a breakpoint given in seconds
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::FireAtInPast`] if the time is in the past.
    pub fn fire_at_seconds(&mut self, requester: &str, seconds: f64) -> Result<(), ContError> {
        self.fire_at(requester, self.resolution.time_from_seconds(seconds))
    }

    /// Prepare the model for execution
    ///
    /// Computes (and thereby validates) the schedule, initializes every
    /// scheduled actor, registers the stop time as a breakpoint, and
    /// checkpoints the initial state of every stateful actor.
    ///
    /// # Errors
    ///
    /// Returns a scheduler error for an unschedulable model, or an actor
    /// initialization failure.
    pub fn initialize(&mut self, graph: &mut ModelGraph) -> Result<(), ContError> {
        self.current_time = self.start_time;
        self.iteration_begin = self.start_time;
        self.iteration_end = self.stop_time;
        self.current_step = self.config.init_step_size();
        self.suggested_next = self.config.init_step_size();
        self.tried_minimum_step = false;
        self.discrete_phase = true;
        self.stop_requested = false;
        self.pending_refire = None;
        self.breakpoints.clear();
        self.solver.reset();
        self.wall_base = Some(Instant::now());

        // Structural errors surface here, before any actor runs.
        let schedule = self.schedule(graph)?;

        let env = self.env();
        for id in schedule.unique_actors() {
            graph.initialize_actor(id, &env)?;
        }
        self.drain_fire_requests(graph)?;

        // The stop time is an ordinary breakpoint registered through the
        // same path actors use.
        if !self.stop_time.is_infinite() {
            self.fire_at("director", self.stop_time)?;
        }

        self.mark_states(graph, &schedule);
        debug!(
            start = self.resolution.seconds(self.start_time),
            stop = self.resolution.seconds(self.stop_time),
            solver = %self.solver.kind(),
            "continuous model initialized"
        );
        Ok(())
    }

    /// Record the iteration begin time; true if ready to fire
    ///
    /// # Errors
    ///
    /// Not returned by this director; the signature matches the contract.
    pub fn prefire(&mut self, _graph: &mut ModelGraph) -> Result<bool, ContError> {
        self.iteration_begin = self.current_time;
        Ok(!self.stop_requested && self.current_time <= self.stop_time)
    }

    /// Execute one integration iteration, retrying until accurate
    ///
    /// # Errors
    ///
    /// Returns [`ContError::StepSizeTooSmall`] when refinement falls below
    /// the time resolution twice consecutively, or any actor failure.
    pub fn fire(&mut self, graph: &mut ModelGraph) -> Result<(), ContError> {
        let schedule = self.schedule(graph)?;

        // Candidate step: last iteration's prediction, clipped against the
        // breakpoint table.
        let candidate = self.suggested_next;
        let clipped = self.refine_step_wrt_breakpoints(candidate);
        self.set_current_step(clipped);
        debug!(
            time = self.resolution.seconds(self.current_time),
            step = self.current_step,
            "executing iteration"
        );

        loop {
            if self.stop_requested {
                break;
            }

            self.resolve_states(graph, &schedule)?;
            self.current_time = self.iteration_end;

            if self.is_step_size_accurate(graph, &schedule) {
                break;
            }

            let refined = self.refined_step_size(graph, &schedule)?;
            debug!(refined, "step rejected, rolling back");
            self.set_current_step(refined);
            self.current_time = self.iteration_begin;
            self.restore_states(graph, &schedule);
        }

        Ok(())
    }

    /// Commit the iteration
    ///
    /// Postfires the actors, checkpoints stateful actors, optionally
    /// synchronizes to real time, predicts the next step size, and decides
    /// whether execution continues.
    ///
    /// # Errors
    ///
    /// Returns actor postfire failures.
    pub fn postfire(&mut self, graph: &mut ModelGraph) -> Result<bool, ContError> {
        let schedule = self.schedule(graph)?;

        let env = self.env();
        for id in schedule.unique_actors() {
            if graph.is_disabled(id) {
                continue;
            }
            if !graph.postfire_actor(id, &env)? {
                debug!(actor = graph.actor_name(id).unwrap_or("<unknown>"), "actor disabled");
                graph.disable(id);
            }
        }
        self.drain_fire_requests(graph)?;

        self.mark_states(graph, &schedule);
        self.synchronize_to_real_time();

        // Stop when the stop time has been reached and no event remains
        // scheduled exactly there.
        if self.current_time == self.stop_time && !self.breakpoints.contains(self.current_time) {
            return Ok(false);
        }

        self.suggested_next = self.predict_next_step_size(graph, &schedule);

        if self.embedded && !self.breakpoints.is_empty() {
            self.pending_refire = self.breakpoints.remove_first();
        }

        Ok(!self.stop_requested)
    }

    /// Run to completion: initialize, then iterate until postfire stops
    ///
    /// # Errors
    ///
    /// Propagates any initialization or iteration error.
    pub fn run(&mut self, graph: &mut ModelGraph) -> Result<(), ContError> {
        self.initialize(graph)?;
        while !self.stop_requested {
            if !self.prefire(graph)? {
                break;
            }
            self.fire(graph)?;
            if !self.postfire(graph)? {
                break;
            }
        }
        Ok(())
    }

    // ---- step-size machinery -------------------------------------------

    /// Clip a candidate step against the breakpoint table
    ///
    /// A breakpoint exactly at the current time is consumed and forces a
    /// zero step (the discrete phase of processing that breakpoint); a
    /// breakpoint inside the candidate step shrinks it so the iteration
    /// ends exactly there.
    fn refine_step_wrt_breakpoints(&mut self, candidate: f64) -> f64 {
        let mut step = candidate;
        if let Some(first) = self.breakpoints.first() {
            let maximum_allowed = self.resolution.seconds_between(self.current_time, first);
            if first == self.current_time {
                trace!(at = self.resolution.seconds(first), "consuming breakpoint");
                self.breakpoints.remove_first();
            }
            if step > maximum_allowed {
                step = maximum_allowed;
            }
        }
        self.discrete_phase = step == 0.0;
        step
    }

    /// Set the current step size and recompute the iteration end together
    fn set_current_step(&mut self, step: f64) {
        self.current_step = step;
        self.iteration_end = self.resolution.add_seconds(self.iteration_begin, step);
    }

    /// Drive the solver through its rounds for the current step
    fn resolve_states(
        &mut self,
        graph: &mut ModelGraph,
        schedule: &Schedule,
    ) -> Result<(), ContError> {
        self.solver.reset();

        while !self.solver.converged() && self.solver.resolved_states(self.config.max_iterations())
        {
            if self.stop_requested {
                break;
            }

            let fraction = self.solver.time_fraction();
            self.current_time = self
                .resolution
                .add_seconds(self.iteration_begin, fraction * self.current_step);

            let integration = self.solver.integration_step(
                self.current_step,
                self.config.init_step_size(),
                self.config.error_tolerance(),
                self.config.value_resolution(),
            );

            graph.reset_receivers();
            graph.reset_converged_vote();

            let env = FiringEnv {
                mode: ExecutionMode::Continuous,
                time: self.current_time,
                resolution: self.resolution,
                integration: Some(&integration),
            };
            for &id in &schedule.firings {
                if self.stop_requested || graph.is_disabled(id) {
                    continue;
                }
                if graph.prefire_actor(id, &env)? {
                    graph.fire_actor(id, &env)?;
                }
            }

            let votes = graph.converged_vote();
            self.drain_fire_requests(graph)?;
            self.solver.advance_round(votes);
        }

        Ok(())
    }

    /// Poll every step-size-control actor; all are asked even after one
    /// reports inaccurate, because event generators detect events in this
    /// poll
    fn is_step_size_accurate(&mut self, graph: &mut ModelGraph, schedule: &Schedule) -> bool {
        if self.current_step == 0.0 {
            return true;
        }

        let mut accurate = true;
        for id in schedule.unique_actors() {
            if self.stop_requested {
                break;
            }
            if let Some(control) = graph.step_size_control(id) {
                let this_accurate = control.is_step_size_accurate();
                trace!(actor = id.0, accurate = this_accurate, "accuracy poll");
                accurate = accurate && this_accurate;
            }
        }
        accurate
    }

    /// The minimum of the control actors' refined step sizes, with the
    /// twice-below-resolution escalation
    fn refined_step_size(
        &mut self,
        graph: &mut ModelGraph,
        schedule: &Schedule,
    ) -> Result<f64, ContError> {
        let time_resolution = self.resolution.seconds_per_tick();
        let mut refined = self.current_step;

        for id in schedule.unique_actors() {
            if self.stop_requested {
                break;
            }
            if let Some(control) = graph.step_size_control(id) {
                refined = refined.min(control.refined_step_size());
            }
        }

        if refined < 0.5 * time_resolution {
            if self.tried_minimum_step {
                return Err(ContError::StepSizeTooSmall {
                    time_seconds: self.resolution.seconds(self.current_time),
                });
            }
            // One chance at exactly the resolution before giving up.
            refined = time_resolution;
            self.tried_minimum_step = true;
        } else {
            self.tried_minimum_step = false;
        }

        Ok(refined)
    }

    /// Predict the next step: ten times the current step, clipped by every
    /// control actor's prediction and the maximum step size; the initial
    /// step size escapes a zero-step stall
    fn predict_next_step_size(&mut self, graph: &mut ModelGraph, schedule: &Schedule) -> f64 {
        if self.current_step == 0.0 {
            return self.config.init_step_size();
        }

        let mut predicted = 10.0 * self.current_step;
        for id in schedule.unique_actors() {
            if self.stop_requested {
                break;
            }
            if let Some(control) = graph.step_size_control(id) {
                predicted = predicted.min(control.predicted_step_size());
            }
        }
        predicted.clamp(0.0, self.config.max_step_size())
    }

    // ---- state checkpointing -------------------------------------------

    fn mark_states(&mut self, graph: &mut ModelGraph, schedule: &Schedule) {
        for id in schedule.unique_actors() {
            if let Some(stateful) = graph.stateful(id) {
                stateful.mark_state();
            }
        }
    }

    fn restore_states(&mut self, graph: &mut ModelGraph, schedule: &Schedule) {
        for id in schedule.unique_actors() {
            if self.stop_requested {
                break;
            }
            if let Some(stateful) = graph.stateful(id) {
                trace!(actor = id.0, "restoring state");
                stateful.go_to_marked_state();
            }
        }
    }

    // ---- support -------------------------------------------------------

    fn schedule(&mut self, graph: &ModelGraph) -> Result<Schedule, ContError> {
        let version = graph.version();
        if let Some((cached_version, schedule)) = &self.schedule_cache {
            if *cached_version == version {
                return Ok(schedule.clone());
            }
        }
        let schedule = ContScheduler::compute(graph)?;
        debug!(firings = schedule.firings.len(), "schedule recomputed");
        self.schedule_cache = Some((version, schedule.clone()));
        Ok(schedule)
    }

    fn env(&self) -> FiringEnv<'static> {
        FiringEnv {
            mode: ExecutionMode::Continuous,
            time: self.current_time,
            resolution: self.resolution,
            integration: None,
        }
    }

    fn drain_fire_requests(&mut self, graph: &mut ModelGraph) -> Result<(), ContError> {
        for time in graph.take_fire_requests() {
            self.breakpoints.insert("model", self.current_time, time)?;
        }
        Ok(())
    }

    /// Sleep until wall-clock time catches up with model time, when
    /// configured; the sole blocking point in the kernel
    fn synchronize_to_real_time(&mut self) {
        if !self.config.synchronize_to_real_time() {
            return;
        }
        let Some(base) = self.wall_base else {
            return;
        };
        let elapsed_ms = base.elapsed().as_millis() as i64;
        let model_ms =
            (self.resolution.seconds_between(self.start_time, self.current_time) * 1000.0) as i64;
        let surplus = model_ms - elapsed_ms;
        if surplus > REAL_TIME_SLACK_MS as i64 {
            trace!(surplus_ms = surplus, "sleeping to track real time");
            std::thread::sleep(std::time::Duration::from_millis(
                (surplus - REAL_TIME_SLACK_MS as i64) as u64,
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::SolverKind;

    fn quarter_step_config() -> ContConfig {
        let mut config = ContConfig::default();
        config.set_stop_time(1.0).unwrap();
        config.set_init_step_size(0.25).unwrap();
        config.set_solver(SolverKind::ForwardEuler);
        config
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = ContConfig::default();
        config.set_min_step_size(5.0).unwrap();
        assert!(ContDirector::new(config, false).is_err());
    }

    #[test]
    fn test_initialize_registers_stop_breakpoint() {
        let mut graph = ModelGraph::new();
        let mut director = ContDirector::new(quarter_step_config(), false).unwrap();
        director.initialize(&mut graph).unwrap();
        assert_eq!(director.breakpoint_count(), 1);
    }

    #[test]
    fn test_unbounded_stop_time_registers_nothing() {
        let mut graph = ModelGraph::new();
        let mut config = ContConfig::default();
        config.set_solver(SolverKind::ForwardEuler);
        let mut director = ContDirector::new(config, false).unwrap();
        director.initialize(&mut graph).unwrap();
        assert_eq!(director.breakpoint_count(), 0);
    }

    #[test]
    fn test_step_clipping_is_exact() {
        let mut graph = ModelGraph::new();
        let mut director = ContDirector::new(quarter_step_config(), false).unwrap();
        director.initialize(&mut graph).unwrap();
        director.fire_at_seconds("test", 0.6).unwrap();

        // Advance to t = 0.5 manually, then clip 0.25 against 0.6.
        director.current_time = director.resolution.time_from_seconds(0.5);
        director.iteration_begin = director.current_time;
        let clipped = director.refine_step_wrt_breakpoints(0.25);
        assert!((clipped - 0.1).abs() < 1e-12);
        // The table still holds the breakpoint: only a breakpoint at the
        // current time is consumed.
        assert_eq!(director.breakpoint_count(), 2);
    }

    #[test]
    fn test_breakpoint_at_current_time_consumed_and_forces_zero_step() {
        let mut graph = ModelGraph::new();
        let mut director = ContDirector::new(quarter_step_config(), false).unwrap();
        director.initialize(&mut graph).unwrap();
        director.fire_at_seconds("test", 0.0).unwrap();

        let clipped = director.refine_step_wrt_breakpoints(0.25);
        assert_eq!(clipped, 0.0);
        assert!(director.is_discrete_phase());
        // Only the stop-time breakpoint remains.
        assert_eq!(director.breakpoint_count(), 1);
    }

    #[test]
    fn test_fire_at_in_past_rejected() {
        let mut graph = ModelGraph::new();
        let mut director = ContDirector::new(quarter_step_config(), false).unwrap();
        director.initialize(&mut graph).unwrap();
        director.current_time = director.resolution.time_from_seconds(0.5);
        assert!(director.fire_at_seconds("test", 0.4).is_err());
    }

    #[test]
    fn test_embedded_director_surfaces_refire_request() {
        let mut graph = ModelGraph::new();
        let mut director = ContDirector::new(quarter_step_config(), true).unwrap();
        director.initialize(&mut graph).unwrap();
        director.prefire(&mut graph).unwrap();
        director.fire(&mut graph).unwrap();
        let more = director.postfire(&mut graph).unwrap();
        assert!(more);
        // The stop-time breakpoint was forwarded outward.
        assert_eq!(director.take_refire_request().map(|t| director.resolution.seconds(t)), Some(1.0));
        assert_eq!(director.take_refire_request(), None);
    }
}
