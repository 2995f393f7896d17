//! The integrator actor.
//!
//! Maintains a committed state and a tentative state. During each solver
//! round it publishes the tentative state on its output, reads the
//! derivative computed by the rest of the schedule, and applies the
//! solver's round weights to its derivative history. The tentative state
//! is committed only in `postfire`, so a rejected step can roll back by
//! restoring the committed state.
//!
//! The integrator implements both optional capabilities: it checkpoints
//! state for rollback, and it votes on step accuracy using the embedded
//! error estimate the variable-step solvers publish on their final round.

use rivulet_core::{
    Actor, CoreError, CoreResult, FiringContext, PortSpec, Stateful, StepSizeControl, Token,
};

/// Port index of the derivative input
pub const DERIVATIVE: usize = 0;

/// Port index of the state output
pub const STATE: usize = 0;

// Growth cap applied to the integrator's own step prediction; the
// director separately caps growth at ten times the current step.
const MAX_GROWTH: f64 = 5.0;
const MIN_SHRINK: f64 = 0.5;

#[derive(Debug, Clone, Copy, Default)]
struct StepPoll {
    step_size: f64,
    init_step_size: f64,
    error_tolerance: f64,
    error_estimate: f64,
    variable_step: bool,
    order: u32,
}

/// Integrates its derivative input over continuous time
pub struct Integrator {
    initial_state: f64,
    state: f64,
    tentative: f64,
    marked: f64,
    derivatives: Vec<f64>,
    last_emit_round: Option<usize>,
    last_integrate_round: Option<usize>,
    poll: StepPoll,
    successful: bool,
}

impl Integrator {
    /// Create an integrator with the given initial state
    #[must_use]
    pub fn new(initial_state: f64) -> Self {
        Self {
            initial_state,
            state: initial_state,
            tentative: initial_state,
            marked: initial_state,
            derivatives: Vec::new(),
            last_emit_round: None,
            last_integrate_round: None,
            poll: StepPoll::default(),
            successful: true,
        }
    }

    /// The committed state
    #[must_use]
    pub const fn state(&self) -> f64 {
        self.state
    }

    /// The tentative (uncommitted) state
    #[must_use]
    pub const fn tentative_state(&self) -> f64 {
        self.tentative
    }

    fn reset_round_guards(&mut self) {
        self.last_emit_round = None;
        self.last_integrate_round = None;
        self.derivatives.clear();
    }
}

impl Actor for Integrator {
    fn input_ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::new("derivative")]
    }

    fn output_ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::new("state")]
    }

    fn initialize(&mut self, _ctx: &mut FiringContext<'_>) -> CoreResult<()> {
        self.state = self.initial_state;
        self.tentative = self.initial_state;
        self.marked = self.initial_state;
        self.successful = true;
        self.poll = StepPoll::default();
        self.reset_round_guards();
        Ok(())
    }

    fn fire(&mut self, ctx: &mut FiringContext<'_>) -> CoreResult<()> {
        let Some(integration) = ctx.integration().cloned() else {
            return Err(CoreError::Internal {
                message: format!(
                    "{} fired outside a continuous integration round",
                    ctx.actor_name()
                ),
            });
        };
        let round = integration.round;

        // Publish the tentative state once per round. The schedule may
        // fire this actor again in the same pass to close the feedback
        // loop; emission must not repeat.
        if self.last_emit_round != Some(round) {
            self.last_emit_round = Some(round);
            ctx.send(STATE, Token::Double(self.tentative))?;
        }

        // Integrate once per round, as soon as the derivative is known.
        if self.last_integrate_round != Some(round) && ctx.has_input(DERIVATIVE, 0, 1) {
            self.last_integrate_round = Some(round);
            let derivative = ctx.get(DERIVATIVE, 0)?.expect_double()?;
            if !derivative.is_finite() {
                return Err(CoreError::Internal {
                    message: format!(
                        "{} received an invalid derivative: {}",
                        ctx.actor_name(),
                        derivative
                    ),
                });
            }

            if round == 0 {
                self.derivatives.clear();
            }
            self.derivatives.truncate(round);
            self.derivatives.push(derivative);

            if integration.step_size > 0.0 && !integration.history_weights.is_empty() {
                let mut weighted = 0.0;
                for (weight, k) in integration.history_weights.iter().zip(&self.derivatives) {
                    weighted += weight * k;
                }
                let next = self.state + integration.step_size * weighted;
                let delta = (next - self.tentative).abs();
                self.tentative = next;
                // Only iterative solvers read the vote; it is harmless
                // otherwise.
                ctx.vote_converged(delta <= integration.value_resolution);
            }

            if let Some(error_weights) = &integration.error_weights {
                let mut error = 0.0;
                for (weight, k) in error_weights.iter().zip(&self.derivatives) {
                    error += weight * k;
                }
                self.poll.error_estimate = (error * integration.step_size).abs();
            }

            self.poll.step_size = integration.step_size;
            self.poll.init_step_size = integration.init_step_size;
            self.poll.error_tolerance = integration.error_tolerance;
            self.poll.variable_step = integration.order.is_some();
            self.poll.order = integration.order.unwrap_or(1);
        }

        Ok(())
    }

    fn postfire(&mut self, _ctx: &mut FiringContext<'_>) -> CoreResult<bool> {
        self.state = self.tentative;
        self.reset_round_guards();
        Ok(true)
    }

    fn direct_feedthrough(&self) -> bool {
        false
    }

    fn step_size_control(&mut self) -> Option<&mut dyn StepSizeControl> {
        Some(self)
    }

    fn stateful(&mut self) -> Option<&mut dyn Stateful> {
        Some(self)
    }
}

impl StepSizeControl for Integrator {
    fn is_step_size_accurate(&mut self) -> bool {
        if !self.poll.variable_step || self.poll.step_size == 0.0 {
            self.successful = true;
        } else {
            self.successful = self.poll.error_estimate <= self.poll.error_tolerance;
        }
        self.successful
    }

    fn refined_step_size(&self) -> f64 {
        if self.successful {
            self.poll.step_size
        } else {
            0.5 * self.poll.step_size
        }
    }

    fn predicted_step_size(&self) -> f64 {
        if !self.poll.variable_step {
            // Fixed-step methods keep taking the configured initial step.
            return self.poll.init_step_size;
        }
        let step = self.poll.step_size;
        if self.poll.error_estimate <= f64::MIN_POSITIVE {
            return MAX_GROWTH * step;
        }
        let factor = 0.8
            * (self.poll.error_tolerance / self.poll.error_estimate)
                .powf(1.0 / f64::from(self.poll.order));
        step * factor.clamp(MIN_SHRINK, MAX_GROWTH)
    }
}

impl Stateful for Integrator {
    fn mark_state(&mut self) {
        self.marked = self.state;
    }

    fn go_to_marked_state(&mut self) {
        self.state = self.marked;
        self.tentative = self.marked;
        self.reset_round_guards();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rivulet_core::{FiringEnv, IntegrationStep, ModelGraph};

    fn forward_euler_step(round: usize, step_size: f64) -> IntegrationStep {
        IntegrationStep {
            round,
            step_size,
            init_step_size: 0.25,
            error_tolerance: 1e-4,
            value_resolution: 1e-6,
            history_weights: vec![1.0],
            error_weights: None,
            order: None,
        }
    }

    #[test]
    fn test_forward_euler_round_updates_tentative_state() {
        let mut g = ModelGraph::new();
        let integ = g.add_actor("integ", Box::new(Integrator::new(1.0))).unwrap();
        let (rec, tap) = rivulet_core::library::Recorder::with_tap();
        let sink = g.add_actor("sink", Box::new(rec)).unwrap();
        let out = g.connect(integ, STATE, sink, 0).unwrap();
        let feed = g.add_external_input(integ, DERIVATIVE).unwrap();

        let step = forward_euler_step(0, 0.5);
        let env = FiringEnv {
            mode: rivulet_core::ExecutionMode::Continuous,
            time: rivulet_core::ModelTime::ZERO,
            resolution: rivulet_core::TimeResolution::default(),
            integration: Some(&step),
        };

        g.inject(feed, Token::Double(-2.0)).unwrap();
        g.fire_actor(integ, &env).unwrap();
        // The firing emitted the pre-update state and then integrated
        // x = 1.0 + 0.5 * (-2.0) = 0.0 into the tentative state.
        assert_eq!(g.channel(out).unwrap().tokens(), 1);
        g.postfire_actor(integ, &env).unwrap();

        // The next round emits the committed state.
        g.reset_receivers();
        g.fire_actor(integ, &env).unwrap();
        g.postfire_actor(sink, &env).unwrap();
        let samples = tap.samples();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].token, Token::Double(0.0));
    }

    #[test]
    fn test_emission_and_integration_once_per_round() {
        let mut g = ModelGraph::new();
        let integ = g.add_actor("integ", Box::new(Integrator::new(0.0))).unwrap();
        let (rec, _tap) = rivulet_core::library::Recorder::with_tap();
        let sink = g.add_actor("sink", Box::new(rec)).unwrap();
        let out = g.connect(integ, STATE, sink, 0).unwrap();
        let feed = g.add_external_input(integ, DERIVATIVE).unwrap();

        let step = forward_euler_step(0, 0.5);
        let env = FiringEnv {
            mode: rivulet_core::ExecutionMode::Continuous,
            time: rivulet_core::ModelTime::ZERO,
            resolution: rivulet_core::TimeResolution::default(),
            integration: Some(&step),
        };

        g.inject(feed, Token::Double(1.0)).unwrap();
        g.fire_actor(integ, &env).unwrap();
        g.fire_actor(integ, &env).unwrap();
        // Two firings in the same round emit exactly one value.
        assert_eq!(g.channel(out).unwrap().tokens(), 1);
    }

    #[test]
    fn test_rollback_restores_marked_state() {
        let mut integ = Integrator::new(3.0);
        integ.mark_state();
        integ.tentative = 7.5;
        integ.state = 7.5;
        integ.go_to_marked_state();
        assert_eq!(integ.state(), 3.0);
        assert_eq!(integ.tentative_state(), 3.0);
    }

    #[test]
    fn test_fixed_step_poll_behavior() {
        let mut integ = Integrator::new(0.0);
        integ.poll = StepPoll {
            step_size: 0.5,
            init_step_size: 0.25,
            error_tolerance: 1e-4,
            error_estimate: 0.0,
            variable_step: false,
            order: 1,
        };
        assert!(integ.is_step_size_accurate());
        assert_eq!(integ.refined_step_size(), 0.5);
        assert_eq!(integ.predicted_step_size(), 0.25);
    }

    #[test]
    fn test_variable_step_poll_vetoes_on_error() {
        let mut integ = Integrator::new(0.0);
        integ.poll = StepPoll {
            step_size: 0.5,
            init_step_size: 0.25,
            error_tolerance: 1e-4,
            error_estimate: 1e-2,
            variable_step: true,
            order: 3,
        };
        assert!(!integ.is_step_size_accurate());
        assert_eq!(integ.refined_step_size(), 0.25);
        // Shrink factor is clamped below by MIN_SHRINK.
        let predicted = integ.predicted_step_size();
        assert!(predicted >= MIN_SHRINK * 0.5 - 1e-12);
        assert!(predicted < 0.5);
    }

    #[test]
    fn test_invalid_derivative_is_fatal() {
        let mut g = ModelGraph::new();
        let integ = g.add_actor("integ", Box::new(Integrator::new(0.0))).unwrap();
        let feed = g.add_external_input(integ, DERIVATIVE).unwrap();

        let step = forward_euler_step(0, 0.5);
        let env = FiringEnv {
            mode: rivulet_core::ExecutionMode::Continuous,
            time: rivulet_core::ModelTime::ZERO,
            resolution: rivulet_core::TimeResolution::default(),
            integration: Some(&step),
        };
        g.inject(feed, Token::Double(f64::NAN)).unwrap();
        let err = g.fire_actor(integ, &env).unwrap_err();
        assert!(matches!(err, CoreError::Internal { .. }));
    }
}
