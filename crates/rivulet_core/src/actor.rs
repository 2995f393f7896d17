//! The actor execution contract and optional capabilities.
//!
//! Directors drive actors through the `prefire`/`fire`/`postfire` contract.
//! Capabilities a director may need beyond that contract (step-size
//! control, state checkpointing) are separate traits an actor opts into by
//! returning `Some` from the corresponding accessor, never by runtime type
//! inspection.

use serde::{Deserialize, Serialize};

use crate::error::CoreResult;
use crate::graph::FiringContext;
use crate::receiver::Rate;

/// Declared port of an actor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    /// Port name, used in diagnostics
    pub name: String,
    /// Declared consumption rate (inputs) or production rate (outputs)
    pub rate: Rate,
}

impl PortSpec {
    /// A port with the default rate of one token per firing
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rate: Rate::default(),
        }
    }

    /// Set the declared rate
    #[must_use]
    pub fn with_rate(mut self, rate: Rate) -> Self {
        self.rate = rate;
        self
    }
}

/// Per-round integration data handed to integrating actors
///
/// The director's ODE solver publishes, for each solver round, the weights
/// an integrating actor applies to its stored derivative history. The final
/// round of a variable-step method additionally carries embedded error
/// weights and the method order used for accuracy checks and step
/// prediction. Fixed-step methods carry no error weights and no order.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrationStep {
    /// Solver round index within the current integration attempt
    pub round: usize,
    /// The step size being attempted, in seconds
    pub step_size: f64,
    /// The configured initial step size (fixed-step prediction target)
    pub init_step_size: f64,
    /// Local truncation error tolerance
    pub error_tolerance: f64,
    /// Convergence resolution for implicit fixed-point rounds
    pub value_resolution: f64,
    /// Weights over the derivative history for this round's state update;
    /// empty when the round only evaluates a derivative
    pub history_weights: Vec<f64>,
    /// Embedded error-estimate weights, present on the final round of
    /// variable-step methods
    pub error_weights: Option<Vec<f64>>,
    /// Order of the integration method (`None` for fixed-step methods)
    pub order: Option<u32>,
}

/// An executable actor
///
/// All methods receive an explicit [`FiringContext`] scoped to the actor's
/// own ports; an actor never sees the rest of the model.
pub trait Actor {
    /// Declared input ports, in channel-index order
    fn input_ports(&self) -> Vec<PortSpec> {
        Vec::new()
    }

    /// Declared output ports, in channel-index order
    fn output_ports(&self) -> Vec<PortSpec> {
        Vec::new()
    }

    /// One-time setup before execution begins
    ///
    /// # Errors
    ///
    /// Returns an error if the actor cannot be initialized.
    fn initialize(&mut self, ctx: &mut FiringContext<'_>) -> CoreResult<()> {
        let _ = ctx;
        Ok(())
    }

    /// Return true if the actor is ready to fire
    ///
    /// # Errors
    ///
    /// Returns an error on a fatal condition; "not ready" is `Ok(false)`.
    fn prefire(&mut self, ctx: &mut FiringContext<'_>) -> CoreResult<bool> {
        let _ = ctx;
        Ok(true)
    }

    /// Read inputs and produce outputs
    ///
    /// # Errors
    ///
    /// Returns an error on a fatal condition (missing token, capacity).
    fn fire(&mut self, ctx: &mut FiringContext<'_>) -> CoreResult<()>;

    /// Commit state; return false to stop being fired permanently
    ///
    /// # Errors
    ///
    /// Returns an error on a fatal condition.
    fn postfire(&mut self, ctx: &mut FiringContext<'_>) -> CoreResult<bool> {
        let _ = ctx;
        Ok(true)
    }

    /// True if an output at time t can depend on an input at time t
    ///
    /// Integrating actors return false: their output is determined by
    /// history, which is what lets the scheduler break feedback loops.
    fn direct_feedthrough(&self) -> bool {
        true
    }

    /// Step-size-control capability, if the actor has one
    fn step_size_control(&mut self) -> Option<&mut dyn StepSizeControl> {
        None
    }

    /// State checkpoint capability, if the actor has one
    fn stateful(&mut self) -> Option<&mut dyn Stateful> {
        None
    }
}

/// Capability of vetoing an integration step and suggesting a smaller one
pub trait StepSizeControl {
    /// Whether the step just integrated met this actor's accuracy demands
    ///
    /// Called exactly once per integration attempt, after the solver
    /// rounds complete. Event-generating actors use this call to detect
    /// events, so a director must poll every control actor even after one
    /// has already voted inaccurate.
    fn is_step_size_accurate(&mut self) -> bool;

    /// A smaller step size to retry with after an inaccurate step
    fn refined_step_size(&self) -> f64;

    /// Predicted comfortable step size for the next iteration
    fn predicted_step_size(&self) -> f64;
}

/// Capability of checkpointing and restoring internal state for rollback
pub trait Stateful {
    /// Record the current state as the rollback checkpoint
    fn mark_state(&mut self);

    /// Restore the state recorded by the last [`Stateful::mark_state`]
    fn go_to_marked_state(&mut self);
}
