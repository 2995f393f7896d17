//! ODE solvers for the continuous-time director.
//!
//! The solver is a closed set of variants selected at configuration time
//! and dispatched through [`OdeSolver`]; there is no open registry. A
//! solver resolves the state at the end of an integration step over a
//! sequence of rounds. Each round advances the model time to a fraction of
//! the step, publishes the weights integrating actors apply to their
//! derivative history, and (for variable-step methods) an embedded error
//! estimate on the final round.
//!
//! Fixed-step methods (forward and backward Euler) always report the step
//! accurate and predict the configured initial step size; the variable-step
//! Runge-Kutta pairs drive the director's accuracy-gated retry loop.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use rivulet_core::IntegrationStep;

// Bogacki-Shampine 2(3) pair. Rounds evaluate the derivative at fractions
// C of the step; round r's weights produce the stage value the next round
// fires the schedule with. The final round only evaluates the derivative
// used by the embedded error estimate.
const RK23_C: [f64; 4] = [0.0, 0.5, 0.75, 1.0];
const RK23_W0: [f64; 1] = [0.5];
const RK23_W1: [f64; 2] = [0.0, 0.75];
const RK23_W2: [f64; 3] = [2.0 / 9.0, 1.0 / 3.0, 4.0 / 9.0];
const RK23_E: [f64; 4] = [-5.0 / 72.0, 1.0 / 12.0, 1.0 / 9.0, -1.0 / 8.0];

// Runge-Kutta-Fehlberg 4(5) pair. The committed solution is the
// fourth-order row; the error row is the difference to the fifth-order
// solution. A trailing evaluation round at the step end publishes the
// resolved state to the rest of the schedule.
const RK45_C: [f64; 7] = [0.0, 0.25, 0.375, 12.0 / 13.0, 1.0, 0.5, 1.0];
const RK45_W0: [f64; 1] = [0.25];
const RK45_W1: [f64; 2] = [3.0 / 32.0, 9.0 / 32.0];
const RK45_W2: [f64; 3] = [1932.0 / 2197.0, -7200.0 / 2197.0, 7296.0 / 2197.0];
const RK45_W3: [f64; 4] = [439.0 / 216.0, -8.0, 3680.0 / 513.0, -845.0 / 4104.0];
const RK45_W4: [f64; 5] = [-8.0 / 27.0, 2.0, -3544.0 / 2565.0, 1859.0 / 4104.0, -11.0 / 40.0];
const RK45_W5: [f64; 6] = [25.0 / 216.0, 0.0, 1408.0 / 2565.0, 2197.0 / 4104.0, -0.2, 0.0];
const RK45_E: [f64; 6] = [
    1.0 / 360.0,
    0.0,
    -128.0 / 4275.0,
    -2197.0 / 75240.0,
    1.0 / 50.0,
    2.0 / 55.0,
];

/// Error parsing a solver name from configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "unknown ODE solver {name:?}; expected one of ForwardEuler, BackwardEuler, ExplicitRK23, ExplicitRK45"
)]
pub struct SolverParseError {
    /// The unrecognized name
    pub name: String,
}

/// The closed set of ODE solver methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolverKind {
    /// Explicit first-order fixed-step method
    ForwardEuler,
    /// Implicit first-order method, fixed step, fixed-point iterated
    BackwardEuler,
    /// Bogacki-Shampine embedded 2(3) pair, variable step
    ExplicitRk23,
    /// Runge-Kutta-Fehlberg embedded 4(5) pair, variable step
    ExplicitRk45,
}

impl SolverKind {
    /// True for methods that never veto a step size
    #[must_use]
    pub const fn is_fixed_step(&self) -> bool {
        matches!(self, Self::ForwardEuler | Self::BackwardEuler)
    }

    /// Number of rounds to resolve one step; `None` means the method
    /// iterates until its convergence votes pass (bounded by the
    /// director's `max_iterations`)
    ///
    /// Every explicit method ends with an evaluation round at the step
    /// end, so the resolved state is the last value the schedule sees.
    #[must_use]
    pub const fn total_rounds(&self) -> Option<usize> {
        match self {
            Self::ForwardEuler => Some(2),
            Self::BackwardEuler => None,
            Self::ExplicitRk23 => Some(4),
            Self::ExplicitRk45 => Some(7),
        }
    }

    /// Order of the method for step prediction (`None` for fixed-step)
    #[must_use]
    pub const fn order(&self) -> Option<u32> {
        match self {
            Self::ForwardEuler | Self::BackwardEuler => None,
            Self::ExplicitRk23 => Some(3),
            Self::ExplicitRk45 => Some(5),
        }
    }

    fn time_fraction(&self, round: usize) -> f64 {
        match self {
            Self::ForwardEuler => {
                if round == 0 {
                    0.0
                } else {
                    1.0
                }
            }
            // Backward Euler evaluates every correction at the step end.
            Self::BackwardEuler => 1.0,
            Self::ExplicitRk23 => RK23_C[round.min(RK23_C.len() - 1)],
            Self::ExplicitRk45 => RK45_C[round.min(RK45_C.len() - 1)],
        }
    }

    fn history_weights(&self, round: usize) -> Vec<f64> {
        match self {
            Self::ForwardEuler => {
                if round == 0 {
                    vec![1.0]
                } else {
                    Vec::new()
                }
            }
            Self::BackwardEuler => {
                // x_{r+1} = x_0 + h * k_r: full weight on the newest
                // derivative only.
                let mut w = vec![0.0; round + 1];
                w[round] = 1.0;
                w
            }
            Self::ExplicitRk23 => match round {
                0 => RK23_W0.to_vec(),
                1 => RK23_W1.to_vec(),
                2 => RK23_W2.to_vec(),
                // Final round evaluates the derivative for the error
                // estimate only.
                _ => Vec::new(),
            },
            Self::ExplicitRk45 => match round {
                0 => RK45_W0.to_vec(),
                1 => RK45_W1.to_vec(),
                2 => RK45_W2.to_vec(),
                3 => RK45_W3.to_vec(),
                4 => RK45_W4.to_vec(),
                5 => RK45_W5.to_vec(),
                // Evaluation round at the step end.
                _ => Vec::new(),
            },
        }
    }

    fn error_weights(&self, round: usize) -> Option<Vec<f64>> {
        match self {
            Self::ForwardEuler | Self::BackwardEuler => None,
            Self::ExplicitRk23 => (round == 3).then(|| RK23_E.to_vec()),
            Self::ExplicitRk45 => (round == 5).then(|| RK45_E.to_vec()),
        }
    }
}

impl Default for SolverKind {
    fn default() -> Self {
        Self::ExplicitRk45
    }
}

impl FromStr for SolverKind {
    type Err = SolverParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "ForwardEuler" => Ok(Self::ForwardEuler),
            "BackwardEuler" => Ok(Self::BackwardEuler),
            "ExplicitRK23" => Ok(Self::ExplicitRk23),
            "ExplicitRK45" => Ok(Self::ExplicitRk45),
            other => Err(SolverParseError {
                name: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for SolverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ForwardEuler => "ForwardEuler",
            Self::BackwardEuler => "BackwardEuler",
            Self::ExplicitRk23 => "ExplicitRK23",
            Self::ExplicitRk45 => "ExplicitRK45",
        };
        f.write_str(name)
    }
}

/// Round and convergence state of the director's solver
///
/// Owned exclusively by the director; reset before every integration
/// attempt.
#[derive(Debug, Clone)]
pub struct OdeSolver {
    kind: SolverKind,
    round: usize,
    converged: bool,
}

impl OdeSolver {
    /// Create a solver of the given kind
    #[must_use]
    pub fn new(kind: SolverKind) -> Self {
        Self {
            kind,
            round: 0,
            converged: false,
        }
    }

    /// The method in use
    #[must_use]
    pub const fn kind(&self) -> SolverKind {
        self.kind
    }

    /// Reset the round counter and convergence flag for a new attempt
    pub fn reset(&mut self) {
        self.round = 0;
        self.converged = false;
    }

    /// Current round index
    #[must_use]
    pub const fn round(&self) -> usize {
        self.round
    }

    /// True once the states for this step are resolved
    #[must_use]
    pub const fn converged(&self) -> bool {
        self.converged
    }

    /// True while the solver can still make progress toward resolving
    /// states; false once an iterative method has exhausted its round
    /// budget
    #[must_use]
    pub fn resolved_states(&self, max_iterations: u32) -> bool {
        match self.kind.total_rounds() {
            Some(total) => self.round < total,
            None => self.round < max_iterations as usize,
        }
    }

    /// Fraction of the step at which the current round evaluates
    #[must_use]
    pub fn time_fraction(&self) -> f64 {
        self.kind.time_fraction(self.round)
    }

    /// Publish the integration data for the current round
    #[must_use]
    pub fn integration_step(
        &self,
        step_size: f64,
        init_step_size: f64,
        error_tolerance: f64,
        value_resolution: f64,
    ) -> IntegrationStep {
        IntegrationStep {
            round: self.round,
            step_size,
            init_step_size,
            error_tolerance,
            value_resolution,
            history_weights: self.kind.history_weights(self.round),
            error_weights: self.kind.error_weights(self.round),
            order: self.kind.order(),
        }
    }

    /// Complete the current round
    ///
    /// `votes_converged` is the ANDed convergence vote of the actors fired
    /// this round; it decides convergence for iterative methods and is
    /// ignored by fixed-round methods.
    pub fn advance_round(&mut self, votes_converged: bool) {
        self.round += 1;
        self.converged = match self.kind.total_rounds() {
            Some(total) => self.round >= total,
            None => votes_converged,
        };
    }
}
