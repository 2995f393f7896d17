//! Configuration of the continuous-time director.
//!
//! Values are validated at the point of assignment; nothing is silently
//! clamped here (only the director's suggested-next-step-size is ever
//! clamped, intentionally, against the maximum step size).

use serde::{Deserialize, Serialize};

use rivulet_core::{CoreError, CoreResult};

use crate::solver::SolverKind;

/// Parameters of the continuous-time director
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContConfig {
    start_time: f64,
    stop_time: f64,
    init_step_size: f64,
    min_step_size: f64,
    max_step_size: f64,
    max_iterations: u32,
    error_tolerance: f64,
    value_resolution: f64,
    time_resolution: f64,
    synchronize_to_real_time: bool,
    solver: SolverKind,
}

impl Default for ContConfig {
    fn default() -> Self {
        Self {
            start_time: 0.0,
            stop_time: f64::INFINITY,
            init_step_size: 0.1,
            min_step_size: 1e-5,
            max_step_size: 1.0,
            max_iterations: 20,
            error_tolerance: 1e-4,
            value_resolution: 1e-6,
            time_resolution: 1e-10,
            synchronize_to_real_time: false,
            solver: SolverKind::default(),
        }
    }
}

impl ContConfig {
    /// Simulation start time in seconds
    #[must_use]
    pub const fn start_time(&self) -> f64 {
        self.start_time
    }

    /// Simulation stop time in seconds (may be infinite)
    #[must_use]
    pub const fn stop_time(&self) -> f64 {
        self.stop_time
    }

    /// Initial integration step size in seconds
    #[must_use]
    pub const fn init_step_size(&self) -> f64 {
        self.init_step_size
    }

    /// Smallest step size the user wants used
    #[must_use]
    pub const fn min_step_size(&self) -> f64 {
        self.min_step_size
    }

    /// Largest step size the user wants used
    #[must_use]
    pub const fn max_step_size(&self) -> f64 {
        self.max_step_size
    }

    /// Round budget for iterative (implicit) solvers
    #[must_use]
    pub const fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    /// Local truncation error tolerance
    #[must_use]
    pub const fn error_tolerance(&self) -> f64 {
        self.error_tolerance
    }

    /// Convergence resolution for fixed-point state resolution
    #[must_use]
    pub const fn value_resolution(&self) -> f64 {
        self.value_resolution
    }

    /// Time quantization resolution in seconds
    #[must_use]
    pub const fn time_resolution(&self) -> f64 {
        self.time_resolution
    }

    /// Whether execution sleeps to track wall-clock time
    #[must_use]
    pub const fn synchronize_to_real_time(&self) -> bool {
        self.synchronize_to_real_time
    }

    /// Selected ODE solver method
    #[must_use]
    pub const fn solver(&self) -> SolverKind {
        self.solver
    }

    /// Set the start time
    ///
    /// # Errors
    ///
    /// Rejects non-finite values.
    pub fn set_start_time(&mut self, value: f64) -> CoreResult<()> {
        if !value.is_finite() {
            return Err(config_error("start_time", "must be finite"));
        }
        self.start_time = value;
        Ok(())
    }

    /// Set the stop time (may be infinite)
    ///
    /// # Errors
    ///
    /// Rejects NaN.
    pub fn set_stop_time(&mut self, value: f64) -> CoreResult<()> {
        if value.is_nan() {
            return Err(config_error("stop_time", "must be a number"));
        }
        self.stop_time = value;
        Ok(())
    }

    /// Set the initial step size
    ///
    /// # Errors
    ///
    /// Rejects negative or non-finite values.
    pub fn set_init_step_size(&mut self, value: f64) -> CoreResult<()> {
        check_step("init_step_size", value)?;
        self.init_step_size = value;
        Ok(())
    }

    /// Set the minimum step size
    ///
    /// # Errors
    ///
    /// Rejects negative or non-finite values.
    pub fn set_min_step_size(&mut self, value: f64) -> CoreResult<()> {
        check_step("min_step_size", value)?;
        self.min_step_size = value;
        Ok(())
    }

    /// Set the maximum step size
    ///
    /// # Errors
    ///
    /// Rejects negative or non-finite values.
    pub fn set_max_step_size(&mut self, value: f64) -> CoreResult<()> {
        check_step("max_step_size", value)?;
        self.max_step_size = value;
        Ok(())
    }

    /// Set the iterative-solver round budget
    ///
    /// # Errors
    ///
    /// Rejects zero.
    pub fn set_max_iterations(&mut self, value: u32) -> CoreResult<()> {
        if value == 0 {
            return Err(config_error("max_iterations", "must be at least 1"));
        }
        self.max_iterations = value;
        Ok(())
    }

    /// Set the error tolerance
    ///
    /// # Errors
    ///
    /// Rejects negative or non-finite values.
    pub fn set_error_tolerance(&mut self, value: f64) -> CoreResult<()> {
        if !value.is_finite() || value < 0.0 {
            return Err(config_error("error_tolerance", "cannot be negative"));
        }
        self.error_tolerance = value;
        Ok(())
    }

    /// Set the fixed-point value resolution
    ///
    /// # Errors
    ///
    /// Rejects negative or non-finite values.
    pub fn set_value_resolution(&mut self, value: f64) -> CoreResult<()> {
        if !value.is_finite() || value < 0.0 {
            return Err(config_error("value_resolution", "cannot be negative"));
        }
        self.value_resolution = value;
        Ok(())
    }

    /// Set the time quantization resolution
    ///
    /// # Errors
    ///
    /// Rejects non-positive or non-finite values.
    pub fn set_time_resolution(&mut self, value: f64) -> CoreResult<()> {
        if !value.is_finite() || value <= 0.0 {
            return Err(config_error("time_resolution", "must be positive"));
        }
        self.time_resolution = value;
        Ok(())
    }

    /// Enable or disable real-time synchronization
    pub fn set_synchronize_to_real_time(&mut self, value: bool) {
        self.synchronize_to_real_time = value;
    }

    /// Select the ODE solver method
    pub fn set_solver(&mut self, solver: SolverKind) {
        self.solver = solver;
    }

    /// Validate the configuration as a whole
    ///
    /// Deserialized configurations bypass the setters, so the director
    /// re-validates before execution.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> CoreResult<()> {
        let mut copy = self.clone();
        copy.set_start_time(self.start_time)?;
        copy.set_stop_time(self.stop_time)?;
        copy.set_init_step_size(self.init_step_size)?;
        copy.set_min_step_size(self.min_step_size)?;
        copy.set_max_step_size(self.max_step_size)?;
        copy.set_max_iterations(self.max_iterations)?;
        copy.set_error_tolerance(self.error_tolerance)?;
        copy.set_value_resolution(self.value_resolution)?;
        copy.set_time_resolution(self.time_resolution)?;
        if self.min_step_size > self.max_step_size {
            return Err(config_error(
                "min_step_size",
                "cannot exceed max_step_size",
            ));
        }
        Ok(())
    }
}

fn check_step(parameter: &str, value: f64) -> CoreResult<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(config_error(parameter, "cannot be a negative step size"));
    }
    Ok(())
}

fn config_error(parameter: &str, reason: &str) -> CoreError {
    CoreError::Config {
        parameter: parameter.to_string(),
        reason: reason.to_string(),
    }
}
