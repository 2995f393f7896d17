//! A small library of general-purpose actors.
//!
//! These are the domain-polymorphic basics the demos and tests are built
//! from; domain kernels ship their own specialized actors (the continuous
//! integrator lives with the continuous kernel).

use std::cell::RefCell;
use std::rc::Rc;

use crate::actor::{Actor, PortSpec, Stateful};
use crate::error::CoreResult;
use crate::graph::FiringContext;
use crate::token::Token;

/// Emits a constant token on every firing
pub struct Const {
    value: Token,
}

impl Const {
    /// Create a constant source
    #[must_use]
    pub fn new(value: Token) -> Self {
        Self { value }
    }
}

impl Actor for Const {
    fn output_ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::new("out")]
    }

    fn fire(&mut self, ctx: &mut FiringContext<'_>) -> CoreResult<()> {
        ctx.send(0, self.value)
    }
}

/// Emits an arithmetic sequence, one value per iteration
pub struct Ramp {
    init: f64,
    increment: f64,
    current: f64,
    marked: f64,
}

impl Ramp {
    /// Create a ramp starting at `init`, advancing by `increment`
    #[must_use]
    pub fn new(init: f64, increment: f64) -> Self {
        Self {
            init,
            increment,
            current: init,
            marked: init,
        }
    }
}

impl Actor for Ramp {
    fn output_ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::new("out")]
    }

    fn initialize(&mut self, _ctx: &mut FiringContext<'_>) -> CoreResult<()> {
        self.current = self.init;
        self.marked = self.init;
        Ok(())
    }

    fn fire(&mut self, ctx: &mut FiringContext<'_>) -> CoreResult<()> {
        ctx.send(0, Token::Double(self.current))
    }

    fn postfire(&mut self, _ctx: &mut FiringContext<'_>) -> CoreResult<bool> {
        self.current += self.increment;
        Ok(true)
    }

    fn stateful(&mut self) -> Option<&mut dyn Stateful> {
        Some(self)
    }
}

impl Stateful for Ramp {
    fn mark_state(&mut self) {
        self.marked = self.current;
    }

    fn go_to_marked_state(&mut self) {
        self.current = self.marked;
    }
}

/// Multiplies its input by a constant factor
pub struct Gain {
    factor: f64,
}

impl Gain {
    /// Create a gain
    #[must_use]
    pub fn new(factor: f64) -> Self {
        Self { factor }
    }
}

impl Actor for Gain {
    fn input_ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::new("in")]
    }

    fn output_ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::new("out")]
    }

    fn fire(&mut self, ctx: &mut FiringContext<'_>) -> CoreResult<()> {
        // Absent input is "not known yet this round", not an error.
        if let Some(token) = ctx.try_get(0, 0) {
            let value = token.expect_double()?;
            ctx.send(0, Token::Double(value * self.factor))?;
        }
        Ok(())
    }
}

/// Sums its `plus` channels and subtracts its `minus` channels
pub struct AddSubtract;

impl Actor for AddSubtract {
    fn input_ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::new("plus"), PortSpec::new("minus")]
    }

    fn output_ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::new("out")]
    }

    fn fire(&mut self, ctx: &mut FiringContext<'_>) -> CoreResult<()> {
        let mut sum = 0.0;
        let mut any = false;
        for channel in 0..ctx.input_width(0) {
            if let Some(token) = ctx.try_get(0, channel) {
                sum += token.expect_double()?;
                any = true;
            }
        }
        for channel in 0..ctx.input_width(1) {
            if let Some(token) = ctx.try_get(1, channel) {
                sum -= token.expect_double()?;
                any = true;
            }
        }
        if any {
            ctx.send(0, Token::Double(sum))?;
        }
        Ok(())
    }
}

/// A recorded sample: model time in seconds plus the observed token
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Model time of the observation, in seconds
    pub time: f64,
    /// The observed token
    pub token: Token,
}

/// Records committed input values together with their model time
///
/// Recording happens in `postfire`, which both domains call exactly once
/// per committed firing, so transient solver rounds are never recorded.
pub struct Recorder {
    samples: Rc<RefCell<Vec<Sample>>>,
}

/// Read-side handle to a [`Recorder`]'s samples
#[derive(Clone)]
pub struct RecorderTap {
    samples: Rc<RefCell<Vec<Sample>>>,
}

impl RecorderTap {
    /// Snapshot of the samples recorded so far
    #[must_use]
    pub fn samples(&self) -> Vec<Sample> {
        self.samples.borrow().clone()
    }
}

impl Recorder {
    /// Create a recorder and the tap used to read it back
    #[must_use]
    pub fn with_tap() -> (Self, RecorderTap) {
        let samples = Rc::new(RefCell::new(Vec::new()));
        (
            Self {
                samples: Rc::clone(&samples),
            },
            RecorderTap { samples },
        )
    }
}

impl Actor for Recorder {
    fn input_ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::new("in")]
    }

    fn fire(&mut self, _ctx: &mut FiringContext<'_>) -> CoreResult<()> {
        Ok(())
    }

    fn postfire(&mut self, ctx: &mut FiringContext<'_>) -> CoreResult<bool> {
        let time = ctx.time_seconds();
        for channel in 0..ctx.input_width(0) {
            if let Some(token) = ctx.try_get(0, channel) {
                self.samples.borrow_mut().push(Sample { time, token });
            }
        }
        Ok(true)
    }
}
