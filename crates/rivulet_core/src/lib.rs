//! RIVULET Core Types
//!
//! This crate contains the domain-independent substrate of the RIVULET
//! simulation kernel: quantized model time, tokens and receivers, the
//! actor execution contract with its optional capabilities, and the model
//! graph directors execute against. It is pure types and logic with no I/O.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod actor;
pub mod error;
pub mod graph;
pub mod library;
pub mod receiver;
pub mod time;
pub mod token;

// Re-exports
pub use actor::{Actor, IntegrationStep, PortSpec, Stateful, StepSizeControl};
pub use error::{CoreError, CoreResult};
pub use graph::{
    ActorId, Channel, ChannelId, ExecutionMode, FiringContext, FiringEnv, ModelGraph, PortState,
};
pub use receiver::{Rate, Receiver};
pub use time::{ModelTime, TimeResolution};
pub use token::Token;
