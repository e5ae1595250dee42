//! Declarative component model for the foreman runtime manager.
//!
//! A [`Model`] is an immutable snapshot of intended topology: an ordered set
//! of [`Component`]s, each mapping 1-to-1 to a worker subprocess and hosting
//! one or more [`Unit`]s. The manager diffs successive models and converges
//! the running population to match.
//!
//! Key concepts:
//!
//! - **Component**: which binary to run and its command contract, plus the
//!   units it hosts and optional features/APM/limits configuration.
//! - **Unit**: an input or output configuration hosted inside a component,
//!   keyed by `(type, id)`.
//! - **Observed state**: what a worker last reported for itself and its
//!   units, published to subscribers as [`ComponentState`].

mod component;
mod diff;
mod error;
mod observed;
mod state;

pub use component::{
    ApmConfig, CommandSpec, CommandTimeouts, Component, Features, InputRuntimeSpec, Limits,
    RestartLimits, RunAs, RuntimeSpec, ShipperReference, ShipperRuntimeSpec, Unit,
};
pub use diff::{diff, Model, ModelDiff};
pub use error::ModelError;
pub use observed::{ComponentState, UnitObserved, VersionInfo};
pub use state::{InvalidStateError, LogLevel, UnitKey, UnitState, UnitType};
