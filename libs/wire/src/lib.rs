//! Check-in wire protocol between the foreman manager and its workers.
//!
//! The transport is a mutually-authenticated TLS stream carrying
//! length-prefixed JSON frames (see [`codec::FrameCodec`]). A single stream
//! serves both surfaces: the bidirectional check-in exchange (expected vs.
//! observed state) and the action request/response surface, correlated by
//! id.
//!
//! Workers receive a [`ConnectionInfo`] blob on stdin at launch: the
//! manager's address, a single-use token, the certificate material, and the
//! check-in cadence. [`client::connect`] turns that blob into an
//! authenticated framed stream.

pub mod client;
pub mod codec;
mod conninfo;
mod error;
mod frames;

pub use codec::FrameCodec;
pub use conninfo::ConnectionInfo;
pub use error::WireError;
pub use frames::{
    ActionRequest, ActionResponse, ActionStatus, ExpectedMessage, ExpectedUnit, Frame, Hello,
    ObservedMessage, ObservedUnit,
};

/// Reserved action name: return the worker's current feature flags.
pub const ACTION_RETRIEVE_FEATURES: &str = "retrieve_features";

/// Reserved action name: return the worker's current APM configuration.
pub const ACTION_RETRIEVE_APM_CONFIG: &str = "retrieve_apm_config";

/// Error string a worker returns for an unknown action name.
pub const ERR_ACTION_UNDEFINED: &str = "action undefined";
