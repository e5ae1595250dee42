use thiserror::Error;

use crate::state::UnitKey;

/// Errors produced by synchronous model validation.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Two components in the same model share an id.
    #[error("duplicate component id: {0}")]
    DuplicateComponent(String),

    /// Two units inside one component share a `(type, id)` key.
    #[error("duplicate unit {key} in component {component}")]
    DuplicateUnit { component: String, key: UnitKey },

    /// Component carries neither a runtime spec nor a terminal error.
    #[error("component {0} has no runtime spec")]
    MissingSpec(String),
}
