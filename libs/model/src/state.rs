//! State enumerations shared between the model, the wire protocol, and the
//! published runtime state.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of a component or unit.
///
/// The numeric values are part of the wire protocol and must never change.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum UnitState {
    #[default]
    Starting = 0,
    Configuring = 1,
    Healthy = 2,
    Degraded = 3,
    Failed = 4,
    Stopping = 5,
    Stopped = 6,
}

impl UnitState {
    /// True for states in which a worker process is expected to be live.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            UnitState::Starting | UnitState::Configuring | UnitState::Healthy | UnitState::Degraded
        )
    }
}

impl From<UnitState> for u8 {
    fn from(state: UnitState) -> u8 {
        state as u8
    }
}

/// Raised when a wire frame carries a state number outside the enumeration.
#[derive(Debug, Error)]
#[error("invalid unit state value: {0}")]
pub struct InvalidStateError(pub u8);

impl TryFrom<u8> for UnitState {
    type Error = InvalidStateError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(UnitState::Starting),
            1 => Ok(UnitState::Configuring),
            2 => Ok(UnitState::Healthy),
            3 => Ok(UnitState::Degraded),
            4 => Ok(UnitState::Failed),
            5 => Ok(UnitState::Stopping),
            6 => Ok(UnitState::Stopped),
            other => Err(InvalidStateError(other)),
        }
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnitState::Starting => "starting",
            UnitState::Configuring => "configuring",
            UnitState::Healthy => "healthy",
            UnitState::Degraded => "degraded",
            UnitState::Failed => "failed",
            UnitState::Stopping => "stopping",
            UnitState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// The kind of a unit hosted inside a component.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum UnitType {
    Input,
    Output,
}

impl fmt::Display for UnitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitType::Input => f.write_str("input"),
            UnitType::Output => f.write_str("output"),
        }
    }
}

/// Log level pushed to a worker for an individual unit.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// Composite key identifying a unit within a component.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitKey {
    pub unit_type: UnitType,
    pub id: String,
}

impl UnitKey {
    pub fn new(unit_type: UnitType, id: impl Into<String>) -> Self {
        Self {
            unit_type,
            id: id.into(),
        }
    }

    pub fn input(id: impl Into<String>) -> Self {
        Self::new(UnitType::Input, id)
    }

    pub fn output(id: impl Into<String>) -> Self {
        Self::new(UnitType::Output, id)
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.unit_type, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_state_wire_numbers_are_stable() {
        assert_eq!(u8::from(UnitState::Starting), 0);
        assert_eq!(u8::from(UnitState::Configuring), 1);
        assert_eq!(u8::from(UnitState::Healthy), 2);
        assert_eq!(u8::from(UnitState::Degraded), 3);
        assert_eq!(u8::from(UnitState::Failed), 4);
        assert_eq!(u8::from(UnitState::Stopping), 5);
        assert_eq!(u8::from(UnitState::Stopped), 6);
    }

    #[test]
    fn unit_state_round_trips_through_json() {
        let json = serde_json::to_string(&UnitState::Degraded).unwrap();
        assert_eq!(json, "3");
        let back: UnitState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, UnitState::Degraded);
    }

    #[test]
    fn unit_state_rejects_unknown_numbers() {
        let err = serde_json::from_str::<UnitState>("9");
        assert!(err.is_err());
    }

    #[test]
    fn unit_key_display() {
        let key = UnitKey::input("fake-input");
        assert_eq!(key.to_string(), "input/fake-input");
    }
}
