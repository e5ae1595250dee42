//! Protocol message types.
//!
//! All frames on the check-in stream are wrapped in the [`Frame`] envelope.
//! The first frame a worker sends is [`Hello`]; after the manager accepts
//! the token, expected/observed and action frames flow until either side
//! closes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use foreman_model::{
    ApmConfig, Features, Limits, LogLevel, UnitKey, UnitState, VersionInfo,
};

/// Envelope for every message on the check-in stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Worker → manager. First frame; authenticates the stream.
    Hello(Hello),

    /// Manager → worker. Latest desired state, versioned.
    Expected(ExpectedMessage),

    /// Worker → manager. Latest reported state.
    Observed(ObservedMessage),

    /// Manager → worker. Named action dispatch.
    ActionRequest(ActionRequest),

    /// Worker → manager. Correlated action result.
    ActionResponse(ActionResponse),
}

/// Stream authentication. The token is single-use per live worker instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub token: String,
}

/// The manager's latest desired state for a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExpectedMessage {
    /// Monotonic counter identifying this expected message. The worker
    /// echoes the last applied version in its observed messages.
    pub version: u64,

    pub units: Vec<ExpectedUnit>,

    #[serde(default)]
    pub features: Option<Features>,

    #[serde(default)]
    pub apm_config: Option<ApmConfig>,

    #[serde(default)]
    pub limits: Option<Limits>,

    /// Component-level configuration, opaque to the manager.
    #[serde(default)]
    pub component_config: Option<Value>,
}

/// Desired state for one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedUnit {
    #[serde(flatten)]
    pub key: UnitKey,

    /// Desired state: `Healthy` for live units, `Stopped` for units being
    /// retired.
    pub state: UnitState,

    pub log_level: LogLevel,

    #[serde(default)]
    pub config: Option<Value>,
}

/// The worker's latest reported state for itself and its units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedMessage {
    /// Version of the last expected message the worker has applied.
    pub applied_version: u64,

    /// Aggregate component state.
    pub state: UnitState,

    pub message: String,

    pub units: Vec<ObservedUnit>,

    #[serde(default)]
    pub version_info: Option<VersionInfo>,
}

/// Observed state of one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedUnit {
    #[serde(flatten)]
    pub key: UnitKey,

    pub state: UnitState,

    pub message: String,

    #[serde(default)]
    pub payload: Option<Value>,
}

/// Named action dispatched to a worker or to one of its units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    /// Freshly generated correlation id (UUID).
    pub id: String,

    pub name: String,

    /// Target unit; `None` means a component-level action.
    #[serde(default)]
    pub unit: Option<UnitKey>,

    #[serde(default)]
    pub params: Value,
}

/// Result of an action, correlated by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResponse {
    pub id: String,

    pub status: ActionStatus,

    #[serde(default)]
    pub result: Value,

    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Ok,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_model::UnitType;

    #[test]
    fn expected_unit_flattens_key() {
        let unit = ExpectedUnit {
            key: UnitKey::new(UnitType::Input, "fake-input"),
            state: UnitState::Healthy,
            log_level: LogLevel::Debug,
            config: Some(serde_json::json!({"state": 2})),
        };
        let json = serde_json::to_value(&unit).unwrap();
        assert_eq!(json["unit_type"], "input");
        assert_eq!(json["id"], "fake-input");
        assert_eq!(json["state"], 2);
    }

    #[test]
    fn frame_envelope_is_tagged() {
        let frame = Frame::Observed(ObservedMessage {
            applied_version: 3,
            state: UnitState::Healthy,
            message: "Healthy".to_string(),
            units: vec![],
            version_info: None,
        });
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "observed");
        assert_eq!(json["applied_version"], 3);

        let back: Frame = serde_json::from_value(json).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn action_request_round_trip() {
        let request = ActionRequest {
            id: "c0ffee".to_string(),
            name: "set_state".to_string(),
            unit: Some(UnitKey::new(UnitType::Input, "fake-input")),
            params: serde_json::json!({"state": 3, "message": "Action Set Degraded"}),
        };
        let json = serde_json::to_string(&Frame::ActionRequest(request.clone())).unwrap();
        let back: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Frame::ActionRequest(request));
    }
}
