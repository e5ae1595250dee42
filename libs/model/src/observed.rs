//! Published runtime state.
//!
//! [`ComponentState`] is what subscribers receive: a deterministic function
//! of the worker's observed report, the component's configuration error, the
//! process liveness, and check-in recency. It is assembled by the component
//! runtime and never set ad hoc.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::state::{UnitKey, UnitState};

/// Snapshot of a component's state as seen by the manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentState {
    /// Aggregate component state.
    pub state: UnitState,

    /// Human-readable message accompanying the state.
    pub message: String,

    /// Per-unit observed state. Serialized as a sequence of entries since
    /// the composite key cannot be a JSON map key.
    #[serde(
        serialize_with = "serialize_units",
        deserialize_with = "deserialize_units"
    )]
    pub units: BTreeMap<UnitKey, UnitObserved>,

    /// Pid of the live worker process, when one exists.
    pub pid: Option<u32>,

    /// Version of the latest expected message sent to the worker.
    pub expected_version: u64,

    /// Build information reported by the worker on first check-in.
    pub version_info: Option<VersionInfo>,

    /// When this snapshot was assembled.
    pub observed_at: DateTime<Utc>,
}

impl ComponentState {
    /// Initial state for a freshly created runtime.
    pub fn starting(message: impl Into<String>) -> Self {
        Self {
            state: UnitState::Starting,
            message: message.into(),
            units: BTreeMap::new(),
            pid: None,
            expected_version: 0,
            version_info: None,
            observed_at: Utc::now(),
        }
    }

    /// Look up a unit's observed state.
    pub fn unit(&self, key: &UnitKey) -> Option<&UnitObserved> {
        self.units.get(key)
    }
}

/// Observed state of a single unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitObserved {
    pub state: UnitState,
    pub message: String,

    /// Optional structured payload reported by the worker.
    #[serde(default)]
    pub payload: Option<Value>,
}

impl UnitObserved {
    pub fn new(state: UnitState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
            payload: None,
        }
    }
}

/// Build information reported by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize)]
struct UnitEntry {
    #[serde(flatten)]
    key: UnitKey,
    #[serde(flatten)]
    observed: UnitObserved,
}

fn serialize_units<S: Serializer>(
    units: &BTreeMap<UnitKey, UnitObserved>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(units.iter().map(|(key, observed)| UnitEntry {
        key: key.clone(),
        observed: observed.clone(),
    }))
}

fn deserialize_units<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeMap<UnitKey, UnitObserved>, D::Error> {
    let entries = Vec::<UnitEntry>::deserialize(deserializer)?;
    Ok(entries
        .into_iter()
        .map(|entry| (entry.key, entry.observed))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::UnitType;

    #[test]
    fn component_state_serializes_units_as_a_sequence() {
        let mut state = ComponentState::starting("Starting");
        state.units.insert(
            UnitKey::new(UnitType::Input, "fake-input"),
            UnitObserved::new(UnitState::Healthy, "Healthy"),
        );

        let json = serde_json::to_value(&state).unwrap();
        assert!(json["units"].is_array());
        assert_eq!(json["units"][0]["id"], "fake-input");
        assert_eq!(json["units"][0]["state"], 2);

        let back: ComponentState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }
}
