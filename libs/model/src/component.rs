//! Component and unit definitions.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::{LogLevel, UnitKey, UnitType};

/// A declarative unit of work mapped 1-to-1 to a worker subprocess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    /// Opaque stable id, unique per model.
    pub id: String,

    /// Which binary to run and its command contract. `None` is only valid
    /// together with `error`.
    #[serde(default)]
    pub spec: Option<RuntimeSpec>,

    /// Terminal configuration error. When set the component is reported
    /// failed and never launches a process.
    #[serde(default)]
    pub error: Option<String>,

    /// Optional feature flags pushed to the worker.
    #[serde(default)]
    pub features: Option<Features>,

    /// Optional APM configuration pushed to the worker.
    #[serde(default)]
    pub apm_config: Option<ApmConfig>,

    /// Optional resource limits pushed to the worker and applied at launch.
    #[serde(default)]
    pub limits: Option<Limits>,

    /// Reference by id to the shipper component that owns this component's
    /// output. Resolved at use-time, never a strong link.
    #[serde(default)]
    pub shipper_ref: Option<ShipperReference>,

    /// Units hosted by this component, uniquely keyed by `(type, id)`.
    #[serde(default)]
    pub units: Vec<Unit>,
}

impl Component {
    /// Look up a unit by key.
    pub fn unit(&self, key: &UnitKey) -> Option<&Unit> {
        self.units
            .iter()
            .find(|u| u.unit_type == key.unit_type && u.id == key.id)
    }

    /// Unit keys declared by this component, in declaration order.
    pub fn unit_keys(&self) -> Vec<UnitKey> {
        self.units.iter().map(Unit::key).collect()
    }

    /// Whether replacing `self` with `next` requires relaunching the worker
    /// process.
    ///
    /// The launch contract is the binary path, argv, environment, and
    /// credential drop. Everything else (units, configs, log levels,
    /// features, APM, limits, timeout tuning) is applied in place through a
    /// new expected message.
    pub fn requires_relaunch(&self, next: &Component) -> bool {
        match (&self.spec, &next.spec) {
            (Some(a), Some(b)) => {
                a.binary_path() != b.binary_path()
                    || a.command().args != b.command().args
                    || a.command().env != b.command().env
                    || a.command().run_as != b.command().run_as
            }
            (None, None) => false,
            _ => true,
        }
    }

    /// Command contract for this component, when it has a runtime spec.
    pub fn command(&self) -> Option<&CommandSpec> {
        self.spec.as_ref().map(RuntimeSpec::command)
    }
}

/// Which kind of binary a component runs. Exactly one variant applies; the
/// launcher dispatches on the tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuntimeSpec {
    Input(InputRuntimeSpec),
    Shipper(ShipperRuntimeSpec),
}

impl RuntimeSpec {
    pub fn binary_path(&self) -> &Path {
        match self {
            RuntimeSpec::Input(spec) => &spec.binary_path,
            RuntimeSpec::Shipper(spec) => &spec.binary_path,
        }
    }

    pub fn command(&self) -> &CommandSpec {
        match self {
            RuntimeSpec::Input(spec) => &spec.command,
            RuntimeSpec::Shipper(spec) => &spec.command,
        }
    }

    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeSpec::Input(_) => "input",
            RuntimeSpec::Shipper(_) => "shipper",
        }
    }
}

/// Runtime spec for an input-hosting worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRuntimeSpec {
    /// Input type served by the binary (e.g. "fake").
    pub input_type: String,

    /// Binary name, for logging.
    pub binary_name: String,

    /// Absolute path of the binary to execute.
    pub binary_path: PathBuf,

    #[serde(default)]
    pub command: CommandSpec,
}

/// Runtime spec for a shipper worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipperRuntimeSpec {
    pub shipper_type: String,
    pub binary_name: String,
    pub binary_path: PathBuf,

    #[serde(default)]
    pub command: CommandSpec,
}

/// Command-line contract for launching a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Extra arguments passed to the binary.
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables set for the process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Credentials to drop to after fork, when the manager runs as root.
    #[serde(default)]
    pub run_as: Option<RunAs>,

    #[serde(default)]
    pub timeouts: CommandTimeouts,

    #[serde(default)]
    pub restart: RestartLimits,
}

impl Default for CommandSpec {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            env: BTreeMap::new(),
            run_as: None,
            timeouts: CommandTimeouts::default(),
            restart: RestartLimits::default(),
        }
    }
}

/// Uid/gid pair for credential drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAs {
    pub uid: u32,
    pub gid: u32,
}

/// Timeouts governing a worker's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTimeouts {
    /// Expected interval between worker check-ins. The health machine
    /// downgrades at 1x and kills at 2x this interval.
    pub checkin: Duration,

    /// Minimum delay before relaunching after an exit.
    pub restart: Duration,

    /// How long to wait for a graceful stop ack before hard-killing.
    pub stop: Duration,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            checkin: Duration::from_secs(30),
            restart: Duration::from_secs(10),
            stop: Duration::from_secs(30),
        }
    }
}

/// Restart-rate accounting: restarts are allowed while the count of starts
/// inside the monitoring window stays below the cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartLimits {
    pub max_restarts_per_period: u32,
    pub restart_monitoring_period: Duration,
}

impl Default for RestartLimits {
    fn default() -> Self {
        Self {
            max_restarts_per_period: 5,
            restart_monitoring_period: Duration::from_secs(60),
        }
    }
}

/// An input or output configuration hosted inside a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub unit_type: UnitType,
    pub id: String,

    #[serde(default)]
    pub log_level: LogLevel,

    /// Opaque configuration payload forwarded to the worker.
    #[serde(default)]
    pub config: Option<Value>,

    /// Unit-level configuration error. The unit is reported failed; sibling
    /// units proceed normally.
    #[serde(default)]
    pub error: Option<String>,
}

impl Unit {
    pub fn key(&self) -> UnitKey {
        UnitKey::new(self.unit_type, self.id.clone())
    }
}

/// Feature flags pushed to workers alongside units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Features {
    #[serde(default)]
    pub fqdn: bool,
}

/// APM configuration pushed to workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ApmConfig {
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub secret_token: Option<String>,
    #[serde(default)]
    pub global_labels: BTreeMap<String, String>,
}

/// Resource limits pushed to workers and applied at launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Limits {
    /// Scheduler parallelism hint, exported to the worker process as
    /// `FOREMAN_MAX_PROCS`.
    #[serde(default)]
    pub max_procs: Option<u32>,
}

/// Reference by id to the shipper that owns a component's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipperReference {
    pub component_id: String,
    pub unit_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input_component(id: &str, binary: &str) -> Component {
        Component {
            id: id.to_string(),
            spec: Some(RuntimeSpec::Input(InputRuntimeSpec {
                input_type: "fake".to_string(),
                binary_name: "fake".to_string(),
                binary_path: PathBuf::from(binary),
                command: CommandSpec::default(),
            })),
            error: None,
            features: None,
            apm_config: None,
            limits: None,
            shipper_ref: None,
            units: vec![Unit {
                unit_type: UnitType::Input,
                id: "fake-input".to_string(),
                log_level: LogLevel::Info,
                config: None,
                error: None,
            }],
        }
    }

    #[test]
    fn binary_path_change_requires_relaunch() {
        let a = input_component("c", "/bin/fake");
        let b = input_component("c", "/bin/fake-v2");
        assert!(a.requires_relaunch(&b));
    }

    #[test]
    fn unit_change_is_in_place() {
        let a = input_component("c", "/bin/fake");
        let mut b = a.clone();
        b.units[0].config = Some(serde_json::json!({"state": 2}));
        b.features = Some(Features { fqdn: true });
        assert!(!a.requires_relaunch(&b));
    }

    #[test]
    fn timeout_tuning_is_in_place() {
        let a = input_component("c", "/bin/fake");
        let mut b = a.clone();
        if let Some(RuntimeSpec::Input(spec)) = &mut b.spec {
            spec.command.timeouts.checkin = Duration::from_millis(100);
        }
        assert!(!a.requires_relaunch(&b));
    }

    #[test]
    fn argv_change_requires_relaunch() {
        let a = input_component("c", "/bin/fake");
        let mut b = a.clone();
        if let Some(RuntimeSpec::Input(spec)) = &mut b.spec {
            spec.command.args.push("--verbose".to_string());
        }
        assert!(a.requires_relaunch(&b));
    }

    #[test]
    fn unit_lookup_by_key() {
        let c = input_component("c", "/bin/fake");
        assert!(c.unit(&UnitKey::input("fake-input")).is_some());
        assert!(c.unit(&UnitKey::output("fake-input")).is_none());
    }
}
