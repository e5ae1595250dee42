//! Fake worker used by the integration tests.
//!
//! Speaks the real check-in protocol: reads its connection info from stdin,
//! connects over mutual TLS, and reports whatever state each unit's config
//! asks for (`{"state": 2, "message": "Fake Healthy"}`). Supported actions:
//! `set_state`, `kill`, `retrieve_features`, `retrieve_apm_config`; anything
//! else is answered with `action undefined`. A unit config carrying
//! `kill_on_interval` makes the process exit some interval after going
//! healthy, which exercises the manager's restart budget.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use foreman_model::{ApmConfig, Features, UnitKey, UnitState, VersionInfo};
use foreman_wire::client::{self, WorkerStream};
use foreman_wire::{
    ActionRequest, ActionResponse, ActionStatus, ConnectionInfo, ExpectedMessage, Frame,
    ObservedMessage, ObservedUnit, ACTION_RETRIEVE_APM_CONFIG, ACTION_RETRIEVE_FEATURES,
    ERR_ACTION_UNDEFINED,
};

const DEFAULT_KILL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
struct SimUnit {
    state: UnitState,
    message: String,
    payload: Option<Value>,
    config: Value,
}

struct Worker {
    stream: WorkerStream,
    applied_version: u64,
    units: BTreeMap<UnitKey, SimUnit>,
    features: Option<Features>,
    apm_config: Option<ApmConfig>,
    kill_at: Option<Instant>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut stdin = tokio::io::stdin();
    let info = ConnectionInfo::read_from(&mut stdin).await?;
    info!(addr = %info.addr, "fake worker connecting");

    let stream = client::connect(&info).await?;
    let worker = Worker {
        stream,
        applied_version: 0,
        units: BTreeMap::new(),
        features: None,
        apm_config: None,
        kill_at: None,
    };
    worker.run(info.checkin_period()).await
}

impl Worker {
    async fn run(mut self, checkin_period: Duration) -> Result<()> {
        let mut ticker = tokio::time::interval(checkin_period.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = self.stream.next() => match frame {
                    Some(Ok(Frame::Expected(expected))) => self.apply_expected(expected).await?,
                    Some(Ok(Frame::ActionRequest(request))) => self.handle_action(request).await?,
                    Some(Ok(frame)) => debug!(frame = ?frame, "ignoring frame"),
                    Some(Err(err)) => {
                        warn!(error = %err, "stream error; exiting");
                        std::process::exit(1);
                    }
                    None => {
                        info!("manager closed the stream; exiting");
                        std::process::exit(1);
                    }
                },

                _ = ticker.tick() => self.send_observed().await?,

                _ = wait_kill(self.kill_at) => {
                    warn!("kill interval elapsed; exiting");
                    std::process::exit(1);
                }
            }
        }
    }

    async fn apply_expected(&mut self, expected: ExpectedMessage) -> Result<()> {
        debug!(version = expected.version, units = expected.units.len(), "applying expected state");

        let mut next = BTreeMap::new();
        let mut kill_interval = None;

        for unit in &expected.units {
            if unit.state == UnitState::Stopped {
                next.insert(
                    unit.key.clone(),
                    SimUnit {
                        state: UnitState::Stopped,
                        message: "Stopped".to_string(),
                        payload: None,
                        config: Value::Null,
                    },
                );
                continue;
            }

            let config = unit.config.clone().unwrap_or(Value::Null);
            let state = config
                .get("state")
                .cloned()
                .and_then(|v| serde_json::from_value::<UnitState>(v).ok())
                .unwrap_or(UnitState::Healthy);
            let message = config
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Healthy")
                .to_string();

            if config
                .get("kill_on_interval")
                .and_then(Value::as_bool)
                .unwrap_or(false)
            {
                let interval = config
                    .get("kill_interval_ms")
                    .and_then(Value::as_u64)
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_KILL_INTERVAL);
                kill_interval = Some(interval);
            }

            // Keep an action-set state while the unit's config is
            // unchanged; a config change resets the unit.
            let sim = match self.units.get(&unit.key) {
                Some(existing) if existing.config == config => existing.clone(),
                _ => SimUnit {
                    state,
                    message,
                    payload: None,
                    config,
                },
            };
            next.insert(unit.key.clone(), sim);
        }

        self.units = next;
        self.applied_version = expected.version;
        self.features = expected.features;
        self.apm_config = expected.apm_config;
        self.kill_at = kill_interval.map(|interval| Instant::now() + interval);

        self.send_observed().await
    }

    async fn handle_action(&mut self, request: ActionRequest) -> Result<()> {
        debug!(action = %request.name, id = %request.id, "action received");

        let response = match request.name.as_str() {
            "kill" => {
                warn!("kill action received; exiting");
                std::process::exit(1);
            }
            "set_state" => {
                let state = request
                    .params
                    .get("state")
                    .cloned()
                    .and_then(|v| serde_json::from_value::<UnitState>(v).ok())
                    .unwrap_or(UnitState::Healthy);
                let message = request
                    .params
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("set_state")
                    .to_string();

                match &request.unit {
                    Some(key) => {
                        if let Some(unit) = self.units.get_mut(key) {
                            unit.state = state;
                            unit.message = message;
                        }
                    }
                    None => {
                        for unit in self.units.values_mut() {
                            unit.state = state;
                            unit.message = message.clone();
                        }
                    }
                }
                ok_response(&request, serde_json::json!({}))
            }
            ACTION_RETRIEVE_FEATURES => {
                ok_response(&request, serde_json::to_value(&self.features)?)
            }
            ACTION_RETRIEVE_APM_CONFIG => {
                ok_response(&request, serde_json::to_value(&self.apm_config)?)
            }
            _ => ActionResponse {
                id: request.id.clone(),
                status: ActionStatus::Error,
                result: Value::Null,
                error: Some(ERR_ACTION_UNDEFINED.to_string()),
            },
        };

        self.stream.send(Frame::ActionResponse(response)).await?;
        self.send_observed().await
    }

    async fn send_observed(&mut self) -> Result<()> {
        let units: Vec<ObservedUnit> = self
            .units
            .iter()
            .map(|(key, sim)| ObservedUnit {
                key: key.clone(),
                state: sim.state,
                message: sim.message.clone(),
                payload: sim.payload.clone(),
            })
            .collect();
        let (state, message) = aggregate(&self.units);

        let observed = ObservedMessage {
            applied_version: self.applied_version,
            state,
            message,
            units,
            version_info: Some(VersionInfo {
                name: "fake-worker".to_string(),
                version: "1.0.0".to_string(),
                meta: BTreeMap::new(),
            }),
        };

        self.stream.send(Frame::Observed(observed)).await?;
        Ok(())
    }
}

fn ok_response(request: &ActionRequest, result: Value) -> ActionResponse {
    ActionResponse {
        id: request.id.clone(),
        status: ActionStatus::Ok,
        result,
        error: None,
    }
}

/// Worst unit state wins; an empty unit set reports healthy.
fn aggregate(units: &BTreeMap<UnitKey, SimUnit>) -> (UnitState, String) {
    if units.is_empty() {
        return (UnitState::Healthy, "Healthy".to_string());
    }
    if units.values().all(|u| u.state == UnitState::Stopped) {
        return (UnitState::Stopped, "Stopped".to_string());
    }

    let severity = |state: UnitState| match state {
        UnitState::Failed => 6,
        UnitState::Degraded => 5,
        UnitState::Stopping => 4,
        UnitState::Configuring => 3,
        UnitState::Starting => 2,
        UnitState::Healthy => 1,
        UnitState::Stopped => 0,
    };
    let worst = units
        .values()
        .max_by_key(|u| severity(u.state))
        .map(|u| u.state)
        .unwrap_or(UnitState::Healthy);
    let message = match worst {
        UnitState::Healthy => "Healthy".to_string(),
        other => format!("{other}"),
    };
    (worst, message)
}

async fn wait_kill(kill_at: Option<Instant>) {
    match kill_at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
