//! End-to-end manager scenarios driven by the `fake-worker` binary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use foreman_manager::{ActionError, Config, Manager, ManagerError, Subscription};
use foreman_model::{
    CommandSpec, CommandTimeouts, Component, ComponentState, Features, InputRuntimeSpec, LogLevel,
    Model, RestartLimits, RuntimeSpec, Unit, UnitKey, UnitState, UnitType,
};

const FAKE_WORKER: &str = env!("CARGO_BIN_EXE_fake-worker");

struct Harness {
    manager: Arc<Manager>,
    shutdown: watch::Sender<bool>,
    run_task: JoinHandle<Result<(), ManagerError>>,
    run_root: TempDir,
}

impl Harness {
    async fn start() -> Self {
        Self::start_with(Duration::from_millis(100)).await
    }

    async fn start_with(worker_checkin_period: Duration) -> Self {
        let run_root = TempDir::new().expect("tempdir");
        let config = Config {
            listen_addr: "127.0.0.1:0".to_string(),
            server_name: "localhost".to_string(),
            run_root: run_root.path().to_path_buf(),
            worker_checkin_period,
        };
        let manager = Arc::new(Manager::new(config).expect("manager"));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let runner = Arc::clone(&manager);
        let run_task = tokio::spawn(async move { runner.run(shutdown_rx).await });

        timeout(Duration::from_secs(5), manager.wait_ready())
            .await
            .expect("manager did not become ready");
        assert!(manager.is_ready());

        Self {
            manager,
            shutdown,
            run_task,
            run_root,
        }
    }

    fn work_dir(&self, component_id: &str) -> PathBuf {
        self.run_root.path().join(component_id)
    }

    async fn stop(self) {
        let _ = self.shutdown.send(true);
        timeout(Duration::from_secs(15), self.run_task)
            .await
            .expect("manager did not stop")
            .expect("run task panicked")
            .expect("run returned error");
    }
}

fn command_spec() -> CommandSpec {
    CommandSpec {
        timeouts: CommandTimeouts {
            checkin: Duration::from_secs(1),
            restart: Duration::from_millis(10),
            stop: Duration::from_secs(5),
        },
        ..Default::default()
    }
}

fn fake_component(id: &str, units: &[(&str, Value)]) -> Component {
    Component {
        id: id.to_string(),
        spec: Some(RuntimeSpec::Input(InputRuntimeSpec {
            input_type: "fake".to_string(),
            binary_name: "fake-worker".to_string(),
            binary_path: PathBuf::from(FAKE_WORKER),
            command: command_spec(),
        })),
        error: None,
        features: None,
        apm_config: None,
        limits: None,
        shipper_ref: None,
        units: units
            .iter()
            .map(|(unit_id, config)| Unit {
                unit_type: UnitType::Input,
                id: unit_id.to_string(),
                log_level: LogLevel::Debug,
                config: Some(config.clone()),
                error: None,
            })
            .collect(),
    }
}

fn healthy_config(message: &str) -> Value {
    json!({"state": 2, "message": message})
}

async fn wait_for_state<F>(
    sub: &mut Subscription,
    within: Duration,
    what: &str,
    mut pred: F,
) -> ComponentState
where
    F: FnMut(&ComponentState) -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    let mut last: Option<ComponentState> = None;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            panic!("timed out waiting for {what}; last state: {last:?}");
        }
        match timeout(remaining, sub.recv()).await {
            Ok(Some(state)) => {
                if pred(&state) {
                    return state;
                }
                last = Some(state);
            }
            Ok(None) => panic!("subscription ended while waiting for {what}; last: {last:?}"),
            Err(_) => panic!("timed out waiting for {what}; last state: {last:?}"),
        }
    }
}

fn unit_state(state: &ComponentState, key: &UnitKey) -> Option<UnitState> {
    state.units.get(key).map(|u| u.state)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// A component carrying a spec error is reported failed without ever
/// launching a process or creating a working directory.
#[tokio::test]
async fn spec_error_component_fails_without_process() {
    let harness = Harness::start().await;
    let mut sub = harness.manager.subscribe("error-default");

    let component = Component {
        id: "error-default".to_string(),
        spec: None,
        error: Some("hard-coded error".to_string()),
        features: None,
        apm_config: None,
        limits: None,
        shipper_ref: None,
        units: vec![Unit {
            unit_type: UnitType::Input,
            id: "error-input".to_string(),
            log_level: LogLevel::Info,
            config: None,
            error: None,
        }],
    };
    harness
        .manager
        .update(Model::new(vec![component]))
        .await
        .unwrap();

    let key = UnitKey::input("error-input");
    let state = wait_for_state(&mut sub, Duration::from_secs(10), "failed state", |s| {
        s.state == UnitState::Failed
    })
    .await;

    assert_eq!(state.message, "hard-coded error");
    assert_eq!(unit_state(&state, &key), Some(UnitState::Failed));
    assert_eq!(
        state.units.get(&key).unwrap().message,
        "hard-coded error"
    );
    assert_eq!(state.pid, None);
    assert!(!harness.work_dir("error-default").exists());

    harness.stop().await;
}

/// Simple start/stop: Starting → Healthy, then an empty model stops the
/// component and removes its working directory.
#[tokio::test]
async fn fake_input_start_stop() {
    let harness = Harness::start().await;
    let mut sub = harness.manager.subscribe("fake-default");

    let component = fake_component(
        "fake-default",
        &[("fake-input", healthy_config("Fake Healthy"))],
    );
    harness
        .manager
        .update(Model::new(vec![component]))
        .await
        .unwrap();

    let key = UnitKey::input("fake-input");
    let healthy = wait_for_state(&mut sub, Duration::from_secs(30), "healthy unit", |s| {
        unit_state(s, &key) == Some(UnitState::Healthy)
    })
    .await;
    assert_eq!(healthy.units.get(&key).unwrap().message, "Fake Healthy");
    assert!(healthy.pid.is_some());
    assert!(harness.work_dir("fake-default").exists());

    harness.manager.update(Model::new(vec![])).await.unwrap();

    wait_for_state(&mut sub, Duration::from_secs(30), "stopped", |s| {
        s.state == UnitState::Stopped
    })
    .await;

    // The subscription ends once the component is gone.
    assert!(
        timeout(Duration::from_secs(10), sub.recv())
            .await
            .expect("subscription should end")
            .is_none()
    );
    assert!(!harness.work_dir("fake-default").exists());
    assert!(harness.manager.state().get("fake-default").is_none());

    harness.stop().await;
}

/// A unit with a config error is reported failed while its sibling runs;
/// fixing the unit brings it up without restarting the process.
#[tokio::test]
async fn bad_unit_recovers_without_restart() {
    let harness = Harness::start().await;
    let mut sub = harness.manager.subscribe("fake-default");

    let good = UnitKey::input("good-input");
    let bad = UnitKey::input("bad-input");

    let mut component = fake_component(
        "fake-default",
        &[("good-input", healthy_config("Fake Healthy"))],
    );
    component.units.push(Unit {
        unit_type: UnitType::Input,
        id: "bad-input".to_string(),
        log_level: LogLevel::Info,
        config: None,
        error: Some("invalid unit config".to_string()),
    });
    harness
        .manager
        .update(Model::new(vec![component.clone()]))
        .await
        .unwrap();

    let state = wait_for_state(
        &mut sub,
        Duration::from_secs(30),
        "good healthy, bad failed",
        |s| {
            unit_state(s, &good) == Some(UnitState::Healthy)
                && unit_state(s, &bad) == Some(UnitState::Failed)
        },
    )
    .await;
    assert_eq!(
        state.units.get(&bad).unwrap().message,
        "invalid unit config"
    );
    let pid_before = state.pid.expect("pid while healthy");

    // Fix the bad unit in place.
    component.units[1].error = None;
    component.units[1].config = Some(healthy_config("Now Healthy"));
    harness
        .manager
        .update(Model::new(vec![component]))
        .await
        .unwrap();

    let state = wait_for_state(&mut sub, Duration::from_secs(30), "both healthy", |s| {
        unit_state(s, &good) == Some(UnitState::Healthy)
            && unit_state(s, &bad) == Some(UnitState::Healthy)
    })
    .await;
    assert_eq!(state.units.get(&bad).unwrap().message, "Now Healthy");
    assert_eq!(state.pid, Some(pid_before), "unit fix must not restart");

    harness.stop().await;
}

/// `set_state` drives a unit to Degraded with the action's message; unknown
/// action names surface the worker's `action undefined` error.
#[tokio::test]
async fn action_set_state_and_unknown_action() {
    let harness = Harness::start().await;
    let mut sub = harness.manager.subscribe("fake-default");

    let key = UnitKey::input("fake-input");
    harness
        .manager
        .update(Model::new(vec![fake_component(
            "fake-default",
            &[("fake-input", healthy_config("Fake Healthy"))],
        )]))
        .await
        .unwrap();

    wait_for_state(&mut sub, Duration::from_secs(30), "healthy", |s| {
        unit_state(s, &key) == Some(UnitState::Healthy)
    })
    .await;

    harness
        .manager
        .perform_action(
            "fake-default",
            Some(key.clone()),
            "set_state",
            json!({"state": 3, "message": "Action Set Degraded"}),
            Duration::from_secs(5),
        )
        .await
        .expect("set_state should succeed");

    let state = wait_for_state(&mut sub, Duration::from_secs(30), "degraded unit", |s| {
        unit_state(s, &key) == Some(UnitState::Degraded)
    })
    .await;
    assert_eq!(
        state.units.get(&key).unwrap().message,
        "Action Set Degraded"
    );

    let err = harness
        .manager
        .perform_action(
            "fake-default",
            None,
            "definitely-not-an-action",
            json!({}),
            Duration::from_secs(5),
        )
        .await
        .expect_err("unknown action must fail");
    match err {
        ActionError::Worker(message) => assert_eq!(message, "action undefined"),
        other => panic!("unexpected error: {other}"),
    }

    harness.stop().await;
}

/// Features pushed with the model are retrievable from the worker through
/// the reserved action.
#[tokio::test]
async fn retrieve_features_round_trip() {
    let harness = Harness::start().await;
    let mut sub = harness.manager.subscribe("fake-default");

    let key = UnitKey::input("fake-input");
    let mut component = fake_component(
        "fake-default",
        &[("fake-input", healthy_config("Fake Healthy"))],
    );
    component.features = Some(Features { fqdn: true });
    harness
        .manager
        .update(Model::new(vec![component]))
        .await
        .unwrap();

    wait_for_state(&mut sub, Duration::from_secs(30), "healthy", |s| {
        unit_state(s, &key) == Some(UnitState::Healthy)
    })
    .await;

    let features = harness
        .manager
        .perform_action(
            "fake-default",
            None,
            "retrieve_features",
            json!({}),
            Duration::from_secs(5),
        )
        .await
        .expect("retrieve_features");
    assert_eq!(features["fqdn"], true);

    harness.stop().await;
}

/// With a worker that checks in far slower than the component's check-in
/// timeout, the runtime walks Healthy → Degraded → Failed and kills the
/// process.
#[tokio::test]
async fn missed_checkins_degrade_then_fail() {
    // Workers check in every 5s; the component expects 500ms.
    let harness = Harness::start_with(Duration::from_secs(5)).await;
    let mut sub = harness.manager.subscribe("fake-default");

    let mut component = fake_component(
        "fake-default",
        &[("fake-input", healthy_config("Fake Healthy"))],
    );
    if let Some(RuntimeSpec::Input(spec)) = &mut component.spec {
        spec.command.timeouts.checkin = Duration::from_millis(500);
    }
    harness
        .manager
        .update(Model::new(vec![component]))
        .await
        .unwrap();

    let mut saw_healthy = false;
    let mut saw_degraded = false;
    wait_for_state(&mut sub, Duration::from_secs(30), "failed on checkins", |s| {
        match s.state {
            UnitState::Healthy => saw_healthy = true,
            UnitState::Degraded => saw_degraded = true,
            _ => {}
        }
        s.state == UnitState::Failed && s.message.contains("check-in")
    })
    .await;

    assert!(saw_healthy, "expected a healthy state before degradation");
    assert!(saw_degraded, "expected a degraded state before failure");

    harness.stop().await;
}

/// A worker that kills itself on an interval keeps cycling through
/// Stopped → Starting → Healthy while the restart budget holds, and never
/// reaches Failed.
#[tokio::test]
async fn restart_budget_keeps_restarting() {
    let harness = Harness::start().await;
    let mut sub = harness.manager.subscribe("fake-default");

    let mut component = fake_component(
        "fake-default",
        &[(
            "fake-input",
            json!({
                "state": 2,
                "message": "Fake Healthy",
                "kill_on_interval": true,
                "kill_interval_ms": 300,
            }),
        )],
    );
    if let Some(RuntimeSpec::Input(spec)) = &mut component.spec {
        spec.command.restart = RestartLimits {
            max_restarts_per_period: 10,
            restart_monitoring_period: Duration::from_secs(1),
        };
    }
    harness
        .manager
        .update(Model::new(vec![component]))
        .await
        .unwrap();

    // Each worker instance has its own pid; three distinct healthy pids
    // means three full stop/start cycles.
    let mut healthy_pids = std::collections::BTreeSet::new();
    wait_for_state(&mut sub, Duration::from_secs(60), "three healthy cycles", |s| {
        assert_ne!(
            s.state,
            UnitState::Failed,
            "restart budget must not be exceeded: {}",
            s.message
        );
        if s.state == UnitState::Healthy {
            if let Some(pid) = s.pid {
                healthy_pids.insert(pid);
            }
        }
        healthy_pids.len() >= 3
    })
    .await;

    harness.stop().await;
}

/// Output change: replacing component fake-0 with fake-1 stops fake-0
/// completely before fake-1 starts.
#[tokio::test]
async fn output_change_orders_stop_before_start() {
    let harness = Harness::start().await;
    let mut sub0 = harness.manager.subscribe("fake-0");
    let mut sub1 = harness.manager.subscribe("fake-1");

    let key = UnitKey::input("fake-input");
    harness
        .manager
        .update(Model::new(vec![fake_component(
            "fake-0",
            &[("fake-input", healthy_config("Fake Healthy"))],
        )]))
        .await
        .unwrap();

    wait_for_state(&mut sub0, Duration::from_secs(30), "fake-0 healthy", |s| {
        unit_state(s, &key) == Some(UnitState::Healthy)
    })
    .await;

    harness
        .manager
        .update(Model::new(vec![fake_component(
            "fake-1",
            &[("fake-input", healthy_config("Fake Healthy"))],
        )]))
        .await
        .unwrap();

    let stopped = wait_for_state(&mut sub0, Duration::from_secs(30), "fake-0 stopped", |s| {
        s.state == UnitState::Stopped
    })
    .await;

    let first_of_new = timeout(Duration::from_secs(30), sub1.recv())
        .await
        .expect("fake-1 state")
        .expect("fake-1 stream open");

    // Every fake-1 publication happens after fake-0 reached Stopped.
    assert!(
        stopped.observed_at <= first_of_new.observed_at,
        "fake-1 started (at {}) before fake-0 stopped (at {})",
        first_of_new.observed_at,
        stopped.observed_at
    );

    wait_for_state(&mut sub1, Duration::from_secs(30), "fake-1 healthy", |s| {
        unit_state(s, &key) == Some(UnitState::Healthy)
    })
    .await;

    harness.stop().await;
}

/// The `kill` action never responds, so the call returns deadline exceeded;
/// the component then restarts and returns to Healthy.
#[tokio::test]
async fn action_timeout_on_kill_then_recovery() {
    let harness = Harness::start().await;
    let mut sub = harness.manager.subscribe("fake-default");

    let key = UnitKey::input("fake-input");
    harness
        .manager
        .update(Model::new(vec![fake_component(
            "fake-default",
            &[("fake-input", healthy_config("Fake Healthy"))],
        )]))
        .await
        .unwrap();

    let healthy = wait_for_state(&mut sub, Duration::from_secs(30), "healthy", |s| {
        unit_state(s, &key) == Some(UnitState::Healthy)
    })
    .await;
    let pid_before = healthy.pid.expect("pid while healthy");

    let err = harness
        .manager
        .perform_action(
            "fake-default",
            None,
            "kill",
            json!({}),
            Duration::from_millis(500),
        )
        .await
        .expect_err("kill cannot complete");
    assert!(
        matches!(err, ActionError::DeadlineExceeded),
        "expected deadline exceeded, got: {err}"
    );

    let recovered = wait_for_state(
        &mut sub,
        Duration::from_secs(30),
        "healthy with a new process",
        |s| unit_state(s, &key) == Some(UnitState::Healthy) && s.pid != Some(pid_before),
    )
    .await;
    assert!(recovered.pid.is_some());

    harness.stop().await;
}

/// Applying the same model twice is a no-op: no restart, no version bump.
#[tokio::test]
async fn identical_update_is_a_noop() {
    let harness = Harness::start().await;
    let mut sub = harness.manager.subscribe("fake-default");

    let key = UnitKey::input("fake-input");
    let component = fake_component(
        "fake-default",
        &[("fake-input", healthy_config("Fake Healthy"))],
    );
    harness
        .manager
        .update(Model::new(vec![component.clone()]))
        .await
        .unwrap();

    let healthy = wait_for_state(&mut sub, Duration::from_secs(30), "healthy", |s| {
        unit_state(s, &key) == Some(UnitState::Healthy)
    })
    .await;

    harness
        .manager
        .update(Model::new(vec![component]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let after = harness
        .manager
        .state()
        .remove("fake-default")
        .expect("component state");
    assert_eq!(after.state, UnitState::Healthy);
    assert_eq!(after.pid, healthy.pid);
    assert_eq!(after.expected_version, healthy.expected_version);

    harness.stop().await;
}

/// Removing then re-adding an identical component is a full stop/start
/// cycle, not an elision.
#[tokio::test]
async fn remove_then_readd_restarts() {
    let harness = Harness::start().await;
    let mut sub = harness.manager.subscribe("fake-default");

    let key = UnitKey::input("fake-input");
    let component = fake_component(
        "fake-default",
        &[("fake-input", healthy_config("Fake Healthy"))],
    );
    harness
        .manager
        .update(Model::new(vec![component.clone()]))
        .await
        .unwrap();
    let healthy = wait_for_state(&mut sub, Duration::from_secs(30), "healthy", |s| {
        unit_state(s, &key) == Some(UnitState::Healthy)
    })
    .await;
    let pid_before = healthy.pid.expect("pid");

    harness.manager.update(Model::new(vec![])).await.unwrap();
    harness
        .manager
        .update(Model::new(vec![component]))
        .await
        .unwrap();

    // The old instance tears down completely; its subscription ends.
    loop {
        match timeout(Duration::from_secs(30), sub.recv())
            .await
            .expect("old instance teardown")
        {
            Some(_) => continue,
            None => break,
        }
    }

    let mut sub = harness.manager.subscribe("fake-default");
    let recovered = wait_for_state(
        &mut sub,
        Duration::from_secs(30),
        "healthy after re-add",
        |s| unit_state(s, &key) == Some(UnitState::Healthy) && s.pid != Some(pid_before),
    )
    .await;
    assert_ne!(recovered.pid, Some(pid_before));

    harness.stop().await;
}

/// Continuous update spam keeps completing; the reconciler never deadlocks
/// against its runtimes.
#[tokio::test]
async fn update_spam_makes_progress() {
    let harness = Harness::start().await;
    let mut sub = harness.manager.subscribe("fake-default");

    let key = UnitKey::input("fake-input");
    for i in 0..50 {
        let component = fake_component(
            "fake-default",
            &[("fake-input", healthy_config(&format!("Fake Healthy {i}")))],
        );
        timeout(
            Duration::from_secs(15),
            harness.manager.update(Model::new(vec![component])),
        )
        .await
        .expect("update stalled")
        .expect("update failed");
    }

    let state = wait_for_state(
        &mut sub,
        Duration::from_secs(30),
        "final config applied",
        |s| {
            s.units
                .get(&key)
                .map(|u| u.state == UnitState::Healthy && u.message == "Fake Healthy 49")
                .unwrap_or(false)
        },
    )
    .await;
    assert_eq!(state.state, UnitState::Healthy);

    harness.stop().await;
}
