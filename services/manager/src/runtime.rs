//! Component runtime.
//!
//! One task per component in the model, sole mutator of that component's
//! state. Everything reaches it through messages: model changes and actions
//! from the reconciler, the authenticated worker stream from the check-in
//! server, frames from the per-connection reader task, process exits from
//! the reaper arm, and time from the check-in ticker.
//!
//! ```text
//! Starting ──launch ok──► (await check-in) ──first observed──► Running
//! Starting ──launch fail, restarts left──► Starting (backoff)
//! Starting ──launch fail, budget spent───► Failed
//! Running  ──expected version ahead──► published Configuring
//! Running  ──missed 1x check-in──► published Degraded
//! Running  ──missed 2x check-in──► published Failed, process killed
//! any      ──removed from model──► Stopping ──ack or timeout──► Stopped
//! Failed   ──window drains / model update──► Starting
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use foreman_model::{
    Component, ComponentState, LogLevel, UnitKey, UnitObserved, UnitState, VersionInfo,
};
use foreman_wire::{
    ActionRequest, ConnectionInfo, ExpectedMessage, ExpectedUnit, Frame, ObservedMessage,
};

use crate::actions::{ActionError, ActionTracker};
use crate::bus::StateBus;
use crate::command::{CommandRunner, RunningCommand};
use crate::restart::{BackoffPolicy, RestartTracker};
use crate::server::{TokenRegistry, WorkerConnection};
use crate::tls::CertificateAuthority;

/// How long a frame write may block before the stream is considered wedged
/// and dropped. Keeps the runtime mailbox draining under worker backpressure.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Commands accepted by a component runtime.
pub(crate) enum RuntimeCommand {
    /// Apply a new component definition (in-place or relaunch).
    Apply(Box<Component>),

    /// The component left the model: stop gracefully and tear down.
    Stop,

    /// Dispatch an action to the worker.
    Action {
        request: ActionRequest,
        deadline: Instant,
        reply: oneshot::Sender<Result<Value, ActionError>>,
    },
}

/// Notifications from runtimes back to the reconciler. Delivered on a
/// channel that is never awaited while the reconciler holds other work, so
/// runtimes cannot deadlock against the mailbox.
pub(crate) enum RuntimeEvent {
    /// The runtime finished teardown; the entry can be dropped.
    TornDown { component_id: String },
}

/// Collaborators shared by every runtime.
#[derive(Clone)]
pub(crate) struct RuntimeShared {
    pub bus: Arc<StateBus>,
    pub registry: Arc<TokenRegistry>,
    pub authority: Arc<CertificateAuthority>,
    pub runner: Arc<CommandRunner>,
    pub events: mpsc::Sender<RuntimeEvent>,
    /// Bound check-in address workers connect back to.
    pub connect_addr: String,
    pub server_name: String,
    /// Cadence workers are told to check in at.
    pub worker_checkin_period: Duration,
}

/// Handle held by the reconciler for one runtime.
pub(crate) struct RuntimeHandle {
    pub cmd_tx: mpsc::Sender<RuntimeCommand>,
}

/// Spawn the runtime task for a component.
pub(crate) fn spawn_runtime(
    component: Component,
    shared: RuntimeShared,
    shutdown: watch::Receiver<bool>,
) -> RuntimeHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (attach_tx, attach_rx) = mpsc::channel(1);

    let runtime = ComponentRuntime::new(component, shared, shutdown, cmd_rx, attach_tx, attach_rx);
    tokio::spawn(runtime.run());

    RuntimeHandle { cmd_tx }
}

enum StreamItem {
    Frame(Frame),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Launch pending, backing off, or awaiting the first check-in.
    Starting,
    /// Live stream established.
    Running,
    /// Graceful stop in progress.
    Stopping,
    /// No process and no pending relaunch (spec-error components, teardown).
    Stopped,
    /// Restart budget exhausted; waiting for the window to drain.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    /// Removed from the model; tear down afterwards.
    Removed,
    /// Manager shutdown; tear down afterwards.
    Shutdown,
    /// Spec change requires a new process; relaunch afterwards.
    Relaunch,
    /// Component now carries a terminal configuration error.
    SpecError,
}

struct ComponentRuntime {
    id: String,
    component: Component,
    shared: RuntimeShared,
    shutdown: watch::Receiver<bool>,
    cmd_rx: mpsc::Receiver<RuntimeCommand>,

    // Stream handoff from the check-in server. The sender side is
    // registered in the token registry under the current launch token.
    attach_tx: mpsc::Sender<WorkerConnection>,
    attach_rx: mpsc::Receiver<WorkerConnection>,

    // Live worker connection.
    writer: Option<SplitSink<WorkerConnection, Frame>>,
    reader_task: Option<JoinHandle<()>>,
    frame_rx: Option<mpsc::Receiver<StreamItem>>,

    // Live worker process.
    command: Option<RunningCommand>,
    token: Option<String>,

    // Outbound expected state, totally ordered by its version.
    expected: ExpectedMessage,
    /// Units removed from the model that have not yet confirmed Stopped.
    retiring: BTreeMap<UnitKey, LogLevel>,

    // Inbound observed state.
    observed_units: BTreeMap<UnitKey, UnitObserved>,
    observed_component: Option<(UnitState, String)>,
    applied_version: u64,
    version_info: Option<VersionInfo>,
    last_checkin: Option<Instant>,
    missed_checkin: bool,

    actions: ActionTracker,

    tracker: RestartTracker,
    backoff: BackoffPolicy,
    consecutive_failures: u32,
    had_healthy: bool,

    phase: Phase,
    stop_reason: Option<StopReason>,
    stop_deadline: Option<Instant>,
    relaunch_at: Option<Instant>,
    /// Set when the health machine kills the process so the exit handler
    /// keeps the Failed publication instead of reporting a crash.
    pending_kill: bool,

    last_published: Option<ComponentState>,
    done: bool,
}

impl ComponentRuntime {
    fn new(
        component: Component,
        shared: RuntimeShared,
        shutdown: watch::Receiver<bool>,
        cmd_rx: mpsc::Receiver<RuntimeCommand>,
        attach_tx: mpsc::Sender<WorkerConnection>,
        attach_rx: mpsc::Receiver<WorkerConnection>,
    ) -> Self {
        let timeouts = component
            .command()
            .map(|c| c.timeouts)
            .unwrap_or_default();
        let limits = component
            .command()
            .map(|c| c.restart)
            .unwrap_or_default();

        Self {
            id: component.id.clone(),
            shared,
            shutdown,
            cmd_rx,
            attach_tx,
            attach_rx,
            writer: None,
            reader_task: None,
            frame_rx: None,
            command: None,
            token: None,
            expected: ExpectedMessage::default(),
            retiring: BTreeMap::new(),
            observed_units: BTreeMap::new(),
            observed_component: None,
            applied_version: 0,
            version_info: None,
            last_checkin: None,
            missed_checkin: false,
            actions: ActionTracker::new(),
            tracker: RestartTracker::new(limits),
            backoff: BackoffPolicy::for_restart(timeouts.restart),
            consecutive_failures: 0,
            had_healthy: false,
            phase: Phase::Starting,
            stop_reason: None,
            stop_deadline: None,
            relaunch_at: None,
            pending_kill: false,
            last_published: None,
            done: false,
            component,
        }
    }

    fn checkin_timeout(&self) -> Duration {
        self.component
            .command()
            .map(|c| c.timeouts.checkin)
            .unwrap_or_default()
    }

    fn stop_timeout(&self) -> Duration {
        self.component
            .command()
            .map(|c| c.timeouts.stop)
            .unwrap_or_default()
    }

    fn tick_period(&self) -> Duration {
        (self.checkin_timeout() / 2).clamp(Duration::from_millis(10), Duration::from_secs(1))
    }

    async fn run(mut self) {
        info!(component_id = %self.id, "component runtime starting");

        self.publish_forced(UnitState::Starting, "Starting");
        if self.component.error.is_some() {
            self.phase = Phase::Stopped;
            self.publish_forced(UnitState::Failed, self.component_error());
        } else {
            self.rebuild_expected(&[]);
            self.start_launch().await;
        }

        let mut ticker = tokio::time::interval(self.tick_period());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !self.done {
            tokio::select! {
                biased;

                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        self.begin_stop(StopReason::Shutdown).await;
                    }
                }

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(RuntimeCommand::Apply(component)) => self.handle_apply(*component).await,
                    Some(RuntimeCommand::Stop) => self.begin_stop(StopReason::Removed).await,
                    Some(RuntimeCommand::Action { request, deadline, reply }) => {
                        self.handle_action(request, deadline, reply).await;
                    }
                    None => self.begin_stop(StopReason::Shutdown).await,
                },

                Some(conn) = self.attach_rx.recv() => self.handle_attach(conn).await,

                item = next_stream_item(&mut self.frame_rx) => self.handle_stream_item(item).await,

                exit = wait_exit(&mut self.command) => self.handle_exit(exit).await,

                _ = ticker.tick() => self.handle_tick().await,
            }
        }

        info!(component_id = %self.id, "component runtime torn down");
        let _ = self
            .shared
            .events
            .send(RuntimeEvent::TornDown {
                component_id: self.id.clone(),
            })
            .await;
    }

    fn component_error(&self) -> String {
        self.component
            .error
            .clone()
            .unwrap_or_else(|| "invalid component".to_string())
    }

    // ---------------------------------------------------------------------
    // Model changes
    // ---------------------------------------------------------------------

    async fn handle_apply(&mut self, next: Component) {
        let relaunch = self.component.requires_relaunch(&next);
        info!(
            component_id = %self.id,
            relaunch,
            "applying component change"
        );

        let was_error = self.component.error.is_some();
        let old_units = self.component.units.clone();

        if let Some(command) = next.command() {
            self.tracker.update_limits(command.restart);
            self.backoff = BackoffPolicy::for_restart(command.timeouts.restart);
        }

        if next.error.is_some() {
            self.component = next;
            if self.command.is_some() || self.writer.is_some() {
                self.begin_stop(StopReason::SpecError).await;
            } else {
                self.phase = Phase::Stopped;
                self.publish_forced(UnitState::Failed, self.component_error());
            }
            return;
        }

        self.component = next;

        if was_error {
            // Error cleared by this update: fresh start.
            self.retiring.clear();
            self.rebuild_expected(&[]);
            if self.command.is_none() {
                self.phase = Phase::Starting;
                self.start_launch().await;
            }
            return;
        }

        if self.rebuild_expected(&old_units) {
            self.send_expected().await;
        }

        if relaunch && (self.command.is_some() || self.writer.is_some()) {
            self.begin_stop(StopReason::Relaunch).await;
            return;
        }

        match self.phase {
            Phase::Failed => {
                // A model update grants an immediate retry.
                self.tracker.clear();
                self.consecutive_failures = 0;
                self.phase = Phase::Starting;
                self.start_launch().await;
            }
            Phase::Stopped => {
                self.phase = Phase::Starting;
                self.start_launch().await;
            }
            Phase::Running => self.publish_observed(),
            _ => {}
        }
    }

    /// Rebuild the expected message from the current component. Units that
    /// disappeared from the model are kept with desired state Stopped until
    /// the worker confirms. Returns true when the version was bumped.
    fn rebuild_expected(&mut self, old_units: &[foreman_model::Unit]) -> bool {
        let declared: BTreeSet<UnitKey> = self
            .component
            .units
            .iter()
            .filter(|u| u.error.is_none())
            .map(|u| u.key())
            .collect();

        for unit in old_units {
            if unit.error.is_none() && !declared.contains(&unit.key()) {
                self.retiring.insert(unit.key(), unit.log_level);
            }
        }
        self.retiring.retain(|key, _| !declared.contains(key));

        let stopping = self.phase == Phase::Stopping;
        let mut units = Vec::new();
        for unit in &self.component.units {
            if unit.error.is_some() {
                continue;
            }
            units.push(ExpectedUnit {
                key: unit.key(),
                state: if stopping {
                    UnitState::Stopped
                } else {
                    UnitState::Healthy
                },
                log_level: unit.log_level,
                config: unit.config.clone(),
            });
        }
        for (key, log_level) in &self.retiring {
            units.push(ExpectedUnit {
                key: key.clone(),
                state: UnitState::Stopped,
                log_level: *log_level,
                config: None,
            });
        }

        let candidate = ExpectedMessage {
            version: self.expected.version,
            units,
            features: self.component.features,
            apm_config: self.component.apm_config.clone(),
            limits: self.component.limits,
            component_config: None,
        };

        if candidate == self.expected {
            return false;
        }

        self.expected = candidate;
        self.expected.version += 1;
        debug!(
            component_id = %self.id,
            version = self.expected.version,
            units = self.expected.units.len(),
            "expected state changed"
        );
        true
    }

    async fn send_expected(&mut self) {
        if self.writer.is_none() {
            return;
        }
        let frame = Frame::Expected(self.expected.clone());
        let send = self.writer.as_mut().map(|w| w.send(frame));
        if let Some(send) = send {
            match tokio::time::timeout(WRITE_TIMEOUT, send).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(component_id = %self.id, error = %err, "expected write failed");
                    self.drop_stream();
                }
                Err(_) => {
                    warn!(component_id = %self.id, "expected write timed out; dropping stream");
                    self.drop_stream();
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Launch / exit
    // ---------------------------------------------------------------------

    async fn start_launch(&mut self) {
        if self.done
            || self.command.is_some()
            || self.component.error.is_some()
            || self.phase == Phase::Stopping
        {
            return;
        }
        let Some(spec) = self.component.spec.clone() else {
            self.phase = Phase::Stopped;
            self.publish_forced(UnitState::Failed, "component has no runtime spec");
            return;
        };

        let now = Instant::now();
        if !self.tracker.restart_allowed(now) {
            self.enter_failed_window(now);
            return;
        }

        self.relaunch_at = None;
        let token = Uuid::new_v4().to_string();

        let credentials = match self.shared.authority.issue_worker(&self.id) {
            Ok(credentials) => credentials,
            Err(err) => {
                warn!(component_id = %self.id, error = %err, "failed to issue worker certificate");
                self.schedule_retry(now, format!("failed to issue worker certificate: {err}"));
                return;
            }
        };

        let conn_info = ConnectionInfo {
            addr: self.shared.connect_addr.clone(),
            server_name: self.shared.server_name.clone(),
            token: token.clone(),
            checkin_period_ms: self.shared.worker_checkin_period.as_millis() as u64,
            ca_cert: ConnectionInfo::encode_der(&self.shared.authority.ca_der()),
            cert: ConnectionInfo::encode_der(&credentials.cert_der),
            key: ConnectionInfo::encode_der(&credentials.key_der),
        };
        let blob = match conn_info.to_json() {
            Ok(blob) => blob,
            Err(err) => {
                warn!(component_id = %self.id, error = %err, "failed to encode connection info");
                self.schedule_retry(now, format!("failed to encode connection info: {err}"));
                return;
            }
        };

        // Register before spawning so the worker can connect immediately.
        self.unregister_token();
        self.shared
            .registry
            .register(token.clone(), self.attach_tx.clone());

        // Launch attempts count against the restart window whether or not
        // the spawn succeeds.
        self.tracker.record_start(now);

        match self
            .shared
            .runner
            .start(&self.id, &spec, self.component.limits, blob)
            .await
        {
            Ok(command) => {
                self.token = Some(token);
                self.last_checkin = Some(now);
                self.missed_checkin = false;
                self.observed_units.clear();
                self.observed_component = None;
                self.applied_version = 0;
                self.version_info = None;
                self.phase = Phase::Starting;
                info!(
                    component_id = %self.id,
                    pid = command.pid(),
                    binary = %spec.binary_path().display(),
                    kind = spec.kind(),
                    "worker launched"
                );
                self.command = Some(command);
                self.publish_forced(UnitState::Starting, "Starting");
            }
            Err(err) => {
                self.shared.registry.unregister(&token);
                warn!(component_id = %self.id, error = %err, "worker launch failed");
                self.consecutive_failures += 1;
                self.schedule_retry(now, format!("launch failed: {err}"));
            }
        }
    }

    /// After a failed or aborted launch: back off and retry while the
    /// restart window allows, otherwise enter Failed until it drains.
    fn schedule_retry(&mut self, now: Instant, message: String) {
        if self.tracker.restart_allowed(now) {
            self.phase = Phase::Starting;
            let delay = self.backoff.delay(self.consecutive_failures);
            self.relaunch_at = Some(now + delay);
            self.publish_forced(UnitState::Starting, message);
        } else {
            self.publish_forced(UnitState::Failed, message);
            self.enter_failed_window(now);
        }
    }

    fn enter_failed_window(&mut self, now: Instant) {
        self.phase = Phase::Failed;
        let wait = self
            .tracker
            .time_until_slot(now)
            .unwrap_or_else(|| self.backoff.delay(self.consecutive_failures));
        self.relaunch_at = Some(now + wait);
        self.publish_forced(
            UnitState::Failed,
            format!("exceeded restart limit; retrying in {}ms", wait.as_millis()),
        );
    }

    async fn handle_exit(&mut self, exit: std::io::Result<std::process::ExitStatus>) {
        let status = match &exit {
            Ok(status) => status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            Err(err) => format!("wait failed: {err}"),
        };
        info!(component_id = %self.id, status = %status, "worker exited");

        if let Some(command) = self.command.take() {
            command.cleanup().await;
        }
        self.drop_stream();
        self.unregister_token();
        self.observed_units.clear();
        self.observed_component = None;
        self.applied_version = 0;

        if self.phase == Phase::Stopping {
            self.finish_stop().await;
            return;
        }

        let now = Instant::now();
        let killed = std::mem::take(&mut self.pending_kill);
        if self.had_healthy {
            // First restart after a healthy interval clears the window.
            self.tracker.clear();
            self.consecutive_failures = 0;
            self.had_healthy = false;
        } else {
            self.consecutive_failures += 1;
        }

        if !killed {
            self.publish_forced(
                UnitState::Stopped,
                format!("worker exited unexpectedly with status {status}"),
            );
        }

        if self.tracker.restart_allowed(now) {
            self.phase = Phase::Starting;
            let delay = self.backoff.delay(self.consecutive_failures);
            self.relaunch_at = Some(now + delay);
        } else {
            self.enter_failed_window(now);
        }
    }

    // ---------------------------------------------------------------------
    // Worker stream
    // ---------------------------------------------------------------------

    async fn handle_attach(&mut self, conn: WorkerConnection) {
        if self.done || self.phase == Phase::Stopped {
            debug!(component_id = %self.id, "dropping stream for stopped runtime");
            return;
        }

        debug!(component_id = %self.id, "worker stream attached");
        self.drop_stream();

        let (writer, reader) = conn.split();
        let (tx, rx) = mpsc::channel(128);
        self.reader_task = Some(spawn_reader(self.id.clone(), reader, tx));
        self.frame_rx = Some(rx);
        self.writer = Some(writer);
        self.last_checkin = Some(Instant::now());
        self.missed_checkin = false;

        self.send_expected().await;
    }

    async fn handle_stream_item(&mut self, item: StreamItem) {
        match item {
            StreamItem::Frame(Frame::Observed(observed)) => self.handle_observed(observed).await,
            StreamItem::Frame(Frame::ActionResponse(response)) => {
                if !self.actions.complete(response) {
                    debug!(component_id = %self.id, "response for unknown action id");
                }
            }
            StreamItem::Frame(frame) => {
                debug!(component_id = %self.id, frame = ?frame, "unexpected frame from worker");
            }
            StreamItem::Closed => {
                debug!(component_id = %self.id, "worker stream closed");
                self.drop_stream();
                if self.phase == Phase::Stopping {
                    // No ack is coming; stop now.
                    self.finish_stop().await;
                }
                // Otherwise treated as missed check-ins: the health machine
                // degrades and eventually kills the process.
            }
        }
    }

    async fn handle_observed(&mut self, observed: ObservedMessage) {
        self.last_checkin = Some(Instant::now());
        self.missed_checkin = false;
        self.applied_version = observed.applied_version;
        if self.version_info.is_none() {
            self.version_info = observed.version_info.clone();
        }

        self.observed_units = observed
            .units
            .iter()
            .map(|u| {
                (
                    u.key.clone(),
                    UnitObserved {
                        state: u.state,
                        message: u.message.clone(),
                        payload: u.payload.clone(),
                    },
                )
            })
            .collect();
        self.observed_component = Some((observed.state, observed.message.clone()));

        // Units being retired disappear from expected once the worker
        // confirms they stopped. Publish first so subscribers observe the
        // Stopped transition before the unit vanishes.
        let confirmed: Vec<UnitKey> = self
            .retiring
            .keys()
            .filter(|key| {
                self.observed_units
                    .get(*key)
                    .map(|u| u.state == UnitState::Stopped)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        if !confirmed.is_empty() {
            if self.phase == Phase::Starting {
                self.phase = Phase::Running;
            }
            if self.phase != Phase::Stopping {
                self.publish_observed();
            }
            for key in confirmed {
                self.retiring.remove(&key);
                self.observed_units.remove(&key);
            }
            let old_units = self.component.units.clone();
            if self.rebuild_expected(&old_units) {
                self.send_expected().await;
            }
        }

        if self.phase == Phase::Stopping {
            let all_stopped = observed.state == UnitState::Stopped
                || (!observed.units.is_empty()
                    && observed.units.iter().all(|u| u.state == UnitState::Stopped));
            if all_stopped {
                debug!(component_id = %self.id, "graceful stop acknowledged");
                self.finish_stop().await;
            }
            return;
        }

        if self.phase == Phase::Starting {
            self.phase = Phase::Running;
        }
        if observed.state == UnitState::Healthy && self.applied_version == self.expected.version {
            self.had_healthy = true;
            self.consecutive_failures = 0;
        }

        self.publish_observed();
    }

    fn drop_stream(&mut self) {
        self.writer = None;
        self.frame_rx = None;
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }

    // ---------------------------------------------------------------------
    // Actions
    // ---------------------------------------------------------------------

    async fn handle_action(
        &mut self,
        request: ActionRequest,
        deadline: Instant,
        reply: oneshot::Sender<Result<Value, ActionError>>,
    ) {
        if self.writer.is_none() {
            let _ = reply.send(Err(ActionError::NotConnected));
            return;
        }

        debug!(
            component_id = %self.id,
            action = %request.name,
            action_id = %request.id,
            "dispatching action"
        );
        self.actions.track(request.id.clone(), reply, deadline);

        let frame = Frame::ActionRequest(request);
        let send = self.writer.as_mut().map(|w| w.send(frame));
        if let Some(send) = send {
            match tokio::time::timeout(WRITE_TIMEOUT, send).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(component_id = %self.id, error = %err, "action write failed");
                    self.drop_stream();
                }
                Err(_) => {
                    warn!(component_id = %self.id, "action write timed out; dropping stream");
                    self.drop_stream();
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Stopping
    // ---------------------------------------------------------------------

    async fn begin_stop(&mut self, reason: StopReason) {
        if self.done {
            return;
        }
        if self.phase == Phase::Stopping {
            // Removal and shutdown trump an in-flight relaunch stop.
            if matches!(reason, StopReason::Removed | StopReason::Shutdown) {
                self.stop_reason = Some(reason);
            }
            return;
        }

        info!(component_id = %self.id, reason = ?reason, "stopping component");
        self.phase = Phase::Stopping;
        self.stop_reason = Some(reason);
        self.relaunch_at = None;

        if self.command.is_none() && self.writer.is_none() {
            self.finish_stop().await;
            return;
        }

        self.stop_deadline = Some(Instant::now() + self.stop_timeout());
        self.publish_forced(UnitState::Stopping, "Stopping");

        if self.writer.is_some() {
            // Graceful path: desired state Stopped for every unit.
            let old_units = self.component.units.clone();
            self.rebuild_expected(&old_units);
            self.send_expected().await;
        } else {
            // Nothing to signal on; go straight to the kill.
            self.finish_stop().await;
        }
    }

    async fn finish_stop(&mut self) {
        let reason = self.stop_reason.take().unwrap_or(StopReason::Removed);
        self.stop_deadline = None;

        if let Some(mut command) = self.command.take() {
            command.kill_and_reap().await;
            command.cleanup().await;
        }
        self.drop_stream();
        self.unregister_token();
        self.observed_units.clear();
        self.observed_component = None;
        self.applied_version = 0;

        match reason {
            StopReason::Removed | StopReason::Shutdown => {
                self.actions.fail_all();
                self.phase = Phase::Stopped;
                self.publish_forced(UnitState::Stopped, "Stopped");
                self.done = true;
            }
            StopReason::SpecError => {
                self.actions.fail_all();
                self.phase = Phase::Stopped;
                self.publish_forced(UnitState::Failed, self.component_error());
            }
            StopReason::Relaunch => {
                self.phase = Phase::Starting;
                self.publish_forced(UnitState::Stopped, "Stopped for restart");
                // The stop expected message must not leak to the next
                // worker instance.
                let old_units = self.component.units.clone();
                self.rebuild_expected(&old_units);
                self.start_launch().await;
            }
        }
    }

    // ---------------------------------------------------------------------
    // Ticker
    // ---------------------------------------------------------------------

    async fn handle_tick(&mut self) {
        let now = Instant::now();
        self.actions.prune_expired(now);

        if self.phase == Phase::Stopping {
            if let Some(deadline) = self.stop_deadline {
                if now >= deadline {
                    warn!(component_id = %self.id, "graceful stop timed out; killing");
                    self.finish_stop().await;
                }
            }
            return;
        }

        if let Some(at) = self.relaunch_at {
            if now >= at && self.command.is_none() {
                if self.phase == Phase::Failed && !self.tracker.restart_allowed(now) {
                    self.enter_failed_window(now);
                } else {
                    self.phase = Phase::Starting;
                    self.start_launch().await;
                }
                return;
            }
        }

        // Missed-checkin machine: 1x timeout degrades, 2x kills.
        if self.command.is_some() && matches!(self.phase, Phase::Starting | Phase::Running) {
            let timeout = self.checkin_timeout();
            if timeout.is_zero() {
                return;
            }
            let Some(last) = self.last_checkin else {
                return;
            };
            let elapsed = now.saturating_duration_since(last);
            if elapsed > timeout * 2 && !self.pending_kill {
                warn!(
                    component_id = %self.id,
                    elapsed_ms = elapsed.as_millis(),
                    "missed two check-ins; killing worker"
                );
                self.pending_kill = true;
                self.publish_forced(
                    UnitState::Failed,
                    format!("missed two check-ins: last check-in {}ms ago", elapsed.as_millis()),
                );
                if let Some(command) = self.command.as_mut() {
                    command.start_kill();
                }
            } else if elapsed > timeout && !self.missed_checkin {
                self.missed_checkin = true;
                self.publish_observed();
            }
        }
    }

    // ---------------------------------------------------------------------
    // State publication
    // ---------------------------------------------------------------------

    /// Publish a component-level transition, forcing every unit to the same
    /// state. Unit-level configuration errors still overlay Failed.
    fn publish_forced(&mut self, state: UnitState, message: impl Into<String>) {
        let message = message.into();
        let mut units = BTreeMap::new();
        for unit in &self.component.units {
            let observed = match &unit.error {
                Some(err) => UnitObserved::new(UnitState::Failed, err.clone()),
                None => UnitObserved::new(state, message.clone()),
            };
            units.insert(unit.key(), observed);
        }
        for key in self.retiring.keys() {
            units.insert(key.clone(), UnitObserved::new(state, message.clone()));
        }
        self.publish(state, message, units);
    }

    /// Publish from observed data, deriving the aggregate from check-in
    /// recency and the expected-version echo.
    fn publish_observed(&mut self) {
        let (state, message) = if self.missed_checkin {
            let ago = self
                .last_checkin
                .map(|t| t.elapsed().as_millis())
                .unwrap_or_default();
            (
                UnitState::Degraded,
                format!("missed check-in: last check-in {ago}ms ago"),
            )
        } else if self.applied_version < self.expected.version {
            (UnitState::Configuring, "Configuring".to_string())
        } else {
            self.observed_component
                .clone()
                .unwrap_or((UnitState::Starting, "Starting".to_string()))
        };

        let mut units = BTreeMap::new();
        for unit in &self.component.units {
            let key = unit.key();
            let observed = match &unit.error {
                Some(err) => UnitObserved::new(UnitState::Failed, err.clone()),
                None => self
                    .observed_units
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| UnitObserved::new(UnitState::Starting, "Starting")),
            };
            units.insert(key, observed);
        }
        for key in self.retiring.keys() {
            // A retiring unit reads Stopping until the worker confirms it
            // reached Stopped.
            let observed = match self.observed_units.get(key) {
                Some(unit) if unit.state == UnitState::Stopped => unit.clone(),
                _ => UnitObserved::new(UnitState::Stopping, "Stopping"),
            };
            units.insert(key.clone(), observed);
        }

        self.publish(state, message, units);
    }

    fn publish(&mut self, state: UnitState, message: String, units: BTreeMap<UnitKey, UnitObserved>) {
        let snapshot = ComponentState {
            state,
            message,
            units,
            pid: self.command.as_ref().and_then(RunningCommand::pid),
            expected_version: self.expected.version,
            version_info: self.version_info.clone(),
            observed_at: Utc::now(),
        };

        // Suppress no-op publications so applying an identical model twice
        // produces no state churn.
        if let Some(last) = &self.last_published {
            let mut candidate = snapshot.clone();
            candidate.observed_at = last.observed_at;
            if candidate == *last {
                return;
            }
        }

        debug!(
            component_id = %self.id,
            state = %snapshot.state,
            message = %snapshot.message,
            "component state changed"
        );
        self.last_published = Some(snapshot.clone());
        self.shared.bus.publish(&self.id, snapshot);
    }

    fn unregister_token(&mut self) {
        if let Some(token) = self.token.take() {
            self.shared.registry.unregister(&token);
        }
    }
}

fn spawn_reader(
    component_id: String,
    mut reader: SplitStream<WorkerConnection>,
    tx: mpsc::Sender<StreamItem>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(next) = reader.next().await {
            match next {
                Ok(frame) => {
                    if tx.send(StreamItem::Frame(frame)).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    debug!(component_id = %component_id, error = %err, "worker stream error");
                    break;
                }
            }
        }
        let _ = tx.send(StreamItem::Closed).await;
    })
}

async fn next_stream_item(rx: &mut Option<mpsc::Receiver<StreamItem>>) -> StreamItem {
    match rx {
        Some(rx) => match rx.recv().await {
            Some(item) => item,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

async fn wait_exit(
    command: &mut Option<RunningCommand>,
) -> std::io::Result<std::process::ExitStatus> {
    match command {
        Some(command) => command.wait().await,
        None => std::future::pending().await,
    }
}
