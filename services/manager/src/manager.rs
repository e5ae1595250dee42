//! Manager core: the reconciler.
//!
//! A single mailbox task owns the set of component runtimes. Model updates,
//! action submissions, and runtime teardown events all flow through it, so
//! component-level bookkeeping needs no locks. Update processing never
//! blocks on worker I/O; state publication goes straight from the runtimes
//! to the [`StateBus`], so subscribers and `state()` stay live no matter how
//! fast updates arrive.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use foreman_model::{diff, Component, ComponentState, Model, ModelError, UnitKey};
use foreman_wire::ActionRequest;

use crate::actions::ActionError;
use crate::bus::{StateBus, Subscription};
use crate::command::CommandRunner;
use crate::config::Config;
use crate::runtime::{spawn_runtime, RuntimeCommand, RuntimeEvent, RuntimeShared};
use crate::server::{run_checkin_server, TokenRegistry};
use crate::tls::{CertificateAuthority, TlsError};

/// Fatal setup errors. Everything after a successful bind is per-component
/// and never brings the manager down.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("failed to bind check-in listener on {addr}: {source}")]
    Listen {
        addr: String,
        source: std::io::Error,
    },

    #[error("failed to create run root {path}: {source}")]
    RunRoot {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("run may only be called once")]
    AlreadyRunning,
}

/// Errors returned synchronously from [`Manager::update`].
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Invalid(#[from] ModelError),

    #[error("manager is not running")]
    NotRunning,
}

enum ManagerCommand {
    Update {
        model: Model,
    },
    Action {
        component_id: String,
        request: ActionRequest,
        deadline: Instant,
        reply: oneshot::Sender<Result<Value, ActionError>>,
    },
}

/// The component runtime manager.
pub struct Manager {
    config: Config,
    cmd_tx: mpsc::Sender<ManagerCommand>,
    cmd_rx: Mutex<Option<mpsc::Receiver<ManagerCommand>>>,
    bus: Arc<StateBus>,
    ready: watch::Sender<bool>,
    local_addr: watch::Sender<Option<SocketAddr>>,
}

impl Manager {
    pub fn new(config: Config) -> Result<Self, ManagerError> {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        Ok(Self {
            config,
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            bus: Arc::new(StateBus::new()),
            ready: watch::channel(false).0,
            local_addr: watch::channel(None).0,
        })
    }

    /// Run until the shutdown signal trips. The check-in server is started
    /// before the ready flag flips. Clean shutdown returns `Ok(())`; only
    /// setup failures return an error.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), ManagerError> {
        let cmd_rx = self
            .cmd_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(ManagerError::AlreadyRunning)?;

        foreman_wire::client::init_crypto_provider();

        std::fs::create_dir_all(&self.config.run_root).map_err(|source| {
            ManagerError::RunRoot {
                path: self.config.run_root.clone(),
                source,
            }
        })?;

        let authority = Arc::new(CertificateAuthority::new()?);
        let tls_config = authority.server_config(&self.config.server_name)?;

        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(|source| ManagerError::Listen {
                addr: self.config.listen_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ManagerError::Listen {
            addr: self.config.listen_addr.clone(),
            source,
        })?;
        self.local_addr.send_replace(Some(local_addr));

        let registry = Arc::new(TokenRegistry::new());
        let server = tokio::spawn(run_checkin_server(
            listener,
            tls_config,
            Arc::clone(&registry),
            shutdown.clone(),
        ));

        let (events_tx, events_rx) = mpsc::channel(128);
        let shared = RuntimeShared {
            bus: Arc::clone(&self.bus),
            registry,
            authority,
            runner: Arc::new(CommandRunner::new(self.config.run_root.clone())),
            events: events_tx,
            connect_addr: local_addr.to_string(),
            server_name: self.config.server_name.clone(),
            worker_checkin_period: self.config.worker_checkin_period,
        };

        self.ready.send_replace(true);
        info!(addr = %local_addr, "runtime manager ready");

        let mut reconciler = Reconciler {
            shared,
            shutdown,
            cmd_rx,
            events_rx,
            runtimes: BTreeMap::new(),
            applied: BTreeMap::new(),
        };
        reconciler.run().await;

        self.ready.send_replace(false);
        server.abort();
        info!("runtime manager stopped");
        Ok(())
    }

    /// Enqueue a reconciliation against a new model. The returned error
    /// covers synchronous validation only; semantic errors from child
    /// processes surface through the published states.
    pub async fn update(&self, model: Model) -> Result<(), UpdateError> {
        model.validate()?;
        self.cmd_tx
            .send(ManagerCommand::Update { model })
            .await
            .map_err(|_| UpdateError::NotRunning)
    }

    /// Subscribe to a component's state stream. Delivers the current state
    /// immediately once one exists; dropping the handle cancels.
    pub fn subscribe(&self, component_id: &str) -> Subscription {
        self.bus.subscribe(component_id)
    }

    /// Snapshot of every component's latest state.
    pub fn state(&self) -> BTreeMap<String, ComponentState> {
        self.bus.snapshot()
    }

    /// Dispatch an action to a component (unit omitted) or one of its
    /// units, waiting at most `timeout` for the response.
    pub async fn perform_action(
        &self,
        component_id: &str,
        unit: Option<UnitKey>,
        name: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, ActionError> {
        let request = ActionRequest {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            unit,
            params,
        };
        let deadline = Instant::now() + timeout;
        let (reply_tx, reply_rx) = oneshot::channel();

        self.cmd_tx
            .send(ManagerCommand::Action {
                component_id: component_id.to_string(),
                request,
                deadline,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ActionError::Unavailable)?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Err(_) => Err(ActionError::DeadlineExceeded),
            Ok(Err(_)) => Err(ActionError::ConnectionClosed),
            Ok(Ok(result)) => result,
        }
    }

    /// True once the check-in server is accepting connections.
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until the manager is ready.
    pub async fn wait_ready(&self) {
        let mut rx = self.ready.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Bound address of the check-in listener, once running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.borrow()
    }
}

struct RuntimeEntry {
    cmd_tx: mpsc::Sender<RuntimeCommand>,
    removing: bool,
    stop_timeout: Duration,
}

struct Reconciler {
    shared: RuntimeShared,
    shutdown: watch::Receiver<bool>,
    cmd_rx: mpsc::Receiver<ManagerCommand>,
    events_rx: mpsc::Receiver<RuntimeEvent>,
    runtimes: BTreeMap<String, RuntimeEntry>,
    applied: BTreeMap<String, Component>,
}

impl Reconciler {
    async fn run(&mut self) {
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        break;
                    }
                }

                Some(event) = self.events_rx.recv() => self.handle_event(event),

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(ManagerCommand::Update { model }) => self.apply_update(model).await,
                    Some(ManagerCommand::Action { component_id, request, deadline, reply }) => {
                        self.route_action(component_id, request, deadline, reply).await;
                    }
                    None => break,
                },
            }
        }

        self.drain_on_shutdown().await;
    }

    async fn apply_update(&mut self, model: Model) {
        let changes = diff(&self.applied, &model);
        if changes.is_empty() {
            debug!("model unchanged");
            return;
        }
        info!(
            added = changes.added.len(),
            removed = changes.removed.len(),
            changed = changes.changed.len(),
            "applying model update"
        );

        // Signal removals. Entries stay in the map until their runtimes
        // report torn-down.
        for id in &changes.removed {
            self.applied.remove(id);
            let send_failed = match self.runtimes.get_mut(id) {
                Some(entry) => {
                    entry.removing = true;
                    entry.cmd_tx.send(RuntimeCommand::Stop).await.is_err()
                }
                None => false,
            };
            if send_failed {
                self.runtimes.remove(id);
                self.shared.bus.remove(id);
            }
        }

        // In-place changes and relaunches are the runtime's decision.
        for component in changes.changed {
            let id = component.id.clone();
            self.applied.insert(id.clone(), component.clone());
            if let Some(entry) = self.runtimes.get(&id) {
                if entry
                    .cmd_tx
                    .send(RuntimeCommand::Apply(Box::new(component)))
                    .await
                    .is_err()
                {
                    warn!(component_id = %id, "runtime unavailable for component change");
                }
            }
        }

        // Ordering: every removed component reaches Stopped before any
        // added component enters Starting.
        if !changes.added.is_empty() {
            self.await_teardowns().await;
        }

        for component in changes.added {
            let id = component.id.clone();
            if self.runtimes.contains_key(&id) {
                warn!(
                    component_id = %id,
                    "previous instance still tearing down; component deferred to next update"
                );
                continue;
            }
            let stop_timeout = component
                .command()
                .map(|c| c.timeouts.stop)
                .unwrap_or_default();
            self.applied.insert(id.clone(), component.clone());
            let handle = spawn_runtime(component, self.shared.clone(), self.shutdown.clone());
            self.runtimes.insert(
                id,
                RuntimeEntry {
                    cmd_tx: handle.cmd_tx,
                    removing: false,
                    stop_timeout,
                },
            );
        }
    }

    /// Drain runtime events until no removing entries remain or their stop
    /// timeouts pass. Never blocks on worker I/O, only on teardown
    /// notifications.
    async fn await_teardowns(&mut self) {
        let max_stop = self
            .runtimes
            .values()
            .filter(|entry| entry.removing)
            .map(|entry| entry.stop_timeout)
            .max()
            .unwrap_or_default();
        let deadline = Instant::now() + max_stop + Duration::from_secs(2);
        while self.runtimes.values().any(|entry| entry.removing) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("timed out waiting for component teardown");
                break;
            }
            match tokio::time::timeout(remaining, self.events_rx.recv()).await {
                Ok(Some(event)) => self.handle_event(event),
                Ok(None) => break,
                Err(_) => {
                    warn!("timed out waiting for component teardown");
                    break;
                }
            }
        }
    }

    async fn route_action(
        &mut self,
        component_id: String,
        request: ActionRequest,
        deadline: Instant,
        reply: oneshot::Sender<Result<Value, ActionError>>,
    ) {
        match self.runtimes.get(&component_id) {
            Some(entry) if !entry.removing => {
                let command = RuntimeCommand::Action {
                    request,
                    deadline,
                    reply,
                };
                if let Err(err) = entry.cmd_tx.send(command).await {
                    if let RuntimeCommand::Action { reply, .. } = err.0 {
                        let _ = reply.send(Err(ActionError::ConnectionClosed));
                    }
                }
            }
            _ => {
                let _ = reply.send(Err(ActionError::UnknownComponent(component_id)));
            }
        }
    }

    fn handle_event(&mut self, event: RuntimeEvent) {
        match event {
            RuntimeEvent::TornDown { component_id } => {
                let removing = self
                    .runtimes
                    .get(&component_id)
                    .map(|entry| entry.removing)
                    .unwrap_or(false);
                self.runtimes.remove(&component_id);
                if removing {
                    self.shared.bus.remove(&component_id);
                }
                debug!(component_id = %component_id, "runtime entry dropped");
            }
        }
    }

    /// Runtimes observe the same shutdown signal and stop themselves; wait
    /// here (bounded) for their teardown notifications.
    async fn drain_on_shutdown(&mut self) {
        let max_stop = self
            .applied
            .values()
            .filter_map(|c| c.command().map(|cmd| cmd.timeouts.stop))
            .max()
            .unwrap_or_default();
        let deadline = Instant::now() + max_stop + Duration::from_secs(5);

        info!(count = self.runtimes.len(), "waiting for component teardown");
        while !self.runtimes.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    remaining = self.runtimes.len(),
                    "shutdown drain timed out with runtimes still live"
                );
                break;
            }
            match tokio::time::timeout(remaining, self.events_rx.recv()).await {
                Ok(Some(event)) => self.handle_event(event),
                _ => break,
            }
        }
    }
}
