//! Worker process launch and reaping.
//!
//! Each component gets a working directory under the manager's run root,
//! recreated on every start and removed once the process has exited. The
//! connection-info blob is written to the child's stdin and the pipe closed;
//! stdout/stderr are drained into structured logs tagged with the component
//! id. Exits are always reaped to avoid zombies; `kill_on_drop` backstops
//! abnormal teardown paths.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use foreman_model::{Limits, RuntimeSpec};

/// Environment variable carrying the scheduler parallelism hint from
/// `Limits.max_procs`.
pub const ENV_MAX_PROCS: &str = "FOREMAN_MAX_PROCS";

/// Launch failures, distinguished so the runtime can log and back off
/// appropriately.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("binary not found: {0}")]
    NotFound(PathBuf),

    #[error("permission denied: {0}")]
    PermissionDenied(PathBuf),

    #[error("failed to exec {path}: {source}")]
    Exec {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("working directory: {0}")]
    WorkDir(std::io::Error),

    #[error("failed to write connection info: {0}")]
    Stdin(std::io::Error),
}

/// Launches worker processes under a run root.
pub struct CommandRunner {
    run_root: PathBuf,
}

impl CommandRunner {
    pub fn new(run_root: PathBuf) -> Self {
        Self { run_root }
    }

    /// Working directory for a component: `<run-root>/<component-id>`.
    pub fn work_dir(&self, component_id: &str) -> PathBuf {
        self.run_root.join(component_id)
    }

    /// Start the worker for a component.
    ///
    /// The working directory must not exist at start; any leftover from a
    /// previous instance is removed first. On launch failure the partial
    /// directory is cleaned up before returning.
    pub async fn start(
        &self,
        component_id: &str,
        spec: &RuntimeSpec,
        limits: Option<Limits>,
        conn_info: Vec<u8>,
    ) -> Result<RunningCommand, StartError> {
        let work_dir = self.work_dir(component_id);
        if work_dir.exists() {
            std::fs::remove_dir_all(&work_dir).map_err(StartError::WorkDir)?;
        }
        std::fs::create_dir_all(&work_dir).map_err(StartError::WorkDir)?;

        match self.spawn(component_id, spec, limits, conn_info, &work_dir).await {
            Ok(command) => Ok(command),
            Err(err) => {
                if let Err(cleanup) = std::fs::remove_dir_all(&work_dir) {
                    warn!(
                        component_id,
                        error = %cleanup,
                        "failed to remove working directory after launch failure"
                    );
                }
                Err(err)
            }
        }
    }

    async fn spawn(
        &self,
        component_id: &str,
        spec: &RuntimeSpec,
        limits: Option<Limits>,
        conn_info: Vec<u8>,
        work_dir: &Path,
    ) -> Result<RunningCommand, StartError> {
        let binary = spec.binary_path().to_path_buf();
        let command_spec = spec.command();

        let mut command = Command::new(&binary);
        command
            .args(&command_spec.args)
            .current_dir(work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &command_spec.env {
            command.env(key, value);
        }
        if let Some(max_procs) = limits.and_then(|l| l.max_procs) {
            command.env(ENV_MAX_PROCS, max_procs.to_string());
        }

        #[cfg(unix)]
        if let Some(run_as) = command_spec.run_as {
            command.uid(run_as.uid).gid(run_as.gid);
        }

        let mut child = command.spawn().map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => StartError::NotFound(binary.clone()),
            std::io::ErrorKind::PermissionDenied => StartError::PermissionDenied(binary.clone()),
            _ => StartError::Exec {
                path: binary.clone(),
                source: err,
            },
        })?;

        let pid = child.id();

        // Connection info goes to the child on stdin, terminated by EOF.
        if let Some(mut stdin) = child.stdin.take() {
            let write = async {
                stdin.write_all(&conn_info).await?;
                stdin.shutdown().await
            };
            if let Err(err) = write.await {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(StartError::Stdin(err));
            }
        }

        let mut io_tasks = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            io_tasks.push(spawn_output_task(component_id, "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            io_tasks.push(spawn_output_task(component_id, "stderr", stderr));
        }

        debug!(component_id, binary = %binary.display(), pid, "worker started");

        Ok(RunningCommand {
            component_id: component_id.to_string(),
            child,
            pid,
            work_dir: work_dir.to_path_buf(),
            io_tasks,
        })
    }
}

fn spawn_output_task<R>(component_id: &str, stream: &'static str, reader: R) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let component_id = component_id.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(
                component_id = %component_id,
                stream,
                line = %line,
                "worker output"
            );
        }
    })
}

/// A live worker process plus its working directory.
#[derive(Debug)]
pub struct RunningCommand {
    component_id: String,
    child: Child,
    pid: Option<u32>,
    work_dir: PathBuf,
    io_tasks: Vec<JoinHandle<()>>,
}

impl RunningCommand {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Wait for the process to exit. Cancel-safe; used inside the runtime's
    /// select loop.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Begin hard termination without waiting.
    pub fn start_kill(&mut self) {
        if let Err(err) = self.child.start_kill() {
            debug!(component_id = %self.component_id, error = %err, "kill failed");
        }
    }

    /// Hard-kill and reap.
    pub async fn kill_and_reap(&mut self) -> Option<ExitStatus> {
        self.start_kill();
        self.child.wait().await.ok()
    }

    /// Drain the output tasks and remove the working directory. Call after
    /// the exit has been reaped.
    pub async fn cleanup(self) {
        for task in self.io_tasks {
            let _ = task.await;
        }
        if let Err(err) = std::fs::remove_dir_all(&self.work_dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    component_id = %self.component_id,
                    error = %err,
                    "failed to remove working directory"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_model::{CommandSpec, InputRuntimeSpec};

    fn spec(path: &str) -> RuntimeSpec {
        RuntimeSpec::Input(InputRuntimeSpec {
            input_type: "fake".to_string(),
            binary_name: "fake".to_string(),
            binary_path: PathBuf::from(path),
            command: CommandSpec::default(),
        })
    }

    #[tokio::test]
    async fn missing_binary_is_distinguished() {
        let dir = tempfile::tempdir().unwrap();
        let runner = CommandRunner::new(dir.path().to_path_buf());

        let err = runner
            .start("c1", &spec("/nonexistent/worker-binary"), None, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StartError::NotFound(_)));

        // Partial working directory is cleaned up.
        assert!(!runner.work_dir("c1").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_reap_cleanup_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let runner = CommandRunner::new(dir.path().to_path_buf());

        let mut command = runner
            .start("c1", &spec("/bin/cat"), None, b"{}".to_vec())
            .await
            .unwrap();
        assert!(command.pid().is_some());
        assert!(runner.work_dir("c1").exists());

        // cat exits once stdin hits EOF, which start() already arranged.
        let status = command.wait().await.unwrap();
        assert!(status.success());

        command.cleanup().await;
        assert!(!runner.work_dir("c1").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_and_reap_terminates_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let runner = CommandRunner::new(dir.path().to_path_buf());

        let mut sleep_spec = spec("/bin/sleep");
        if let RuntimeSpec::Input(inner) = &mut sleep_spec {
            inner.command.args = vec!["60".to_string()];
        }
        let mut command = runner
            .start("c1", &sleep_spec, None, Vec::new())
            .await
            .unwrap();

        let status = command.kill_and_reap().await.unwrap();
        assert!(!status.success());
        command.cleanup().await;
        assert!(!runner.work_dir("c1").exists());
    }
}
