//! Event generator subprocess.

use super::channel::unblock_reader;
use crate::error::SimError;
use crate::model::StatusEvent;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc::UnboundedSender, watch, Notify};
use tokio::task::JoinHandle;

/// What to run: `<working_dir>/<executable> <params_file> <channel>`.
#[derive(Debug, Clone)]
pub struct GeneratorSpec {
    pub executable: PathBuf,
    pub params_file: PathBuf,
    pub working_dir: PathBuf,
}

impl GeneratorSpec {
    fn program(&self) -> PathBuf {
        if self.executable.is_absolute() {
            self.executable.clone()
        } else {
            self.working_dir.join(&self.executable)
        }
    }

    /// Parameter file as seen from the generator's working directory.
    pub fn params_path(&self) -> PathBuf {
        self.working_dir.join(&self.params_file)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeneratorExit {
    Exited(ExitStatus),
    /// Reaping the process failed.
    Lost(String),
}

impl GeneratorExit {
    /// Why this exit counts as a failure, if it does.
    pub fn failure(&self) -> Option<String> {
        match self {
            GeneratorExit::Exited(s) if s.success() => None,
            GeneratorExit::Exited(s) => Some(s.to_string()),
            GeneratorExit::Lost(e) => Some(e.clone()),
        }
    }
}

pub struct GeneratorWorker {
    kill: Arc<Notify>,
    supervisor: Option<JoinHandle<GeneratorExit>>,
    exit: Option<GeneratorExit>,
    exited: watch::Receiver<Option<GeneratorExit>>,
    diagnostics: Arc<Mutex<Vec<String>>>,
}

impl GeneratorWorker {
    /// Spawn the generator writing into `channel`. Stdout lines are published
    /// as [`StatusEvent::GeneratorLine`]; stderr is kept as diagnostics.
    pub fn start(
        spec: &GeneratorSpec,
        channel: &Path,
        event_tx: UnboundedSender<StatusEvent>,
    ) -> Result<Self, SimError> {
        let program = spec.program();
        let mut child = Command::new(&program)
            .arg(&spec.params_file)
            .arg(channel)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SimError::Launch {
                worker: "generator",
                program: program.clone(),
                source,
            })?;
        tracing::info!(program = %program.display(), pid = ?child.id(), "generator started");

        let diagnostics = Arc::new(Mutex::new(Vec::new()));
        let stdout = child.stdout.take().map(|out| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = event_tx.send(StatusEvent::GeneratorLine(line));
                }
            })
        });
        let stderr = child.stderr.take().map(|err| {
            let diagnostics = diagnostics.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    diagnostics.lock().push(line);
                }
            })
        });

        let kill = Arc::new(Notify::new());
        let kill2 = kill.clone();
        let channel = channel.to_path_buf();
        let (exit_tx, exited) = watch::channel(None);
        let supervisor = tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill2.notified() => {
                    tracing::info!("killing generator");
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            // Output readers finish once the pipes close.
            for reader in [stdout, stderr].into_iter().flatten() {
                let _ = reader.await;
            }
            // A reader still waiting in open() would otherwise never see a writer.
            unblock_reader(&channel);
            let exit = match status {
                Ok(s) => {
                    tracing::info!(status = %s, "generator exited");
                    GeneratorExit::Exited(s)
                }
                Err(e) => GeneratorExit::Lost(e.to_string()),
            };
            exit_tx.send_replace(Some(exit.clone()));
            exit
        });

        Ok(Self {
            kill,
            supervisor: Some(supervisor),
            exit: None,
            exited,
            diagnostics,
        })
    }

    /// Force the subprocess down. Harmless once it has exited.
    pub fn terminate(&self) {
        self.kill.notify_one();
    }

    /// Wait for exit, killing the process if it outlives `timeout`.
    pub async fn wait(&mut self, timeout: Duration) -> GeneratorExit {
        if let Some(exit) = &self.exit {
            return exit.clone();
        }
        let Some(mut handle) = self.supervisor.take() else {
            return GeneratorExit::Lost("not started".into());
        };
        let joined = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                tracing::warn!(?timeout, "generator did not exit in time");
                self.terminate();
                handle.await
            }
        };
        let exit = joined.unwrap_or_else(|e| GeneratorExit::Lost(e.to_string()));
        self.exit = Some(exit.clone());
        exit
    }

    /// Becomes `Some` once the process has exited and been reaped.
    pub fn exited(&self) -> watch::Receiver<Option<GeneratorExit>> {
        self.exited.clone()
    }

    /// Captured stderr lines so far.
    pub fn diagnostics(&self) -> Vec<String> {
        self.diagnostics.lock().clone()
    }
}
