//! Analyzer worker process supervision.
//!
//! The analyzer is a separate OS process running `<program> analyze ...`.
//! Its event frames are republished on the run's event bus, its stderr is
//! kept as diagnostics and its exit status decides success or failure.

use crate::engine::WorkerArgs;
use crate::error::SimError;
use crate::model::{ControlMessage, StatusEvent, WorkerFrame};
use parking_lot::Mutex;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalyzerExit {
    /// Clean exit with the final result file name.
    Completed(String),
    Failed(String),
}

/// Cloneable handle for steering a running analyzer.
#[derive(Debug, Clone)]
pub struct AnalyzerControl {
    ctrl_tx: UnboundedSender<ControlMessage>,
    kill: Arc<Notify>,
}

impl AnalyzerControl {
    pub fn send(&self, msg: ControlMessage) {
        if self.ctrl_tx.send(msg).is_err() {
            tracing::debug!(?msg, "analyzer already gone");
        }
    }

    pub fn pause(&self) {
        self.send(ControlMessage::Pause);
    }

    pub fn resume(&self) {
        self.send(ControlMessage::Resume);
    }

    pub fn stop(&self) {
        self.send(ControlMessage::Stop);
    }

    /// Force the process down without waiting for it to finalize.
    pub fn kill(&self) {
        self.kill.notify_one();
    }
}

pub struct AnalyzerWorker {
    control: AnalyzerControl,
    supervisor: Option<JoinHandle<AnalyzerExit>>,
    exit: Option<AnalyzerExit>,
    diagnostics: Arc<Mutex<Vec<String>>>,
}

impl AnalyzerWorker {
    pub fn start(
        program: &Path,
        args: &WorkerArgs,
        event_tx: UnboundedSender<StatusEvent>,
    ) -> Result<Self, SimError> {
        let mut child = Command::new(program)
            .arg("analyze")
            .args(args.to_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SimError::Launch {
                worker: "analyzer",
                program: program.to_path_buf(),
                source,
            })?;
        tracing::info!(program = %program.display(), pid = ?child.id(), analysis = %args.analysis, "analyzer started");

        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let writer = child.stdin.take().map(|stdin| tokio::spawn(write_control(stdin, ctrl_rx)));

        let (output_tx, output_rx) = oneshot::channel();
        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(read_frames(out, event_tx, output_tx)));

        let diagnostics = Arc::new(Mutex::new(Vec::new()));
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
        let supervisor = tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill2.notified() => {
                    tracing::warn!("killing analyzer");
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            // Every event is on the bus before the exit is reported.
            for reader in [stdout, stderr].into_iter().flatten() {
                let _ = reader.await;
            }
            if let Some(writer) = writer {
                writer.abort();
            }
            classify(status, output_rx.await.ok())
        });

        Ok(Self {
            control: AnalyzerControl { ctrl_tx, kill },
            supervisor: Some(supervisor),
            exit: None,
            diagnostics,
        })
    }

    pub fn control(&self) -> AnalyzerControl {
        self.control.clone()
    }

    /// Wait for the process to end. Cancel-safe; repeated calls return the
    /// same exit.
    pub async fn wait(&mut self) -> AnalyzerExit {
        if let Some(exit) = &self.exit {
            return exit.clone();
        }
        let Some(handle) = self.supervisor.as_mut() else {
            return AnalyzerExit::Failed("not started".into());
        };
        let exit = handle
            .await
            .unwrap_or_else(|e| AnalyzerExit::Failed(format!("supervisor failed: {e}")));
        self.supervisor = None;
        self.exit = Some(exit.clone());
        exit
    }

    /// Captured stderr lines so far.
    pub fn diagnostics(&self) -> Vec<String> {
        self.diagnostics.lock().clone()
    }
}

fn classify(status: std::io::Result<ExitStatus>, output: Option<String>) -> AnalyzerExit {
    match status {
        Ok(s) if s.success() => match output {
            Some(file) => {
                tracing::info!(file = %file, "analyzer finished");
                AnalyzerExit::Completed(file)
            }
            None => AnalyzerExit::Failed("exited without reporting an output file".into()),
        },
        Ok(s) => AnalyzerExit::Failed(s.to_string()),
        Err(e) => AnalyzerExit::Failed(format!("wait failed: {e}")),
    }
}

async fn write_control(mut stdin: ChildStdin, mut ctrl_rx: UnboundedReceiver<ControlMessage>) {
    while let Some(msg) = ctrl_rx.recv().await {
        let Ok(mut line) = serde_json::to_string(&msg) else {
            continue;
        };
        line.push('\n');
        if stdin.write_all(line.as_bytes()).await.is_err() || stdin.flush().await.is_err() {
            tracing::debug!(?msg, "analyzer control pipe closed");
            return;
        }
    }
}

async fn read_frames(
    stdout: tokio::process::ChildStdout,
    event_tx: UnboundedSender<StatusEvent>,
    output_tx: oneshot::Sender<String>,
) {
    let mut output_tx = Some(output_tx);
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match serde_json::from_str::<WorkerFrame>(&line) {
            Ok(WorkerFrame::Event { event }) => {
                let _ = event_tx.send(event);
            }
            Ok(WorkerFrame::Output { file }) => match output_tx.take() {
                Some(tx) => {
                    let _ = tx.send(file);
                }
                None => tracing::warn!(file = %file, "duplicate output frame ignored"),
            },
            // Unframed output is still worth showing.
            Err(_) => {
                let _ = event_tx.send(StatusEvent::AnalyzerLine(line));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("analyzer.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn args() -> WorkerArgs {
        WorkerArgs {
            channel: "/tmp/none.fifo".into(),
            analysis: "X".into(),
            interval: 10,
            output_dir: "out".into(),
            refdata_dir: "ref".into(),
            analysis_lib: "lib".into(),
        }
    }

    fn drain(rx: &mut UnboundedReceiver<StatusEvent>) -> Vec<StatusEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    #[tokio::test]
    async fn relays_frames_and_hands_back_output() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(
            dir.path(),
            r#"echo '{"frame":"event","event":{"type":"analyzer-line","content":"Event no. 1 processed"}}'
echo plain text
echo diag >&2
echo '{"frame":"output","file":"final-1.yoda"}'"#,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut worker = AnalyzerWorker::start(&program, &args(), tx).unwrap();
        assert_eq!(worker.wait().await, AnalyzerExit::Completed("final-1.yoda".into()));
        assert_eq!(worker.wait().await, AnalyzerExit::Completed("final-1.yoda".into()));
        assert_eq!(
            drain(&mut rx),
            vec![
                StatusEvent::AnalyzerLine("Event no. 1 processed".into()),
                StatusEvent::AnalyzerLine("plain text".into()),
            ]
        );
        assert_eq!(worker.diagnostics(), vec!["diag"]);
    }

    #[tokio::test]
    async fn control_messages_reach_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(
            dir.path(),
            r#"read a; read b
echo "$a $b" >&2
echo '{"frame":"output","file":"final-2.yoda"}'"#,
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut worker = AnalyzerWorker::start(&program, &args(), tx).unwrap();
        let control = worker.control();
        control.pause();
        control.resume();
        assert!(matches!(worker.wait().await, AnalyzerExit::Completed(_)));
        assert_eq!(worker.diagnostics(), vec![r#""pause" "resume""#]);
    }

    #[tokio::test]
    async fn signal_death_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), "kill -9 $$");
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut worker = AnalyzerWorker::start(&program, &args(), tx).unwrap();
        assert!(matches!(worker.wait().await, AnalyzerExit::Failed(_)));
    }

    #[tokio::test]
    async fn clean_exit_without_output_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), "exit 0");
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut worker = AnalyzerWorker::start(&program, &args(), tx).unwrap();
        assert!(matches!(worker.wait().await, AnalyzerExit::Failed(r) if r.contains("output")));
    }

    #[tokio::test]
    async fn kill_stops_a_hung_analyzer() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), "exec sleep 60");
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut worker = AnalyzerWorker::start(&program, &args(), tx).unwrap();
        worker.control().kill();
        assert!(matches!(worker.wait().await, AnalyzerExit::Failed(_)));
    }
}
