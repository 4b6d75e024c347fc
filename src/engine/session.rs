//! Analyzer event loop with pause/resume/stop control and snapshots.

use super::Analysis;
use crate::error::SessionError;
use crate::model::{ControlMessage, Signal, StatusEvent};
use crate::record::{load_reference, read_records, Normalization, ResultRecord};
use std::path::{Path, PathBuf};
use time::macros::format_description;
use tokio::sync::mpsc::{error::TryRecvError, UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub analysis: String,
    /// Snapshot every this many events.
    pub interval: u64,
    pub output_dir: PathBuf,
    pub refdata_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyzerState {
    Initializing,
    Running,
    Paused,
    Finalizing,
    /// Source exhausted and final results written.
    Done,
    /// Stopped on request; final results written.
    Aborted,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub state: AnalyzerState,
    pub events: u64,
    pub snapshots: u64,
    /// Final result file name, relative to the output directory.
    pub output_file: String,
}

pub struct AnalyzerSession<A: Analysis> {
    analysis: A,
    settings: SessionSettings,
    control_rx: UnboundedReceiver<ControlMessage>,
    event_tx: UnboundedSender<StatusEvent>,
    state: AnalyzerState,
    events: u64,
    snapshots: u64,
    reference: Option<Vec<ResultRecord>>,
    reference_sent: bool,
}

impl<A: Analysis> AnalyzerSession<A> {
    pub fn new(
        analysis: A,
        settings: SessionSettings,
        control_rx: UnboundedReceiver<ControlMessage>,
        event_tx: UnboundedSender<StatusEvent>,
    ) -> Self {
        Self {
            analysis,
            settings,
            control_rx,
            event_tx,
            state: AnalyzerState::Initializing,
            events: 0,
            snapshots: 0,
            reference: None,
            reference_sent: false,
        }
    }

    pub fn state(&self) -> AnalyzerState {
        self.state
    }

    /// Run to completion on `source`. Blocking: call from a dedicated thread.
    ///
    /// Setup failures return an error without publishing any results.
    pub fn run(mut self, source: &Path) -> Result<SessionOutcome, SessionError> {
        match self.setup(source) {
            Ok(()) => {}
            Err(e) => {
                self.set_state(AnalyzerState::Failed);
                return Err(e);
            }
        }
        self.set_state(AnalyzerState::Running);
        let stopped = self.event_loop();
        self.finalize(stopped).inspect_err(|_| self.set_state(AnalyzerState::Failed))
    }

    fn setup(&mut self, source: &Path) -> Result<(), SessionError> {
        if self.settings.interval == 0 {
            return Err(SessionError::Interval);
        }
        std::fs::create_dir_all(&self.settings.output_dir).map_err(|source| SessionError::Write {
            path: self.settings.output_dir.clone(),
            source,
        })?;
        self.reference = load_reference(&self.settings.refdata_dir, &self.settings.analysis);
        tracing::info!(source = %source.display(), "opening event source");
        self.analysis
            .initialize(source)
            .map_err(|e| SessionError::Source {
                path: source.to_path_buf(),
                source: e,
            })
    }

    fn set_state(&mut self, state: AnalyzerState) {
        tracing::debug!(from = ?self.state, to = ?state, events = self.events, "analyzer state");
        self.state = state;
    }

    fn publish(&self, event: StatusEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns true when the loop ended on a stop request.
    fn event_loop(&mut self) -> bool {
        loop {
            if self.poll_control() {
                return true;
            }
            if !self.analysis.read_event() || !self.analysis.process_event() {
                return false;
            }
            self.events += 1;
            self.publish(StatusEvent::AnalyzerLine(format!(
                "Event no. {} processed",
                self.events
            )));
            if self.events % self.settings.interval == 0 {
                self.snapshot();
            }
        }
    }

    /// Non-blocking inbox check. Returns true on stop.
    fn poll_control(&mut self) -> bool {
        match self.control_rx.try_recv() {
            Ok(ControlMessage::Pause) => self.pause(),
            Ok(ControlMessage::Stop) => true,
            Ok(ControlMessage::Resume) | Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                false
            }
        }
    }

    /// Block until resumed or stopped. Returns true on stop.
    fn pause(&mut self) -> bool {
        self.set_state(AnalyzerState::Paused);
        self.publish(StatusEvent::Signal(Signal::AnalyzerStopped));
        loop {
            match self.control_rx.blocking_recv() {
                Some(ControlMessage::Resume) => {
                    self.set_state(AnalyzerState::Running);
                    self.publish(StatusEvent::Signal(Signal::AnalyzerRunning));
                    return false;
                }
                Some(ControlMessage::Pause) => {}
                // Nobody can resume us once the inbox is closed.
                Some(ControlMessage::Stop) | None => return true,
            }
        }
    }

    fn snapshot(&mut self) {
        let path = self.settings.output_dir.join(format!(
            "{}-{:08x}.yoda",
            timestamp(),
            rand::random::<u32>()
        ));
        let records = self
            .analysis
            .write_data(&path)
            .map_err(|source| SessionError::Write {
                path: path.clone(),
                source,
            })
            .and_then(|()| Ok(read_records(&path, Normalization::Normalized)?));
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "snapshot file not removed");
            }
        }

        match records {
            Ok(records) => {
                self.snapshots += 1;
                self.publish(StatusEvent::ResultBatch(records));
                self.publish_reference();
            }
            Err(e) => {
                tracing::warn!(error = %e, events = self.events, "snapshot failed");
                self.publish(StatusEvent::Error(format!("Snapshot failed: {e}")));
            }
        }
    }

    /// Reference records go out once per run, whether or not any exist.
    fn publish_reference(&mut self) {
        if self.reference_sent {
            return;
        }
        self.reference_sent = true;
        if let Some(reference) = self.reference.take() {
            self.publish(StatusEvent::ReferenceData(reference));
        }
    }

    fn finalize(&mut self, stopped: bool) -> Result<SessionOutcome, SessionError> {
        self.set_state(AnalyzerState::Finalizing);
        self.publish(StatusEvent::AnalyzerLine("Finished event loop".into()));
        self.analysis.finalize();

        let name = format!("final-{}", timestamp());
        let output_file = format!("{name}.yoda");
        let path = self.settings.output_dir.join(&output_file);
        self.analysis
            .write_data(&path)
            .map_err(|source| SessionError::Write {
                path: path.clone(),
                source,
            })?;
        let records = read_records(&path, Normalization::Raw)?;

        self.publish(StatusEvent::ResultFinal(records));
        self.publish_reference();
        self.publish(StatusEvent::OutputFile(name));

        self.set_state(if stopped {
            AnalyzerState::Aborted
        } else {
            AnalyzerState::Done
        });
        tracing::info!(events = self.events, snapshots = self.snapshots, file = %output_file, "analysis finished");
        Ok(SessionOutcome {
            state: self.state,
            events: self.events,
            snapshots: self.snapshots,
            output_file,
        })
    }
}

/// `YYYYmmdd-HHMMSSffffff` in UTC.
fn timestamp() -> String {
    let now = time::OffsetDateTime::now_utc();
    now.format(format_description!(
        "[year][month][day]-[hour][minute][second][subsecond digits:6]"
    ))
    .unwrap_or_else(|_| now.unix_timestamp_nanos().to_string())
}
