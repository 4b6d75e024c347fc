//! Run lifecycle for one client.
//!
//! A [`Simulation`] holds what a client configured (generator, parameter
//! file, analysis, snapshot interval) and starts runs from it. Each run is a
//! tokio task that either replays a cached result or drives a generator and
//! an analyzer connected by a fresh [`Channel`], emitting [`StatusEvent`]s
//! for presentation layers.

use super::analyzer::{AnalyzerExit, AnalyzerWorker};
use super::cache::ResultCache;
use super::channel::{unblock_reader, Channel};
use super::generator::{GeneratorExit, GeneratorSpec, GeneratorWorker};
use crate::catalog::Catalog;
use crate::config::Settings;
use crate::engine::WorkerArgs;
use crate::error::SimError;
use crate::model::{ControlMessage, Param, RunConfiguration, Signal, StatusEvent};
use crate::params;
use crate::record::{load_reference, read_records, Normalization};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

/// Channel name used when a client does not pick one.
pub const DEFAULT_FIFO: &str = "hepmc.fifo";

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Fresh results, now cached.
    Completed { output: String },
    /// Results replayed from the cache; no workers started.
    Cached { output: String },
    Stopped,
    Failed,
    /// Not started: the run was not fully configured.
    Rejected,
}

#[derive(Debug, Clone)]
pub struct Simulation {
    settings: Arc<Settings>,
    cache: ResultCache,
    catalog: Catalog,
    generator: GeneratorSpec,
    fifo: String,
    analysis: Option<String>,
    interval: Option<u64>,
    event_tx: UnboundedSender<StatusEvent>,
}

impl Simulation {
    pub fn new(
        settings: Arc<Settings>,
        cache: ResultCache,
        generator: GeneratorSpec,
        fifo: impl Into<String>,
        event_tx: UnboundedSender<StatusEvent>,
    ) -> Self {
        let catalog = Catalog::new(settings.analysis_lib.clone());
        Self {
            settings,
            cache,
            catalog,
            generator,
            fifo: fifo.into(),
            analysis: None,
            interval: None,
            event_tx,
        }
    }

    pub fn set_analysis(&mut self, analysis: impl Into<String>) {
        self.analysis = Some(analysis.into());
    }

    pub fn set_interval(&mut self, interval: u64) {
        self.interval = Some(interval);
    }

    fn publish(&self, event: StatusEvent) {
        let _ = self.event_tx.send(event);
    }

    fn publish_error(&self, error: impl std::fmt::Display, signal: Signal) {
        self.publish(StatusEvent::Error(error.to_string()));
        self.publish(StatusEvent::Signal(signal));
    }

    /// Start a run in the background. Commands sent through the returned
    /// handle are relayed to the analyzer while the run is active.
    pub fn start(&self) -> SimulationHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let run = self.clone();
        let task = tokio::spawn(async move { run.run(cmd_rx).await });
        SimulationHandle {
            control: RunControl { cmd_tx },
            task,
        }
    }

    /// Execute one run to completion.
    pub async fn run(&self, cmd_rx: UnboundedReceiver<ControlMessage>) -> RunOutcome {
        let (analysis, interval) = match (&self.analysis, self.interval) {
            (None, _) => {
                self.publish_error(SimError::Setup("analysis"), Signal::RunError);
                return RunOutcome::Rejected;
            }
            (_, None) | (_, Some(0)) => {
                self.publish_error(SimError::Setup("snapshot interval"), Signal::RunError);
                return RunOutcome::Rejected;
            }
            (Some(a), Some(n)) => (a.clone(), n),
        };

        let params = match params::read_params(&self.generator.params_path()) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "cannot build run configuration");
                self.publish_error(e, Signal::RunError);
                return RunOutcome::Failed;
            }
        };
        let config = RunConfiguration::new(params, analysis);

        match self.cache.get(&config) {
            Ok(Some(file)) => return self.replay(&config, file),
            Ok(None) => {}
            // A broken store only costs us the shortcut.
            Err(e) => tracing::warn!(error = %e, "cache lookup failed, running anyway"),
        }
        self.simulate(config, interval, cmd_rx).await
    }

    fn replay(&self, config: &RunConfiguration, file: String) -> RunOutcome {
        tracing::info!(analysis = %config.analysis, file = %file, "cache hit");
        let path = self.settings.output_dir.join(&file);
        match read_records(&path, Normalization::Raw) {
            Ok(records) => {
                self.publish(StatusEvent::ResultFinal(records));
                if let Some(reference) = load_reference(&self.settings.refdata_dir, &config.analysis) {
                    self.publish(StatusEvent::ReferenceData(reference));
                }
                self.publish(StatusEvent::OutputFile(logical_name(&file)));
                self.publish(StatusEvent::Signal(Signal::RunEnd));
                RunOutcome::Cached { output: file }
            }
            Err(source) => {
                let stale = source.is_not_found();
                let err = SimError::CacheLookup { file, source };
                tracing::error!(error = %err, "cached results unusable");
                self.publish_error(&err, Signal::CacheError);
                if stale {
                    match self.cache.remove(config) {
                        Ok(_) => tracing::info!("stale cache entry evicted"),
                        Err(e) => tracing::warn!(error = %e, "stale cache entry not evicted"),
                    }
                }
                RunOutcome::Failed
            }
        }
    }

    async fn simulate(
        &self,
        config: RunConfiguration,
        interval: u64,
        mut cmd_rx: UnboundedReceiver<ControlMessage>,
    ) -> RunOutcome {
        let channel = match Channel::acquire(&self.settings.channel_root(), &self.fifo) {
            Ok(c) => c,
            Err(e) => {
                self.publish_error(SimError::from(e), Signal::RunError);
                return RunOutcome::Failed;
            }
        };

        let mut generator = match GeneratorWorker::start(&self.generator, channel.path(), self.event_tx.clone()) {
            Ok(g) => g,
            Err(e) => {
                tracing::error!(error = %e, "generator launch failed");
                self.publish_error(e, Signal::RunError);
                return RunOutcome::Failed;
            }
        };
        self.publish(StatusEvent::Signal(Signal::GeneratorRunning));

        if !self.settings.settle_delay.is_zero() {
            tokio::time::sleep(self.settings.settle_delay).await;
        }

        let worker_args = WorkerArgs {
            channel: channel.path().to_path_buf(),
            analysis: config.analysis.clone(),
            interval,
            output_dir: self.settings.output_dir.clone(),
            refdata_dir: self.settings.refdata_dir.clone(),
            analysis_lib: self.settings.analysis_lib.clone(),
        };
        let launched = self
            .settings
            .analyzer_program()
            .map_err(|e| format!("{e:#}"))
            .and_then(|program| {
                AnalyzerWorker::start(&program, &worker_args, self.event_tx.clone()).map_err(|e| e.to_string())
            });
        let mut analyzer = match launched {
            Ok(a) => a,
            Err(e) => {
                tracing::error!(error = %e, "analyzer launch failed");
                generator.terminate();
                self.publish_error(e, Signal::RunError);
                self.finish_generator(&mut generator, channel).await;
                self.publish_raw_logs(generator.diagnostics(), Vec::new());
                return RunOutcome::Failed;
            }
        };
        self.publish(StatusEvent::Signal(Signal::AnalyzerRunning));

        let control = analyzer.control();
        let mut generator_exit = generator.exited();
        let mut generator_gone = false;
        let mut generator_failure: Option<String> = None;
        let mut commands_open = true;
        let mut stopped = false;
        let mut stop_deadline: Option<Instant> = None;
        let mut watchdog = tokio::time::interval(Duration::from_millis(500));

        let exit = loop {
            tokio::select! {
                cmd = cmd_rx.recv(), if commands_open => match cmd {
                    Some(ControlMessage::Pause) => control.pause(),
                    Some(ControlMessage::Resume) => control.resume(),
                    Some(ControlMessage::Stop) => {
                        if !stopped {
                            tracing::info!("stopping run");
                            stopped = true;
                            generator.terminate();
                            // A paused analyzer only listens for resume or stop.
                            control.resume();
                            control.stop();
                            stop_deadline = Some(Instant::now() + self.settings.analyzer_stop_timeout);
                        }
                    }
                    // Nobody left to steer the run; let it finish on its own.
                    None => commands_open = false,
                },
                exit = analyzer.wait() => break exit,
                announced = generator_exit.wait_for(Option::is_some), if !generator_gone => {
                    generator_gone = true;
                    let gen_exit = announced.ok().and_then(|e| (*e).clone());
                    if !stopped {
                        generator_failure = gen_exit.and_then(|e| e.failure());
                    }
                    unblock_reader(channel.path());
                }
                _ = watchdog.tick() => {
                    // The analyzer may open the channel after the generator is gone.
                    if generator_gone {
                        unblock_reader(channel.path());
                    }
                    if stop_deadline.is_some_and(|d| Instant::now() >= d) {
                        tracing::warn!(timeout = ?self.settings.analyzer_stop_timeout, "analyzer ignored stop, killing");
                        control.kill();
                        stop_deadline = None;
                    }
                }
            }
        };

        if !generator_gone && !stopped {
            generator_failure = generator_exit.borrow().as_ref().and_then(GeneratorExit::failure);
        }

        let output = match exit {
            AnalyzerExit::Completed(file) => Some(file),
            AnalyzerExit::Failed(reason) => {
                tracing::error!(reason = %reason, "analyzer failed");
                generator.terminate();
                self.publish_error(SimError::AnalyzerCrash(reason), Signal::RunError);
                None
            }
        };
        let output = match (output, generator_failure) {
            (Some(_), Some(reason)) => {
                tracing::error!(reason = %reason, "generator failed");
                self.publish_error(SimError::GeneratorFailed(reason), Signal::RunError);
                None
            }
            (output, _) => output,
        };

        self.finish_generator(&mut generator, channel).await;

        let outcome = match output {
            None => RunOutcome::Failed,
            Some(_) if stopped => {
                self.publish(StatusEvent::Signal(Signal::RunStopped));
                RunOutcome::Stopped
            }
            Some(file) => {
                if let Err(e) = self.cache.add(&config, &file) {
                    tracing::warn!(error = %e, "result not cached");
                    self.publish(StatusEvent::Error(SimError::from(e).to_string()));
                }
                self.publish(StatusEvent::Signal(Signal::RunEnd));
                RunOutcome::Completed { output: file }
            }
        };

        self.publish_raw_logs(generator.diagnostics(), analyzer.diagnostics());
        outcome
    }

    async fn finish_generator(&self, generator: &mut GeneratorWorker, channel: Channel) {
        let exit = generator.wait(self.settings.generator_exit_timeout).await;
        tracing::debug!(?exit, "generator reaped");
        self.publish(StatusEvent::Signal(Signal::GeneratorStopped));
        if let Err(e) = channel.release() {
            tracing::warn!(error = %e, "channel release failed");
        }
    }

    fn publish_raw_logs(&self, generator: Vec<String>, analyzer: Vec<String>) {
        self.publish(StatusEvent::RawGeneratorLog(generator.join("\n")));
        self.publish(StatusEvent::RawAnalyzerLog(analyzer.join("\n")));
    }

    /// Publish current values of `params` from the parameter file.
    pub fn load_params(&self, mut params: Vec<Param>) {
        match params::load_params(&self.generator.params_path(), &mut params) {
            Ok(()) => self.publish(StatusEvent::Params(params)),
            Err(e) => {
                tracing::warn!(error = %e, "loading parameters failed");
                self.publish(StatusEvent::Error(e.to_string()));
            }
        }
    }

    pub fn save_params(&self, params: &[Param]) {
        match params::save_params(&self.generator.params_path(), params) {
            Ok(()) => self.publish(StatusEvent::Signal(Signal::ParamsSaved)),
            Err(e) => {
                tracing::warn!(error = %e, "saving parameters failed");
                self.publish_error(SimError::from(e), Signal::ParamsError);
            }
        }
    }

    /// Publish the beam ids an analysis expects as `param` events.
    pub fn required_beams(&self, analysis: &str) {
        match self.catalog.required_beams(analysis) {
            Ok(Some((id_a, id_b))) => {
                self.publish(StatusEvent::Param("Beams-idA".into(), id_a.to_string()));
                self.publish(StatusEvent::Param("Beams-idB".into(), id_b.to_string()));
            }
            Ok(None) => tracing::debug!(analysis, "no beam requirements"),
            Err(e) => self.publish(StatusEvent::Error(e.to_string())),
        }
    }

    pub fn analysis_details(&self, analysis: &str) {
        match self.catalog.details(analysis) {
            Ok(details) => self.publish(StatusEvent::AnalysisDetails(Box::new(details))),
            Err(e) => self.publish(StatusEvent::Error(e.to_string())),
        }
    }

    /// Publish raw contents of earlier result files, by name in the output
    /// directory. Unreadable files are skipped.
    pub fn compare(&self, files: &[String]) {
        for name in files {
            let path = self.output_path(name);
            match read_records(&path, Normalization::Raw) {
                Ok(records) => self.publish(StatusEvent::CompareResult(records)),
                Err(e) => tracing::warn!(file = %name, error = %e, "skipping comparison file"),
            }
        }
    }

    fn output_path(&self, name: &str) -> PathBuf {
        let file = if name.ends_with(".yoda") {
            name.to_string()
        } else {
            format!("{name}.yoda")
        };
        // Only bare names inside the output directory.
        let file = std::path::Path::new(&file)
            .file_name()
            .map(|f| f.to_os_string())
            .unwrap_or_default();
        self.settings.output_dir.join(file)
    }
}

/// Result file name without its extension, as shown to clients.
fn logical_name(file: &str) -> String {
    file.strip_suffix(".yoda").unwrap_or(file).to_string()
}

/// Cloneable command sender for a background run. Commands sent after the
/// run ended are dropped.
#[derive(Debug, Clone)]
pub struct RunControl {
    cmd_tx: UnboundedSender<ControlMessage>,
}

impl RunControl {
    pub fn pause(&self) {
        let _ = self.cmd_tx.send(ControlMessage::Pause);
    }

    pub fn resume(&self) {
        let _ = self.cmd_tx.send(ControlMessage::Resume);
    }

    pub fn stop(&self) {
        let _ = self.cmd_tx.send(ControlMessage::Stop);
    }

    pub fn is_active(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

#[derive(Debug)]
pub struct SimulationHandle {
    control: RunControl,
    task: JoinHandle<RunOutcome>,
}

impl SimulationHandle {
    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn stop(&self) {
        self.control.stop();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> RunOutcome {
        self.task.await.unwrap_or_else(|e| {
            tracing::error!(error = %e, "run task failed");
            RunOutcome::Failed
        })
    }
}
