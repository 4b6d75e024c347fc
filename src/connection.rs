//! Client connections and the actions they may send.
//!
//! A client speaks JSON objects tagged by `action`; everything it needs to
//! see comes back as [`StatusEvent`]s on the connection's own event channel.

use crate::config::Settings;
use crate::model::{Param, StatusEvent};
use crate::orchestrator::{GeneratorSpec, ResultCache, RunControl, RunOutcome, Simulation, SimulationHandle, DEFAULT_FIFO};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

fn default_fifo() -> String {
    DEFAULT_FIFO.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Bind the connection to a generator and its parameter file.
    Init {
        generator: PathBuf,
        params: PathBuf,
        #[serde(default = "default_fifo")]
        fifo: String,
    },
    LoadParams {
        params: Vec<Param>,
    },
    Run {
        analysis: String,
        histointerval: u64,
    },
    Pause,
    Resume,
    Stop,
    SaveParams {
        params: Vec<Param>,
    },
    RequiredBeams {
        analysis: String,
    },
    Compare {
        yoda_files: Vec<String>,
    },
    AnalysisDetails {
        analysis: String,
    },
}

/// Open connections and their active runs.
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
    settings: Arc<Settings>,
    cache: ResultCache,
    runs: Arc<Mutex<HashMap<u64, Option<RunControl>>>>,
    next_id: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    pub fn new(settings: Arc<Settings>, cache: ResultCache) -> Self {
        Self {
            settings,
            cache,
            runs: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn open(&self, event_tx: UnboundedSender<StatusEvent>) -> Connection {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.runs.lock().insert(id, None);
        tracing::debug!(id, "connection opened");
        Connection {
            id,
            registry: self.clone(),
            event_tx,
            simulation: None,
            run: None,
        }
    }

    pub fn len(&self) -> usize {
        self.runs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ask every active run to stop. Connections stay open.
    pub fn shutdown_all(&self) {
        let runs = self.runs.lock();
        let active = runs.values().flatten().filter(|c| c.is_active());
        let mut stopped = 0;
        for control in active {
            control.stop();
            stopped += 1;
        }
        tracing::info!(stopped, "stop requested for all runs");
    }

    fn track(&self, id: u64, control: RunControl) {
        if let Some(slot) = self.runs.lock().get_mut(&id) {
            *slot = Some(control);
        }
    }

    fn deregister(&self, id: u64) {
        if self.runs.lock().remove(&id).is_some() {
            tracing::debug!(id, "connection closed");
        }
    }
}

pub struct Connection {
    id: u64,
    registry: ConnectionRegistry,
    event_tx: UnboundedSender<StatusEvent>,
    simulation: Option<Simulation>,
    run: Option<SimulationHandle>,
}

impl Connection {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn run_active(&self) -> bool {
        self.run.as_ref().is_some_and(|r| !r.is_finished())
    }

    /// Parse and dispatch one client message. Unknown actions are ignored.
    pub fn handle_message(&mut self, text: &str) {
        match serde_json::from_str::<Action>(text) {
            Ok(action) => self.dispatch(action),
            Err(e) => tracing::warn!(id = self.id, error = %e, "ignoring client message"),
        }
    }

    /// Actions other than `init` are ignored until the connection is bound.
    pub fn dispatch(&mut self, action: Action) {
        match action {
            Action::Init {
                generator,
                params,
                fifo,
            } => {
                let spec = GeneratorSpec {
                    executable: generator,
                    params_file: params,
                    working_dir: self.registry.settings.generator_dir.clone(),
                };
                self.simulation = Some(Simulation::new(
                    self.registry.settings.clone(),
                    self.registry.cache.clone(),
                    spec,
                    fifo,
                    self.event_tx.clone(),
                ));
            }
            Action::Run {
                analysis,
                histointerval,
            } => self.start_run(analysis, histointerval),
            Action::Pause => {
                if let Some(run) = &self.run {
                    run.pause();
                }
            }
            Action::Resume => {
                if let Some(run) = &self.run {
                    run.resume();
                }
            }
            Action::Stop => {
                if let Some(run) = &self.run {
                    run.stop();
                }
            }
            query => {
                let Some(sim) = &self.simulation else {
                    tracing::debug!(id = self.id, action = ?query, "not initialized, ignoring");
                    return;
                };
                match query {
                    Action::LoadParams { params } => sim.load_params(params),
                    Action::SaveParams { params } => sim.save_params(&params),
                    Action::RequiredBeams { analysis } => sim.required_beams(&analysis),
                    Action::AnalysisDetails { analysis } => sim.analysis_details(&analysis),
                    Action::Compare { yoda_files } => sim.compare(&yoda_files),
                    _ => {}
                }
            }
        }
    }

    fn start_run(&mut self, analysis: String, interval: u64) {
        if self.run_active() {
            let _ = self
                .event_tx
                .send(StatusEvent::Error("a run is already in progress".into()));
            return;
        }
        let Some(sim) = self.simulation.as_mut() else {
            tracing::debug!(id = self.id, "not initialized, ignoring run");
            return;
        };
        sim.set_analysis(analysis);
        sim.set_interval(interval);
        let handle = sim.start();
        self.registry.track(self.id, handle.control());
        self.run = Some(handle);
    }

    /// Stop any active run, wait for it and deregister.
    pub async fn close(mut self) -> Option<RunOutcome> {
        self.registry.deregister(self.id);
        let run = self.run.take()?;
        run.stop();
        Some(run.join().await)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(run) = &self.run {
            run.stop();
        }
        self.registry.deregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Signal;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    fn registry(dir: &std::path::Path) -> ConnectionRegistry {
        std::fs::create_dir_all(dir.join("lib")).unwrap();
        std::fs::write(
            dir.join("lib/X.toml"),
            "summary = \"test\"\nrequired_beams = [[11, 2212]]\n",
        )
        .unwrap();
        std::fs::write(dir.join("main.cmnd"), "Beams:idA = 11\n").unwrap();
        let settings = Settings {
            generator_dir: dir.to_path_buf(),
            output_dir: dir.join("out"),
            refdata_dir: dir.join("ref"),
            analysis_lib: dir.join("lib"),
            cache_file: None,
            channel_root: Some(dir.to_path_buf()),
            ..Settings::default()
        };
        ConnectionRegistry::new(Arc::new(settings), ResultCache::in_memory())
    }

    #[test]
    fn actions_parse_from_client_json() {
        let init: Action =
            serde_json::from_str(r#"{"action":"init","generator":"pythia","params":"main.cmnd"}"#).unwrap();
        assert_eq!(
            init,
            Action::Init {
                generator: "pythia".into(),
                params: "main.cmnd".into(),
                fifo: "hepmc.fifo".into(),
            }
        );
        let run: Action =
            serde_json::from_str(r#"{"action":"run","analysis":"X","histointerval":100}"#).unwrap();
        assert_eq!(
            run,
            Action::Run {
                analysis: "X".into(),
                histointerval: 100
            }
        );
        let cmp: Action = serde_json::from_str(r#"{"action":"compare","yoda_files":["a","b"]}"#).unwrap();
        assert_eq!(
            cmp,
            Action::Compare {
                yoda_files: vec!["a".into(), "b".into()]
            }
        );
        assert_eq!(serde_json::from_str::<Action>(r#"{"action":"pause"}"#).unwrap(), Action::Pause);
        assert!(serde_json::from_str::<Action>(r#"{"action":"reboot"}"#).is_err());
    }

    #[tokio::test]
    async fn actions_before_init_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut conn = registry.open(tx);
        conn.handle_message(r#"{"action":"required_beams","analysis":"X"}"#);
        conn.handle_message("not json");
        assert!(rx.try_recv().is_err());

        conn.handle_message(r#"{"action":"init","generator":"gen.sh","params":"main.cmnd"}"#);
        conn.handle_message(r#"{"action":"required_beams","analysis":"X"}"#);
        assert_eq!(rx.try_recv().unwrap(), StatusEvent::Param("Beams-idA".into(), "2212".into()));
        assert_eq!(rx.try_recv().unwrap(), StatusEvent::Param("Beams-idB".into(), "11".into()));
    }

    #[tokio::test]
    async fn connections_deregister_on_close_and_drop() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = registry.open(tx.clone());
        let b = registry.open(tx);
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.len(), 2);
        assert_eq!(a.close().await, None);
        assert_eq!(registry.len(), 1);
        drop(b);
        assert!(registry.is_empty());
        registry.shutdown_all();
    }

    #[tokio::test]
    async fn close_waits_for_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut conn = registry.open(tx);
        conn.dispatch(Action::Init {
            generator: "absent-generator".into(),
            params: "main.cmnd".into(),
            fifo: DEFAULT_FIFO.into(),
        });
        conn.dispatch(Action::Run {
            analysis: "X".into(),
            histointerval: 10,
        });
        registry.shutdown_all();
        assert_eq!(conn.close().await, Some(RunOutcome::Failed));
        let mut last = None;
        while let Ok(e) = rx.try_recv() {
            last = Some(e);
        }
        assert_eq!(last, Some(StatusEvent::Signal(Signal::RunError)));
    }
}
