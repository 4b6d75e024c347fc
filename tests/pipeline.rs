//! End-to-end runs with a shell generator and the real analyzer worker.

#![cfg(unix)]

use lhc_sim::config::Settings;
use lhc_sim::histogram::{AnalysisObject, Histo1D};
use lhc_sim::model::{RunConfiguration, Signal, StatusEvent};
use lhc_sim::orchestrator::{GeneratorSpec, ResultCache, RunOutcome, Simulation, DEFAULT_FIFO};
use lhc_sim::params;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver};

const FINITE: &str = r#"echo "generator reading $1"
i=0
while [ $i -lt 40 ]; do
  echo "$((i % 10)).5 $i"
  i=$((i + 1))
done > "$2"
echo "generator done""#;

const ENDLESS: &str = r#"i=0
while true; do
  echo "$((i % 10)).5"
  i=$((i + 1))
done > "$2""#;

struct Env {
    dir: tempfile::TempDir,
    cache: ResultCache,
}

fn script(path: &Path, body: &str) -> PathBuf {
    std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_path_buf()
}

impl Env {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for sub in ["gen", "out", "ref", "lib", "fifo"] {
            std::fs::create_dir_all(root.join(sub)).unwrap();
        }
        script(&root.join("gen/finite.sh"), FINITE);
        script(&root.join("gen/endless.sh"), ENDLESS);
        std::fs::write(root.join("gen/main.cmnd"), "Beams:idA = 11\nBeams:idB = 11\n").unwrap();
        std::fs::write(
            root.join("lib/X.toml"),
            r#"name = "X"
summary = "column test"
collider = "LEP"
required_beams = [[11, 11]]

[[histograms]]
name = "d01-x01-y01"
bins = 10
low = 0.0
high = 10.0

[[histograms]]
name = "d02-x01-y01"
bins = 4
low = 0.0
high = 40.0
"#,
        )
        .unwrap();
        let mut reference = Histo1D::new("/REF/X/d01-x01-y01", 10, 0.0, 10.0);
        reference.fill(4.5, 3.0);
        lhc_sim::yoda::write_file(&root.join("ref/X.yoda"), &[AnalysisObject::Histo1D(reference)]).unwrap();

        Self {
            dir,
            cache: ResultCache::in_memory(),
        }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn settings(&self, analyzer: Option<PathBuf>) -> Settings {
        Settings {
            generator_dir: self.root().join("gen"),
            output_dir: self.root().join("out"),
            refdata_dir: self.root().join("ref"),
            analysis_lib: self.root().join("lib"),
            cache_file: None,
            channel_root: Some(self.root().join("fifo")),
            analyzer_program: Some(analyzer.unwrap_or_else(|| PathBuf::from(env!("CARGO_BIN_EXE_lhc-sim")))),
            settle_delay: Duration::ZERO,
            generator_exit_timeout: Duration::from_secs(10),
            analyzer_stop_timeout: Duration::from_secs(20),
        }
    }

    fn simulation(&self, generator: &str, analyzer: Option<PathBuf>) -> (Simulation, UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let spec = GeneratorSpec {
            executable: generator.into(),
            params_file: "main.cmnd".into(),
            working_dir: self.root().join("gen"),
        };
        let mut sim = Simulation::new(
            Arc::new(self.settings(analyzer)),
            self.cache.clone(),
            spec,
            DEFAULT_FIFO,
            tx,
        );
        sim.set_analysis("X");
        sim.set_interval(10);
        (sim, rx)
    }

    fn config(&self) -> RunConfiguration {
        let params = params::read_params(&self.root().join("gen/main.cmnd")).unwrap();
        RunConfiguration::new(params, "X")
    }

    fn channel_root_is_empty(&self) -> bool {
        std::fs::read_dir(self.root().join("fifo")).unwrap().next().is_none()
    }
}

/// Run to completion and collect every event published.
async fn run_to_end(sim: Simulation, mut rx: UnboundedReceiver<StatusEvent>) -> (RunOutcome, Vec<StatusEvent>) {
    let handle = sim.start();
    drop(sim);
    let mut events = Vec::new();
    let collect = async {
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
    };
    tokio::time::timeout(Duration::from_secs(60), collect)
        .await
        .expect("run did not finish");
    (handle.join().await, events)
}

/// Receive until `pred` matches, returning everything seen so far.
async fn wait_for(
    rx: &mut UnboundedReceiver<StatusEvent>,
    seen: &mut Vec<StatusEvent>,
    pred: impl Fn(&StatusEvent) -> bool,
) {
    let fut = async {
        while let Some(ev) = rx.recv().await {
            let hit = pred(&ev);
            seen.push(ev);
            if hit {
                return;
            }
        }
        panic!("event stream ended early");
    };
    tokio::time::timeout(Duration::from_secs(30), fut)
        .await
        .expect("expected event never arrived");
}

fn position(events: &[StatusEvent], pred: impl Fn(&StatusEvent) -> bool) -> Option<usize> {
    events.iter().position(pred)
}

fn count(events: &[StatusEvent], pred: impl Fn(&StatusEvent) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}

fn is_signal(s: Signal) -> impl Fn(&StatusEvent) -> bool {
    move |e| *e == StatusEvent::Signal(s)
}

#[tokio::test]
async fn fresh_run_then_cache_hit() {
    let env = Env::new();

    let (sim, rx) = env.simulation("finite.sh", None);
    let (outcome, events) = run_to_end(sim, rx).await;
    let RunOutcome::Completed { output } = outcome else {
        panic!("run failed: {events:#?}");
    };
    assert!(output.starts_with("final-") && output.ends_with(".yoda"));
    assert!(env.root().join("out").join(&output).exists());

    let gen_running = position(&events, is_signal(Signal::GeneratorRunning)).unwrap();
    let ana_running = position(&events, is_signal(Signal::AnalyzerRunning)).unwrap();
    assert!(gen_running < ana_running);
    assert_eq!(count(&events, |e| matches!(e, StatusEvent::ResultBatch(_))), 4);
    assert_eq!(count(&events, |e| matches!(e, StatusEvent::ResultFinal(_))), 1);
    assert_eq!(count(&events, |e| matches!(e, StatusEvent::ReferenceData(_))), 1);
    assert!(events.contains(&StatusEvent::AnalyzerLine("Event no. 40 processed".into())));
    assert!(events.contains(&StatusEvent::GeneratorLine("generator reading main.cmnd".into())));

    let last_batch = events
        .iter()
        .rposition(|e| matches!(e, StatusEvent::ResultBatch(_)))
        .unwrap();
    let final_at = position(&events, |e| matches!(e, StatusEvent::ResultFinal(_))).unwrap();
    let output_at = position(&events, |e| matches!(e, StatusEvent::OutputFile(_))).unwrap();
    let end_at = position(&events, is_signal(Signal::RunEnd)).unwrap();
    assert!(last_batch < final_at && final_at < output_at && output_at < end_at);
    assert_eq!(
        events[output_at],
        StatusEvent::OutputFile(output.trim_end_matches(".yoda").to_string())
    );
    assert!(position(&events, is_signal(Signal::GeneratorStopped)).unwrap() < end_at);
    assert!(matches!(events.last(), Some(StatusEvent::RawAnalyzerLog(_))));

    assert_eq!(env.cache.get(&env.config()).unwrap(), Some(output.clone()));
    assert!(env.channel_root_is_empty());

    // Same configuration again: replayed, no workers.
    let (sim, rx) = env.simulation("finite.sh", None);
    let (outcome, events) = run_to_end(sim, rx).await;
    assert_eq!(outcome, RunOutcome::Cached { output: output.clone() });
    assert_eq!(count(&events, is_signal(Signal::GeneratorRunning)), 0);
    assert_eq!(count(&events, is_signal(Signal::AnalyzerRunning)), 0);
    assert!(matches!(events[0], StatusEvent::ResultFinal(_)));
    assert!(matches!(events[1], StatusEvent::ReferenceData(_)));
    assert_eq!(events[2], StatusEvent::OutputFile(output.trim_end_matches(".yoda").to_string()));
    assert_eq!(events[3], StatusEvent::Signal(Signal::RunEnd));
    assert_eq!(events.len(), 4);
}

#[tokio::test]
async fn analyzer_crash_fails_the_run_and_cleans_up() {
    let env = Env::new();
    let crasher = script(&env.root().join("crash.sh"), "echo dying >&2\nkill -9 $$");

    let (sim, rx) = env.simulation("endless.sh", Some(crasher));
    let started = Instant::now();
    let (outcome, events) = run_to_end(sim, rx).await;
    // Well inside generator_exit_timeout: the generator was killed, not waited out.
    assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
    assert_eq!(outcome, RunOutcome::Failed);
    let error_at = position(&events, is_signal(Signal::RunError)).unwrap();
    let stopped_at = position(&events, is_signal(Signal::GeneratorStopped)).unwrap();
    assert!(error_at < stopped_at);
    assert!(events.iter().any(|e| matches!(e, StatusEvent::Error(m) if m.contains("abnormally"))));
    assert_eq!(count(&events, is_signal(Signal::RunError)), 1);
    assert_eq!(count(&events, is_signal(Signal::RunEnd)), 0);
    assert!(events.contains(&StatusEvent::RawAnalyzerLog("dying".into())));
    assert!(!env.cache.exists(&env.config()).unwrap());
    assert!(env.channel_root_is_empty());
}

#[tokio::test]
async fn pause_resume_then_stop_an_endless_run() {
    let env = Env::new();
    let (mut sim, mut rx) = env.simulation("endless.sh", None);
    sim.set_interval(1000);
    let handle = sim.start();
    drop(sim);

    let mut seen = Vec::new();
    wait_for(&mut rx, &mut seen, |e| {
        matches!(e, StatusEvent::AnalyzerLine(l) if l.starts_with("Event no."))
    })
    .await;

    handle.pause();
    wait_for(&mut rx, &mut seen, is_signal(Signal::AnalyzerStopped)).await;
    handle.resume();
    // The start announcement was seen before any progress, so this one is
    // the worker confirming the resume.
    wait_for(&mut rx, &mut seen, is_signal(Signal::AnalyzerRunning)).await;
    handle.stop();

    let outcome = tokio::time::timeout(Duration::from_secs(60), handle.join())
        .await
        .expect("stop did not end the run");
    assert_eq!(outcome, RunOutcome::Stopped);
    while let Some(ev) = rx.recv().await {
        seen.push(ev);
    }

    let progress: Vec<u64> = seen
        .iter()
        .filter_map(|e| match e {
            StatusEvent::AnalyzerLine(l) => l
                .strip_prefix("Event no. ")
                .and_then(|rest| rest.strip_suffix(" processed"))
                .and_then(|n| n.parse().ok()),
            _ => None,
        })
        .collect();
    assert!(progress.windows(2).all(|w| w[1] == w[0] + 1));
    assert_eq!(count(&seen, is_signal(Signal::RunStopped)), 1);
    assert_eq!(count(&seen, is_signal(Signal::RunEnd)), 0);
    assert_eq!(count(&seen, |e| matches!(e, StatusEvent::ResultFinal(_))), 1);
    assert!(!env.cache.exists(&env.config()).unwrap());
    assert!(env.channel_root_is_empty());
}

#[tokio::test]
async fn generator_exiting_before_the_analyzer_opens_fails_the_run() {
    let env = Env::new();
    script(&env.root().join("gen/broken.sh"), "echo 'bad params' >&2\nexit 1");

    let (sim, rx) = env.simulation("broken.sh", None);
    let (outcome, events) = run_to_end(sim, rx).await;
    assert_eq!(outcome, RunOutcome::Failed, "{events:#?}");
    assert!(events
        .iter()
        .any(|e| matches!(e, StatusEvent::Error(m) if m.starts_with("generator failed"))));
    assert_eq!(count(&events, is_signal(Signal::RunError)), 1);
    assert_eq!(count(&events, is_signal(Signal::RunEnd)), 0);
    assert!(events.contains(&StatusEvent::RawGeneratorLog("bad params".into())));
    assert!(!env.cache.exists(&env.config()).unwrap());
    assert!(env.channel_root_is_empty());
}

#[tokio::test]
async fn stop_while_paused_ends_the_run() {
    let env = Env::new();
    let (mut sim, mut rx) = env.simulation("endless.sh", None);
    sim.set_interval(1000);
    let handle = sim.start();
    drop(sim);

    let mut seen = Vec::new();
    wait_for(&mut rx, &mut seen, |e| {
        matches!(e, StatusEvent::AnalyzerLine(l) if l.starts_with("Event no."))
    })
    .await;
    handle.pause();
    wait_for(&mut rx, &mut seen, is_signal(Signal::AnalyzerStopped)).await;
    handle.stop();

    let outcome = tokio::time::timeout(Duration::from_secs(15), handle.join())
        .await
        .expect("stop while paused did not end the run");
    assert_eq!(outcome, RunOutcome::Stopped);
    while let Some(ev) = rx.recv().await {
        seen.push(ev);
    }
    assert_eq!(count(&seen, is_signal(Signal::RunStopped)), 1);
    assert_eq!(count(&seen, is_signal(Signal::RunError)), 0);
    assert_eq!(count(&seen, |e| matches!(e, StatusEvent::ResultFinal(_))), 1);
    assert!(!env.cache.exists(&env.config()).unwrap());
    assert!(env.channel_root_is_empty());
}
