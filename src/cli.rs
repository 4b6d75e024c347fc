use crate::catalog::Catalog;
use crate::config::Settings;
use crate::connection::ConnectionRegistry;
use crate::engine::{run_worker, WorkerArgs};
use crate::model::StatusEvent;
use crate::orchestrator::{GeneratorSpec, ResultCache, RunOutcome, Simulation, DEFAULT_FIFO};
use crate::output::{spawn_output_writer, OutputLine};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "lhc-sim",
    version,
    about = "Drive an event generator and an analysis side by side with live results"
)]
pub struct Cli {
    /// Settings file (TOML). Defaults to the per-user config location.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at info level regardless of RUST_LOG
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// Log at debug level
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run one simulation; type pause, resume or stop on stdin to control it
    Run(RunArgs),
    /// Serve one client speaking JSON actions on stdin, events on stdout
    Session(DirArgs),
    /// List described analyses
    Analyses {
        /// Only analyses for LHC colliders
        #[arg(long)]
        lhc: bool,

        #[command(flatten)]
        dirs: DirArgs,
    },
    /// Analyzer worker process (spawned by `run`)
    #[command(hide = true)]
    Analyze(WorkerArgs),
}

/// Overrides for directories from the settings file.
#[derive(Debug, Args, Clone, Default)]
pub struct DirArgs {
    /// Generator working directory
    #[arg(long)]
    pub generator_dir: Option<PathBuf>,

    /// Result file directory
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Reference data directory
    #[arg(long)]
    pub refdata_dir: Option<PathBuf>,

    /// Analysis description directory
    #[arg(long)]
    pub analysis_lib: Option<PathBuf>,

    /// Cache file (JSON lines)
    #[arg(long)]
    pub cache_file: Option<PathBuf>,

    /// Keep the cache in memory only
    #[arg(long, conflicts_with = "cache_file")]
    pub no_cache_file: bool,
}

impl DirArgs {
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(p) = &self.generator_dir {
            settings.generator_dir = p.clone();
        }
        if let Some(p) = &self.output_dir {
            settings.output_dir = p.clone();
        }
        if let Some(p) = &self.refdata_dir {
            settings.refdata_dir = p.clone();
        }
        if let Some(p) = &self.analysis_lib {
            settings.analysis_lib = p.clone();
        }
        if let Some(p) = &self.cache_file {
            settings.cache_file = Some(p.clone());
        }
        if self.no_cache_file {
            settings.cache_file = None;
        }
    }
}

#[derive(Debug, Args, Clone)]
pub struct RunArgs {
    /// Generator executable, relative to the generator directory
    #[arg(long)]
    pub generator: PathBuf,

    /// Generator parameter file, relative to the generator directory
    #[arg(long)]
    pub params: PathBuf,

    /// Analysis identifier
    #[arg(long)]
    pub analysis: String,

    /// Publish a snapshot every N events
    #[arg(long, default_value_t = 100)]
    pub interval: u64,

    /// Name of the channel FIFO
    #[arg(long, default_value = DEFAULT_FIFO)]
    pub fifo: String,

    /// Wait between generator and analyzer start
    #[arg(long)]
    pub settle_delay: Option<humantime::Duration>,

    /// Print events as JSON lines instead of text
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub dirs: DirArgs,
}

pub async fn run(args: Cli) -> Result<()> {
    match args.command {
        Command::Analyze(worker) => run_worker(worker).await,
        Command::Analyses { lhc, dirs } => {
            let settings = load_settings(args.config.as_deref(), &dirs)?;
            let names = Catalog::new(settings.analysis_lib.clone())
                .list(lhc)
                .context("failed to list analyses")?;
            for name in names {
                println!("{name}");
            }
            Ok(())
        }
        Command::Run(run) => run_simulation(args.config.as_deref(), run).await,
        Command::Session(dirs) => run_session(args.config.as_deref(), &dirs).await,
    }
}

fn load_settings(config: Option<&std::path::Path>, dirs: &DirArgs) -> Result<Settings> {
    let mut settings = Settings::load(config)?;
    dirs.apply(&mut settings);
    Ok(settings)
}

fn render(event: &StatusEvent, json: bool) -> Option<OutputLine> {
    if json {
        return match OutputLine::json(event) {
            Ok(line) => Some(line),
            Err(e) => {
                tracing::warn!(error = %e, "event not serializable");
                None
            }
        };
    }
    match event {
        // Per-event progress would drown everything else in text mode.
        StatusEvent::AnalyzerLine(l) if l.starts_with("Event no.") => None,
        StatusEvent::RawGeneratorLog(l) | StatusEvent::RawAnalyzerLog(l) if l.is_empty() => None,
        StatusEvent::GeneratorLine(_) | StatusEvent::RawGeneratorLog(_) | StatusEvent::RawAnalyzerLog(_) => {
            Some(OutputLine::Stderr(event.to_message()))
        }
        _ => Some(OutputLine::Stdout(event.to_message())),
    }
}

async fn run_simulation(config: Option<&std::path::Path>, args: RunArgs) -> Result<()> {
    let mut settings = load_settings(config, &args.dirs)?;
    if let Some(d) = args.settle_delay {
        settings.settle_delay = d.into();
    }
    let cache = ResultCache::open(settings.cache_file.as_deref()).context("failed to open result cache")?;
    let generator = GeneratorSpec {
        executable: args.generator.clone(),
        params_file: args.params.clone(),
        working_dir: settings.generator_dir.clone(),
    };

    let (out_tx, out_handle) = spawn_output_writer();
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<StatusEvent>();
    let mut sim = Simulation::new(Arc::new(settings), cache, generator, args.fifo.clone(), evt_tx);
    sim.set_analysis(args.analysis.clone());
    sim.set_interval(args.interval);
    let handle = sim.start();
    // The simulation holds the last event sender.
    drop(sim);

    let control = handle.control();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match line.trim() {
                "pause" | "p" => control.pause(),
                "resume" | "r" => control.resume(),
                "stop" | "s" | "q" => control.stop(),
                "" => {}
                other => tracing::warn!(command = other, "unknown command (pause, resume, stop)"),
            }
        }
    });
    let control = handle.control();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, stopping");
            control.stop();
        }
    });

    while let Some(ev) = evt_rx.recv().await {
        if let Some(line) = render(&ev, args.json) {
            let _ = out_tx.send(line);
        }
    }
    let outcome = handle.join().await;
    drop(out_tx);
    let _ = out_handle.await;

    match outcome {
        RunOutcome::Completed { .. } | RunOutcome::Cached { .. } | RunOutcome::Stopped => Ok(()),
        RunOutcome::Failed => Err(anyhow::anyhow!("simulation failed")),
        RunOutcome::Rejected => Err(anyhow::anyhow!("simulation not started")),
    }
}

async fn run_session(config: Option<&std::path::Path>, dirs: &DirArgs) -> Result<()> {
    let settings = load_settings(config, dirs)?;
    let cache = ResultCache::open(settings.cache_file.as_deref()).context("failed to open result cache")?;
    let registry = ConnectionRegistry::new(Arc::new(settings), cache);

    let (out_tx, out_handle) = spawn_output_writer();
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<StatusEvent>();
    let forward = {
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some(ev) = evt_rx.recv().await {
                if let Some(line) = render(&ev, true) {
                    let _ = out_tx.send(line);
                }
            }
        })
    };

    let mut conn = registry.open(evt_tx);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => conn.handle_message(&line),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "client input failed");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, stopping all runs");
                registry.shutdown_all();
                break;
            }
        }
    }

    if let Some(outcome) = conn.close().await {
        tracing::info!(?outcome, "last run finished");
    }
    let _ = forward.await;
    drop(out_tx);
    let _ = out_handle.await;
    Ok(())
}
