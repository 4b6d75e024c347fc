//! The analyzer worker process.
//!
//! Control messages arrive as JSON lines on stdin; events and the final
//! output file name leave as [`WorkerFrame`] lines on stdout. Logs go to
//! stderr, which the orchestrator keeps as raw diagnostics.

use super::{AnalyzerSession, ColumnAnalysis, SessionSettings};
use crate::catalog::Catalog;
use crate::error::SessionError;
use crate::model::{ControlMessage, StatusEvent, WorkerFrame};
use crate::output::{spawn_output_writer, OutputLine};
use anyhow::{Context, Result};
use clap::Args;
use std::ffi::OsString;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::{self, UnboundedSender};

#[derive(Debug, Clone, Args)]
pub struct WorkerArgs {
    /// Event source (the run's FIFO)
    #[arg(long)]
    pub channel: PathBuf,

    /// Analysis identifier
    #[arg(long)]
    pub analysis: String,

    /// Publish a snapshot every N events
    #[arg(long, default_value_t = 100)]
    pub interval: u64,

    /// Directory for snapshot and final result files
    #[arg(long)]
    pub output_dir: PathBuf,

    /// Directory holding `<analysis>.yoda` reference data
    #[arg(long)]
    pub refdata_dir: PathBuf,

    /// Directory holding `<analysis>.toml` descriptions
    #[arg(long)]
    pub analysis_lib: PathBuf,
}

impl WorkerArgs {
    /// Flags reproducing these arguments on a worker command line.
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::with_capacity(12);
        let mut push = |flag: &str, value: OsString| {
            args.push(flag.into());
            args.push(value);
        };
        push("--channel", self.channel.clone().into());
        push("--analysis", self.analysis.clone().into());
        push("--interval", self.interval.to_string().into());
        push("--output-dir", self.output_dir.clone().into());
        push("--refdata-dir", self.refdata_dir.clone().into());
        push("--analysis-lib", self.analysis_lib.clone().into());
        args
    }
}

/// Run one analysis to completion. An error exits the process non-zero.
pub async fn run_worker(args: WorkerArgs) -> Result<()> {
    let info = Catalog::new(&args.analysis_lib)
        .load(&args.analysis)
        .map_err(SessionError::from)?;
    let analysis = ColumnAnalysis::new(&args.analysis, &info);

    let (out_tx, out_handle) = spawn_output_writer();
    let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel::<ControlMessage>();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<StatusEvent>();

    // Never joined: stdin reads cannot be cancelled.
    tokio::spawn(read_control(ctrl_tx));

    let forward = {
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if !send_frame(&out_tx, &WorkerFrame::Event { event }) {
                    break;
                }
            }
        })
    };

    let settings = SessionSettings {
        analysis: args.analysis.clone(),
        interval: args.interval,
        output_dir: args.output_dir.clone(),
        refdata_dir: args.refdata_dir.clone(),
    };
    let source = args.channel.clone();
    let session = AnalyzerSession::new(analysis, settings, ctrl_rx, event_tx);
    let outcome = tokio::task::spawn_blocking(move || session.run(&source))
        .await
        .context("analyzer session panicked")?;

    // The session dropped its sender; drain what it published.
    let _ = forward.await;
    let res = match outcome {
        Ok(outcome) => {
            tracing::debug!(state = ?outcome.state, events = outcome.events, "session ended");
            send_frame(&out_tx, &WorkerFrame::Output {
                file: outcome.output_file,
            });
            Ok(())
        }
        Err(e) => Err(anyhow::Error::new(e).context("analysis failed")),
    };

    drop(out_tx);
    let _ = out_handle.await;
    res
}

fn send_frame(out_tx: &UnboundedSender<OutputLine>, frame: &WorkerFrame) -> bool {
    match OutputLine::json(frame) {
        Ok(line) => out_tx.send(line).is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "unserializable frame dropped");
            true
        }
    }
}

async fn read_control(ctrl_tx: UnboundedSender<ControlMessage>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match serde_json::from_str::<ControlMessage>(&line) {
                Ok(msg) => {
                    tracing::debug!(?msg, "control message");
                    if ctrl_tx.send(msg).is_err() {
                        return;
                    }
                }
                Err(e) => tracing::warn!(line = %line, error = %e, "ignoring control line"),
            },
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "control input failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: WorkerArgs,
    }

    #[test]
    fn to_args_parses_back() {
        let args = WorkerArgs {
            channel: "/tmp/run/hepmc.fifo".into(),
            analysis: "MC_GENERIC".into(),
            interval: 250,
            output_dir: "out dir".into(),
            refdata_dir: "ref".into(),
            analysis_lib: "lib".into(),
        };
        let mut argv: Vec<OsString> = vec!["analyze".into()];
        argv.extend(args.to_args());
        let parsed = Harness::try_parse_from(argv).unwrap().args;
        assert_eq!(parsed.channel, args.channel);
        assert_eq!(parsed.analysis, "MC_GENERIC");
        assert_eq!(parsed.interval, 250);
        assert_eq!(parsed.output_dir, PathBuf::from("out dir"));
        assert_eq!(parsed.analysis_lib, PathBuf::from("lib"));
    }
}
