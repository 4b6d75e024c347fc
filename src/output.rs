use serde::Serialize;
use std::io::Write;
use tokio::sync::mpsc;

/// Output line routing for the stdout/stderr writer.
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

impl OutputLine {
    /// One compact JSON document per stdout line.
    pub fn json<T: Serialize>(value: &T) -> serde_json::Result<Self> {
        serde_json::to_string(value).map(OutputLine::Stdout)
    }
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
///
/// The writer drains until every sender is dropped, then flushes.
pub fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            let res = match line {
                OutputLine::Stdout(msg) => writeln!(out, "{msg}"),
                OutputLine::Stderr(msg) => writeln!(err, "{msg}"),
            };
            // Reader went away; nothing left to deliver to.
            if res.is_err() {
                break;
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}
