//! Analysis engine: the call sequence run inside the analyzer worker.
//!
//! An [`Analysis`] is initialized on an event source, fed one event at a time
//! and can serialize its accumulated state to a result file at any point.
//! [`AnalyzerSession`] drives it under control of the orchestrator.

mod column;
mod session;
mod worker;

pub use column::ColumnAnalysis;
pub use session::{AnalyzerSession, AnalyzerState, SessionOutcome, SessionSettings};
pub use worker::{run_worker, WorkerArgs};

use std::io;
use std::path::Path;

pub trait Analysis: Send {
    /// Open the event source. Blocks until a writer is attached when the
    /// source is a FIFO.
    fn initialize(&mut self, source: &Path) -> io::Result<()>;

    /// Read the next event. `false` once the source is exhausted.
    fn read_event(&mut self) -> bool;

    /// Process the event last read. `false` asks the caller to stop.
    fn process_event(&mut self) -> bool;

    /// Finish accumulation before the final write.
    fn finalize(&mut self);

    /// Serialize the current state to `path`.
    fn write_data(&self, path: &Path) -> io::Result<()>;
}
