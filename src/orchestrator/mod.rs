//! Run orchestration: workers, the channel between them, the result cache
//! and the per-client run lifecycle built on top.
//!
//! Presentation layers (CLI, connections) only talk to [`Simulation`] and
//! consume the [`StatusEvent`](crate::model::StatusEvent)s it emits.

mod analyzer;
mod cache;
mod channel;
mod generator;
mod simulation;

pub use analyzer::{AnalyzerControl, AnalyzerExit, AnalyzerWorker};
pub use cache::{CacheStore, JsonFileStore, MemoryStore, ResultCache};
pub use channel::{unblock_reader, Channel};
pub use generator::{GeneratorExit, GeneratorSpec, GeneratorWorker};
pub use simulation::{RunControl, RunOutcome, Simulation, SimulationHandle, DEFAULT_FIFO};
