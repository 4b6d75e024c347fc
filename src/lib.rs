//! Orchestrates an event generator and an analysis running side by side.
//!
//! The generator writes events into a per-run FIFO; an analyzer worker
//! process reads them, publishing periodic normalized snapshots and a raw
//! final result. Results are cached by run configuration.

#[cfg(not(unix))]
compile_error!("lhc-sim needs named pipes and is only supported on Unix");

pub mod catalog;
pub mod cli;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod histogram;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod output;
pub mod params;
pub mod record;
pub mod yoda;
