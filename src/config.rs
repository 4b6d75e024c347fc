//! Runtime settings: directory layout, worker programs and timeouts.
//!
//! Loaded from an optional TOML file; CLI flags override individual fields.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "lhc-sim";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Working directory of the generator; relative executables resolve here.
    pub generator_dir: PathBuf,
    /// Where final and transient result files are written.
    pub output_dir: PathBuf,
    /// Published reference results, `<analysis>.yoda`.
    pub refdata_dir: PathBuf,
    /// Analysis descriptions, `<analysis>.toml`.
    pub analysis_lib: PathBuf,
    /// JSON-lines cache documents. `None` keeps the cache in memory.
    pub cache_file: Option<PathBuf>,
    /// Parent of per-run channel directories. Defaults to the system temp dir.
    pub channel_root: Option<PathBuf>,
    /// Analyzer worker executable. Defaults to the running binary.
    pub analyzer_program: Option<PathBuf>,
    /// Pause between generator and analyzer start.
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
    /// Bound on waiting for the generator once analysis has ended.
    #[serde(with = "humantime_serde")]
    pub generator_exit_timeout: Duration,
    /// Bound on waiting for the analyzer after a stop request.
    #[serde(with = "humantime_serde")]
    pub analyzer_stop_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        let data = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);
        Self {
            generator_dir: PathBuf::from("."),
            output_dir: data.join("output"),
            refdata_dir: PathBuf::from("refdata"),
            analysis_lib: PathBuf::from("analyses"),
            cache_file: Some(data.join("cache.jsonl")),
            channel_root: None,
            analyzer_program: None,
            settle_delay: Duration::ZERO,
            generator_exit_timeout: Duration::from_secs(10),
            analyzer_stop_timeout: Duration::from_secs(30),
        }
    }
}

impl Settings {
    /// Default config file location, `<config_dir>/lhc-sim/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_DIR).join("config.toml"))
    }

    /// Load from `path`, or from the default location when it exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Analyzer executable, falling back to the current binary.
    pub fn analyzer_program(&self) -> Result<PathBuf> {
        match &self.analyzer_program {
            Some(p) => Ok(p.clone()),
            None => std::env::current_exe().context("cannot locate own executable"),
        }
    }

    pub fn channel_root(&self) -> PathBuf {
        self.channel_root.clone().unwrap_or_else(std::env::temp_dir)
    }
}
