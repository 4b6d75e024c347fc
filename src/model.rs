use crate::catalog::AnalysisDetails;
use crate::record::ResultRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reserved cache document keys.
pub const ANALYSIS_KEY: &str = "_analysis";
pub const OUTPUT_KEY: &str = "_yoda";

/// Generator parameters plus the selected analysis; the cache key of a run.
///
/// Equality is exact over every pair and independent of insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunConfiguration {
    pub params: BTreeMap<String, String>,
    pub analysis: String,
}

impl RunConfiguration {
    pub fn new(params: BTreeMap<String, String>, analysis: impl Into<String>) -> Self {
        Self {
            params,
            analysis: analysis.into(),
        }
    }

    /// Flatten into a cache document: `{..params, _analysis}`.
    pub fn to_document(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut doc: serde_json::Map<String, serde_json::Value> = self
            .params
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        doc.insert(ANALYSIS_KEY.into(), self.analysis.clone().into());
        doc
    }

    /// Split a cache document back into key and output file name.
    pub fn from_document(
        mut doc: serde_json::Map<String, serde_json::Value>,
    ) -> Option<(Self, String)> {
        let analysis = doc.remove(ANALYSIS_KEY)?.as_str()?.to_string();
        let output = doc.remove(OUTPUT_KEY)?.as_str()?.to_string();
        let params = doc
            .into_iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect();
        Some((Self { params, analysis }, output))
    }
}

/// Messages delivered to the analyzer's control inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMessage {
    Pause,
    Resume,
    Stop,
}

/// Lifecycle signals published on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Signal {
    RunEnd,
    GeneratorRunning,
    GeneratorStopped,
    /// Published by the analyzer on start and on resume.
    AnalyzerRunning,
    /// Published by the analyzer when it pauses.
    AnalyzerStopped,
    RunError,
    ParamsSaved,
    ParamsError,
    RunStopped,
    /// A cache hit whose stored results could not be read back.
    CacheError,
}

/// A generator parameter as exchanged with clients.
///
/// Wire names use `-` where the parameter file uses `:`. Fields other than
/// `name` and `currentValue` are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Param {
    pub name: String,
    #[serde(default)]
    pub current_value: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Param {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            current_value: Some(value.into()),
            extra: serde_json::Map::new(),
        }
    }

    /// Name as written in the parameter file.
    pub fn file_key(&self) -> String {
        self.name.replace('-', ":")
    }
}

/// Everything published to subscribers, serialized as `{type, content}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "kebab-case")]
pub enum StatusEvent {
    GeneratorLine(String),
    AnalyzerLine(String),
    Signal(Signal),
    Error(String),
    ResultBatch(Vec<ResultRecord>),
    ResultFinal(Vec<ResultRecord>),
    ReferenceData(Vec<ResultRecord>),
    OutputFile(String),
    Param(String, String),
    Params(Vec<Param>),
    AnalysisDetails(Box<AnalysisDetails>),
    CompareResult(Vec<ResultRecord>),
    RawGeneratorLog(String),
    RawAnalyzerLog(String),
}

impl StatusEvent {
    /// Render a human-readable line for text output.
    pub fn to_message(&self) -> String {
        match self {
            StatusEvent::GeneratorLine(l) => format!("[generator] {l}"),
            StatusEvent::AnalyzerLine(l) => format!("[analyzer] {l}"),
            StatusEvent::Signal(s) => format!("== {s:?} =="),
            StatusEvent::Error(e) => format!("error: {e}"),
            StatusEvent::ResultBatch(r) => format!("snapshot: {} objects", r.len()),
            StatusEvent::ResultFinal(r) => format!("final results: {} objects", r.len()),
            StatusEvent::ReferenceData(r) => format!("reference data: {} objects", r.len()),
            StatusEvent::OutputFile(f) => format!("output: {f}"),
            StatusEvent::Param(name, value) => format!("{name} = {value}"),
            StatusEvent::Params(p) => format!("{} parameters loaded", p.len()),
            StatusEvent::AnalysisDetails(d) => format!("{}: {}", d.name, d.summary),
            StatusEvent::CompareResult(r) => format!("comparison: {} objects", r.len()),
            StatusEvent::RawGeneratorLog(l) => format!("[generator stderr] {l}"),
            StatusEvent::RawAnalyzerLog(l) => format!("[analyzer stderr] {l}"),
        }
    }
}

/// Line-delimited frames on the analyzer worker's stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "lowercase")]
pub enum WorkerFrame {
    Event { event: StatusEvent },
    /// The final result file, handed back exactly once.
    Output { file: String },
}
