use super::Analysis;
use crate::catalog::AnalysisInfo;
use crate::histogram::{AnalysisObject, Histo1D};
use crate::yoda;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

/// Built-in engine for line-oriented event streams.
///
/// Each event is one line of whitespace-separated numbers; column `i` fills
/// the `i`-th booked histogram with unit weight. Lines starting with `#` are
/// skipped, extra columns are ignored and malformed lines are logged and
/// dropped.
pub struct ColumnAnalysis {
    histograms: Vec<Histo1D>,
    source: Option<BufReader<File>>,
    line: String,
    finalized: bool,
}

impl ColumnAnalysis {
    pub fn new(name: &str, info: &AnalysisInfo) -> Self {
        let histograms = info
            .histograms
            .iter()
            .map(|b| {
                let mut h = Histo1D::new(format!("/{name}/{}", b.name), b.bins, b.low, b.high);
                if let Some(title) = &b.title {
                    h.annotations.insert("Title".into(), title.clone());
                }
                h
            })
            .collect();
        Self {
            histograms,
            source: None,
            line: String::new(),
            finalized: false,
        }
    }

    pub fn histograms(&self) -> &[Histo1D] {
        &self.histograms
    }
}

impl Analysis for ColumnAnalysis {
    fn initialize(&mut self, source: &Path) -> io::Result<()> {
        self.source = Some(BufReader::new(File::open(source)?));
        Ok(())
    }

    fn read_event(&mut self) -> bool {
        let Some(source) = self.source.as_mut() else {
            return false;
        };
        loop {
            self.line.clear();
            match source.read_line(&mut self.line) {
                Ok(0) => return false,
                Ok(_) => {
                    let trimmed = self.line.trim();
                    if !trimmed.is_empty() && !trimmed.starts_with('#') {
                        return true;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "event source read failed");
                    return false;
                }
            }
        }
    }

    fn process_event(&mut self) -> bool {
        let values: Result<Vec<f64>, _> = self.line.split_whitespace().map(str::parse::<f64>).collect();
        match values {
            Ok(values) => {
                for (h, x) in self.histograms.iter_mut().zip(values) {
                    h.fill(x, 1.0);
                }
            }
            Err(e) => tracing::warn!(line = self.line.trim(), error = %e, "malformed event skipped"),
        }
        true
    }

    fn finalize(&mut self) {
        self.finalized = true;
        self.source = None;
    }

    fn write_data(&self, path: &Path) -> io::Result<()> {
        let objects: Vec<AnalysisObject> = self
            .histograms
            .iter()
            .cloned()
            .map(AnalysisObject::Histo1D)
            .collect();
        yoda::write_file(path, &objects).map_err(|e| io::Error::other(e.to_string()))
    }
}
