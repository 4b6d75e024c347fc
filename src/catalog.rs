//! Analysis metadata and histogram booking.
//!
//! Each analysis is described by `<analysis_lib>/<NAME>.toml`:
//!
//! ```toml
//! name = "MC_CHARGED"
//! summary = "Charged particle spectra"
//! collider = "LHC"
//! required_beams = [[2212, 2212]]
//!
//! [[histograms]]
//! name = "d01-x01-y01"
//! bins = 50
//! low = 0.0
//! high = 100.0
//! ```

use crate::error::CatalogError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all(serialize = "camelCase"))]
pub struct AnalysisDetails {
    pub name: String,
    pub summary: String,
    pub description: String,
    pub authors: Vec<String>,
    pub experiment: String,
    pub collider: String,
    pub year: String,
    pub inspire_id: String,
    pub spires_id: String,
    pub status: String,
    pub bib_key: String,
    #[serde(rename(serialize = "bibTeX"))]
    pub bib_tex: String,
    pub references: Vec<String>,
    pub required_beams: Vec<(i64, i64)>,
    pub required_energies: Vec<(f64, f64)>,
    pub run_info: String,
}

/// One booked histogram; bins span `[low, high)` evenly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramBooking {
    pub name: String,
    pub bins: usize,
    pub low: f64,
    pub high: f64,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AnalysisInfo {
    #[serde(flatten)]
    pub details: AnalysisDetails,
    #[serde(default)]
    pub histograms: Vec<HistogramBooking>,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    root: PathBuf,
}

impl Catalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn load(&self, analysis: &str) -> Result<AnalysisInfo, CatalogError> {
        if analysis.is_empty() || analysis.contains(['/', '\\']) || analysis.starts_with('.') {
            return Err(CatalogError::Unknown(analysis.to_string()));
        }
        let path = self.root.join(format!("{analysis}.toml"));
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CatalogError::Unknown(analysis.to_string()))
            }
            Err(source) => return Err(CatalogError::Io { path, source }),
        };
        let mut info: AnalysisInfo =
            toml::from_str(&text).map_err(|source| CatalogError::Format { path, source })?;
        if info.details.name.is_empty() {
            info.details.name = analysis.to_string();
        }
        Ok(info)
    }

    pub fn details(&self, analysis: &str) -> Result<AnalysisDetails, CatalogError> {
        self.load(analysis).map(|info| info.details)
    }

    /// Beam particle ids as `(idA, idB)` for the first required beam pair.
    pub fn required_beams(&self, analysis: &str) -> Result<Option<(i64, i64)>, CatalogError> {
        let details = self.details(analysis)?;
        Ok(details.required_beams.first().map(|&(b0, b1)| (b1, b0)))
    }

    /// Names of all described analyses, sorted. `lhc_only` keeps those whose
    /// collider starts with `LHC`.
    pub fn list(&self, lhc_only: bool) -> Result<Vec<String>, CatalogError> {
        let entries = std::fs::read_dir(&self.root).map_err(|source| CatalogError::Io {
            path: self.root.clone(),
            source,
        })?;
        let mut names = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if lhc_only {
                match self.details(stem) {
                    Ok(d) if d.collider.starts_with("LHC") => {}
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::warn!(analysis = stem, error = %e, "skipping analysis");
                        continue;
                    }
                }
            }
            names.push(stem.to_string());
        }
        names.sort();
        Ok(names)
    }
}
