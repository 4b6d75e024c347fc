//! Canonical, serializable form of decoded result objects.
//!
//! Statistics that are undefined for degenerate input are reported as `0`.

use crate::error::YodaError;
use crate::histogram::{AnalysisObject, Annotations, Histo1D, Scatter2D};
use crate::metrics::Dbn1D;
use crate::yoda;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Whether weights were rescaled to unit area before shaping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Normalization {
    Normalized,
    Raw,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ResultRecord {
    Histo1D(Histo1DRecord),
    Scatter2D(Scatter2DRecord),
}

impl ResultRecord {
    pub fn path(&self) -> &str {
        match self {
            ResultRecord::Histo1D(h) => &h.path,
            ResultRecord::Scatter2D(s) => &s.path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Histo1DRecord {
    pub path: String,
    pub annotations: Annotations,
    pub normalization: Normalization,
    pub edge_low: f64,
    pub edge_high: f64,
    pub total_dbn: TotalDbnRecord,
    pub bins: Vec<BinRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TotalDbnRecord {
    pub sum_w: f64,
    pub sum_w2: f64,
    #[serde(rename = "sumWX")]
    pub sum_wx: f64,
    #[serde(rename = "sumWX2")]
    pub sum_wx2: f64,
    pub num_entries: f64,
    pub eff_num_entries: f64,
    pub mean: f64,
    pub rms: f64,
    pub std_dev: f64,
    pub std_err: f64,
    pub variance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinRecord {
    pub edge_low: f64,
    pub edge_high: f64,
    pub width: f64,
    pub focus: f64,
    pub midpoint: f64,
    pub height: f64,
    pub height_err: f64,
    pub area: f64,
    pub area_err: f64,
    pub num_entries: f64,
    pub eff_num_entries: f64,
    pub rel_err: f64,
    pub sum_w: f64,
    pub sum_w2: f64,
    #[serde(rename = "sumWX")]
    pub sum_wx: f64,
    #[serde(rename = "sumWX2")]
    pub sum_wx2: f64,
    pub mean: f64,
    pub rms: f64,
    pub std_dev: f64,
    pub std_err: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scatter2DRecord {
    pub path: String,
    pub annotations: Annotations,
    pub normalization: Normalization,
    pub points: Vec<PointRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointRecord {
    pub x: f64,
    pub y: f64,
    pub x_err_minus: f64,
    pub x_err_plus: f64,
    pub y_err_minus: f64,
    pub y_err_plus: f64,
    pub x_range: Range,
    pub y_range: Range,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub low: f64,
    pub high: f64,
}

/// Shape decoded objects into records, normalizing histograms when asked.
///
/// Normalization is lossy and applied to the caller's copy only. Scatter
/// objects carry no weights and are never rescaled.
pub fn to_records(objects: Vec<AnalysisObject>, normalization: Normalization) -> Vec<ResultRecord> {
    objects
        .into_iter()
        .map(|obj| match obj {
            AnalysisObject::Histo1D(mut h) => {
                if normalization == Normalization::Normalized && !h.normalize(1.0) {
                    tracing::debug!(path = %h.path, "zero integral, histogram left unnormalized");
                }
                ResultRecord::Histo1D(histo_record(&h, normalization))
            }
            AnalysisObject::Scatter2D(s) => ResultRecord::Scatter2D(scatter_record(&s, normalization)),
        })
        .collect()
}

/// Read a result file and shape its contents.
pub fn read_records(path: &Path, normalization: Normalization) -> Result<Vec<ResultRecord>, YodaError> {
    Ok(to_records(yoda::read_file(path)?, normalization))
}

/// Load `<refdata_dir>/<analysis>.yoda` if present.
///
/// A missing file is the normal case for analyses without published data.
pub fn load_reference(refdata_dir: &Path, analysis: &str) -> Option<Vec<ResultRecord>> {
    let path = refdata_dir.join(format!("{analysis}.yoda"));
    match read_records(&path, Normalization::Raw) {
        Ok(records) if !records.is_empty() => Some(records),
        Ok(_) => None,
        Err(e) if e.is_not_found() => {
            tracing::info!(analysis, "no reference data");
            None
        }
        Err(e) => {
            tracing::warn!(analysis, error = %e, "unreadable reference data ignored");
            None
        }
    }
}

fn histo_record(h: &Histo1D, normalization: Normalization) -> Histo1DRecord {
    let bins = h
        .bins
        .iter()
        .map(|b| {
            let d = &b.dbn;
            let width = b.width();
            let area_err = d.sum_w2.sqrt();
            let (height, height_err) = if width != 0.0 {
                (d.sum_w / width, area_err / width)
            } else {
                (0.0, 0.0)
            };
            BinRecord {
                edge_low: b.low,
                edge_high: b.high,
                width,
                focus: b.focus(),
                midpoint: b.midpoint(),
                height,
                height_err,
                area: d.sum_w,
                area_err,
                num_entries: d.num_entries,
                eff_num_entries: d.eff_num_entries(),
                rel_err: if d.sum_w != 0.0 { area_err / d.sum_w.abs() } else { 0.0 },
                sum_w: d.sum_w,
                sum_w2: d.sum_w2,
                sum_wx: d.sum_wx,
                sum_wx2: d.sum_wx2,
                mean: d.mean().unwrap_or(0.0),
                rms: d.rms().unwrap_or(0.0),
                std_dev: d.std_dev().unwrap_or(0.0),
                std_err: d.std_err().unwrap_or(0.0),
            }
        })
        .collect();

    Histo1DRecord {
        path: h.path.clone(),
        annotations: h.annotations.clone(),
        normalization,
        edge_low: h.low(),
        edge_high: h.high(),
        total_dbn: total_record(&h.total),
        bins,
    }
}

fn total_record(d: &Dbn1D) -> TotalDbnRecord {
    TotalDbnRecord {
        sum_w: d.sum_w,
        sum_w2: d.sum_w2,
        sum_wx: d.sum_wx,
        sum_wx2: d.sum_wx2,
        num_entries: d.num_entries,
        eff_num_entries: d.eff_num_entries(),
        mean: d.mean().unwrap_or(0.0),
        rms: d.rms().unwrap_or(0.0),
        std_dev: d.std_dev().unwrap_or(0.0),
        std_err: d.std_err().unwrap_or(0.0),
        variance: d.variance().unwrap_or(0.0),
    }
}

fn scatter_record(s: &Scatter2D, normalization: Normalization) -> Scatter2DRecord {
    Scatter2DRecord {
        path: s.path.clone(),
        annotations: s.annotations.clone(),
        normalization,
        points: s
            .points
            .iter()
            .map(|p| PointRecord {
                x: p.x,
                y: p.y,
                x_err_minus: p.x_err_minus,
                x_err_plus: p.x_err_plus,
                y_err_minus: p.y_err_minus,
                y_err_plus: p.y_err_plus,
                x_range: Range {
                    low: p.x - p.x_err_minus,
                    high: p.x + p.x_err_plus,
                },
                y_range: Range {
                    low: p.y - p.y_err_minus,
                    high: p.y + p.y_err_plus,
                },
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::Point2D;

    fn filled() -> AnalysisObject {
        let mut h = Histo1D::new("/X/h", 4, 0.0, 4.0);
        for x in [0.5, 1.5, 1.5, 2.5, 3.5, 3.5] {
            h.fill(x, 1.0);
        }
        AnalysisObject::Histo1D(h)
    }

    #[test]
    fn normalized_and_raw_records_differ_in_total_weight() {
        let raw = to_records(vec![filled()], Normalization::Raw);
        let norm = to_records(vec![filled()], Normalization::Normalized);
        let (ResultRecord::Histo1D(raw), ResultRecord::Histo1D(norm)) = (&raw[0], &norm[0]) else {
            panic!("expected histograms");
        };
        assert_eq!(raw.total_dbn.sum_w, 6.0);
        assert!((norm.total_dbn.sum_w - 1.0).abs() < 1e-12);
        assert_eq!(raw.normalization, Normalization::Raw);
        assert_eq!(norm.normalization, Normalization::Normalized);
        assert_eq!(raw.total_dbn.num_entries, norm.total_dbn.num_entries);
    }

    #[test]
    fn empty_bins_default_undefined_statistics_to_zero() {
        let h = Histo1D::new("/X/empty", 2, 0.0, 2.0);
        let records = to_records(vec![AnalysisObject::Histo1D(h)], Normalization::Normalized);
        let ResultRecord::Histo1D(r) = &records[0] else {
            panic!("expected histogram");
        };
        assert_eq!(r.total_dbn.mean, 0.0);
        assert_eq!(r.total_dbn.variance, 0.0);
        assert_eq!(r.bins[0].rel_err, 0.0);
        assert_eq!(r.bins[0].focus, 0.5);
    }

    #[test]
    fn scatter_ranges_and_json_shape() {
        let s = Scatter2D::new(
            "/REF/X/s",
            vec![Point2D {
                x: 1.0,
                y: 10.0,
                x_err_minus: 0.5,
                x_err_plus: 0.5,
                y_err_minus: 1.0,
                y_err_plus: 2.0,
            }],
        );
        let records = to_records(vec![AnalysisObject::Scatter2D(s)], Normalization::Raw);
        let json = serde_json::to_value(&records[0]).unwrap();
        assert_eq!(json["type"], "Scatter2D");
        assert_eq!(json["points"][0]["xRange"]["low"], 0.5);
        assert_eq!(json["points"][0]["yRange"]["high"], 12.0);
        assert_eq!(json["points"][0]["yErrPlus"], 2.0);
    }

    #[test]
    fn histogram_json_uses_camel_case_sums() {
        let records = to_records(vec![filled()], Normalization::Raw);
        let json = serde_json::to_value(&records[0]).unwrap();
        assert_eq!(json["type"], "Histo1D");
        assert_eq!(json["totalDbn"]["sumW"], 6.0);
        assert!(json["bins"][0].get("sumWX2").is_some());
        assert_eq!(json["edgeHigh"], 4.0);
    }

    #[test]
    fn absent_reference_file_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_reference(dir.path(), "NOPE").is_none());
    }
}
