//! Plain-text result file codec (YODA-style blocks).
//!
//! ```text
//! # BEGIN YODA_HISTO1D /ANALYSIS/d01-x01-y01
//! Path=/ANALYSIS/d01-x01-y01
//! Type=Histo1D
//! # ID  ID  sumw  sumw2  sumwx  sumwx2  numEntries
//! Total  Total  ...
//! Underflow  Underflow  ...
//! Overflow  Overflow  ...
//! # xlow  xhigh  sumw  sumw2  sumwx  sumwx2  numEntries
//! 0e0  1e0  ...
//! # END YODA_HISTO1D
//! ```
//!
//! Scatter blocks carry `xval xerr- xerr+ yval yerr- yerr+` rows. Blocks of
//! other types are skipped with a warning.

use crate::error::YodaError;
use crate::histogram::{AnalysisObject, Annotations, HistoBin1D, Histo1D, Point2D, Scatter2D};
use crate::metrics::Dbn1D;
use std::fmt::Write as _;
use std::path::Path;

const HISTO1D: &str = "YODA_HISTO1D";
const SCATTER2D: &str = "YODA_SCATTER2D";

/// Serialize `objects` and write them to `path`.
pub fn write_file(path: &Path, objects: &[AnalysisObject]) -> Result<(), YodaError> {
    std::fs::write(path, to_string(objects)).map_err(|source| YodaError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Read and decode every supported object in `path`.
pub fn read_file(path: &Path) -> Result<Vec<AnalysisObject>, YodaError> {
    let text = std::fs::read_to_string(path).map_err(|source| YodaError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&text)
}

pub fn to_string(objects: &[AnalysisObject]) -> String {
    let mut out = String::new();
    for obj in objects {
        match obj {
            AnalysisObject::Histo1D(h) => write_histo(&mut out, h),
            AnalysisObject::Scatter2D(s) => write_scatter(&mut out, s),
        }
        out.push('\n');
    }
    out
}

fn write_annotations(out: &mut String, path: &str, annotations: &Annotations) {
    let _ = writeln!(out, "Path={path}");
    for (k, v) in annotations.iter().filter(|(k, _)| k.as_str() != "Path") {
        let _ = writeln!(out, "{k}={v}");
    }
}

fn write_dbn(out: &mut String, label: &str, d: &Dbn1D) {
    let _ = writeln!(
        out,
        "{label}\t{label}\t{:e}\t{:e}\t{:e}\t{:e}\t{:e}",
        d.sum_w, d.sum_w2, d.sum_wx, d.sum_wx2, d.num_entries
    );
}

fn write_histo(out: &mut String, h: &Histo1D) {
    let _ = writeln!(out, "# BEGIN {HISTO1D} {}", h.path);
    write_annotations(out, &h.path, &h.annotations);
    out.push_str("# ID\tID\tsumw\tsumw2\tsumwx\tsumwx2\tnumEntries\n");
    write_dbn(out, "Total", &h.total);
    write_dbn(out, "Underflow", &h.underflow);
    write_dbn(out, "Overflow", &h.overflow);
    out.push_str("# xlow\txhigh\tsumw\tsumw2\tsumwx\tsumwx2\tnumEntries\n");
    for b in &h.bins {
        let d = &b.dbn;
        let _ = writeln!(
            out,
            "{:e}\t{:e}\t{:e}\t{:e}\t{:e}\t{:e}\t{:e}",
            b.low, b.high, d.sum_w, d.sum_w2, d.sum_wx, d.sum_wx2, d.num_entries
        );
    }
    let _ = writeln!(out, "# END {HISTO1D}");
}

fn write_scatter(out: &mut String, s: &Scatter2D) {
    let _ = writeln!(out, "# BEGIN {SCATTER2D} {}", s.path);
    write_annotations(out, &s.path, &s.annotations);
    out.push_str("# xval\txerr-\txerr+\tyval\tyerr-\tyerr+\n");
    for p in &s.points {
        let _ = writeln!(
            out,
            "{:e}\t{:e}\t{:e}\t{:e}\t{:e}\t{:e}",
            p.x, p.x_err_minus, p.x_err_plus, p.y, p.y_err_minus, p.y_err_plus
        );
    }
    let _ = writeln!(out, "# END {SCATTER2D}");
}

/// Block currently being decoded.
enum Block {
    Histo(Histo1D),
    Scatter(Scatter2D),
    Skipped,
}

pub fn parse(text: &str) -> Result<Vec<AnalysisObject>, YodaError> {
    let mut objects = Vec::new();
    let mut current: Option<Block> = None;

    for (idx, raw) in text.lines().enumerate() {
        let lineno = idx + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("# BEGIN ") {
            if current.is_some() {
                return Err(parse_err(lineno, "nested BEGIN"));
            }
            let (kind, path) = rest.split_once(' ').unwrap_or((rest, ""));
            let path = path.trim();
            current = Some(match base_kind(kind) {
                HISTO1D => Block::Histo(Histo1D::with_bins(path, Vec::new())),
                SCATTER2D => Block::Scatter(Scatter2D::new(path, Vec::new())),
                other => {
                    tracing::warn!(kind = other, path, "unsupported result object skipped");
                    Block::Skipped
                }
            });
            continue;
        }

        if line.starts_with("# END") {
            match current.take() {
                Some(Block::Histo(h)) => objects.push(AnalysisObject::Histo1D(h)),
                Some(Block::Scatter(s)) => objects.push(AnalysisObject::Scatter2D(s)),
                Some(Block::Skipped) => {}
                None => return Err(parse_err(lineno, "END without BEGIN")),
            }
            continue;
        }

        if line.starts_with('#') {
            continue;
        }

        match current.as_mut() {
            None => return Err(parse_err(lineno, "data outside of a block")),
            Some(Block::Skipped) => {}
            Some(Block::Histo(h)) => parse_histo_line(h, line, lineno)?,
            Some(Block::Scatter(s)) => parse_scatter_line(s, line, lineno)?,
        }
    }

    if current.is_some() {
        return Err(parse_err(text.lines().count(), "unterminated block"));
    }
    Ok(objects)
}

/// Strip a format version suffix such as `_V2`.
fn base_kind(kind: &str) -> &str {
    match kind.rsplit_once("_V") {
        Some((base, ver)) if !ver.is_empty() && ver.chars().all(|c| c.is_ascii_digit()) => base,
        _ => kind,
    }
}

fn parse_err(line: usize, message: impl Into<String>) -> YodaError {
    YodaError::Parse {
        line,
        message: message.into(),
    }
}

/// Returns true when the line was an annotation and has been consumed.
fn take_annotation(annotations: &mut Annotations, line: &str) -> bool {
    let first = line.split_whitespace().next().unwrap_or_default();
    if first.parse::<f64>().is_ok() || matches!(first, "Total" | "Underflow" | "Overflow") {
        return false;
    }
    match line.split_once('=') {
        Some((k, v)) => {
            annotations.insert(k.trim().to_string(), v.trim().to_string());
            true
        }
        None => false,
    }
}

fn floats(fields: &[&str], lineno: usize) -> Result<Vec<f64>, YodaError> {
    fields
        .iter()
        .map(|f| {
            f.parse::<f64>()
                .map_err(|_| parse_err(lineno, format!("invalid number `{f}`")))
        })
        .collect()
}

fn dbn_from(v: &[f64]) -> Dbn1D {
    Dbn1D {
        sum_w: v[0],
        sum_w2: v[1],
        sum_wx: v[2],
        sum_wx2: v[3],
        num_entries: v[4],
    }
}

fn parse_histo_line(h: &mut Histo1D, line: &str, lineno: usize) -> Result<(), YodaError> {
    if take_annotation(&mut h.annotations, line) {
        return Ok(());
    }
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 7 {
        return Err(parse_err(lineno, format!("expected 7 columns, got {}", fields.len())));
    }
    match fields[0] {
        "Total" => h.total = dbn_from(&floats(&fields[2..], lineno)?),
        "Underflow" => h.underflow = dbn_from(&floats(&fields[2..], lineno)?),
        "Overflow" => h.overflow = dbn_from(&floats(&fields[2..], lineno)?),
        _ => {
            let v = floats(&fields, lineno)?;
            h.bins.push(HistoBin1D {
                low: v[0],
                high: v[1],
                dbn: dbn_from(&v[2..]),
            });
        }
    }
    Ok(())
}

fn parse_scatter_line(s: &mut Scatter2D, line: &str, lineno: usize) -> Result<(), YodaError> {
    if take_annotation(&mut s.annotations, line) {
        return Ok(());
    }
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 6 {
        return Err(parse_err(lineno, format!("expected 6 columns, got {}", fields.len())));
    }
    let v = floats(&fields, lineno)?;
    s.points.push(Point2D {
        x: v[0],
        x_err_minus: v[1],
        x_err_plus: v[2],
        y: v[3],
        y_err_minus: v[4],
        y_err_plus: v[5],
    });
    Ok(())
}
