//! Generator parameter (`.cmnd`) files.
//!
//! Settings are `name = value` lines. Lines starting with `#` or `!` are
//! comments, and anything after an inline `#` or `!` is ignored.

use crate::error::ParamsError;
use crate::model::Param;
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::Path;

fn read_text(path: &Path) -> Result<String, ParamsError> {
    std::fs::read_to_string(path).map_err(|source| ParamsError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Name part of a setting line, if the line has one.
fn line_key(line: &str) -> Option<&str> {
    line.split_once('=').map(|(name, _)| name.trim())
}

fn strip_value(raw: &str) -> &str {
    let raw = raw.split('#').next().unwrap_or_default();
    raw.split('!').next().unwrap_or_default().trim()
}

/// Parse every setting into a map; later duplicates win.
pub fn parse(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .filter(|line| !matches!(line.chars().next(), None | Some('#') | Some('!')))
        .filter_map(|line| line.split_once('='))
        .map(|(name, value)| (name.trim().to_string(), strip_value(value).to_string()))
        .filter(|(name, _)| !name.is_empty())
        .collect()
}

pub fn read_params(path: &Path) -> Result<BTreeMap<String, String>, ParamsError> {
    Ok(parse(&read_text(path)?))
}

/// Fill each param's current value from the first matching line in the file.
pub fn load_params(path: &Path, params: &mut [Param]) -> Result<(), ParamsError> {
    let text = read_text(path)?;
    for param in params.iter_mut() {
        let key = param.file_key();
        if let Some(value) = text
            .lines()
            .find(|line| line_key(line) == Some(key.as_str()))
            .and_then(|line| line.split_once('='))
            .map(|(_, value)| strip_value(value))
        {
            param.current_value = Some(value.to_string());
        }
    }
    Ok(())
}

/// Rewrite the file with the given values.
///
/// The first line setting a parameter is replaced, later duplicates are
/// dropped, every other line is kept (trimmed) and parameters missing from
/// the file are appended. The new content replaces the file via a rename.
pub fn save_params(path: &Path, params: &[Param]) -> Result<(), ParamsError> {
    let text = read_text(path)?;
    let persist_err = |source: std::io::Error| ParamsError::Persist {
        path: path.to_path_buf(),
        source,
    };

    let values: Vec<(String, String)> = params
        .iter()
        .filter_map(|p| p.current_value.as_ref().map(|v| (p.file_key(), v.clone())))
        .collect();
    let mut written: HashSet<&str> = HashSet::new();
    let mut out = String::with_capacity(text.len());

    for line in text.lines() {
        let matched = line_key(line).and_then(|key| values.iter().find(|(name, _)| name == key));
        match matched {
            Some((name, value)) => {
                if written.insert(name.as_str()) {
                    out.push_str(&format!("{name} = {value}\n"));
                }
            }
            None => {
                out.push_str(line.trim());
                out.push('\n');
            }
        }
    }
    for (name, value) in &values {
        if !written.contains(name.as_str()) {
            out.push_str(&format!("{name} = {value}\n"));
        }
    }

    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(persist_err)?;
    tmp.write_all(out.as_bytes()).map_err(persist_err)?;
    tmp.persist(path).map_err(|e| persist_err(e.error))?;
    Ok(())
}
