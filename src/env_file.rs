//! Plain `KEY=VALUE` env files.
//!
//! One pair per line. Blank lines and `#` comments are skipped, a value
//! wrapped in matching single or double quotes is unwrapped, and a value
//! starting with `~/` is expanded against the home directory. There is no
//! other escaping.

use crate::error::FileError;
use crate::paths::expand_home;
use crate::Result;
use indexmap::IndexMap;
use std::path::Path;

pub type EnvPairs = IndexMap<String, String>;

pub fn parse(raw: &str, home: &Path) -> EnvPairs {
    let mut pairs = EnvPairs::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = unquote(value.trim());
        pairs.insert(key.to_string(), expand_home(value, home));
    }
    pairs
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Reads an env file. A missing file yields `None`.
pub fn read(path: &Path, home: &Path) -> Result<Option<EnvPairs>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path).map_err(|source| FileError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(parse(&raw, home)))
}

pub fn serialize(pairs: &EnvPairs) -> String {
    let mut out = String::new();
    for (key, value) in pairs {
        let needs_quotes = value.chars().any(|c| c.is_whitespace() || c == '#');
        if needs_quotes && !value.contains('"') {
            out.push_str(&format!("{key}=\"{value}\"\n"));
        } else {
            out.push_str(&format!("{key}={value}\n"));
        }
    }
    out
}

pub fn write(path: &Path, pairs: &EnvPairs) -> Result<()> {
    if let Some(parent) = path.parent() {
        xx::file::mkdirp(parent)?;
    }
    xx::file::write(path, serialize(pairs)).map_err(|e| FileError::WriteError {
        path: path.to_path_buf(),
        details: Some(e.to_string()),
    })?;
    Ok(())
}
