//! Per-digest property files
//!
//! Each resident digest has a small `name=value` file next to its content
//! recording which keys reference it plus arbitrary caller metadata:
//!
//! ```text
//! # stowage item properties
//! stowage.keys=alpha,beta
//! content-type=text/plain
//! ```
//!
//! The reserved [`KEYS_PROPERTY`] holds the comma-joined key strings, so key
//! strings may never contain a comma. Backslash, CR and LF are escaped in names
//! and values; `=` and `#` are additionally escaped in names.

use crate::index::{CacheIndex, CacheKey};
use crate::layout::CacheLayout;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;

/// Reserved property holding the list of referencing keys
pub const KEYS_PROPERTY: &str = "stowage.keys";

const HEADER: &str = "# stowage item properties";

/// Decoded contents of a property file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyRecord {
    /// String forms of every key referencing the digest
    pub keys: Vec<String>,
    /// Caller metadata, never containing [`KEYS_PROPERTY`]
    pub user: BTreeMap<String, String>,
}

/// Check that a key string can be stored in the key list
///
/// # Errors
///
/// Returns [`Error::InvalidKey`] for empty strings and strings containing a comma
pub fn validate_key_string(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::invalid_key(key, "key string is empty"));
    }
    if key.contains(',') {
        return Err(Error::invalid_key(key, "key string contains a comma"));
    }
    Ok(())
}

/// Render a property file
///
/// # Errors
///
/// Returns [`Error::InvalidKey`] if any key string cannot be persisted
pub fn serialize(keys: &[String], user: &BTreeMap<String, String>) -> Result<String> {
    for key in keys {
        validate_key_string(key)?;
    }

    let mut out = String::new();
    out.push_str(HEADER);
    out.push('\n');
    out.push_str(KEYS_PROPERTY);
    out.push('=');
    out.push_str(&escape_value(&keys.join(",")));
    out.push('\n');

    for (name, value) in user {
        if name == KEYS_PROPERTY {
            continue;
        }
        out.push_str(&escape_name(name));
        out.push('=');
        out.push_str(&escape_value(value));
        out.push('\n');
    }
    Ok(out)
}

/// Parse the text of a property file; `path` is only used for error context
///
/// # Errors
///
/// Returns [`Error::CorruptProperties`] for malformed lines, a missing key list,
/// or an empty key in the list
pub fn parse(text: &str, path: &Path) -> Result<PropertyRecord> {
    let mut keys = None;
    let mut user = BTreeMap::new();

    for (lineno, line) in text.lines().enumerate() {
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let (name, value) = parse_line(line)
            .map_err(|msg| Error::corrupt_properties(path, format!("line {}: {msg}", lineno + 1)))?;
        if name == KEYS_PROPERTY {
            keys = Some(value);
        } else {
            user.insert(name, value);
        }
    }

    let Some(joined) = keys else {
        return Err(Error::corrupt_properties(path, "missing key list"));
    };
    if joined.is_empty() {
        return Err(Error::corrupt_properties(path, "empty key list"));
    }
    let keys: Vec<String> = joined.split(',').map(str::to_string).collect();
    if keys.iter().any(String::is_empty) {
        return Err(Error::corrupt_properties(path, "empty key in key list"));
    }

    Ok(PropertyRecord { keys, user })
}

/// Write a property file via a temporary file in `scratch_dir` and a rename
///
/// # Errors
///
/// Returns [`Error::InvalidKey`] for unpersistable keys and [`Error::Io`] when
/// the temporary file cannot be written or moved into place
pub fn write(
    path: &Path,
    scratch_dir: &Path,
    keys: &[String],
    user: &BTreeMap<String, String>,
) -> Result<()> {
    let text = serialize(keys, user)?;

    let mut tmp = tempfile::Builder::new()
        .prefix("props-")
        .tempfile_in(scratch_dir)
        .map_err(|e| Error::io(e, scratch_dir, "create temp file"))?;
    tmp.write_all(text.as_bytes())
        .map_err(|e| Error::io(e, tmp.path(), "write"))?;
    tmp.persist(path)
        .map_err(|e| Error::io(e.error, path, "rename"))?;
    Ok(())
}

/// Rewrite the property file of a resident digest from the index
pub(crate) fn persist_for<K: CacheKey>(
    layout: &CacheLayout,
    index: &CacheIndex<K>,
    digest: &str,
) -> Result<()> {
    let keys = index.key_strings(digest);
    let user = index
        .item(digest)
        .map(|item| item.properties().clone())
        .unwrap_or_default();
    write(
        &layout.properties_path(digest),
        layout.tmp_dir(),
        &keys,
        &user,
    )
}

/// Read and parse a property file
///
/// # Errors
///
/// Returns [`Error::Io`] if the file cannot be read (including `NotFound`) and
/// [`Error::CorruptProperties`] if it is not valid UTF-8 or fails to parse
pub fn read(path: &Path) -> Result<PropertyRecord> {
    let text = fs::read_to_string(path).map_err(|e| {
        if e.kind() == ErrorKind::InvalidData {
            Error::corrupt_properties(path, "not valid UTF-8")
        } else {
            Error::io(e, path, "read")
        }
    })?;
    parse(&text, path)
}

fn escape_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '=' => out.push_str("\\="),
            '#' => out.push_str("\\#"),
            _ => push_escaped(&mut out, c),
        }
    }
    out
}

fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        push_escaped(&mut out, c);
    }
    out
}

fn push_escaped(out: &mut String, c: char) {
    match c {
        '\\' => out.push_str("\\\\"),
        '\n' => out.push_str("\\n"),
        '\r' => out.push_str("\\r"),
        _ => out.push(c),
    }
}

fn parse_line(line: &str) -> std::result::Result<(String, String), String> {
    let mut name = String::new();
    let mut value = String::new();
    let mut in_value = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        let out = if in_value { &mut value } else { &mut name };
        match c {
            '\\' => {
                let escaped = chars.next().ok_or("trailing backslash")?;
                let decoded = match escaped {
                    '\\' => '\\',
                    'n' => '\n',
                    'r' => '\r',
                    '=' | '#' if !in_value => escaped,
                    other => return Err(format!("unknown escape sequence \\{other}")),
                };
                out.push(decoded);
            }
            '=' if !in_value => in_value = true,
            _ => out.push(c),
        }
    }

    if !in_value {
        return Err("missing '=' separator".to_string());
    }
    Ok((name, value))
}
