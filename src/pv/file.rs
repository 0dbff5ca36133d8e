//! PV name files.
//!
//! A PV file is line oriented. Every non-empty line names one PV, possibly
//! containing `$(NAME)` macros:
//!
//! ```text
//! # comment
//! $(P)$(R)ExposureTime
//! #controlPV $(P)$(R)StartScan
//! ```
//!
//! Macros are substituted in the PV name and removed from the logical key, so
//! the line above yields key `ExposureTime` and PV `2bma:TomoScan:ExposureTime`
//! for `P=2bma:` and `R=TomoScan:`. A `#controlPV` prefix marks a PV as control
//! state that is not persisted in configuration snapshots. Any other line
//! starting with `#` is a comment.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{ScanError, ScanResult};

const CONTROL_PV_TAG: &str = "#controlPV";

static MACRO_TOKEN: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"\$\(([A-Za-z0-9_]+)\)").expect("macro token pattern is valid")
});

/// Whether a PV is part of the persisted configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PvRole {
    /// Saved to and restored from configuration snapshots.
    Config,
    /// Runtime control and status; never persisted.
    Control,
}

/// One parsed line of a PV file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvEntry {
    /// Logical name (macros stripped)
    pub key: String,
    /// Full PV name (macros substituted)
    pub pv_name: String,
    /// Config or control
    pub role: PvRole,
}

/// Macro substitution table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Macros(BTreeMap<String, String>);

impl Macros {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace one macro.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Parse `P=2bma:,R=TomoScan:` style definitions.
    pub fn parse(definitions: &str) -> ScanResult<Self> {
        let mut macros = Self::new();
        for definition in definitions.split(',').map(str::trim).filter(|d| !d.is_empty()) {
            let (name, value) = definition.split_once('=').ok_or_else(|| {
                ScanError::Configuration(format!("Malformed macro definition '{definition}'"))
            })?;
            macros.0.insert(name.trim().to_string(), value.trim().to_string());
        }
        Ok(macros)
    }

    /// Value of one macro.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Substitute every known macro. Unknown macros stay in place.
    pub fn expand(&self, text: &str) -> String {
        MACRO_TOKEN
            .replace_all(text, |caps: &Captures| match self.0.get(&caps[1]) {
                Some(value) => value.clone(),
                None => {
                    warn!(token = &caps[0], "no value for macro; left unexpanded");
                    caps[0].to_string()
                }
            })
            .into_owned()
    }

    /// Remove every macro token.
    pub fn strip(text: &str) -> String {
        MACRO_TOKEN.replace_all(text, "").into_owned()
    }
}

impl From<BTreeMap<String, String>> for Macros {
    fn from(value: BTreeMap<String, String>) -> Self {
        Self(value)
    }
}

/// Parse the contents of a PV file.
pub fn parse_pv_file(contents: &str, macros: &Macros) -> Vec<PvEntry> {
    let mut entries = Vec::new();
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let (role, body) = match line.strip_prefix(CONTROL_PV_TAG) {
            Some(rest) => (PvRole::Control, rest.trim()),
            None if line.starts_with('#') => continue,
            None => (PvRole::Config, line),
        };
        if body.is_empty() {
            continue;
        }
        let entry = PvEntry {
            key: Macros::strip(body),
            pv_name: macros.expand(body),
            role,
        };
        debug!(key = %entry.key, pv = %entry.pv_name, ?role, "PV file entry");
        entries.push(entry);
    }
    entries
}

/// Read and parse a PV file from disk.
pub fn read_pv_file(path: impl AsRef<Path>, macros: &Macros) -> ScanResult<Vec<PvEntry>> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    Ok(parse_pv_file(&contents, macros))
}
