//! Process-variable access.
//!
//! The control system is reached through EPICS process variables. The scan
//! coordinator never talks to hardware directly: it reads and writes named PVs
//! and reacts to monitor updates. This module defines that contract.
//!
//! - [`PvValue`] is the value carried by a PV (integer, float or string).
//! - [`PvAccess`] is the capability trait a transport must implement: `get`,
//!   `put`, `put_and_wait` with a timeout, connection checks and monitors.
//! - [`file`] parses the PV name files that map logical names to PV names.
//! - [`registry`] turns those entries into a checked [`DeviceRegistry`] with
//!   typed accessors.
//! - [`sim`] is an in-memory IOC used by the tests and the `simulate` command.
//!
//! # Design
//!
//! Like the other capability traits in this crate family, `PvAccess` is async
//! (`#[async_trait]`), requires `Send + Sync`, and takes `&self`; an
//! implementation keeps its state behind interior mutability.

pub mod file;
pub mod registry;
pub mod sim;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::ScanResult;

pub use file::{parse_pv_file, read_pv_file, Macros, PvEntry, PvRole};
pub use registry::DeviceRegistry;

/// Value carried by a process variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PvValue {
    /// Integer record (longout, mbbo/bo index, busy)
    Int(i64),
    /// Floating point record (ao, motor fields)
    Float(f64),
    /// String record (stringout, waveform of char)
    Str(String),
}

impl PvValue {
    /// Numeric view. Strings are parsed; unparseable strings give `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PvValue::Int(v) => Some(*v as f64),
            PvValue::Float(v) => Some(*v),
            PvValue::Str(s) => s.trim().parse::<f64>().ok(),
        }
    }

    /// Integer view. Floats are rounded to the nearest integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PvValue::Int(v) => Some(*v),
            PvValue::Float(v) if v.is_finite() => Some(v.round() as i64),
            PvValue::Float(_) => None,
            PvValue::Str(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().map(|v| v.round() as i64))
            }
        }
    }

    /// True when the value is numerically equal to `target`.
    pub fn matches(&self, target: f64) -> bool {
        self.as_f64().map(|v| v == target).unwrap_or(false)
    }
}

impl fmt::Display for PvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PvValue::Int(v) => write!(f, "{}", v),
            PvValue::Float(v) => write!(f, "{}", v),
            PvValue::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for PvValue {
    fn from(value: i64) -> Self {
        PvValue::Int(value)
    }
}

impl From<i32> for PvValue {
    fn from(value: i32) -> Self {
        PvValue::Int(value as i64)
    }
}

impl From<u32> for PvValue {
    fn from(value: u32) -> Self {
        PvValue::Int(value as i64)
    }
}

impl From<f64> for PvValue {
    fn from(value: f64) -> Self {
        PvValue::Float(value)
    }
}

impl From<&str> for PvValue {
    fn from(value: &str) -> Self {
        PvValue::Str(value.to_string())
    }
}

impl From<String> for PvValue {
    fn from(value: String) -> Self {
        PvValue::Str(value)
    }
}

/// Capability: process-variable transport
///
/// # Contract
/// - `get` returns the native value; enum records return their index.
/// - `get_string` returns the display string; enum records return the choice label.
/// - `put` returns once the write is issued.
/// - `put_and_wait` returns once the record finished processing, or fails with
///   `ScanError::PvTimeout` after `timeout`.
/// - `subscribe` delivers every subsequent value change.
#[async_trait]
pub trait PvAccess: Send + Sync {
    /// Wait up to `timeout` for the channel to connect.
    async fn connect(&self, pv: &str, timeout: Duration) -> bool;

    /// Read the current value.
    async fn get(&self, pv: &str) -> ScanResult<PvValue>;

    /// Read the current value as a display string.
    async fn get_string(&self, pv: &str) -> ScanResult<String>;

    /// Write without waiting for completion.
    async fn put(&self, pv: &str, value: PvValue) -> ScanResult<()>;

    /// Write and wait for the record to finish processing.
    async fn put_and_wait(&self, pv: &str, value: PvValue, timeout: Duration) -> ScanResult<()>;

    /// Monitor the PV.
    fn subscribe(&self, pv: &str) -> ScanResult<broadcast::Receiver<PvValue>>;
}
