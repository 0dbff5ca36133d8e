//! Custom error types for the scan coordinator.
//!
//! This module defines the primary error type, `ScanError`, for the whole crate.
//! Using the `thiserror` crate, it gives every layer (PV access, planning,
//! sequencing, file output) one consistent way to report failures.
//!
//! ## Error Taxonomy
//!
//! `ScanError` groups failures by how the sequencer must react to them:
//!
//! - **`Config` / `Configuration`**: the site configuration or PV schema is unusable.
//!   These are fatal before a scan starts.
//! - **`Disconnected`**: one or more PVs did not connect. A scan refuses to start.
//! - **`Pv` / `PvTimeout`**: a single get/put failed or was not acknowledged in time.
//! - **`Aborted`**: user- or system-initiated abort. Not a fault; the scan is
//!   cleaned up like any other terminal condition.
//! - **`CameraTimeout`**: the completion monitor exceeded its deadline.
//! - **`FileOverwrite`**: the operator declined to overwrite an existing file.
//! - **`UnsupportedCamera`**: the camera model / pixel format / video mode
//!   combination has no readout entry, so no frame time can be derived.
//! - **`Controller`**: the motion controller answered a PSO command with
//!   something unusable.
//!
//! By using `#[from]`, `ScanError` can be created from I/O, JSON, and figment
//! errors with the `?` operator.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Every failure the scan coordinator can report.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("PVs not connected: {}", pvs.join(", "))]
    Disconnected { pvs: Vec<String> },

    #[error("PV access error on {pv}: {message}")]
    Pv { pv: String, message: String },

    #[error("Timed out after {timeout:?} waiting for {pv}")]
    PvTimeout { pv: String, timeout: Duration },

    #[error("Scan aborted")]
    Aborted,

    #[error("Camera timeout after {elapsed:?}")]
    CameraTimeout { elapsed: Duration },

    #[error("File {} exists and overwrite was declined", .0.display())]
    FileOverwrite(PathBuf),

    #[error(
        "Unsupported camera: model '{model}', pixel format '{pixel_format}', video mode '{video_mode}'"
    )]
    UnsupportedCamera {
        model: String,
        pixel_format: String,
        video_mode: String,
    },

    #[error("PSO controller error: {0}")]
    Controller(String),

    #[error("A scan is already running")]
    Busy,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[cfg(feature = "storage_hdf5")]
    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),
}

impl From<figment::Error> for ScanError {
    fn from(value: figment::Error) -> Self {
        ScanError::Config(Box::new(value))
    }
}

impl ScanError {
    /// Build a PV access error.
    pub fn pv(pv: impl Into<String>, message: impl Into<String>) -> Self {
        ScanError::Pv {
            pv: pv.into(),
            message: message.into(),
        }
    }

    /// True for the distinguished abort condition.
    pub fn is_abort(&self) -> bool {
        matches!(self, ScanError::Aborted)
    }

    /// True for the distinguished camera timeout condition.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ScanError::CameraTimeout { .. })
    }

    /// Terminal operator status string for a scan that ended with this error.
    pub fn status_message(&self) -> &'static str {
        match self {
            ScanError::Aborted => "Scan aborted",
            ScanError::CameraTimeout { .. } => "Camera timeout",
            ScanError::FileOverwrite(_) => "File overwrite aborted",
            ScanError::UnsupportedCamera { .. } => "Unsupported camera",
            ScanError::Disconnected { .. } => "PVs not connected",
            ScanError::Config(_) | ScanError::Configuration(_) => "Configuration error",
            _ => "Scan failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinguishes_abort_from_timeout() {
        let abort = ScanError::Aborted;
        let timeout = ScanError::CameraTimeout {
            elapsed: Duration::from_secs(65),
        };
        assert!(abort.is_abort());
        assert!(!abort.is_timeout());
        assert!(timeout.is_timeout());
        assert!(!timeout.is_abort());
        assert_eq!(abort.status_message(), "Scan aborted");
        assert_eq!(timeout.status_message(), "Camera timeout");
    }

    #[test]
    fn disconnected_lists_every_pv() {
        let err = ScanError::Disconnected {
            pvs: vec!["2bma:m82.VELO".into(), "2bmbSP1:cam1:Acquire".into()],
        };
        let message = err.to_string();
        assert!(message.contains("2bma:m82.VELO"));
        assert!(message.contains("2bmbSP1:cam1:Acquire"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::from(std::io::ErrorKind::NotFound);
        let err: ScanError = io.into();
        assert!(matches!(err, ScanError::Io(_)));
        assert_eq!(err.status_message(), "Scan failed");
    }
}
