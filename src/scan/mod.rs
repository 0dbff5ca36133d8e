//! Scan sequencing.
//!
//! - [`sequencer`]: the phase machine (begin, darks, flats, projections, end)
//!   for fly, step and stream scans, with guaranteed cleanup.
//! - [`monitor`]: completion and read-back waits, progress and ETA.
//! - [`params`]: the parameter snapshot taken at `begin_scan`.
//! - [`status`]: operator-visible scan states and cleanup records.
//! - [`beamline`]: shutter, sample and exposure helpers.
//! - [`filename`]: C-style file templates and overwrite confirmation.
//! - [`snapshot`]: configuration snapshots written beside the data file.

pub mod beamline;
pub mod filename;
pub mod monitor;
pub mod params;
pub mod sequencer;
pub mod snapshot;
pub mod status;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{ScanError, ScanResult};

pub use params::{FieldMode, ScanParameters};
pub use sequencer::ScanSequencer;
pub use status::{CleanupOutcome, CleanupRecord, CleanupStep, ScanOutcome, ScanStatus};

/// Shared scan claim and abort request.
///
/// Cloning shares both flags. The claim is held from `try_begin` until the
/// end of cleanup, so no second scan can start while an aborted one is still
/// cleaning up. The abort request is separate and only `try_begin` clears it.
#[derive(Debug, Clone, Default)]
pub struct ScanControl(Arc<ControlFlags>);

#[derive(Debug, Default)]
struct ControlFlags {
    in_scan: AtomicBool,
    abort_requested: AtomicBool,
}

impl ScanControl {
    /// Flags in the idle state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the scan slot and clear any stale abort request.
    ///
    /// # Errors
    ///
    /// `ScanError::Busy` while another scan holds the claim, including during
    /// its cleanup.
    pub fn try_begin(&self) -> ScanResult<()> {
        self.0
            .in_scan
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| ScanError::Busy)?;
        self.0.abort_requested.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Ask the running scan to stop. The claim stays held until cleanup ends.
    pub fn request_abort(&self) {
        self.0.abort_requested.store(true, Ordering::SeqCst);
    }

    /// Whether an abort was requested since the last `try_begin`.
    pub fn abort_requested(&self) -> bool {
        self.0.abort_requested.load(Ordering::SeqCst)
    }

    /// Whether a scan holds the claim, cleanup included.
    pub fn in_scan(&self) -> bool {
        self.0.in_scan.load(Ordering::SeqCst)
    }

    /// Whether a scan holds the claim and has not been asked to stop.
    pub fn is_running(&self) -> bool {
        self.in_scan() && !self.abort_requested()
    }

    /// Release the claim after cleanup.
    pub fn finish(&self) {
        self.0.in_scan.store(false, Ordering::SeqCst);
    }

    /// `Err(Aborted)` once an abort was requested.
    pub fn ensure_running(&self) -> ScanResult<()> {
        if self.abort_requested() {
            Err(ScanError::Aborted)
        } else {
            Ok(())
        }
    }
}
