//! Scan states and outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::ScanError;

/// Operator-visible scan state.
///
/// # State Machine
///
/// ```text
/// Idle ──> BeginningScan ──> CollectingDark ──> CollectingFlat ──> CollectingProjections
///                                                                        │
///   ScanComplete <── CollectingDark <── CollectingFlat <─────────────────┘
///
/// any active state ──abort──> (end-of-scan cleanup) ──> Aborted
/// any active state ──fault──> (end-of-scan cleanup) ──> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanStatus {
    /// No scan running
    Idle,
    /// Reading parameters, arming the file writer
    BeginningScan,
    /// Shutter closed, collecting dark fields
    CollectingDark,
    /// Sample out, collecting flat fields
    CollectingFlat,
    /// Sample in, collecting projections
    CollectingProjections,
    /// Finished normally
    ScanComplete,
    /// Finished after an abort request
    Aborted,
    /// Finished after a fault (timeout, PV error, declined overwrite)
    Failed,
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ScanStatus::Idle => "Idle",
            ScanStatus::BeginningScan => "Beginning scan",
            ScanStatus::CollectingDark => "Collecting dark fields",
            ScanStatus::CollectingFlat => "Collecting flat fields",
            ScanStatus::CollectingProjections => "Collecting projections",
            ScanStatus::ScanComplete => "Scan complete",
            ScanStatus::Aborted => "Scan aborted",
            ScanStatus::Failed => "Scan failed",
        };
        f.write_str(text)
    }
}

impl ScanStatus {
    /// True while a scan is between begin and end.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ScanStatus::BeginningScan
                | ScanStatus::CollectingDark
                | ScanStatus::CollectingFlat
                | ScanStatus::CollectingProjections
        )
    }

    /// True for the states a scan ends in.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanStatus::ScanComplete | ScanStatus::Aborted | ScanStatus::Failed
        )
    }

    /// Check if a new scan may start from this state.
    pub fn can_begin(&self) -> bool {
        !self.is_active()
    }

    /// Terminal state for the result of a scan body.
    pub fn terminal_for(error: Option<&ScanError>) -> Self {
        match error {
            None => ScanStatus::ScanComplete,
            Some(e) if e.is_abort() => ScanStatus::Aborted,
            Some(_) => ScanStatus::Failed,
        }
    }
}

/// One end-of-scan cleanup action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CleanupStep {
    /// Write the `.config` snapshot beside the data file
    SaveConfiguration,
    /// Reset the streaming session and stop the jog
    EndStream,
    /// Camera back to FreeRun and acquiring
    FreeRun,
    /// Rotation speed back to maximum
    RestoreSpeed,
    /// PSO window and generator off
    DisarmPso,
    /// Sample back into the beam
    SampleIn,
    /// Close the shutter
    CloseShutter,
    /// Stop the file writer
    StopCapture,
    /// Rotation back to the start angle
    ReturnRotation,
    /// Theta dataset written to the data file
    AddTheta,
    /// Terminal status and `StartScan` reset
    Status,
}

/// What happened to one cleanup step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanupOutcome {
    /// Completed
    Done,
    /// Not applicable to this scan
    Skipped(String),
    /// Failed; later steps still ran
    Failed(String),
}

/// Record of one cleanup step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupRecord {
    /// Which step
    pub step: CleanupStep,
    /// How it went
    pub outcome: CleanupOutcome,
}

/// Result of [`ScanSequencer::run_scan`](super::ScanSequencer::run_scan).
#[derive(Debug)]
pub struct ScanOutcome {
    /// Unique scan identifier
    pub scan_id: Uuid,
    /// Wall-clock start
    pub started_at: DateTime<Utc>,
    /// Wall-clock end, after cleanup
    pub finished_at: DateTime<Utc>,
    /// Terminal state
    pub status: ScanStatus,
    /// What ended the scan body, if not success
    pub error: Option<ScanError>,
    /// Every cleanup step, in order
    pub cleanup: Vec<CleanupRecord>,
}

impl ScanOutcome {
    /// True for a scan that completed normally.
    pub fn is_complete(&self) -> bool {
        self.status == ScanStatus::ScanComplete
    }

    /// Wall-clock duration of the whole scan, cleanup included.
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    /// Number of times `step` appears in the cleanup record.
    pub fn cleanup_count(&self, step: CleanupStep) -> usize {
        self.cleanup.iter().filter(|r| r.step == step).count()
    }

    /// Outcome of `step`, if it ran.
    pub fn cleanup_outcome(&self, step: CleanupStep) -> Option<&CleanupOutcome> {
        self.cleanup
            .iter()
            .find(|r| r.step == step)
            .map(|r| &r.outcome)
    }
}
