//! # tomoscan
//!
//! Coordinates tomography fly scans on a synchrotron beamline. The crate
//! drives a rotation stage, an areaDetector camera, its HDF5 file writer and
//! an Aerotech motion controller's position-synchronized output (PSO) through
//! EPICS process variables, so that the camera is triggered by the stage's
//! encoder at evenly spaced angles.
//!
//! ## Crate Structure
//!
//! - **`config`**: figment-based configuration (`config/tomoscan.toml` plus
//!   `TOMOSCAN_` environment overrides) and the named settle times.
//! - **`error`**: the `ScanError` enum shared by every layer.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`pv`**: the PV access trait, the PV file parser, the device registry
//!   and a simulated beamline.
//! - **`motion`**: step quantization, taxi distances and the motion plan.
//! - **`pso`**: the PSO command sequence for Ensemble and A3200 controllers.
//! - **`camera`**: per-model readout tables and the trigger-mode transitions.
//! - **`scan`**: the sequencer, completion monitor and scan-level helpers.
//! - **`stream`**: continuous rotation with on-the-fly re-synchronization
//!   and dark/flat retakes.
//! - **`exchange`**: copying retaken dark and flat fields into capture files.
//! - **`theta`**: matching saved frames to planned angles and writing
//!   `/exchange/theta`.
//! - **`dispatch`**: the control-PV event table and the scan server.
//!
//! ## Features
//!
//! - `storage_hdf5`: read and write the data file with the `hdf5` crate.
//!   Without it, theta reconciliation still runs in memory but nothing is
//!   written.

pub mod camera;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod exchange;
pub mod logging;
pub mod motion;
pub mod pso;
pub mod pv;
pub mod scan;
pub mod stream;
pub mod theta;

pub use config::TomoScanConfig;
pub use error::{ScanError, ScanResult};
pub use scan::{ScanOutcome, ScanSequencer, ScanStatus};
