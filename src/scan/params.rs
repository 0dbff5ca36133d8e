//! Scan parameter snapshot.
//!
//! Parameters are read once at `begin_scan`. The running scan uses only this
//! copy, so edits to the PVs during a scan take effect on the next one.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use crate::error::{ScanError, ScanResult};
use crate::pv::DeviceRegistry;

/// When dark or flat fields are collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FieldMode {
    /// Never
    #[default]
    None,
    /// Before the projections
    Start,
    /// After the projections
    End,
    /// Before and after
    Both,
}

impl FieldMode {
    /// Collected before the projections.
    pub fn at_start(self) -> bool {
        matches!(self, FieldMode::Start | FieldMode::Both)
    }

    /// Collected after the projections.
    pub fn at_end(self) -> bool {
        matches!(self, FieldMode::End | FieldMode::Both)
    }

    /// Number of collections per scan.
    pub fn collections(self) -> u32 {
        match self {
            FieldMode::None => 0,
            FieldMode::Start | FieldMode::End => 1,
            FieldMode::Both => 2,
        }
    }
}

impl FromStr for FieldMode {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "None" => Ok(FieldMode::None),
            "Start" => Ok(FieldMode::Start),
            "End" => Ok(FieldMode::End),
            "Both" => Ok(FieldMode::Both),
            other => Err(ScanError::Configuration(format!(
                "Unknown field mode '{other}'"
            ))),
        }
    }
}

impl fmt::Display for FieldMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FieldMode::None => "None",
            FieldMode::Start => "Start",
            FieldMode::End => "End",
            FieldMode::Both => "Both",
        };
        f.write_str(text)
    }
}

/// Immutable copy of the scan parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanParameters {
    /// Projection exposure, seconds
    pub exposure_time: f64,
    /// Flat-field exposure, seconds, resolved from `DifferentFlatExposure`
    pub flat_exposure_time: f64,
    /// First angle, degrees
    pub rotation_start: f64,
    /// Angular step, degrees, signed
    pub rotation_step: f64,
    /// `rotation_start + num_angles · rotation_step`
    pub rotation_stop: f64,
    /// Number of projections
    pub num_angles: u32,
    /// Dark fields per collection
    pub num_dark_fields: u32,
    /// When darks are collected
    pub dark_field_mode: FieldMode,
    /// Flat fields per collection
    pub num_flat_fields: u32,
    /// When flats are collected
    pub flat_field_mode: FieldMode,
    /// Return to `rotation_start` at the end
    pub return_rotation: bool,
    /// Motor resolution
    pub rotation_resolution: f64,
    /// Motor maximum speed
    pub max_rotation_speed: f64,
    /// File plugin directory read-back
    pub file_path_rbv: String,
    /// File plugin name read-back
    pub file_name_rbv: String,
    /// File plugin next file number
    pub file_number: i64,
    /// File plugin name template
    pub file_template: String,
    /// Ask before overwriting an existing file
    pub overwrite_warning: bool,
    /// HDF5 group of the projections
    pub projection_location: String,
    /// HDF5 group of the flat fields
    pub flat_location: String,
    /// HDF5 group of the dark fields
    pub dark_location: String,
}

impl ScanParameters {
    /// Read every parameter PV once.
    pub async fn read(registry: &DeviceRegistry) -> ScanResult<Self> {
        let num_angles = non_negative(registry, "NumAngles").await?;
        let rotation_start = registry.get_float("RotationStart").await?;
        let rotation_step = registry.get_float("RotationStep").await?;
        let exposure_time = registry.get_float("ExposureTime").await?;
        if !(exposure_time > 0.0) {
            return Err(ScanError::Configuration(format!(
                "exposure time must be positive, got {exposure_time}"
            )));
        }
        let flat_exposure_time = if registry.get_string("DifferentFlatExposure").await? == "Same" {
            exposure_time
        } else {
            let flat = registry.get_float("FlatExposureTime").await?;
            if !(flat > 0.0) {
                return Err(ScanError::Configuration(format!(
                    "flat exposure time must be positive, got {flat}"
                )));
            }
            warn!(seconds = flat, "flat fields use a different exposure time");
            flat
        };
        Ok(Self {
            exposure_time,
            flat_exposure_time,
            rotation_start,
            rotation_step,
            rotation_stop: rotation_start + f64::from(num_angles) * rotation_step,
            num_angles,
            num_dark_fields: non_negative(registry, "NumDarkFields").await?,
            dark_field_mode: registry.get_string("DarkFieldMode").await?.parse()?,
            num_flat_fields: non_negative(registry, "NumFlatFields").await?,
            flat_field_mode: registry.get_string("FlatFieldMode").await?.parse()?,
            return_rotation: registry.get_string("ReturnRotation").await? == "Yes",
            rotation_resolution: registry.get_float("RotationResolution").await?,
            max_rotation_speed: registry.get_float("RotationMaxSpeed").await?,
            file_path_rbv: registry.get_string("FPFilePathRBV").await?,
            file_name_rbv: registry.get_string("FPFileNameRBV").await?,
            file_number: registry.get_int("FPFileNumber").await?,
            file_template: registry.get_string("FPFileTemplate").await?,
            overwrite_warning: registry.get_string("OverwriteWarning").await? == "Yes",
            projection_location: registry.get_string("HDF5ProjectionLocation").await?,
            flat_location: registry.get_string("HDF5FlatLocation").await?,
            dark_location: registry.get_string("HDF5DarkLocation").await?,
        })
    }

    /// Dark fields collected at the start of the scan.
    pub fn darks_at_start(&self) -> bool {
        self.num_dark_fields > 0 && self.dark_field_mode.at_start()
    }

    /// Dark fields collected at the end of the scan.
    pub fn darks_at_end(&self) -> bool {
        self.num_dark_fields > 0 && self.dark_field_mode.at_end()
    }

    /// Flat fields collected at the start of the scan.
    pub fn flats_at_start(&self) -> bool {
        self.num_flat_fields > 0 && self.flat_field_mode.at_start()
    }

    /// Flat fields collected at the end of the scan.
    pub fn flats_at_end(&self) -> bool {
        self.num_flat_fields > 0 && self.flat_field_mode.at_end()
    }

    /// Projections plus every dark and flat collection.
    pub fn total_images(&self) -> u32 {
        self.num_angles
            + self.num_dark_fields * self.dark_field_mode.collections()
            + self.num_flat_fields * self.flat_field_mode.collections()
    }
}

async fn non_negative(registry: &DeviceRegistry, key: &str) -> ScanResult<u32> {
    let value = registry.get_int(key).await?;
    u32::try_from(value)
        .map_err(|_| ScanError::Configuration(format!("{key} must not be negative, got {value}")))
}
