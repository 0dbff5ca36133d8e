//! Shutter, sample stage and exposure helpers.
//!
//! These are the beamline-side actions shared by every scan kind and by the
//! operator commands (`MoveSampleIn`, `MoveSampleOut`, `ExposureTime`).
//! Shutters are optional: a PV file without `OpenShutterPVName` or
//! `CloseShutterPVName` simply skips the action.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::ScanControl;
use crate::config::TimingConfig;
use crate::error::{ScanError, ScanResult};
use crate::pv::DeviceRegistry;

/// Which sample axes move for flat fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlatFieldAxis {
    /// Horizontal only
    X,
    /// Vertical only
    Y,
    /// Both axes
    Both,
}

impl FlatFieldAxis {
    fn parse(text: &str) -> ScanResult<Self> {
        match text.trim() {
            "X" => Ok(FlatFieldAxis::X),
            "Y" => Ok(FlatFieldAxis::Y),
            "Both" => Ok(FlatFieldAxis::Both),
            other => Err(ScanError::Configuration(format!(
                "Unknown flat field axis '{other}'"
            ))),
        }
    }

    fn moves_x(self) -> bool {
        matches!(self, FlatFieldAxis::X | FlatFieldAxis::Both)
    }

    fn moves_y(self) -> bool {
        matches!(self, FlatFieldAxis::Y | FlatFieldAxis::Both)
    }
}

/// Beamline actions outside the camera and the PSO.
pub struct Beamline {
    registry: Arc<DeviceRegistry>,
    timing: TimingConfig,
    control: ScanControl,
    /// Rotation angle saved by the last out-of-beam rotation
    saved_rotation: Mutex<Option<f64>>,
}

impl Beamline {
    /// Helpers sharing the scan's running flag.
    pub fn new(registry: Arc<DeviceRegistry>, timing: TimingConfig, control: ScanControl) -> Self {
        Self {
            registry,
            timing,
            control,
            saved_rotation: Mutex::new(None),
        }
    }

    /// Open the shutter and wait for it.
    pub async fn open_shutter(&self) -> ScanResult<()> {
        self.shutter("OpenShutter", "OpenShutterValue").await
    }

    /// Close the shutter and wait for it.
    pub async fn close_shutter(&self) -> ScanResult<()> {
        self.shutter("CloseShutter", "CloseShutterValue").await
    }

    async fn shutter(&self, key: &str, value_key: &str) -> ScanResult<()> {
        if !self.registry.has(key) {
            info!(action = %key, "no shutter PV configured; skipped");
            return Ok(());
        }
        let value = self.registry.get_string(value_key).await?;
        info!(action = %key, %value, "shutter");
        self.registry
            .put_and_wait(key, value, self.timing.shutter_timeout())
            .await
    }

    async fn flat_field_axis(&self) -> ScanResult<FlatFieldAxis> {
        FlatFieldAxis::parse(&self.registry.get_string("FlatFieldAxis").await?)
    }

    async fn out_angle_enabled(&self) -> ScanResult<bool> {
        Ok(self.registry.get_string("SampleOutAngleEnable").await? == "Yes")
    }

    /// Move the rotation stage at maximum speed, then restore the speed.
    async fn rotate_at_max_speed(&self, angle: f64) -> ScanResult<()> {
        let speed = self.registry.get_float("RotationSpeed").await?;
        let max_speed = self.registry.get_float("RotationMaxSpeed").await?;
        self.registry.put("RotationSpeed", max_speed).await?;
        let moved = self
            .registry
            .put_and_wait("Rotation", angle, self.timing.sample_move_timeout())
            .await;
        self.registry.put("RotationSpeed", speed).await?;
        moved
    }

    async fn move_axes(&self, axis: FlatFieldAxis, x_key: &str, y_key: &str) -> ScanResult<()> {
        let timeout = self.timing.sample_move_timeout();
        if axis.moves_x() {
            let position = self.registry.get_float(x_key).await?;
            info!(position, "move sample X");
            self.registry.put_and_wait("SampleX", position, timeout).await?;
        }
        if axis.moves_y() {
            let position = self.registry.get_float(y_key).await?;
            info!(position, "move sample Y");
            self.registry.put_and_wait("SampleY", position, timeout).await?;
        }
        Ok(())
    }

    /// Move the sample out of the beam for flat fields.
    ///
    /// With `SampleOutAngleEnable` the stage first rotates to
    /// `SampleOutAngle`; the angle it came from is remembered for
    /// [`move_sample_in`](Self::move_sample_in).
    pub async fn move_sample_out(&self) -> ScanResult<()> {
        if self.out_angle_enabled().await? {
            let current = self.registry.get_float("RotationRBV").await?;
            let angle = self.registry.get_float("SampleOutAngle").await?;
            *self.saved_rotation.lock() = Some(current);
            info!(from = current, to = angle, "rotate sample out");
            self.rotate_at_max_speed(angle).await?;
        }
        let axis = self.flat_field_axis().await?;
        self.move_axes(axis, "SampleOutX", "SampleOutY").await?;
        self.registry.put("MoveSampleOut", "Done").await
    }

    /// Move the sample back into the beam.
    pub async fn move_sample_in(&self) -> ScanResult<()> {
        let axis = self.flat_field_axis().await?;
        self.move_axes(axis, "SampleInX", "SampleInY").await?;
        if self.out_angle_enabled().await? {
            let saved = self.saved_rotation.lock().take();
            if let Some(angle) = saved {
                info!(to = angle, "rotate sample in");
                self.rotate_at_max_speed(angle).await?;
            }
        }
        self.registry.put("MoveSampleIn", "Done").await
    }

    /// Operator exposure change: applied only when no scan is running.
    pub async fn set_exposure_time(&self, seconds: Option<f64>) -> ScanResult<()> {
        if self.control.in_scan() {
            info!("scan running; exposure change deferred to the next scan");
            return Ok(());
        }
        let seconds = match seconds {
            Some(s) => s,
            None => self.registry.get_float("ExposureTime").await?,
        };
        self.apply_exposure_time(seconds).await
    }

    /// Write the camera exposure unconditionally.
    pub async fn apply_exposure_time(&self, seconds: f64) -> ScanResult<()> {
        info!(seconds, "exposure time");
        self.registry
            .put_and_wait("CamAcquireTime", seconds, Duration::from_secs(10))
            .await
    }

    /// Mirror `FilePath` into the file plugin.
    pub async fn copy_file_path(&self) -> ScanResult<()> {
        let path = self.registry.get_string("FilePath").await?;
        self.registry
            .put_and_wait("FPFilePath", path, self.timing.trigger_mode_timeout())
            .await
    }

    /// Mirror the plugin's directory check into `FilePathExists`.
    pub async fn copy_file_path_exists(&self) -> ScanResult<()> {
        let exists = self.registry.get_string("FPFilePathExists").await?;
        self.registry.put("FilePathExists", exists).await
    }
}
