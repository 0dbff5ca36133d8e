//! Camera trigger modes and frame timing.
//!
//! Every transition stops acquisition and waits for the driver to go idle
//! before touching trigger settings. External (PSO) triggering needs a
//! model-specific order of operations; those orderings are hardware quirks and
//! live in [`ExternalSequence`], one entry per supported model.
//!
//! Frame time is `exposure_rbv × margin`, floored at `readout + 1 ms`, with the
//! margin and readout time looked up per model (and pixel format, and for the
//! Grasshopper3 23S6M also video mode). An unknown combination is an error:
//! a guessed frame time would desynchronize the PSO.

use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::config::TimingConfig;
use crate::error::{ScanError, ScanResult};
use crate::pv::DeviceRegistry;
use crate::scan::monitor::wait_pv;
use crate::scan::ScanControl;

/// Added to the readout time when the exposure is shorter than the readout.
pub const READOUT_FLOOR_MARGIN: f64 = 0.001;

/// Camera trigger configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Continuous, untriggered acquisition for live viewing
    FreeRun,
    /// Fixed number of internally timed frames (dark and flat fields)
    Internal,
    /// One frame per PSO pulse
    ExternalPso,
    /// One frame per `TriggerSoftware` write (step scans)
    Software,
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerMode::FreeRun => write!(f, "FreeRun"),
            TriggerMode::Internal => write!(f, "Internal"),
            TriggerMode::ExternalPso => write!(f, "PSOExternal"),
            TriggerMode::Software => write!(f, "Software"),
        }
    }
}

/// How a model is switched to hardware triggering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalSequence {
    /// TriggerMode Off, then overlap and source, then TriggerMode On.
    OffFirst {
        /// Physical trigger input
        line: &'static str,
    },
    /// TriggerMode On before the overlap can be set, then On again at the end.
    OnFirst {
        /// Physical trigger input
        line: &'static str,
    },
    /// No trigger mode record; the exposure mode selects triggering.
    ExposureMode,
}

/// Supported camera models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraModel {
    /// FLIR Grasshopper3 GS3-U3-23S6M
    Grasshopper23S6M,
    /// FLIR Grasshopper3 GS3-U3-51S5M
    Grasshopper51S5M,
    /// FLIR Oryx ORX-10G-51S5M
    Oryx51S5M,
    /// FLIR Oryx ORX-10G-310S9M
    Oryx310S9M,
    /// Adimec Q-12A180 (CoaXPress)
    AdimecQ12A180,
    /// FLIR Blackfly S BFS-PGE-161S7M
    BlackflyS161S7M,
}

impl CameraModel {
    /// Every supported model.
    pub const ALL: [CameraModel; 6] = [
        CameraModel::Grasshopper23S6M,
        CameraModel::Grasshopper51S5M,
        CameraModel::Oryx51S5M,
        CameraModel::Oryx310S9M,
        CameraModel::AdimecQ12A180,
        CameraModel::BlackflyS161S7M,
    ];

    /// Model from the driver's `Model_RBV` string.
    pub fn from_model_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.model_name() == name.trim())
    }

    /// The driver's `Model_RBV` string.
    pub fn model_name(self) -> &'static str {
        match self {
            CameraModel::Grasshopper23S6M => "Grasshopper3 GS3-U3-23S6M",
            CameraModel::Grasshopper51S5M => "Grasshopper3 GS3-U3-51S5M",
            CameraModel::Oryx51S5M => "Oryx ORX-10G-51S5M",
            CameraModel::Oryx310S9M => "Oryx ORX-10G-310S9M",
            CameraModel::AdimecQ12A180 => "Q-12A180-Fm/CXP-6",
            CameraModel::BlackflyS161S7M => "Blackfly S BFS-PGE-161S7M",
        }
    }

    /// Exposure multiplier covering the minimum inter-trigger spacing.
    pub fn readout_margin(self) -> f64 {
        match self {
            CameraModel::Oryx51S5M => 1.02,
            CameraModel::BlackflyS161S7M => 1.035,
            _ => 1.01,
        }
    }

    /// Whether the frame time depends on the video mode.
    pub fn uses_video_mode(self) -> bool {
        self == CameraModel::Grasshopper23S6M
    }

    /// Measured readout time in milliseconds.
    pub fn readout_ms(self, pixel_format: &str, video_mode: &str) -> Option<f64> {
        match (self, pixel_format) {
            (CameraModel::Grasshopper23S6M, format) => {
                let modes: [f64; 4] = match format {
                    "Mono8" => [6.2, 6.2, 6.2, 7.9],
                    "Mono12Packed" => [9.2, 6.2, 6.2, 11.5],
                    "Mono16" => [12.2, 6.2, 6.2, 12.2],
                    _ => return None,
                };
                let index = match video_mode {
                    "Mode0" => 0,
                    "Mode1" => 1,
                    "Mode5" => 2,
                    "Mode7" => 3,
                    _ => return None,
                };
                Some(modes[index])
            }
            (CameraModel::Grasshopper51S5M, "Mono8") => Some(6.18),
            (CameraModel::Grasshopper51S5M, "Mono12Packed" | "Mono12p") => Some(8.20),
            (CameraModel::Grasshopper51S5M, "Mono16") => Some(12.34),
            (CameraModel::Oryx51S5M, "Mono8") => Some(6.18),
            (CameraModel::Oryx51S5M, "Mono12Packed") => Some(8.20),
            (CameraModel::Oryx51S5M, "Mono16") => Some(12.34),
            (CameraModel::Oryx310S9M, "Mono8" | "Mono12Packed" | "Mono16") => Some(30.0),
            (CameraModel::AdimecQ12A180, "Mono8") => Some(5.35),
            (CameraModel::BlackflyS161S7M, "Mono8") => Some(83.4),
            (CameraModel::BlackflyS161S7M, "Mono12Packed") => Some(100.0),
            (CameraModel::BlackflyS161S7M, "Mono16") => Some(142.86),
            _ => None,
        }
    }

    /// Order of operations for external triggering.
    pub fn external_sequence(self) -> ExternalSequence {
        match self {
            CameraModel::Oryx51S5M | CameraModel::Oryx310S9M => {
                ExternalSequence::OffFirst { line: "Line2" }
            }
            CameraModel::Grasshopper23S6M => ExternalSequence::OnFirst { line: "Line0" },
            CameraModel::Grasshopper51S5M | CameraModel::BlackflyS161S7M => {
                ExternalSequence::OffFirst { line: "Line0" }
            }
            CameraModel::AdimecQ12A180 => ExternalSequence::ExposureMode,
        }
    }

    /// Whether the camera accepts software triggers.
    pub fn supports_software_trigger(self) -> bool {
        !matches!(self.external_sequence(), ExternalSequence::ExposureMode)
    }
}

/// Seconds between triggers for an exposure read back from the camera.
///
/// # Errors
///
/// `ScanError::UnsupportedCamera` when the model, pixel format and video mode
/// combination has no readout entry.
pub fn frame_time(
    model: &str,
    pixel_format: &str,
    video_mode: &str,
    exposure: f64,
) -> ScanResult<f64> {
    let readout = CameraModel::from_model_name(model)
        .and_then(|m| m.readout_ms(pixel_format, video_mode).map(|r| (m, r / 1000.0)));
    let Some((camera, readout)) = readout else {
        error!(
            %model,
            %pixel_format,
            %video_mode,
            "unsupported combination of camera model, pixel format and video mode"
        );
        return Err(ScanError::UnsupportedCamera {
            model: model.to_string(),
            pixel_format: pixel_format.to_string(),
            video_mode: video_mode.to_string(),
        });
    };
    let frame = exposure * camera.readout_margin();
    Ok(if frame < readout {
        readout + READOUT_FLOOR_MARGIN
    } else {
        frame
    })
}

/// Drives the areaDetector camera through the device registry.
pub struct CameraControl {
    registry: Arc<DeviceRegistry>,
    timing: TimingConfig,
    control: ScanControl,
    transition: Mutex<()>,
}

impl CameraControl {
    /// Camera controller sharing the scan's running flag.
    pub fn new(registry: Arc<DeviceRegistry>, timing: TimingConfig, control: ScanControl) -> Self {
        Self {
            registry,
            timing,
            control,
            transition: Mutex::new(()),
        }
    }

    async fn wait_for(&self, key: &str, target: f64) -> ScanResult<()> {
        wait_pv(
            &self.registry,
            key,
            target,
            Some(self.timing.trigger_mode_timeout()),
            self.timing.pv_poll(),
            &self.control,
        )
        .await
    }

    /// The connected camera model.
    pub async fn model(&self) -> ScanResult<CameraModel> {
        let name = self.registry.get_string("CamModel").await?;
        match CameraModel::from_model_name(&name) {
            Some(model) => Ok(model),
            None => {
                error!(model = %name, "camera is not supported");
                Err(ScanError::UnsupportedCamera {
                    model: name,
                    pixel_format: self
                        .registry
                        .get_string("CamPixelFormat")
                        .await
                        .unwrap_or_default(),
                    video_mode: String::new(),
                })
            }
        }
    }

    /// Stop acquiring and wait for the driver to go idle.
    pub async fn stop_acquisition(&self) -> ScanResult<()> {
        self.registry.put("CamAcquire", "Done").await?;
        self.wait_for("CamAcquireBusy", 0.0).await
    }

    /// Start acquiring and give the driver time to raise its busy flag.
    pub async fn start_acquisition(&self) -> ScanResult<()> {
        self.registry.put("CamAcquire", "Acquire").await?;
        sleep(self.timing.camera_settle()).await;
        Ok(())
    }

    /// Fire one software trigger.
    pub async fn software_trigger(&self) -> ScanResult<()> {
        self.registry.put("CamTriggerSoftware", 1i64).await
    }

    /// Write the exposure time and wait for the driver to accept it.
    pub async fn set_exposure(&self, seconds: f64) -> ScanResult<()> {
        self.registry
            .put_and_wait("CamAcquireTime", seconds, self.timing.trigger_mode_timeout())
            .await
    }

    /// Seconds between triggers for the exposure the camera actually uses.
    pub async fn compute_frame_time(&self) -> ScanResult<f64> {
        let model = self.registry.get_string("CamModel").await?;
        let pixel_format = self.registry.get_string("CamPixelFormat").await?;
        let video_mode = match CameraModel::from_model_name(&model) {
            Some(camera) if camera.uses_video_mode() => {
                self.registry.get_string("CamVideoMode").await?
            }
            _ => String::new(),
        };
        let exposure = self.registry.get_float("CamAcquireTimeRBV").await?;
        let frame = frame_time(&model, &pixel_format, &video_mode, exposure)?;
        debug!(exposure, frame_time = frame, "frame time");
        Ok(frame)
    }

    /// Switch the camera to `mode`, configured for `num_images` frames.
    ///
    /// `num_images` is ignored for [`TriggerMode::FreeRun`], which also starts
    /// acquisition so the operator sees live images.
    pub async fn set_trigger_mode(&self, mode: TriggerMode, num_images: u32) -> ScanResult<()> {
        let _guard = self.transition.lock().await;
        let model = self.model().await?;
        self.stop_acquisition().await?;
        info!(%mode, num_images, camera = model.model_name(), "set trigger mode");

        let sequence = model.external_sequence();
        let exposure_mode = sequence == ExternalSequence::ExposureMode;
        match mode {
            TriggerMode::FreeRun => {
                self.registry
                    .put_and_wait("CamImageMode", "Continuous", self.timing.trigger_mode_timeout())
                    .await?;
                self.select_untriggered(exposure_mode).await?;
                self.registry.put("CamAcquire", "Acquire").await?;
            }
            TriggerMode::Internal => {
                self.select_untriggered(exposure_mode).await?;
                self.registry.put("CamImageMode", "Multiple").await?;
                self.put_num_images(num_images).await?;
            }
            TriggerMode::ExternalPso => match sequence {
                ExternalSequence::OffFirst { line } => {
                    self.hardware_trigger("Off", line, num_images).await?;
                }
                ExternalSequence::OnFirst { line } => {
                    self.hardware_trigger("On", line, num_images).await?;
                }
                ExternalSequence::ExposureMode => {
                    self.registry
                        .put_and_wait(
                            "CamExposureMode",
                            "TimedTriggerCont",
                            self.timing.trigger_mode_timeout(),
                        )
                        .await?;
                    self.wait_for("CamExposureMode", 3.0).await?;
                    self.registry.put("CamImageMode", "Multiple").await?;
                    self.put_num_images(num_images).await?;
                }
            },
            TriggerMode::Software => {
                if !model.supports_software_trigger() {
                    return Err(ScanError::UnsupportedCamera {
                        model: model.model_name().to_string(),
                        pixel_format: "software trigger".to_string(),
                        video_mode: String::new(),
                    });
                }
                self.hardware_trigger("Off", "Software", num_images).await?;
            }
        }
        Ok(())
    }

    async fn select_untriggered(&self, exposure_mode: bool) -> ScanResult<()> {
        let timeout = self.timing.trigger_mode_timeout();
        if exposure_mode {
            self.registry
                .put_and_wait("CamExposureMode", "Timed", timeout)
                .await?;
            self.wait_for("CamExposureMode", 0.0).await
        } else {
            self.registry
                .put_and_wait("CamTriggerMode", "Off", timeout)
                .await?;
            self.wait_for("CamTriggerMode", 0.0).await
        }
    }

    async fn put_num_images(&self, num_images: u32) -> ScanResult<()> {
        self.registry
            .put_and_wait("CamNumImages", num_images, self.timing.trigger_mode_timeout())
            .await
    }

    async fn hardware_trigger(&self, first: &str, source: &str, num_images: u32) -> ScanResult<()> {
        let timeout = self.timing.trigger_mode_timeout();
        self.registry
            .put_and_wait("CamTriggerMode", first, timeout)
            .await?;
        self.registry
            .put_and_wait("CamTriggerSource", source, timeout)
            .await?;
        self.registry
            .put_and_wait("CamTriggerOverlap", "ReadOut", timeout)
            .await?;
        self.registry
            .put_and_wait("CamExposureMode", "Timed", timeout)
            .await?;
        self.registry.put("CamImageMode", "Multiple").await?;
        self.registry.put("CamArrayCallbacks", "Enable").await?;
        self.registry.put("CamFrameRateEnable", 0i64).await?;
        self.put_num_images(num_images).await?;
        self.registry
            .put_and_wait("CamTriggerMode", "On", timeout)
            .await?;
        self.wait_for("CamTriggerMode", 1.0).await
    }
}
