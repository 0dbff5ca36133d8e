//! Scan sequencer.
//!
//! Drives one scan through its phases and always finishes it through the same
//! end-of-scan cleanup, whatever ended the scan body.
//!
//! # Phases
//!
//! ```text
//! begin ─> darks (Start) ─> flats (Start) ─> projections ─> flats (End) ─> darks (End)
//!                                                                              │
//!                     end_scan (cleanup, terminal status) <────────────────────┘
//! ```
//!
//! Fly scans program the PSO during `begin` and let the stage run through the
//! window. Step scans stop at every angle and fire a software trigger. Stream
//! scans jog forever and end only by abort.
//!
//! An abort clears the shared running flag; every wait loop notices within one
//! poll interval and the body unwinds with [`ScanError::Aborted`].

use chrono::Utc;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::beamline::Beamline;
use super::filename::{target_file_name, OverwriteConfirm};
use super::monitor::{wait_pv, CompletionMonitor};
use super::snapshot::{config_path_for, ConfigSnapshot};
use super::status::{CleanupOutcome, CleanupRecord, CleanupStep, ScanOutcome, ScanStatus};
use super::{ScanControl, ScanParameters};
use crate::camera::{CameraControl, TriggerMode};
use crate::config::{ScanKind, TimingConfig};
use crate::error::{ScanError, ScanResult};
use crate::motion::{plan, MotionPlan, MotionRequest};
use crate::pso::{PsoProgrammer, PsoSettings};
use crate::pv::DeviceRegistry;
use crate::stream::{FieldKind, StreamSession};
use crate::theta::{self, ExpectedFrames};

/// What one scan has learned so far. Owned by the scan task.
#[derive(Debug, Default)]
struct ScanContext {
    params: Option<ScanParameters>,
    plan: Option<MotionPlan>,
    settings: Option<PsoSettings>,
    frame_time: f64,
    /// Planned projection angles, for `/exchange/theta`
    theta: Vec<f64>,
    /// The file writer was started
    capturing: bool,
    /// Rotation motor acceleration time and DIR field at planning
    accel_time: f64,
    motor_direction: i64,
}

impl ScanContext {
    fn params(&self) -> ScanResult<&ScanParameters> {
        self.params
            .as_ref()
            .ok_or_else(|| ScanError::Configuration("scan parameters not read".into()))
    }
}

/// Runs fly, step and stream scans against one beamline.
pub struct ScanSequencer {
    registry: Arc<DeviceRegistry>,
    timing: TimingConfig,
    kind: ScanKind,
    control: ScanControl,
    camera: Arc<CameraControl>,
    pso: Arc<PsoProgrammer>,
    beamline: Beamline,
    monitor: CompletionMonitor,
    stream: Arc<StreamSession>,
    status_tx: watch::Sender<ScanStatus>,
}

impl ScanSequencer {
    /// Sequencer for `kind` scans.
    pub fn new(registry: Arc<DeviceRegistry>, timing: TimingConfig, kind: ScanKind) -> Self {
        let control = ScanControl::new();
        let camera = Arc::new(CameraControl::new(
            registry.clone(),
            timing.clone(),
            control.clone(),
        ));
        let pso = Arc::new(PsoProgrammer::new(
            registry.clone(),
            timing.pso_command_timeout(),
        ));
        let stream = Arc::new(StreamSession::new(
            registry.clone(),
            camera.clone(),
            pso.clone(),
            timing.clone(),
            control.clone(),
        ));
        let (status_tx, _) = watch::channel(ScanStatus::Idle);
        Self {
            beamline: Beamline::new(registry.clone(), timing.clone(), control.clone()),
            monitor: CompletionMonitor::new(registry.clone(), control.clone(), timing.monitor_poll()),
            registry,
            timing,
            kind,
            control,
            camera,
            pso,
            stream,
            status_tx,
        }
    }

    /// The shared running flag.
    pub fn control(&self) -> &ScanControl {
        &self.control
    }

    /// Shutter, sample and exposure helpers.
    pub fn beamline(&self) -> &Beamline {
        &self.beamline
    }

    /// Streaming session of stream scans.
    pub fn stream(&self) -> &Arc<StreamSession> {
        &self.stream
    }

    /// The device registry.
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Which strategy [`run_scan`](Self::run_scan) uses.
    pub fn kind(&self) -> ScanKind {
        self.kind
    }

    /// Watch the scan state.
    pub fn subscribe_status(&self) -> watch::Receiver<ScanStatus> {
        self.status_tx.subscribe()
    }

    /// Current scan state.
    pub fn status(&self) -> ScanStatus {
        *self.status_tx.borrow()
    }

    async fn set_status(&self, status: ScanStatus) -> ScanResult<()> {
        info!(%status, "scan status");
        self.status_tx.send_replace(status);
        self.registry.put("ScanStatus", status.to_string()).await
    }

    // =========================================================================
    // Scan
    // =========================================================================

    /// Run one complete scan.
    ///
    /// # Errors
    ///
    /// Only refusals to start are errors: `Disconnected` when a PV is not
    /// connected and `Busy` when a scan is already running. Everything that
    /// ends a started scan is reported in the [`ScanOutcome`].
    pub async fn run_scan(&self, confirm: Arc<dyn OverwriteConfirm>) -> ScanResult<ScanOutcome> {
        self.registry
            .require_connected(self.timing.connect_timeout())
            .await?;
        self.control.try_begin()?;
        let scan_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("scan", %scan_id, kind = ?self.kind);
        async move {
            info!("scan started");
            let mut ctx = ScanContext::default();
            let error = self.scan_body(&mut ctx, confirm.as_ref()).await.err();
            match &error {
                None => info!("scan body complete"),
                Some(e) if e.is_abort() => warn!("scan aborted"),
                Some(e) => error!(error = %e, "scan failed"),
            }
            let status = ScanStatus::terminal_for(error.as_ref());
            let cleanup = self.end_scan(&ctx, error.as_ref(), status).await;
            Ok(ScanOutcome {
                scan_id,
                started_at,
                finished_at: Utc::now(),
                status,
                error,
                cleanup,
            })
        }
        .instrument(span)
        .await
    }

    async fn scan_body(
        &self,
        ctx: &mut ScanContext,
        confirm: &dyn OverwriteConfirm,
    ) -> ScanResult<()> {
        self.begin_scan(ctx, confirm).await?;
        let params = ctx.params()?.clone();
        if params.darks_at_start() {
            self.collect_dark_fields(&params).await?;
        }
        if params.flats_at_start() {
            self.collect_flat_fields(&params).await?;
        }
        match self.kind {
            ScanKind::Fly => self.collect_fly_projections(ctx).await?,
            ScanKind::Step => self.collect_step_projections(ctx).await?,
            ScanKind::Stream => self.collect_stream_projections(ctx).await?,
        }
        if params.flats_at_end() {
            self.collect_flat_fields(&params).await?;
        }
        if params.darks_at_end() {
            self.collect_dark_fields(&params).await?;
        }
        Ok(())
    }

    async fn begin_scan(
        &self,
        ctx: &mut ScanContext,
        confirm: &dyn OverwriteConfirm,
    ) -> ScanResult<()> {
        self.set_status(ScanStatus::BeginningScan).await?;
        self.camera.stop_acquisition().await?;
        let exposure = self.registry.get_float("ExposureTime").await?;
        self.beamline.apply_exposure_time(exposure).await?;
        self.beamline.copy_file_path().await?;
        let name = self.registry.get_string("FileName").await?;
        self.registry
            .put_and_wait("FPFileName", name, self.timing.trigger_mode_timeout())
            .await?;

        let mut params = ScanParameters::read(&self.registry).await?;
        info!(
            angles = params.num_angles,
            start = params.rotation_start,
            step = params.rotation_step,
            exposure = params.exposure_time,
            total_images = params.total_images(),
            "scan parameters"
        );
        self.check_overwrite(&params, confirm).await?;
        self.control.ensure_running()?;

        match self.kind {
            ScanKind::Fly => {
                self.plan_and_program(ctx, &mut params).await?;
                ctx.params = Some(params);
                self.start_file_capture(ctx).await?;
            }
            ScanKind::Step => {
                let max_speed = self.registry.get_float("RotationMaxSpeed").await?;
                self.registry.put("RotationSpeed", max_speed).await?;
                ctx.theta = (0..params.num_angles)
                    .map(|k| params.rotation_start + f64::from(k) * params.rotation_step)
                    .collect();
                ctx.params = Some(params);
                self.start_file_capture(ctx).await?;
            }
            ScanKind::Stream => {
                self.plan_and_program(ctx, &mut params).await?;
                self.stream.begin_stream(&mut params).await?;
                ctx.params = Some(params);
            }
        }
        Ok(())
    }

    async fn check_overwrite(
        &self,
        params: &ScanParameters,
        confirm: &dyn OverwriteConfirm,
    ) -> ScanResult<()> {
        if !params.overwrite_warning {
            return Ok(());
        }
        let target = PathBuf::from(target_file_name(
            &params.file_template,
            &params.file_path_rbv,
            &params.file_name_rbv,
            params.file_number,
        )?);
        if !target.exists() {
            return Ok(());
        }
        warn!(path = %target.display(), "data file exists");
        self.registry
            .put("ScanStatus", "Waiting for overwrite confirmation")
            .await?;
        if confirm.confirm(&target).await {
            self.registry
                .put("ScanStatus", ScanStatus::BeginningScan.to_string())
                .await?;
            Ok(())
        } else {
            Err(ScanError::FileOverwrite(target))
        }
    }

    /// Plan the rotation, write the corrected values back and arm the PSO
    /// with the stage at the first angle.
    async fn plan_and_program(
        &self,
        ctx: &mut ScanContext,
        params: &mut ScanParameters,
    ) -> ScanResult<()> {
        let frame_time = self.camera.compute_frame_time().await?;
        let settings = self.pso.settings().await?;
        let counts_per_rotation = self.pso.counts_per_rotation(&settings).await?;
        let accel_time = self.registry.get_float("RotationAccelTime").await?;
        let motor_direction = self.registry.get_int("RotationDirection").await?;
        let plan = plan(&MotionRequest {
            rotation_start: params.rotation_start,
            rotation_step: params.rotation_step,
            num_angles: params.num_angles,
            frame_time,
            counts_per_rotation,
            accel_time,
            motor_direction,
        })?;
        if plan.was_quantized() {
            warn!(
                requested = params.rotation_step,
                quantized = plan.rotation_step,
                "rotation step changed to a whole number of encoder counts"
            );
        }
        params.rotation_step = plan.rotation_step;
        params.rotation_stop = plan.nominal_stop();
        self.registry
            .put("PSOEncoderCountsPerStep", plan.encoder_counts_per_step)
            .await?;
        self.registry.put("RotationStep", plan.rotation_step).await?;
        self.registry.put("PSOStartTaxi", plan.taxi_start).await?;
        self.registry.put("PSOEndTaxi", plan.taxi_end).await?;

        // arm only with the stage at the first angle
        let move_timeout = self.timing.sample_move_timeout();
        let max_speed = self.registry.get_float("RotationMaxSpeed").await?;
        self.registry.put("RotationSpeed", max_speed).await?;
        self.registry
            .put_and_wait("Rotation", plan.rotation_start, move_timeout)
            .await?;
        self.registry.put("RotationSpeed", plan.motor_speed).await?;
        self.pso.program(&settings, &plan).await?;

        ctx.frame_time = frame_time;
        ctx.accel_time = accel_time;
        ctx.motor_direction = motor_direction;
        ctx.theta = plan.theta();
        ctx.settings = Some(settings);
        ctx.plan = Some(plan);
        Ok(())
    }

    async fn start_file_capture(&self, ctx: &mut ScanContext) -> ScanResult<()> {
        let total = ctx.params()?.total_images();
        let timeout = self.timing.trigger_mode_timeout();
        self.registry.put_and_wait("FPNumCapture", total, timeout).await?;
        info!(frames = total, "start file capture");
        self.registry.put("FPCapture", "Capture").await?;
        ctx.capturing = true;
        wait_pv(
            &self.registry,
            "FPCaptureRBV",
            1.0,
            Some(self.timing.file_capture_timeout()),
            self.timing.pv_poll(),
            &self.control,
        )
        .await
    }

    // =========================================================================
    // Phases
    // =========================================================================

    async fn collect_dark_fields(&self, params: &ScanParameters) -> ScanResult<()> {
        self.control.ensure_running()?;
        self.set_status(ScanStatus::CollectingDark).await?;
        self.beamline.apply_exposure_time(params.exposure_time).await?;
        self.beamline.close_shutter().await?;
        self.set_frame_location(&params.dark_location, "DarkField").await?;
        self.collect_static_frames(params.num_dark_fields).await
    }

    async fn collect_flat_fields(&self, params: &ScanParameters) -> ScanResult<()> {
        self.control.ensure_running()?;
        self.set_status(ScanStatus::CollectingFlat).await?;
        if params.flat_exposure_time != params.exposure_time {
            info!(seconds = params.flat_exposure_time, "flat exposure time");
        }
        self.beamline
            .apply_exposure_time(params.flat_exposure_time)
            .await?;
        self.beamline.open_shutter().await?;
        self.beamline.move_sample_out().await?;
        self.set_frame_location(&params.flat_location, "FlatField").await?;
        self.collect_static_frames(params.num_flat_fields).await
    }

    async fn set_frame_location(&self, location: &str, frame_type: &str) -> ScanResult<()> {
        self.registry.put("HDF5Location", location).await?;
        self.registry.put("FrameType", frame_type).await
    }

    /// Internal trigger with exactly `num_frames` frames.
    async fn collect_static_frames(&self, num_frames: u32) -> ScanResult<()> {
        self.camera
            .set_trigger_mode(TriggerMode::Internal, num_frames)
            .await?;
        let frame_time = self.camera.compute_frame_time().await?;
        self.camera.start_acquisition().await?;
        let timeout = Duration::from_secs_f64(frame_time * f64::from(num_frames))
            + self.timing.static_frame_margin();
        self.monitor.wait_done(Some(timeout)).await
    }

    async fn prepare_projections(&self, params: &ScanParameters) -> ScanResult<()> {
        self.control.ensure_running()?;
        self.set_status(ScanStatus::CollectingProjections).await?;
        self.beamline.apply_exposure_time(params.exposure_time).await?;
        self.beamline.open_shutter().await?;
        self.beamline.move_sample_in().await?;
        self.set_frame_location(&params.projection_location, "Projection")
            .await
    }

    async fn collect_fly_projections(&self, ctx: &ScanContext) -> ScanResult<()> {
        let params = ctx.params()?;
        self.prepare_projections(params).await?;
        let plan = ctx
            .plan
            .as_ref()
            .ok_or_else(|| ScanError::Configuration("no motion plan".into()))?;
        let move_timeout = self.timing.sample_move_timeout();
        self.registry
            .put_and_wait("Rotation", plan.taxi_start, move_timeout)
            .await?;
        self.camera
            .set_trigger_mode(TriggerMode::ExternalPso, params.num_angles)
            .await?;
        self.camera.start_acquisition().await?;
        info!(to = plan.taxi_end, speed = plan.motor_speed, "start rotation");
        self.registry.put("Rotation", plan.taxi_end).await?;
        let timeout = Duration::from_secs_f64(ctx.frame_time * f64::from(params.num_angles))
            + self.timing.projection_margin();
        self.monitor.wait_done(Some(timeout)).await
    }

    async fn collect_step_projections(&self, ctx: &ScanContext) -> ScanResult<()> {
        let params = ctx.params()?;
        self.prepare_projections(params).await?;
        self.camera
            .set_trigger_mode(TriggerMode::Software, params.num_angles)
            .await?;
        self.camera.start_acquisition().await?;
        let started = Instant::now();
        let move_timeout = self.timing.sample_move_timeout();
        for (k, angle) in ctx.theta.iter().enumerate() {
            self.control.ensure_running()?;
            self.registry
                .put_and_wait("Rotation", *angle, move_timeout)
                .await?;
            self.camera.software_trigger().await?;
            wait_pv(
                &self.registry,
                "CamNumImagesCounter",
                (k + 1) as f64,
                Some(self.timing.step_trigger_timeout()),
                self.timing.pv_poll(),
                &self.control,
            )
            .await?;
            self.monitor.update_status(started).await?;
        }
        Ok(())
    }

    async fn collect_stream_projections(&self, ctx: &ScanContext) -> ScanResult<()> {
        let params = ctx.params()?;
        self.prepare_projections(params).await?;
        let (Some(plan), Some(settings)) = (&ctx.plan, &ctx.settings) else {
            return Err(ScanError::Configuration("no motion plan".into()));
        };
        self.stream
            .start_rotation(
                plan,
                settings.clone(),
                params.exposure_time,
                ctx.accel_time,
                ctx.motor_direction,
            )
            .await?;
        // runs until aborted; a retake stops the camera for a while
        loop {
            self.monitor.wait_done(None).await?;
            if !self.stream.is_retaking() {
                return Ok(());
            }
            while self.stream.is_retaking() {
                self.control.ensure_running()?;
                sleep(self.timing.monitor_poll()).await;
            }
        }
    }

    /// Retake dark fields during a stream scan.
    ///
    /// Returns `false` when the request was ignored.
    pub async fn retake_dark_fields(&self) -> ScanResult<bool> {
        self.stream
            .retake(FieldKind::Dark, |params| async move {
                self.collect_dark_fields(&params).await?;
                self.beamline.open_shutter().await?;
                self.back_to_projections(&params).await
            })
            .await
    }

    /// Retake flat fields during a stream scan.
    ///
    /// Returns `false` when the request was ignored.
    pub async fn retake_flat_fields(&self) -> ScanResult<bool> {
        self.stream
            .retake(FieldKind::Flat, |params| async move {
                self.collect_flat_fields(&params).await?;
                self.beamline.move_sample_in().await?;
                self.back_to_projections(&params).await
            })
            .await
    }

    async fn back_to_projections(&self, params: &ScanParameters) -> ScanResult<()> {
        self.set_status(ScanStatus::CollectingProjections).await?;
        self.set_frame_location(&params.projection_location, "Projection")
            .await
    }

    // =========================================================================
    // End of scan
    // =========================================================================

    /// Every cleanup step runs once, in order, whatever the previous ones did.
    async fn end_scan(
        &self,
        ctx: &ScanContext,
        error: Option<&ScanError>,
        status: ScanStatus,
    ) -> Vec<CleanupRecord> {
        let mut records = Vec::new();
        let declined = matches!(error, Some(ScanError::FileOverwrite(_)));

        record(&mut records, CleanupStep::SaveConfiguration, async {
            if declined {
                return Ok(skipped("overwrite declined"));
            }
            self.save_configuration().await
        })
        .await;
        record(&mut records, CleanupStep::EndStream, async {
            if self.kind != ScanKind::Stream {
                return Ok(skipped("not a stream scan"));
            }
            self.stream.end_stream().await.map(|_| CleanupOutcome::Done)
        })
        .await;
        record(&mut records, CleanupStep::FreeRun, async {
            self.camera.set_trigger_mode(TriggerMode::FreeRun, 1).await?;
            Ok(CleanupOutcome::Done)
        })
        .await;
        record(&mut records, CleanupStep::RestoreSpeed, async {
            let max_speed = self.registry.get_float("RotationMaxSpeed").await?;
            self.registry.put("RotationSpeed", max_speed).await?;
            Ok(CleanupOutcome::Done)
        })
        .await;
        record(&mut records, CleanupStep::DisarmPso, async {
            if !self.registry.has("PSOCommand.BOUT") {
                return Ok(skipped("no PSO controller"));
            }
            self.pso.disarm().await.map(|_| CleanupOutcome::Done)
        })
        .await;
        record(&mut records, CleanupStep::SampleIn, async {
            self.beamline.move_sample_in().await.map(|_| CleanupOutcome::Done)
        })
        .await;
        record(&mut records, CleanupStep::CloseShutter, async {
            self.beamline.close_shutter().await.map(|_| CleanupOutcome::Done)
        })
        .await;
        record(&mut records, CleanupStep::StopCapture, async {
            self.registry.put("FPCapture", "Done").await?;
            wait_pv(
                &self.registry,
                "FPCaptureRBV",
                0.0,
                Some(self.timing.file_capture_timeout()),
                self.timing.pv_poll(),
                &self.control,
            )
            .await?;
            Ok(CleanupOutcome::Done)
        })
        .await;
        record(&mut records, CleanupStep::ReturnRotation, async {
            match &ctx.params {
                Some(params) if params.return_rotation => {
                    info!(to = params.rotation_start, "return rotation");
                    self.registry.put("Rotation", params.rotation_start).await?;
                    Ok(CleanupOutcome::Done)
                }
                _ => Ok(skipped("return rotation disabled")),
            }
        })
        .await;
        record(&mut records, CleanupStep::AddTheta, async {
            self.add_theta(ctx).await
        })
        .await;
        record(&mut records, CleanupStep::Status, async {
            let text = match (status, error) {
                (ScanStatus::Failed, Some(e)) => e.status_message().to_string(),
                _ => status.to_string(),
            };
            self.status_tx.send_replace(status);
            let put_status = self.registry.put("ScanStatus", text).await;
            let put_start = self.registry.put("StartScan", "Done").await;
            self.control.finish();
            put_status.and(put_start).map(|_| CleanupOutcome::Done)
        })
        .await;
        info!(%status, steps = records.len(), "end of scan");
        records
    }

    async fn save_configuration(&self) -> ScanResult<CleanupOutcome> {
        let data_file = self.registry.get_string("FPFullFileName").await?;
        if data_file.trim().is_empty() {
            return Ok(skipped("no data file"));
        }
        let snapshot = ConfigSnapshot::capture(&self.registry).await?;
        snapshot.save(&config_path_for(data_file.trim()))?;
        Ok(CleanupOutcome::Done)
    }

    async fn add_theta(&self, ctx: &ScanContext) -> ScanResult<CleanupOutcome> {
        if self.kind == ScanKind::Stream {
            return Ok(skipped("stream captures write their own angles"));
        }
        let Some(params) = ctx.params.as_ref().filter(|_| ctx.capturing) else {
            return Ok(skipped("no data file"));
        };
        let expected = ExpectedFrames {
            projection_location: params.projection_location.clone(),
            flat_location: params.flat_location.clone(),
            dark_location: params.dark_location.clone(),
            flats: (params.num_flat_fields * params.flat_field_mode.collections()) as usize,
            darks: (params.num_dark_fields * params.dark_field_mode.collections()) as usize,
        };
        let data_file = self.registry.get_string("FPFullFileName").await?;
        match theta::add_theta(Path::new(data_file.trim()), &ctx.theta, &expected) {
            Ok(result) if result.is_complete() => Ok(CleanupOutcome::Done),
            Ok(result) => {
                warn!(
                    missing = result.missing_indices.len(),
                    flat_shortfall = result.flat_shortfall,
                    dark_shortfall = result.dark_shortfall,
                    "data file incomplete"
                );
                Ok(CleanupOutcome::Done)
            }
            Err(ScanError::FeatureNotEnabled(feature)) => {
                Ok(skipped(&format!("built without {feature}")))
            }
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Operator actions
    // =========================================================================

    /// Stop the running scan.
    ///
    /// Clears the running flag, stops the rotation and the file writer. The
    /// scan task does its own cleanup; nothing here waits for it.
    pub async fn abort(&self) -> ScanResult<()> {
        warn!("abort requested");
        self.control.request_abort();
        let stop = self.registry.put("RotationStop", 1i64).await;
        let capture = self.registry.put("FPCapture", "Done").await;
        stop.and(capture)
    }

    /// Put every value of a saved `.config` file back to its PV.
    pub async fn load_configuration(&self, path: &Path) -> ScanResult<usize> {
        ConfigSnapshot::load(path)?.apply(&self.registry).await
    }
}

fn skipped(reason: &str) -> CleanupOutcome {
    CleanupOutcome::Skipped(reason.to_string())
}

async fn record<F>(records: &mut Vec<CleanupRecord>, step: CleanupStep, work: F)
where
    F: Future<Output = ScanResult<CleanupOutcome>>,
{
    let outcome = match work.await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(?step, error = %e, "cleanup step failed");
            CleanupOutcome::Failed(e.to_string())
        }
    };
    records.push(CleanupRecord { step, outcome });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pv::sim::{SimBeamline, ROTATION_MOTOR};
    use crate::scan::filename::{AlwaysOverwrite, NeverOverwrite};
    use tempfile::tempdir;
    use tracing_test::traced_test;

    async fn sequencer(sim: &SimBeamline, kind: ScanKind, dir: &Path) -> ScanSequencer {
        let registry = sim.registry(Duration::from_millis(10)).await.unwrap();
        registry
            .put("FilePath", format!("{}/", dir.display()))
            .await
            .unwrap();
        ScanSequencer::new(registry, TimingConfig::default(), kind)
    }

    #[tokio::test(start_paused = true)]
    async fn fly_scan_completes() {
        let sim = SimBeamline::new();
        let dir = tempdir().unwrap();
        let seq = sequencer(&sim, ScanKind::Fly, dir.path()).await;
        let outcome = seq.run_scan(Arc::new(AlwaysOverwrite)).await.unwrap();
        assert!(outcome.is_complete(), "{:?}", outcome.error);
        assert_eq!(seq.status(), ScanStatus::ScanComplete);
        assert!(!seq.control().in_scan());
        assert_eq!(
            seq.registry().get_string("ScanStatus").await.unwrap(),
            "Scan complete"
        );
        // 5 darks, 5 flats before and after, 180 projections
        assert_eq!(seq.registry().get_int("FPNumCaptured").await.unwrap(), 195);
        assert_eq!(outcome.cleanup_count(CleanupStep::Status), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn configuration_is_saved_beside_the_data_file() {
        let sim = SimBeamline::new();
        let dir = tempdir().unwrap();
        let seq = sequencer(&sim, ScanKind::Fly, dir.path()).await;
        let outcome = seq.run_scan(Arc::new(AlwaysOverwrite)).await.unwrap();
        assert_eq!(
            outcome.cleanup_outcome(CleanupStep::SaveConfiguration),
            Some(&CleanupOutcome::Done)
        );
        let saved = ConfigSnapshot::load(&dir.path().join("scan_001.config")).unwrap();
        assert_eq!(saved.get("NumAngles"), Some("180"));
    }

    #[tokio::test(start_paused = true)]
    async fn declined_overwrite_stops_before_motion() {
        let sim = SimBeamline::new();
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("scan_001.h5"), b"").unwrap();
        let seq = sequencer(&sim, ScanKind::Fly, dir.path()).await;
        seq.registry().put("OverwriteWarning", "Yes").await.unwrap();

        let mark = sim.ioc.mark();
        let outcome = seq.run_scan(Arc::new(NeverOverwrite)).await.unwrap();
        assert_eq!(outcome.status, ScanStatus::Failed);
        assert!(matches!(outcome.error, Some(ScanError::FileOverwrite(_))));
        let rotation_moves = sim
            .ioc
            .puts_since(mark)
            .into_iter()
            .filter(|p| p.pv == ROTATION_MOTOR)
            .count();
        assert_eq!(rotation_moves, 0);
        assert!(matches!(
            outcome.cleanup_outcome(CleanupStep::SaveConfiguration),
            Some(CleanupOutcome::Skipped(_))
        ));
        assert_eq!(
            seq.registry().get_string("ScanStatus").await.unwrap(),
            "File overwrite aborted"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn second_scan_is_refused_while_running() {
        let sim = SimBeamline::new();
        let dir = tempdir().unwrap();
        let seq = sequencer(&sim, ScanKind::Fly, dir.path()).await;
        seq.control().try_begin().unwrap();
        let refused = seq.run_scan(Arc::new(AlwaysOverwrite)).await;
        assert!(matches!(refused, Err(ScanError::Busy)));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn quantized_step_is_written_back() {
        let sim = SimBeamline::new();
        let dir = tempdir().unwrap();
        let seq = sequencer(&sim, ScanKind::Fly, dir.path()).await;
        seq.registry().put("RotationStep", 0.12345).await.unwrap();
        seq.registry().put("NumAngles", 10i64).await.unwrap();
        let outcome = seq.run_scan(Arc::new(AlwaysOverwrite)).await.unwrap();
        assert!(outcome.is_complete(), "{:?}", outcome.error);
        assert_eq!(
            seq.registry().get_int("PSOEncoderCountsPerStep").await.unwrap(),
            123
        );
        assert_eq!(seq.registry().get_float("RotationStep").await.unwrap(), 0.123);
        assert!(logs_contain("whole number of encoder counts"));
    }

    #[tokio::test(start_paused = true)]
    async fn configuration_loads_back() {
        let sim = SimBeamline::new();
        let dir = tempdir().unwrap();
        let seq = sequencer(&sim, ScanKind::Fly, dir.path()).await;
        let snapshot = ConfigSnapshot::capture(seq.registry()).await.unwrap();
        let path = dir.path().join("saved.config");
        snapshot.save(&path).unwrap();
        seq.registry().put("NumAngles", 3i64).await.unwrap();
        let written = seq.load_configuration(&path).await.unwrap();
        assert_eq!(written, seq.registry().config_keys().len());
        assert_eq!(seq.registry().get_int("NumAngles").await.unwrap(), 180);
    }
}
