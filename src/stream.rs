//! Streaming session.
//!
//! In a stream scan the stage jogs forever and the camera runs on PSO
//! triggers. The operator can capture a block of frames to file at any time
//! (`StreamCapture`) or change the exposure or angular step on the fly
//! (`StreamSync`). A change re-synchronizes the PSO to the running stage and
//! re-anchors the angle array on the encoder position the controller latched
//! with the first frame after re-arming.
//!
//! The angle array is published on a broadcast channel at the start of the
//! rotation and after every resync, for consumers that reconstruct while the
//! scan runs.
//!
//! Streams take no dark or flat fields at start or end. The operator retakes
//! them on demand (`StreamRetakeDark`, `StreamRetakeFlat`) into fixed files in
//! the data directory, and each capture file gets a copy of both.
//!
//! # Gating
//!
//! Captures, resyncs and retakes exclude each other. Any of them arriving
//! while another runs, or while `StreamMessage` is not `Done`, is ignored.

use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};

use crate::camera::{CameraControl, TriggerMode};
use crate::config::timing::{STREAM_FIRST_FRAME_SETTLE, STREAM_FRAME_SETTLE};
use crate::config::TimingConfig;
use crate::error::{ScanError, ScanResult};
use crate::exchange::{self, DARK_FIELDS_FILE, FLAT_FIELDS_FILE};
use crate::motion::{plan, quantize_step, MotionPlan, MotionRequest};
use crate::pso::{PsoProgrammer, PsoSettings, PsoWindow};
use crate::pv::DeviceRegistry;
use crate::scan::monitor::wait_pv;
use crate::scan::{FieldMode, ScanControl, ScanParameters};
use crate::theta;

/// Frames requested from the camera for an endless rotation.
pub const STREAM_FRAME_BUDGET: u32 = 65_535_000;
/// Angle arrays buffered for slow subscribers.
const THETA_CHANNEL_CAPACITY: usize = 16;
/// `StreamMessage` value of an idle stream.
const IDLE: &str = "Done";
/// Extra time allowed for the jog to reach a new speed.
const JOG_SETTLE: Duration = Duration::from_secs(1);

/// Seconds as a `Duration`, rejecting negative and non-finite values.
fn seconds(value: f64) -> ScanResult<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| ScanError::Configuration(format!("invalid duration of {value} s")))
}

/// Static field type retaken during a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Dark,
    Flat,
}

impl FieldKind {
    /// Request PV, reset to `Done` when the retake ends.
    pub fn request_key(self) -> &'static str {
        match self {
            FieldKind::Dark => "StreamRetakeDark",
            FieldKind::Flat => "StreamRetakeFlat",
        }
    }

    /// File in the data directory the fields are written to.
    pub fn file_name(self) -> &'static str {
        match self {
            FieldKind::Dark => DARK_FIELDS_FILE,
            FieldKind::Flat => FLAT_FIELDS_FILE,
        }
    }

    fn message(self) -> &'static str {
        match self {
            FieldKind::Dark => "Capturing dark fields",
            FieldKind::Flat => "Capturing flat fields",
        }
    }

    fn num_frames(self, params: &ScanParameters) -> u32 {
        match self {
            FieldKind::Dark => params.num_dark_fields,
            FieldKind::Flat => params.num_flat_fields,
        }
    }
}

/// File plugin naming, saved while a retake writes to a fixed file.
struct FileNaming {
    name: String,
    template: String,
    auto_increment: String,
}

impl FileNaming {
    async fn read(registry: &DeviceRegistry) -> ScanResult<Self> {
        Ok(Self {
            name: registry.get_string("FPFileName").await?,
            template: registry.get_string("FPFileTemplate").await?,
            auto_increment: registry.get_string("FPAutoIncrement").await?,
        })
    }

    async fn apply(&self, registry: &DeviceRegistry, timeout: Duration) -> ScanResult<()> {
        registry
            .put_and_wait("FPFileName", self.name.as_str(), timeout)
            .await?;
        registry
            .put_and_wait("FPFileTemplate", self.template.as_str(), timeout)
            .await?;
        registry
            .put_and_wait("FPAutoIncrement", self.auto_increment.as_str(), timeout)
            .await
    }
}

#[derive(Debug, Default)]
struct StreamState {
    params: Option<ScanParameters>,
    exposure_time: f64,
    plan: Option<MotionPlan>,
    settings: Option<PsoSettings>,
    accel_time: f64,
    motor_direction: i64,
    first_id: i64,
}

/// Continuous-rotation session driven by the stream scan.
pub struct StreamSession {
    registry: Arc<DeviceRegistry>,
    camera: Arc<CameraControl>,
    pso: Arc<PsoProgrammer>,
    timing: TimingConfig,
    control: ScanControl,
    active: AtomicBool,
    retaking: AtomicBool,
    state: Mutex<StreamState>,
    theta_tx: broadcast::Sender<Arc<Vec<f32>>>,
}

impl StreamSession {
    /// Inactive session.
    pub fn new(
        registry: Arc<DeviceRegistry>,
        camera: Arc<CameraControl>,
        pso: Arc<PsoProgrammer>,
        timing: TimingConfig,
        control: ScanControl,
    ) -> Self {
        let (theta_tx, _) = broadcast::channel(THETA_CHANNEL_CAPACITY);
        Self {
            registry,
            camera,
            pso,
            timing,
            control,
            active: AtomicBool::new(false),
            retaking: AtomicBool::new(false),
            state: Mutex::new(StreamState::default()),
            theta_tx,
        }
    }

    /// Receive every published angle array.
    pub fn subscribe_theta(&self) -> broadcast::Receiver<Arc<Vec<f32>>> {
        self.theta_tx.subscribe()
    }

    /// True between [`start_rotation`](Self::start_rotation) and
    /// [`end_stream`](Self::end_stream).
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// True while a retake has the camera out of the stream.
    pub fn is_retaking(&self) -> bool {
        self.retaking.load(Ordering::SeqCst)
    }

    /// Anchor of the current angle array: (first unique ID, first angle, step).
    pub async fn anchor(&self) -> Option<(i64, f64, f64)> {
        let state = self.state.lock().await;
        state
            .plan
            .as_ref()
            .map(|p| (state.first_id, p.rotation_start, p.rotation_step))
    }

    fn publish(&self, plan: &MotionPlan) {
        let theta: Vec<f32> = plan.theta().into_iter().map(|t| t as f32).collect();
        let receivers = self.theta_tx.send(Arc::new(theta)).unwrap_or(0);
        info!(
            start = plan.rotation_start,
            step = plan.rotation_step,
            angles = plan.num_angles,
            receivers,
            "theta broadcast"
        );
    }

    /// Prepare the PVs for streaming.
    ///
    /// Streams take no dark or flat fields at start or end, so both modes are
    /// forced to `None` on the PVs and in `params`. The rest of `params` is
    /// kept for retakes.
    pub async fn begin_stream(&self, params: &mut ScanParameters) -> ScanResult<()> {
        info!("begin stream");
        let timeout = self.timing.trigger_mode_timeout();
        self.registry
            .put_and_wait("FlatFieldMode", "None", timeout)
            .await?;
        self.registry
            .put_and_wait("DarkFieldMode", "None", timeout)
            .await?;
        params.flat_field_mode = FieldMode::None;
        params.dark_field_mode = FieldMode::None;
        for key in [
            "StreamCapture",
            "StreamMessage",
            "StreamSync",
            "StreamRetakeDark",
            "StreamRetakeFlat",
        ] {
            self.registry.put_and_wait(key, IDLE, timeout).await?;
        }
        self.state.lock().await.params = Some(params.clone());
        self.registry.put_and_wait("FirstProjid", 1i64, timeout).await
    }

    /// Taxi to the start, start the camera and jog.
    ///
    /// The PSO must already be armed at `plan.rotation_start`. Unique IDs
    /// count from 1, so frame 1 is the one taken at `plan.rotation_start`.
    pub async fn start_rotation(
        &self,
        plan: &MotionPlan,
        settings: PsoSettings,
        exposure_time: f64,
        accel_time: f64,
        motor_direction: i64,
    ) -> ScanResult<()> {
        let mut state = self.state.lock().await;
        info!(taxi = plan.taxi_start, "taxi before starting the stream");
        self.registry
            .put_and_wait("Rotation", plan.taxi_start, self.timing.sample_move_timeout())
            .await?;
        self.registry.put("RotationSpeedJog", plan.motor_speed).await?;
        self.camera
            .set_trigger_mode(TriggerMode::ExternalPso, STREAM_FRAME_BUDGET)
            .await?;
        self.camera.start_acquisition().await?;

        *state = StreamState {
            params: state.params.take(),
            exposure_time,
            plan: Some(plan.clone()),
            settings: Some(settings),
            accel_time,
            motor_direction,
            first_id: 1,
        };
        self.active.store(true, Ordering::SeqCst);
        self.publish(plan);
        info!(speed = plan.motor_speed, "start jog");
        self.registry.put("RotationJog", 1i64).await
    }

    /// Re-synchronize after an exposure or step change.
    ///
    /// Returns `false` when the request was ignored: the stream is not
    /// running, a capture or another resync is in progress, or neither value
    /// changed. `StreamSync` is reset to `Done` in every case.
    #[instrument(skip(self))]
    pub async fn resync(&self) -> ScanResult<bool> {
        let result = self.resync_inner().await;
        let reset = self.registry.put("StreamSync", IDLE).await;
        let synced = result?;
        reset?;
        Ok(synced)
    }

    async fn resync_inner(&self) -> ScanResult<bool> {
        if !self.is_active() {
            info!("stream not running; sync ignored");
            return Ok(false);
        }
        let Ok(mut state) = self.state.try_lock() else {
            info!("stream busy; sync ignored");
            return Ok(false);
        };
        if self.registry.get_string("StreamMessage").await?.trim() != IDLE {
            info!("capture in progress; sync ignored");
            return Ok(false);
        }
        let (Some(current), Some(settings)) = (state.plan.clone(), state.settings.clone()) else {
            return Ok(false);
        };
        let exposure = self.registry.get_float("ExposureTime").await?;
        let step = self.registry.get_float("RotationStep").await?;
        if exposure == state.exposure_time && step == current.rotation_step {
            info!("exposure and step unchanged; sync ignored");
            return Ok(false);
        }
        if !exposure.is_finite() || exposure <= 0.0 {
            return Err(ScanError::Configuration(format!(
                "exposure time must be positive, got {exposure}"
            )));
        }
        let (counts, _, _) = quantize_step(step, current.counts_per_rotation)?;
        info!(exposure, step, "stream sync");

        self.registry.put("PSOEncoderCountsPerStep", counts).await?;
        self.pso.disarm().await?;
        match self.rearm(&mut state, &current, &settings, exposure, step, false).await {
            Ok(()) => Ok(true),
            Err(e) => {
                error!(error = %e, "resync failed with the PSO disarmed; restoring previous settings");
                self.restore(&state, &current, &settings).await;
                Err(e)
            }
        }
    }

    /// Re-plan from the current stage position and re-arm a disarmed PSO,
    /// then anchor the angles on the first frame. `restart_camera` puts a
    /// stopped camera back on PSO triggers first.
    ///
    /// On error the PSO may be left disarmed.
    async fn rearm(
        &self,
        state: &mut StreamState,
        current: &MotionPlan,
        settings: &PsoSettings,
        exposure: f64,
        step: f64,
        restart_camera: bool,
    ) -> ScanResult<()> {
        // let the frame in flight finish
        sleep(seconds(state.exposure_time)? + STREAM_FRAME_SETTLE).await;
        self.camera.set_exposure(exposure).await?;
        if restart_camera {
            self.camera
                .set_trigger_mode(TriggerMode::ExternalPso, STREAM_FRAME_BUDGET)
                .await?;
            self.camera.start_acquisition().await?;
        }
        // no triggers while disarmed, so the next frame is last_id + 1
        let last_id = self.registry.get_int("CamNumImagesCounter").await?;
        let frame_time = self.camera.compute_frame_time().await?;
        let here = self.registry.get_float("RotationRBV").await?;
        let new_plan = plan(&MotionRequest {
            rotation_start: here,
            rotation_step: step,
            num_angles: current.num_angles,
            frame_time,
            counts_per_rotation: current.counts_per_rotation,
            accel_time: state.accel_time,
            motor_direction: state.motor_direction,
        })?;
        self.registry.put("RotationStep", new_plan.rotation_step).await?;
        self.pso.configure(settings, &new_plan).await?;

        self.registry
            .put("RotationSpeedJog", new_plan.motor_speed)
            .await?;
        self.pso.restart_data_acquisition().await?;
        let jog_accel = self.registry.get_float("RotationAccelJog").await?;
        let speed_change = (new_plan.motor_speed - current.motor_speed).abs();
        let ramp = if jog_accel > 0.0 {
            seconds(speed_change / jog_accel)?
        } else {
            Duration::ZERO
        };
        sleep(ramp + JOG_SETTLE).await;
        self.pso.arm(settings).await?;
        // one frame at the new settings
        sleep(seconds(exposure)? + STREAM_FIRST_FRAME_SETTLE).await;

        let Some(encoder) = self.pso.read_encoder().await? else {
            error!("no encoder position for the first frame; angles not re-anchored");
            return Err(ScanError::Controller(
                "no encoder position after resync".into(),
            ));
        };
        let offset = self.registry.get_float("RotationOFF").await?;
        let resolution = self.registry.get_float("RotationEResolution").await?;
        let anchor = offset + encoder as f64 * resolution;
        let first_id = last_id + 1;
        self.registry.put("FirstProjid", first_id).await?;

        let anchored = plan(&MotionRequest {
            rotation_start: anchor,
            rotation_step: new_plan.rotation_step,
            num_angles: new_plan.num_angles,
            frame_time,
            counts_per_rotation: new_plan.counts_per_rotation,
            accel_time: state.accel_time,
            motor_direction: state.motor_direction,
        })?;
        info!(first_id, anchor, encoder, "angles re-anchored");
        self.publish(&anchored);
        state.exposure_time = exposure;
        state.first_id = first_id;
        state.plan = Some(anchored);
        Ok(())
    }

    /// Put the camera and the PSO back on the plan that was running before a
    /// failed resync. Failures are logged; the stream keeps the old angles.
    async fn restore(&self, state: &StreamState, previous: &MotionPlan, settings: &PsoSettings) {
        let counts = PsoWindow::for_plan(previous).counts_per_step;
        if let Err(e) = self.registry.put("PSOEncoderCountsPerStep", counts).await {
            error!(error = %e, "failed to restore PSOEncoderCountsPerStep");
        }
        if let Err(e) = self.registry.put("RotationStep", previous.rotation_step).await {
            error!(error = %e, "failed to restore RotationStep");
        }
        if let Err(e) = self.camera.set_exposure(state.exposure_time).await {
            error!(error = %e, "failed to restore the exposure time");
        }
        match self.pso.program(settings, previous).await {
            Ok(_) => warn!("PSO re-armed with the previous settings"),
            Err(e) => error!(error = %e, "failed to re-arm the PSO; triggers stay off"),
        }
    }

    /// Retake dark or flat fields while the stage keeps jogging.
    ///
    /// The camera leaves the stream, the file plugin writes
    /// [`FieldKind::file_name`] in the data directory while `collect` takes
    /// the frames, and the camera goes back on PSO triggers with the angles
    /// re-anchored. `collect` gets the parameters read at scan start and must
    /// leave the beamline ready for projections.
    ///
    /// Returns `false` when the request was ignored. The request PV is reset
    /// to `Done` in every case.
    #[instrument(skip(self, collect))]
    pub async fn retake<F, Fut>(&self, kind: FieldKind, collect: F) -> ScanResult<bool>
    where
        F: FnOnce(ScanParameters) -> Fut,
        Fut: Future<Output = ScanResult<()>>,
    {
        let result = self.retake_inner(kind, collect).await;
        let reset = self.registry.put(kind.request_key(), IDLE).await;
        let retaken = result?;
        reset?;
        Ok(retaken)
    }

    async fn retake_inner<F, Fut>(&self, kind: FieldKind, collect: F) -> ScanResult<bool>
    where
        F: FnOnce(ScanParameters) -> Fut,
        Fut: Future<Output = ScanResult<()>>,
    {
        if !self.is_active() {
            info!("stream not running; retake ignored");
            return Ok(false);
        }
        let Ok(mut state) = self.state.try_lock() else {
            info!("stream busy; retake ignored");
            return Ok(false);
        };
        if self.registry.get_string("StreamMessage").await?.trim() != IDLE {
            info!("capture in progress; retake ignored");
            return Ok(false);
        }
        let (Some(params), Some(current), Some(settings)) =
            (state.params.clone(), state.plan.clone(), state.settings.clone())
        else {
            return Ok(false);
        };
        self.registry.put("StreamMessage", kind.message()).await?;
        self.retaking.store(true, Ordering::SeqCst);

        let result = self.collect_to_file(kind, params, collect).await;
        let resumed = if self.control.abort_requested() {
            Ok(())
        } else {
            self.resume(&mut state, &current, &settings).await
        };
        self.retaking.store(false, Ordering::SeqCst);
        let idle = self.registry.put("StreamMessage", IDLE).await;
        result?;
        resumed?;
        idle?;
        info!(file = kind.file_name(), "fields retaken");
        Ok(true)
    }

    async fn collect_to_file<F, Fut>(
        &self,
        kind: FieldKind,
        params: ScanParameters,
        collect: F,
    ) -> ScanResult<()>
    where
        F: FnOnce(ScanParameters) -> Fut,
        Fut: Future<Output = ScanResult<()>>,
    {
        let timeout = self.timing.trigger_mode_timeout();
        let naming = FileNaming::read(&self.registry).await?;
        let frames = kind.num_frames(&params);
        let result = async {
            self.camera.stop_acquisition().await?;
            FileNaming {
                name: kind.file_name().to_string(),
                template: "%s%s".to_string(),
                auto_increment: "No".to_string(),
            }
            .apply(&self.registry, timeout)
            .await?;
            self.registry
                .put_and_wait("FPNumCapture", i64::from(frames), timeout)
                .await?;
            info!(frames, file = kind.file_name(), "retaking fields");
            self.registry.put("FPCapture", "Capture").await?;
            wait_pv(
                &self.registry,
                "FPCaptureRBV",
                1.0,
                Some(self.timing.file_capture_timeout()),
                self.timing.pv_poll(),
                &self.control,
            )
            .await?;
            collect(params).await?;
            wait_pv(
                &self.registry,
                "FPCaptureRBV",
                0.0,
                Some(self.timing.file_capture_timeout()),
                self.timing.monitor_poll(),
                &self.control,
            )
            .await
        }
        .await;
        if result.is_err() {
            if let Err(e) = self.registry.put("FPCapture", "Done").await {
                error!(error = %e, "failed to stop the field capture");
            }
        }
        let restored = naming.apply(&self.registry, timeout).await;
        result?;
        restored
    }

    /// Put the camera back on PSO triggers after a retake.
    async fn resume(
        &self,
        state: &mut StreamState,
        current: &MotionPlan,
        settings: &PsoSettings,
    ) -> ScanResult<()> {
        self.pso.disarm().await?;
        let exposure = state.exposure_time;
        match self
            .rearm(state, current, settings, exposure, current.rotation_step, true)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(error = %e, "stream did not resume after the retake");
                self.restore(state, current, settings).await;
                Err(e)
            }
        }
    }

    /// Capture `StreamNumCapture` frames to a new file and write their angles.
    ///
    /// Returns `false` when the request was ignored.
    #[instrument(skip(self))]
    pub async fn capture_projections(&self) -> ScanResult<bool> {
        if !self.is_active() {
            info!("stream not running; capture ignored");
            return Ok(false);
        }
        let Ok(state) = self.state.try_lock() else {
            info!("stream busy; capture ignored");
            return Ok(false);
        };
        if self.registry.get_string("StreamMessage").await?.trim() != IDLE {
            info!("capture already in progress");
            return Ok(false);
        }
        self.registry
            .put("StreamMessage", "Capturing projections")
            .await?;
        let result = self.capture_file().await;
        if result.is_ok() {
            if let Some(plan) = &state.plan {
                let full = self.registry.get_string("FPFullFileName").await?;
                match theta::dump_stream_theta(
                    Path::new(&full),
                    state.first_id,
                    plan.rotation_start,
                    plan.rotation_step,
                ) {
                    Ok(_) => {}
                    Err(ScanError::FeatureNotEnabled(feature)) => {
                        warn!(%feature, "theta not written to the capture file");
                    }
                    Err(e) => error!(error = %e, file = %full, "failed to write theta"),
                }
                if let Some(params) = &state.params {
                    let sources = exchange::field_sources(
                        Path::new(&full),
                        &params.dark_location,
                        &params.flat_location,
                    );
                    match exchange::copy_fields(Path::new(&full), &sources) {
                        Ok(_) => {}
                        Err(ScanError::FeatureNotEnabled(feature)) => {
                            warn!(%feature, "static fields not copied to the capture file");
                        }
                        Err(e) => error!(error = %e, file = %full, "failed to copy static fields"),
                    }
                }
                let name = Path::new(&full)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                self.registry.put("StreamFileName", name).await?;
            }
            let total = self.registry.get_int("StreamNumTotalCaptured").await?
                + self.registry.get_int("FPNumCaptured").await?;
            self.registry.put("StreamNumTotalCaptured", total).await?;
        }
        self.registry.put("StreamCapture", IDLE).await?;
        self.registry.put("StreamMessage", IDLE).await?;
        result.map(|_| true)
    }

    async fn capture_file(&self) -> ScanResult<()> {
        let timeout = self.timing.trigger_mode_timeout();
        let name = self.registry.get_string("FileName").await?;
        self.registry.put_and_wait("FPFileName", name, timeout).await?;
        let frames = self.registry.get_int("StreamNumCapture").await?;
        self.registry
            .put_and_wait("FPNumCapture", frames, timeout)
            .await?;
        info!(frames, "capturing projections");
        self.registry.put("FPCapture", "Capture").await?;
        wait_pv(
            &self.registry,
            "FPCaptureRBV",
            1.0,
            Some(self.timing.file_capture_timeout()),
            self.timing.pv_poll(),
            &self.control,
        )
        .await?;
        wait_pv(
            &self.registry,
            "FPCaptureRBV",
            0.0,
            None,
            self.timing.monitor_poll(),
            &self.control,
        )
        .await
    }

    /// Stop a capture in progress.
    pub async fn stop_capture(&self) -> ScanResult<()> {
        info!("stop capture");
        self.registry.put("FPCapture", "Done").await?;
        self.registry.put("StreamCapture", IDLE).await
    }

    /// Reset the stream PVs and stop the jog.
    pub async fn end_stream(&self) -> ScanResult<()> {
        info!("end stream");
        self.active.store(false, Ordering::SeqCst);
        for key in ["StreamCapture", "StreamRetakeDark", "StreamRetakeFlat", "StreamMessage"] {
            self.registry.put(key, IDLE).await?;
        }
        self.registry.put("RotationJog", 0i64).await
    }
}
