//! Simulated IOC
//!
//! An in-memory [`PvAccess`] implementation used by the test suite and the
//! `simulate` command. All timing uses `tokio::time`, so tests can run with a
//! paused clock.
//!
//! # Pieces
//!
//! - [`SimulatedIoc`]: the record store. String puts to enum records become
//!   choice indices, string puts to numeric records are parsed, and every
//!   client put is appended to a journal that tests inspect.
//! - [`SimDevice`]: hooks that react to puts the way real hardware would.
//!   [`SimMotor`], [`SimCamera`], [`SimFilePlugin`] and [`SimPsoController`]
//!   cover the beamline.
//! - [`SimBeamline`]: a complete, consistent beamline seeded from the bundled
//!   demo PV file.

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{parse_pv_file, DeviceRegistry, Macros, PvAccess, PvEntry, PvValue};
use crate::error::{ScanError, ScanResult};
use crate::scan::filename::{format_file_name, TemplateArg};

const MONITOR_CAPACITY: usize = 256;
/// Motion update period of simulated motors.
const MOTOR_TICK: Duration = Duration::from_millis(10);

/// Demo PV file shipped with the crate.
pub const DEMO_PV_FILE: &str = include_str!("../../config/pvs/tomoscan_pso.pvs");

/// Resolves once the device finished processing a put.
pub type Completion = BoxFuture<'static, ()>;

/// One client put, as written.
#[derive(Debug, Clone, PartialEq)]
pub struct PutRecord {
    /// PV name
    pub pv: String,
    /// Value as written by the client
    pub value: PvValue,
}

struct Record {
    value: PvValue,
    choices: Option<Vec<String>>,
    tx: broadcast::Sender<PvValue>,
}

impl Record {
    fn new(value: PvValue, choices: Option<Vec<String>>) -> Self {
        let (tx, _) = broadcast::channel(MONITOR_CAPACITY);
        Self { value, choices, tx }
    }

    fn display(&self) -> String {
        match (&self.choices, &self.value) {
            (Some(choices), PvValue::Int(index)) => usize::try_from(*index)
                .ok()
                .and_then(|i| choices.get(i))
                .cloned()
                .unwrap_or_else(|| index.to_string()),
            (_, value) => value.to_string(),
        }
    }

    /// Convert a client value to the record's native type.
    fn coerce(&self, value: PvValue) -> PvValue {
        match value {
            PvValue::Str(text) => {
                let trimmed = text.trim();
                if let Some(choices) = &self.choices {
                    if let Some(index) = choices.iter().position(|c| c == trimmed) {
                        return PvValue::Int(index as i64);
                    }
                }
                match self.value {
                    PvValue::Int(_) => PvValue::Str(text.clone())
                        .as_i64()
                        .map(PvValue::Int)
                        .unwrap_or(PvValue::Str(text)),
                    PvValue::Float(_) => trimmed
                        .parse::<f64>()
                        .map(PvValue::Float)
                        .unwrap_or(PvValue::Str(text)),
                    PvValue::Str(_) => PvValue::Str(text),
                }
            }
            PvValue::Int(v) if matches!(self.value, PvValue::Float(_)) => PvValue::Float(v as f64),
            PvValue::Float(v) if matches!(self.value, PvValue::Int(_)) && self.choices.is_some() => {
                PvValue::Int(v.round() as i64)
            }
            other => other,
        }
    }
}

#[derive(Default)]
struct IocState {
    records: HashMap<String, Record>,
    offline: HashSet<String>,
    journal: Vec<PutRecord>,
}

/// Simulated hardware reacting to puts.
pub trait SimDevice: Send + Sync {
    /// Called after `pv` was written with the coerced `value`. Return a
    /// completion when the put is not finished until some later event.
    fn on_put(&self, ioc: &Arc<SimulatedIoc>, pv: &str, value: &PvValue) -> Option<Completion>;
}

/// In-memory record store with monitor semantics.
pub struct SimulatedIoc {
    me: Weak<SimulatedIoc>,
    state: Mutex<IocState>,
    devices: RwLock<Vec<Arc<dyn SimDevice>>>,
}

impl SimulatedIoc {
    /// Empty IOC.
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            state: Mutex::new(IocState::default()),
            devices: RwLock::new(Vec::new()),
        })
    }

    /// Create or overwrite a record. Not journaled.
    pub fn seed(&self, pv: &str, value: impl Into<PvValue>) {
        self.set(pv, value);
    }

    /// Create an enum record with the given choices.
    pub fn seed_enum(&self, pv: &str, choices: &[&str], index: i64) {
        let choices = choices.iter().map(|c| c.to_string()).collect();
        self.state
            .lock()
            .records
            .insert(pv.to_string(), Record::new(PvValue::Int(index), Some(choices)));
    }

    /// Device-side update: creates the record if needed and notifies monitors.
    pub fn set(&self, pv: &str, value: impl Into<PvValue>) {
        let value = value.into();
        let mut state = self.state.lock();
        let record = state
            .records
            .entry(pv.to_string())
            .or_insert_with(|| Record::new(value.clone(), None));
        let coerced = record.coerce(value);
        record.value = coerced.clone();
        let _ = record.tx.send(coerced);
    }

    /// Current value.
    pub fn value(&self, pv: &str) -> Option<PvValue> {
        self.state.lock().records.get(pv).map(|r| r.value.clone())
    }

    /// Current numeric value, 0 when missing.
    pub fn float(&self, pv: &str) -> f64 {
        self.value(pv).and_then(|v| v.as_f64()).unwrap_or(0.0)
    }

    /// Current integer value, 0 when missing.
    pub fn int(&self, pv: &str) -> i64 {
        self.value(pv).and_then(|v| v.as_i64()).unwrap_or(0)
    }

    /// Current display string.
    pub fn string(&self, pv: &str) -> Option<String> {
        self.state.lock().records.get(pv).map(Record::display)
    }

    /// Take a PV off the network (or bring it back).
    pub fn set_offline(&self, pv: &str, offline: bool) {
        let mut state = self.state.lock();
        if offline {
            state.offline.insert(pv.to_string());
        } else {
            state.offline.remove(pv);
        }
    }

    /// Attach a simulated device.
    pub fn add_device(&self, device: Arc<dyn SimDevice>) {
        self.devices.write().push(device);
    }

    /// Journal position, for [`puts_since`](Self::puts_since).
    pub fn mark(&self) -> usize {
        self.state.lock().journal.len()
    }

    /// Every client put so far.
    pub fn journal(&self) -> Vec<PutRecord> {
        self.state.lock().journal.clone()
    }

    /// Client puts after `mark`.
    pub fn puts_since(&self, mark: usize) -> Vec<PutRecord> {
        self.state
            .lock()
            .journal
            .get(mark..)
            .map(<[PutRecord]>::to_vec)
            .unwrap_or_default()
    }

    /// Count puts after `mark` of `value` (compared as strings) to `pv`.
    pub fn count_puts(&self, mark: usize, pv: &str, value: impl Into<PvValue>) -> usize {
        let wanted = value.into().to_string();
        self.puts_since(mark)
            .iter()
            .filter(|p| p.pv == pv && p.value.to_string() == wanted)
            .count()
    }

    /// Values written to `pv` after `mark`, as strings.
    pub fn values_since(&self, mark: usize, pv: &str) -> Vec<String> {
        self.puts_since(mark)
            .into_iter()
            .filter(|p| p.pv == pv)
            .map(|p| p.value.to_string())
            .collect()
    }

    fn is_connected(&self, pv: &str) -> bool {
        let state = self.state.lock();
        state.records.contains_key(pv) && !state.offline.contains(pv)
    }

    fn write(&self, pv: &str, value: PvValue) -> ScanResult<PvValue> {
        let mut state = self.state.lock();
        if state.offline.contains(pv) {
            return Err(ScanError::pv(pv, "not connected"));
        }
        let record = state
            .records
            .get_mut(pv)
            .ok_or_else(|| ScanError::pv(pv, "no such PV"))?;
        let coerced = record.coerce(value.clone());
        record.value = coerced.clone();
        let _ = record.tx.send(coerced.clone());
        state.journal.push(PutRecord {
            pv: pv.to_string(),
            value,
        });
        Ok(coerced)
    }

    fn dispatch(&self, pv: &str, value: &PvValue) -> Vec<Completion> {
        let Some(me) = self.me.upgrade() else {
            return Vec::new();
        };
        let devices: Vec<Arc<dyn SimDevice>> = self.devices.read().clone();
        devices
            .iter()
            .filter_map(|device| device.on_put(&me, pv, value))
            .collect()
    }
}

#[async_trait]
impl PvAccess for SimulatedIoc {
    async fn connect(&self, pv: &str, timeout: Duration) -> bool {
        if self.is_connected(pv) {
            return true;
        }
        sleep(timeout).await;
        self.is_connected(pv)
    }

    async fn get(&self, pv: &str) -> ScanResult<PvValue> {
        let state = self.state.lock();
        if state.offline.contains(pv) {
            return Err(ScanError::pv(pv, "not connected"));
        }
        state
            .records
            .get(pv)
            .map(|r| r.value.clone())
            .ok_or_else(|| ScanError::pv(pv, "no such PV"))
    }

    async fn get_string(&self, pv: &str) -> ScanResult<String> {
        let state = self.state.lock();
        if state.offline.contains(pv) {
            return Err(ScanError::pv(pv, "not connected"));
        }
        state
            .records
            .get(pv)
            .map(Record::display)
            .ok_or_else(|| ScanError::pv(pv, "no such PV"))
    }

    async fn put(&self, pv: &str, value: PvValue) -> ScanResult<()> {
        let coerced = self.write(pv, value)?;
        // Device work continues in the background.
        drop(self.dispatch(pv, &coerced));
        Ok(())
    }

    async fn put_and_wait(&self, pv: &str, value: PvValue, timeout: Duration) -> ScanResult<()> {
        let coerced = self.write(pv, value)?;
        let completions = self.dispatch(pv, &coerced);
        if completions.is_empty() {
            return Ok(());
        }
        tokio::time::timeout(timeout, join_all(completions))
            .await
            .map(|_| ())
            .map_err(|_| ScanError::PvTimeout {
                pv: pv.to_string(),
                timeout,
            })
    }

    fn subscribe(&self, pv: &str) -> ScanResult<broadcast::Receiver<PvValue>> {
        self.state
            .lock()
            .records
            .get(pv)
            .map(|r| r.tx.subscribe())
            .ok_or_else(|| ScanError::pv(pv, "no such PV"))
    }
}

// =============================================================================
// SimMotor - motor record
// =============================================================================

/// Motor record: `VAL` moves `RBV` at `VELO`, `STOP` halts, `JOGF` jogs at `JVEL`.
pub struct SimMotor {
    base: String,
    generation: Arc<AtomicU64>,
}

impl SimMotor {
    /// Seed the motor fields and attach the device.
    pub fn install(ioc: &Arc<SimulatedIoc>, base: &str, position: f64, speed: f64) -> Arc<Self> {
        ioc.seed(base, position);
        for (field, value) in [
            (".RBV", PvValue::Float(position)),
            (".DMOV", PvValue::Int(1)),
            (".VELO", PvValue::Float(speed)),
            (".VMAX", PvValue::Float(speed)),
            (".MRES", PvValue::Float(0.001)),
            (".ERES", PvValue::Float(0.001)),
            (".SET", PvValue::Int(0)),
            (".STOP", PvValue::Int(0)),
            (".DIR", PvValue::Int(0)),
            (".ACCL", PvValue::Float(0.5)),
            (".JOGF", PvValue::Int(0)),
            (".JVEL", PvValue::Float(speed / 10.0)),
            (".JAR", PvValue::Float(speed)),
            (".OFF", PvValue::Float(0.0)),
        ] {
            ioc.seed(&format!("{base}{field}"), value);
        }
        let motor = Arc::new(Self {
            base: base.to_string(),
            generation: Arc::new(AtomicU64::new(0)),
        });
        ioc.add_device(motor.clone());
        motor
    }

    fn field(&self, field: &str) -> String {
        format!("{}{}", self.base, field)
    }

    fn halt(&self, ioc: &SimulatedIoc) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let rbv = ioc.float(&self.field(".RBV"));
        ioc.set(&self.base, rbv);
        ioc.set(&self.field(".JOGF"), 0i64);
        ioc.set(&self.field(".DMOV"), 1i64);
    }

    fn start_move(&self, ioc: &Arc<SimulatedIoc>, target: f64) -> Completion {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let counter = self.generation.clone();
        let rbv = self.field(".RBV");
        let velo = self.field(".VELO");
        let dmov = self.field(".DMOV");
        let ioc = ioc.clone();
        let (done_tx, done_rx) = oneshot::channel::<()>();
        ioc.set(&dmov, 0i64);
        tokio::spawn(async move {
            loop {
                if counter.load(Ordering::SeqCst) != generation {
                    break;
                }
                let position = ioc.float(&rbv);
                let stride = ioc.float(&velo).abs().max(1e-3) * MOTOR_TICK.as_secs_f64();
                let remaining = target - position;
                if remaining.abs() <= stride {
                    ioc.set(&rbv, target);
                    ioc.set(&dmov, 1i64);
                    break;
                }
                ioc.set(&rbv, position + stride * remaining.signum());
                sleep(MOTOR_TICK).await;
            }
            let _ = done_tx.send(());
        });
        done_rx.map(|_| ()).boxed()
    }

    fn start_jog(&self, ioc: &Arc<SimulatedIoc>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let counter = self.generation.clone();
        let rbv = self.field(".RBV");
        let jvel = self.field(".JVEL");
        let ioc = ioc.clone();
        ioc.set(&self.field(".DMOV"), 0i64);
        tokio::spawn(async move {
            while counter.load(Ordering::SeqCst) == generation {
                let stride = ioc.float(&jvel).abs() * MOTOR_TICK.as_secs_f64();
                ioc.set(&rbv, ioc.float(&rbv) + stride);
                sleep(MOTOR_TICK).await;
            }
        });
    }
}

impl SimDevice for SimMotor {
    fn on_put(&self, ioc: &Arc<SimulatedIoc>, pv: &str, value: &PvValue) -> Option<Completion> {
        let Some(field) = pv.strip_prefix(self.base.as_str()) else {
            return None;
        };
        match field {
            "" => value.as_f64().map(|target| self.start_move(ioc, target)),
            ".STOP" if value.as_i64() != Some(0) => {
                debug!(motor = %self.base, "stop");
                self.halt(ioc);
                ioc.set(pv, 0i64);
                None
            }
            ".JOGF" => {
                if value.as_i64() == Some(1) {
                    self.start_jog(ioc);
                } else {
                    self.halt(ioc);
                }
                None
            }
            _ => None,
        }
    }
}

// =============================================================================
// SimCamera - areaDetector driver
// =============================================================================

/// areaDetector camera driver with a connected file plugin.
///
/// Frames arrive every `AcquireTime_RBV + readout`, except in software trigger
/// mode where each `TriggerSoftware` put produces one frame.
pub struct SimCamera {
    cam: String,
    file_plugin: String,
    readout: Duration,
    stall_after: Option<i64>,
    generation: Arc<AtomicU64>,
}

impl SimCamera {
    /// Seed the driver PVs and attach the device.
    pub fn install(
        ioc: &Arc<SimulatedIoc>,
        cam: &str,
        file_plugin: &str,
        model: &str,
        readout: Duration,
        stall_after: Option<u32>,
    ) -> Arc<Self> {
        let adimec = model.starts_with("Q-12A180");
        let field = |name: &str| format!("{cam}{name}");
        ioc.seed_enum(&field("Acquire"), &["Done", "Acquire"], 0);
        ioc.seed(&field("AcquireBusy"), 0i64);
        ioc.seed_enum(&field("ImageMode"), &["Single", "Multiple", "Continuous"], 2);
        ioc.seed_enum(&field("TriggerMode"), &["Off", "On"], 0);
        ioc.seed(&field("NumImages"), 1i64);
        ioc.seed(&field("NumImagesCounter_RBV"), 0i64);
        ioc.seed(&field("AcquireTime"), 0.01);
        ioc.seed(&field("AcquireTime_RBV"), 0.01);
        ioc.seed(&field("Model_RBV"), model);
        ioc.seed(&field("Manufacturer_RBV"), if adimec { "Adimec" } else { "FLIR" });
        ioc.seed(&field("TriggerSource"), "Line0");
        ioc.seed_enum(&field("TriggerOverlap"), &["Off", "ReadOut"], 0);
        ioc.seed_enum(
            &field("ExposureMode"),
            &["Timed", "TriggerWidth", "Off", "TimedTriggerCont"],
            0,
        );
        ioc.seed(&field("PixelFormat"), if adimec { "Mono8" } else { "Mono16" });
        ioc.seed_enum(&field("ArrayCallbacks"), &["Disable", "Enable"], 1);
        ioc.seed(&field("FrameRateEnable"), 0i64);
        ioc.seed(&field("TriggerSoftware"), 0i64);
        ioc.seed(&field("GC_VideoMode_RBV"), "Mode7");
        let camera = Arc::new(Self {
            cam: cam.to_string(),
            file_plugin: file_plugin.to_string(),
            readout,
            stall_after: stall_after.map(i64::from),
            generation: Arc::new(AtomicU64::new(0)),
        });
        ioc.add_device(camera.clone());
        camera
    }

    fn is_software_triggered(ioc: &SimulatedIoc, cam: &str) -> bool {
        ioc.int(&format!("{cam}TriggerMode")) == 1
            && ioc.string(&format!("{cam}TriggerSource")).as_deref() == Some("Software")
    }

    /// Number of frames the current acquisition produces, `None` for continuous.
    fn frame_budget(ioc: &SimulatedIoc, cam: &str) -> Option<i64> {
        match ioc.int(&format!("{cam}ImageMode")) {
            0 => Some(1),
            1 => Some(ioc.int(&format!("{cam}NumImages")).max(1)),
            _ => None,
        }
    }

    /// Deliver one frame; returns true when the acquisition is complete.
    fn deliver_frame(ioc: &SimulatedIoc, cam: &str, file_plugin: &str) -> bool {
        let counter = format!("{cam}NumImagesCounter_RBV");
        let count = ioc.int(&counter) + 1;
        ioc.set(&counter, count);

        if ioc.int(&format!("{file_plugin}Capture_RBV")) == 1 {
            let captured_pv = format!("{file_plugin}NumCaptured_RBV");
            let captured = ioc.int(&captured_pv) + 1;
            ioc.set(&captured_pv, captured);
            let wanted = ioc.int(&format!("{file_plugin}NumCapture"));
            if wanted > 0 && captured >= wanted {
                ioc.set(&format!("{file_plugin}Capture_RBV"), 0i64);
                ioc.set(&format!("{file_plugin}Capture"), 0i64);
            }
        }

        let done = Self::frame_budget(ioc, cam).map_or(false, |budget| count >= budget);
        if done {
            ioc.set(&format!("{cam}Acquire"), 0i64);
            ioc.set(&format!("{cam}AcquireBusy"), 0i64);
        }
        done
    }

    fn start(&self, ioc: &Arc<SimulatedIoc>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        ioc.set(&format!("{}NumImagesCounter_RBV", self.cam), 0i64);
        ioc.set(&format!("{}AcquireBusy", self.cam), 1i64);
        if Self::is_software_triggered(ioc, &self.cam) {
            return;
        }
        let counter = self.generation.clone();
        let cam = self.cam.clone();
        let file_plugin = self.file_plugin.clone();
        let readout = self.readout;
        let stall_after = self.stall_after;
        let ioc = ioc.clone();
        tokio::spawn(async move {
            loop {
                let exposure = ioc.float(&format!("{cam}AcquireTime_RBV")).max(0.0);
                sleep(Duration::from_secs_f64(exposure) + readout).await;
                if counter.load(Ordering::SeqCst) != generation {
                    break;
                }
                let delivered = ioc.int(&format!("{cam}NumImagesCounter_RBV"));
                if stall_after.map_or(false, |limit| delivered >= limit) {
                    // hung driver: busy stays set, no more frames
                    warn!(camera = %cam, delivered, "simulated camera stalled");
                    break;
                }
                if Self::deliver_frame(&ioc, &cam, &file_plugin) {
                    break;
                }
            }
        });
    }
}

impl SimDevice for SimCamera {
    fn on_put(&self, ioc: &Arc<SimulatedIoc>, pv: &str, value: &PvValue) -> Option<Completion> {
        let Some(field) = pv.strip_prefix(self.cam.as_str()) else {
            return None;
        };
        match field {
            "AcquireTime" => {
                if let Some(exposure) = value.as_f64() {
                    ioc.set(&format!("{}AcquireTime_RBV", self.cam), exposure);
                }
            }
            "Acquire" => {
                if value.as_i64() == Some(1) {
                    debug!(camera = %self.cam, "acquire");
                    self.start(ioc);
                } else {
                    self.generation.fetch_add(1, Ordering::SeqCst);
                    ioc.set(&format!("{}AcquireBusy", self.cam), 0i64);
                }
            }
            "TriggerSoftware" => {
                let busy = ioc.int(&format!("{}AcquireBusy", self.cam)) == 1;
                if busy && Self::is_software_triggered(ioc, &self.cam) {
                    Self::deliver_frame(ioc, &self.cam, &self.file_plugin);
                }
            }
            _ => {}
        }
        None
    }
}

// =============================================================================
// SimFilePlugin - NDFileHDF5
// =============================================================================

/// File writer plugin. Captured frames are counted by [`SimCamera`].
pub struct SimFilePlugin {
    prefix: String,
}

impl SimFilePlugin {
    /// Seed the plugin PVs and attach the device.
    pub fn install(ioc: &Arc<SimulatedIoc>, prefix: &str) -> Arc<Self> {
        let field = |name: &str| format!("{prefix}{name}");
        ioc.seed_enum(&field("Capture"), &["Done", "Capture"], 0);
        ioc.seed_enum(&field("Capture_RBV"), &["Done", "Capture"], 0);
        ioc.seed(&field("NumCapture"), 0i64);
        ioc.seed(&field("NumCaptured_RBV"), 0i64);
        ioc.seed(&field("FilePath"), "");
        ioc.seed(&field("FilePath_RBV"), "");
        ioc.seed_enum(&field("FilePathExists_RBV"), &["No", "Yes"], 0);
        ioc.seed(&field("FileName"), "");
        ioc.seed(&field("FileName_RBV"), "");
        ioc.seed(&field("FileNumber"), 1i64);
        ioc.seed(&field("FileTemplate"), "%s%s_%3.3d.h5");
        ioc.seed(&field("FullFileName_RBV"), "");
        ioc.seed_enum(&field("AutoSave"), &["No", "Yes"], 0);
        ioc.seed_enum(&field("AutoIncrement"), &["No", "Yes"], 1);
        ioc.seed_enum(&field("FileWriteMode"), &["Single", "Capture", "Stream"], 2);
        ioc.seed_enum(&field("EnableCallbacks"), &["Disable", "Enable"], 1);
        let plugin = Arc::new(Self {
            prefix: prefix.to_string(),
        });
        ioc.add_device(plugin.clone());
        plugin
    }

    fn field(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn open_file(&self, ioc: &SimulatedIoc) {
        let path = ioc.string(&self.field("FilePath_RBV")).unwrap_or_default();
        let name = ioc.string(&self.field("FileName_RBV")).unwrap_or_default();
        let number = ioc.int(&self.field("FileNumber"));
        let template = ioc.string(&self.field("FileTemplate")).unwrap_or_default();
        let args = [
            TemplateArg::from(path.as_str()),
            TemplateArg::from(name.as_str()),
            TemplateArg::Int(number),
        ];
        let full = format_file_name(&template, &args).unwrap_or_else(|| format!("{path}{name}"));
        ioc.set(&self.field("FullFileName_RBV"), full);
        if ioc.int(&self.field("AutoIncrement")) == 1 {
            ioc.set(&self.field("FileNumber"), number + 1);
        }
    }
}

impl SimDevice for SimFilePlugin {
    fn on_put(&self, ioc: &Arc<SimulatedIoc>, pv: &str, value: &PvValue) -> Option<Completion> {
        let Some(field) = pv.strip_prefix(self.prefix.as_str()) else {
            return None;
        };
        match field {
            "FilePath" => {
                let path = value.to_string();
                let exists = !path.is_empty() && std::path::Path::new(&path).is_dir();
                ioc.set(&self.field("FilePath_RBV"), path);
                ioc.set(&self.field("FilePathExists_RBV"), i64::from(exists));
            }
            "FileName" => ioc.set(&self.field("FileName_RBV"), value.to_string()),
            "Capture" => {
                if value.as_i64() == Some(1) {
                    self.open_file(ioc);
                    ioc.set(&self.field("NumCaptured_RBV"), 0i64);
                    ioc.set(&self.field("Capture_RBV"), 1i64);
                } else {
                    ioc.set(&self.field("Capture_RBV"), 0i64);
                }
            }
            _ => {}
        }
        None
    }
}

// =============================================================================
// SimPsoController - Aerotech command channel
// =============================================================================

/// Aerotech controller behind the `PSOCommand` asyn record.
pub struct SimPsoController {
    command: String,
    reply: String,
    rotation: String,
    counts_per_rotation: f64,
}

impl SimPsoController {
    /// Seed the command channel and attach the device.
    pub fn install(
        ioc: &Arc<SimulatedIoc>,
        command: &str,
        reply: &str,
        rotation: &str,
        counts_per_rotation: f64,
    ) -> Arc<Self> {
        ioc.seed(command, "");
        ioc.seed(reply, "");
        let controller = Arc::new(Self {
            command: command.to_string(),
            reply: reply.to_string(),
            rotation: rotation.to_string(),
            counts_per_rotation,
        });
        ioc.add_device(controller.clone());
        controller
    }

    fn respond(&self, ioc: &SimulatedIoc, command: &str) -> String {
        if command.starts_with("UNITSTOCOUNTS") {
            format!("%{}", self.counts_per_rotation)
        } else if command.starts_with("IGLOBAL") {
            let rbv = ioc.float(&format!("{}.RBV", self.rotation));
            let offset = ioc.float(&format!("{}.OFF", self.rotation));
            let eres = ioc.float(&format!("{}.ERES", self.rotation));
            let counts = if eres == 0.0 {
                0
            } else {
                ((rbv - offset) / eres).round() as i64
            };
            format!("%{counts}")
        } else {
            "%".to_string()
        }
    }
}

impl SimDevice for SimPsoController {
    fn on_put(&self, ioc: &Arc<SimulatedIoc>, pv: &str, value: &PvValue) -> Option<Completion> {
        if pv != self.command {
            return None;
        }
        let command = value.to_string();
        debug!(%command, "PSO command");
        let reply = self.respond(ioc, &command);
        ioc.set(&self.reply, reply);
        None
    }
}

// =============================================================================
// SimBeamline - a complete simulated beamline
// =============================================================================

/// Camera IOC prefix of the simulated beamline.
pub const CAMERA_PREFIX: &str = "2bmbSP1:";
/// File plugin prefix of the simulated beamline.
pub const FILE_PLUGIN_PREFIX: &str = "2bmbSP1:HDF1:";
/// Rotation motor of the simulated beamline.
pub const ROTATION_MOTOR: &str = "2bma:m82";
/// Sample X motor of the simulated beamline.
pub const SAMPLE_X_MOTOR: &str = "2bma:m49";
/// Sample Y motor of the simulated beamline.
pub const SAMPLE_Y_MOTOR: &str = "2bma:m20";
const OPEN_SHUTTER: &str = "2bma:A_shutter:open.VAL";
const CLOSE_SHUTTER: &str = "2bma:A_shutter:close.VAL";

/// Options for [`SimBeamline::build`].
#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Value reported by `Model_RBV`
    pub camera_model: String,
    /// PSO controller family
    pub controller_model: String,
    /// Encoder counts per rotation
    pub counts_per_rotation: f64,
    /// Added to the exposure for every simulated frame
    pub readout: Duration,
    /// Macros applied to the demo PV file
    pub macros: Macros,
    /// Free-running acquisitions stop delivering after this many frames
    pub stall_after: Option<u32>,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            camera_model: "Oryx ORX-10G-51S5M".to_string(),
            controller_model: "Ensemble".to_string(),
            counts_per_rotation: 360_000.0,
            readout: Duration::from_millis(5),
            macros: Macros::new().with("P", "2bma:").with("R", "TomoScan:"),
            stall_after: None,
        }
    }
}

/// A fully seeded simulated beamline.
pub struct SimBeamline {
    /// The record store
    pub ioc: Arc<SimulatedIoc>,
    /// Parsed demo PV file
    pub entries: Vec<PvEntry>,
}

enum Seed {
    Value(PvValue),
    Enum(&'static [&'static str], i64),
}

fn seed_for(key: &str, options: &SimOptions) -> Seed {
    use Seed::{Enum, Value};
    let v = |value: PvValue| Value(value);
    match key {
        "CameraPVPrefix" => v(CAMERA_PREFIX.into()),
        "FilePluginPVPrefix" => v(FILE_PLUGIN_PREFIX.into()),
        "RotationPVName" => v(ROTATION_MOTOR.into()),
        "SampleXPVName" => v(SAMPLE_X_MOTOR.into()),
        "SampleYPVName" => v(SAMPLE_Y_MOTOR.into()),
        "OpenShutterPVName" => v(OPEN_SHUTTER.into()),
        "CloseShutterPVName" => v(CLOSE_SHUTTER.into()),
        "OpenShutterValue" | "CloseShutterValue" => v("1".into()),
        "ExposureTime" | "FlatExposureTime" => v(0.01.into()),
        "DifferentFlatExposure" => Enum(&["Same", "Different"], 0),
        "RotationStart" => v(0.0.into()),
        "RotationStep" => v(1.0.into()),
        "NumAngles" => v(180i64.into()),
        "ReturnRotation" | "OverwriteWarning" | "SampleOutAngleEnable" => Enum(&["No", "Yes"], 0),
        "NumDarkFields" | "NumFlatFields" => v(5i64.into()),
        "DarkFieldMode" => Enum(&["None", "Start", "End", "Both"], 1),
        "FlatFieldMode" => Enum(&["None", "Start", "End", "Both"], 3),
        "FlatFieldAxis" => Enum(&["X", "Y", "Both"], 0),
        "SampleInX" | "SampleInY" | "SampleOutY" | "SampleOutAngle" => v(0.0.into()),
        "SampleOutX" => v(5.0.into()),
        "FilePath" => v("/tmp/tomoscan/".into()),
        "FileName" => v("scan".into()),
        "HDF5ProjectionLocation" => v("/exchange/data".into()),
        "HDF5DarkLocation" => v("/exchange/data_dark".into()),
        "HDF5FlatLocation" => v("/exchange/data_white".into()),
        "PSOControllerModel" => v(options.controller_model.as_str().into()),
        "PSOAxisName" => v("X".into()),
        "PSOEncoderInput" => v(3i64.into()),
        "PSOPulseWidth" => v(10.0.into()),
        "StreamNumCapture" => v(100i64.into()),
        "StartScan" => Enum(&["Done", "Start"], 0),
        "AbortScan" => Enum(&["Done", "Abort"], 0),
        "MoveSampleIn" | "MoveSampleOut" => Enum(&["Done", "Move"], 0),
        "FilePathExists" => Enum(&["No", "Yes"], 0),
        "ServerRunning" => Enum(&["Stopped", "Running"], 0),
        "StreamSync" => Enum(&["Done", "Sync"], 0),
        "StreamCapture" => Enum(&["Done", "Capture"], 0),
        "StreamRetakeDark" | "StreamRetakeFlat" => Enum(&["Done", "Retake"], 0),
        "StreamMessage" => v("Done".into()),
        "Watchdog" | "PSOEncoderCountsPerStep" | "StreamNumTotalCaptured" | "FirstProjid" => {
            v(0i64.into())
        }
        "PSOCountsPerRotation" => v(options.counts_per_rotation.into()),
        "PSOStartTaxi" | "PSOEndTaxi" => v(0.0.into()),
        _ => v("".into()),
    }
}

impl SimBeamline {
    /// Beamline with default options.
    pub fn new() -> Self {
        Self::build(SimOptions::default())
    }

    /// Beamline reporting the given camera model.
    pub fn with_camera(model: &str) -> Self {
        Self::build(SimOptions {
            camera_model: model.to_string(),
            ..SimOptions::default()
        })
    }

    /// Seed every PV of the demo file and attach the devices.
    pub fn build(options: SimOptions) -> Self {
        let ioc = SimulatedIoc::new();
        let entries = parse_pv_file(DEMO_PV_FILE, &options.macros);
        for entry in &entries {
            match seed_for(&entry.key, &options) {
                Seed::Value(value) => ioc.seed(&entry.pv_name, value),
                Seed::Enum(choices, index) => ioc.seed_enum(&entry.pv_name, choices, index),
            }
        }
        ioc.seed(OPEN_SHUTTER, 0i64);
        ioc.seed(CLOSE_SHUTTER, 0i64);

        SimMotor::install(&ioc, ROTATION_MOTOR, 0.0, 100.0);
        ioc.seed(
            &format!("{ROTATION_MOTOR}.ERES"),
            360.0 / options.counts_per_rotation,
        );
        SimMotor::install(&ioc, SAMPLE_X_MOTOR, 0.0, 10.0);
        SimMotor::install(&ioc, SAMPLE_Y_MOTOR, 0.0, 10.0);
        SimCamera::install(
            &ioc,
            &format!("{CAMERA_PREFIX}cam1:"),
            FILE_PLUGIN_PREFIX,
            &options.camera_model,
            options.readout,
            options.stall_after,
        );
        SimFilePlugin::install(&ioc, FILE_PLUGIN_PREFIX);
        if let (Some(command), Some(reply)) = (
            entries.iter().find(|e| e.key == "PSOCommand.BOUT"),
            entries.iter().find(|e| e.key == "PSOCommand.BINP"),
        ) {
            SimPsoController::install(
                &ioc,
                &command.pv_name,
                &reply.pv_name,
                ROTATION_MOTOR,
                options.counts_per_rotation,
            );
        }
        info!(
            pvs = entries.len(),
            camera = %options.camera_model,
            controller = %options.controller_model,
            "simulated beamline ready"
        );
        Self { ioc, entries }
    }

    /// PV name of a PV file entry.
    pub fn pv(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.pv_name.as_str())
    }

    /// Connect a registry to this beamline.
    pub async fn registry(&self, connect_timeout: Duration) -> ScanResult<Arc<DeviceRegistry>> {
        let access: Arc<dyn PvAccess> = self.ioc.clone();
        let registry = DeviceRegistry::connect(access, &self.entries, connect_timeout).await?;
        Ok(Arc::new(registry))
    }
}

impl Default for SimBeamline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enum_records_accept_labels_and_indices() {
        let ioc = SimulatedIoc::new();
        ioc.seed_enum("cam:TriggerMode", &["Off", "On"], 0);
        ioc.put("cam:TriggerMode", "On".into()).await.unwrap();
        assert_eq!(ioc.get("cam:TriggerMode").await.unwrap(), PvValue::Int(1));
        assert_eq!(ioc.get_string("cam:TriggerMode").await.unwrap(), "On");
        ioc.put("cam:TriggerMode", 0i64.into()).await.unwrap();
        assert_eq!(ioc.get_string("cam:TriggerMode").await.unwrap(), "Off");
    }

    #[tokio::test]
    async fn string_puts_to_numeric_records_are_parsed() {
        let ioc = SimulatedIoc::new();
        ioc.seed("scan:ExposureTime", 0.1);
        ioc.put("scan:ExposureTime", "0.25".into()).await.unwrap();
        assert_eq!(ioc.get("scan:ExposureTime").await.unwrap(), PvValue::Float(0.25));
    }

    #[tokio::test]
    async fn journal_records_client_puts_only() {
        let ioc = SimulatedIoc::new();
        ioc.seed("a", 0i64);
        let mark = ioc.mark();
        ioc.put("a", 1i64.into()).await.unwrap();
        ioc.set("a", 2i64);
        assert_eq!(ioc.puts_since(mark).len(), 1);
        assert_eq!(ioc.count_puts(mark, "a", 1i64), 1);
    }

    #[tokio::test]
    async fn offline_pvs_fail() {
        let ioc = SimulatedIoc::new();
        ioc.seed("a", 0i64);
        ioc.set_offline("a", true);
        assert!(!ioc.connect("a", Duration::from_millis(1)).await);
        assert!(ioc.get("a").await.is_err());
        assert!(ioc.put("a", 1i64.into()).await.is_err());
    }

    #[tokio::test]
    async fn monitors_see_updates() {
        let ioc = SimulatedIoc::new();
        ioc.seed("a", 0i64);
        let mut rx = ioc.subscribe("a").unwrap();
        ioc.put("a", 7i64.into()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), PvValue::Int(7));
    }

    #[tokio::test(start_paused = true)]
    async fn motor_moves_and_completes() {
        let ioc = SimulatedIoc::new();
        SimMotor::install(&ioc, "m1", 0.0, 10.0);
        ioc.put_and_wait("m1", 5.0.into(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(ioc.float("m1.RBV"), 5.0);
        assert_eq!(ioc.int("m1.DMOV"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn motor_stop_releases_waiters() {
        let ioc = SimulatedIoc::new();
        SimMotor::install(&ioc, "m1", 0.0, 1.0);
        let mover = {
            let ioc = ioc.clone();
            tokio::spawn(async move {
                ioc.put_and_wait("m1", 100.0.into(), Duration::from_secs(500))
                    .await
            })
        };
        sleep(Duration::from_secs(1)).await;
        ioc.put("m1.STOP", 1i64.into()).await.unwrap();
        mover.await.unwrap().unwrap();
        assert!(ioc.float("m1.RBV") < 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn camera_counts_frames_into_the_file_plugin() {
        let ioc = SimulatedIoc::new();
        SimCamera::install(
            &ioc,
            "cam1:",
            "HDF1:",
            "Oryx ORX-10G-51S5M",
            Duration::from_millis(5),
            None,
        );
        SimFilePlugin::install(&ioc, "HDF1:");
        ioc.put("HDF1:NumCapture", 3i64.into()).await.unwrap();
        ioc.put("HDF1:Capture", "Capture".into()).await.unwrap();
        ioc.put("cam1:ImageMode", "Multiple".into()).await.unwrap();
        ioc.put("cam1:NumImages", 3i64.into()).await.unwrap();
        ioc.put("cam1:Acquire", "Acquire".into()).await.unwrap();
        assert_eq!(ioc.int("cam1:AcquireBusy"), 1);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(ioc.int("cam1:AcquireBusy"), 0);
        assert_eq!(ioc.int("cam1:NumImagesCounter_RBV"), 3);
        assert_eq!(ioc.int("HDF1:NumCaptured_RBV"), 3);
        assert_eq!(ioc.int("HDF1:Capture_RBV"), 0);
    }

    #[tokio::test]
    async fn controller_answers_queries() {
        let beamline = SimBeamline::new();
        let command = beamline.pv("PSOCommand.BOUT").unwrap().to_string();
        let reply = beamline.pv("PSOCommand.BINP").unwrap().to_string();
        beamline
            .ioc
            .put(&command, "UNITSTOCOUNTS(X, 360.0)".into())
            .await
            .unwrap();
        assert_eq!(beamline.ioc.string(&reply).unwrap(), "%360000");
    }

    #[tokio::test]
    async fn beamline_connects_every_pv() {
        let beamline = SimBeamline::new();
        let registry = beamline.registry(Duration::from_millis(10)).await.unwrap();
        assert!(registry
            .check_connected(Duration::from_millis(10))
            .await
            .is_empty());
    }
}
