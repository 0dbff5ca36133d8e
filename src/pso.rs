//! PSO programming.
//!
//! The Aerotech controller's position synchronized output emits one camera
//! trigger every `|encoder_counts_per_step|` counts while the encoder is inside
//! a window. Commands are written as text to the controller's asyn record
//! (`PSOCommand.BOUT`); replies come back on `PSOCommand.BINP` prefixed with `%`.
//!
//! Every command waits for the record to finish processing, bounded by the PSO
//! command timeout. The two controller families differ in the output selection
//! and window disable commands only; [`PsoControllerModel`] carries that
//! dialect.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::timing::CONTROLLER_REPLY_SETTLE;
use crate::error::{ScanError, ScanResult};
use crate::motion::MotionPlan;
use crate::pv::DeviceRegistry;

/// Safety margin added to both ends of the window, in counts.
pub const WINDOW_MARGIN: i64 = 5;

const COMMAND: &str = "PSOCommand.BOUT";
const REPLY: &str = "PSOCommand.BINP";

/// Controller family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsoControllerModel {
    /// Aerotech Ensemble
    Ensemble,
    /// Aerotech A3200
    A3200,
}

impl PsoControllerModel {
    fn output_command(self, axis: &str) -> String {
        match self {
            PsoControllerModel::Ensemble => format!("PSOOUTPUT {axis} CONTROL 1"),
            PsoControllerModel::A3200 => format!("PSOOUTPUT {axis} CONTROL 0 1"),
        }
    }

    fn window_off_command(self, axis: &str) -> String {
        match self {
            PsoControllerModel::Ensemble => format!("PSOWINDOW {axis} OFF"),
            PsoControllerModel::A3200 => format!("PSOWINDOW {axis} 1 OFF"),
        }
    }
}

impl FromStr for PsoControllerModel {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Ensemble" => Ok(PsoControllerModel::Ensemble),
            "A3200" => Ok(PsoControllerModel::A3200),
            other => Err(ScanError::Configuration(format!(
                "Unknown PSO controller model '{other}'"
            ))),
        }
    }
}

impl fmt::Display for PsoControllerModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PsoControllerModel::Ensemble => write!(f, "Ensemble"),
            PsoControllerModel::A3200 => write!(f, "A3200"),
        }
    }
}

/// Per-site PSO wiring.
#[derive(Debug, Clone, PartialEq)]
pub struct PsoSettings {
    /// Controller family
    pub model: PsoControllerModel,
    /// Controller axis name, e.g. `X`
    pub axis: String,
    /// Encoder input channel
    pub encoder_input: i64,
    /// Pulse width in microseconds
    pub pulse_width: f64,
}

/// Encoder-count window, relative to the arming position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PsoWindow {
    /// First count of the window (margin excluded)
    pub start: i64,
    /// Last count of the window (margin excluded)
    pub end: i64,
    /// Inter-pulse distance
    pub counts_per_step: i64,
}

impl PsoWindow {
    /// Window for a plan, armed at `plan.rotation_start`.
    ///
    /// The range is offset by half a step so the first pulse fires half a step
    /// before the first angle and the last half a step after the last angle,
    /// centering each exposure on its angle.
    pub fn for_plan(plan: &MotionPlan) -> Self {
        let counts_per_step = plan.encoder_counts_per_step.abs();
        let sense = plan.senses.overall();
        let half = (counts_per_step as f64 / 2.0).round_ties_even() as i64;
        let range_start = if sense > 0.0 { -half } else { half };
        let length = counts_per_step * i64::from(plan.num_angles);
        let (start, end) = if sense > 0.0 {
            (range_start, range_start + length)
        } else {
            (range_start - length, range_start)
        };
        Self {
            start,
            end,
            counts_per_step,
        }
    }

    /// Window length in counts.
    pub fn len(&self) -> i64 {
        self.end - self.start
    }

    /// True for a zero-length window.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Issues the PSO command sequence through the device registry.
pub struct PsoProgrammer {
    registry: Arc<DeviceRegistry>,
    timeout: Duration,
}

impl PsoProgrammer {
    /// Programmer using `timeout` for every command acknowledgement.
    pub fn new(registry: Arc<DeviceRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    /// Read the controller model, axis, encoder input and pulse width PVs.
    pub async fn settings(&self) -> ScanResult<PsoSettings> {
        let model = self
            .registry
            .get_string("PSOControllerModel")
            .await?
            .parse()?;
        Ok(PsoSettings {
            model,
            axis: self.registry.get_string("PSOAxisName").await?.trim().to_string(),
            encoder_input: self.registry.get_int("PSOEncoderInput").await?,
            pulse_width: self.registry.get_float("PSOPulseWidth").await?,
        })
    }

    /// Send one command and wait for it to be processed.
    pub async fn command(&self, command: &str) -> ScanResult<()> {
        debug!(%command, "PSO command");
        self.registry
            .put_and_wait(COMMAND, command, self.timeout)
            .await
    }

    async fn reply(&self) -> ScanResult<String> {
        self.registry.get_string(REPLY).await
    }

    /// Encoder counts per rotation.
    ///
    /// The A3200 is asked (`UNITSTOCOUNTS`) and the answer is written back to
    /// `PSOCountsPerRotation`; for the Ensemble the PV is authoritative.
    pub async fn counts_per_rotation(&self, settings: &PsoSettings) -> ScanResult<f64> {
        if settings.model == PsoControllerModel::A3200 {
            self.command(&format!("UNITSTOCOUNTS({}, 360.0)", settings.axis))
                .await?;
            let reply = self.reply().await?;
            let counts = parse_reply(&reply)?
                .parse::<f64>()
                .map_err(|_| ScanError::Controller(format!("bad UNITSTOCOUNTS reply '{reply}'")))?;
            self.registry.put("PSOCountsPerRotation", counts).await?;
            return Ok(counts);
        }
        self.registry.get_float("PSOCountsPerRotation").await
    }

    /// Program the pulse generator for `plan`, up to but not including arming.
    ///
    /// The stage must already be at `plan.rotation_start`.
    pub async fn configure(&self, settings: &PsoSettings, plan: &MotionPlan) -> ScanResult<PsoWindow> {
        let axis = settings.axis.as_str();
        let window = PsoWindow::for_plan(plan);
        self.command(&format!("PSOCONTROL {axis} RESET")).await?;
        self.command(&settings.model.output_command(axis)).await?;
        self.command(&format!(
            "PSOPULSE {axis} TIME {:.6},{:.6}",
            settings.pulse_width, settings.pulse_width
        ))
        .await?;
        self.command(&format!("PSOOUTPUT {axis} PULSE WINDOW MASK"))
            .await?;
        self.command(&format!("PSOTRACK {axis} INPUT {}", settings.encoder_input))
            .await?;
        self.command(&format!("PSODISTANCE {axis} FIXED {}", window.counts_per_step))
            .await?;
        self.command(&format!("PSOWINDOW {axis} 1 INPUT {}", settings.encoder_input))
            .await?;
        self.command(&format!(
            "PSOWINDOW {axis} 1 RANGE {},{}",
            window.start - WINDOW_MARGIN,
            window.end + WINDOW_MARGIN
        ))
        .await?;
        info!(
            model = %settings.model,
            %axis,
            counts_per_step = window.counts_per_step,
            window_start = window.start,
            window_end = window.end,
            "PSO configured"
        );
        Ok(window)
    }

    /// Arm a configured pulse generator.
    pub async fn arm(&self, settings: &PsoSettings) -> ScanResult<()> {
        self.command(&format!("PSOCONTROL {} ARM", settings.axis))
            .await
    }

    /// [`configure`](Self::configure) followed by [`arm`](Self::arm).
    pub async fn program(&self, settings: &PsoSettings, plan: &MotionPlan) -> ScanResult<PsoWindow> {
        let window = self.configure(settings, plan).await?;
        self.arm(settings).await?;
        Ok(window)
    }

    /// Turn off the window and the pulse generator. Safe when never armed.
    pub async fn disarm(&self) -> ScanResult<()> {
        let model: PsoControllerModel = self
            .registry
            .get_string("PSOControllerModel")
            .await?
            .parse()?;
        let axis = self.registry.get_string("PSOAxisName").await?;
        let axis = axis.trim();
        info!(%model, %axis, "disarming PSO");
        self.command(&model.window_off_command(axis)).await?;
        self.command(&format!("PSOCONTROL {axis} OFF")).await
    }

    /// Restart the controller's data acquisition program.
    pub async fn restart_data_acquisition(&self) -> ScanResult<()> {
        self.command(r#"PROGRAM RUN 1, "dataacqoff.bcx""#).await?;
        self.command(r#"PROGRAM RUN 1, "dataacqon.bcx""#).await
    }

    /// Encoder position latched with the most recent trigger, in counts.
    ///
    /// Returns `None` when the controller gives an empty reply.
    pub async fn read_encoder(&self) -> ScanResult<Option<i64>> {
        self.command(r#"PROGRAM RUN 1, "dataacqread.bcx""#).await?;
        sleep(CONTROLLER_REPLY_SETTLE).await;
        self.command("IGLOBAL(0)").await?;
        sleep(CONTROLLER_REPLY_SETTLE).await;
        let reply = self.reply().await?;
        if reply.trim().is_empty() {
            warn!("controller returned no encoder position");
            return Ok(None);
        }
        let counts = parse_reply(&reply)?
            .parse::<i64>()
            .map_err(|_| ScanError::Controller(format!("bad IGLOBAL reply '{reply}'")))?;
        Ok(Some(counts))
    }
}

/// Strip the `%` acknowledgement prefix.
fn parse_reply(reply: &str) -> ScanResult<&str> {
    reply
        .trim()
        .strip_prefix('%')
        .map(str::trim)
        .ok_or_else(|| ScanError::Controller(format!("controller replied '{reply}'")))
}
