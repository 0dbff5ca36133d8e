//! Control-PV event dispatch.
//!
//! The operator drives the coordinator by writing control PVs. Each PV of
//! interest is a [`ControlEvent`]; the server monitors them and runs the
//! matching handler from a table built once at construction. A handler runs
//! in its own task so a slow action never blocks the monitors.
//!
//! # Lifecycle
//!
//! [`ScanServer::run`] subscribes to every event PV, starts the watchdog and
//! sets `ServerRunning`. When the shutdown future resolves it aborts a running
//! scan, gives the handler tasks time to finish their cleanup and sets
//! `ServerRunning` back to `Stopped`.

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::timing::WATCHDOG_VALUE;
use crate::config::TimingConfig;
use crate::error::{ScanError, ScanResult};
use crate::pv::PvValue;
use crate::scan::filename::OverwriteConfirm;
use crate::scan::ScanSequencer;

/// Time handler tasks get to finish after shutdown was requested.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

/// A control PV the server reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlEvent {
    /// `StartScan` set to Start
    StartScan,
    /// `AbortScan` set to Abort
    AbortScan,
    /// `MoveSampleIn` set to Move
    MoveSampleIn,
    /// `MoveSampleOut` set to Move
    MoveSampleOut,
    /// Any new `ExposureTime`
    ExposureTime,
    /// Any new `FilePath`
    FilePath,
    /// The file plugin's directory check changed
    FilePathExists,
    /// `StreamSync` set to Sync
    StreamSync,
    /// `StreamCapture` set to Capture
    StreamCapture,
    /// `StreamRetakeDark` set to Retake
    StreamRetakeDark,
    /// `StreamRetakeFlat` set to Retake
    StreamRetakeFlat,
}

impl ControlEvent {
    /// Every event, in subscription order.
    pub const ALL: [ControlEvent; 11] = [
        ControlEvent::StartScan,
        ControlEvent::AbortScan,
        ControlEvent::MoveSampleIn,
        ControlEvent::MoveSampleOut,
        ControlEvent::ExposureTime,
        ControlEvent::FilePath,
        ControlEvent::FilePathExists,
        ControlEvent::StreamSync,
        ControlEvent::StreamCapture,
        ControlEvent::StreamRetakeDark,
        ControlEvent::StreamRetakeFlat,
    ];

    /// Registry key of the monitored PV.
    pub fn key(self) -> &'static str {
        match self {
            ControlEvent::StartScan => "StartScan",
            ControlEvent::AbortScan => "AbortScan",
            ControlEvent::MoveSampleIn => "MoveSampleIn",
            ControlEvent::MoveSampleOut => "MoveSampleOut",
            ControlEvent::ExposureTime => "ExposureTime",
            ControlEvent::FilePath => "FilePath",
            ControlEvent::FilePathExists => "FPFilePathExists",
            ControlEvent::StreamSync => "StreamSync",
            ControlEvent::StreamCapture => "StreamCapture",
            ControlEvent::StreamRetakeDark => "StreamRetakeDark",
            ControlEvent::StreamRetakeFlat => "StreamRetakeFlat",
        }
    }

    /// Whether a new value of the PV should run the handler.
    ///
    /// Busy-style PVs trigger on their active state only, so the handler
    /// resetting them to `Done` does not fire again.
    pub fn is_triggered_by(self, value: &PvValue) -> bool {
        match self {
            ControlEvent::ExposureTime | ControlEvent::FilePath | ControlEvent::FilePathExists => {
                true
            }
            _ => value.as_i64() == Some(1),
        }
    }
}

impl fmt::Display for ControlEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Handler of one event.
pub type Handler = fn(Arc<ScanServer>, PvValue) -> BoxFuture<'static, ScanResult<()>>;

/// The event table.
pub fn handler_table() -> HashMap<ControlEvent, Handler> {
    let mut table: HashMap<ControlEvent, Handler> = HashMap::new();
    table.insert(ControlEvent::StartScan, |server, _| {
        async move { server.start_scan().await }.boxed()
    });
    table.insert(ControlEvent::AbortScan, |server, _| {
        async move {
            server.sequencer.abort().await?;
            server.sequencer.registry().put("AbortScan", "Done").await
        }
        .boxed()
    });
    table.insert(ControlEvent::MoveSampleIn, |server, _| {
        async move { server.sequencer.beamline().move_sample_in().await }.boxed()
    });
    table.insert(ControlEvent::MoveSampleOut, |server, _| {
        async move { server.sequencer.beamline().move_sample_out().await }.boxed()
    });
    table.insert(ControlEvent::ExposureTime, |server, value| {
        async move {
            server
                .sequencer
                .beamline()
                .set_exposure_time(value.as_f64())
                .await
        }
        .boxed()
    });
    table.insert(ControlEvent::FilePath, |server, _| {
        async move { server.sequencer.beamline().copy_file_path().await }.boxed()
    });
    table.insert(ControlEvent::FilePathExists, |server, _| {
        async move { server.sequencer.beamline().copy_file_path_exists().await }.boxed()
    });
    table.insert(ControlEvent::StreamSync, |server, _| {
        async move { server.sequencer.stream().resync().await.map(|_| ()) }.boxed()
    });
    table.insert(ControlEvent::StreamCapture, |server, _| {
        async move {
            server
                .sequencer
                .stream()
                .capture_projections()
                .await
                .map(|_| ())
        }
        .boxed()
    });
    table.insert(ControlEvent::StreamRetakeDark, |server, _| {
        async move { server.sequencer.retake_dark_fields().await.map(|_| ()) }.boxed()
    });
    table.insert(ControlEvent::StreamRetakeFlat, |server, _| {
        async move { server.sequencer.retake_flat_fields().await.map(|_| ()) }.boxed()
    });
    table
}

/// Serves control-PV events for one sequencer.
pub struct ScanServer {
    sequencer: Arc<ScanSequencer>,
    confirm: Arc<dyn OverwriteConfirm>,
    timing: TimingConfig,
    handlers: HashMap<ControlEvent, Handler>,
    tasks: Mutex<JoinSet<()>>,
}

impl ScanServer {
    /// Server using `confirm` for overwrite questions.
    pub fn new(
        sequencer: Arc<ScanSequencer>,
        confirm: Arc<dyn OverwriteConfirm>,
        timing: TimingConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            sequencer,
            confirm,
            timing,
            handlers: handler_table(),
            tasks: Mutex::new(JoinSet::new()),
        })
    }

    /// The sequencer being served.
    pub fn sequencer(&self) -> &Arc<ScanSequencer> {
        &self.sequencer
    }

    async fn start_scan(&self) -> ScanResult<()> {
        match self.sequencer.run_scan(self.confirm.clone()).await {
            Ok(outcome) => {
                info!(
                    scan_id = %outcome.scan_id,
                    status = %outcome.status,
                    seconds = outcome.elapsed().num_seconds(),
                    "scan finished"
                );
                Ok(())
            }
            Err(ScanError::Busy) => {
                warn!("scan already running; start ignored");
                Ok(())
            }
            Err(e) => {
                let registry = self.sequencer.registry();
                registry.put("ScanStatus", e.status_message()).await?;
                registry.put("StartScan", "Done").await?;
                Err(e)
            }
        }
    }

    fn spawn_handler(self: &Arc<Self>, event: ControlEvent, value: PvValue) {
        let Some(handler) = self.handlers.get(&event).copied() else {
            warn!(%event, "no handler");
            return;
        };
        debug!(%event, %value, "control event");
        let work = handler(self.clone(), value);
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            if let Err(e) = work.await {
                if e.is_abort() {
                    warn!(%event, "handler aborted");
                } else {
                    error!(%event, error = %e, "handler failed");
                }
            }
        });
    }

    /// Serve until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Fails when an event PV cannot be monitored or `ServerRunning` cannot be
    /// written.
    pub async fn run(self: Arc<Self>, shutdown: impl Future<Output = ()>) -> ScanResult<()> {
        let registry = self.sequencer.registry().clone();
        let mut monitors = JoinSet::new();
        for event in ControlEvent::ALL {
            let mut rx = registry.subscribe(event.key())?;
            let server = self.clone();
            monitors.spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(value) if event.is_triggered_by(&value) => {
                            server.spawn_handler(event, value);
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(%event, skipped, "monitor lagged");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            });
        }
        let watchdog_registry = registry.clone();
        let period = self.timing.watchdog_period();
        monitors.spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tick.tick().await;
                if let Err(e) = watchdog_registry.put("Watchdog", WATCHDOG_VALUE).await {
                    warn!(error = %e, "watchdog write failed");
                }
            }
        });

        registry.put("ServerRunning", "Running").await?;
        info!(events = ControlEvent::ALL.len(), "scan server running");

        shutdown.await;
        info!("scan server shutting down");
        monitors.abort_all();
        if self.sequencer.control().in_scan() {
            if let Err(e) = self.sequencer.abort().await {
                warn!(error = %e, "abort on shutdown failed");
            }
        }
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(grace = ?SHUTDOWN_GRACE, "handlers still running; cancelled");
            tasks.abort_all();
        }
        registry.put("ServerRunning", "Stopped").await?;
        info!("scan server stopped");
        Ok(())
    }
}
