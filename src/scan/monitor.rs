//! Completion monitor and read-back waits.
//!
//! Both waits poll on a fixed interval and check the shared running flag on
//! every iteration, so an abort is seen within one poll interval. A wait only
//! reacts to the flag when it was entered while a scan was running; waits made
//! during end-of-scan cleanup run to completion.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use super::ScanControl;
use crate::error::{ScanError, ScanResult};
use crate::pv::DeviceRegistry;

/// Numeric tolerance of [`wait_pv`].
pub const WAIT_TOLERANCE: f64 = 0.1;

/// Poll `key` until it reads `target`.
///
/// `timeout = None` waits forever.
///
/// # Errors
///
/// `ScanError::Aborted` when the scan is aborted during the wait, and
/// `ScanError::PvTimeout` when the deadline passes.
pub async fn wait_pv(
    registry: &DeviceRegistry,
    key: &str,
    target: f64,
    timeout: Option<Duration>,
    poll: Duration,
    control: &ScanControl,
) -> ScanResult<()> {
    let abortable = control.is_running();
    let start = Instant::now();
    loop {
        let value = registry.get(key).await?;
        if value
            .as_f64()
            .map_or(false, |v| (v - target).abs() < WAIT_TOLERANCE)
        {
            return Ok(());
        }
        if abortable && control.abort_requested() {
            return Err(ScanError::Aborted);
        }
        if let Some(timeout) = timeout {
            if start.elapsed() >= timeout {
                error!(%key, target, %value, ?timeout, "read-back did not reach its target");
                return Err(ScanError::PvTimeout {
                    pv: registry.pv_name(key)?.to_string(),
                    timeout,
                });
            }
        }
        sleep(poll).await;
    }
}

/// Acquisition progress at one poll.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    /// Frames acquired by the camera
    pub num_collected: i64,
    /// Frames the camera was asked for
    pub num_images: i64,
    /// Frames written by the file plugin
    pub num_saved: i64,
    /// Frames the file plugin was asked for
    pub num_to_save: i64,
    /// Time since the wait started
    pub elapsed: Duration,
    /// Estimated time to completion
    pub remaining: Duration,
}

impl ProgressSnapshot {
    /// Snapshot with the ETA `elapsed × (expected − collected) / max(collected, 1)`.
    pub fn new(
        num_collected: i64,
        num_images: i64,
        num_saved: i64,
        num_to_save: i64,
        elapsed: Duration,
    ) -> Self {
        let outstanding = (num_images - num_collected).max(0) as f64;
        let rate_divisor = num_collected.max(1) as f64;
        let remaining = Duration::from_secs_f64(elapsed.as_secs_f64() * outstanding / rate_divisor);
        Self {
            num_collected,
            num_images,
            num_saved,
            num_to_save,
            elapsed,
            remaining,
        }
    }

    /// `collected/requested`
    pub fn collected_text(&self) -> String {
        format!("{}/{}", self.num_collected, self.num_images)
    }

    /// `saved/requested`
    pub fn saved_text(&self) -> String {
        format!("{}/{}", self.num_saved, self.num_to_save)
    }
}

/// `H:MM:SS`, whole seconds.
pub fn format_hms(duration: Duration) -> String {
    let total = duration.as_secs();
    format!("{}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}

/// Waits for acquisition to finish while publishing progress.
pub struct CompletionMonitor {
    registry: Arc<DeviceRegistry>,
    control: ScanControl,
    poll: Duration,
}

impl CompletionMonitor {
    /// Monitor polling every `poll`.
    pub fn new(registry: Arc<DeviceRegistry>, control: ScanControl, poll: Duration) -> Self {
        Self {
            registry,
            control,
            poll,
        }
    }

    /// Read the counters and publish them to the status PVs.
    pub async fn update_status(&self, started: Instant) -> ScanResult<ProgressSnapshot> {
        let snapshot = ProgressSnapshot::new(
            self.registry.get_int("CamNumImagesCounter").await?,
            self.registry.get_int("CamNumImages").await?,
            self.registry.get_int("FPNumCaptured").await?,
            self.registry.get_int("FPNumCapture").await?,
            started.elapsed(),
        );
        debug!(
            collected = %snapshot.collected_text(),
            saved = %snapshot.saved_text(),
            "progress"
        );
        self.registry
            .put("ImagesCollected", snapshot.collected_text())
            .await?;
        self.registry.put("ImagesSaved", snapshot.saved_text()).await?;
        self.registry
            .put("ElapsedTime", format_hms(snapshot.elapsed))
            .await?;
        self.registry
            .put("RemainingTime", format_hms(snapshot.remaining))
            .await?;
        Ok(snapshot)
    }

    /// Block until the camera's busy flag drops.
    ///
    /// `timeout = None` waits forever.
    ///
    /// # Errors
    ///
    /// `ScanError::Aborted` within one poll of an abort request, and
    /// `ScanError::CameraTimeout` once `timeout` has elapsed.
    pub async fn wait_done(&self, timeout: Option<Duration>) -> ScanResult<()> {
        let abortable = self.control.is_running();
        let started = Instant::now();
        loop {
            if self.registry.get_int("CamAcquireBusy").await? == 0 {
                let snapshot = self.update_status(started).await?;
                info!(collected = %snapshot.collected_text(), "acquisition done");
                return Ok(());
            }
            if abortable && self.control.abort_requested() {
                warn!("abort detected by completion monitor");
                return Err(ScanError::Aborted);
            }
            sleep(self.poll).await;
            let snapshot = self.update_status(started).await?;
            if let Some(timeout) = timeout {
                if snapshot.elapsed >= timeout {
                    error!(
                        elapsed = ?snapshot.elapsed,
                        collected = %snapshot.collected_text(),
                        "camera timeout"
                    );
                    return Err(ScanError::CameraTimeout {
                        elapsed: snapshot.elapsed,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::timing::MONITOR_POLL_INTERVAL;
    use crate::pv::sim::SimBeamline;
    use crate::pv::PvAccess;

    const CAM: &str = "2bmbSP1:cam1:";

    async fn setup(beamline: &SimBeamline) -> (CompletionMonitor, ScanControl) {
        let registry = beamline.registry(Duration::from_millis(10)).await.unwrap();
        let control = ScanControl::new();
        (
            CompletionMonitor::new(registry, control.clone(), MONITOR_POLL_INTERVAL),
            control,
        )
    }

    async fn start_long_acquisition(beamline: &SimBeamline) {
        let ioc = &beamline.ioc;
        ioc.put(&format!("{CAM}ImageMode"), "Multiple".into()).await.unwrap();
        ioc.put(&format!("{CAM}NumImages"), 1_000_000i64.into()).await.unwrap();
        ioc.put(&format!("{CAM}Acquire"), "Acquire".into()).await.unwrap();
    }

    #[test]
    fn eta_guards_against_zero_frames() {
        let snapshot = ProgressSnapshot::new(0, 100, 0, 100, Duration::from_secs(4));
        assert_eq!(snapshot.remaining, Duration::from_secs(400));
        let snapshot = ProgressSnapshot::new(25, 100, 20, 100, Duration::from_secs(10));
        assert_eq!(snapshot.remaining, Duration::from_secs(30));
        assert_eq!(snapshot.collected_text(), "25/100");
        assert_eq!(snapshot.saved_text(), "20/100");
    }

    #[test]
    fn formats_like_a_clock() {
        assert_eq!(format_hms(Duration::from_secs(0)), "0:00:00");
        assert_eq!(format_hms(Duration::from_secs(3_725)), "1:02:05");
        assert_eq!(format_hms(Duration::from_millis(59_900)), "0:00:59");
    }

    #[tokio::test(start_paused = true)]
    async fn abort_is_seen_within_one_poll() {
        let beamline = SimBeamline::new();
        let (monitor, control) = setup(&beamline).await;
        start_long_acquisition(&beamline).await;
        control.try_begin().unwrap();

        let aborter = control.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            aborter.request_abort();
        });

        let started = Instant::now();
        let err = monitor
            .wait_done(Some(Duration::from_secs(60)))
            .await
            .unwrap_err();
        assert!(err.is_abort());
        assert!(started.elapsed() <= Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_distinct_from_abort() {
        let beamline = SimBeamline::new();
        let (monitor, control) = setup(&beamline).await;
        start_long_acquisition(&beamline).await;
        control.try_begin().unwrap();
        let err = monitor
            .wait_done(Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn completes_and_publishes_progress() {
        let beamline = SimBeamline::new();
        let (monitor, control) = setup(&beamline).await;
        let ioc = &beamline.ioc;
        ioc.put(&format!("{CAM}ImageMode"), "Multiple".into()).await.unwrap();
        ioc.put(&format!("{CAM}NumImages"), 20i64.into()).await.unwrap();
        ioc.put(&format!("{CAM}Acquire"), "Acquire".into()).await.unwrap();
        control.try_begin().unwrap();
        monitor.wait_done(None).await.unwrap();
        let collected = beamline.pv("ImagesCollected").unwrap();
        assert_eq!(ioc.string(collected).unwrap(), "20/20");
    }

    #[tokio::test(start_paused = true)]
    async fn waits_made_during_cleanup_ignore_the_flag() {
        let beamline = SimBeamline::new();
        let registry = beamline.registry(Duration::from_millis(10)).await.unwrap();
        let control = ScanControl::new();
        let key = "CamNumImages";
        let ioc = beamline.ioc.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            ioc.set(&format!("{CAM}NumImages"), 7i64);
        });
        wait_pv(
            &registry,
            key,
            7.0,
            Some(Duration::from_secs(1)),
            Duration::from_millis(10),
            &control,
        )
        .await
        .unwrap();
        let err = wait_pv(
            &registry,
            key,
            8.0,
            Some(Duration::from_millis(100)),
            Duration::from_millis(10),
            &control,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ScanError::PvTimeout { .. }));
    }
}
