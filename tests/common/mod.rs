//! Shared setup for the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tomoscan::config::{ScanKind, TimingConfig};
use tomoscan::pv::sim::{SimBeamline, SimOptions};
use tomoscan::pv::DeviceRegistry;
use tomoscan::ScanSequencer;

/// PV file entry of the Aerotech command channel.
pub const PSO_COMMAND: &str = "PSOCommand.BOUT";
/// Camera image mode PV of the simulated beamline.
pub const CAM_IMAGE_MODE: &str = "2bmbSP1:cam1:ImageMode";
/// Camera exposure PV of the simulated beamline.
pub const CAM_ACQUIRE_TIME: &str = "2bmbSP1:cam1:AcquireTime";

/// A simulated beamline with its data directory.
pub struct Rig {
    pub sim: SimBeamline,
    pub dir: TempDir,
    pub sequencer: Arc<ScanSequencer>,
}

impl Rig {
    pub async fn new(kind: ScanKind) -> Self {
        Self::with_options(kind, SimOptions::default()).await
    }

    pub async fn with_options(kind: ScanKind, options: SimOptions) -> Self {
        let sim = SimBeamline::build(options);
        let dir = tempfile::tempdir().unwrap();
        let registry = sim.registry(Duration::from_millis(10)).await.unwrap();
        registry
            .put("FilePath", format!("{}/", dir.path().display()))
            .await
            .unwrap();
        let sequencer = Arc::new(ScanSequencer::new(registry, TimingConfig::default(), kind));
        Self {
            sim,
            dir,
            sequencer,
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        self.sequencer.registry()
    }

    pub fn data_dir(&self) -> &Path {
        self.dir.path()
    }

    /// PV name of a PV file entry.
    pub fn pv(&self, key: &str) -> String {
        self.sim.pv(key).unwrap().to_string()
    }

    /// Commands written to the PSO controller since `mark`.
    pub fn pso_commands(&self, mark: usize) -> Vec<String> {
        self.sim.ioc.values_since(mark, &self.pv(PSO_COMMAND))
    }
}

/// Poll until `check` holds, advancing paused time.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..10_000 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held");
}
