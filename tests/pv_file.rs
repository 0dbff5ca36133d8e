//! PV files on disk and the registry built from them.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tomoscan::pv::file::{read_pv_file, Macros, PvRole};
use tomoscan::pv::sim::SimBeamline;
use tomoscan::pv::{DeviceRegistry, PvAccess};
use tomoscan::ScanError;

const TIMEOUT: Duration = Duration::from_millis(10);

#[test]
fn reads_a_pv_file_from_disk() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "# devices").unwrap();
    writeln!(file, "$(P)$(R)RotationPVName").unwrap();
    writeln!(file).unwrap();
    writeln!(file, "#controlPV $(P)$(R)ScanStatus").unwrap();
    writeln!(file, "   $(P)$(R)NumAngles   ").unwrap();

    let macros = Macros::parse("P=2bma:, R=TomoScan:").unwrap();
    let entries = read_pv_file(file.path(), &macros).unwrap();

    let summary: Vec<(&str, &str, PvRole)> = entries
        .iter()
        .map(|e| (e.key.as_str(), e.pv_name.as_str(), e.role))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("RotationPVName", "2bma:TomoScan:RotationPVName", PvRole::Config),
            ("ScanStatus", "2bma:TomoScan:ScanStatus", PvRole::Control),
            ("NumAngles", "2bma:TomoScan:NumAngles", PvRole::Config),
        ]
    );
}

#[test]
fn missing_file_is_an_io_error() {
    let result = read_pv_file("/nonexistent/tomoscan.pvs", &Macros::new());
    assert!(matches!(result, Err(ScanError::Io(_))));
}

#[tokio::test]
async fn registry_resolves_device_pvs() {
    let sim = SimBeamline::new();
    let registry = sim.registry(TIMEOUT).await.unwrap();
    assert_eq!(registry.pv_name("Rotation").unwrap(), "2bma:m82");
    assert_eq!(registry.pv_name("RotationSpeed").unwrap(), "2bma:m82.VELO");
    assert_eq!(registry.prefix("Camera"), Some("2bmbSP1:"));
    assert!(registry.pv_name("FPCapture").unwrap().starts_with("2bmbSP1:HDF1:"));
    assert!(registry.config_keys().iter().any(|k| k == "NumAngles"));
    assert!(!registry.config_keys().iter().any(|k| k == "ScanStatus"));
    assert!(registry.require_connected(TIMEOUT).await.is_ok());
}

#[tokio::test]
async fn empty_indirection_leaves_the_device_unavailable() {
    let sim = SimBeamline::new();
    sim.ioc.set(sim.pv("CloseShutterPVName").unwrap(), "");
    let registry = sim.registry(TIMEOUT).await.unwrap();
    assert!(!registry.has("CloseShutter"));
    assert!(registry.has("OpenShutter"));
}

#[tokio::test]
async fn missing_rotation_is_a_configuration_error() {
    let sim = SimBeamline::new();
    sim.ioc.set(sim.pv("RotationPVName").unwrap(), "");
    let result = sim.registry(TIMEOUT).await;
    assert!(matches!(result, Err(ScanError::Configuration(msg)) if msg.contains("RotationPVName")));
}

#[tokio::test]
async fn offline_pvs_are_reported() {
    let sim = SimBeamline::new();
    let registry = sim.registry(TIMEOUT).await.unwrap();
    sim.ioc.set_offline("2bma:m82", true);
    match registry.require_connected(TIMEOUT).await {
        Err(ScanError::Disconnected { pvs }) => assert_eq!(pvs, vec!["2bma:m82".to_string()]),
        other => panic!("expected Disconnected, got {other:?}"),
    }
}

#[tokio::test]
async fn registry_works_over_any_pv_access() {
    let sim = SimBeamline::new();
    let access: Arc<dyn PvAccess> = sim.ioc.clone();
    let registry = DeviceRegistry::connect(access, &sim.entries, TIMEOUT)
        .await
        .unwrap();
    registry.put("NumAngles", 90i64).await.unwrap();
    assert_eq!(sim.ioc.int(sim.pv("NumAngles").unwrap()), 90);
}
