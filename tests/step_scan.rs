//! Step scans: stop at every angle, one software trigger per projection.

mod common;

use common::Rig;
use std::sync::Arc;
use tomoscan::config::ScanKind;
use tomoscan::pv::sim::{SimOptions, ROTATION_MOTOR};
use tomoscan::scan::filename::AlwaysOverwrite;
use tomoscan::{ScanError, ScanStatus};

const TRIGGER: &str = "2bmbSP1:cam1:TriggerSoftware";

#[tokio::test(start_paused = true)]
async fn step_scan_triggers_once_per_angle() {
    let rig = Rig::new(ScanKind::Step).await;
    rig.registry().put("NumAngles", 20i64).await.unwrap();
    rig.registry().put("RotationStep", 2.0).await.unwrap();
    let mark = rig.sim.ioc.mark();

    let outcome = rig
        .sequencer
        .run_scan(Arc::new(AlwaysOverwrite))
        .await
        .unwrap();

    assert!(outcome.is_complete(), "{:?}", outcome.error);
    assert_eq!(rig.sim.ioc.count_puts(mark, TRIGGER, 1i64), 20);
    assert_eq!(
        rig.registry().get_string("ScanStatus").await.unwrap(),
        "Scan complete"
    );

    // the stage visits every planned angle in order
    let angles: Vec<f64> = rig
        .sim
        .ioc
        .values_since(mark, ROTATION_MOTOR)
        .iter()
        .filter_map(|v| v.parse().ok())
        .collect();
    let expected: Vec<f64> = (0..20).map(|k| f64::from(k) * 2.0).collect();
    assert_eq!(angles, expected);
}

#[tokio::test(start_paused = true)]
async fn step_scan_never_programs_the_pso() {
    let rig = Rig::new(ScanKind::Step).await;
    rig.registry().put("NumAngles", 5i64).await.unwrap();
    let mark = rig.sim.ioc.mark();
    let outcome = rig
        .sequencer
        .run_scan(Arc::new(AlwaysOverwrite))
        .await
        .unwrap();
    assert!(outcome.is_complete(), "{:?}", outcome.error);
    let commands = rig.pso_commands(mark);
    assert!(!commands.iter().any(|c| c.ends_with("ARM")));
}

#[tokio::test(start_paused = true)]
async fn cameras_without_software_trigger_fail_the_scan() {
    let rig = Rig::with_options(
        ScanKind::Step,
        SimOptions {
            camera_model: "Q-12A180-Fm/CXP-6".to_string(),
            ..SimOptions::default()
        },
    )
    .await;
    rig.registry().put("NumAngles", 5i64).await.unwrap();

    let outcome = rig
        .sequencer
        .run_scan(Arc::new(AlwaysOverwrite))
        .await
        .unwrap();

    assert_eq!(outcome.status, ScanStatus::Failed);
    assert!(matches!(
        outcome.error,
        Some(ScanError::UnsupportedCamera { .. })
    ));
    assert!(!rig.sequencer.control().in_scan());
}
