//! End-to-end fly scans against the simulated beamline.

mod common;

use common::{eventually, Rig, CAM_ACQUIRE_TIME, CAM_IMAGE_MODE};
use std::sync::Arc;
use tomoscan::config::ScanKind;
use tomoscan::pv::sim::{SimOptions, ROTATION_MOTOR};
use tomoscan::scan::filename::AlwaysOverwrite;
use tomoscan::scan::{CleanupOutcome, CleanupStep};
use tomoscan::{ScanError, ScanStatus};

#[tokio::test(start_paused = true)]
async fn fly_scan_runs_every_phase_and_cleans_up() {
    let rig = Rig::new(ScanKind::Fly).await;
    let mark = rig.sim.ioc.mark();

    let outcome = rig
        .sequencer
        .run_scan(Arc::new(AlwaysOverwrite))
        .await
        .unwrap();

    assert!(outcome.is_complete(), "{:?}", outcome.error);
    assert_eq!(rig.sequencer.status(), ScanStatus::ScanComplete);
    assert!(!rig.sequencer.control().in_scan());
    assert_eq!(
        rig.registry().get_string("StartScan").await.unwrap(),
        "Done"
    );
    assert_eq!(rig.sim.ioc.count_puts(mark, CAM_IMAGE_MODE, "Continuous"), 1);
    assert!(rig.data_dir().join("scan_001.config").exists());

    // every cleanup step appears exactly once, in declaration order
    let steps: Vec<CleanupStep> = outcome.cleanup.iter().map(|r| r.step).collect();
    assert_eq!(
        steps,
        vec![
            CleanupStep::SaveConfiguration,
            CleanupStep::EndStream,
            CleanupStep::FreeRun,
            CleanupStep::RestoreSpeed,
            CleanupStep::DisarmPso,
            CleanupStep::SampleIn,
            CleanupStep::CloseShutter,
            CleanupStep::StopCapture,
            CleanupStep::ReturnRotation,
            CleanupStep::AddTheta,
            CleanupStep::Status,
        ]
    );
    assert!(outcome
        .cleanup
        .iter()
        .all(|r| !matches!(r.outcome, CleanupOutcome::Failed(_))));
}

#[tokio::test(start_paused = true)]
async fn pso_is_armed_before_the_stage_leaves_for_the_end() {
    let rig = Rig::new(ScanKind::Fly).await;
    let mark = rig.sim.ioc.mark();
    let outcome = rig
        .sequencer
        .run_scan(Arc::new(AlwaysOverwrite))
        .await
        .unwrap();
    assert!(outcome.is_complete(), "{:?}", outcome.error);

    let commands = rig.pso_commands(mark);
    assert_eq!(commands.first().map(String::as_str), Some("PSOCONTROL X RESET"));
    assert!(commands.contains(&"PSODISTANCE X FIXED 1000".to_string()));
    assert!(commands.contains(&"PSOTRACK X INPUT 3".to_string()));
    assert_eq!(
        &commands[commands.len() - 2..],
        ["PSOWINDOW X OFF", "PSOCONTROL X OFF"]
    );

    let command_pv = rig.pv(common::PSO_COMMAND);
    let puts = rig.sim.ioc.puts_since(mark);
    let armed = puts
        .iter()
        .position(|p| p.pv == command_pv && p.value.to_string() == "PSOCONTROL X ARM")
        .expect("PSO never armed");
    let rotation_end = puts
        .iter()
        .position(|p| {
            p.pv == ROTATION_MOTOR && p.value.as_f64().map_or(false, |angle| angle > 179.0)
        })
        .expect("rotation never moved past the last angle");
    assert!(armed < rotation_end);
}

#[tokio::test(start_paused = true)]
async fn return_rotation_goes_back_to_the_start() {
    let rig = Rig::new(ScanKind::Fly).await;
    rig.registry().put("ReturnRotation", "Yes").await.unwrap();
    rig.registry().put("NumAngles", 20i64).await.unwrap();

    let outcome = rig
        .sequencer
        .run_scan(Arc::new(AlwaysOverwrite))
        .await
        .unwrap();

    assert!(outcome.is_complete(), "{:?}", outcome.error);
    assert_eq!(
        outcome.cleanup_outcome(CleanupStep::ReturnRotation),
        Some(&CleanupOutcome::Done)
    );
    let last_rotation = rig
        .sim
        .ioc
        .values_since(0, ROTATION_MOTOR)
        .last()
        .cloned()
        .unwrap();
    assert_eq!(last_rotation.parse::<f64>().unwrap(), 0.0);
}

#[cfg(not(feature = "storage_hdf5"))]
#[tokio::test(start_paused = true)]
async fn theta_is_skipped_without_hdf5_support() {
    let rig = Rig::new(ScanKind::Fly).await;
    rig.registry().put("NumAngles", 10i64).await.unwrap();
    let outcome = rig
        .sequencer
        .run_scan(Arc::new(AlwaysOverwrite))
        .await
        .unwrap();
    assert!(matches!(
        outcome.cleanup_outcome(CleanupStep::AddTheta),
        Some(CleanupOutcome::Skipped(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn exposure_edits_during_a_scan_wait_for_the_next_one() {
    let rig = Rig::new(ScanKind::Fly).await;
    rig.registry().put("NumAngles", 200i64).await.unwrap();
    rig.registry().put("DifferentFlatExposure", "Different").await.unwrap();
    rig.registry().put("FlatExposureTime", 0.05).await.unwrap();
    let sequencer = rig.sequencer.clone();
    let scan = tokio::spawn(async move { sequencer.run_scan(Arc::new(AlwaysOverwrite)).await });
    rig.sequencer
        .subscribe_status()
        .wait_for(|s| *s == ScanStatus::CollectingProjections)
        .await
        .unwrap();
    let registry = rig.registry().clone();
    eventually(|| {
        let registry = registry.clone();
        async move { registry.get_int("CamNumImagesCounter").await.unwrap() >= 10 }
    })
    .await;

    let mark = rig.sim.ioc.mark();
    rig.registry().put("ExposureTime", 0.5).await.unwrap();
    rig.registry().put("FlatExposureTime", 0.7).await.unwrap();
    let outcome = scan.await.unwrap().unwrap();

    assert!(outcome.is_complete(), "{:?}", outcome.error);
    // only the closing flat fields touch the exposure, with the value read at start
    assert_eq!(rig.sim.ioc.values_since(mark, CAM_ACQUIRE_TIME), vec!["0.05"]);
}

#[tokio::test(start_paused = true)]
async fn a_hung_camera_fails_the_scan_and_still_cleans_up() {
    let rig = Rig::with_options(
        ScanKind::Fly,
        SimOptions {
            stall_after: Some(20),
            ..SimOptions::default()
        },
    )
    .await;
    rig.registry().put("NumAngles", 50i64).await.unwrap();
    let mark = rig.sim.ioc.mark();

    let outcome = rig
        .sequencer
        .run_scan(Arc::new(AlwaysOverwrite))
        .await
        .unwrap();

    assert_eq!(outcome.status, ScanStatus::Failed);
    assert!(
        matches!(outcome.error, Some(ScanError::CameraTimeout { .. })),
        "{:?}",
        outcome.error
    );
    assert_eq!(outcome.cleanup.len(), 11);
    for record in &outcome.cleanup {
        assert_eq!(outcome.cleanup_count(record.step), 1, "{:?}", record.step);
    }
    let ioc = &rig.sim.ioc;
    assert_eq!(ioc.count_puts(mark, CAM_IMAGE_MODE, "Continuous"), 1);
    assert_eq!(ioc.count_puts(mark, &rig.pv("MoveSampleIn"), "Done"), 1);
    assert_eq!(ioc.count_puts(mark, &rig.pv(common::PSO_COMMAND), "PSOCONTROL X OFF"), 1);
    assert_eq!(ioc.count_puts(mark, &rig.pv("StartScan"), "Done"), 1);
    assert!(!rig.sequencer.control().in_scan());
}
