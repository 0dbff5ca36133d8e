//! Stream scans: continuous rotation, on-demand capture, re-synchronization
//! and the abort that ends them.

mod common;

use common::{eventually, Rig};
use std::sync::Arc;
use std::time::Duration;
use tomoscan::config::ScanKind;
use tomoscan::pv::sim::ROTATION_MOTOR;
use tomoscan::scan::filename::AlwaysOverwrite;
use tomoscan::scan::{CleanupOutcome, CleanupStep, ScanOutcome};
use tomoscan::{ScanResult, ScanStatus};
use tokio::task::JoinHandle;

async fn start_stream(rig: &Rig) -> JoinHandle<ScanResult<ScanOutcome>> {
    let sequencer = rig.sequencer.clone();
    let scan = tokio::spawn(async move { sequencer.run_scan(Arc::new(AlwaysOverwrite)).await });
    let stream = rig.sequencer.stream().clone();
    eventually(|| {
        let stream = stream.clone();
        async move { stream.is_active() }
    })
    .await;
    scan
}

#[tokio::test(start_paused = true)]
async fn stream_runs_until_aborted() {
    let rig = Rig::new(ScanKind::Stream).await;
    let jog = format!("{ROTATION_MOTOR}.JOGF");
    let scan = start_stream(&rig).await;

    assert_eq!(rig.sequencer.status(), ScanStatus::CollectingProjections);
    assert_eq!(rig.sim.ioc.int(&jog), 1);
    assert_eq!(rig.registry().get_int("FirstProjid").await.unwrap(), 1);
    assert_eq!(rig.registry().get_string("FlatFieldMode").await.unwrap(), "None");

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(!scan.is_finished());

    rig.sequencer.abort().await.unwrap();
    let outcome = scan.await.unwrap().unwrap();
    assert_eq!(outcome.status, ScanStatus::Aborted);
    assert_eq!(
        outcome.cleanup_outcome(CleanupStep::EndStream),
        Some(&CleanupOutcome::Done)
    );
    assert!(matches!(
        outcome.cleanup_outcome(CleanupStep::AddTheta),
        Some(CleanupOutcome::Skipped(_))
    ));
    assert_eq!(rig.sim.ioc.int(&jog), 0);
    assert!(!rig.sequencer.stream().is_active());
}

#[tokio::test(start_paused = true)]
async fn capture_during_a_stream_scan() {
    let rig = Rig::new(ScanKind::Stream).await;
    rig.registry().put("StreamNumCapture", 30i64).await.unwrap();
    let scan = start_stream(&rig).await;

    let stream = rig.sequencer.stream().clone();
    assert!(stream.capture_projections().await.unwrap());
    assert!(stream.capture_projections().await.unwrap());
    assert_eq!(
        rig.registry().get_int("StreamNumTotalCaptured").await.unwrap(),
        60
    );
    assert_eq!(
        rig.registry().get_string("StreamFileName").await.unwrap(),
        "scan_002.h5"
    );

    rig.sequencer.abort().await.unwrap();
    assert_eq!(scan.await.unwrap().unwrap().status, ScanStatus::Aborted);
}

#[tokio::test(start_paused = true)]
async fn exposure_change_resynchronizes_the_angles() {
    let rig = Rig::new(ScanKind::Stream).await;
    let scan = start_stream(&rig).await;
    let stream = rig.sequencer.stream().clone();
    let mut theta_rx = stream.subscribe_theta();
    tokio::time::sleep(Duration::from_secs(2)).await;

    rig.registry().put("ExposureTime", 0.02).await.unwrap();
    assert!(stream.resync().await.unwrap());

    let (first_id, start, step) = stream.anchor().await.unwrap();
    assert!(first_id > 1);
    assert_eq!(step, 1.0);
    let theta = theta_rx.recv().await.unwrap();
    assert_eq!(theta[0], start as f32);
    assert_eq!(rig.registry().get_string("StreamSync").await.unwrap(), "Done");

    // a second request with nothing changed is a no-op
    assert!(!stream.resync().await.unwrap());

    rig.sequencer.abort().await.unwrap();
    assert_eq!(scan.await.unwrap().unwrap().status, ScanStatus::Aborted);
}

#[tokio::test(start_paused = true)]
async fn dark_and_flat_fields_are_retaken_while_streaming() {
    const FILE_NAME: &str = "2bmbSP1:HDF1:FileName";
    let rig = Rig::new(ScanKind::Stream).await;
    rig.registry().put("StreamNumCapture", 30i64).await.unwrap();
    let scan = start_stream(&rig).await;
    let stream = rig.sequencer.stream().clone();
    let mut theta_rx = stream.subscribe_theta();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let mark = rig.sim.ioc.mark();
    rig.registry().put("StreamRetakeDark", "Retake").await.unwrap();
    assert!(rig.sequencer.retake_dark_fields().await.unwrap());
    assert_eq!(
        rig.sim.ioc.values_since(mark, FILE_NAME),
        vec!["dark_fields.h5", "scan"]
    );
    assert_eq!(rig.registry().get_int("FPNumCaptured").await.unwrap(), 5);
    assert!(rig
        .registry()
        .get_string("FPFullFileName")
        .await
        .unwrap()
        .ends_with("dark_fields.h5"));
    assert_eq!(rig.registry().get_string("StreamRetakeDark").await.unwrap(), "Done");
    assert_eq!(rig.registry().get_string("StreamMessage").await.unwrap(), "Done");
    assert_eq!(rig.registry().get_string("FrameType").await.unwrap(), "Projection");
    assert_eq!(rig.sequencer.status(), ScanStatus::CollectingProjections);
    // back on PSO triggers with fresh angles
    let (first_id, start, _) = stream.anchor().await.unwrap();
    assert_eq!(theta_rx.recv().await.unwrap()[0], start as f32);
    assert_eq!(rig.registry().get_int("FirstProjid").await.unwrap(), first_id);

    let mark = rig.sim.ioc.mark();
    assert!(rig.sequencer.retake_flat_fields().await.unwrap());
    assert_eq!(
        rig.sim.ioc.values_since(mark, FILE_NAME),
        vec!["flat_fields.h5", "scan"]
    );
    assert!(!stream.is_retaking());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!scan.is_finished());
    assert!(stream.capture_projections().await.unwrap());
    assert_eq!(
        rig.registry().get_string("StreamFileName").await.unwrap(),
        "scan_001.h5"
    );

    rig.sequencer.abort().await.unwrap();
    assert_eq!(scan.await.unwrap().unwrap().status, ScanStatus::Aborted);
}
