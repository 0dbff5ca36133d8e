//! Abort at different points of a scan: cleanup must run exactly once and
//! leave the beamline in its idle state.

mod common;

use async_trait::async_trait;
use common::{eventually, Rig, CAM_IMAGE_MODE};
use std::path::Path;
use std::sync::Arc;
use tomoscan::config::ScanKind;
use tomoscan::pv::sim::ROTATION_MOTOR;
use tomoscan::scan::filename::{AlwaysOverwrite, OverwriteConfirm};
use tomoscan::scan::{CleanupStep, ScanControl, ScanOutcome};
use tomoscan::{ScanError, ScanStatus};

/// Answers yes, but only after the operator pressed abort.
struct AbortWhileAsking(ScanControl);

#[async_trait]
impl OverwriteConfirm for AbortWhileAsking {
    async fn confirm(&self, _path: &Path) -> bool {
        self.0.request_abort();
        true
    }
}

fn assert_cleaned_up_once(rig: &Rig, mark: usize, outcome: &ScanOutcome) {
    assert_eq!(outcome.status, ScanStatus::Aborted, "{:?}", outcome.error);
    assert!(matches!(outcome.error, Some(ScanError::Aborted)));
    for record in &outcome.cleanup {
        assert_eq!(outcome.cleanup_count(record.step), 1, "{:?}", record.step);
    }
    assert_eq!(outcome.cleanup.len(), 11);

    let ioc = &rig.sim.ioc;
    assert_eq!(ioc.count_puts(mark, &rig.pv(common::PSO_COMMAND), "PSOCONTROL X OFF"), 1);
    assert_eq!(ioc.count_puts(mark, CAM_IMAGE_MODE, "Continuous"), 1);
    assert_eq!(ioc.count_puts(mark, &rig.pv("MoveSampleIn"), "Done"), 1);
    assert_eq!(ioc.count_puts(mark, &rig.pv("ScanStatus"), "Scan aborted"), 1);
    assert_eq!(ioc.count_puts(mark, &rig.pv("StartScan"), "Done"), 1);
    assert!(!rig.sequencer.control().in_scan());
}

#[tokio::test(start_paused = true)]
async fn abort_before_motion_never_moves_the_stage() {
    let rig = Rig::new(ScanKind::Fly).await;
    std::fs::write(rig.data_dir().join("scan_001.h5"), b"").unwrap();
    rig.registry().put("OverwriteWarning", "Yes").await.unwrap();

    let mark = rig.sim.ioc.mark();
    let confirm = Arc::new(AbortWhileAsking(rig.sequencer.control().clone()));
    let outcome = rig.sequencer.run_scan(confirm).await.unwrap();

    assert_cleaned_up_once(&rig, mark, &outcome);
    let rotation_moves = rig
        .sim
        .ioc
        .puts_since(mark)
        .into_iter()
        .filter(|p| p.pv == ROTATION_MOTOR)
        .count();
    assert_eq!(rotation_moves, 0);
}

#[tokio::test(start_paused = true)]
async fn abort_during_projections() {
    let rig = Rig::new(ScanKind::Fly).await;
    rig.registry().put("NumAngles", 1000i64).await.unwrap();
    let sequencer = rig.sequencer.clone();
    let scan = tokio::spawn(async move { sequencer.run_scan(Arc::new(AlwaysOverwrite)).await });

    let mut status = rig.sequencer.subscribe_status();
    status
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
    rig.sequencer.abort().await.unwrap();
    let outcome = scan.await.unwrap().unwrap();

    assert_cleaned_up_once(&rig, mark, &outcome);
    assert!(rig.registry().get_int("CamNumImagesCounter").await.unwrap() < 1000);
}

#[tokio::test(start_paused = true)]
async fn abort_during_dark_fields() {
    let rig = Rig::new(ScanKind::Fly).await;
    rig.registry().put("NumDarkFields", 50i64).await.unwrap();
    let sequencer = rig.sequencer.clone();
    let scan = tokio::spawn(async move { sequencer.run_scan(Arc::new(AlwaysOverwrite)).await });

    let mut status = rig.sequencer.subscribe_status();
    status
        .wait_for(|s| matches!(s, ScanStatus::CollectingDark | ScanStatus::CollectingFlat))
        .await
        .unwrap();

    let mark = rig.sim.ioc.mark();
    rig.sequencer.abort().await.unwrap();
    let outcome = scan.await.unwrap().unwrap();

    assert_cleaned_up_once(&rig, mark, &outcome);
    assert_eq!(
        rig.registry().get_string("ScanStatus").await.unwrap(),
        "Scan aborted"
    );
}

#[tokio::test(start_paused = true)]
async fn a_new_scan_may_start_after_an_abort() {
    let rig = Rig::new(ScanKind::Fly).await;
    rig.registry().put("NumAngles", 1000i64).await.unwrap();
    let sequencer = rig.sequencer.clone();
    let scan = tokio::spawn(async move { sequencer.run_scan(Arc::new(AlwaysOverwrite)).await });
    rig.sequencer
        .subscribe_status()
        .wait_for(|s| *s == ScanStatus::CollectingProjections)
        .await
        .unwrap();
    rig.sequencer.abort().await.unwrap();
    assert_eq!(scan.await.unwrap().unwrap().status, ScanStatus::Aborted);

    rig.registry().put("NumAngles", 10i64).await.unwrap();
    let outcome = rig
        .sequencer
        .run_scan(Arc::new(AlwaysOverwrite))
        .await
        .unwrap();
    assert!(outcome.is_complete(), "{:?}", outcome.error);
}

#[tokio::test(start_paused = true)]
async fn a_second_scan_is_refused_while_the_abort_cleans_up() {
    let rig = Rig::new(ScanKind::Fly).await;
    rig.registry().put("NumAngles", 1000i64).await.unwrap();
    let sequencer = rig.sequencer.clone();
    let scan = tokio::spawn(async move { sequencer.run_scan(Arc::new(AlwaysOverwrite)).await });
    rig.sequencer
        .subscribe_status()
        .wait_for(|s| *s == ScanStatus::CollectingProjections)
        .await
        .unwrap();

    let control = rig.sequencer.control().clone();
    control.request_abort();
    assert!(!control.is_running());
    assert!(control.in_scan());
    let refused = rig.sequencer.run_scan(Arc::new(AlwaysOverwrite)).await;
    assert!(matches!(refused, Err(ScanError::Busy)));

    let outcome = scan.await.unwrap().unwrap();
    assert_eq!(outcome.status, ScanStatus::Aborted);
    assert!(matches!(outcome.error, Some(ScanError::Aborted)));
    assert_eq!(outcome.cleanup.len(), 11);
    assert!(!control.in_scan());
}
