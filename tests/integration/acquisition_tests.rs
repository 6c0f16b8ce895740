use std::time::Duration;
use tokio_util::sync::CancellationToken;

use clinic_harvest::models::{TerminationReason, StepAction};
use clinic_harvest::{AcquisitionLoop, SessionLauncher};

use super::*;

async fn run_site(launcher: &FakeLauncher, site: &SiteConfig, cancel: CancellationToken) -> clinic_harvest::models::AcquisitionResult {
    let AcquisitionStrategy::SpaDynamic { interaction, .. } = &site.acquisition else {
        panic!("expected a dynamic site");
    };
    let mut driver = launcher.launch(site).await.unwrap();
    AcquisitionLoop::new(&site.id, site.entry_url(), interaction.clone(), cancel)
        .run(driver.as_mut())
        .await
}

#[tokio::test]
async fn test_endless_scroll_stops_at_max_interactions() {
    let launcher = FakeLauncher::new(vec![(
        "lazy",
        PageScript {
            endless_scroll: true,
            ..PageScript::page("first rows")
        },
    )]);
    let site = spa_site("lazy", interaction(&[], true));

    let result = run_site(&launcher, &site, CancellationToken::new()).await;

    assert_eq!(result.termination_reason, TerminationReason::MaxInteractions);
    assert_eq!(result.interactions_performed, 5);
    assert_eq!(result.snapshots.len(), 6);
    assert!(result.actions.iter().all(|a| *a == StepAction::Scrolled));
    assert_eq!(launcher.log.closed(), 1);
}

#[tokio::test]
async fn test_session_closed_after_init_failure() {
    let launcher = FakeLauncher::new(vec![(
        "down",
        PageScript {
            init_fails: true,
            ..PageScript::page("unused")
        },
    )]);
    let site = spa_site("down", interaction(&[".tab"], true));

    let result = run_site(&launcher, &site, CancellationToken::new()).await;

    assert_eq!(result.termination_reason, TerminationReason::InitFailed);
    assert!(result.snapshots.is_empty());
    assert_eq!(launcher.log.launched(), 1);
    assert_eq!(launcher.log.closed(), 1);
}

#[tokio::test]
async fn test_static_page_stagnates_under_scrolling() {
    let launcher = FakeLauncher::new(vec![("flat", PageScript::page("one price table"))]);
    let site = spa_site("flat", interaction(&[], true));

    let result = run_site(&launcher, &site, CancellationToken::new()).await;

    assert_eq!(result.termination_reason, TerminationReason::StagnantLimit);
    assert_eq!(result.snapshots.len(), 1);
    assert_eq!(result.interactions_performed, 2);
}

#[tokio::test(start_paused = true)]
async fn test_site_timeout_closes_session() {
    let launcher = FakeLauncher::new(vec![(
        "stuck",
        PageScript::page("loading").slow(Duration::from_secs(60)),
    )]);
    let mut plan = interaction(&[], true);
    plan.site_timeout_seconds = 30;
    let site = spa_site("stuck", plan);

    let result = run_site(&launcher, &site, CancellationToken::new()).await;

    assert_eq!(result.termination_reason, TerminationReason::SiteTimeout);
    assert!(result.snapshots.is_empty());
    assert_eq!(launcher.log.closed(), 1);
}

#[tokio::test]
async fn test_snapshots_keep_step_order_and_distinct_content() {
    let launcher = FakeLauncher::new(vec![(
        "tabs",
        PageScript::page("face").click(".body", "body").click(".hair", "hair"),
    )]);
    let mut plan = interaction(&[".body", ".hair"], false);
    plan.max_interactions = 10;
    let site = spa_site("tabs", plan);

    let result = run_site(&launcher, &site, CancellationToken::new()).await;

    let steps: Vec<u32> = result.snapshots.iter().map(|s| s.captured_at_step).collect();
    assert_eq!(steps, vec![0, 1, 3]);
    let mut fingerprints: Vec<_> = result.snapshots.iter().map(|s| s.fingerprint.clone()).collect();
    fingerprints.dedup();
    assert_eq!(fingerprints.len(), 3);
    assert!(result.snapshots.iter().all(|s| s.source_url == "https://tabs.test/"));
}
