use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use clinic_harvest::config::OrchestratorConfig;
use clinic_harvest::models::{AcquisitionStrategy, SiteConfig, StagnationMode, StrategyKind, TerminationReason};
use clinic_harvest::utils::error::AppError;
use clinic_harvest::SiteOrchestrator;

use super::*;

#[tokio::test]
async fn test_init_failure_does_not_stop_the_batch() {
    let launcher = Arc::new(FakeLauncher::new(vec![
        ("broken", PageScript { init_fails: true, ..PageScript::page("never seen") }),
        ("healthy", PageScript::page("Botox 50 units").click(".tab", "Filler 1cc")),
    ]));
    let log = launcher.log.clone();
    let orchestrator = create_orchestrator(launcher, 2);

    let sites = vec![
        spa_site("broken", interaction(&[".tab"], false)),
        spa_site("healthy", interaction(&[".tab"], false)),
    ];
    let report = orchestrator.run(sites, CancellationToken::new()).await.unwrap();

    let broken = &report.sites["broken"];
    assert_eq!(broken.termination_reason, Some(TerminationReason::InitFailed));
    assert_eq!(broken.snapshots_collected, 0);
    assert!(broken.records.is_empty());
    assert!(!broken.is_success());

    let healthy = &report.sites["healthy"];
    assert!(healthy.is_success());
    assert_eq!(healthy.snapshots_collected, 2);
    assert_eq!(healthy.record_count(), 2);

    assert_eq!(log.launched(), 2);
    assert_eq!(log.closed(), 2);
}

#[tokio::test]
async fn test_cap_of_one_runs_sessions_strictly_in_sequence() {
    let scripts = ["a", "b", "c"]
        .iter()
        .map(|id| (*id, PageScript::page(&format!("{} price list", id)).slow(Duration::from_millis(20))))
        .collect();
    let launcher = Arc::new(FakeLauncher::new(scripts));
    let log = launcher.log.clone();
    let orchestrator = create_orchestrator(launcher, 1);

    let sites = ["a", "b", "c"]
        .iter()
        .map(|id| spa_site(id, interaction(&[], true)))
        .collect();
    orchestrator.run(sites, CancellationToken::new()).await.unwrap();

    assert_eq!(log.max_active(), 1);
    let events = log.events();
    assert_eq!(events.len(), 6);
    for pair in events.chunks(2) {
        let launched = pair[0].strip_prefix("launch:").unwrap();
        assert_eq!(pair[1], format!("close:{}", launched));
    }
}

#[tokio::test]
async fn test_concurrency_cap_is_respected() {
    let ids = ["s1", "s2", "s3", "s4", "s5"];
    let scripts = ids
        .iter()
        .map(|id| (*id, PageScript::page(id).slow(Duration::from_millis(30))))
        .collect();
    let launcher = Arc::new(FakeLauncher::new(scripts));
    let log = launcher.log.clone();
    let orchestrator = create_orchestrator(launcher, 2);

    let sites = ids.iter().map(|id| spa_site(id, interaction(&[], true))).collect();
    let report = orchestrator.run(sites, CancellationToken::new()).await.unwrap();

    assert_eq!(report.sites.len(), 5);
    assert!(log.max_active() <= 2);
    assert_eq!(log.launched(), log.closed());
}

#[tokio::test]
async fn test_click_scenario_through_orchestrator() {
    let launcher = Arc::new(FakeLauncher::new(vec![(
        "ppeum",
        PageScript::page("X").click("a", "Y").click("b", "Z"),
    )]));
    let orchestrator = create_orchestrator(launcher, 1);

    let mut plan = interaction(&["a", "b"], false);
    plan.stagnation_mode = StagnationMode::Cumulative;
    let report = orchestrator
        .run(vec![spa_site("ppeum", plan)], CancellationToken::new())
        .await
        .unwrap();

    let site = &report.sites["ppeum"];
    assert_eq!(site.snapshots_collected, 3);
    assert_eq!(site.interactions_performed, 4);
    assert_eq!(site.termination_reason, Some(TerminationReason::StagnantLimit));
    let names: Vec<&str> = site.records.iter().map(|r| r.product_name.as_str()).collect();
    assert_eq!(names, vec!["X", "Y", "Z"]);
}

#[tokio::test]
async fn test_extraction_failures_are_recorded_per_snapshot() {
    let launcher = Arc::new(FakeLauncher::new(vec![(
        "mixed",
        PageScript::page("Ulthera 300 lines").click(".next", "broken page"),
    )]));
    let orchestrator = create_orchestrator(launcher, 1);

    let report = orchestrator
        .run(vec![spa_site("mixed", interaction(&[".next"], false))], CancellationToken::new())
        .await
        .unwrap();

    let site = &report.sites["mixed"];
    assert!(site.is_success());
    assert_eq!(site.record_count(), 1);
    assert_eq!(site.extraction_failures.len(), 1);
    assert_eq!(site.extraction_failures[0].captured_at_step, 1);
    assert_eq!(report.summary().extraction_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_releases_every_session() {
    let launcher = Arc::new(FakeLauncher::new(vec![
        ("slow1", PageScript::page("one").slow(Duration::from_secs(30))),
        ("slow2", PageScript::page("two").slow(Duration::from_secs(30))),
    ]));
    let log = launcher.log.clone();
    let orchestrator = create_orchestrator(launcher, 2);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let sites = vec![
        spa_site("slow1", interaction(&[], true)),
        spa_site("slow2", interaction(&[], true)),
    ];
    let report = orchestrator.run(sites, cancel).await.unwrap();

    assert!(report.cancelled);
    for site in report.sites.values() {
        assert_eq!(site.termination_reason, Some(TerminationReason::Cancelled));
        // the first capture never finished, so there is nothing to extract
        assert_eq!(site.snapshots_collected, 0);
        assert!(site.records.is_empty());
    }
    assert_eq!(log.launched(), 2);
    assert_eq!(log.closed(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_site_still_extracts_captured_snapshots() {
    let launcher = Arc::new(FakeLauncher::new(vec![(
        "lazy",
        PageScript {
            endless_scroll: true,
            ..PageScript::page("Botox 50 units")
        }
        .slow(Duration::from_secs(2)),
    )]));
    let log = launcher.log.clone();
    let orchestrator = create_orchestrator(launcher, 1);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });

    let mut plan = interaction(&[], true);
    plan.max_interactions = 50;
    let report = orchestrator.run(vec![spa_site("lazy", plan)], cancel).await.unwrap();

    let site = &report.sites["lazy"];
    assert_eq!(site.termination_reason, Some(TerminationReason::Cancelled));
    // captures land at 2s and 4s, the third is cut off at 5s
    assert_eq!(site.snapshots_collected, 2);
    assert_eq!(site.record_count(), 2);
    assert!(site.extraction_failures.is_empty());
    assert_eq!(log.closed(), 1);
}

#[tokio::test]
async fn test_products_repeated_across_snapshots_are_kept_once() {
    let launcher = Arc::new(FakeLauncher::new(vec![(
        "tabs",
        PageScript::page("Botox|Filler").click(".skin", "Botox|Skin booster"),
    )]));
    let orchestrator = create_orchestrator(launcher, 1);

    let report = orchestrator
        .run(vec![spa_site("tabs", interaction(&[".skin"], false))], CancellationToken::new())
        .await
        .unwrap();

    let site = &report.sites["tabs"];
    assert_eq!(site.snapshots_collected, 2);
    let names: Vec<&str> = site.records.iter().map(|r| r.product_name.as_str()).collect();
    assert_eq!(names, vec!["Botox", "Filler", "Skin booster"]);
    // the surviving record comes from the first snapshot that showed it
    assert_eq!(site.records[0].captured_at_step, 0);
}

#[tokio::test(start_paused = true)]
async fn test_run_timeout_cancels_remaining_work() {
    let launcher = Arc::new(FakeLauncher::new(vec![(
        "endless",
        PageScript::page("slow").slow(Duration::from_secs(20)),
    )]));
    let log = launcher.log.clone();
    let config = OrchestratorConfig {
        run_timeout_seconds: 5,
        ..orchestrator_config(1)
    };
    let orchestrator = SiteOrchestrator::new(launcher, reqwest::Client::new(), &config, &http_config());

    let report = orchestrator
        .run(vec![spa_site("endless", interaction(&[], true))], CancellationToken::new())
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.sites["endless"].termination_reason, Some(TerminationReason::Cancelled));
    assert_eq!(log.closed(), 1);
}

#[tokio::test]
async fn test_browser_launch_failure_aborts_run() {
    let mut launcher = FakeLauncher::new(vec![("a", PageScript::page("a"))]);
    launcher.fail_launch = true;
    let orchestrator = create_orchestrator(Arc::new(launcher), 1);

    let result = orchestrator
        .run(vec![spa_site("a", interaction(&[], false))], CancellationToken::new())
        .await;

    assert!(matches!(result, Err(AppError::BrowserLaunch(_))));
}

#[tokio::test]
async fn test_static_list_site_through_orchestrator() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/price"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<p>Shrink 300 shots</p>"))
        .mount(&server)
        .await;

    let launcher = Arc::new(FakeLauncher::new(vec![]));
    let log = launcher.log.clone();
    let orchestrator = create_orchestrator(launcher, 1);
    let site = SiteConfig {
        id: "gu_clinic".to_string(),
        site_name: "GU Clinic".to_string(),
        base_url: server.uri(),
        user_agent: None,
        rate_limit_seconds: 0.0,
        acquisition: AcquisitionStrategy::StaticList {
            urls: vec![format!("{}/price", server.uri()), format!("{}/missing", server.uri())],
        },
    };

    let report = orchestrator.run(vec![site], CancellationToken::new()).await.unwrap();

    let site = &report.sites["gu_clinic"];
    assert_eq!(site.strategy, StrategyKind::StaticList);
    assert_eq!(site.termination_reason, Some(TerminationReason::Completed));
    assert_eq!(site.snapshots_collected, 1);
    assert_eq!(site.record_count(), 1);
    // no browser for plain pages
    assert_eq!(log.launched(), 0);
}

#[tokio::test]
async fn test_sitemap_site_without_sitemap_is_recorded_as_failure() {
    let server = MockServer::start().await;
    let orchestrator = create_orchestrator(Arc::new(FakeLauncher::new(vec![])), 1);
    let site = SiteConfig {
        id: "beauty_leader".to_string(),
        site_name: "Beauty Leader".to_string(),
        base_url: server.uri(),
        user_agent: None,
        rate_limit_seconds: 0.0,
        acquisition: AcquisitionStrategy::Sitemap {
            priority_keywords: vec!["treatment".to_string()],
            exclude_patterns: vec![],
            max_urls: 10,
        },
    };

    let report = orchestrator.run(vec![site], CancellationToken::new()).await.unwrap();

    let site = &report.sites["beauty_leader"];
    assert!(!site.is_success());
    assert!(site.error.as_deref().unwrap().contains("sitemap"));
    assert_eq!(report.summary().sites_failed, 1);
}
