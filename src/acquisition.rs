//! The dynamic acquisition state machine.
//!
//! `Idle -> Initializing -> Interacting -> Stabilizing -> Evaluating ->
//! (Interacting | Terminated)`. Every transition is a match arm in
//! [`AcquisitionLoop::drive`], and every wait on the driver is raced against the
//! run's cancellation token and the per-site deadline.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::driver::{CapturedContent, InteractionDriver};
use crate::fingerprint::Fingerprint;
use crate::models::{
    AcquisitionResult, ContentSnapshot, InteractionConfig, StagnationMode, StepAction, TerminationReason,
    MAX_SITE_TIMEOUT_SECONDS,
};
use crate::utils::error::AppError;

#[derive(Debug, Clone, PartialEq)]
pub enum LoopState {
    Idle,
    Initializing,
    Interacting,
    Stabilizing(StepAction),
    Evaluating(StepAction, CapturedContent),
    Terminated(TerminationReason),
}

impl LoopState {
    pub fn name(&self) -> &'static str {
        match self {
            LoopState::Idle => "idle",
            LoopState::Initializing => "initializing",
            LoopState::Interacting => "interacting",
            LoopState::Stabilizing(_) => "stabilizing",
            LoopState::Evaluating(..) => "evaluating",
            LoopState::Terminated(_) => "terminated",
        }
    }
}

enum Guarded<T> {
    Done(T),
    Interrupted(TerminationReason),
}

/// Mutable bookkeeping for one site's run. Dropped when the result is built.
#[derive(Default)]
struct Progress {
    snapshots: Vec<ContentSnapshot>,
    seen: HashSet<Fingerprint>,
    exhausted: HashSet<String>,
    actions: Vec<StepAction>,
    interactions: u32,
    stagnant: u32,
}

impl Progress {
    /// Returns true when the capture showed content not seen before.
    fn record(&mut self, captured: CapturedContent, step: u32, fallback_url: &str) -> bool {
        if !self.seen.insert(captured.fingerprint.clone()) {
            return false;
        }
        let source_url = if captured.url.is_empty() {
            fallback_url.to_string()
        } else {
            captured.url
        };
        self.snapshots.push(ContentSnapshot {
            fingerprint: captured.fingerprint,
            raw_content: captured.raw_content,
            captured_at_step: step,
            source_url,
        });
        true
    }

    fn remaining_targets(&self, targets: &[String]) -> Vec<String> {
        targets
            .iter()
            .filter(|t| !self.exhausted.contains(*t))
            .cloned()
            .collect()
    }

    fn finish(self, reason: TerminationReason) -> AcquisitionResult {
        AcquisitionResult {
            snapshots: self.snapshots,
            interactions_performed: self.interactions,
            termination_reason: reason,
            actions: self.actions,
        }
    }
}

pub struct AcquisitionLoop {
    site_id: String,
    entry_url: String,
    config: InteractionConfig,
    cancel: CancellationToken,
}

impl AcquisitionLoop {
    pub fn new(
        site_id: impl Into<String>,
        entry_url: impl Into<String>,
        config: InteractionConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            site_id: site_id.into(),
            entry_url: entry_url.into(),
            config,
            cancel,
        }
    }

    /// Drive `driver` to termination. The driver is closed before returning,
    /// whatever the termination reason.
    pub async fn run(&self, driver: &mut dyn InteractionDriver) -> AcquisitionResult {
        let started = Instant::now();
        let deadline = started
            .checked_add(self.config.site_timeout())
            .unwrap_or_else(|| started + Duration::from_secs(MAX_SITE_TIMEOUT_SECONDS));
        let mut progress = Progress::default();

        let reason = self.drive(driver, &mut progress, deadline).await;
        driver.close().await;

        metrics::counter!("harvest_snapshots_total").increment(progress.snapshots.len() as u64);
        metrics::counter!("harvest_interactions_total").increment(u64::from(progress.interactions));

        info!(
            site = %self.site_id,
            reason = %reason,
            snapshots = progress.snapshots.len(),
            interactions = progress.interactions,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Acquisition finished"
        );

        progress.finish(reason)
    }

    async fn drive(
        &self,
        driver: &mut dyn InteractionDriver,
        progress: &mut Progress,
        deadline: Instant,
    ) -> TerminationReason {
        let config = &self.config;
        let mut state = LoopState::Idle;

        loop {
            debug!(site = %self.site_id, state = state.name(), step = progress.interactions, "Loop state");

            state = match state {
                LoopState::Idle => LoopState::Initializing,

                LoopState::Initializing => {
                    let init = driver.initialize(
                        &self.entry_url,
                        config.wait_for_selector.as_deref(),
                        config.navigation_timeout(),
                    );
                    match self.guarded(deadline, init).await {
                        Guarded::Done(Ok(())) => {}
                        Guarded::Done(Err(e)) => {
                            warn!(site = %self.site_id, error = %e, "Initialization failed");
                            return TerminationReason::InitFailed;
                        }
                        Guarded::Interrupted(reason) => return reason,
                    }

                    match self.guarded(deadline, driver.capture_snapshot(config.stabilization_wait())).await {
                        Guarded::Done(Ok(captured)) => {
                            self.note_stabilization(&captured, 0);
                            progress.record(captured, 0, &self.entry_url);
                            LoopState::Interacting
                        }
                        Guarded::Done(Err(e)) => {
                            warn!(site = %self.site_id, error = %e, "Initial capture failed");
                            LoopState::Terminated(TerminationReason::InitFailed)
                        }
                        Guarded::Interrupted(reason) => LoopState::Terminated(reason),
                    }
                }

                LoopState::Interacting => {
                    let candidates = progress.remaining_targets(&config.click_targets);
                    if candidates.is_empty() && !config.scroll_enabled {
                        LoopState::Terminated(TerminationReason::NoFurtherAction)
                    } else {
                        let step = driver.perform_step(&candidates, config.scroll_enabled);
                        let action = match self.guarded(deadline, step).await {
                            Guarded::Done(Ok(action)) => action,
                            Guarded::Done(Err(e)) => {
                                warn!(site = %self.site_id, error = %e, "Interaction step failed");
                                StepAction::None
                            }
                            Guarded::Interrupted(reason) => return reason,
                        };

                        if action.is_none() {
                            LoopState::Terminated(TerminationReason::NoFurtherAction)
                        } else {
                            progress.interactions += 1;
                            progress.actions.push(action.clone());
                            debug!(site = %self.site_id, step = progress.interactions, action = %action, "Step performed");
                            LoopState::Stabilizing(action)
                        }
                    }
                }

                LoopState::Stabilizing(action) => {
                    let capture = driver.capture_snapshot(config.stabilization_wait());
                    match self.guarded(deadline, capture).await {
                        Guarded::Done(Ok(captured)) => LoopState::Evaluating(action, captured),
                        Guarded::Done(Err(e)) => {
                            warn!(site = %self.site_id, error = %e, "Capture failed after interaction");
                            LoopState::Terminated(TerminationReason::NoFurtherAction)
                        }
                        Guarded::Interrupted(reason) => LoopState::Terminated(reason),
                    }
                }

                LoopState::Evaluating(action, captured) => {
                    let step = progress.interactions;
                    self.note_stabilization(&captured, step);
                    let short = captured.fingerprint.short().to_string();

                    if progress.record(captured, step, &self.entry_url) {
                        debug!(site = %self.site_id, step, fingerprint = %short, "New content");
                        if config.stagnation_mode == StagnationMode::Consecutive {
                            progress.stagnant = 0;
                        }
                    } else {
                        progress.stagnant += 1;
                        debug!(site = %self.site_id, step, stagnant = progress.stagnant, "Duplicate content");
                        if let StepAction::Clicked(selector) = action {
                            progress.exhausted.insert(selector);
                        }
                    }

                    if progress.interactions >= config.max_interactions {
                        LoopState::Terminated(TerminationReason::MaxInteractions)
                    } else if progress.stagnant >= config.stagnation_threshold {
                        LoopState::Terminated(TerminationReason::StagnantLimit)
                    } else {
                        LoopState::Interacting
                    }
                }

                LoopState::Terminated(reason) => return reason,
            };
        }
    }

    /// Race a driver call against cancellation and the site deadline.
    async fn guarded<F: Future>(&self, deadline: Instant, fut: F) -> Guarded<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Guarded::Interrupted(TerminationReason::Cancelled),
            _ = tokio::time::sleep_until(deadline) => Guarded::Interrupted(TerminationReason::SiteTimeout),
            output = fut => Guarded::Done(output),
        }
    }

    fn note_stabilization(&self, captured: &CapturedContent, step: u32) {
        if !captured.stabilized {
            let error = AppError::StabilizationTimeout {
                seconds: self.config.stabilization_wait().as_secs_f64(),
            };
            warn!(site = %self.site_id, step, error = %error, "Keeping best-effort capture");
        }
    }
}
