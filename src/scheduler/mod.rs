// Stage scheduler
//
// Realizes the configured stages in order: each stage ramps its population
// up at a fixed cadence under a stage-scoped cancellation token that fires
// when the stage's hold time (counted from the start of ramp-up) runs out,
// then cancels and drains every session it spawned.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::accounts::CredentialPool;
use crate::config::{ScheduleSettings, SessionConfig, StageSpec};
use crate::session::{SessionContext, SessionState, WorkerSession};
use crate::stats::{MetricsAggregator, StatsCounters};
use crate::tracker::spawn_sweeper;

/// Session ids of stage `n` start at `n * SESSION_ID_STRIDE + 1`.
pub const SESSION_ID_STRIDE: u64 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RampPlan {
    pub window: Duration,
    pub interval: Duration,
}

/// Ramp window is the configured ramp-up, or half the stage when the stage
/// is shorter than that. Sessions are spread evenly over it, never closer
/// than `min_spawn_interval`.
pub fn ramp_plan(population: u32, hold: Duration, settings: &ScheduleSettings) -> RampPlan {
    let window = if hold < settings.ramp_up {
        hold / 2
    } else {
        settings.ramp_up
    };
    let interval = if population == 0 {
        settings.min_spawn_interval
    } else {
        (window / population).max(settings.min_spawn_interval)
    };
    RampPlan { window, interval }
}

pub fn session_id(stage_index: usize, ordinal: u32) -> u64 {
    stage_index as u64 * SESSION_ID_STRIDE + ordinal as u64 + 1
}

/// Where each session's configuration comes from.
#[derive(Debug, Clone)]
pub enum SessionSource {
    /// Every session uses the same credential.
    Shared(SessionConfig),
    /// Sessions take credentials round-robin from a pool of logged-in accounts.
    Pooled {
        base: SessionConfig,
        pool: Arc<CredentialPool>,
    },
}

impl SessionSource {
    fn config_for_next(&self) -> SessionConfig {
        match self {
            SessionSource::Shared(config) => config.clone(),
            SessionSource::Pooled { base, pool } => base.with_credential(pool.next_credential().clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub label: String,
    pub population: u32,
    pub spawned: u32,
    pub closed: u32,
    pub failed: u32,
    /// Counter movement while the stage ran.
    pub counters: StatsCounters,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub stages: Vec<StageReport>,
    pub elapsed: Duration,
    pub cancelled: bool,
    /// Probes still unanswered when the run ended; also counted as lost.
    pub abandoned_probes: usize,
}

impl RunOutcome {
    pub fn total_sessions(&self) -> u64 {
        self.stages.iter().map(|s| s.spawned as u64).sum()
    }
}

pub struct StageScheduler {
    stages: Vec<StageSpec>,
    settings: ScheduleSettings,
    source: SessionSource,
    ctx: SessionContext,
}

impl StageScheduler {
    pub fn new(
        stages: Vec<StageSpec>,
        settings: ScheduleSettings,
        source: SessionSource,
        ctx: SessionContext,
    ) -> Self {
        Self {
            stages,
            settings,
            source,
            ctx,
        }
    }

    pub fn stats(&self) -> &Arc<MetricsAggregator> {
        &self.ctx.stats
    }

    /// Run every stage in order. Cancelling `cancel` ends the current stage
    /// early, skips the rest and still drains every session.
    pub async fn run(&self, cancel: CancellationToken) -> RunOutcome {
        let started = Instant::now();
        let sweep_token = cancel.child_token();
        let sweeper = spawn_sweeper(
            Arc::clone(&self.ctx.tracker),
            Arc::clone(&self.ctx.stats),
            self.settings.pending_timeout,
            sweep_token.clone(),
        );

        let mut reports = Vec::with_capacity(self.stages.len());
        for (index, stage) in self.stages.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            reports.push(self.run_stage(index, stage, &cancel).await);

            let last = index + 1 == self.stages.len();
            if !last && !cancel.is_cancelled() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.settings.stage_pause) => {}
                }
            }
        }

        sweep_token.cancel();
        if let Err(e) = sweeper.await {
            warn!(error = %e, "sweeper task failed");
        }
        let abandoned = self.ctx.tracker.drain();
        if abandoned > 0 {
            self.ctx.stats.record_lost(abandoned as u64);
        }

        RunOutcome {
            stages: reports,
            elapsed: started.elapsed(),
            cancelled: cancel.is_cancelled(),
            abandoned_probes: abandoned,
        }
    }

    async fn run_stage(&self, index: usize, stage: &StageSpec, cancel: &CancellationToken) -> StageReport {
        let stats = &self.ctx.stats;
        let hold = stage.hold_duration();
        let plan = ramp_plan(stage.population, hold, &self.settings);
        info!(
            stage = %stage.label,
            population = stage.population,
            hold_secs = stage.hold_secs,
            spawn_interval_us = plan.interval.as_micros() as u64,
            "stage starting"
        );

        stats.set_current_stage(index + 1);
        let stage_token = cancel.child_token();
        let started = Instant::now();
        let before = stats.counters();
        let deadline = spawn_deadline(stage_token.clone(), started + hold);
        let progress = spawn_progress(
            Arc::clone(stats),
            format!("Stage {}: {}", index + 1, stage.label),
            self.settings.progress_interval,
            stage_token.clone(),
        );

        let mut sessions = JoinSet::new();
        let mut spawned: u32 = 0;
        for ordinal in 0..stage.population {
            if ordinal > 0 {
                tokio::select! {
                    _ = stage_token.cancelled() => break,
                    _ = tokio::time::sleep(plan.interval) => {}
                }
            }
            if stage_token.is_cancelled() {
                break;
            }
            let session = WorkerSession::new(
                session_id(index, ordinal),
                self.source.config_for_next(),
                self.ctx.clone(),
            );
            sessions.spawn(session.run(stage_token.child_token()));
            spawned += 1;
        }
        debug!(stage = %stage.label, spawned, elapsed_ms = started.elapsed().as_millis() as u64, "ramp-up finished");

        stage_token.cancelled().await;

        let mut closed = 0;
        let mut failed = 0;
        while let Some(joined) = sessions.join_next().await {
            match joined {
                Ok(outcome) if outcome.final_state == SessionState::Failed => failed += 1,
                Ok(_) => closed += 1,
                Err(e) => {
                    warn!(stage = %stage.label, error = %e, "session task aborted");
                    failed += 1;
                }
            }
        }
        let _ = deadline.await;
        let _ = progress.await;

        let report = StageReport {
            label: stage.label.clone(),
            population: stage.population,
            spawned,
            closed,
            failed,
            counters: stats.counters().since(&before),
            elapsed: started.elapsed(),
        };
        info!(
            stage = %report.label,
            spawned = report.spawned,
            failed = report.failed,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "stage finished"
        );
        report
    }
}

/// Cancel `token` at `deadline` unless it is cancelled first.
fn spawn_deadline(token: CancellationToken, deadline: Instant) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep_until(deadline) => token.cancel(),
        }
    })
}

fn spawn_progress(
    stats: Arc<MetricsAggregator>,
    label: String,
    period: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => stats.display_progress(&label),
            }
        }
    })
}
