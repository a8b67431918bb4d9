//! Periodic batch worker: settlement resolver passes, payout reconciliation,
//! and ledger/registry cleanups. Jobs are also runnable one-shot from the
//! CLI for operations and backfills.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use pact_core::{batch, CoreError, Engine};

pub const JOB_CLOSE_PARTICIPATIONS: &str = "close-participations";
pub const JOB_UPDATE_SETTLEMENTS: &str = "update-settlements";
pub const JOB_RECONCILE_PAYOUTS: &str = "reconcile-payouts";
pub const JOB_CLEANUP_IDEMPOTENCY: &str = "cleanup-idempotency";
pub const JOB_CLEANUP_SESSIONS: &str = "cleanup-sessions";
pub const JOB_STATS: &str = "stats";

pub const ALL_JOBS: &[&str] = &[
    JOB_CLOSE_PARTICIPATIONS,
    JOB_UPDATE_SETTLEMENTS,
    JOB_RECONCILE_PAYOUTS,
    JOB_CLEANUP_IDEMPOTENCY,
    JOB_CLEANUP_SESSIONS,
    JOB_STATS,
];

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Cadence of the payout reconciliation sweep.
    pub reconcile_interval: StdDuration,
    /// Payouts examined per sweep.
    pub reconcile_batch: i64,
    /// UTC (hour, minute) the participation-closing pass runs.
    pub close_participations_at: (u32, u32),
    /// UTC (hour, minute) the settlement-propagation pass runs, after the
    /// closing pass.
    pub update_settlements_at: (u32, u32),
    /// UTC (hour, minute) revoked-session retention is enforced.
    pub cleanup_sessions_at: (u32, u32),
    /// Cadence of the idempotency sweep.
    pub hourly_interval: StdDuration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: StdDuration::from_secs(60),
            reconcile_batch: 100,
            close_participations_at: (0, 5),
            update_settlements_at: (0, 10),
            cleanup_sessions_at: (3, 0),
            hourly_interval: StdDuration::from_secs(60 * 60),
        }
    }
}

/// Time until the next wall-clock `hour:minute` in UTC. An anchor exactly at
/// `now` waits a full day, so a job never runs twice in one pass.
fn delay_until(now: DateTime<Utc>, hour: u32, minute: u32) -> StdDuration {
    let anchor = now
        .date_naive()
        .and_hms_opt(hour.min(23), minute.min(59), 0)
        .unwrap_or_else(|| now.naive_utc())
        .and_utc();
    let next = if anchor > now {
        anchor
    } else {
        anchor + chrono::Duration::days(1)
    };
    (next - now).to_std().unwrap_or_default()
}

/// Run one named job to completion.
pub async fn run_job(engine: &Engine, job: &str, batch_size: i64) -> Result<(), CoreError> {
    let store = engine.store();
    match job {
        JOB_CLOSE_PARTICIPATIONS => {
            batch::close_participations(&store, Utc::now().date_naive()).await?;
        }
        JOB_UPDATE_SETTLEMENTS => {
            batch::update_settlements(&store).await?;
        }
        JOB_RECONCILE_PAYOUTS => {
            batch::reconcile_payouts(&store, &engine.provider(), batch_size).await?;
        }
        JOB_CLEANUP_IDEMPOTENCY => {
            batch::cleanup_idempotency(&store).await?;
        }
        JOB_CLEANUP_SESSIONS => {
            batch::cleanup_sessions(&store).await?;
        }
        JOB_STATS => {
            batch::stats(&store).await?;
        }
        other => {
            return Err(CoreError::Validation(format!(
                "unknown job '{other}'; expected one of: {}",
                ALL_JOBS.join(", ")
            )));
        }
    }
    Ok(())
}

/// Run every job once, in dependency order (participations close before
/// settlements propagate).
pub async fn run_all_once(engine: &Engine, batch_size: i64) -> Result<(), CoreError> {
    for job in ALL_JOBS {
        run_job(engine, job, batch_size).await?;
    }
    Ok(())
}

fn spawn_loop(
    engine: Engine,
    job: &'static str,
    period: StdDuration,
    batch_size: i64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup stays quiet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            info!(job, "job run starting");
            if let Err(err) = run_job(&engine, job, batch_size).await {
                // A failed run never kills the scheduler.
                error!(job, error = %err, "job run failed");
            }
        }
    })
}

/// Once-a-day loop anchored to a UTC wall-clock time, so settlement passes
/// land just after midnight instead of drifting with process start.
fn spawn_daily_loop(
    engine: Engine,
    job: &'static str,
    at: (u32, u32),
    batch_size: i64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            // Recomputed each pass so slow runs do not shift the anchor.
            tokio::time::sleep(delay_until(Utc::now(), at.0, at.1)).await;
            info!(job, "job run starting");
            if let Err(err) = run_job(&engine, job, batch_size).await {
                // A failed run never kills the scheduler.
                error!(job, error = %err, "job run failed");
            }
        }
    })
}

/// Start the periodic schedulers. Assumes a single active worker instance;
/// the store-level guards keep concurrent runs harmless regardless.
pub fn spawn_schedulers(engine: Engine, config: WorkerConfig) -> Vec<JoinHandle<()>> {
    vec![
        spawn_daily_loop(
            engine.clone(),
            JOB_CLOSE_PARTICIPATIONS,
            config.close_participations_at,
            config.reconcile_batch,
        ),
        spawn_daily_loop(
            engine.clone(),
            JOB_UPDATE_SETTLEMENTS,
            config.update_settlements_at,
            config.reconcile_batch,
        ),
        spawn_loop(
            engine.clone(),
            JOB_RECONCILE_PAYOUTS,
            config.reconcile_interval,
            config.reconcile_batch,
        ),
        spawn_loop(
            engine.clone(),
            JOB_CLEANUP_IDEMPOTENCY,
            config.hourly_interval,
            config.reconcile_batch,
        ),
        spawn_daily_loop(
            engine,
            JOB_CLEANUP_SESSIONS,
            config.cleanup_sessions_at,
            config.reconcile_batch,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ServiceConfig, ServiceState};
    use pact_adapters::MockProvider;
    use std::sync::Arc;

    async fn engine() -> Engine {
        ServiceState::bootstrap(ServiceConfig::default(), Arc::new(MockProvider::new()))
            .await
            .unwrap()
            .engine
    }

    fn at(s: &str) -> chrono::DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn daily_anchor_waits_until_the_configured_time() {
        // Before the anchor: wait the remainder of today.
        let wait = delay_until(at("2024-06-01T00:00:00Z"), 0, 5);
        assert_eq!(wait, StdDuration::from_secs(5 * 60));

        // After the anchor: wait for tomorrow's.
        let wait = delay_until(at("2024-06-01T12:00:00Z"), 3, 0);
        assert_eq!(wait, StdDuration::from_secs(15 * 60 * 60));

        // Exactly at the anchor: a full day, never an immediate re-run.
        let wait = delay_until(at("2024-06-01T00:05:00Z"), 0, 5);
        assert_eq!(wait, StdDuration::from_secs(24 * 60 * 60));
    }

    #[tokio::test]
    async fn every_named_job_runs_on_an_empty_store() {
        let engine = engine().await;
        run_all_once(&engine, 100).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_job_is_rejected() {
        let engine = engine().await;
        let err = run_job(&engine, "compact-the-moon", 100).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn reconcile_job_resolves_issued_payouts() {
        let engine = engine().await;
        let user = engine.login("code-1", "test").await.unwrap();
        let issued = engine
            .issue_payout(&user, "refund", 10_000, None)
            .await
            .unwrap();
        let key = issued["promotionKey"].as_str().unwrap().to_string();

        // Mock jobs look in-flight on the first poll, settle on the second.
        run_job(&engine, JOB_RECONCILE_PAYOUTS, 100).await.unwrap();
        let after_first = engine.store().get_payout(&key).await.unwrap().unwrap();
        assert_eq!(after_first.status.as_str(), "PENDING");

        run_job(&engine, JOB_RECONCILE_PAYOUTS, 100).await.unwrap();
        let after_second = engine.store().get_payout(&key).await.unwrap().unwrap();
        assert_eq!(after_second.status.as_str(), "SUCCESS");
    }
}
