use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::CoreError;
use crate::provider::{PaymentProvider, PayoutOutcome};
use crate::store::Store;
use crate::types::{BatchOutcome, BatchStats};

/// Revocations older than this are swept by the session cleanup job.
pub const REVOCATION_RETENTION_DAYS: i64 = 30;

/// Counters from one reconciliation sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileOutcome {
    pub examined: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub still_pending: u64,
    pub skipped: u64,
}

/// Poll the provider for every unresolved payout, oldest-updated first.
///
/// One payout's provider failure is logged and skipped; its row stays
/// untouched for the next sweep. Only a store failure aborts the run.
pub async fn reconcile_payouts(
    store: &Arc<dyn Store>,
    provider: &Arc<dyn PaymentProvider>,
    batch: i64,
) -> Result<ReconcileOutcome, CoreError> {
    let unresolved = store.list_unresolved_payouts(batch).await?;
    let mut outcome = ReconcileOutcome::default();

    for item in unresolved {
        outcome.examined += 1;
        let promotion_key = item.payout.promotion_key.as_str();

        let result = match provider
            .get_execution_result(&item.provider_user_key, promotion_key)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                warn!(promotion_key, error = %err, "payout result poll failed; leaving row for next sweep");
                outcome.skipped += 1;
                continue;
            }
        };

        let normalized = PayoutOutcome::from_result_type(&result.result_type);
        let applied = store
            .update_payout_status(promotion_key, normalized, result.raw)
            .await?;
        if !applied {
            // Another worker resolved it first.
            outcome.skipped += 1;
            continue;
        }
        match normalized {
            PayoutOutcome::Success => outcome.succeeded += 1,
            PayoutOutcome::Fail => outcome.failed += 1,
            PayoutOutcome::Pending => outcome.still_pending += 1,
        }
    }

    info!(
        examined = outcome.examined,
        succeeded = outcome.succeeded,
        failed = outcome.failed,
        still_pending = outcome.still_pending,
        skipped = outcome.skipped,
        "payout reconciliation sweep complete"
    );
    Ok(outcome)
}

/// Settlement resolver pass 1: close participations whose window ended.
pub async fn close_participations(
    store: &Arc<dyn Store>,
    today: NaiveDate,
) -> Result<BatchOutcome, CoreError> {
    let outcome = store.close_expired_participations(today).await?;
    for error in &outcome.errors {
        warn!(%error, "participation close error");
    }
    info!(
        processed = outcome.processed,
        failed = outcome.failed,
        %today,
        "closed expired participations"
    );
    Ok(outcome)
}

/// Settlement resolver pass 2: propagate terminal statuses into settlements.
pub async fn update_settlements(store: &Arc<dyn Store>) -> Result<BatchOutcome, CoreError> {
    let outcome = store.update_settlement_statuses().await?;
    info!(processed = outcome.processed, "settlement statuses updated");
    Ok(outcome)
}

pub async fn cleanup_idempotency(store: &Arc<dyn Store>) -> Result<u64, CoreError> {
    let removed = store.cleanup_expired_idempotency().await?;
    info!(removed, "expired idempotency keys removed");
    Ok(removed)
}

pub async fn cleanup_sessions(store: &Arc<dyn Store>) -> Result<u64, CoreError> {
    let cutoff = Utc::now() - Duration::days(REVOCATION_RETENTION_DAYS);
    let removed = store.cleanup_revoked_sessions(cutoff).await?;
    info!(removed, "old session revocations removed");
    Ok(removed)
}

pub async fn stats(store: &Arc<dyn Store>) -> Result<BatchStats, CoreError> {
    let stats = store.batch_stats().await?;
    info!(
        active_participations = stats.active_participations,
        running_settlements = stats.running_settlements,
        idempotency_keys = stats.idempotency_keys,
        revoked_sessions = stats.revoked_sessions,
        "batch stats"
    );
    Ok(stats)
}
