use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde_json::Value;

use crate::error::CoreError;
use crate::provider::PayoutOutcome;
use crate::types::{
    BatchOutcome, BatchStats, Challenge, Participation, Payment, Payout, PayoutWithUser, Proof,
    ProofType, SettlementView, User,
};

/// Fields for a new payment log row.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub user_id: i64,
    pub challenge_id: String,
    pub order_no: String,
    pub amount: i64,
    pub raw: Value,
}

/// Fields for a new payout row; always inserted as `REQUESTED`.
#[derive(Debug, Clone)]
pub struct NewPayout {
    pub user_id: i64,
    pub promotion_code: String,
    pub promotion_key: String,
    pub amount_points: i64,
    pub raw: Value,
}

/// Result of the execute-payment transaction.
#[derive(Debug, Clone)]
pub struct PaymentExecution {
    pub payment: Payment,
    /// Set when this call actually created the participation. A retried
    /// execute that lost the unique-constraint race sees `None` here.
    pub participation_id: Option<i64>,
}

/// Persistence seam for every table in the system.
///
/// Implementations must delegate serialization of the idempotency ledger and
/// the terminal-state fields to the backing store's uniqueness/transaction
/// guarantees, because correctness has to hold across process instances.
#[async_trait]
pub trait Store: Send + Sync {
    async fn ping(&self) -> Result<(), CoreError>;

    // ---- users

    /// Insert-or-fetch by provider user key. The key is immutable; a repeat
    /// call returns the existing row.
    async fn upsert_user(&self, provider_user_key: &str) -> Result<User, CoreError>;

    async fn find_user(&self, provider_user_key: &str) -> Result<Option<User>, CoreError>;

    // ---- challenges

    async fn list_challenges(&self) -> Result<Vec<Challenge>, CoreError>;

    async fn get_challenge(&self, id: &str) -> Result<Option<Challenge>, CoreError>;

    /// Insert catalog entries that do not exist yet; existing rows win.
    async fn seed_challenges(&self, items: &[Challenge]) -> Result<(), CoreError>;

    // ---- payments & participation

    /// Append a `created` payment log row.
    async fn create_payment(&self, new: NewPayment) -> Result<Payment, CoreError>;

    /// The single transactional boundary of the participation lifecycle:
    /// append the `done` payment row (refusing if already executed), insert
    /// the participation with conflict-do-nothing semantics on
    /// (user, challenge, start_date), and insert the paired settlement only
    /// if the participation insert actually happened.
    async fn execute_payment(
        &self,
        order_no: &str,
        today: NaiveDate,
        raw: Value,
    ) -> Result<PaymentExecution, CoreError>;

    /// Latest payment log row for an order number.
    async fn find_payment(&self, order_no: &str) -> Result<Option<Payment>, CoreError>;

    async fn active_participation(
        &self,
        user_id: i64,
        challenge_id: &str,
        today: NaiveDate,
    ) -> Result<Option<Participation>, CoreError>;

    async fn get_participation(&self, id: i64) -> Result<Option<Participation>, CoreError>;

    // ---- proofs

    /// Insert-or-replace the day's proof for a participation and recompute
    /// `proof_count` from the accepted rows.
    async fn upsert_proof(
        &self,
        participation_id: i64,
        user_id: i64,
        challenge_id: &str,
        proof_date: NaiveDate,
        proof_type: ProofType,
        image_hash: &str,
    ) -> Result<Proof, CoreError>;

    /// Accepted proof with this fingerprint from any *other* user.
    async fn find_foreign_proof_by_hash(
        &self,
        image_hash: &str,
        excluding_user_id: i64,
    ) -> Result<Option<Proof>, CoreError>;

    /// Accepted proof with this fingerprint from the *same* user.
    async fn find_own_proof_by_hash(
        &self,
        image_hash: &str,
        user_id: i64,
    ) -> Result<Option<Proof>, CoreError>;

    async fn count_accepted_proofs(&self, participation_id: i64) -> Result<i64, CoreError>;

    // ---- payouts

    async fn insert_payout(&self, new: NewPayout) -> Result<Payout, CoreError>;

    /// Apply a normalized reconciliation outcome. Returns `false` when the
    /// row is missing or already terminal; terminal states are sticky and
    /// never overwritten.
    async fn update_payout_status(
        &self,
        promotion_key: &str,
        outcome: PayoutOutcome,
        raw: Value,
    ) -> Result<bool, CoreError>;

    async fn get_payout(&self, promotion_key: &str) -> Result<Option<Payout>, CoreError>;

    /// Payouts still in {REQUESTED, PENDING}, oldest-updated first, joined
    /// with the owner's provider user key for the reconciler's calls.
    async fn list_unresolved_payouts(&self, limit: i64)
        -> Result<Vec<PayoutWithUser>, CoreError>;

    // ---- settlements

    async fn list_settlements(&self, user_id: i64) -> Result<Vec<SettlementView>, CoreError>;

    // ---- idempotency ledger

    /// Cached response for (scope, key), ignoring expired rows.
    async fn get_idempotency(&self, scope: &str, key: &str) -> Result<Option<Value>, CoreError>;

    /// Insert-or-ignore on the (scope, key) unique constraint. Returns
    /// whether this call inserted the row; a loser must read back the
    /// winner's response instead of re-executing.
    async fn put_idempotency(
        &self,
        scope: &str,
        key: &str,
        response: &Value,
        ttl: Duration,
    ) -> Result<bool, CoreError>;

    // ---- session revocation registry

    /// Idempotent upsert; a repeat revocation refreshes timestamp and reason.
    async fn revoke_session(&self, subject: &str, reason: &str) -> Result<(), CoreError>;

    /// Membership test. The empty subject is never revoked.
    async fn is_session_revoked(&self, subject: &str) -> Result<bool, CoreError>;

    // ---- batch jobs

    /// Settlement resolver pass 1: close active participations whose
    /// end_date is strictly before `today`. Safe to re-run; terminal rows
    /// are excluded by the active-status filter.
    async fn close_expired_participations(
        &self,
        today: NaiveDate,
    ) -> Result<BatchOutcome, CoreError>;

    /// Settlement resolver pass 2: propagate terminal participation status
    /// into still-running settlements, setting refundable on success. Pure
    /// bulk conditional update; naturally idempotent.
    async fn update_settlement_statuses(&self) -> Result<BatchOutcome, CoreError>;

    async fn cleanup_expired_idempotency(&self) -> Result<u64, CoreError>;

    async fn cleanup_revoked_sessions(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, CoreError>;

    async fn batch_stats(&self) -> Result<BatchStats, CoreError>;
}
