use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::CoreError;
use crate::provider::PayoutOutcome;
use crate::store::{NewPayment, NewPayout, PaymentExecution, Store};
use crate::types::{
    BatchOutcome, BatchStats, Challenge, Participation, ParticipationStatus, Payment,
    PaymentStatus, Payout, PayoutStatus, PayoutWithUser, Proof, ProofType, Settlement,
    SettlementStatus, SettlementView, User,
};

#[derive(Debug, Clone)]
struct IdemRecord {
    response: Value,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct RevokedEntry {
    reason: String,
    revoked_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    users: Vec<User>,
    challenges: Vec<Challenge>,
    payments: Vec<Payment>,
    participations: Vec<Participation>,
    proofs: Vec<Proof>,
    settlements: Vec<Settlement>,
    payouts: Vec<Payout>,
    idempotency: HashMap<(String, String), IdemRecord>,
    revoked: HashMap<String, RevokedEntry>,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn recount_proofs(&mut self, participation_id: i64) {
        let count = self
            .proofs
            .iter()
            .filter(|p| p.participation_id == participation_id && p.status == "accepted")
            .count() as i32;
        if let Some(participation) = self
            .participations
            .iter_mut()
            .find(|p| p.id == participation_id)
        {
            participation.proof_count = count;
        }
    }
}

/// In-process store used for local mode and tests.
///
/// A single mutex serializes every mutation, which upholds the same
/// invariants the Postgres backend gets from uniqueness constraints and
/// transactions. That only holds within one process: this backend is for
/// single-instance deployments only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), CoreError> {
        Ok(())
    }

    async fn upsert_user(&self, provider_user_key: &str) -> Result<User, CoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(user) = inner
            .users
            .iter()
            .find(|u| u.provider_user_key == provider_user_key)
        {
            return Ok(user.clone());
        }
        let user = User {
            id: inner.next_id(),
            provider_user_key: provider_user_key.to_string(),
            status: "active".to_string(),
            created_at: Utc::now(),
        };
        inner.users.push(user.clone());
        Ok(user)
    }

    async fn find_user(&self, provider_user_key: &str) -> Result<Option<User>, CoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .users
            .iter()
            .find(|u| u.provider_user_key == provider_user_key)
            .cloned())
    }

    async fn list_challenges(&self) -> Result<Vec<Challenge>, CoreError> {
        let inner = self.inner.lock().await;
        let mut items: Vec<Challenge> = inner
            .challenges
            .iter()
            .filter(|c| c.is_active)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(items)
    }

    async fn get_challenge(&self, id: &str) -> Result<Option<Challenge>, CoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.challenges.iter().find(|c| c.id == id).cloned())
    }

    async fn seed_challenges(&self, items: &[Challenge]) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        for item in items {
            if !inner.challenges.iter().any(|c| c.id == item.id) {
                inner.challenges.push(item.clone());
            }
        }
        Ok(())
    }

    async fn create_payment(&self, new: NewPayment) -> Result<Payment, CoreError> {
        let mut inner = self.inner.lock().await;
        let payment = Payment {
            id: inner.next_id(),
            user_id: new.user_id,
            challenge_id: new.challenge_id,
            order_no: new.order_no,
            amount: new.amount,
            status: PaymentStatus::Created,
            raw: new.raw,
            created_at: Utc::now(),
        };
        inner.payments.push(payment.clone());
        Ok(payment)
    }

    async fn execute_payment(
        &self,
        order_no: &str,
        today: NaiveDate,
        raw: Value,
    ) -> Result<PaymentExecution, CoreError> {
        let mut inner = self.inner.lock().await;

        if inner
            .payments
            .iter()
            .any(|p| p.order_no == order_no && p.status == PaymentStatus::Done)
        {
            return Err(CoreError::NotFound(
                "payment not found or already executed".to_string(),
            ));
        }
        let created = inner
            .payments
            .iter()
            .find(|p| p.order_no == order_no && p.status == PaymentStatus::Created)
            .cloned()
            .ok_or_else(|| {
                CoreError::NotFound("payment not found or already executed".to_string())
            })?;

        let days = inner
            .challenges
            .iter()
            .find(|c| c.id == created.challenge_id)
            .map(|c| c.days)
            .ok_or_else(|| {
                CoreError::Store(format!("challenge '{}' missing", created.challenge_id))
            })?;

        let done = Payment {
            id: inner.next_id(),
            user_id: created.user_id,
            challenge_id: created.challenge_id.clone(),
            order_no: created.order_no.clone(),
            amount: created.amount,
            status: PaymentStatus::Done,
            raw,
            created_at: Utc::now(),
        };
        inner.payments.push(done.clone());

        let start_date = today;
        let end_date = start_date + Duration::days(i64::from(days) - 1);

        let exists = inner.participations.iter().any(|p| {
            p.user_id == done.user_id
                && p.challenge_id == done.challenge_id
                && p.start_date == start_date
        });

        let participation_id = if exists {
            None
        } else {
            let participation = Participation {
                id: inner.next_id(),
                user_id: done.user_id,
                challenge_id: done.challenge_id.clone(),
                payment_id: done.id,
                status: ParticipationStatus::Active,
                start_date,
                end_date,
                proof_count: 0,
                created_at: Utc::now(),
            };
            let id = participation.id;
            inner.participations.push(participation);

            let settlement = Settlement {
                id: inner.next_id(),
                participation_id: id,
                user_id: done.user_id,
                challenge_id: done.challenge_id.clone(),
                payment_id: done.id,
                status: SettlementStatus::Running,
                refundable: false,
                deposit_amount: done.amount,
                created_at: Utc::now(),
            };
            inner.settlements.push(settlement);
            Some(id)
        };

        Ok(PaymentExecution {
            payment: done,
            participation_id,
        })
    }

    async fn find_payment(&self, order_no: &str) -> Result<Option<Payment>, CoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .payments
            .iter()
            .filter(|p| p.order_no == order_no)
            .max_by_key(|p| p.id)
            .cloned())
    }

    async fn active_participation(
        &self,
        user_id: i64,
        challenge_id: &str,
        today: NaiveDate,
    ) -> Result<Option<Participation>, CoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .participations
            .iter()
            .find(|p| {
                p.user_id == user_id
                    && p.challenge_id == challenge_id
                    && p.status == ParticipationStatus::Active
                    && p.window_contains(today)
            })
            .cloned())
    }

    async fn get_participation(&self, id: i64) -> Result<Option<Participation>, CoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.participations.iter().find(|p| p.id == id).cloned())
    }

    async fn upsert_proof(
        &self,
        participation_id: i64,
        user_id: i64,
        challenge_id: &str,
        proof_date: NaiveDate,
        proof_type: ProofType,
        image_hash: &str,
    ) -> Result<Proof, CoreError> {
        let mut inner = self.inner.lock().await;

        let proof = if let Some(existing) = inner
            .proofs
            .iter_mut()
            .find(|p| p.participation_id == participation_id && p.proof_date == proof_date)
        {
            existing.image_hash = image_hash.to_string();
            existing.status = "accepted".to_string();
            existing.created_at = Utc::now();
            existing.clone()
        } else {
            let proof = Proof {
                id: inner.next_id(),
                participation_id,
                user_id,
                challenge_id: challenge_id.to_string(),
                proof_date,
                proof_type,
                image_hash: image_hash.to_string(),
                status: "accepted".to_string(),
                created_at: Utc::now(),
            };
            inner.proofs.push(proof.clone());
            proof
        };

        inner.recount_proofs(participation_id);
        Ok(proof)
    }

    async fn find_foreign_proof_by_hash(
        &self,
        image_hash: &str,
        excluding_user_id: i64,
    ) -> Result<Option<Proof>, CoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .proofs
            .iter()
            .find(|p| {
                p.image_hash == image_hash
                    && p.user_id != excluding_user_id
                    && p.status == "accepted"
            })
            .cloned())
    }

    async fn find_own_proof_by_hash(
        &self,
        image_hash: &str,
        user_id: i64,
    ) -> Result<Option<Proof>, CoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .proofs
            .iter()
            .find(|p| p.image_hash == image_hash && p.user_id == user_id && p.status == "accepted")
            .cloned())
    }

    async fn count_accepted_proofs(&self, participation_id: i64) -> Result<i64, CoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .proofs
            .iter()
            .filter(|p| p.participation_id == participation_id && p.status == "accepted")
            .count() as i64)
    }

    async fn insert_payout(&self, new: NewPayout) -> Result<Payout, CoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let payout = Payout {
            id: inner.next_id(),
            user_id: new.user_id,
            promotion_code: new.promotion_code,
            promotion_key: new.promotion_key,
            amount_points: new.amount_points,
            status: PayoutStatus::Requested,
            raw: new.raw,
            created_at: now,
            updated_at: now,
        };
        inner.payouts.push(payout.clone());
        Ok(payout)
    }

    async fn update_payout_status(
        &self,
        promotion_key: &str,
        outcome: PayoutOutcome,
        raw: Value,
    ) -> Result<bool, CoreError> {
        let mut inner = self.inner.lock().await;
        let Some(payout) = inner
            .payouts
            .iter_mut()
            .find(|p| p.promotion_key == promotion_key)
        else {
            return Ok(false);
        };
        if payout.status.is_terminal() {
            return Ok(false);
        }
        payout.status = match outcome {
            PayoutOutcome::Success => PayoutStatus::Success,
            PayoutOutcome::Fail => PayoutStatus::Fail,
            PayoutOutcome::Pending => PayoutStatus::Pending,
        };
        payout.raw = raw;
        payout.updated_at = Utc::now();
        Ok(true)
    }

    async fn get_payout(&self, promotion_key: &str) -> Result<Option<Payout>, CoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .payouts
            .iter()
            .find(|p| p.promotion_key == promotion_key)
            .cloned())
    }

    async fn list_unresolved_payouts(
        &self,
        limit: i64,
    ) -> Result<Vec<PayoutWithUser>, CoreError> {
        let inner = self.inner.lock().await;
        let mut unresolved: Vec<&Payout> = inner
            .payouts
            .iter()
            .filter(|p| !p.status.is_terminal())
            .collect();
        unresolved.sort_by_key(|p| p.updated_at);
        Ok(unresolved
            .into_iter()
            .take(limit.max(0) as usize)
            .filter_map(|payout| {
                inner
                    .users
                    .iter()
                    .find(|u| u.id == payout.user_id)
                    .map(|user| PayoutWithUser {
                        payout: payout.clone(),
                        provider_user_key: user.provider_user_key.clone(),
                    })
            })
            .collect())
    }

    async fn list_settlements(&self, user_id: i64) -> Result<Vec<SettlementView>, CoreError> {
        let inner = self.inner.lock().await;
        let mut views: Vec<SettlementView> = inner
            .settlements
            .iter()
            .filter(|s| s.user_id == user_id)
            .filter_map(|settlement| {
                let participation = inner
                    .participations
                    .iter()
                    .find(|p| p.id == settlement.participation_id)?;
                let challenge = inner
                    .challenges
                    .iter()
                    .find(|c| c.id == settlement.challenge_id)?;
                Some(SettlementView {
                    settlement: settlement.clone(),
                    proof_count: participation.proof_count,
                    required_days: challenge.days,
                })
            })
            .collect();
        views.sort_by(|a, b| b.settlement.created_at.cmp(&a.settlement.created_at));
        Ok(views)
    }

    async fn get_idempotency(&self, scope: &str, key: &str) -> Result<Option<Value>, CoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .idempotency
            .get(&(scope.to_string(), key.to_string()))
            .filter(|record| record.expires_at > Utc::now())
            .map(|record| record.response.clone()))
    }

    async fn put_idempotency(
        &self,
        scope: &str,
        key: &str,
        response: &Value,
        ttl: Duration,
    ) -> Result<bool, CoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let slot = (scope.to_string(), key.to_string());
        if let Some(existing) = inner.idempotency.get(&slot) {
            if existing.expires_at > now {
                return Ok(false);
            }
        }
        inner.idempotency.insert(
            slot,
            IdemRecord {
                response: response.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn revoke_session(&self, subject: &str, reason: &str) -> Result<(), CoreError> {
        let subject = subject.trim();
        if subject.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        inner.revoked.insert(
            subject.to_string(),
            RevokedEntry {
                reason: reason.to_string(),
                revoked_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn is_session_revoked(&self, subject: &str) -> Result<bool, CoreError> {
        let subject = subject.trim();
        if subject.is_empty() {
            return Ok(false);
        }
        let inner = self.inner.lock().await;
        Ok(inner.revoked.contains_key(subject))
    }

    async fn close_expired_participations(
        &self,
        today: NaiveDate,
    ) -> Result<BatchOutcome, CoreError> {
        let mut inner = self.inner.lock().await;
        let mut outcome = BatchOutcome::default();

        let expired: Vec<(i64, String, i32)> = inner
            .participations
            .iter()
            .filter(|p| p.status == ParticipationStatus::Active && p.end_date < today)
            .map(|p| (p.id, p.challenge_id.clone(), p.proof_count))
            .collect();

        for (id, challenge_id, proof_count) in expired {
            let Some(days) = inner
                .challenges
                .iter()
                .find(|c| c.id == challenge_id)
                .map(|c| c.days)
            else {
                outcome.failed += 1;
                outcome
                    .errors
                    .push(format!("participation {id}: challenge '{challenge_id}' missing"));
                continue;
            };
            let status = if proof_count >= days {
                ParticipationStatus::Success
            } else {
                ParticipationStatus::Failed
            };
            if let Some(participation) = inner.participations.iter_mut().find(|p| p.id == id) {
                participation.status = status;
                outcome.processed += 1;
            }
        }

        Ok(outcome)
    }

    async fn update_settlement_statuses(&self) -> Result<BatchOutcome, CoreError> {
        let mut inner = self.inner.lock().await;
        let mut outcome = BatchOutcome::default();

        let terminal: HashMap<i64, ParticipationStatus> = inner
            .participations
            .iter()
            .filter(|p| p.status.is_terminal())
            .map(|p| (p.id, p.status))
            .collect();

        for settlement in inner
            .settlements
            .iter_mut()
            .filter(|s| s.status == SettlementStatus::Running)
        {
            let Some(status) = terminal.get(&settlement.participation_id) else {
                continue;
            };
            settlement.status = match status {
                ParticipationStatus::Success => SettlementStatus::Success,
                _ => SettlementStatus::Failed,
            };
            settlement.refundable = settlement.status == SettlementStatus::Success;
            outcome.processed += 1;
        }

        Ok(outcome)
    }

    async fn cleanup_expired_idempotency(&self) -> Result<u64, CoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let before = inner.idempotency.len();
        inner.idempotency.retain(|_, record| record.expires_at > now);
        Ok((before - inner.idempotency.len()) as u64)
    }

    async fn cleanup_revoked_sessions(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, CoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.revoked.len();
        inner
            .revoked
            .retain(|_, entry| entry.revoked_at >= older_than);
        Ok((before - inner.revoked.len()) as u64)
    }

    async fn batch_stats(&self) -> Result<BatchStats, CoreError> {
        let inner = self.inner.lock().await;
        let now = Utc::now();
        Ok(BatchStats {
            active_participations: inner
                .participations
                .iter()
                .filter(|p| p.status == ParticipationStatus::Active)
                .count() as u64,
            running_settlements: inner
                .settlements
                .iter()
                .filter(|s| s.status == SettlementStatus::Running)
                .count() as u64,
            idempotency_keys: inner
                .idempotency
                .values()
                .filter(|r| r.expires_at > now)
                .count() as u64,
            revoked_sessions: inner.revoked.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn challenge(id: &str, days: i32) -> Challenge {
        Challenge {
            id: id.to_string(),
            title: id.to_string(),
            days,
            deposit: 10_000,
            proof_type: ProofType::Photo,
            is_active: true,
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    async fn seeded_store() -> (MemoryStore, User) {
        let store = MemoryStore::new();
        store
            .seed_challenges(&[challenge("walk-7000", 3)])
            .await
            .unwrap();
        let user = store.upsert_user("provider:1").await.unwrap();
        (store, user)
    }

    async fn paid_participation(
        store: &MemoryStore,
        user: &User,
        order_no: &str,
        start: NaiveDate,
    ) -> i64 {
        store
            .create_payment(NewPayment {
                user_id: user.id,
                challenge_id: "walk-7000".to_string(),
                order_no: order_no.to_string(),
                amount: 10_000,
                raw: json!({}),
            })
            .await
            .unwrap();
        store
            .execute_payment(order_no, start, json!({}))
            .await
            .unwrap()
            .participation_id
            .unwrap()
    }

    #[tokio::test]
    async fn concurrent_executes_append_exactly_one_done_row() {
        let (store, user) = seeded_store().await;
        let store = std::sync::Arc::new(store);
        store
            .create_payment(NewPayment {
                user_id: user.id,
                challenge_id: "walk-7000".to_string(),
                order_no: "order-race".to_string(),
                amount: 10_000,
                raw: json!({}),
            })
            .await
            .unwrap();

        let start = date(2024, 1, 1);
        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.execute_payment("order-race", start, json!({})).await })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { store.execute_payment("order-race", start, json!({})).await })
        };
        let outcomes = [a.await.unwrap(), b.await.unwrap()];

        let wins = outcomes.iter().filter(|o| o.is_ok()).count();
        assert_eq!(wins, 1);
        let loser = outcomes.iter().find(|o| o.is_err()).unwrap();
        assert!(matches!(
            loser.as_ref().unwrap_err(),
            CoreError::NotFound(_)
        ));

        let latest = store.find_payment("order-race").await.unwrap().unwrap();
        assert_eq!(latest.status, PaymentStatus::Done);
    }

    #[tokio::test]
    async fn upsert_user_is_idempotent_on_provider_key() {
        let store = MemoryStore::new();
        let first = store.upsert_user("provider:7").await.unwrap();
        let second = store.upsert_user("provider:7").await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn execute_payment_creates_participation_and_settlement_once() {
        let (store, user) = seeded_store().await;
        let start = date(2024, 1, 1);
        store
            .create_payment(NewPayment {
                user_id: user.id,
                challenge_id: "walk-7000".to_string(),
                order_no: "order-1".to_string(),
                amount: 10_000,
                raw: json!({}),
            })
            .await
            .unwrap();

        let execution = store
            .execute_payment("order-1", start, json!({"resultType": "SUCCESS"}))
            .await
            .unwrap();
        let participation_id = execution.participation_id.unwrap();

        let participation = store
            .get_participation(participation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(participation.start_date, start);
        assert_eq!(participation.end_date, date(2024, 1, 3));
        assert_eq!(participation.status, ParticipationStatus::Active);

        // Second execute of the same order refuses.
        let err = store
            .execute_payment("order-1", start, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn second_payment_same_window_does_not_duplicate_participation() {
        let (store, user) = seeded_store().await;
        let start = date(2024, 1, 1);
        paid_participation(&store, &user, "order-1", start).await;

        store
            .create_payment(NewPayment {
                user_id: user.id,
                challenge_id: "walk-7000".to_string(),
                order_no: "order-2".to_string(),
                amount: 10_000,
                raw: json!({}),
            })
            .await
            .unwrap();
        let second = store
            .execute_payment("order-2", start, json!({}))
            .await
            .unwrap();
        assert!(second.participation_id.is_none());
    }

    #[tokio::test]
    async fn proof_count_always_matches_recount() {
        let (store, user) = seeded_store().await;
        let start = date(2024, 1, 1);
        let pid = paid_participation(&store, &user, "order-1", start).await;

        for day in 1..=2 {
            store
                .upsert_proof(
                    pid,
                    user.id,
                    "walk-7000",
                    date(2024, 1, day),
                    ProofType::Photo,
                    &format!("hash-{day}"),
                )
                .await
                .unwrap();
        }
        // Same-day resubmission overwrites instead of duplicating.
        store
            .upsert_proof(
                pid,
                user.id,
                "walk-7000",
                date(2024, 1, 2),
                ProofType::Photo,
                "hash-2-replacement",
            )
            .await
            .unwrap();

        let participation = store.get_participation(pid).await.unwrap().unwrap();
        assert_eq!(participation.proof_count, 2);
        assert_eq!(store.count_accepted_proofs(pid).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn resolver_marks_success_and_failed_by_proof_count() {
        let (store, user) = seeded_store().await;
        let start = date(2024, 1, 1);
        let complete = paid_participation(&store, &user, "order-1", start).await;

        let other = store.upsert_user("provider:2").await.unwrap();
        let incomplete = paid_participation(&store, &other, "order-2", start).await;

        for day in 1..=3 {
            store
                .upsert_proof(
                    complete,
                    user.id,
                    "walk-7000",
                    date(2024, 1, day),
                    ProofType::Photo,
                    &format!("a-{day}"),
                )
                .await
                .unwrap();
        }
        for day in 1..=2 {
            store
                .upsert_proof(
                    incomplete,
                    other.id,
                    "walk-7000",
                    date(2024, 1, day),
                    ProofType::Photo,
                    &format!("b-{day}"),
                )
                .await
                .unwrap();
        }

        let outcome = store
            .close_expired_participations(date(2024, 1, 4))
            .await
            .unwrap();
        assert_eq!(outcome.processed, 2);

        assert_eq!(
            store
                .get_participation(complete)
                .await
                .unwrap()
                .unwrap()
                .status,
            ParticipationStatus::Success
        );
        assert_eq!(
            store
                .get_participation(incomplete)
                .await
                .unwrap()
                .unwrap()
                .status,
            ParticipationStatus::Failed
        );

        let propagation = store.update_settlement_statuses().await.unwrap();
        assert_eq!(propagation.processed, 2);

        let winners = store.list_settlements(user.id).await.unwrap();
        assert!(winners[0].settlement.refundable);
        assert_eq!(winners[0].settlement.status, SettlementStatus::Success);

        let losers = store.list_settlements(other.id).await.unwrap();
        assert!(!losers[0].settlement.refundable);
        assert_eq!(losers[0].settlement.status, SettlementStatus::Failed);
    }

    #[tokio::test]
    async fn resolver_rerun_changes_nothing() {
        let (store, user) = seeded_store().await;
        let start = date(2024, 1, 1);
        paid_participation(&store, &user, "order-1", start).await;

        let first = store
            .close_expired_participations(date(2024, 1, 4))
            .await
            .unwrap();
        assert_eq!(first.processed, 1);
        let second = store
            .close_expired_participations(date(2024, 1, 4))
            .await
            .unwrap();
        assert_eq!(second.processed, 0);

        let first = store.update_settlement_statuses().await.unwrap();
        assert_eq!(first.processed, 1);
        let second = store.update_settlement_statuses().await.unwrap();
        assert_eq!(second.processed, 0);
    }

    #[tokio::test]
    async fn payout_terminal_states_are_sticky() {
        let (store, user) = seeded_store().await;
        store
            .insert_payout(NewPayout {
                user_id: user.id,
                promotion_code: "promo".to_string(),
                promotion_key: "key-1".to_string(),
                amount_points: 500,
                raw: json!({}),
            })
            .await
            .unwrap();

        assert!(store
            .update_payout_status("key-1", PayoutOutcome::Pending, json!({}))
            .await
            .unwrap());
        assert!(store
            .update_payout_status("key-1", PayoutOutcome::Success, json!({}))
            .await
            .unwrap());
        // Terminal now; further updates refuse.
        assert!(!store
            .update_payout_status("key-1", PayoutOutcome::Fail, json!({}))
            .await
            .unwrap());
        assert_eq!(
            store.get_payout("key-1").await.unwrap().unwrap().status,
            PayoutStatus::Success
        );

        assert!(store
            .list_unresolved_payouts(10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn idempotency_put_is_insert_or_ignore() {
        let store = MemoryStore::new();
        let inserted = store
            .put_idempotency("scope", "key", &json!({"n": 1}), Duration::minutes(2))
            .await
            .unwrap();
        assert!(inserted);
        let second = store
            .put_idempotency("scope", "key", &json!({"n": 2}), Duration::minutes(2))
            .await
            .unwrap();
        assert!(!second);
        // Loser reads back the winner's response.
        assert_eq!(
            store.get_idempotency("scope", "key").await.unwrap().unwrap()["n"],
            1
        );
    }

    #[tokio::test]
    async fn expired_idempotency_rows_are_invisible_and_swept() {
        let store = MemoryStore::new();
        store
            .put_idempotency("scope", "key", &json!({}), Duration::minutes(-1))
            .await
            .unwrap();
        assert!(store.get_idempotency("scope", "key").await.unwrap().is_none());
        assert_eq!(store.cleanup_expired_idempotency().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn revocation_is_idempotent_and_ignores_empty_subject() {
        let store = MemoryStore::new();
        store.revoke_session("provider:9", "unlinked").await.unwrap();
        store.revoke_session("provider:9", "unlinked again").await.unwrap();
        assert!(store.is_session_revoked("provider:9").await.unwrap());
        assert!(!store.is_session_revoked("").await.unwrap());
        assert!(!store.is_session_revoked("   ").await.unwrap());
    }
}
