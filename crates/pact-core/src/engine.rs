use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use serde_json::{json, Value};

use crate::error::CoreError;
use crate::idempotency::{Gate, IdempotencyLedger};
use crate::provider::PaymentProvider;
use crate::store::{NewPayment, NewPayout, Store};
use crate::types::{Challenge, PaymentStatus, SettlementView, User};

pub const SCOPE_PAYMENT_CREATE: &str = "payment-create";
pub const SCOPE_PAYMENT_EXECUTE: &str = "payment-execute";
pub const SCOPE_PROOF_SUBMIT: &str = "proof-submit";
pub const SCOPE_PAYOUT_ISSUE: &str = "payout-issue";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Lifetime of cached idempotent responses.
    pub idempotency_ttl: Duration,
    /// Product line shown on the provider's checkout sheet.
    pub product_desc: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idempotency_ttl: Duration::hours(24),
            product_desc: "Commitment deposit".to_string(),
        }
    }
}

/// Request-path operations: login exchange, payment lifecycle, proof
/// submission, payout issue and manual payout result.
///
/// Every mutating operation runs behind the idempotency ledger. The ordering
/// contract is uniform: replay check, provider call, store write, ledger
/// commit. A provider or store failure commits nothing, so the client may
/// retry the same key; the provider's own idempotency keys absorb the
/// re-sent calls.
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn Store>,
    provider: Arc<dyn PaymentProvider>,
    ledger: IdempotencyLedger,
    product_desc: String,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn PaymentProvider>,
        config: EngineConfig,
    ) -> Self {
        let ledger = IdempotencyLedger::new(store.clone(), config.idempotency_ttl);
        Self {
            store,
            provider,
            ledger,
            product_desc: config.product_desc,
        }
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub fn provider(&self) -> Arc<dyn PaymentProvider> {
        self.provider.clone()
    }

    pub fn provider_mode(&self) -> &'static str {
        self.provider.mode()
    }

    /// Exchange a provider authorization code for a local account.
    pub async fn login(&self, authorization_code: &str, referrer: &str) -> Result<User, CoreError> {
        if authorization_code.trim().is_empty() {
            return Err(CoreError::Validation(
                "authorizationCode must not be blank".to_string(),
            ));
        }
        let session = self
            .provider
            .exchange_login(authorization_code, referrer)
            .await?;
        self.store.upsert_user(&session.provider_user_key).await
    }

    /// Provider-initiated unlink: revoke every session for the subject.
    pub async fn unlink(&self, provider_user_key: &str) -> Result<(), CoreError> {
        self.store
            .revoke_session(provider_user_key, "provider unlink")
            .await
    }

    pub async fn challenges(&self) -> Result<Vec<Challenge>, CoreError> {
        self.store.list_challenges().await
    }

    pub async fn settlements(&self, user: &User) -> Result<Vec<SettlementView>, CoreError> {
        self.store.list_settlements(user.id).await
    }

    /// Create a payment for a challenge deposit. The order number is minted
    /// here; the provider call and the local log row share it.
    pub async fn create_payment(
        &self,
        user: &User,
        challenge_id: &str,
        amount: i64,
        idempotency_key: Option<&str>,
    ) -> Result<Value, CoreError> {
        let challenge = self
            .store
            .get_challenge(challenge_id)
            .await?
            .filter(|c| c.is_active)
            .ok_or_else(|| CoreError::NotFound(format!("challenge '{challenge_id}' not found")))?;
        if amount != challenge.deposit {
            return Err(CoreError::Validation(format!(
                "amount must equal the challenge deposit of {}",
                challenge.deposit
            )));
        }

        let key = IdempotencyLedger::resolve_key(idempotency_key)?;
        if let Gate::Replay(cached) = self.ledger.begin(SCOPE_PAYMENT_CREATE, &key).await? {
            return Ok(cached);
        }

        let order_no = format!("order-{}", uuid::Uuid::new_v4());
        let ack = self
            .provider
            .create_payment(
                &user.provider_user_key,
                &key,
                &order_no,
                amount,
                &self.product_desc,
            )
            .await?;

        self.store
            .create_payment(NewPayment {
                user_id: user.id,
                challenge_id: challenge.id.clone(),
                order_no: order_no.clone(),
                amount,
                raw: ack.raw.clone(),
            })
            .await?;

        let response = json!({
            "paymentId": order_no,
            "challengeId": challenge.id,
            "amount": amount,
            "payToken": ack.pay_token,
            "status": "created",
        });
        self.ledger.commit(SCOPE_PAYMENT_CREATE, &key, &response).await
    }

    /// Confirm a created payment and open the participation window.
    pub async fn execute_payment(
        &self,
        user: &User,
        order_no: &str,
        today: NaiveDate,
        idempotency_key: Option<&str>,
    ) -> Result<Value, CoreError> {
        let payment = self
            .store
            .find_payment(order_no)
            .await?
            .filter(|p| p.user_id == user.id)
            .ok_or_else(|| CoreError::NotFound(format!("payment '{order_no}' not found")))?;

        let key = IdempotencyLedger::resolve_key(idempotency_key)?;
        if let Gate::Replay(cached) = self.ledger.begin(SCOPE_PAYMENT_EXECUTE, &key).await? {
            return Ok(cached);
        }

        // A fresh key against an already-executed order must refuse before
        // the provider sees a second execute; the store-side guard would
        // refuse too, but only after the provider call.
        if payment.status == PaymentStatus::Done {
            return Err(CoreError::NotFound(format!(
                "payment '{order_no}' not found or already executed"
            )));
        }

        let ack = self
            .provider
            .execute_payment(&user.provider_user_key, &key, &payment.order_no)
            .await?;
        let execution = self
            .store
            .execute_payment(&payment.order_no, today, ack.raw.clone())
            .await?;

        let response = json!({
            "paymentId": payment.order_no,
            "status": "done",
            "participationId": execution.participation_id,
        });
        self.ledger
            .commit(SCOPE_PAYMENT_EXECUTE, &key, &response)
            .await
    }

    /// Record today's proof for the user's active participation.
    ///
    /// The fingerprint is rejected when any other user already submitted it,
    /// or when this user submitted it on an earlier day. The same-day repeat
    /// overwrites in place.
    pub async fn submit_proof(
        &self,
        user: &User,
        challenge_id: &str,
        image_hash: &str,
        today: NaiveDate,
        idempotency_key: Option<&str>,
    ) -> Result<Value, CoreError> {
        let image_hash = image_hash.trim();
        if image_hash.is_empty() {
            return Err(CoreError::Validation(
                "imageHash must not be blank".to_string(),
            ));
        }
        let participation = self
            .store
            .active_participation(user.id, challenge_id, today)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound(format!(
                    "no active participation for challenge '{challenge_id}'"
                ))
            })?;
        let challenge = self
            .store
            .get_challenge(challenge_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("challenge '{challenge_id}' not found")))?;

        if self
            .store
            .find_foreign_proof_by_hash(image_hash, user.id)
            .await?
            .is_some()
        {
            return Err(CoreError::Validation(
                "image already submitted by another user".to_string(),
            ));
        }
        if let Some(own) = self.store.find_own_proof_by_hash(image_hash, user.id).await? {
            if own.proof_date != today {
                return Err(CoreError::Validation(
                    "image already submitted on an earlier day".to_string(),
                ));
            }
        }

        let key = IdempotencyLedger::resolve_key(idempotency_key)?;
        if let Gate::Replay(cached) = self.ledger.begin(SCOPE_PROOF_SUBMIT, &key).await? {
            return Ok(cached);
        }

        let proof = self
            .store
            .upsert_proof(
                participation.id,
                user.id,
                challenge_id,
                today,
                challenge.proof_type,
                image_hash,
            )
            .await?;
        let proof_count = self.store.count_accepted_proofs(participation.id).await?;

        let response = json!({
            "status": proof.status,
            "participationId": participation.id,
            "proofDate": proof.proof_date,
            "proofCount": proof_count,
            "requiredDays": challenge.days,
        });
        self.ledger.commit(SCOPE_PROOF_SUBMIT, &key, &response).await
    }

    /// Request a reward disbursement through the provider's async promotion
    /// pipeline. The payout row starts as REQUESTED; the reconciler resolves
    /// it. The provider-minted promotion key is the correlation handle.
    pub async fn issue_payout(
        &self,
        user: &User,
        promotion_code: &str,
        amount_points: i64,
        idempotency_key: Option<&str>,
    ) -> Result<Value, CoreError> {
        if promotion_code.trim().is_empty() {
            return Err(CoreError::Validation(
                "promotionCode must not be blank".to_string(),
            ));
        }
        if amount_points <= 0 {
            return Err(CoreError::Validation(
                "amountPoints must be positive".to_string(),
            ));
        }

        let key = IdempotencyLedger::resolve_key(idempotency_key)?;
        if let Gate::Replay(cached) = self.ledger.begin(SCOPE_PAYOUT_ISSUE, &key).await? {
            return Ok(cached);
        }

        let minted = self
            .provider
            .get_promotion_key(&user.provider_user_key, promotion_code)
            .await?;
        let ack = self
            .provider
            .execute_promotion(&user.provider_user_key, &key, &minted.key, amount_points)
            .await?;

        let payout = self
            .store
            .insert_payout(NewPayout {
                user_id: user.id,
                promotion_code: promotion_code.to_string(),
                promotion_key: minted.key.clone(),
                amount_points,
                raw: json!({"key": minted.raw, "execute": ack.raw}),
            })
            .await?;

        let response = json!({
            "promotionKey": payout.promotion_key,
            "status": payout.status.as_str(),
            "execute": ack.result_type,
        });
        self.ledger.commit(SCOPE_PAYOUT_ISSUE, &key, &response).await
    }

    /// Send a templated message through the provider's messenger. Pure
    /// pass-through; the provider owns the templates and delivery.
    pub async fn send_message(
        &self,
        user: &User,
        template_set_code: &str,
        context: &Value,
    ) -> Result<Value, CoreError> {
        if template_set_code.trim().is_empty() {
            return Err(CoreError::Validation(
                "templateSetCode must not be blank".to_string(),
            ));
        }
        if !context.is_object() {
            return Err(CoreError::Validation(
                "context must be an object".to_string(),
            ));
        }

        let ack = self
            .provider
            .send_message(&user.provider_user_key, template_set_code, context)
            .await?;
        Ok(json!({
            "result": {
                "msgCount": ack.msg_count,
                "sentPushCount": ack.sent_push_count,
                "sentInboxCount": ack.sent_inbox_count,
            },
            "raw": ack.raw,
        }))
    }

    /// On-demand poll of one payout's provider-side result. Terminal rows
    /// answer from the store without a provider call.
    pub async fn payout_result(
        &self,
        user: &User,
        promotion_key: &str,
    ) -> Result<Value, CoreError> {
        let payout = self
            .store
            .get_payout(promotion_key)
            .await?
            .filter(|p| p.user_id == user.id)
            .ok_or_else(|| CoreError::NotFound(format!("payout '{promotion_key}' not found")))?;
        if payout.status.is_terminal() {
            return Ok(json!({
                "promotionKey": payout.promotion_key,
                "status": payout.status.as_str(),
            }));
        }

        let result = self
            .provider
            .get_execution_result(&user.provider_user_key, promotion_key)
            .await?;
        let outcome = crate::provider::PayoutOutcome::from_result_type(&result.result_type);
        self.store
            .update_payout_status(promotion_key, outcome, result.raw)
            .await?;

        let current = self
            .store
            .get_payout(promotion_key)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("payout '{promotion_key}' not found")))?;
        Ok(json!({
            "promotionKey": current.promotion_key,
            "status": current.status.as_str(),
        }))
    }
}
