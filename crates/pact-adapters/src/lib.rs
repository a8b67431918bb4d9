//! Payment-provider adapters for pact.
//!
//! `MockProvider` is the deterministic in-memory adapter behind local mode
//! and tests: same authorization code, same user key; same user and
//! promotion code, same promotion key. Async promotion jobs settle on the
//! second poll unless a result is scripted.

#![deny(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use pact_core::provider::{
    ExecutionResult, LoginSession, MessageAck, PaymentAck, PaymentExecutionAck, PaymentProvider,
    PromotionAck, PromotionKey, ProviderError,
};

fn short_hash(input: &str) -> String {
    blake3::hash(input.as_bytes()).to_hex()[..16].to_string()
}

/// Per-adapter call counters, readable by tests asserting at-most-once
/// provider effects.
#[derive(Debug, Default)]
pub struct CallCounters {
    pub login: AtomicU64,
    pub payment_create: AtomicU64,
    pub payment_execute: AtomicU64,
    pub promotion_key: AtomicU64,
    pub promotion_execute: AtomicU64,
    pub execution_result: AtomicU64,
    pub message_send: AtomicU64,
}

/// Deterministic local provider.
#[derive(Debug, Default)]
pub struct MockProvider {
    pub calls: CallCounters,
    /// promotion_key -> scripted result code for polls.
    scripted: Mutex<HashMap<String, String>>,
    /// promotion_key -> polls seen so far (drives the settle-on-second-poll
    /// default).
    polls: Mutex<HashMap<String, u64>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the result code every poll of `promotion_key` returns.
    pub fn script_result(&self, promotion_key: &str, code: &str) {
        self.scripted
            .lock()
            .expect("scripted results lock")
            .insert(promotion_key.to_string(), code.to_string());
    }

    /// The promotion key this adapter mints for (user, code); lets tests
    /// script a result before the payout is issued.
    pub fn promotion_key_for(provider_user_key: &str, promotion_code: &str) -> String {
        format!(
            "promo-{}",
            short_hash(&format!("{provider_user_key}/{promotion_code}"))
        )
    }
}

#[async_trait]
impl PaymentProvider for MockProvider {
    fn mode(&self) -> &'static str {
        "mock"
    }

    async fn exchange_login(
        &self,
        authorization_code: &str,
        _referrer: &str,
    ) -> Result<LoginSession, ProviderError> {
        self.calls.login.fetch_add(1, Ordering::SeqCst);
        if authorization_code.trim().is_empty() {
            return Err(ProviderError::Rejected {
                code: "INVALID_AUTHORIZATION_CODE".to_string(),
                message: "authorization code must not be blank".to_string(),
            });
        }
        let provider_user_key = format!("mock-user-{}", short_hash(authorization_code));
        Ok(LoginSession {
            raw: json!({"resultType": "SUCCESS", "userKey": provider_user_key}),
            provider_user_key,
        })
    }

    async fn create_payment(
        &self,
        provider_user_key: &str,
        idempotency_key: &str,
        order_no: &str,
        amount: i64,
        product_desc: &str,
    ) -> Result<PaymentAck, ProviderError> {
        self.calls.payment_create.fetch_add(1, Ordering::SeqCst);
        if amount <= 0 {
            return Err(ProviderError::Rejected {
                code: "INVALID_AMOUNT".to_string(),
                message: "amount must be positive".to_string(),
            });
        }
        Ok(PaymentAck {
            pay_token: format!("paytoken-{}", Uuid::new_v4()),
            raw: json!({
                "resultType": "SUCCESS",
                "success": {
                    "orderNo": order_no,
                    "userKey": provider_user_key,
                    "idempotencyKey": idempotency_key,
                    "amount": amount,
                    "productDesc": product_desc,
                },
            }),
        })
    }

    async fn execute_payment(
        &self,
        provider_user_key: &str,
        idempotency_key: &str,
        order_no: &str,
    ) -> Result<PaymentExecutionAck, ProviderError> {
        self.calls.payment_execute.fetch_add(1, Ordering::SeqCst);
        Ok(PaymentExecutionAck {
            result_type: "SUCCESS".to_string(),
            raw: json!({
                "resultType": "SUCCESS",
                "success": {
                    "orderNo": order_no,
                    "userKey": provider_user_key,
                    "idempotencyKey": idempotency_key,
                },
            }),
        })
    }

    async fn get_promotion_key(
        &self,
        provider_user_key: &str,
        promotion_code: &str,
    ) -> Result<PromotionKey, ProviderError> {
        self.calls.promotion_key.fetch_add(1, Ordering::SeqCst);
        let key = Self::promotion_key_for(provider_user_key, promotion_code);
        Ok(PromotionKey {
            raw: json!({"resultType": "SUCCESS", "success": {"key": key}}),
            key,
        })
    }

    async fn execute_promotion(
        &self,
        _provider_user_key: &str,
        idempotency_key: &str,
        promotion_key: &str,
        amount_points: i64,
    ) -> Result<PromotionAck, ProviderError> {
        self.calls.promotion_execute.fetch_add(1, Ordering::SeqCst);
        if amount_points <= 0 {
            return Err(ProviderError::Rejected {
                code: "INVALID_AMOUNT".to_string(),
                message: "amountPoints must be positive".to_string(),
            });
        }
        Ok(PromotionAck {
            result_type: "SUCCESS".to_string(),
            raw: json!({
                "resultType": "SUCCESS",
                "success": {
                    "key": promotion_key,
                    "idempotencyKey": idempotency_key,
                    "amount": amount_points,
                },
            }),
        })
    }

    async fn get_execution_result(
        &self,
        _provider_user_key: &str,
        promotion_key: &str,
    ) -> Result<ExecutionResult, ProviderError> {
        self.calls.execution_result.fetch_add(1, Ordering::SeqCst);

        let polls = {
            let mut polls = self.polls.lock().expect("polls lock");
            let count = polls.entry(promotion_key.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let code = self
            .scripted
            .lock()
            .expect("scripted results lock")
            .get(promotion_key)
            .cloned()
            // Unscripted jobs look in-flight once, then settle.
            .unwrap_or_else(|| {
                if polls < 2 {
                    "HTTP_TIMEOUT".to_string()
                } else {
                    "SUCCESS".to_string()
                }
            });
        Ok(ExecutionResult {
            result_type: code.clone(),
            raw: json!({"resultType": code, "result": {"key": promotion_key}}),
        })
    }

    async fn send_message(
        &self,
        provider_user_key: &str,
        template_set_code: &str,
        context: &serde_json::Value,
    ) -> Result<MessageAck, ProviderError> {
        self.calls.message_send.fetch_add(1, Ordering::SeqCst);
        if template_set_code.trim().is_empty() {
            return Err(ProviderError::Rejected {
                code: "INVALID_TEMPLATE_SET".to_string(),
                message: "template set code must not be blank".to_string(),
            });
        }
        Ok(MessageAck {
            msg_count: 1,
            sent_push_count: 1,
            sent_inbox_count: 1,
            raw: json!({
                "resultType": "SUCCESS",
                "success": {
                    "userKey": provider_user_key,
                    "templateSetCode": template_set_code,
                    "context": context,
                    "msgCount": 1,
                    "sentPushCount": 1,
                    "sentInboxCount": 1,
                },
            }),
        })
    }
}

/// Provider whose every call fails at the transport level, for chaos tests.
#[derive(Debug, Clone)]
pub struct AlwaysFailProvider {
    reason: String,
}

impl AlwaysFailProvider {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn err(&self) -> ProviderError {
        ProviderError::Transport(self.reason.clone())
    }
}

#[async_trait]
impl PaymentProvider for AlwaysFailProvider {
    fn mode(&self) -> &'static str {
        "always-fail"
    }

    async fn exchange_login(
        &self,
        _authorization_code: &str,
        _referrer: &str,
    ) -> Result<LoginSession, ProviderError> {
        Err(self.err())
    }

    async fn create_payment(
        &self,
        _provider_user_key: &str,
        _idempotency_key: &str,
        _order_no: &str,
        _amount: i64,
        _product_desc: &str,
    ) -> Result<PaymentAck, ProviderError> {
        Err(self.err())
    }

    async fn execute_payment(
        &self,
        _provider_user_key: &str,
        _idempotency_key: &str,
        _order_no: &str,
    ) -> Result<PaymentExecutionAck, ProviderError> {
        Err(self.err())
    }

    async fn get_promotion_key(
        &self,
        _provider_user_key: &str,
        _promotion_code: &str,
    ) -> Result<PromotionKey, ProviderError> {
        Err(self.err())
    }

    async fn execute_promotion(
        &self,
        _provider_user_key: &str,
        _idempotency_key: &str,
        _promotion_key: &str,
        _amount_points: i64,
    ) -> Result<PromotionAck, ProviderError> {
        Err(self.err())
    }

    async fn get_execution_result(
        &self,
        _provider_user_key: &str,
        _promotion_key: &str,
    ) -> Result<ExecutionResult, ProviderError> {
        Err(self.err())
    }

    async fn send_message(
        &self,
        _provider_user_key: &str,
        _template_set_code: &str,
        _context: &serde_json::Value,
    ) -> Result<MessageAck, ProviderError> {
        Err(self.err())
    }
}
