use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::error::CoreError;

/// Provider-side failures, kept separate from `CoreError` so adapters never
/// need to know about store or validation concerns.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider answered with an explicit error envelope.
    #[error("provider rejected call: {code}: {message}")]
    Rejected { code: String, message: String },

    /// Transport-level failure (timeout, connection error, malformed body).
    #[error("provider transport error: {0}")]
    Transport(String),
}

impl From<ProviderError> for CoreError {
    fn from(err: ProviderError) -> Self {
        CoreError::Upstream(err.to_string())
    }
}

/// Wire envelope used by the provider. Depending on the endpoint the payload
/// arrives under `success` or `result`; this type resolves that duck typing
/// once, at the boundary, so nothing downstream branches on field presence.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEnvelope {
    #[serde(rename = "resultType", default)]
    pub result_type: Option<String>,
    #[serde(default)]
    pub success: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl ProviderEnvelope {
    /// Normalize into one payload + result code, or a rejection.
    pub fn resolve(self) -> Result<ResolvedEnvelope, ProviderError> {
        if let Some(error) = self.error {
            let code = error
                .get("errorCode")
                .and_then(Value::as_str)
                .unwrap_or("UNKNOWN")
                .to_string();
            let message = error
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("provider error")
                .to_string();
            return Err(ProviderError::Rejected { code, message });
        }

        let body = self.success.or(self.result).unwrap_or(Value::Null);
        Ok(ResolvedEnvelope {
            result_type: self.result_type.unwrap_or_default(),
            body,
        })
    }
}

/// Envelope after success/result resolution.
#[derive(Debug, Clone)]
pub struct ResolvedEnvelope {
    pub result_type: String,
    pub body: Value,
}

/// Result of exchanging an authorization code for a provider identity.
#[derive(Debug, Clone)]
pub struct LoginSession {
    pub provider_user_key: String,
    pub raw: Value,
}

/// Acknowledgement of a payment create call; the pay token drives checkout.
#[derive(Debug, Clone)]
pub struct PaymentAck {
    pub pay_token: String,
    pub raw: Value,
}

/// Acknowledgement of a payment execute call.
#[derive(Debug, Clone)]
pub struct PaymentExecutionAck {
    pub result_type: String,
    pub raw: Value,
}

/// Provider-minted correlation key for an async promotion job.
#[derive(Debug, Clone)]
pub struct PromotionKey {
    pub key: String,
    pub raw: Value,
}

/// Acknowledgement of a promotion execute call. Execution itself completes
/// asynchronously; the reconciler polls for the outcome.
#[derive(Debug, Clone)]
pub struct PromotionAck {
    pub result_type: String,
    pub raw: Value,
}

/// Free-form execution result for an async promotion job.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub result_type: String,
    pub raw: Value,
}

/// Acknowledgement of a templated message send: how many messages went out
/// on each channel.
#[derive(Debug, Clone)]
pub struct MessageAck {
    pub msg_count: i64,
    pub sent_push_count: i64,
    pub sent_inbox_count: i64,
    pub raw: Value,
}

/// Abstract payment-network capability. The wire client behind this trait is
/// an external collaborator; adapters implement it over mTLS HTTP in
/// production and in memory for local mode and tests.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Human-readable adapter label for health output and logs.
    fn mode(&self) -> &'static str;

    /// Exchange a login authorization code for the provider's user key.
    async fn exchange_login(
        &self,
        authorization_code: &str,
        referrer: &str,
    ) -> Result<LoginSession, ProviderError>;

    /// Create a payment for checkout under the given idempotency key.
    async fn create_payment(
        &self,
        provider_user_key: &str,
        idempotency_key: &str,
        order_no: &str,
        amount: i64,
        product_desc: &str,
    ) -> Result<PaymentAck, ProviderError>;

    /// Confirm and execute a previously created payment.
    async fn execute_payment(
        &self,
        provider_user_key: &str,
        idempotency_key: &str,
        order_no: &str,
    ) -> Result<PaymentExecutionAck, ProviderError>;

    /// Mint an opaque per-user promotion key for a promotion code.
    async fn get_promotion_key(
        &self,
        provider_user_key: &str,
        promotion_code: &str,
    ) -> Result<PromotionKey, ProviderError>;

    /// Execute the promotion for a minted key. The idempotency key is passed
    /// through so a client retry cannot double-spend even across restarts.
    async fn execute_promotion(
        &self,
        provider_user_key: &str,
        idempotency_key: &str,
        promotion_key: &str,
        amount_points: i64,
    ) -> Result<PromotionAck, ProviderError>;

    /// Ask for the execution result of an async promotion job.
    async fn get_execution_result(
        &self,
        provider_user_key: &str,
        promotion_key: &str,
    ) -> Result<ExecutionResult, ProviderError>;

    /// Send a templated message to the user's provider inbox. The template
    /// context fills the placeholders on the provider side.
    async fn send_message(
        &self,
        provider_user_key: &str,
        template_set_code: &str,
        context: &Value,
    ) -> Result<MessageAck, ProviderError>;
}

/// Normalized terminal/transient classification of a provider result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayoutOutcome {
    Success,
    Fail,
    Pending,
}

impl PayoutOutcome {
    /// Fixed mapping from the provider's free-form result codes. Unrecognized
    /// codes classify as `Pending` so they are never mistaken for a terminal
    /// outcome.
    pub fn from_result_type(result_type: &str) -> Self {
        match result_type.to_ascii_uppercase().as_str() {
            "SUCCESS" => Self::Success,
            "FAIL" | "EXECUTION_FAIL" | "INTERNAL_ERROR" => Self::Fail,
            "HTTP_TIMEOUT" | "NETWORK_ERROR" | "INTERRUPTED" => Self::Pending,
            _ => Self::Pending,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Fail => "FAIL",
            Self::Pending => "PENDING",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn result_code_mapping_is_fixed() {
        assert_eq!(
            PayoutOutcome::from_result_type("SUCCESS"),
            PayoutOutcome::Success
        );
        assert_eq!(
            PayoutOutcome::from_result_type("success"),
            PayoutOutcome::Success
        );
        for code in ["FAIL", "EXECUTION_FAIL", "INTERNAL_ERROR"] {
            assert_eq!(PayoutOutcome::from_result_type(code), PayoutOutcome::Fail);
        }
        for code in ["HTTP_TIMEOUT", "NETWORK_ERROR", "INTERRUPTED"] {
            assert_eq!(
                PayoutOutcome::from_result_type(code),
                PayoutOutcome::Pending
            );
        }
    }

    #[test]
    fn unknown_codes_never_classify_terminal() {
        for code in ["", "WEIRD_NEW_CODE", "Partial", "TIMEOUT2"] {
            assert_eq!(
                PayoutOutcome::from_result_type(code),
                PayoutOutcome::Pending
            );
        }
    }

    #[test]
    fn envelope_resolves_success_field() {
        let envelope: ProviderEnvelope = serde_json::from_value(json!({
            "resultType": "SUCCESS",
            "success": {"key": "promo-key-1"}
        }))
        .unwrap();
        let resolved = envelope.resolve().unwrap();
        assert_eq!(resolved.result_type, "SUCCESS");
        assert_eq!(resolved.body["key"], "promo-key-1");
    }

    #[test]
    fn envelope_resolves_result_field() {
        let envelope: ProviderEnvelope = serde_json::from_value(json!({
            "resultType": "SUCCESS",
            "result": {"key": "promo-key-2"}
        }))
        .unwrap();
        let resolved = envelope.resolve().unwrap();
        assert_eq!(resolved.body["key"], "promo-key-2");
    }

    #[test]
    fn envelope_error_becomes_rejection() {
        let envelope: ProviderEnvelope = serde_json::from_value(json!({
            "resultType": "FAIL",
            "error": {"errorCode": "INVALID_PROMOTION", "reason": "expired"}
        }))
        .unwrap();
        let err = envelope.resolve().unwrap_err();
        match err {
            ProviderError::Rejected { code, message } => {
                assert_eq!(code, "INVALID_PROMOTION");
                assert_eq!(message, "expired");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
