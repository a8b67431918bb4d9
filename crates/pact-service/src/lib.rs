//! Pact REST service: session-token auth over the settlement engine.

#![deny(unsafe_code)]

pub mod auth;
pub mod worker;

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use auth::{authenticate, SessionKeys};
use pact_core::{
    default_challenges, image_fingerprint, Challenge, CoreError, Engine, EngineConfig,
    MemoryStore, PaymentProvider, PgStore, SettlementView, Store, User,
};

pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// Store backend selection, mirrored by the `pactd` CLI.
#[derive(Debug, Clone)]
pub enum StoreConfig {
    Memory,
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StoreConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Memory
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub store: StoreConfig,
    pub session_secret: String,
    pub session_ttl: Duration,
    pub engine: EngineConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::Memory,
            session_secret: "insecure-dev-secret".to_string(),
            session_ttl: Duration::hours(24),
            engine: EngineConfig::default(),
        }
    }
}

#[derive(Clone)]
pub struct ServiceState {
    pub engine: Engine,
    pub keys: Arc<SessionKeys>,
    store_backend: &'static str,
}

impl ServiceState {
    /// Build the store, seed the challenge catalog, and wire the engine.
    pub async fn bootstrap(
        config: ServiceConfig,
        provider: Arc<dyn PaymentProvider>,
    ) -> Result<Self, ServiceError> {
        let store_backend = config.store.label();
        let store: Arc<dyn Store> = match config.store {
            StoreConfig::Memory => Arc::new(MemoryStore::new()),
            StoreConfig::Postgres {
                database_url,
                max_connections,
            } => Arc::new(PgStore::bootstrap(&database_url, max_connections).await?),
        };
        store.seed_challenges(&default_challenges()).await?;

        Ok(Self {
            engine: Engine::new(store, provider, config.engine),
            keys: Arc::new(SessionKeys::new(
                &config.session_secret,
                config.session_ttl,
            )),
            store_backend,
        })
    }

    pub fn store_backend(&self) -> &'static str {
        self.store_backend
    }

    async fn current_user(&self, headers: &HeaderMap) -> Result<User, ApiError> {
        Ok(authenticate(&self.keys, &self.engine.store(), headers).await?)
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/auth/exchange", post(auth_exchange))
        .route("/v1/auth/unlink-callback", post(unlink_callback))
        .route("/v1/me", get(me))
        .route("/v1/challenges", get(list_challenges))
        .route("/v1/payments/create", post(payments_create))
        .route("/v1/payments/execute", post(payments_execute))
        .route("/v1/proofs/submit", post(proofs_submit))
        .route("/v1/payouts/issue", post(payouts_issue))
        .route("/v1/payouts/result", post(payouts_result))
        .route("/v1/messages/send", post(messages_send))
        .route("/v1/settlements", get(list_settlements))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError::Core(err) = self;
        let status = match &err {
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::Upstream(_) => StatusCode::BAD_GATEWAY,
            CoreError::Store(_) | CoreError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (
            status,
            Json(serde_json::json!({
                "error": err.to_string(),
                "retryable": err.is_retryable(),
            })),
        )
            .into_response()
    }
}

fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    store_backend: &'static str,
    provider_mode: &'static str,
}

async fn health(State(state): State<ServiceState>) -> Result<Json<HealthResponse>, ApiError> {
    state.engine.store().ping().await?;
    Ok(Json(HealthResponse {
        status: "ok",
        service: "pact-service",
        store_backend: state.store_backend(),
        provider_mode: state.engine.provider_mode(),
    }))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthExchangeRequest {
    authorization_code: String,
    #[serde(default)]
    referrer: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthExchangeResponse {
    token: String,
    user_key: String,
}

async fn auth_exchange(
    State(state): State<ServiceState>,
    Json(request): Json<AuthExchangeRequest>,
) -> Result<Json<AuthExchangeResponse>, ApiError> {
    let user = state
        .engine
        .login(
            &request.authorization_code,
            request.referrer.as_deref().unwrap_or(""),
        )
        .await?;
    let token = state.keys.mint(&user)?;
    Ok(Json(AuthExchangeResponse {
        token,
        user_key: user.provider_user_key,
    }))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnlinkCallbackRequest {
    user_key: String,
}

async fn unlink_callback(
    State(state): State<ServiceState>,
    Json(request): Json<UnlinkCallbackRequest>,
) -> Result<Json<Value>, ApiError> {
    state.engine.unlink(&request.user_key).await?;
    Ok(Json(serde_json::json!({"status": "revoked"})))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct MeResponse {
    id: i64,
    user_key: String,
    created_at: DateTime<Utc>,
}

async fn me(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<MeResponse>, ApiError> {
    let user = state.current_user(&headers).await?;
    Ok(Json(MeResponse {
        id: user.id,
        user_key: user.provider_user_key,
        created_at: user.created_at,
    }))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChallengeItem {
    id: String,
    title: String,
    days: i32,
    deposit: i64,
    proof_type: &'static str,
}

impl From<Challenge> for ChallengeItem {
    fn from(challenge: Challenge) -> Self {
        Self {
            id: challenge.id,
            title: challenge.title,
            days: challenge.days,
            deposit: challenge.deposit,
            proof_type: challenge.proof_type.as_str(),
        }
    }
}

async fn list_challenges(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    state.current_user(&headers).await?;
    let items: Vec<ChallengeItem> = state
        .engine
        .challenges()
        .await?
        .into_iter()
        .map(ChallengeItem::from)
        .collect();
    Ok(Json(serde_json::json!({ "items": items })))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentCreateRequest {
    challenge_id: String,
    amount: i64,
}

async fn payments_create(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<PaymentCreateRequest>,
) -> Result<Json<Value>, ApiError> {
    let user = state.current_user(&headers).await?;
    let response = state
        .engine
        .create_payment(
            &user,
            &request.challenge_id,
            request.amount,
            idempotency_key(&headers).as_deref(),
        )
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentExecuteRequest {
    payment_id: String,
}

async fn payments_execute(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<PaymentExecuteRequest>,
) -> Result<Json<Value>, ApiError> {
    let user = state.current_user(&headers).await?;
    let response = state
        .engine
        .execute_payment(
            &user,
            &request.payment_id,
            today(),
            idempotency_key(&headers).as_deref(),
        )
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProofSubmitRequest {
    challenge_id: String,
    /// Precomputed content fingerprint.
    #[serde(default)]
    image_hash: Option<String>,
    /// Raw image payload; fingerprinted server-side when no hash is given.
    #[serde(default)]
    image_data: Option<String>,
}

async fn proofs_submit(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<ProofSubmitRequest>,
) -> Result<Json<Value>, ApiError> {
    let user = state.current_user(&headers).await?;
    let image_hash = match (&request.image_hash, &request.image_data) {
        (Some(hash), _) => hash.clone(),
        (None, Some(data)) => image_fingerprint(data.as_bytes()),
        (None, None) => {
            return Err(CoreError::Validation(
                "either imageHash or imageData is required".to_string(),
            )
            .into())
        }
    };
    let response = state
        .engine
        .submit_proof(
            &user,
            &request.challenge_id,
            &image_hash,
            today(),
            idempotency_key(&headers).as_deref(),
        )
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayoutIssueRequest {
    promotion_code: String,
    amount_points: i64,
}

async fn payouts_issue(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<PayoutIssueRequest>,
) -> Result<Json<Value>, ApiError> {
    let user = state.current_user(&headers).await?;
    let response = state
        .engine
        .issue_payout(
            &user,
            &request.promotion_code,
            request.amount_points,
            idempotency_key(&headers).as_deref(),
        )
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayoutResultRequest {
    promotion_key: String,
}

async fn payouts_result(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<PayoutResultRequest>,
) -> Result<Json<Value>, ApiError> {
    let user = state.current_user(&headers).await?;
    let response = state
        .engine
        .payout_result(&user, &request.promotion_key)
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageSendRequest {
    template_set_code: String,
    context: Value,
}

async fn messages_send(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<MessageSendRequest>,
) -> Result<Json<Value>, ApiError> {
    let user = state.current_user(&headers).await?;
    let response = state
        .engine
        .send_message(&user, &request.template_set_code, &request.context)
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SettlementItem {
    id: i64,
    challenge_id: String,
    status: &'static str,
    refundable: bool,
    deposit_amount: i64,
    proof_count: i32,
    required_days: i32,
    message: String,
    created_at: DateTime<Utc>,
}

impl From<SettlementView> for SettlementItem {
    fn from(view: SettlementView) -> Self {
        let message = view.message();
        Self {
            id: view.settlement.id,
            challenge_id: view.settlement.challenge_id.clone(),
            status: view.settlement.status.as_str(),
            refundable: view.settlement.refundable,
            deposit_amount: view.settlement.deposit_amount,
            proof_count: view.proof_count,
            required_days: view.required_days,
            message,
            created_at: view.settlement.created_at,
        }
    }
}

async fn list_settlements(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let user = state.current_user(&headers).await?;
    let items: Vec<SettlementItem> = state
        .engine
        .settlements(&user)
        .await?
        .into_iter()
        .map(SettlementItem::from)
        .collect();
    Ok(Json(serde_json::json!({ "items": items })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use pact_adapters::MockProvider;
    use tower::ServiceExt;

    async fn test_app() -> Router {
        let state = ServiceState::bootstrap(
            ServiceConfig::default(),
            Arc::new(MockProvider::new()),
        )
        .await
        .unwrap();
        build_router(state)
    }

    async fn request(
        app: &Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        idem: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        if let Some(idem) = idem {
            builder = builder.header(IDEMPOTENCY_HEADER, idem);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn exchange(app: &Router, code: &str) -> String {
        let (status, body) = request(
            app,
            "POST",
            "/v1/auth/exchange",
            None,
            None,
            Some(serde_json::json!({"authorizationCode": code})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        body["token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn health_reports_backend_and_provider() {
        let app = test_app().await;
        let (status, body) = request(&app, "GET", "/health", None, None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["storeBackend"], "memory");
        assert_eq!(body["providerMode"], "mock");
    }

    #[tokio::test]
    async fn requests_without_token_are_unauthorized() {
        let app = test_app().await;
        for (method, uri) in [("GET", "/v1/me"), ("GET", "/v1/settlements")] {
            let (status, _) = request(&app, method, uri, None, None, None).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{method} {uri}");
        }
        let (status, _) = request(
            &app,
            "POST",
            "/v1/payments/create",
            None,
            None,
            Some(serde_json::json!({"challengeId": "walk-7000", "amount": 10_000})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn exchange_then_me_roundtrip() {
        let app = test_app().await;
        let token = exchange(&app, "code-1").await;
        let (status, body) = request(&app, "GET", "/v1/me", Some(&token), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["userKey"].as_str().unwrap().starts_with("mock-user-"));
    }

    #[tokio::test]
    async fn full_challenge_flow_over_http() {
        let app = test_app().await;
        let token = exchange(&app, "code-1").await;

        let (status, body) = request(&app, "GET", "/v1/challenges", Some(&token), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["items"].as_array().unwrap().len(), 3);

        let (status, created) = request(
            &app,
            "POST",
            "/v1/payments/create",
            Some(&token),
            None,
            Some(serde_json::json!({"challengeId": "walk-7000", "amount": 10_000})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let payment_id = created["paymentId"].as_str().unwrap().to_string();

        let (status, executed) = request(
            &app,
            "POST",
            "/v1/payments/execute",
            Some(&token),
            None,
            Some(serde_json::json!({"paymentId": payment_id})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(executed["status"], "done");
        assert!(executed["participationId"].is_i64());

        let (status, proof) = request(
            &app,
            "POST",
            "/v1/proofs/submit",
            Some(&token),
            None,
            Some(serde_json::json!({"challengeId": "walk-7000", "imageData": "day-1-photo"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(proof["proofCount"], 1);

        let (status, settlements) =
            request(&app, "GET", "/v1/settlements", Some(&token), None, None).await;
        assert_eq!(status, StatusCode::OK);
        let items = settlements["items"].as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["status"], "running");
        assert_eq!(items[0]["message"], "in progress (1/3 days)");
    }

    #[tokio::test]
    async fn idempotency_header_replays_payment_create() {
        let app = test_app().await;
        let token = exchange(&app, "code-1").await;
        let body = serde_json::json!({"challengeId": "walk-7000", "amount": 10_000});

        let (_, first) = request(
            &app,
            "POST",
            "/v1/payments/create",
            Some(&token),
            Some("create-1"),
            Some(body.clone()),
        )
        .await;
        let (_, second) = request(
            &app,
            "POST",
            "/v1/payments/create",
            Some(&token),
            Some("create-1"),
            Some(body.clone()),
        )
        .await;
        assert_eq!(first, second);

        let (_, third) = request(
            &app,
            "POST",
            "/v1/payments/create",
            Some(&token),
            Some("create-2"),
            Some(body),
        )
        .await;
        assert_ne!(first["paymentId"], third["paymentId"]);
    }

    #[tokio::test]
    async fn unlink_callback_revokes_sessions() {
        let app = test_app().await;
        let token = exchange(&app, "code-1").await;
        let (_, me) = request(&app, "GET", "/v1/me", Some(&token), None, None).await;
        let user_key = me["userKey"].as_str().unwrap().to_string();

        let (status, body) = request(
            &app,
            "POST",
            "/v1/auth/unlink-callback",
            None,
            None,
            Some(serde_json::json!({"userKey": user_key})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "revoked");

        let (status, _) = request(&app, "GET", "/v1/me", Some(&token), None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn error_taxonomy_maps_to_http_statuses() {
        let app = test_app().await;
        let token = exchange(&app, "code-1").await;

        let (status, _) = request(
            &app,
            "POST",
            "/v1/payments/create",
            Some(&token),
            None,
            Some(serde_json::json!({"challengeId": "no-such", "amount": 10_000})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = request(
            &app,
            "POST",
            "/v1/payments/create",
            Some(&token),
            None,
            Some(serde_json::json!({"challengeId": "walk-7000", "amount": 5})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["retryable"], false);

        let (status, _) = request(
            &app,
            "POST",
            "/v1/payouts/result",
            Some(&token),
            None,
            Some(serde_json::json!({"promotionKey": "promo-missing"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn message_send_over_http() {
        let app = test_app().await;
        let token = exchange(&app, "code-1").await;

        let (status, _) = request(
            &app,
            "POST",
            "/v1/messages/send",
            None,
            None,
            Some(serde_json::json!({"templateSetCode": "reminder", "context": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = request(
            &app,
            "POST",
            "/v1/messages/send",
            Some(&token),
            None,
            Some(serde_json::json!({"templateSetCode": "reminder", "context": {"day": 2}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["msgCount"], 1);

        let (status, _) = request(
            &app,
            "POST",
            "/v1/messages/send",
            Some(&token),
            None,
            Some(serde_json::json!({"templateSetCode": "reminder", "context": "nope"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn payout_issue_and_result_over_http() {
        let app = test_app().await;
        let token = exchange(&app, "code-1").await;

        let (status, issued) = request(
            &app,
            "POST",
            "/v1/payouts/issue",
            Some(&token),
            Some("issue-1"),
            Some(serde_json::json!({"promotionCode": "refund", "amountPoints": 10_000})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(issued["status"], "REQUESTED");
        let promotion_key = issued["promotionKey"].as_str().unwrap().to_string();

        // The mock provider looks in-flight on the first poll.
        let (status, first) = request(
            &app,
            "POST",
            "/v1/payouts/result",
            Some(&token),
            None,
            Some(serde_json::json!({"promotionKey": promotion_key})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["status"], "PENDING");

        let (_, second) = request(
            &app,
            "POST",
            "/v1/payouts/result",
            Some(&token),
            None,
            Some(serde_json::json!({"promotionKey": promotion_key})),
        )
        .await;
        assert_eq!(second["status"], "SUCCESS");
    }
}
