use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

/// Account created on first successful login exchange. The provider user key
/// is immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub provider_user_key: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Catalog entry for a behavioral commitment. Read-mostly, externally curated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    pub id: String,
    pub title: String,
    /// Required number of accepted proof days for a refund.
    pub days: i32,
    /// Deposit amount in minor currency units.
    pub deposit: i64,
    pub proof_type: ProofType,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofType {
    Photo,
    Steps,
}

impl ProofType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Steps => "steps",
        }
    }

    pub fn parse(value: &str) -> Result<Self, CoreError> {
        match value {
            "photo" => Ok(Self::Photo),
            "steps" => Ok(Self::Steps),
            other => Err(CoreError::Store(format!("unknown proof type '{other}'"))),
        }
    }
}

/// One user's attempt at one challenge over a fixed date window.
///
/// `active` is the only non-terminal state; `success`/`failed` are absorbing
/// and written exactly once by the settlement resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipationStatus {
    Active,
    Success,
    Failed,
}

impl ParticipationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, CoreError> {
        match value {
            "active" => Ok(Self::Active),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(CoreError::Store(format!(
                "unknown participation status '{other}'"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participation {
    pub id: i64,
    pub user_id: i64,
    pub challenge_id: String,
    pub payment_id: i64,
    pub status: ParticipationStatus,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Derived count of accepted proofs. Always recomputed from the proof
    /// rows, never incremented in place.
    pub proof_count: i32,
    pub created_at: DateTime<Utc>,
}

impl Participation {
    pub fn window_contains(&self, day: NaiveDate) -> bool {
        self.start_date <= day && day <= self.end_date
    }
}

/// Content fingerprint for submitted proof images, used for duplicate
/// detection across users and days.
pub fn image_fingerprint(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Daily evidence submitted against a participation. At most one accepted
/// proof per participation per calendar day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proof {
    pub id: i64,
    pub participation_id: i64,
    pub user_id: i64,
    pub challenge_id: String,
    pub proof_date: NaiveDate,
    pub proof_type: ProofType,
    pub image_hash: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Created,
    Done,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Done => "done",
        }
    }

    pub fn parse(value: &str) -> Result<Self, CoreError> {
        match value {
            "created" => Ok(Self::Created),
            "done" => Ok(Self::Done),
            other => Err(CoreError::Store(format!("unknown payment status '{other}'"))),
        }
    }
}

/// One row of the append-only payment lifecycle log. Each transition is a new
/// row keyed by the shared order number, preserving history for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: i64,
    pub user_id: i64,
    pub challenge_id: String,
    pub order_no: String,
    pub amount: i64,
    pub status: PaymentStatus,
    pub raw: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Running,
    Success,
    Failed,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, CoreError> {
        match value {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(CoreError::Store(format!(
                "unknown settlement status '{other}'"
            ))),
        }
    }
}

/// Financial resolution paired 1:1 with a participation. Mutated only by the
/// settlement resolver, driven off participation status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settlement {
    pub id: i64,
    pub participation_id: i64,
    pub user_id: i64,
    pub challenge_id: String,
    pub payment_id: i64,
    pub status: SettlementStatus,
    pub refundable: bool,
    pub deposit_amount: i64,
    pub created_at: DateTime<Utc>,
}

/// Settlement joined with participation progress for user-facing listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementView {
    #[serde(flatten)]
    pub settlement: Settlement,
    pub proof_count: i32,
    pub required_days: i32,
}

impl SettlementView {
    pub fn message(&self) -> String {
        match self.settlement.status {
            SettlementStatus::Running => format!(
                "in progress ({}/{} days)",
                self.proof_count, self.required_days
            ),
            SettlementStatus::Success => "succeeded - refund scheduled".to_string(),
            SettlementStatus::Failed => "not completed".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayoutStatus {
    #[serde(rename = "REQUESTED")]
    Requested,
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAIL")]
    Fail,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "REQUESTED",
            Self::Pending => "PENDING",
            Self::Success => "SUCCESS",
            Self::Fail => "FAIL",
        }
    }

    pub fn parse(value: &str) -> Result<Self, CoreError> {
        match value {
            "REQUESTED" => Ok(Self::Requested),
            "PENDING" => Ok(Self::Pending),
            "SUCCESS" => Ok(Self::Success),
            "FAIL" => Ok(Self::Fail),
            other => Err(CoreError::Store(format!("unknown payout status '{other}'"))),
        }
    }

    /// SUCCESS and FAIL are sticky: the reconciler must not touch a payout
    /// again once it reached either.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Fail)
    }
}

/// A reward disbursement request tracked against the provider's async job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payout {
    pub id: i64,
    pub user_id: i64,
    pub promotion_code: String,
    /// Provider-issued correlation id for the async execution job.
    pub promotion_key: String,
    pub amount_points: i64,
    pub status: PayoutStatus,
    pub raw: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payout joined with the owning user's provider key, as needed by the
/// reconciler's provider calls.
#[derive(Debug, Clone)]
pub struct PayoutWithUser {
    pub payout: Payout,
    pub provider_user_key: String,
}

/// Outcome counters for one batch job run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchOutcome {
    pub processed: u64,
    pub failed: u64,
    pub errors: Vec<String>,
}

/// Counters surfaced by the stats job for monitoring.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchStats {
    pub active_participations: u64,
    pub running_settlements: u64,
    pub idempotency_keys: u64,
    pub revoked_sessions: u64,
}

/// Default challenge catalog seeded at bootstrap when the table is empty.
pub fn default_challenges() -> Vec<Challenge> {
    vec![
        Challenge {
            id: "walk-7000".to_string(),
            title: "Walk 7,000 steps every day".to_string(),
            days: 3,
            deposit: 10_000,
            proof_type: ProofType::Steps,
            is_active: true,
        },
        Challenge {
            id: "bed-0700".to_string(),
            title: "Make your bed by 7 AM".to_string(),
            days: 3,
            deposit: 10_000,
            proof_type: ProofType::Photo,
            is_active: true,
        },
        Challenge {
            id: "lunch-proof".to_string(),
            title: "Packed lunch or salad".to_string(),
            days: 3,
            deposit: 10_000,
            proof_type: ProofType::Photo,
            is_active: true,
        },
    ]
}
