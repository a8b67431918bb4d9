//! Pact core: commitment settlement and payout reconciliation.
//!
//! Users stake a deposit against a time-boxed behavioral challenge, submit
//! daily proofs, and get the deposit back when they complete the window. This
//! crate holds the domain types, the `Store` seam with Memory and Postgres
//! backends, the payment-provider capability trait, the idempotency ledger,
//! the request-path engine, and the batch jobs (settlement resolver, payout
//! reconciler, cleanups).

#![deny(unsafe_code)]

pub mod batch;
pub mod engine;
pub mod error;
pub mod idempotency;
pub mod memory;
pub mod postgres;
pub mod provider;
pub mod store;
pub mod types;

pub use batch::{
    close_participations, cleanup_idempotency, cleanup_sessions, reconcile_payouts, stats,
    update_settlements, ReconcileOutcome,
};
pub use engine::{Engine, EngineConfig};
pub use error::CoreError;
pub use idempotency::{Gate, IdempotencyLedger};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use provider::{
    ExecutionResult, LoginSession, MessageAck, PaymentAck, PaymentExecutionAck, PaymentProvider,
    PayoutOutcome, PromotionAck, PromotionKey, ProviderEnvelope, ProviderError, ResolvedEnvelope,
};
pub use store::{NewPayment, NewPayout, PaymentExecution, Store};
pub use types::{
    default_challenges, image_fingerprint, BatchOutcome, BatchStats, Challenge, Participation,
    ParticipationStatus, Payment, PaymentStatus, Payout, PayoutStatus, PayoutWithUser, Proof,
    ProofType, Settlement, SettlementStatus, SettlementView, User,
};
