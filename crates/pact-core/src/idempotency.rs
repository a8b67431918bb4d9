use std::sync::Arc;

use chrono::Duration;
use serde_json::Value;

use crate::error::CoreError;
use crate::store::Store;

/// Longest client-supplied key accepted before the request is rejected.
pub const MAX_KEY_LEN: usize = 128;

/// What the ledger says about a (scope, key) before the operation runs.
#[derive(Debug, Clone)]
pub enum Gate {
    /// A live cached response exists; return it without re-executing.
    Replay(Value),
    /// First sighting of this key; run the operation, then `commit`.
    Proceed,
}

/// At-most-once gate over the store's (scope, key) -> response table.
///
/// The contract with callers: `begin` before the side effect, `commit` only
/// after full success. A failed operation leaves no ledger row, so the client
/// may retry the same key. Commit races resolve through the store's
/// insert-or-ignore: the loser adopts the winner's response.
#[derive(Clone)]
pub struct IdempotencyLedger {
    store: Arc<dyn Store>,
    ttl: Duration,
}

impl IdempotencyLedger {
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Validate a client-supplied key, or mint one when absent.
    pub fn resolve_key(supplied: Option<&str>) -> Result<String, CoreError> {
        match supplied {
            Some(key) => {
                let key = key.trim();
                if key.is_empty() {
                    return Err(CoreError::Validation(
                        "idempotency key must not be blank".to_string(),
                    ));
                }
                if key.len() > MAX_KEY_LEN {
                    return Err(CoreError::Validation(format!(
                        "idempotency key exceeds {MAX_KEY_LEN} bytes"
                    )));
                }
                Ok(key.to_string())
            }
            None => Ok(format!("auto-{}", uuid::Uuid::new_v4())),
        }
    }

    pub async fn begin(&self, scope: &str, key: &str) -> Result<Gate, CoreError> {
        match self.store.get_idempotency(scope, key).await? {
            Some(cached) => Ok(Gate::Replay(cached)),
            None => Ok(Gate::Proceed),
        }
    }

    /// Record the successful response. Returns the authoritative response:
    /// ours if we won the insert, the concurrent winner's otherwise.
    pub async fn commit(
        &self,
        scope: &str,
        key: &str,
        response: &Value,
    ) -> Result<Value, CoreError> {
        let inserted = self
            .store
            .put_idempotency(scope, key, response, self.ttl)
            .await?;
        if inserted {
            return Ok(response.clone());
        }
        match self.store.get_idempotency(scope, key).await? {
            Some(winner) => Ok(winner),
            // Winner's row expired between insert and read; ours stands.
            None => Ok(response.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use serde_json::json;

    fn ledger() -> IdempotencyLedger {
        IdempotencyLedger::new(Arc::new(MemoryStore::new()), Duration::hours(24))
    }

    #[test]
    fn resolve_key_validates_client_input() {
        assert!(IdempotencyLedger::resolve_key(Some("  ")).is_err());
        assert!(IdempotencyLedger::resolve_key(Some(&"k".repeat(200))).is_err());
        assert_eq!(
            IdempotencyLedger::resolve_key(Some(" key-1 ")).unwrap(),
            "key-1"
        );
        assert!(IdempotencyLedger::resolve_key(None)
            .unwrap()
            .starts_with("auto-"));
    }

    #[tokio::test]
    async fn first_begin_proceeds_then_replays() {
        let ledger = ledger();
        assert!(matches!(
            ledger.begin("payment-create", "k1").await.unwrap(),
            Gate::Proceed
        ));
        ledger
            .commit("payment-create", "k1", &json!({"orderNo": "order-1"}))
            .await
            .unwrap();
        match ledger.begin("payment-create", "k1").await.unwrap() {
            Gate::Replay(cached) => assert_eq!(cached["orderNo"], "order-1"),
            Gate::Proceed => panic!("expected replay"),
        }
    }

    #[tokio::test]
    async fn scopes_partition_the_key_space() {
        let ledger = ledger();
        ledger
            .commit("payment-create", "k1", &json!({"n": 1}))
            .await
            .unwrap();
        assert!(matches!(
            ledger.begin("payout-issue", "k1").await.unwrap(),
            Gate::Proceed
        ));
    }

    #[tokio::test]
    async fn commit_race_loser_adopts_winner() {
        let ledger = ledger();
        let winner = ledger
            .commit("payout-issue", "k1", &json!({"who": "winner"}))
            .await
            .unwrap();
        assert_eq!(winner["who"], "winner");
        let loser = ledger
            .commit("payout-issue", "k1", &json!({"who": "loser"}))
            .await
            .unwrap();
        assert_eq!(loser["who"], "winner");
    }
}
