use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

use crate::error::CoreError;
use crate::provider::PayoutOutcome;
use crate::store::{NewPayment, NewPayout, PaymentExecution, Store};
use crate::types::{
    BatchOutcome, BatchStats, Challenge, Participation, ParticipationStatus, Payment,
    PaymentStatus, Payout, PayoutStatus, PayoutWithUser, Proof, ProofType, Settlement,
    SettlementStatus, SettlementView, User,
};

/// PostgreSQL store. Uniqueness constraints carry the correctness load:
/// conflict-do-nothing inserts make execute-payment and the idempotency
/// ledger safe across concurrent processes, and the guarded payout update
/// keeps terminal states sticky without ever reading before writing.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, CoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| CoreError::store("postgres connect failed", e))?;
        Ok(Self { pool })
    }

    pub async fn bootstrap(database_url: &str, max_connections: u32) -> Result<Self, CoreError> {
        let store = Self::connect(database_url, max_connections).await?;
        store.ensure_schema().await?;
        Ok(store)
    }

    pub async fn ensure_schema(&self) -> Result<(), CoreError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS app_user (
                id BIGSERIAL PRIMARY KEY,
                provider_user_key TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL DEFAULT 'active',
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS challenge (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                days INT NOT NULL,
                deposit BIGINT NOT NULL,
                proof_type TEXT NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT TRUE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS payment (
                id BIGSERIAL PRIMARY KEY,
                user_id BIGINT NOT NULL REFERENCES app_user(id),
                challenge_id TEXT NOT NULL REFERENCES challenge(id),
                order_no TEXT NOT NULL,
                amount BIGINT NOT NULL,
                status TEXT NOT NULL,
                raw JSONB NOT NULL DEFAULT '{}'::jsonb,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_payment_order_no ON payment (order_no)",
            // At most one `done` row per order, enforced by the database so
            // concurrent executes cannot both append under READ COMMITTED.
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS uq_payment_done_once
                ON payment (order_no) WHERE status = 'done'
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS participation (
                id BIGSERIAL PRIMARY KEY,
                user_id BIGINT NOT NULL REFERENCES app_user(id),
                challenge_id TEXT NOT NULL REFERENCES challenge(id),
                payment_id BIGINT NOT NULL REFERENCES payment(id),
                status TEXT NOT NULL DEFAULT 'active',
                start_date DATE NOT NULL,
                end_date DATE NOT NULL,
                proof_count INT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                UNIQUE (user_id, challenge_id, start_date)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_participation_status_end ON participation (status, end_date)",
            r#"
            CREATE TABLE IF NOT EXISTS proof (
                id BIGSERIAL PRIMARY KEY,
                participation_id BIGINT NOT NULL REFERENCES participation(id),
                user_id BIGINT NOT NULL REFERENCES app_user(id),
                challenge_id TEXT NOT NULL REFERENCES challenge(id),
                proof_date DATE NOT NULL,
                proof_type TEXT NOT NULL,
                image_hash TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'accepted',
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                UNIQUE (participation_id, proof_date)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_proof_image_hash ON proof (image_hash)",
            r#"
            CREATE TABLE IF NOT EXISTS settlement (
                id BIGSERIAL PRIMARY KEY,
                participation_id BIGINT NOT NULL UNIQUE REFERENCES participation(id),
                user_id BIGINT NOT NULL REFERENCES app_user(id),
                challenge_id TEXT NOT NULL REFERENCES challenge(id),
                payment_id BIGINT NOT NULL REFERENCES payment(id),
                status TEXT NOT NULL DEFAULT 'running',
                refundable BOOLEAN NOT NULL DEFAULT FALSE,
                deposit_amount BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS payout (
                id BIGSERIAL PRIMARY KEY,
                user_id BIGINT NOT NULL REFERENCES app_user(id),
                promotion_code TEXT NOT NULL,
                promotion_key TEXT NOT NULL UNIQUE,
                amount_points BIGINT NOT NULL,
                status TEXT NOT NULL DEFAULT 'REQUESTED',
                raw JSONB NOT NULL DEFAULT '{}'::jsonb,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_payout_status_updated ON payout (status, updated_at)",
            r#"
            CREATE TABLE IF NOT EXISTS idempotency (
                scope TEXT NOT NULL,
                idem_key TEXT NOT NULL,
                response JSONB NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (scope, idem_key)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS revoked_session (
                subject TEXT PRIMARY KEY,
                reason TEXT NOT NULL,
                revoked_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| CoreError::store("postgres schema create failed", e))?;
        }
        Ok(())
    }
}

fn user_from_row(row: &PgRow) -> Result<User, CoreError> {
    Ok(User {
        id: row
            .try_get("id")
            .map_err(|e| CoreError::store("decode user", e))?,
        provider_user_key: row
            .try_get("provider_user_key")
            .map_err(|e| CoreError::store("decode user", e))?,
        status: row
            .try_get("status")
            .map_err(|e| CoreError::store("decode user", e))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| CoreError::store("decode user", e))?,
    })
}

fn challenge_from_row(row: &PgRow) -> Result<Challenge, CoreError> {
    let proof_type: String = row
        .try_get("proof_type")
        .map_err(|e| CoreError::store("decode challenge", e))?;
    Ok(Challenge {
        id: row
            .try_get("id")
            .map_err(|e| CoreError::store("decode challenge", e))?,
        title: row
            .try_get("title")
            .map_err(|e| CoreError::store("decode challenge", e))?,
        days: row
            .try_get("days")
            .map_err(|e| CoreError::store("decode challenge", e))?,
        deposit: row
            .try_get("deposit")
            .map_err(|e| CoreError::store("decode challenge", e))?,
        proof_type: ProofType::parse(&proof_type)?,
        is_active: row
            .try_get("is_active")
            .map_err(|e| CoreError::store("decode challenge", e))?,
    })
}

fn payment_from_row(row: &PgRow) -> Result<Payment, CoreError> {
    let status: String = row
        .try_get("status")
        .map_err(|e| CoreError::store("decode payment", e))?;
    Ok(Payment {
        id: row
            .try_get("id")
            .map_err(|e| CoreError::store("decode payment", e))?,
        user_id: row
            .try_get("user_id")
            .map_err(|e| CoreError::store("decode payment", e))?,
        challenge_id: row
            .try_get("challenge_id")
            .map_err(|e| CoreError::store("decode payment", e))?,
        order_no: row
            .try_get("order_no")
            .map_err(|e| CoreError::store("decode payment", e))?,
        amount: row
            .try_get("amount")
            .map_err(|e| CoreError::store("decode payment", e))?,
        status: PaymentStatus::parse(&status)?,
        raw: row
            .try_get("raw")
            .map_err(|e| CoreError::store("decode payment", e))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| CoreError::store("decode payment", e))?,
    })
}

fn participation_from_row(row: &PgRow) -> Result<Participation, CoreError> {
    let status: String = row
        .try_get("status")
        .map_err(|e| CoreError::store("decode participation", e))?;
    Ok(Participation {
        id: row
            .try_get("id")
            .map_err(|e| CoreError::store("decode participation", e))?,
        user_id: row
            .try_get("user_id")
            .map_err(|e| CoreError::store("decode participation", e))?,
        challenge_id: row
            .try_get("challenge_id")
            .map_err(|e| CoreError::store("decode participation", e))?,
        payment_id: row
            .try_get("payment_id")
            .map_err(|e| CoreError::store("decode participation", e))?,
        status: ParticipationStatus::parse(&status)?,
        start_date: row
            .try_get("start_date")
            .map_err(|e| CoreError::store("decode participation", e))?,
        end_date: row
            .try_get("end_date")
            .map_err(|e| CoreError::store("decode participation", e))?,
        proof_count: row
            .try_get("proof_count")
            .map_err(|e| CoreError::store("decode participation", e))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| CoreError::store("decode participation", e))?,
    })
}

fn proof_from_row(row: &PgRow) -> Result<Proof, CoreError> {
    let proof_type: String = row
        .try_get("proof_type")
        .map_err(|e| CoreError::store("decode proof", e))?;
    Ok(Proof {
        id: row
            .try_get("id")
            .map_err(|e| CoreError::store("decode proof", e))?,
        participation_id: row
            .try_get("participation_id")
            .map_err(|e| CoreError::store("decode proof", e))?,
        user_id: row
            .try_get("user_id")
            .map_err(|e| CoreError::store("decode proof", e))?,
        challenge_id: row
            .try_get("challenge_id")
            .map_err(|e| CoreError::store("decode proof", e))?,
        proof_date: row
            .try_get("proof_date")
            .map_err(|e| CoreError::store("decode proof", e))?,
        proof_type: ProofType::parse(&proof_type)?,
        image_hash: row
            .try_get("image_hash")
            .map_err(|e| CoreError::store("decode proof", e))?,
        status: row
            .try_get("status")
            .map_err(|e| CoreError::store("decode proof", e))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| CoreError::store("decode proof", e))?,
    })
}

fn settlement_from_row(row: &PgRow) -> Result<Settlement, CoreError> {
    let status: String = row
        .try_get("status")
        .map_err(|e| CoreError::store("decode settlement", e))?;
    Ok(Settlement {
        id: row
            .try_get("id")
            .map_err(|e| CoreError::store("decode settlement", e))?,
        participation_id: row
            .try_get("participation_id")
            .map_err(|e| CoreError::store("decode settlement", e))?,
        user_id: row
            .try_get("user_id")
            .map_err(|e| CoreError::store("decode settlement", e))?,
        challenge_id: row
            .try_get("challenge_id")
            .map_err(|e| CoreError::store("decode settlement", e))?,
        payment_id: row
            .try_get("payment_id")
            .map_err(|e| CoreError::store("decode settlement", e))?,
        status: SettlementStatus::parse(&status)?,
        refundable: row
            .try_get("refundable")
            .map_err(|e| CoreError::store("decode settlement", e))?,
        deposit_amount: row
            .try_get("deposit_amount")
            .map_err(|e| CoreError::store("decode settlement", e))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| CoreError::store("decode settlement", e))?,
    })
}

fn payout_from_row(row: &PgRow) -> Result<Payout, CoreError> {
    let status: String = row
        .try_get("status")
        .map_err(|e| CoreError::store("decode payout", e))?;
    Ok(Payout {
        id: row
            .try_get("id")
            .map_err(|e| CoreError::store("decode payout", e))?,
        user_id: row
            .try_get("user_id")
            .map_err(|e| CoreError::store("decode payout", e))?,
        promotion_code: row
            .try_get("promotion_code")
            .map_err(|e| CoreError::store("decode payout", e))?,
        promotion_key: row
            .try_get("promotion_key")
            .map_err(|e| CoreError::store("decode payout", e))?,
        amount_points: row
            .try_get("amount_points")
            .map_err(|e| CoreError::store("decode payout", e))?,
        status: PayoutStatus::parse(&status)?,
        raw: row
            .try_get("raw")
            .map_err(|e| CoreError::store("decode payout", e))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| CoreError::store("decode payout", e))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| CoreError::store("decode payout", e))?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> Result<(), CoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::store("postgres ping failed", e))?;
        Ok(())
    }

    async fn upsert_user(&self, provider_user_key: &str) -> Result<User, CoreError> {
        // The no-op DO UPDATE makes RETURNING yield the row on both paths.
        let row = sqlx::query(
            r#"
            INSERT INTO app_user (provider_user_key)
            VALUES ($1)
            ON CONFLICT (provider_user_key)
                DO UPDATE SET provider_user_key = EXCLUDED.provider_user_key
            RETURNING id, provider_user_key, status, created_at
            "#,
        )
        .bind(provider_user_key)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| CoreError::store("upsert user failed", e))?;
        user_from_row(&row)
    }

    async fn find_user(&self, provider_user_key: &str) -> Result<Option<User>, CoreError> {
        let row = sqlx::query(
            "SELECT id, provider_user_key, status, created_at FROM app_user WHERE provider_user_key = $1",
        )
        .bind(provider_user_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::store("find user failed", e))?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn list_challenges(&self) -> Result<Vec<Challenge>, CoreError> {
        let rows = sqlx::query(
            "SELECT id, title, days, deposit, proof_type, is_active FROM challenge WHERE is_active ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::store("list challenges failed", e))?;
        rows.iter().map(challenge_from_row).collect()
    }

    async fn get_challenge(&self, id: &str) -> Result<Option<Challenge>, CoreError> {
        let row = sqlx::query(
            "SELECT id, title, days, deposit, proof_type, is_active FROM challenge WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::store("get challenge failed", e))?;
        row.as_ref().map(challenge_from_row).transpose()
    }

    async fn seed_challenges(&self, items: &[Challenge]) -> Result<(), CoreError> {
        for item in items {
            sqlx::query(
                r#"
                INSERT INTO challenge (id, title, days, deposit, proof_type, is_active)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(&item.id)
            .bind(&item.title)
            .bind(item.days)
            .bind(item.deposit)
            .bind(item.proof_type.as_str())
            .bind(item.is_active)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::store("seed challenge failed", e))?;
        }
        Ok(())
    }

    async fn create_payment(&self, new: NewPayment) -> Result<Payment, CoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO payment (user_id, challenge_id, order_no, amount, status, raw)
            VALUES ($1, $2, $3, $4, 'created', $5)
            RETURNING id, user_id, challenge_id, order_no, amount, status, raw, created_at
            "#,
        )
        .bind(new.user_id)
        .bind(&new.challenge_id)
        .bind(&new.order_no)
        .bind(new.amount)
        .bind(&new.raw)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| CoreError::store("create payment failed", e))?;
        payment_from_row(&row)
    }

    async fn execute_payment(
        &self,
        order_no: &str,
        today: NaiveDate,
        raw: Value,
    ) -> Result<PaymentExecution, CoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CoreError::store("begin execute-payment tx failed", e))?;

        // Lock the created row; refuse if the order was already executed.
        let created = sqlx::query(
            r#"
            SELECT id, user_id, challenge_id, order_no, amount, status, raw, created_at
            FROM payment
            WHERE order_no = $1
              AND status = 'created'
              AND NOT EXISTS (
                  SELECT 1 FROM payment WHERE order_no = $1 AND status = 'done'
              )
            FOR UPDATE
            "#,
        )
        .bind(order_no)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| CoreError::store("load payment failed", e))?;
        let Some(created) = created else {
            return Err(CoreError::NotFound(
                "payment not found or already executed".to_string(),
            ));
        };
        let created = payment_from_row(&created)?;

        let days: i32 = sqlx::query("SELECT days FROM challenge WHERE id = $1")
            .bind(&created.challenge_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| CoreError::store("load challenge failed", e))?
            .try_get("days")
            .map_err(|e| CoreError::store("decode challenge", e))?;

        let done = sqlx::query(
            r#"
            INSERT INTO payment (user_id, challenge_id, order_no, amount, status, raw)
            VALUES ($1, $2, $3, $4, 'done', $5)
            RETURNING id, user_id, challenge_id, order_no, amount, status, raw, created_at
            "#,
        )
        .bind(created.user_id)
        .bind(&created.challenge_id)
        .bind(&created.order_no)
        .bind(created.amount)
        .bind(&raw)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            // Lost the uq_payment_done_once race to a concurrent execute.
            if e.as_database_error()
                .is_some_and(|db| db.is_unique_violation())
            {
                CoreError::NotFound("payment not found or already executed".to_string())
            } else {
                CoreError::store("append done payment failed", e)
            }
        })?;
        let done = payment_from_row(&done)?;

        let end_date = today + Duration::days(i64::from(days) - 1);
        let participation_id: Option<i64> = sqlx::query(
            r#"
            INSERT INTO participation
                (user_id, challenge_id, payment_id, start_date, end_date)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, challenge_id, start_date) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(done.user_id)
        .bind(&done.challenge_id)
        .bind(done.id)
        .bind(today)
        .bind(end_date)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| CoreError::store("insert participation failed", e))?
        .map(|row| row.try_get("id"))
        .transpose()
        .map_err(|e| CoreError::store("decode participation id", e))?;

        // Settlement only when this call actually created the participation.
        if let Some(participation_id) = participation_id {
            sqlx::query(
                r#"
                INSERT INTO settlement
                    (participation_id, user_id, challenge_id, payment_id, deposit_amount)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (participation_id) DO NOTHING
                "#,
            )
            .bind(participation_id)
            .bind(done.user_id)
            .bind(&done.challenge_id)
            .bind(done.id)
            .bind(done.amount)
            .execute(&mut *tx)
            .await
            .map_err(|e| CoreError::store("insert settlement failed", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| CoreError::store("commit execute-payment tx failed", e))?;

        Ok(PaymentExecution {
            payment: done,
            participation_id,
        })
    }

    async fn find_payment(&self, order_no: &str) -> Result<Option<Payment>, CoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, challenge_id, order_no, amount, status, raw, created_at
            FROM payment WHERE order_no = $1 ORDER BY id DESC LIMIT 1
            "#,
        )
        .bind(order_no)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::store("find payment failed", e))?;
        row.as_ref().map(payment_from_row).transpose()
    }

    async fn active_participation(
        &self,
        user_id: i64,
        challenge_id: &str,
        today: NaiveDate,
    ) -> Result<Option<Participation>, CoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, challenge_id, payment_id, status,
                   start_date, end_date, proof_count, created_at
            FROM participation
            WHERE user_id = $1 AND challenge_id = $2 AND status = 'active'
              AND start_date <= $3 AND end_date >= $3
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(challenge_id)
        .bind(today)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::store("find active participation failed", e))?;
        row.as_ref().map(participation_from_row).transpose()
    }

    async fn get_participation(&self, id: i64) -> Result<Option<Participation>, CoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, challenge_id, payment_id, status,
                   start_date, end_date, proof_count, created_at
            FROM participation WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::store("get participation failed", e))?;
        row.as_ref().map(participation_from_row).transpose()
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
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CoreError::store("begin proof tx failed", e))?;

        let row = sqlx::query(
            r#"
            INSERT INTO proof
                (participation_id, user_id, challenge_id, proof_date, proof_type, image_hash)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (participation_id, proof_date) DO UPDATE
                SET image_hash = EXCLUDED.image_hash,
                    status = 'accepted',
                    created_at = now()
            RETURNING id, participation_id, user_id, challenge_id, proof_date,
                      proof_type, image_hash, status, created_at
            "#,
        )
        .bind(participation_id)
        .bind(user_id)
        .bind(challenge_id)
        .bind(proof_date)
        .bind(proof_type.as_str())
        .bind(image_hash)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| CoreError::store("upsert proof failed", e))?;
        let proof = proof_from_row(&row)?;

        // proof_count is always a recount, never an increment.
        sqlx::query(
            r#"
            UPDATE participation
            SET proof_count = (
                SELECT COUNT(*) FROM proof
                WHERE participation_id = $1 AND status = 'accepted'
            )
            WHERE id = $1
            "#,
        )
        .bind(participation_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| CoreError::store("recount proofs failed", e))?;

        tx.commit()
            .await
            .map_err(|e| CoreError::store("commit proof tx failed", e))?;
        Ok(proof)
    }

    async fn find_foreign_proof_by_hash(
        &self,
        image_hash: &str,
        excluding_user_id: i64,
    ) -> Result<Option<Proof>, CoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, participation_id, user_id, challenge_id, proof_date,
                   proof_type, image_hash, status, created_at
            FROM proof
            WHERE image_hash = $1 AND user_id <> $2 AND status = 'accepted'
            LIMIT 1
            "#,
        )
        .bind(image_hash)
        .bind(excluding_user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::store("find foreign proof failed", e))?;
        row.as_ref().map(proof_from_row).transpose()
    }

    async fn find_own_proof_by_hash(
        &self,
        image_hash: &str,
        user_id: i64,
    ) -> Result<Option<Proof>, CoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, participation_id, user_id, challenge_id, proof_date,
                   proof_type, image_hash, status, created_at
            FROM proof
            WHERE image_hash = $1 AND user_id = $2 AND status = 'accepted'
            LIMIT 1
            "#,
        )
        .bind(image_hash)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::store("find own proof failed", e))?;
        row.as_ref().map(proof_from_row).transpose()
    }

    async fn count_accepted_proofs(&self, participation_id: i64) -> Result<i64, CoreError> {
        sqlx::query(
            "SELECT COUNT(*) AS n FROM proof WHERE participation_id = $1 AND status = 'accepted'",
        )
        .bind(participation_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| CoreError::store("count proofs failed", e))?
        .try_get("n")
        .map_err(|e| CoreError::store("decode proof count", e))
    }

    async fn insert_payout(&self, new: NewPayout) -> Result<Payout, CoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO payout (user_id, promotion_code, promotion_key, amount_points, raw)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, user_id, promotion_code, promotion_key, amount_points,
                      status, raw, created_at, updated_at
            "#,
        )
        .bind(new.user_id)
        .bind(&new.promotion_code)
        .bind(&new.promotion_key)
        .bind(new.amount_points)
        .bind(&new.raw)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| CoreError::store("insert payout failed", e))?;
        payout_from_row(&row)
    }

    async fn update_payout_status(
        &self,
        promotion_key: &str,
        outcome: PayoutOutcome,
        raw: Value,
    ) -> Result<bool, CoreError> {
        // The status guard keeps terminal states sticky without a read.
        let result = sqlx::query(
            r#"
            UPDATE payout
            SET status = $2, raw = $3, updated_at = now()
            WHERE promotion_key = $1 AND status IN ('REQUESTED', 'PENDING')
            "#,
        )
        .bind(promotion_key)
        .bind(outcome.as_str())
        .bind(&raw)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::store("update payout failed", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_payout(&self, promotion_key: &str) -> Result<Option<Payout>, CoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, promotion_code, promotion_key, amount_points,
                   status, raw, created_at, updated_at
            FROM payout WHERE promotion_key = $1
            "#,
        )
        .bind(promotion_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::store("get payout failed", e))?;
        row.as_ref().map(payout_from_row).transpose()
    }

    async fn list_unresolved_payouts(
        &self,
        limit: i64,
    ) -> Result<Vec<PayoutWithUser>, CoreError> {
        let rows = sqlx::query(
            r#"
            SELECT p.id, p.user_id, p.promotion_code, p.promotion_key, p.amount_points,
                   p.status, p.raw, p.created_at, p.updated_at,
                   u.provider_user_key
            FROM payout p
            JOIN app_user u ON u.id = p.user_id
            WHERE p.status IN ('REQUESTED', 'PENDING')
            ORDER BY p.updated_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::store("list unresolved payouts failed", e))?;

        rows.iter()
            .map(|row| {
                Ok(PayoutWithUser {
                    payout: payout_from_row(row)?,
                    provider_user_key: row
                        .try_get("provider_user_key")
                        .map_err(|e| CoreError::store("decode payout user", e))?,
                })
            })
            .collect()
    }

    async fn list_settlements(&self, user_id: i64) -> Result<Vec<SettlementView>, CoreError> {
        let rows = sqlx::query(
            r#"
            SELECT s.id, s.participation_id, s.user_id, s.challenge_id, s.payment_id,
                   s.status, s.refundable, s.deposit_amount, s.created_at,
                   p.proof_count, c.days AS required_days
            FROM settlement s
            JOIN participation p ON p.id = s.participation_id
            JOIN challenge c ON c.id = s.challenge_id
            WHERE s.user_id = $1
            ORDER BY s.created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::store("list settlements failed", e))?;

        rows.iter()
            .map(|row| {
                Ok(SettlementView {
                    settlement: settlement_from_row(row)?,
                    proof_count: row
                        .try_get("proof_count")
                        .map_err(|e| CoreError::store("decode settlement view", e))?,
                    required_days: row
                        .try_get("required_days")
                        .map_err(|e| CoreError::store("decode settlement view", e))?,
                })
            })
            .collect()
    }

    async fn get_idempotency(&self, scope: &str, key: &str) -> Result<Option<Value>, CoreError> {
        let row = sqlx::query(
            r#"
            SELECT response FROM idempotency
            WHERE scope = $1 AND idem_key = $2 AND expires_at > now()
            "#,
        )
        .bind(scope)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::store("get idempotency failed", e))?;
        row.map(|row| {
            row.try_get("response")
                .map_err(|e| CoreError::store("decode idempotency response", e))
        })
        .transpose()
    }

    async fn put_idempotency(
        &self,
        scope: &str,
        key: &str,
        response: &Value,
        ttl: Duration,
    ) -> Result<bool, CoreError> {
        // Insert-or-ignore against live rows; an expired row may be reclaimed.
        let expires_at = Utc::now() + ttl;
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency (scope, idem_key, response, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (scope, idem_key) DO UPDATE
                SET response = EXCLUDED.response,
                    expires_at = EXCLUDED.expires_at,
                    created_at = now()
                WHERE idempotency.expires_at <= now()
            "#,
        )
        .bind(scope)
        .bind(key)
        .bind(response)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::store("put idempotency failed", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke_session(&self, subject: &str, reason: &str) -> Result<(), CoreError> {
        let subject = subject.trim();
        if subject.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            INSERT INTO revoked_session (subject, reason)
            VALUES ($1, $2)
            ON CONFLICT (subject) DO UPDATE
                SET reason = EXCLUDED.reason, revoked_at = now()
            "#,
        )
        .bind(subject)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::store("revoke session failed", e))?;
        Ok(())
    }

    async fn is_session_revoked(&self, subject: &str) -> Result<bool, CoreError> {
        let subject = subject.trim();
        if subject.is_empty() {
            return Ok(false);
        }
        let row = sqlx::query("SELECT 1 FROM revoked_session WHERE subject = $1")
            .bind(subject)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CoreError::store("revocation check failed", e))?;
        Ok(row.is_some())
    }

    async fn close_expired_participations(
        &self,
        today: NaiveDate,
    ) -> Result<BatchOutcome, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE participation p
            SET status = CASE WHEN p.proof_count >= c.days THEN 'success' ELSE 'failed' END
            FROM challenge c
            WHERE c.id = p.challenge_id
              AND p.status = 'active'
              AND p.end_date < $1
            "#,
        )
        .bind(today)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::store("close participations failed", e))?;
        Ok(BatchOutcome {
            processed: result.rows_affected(),
            ..BatchOutcome::default()
        })
    }

    async fn update_settlement_statuses(&self) -> Result<BatchOutcome, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE settlement s
            SET status = p.status,
                refundable = (p.status = 'success')
            FROM participation p
            WHERE p.id = s.participation_id
              AND s.status = 'running'
              AND p.status IN ('success', 'failed')
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::store("update settlements failed", e))?;
        Ok(BatchOutcome {
            processed: result.rows_affected(),
            ..BatchOutcome::default()
        })
    }

    async fn cleanup_expired_idempotency(&self) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM idempotency WHERE expires_at <= now()")
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::store("cleanup idempotency failed", e))?;
        Ok(result.rows_affected())
    }

    async fn cleanup_revoked_sessions(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM revoked_session WHERE revoked_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::store("cleanup sessions failed", e))?;
        Ok(result.rows_affected())
    }

    async fn batch_stats(&self) -> Result<BatchStats, CoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM participation WHERE status = 'active') AS active_participations,
                (SELECT COUNT(*) FROM settlement WHERE status = 'running') AS running_settlements,
                (SELECT COUNT(*) FROM idempotency WHERE expires_at > now()) AS idempotency_keys,
                (SELECT COUNT(*) FROM revoked_session) AS revoked_sessions
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| CoreError::store("batch stats failed", e))?;

        let field = |name: &str| -> Result<u64, CoreError> {
            let value: i64 = row
                .try_get(name)
                .map_err(|e| CoreError::store("decode batch stats", e))?;
            Ok(value.max(0) as u64)
        };
        Ok(BatchStats {
            active_participations: field("active_participations")?,
            running_settlements: field("running_settlements")?,
            idempotency_keys: field("idempotency_keys")?,
            revoked_sessions: field("revoked_sessions")?,
        })
    }
}
