//! src/repository.rs
//! Transactional persistence port for position aggregates and the
//! PostgreSQL implementation.
//!
//! Unique constraints are the idempotency backstop: a violation on the
//! ticker key means a concurrent worker created the row first, a violation
//! on the transaction id means the event was already folded in. Both are
//! translated to typed errors by SQLSTATE + constraint name, never by
//! message-string matching.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use thiserror::Error;
use uuid::Uuid;

use crate::position::{Currency, Position};

/// PostgreSQL SQLSTATE class 23: integrity constraint violation.
const UNIQUE_VIOLATION: &str = "23505";

const TICKER_CONSTRAINT: &str = "positions_ticker_key";
const TRANSACTION_CONSTRAINT: &str = "position_transactions_transaction_id_key";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a position for ticker {0} already exists")]
    DuplicatedPosition(String),

    #[error("transaction {0} was already processed")]
    AlreadyProcessed(Uuid),

    #[error("persistence failure: {0}")]
    Persistence(#[from] sqlx::Error),
}

impl StoreError {
    /// Serialization failures, deadlocks and connection faults are worth
    /// another transaction attempt; constraint violations carry meaning
    /// and are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Persistence(sqlx::Error::Database(db)) => matches!(
                db.code().as_deref(),
                Some("40001") | Some("40P01") | Some("25001")
            ),
            StoreError::Persistence(
                sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::Protocol(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed,
            ) => true,
            _ => false,
        }
    }
}

/// Transactional contract for position persistence. Every call runs inside
/// the unit of work that created the store; row locks taken through it are
/// held until commit or rollback.
#[async_trait]
pub trait PositionStore: Send {
    async fn find_by_ticker(&mut self, ticker: &str) -> Result<Option<Position>, StoreError>;

    /// Like `find_by_ticker` but takes a row-level lock, serializing
    /// concurrent mutators of the same aggregate.
    async fn find_by_ticker_for_update(
        &mut self,
        ticker: &str,
    ) -> Result<Option<Position>, StoreError>;

    /// Insert a new aggregate and its transaction identities. Returns the
    /// persisted aggregate with its assigned id.
    async fn save(&mut self, position: Position) -> Result<Position, StoreError>;

    /// Update an existing aggregate and reconcile its transaction-id set by
    /// set difference against the stored rows.
    async fn update_with_transactions(
        &mut self,
        position: Position,
    ) -> Result<Position, StoreError>;

    async fn is_transaction_processed(
        &mut self,
        position_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<bool, StoreError>;
}

/// Postgres unit of work: owns one transaction for the lifetime of a single
/// message's processing.
pub struct PgPositionStore {
    tx: Transaction<'static, Postgres>,
}

impl PgPositionStore {
    pub async fn begin(pool: &PgPool) -> Result<Self, StoreError> {
        let tx = pool.begin().await?;
        Ok(Self { tx })
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) {
        // A failed rollback just means the connection is going away.
        let _ = self.tx.rollback().await;
    }

    async fn fetch_position(
        &mut self,
        ticker: &str,
        lock: bool,
    ) -> Result<Option<Position>, StoreError> {
        let sql = if lock {
            "SELECT id, ticker, currency, shares_owned, average_cost_per_share,
                    total_invested_amount, total_transaction_fees, latest_market_price,
                    first_purchase_date, last_event_applied_at, is_active,
                    exchange, country, updated_at
             FROM positions
             WHERE ticker = $1
             FOR UPDATE"
        } else {
            "SELECT id, ticker, currency, shares_owned, average_cost_per_share,
                    total_invested_amount, total_transaction_fees, latest_market_price,
                    first_purchase_date, last_event_applied_at, is_active,
                    exchange, country, updated_at
             FROM positions
             WHERE ticker = $1"
        };

        let row = sqlx::query(sql)
            .bind(ticker)
            .fetch_optional(self.tx.as_mut())
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut position = row_to_position(&row)?;
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT transaction_id FROM position_transactions WHERE position_id = $1",
        )
        .bind(position.id)
        .fetch_all(self.tx.as_mut())
        .await?;
        position.transactions = ids.into_iter().collect();

        Ok(Some(position))
    }

    async fn insert_transaction_id(
        &mut self,
        position_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO position_transactions (position_id, transaction_id) VALUES ($1, $2)",
        )
        .bind(position_id)
        .bind(transaction_id)
        .execute(self.tx.as_mut())
        .await
        .map_err(|e| translate_unique_violation(e, "", transaction_id))?;
        Ok(())
    }
}

#[async_trait]
impl PositionStore for PgPositionStore {
    async fn find_by_ticker(&mut self, ticker: &str) -> Result<Option<Position>, StoreError> {
        self.fetch_position(ticker, false).await
    }

    async fn find_by_ticker_for_update(
        &mut self,
        ticker: &str,
    ) -> Result<Option<Position>, StoreError> {
        self.fetch_position(ticker, true).await
    }

    async fn save(&mut self, mut position: Position) -> Result<Position, StoreError> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO positions
                (id, ticker, currency, shares_owned, average_cost_per_share,
                 total_invested_amount, total_transaction_fees, latest_market_price,
                 first_purchase_date, last_event_applied_at, is_active,
                 exchange, country, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14)",
        )
        .bind(id)
        .bind(&position.ticker)
        .bind(position.currency.as_str())
        .bind(position.shares_owned)
        .bind(position.average_cost_per_share)
        .bind(position.total_invested_amount)
        .bind(position.total_transaction_fees)
        .bind(position.latest_market_price)
        .bind(position.first_purchase_date)
        .bind(position.last_event_applied_at)
        .bind(position.is_active)
        .bind(&position.exchange)
        .bind(&position.country)
        .bind(now)
        .execute(self.tx.as_mut())
        .await
        .map_err(|e| translate_unique_violation(e, &position.ticker, Uuid::nil()))?;

        position.id = Some(id);
        position.last_updated = now.date_naive();
        let ids: Vec<Uuid> = position.transactions.iter().copied().collect();
        for transaction_id in ids {
            self.insert_transaction_id(id, transaction_id).await?;
        }

        Ok(position)
    }

    async fn update_with_transactions(
        &mut self,
        mut position: Position,
    ) -> Result<Position, StoreError> {
        let id = position
            .id
            .ok_or_else(|| StoreError::Persistence(sqlx::Error::RowNotFound))?;
        let now = Utc::now();

        sqlx::query(
            "UPDATE positions SET
                shares_owned = $2,
                average_cost_per_share = $3,
                total_invested_amount = $4,
                total_transaction_fees = $5,
                latest_market_price = $6,
                last_event_applied_at = $7,
                is_active = $8,
                exchange = $9,
                country = $10,
                updated_at = $11
             WHERE id = $1",
        )
        .bind(id)
        .bind(position.shares_owned)
        .bind(position.average_cost_per_share)
        .bind(position.total_invested_amount)
        .bind(position.total_transaction_fees)
        .bind(position.latest_market_price)
        .bind(position.last_event_applied_at)
        .bind(position.is_active)
        .bind(&position.exchange)
        .bind(&position.country)
        .bind(now)
        .execute(self.tx.as_mut())
        .await?;

        position.last_updated = now.date_naive();

        // Reconcile the stored transaction-id set against the aggregate's.
        let stored: Vec<Uuid> = sqlx::query_scalar(
            "SELECT transaction_id FROM position_transactions WHERE position_id = $1",
        )
        .bind(id)
        .fetch_all(self.tx.as_mut())
        .await?;
        let stored: BTreeSet<Uuid> = stored.into_iter().collect();

        let removed: Vec<Uuid> = stored.difference(&position.transactions).copied().collect();
        if !removed.is_empty() {
            sqlx::query(
                "DELETE FROM position_transactions
                 WHERE position_id = $1 AND transaction_id = ANY($2)",
            )
            .bind(id)
            .bind(&removed)
            .execute(self.tx.as_mut())
            .await?;
        }

        let added: Vec<Uuid> = position.transactions.difference(&stored).copied().collect();
        for transaction_id in added {
            self.insert_transaction_id(id, transaction_id).await?;
        }

        Ok(position)
    }

    async fn is_transaction_processed(
        &mut self,
        position_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<bool, StoreError> {
        let processed: bool = sqlx::query_scalar(
            "SELECT EXISTS(
                SELECT 1 FROM position_transactions
                WHERE position_id = $1 AND transaction_id = $2
             )",
        )
        .bind(position_id)
        .bind(transaction_id)
        .fetch_one(self.tx.as_mut())
        .await?;
        Ok(processed)
    }
}

fn row_to_position(row: &PgRow) -> Result<Position, StoreError> {
    let currency: String = row.get("currency");
    let currency = Currency::parse(&currency).map_err(|_| {
        StoreError::Persistence(sqlx::Error::Decode(
            format!("unexpected currency value '{currency}' in positions row").into(),
        ))
    })?;
    let updated_at: chrono::DateTime<Utc> = row.get("updated_at");

    Ok(Position {
        id: Some(row.get("id")),
        ticker: row.get("ticker"),
        currency,
        shares_owned: row.get::<Decimal, _>("shares_owned"),
        average_cost_per_share: row.get::<Decimal, _>("average_cost_per_share"),
        total_invested_amount: row.get::<Decimal, _>("total_invested_amount"),
        total_transaction_fees: row.get::<Decimal, _>("total_transaction_fees"),
        latest_market_price: row.get::<Decimal, _>("latest_market_price"),
        first_purchase_date: row.get("first_purchase_date"),
        last_updated: updated_at.date_naive(),
        last_event_applied_at: row.get("last_event_applied_at"),
        is_active: row.get("is_active"),
        exchange: row.get("exchange"),
        country: row.get("country"),
        transactions: BTreeSet::new(),
    })
}

/// Map a 23505 to the domain meaning of the violated constraint.
fn translate_unique_violation(err: sqlx::Error, ticker: &str, transaction_id: Uuid) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some(UNIQUE_VIOLATION) {
            match db.constraint() {
                Some(TICKER_CONSTRAINT) => {
                    return StoreError::DuplicatedPosition(ticker.to_string());
                }
                Some(TRANSACTION_CONSTRAINT) => {
                    return StoreError::AlreadyProcessed(transaction_id);
                }
                _ => {}
            }
        }
    }
    StoreError::Persistence(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_errors_are_not_retryable() {
        assert!(!StoreError::DuplicatedPosition("AAPL".into()).is_retryable());
        assert!(!StoreError::AlreadyProcessed(Uuid::nil()).is_retryable());
    }

    #[test]
    fn connection_faults_are_retryable() {
        let err = StoreError::Persistence(sqlx::Error::PoolTimedOut);
        assert!(err.is_retryable());
    }
}
