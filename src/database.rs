//! Database connection pool and schema bootstrap.
//!
//! The two unique constraints created here are load-bearing: the ticker key
//! resolves concurrent-create races and the transaction-id key is the
//! global deduplication backstop. The engine guarantees their existence
//! rather than assuming them.

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

pub async fn create_pool(url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .context("connecting to PostgreSQL")?;

    info!(max_connections, "connected to PostgreSQL");
    Ok(pool)
}

/// Idempotent DDL for the projection tables.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS positions (
            id UUID PRIMARY KEY,
            ticker TEXT NOT NULL,
            currency TEXT NOT NULL CHECK (currency IN ('USD', 'EUR', 'GBP')),
            shares_owned NUMERIC(18,6) NOT NULL DEFAULT 0,
            average_cost_per_share NUMERIC(18,6) NOT NULL DEFAULT 0,
            total_invested_amount NUMERIC(18,4) NOT NULL DEFAULT 0,
            total_transaction_fees NUMERIC(18,4) NOT NULL DEFAULT 0,
            latest_market_price NUMERIC(18,4) NOT NULL DEFAULT 0,
            first_purchase_date DATE NOT NULL,
            last_event_applied_at TIMESTAMPTZ,
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            exchange TEXT,
            country TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            CONSTRAINT positions_ticker_key UNIQUE (ticker)
        )",
    )
    .execute(pool)
    .await
    .context("creating positions table")?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS position_transactions (
            position_id UUID NOT NULL REFERENCES positions(id) ON DELETE CASCADE,
            transaction_id UUID NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (position_id, transaction_id),
            CONSTRAINT position_transactions_transaction_id_key UNIQUE (transaction_id)
        )",
    )
    .execute(pool)
    .await
    .context("creating position_transactions table")?;

    info!("projection schema is in place");
    Ok(())
}
