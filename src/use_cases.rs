//! src/use_cases.rs
//! The three lifecycle use cases: apply a created transaction, reverse and
//! reapply an updated one, reverse a deleted one.
//!
//! Each entry point runs its algorithm inside one transaction and owns the
//! retry ladder: duplicate-position races get a short retry (the winner's
//! commit makes the row visible), transient persistence faults get a few
//! more, and everything else is surfaced as a typed outcome for the
//! consumer's acknowledgment table.

use std::fmt;
use std::time::Duration;

use rand::Rng;
use sqlx::PgPool;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::events::{CreatedCommand, DeletedCommand, UpdatedCommand};
use crate::position::{Position, PositionError};
use crate::repository::{PgPositionStore, PositionStore, StoreError};

/// Concurrent-create races: the second attempt sees the winner's row.
const MAX_DUPLICATE_ATTEMPTS: u32 = 2;
/// Transient persistence faults: connection loss, serialization rollback.
const MAX_PERSISTENCE_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    Oversell,
    DuplicatedPosition,
    AlreadyProcessed,
    PersistenceError,
    UnexpectedError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::InvalidInput => "INVALID_INPUT",
            ErrorKind::Oversell => "OVERSELL",
            ErrorKind::DuplicatedPosition => "DUPLICATED_POSITION",
            ErrorKind::AlreadyProcessed => "ALREADY_PROCESSED",
            ErrorKind::PersistenceError => "PERSISTENCE_ERROR",
            ErrorKind::UnexpectedError => "UNEXPECTED_ERROR",
        };
        f.write_str(label)
    }
}

/// What happened to one message. Drives acknowledgment: everything is acked
/// except `Replay`, which is re-executed after a delay.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingOutcome {
    Success(Position),
    Ignored {
        reason: String,
    },
    Replay {
        reason: String,
        transaction_id: Uuid,
        position_id: Option<Uuid>,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl ProcessingOutcome {
    fn ignored(reason: impl Into<String>) -> Self {
        ProcessingOutcome::Ignored {
            reason: reason.into(),
        }
    }

    fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        ProcessingOutcome::Error {
            kind,
            message: message.into(),
        }
    }
}

/// Translate an aggregate failure into an outcome. Oversell and a vanished
/// cost basis are transient (the covering events may still arrive), input
/// faults are fatal to the message.
fn domain_outcome(
    err: PositionError,
    transaction_id: Uuid,
    position_id: Option<Uuid>,
) -> ProcessingOutcome {
    match err {
        PositionError::Oversell { .. } | PositionError::MissingCostBasis => {
            ProcessingOutcome::Replay {
                reason: err.to_string(),
                transaction_id,
                position_id,
            }
        }
        PositionError::InvalidInput(message) => {
            ProcessingOutcome::error(ErrorKind::InvalidInput, message)
        }
    }
}

async fn retry_pause(attempt: u32) {
    let jitter = rand::thread_rng().gen_range(0..25);
    sleep(Duration::from_millis(
        RETRY_BASE_DELAY_MS * attempt as u64 + jitter,
    ))
    .await;
}

/// Run a use-case body inside one transaction with the retry ladder.
/// The body returns `Result<ProcessingOutcome, StoreError>`; any `Ok`
/// outcome commits, store faults roll back and are classified here.
macro_rules! with_store_tx {
    ($pool:expr, $store:ident, $body:block) => {{
        let mut duplicate_attempts: u32 = 0;
        let mut persistence_attempts: u32 = 0;
        loop {
            let mut $store = match PgPositionStore::begin($pool).await {
                Ok(store) => store,
                Err(e) => {
                    if e.is_retryable() && persistence_attempts < MAX_PERSISTENCE_ATTEMPTS {
                        persistence_attempts += 1;
                        retry_pause(persistence_attempts).await;
                        continue;
                    }
                    break ProcessingOutcome::error(ErrorKind::PersistenceError, e.to_string());
                }
            };

            let result: Result<ProcessingOutcome, StoreError> = async { $body }.await;
            match result {
                Ok(outcome) => match $store.commit().await {
                    Ok(()) => break outcome,
                    Err(e) => {
                        if e.is_retryable() && persistence_attempts < MAX_PERSISTENCE_ATTEMPTS {
                            persistence_attempts += 1;
                            warn!(error = %e, "commit failed, retrying transaction");
                            retry_pause(persistence_attempts).await;
                            continue;
                        }
                        break ProcessingOutcome::error(ErrorKind::PersistenceError, e.to_string());
                    }
                },
                Err(e) => {
                    $store.rollback().await;
                    match e {
                        StoreError::AlreadyProcessed(id) => {
                            break ProcessingOutcome::ignored(format!(
                                "transaction {id} already processed"
                            ));
                        }
                        StoreError::DuplicatedPosition(ticker) => {
                            if duplicate_attempts < MAX_DUPLICATE_ATTEMPTS {
                                duplicate_attempts += 1;
                                debug!(
                                    ticker = %ticker,
                                    attempt = duplicate_attempts,
                                    "lost position-create race, retrying"
                                );
                                retry_pause(duplicate_attempts).await;
                                continue;
                            }
                            break ProcessingOutcome::error(
                                ErrorKind::DuplicatedPosition,
                                format!("position for {ticker} kept colliding on insert"),
                            );
                        }
                        e if e.is_retryable() && persistence_attempts < MAX_PERSISTENCE_ATTEMPTS => {
                            persistence_attempts += 1;
                            warn!(error = %e, attempt = persistence_attempts, "transient store fault, retrying");
                            retry_pause(persistence_attempts).await;
                            continue;
                        }
                        e => {
                            break ProcessingOutcome::error(
                                ErrorKind::PersistenceError,
                                e.to_string(),
                            );
                        }
                    }
                }
            }
        }
    }};
}

pub async fn apply_created(pool: &PgPool, command: &CreatedCommand) -> ProcessingOutcome {
    with_store_tx!(pool, store, {
        execute_created(&mut store, command).await
    })
}

pub async fn apply_updated(pool: &PgPool, command: &UpdatedCommand) -> ProcessingOutcome {
    with_store_tx!(pool, store, {
        execute_updated(&mut store, command).await
    })
}

pub async fn apply_deleted(pool: &PgPool, command: &DeletedCommand) -> ProcessingOutcome {
    with_store_tx!(pool, store, {
        execute_deleted(&mut store, command).await
    })
}

/// Upsert the position for a created transaction. Idempotent per
/// `(position, transaction)`; an oversell waits for earlier buys.
pub async fn execute_created<S: PositionStore>(
    store: &mut S,
    command: &CreatedCommand,
) -> Result<ProcessingOutcome, StoreError> {
    let tx = &command.transaction;

    let existing = store.find_by_ticker_for_update(&tx.ticker).await?;
    if let Some(position) = &existing {
        if let Some(position_id) = position.id {
            if store
                .is_transaction_processed(position_id, tx.transaction_id)
                .await?
            {
                return Ok(ProcessingOutcome::ignored(format!(
                    "transaction {} already processed",
                    tx.transaction_id
                )));
            }
        }
    }

    let is_new = existing.is_none();
    let mut position = existing
        .unwrap_or_else(|| Position::new(&tx.ticker, tx.currency, tx.transaction_date));

    if let Err(e) = position.apply_transaction(
        tx.transaction_id,
        &tx.side,
        tx.quantity,
        tx.price,
        tx.fees,
    ) {
        return Ok(domain_outcome(e, tx.transaction_id, position.id));
    }
    position.mark_event_applied(command.occurred_at);
    position.enrich(tx.exchange.as_deref(), tx.country.as_deref());

    let persisted = if is_new {
        store.save(position).await?
    } else {
        store.update_with_transactions(position).await?
    };
    Ok(ProcessingOutcome::Success(persisted))
}

/// Reverse the previous snapshot and apply the new one. A plain update works
/// on one aggregate; a ticker correction moves the transaction between two,
/// locking the old ticker first.
pub async fn execute_updated<S: PositionStore>(
    store: &mut S,
    command: &UpdatedCommand,
) -> Result<ProcessingOutcome, StoreError> {
    if command.is_ticker_change() {
        execute_ticker_change(store, command).await
    } else {
        execute_same_ticker_update(store, command).await
    }
}

async fn execute_same_ticker_update<S: PositionStore>(
    store: &mut S,
    command: &UpdatedCommand,
) -> Result<ProcessingOutcome, StoreError> {
    let ticker = &command.new.ticker;

    let Some(mut position) = store.find_by_ticker_for_update(ticker).await? else {
        // The created event never materialized; there is nothing to correct.
        return Ok(ProcessingOutcome::ignored(format!(
            "position not found for ticker {ticker}"
        )));
    };
    if position.should_ignore_event(command.occurred_at) {
        return Ok(ProcessingOutcome::ignored("out-of-order event"));
    }

    let prev = &command.previous;
    if let Err(e) = position.reverse_transaction(
        prev.transaction_id,
        &prev.side,
        prev.quantity,
        prev.price,
        prev.fees,
    ) {
        return Ok(domain_outcome(e, prev.transaction_id, position.id));
    }

    let new = &command.new;
    if let Err(e) = position.apply_transaction(
        new.transaction_id,
        &new.side,
        new.quantity,
        new.price,
        new.fees,
    ) {
        return Ok(domain_outcome(e, new.transaction_id, position.id));
    }

    position.mark_event_applied(command.occurred_at);
    position.enrich(new.exchange.as_deref(), new.country.as_deref());

    let persisted = store.update_with_transactions(position).await?;
    Ok(ProcessingOutcome::Success(persisted))
}

async fn execute_ticker_change<S: PositionStore>(
    store: &mut S,
    command: &UpdatedCommand,
) -> Result<ProcessingOutcome, StoreError> {
    let prev = &command.previous;
    let new = &command.new;

    // Old side first; lock order is old ticker then new ticker.
    let Some(mut old_position) = store.find_by_ticker_for_update(&prev.ticker).await? else {
        return Ok(ProcessingOutcome::error(
            ErrorKind::InvalidInput,
            format!("old position not found for ticker {}", prev.ticker),
        ));
    };
    if old_position.should_ignore_event(command.occurred_at) {
        return Ok(ProcessingOutcome::ignored(
            "out-of-order event on old position",
        ));
    }
    if let Err(e) = old_position.reverse_transaction(
        prev.transaction_id,
        &prev.side,
        prev.quantity,
        prev.price,
        prev.fees,
    ) {
        return Ok(domain_outcome(e, prev.transaction_id, old_position.id));
    }
    old_position.mark_event_applied(command.occurred_at);
    store.update_with_transactions(old_position).await?;

    // The old side stays persisted even when the new side rejects the
    // event; the aggregate no longer carries the moved transaction either
    // way, and redelivery recovers the rest.
    let existing = store.find_by_ticker_for_update(&new.ticker).await?;
    if let Some(position) = &existing {
        if position.should_ignore_event(command.occurred_at) {
            return Ok(ProcessingOutcome::ignored(
                "out-of-order event on new position",
            ));
        }
    }

    let is_new = existing.is_none();
    let mut new_position = existing
        .unwrap_or_else(|| Position::new(&new.ticker, new.currency, new.transaction_date));
    if let Err(e) = new_position.apply_transaction(
        new.transaction_id,
        &new.side,
        new.quantity,
        new.price,
        new.fees,
    ) {
        return Ok(domain_outcome(e, new.transaction_id, new_position.id));
    }
    new_position.mark_event_applied(command.occurred_at);
    new_position.enrich(new.exchange.as_deref(), new.country.as_deref());

    let persisted = if is_new {
        store.save(new_position).await?
    } else {
        store.update_with_transactions(new_position).await?
    };
    Ok(ProcessingOutcome::Success(persisted))
}

/// Reverse a deleted transaction. Replays until both the position and the
/// source transaction have materialized.
pub async fn execute_deleted<S: PositionStore>(
    store: &mut S,
    command: &DeletedCommand,
) -> Result<ProcessingOutcome, StoreError> {
    let tx = &command.transaction;

    let Some(mut position) = store.find_by_ticker_for_update(&tx.ticker).await? else {
        return Ok(ProcessingOutcome::Replay {
            reason: format!("position not found for ticker {}", tx.ticker),
            transaction_id: tx.transaction_id,
            position_id: None,
        });
    };
    let Some(position_id) = position.id else {
        return Ok(ProcessingOutcome::Replay {
            reason: "position not yet persisted".to_string(),
            transaction_id: tx.transaction_id,
            position_id: None,
        });
    };

    if position.should_ignore_event(command.occurred_at) {
        return Ok(ProcessingOutcome::ignored("out-of-order event"));
    }
    if !store
        .is_transaction_processed(position_id, tx.transaction_id)
        .await?
    {
        return Ok(ProcessingOutcome::Replay {
            reason: format!("transaction {} not yet processed", tx.transaction_id),
            transaction_id: tx.transaction_id,
            position_id: Some(position_id),
        });
    }

    if let Err(e) = position.reverse_transaction(
        tx.transaction_id,
        &tx.side,
        tx.quantity,
        tx.price,
        tx.fees,
    ) {
        return Ok(domain_outcome(e, tx.transaction_id, Some(position_id)));
    }
    position.mark_event_applied(command.occurred_at);

    let persisted = store.update_with_transactions(position).await?;
    Ok(ProcessingOutcome::Success(persisted))
}
