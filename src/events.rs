//! src/events.rs
//! Wire envelope and payload codec for the transaction lifecycle streams.
//!
//! Stream messages carry a single `payload` field holding the serialized
//! envelope JSON. The envelope's `eventType` selects the payload schema:
//! created/deleted events carry one transaction snapshot, updated events
//! carry `{previousTransaction, newTransaction}`.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::position::Currency;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid event envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("invalid {event_type:?} payload: {source}")]
    Payload {
        event_type: EventType,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum EventType {
    TransactionCreated,
    TransactionUpdated,
    TransactionDeleted,
}

/// Outer envelope, shared by all three streams.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub occurred_at: DateTime<Utc>,
    pub message_created_at: DateTime<Utc>,
    payload: serde_json::Value,
}

/// One transaction snapshot as it appears on the wire. Unknown extra fields
/// are tolerated; the trailing optional fields are carried by the producer
/// but irrelevant to the projection.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionPayload {
    pub id: Uuid,
    pub ticker: String,
    pub transaction_type: String,
    pub quantity: Decimal,
    pub price: Decimal,
    #[serde(default)]
    pub fees: Option<Decimal>,
    pub currency: Currency,
    pub transaction_date: NaiveDate,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub is_fractional: Option<bool>,
    #[serde(default)]
    pub fractional_multiplier: Option<Decimal>,
    #[serde(default)]
    pub commission_currency: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdatedPayload {
    previous_transaction: TransactionPayload,
    new_transaction: TransactionPayload,
}

/// Flattened view of one transaction, ready for the use cases. `fees` is
/// nullable on the wire and treated as zero here.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionSnapshot {
    pub transaction_id: Uuid,
    pub ticker: String,
    pub side: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fees: Decimal,
    pub currency: Currency,
    pub transaction_date: NaiveDate,
    pub exchange: Option<String>,
    pub country: Option<String>,
}

impl From<TransactionPayload> for TransactionSnapshot {
    fn from(payload: TransactionPayload) -> Self {
        Self {
            transaction_id: payload.id,
            ticker: payload.ticker,
            side: payload.transaction_type,
            quantity: payload.quantity,
            price: payload.price,
            fees: payload.fees.unwrap_or(Decimal::ZERO),
            currency: payload.currency,
            transaction_date: payload.transaction_date,
            exchange: payload.exchange,
            country: payload.country,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatedCommand {
    pub transaction: TransactionSnapshot,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdatedCommand {
    pub previous: TransactionSnapshot,
    pub new: TransactionSnapshot,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeletedCommand {
    pub transaction: TransactionSnapshot,
    pub occurred_at: DateTime<Utc>,
}

impl UpdatedCommand {
    /// A correction may move the holding to a different ticker.
    pub fn is_ticker_change(&self) -> bool {
        self.previous.ticker != self.new.ticker
    }
}

/// Parsed message, dispatched to the matching use case by the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum EventCommand {
    Created(CreatedCommand),
    Updated(UpdatedCommand),
    Deleted(DeletedCommand),
}

impl EventCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            EventCommand::Created(_) => "created",
            EventCommand::Updated(_) => "updated",
            EventCommand::Deleted(_) => "deleted",
        }
    }
}

/// Parse the serialized envelope carried in a stream message's `payload`
/// field and select the payload schema by event type.
pub fn decode_event(raw: &str) -> Result<EventCommand, CodecError> {
    let envelope: EventEnvelope = serde_json::from_str(raw).map_err(CodecError::Envelope)?;
    envelope.into_command()
}

impl EventEnvelope {
    pub fn into_command(self) -> Result<EventCommand, CodecError> {
        let event_type = self.event_type;
        let payload_error = |source| CodecError::Payload { event_type, source };

        match event_type {
            EventType::TransactionCreated => {
                let payload: TransactionPayload =
                    serde_json::from_value(self.payload).map_err(payload_error)?;
                Ok(EventCommand::Created(CreatedCommand {
                    transaction: payload.into(),
                    occurred_at: self.occurred_at,
                }))
            }
            EventType::TransactionUpdated => {
                let payload: UpdatedPayload =
                    serde_json::from_value(self.payload).map_err(payload_error)?;
                Ok(EventCommand::Updated(UpdatedCommand {
                    previous: payload.previous_transaction.into(),
                    new: payload.new_transaction.into(),
                    occurred_at: self.occurred_at,
                }))
            }
            EventType::TransactionDeleted => {
                let payload: TransactionPayload =
                    serde_json::from_value(self.payload).map_err(payload_error)?;
                Ok(EventCommand::Deleted(DeletedCommand {
                    transaction: payload.into(),
                    occurred_at: self.occurred_at,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const CREATED: &str = r#"{
        "eventId": "3a2b1c4d-0000-4000-8000-000000000001",
        "eventType": "TransactionCreated",
        "occurredAt": "2024-03-01T12:00:00Z",
        "messageCreatedAt": "2024-03-01T12:00:01Z",
        "payload": {
            "id": "9f8e7d6c-0000-4000-8000-000000000002",
            "ticker": "AAPL",
            "transactionType": "BUY",
            "quantity": "10",
            "price": "150.00",
            "fees": "1.50",
            "currency": "USD",
            "transactionDate": "2024-03-01",
            "exchange": "NASDAQ",
            "country": "US"
        }
    }"#;

    #[test]
    fn decodes_created_event() {
        let command = decode_event(CREATED).unwrap();
        let EventCommand::Created(created) = command else {
            panic!("expected created command");
        };
        assert_eq!(created.transaction.ticker, "AAPL");
        assert_eq!(created.transaction.side, "BUY");
        assert_eq!(created.transaction.quantity, dec!(10));
        assert_eq!(created.transaction.fees, dec!(1.50));
        assert_eq!(created.transaction.exchange.as_deref(), Some("NASDAQ"));
        assert_eq!(
            created.occurred_at.to_rfc3339(),
            "2024-03-01T12:00:00+00:00"
        );
    }

    #[test]
    fn null_fees_become_zero() {
        let raw = CREATED.replace(r#""fees": "1.50""#, r#""fees": null"#);
        let EventCommand::Created(created) = decode_event(&raw).unwrap() else {
            panic!("expected created command");
        };
        assert_eq!(created.transaction.fees, Decimal::ZERO);
    }

    #[test]
    fn decodes_updated_event_with_two_snapshots() {
        let raw = r#"{
            "eventId": "3a2b1c4d-0000-4000-8000-000000000003",
            "eventType": "TransactionUpdated",
            "occurredAt": "2024-03-02T09:30:00Z",
            "messageCreatedAt": "2024-03-02T09:30:00Z",
            "payload": {
                "previousTransaction": {
                    "id": "9f8e7d6c-0000-4000-8000-000000000002",
                    "ticker": "APPL",
                    "transactionType": "BUY",
                    "quantity": "10",
                    "price": "250",
                    "fees": "2",
                    "currency": "USD",
                    "transactionDate": "2024-03-01"
                },
                "newTransaction": {
                    "id": "9f8e7d6c-0000-4000-8000-000000000002",
                    "ticker": "AAPL",
                    "transactionType": "BUY",
                    "quantity": "10",
                    "price": "250",
                    "fees": "2",
                    "currency": "USD",
                    "transactionDate": "2024-03-01"
                }
            }
        }"#;

        let EventCommand::Updated(updated) = decode_event(raw).unwrap() else {
            panic!("expected updated command");
        };
        assert!(updated.is_ticker_change());
        assert_eq!(updated.previous.ticker, "APPL");
        assert_eq!(updated.new.ticker, "AAPL");
        assert_eq!(
            updated.previous.transaction_id,
            updated.new.transaction_id
        );
    }

    #[test]
    fn rejects_garbage_and_mismatched_payloads() {
        assert!(matches!(
            decode_event("not json"),
            Err(CodecError::Envelope(_))
        ));

        // Created envelope with an updated-shaped payload.
        let raw = CREATED.replace(r#""transactionType": "BUY","#, "");
        assert!(matches!(
            decode_event(&raw),
            Err(CodecError::Payload {
                event_type: EventType::TransactionCreated,
                ..
            })
        ));
    }

    #[test]
    fn rejects_unknown_event_type() {
        let raw = CREATED.replace("TransactionCreated", "TransactionArchived");
        assert!(matches!(decode_event(&raw), Err(CodecError::Envelope(_))));
    }
}
