//! On-chain monitoring webhook.
//!
//! The upstream monitor redelivers on anything but success, so once a batch
//! is authenticated and parsed the response is always 200; per-event
//! failures are logged and counted only.

use axum::{extract::State, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::{OrderType, SettlementError};
use crate::error::AppError;
use crate::middleware::VerifiedWebhook;
use crate::services::settlement::{ConfirmationOutcome, SettlementService};
use crate::AppState;

pub const DEPOSIT_SIGNATURE: &str = "Deposit(string,address,address,uint256)";
pub const DEPOSIT_NATIVE_SIGNATURE: &str = "DepositNative(string,address,uint256)";
pub const WITHDRAW_SIGNATURE: &str = "Withdraw(string,address,address,uint256)";
pub const WITHDRAW_NATIVE_SIGNATURE: &str = "WithdrawNative(string,address,uint256)";

#[derive(Debug, Deserialize)]
pub struct ChainEvent {
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default, rename = "matchReasons")]
    pub match_reasons: Vec<MatchReason>,
}

#[derive(Debug, Deserialize)]
pub struct MatchReason {
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WebhookBody {
    Batch { events: Vec<ChainEvent> },
    Bare(Vec<ChainEvent>),
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookSummary {
    pub accepted: usize,
    pub settled: usize,
    pub duplicates: usize,
    pub ignored: usize,
    pub failed: usize,
}

pub fn event_kind(signature: &str) -> Option<OrderType> {
    match signature.trim() {
        DEPOSIT_SIGNATURE | DEPOSIT_NATIVE_SIGNATURE => Some(OrderType::Deposit),
        WITHDRAW_SIGNATURE | WITHDRAW_NATIVE_SIGNATURE => Some(OrderType::Withdraw),
        _ => None,
    }
}

fn order_id(params: &Map<String, Value>) -> Option<String> {
    ["systemId", "orderId"].iter().find_map(|field| match params.get(*field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

pub fn parse_events(body: &[u8]) -> Result<Vec<ChainEvent>, AppError> {
    let parsed: WebhookBody = serde_json::from_slice(body)
        .map_err(|e| AppError::BadRequest(format!("malformed webhook payload: {}", e)))?;
    Ok(match parsed {
        WebhookBody::Batch { events } => events,
        WebhookBody::Bare(events) => events,
    })
}

enum ReasonOutcome {
    Settled,
    Duplicate,
}

async fn confirm(
    service: &SettlementService,
    order_id: &str,
    kind: OrderType,
) -> Result<ReasonOutcome, SettlementError> {
    let order = service.get_order(order_id).await?;
    if order.order_type != kind {
        return Err(SettlementError::OrderConflict {
            order_id: order_id.to_string(),
            reason: format!("{} event for a {} order", kind, order.order_type),
        });
    }

    Ok(match service.handle_settlement_confirmation(order_id).await? {
        ConfirmationOutcome::Settled { .. } => ReasonOutcome::Settled,
        ConfirmationOutcome::AlreadyProcessed(_) | ConfirmationOutcome::ConcurrentSettlementInProgress => {
            ReasonOutcome::Duplicate
        }
    })
}

/// Dispatches every match reason of every event. Never fails as a whole.
pub async fn process_events(service: &SettlementService, events: &[ChainEvent]) -> WebhookSummary {
    let mut summary = WebhookSummary {
        accepted: events.len(),
        ..WebhookSummary::default()
    };

    for event in events {
        let hash = event.hash.as_deref().unwrap_or("-");
        for reason in &event.match_reasons {
            let Some(kind) = event_kind(&reason.signature) else {
                tracing::debug!(tx_hash = %hash, signature = %reason.signature, "ignoring unrecognized event signature");
                summary.ignored += 1;
                continue;
            };
            let Some(order_id) = order_id(&reason.params) else {
                tracing::error!(tx_hash = %hash, signature = %reason.signature, "event carries no systemId or orderId");
                summary.failed += 1;
                continue;
            };

            match confirm(service, &order_id, kind).await {
                Ok(ReasonOutcome::Settled) => summary.settled += 1,
                Ok(ReasonOutcome::Duplicate) => summary.duplicates += 1,
                Err(e) => {
                    tracing::error!(tx_hash = %hash, order_id = %order_id, code = e.code(), "settlement confirmation failed: {}", e);
                    summary.failed += 1;
                }
            }
        }
    }

    summary
}

pub async fn chain_events(
    State(state): State<AppState>,
    webhook: VerifiedWebhook,
) -> Result<impl IntoResponse, AppError> {
    let events = parse_events(&webhook.body)?;
    let summary = process_events(&state.settlements, &events).await;

    tracing::info!(
        accepted = summary.accepted,
        settled = summary.settled,
        duplicates = summary.duplicates,
        ignored = summary.ignored,
        failed = summary.failed,
        "webhook batch processed"
    );
    Ok(Json(summary))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_signatures_map_to_order_types() {
        assert_eq!(event_kind(DEPOSIT_SIGNATURE), Some(OrderType::Deposit));
        assert_eq!(event_kind(DEPOSIT_NATIVE_SIGNATURE), Some(OrderType::Deposit));
        assert_eq!(event_kind(WITHDRAW_SIGNATURE), Some(OrderType::Withdraw));
        assert_eq!(event_kind(WITHDRAW_NATIVE_SIGNATURE), Some(OrderType::Withdraw));
        assert_eq!(event_kind("Transfer(address,address,uint256)"), None);
    }

    #[test]
    fn test_batch_and_bare_payloads_parse() {
        let batch = br#"{"events":[{"hash":"0x1","matchReasons":[{"signature":"x","params":{}}]}]}"#;
        assert_eq!(parse_events(batch).unwrap().len(), 1);

        let bare = br#"[{"matchReasons":[]},{"matchReasons":[]}]"#;
        assert_eq!(parse_events(bare).unwrap().len(), 2);

        assert!(parse_events(b"{\"nope\":1}").is_err());
    }

    #[test]
    fn test_order_id_prefers_system_id() {
        let params: Map<String, Value> =
            serde_json::from_str(r#"{"orderId":"b","systemId":"a"}"#).unwrap();
        assert_eq!(order_id(&params).as_deref(), Some("a"));

        let params: Map<String, Value> = serde_json::from_str(r#"{"orderId":"b"}"#).unwrap();
        assert_eq!(order_id(&params).as_deref(), Some("b"));

        assert_eq!(order_id(&Map::new()), None);
    }
}
