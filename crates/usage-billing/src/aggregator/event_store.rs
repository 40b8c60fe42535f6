use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::events::{Event, EventInput, NewEvent};
use crate::domain::types::TenantContext;
use crate::error::Result;
use crate::storage::{EventInsert, EventQuery, EventRepository};
use crate::telemetry::EngineMetrics;

/// Result of offering one event to the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestOutcome {
    Accepted { event: Event },
    /// Identical re-submission of a stored event; nothing changed
    AlreadyIngested { event: Event },
    /// Transaction id already used with a different payload; the first write stands
    DuplicateTransaction { existing: Event },
}

impl IngestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestOutcome::Accepted { .. } => "accepted",
            IngestOutcome::AlreadyIngested { .. } => "already_ingested",
            IngestOutcome::DuplicateTransaction { .. } => "duplicate_transaction",
        }
    }

    pub fn accepted(&self) -> Option<&Event> {
        match self {
            IngestOutcome::Accepted { event } => Some(event),
            _ => None,
        }
    }
}

fn same_payload(existing: &Event, input: &NewEvent) -> bool {
    existing.code == input.code
        && existing.timestamp == input.timestamp
        && existing.properties == input.properties
        && existing.external_customer_id == input.external_customer_id
}

/// Deduplicating front door of the event log
#[derive(Clone)]
pub struct EventStore {
    events: Arc<dyn EventRepository>,
    metrics: Arc<EngineMetrics>,
}

impl EventStore {
    pub fn new(events: Arc<dyn EventRepository>, metrics: Arc<EngineMetrics>) -> Self {
        Self { events, metrics }
    }

    pub async fn ingest(&self, tenant: &TenantContext, input: EventInput) -> Result<IngestOutcome> {
        let event = match input.into_event(tenant.organization_id) {
            Ok(event) => event,
            Err(e) => {
                self.metrics.record_ingestion("invalid");
                return Err(e);
            }
        };

        let outcome = match self.events.create_event(event.clone(), Utc::now()).await? {
            EventInsert::Inserted(stored) => {
                debug!(
                    "Accepted event {} for subscription {} (sequence {})",
                    stored.transaction_id, stored.external_subscription_id, stored.sequence
                );
                IngestOutcome::Accepted { event: stored }
            }
            EventInsert::Duplicate(existing) if same_payload(&existing, &event) => {
                debug!("Event {} already ingested", existing.transaction_id);
                IngestOutcome::AlreadyIngested { event: existing }
            }
            EventInsert::Duplicate(existing) => {
                warn!(
                    "Rejected event {} for subscription {}: transaction id already used",
                    existing.transaction_id, existing.external_subscription_id
                );
                IngestOutcome::DuplicateTransaction { existing }
            }
        };

        self.metrics.record_ingestion(outcome.as_str());
        Ok(outcome)
    }

    pub async fn list(&self, query: &EventQuery) -> Result<Vec<Event>> {
        self.events.list_events(query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::PropertyValue;
    use crate::domain::types::{ExternalSubscriptionId, MetricCode, OrganizationId};
    use crate::error::BillingError;
    use crate::storage::InMemoryEventRepository;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn store() -> (EventStore, Arc<EngineMetrics>) {
        let metrics = Arc::new(EngineMetrics::new().unwrap());
        (
            EventStore::new(Arc::new(InMemoryEventRepository::new()), metrics.clone()),
            metrics,
        )
    }

    fn input(tx: &str, tokens: i64) -> EventInput {
        EventInput {
            external_subscription_id: Some("sub_1".to_string()),
            external_customer_id: None,
            transaction_id: Some(tx.to_string()),
            code: Some("tokens".to_string()),
            properties: [("tokens".to_string(), PropertyValue::Number(tokens.into()))]
                .into_iter()
                .collect(),
            timestamp: Some(Utc.with_ymd_and_hms(2024, 4, 2, 12, 0, 0).unwrap()),
        }
    }

    #[tokio::test]
    async fn test_resubmission_is_idempotent() {
        let (store, metrics) = store();
        let tenant = TenantContext::new(OrganizationId::new());

        let first = store.ingest(&tenant, input("tx_1", 10)).await.unwrap();
        let again = store.ingest(&tenant, input("tx_1", 10)).await.unwrap();
        let conflicting = store.ingest(&tenant, input("tx_1", 99)).await.unwrap();

        let event = first.accepted().cloned().unwrap();
        assert_eq!(again, IngestOutcome::AlreadyIngested { event: event.clone() });
        assert_eq!(
            conflicting,
            IngestOutcome::DuplicateTransaction {
                existing: event.clone()
            }
        );
        assert_eq!(
            event.property("tokens").and_then(|v| v.as_decimal()),
            Some(dec!(10))
        );
        assert_eq!(metrics.ingested_count("accepted"), 1);
        assert_eq!(metrics.ingested_count("duplicate_transaction"), 1);

        let query = EventQuery::new(
            tenant.organization_id,
            ExternalSubscriptionId::new("sub_1"),
            MetricCode::new("tokens"),
        );
        assert_eq!(store.list(&query).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_event_is_counted() {
        let (store, metrics) = store();
        let tenant = TenantContext::new(OrganizationId::new());
        let mut missing_code = input("tx_2", 1);
        missing_code.code = None;

        assert!(matches!(
            store.ingest(&tenant, missing_code).await,
            Err(BillingError::ValidationError { ref field, .. }) if field == "code"
        ));
        assert_eq!(metrics.ingested_count("invalid"), 1);
    }
}
