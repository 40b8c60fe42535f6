use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::types::{
    ExternalCustomerId, ExternalSubscriptionId, MetricCode, OrganizationId, TransactionId,
};
use crate::error::{BillingError, Result};

/// A single event property: numbers keep full decimal precision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Number(Decimal),
    Text(String),
}

impl PropertyValue {
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            PropertyValue::Number(value) => Some(*value),
            PropertyValue::Text(text) => Decimal::from_str(text.trim()).ok(),
        }
    }

    /// Canonical text used for dimension matching and grouping
    pub fn as_text(&self) -> String {
        match self {
            PropertyValue::Number(value) => value.normalize().to_string(),
            PropertyValue::Text(text) => text.clone(),
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_text())
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

impl From<Decimal> for PropertyValue {
    fn from(value: Decimal) -> Self {
        PropertyValue::Number(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Number(Decimal::from(value))
    }
}

pub type EventProperties = BTreeMap<String, PropertyValue>;

/// Ingestion payload as received from the outside world
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventInput {
    pub external_subscription_id: Option<String>,
    pub external_customer_id: Option<String>,
    pub transaction_id: Option<String>,
    pub code: Option<String>,
    #[serde(default)]
    pub properties: EventProperties,
    pub timestamp: Option<DateTime<Utc>>,
}

fn required(value: &Option<String>, field: &str) -> Result<String> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(BillingError::validation(field, "is required")),
    }
}

impl EventInput {
    pub fn into_event(self, organization_id: OrganizationId) -> Result<NewEvent> {
        let code = required(&self.code, "code")?;
        let transaction_id = required(&self.transaction_id, "transaction_id")?;
        let external_subscription_id =
            required(&self.external_subscription_id, "external_subscription_id")?;
        let timestamp = self
            .timestamp
            .ok_or_else(|| BillingError::validation("timestamp", "is required"))?;

        Ok(NewEvent {
            organization_id,
            external_subscription_id: ExternalSubscriptionId::new(external_subscription_id),
            external_customer_id: self
                .external_customer_id
                .filter(|id| !id.trim().is_empty())
                .map(ExternalCustomerId::new),
            transaction_id: TransactionId::new(transaction_id),
            code: MetricCode::new(code),
            properties: self.properties,
            timestamp,
        })
    }
}

/// Validated event not yet persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub organization_id: OrganizationId,
    pub external_subscription_id: ExternalSubscriptionId,
    pub external_customer_id: Option<ExternalCustomerId>,
    pub transaction_id: TransactionId,
    pub code: MetricCode,
    pub properties: EventProperties,
    pub timestamp: DateTime<Utc>,
}

impl NewEvent {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            organization_id: self.organization_id,
            external_subscription_id: self.external_subscription_id.clone(),
            transaction_id: self.transaction_id.clone(),
        }
    }
}

/// Uniqueness key of an event
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub organization_id: OrganizationId,
    pub external_subscription_id: ExternalSubscriptionId,
    pub transaction_id: TransactionId,
}

/// Immutable persisted usage fact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    /// Monotonic ingestion order; the aggregation cursor
    pub sequence: u64,
    pub organization_id: OrganizationId,
    pub external_subscription_id: ExternalSubscriptionId,
    pub external_customer_id: Option<ExternalCustomerId>,
    pub transaction_id: TransactionId,
    pub code: MetricCode,
    pub properties: EventProperties,
    pub timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

impl Event {
    pub fn from_new(event: NewEvent, sequence: u64, received_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence,
            organization_id: event.organization_id,
            external_subscription_id: event.external_subscription_id,
            external_customer_id: event.external_customer_id,
            transaction_id: event.transaction_id,
            code: event.code,
            properties: event.properties,
            timestamp: event.timestamp,
            received_at,
        }
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    /// Replay order within a subscription
    pub fn ordering_key(&self) -> (DateTime<Utc>, u64) {
        (self.timestamp, self.sequence)
    }
}
