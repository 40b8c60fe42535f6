use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::domain::events::{DedupKey, Event, NewEvent};
use crate::domain::types::{ExternalSubscriptionId, MetricCode, OrganizationId};
use crate::error::Result;

/// Result of storing an event
#[derive(Debug, Clone, PartialEq)]
pub enum EventInsert {
    Inserted(Event),
    /// The transaction id was already taken; carries the first write
    Duplicate(Event),
}

/// Selection of a subscription's events for one metric code
#[derive(Debug, Clone)]
pub struct EventQuery {
    pub organization_id: OrganizationId,
    pub external_subscription_id: ExternalSubscriptionId,
    pub code: MetricCode,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub after_sequence: u64,
}

impl EventQuery {
    pub fn new(
        organization_id: OrganizationId,
        external_subscription_id: ExternalSubscriptionId,
        code: MetricCode,
    ) -> Self {
        Self {
            organization_id,
            external_subscription_id,
            code,
            from: None,
            to: None,
            after_sequence: 0,
        }
    }

    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn before(mut self, to: DateTime<Utc>) -> Self {
        self.to = Some(to);
        self
    }

    pub fn after_sequence(mut self, sequence: u64) -> Self {
        self.after_sequence = sequence;
        self
    }

    fn matches(&self, event: &Event) -> bool {
        event.code == self.code
            && event.sequence > self.after_sequence
            && self.from.map_or(true, |from| event.timestamp >= from)
            && self.to.map_or(true, |to| event.timestamp < to)
    }
}

#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn create_event(&self, event: NewEvent, received_at: DateTime<Utc>)
        -> Result<EventInsert>;
    async fn get_event(&self, key: &DedupKey) -> Result<Option<Event>>;
    /// Matching events ordered by `(timestamp, sequence)`
    async fn list_events(&self, query: &EventQuery) -> Result<Vec<Event>>;
    async fn latest_sequence(
        &self,
        organization_id: OrganizationId,
        external_subscription_id: &ExternalSubscriptionId,
    ) -> Result<u64>;
}

type SubscriptionKey = (OrganizationId, ExternalSubscriptionId);

/// Lock-free event store: one append-only list per subscription
#[derive(Default)]
pub struct InMemoryEventRepository {
    sequence: AtomicU64,
    by_key: DashMap<DedupKey, Event>,
    by_subscription: DashMap<SubscriptionKey, Vec<Event>>,
}

impl InMemoryEventRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventRepository for InMemoryEventRepository {
    async fn create_event(
        &self,
        event: NewEvent,
        received_at: DateTime<Utc>,
    ) -> Result<EventInsert> {
        let key = event.dedup_key();
        // The subscription entry guard keeps sequence order equal to list order.
        let mut events = self
            .by_subscription
            .entry((event.organization_id, event.external_subscription_id.clone()))
            .or_default();

        if let Some(existing) = self.by_key.get(&key) {
            return Ok(EventInsert::Duplicate(existing.clone()));
        }

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let stored = Event::from_new(event, sequence, received_at);
        self.by_key.insert(key, stored.clone());
        events.push(stored.clone());
        Ok(EventInsert::Inserted(stored))
    }

    async fn get_event(&self, key: &DedupKey) -> Result<Option<Event>> {
        Ok(self.by_key.get(key).map(|e| e.clone()))
    }

    async fn list_events(&self, query: &EventQuery) -> Result<Vec<Event>> {
        let key = (query.organization_id, query.external_subscription_id.clone());
        let mut events: Vec<Event> = self
            .by_subscription
            .get(&key)
            .map(|events| events.iter().filter(|e| query.matches(e)).cloned().collect())
            .unwrap_or_default();
        events.sort_by_key(|e| e.ordering_key());
        Ok(events)
    }

    async fn latest_sequence(
        &self,
        organization_id: OrganizationId,
        external_subscription_id: &ExternalSubscriptionId,
    ) -> Result<u64> {
        let key = (organization_id, external_subscription_id.clone());
        Ok(self
            .by_subscription
            .get(&key)
            .and_then(|events| events.last().map(|e| e.sequence))
            .unwrap_or(0))
    }
}
