use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::aggregation::{
    AggregationScope, BucketUsage, CachedAggregation, ChargeUsage, QuantifiedEvent,
    QuantifiedScope, QuantifiedState,
};
use crate::domain::charges::Charge;
use crate::domain::events::Event;
use crate::domain::fee_calculator::UsageQuantity;
use crate::domain::filters::{self, FilterMatch};
use crate::domain::metrics::{AggregationType, BillableMetric, RoundingPolicy};
use crate::domain::types::{BillingBounds, ExternalSubscriptionId, OrganizationId};
use crate::error::Result;
use crate::storage::{AggregationRepository, EventQuery, EventRepository};
use crate::telemetry::EngineMetrics;

/// Property selecting whether a quantified event adds or removes its id
pub const OPERATION_TYPE_PROPERTY: &str = "operation_type";

/// One charge of one subscription over one billing period
#[derive(Debug, Clone, Copy)]
pub struct AggregationRequest<'a> {
    pub organization_id: OrganizationId,
    pub external_subscription_id: &'a ExternalSubscriptionId,
    pub metric: &'a BillableMetric,
    pub charge: &'a Charge,
    pub bounds: BillingBounds,
}

impl<'a> AggregationRequest<'a> {
    pub fn scope(&self) -> AggregationScope {
        AggregationScope {
            organization_id: self.organization_id,
            external_subscription_id: self.external_subscription_id.clone(),
            charge_id: self.charge.id,
            period_from: self.bounds.from_datetime,
        }
    }

    fn quantified_scope(&self) -> QuantifiedScope {
        let period_from = match self.metric.aggregation_type {
            AggregationType::RecurringCount => None,
            _ => Some(self.bounds.from_datetime),
        };
        QuantifiedScope {
            organization_id: self.organization_id,
            external_subscription_id: self.external_subscription_id.clone(),
            charge_id: self.charge.id,
            period_from,
        }
    }

    fn base_query(&self) -> EventQuery {
        EventQuery::new(
            self.organization_id,
            self.external_subscription_id.clone(),
            self.metric.code.clone(),
        )
    }

    /// Events the aggregation folds: the charges window, or the whole
    /// history for recurring counts
    fn fold_query(&self) -> EventQuery {
        match self.metric.aggregation_type {
            AggregationType::RecurringCount => self.base_query(),
            _ => self.base_query().between(
                self.bounds.charges_from_datetime,
                self.bounds.charges_to_datetime,
            ),
        }
    }
}

/// Why an event did not contribute to an aggregation
#[derive(Debug, Clone, PartialEq)]
enum Exclusion {
    NoMatchingFilter,
    MissingField,
    NonNumericField,
    Expression(String),
}

impl Exclusion {
    fn reason(&self) -> &'static str {
        match self {
            Exclusion::NoMatchingFilter => "no_matching_filter",
            Exclusion::MissingField => "missing_field",
            Exclusion::NonNumericField => "non_numeric_field",
            Exclusion::Expression(_) => "expression_error",
        }
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> Decimal {
    Decimal::from((to - from).num_seconds().max(0))
}

fn numeric_field(metric: &BillableMetric, event: &Event) -> std::result::Result<Decimal, Exclusion> {
    let field = metric
        .field_name
        .as_deref()
        .ok_or(Exclusion::MissingField)?;
    event
        .property(field)
        .ok_or(Exclusion::MissingField)?
        .as_decimal()
        .ok_or(Exclusion::NonNumericField)
}

fn event_value(metric: &BillableMetric, event: &Event) -> std::result::Result<Decimal, Exclusion> {
    match &metric.aggregation_type {
        AggregationType::Count | AggregationType::UniqueCount | AggregationType::RecurringCount => {
            Ok(Decimal::ONE)
        }
        AggregationType::Sum | AggregationType::Max | AggregationType::WeightedSum => {
            numeric_field(metric, event)
        }
        AggregationType::CustomExpression { expression } => expression
            .evaluate(&event.properties)
            .map_err(|e| Exclusion::Expression(e.to_string())),
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct BucketState {
    /// Running total, running max, or current level for weighted sums
    current: Decimal,
    max: Decimal,
    events_count: u64,
    last_event_at: Option<DateTime<Utc>>,
    time_weighted_total: Decimal,
}

/// Running-value aggregation of one charge over one period
#[derive(Debug, Clone)]
struct RunningFold {
    aggregation_type: AggregationType,
    bounds: BillingBounds,
    buckets: BTreeMap<FilterMatch, BucketState>,
    last_sequence: u64,
}

impl RunningFold {
    fn new(request: &AggregationRequest<'_>) -> Self {
        Self {
            aggregation_type: request.metric.aggregation_type.clone(),
            bounds: request.bounds,
            buckets: BTreeMap::new(),
            last_sequence: 0,
        }
    }

    fn from_checkpoints(request: &AggregationRequest<'_>, rows: &[CachedAggregation]) -> Self {
        let mut fold = Self::new(request);
        for row in rows {
            fold.last_sequence = fold.last_sequence.max(row.last_sequence);
            fold.buckets.insert(
                row.bucket(),
                BucketState {
                    current: row.current_aggregation,
                    max: row.max_aggregation,
                    events_count: row.events_count,
                    last_event_at: row.timestamp,
                    time_weighted_total: row.time_weighted_total,
                },
            );
        }
        fold
    }

    /// Timestamp of the latest event any bucket has folded
    fn checkpoint_timestamp(rows: &[CachedAggregation]) -> Option<DateTime<Utc>> {
        rows.iter().filter_map(|row| row.timestamp).max()
    }

    /// Seeds a weighted-sum level carried over from before the window
    fn carry_level(&mut self, bucket: FilterMatch, delta: Decimal) {
        let state = self.buckets.entry(bucket).or_default();
        state.current += delta;
        state.max = state.max.max(state.current);
    }

    fn apply(&mut self, bucket: FilterMatch, value: Decimal, event: &Event) {
        let window_start = self.bounds.charges_from_datetime;
        let state = self.buckets.entry(bucket).or_default();
        match self.aggregation_type {
            AggregationType::Max => {
                state.current = if state.events_count == 0 {
                    value
                } else {
                    state.current.max(value)
                };
            }
            AggregationType::WeightedSum => {
                let since = state.last_event_at.unwrap_or(window_start).max(window_start);
                state.time_weighted_total +=
                    state.current * seconds_between(since, event.timestamp);
                state.current += value;
            }
            _ => state.current += value,
        }
        state.max = if state.events_count == 0 && self.aggregation_type == AggregationType::Max {
            state.current
        } else {
            state.max.max(state.current)
        };
        state.events_count += 1;
        state.last_event_at = Some(event.timestamp);
    }

    fn value_of(&self, state: &BucketState) -> (Decimal, Option<Decimal>) {
        match self.aggregation_type {
            AggregationType::WeightedSum => {
                let window_start = self.bounds.charges_from_datetime;
                let since = state.last_event_at.unwrap_or(window_start).max(window_start);
                let total = state.time_weighted_total
                    + state.current * seconds_between(since, self.bounds.charges_to_datetime);
                let period = Decimal::from(self.bounds.period_seconds().max(1));
                let value = total / period;
                (value, Some(value))
            }
            _ => (state.current, None),
        }
    }

    fn checkpoints(&self, request: &AggregationRequest<'_>, now: DateTime<Utc>) -> Vec<CachedAggregation> {
        self.buckets
            .iter()
            .map(|(bucket, state)| CachedAggregation {
                organization_id: request.organization_id,
                external_subscription_id: request.external_subscription_id.clone(),
                charge_id: request.charge.id,
                charge_filter_id: bucket.charge_filter_id,
                grouped_by: bucket.grouped_by.clone(),
                period_from: request.bounds.from_datetime,
                timestamp: state.last_event_at,
                last_sequence: self.last_sequence,
                current_aggregation: state.current,
                max_aggregation: state.max,
                max_aggregation_with_proration: None,
                events_count: state.events_count,
                time_weighted_total: state.time_weighted_total,
                invalidated: false,
                frozen: false,
                updated_at: now,
            })
            .collect()
    }
}

fn is_removal(event: &Event) -> bool {
    event
        .property(OPERATION_TYPE_PROPERTY)
        .map(|op| op.as_text().eq_ignore_ascii_case("remove"))
        .unwrap_or(false)
}

fn quantified_id(metric: &BillableMetric, event: &Event) -> std::result::Result<String, Exclusion> {
    let field = metric
        .field_name
        .as_deref()
        .ok_or(Exclusion::MissingField)?;
    event
        .property(field)
        .map(|value| value.as_text())
        .filter(|id| !id.is_empty())
        .ok_or(Exclusion::MissingField)
}

/// Folds one add/remove event into the quantified rows
fn apply_quantified(
    state: &mut QuantifiedState,
    metric: &BillableMetric,
    charge: &Charge,
    event: &Event,
) -> std::result::Result<(), Exclusion> {
    state.last_sequence = state.last_sequence.max(event.sequence);
    state.last_timestamp = state.last_timestamp.max(Some(event.timestamp));

    let external_id = quantified_id(metric, event)?;
    if is_removal(event) {
        if let Some(row) = state.active_row_mut(&external_id) {
            row.removed_at = Some(event.timestamp);
        }
        return Ok(());
    }
    if state.active_row_mut(&external_id).is_some() {
        return Ok(());
    }
    let bucket =
        filters::resolve(&event.properties, metric, charge).ok_or(Exclusion::NoMatchingFilter)?;
    state
        .rows
        .push(QuantifiedEvent::new(external_id, bucket, event.timestamp));
    Ok(())
}

/// Per-bucket values of quantified rows for the request window
fn quantified_buckets(
    request: &AggregationRequest<'_>,
    state: &QuantifiedState,
) -> BTreeMap<FilterMatch, (Decimal, Option<Decimal>, u64)> {
    let from = request.bounds.charges_from_datetime;
    let to = request.bounds.charges_to_datetime;
    let period = Decimal::from(request.bounds.period_seconds().max(1));
    let mut buckets: BTreeMap<FilterMatch, (Decimal, Option<Decimal>, u64)> = BTreeMap::new();

    for row in &state.rows {
        match request.metric.aggregation_type {
            AggregationType::RecurringCount => {
                if !row.overlaps(from, to) {
                    continue;
                }
                let entry = buckets
                    .entry(row.bucket.clone())
                    .or_insert((Decimal::ZERO, Some(Decimal::ZERO), 0));
                entry.0 += Decimal::ONE;
                entry.1 = entry
                    .1
                    .map(|p| p + Decimal::from(row.overlap_seconds(from, to)) / period);
                entry.2 += 1;
            }
            _ => {
                // Removed ids keep their bucket but no longer count
                let entry = buckets
                    .entry(row.bucket.clone())
                    .or_insert((Decimal::ZERO, None, 0));
                if row.is_active() {
                    entry.0 += Decimal::ONE;
                    entry.2 += 1;
                }
            }
        }
    }
    buckets
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Writes checkpoints and recomputes invalidated ones
    Persist,
    /// Never writes; invalidated checkpoints are reported as stale
    ReadOnly,
}

/// Folds subscription events into per-charge usage with resumable checkpoints
pub struct Aggregator {
    events: Arc<dyn EventRepository>,
    store: Arc<dyn AggregationRepository>,
    metrics: Arc<EngineMetrics>,
    precision: u32,
}

impl Aggregator {
    pub fn new(
        events: Arc<dyn EventRepository>,
        store: Arc<dyn AggregationRepository>,
        metrics: Arc<EngineMetrics>,
        precision: u32,
    ) -> Self {
        Self {
            events,
            store,
            metrics,
            precision,
        }
    }

    fn round(&self, metric: &BillableMetric, value: Decimal) -> Decimal {
        match metric.rounding_policy {
            RoundingPolicy::None => value.round_dp(self.precision),
            policy => policy.apply(value),
        }
    }

    fn exclude(&self, request: &AggregationRequest<'_>, event: &Event, exclusion: Exclusion, record: bool) {
        match (&exclusion, record) {
            (Exclusion::NoMatchingFilter, _) | (_, false) => debug!(
                "Event {} excluded from charge {}: {}",
                event.transaction_id,
                request.charge.id,
                exclusion.reason()
            ),
            (Exclusion::Expression(message), true) => warn!(
                "Event {} excluded from metric {}: expression failed: {}",
                event.transaction_id, request.metric.code, message
            ),
            (_, true) => warn!(
                "Event {} excluded from metric {}: {} on field {:?}",
                event.transaction_id,
                request.metric.code,
                exclusion.reason(),
                request.metric.field_name
            ),
        }
        if record {
            self.metrics.record_excluded_event(exclusion.reason());
        }
    }

    fn fold_running(
        &self,
        request: &AggregationRequest<'_>,
        fold: &mut RunningFold,
        events: &[Event],
        record: bool,
    ) {
        for event in events {
            fold.last_sequence = fold.last_sequence.max(event.sequence);
            let folded = filters::resolve(&event.properties, request.metric, request.charge)
                .ok_or(Exclusion::NoMatchingFilter)
                .and_then(|bucket| event_value(request.metric, event).map(|v| (bucket, v)));
            match folded {
                Ok((bucket, value)) => fold.apply(bucket, value, event),
                Err(exclusion) => self.exclude(request, event, exclusion, record),
            }
        }
    }

    fn fold_quantified(
        &self,
        request: &AggregationRequest<'_>,
        state: &mut QuantifiedState,
        events: &[Event],
        record: bool,
    ) {
        for event in events {
            if let Err(exclusion) = apply_quantified(state, request.metric, request.charge, event) {
                self.exclude(request, event, exclusion, record);
            }
        }
    }

    async fn list(&self, query: &EventQuery, through: Option<u64>) -> Result<Vec<Event>> {
        let mut events = self.events.list_events(query).await?;
        if let Some(through) = through {
            events.retain(|e| e.sequence <= through);
        }
        Ok(events)
    }

    /// Full replay from period start, ignoring events ingested after `through`
    async fn replay_running(
        &self,
        request: &AggregationRequest<'_>,
        through: Option<u64>,
        record: bool,
    ) -> Result<RunningFold> {
        let mut fold = RunningFold::new(request);

        if request.metric.aggregation_type == AggregationType::WeightedSum && request.metric.recurring {
            let earlier = request
                .base_query()
                .before(request.bounds.charges_from_datetime);
            for event in self.list(&earlier, through).await? {
                let bucket = filters::resolve(&event.properties, request.metric, request.charge);
                if let (Some(bucket), Ok(delta)) = (bucket, numeric_field(request.metric, &event)) {
                    fold.carry_level(bucket, delta);
                }
            }
        }

        let events = self.list(&request.fold_query(), through).await?;
        self.fold_running(request, &mut fold, &events, record);
        Ok(fold)
    }

    async fn replay_quantified(
        &self,
        request: &AggregationRequest<'_>,
        through: Option<u64>,
        record: bool,
    ) -> Result<QuantifiedState> {
        let mut state = QuantifiedState::default();
        let events = self.list(&request.fold_query(), through).await?;
        self.fold_quantified(request, &mut state, &events, record);
        Ok(state)
    }

    fn running_usage(
        &self,
        request: &AggregationRequest<'_>,
        fold: &RunningFold,
        stale: bool,
    ) -> ChargeUsage {
        let buckets = fold
            .buckets
            .iter()
            .map(|(bucket, state)| {
                let (value, prorated) = fold.value_of(state);
                BucketUsage {
                    bucket: bucket.clone(),
                    current_aggregation: self.round(request.metric, state.current),
                    max_aggregation: self.round(request.metric, state.max),
                    usage: UsageQuantity {
                        value: self.round(request.metric, value),
                        prorated_value: prorated.map(|p| self.round(request.metric, p)),
                        events_count: state.events_count,
                    },
                }
            })
            .collect();
        ChargeUsage {
            charge_id: request.charge.id,
            period_from: request.bounds.from_datetime,
            buckets,
            stale,
        }
    }

    fn quantified_usage(&self, request: &AggregationRequest<'_>, state: &QuantifiedState) -> ChargeUsage {
        let buckets = quantified_buckets(request, state)
            .into_iter()
            .map(|(bucket, (value, prorated, count))| {
                let value = self.round(request.metric, value);
                BucketUsage {
                    bucket,
                    current_aggregation: value,
                    max_aggregation: value,
                    usage: UsageQuantity {
                        value,
                        prorated_value: prorated.map(|p| self.round(request.metric, p)),
                        events_count: count,
                    },
                }
            })
            .collect();
        ChargeUsage {
            charge_id: request.charge.id,
            period_from: request.bounds.from_datetime,
            buckets,
            stale: false,
        }
    }

    fn quantified_checkpoints(
        &self,
        request: &AggregationRequest<'_>,
        usage: &ChargeUsage,
        state: &QuantifiedState,
        now: DateTime<Utc>,
    ) -> Vec<CachedAggregation> {
        usage
            .buckets
            .iter()
            .map(|bucket| CachedAggregation {
                organization_id: request.organization_id,
                external_subscription_id: request.external_subscription_id.clone(),
                charge_id: request.charge.id,
                charge_filter_id: bucket.bucket.charge_filter_id,
                grouped_by: bucket.bucket.grouped_by.clone(),
                period_from: request.bounds.from_datetime,
                timestamp: state.last_timestamp,
                last_sequence: state.last_sequence,
                current_aggregation: bucket.current_aggregation,
                max_aggregation: bucket.max_aggregation,
                max_aggregation_with_proration: bucket.usage.prorated_value,
                events_count: bucket.usage.events_count,
                time_weighted_total: Decimal::ZERO,
                invalidated: false,
                frozen: false,
                updated_at: now,
            })
            .collect()
    }

    /// Usage reconstructed from stored checkpoints alone
    fn checkpoint_usage(
        &self,
        request: &AggregationRequest<'_>,
        rows: &[CachedAggregation],
        stale: bool,
    ) -> ChargeUsage {
        if request.metric.aggregation_type.is_quantified() {
            let buckets = rows
                .iter()
                .map(|row| BucketUsage {
                    bucket: row.bucket(),
                    current_aggregation: row.current_aggregation,
                    max_aggregation: row.max_aggregation,
                    usage: UsageQuantity {
                        value: row.current_aggregation,
                        prorated_value: row.max_aggregation_with_proration,
                        events_count: row.events_count,
                    },
                })
                .collect();
            return ChargeUsage {
                charge_id: request.charge.id,
                period_from: request.bounds.from_datetime,
                buckets,
                stale,
            };
        }
        self.running_usage(request, &RunningFold::from_checkpoints(request, rows), stale)
    }

    /// Brings the charge's checkpoints up to date and returns its usage.
    ///
    /// Resumes from the stored cursor unless the checkpoint is missing,
    /// invalidated, or a newly visible event predates it. Frozen periods are
    /// returned as stored.
    pub async fn aggregate(&self, request: &AggregationRequest<'_>) -> Result<ChargeUsage> {
        self.evaluate(request, Mode::Persist).await
    }

    /// Read-only usage; an invalidated checkpoint is returned as stale
    pub async fn current_usage(&self, request: &AggregationRequest<'_>) -> Result<ChargeUsage> {
        self.evaluate(request, Mode::ReadOnly).await
    }

    /// Read-only full recompute that bypasses checkpoints, frozen or not
    pub async fn recompute(&self, request: &AggregationRequest<'_>) -> Result<ChargeUsage> {
        self.replay(request, None).await
    }

    async fn replay(&self, request: &AggregationRequest<'_>, through: Option<u64>) -> Result<ChargeUsage> {
        if request.metric.aggregation_type.is_quantified() {
            let state = self.replay_quantified(request, through, false).await?;
            Ok(self.quantified_usage(request, &state))
        } else {
            let fold = self.replay_running(request, through, false).await?;
            Ok(self.running_usage(request, &fold, false))
        }
    }

    /// Usage of the event's bucket just before and just after the event
    pub async fn usage_around(
        &self,
        request: &AggregationRequest<'_>,
        event: &Event,
    ) -> Result<Option<(FilterMatch, UsageQuantity, UsageQuantity)>> {
        let before = self.replay(request, Some(event.sequence.saturating_sub(1))).await?;
        let after = self.replay(request, Some(event.sequence)).await?;

        let bucket = if request.metric.aggregation_type.is_quantified() && is_removal(event) {
            after
                .buckets
                .iter()
                .chain(before.buckets.iter())
                .map(|b| b.bucket.clone())
                .find(|b| before.bucket(b).map(|u| u.usage) != after.bucket(b).map(|u| u.usage))
        } else {
            filters::resolve(&event.properties, request.metric, request.charge)
        };
        let Some(bucket) = bucket else {
            return Ok(None);
        };

        let usage_of = |usage: &ChargeUsage| {
            usage
                .bucket(&bucket)
                .map(|b| b.usage)
                .unwrap_or_default()
        };
        let (before, after) = (usage_of(&before), usage_of(&after));
        Ok(Some((bucket, before, after)))
    }

    async fn evaluate(&self, request: &AggregationRequest<'_>, mode: Mode) -> Result<ChargeUsage> {
        let scope = request.scope();
        let rows = self.store.list_checkpoints(&scope).await?;

        if rows.iter().any(|row| row.frozen) {
            return Ok(self.checkpoint_usage(request, &rows, false));
        }
        let invalidated = rows.iter().any(|row| row.invalidated);
        if invalidated && mode == Mode::ReadOnly {
            debug!(
                "Serving stale usage for charge {} of {} while recompute is pending",
                request.charge.id, request.external_subscription_id
            );
            return Ok(self.checkpoint_usage(request, &rows, true));
        }

        if request.metric.aggregation_type.is_quantified() {
            self.evaluate_quantified(request, &scope, invalidated, mode).await
        } else {
            self.evaluate_running(request, &scope, &rows, invalidated, mode)
                .await
        }
    }

    async fn evaluate_running(
        &self,
        request: &AggregationRequest<'_>,
        scope: &AggregationScope,
        rows: &[CachedAggregation],
        invalidated: bool,
        mode: Mode,
    ) -> Result<ChargeUsage> {
        let record = mode == Mode::Persist;
        let mut resumed = None;

        if !rows.is_empty() && !invalidated {
            let mut fold = RunningFold::from_checkpoints(request, rows);
            let pending = self
                .events
                .list_events(&request.fold_query().after_sequence(fold.last_sequence))
                .await?;
            let checkpoint_at = RunningFold::checkpoint_timestamp(rows);
            let late = checkpoint_at.is_some_and(|at| pending.iter().any(|e| e.timestamp < at));
            if late {
                debug!(
                    "Late event for charge {} of {}, recomputing from period start",
                    request.charge.id, request.external_subscription_id
                );
            } else {
                self.fold_running(request, &mut fold, &pending, record);
                resumed = Some(fold);
            }
        }

        let full_recompute = resumed.is_none();
        let fold = match resumed {
            Some(fold) => fold,
            None => self.replay_running(request, None, record).await?,
        };

        if mode == Mode::Persist {
            self.store
                .replace_checkpoints(scope, fold.checkpoints(request, Utc::now()))
                .await?;
            self.metrics.record_aggregation_run(full_recompute);
            if full_recompute && invalidated {
                info!(
                    "Recomputed invalidated aggregation of charge {} for {}",
                    request.charge.id, request.external_subscription_id
                );
            }
        }

        Ok(self.running_usage(request, &fold, false))
    }

    async fn evaluate_quantified(
        &self,
        request: &AggregationRequest<'_>,
        scope: &AggregationScope,
        invalidated: bool,
        mode: Mode,
    ) -> Result<ChargeUsage> {
        let record = mode == Mode::Persist;
        let quantified_scope = request.quantified_scope();
        let mut state = self.store.get_quantified_state(&quantified_scope).await?;

        let pending = self
            .events
            .list_events(&request.fold_query().after_sequence(state.last_sequence))
            .await?;
        let late = state
            .last_timestamp
            .is_some_and(|at| pending.iter().any(|e| e.timestamp < at));

        let full_recompute = invalidated || late || state.last_sequence == 0;
        if full_recompute {
            state = self.replay_quantified(request, None, record).await?;
        } else {
            self.fold_quantified(request, &mut state, &pending, record);
        }

        let usage = self.quantified_usage(request, &state);
        if mode == Mode::Persist {
            let now = Utc::now();
            self.store
                .replace_checkpoints(scope, self.quantified_checkpoints(request, &usage, &state, now))
                .await?;
            self.store
                .update_quantified_state(&quantified_scope, state)
                .await?;
            self.metrics.record_aggregation_run(full_recompute);
        }
        Ok(usage)
    }

    /// Flags checkpoints that already folded events later than `event`
    pub async fn invalidate(
        &self,
        event: &Event,
        metric: &BillableMetric,
        charge: &Charge,
    ) -> Result<Vec<AggregationScope>> {
        let scopes = self
            .store
            .invalidate_checkpoints(
                event.organization_id,
                &event.external_subscription_id,
                charge.id,
                event.timestamp,
                metric.recurring,
            )
            .await?;
        if !scopes.is_empty() {
            info!(
                "Event {} invalidated {} checkpoint(s) of charge {}",
                event.transaction_id,
                scopes.len(),
                charge.id
            );
        }
        Ok(scopes)
    }

    pub async fn freeze(&self, scopes: &[AggregationScope]) -> Result<()> {
        self.store.freeze_checkpoints(scopes).await
    }

    pub async fn invalidated_scopes(&self, limit: usize) -> Result<Vec<AggregationScope>> {
        self.store.list_invalidated(limit).await
    }
}
