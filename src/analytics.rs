//! Analytics event log.
//!
//! A bounded, newest-first ring of request-level events backing the
//! analytics API surface. Events are immutable; the summary is recomputed
//! from the buffer on demand and every record fans out on the events
//! channel.

use crate::classify::{Complexity, Intent};
use crate::events::{Channel, EventHub, GatewayEvent};
use crate::router::Strategy;
use crate::{epoch_ms, new_id};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

/// What kind of thing happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyticsEventType {
    /// A query was processed by a provider.
    Query,
    /// A query was answered from cache.
    CacheHit,
    /// A query was refused at budget admission.
    BudgetReject,
    /// A query failed terminally.
    Error,
}

impl AnalyticsEventType {
    /// Canonical snake_case label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::CacheHit => "cache_hit",
            Self::BudgetReject => "budget_reject",
            Self::Error => "error",
        }
    }
}

/// One analytics event. Immutable.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsEvent {
    /// Unique event id.
    pub id: String,
    /// Epoch milliseconds.
    pub timestamp: u64,
    /// Event kind.
    pub event_type: AnalyticsEventType,
    /// Leading slice of the query text.
    pub query: Option<String>,
    /// Classified complexity, when known.
    pub complexity: Option<Complexity>,
    /// Classified intent, when known.
    pub intent: Option<Intent>,
    /// Routing strategy, when a decision was made.
    pub strategy: Option<Strategy>,
    /// Serving provider.
    pub provider: Option<String>,
    /// Serving model.
    pub model: Option<String>,
    /// Cost of the request, USD.
    pub cost: Option<f64>,
    /// End-to-end duration.
    pub response_time_ms: Option<u64>,
    /// Error code for error events.
    pub error_code: Option<String>,
}

impl AnalyticsEvent {
    /// New event of a kind, everything else unset.
    pub fn new(event_type: AnalyticsEventType) -> Self {
        Self {
            id: new_id(),
            timestamp: epoch_ms(),
            event_type,
            query: None,
            complexity: None,
            intent: None,
            strategy: None,
            provider: None,
            model: None,
            cost: None,
            response_time_ms: None,
            error_code: None,
        }
    }

    /// Attach a (truncated) query text.
    pub fn with_query(mut self, text: &str) -> Self {
        self.query = Some(text.chars().take(200).collect());
        self
    }

    /// Attach classification facts.
    pub fn with_classification(mut self, complexity: Complexity, intent: Intent) -> Self {
        self.complexity = Some(complexity);
        self.intent = Some(intent);
        self
    }

    /// Attach routing facts.
    pub fn with_routing(mut self, strategy: Strategy, provider: &str, model: &str) -> Self {
        self.strategy = Some(strategy);
        self.provider = Some(provider.to_string());
        self.model = Some(model.to_string());
        self
    }

    /// Attach the request cost.
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    /// Attach the end-to-end duration.
    pub fn with_response_time(mut self, ms: u64) -> Self {
        self.response_time_ms = Some(ms);
        self
    }

    /// Attach an error code.
    pub fn with_error_code(mut self, code: &str) -> Self {
        self.error_code = Some(code.to_string());
        self
    }
}

/// Aggregates over the buffer.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsSummary {
    /// Events held.
    pub total_events: usize,
    /// Provider-served queries.
    pub queries: usize,
    /// Cache-served queries.
    pub cache_hits: usize,
    /// Budget rejections.
    pub budget_rejects: usize,
    /// Terminal errors.
    pub errors: usize,
    /// Cache hits over answered queries, 0.0 when idle.
    pub cache_hit_rate: f64,
    /// Mean response time over events that carry one.
    pub avg_response_time_ms: f64,
    /// Sum of event costs, USD.
    pub total_cost: f64,
    /// Counts per intent label.
    pub by_intent: BTreeMap<String, usize>,
    /// Counts per complexity label.
    pub by_complexity: BTreeMap<String, usize>,
    /// Counts per provider.
    pub by_provider: BTreeMap<String, usize>,
}

/// Bounded analytics buffer.
pub struct AnalyticsLog {
    inner: Mutex<VecDeque<AnalyticsEvent>>,
    capacity: usize,
    hub: Arc<EventHub>,
}

impl AnalyticsLog {
    /// Default ring capacity.
    pub const DEFAULT_CAPACITY: usize = 5000;

    /// Log bounded at `capacity`, publishing to `hub`.
    pub fn new(capacity: usize, hub: Arc<EventHub>) -> Self {
        Self { inner: Mutex::new(VecDeque::new()), capacity: capacity.max(1), hub }
    }

    /// Record an event: prepend, trim, publish.
    pub fn record(&self, event: AnalyticsEvent) -> AnalyticsEvent {
        {
            let mut buf = self.lock();
            buf.push_front(event.clone());
            buf.truncate(self.capacity);
        }
        self.hub.publish(Channel::Events, GatewayEvent::Analytics(Box::new(event.clone())));
        event
    }

    /// Page of events, newest first, plus the total count.
    pub fn events(&self, limit: usize, offset: usize) -> (Vec<AnalyticsEvent>, usize) {
        let buf = self.lock();
        let total = buf.len();
        let page = buf.iter().skip(offset).take(limit).cloned().collect();
        (page, total)
    }

    /// Recompute the summary over the whole buffer.
    pub fn summary(&self) -> AnalyticsSummary {
        let buf = self.lock();
        let mut summary = AnalyticsSummary {
            total_events: buf.len(),
            queries: 0,
            cache_hits: 0,
            budget_rejects: 0,
            errors: 0,
            cache_hit_rate: 0.0,
            avg_response_time_ms: 0.0,
            total_cost: 0.0,
            by_intent: BTreeMap::new(),
            by_complexity: BTreeMap::new(),
            by_provider: BTreeMap::new(),
        };

        let mut time_sum = 0u64;
        let mut time_count = 0usize;
        for e in buf.iter() {
            match e.event_type {
                AnalyticsEventType::Query => summary.queries += 1,
                AnalyticsEventType::CacheHit => summary.cache_hits += 1,
                AnalyticsEventType::BudgetReject => summary.budget_rejects += 1,
                AnalyticsEventType::Error => summary.errors += 1,
            }
            if let Some(i) = e.intent {
                *summary.by_intent.entry(i.as_str().to_string()).or_insert(0) += 1;
            }
            if let Some(c) = e.complexity {
                *summary.by_complexity.entry(c.as_str().to_string()).or_insert(0) += 1;
            }
            if let Some(p) = &e.provider {
                *summary.by_provider.entry(p.clone()).or_insert(0) += 1;
            }
            if let Some(cost) = e.cost {
                summary.total_cost += cost;
            }
            if let Some(ms) = e.response_time_ms {
                time_sum += ms;
                time_count += 1;
            }
        }

        let answered = summary.queries + summary.cache_hits;
        if answered > 0 {
            summary.cache_hit_rate = summary.cache_hits as f64 / answered as f64;
        }
        if time_count > 0 {
            summary.avg_response_time_ms = time_sum as f64 / time_count as f64;
        }
        summary
    }

    /// Events currently held.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<AnalyticsEvent>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
