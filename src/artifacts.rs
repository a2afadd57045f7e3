//! Routing artifacts: structured, auditable records of every routing
//! decision and outcome.
//!
//! Artifacts are a tagged variant over a shared header (id, query id,
//! timestamp, tags) held in a bounded ring buffer, newest first. The only
//! permitted in-place mutation is [`ArtifactStore::enrich_with_response`],
//! which attaches the actual cost, response info, and quality report after
//! the provider call completes. Every record and enrichment is published on
//! the events channel.

use crate::budget::BudgetStatus;
use crate::classify::Complexity;
use crate::events::{Channel, EventHub, GatewayEvent};
use crate::quality::QualityReport;
use crate::router::{CascadeStep, Strategy};
use crate::{epoch_ms, new_id};
use chrono::{Local, NaiveTime, TimeZone};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Discriminant of an artifact body, used for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// A routing decision was taken.
    RouteDecision,
    /// The cache answered instead of a provider.
    CacheHit,
    /// The daily budget refused the request.
    BudgetReject,
    /// A cascade step fell short and the chain advanced.
    CascadeEscalation,
    /// A cascade step met its quality bar.
    CascadeSuccess,
    /// Every cascade step failed.
    CascadeFailure,
}

impl ArtifactKind {
    /// Canonical snake_case label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RouteDecision => "route_decision",
            Self::CacheHit => "cache_hit",
            Self::BudgetReject => "budget_reject",
            Self::CascadeEscalation => "cascade_escalation",
            Self::CascadeSuccess => "cascade_success",
            Self::CascadeFailure => "cascade_failure",
        }
    }

    /// Parse a label, for query-string filtering.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "route_decision" => Some(Self::RouteDecision),
            "cache_hit" => Some(Self::CacheHit),
            "budget_reject" => Some(Self::BudgetReject),
            "cascade_escalation" => Some(Self::CascadeEscalation),
            "cascade_success" => Some(Self::CascadeSuccess),
            "cascade_failure" => Some(Self::CascadeFailure),
            _ => None,
        }
    }
}

/// Kind-specific payload.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArtifactBody {
    /// A routing decision.
    RouteDecision {
        /// Strategy that produced the decision.
        strategy: Strategy,
        /// Complexity snapshot at decision time.
        complexity: Complexity,
        /// Selected provider.
        provider: String,
        /// Selected model.
        model: String,
        /// Estimated cost of the selected call, USD.
        estimated_cost: f64,
        /// The cascade chain, when the strategy built one.
        cascade_chain: Option<Vec<CascadeStep>>,
        /// Whether emergency mode shaped this decision.
        emergency_mode: bool,
        /// Daily budget snapshot at decision time.
        budget: BudgetStatus,
    },
    /// A cache hit that short-circuited provider work.
    CacheHit {
        /// Complexity snapshot.
        complexity: Complexity,
        /// Provider that produced the cached response originally.
        provider: String,
        /// Model that produced it.
        model: String,
        /// Similarity of the match; 1.0 for exact.
        similarity: f64,
        /// Cost avoided by serving from cache, USD.
        saved_cost: f64,
        /// Age of the entry at hit time, ms.
        age_ms: u64,
    },
    /// A request refused at budget admission.
    BudgetReject {
        /// Complexity snapshot.
        complexity: Complexity,
        /// Daily spend at rejection, USD.
        spent: f64,
        /// Daily limit, USD.
        limit: f64,
        /// Daily percent used.
        percent_used: f64,
    },
    /// The chain advanced past a below-threshold step.
    CascadeEscalation {
        /// Provider that fell short.
        from_provider: String,
        /// Model that fell short.
        from_model: String,
        /// Provider of the next step.
        to_provider: String,
        /// Model of the next step.
        to_model: String,
        /// Score the step achieved.
        score: f64,
        /// Threshold it needed.
        threshold: f64,
        /// Index of the failed step.
        step_index: usize,
    },
    /// A step met its quality bar.
    CascadeSuccess {
        /// Winning provider.
        provider: String,
        /// Winning model.
        model: String,
        /// Score achieved.
        score: f64,
        /// Threshold of the winning step.
        threshold: f64,
        /// Steps executed, including the winner.
        steps_taken: usize,
    },
    /// Every step failed.
    CascadeFailure {
        /// Steps attempted.
        attempts: usize,
        /// Final error text.
        last_error: String,
    },
}

impl ArtifactBody {
    /// The body's discriminant.
    pub fn kind(&self) -> ArtifactKind {
        match self {
            Self::RouteDecision { .. } => ArtifactKind::RouteDecision,
            Self::CacheHit { .. } => ArtifactKind::CacheHit,
            Self::BudgetReject { .. } => ArtifactKind::BudgetReject,
            Self::CascadeEscalation { .. } => ArtifactKind::CascadeEscalation,
            Self::CascadeSuccess { .. } => ArtifactKind::CascadeSuccess,
            Self::CascadeFailure { .. } => ArtifactKind::CascadeFailure,
        }
    }
}

/// Post-response enrichment, attached once per artifact.
#[derive(Debug, Clone, Serialize)]
pub struct Enrichment {
    /// What the call actually cost, USD.
    pub actual_cost: f64,
    /// Response length in characters.
    pub response_chars: usize,
    /// Leading slice of the response for inspection surfaces.
    pub response_preview: String,
    /// Quality report, when the response was scored.
    pub quality: Option<QualityReport>,
}

/// One artifact: shared header plus kind-specific body.
#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    /// Unique artifact id.
    pub id: String,
    /// The request this artifact belongs to.
    pub query_id: String,
    /// Creation time, epoch milliseconds.
    pub epoch_ms: u64,
    /// Free-form tags for ad-hoc filtering.
    pub tags: BTreeSet<String>,
    /// Confidence in the decision this artifact records, `[0, 1]`.
    pub confidence: f64,
    /// Why the decision came out this way.
    pub reasoning: String,
    /// Kind-specific payload.
    pub body: ArtifactBody,
    /// Attached after the response arrives; `None` until then.
    pub enrichment: Option<Enrichment>,
}

impl Artifact {
    /// The artifact's kind.
    pub fn kind(&self) -> ArtifactKind {
        self.body.kind()
    }
}

/// Aggregate view for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactSummary {
    /// Artifacts created today (local calendar day).
    pub today_count: usize,
    /// Counts per kind over the whole buffer.
    pub by_kind: BTreeMap<String, usize>,
    /// Sum of enriched actual costs today, USD.
    pub total_cost_today: f64,
    /// Cascade escalations in the buffer.
    pub escalations: usize,
    /// Cache hits in the buffer.
    pub cache_hits: usize,
    /// Mean confidence over the buffer, 0.0 when empty.
    pub avg_confidence: f64,
}

/// Bounded, newest-first ring buffer of artifacts.
pub struct ArtifactStore {
    inner: Mutex<VecDeque<Artifact>>,
    capacity: usize,
    hub: Arc<EventHub>,
}

impl ArtifactStore {
    /// Default ring capacity.
    pub const DEFAULT_CAPACITY: usize = 5000;

    /// Store bounded at `capacity`, publishing to `hub`.
    pub fn new(capacity: usize, hub: Arc<EventHub>) -> Self {
        Self { inner: Mutex::new(VecDeque::new()), capacity: capacity.max(1), hub }
    }

    /// Construct, prepend, trim, publish, and return the new artifact.
    pub fn record(
        &self,
        query_id: &str,
        confidence: f64,
        reasoning: impl Into<String>,
        mut tags: BTreeSet<String>,
        body: ArtifactBody,
    ) -> Artifact {
        tags.insert(body.kind().as_str().to_string());
        let artifact = Artifact {
            id: new_id(),
            query_id: query_id.to_string(),
            epoch_ms: epoch_ms(),
            tags,
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: reasoning.into(),
            body,
            enrichment: None,
        };

        {
            let mut buf = self.lock();
            buf.push_front(artifact.clone());
            buf.truncate(self.capacity);
        }
        debug!(
            kind = artifact.kind().as_str(),
            query_id = artifact.query_id.as_str(),
            "artifact recorded"
        );
        self.hub.publish(Channel::Events, GatewayEvent::Artifact(Box::new(artifact.clone())));
        artifact
    }

    /// Attach response data to an existing artifact. The single permitted
    /// in-place mutation; returns false if the artifact has been evicted.
    pub fn enrich_with_response(
        &self,
        artifact_id: &str,
        enrichment: Enrichment,
        confidence: Option<f64>,
    ) -> bool {
        let updated = {
            let mut buf = self.lock();
            match buf.iter_mut().find(|a| a.id == artifact_id) {
                Some(artifact) => {
                    artifact.enrichment = Some(enrichment);
                    if let Some(c) = confidence {
                        artifact.confidence = c.clamp(0.0, 1.0);
                    }
                    Some(artifact.clone())
                }
                None => None,
            }
        };
        match updated {
            Some(artifact) => {
                self.hub.publish(Channel::Events, GatewayEvent::Artifact(Box::new(artifact)));
                true
            }
            None => false,
        }
    }

    /// Newest `n` artifacts.
    pub fn get_recent(&self, n: usize) -> Vec<Artifact> {
        self.lock().iter().take(n).cloned().collect()
    }

    /// All artifacts for one request, newest first.
    pub fn get_by_query_id(&self, query_id: &str) -> Vec<Artifact> {
        self.lock().iter().filter(|a| a.query_id == query_id).cloned().collect()
    }

    /// Newest `n` artifacts of a kind.
    pub fn get_by_kind(&self, kind: ArtifactKind, n: usize) -> Vec<Artifact> {
        self.lock().iter().filter(|a| a.kind() == kind).take(n).cloned().collect()
    }

    /// Newest `n` artifacts carrying a tag.
    pub fn get_by_tag(&self, tag: &str, n: usize) -> Vec<Artifact> {
        self.lock().iter().filter(|a| a.tags.contains(tag)).take(n).cloned().collect()
    }

    /// Artifacts whose timestamp lies in `[from_ms, to_ms)`.
    pub fn get_by_time_range(&self, from_ms: u64, to_ms: u64) -> Vec<Artifact> {
        self.lock()
            .iter()
            .filter(|a| a.epoch_ms >= from_ms && a.epoch_ms < to_ms)
            .cloned()
            .collect()
    }

    /// Number of artifacts currently held.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Aggregate summary over the buffer.
    pub fn summary(&self) -> ArtifactSummary {
        let buf = self.lock();
        let today_start = Local
            .from_local_datetime(&Local::now().date_naive().and_time(NaiveTime::MIN))
            .earliest()
            .map(|dt| dt.timestamp_millis().max(0) as u64)
            .unwrap_or(0);

        let mut by_kind: BTreeMap<String, usize> = BTreeMap::new();
        let mut today_count = 0usize;
        let mut total_cost_today = 0.0f64;
        let mut confidence_sum = 0.0f64;

        for a in buf.iter() {
            *by_kind.entry(a.kind().as_str().to_string()).or_insert(0) += 1;
            confidence_sum += a.confidence;
            if a.epoch_ms >= today_start {
                today_count += 1;
                if let Some(e) = &a.enrichment {
                    total_cost_today += e.actual_cost;
                }
            }
        }

        ArtifactSummary {
            today_count,
            escalations: *by_kind.get("cascade_escalation").unwrap_or(&0),
            cache_hits: *by_kind.get("cache_hit").unwrap_or(&0),
            by_kind,
            total_cost_today,
            avg_confidence: if buf.is_empty() {
                0.0
            } else {
                confidence_sum / buf.len() as f64
            },
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Artifact>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetPeriod;

    fn hub() -> Arc<EventHub> {
        Arc::new(EventHub::new(64))
    }

    fn daily_status() -> BudgetStatus {
        BudgetStatus {
            period: BudgetPeriod::Daily,
            limit: 5.0,
            spent: 1.0,
            remaining: 4.0,
            percent_used: 20.0,
            period_start: chrono::Local::now().date_naive().and_time(NaiveTime::MIN),
            period_end: chrono::Local::now().date_naive().and_time(NaiveTime::MIN)
                + chrono::Duration::days(1),
        }
    }

    fn route_body() -> ArtifactBody {
        ArtifactBody::RouteDecision {
            strategy: Strategy::Cascade,
            complexity: Complexity::Simple,
            provider: "perplexity".into(),
            model: "sonar".into(),
            estimated_cost: 0.006,
            cascade_chain: None,
            emergency_mode: false,
            budget: daily_status(),
        }
    }

    fn store(capacity: usize) -> ArtifactStore {
        ArtifactStore::new(capacity, hub())
    }

    #[test]
    fn test_record_returns_artifact_with_kind_tag() {
        let s = store(10);
        let a = s.record("q1", 0.8, "cheapest suitable", BTreeSet::new(), route_body());
        assert_eq!(a.kind(), ArtifactKind::RouteDecision);
        assert!(a.tags.contains("route_decision"));
        assert_eq!(a.query_id, "q1");
    }

    #[test]
    fn test_ring_buffer_never_exceeds_capacity_fifo() {
        let s = store(3);
        for i in 0..5 {
            s.record(&format!("q{i}"), 0.5, "r", BTreeSet::new(), route_body());
        }
        assert_eq!(s.len(), 3);
        let recent = s.get_recent(3);
        // Newest first; the two oldest were evicted.
        assert_eq!(recent[0].query_id, "q4");
        assert_eq!(recent[2].query_id, "q2");
    }

    #[test]
    fn test_get_by_query_id_filters() {
        let s = store(10);
        s.record("q1", 0.5, "r", BTreeSet::new(), route_body());
        s.record("q2", 0.5, "r", BTreeSet::new(), route_body());
        s.record(
            "q1",
            0.5,
            "step short",
            BTreeSet::new(),
            ArtifactBody::CascadeEscalation {
                from_provider: "perplexity".into(),
                from_model: "sonar".into(),
                to_provider: "openai".into(),
                to_model: "gpt-4o-mini".into(),
                score: 6.5,
                threshold: 7.0,
                step_index: 0,
            },
        );
        let q1 = s.get_by_query_id("q1");
        assert_eq!(q1.len(), 2);
        assert!(q1.iter().all(|a| a.query_id == "q1"));
    }

    #[test]
    fn test_get_by_kind_and_tag() {
        let s = store(10);
        let mut tags = BTreeSet::new();
        tags.insert("realtime".to_string());
        s.record("q1", 0.5, "r", tags, route_body());
        s.record(
            "q2",
            0.9,
            "cache",
            BTreeSet::new(),
            ArtifactBody::CacheHit {
                complexity: Complexity::Simple,
                provider: "openai".into(),
                model: "gpt-4o-mini".into(),
                similarity: 1.0,
                saved_cost: 0.002,
                age_ms: 1200,
            },
        );
        assert_eq!(s.get_by_kind(ArtifactKind::CacheHit, 10).len(), 1);
        assert_eq!(s.get_by_kind(ArtifactKind::RouteDecision, 10).len(), 1);
        assert_eq!(s.get_by_tag("realtime", 10).len(), 1);
        assert_eq!(s.get_by_tag("cache_hit", 10).len(), 1, "kind label doubles as tag");
    }

    #[test]
    fn test_time_range_is_half_open() {
        let s = store(10);
        let a = s.record("q1", 0.5, "r", BTreeSet::new(), route_body());
        assert_eq!(s.get_by_time_range(a.epoch_ms, a.epoch_ms + 1).len(), 1);
        assert!(s.get_by_time_range(a.epoch_ms + 1, a.epoch_ms + 2).is_empty());
        assert!(s.get_by_time_range(0, a.epoch_ms).is_empty());
    }

    #[test]
    fn test_enrich_attaches_once_and_updates_confidence() {
        let s = store(10);
        let a = s.record("q1", 0.5, "r", BTreeSet::new(), route_body());
        let ok = s.enrich_with_response(
            &a.id,
            Enrichment {
                actual_cost: 0.0042,
                response_chars: 900,
                response_preview: "The answer".into(),
                quality: None,
            },
            Some(0.9),
        );
        assert!(ok);
        let stored = &s.get_by_query_id("q1")[0];
        let e = stored.enrichment.as_ref().expect("enriched");
        assert!((e.actual_cost - 0.0042).abs() < 1e-12);
        assert!((stored.confidence - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_enrich_missing_artifact_returns_false() {
        let s = store(10);
        let ok = s.enrich_with_response(
            "no-such-id",
            Enrichment {
                actual_cost: 0.0,
                response_chars: 0,
                response_preview: String::new(),
                quality: None,
            },
            None,
        );
        assert!(!ok);
    }

    #[test]
    fn test_record_publishes_to_events_channel() {
        let h = hub();
        let s = ArtifactStore::new(10, h.clone());
        let mut sub = h.subscribe(Channel::Events);
        let a = s.record("q1", 0.5, "r", BTreeSet::new(), route_body());
        match sub.try_recv() {
            Some(GatewayEvent::Artifact(published)) => assert_eq!(published.id, a.id),
            other => panic!("expected artifact event, got {other:?}"),
        }
    }

    #[test]
    fn test_summary_counts() {
        let s = store(10);
        s.record("q1", 0.8, "r", BTreeSet::new(), route_body());
        s.record(
            "q1",
            1.0,
            "cache",
            BTreeSet::new(),
            ArtifactBody::CacheHit {
                complexity: Complexity::Simple,
                provider: "openai".into(),
                model: "gpt-4o-mini".into(),
                similarity: 0.95,
                saved_cost: 0.002,
                age_ms: 10,
            },
        );
        let a = s.record(
            "q2",
            0.6,
            "step short",
            BTreeSet::new(),
            ArtifactBody::CascadeEscalation {
                from_provider: "perplexity".into(),
                from_model: "sonar".into(),
                to_provider: "openai".into(),
                to_model: "gpt-4o-mini".into(),
                score: 6.0,
                threshold: 7.0,
                step_index: 0,
            },
        );
        s.enrich_with_response(
            &a.id,
            Enrichment {
                actual_cost: 0.01,
                response_chars: 10,
                response_preview: "x".into(),
                quality: None,
            },
            None,
        );

        let sum = s.summary();
        assert_eq!(sum.today_count, 3);
        assert_eq!(sum.cache_hits, 1);
        assert_eq!(sum.escalations, 1);
        assert_eq!(sum.by_kind["route_decision"], 1);
        assert!((sum.total_cost_today - 0.01).abs() < 1e-12);
        let expected_avg = (0.8 + 1.0 + 0.6) / 3.0;
        assert!((sum.avg_confidence - expected_avg).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_is_clamped() {
        let s = store(10);
        let a = s.record("q1", 7.0, "r", BTreeSet::new(), route_body());
        assert!((a.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_kind_labels_round_trip() {
        for kind in [
            ArtifactKind::RouteDecision,
            ArtifactKind::CacheHit,
            ArtifactKind::BudgetReject,
            ArtifactKind::CascadeEscalation,
            ArtifactKind::CascadeSuccess,
            ArtifactKind::CascadeFailure,
        ] {
            assert_eq!(ArtifactKind::parse(kind.as_str()), Some(kind));
        }
    }
}
