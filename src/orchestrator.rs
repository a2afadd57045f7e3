//! Request orchestration.
//!
//! [`Gateway::process_query`] is the single entry point: classify, consult
//! the semantic cache, admit against the daily budget, route, execute the
//! cascade (or a direct call), account the cost, and fan the post-steps
//! out in parallel. Every subsystem is an explicit constructor argument or
//! built from configuration — there is no process-global state, and test
//! seams replace whole subsystems by constructing a new gateway.

use crate::analytics::{AnalyticsEvent, AnalyticsEventType, AnalyticsLog};
use crate::artifacts::{Artifact, ArtifactBody, ArtifactStore, Enrichment};
use crate::budget::{BudgetPeriod, BudgetTracker};
use crate::cache::{CacheStore, NewCacheEntry, SemanticCache};
use crate::cascade::{run_cascade, CascadeError};
use crate::classify::{ClassifiedQuery, Classifier};
use crate::config::GatewayConfig;
use crate::costbook::{Capability, CostBook};
use crate::events::{BudgetUpdate, CacheNotice, Channel, EventHub, GatewayEvent, HealthUpdate};
use crate::metrics;
use crate::provider::{
    call_timeout, call_with_retry, ChatMessage, ChatRequest, HealthTracker, ProviderHealth,
    ProviderRegistry, ProviderResponse, RetryPolicy, TokenUsage,
};
use crate::quality::{QualityEstimator, QualityInput, QualityReport};
use crate::router::{Router, RoutingDecision, Strategy};
use crate::{new_id, GatewayError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Per-request options.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryOptions {
    /// Optional system prompt forwarded to the provider.
    pub system_prompt: Option<String>,
    /// Prior turns, oldest first.
    pub conversation_history: Vec<ChatMessage>,
    /// Generation cap.
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Routing strategy override.
    pub strategy: Option<Strategy>,
    /// Cache TTL override, milliseconds.
    pub cache_ttl_ms: Option<u64>,
}

/// What a processed query returns: the response plus its trace.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayResponse {
    /// Query id; every artifact for this request carries it.
    pub id: String,
    /// Response body.
    pub content: String,
    /// Serving provider; the original producer for cache hits.
    pub provider: String,
    /// Serving model.
    pub model: String,
    /// Whether the cache answered.
    pub cache_hit: bool,
    /// Match similarity for cache hits.
    pub similarity: Option<f64>,
    /// Cost of this request, USD. Zero for cache hits.
    pub cost: f64,
    /// Billed usage. Zero input tokens for cache hits.
    pub tokens: TokenUsage,
    /// End-to-end latency.
    pub total_time_ms: u64,
    /// Citations, when the provider returned them.
    pub citations: Vec<String>,
    /// Classification snapshot.
    pub classification: ClassifiedQuery,
    /// Routing decision; absent for cache hits.
    pub routing: Option<RoutingDecision>,
    /// Quality report of the served response, when scored.
    pub quality: Option<QualityReport>,
    /// Artifacts recorded for this request, in production order.
    pub artifacts: Vec<Artifact>,
}

/// The orchestrator. Construct once, share behind an `Arc`.
pub struct Gateway {
    classifier: Classifier,
    cost_book: Arc<CostBook>,
    budget: Arc<BudgetTracker>,
    cache: Arc<SemanticCache>,
    quality: QualityEstimator,
    artifacts: Arc<ArtifactStore>,
    analytics: Arc<AnalyticsLog>,
    router: Router,
    providers: Arc<ProviderRegistry>,
    health: Arc<HealthTracker>,
    hub: Arc<EventHub>,
    retry: RetryPolicy,
    realtime_ttl_ms: u64,
}

impl Gateway {
    /// Build a gateway with the in-memory cache adapter.
    pub fn new(config: &GatewayConfig, providers: ProviderRegistry) -> Self {
        let cache = Arc::new(SemanticCache::in_memory(config.cache_config()));
        Self::assemble(config, providers, cache)
    }

    /// Build a gateway over an explicit cache adapter (redis, test double).
    pub fn with_store(
        config: &GatewayConfig,
        providers: ProviderRegistry,
        store: Arc<dyn CacheStore>,
    ) -> Self {
        let cache = Arc::new(SemanticCache::new(store, config.cache_config()));
        Self::assemble(config, providers, cache)
    }

    /// Override the provider retry policy (tests use short delays).
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn assemble(
        config: &GatewayConfig,
        providers: ProviderRegistry,
        cache: Arc<SemanticCache>,
    ) -> Self {
        let hub = Arc::new(EventHub::default());
        let cost_book = Arc::new(CostBook::new());
        let budget = Arc::new(BudgetTracker::new(config.budget_config()));
        let artifacts = Arc::new(ArtifactStore::new(ArtifactStore::DEFAULT_CAPACITY, hub.clone()));
        let analytics = Arc::new(AnalyticsLog::new(AnalyticsLog::DEFAULT_CAPACITY, hub.clone()));
        let router = Router::new(cost_book.clone(), budget.clone(), config.router_config());

        Self {
            classifier: Classifier::with_thresholds(config.classifier_thresholds()),
            cost_book,
            budget,
            cache,
            quality: QualityEstimator::new(),
            artifacts,
            analytics,
            router,
            providers: Arc::new(providers),
            health: Arc::new(HealthTracker::new()),
            hub,
            retry: RetryPolicy::default(),
            realtime_ttl_ms: config.cache.realtime_ttl_ms,
        }
    }

    // ── Shared-state accessors (used by the transport layer) ───────────

    /// The event hub.
    pub fn hub(&self) -> Arc<EventHub> {
        self.hub.clone()
    }

    /// The artifact store.
    pub fn artifacts(&self) -> Arc<ArtifactStore> {
        self.artifacts.clone()
    }

    /// The analytics log.
    pub fn analytics(&self) -> Arc<AnalyticsLog> {
        self.analytics.clone()
    }

    /// The budget tracker.
    pub fn budget(&self) -> Arc<BudgetTracker> {
        self.budget.clone()
    }

    /// The semantic cache.
    pub fn cache(&self) -> Arc<SemanticCache> {
        self.cache.clone()
    }

    /// The provider registry.
    pub fn providers(&self) -> Arc<ProviderRegistry> {
        self.providers.clone()
    }

    /// Health snapshots for every registered provider.
    pub fn provider_health(&self) -> BTreeMap<String, ProviderHealth> {
        self.providers
            .names()
            .into_iter()
            .map(|name| {
                let snapshot = self.health.snapshot(&name);
                (name, snapshot)
            })
            .collect()
    }

    // ── Entry point ────────────────────────────────────────────────────

    /// Process one query end to end.
    pub async fn process_query(
        &self,
        text: &str,
        opts: QueryOptions,
    ) -> Result<GatewayResponse, GatewayError> {
        if text.trim().is_empty() {
            return Err(GatewayError::InvalidInput("query content is empty".into()));
        }

        let query_id = new_id();
        let started = Instant::now();
        let classification = self.classifier.classify(text);
        debug!(
            query_id = query_id.as_str(),
            complexity = classification.complexity.as_str(),
            intent = classification.intent.as_str(),
            realtime = classification.is_realtime,
            "classified"
        );

        // Cache lookup, unless policy skips it.
        let skip_cache = classification.should_skip_cache();
        if !skip_cache {
            if let Some(hit) = self.cache.lookup(text).await {
                return Ok(self.serve_from_cache(query_id, classification, hit, started));
            }
            metrics::inc_cache_lookup("miss");
        }

        // Budget admission against the daily period.
        let daily = self.budget.status(BudgetPeriod::Daily);
        if daily.limit > 0.0 && daily.percent_used >= 100.0 {
            self.artifacts.record(
                &query_id,
                1.0,
                format!("daily budget at {:.2}%", daily.percent_used),
                BTreeSet::from([classification.complexity.as_str().to_string()]),
                ArtifactBody::BudgetReject {
                    complexity: classification.complexity,
                    spent: daily.spent,
                    limit: daily.limit,
                    percent_used: daily.percent_used,
                },
            );
            self.analytics.record(
                AnalyticsEvent::new(AnalyticsEventType::BudgetReject)
                    .with_query(text)
                    .with_classification(classification.complexity, classification.intent),
            );
            metrics::inc_request("budget_reject");
            return Err(GatewayError::BudgetExceeded { spent: daily.spent, limit: daily.limit });
        }

        // Route and record the decision.
        let decision = self.router.decide(&classification, opts.strategy);
        let mut tags = BTreeSet::from([
            decision.strategy.as_str().to_string(),
            classification.complexity.as_str().to_string(),
            classification.intent.as_str().to_string(),
        ]);
        if classification.is_realtime {
            tags.insert("realtime".to_string());
        }
        let route_artifact = self.artifacts.record(
            &query_id,
            decision_confidence(&decision, &classification),
            decision.reason.clone(),
            tags,
            ArtifactBody::RouteDecision {
                strategy: decision.strategy,
                complexity: classification.complexity,
                provider: decision.provider.clone(),
                model: decision.model.clone(),
                estimated_cost: decision.estimated_cost,
                cascade_chain: decision.cascade_chain.clone(),
                emergency_mode: decision.emergency_mode,
                budget: daily.clone(),
            },
        );

        // Execute.
        let request = ChatRequest {
            id: query_id.clone(),
            content: text.to_string(),
            system_prompt: opts.system_prompt.clone(),
            conversation_history: opts.conversation_history.clone(),
            max_tokens: opts.max_tokens,
            temperature: opts.temperature,
        };
        let execution = self.execute(&query_id, &classification, &decision, &request).await;
        let response = match execution {
            Ok(response) => response,
            Err(e) => {
                self.analytics.record(
                    AnalyticsEvent::new(AnalyticsEventType::Error)
                        .with_query(text)
                        .with_classification(classification.complexity, classification.intent)
                        .with_error_code(e.code()),
                );
                metrics::inc_request("error");
                metrics::inc_error(e.code());
                return Err(e);
            }
        };

        // Account the actual cost and score the response.
        let actual = self.cost_book.actual(
            &response.provider,
            &response.model,
            response.tokens.input,
            response.tokens.output,
        );
        let report = self.score(&response, &classification);
        self.artifacts.enrich_with_response(
            &route_artifact.id,
            Enrichment {
                actual_cost: actual.total_cost,
                response_chars: response.content.len(),
                response_preview: response.content.chars().take(200).collect(),
                quality: Some(report.clone()),
            },
            Some(report.confidence),
        );

        // Post-steps run concurrently; none of them can fail the request.
        let total_time_ms = started.elapsed().as_millis() as u64;
        let cache_store = async {
            if !skip_cache {
                let ttl = opts.cache_ttl_ms.or_else(|| {
                    Some(if classification.is_realtime {
                        self.realtime_ttl_ms
                    } else {
                        classification.suggest_cache_ttl_ms()
                    })
                });
                self.cache
                    .store(
                        text,
                        NewCacheEntry {
                            response: response.content.clone(),
                            provider: response.provider.clone(),
                            model: response.model.clone(),
                            cost: actual.total_cost,
                            tokens_used: response.tokens.total,
                        },
                        ttl,
                    )
                    .await;
                self.hub.publish(
                    Channel::Cache,
                    GatewayEvent::Cache(CacheNotice {
                        action: "store".to_string(),
                        query_hash: Some(SemanticCache::query_hash(text)),
                        similarity: None,
                    }),
                );
            }
        };
        let bookkeeping = async {
            self.analytics.record(
                AnalyticsEvent::new(AnalyticsEventType::Query)
                    .with_query(text)
                    .with_classification(classification.complexity, classification.intent)
                    .with_routing(decision.strategy, &response.provider, &response.model)
                    .with_cost(actual.total_cost)
                    .with_response_time(total_time_ms),
            );
            let alerts = self.budget.record_cost(actual.clone());
            let statuses = self.budget.statuses();
            for s in &statuses {
                metrics::set_budget_percent(s.period.as_str(), s.percent_used);
            }
            let emergency = self.budget.is_emergency_mode();
            if alerts.is_empty() {
                self.hub.publish(
                    Channel::Budget,
                    GatewayEvent::Budget(BudgetUpdate {
                        statuses: statuses.to_vec(),
                        emergency_mode: emergency,
                        alert: None,
                    }),
                );
            } else {
                for alert in alerts {
                    self.hub.publish(
                        Channel::Budget,
                        GatewayEvent::Budget(BudgetUpdate {
                            statuses: statuses.to_vec(),
                            emergency_mode: emergency,
                            alert: Some(alert),
                        }),
                    );
                }
            }
        };
        tokio::join!(cache_store, bookkeeping);

        metrics::inc_request("success");
        metrics::add_cost(&response.provider, &response.model, actual.total_cost);

        let mut artifacts = self.artifacts.get_by_query_id(&query_id);
        artifacts.reverse();
        info!(
            query_id = query_id.as_str(),
            provider = response.provider.as_str(),
            model = response.model.as_str(),
            cost = actual.total_cost,
            total_time_ms,
            "query served"
        );

        Ok(GatewayResponse {
            id: query_id,
            content: response.content,
            provider: response.provider,
            model: response.model,
            cache_hit: false,
            similarity: None,
            cost: actual.total_cost,
            tokens: response.tokens,
            total_time_ms,
            citations: response.citations,
            classification,
            routing: Some(decision),
            quality: Some(report),
            artifacts,
        })
    }

    // ── Execution ──────────────────────────────────────────────────────

    async fn execute(
        &self,
        query_id: &str,
        classification: &ClassifiedQuery,
        decision: &RoutingDecision,
        request: &ChatRequest,
    ) -> Result<ProviderResponse, GatewayError> {
        match &decision.cascade_chain {
            Some(chain) => {
                let outcome = run_cascade(
                    chain,
                    |step, _index| {
                        let provider = step.provider.clone();
                        let model = step.model.clone();
                        async move { self.call_provider(&provider, &model, request).await }
                    },
                    |response: &ProviderResponse| {
                        self.score(response, classification).overall_score
                    },
                    |step, index, score| {
                        if score < step.quality_threshold && index + 1 < chain.len() {
                            let next = &chain[index + 1];
                            metrics::inc_escalation();
                            self.artifacts.record(
                                query_id,
                                score / 10.0,
                                format!(
                                    "step {} scored {score:.1}, below {:.1}",
                                    index, step.quality_threshold
                                ),
                                BTreeSet::new(),
                                ArtifactBody::CascadeEscalation {
                                    from_provider: step.provider.clone(),
                                    from_model: step.model.clone(),
                                    to_provider: next.provider.clone(),
                                    to_model: next.model.clone(),
                                    score,
                                    threshold: step.quality_threshold,
                                    step_index: index,
                                },
                            );
                        }
                    },
                )
                .await;

                match outcome {
                    Ok(outcome) => {
                        if outcome.met_threshold {
                            let step = &chain[outcome.step_index];
                            self.artifacts.record(
                                query_id,
                                outcome.score / 10.0,
                                format!(
                                    "step {} met threshold {:.1}",
                                    outcome.step_index, step.quality_threshold
                                ),
                                BTreeSet::new(),
                                ArtifactBody::CascadeSuccess {
                                    provider: step.provider.clone(),
                                    model: step.model.clone(),
                                    score: outcome.score,
                                    threshold: step.quality_threshold,
                                    steps_taken: outcome.attempts.len(),
                                },
                            );
                        } else {
                            warn!(
                                query_id,
                                score = outcome.score,
                                "cascade exhausted, serving best-of-chain"
                            );
                        }
                        Ok(outcome.response)
                    }
                    Err(CascadeError::EmptyChain) => {
                        Err(GatewayError::Internal("router produced an empty chain".into()))
                    }
                    Err(CascadeError::AllStepsFailed { attempts, last_error }) => {
                        self.artifacts.record(
                            query_id,
                            0.0,
                            "every cascade step failed",
                            BTreeSet::new(),
                            ArtifactBody::CascadeFailure {
                                attempts,
                                last_error: last_error.clone(),
                            },
                        );
                        Err(GatewayError::AllCascadeStepsFailed(last_error))
                    }
                }
            }
            None => self.call_provider(&decision.provider, &decision.model, request).await,
        }
    }

    /// One provider call: registry lookup, deadline, retry, health and
    /// metrics bookkeeping.
    async fn call_provider(
        &self,
        provider_name: &str,
        model: &str,
        request: &ChatRequest,
    ) -> Result<ProviderResponse, GatewayError> {
        let provider = self.providers.get(provider_name).ok_or_else(|| {
            GatewayError::Provider {
                provider: provider_name.to_string(),
                model: model.to_string(),
                status: Some(503),
                message: "provider not configured".to_string(),
                retry_after_ms: None,
            }
        })?;

        let reasoning = self
            .cost_book
            .get(provider_name, model)
            .is_some_and(|p| p.has_capability(Capability::Reasoning));
        let deadline = call_timeout(reasoning);
        let started = Instant::now();
        metrics::inc_provider_call(provider_name, model);

        let result =
            tokio::time::timeout(deadline, call_with_retry(&*provider, request, model, &self.retry))
                .await;
        let elapsed = started.elapsed();
        metrics::observe_provider_latency(provider_name, elapsed);

        match result {
            Ok(Ok(response)) => {
                self.health.record_success(provider_name, elapsed.as_millis() as u64);
                Ok(response)
            }
            Ok(Err(e)) => {
                self.note_provider_failure(provider_name, elapsed.as_millis() as u64);
                Err(e)
            }
            Err(_) => {
                self.note_provider_failure(provider_name, deadline.as_millis() as u64);
                Err(GatewayError::Provider {
                    provider: provider_name.to_string(),
                    model: model.to_string(),
                    status: None,
                    message: format!("call exceeded {}s deadline", deadline.as_secs()),
                    retry_after_ms: None,
                })
            }
        }
    }

    fn note_provider_failure(&self, provider_name: &str, latency_ms: u64) {
        self.health.record_failure(provider_name);
        let snapshot = self.health.snapshot(provider_name);
        self.hub.publish(
            Channel::Health,
            GatewayEvent::Health(HealthUpdate {
                provider: provider_name.to_string(),
                healthy: snapshot.healthy,
                latency_ms: Some(latency_ms),
            }),
        );
    }

    fn serve_from_cache(
        &self,
        query_id: String,
        classification: ClassifiedQuery,
        hit: crate::cache::CacheLookup,
        started: Instant,
    ) -> GatewayResponse {
        let entry = hit.entry;
        let age_ms = crate::epoch_ms().saturating_sub(entry.created_at);
        let result = if hit.similarity >= 1.0 { "exact_hit" } else { "semantic_hit" };
        metrics::inc_cache_lookup(result);
        metrics::inc_request("cache_hit");

        self.artifacts.record(
            &query_id,
            hit.similarity,
            format!("cache {result} at similarity {:.3}", hit.similarity),
            BTreeSet::from([classification.intent.as_str().to_string()]),
            ArtifactBody::CacheHit {
                complexity: classification.complexity,
                provider: entry.provider.clone(),
                model: entry.model.clone(),
                similarity: hit.similarity,
                saved_cost: entry.cost,
                age_ms,
            },
        );
        self.analytics.record(
            AnalyticsEvent::new(AnalyticsEventType::CacheHit)
                .with_query(&classification.text)
                .with_classification(classification.complexity, classification.intent)
                .with_cost(0.0)
                .with_response_time(started.elapsed().as_millis() as u64),
        );
        self.hub.publish(
            Channel::Cache,
            GatewayEvent::Cache(CacheNotice {
                action: "hit".to_string(),
                query_hash: Some(entry.query_hash.clone()),
                similarity: Some(hit.similarity),
            }),
        );

        let mut artifacts = self.artifacts.get_by_query_id(&query_id);
        artifacts.reverse();
        GatewayResponse {
            id: query_id,
            content: entry.response,
            provider: entry.provider,
            model: entry.model,
            cache_hit: true,
            similarity: Some(hit.similarity),
            cost: 0.0,
            tokens: TokenUsage { input: 0, output: entry.tokens_used, total: entry.tokens_used },
            total_time_ms: started.elapsed().as_millis() as u64,
            citations: Vec::new(),
            classification,
            routing: None,
            quality: None,
            artifacts,
        }
    }

    /// Score a response with the quality estimator.
    fn score(&self, response: &ProviderResponse, classification: &ClassifiedQuery) -> QualityReport {
        let provider_is_search = self
            .cost_book
            .get(&response.provider, &response.model)
            .is_some_and(|p| p.has_capability(Capability::WebSearch));
        let input = QualityInput {
            text: &response.content,
            citations: &response.citations,
            provider_is_search,
            response_time_ms: Some(response.response_time_ms),
            input_tokens: Some(response.tokens.input),
            output_tokens: Some(response.tokens.output),
        };
        self.quality.evaluate(&input, classification)
    }
}

/// How sure the router is about a decision: a strategy-specific base,
/// nudged up as the complexity score moves away from the ambiguous middle
/// of its range.
fn decision_confidence(decision: &RoutingDecision, classification: &ClassifiedQuery) -> f64 {
    let base = match decision.strategy {
        Strategy::Priority => 0.85,
        Strategy::CostOptimized => 0.75,
        Strategy::Cascade => 0.80,
        Strategy::Emergency => 0.60,
    };
    let boundary_drift = (classification.complexity_score - 0.5).abs();
    (base + 0.1 * boundary_drift).clamp(0.0, 1.0)
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactKind;
    use crate::costbook::ActualCost;
    use crate::provider::{ScriptedProvider, ScriptedReply};

    fn config() -> GatewayConfig {
        GatewayConfig::default()
    }

    /// A gateway over scripted providers, with fast retries so failure
    /// paths do not slow the suite down.
    fn gateway_with(providers: Vec<Arc<ScriptedProvider>>) -> Gateway {
        let mut registry = ProviderRegistry::new();
        for p in providers {
            registry.register(p);
        }
        Gateway::new(&config(), registry).with_retry_policy(RetryPolicy {
            max_retries: 0,
            base_delay: std::time::Duration::from_millis(1),
            jitter_ms: 0,
            ..RetryPolicy::default()
        })
    }

    fn decent_reply() -> ScriptedReply {
        // Structured, confident, mid-length: scores comfortably above the
        // simple-band cascade threshold of 6.0.
        let body = vec!["word"; 190].join(" ");
        ScriptedReply {
            content: format!("# Answer\n\nClearly, {body}\n\n- point\n- point\n\n**done**"),
            citations: vec![
                "https://a.example.com/1".to_string(),
                "https://b.example.org/2".to_string(),
                "https://c.example.net/3".to_string(),
            ],
            input_tokens: 100,
            output_tokens: 300,
            cost: 0.001,
        }
    }

    fn refusal_reply() -> ScriptedReply {
        ScriptedReply {
            content: "I cannot help with that.".to_string(),
            citations: Vec::new(),
            input_tokens: 100,
            output_tokens: 10,
            cost: 0.001,
        }
    }

    #[tokio::test]
    async fn test_empty_query_is_invalid_input() {
        let g = gateway_with(vec![]);
        let err = g.process_query("   ", QueryOptions::default()).await.expect_err("rejects");
        assert!(matches!(err, GatewayError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_simple_query_served_by_first_cascade_rung() {
        let sonar = Arc::new(ScriptedProvider::new("perplexity"));
        sonar.push_reply(decent_reply());
        let openai = Arc::new(ScriptedProvider::new("openai"));
        let anthropic = Arc::new(ScriptedProvider::new("anthropic"));
        let g = gateway_with(vec![sonar.clone(), openai.clone(), anthropic]);

        let resp = g
            .process_query("What is the capital of France?", QueryOptions::default())
            .await
            .expect("served");
        assert!(!resp.cache_hit);
        assert_eq!(resp.provider, "perplexity");
        assert_eq!(sonar.call_count(), 1, "exactly one provider call");
        assert_eq!(openai.call_count(), 0);
        assert!(resp.cost > 0.0);
        assert!(resp.quality.is_some());

        // route_decision then cascade_success, in production order.
        let kinds: Vec<ArtifactKind> = resp.artifacts.iter().map(|a| a.kind()).collect();
        assert_eq!(kinds[0], ArtifactKind::RouteDecision);
        assert!(kinds.contains(&ArtifactKind::CascadeSuccess));
        assert!(!kinds.contains(&ArtifactKind::CascadeEscalation));
    }

    #[tokio::test]
    async fn test_low_quality_first_step_escalates() {
        let sonar = Arc::new(ScriptedProvider::new("perplexity"));
        sonar.push_reply(refusal_reply());
        let openai = Arc::new(ScriptedProvider::new("openai"));
        openai.push_reply(decent_reply());
        let anthropic = Arc::new(ScriptedProvider::new("anthropic"));
        let g = gateway_with(vec![sonar.clone(), openai.clone(), anthropic]);

        let resp = g
            .process_query("What is the capital of France?", QueryOptions::default())
            .await
            .expect("served");
        assert_eq!(resp.provider, "openai", "second rung serves after escalation");
        assert_eq!(sonar.call_count(), 1);
        assert_eq!(openai.call_count(), 1);

        let kinds: Vec<ArtifactKind> = resp.artifacts.iter().map(|a| a.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                ArtifactKind::RouteDecision,
                ArtifactKind::CascadeEscalation,
                ArtifactKind::CascadeSuccess
            ]
        );
    }

    #[tokio::test]
    async fn test_cache_round_trip_and_zero_cost() {
        let openai = Arc::new(ScriptedProvider::new("openai"));
        openai.push_reply(decent_reply());
        let g = gateway_with(vec![
            Arc::new(ScriptedProvider::new("perplexity")),
            openai.clone(),
            Arc::new(ScriptedProvider::new("anthropic")),
        ]);

        let first = g
            .process_query(
                "Explain quantum computing",
                QueryOptions { strategy: Some(Strategy::CostOptimized), ..Default::default() },
            )
            .await
            .expect("first pass served");
        assert!(!first.cache_hit);
        assert_eq!(openai.call_count(), 1);

        // Punctuation variant: semantic hit, no provider call, zero cost.
        let second = g
            .process_query(
                "explain quantum computing.",
                QueryOptions { strategy: Some(Strategy::CostOptimized), ..Default::default() },
            )
            .await
            .expect("second pass served from cache");
        assert!(second.cache_hit);
        assert!(second.similarity.expect("similarity") >= 0.82);
        assert!(second.cost.abs() < f64::EPSILON);
        assert_eq!(second.tokens.input, 0);
        assert_eq!(openai.call_count(), 1, "no extra provider call");
        assert_eq!(second.artifacts[0].kind(), ArtifactKind::CacheHit);
        assert!(second.routing.is_none());
    }

    #[tokio::test]
    async fn test_realtime_query_skips_cache() {
        let sonar = Arc::new(ScriptedProvider::new("perplexity"));
        sonar.push_reply(decent_reply());
        sonar.push_reply(decent_reply());
        let g = gateway_with(vec![
            sonar.clone(),
            Arc::new(ScriptedProvider::new("openai")),
            Arc::new(ScriptedProvider::new("anthropic")),
        ]);

        let first = g
            .process_query("What is the current Bitcoin price?", QueryOptions::default())
            .await
            .expect("served");
        assert!(!first.cache_hit);
        let second = g
            .process_query("What is the current Bitcoin price?", QueryOptions::default())
            .await
            .expect("served again");
        assert!(!second.cache_hit, "realtime queries must not be cached");
        assert_eq!(sonar.call_count(), 2);
    }

    #[tokio::test]
    async fn test_budget_reject_before_any_provider_call() {
        let sonar = Arc::new(ScriptedProvider::new("perplexity"));
        let g = gateway_with(vec![
            sonar.clone(),
            Arc::new(ScriptedProvider::new("openai")),
            Arc::new(ScriptedProvider::new("anthropic")),
        ]);
        // Exhaust the $5 default daily budget.
        g.budget().record_cost(ActualCost {
            provider: "openai".into(),
            model: "gpt-4o".into(),
            input_tokens: 0,
            output_tokens: 0,
            total_cost: 5.01,
            timestamp: chrono::Utc::now(),
        });

        let err = g
            .process_query("Explain quantum computing", QueryOptions::default())
            .await
            .expect_err("budget rejects");
        match err {
            GatewayError::BudgetExceeded { spent, limit } => {
                assert!(spent >= limit);
            }
            other => panic!("expected BudgetExceeded, got {other:?}"),
        }
        assert_eq!(sonar.call_count(), 0, "no provider call after rejection");
        let rejects = g.artifacts().get_by_kind(ArtifactKind::BudgetReject, 10);
        assert_eq!(rejects.len(), 1);
    }

    #[tokio::test]
    async fn test_all_steps_failed_surfaces_and_records() {
        let sonar = Arc::new(ScriptedProvider::new("perplexity"));
        let openai = Arc::new(ScriptedProvider::new("openai"));
        let anthropic = Arc::new(ScriptedProvider::new("anthropic"));
        // No scripted replies: every rung fails with "script exhausted",
        // which is a non-retryable-looking but still provider-kind error.
        let g = gateway_with(vec![sonar, openai, anthropic]);

        let err = g
            .process_query("What is the capital of France?", QueryOptions::default())
            .await
            .expect_err("cascade fails");
        assert!(matches!(err, GatewayError::AllCascadeStepsFailed(_)));
        let failures = g.artifacts().get_by_kind(ArtifactKind::CascadeFailure, 10);
        assert_eq!(failures.len(), 1);
    }

    #[tokio::test]
    async fn test_direct_strategy_bypasses_cascade() {
        let openai = Arc::new(ScriptedProvider::new("openai"));
        openai.push_reply(decent_reply());
        let g = gateway_with(vec![
            Arc::new(ScriptedProvider::new("perplexity")),
            openai.clone(),
            Arc::new(ScriptedProvider::new("anthropic")),
        ]);
        let resp = g
            .process_query(
                "Explain quantum computing",
                QueryOptions { strategy: Some(Strategy::CostOptimized), ..Default::default() },
            )
            .await
            .expect("served");
        assert_eq!(resp.provider, "openai");
        let routing = resp.routing.expect("routing decision present");
        assert_eq!(routing.strategy, Strategy::CostOptimized);
        assert!(routing.cascade_chain.is_none());
    }

    #[tokio::test]
    async fn test_budget_spend_recorded_after_success() {
        let openai = Arc::new(ScriptedProvider::new("openai"));
        openai.push_reply(decent_reply());
        let g = gateway_with(vec![
            Arc::new(ScriptedProvider::new("perplexity")),
            openai,
            Arc::new(ScriptedProvider::new("anthropic")),
        ]);
        let resp = g
            .process_query(
                "Explain quantum computing",
                QueryOptions { strategy: Some(Strategy::CostOptimized), ..Default::default() },
            )
            .await
            .expect("served");
        let daily = g.budget().status(BudgetPeriod::Daily);
        assert!((daily.spent - resp.cost).abs() < 1e-9, "spent {} vs cost {}", daily.spent, resp.cost);
    }

    #[tokio::test]
    async fn test_provider_health_tracks_outcomes() {
        let openai = Arc::new(ScriptedProvider::new("openai"));
        openai.push_reply(decent_reply());
        let g = gateway_with(vec![
            Arc::new(ScriptedProvider::new("perplexity")),
            openai,
            Arc::new(ScriptedProvider::new("anthropic")),
        ]);
        g.process_query(
            "Explain quantum computing",
            QueryOptions { strategy: Some(Strategy::CostOptimized), ..Default::default() },
        )
        .await
        .expect("served");
        let health = g.provider_health();
        assert!(health["openai"].healthy);
        assert!(health["openai"].latency_ms.is_some());
    }
}
