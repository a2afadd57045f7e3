//! Routing strategy selection.
//!
//! Combines the classified query, the cost book, and budget state into a
//! [`RoutingDecision`]. Strategy resolution: a latched emergency mode wins,
//! then a caller override, then the configured default (cascade). The
//! post-check re-routes any decision that lands on a provider disabled by
//! emergency mode.

use crate::budget::BudgetTracker;
use crate::classify::{ClassifiedQuery, Complexity, Intent};
use crate::costbook::{estimate_output_tokens, Capability, CostBook, ModelCostProfile};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Routing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Capability-first branching table.
    Priority,
    /// Cheapest suitable model, capability-filtered for search.
    CostOptimized,
    /// Quality-gated escalation ladder.
    Cascade,
    /// Cheapest model that fits the remaining daily budget.
    Emergency,
}

impl Strategy {
    /// Canonical kebab-case label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Priority => "priority",
            Self::CostOptimized => "cost-optimized",
            Self::Cascade => "cascade",
            Self::Emergency => "emergency",
        }
    }
}

/// One rung of a cascade ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeStep {
    /// Provider to call.
    pub provider: String,
    /// Model to call.
    pub model: String,
    /// Quality score this step must reach to be accepted, `[0, 10]`.
    pub quality_threshold: f64,
    /// Estimated cost ceiling for this step, USD.
    pub max_cost: f64,
}

/// The routing decision for one request. Immutable.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    /// Selected provider (first rung for cascades).
    pub provider: String,
    /// Selected model.
    pub model: String,
    /// Strategy that produced this decision.
    pub strategy: Strategy,
    /// Why this selection came out.
    pub reason: String,
    /// Estimated cost of the selected call, USD.
    pub estimated_cost: f64,
    /// Ordered, non-empty chain when the strategy built one.
    pub cascade_chain: Option<Vec<CascadeStep>>,
    /// Whether emergency mode shaped this decision.
    pub emergency_mode: bool,
}

/// Router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Strategy when the caller does not override.
    pub default_strategy: Strategy,
    /// Floor applied to every cascade step threshold.
    pub cascade_min_quality: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self { default_strategy: Strategy::Cascade, cascade_min_quality: 0.0 }
    }
}

/// The router. Pure given its inputs; budget state is read, never written.
pub struct Router {
    cost_book: Arc<CostBook>,
    budget: Arc<BudgetTracker>,
    config: RouterConfig,
}

impl Router {
    /// New router over the shared cost book and budget tracker.
    pub fn new(cost_book: Arc<CostBook>, budget: Arc<BudgetTracker>, config: RouterConfig) -> Self {
        Self { cost_book, budget, config }
    }

    /// Produce a routing decision.
    pub fn decide(
        &self,
        query: &ClassifiedQuery,
        override_strategy: Option<Strategy>,
    ) -> RoutingDecision {
        let emergency_latched = self.budget.is_emergency_mode();
        let strategy = if emergency_latched {
            Strategy::Emergency
        } else {
            override_strategy.unwrap_or(self.config.default_strategy)
        };

        let mut decision = match strategy {
            Strategy::Priority => self.decide_priority(query),
            Strategy::CostOptimized => self.decide_cost_optimized(query),
            Strategy::Cascade => self.decide_cascade(query),
            Strategy::Emergency => self.decide_emergency(query),
        };
        decision.emergency_mode = decision.emergency_mode || emergency_latched;

        // Post-check: never hand back a provider the emergency latch has
        // disabled, whatever strategy picked it.
        if self.budget.is_provider_disabled(&decision.provider) {
            let mut rerouted = self.decide_emergency(query);
            rerouted.reason = format!(
                "{} selected disabled provider {}; rerouted: {}",
                strategy.as_str(),
                decision.provider,
                rerouted.reason
            );
            rerouted.emergency_mode = true;
            decision = rerouted;
        }

        debug!(
            strategy = decision.strategy.as_str(),
            provider = decision.provider.as_str(),
            model = decision.model.as_str(),
            estimated_cost = decision.estimated_cost,
            "routing decision"
        );
        decision
    }

    // ── Strategies ─────────────────────────────────────────────────────

    fn decide_priority(&self, query: &ClassifiedQuery) -> RoutingDecision {
        let wants_search = query.is_realtime || query.intent == Intent::Search;
        let picked: Option<(ModelCostProfile, String)> = if wants_search {
            self.capable_pick(Capability::WebSearch, query.complexity)
                .map(|p| (p, "priority: search-capable for realtime/search".to_string()))
        } else if query.intent == Intent::Reasoning {
            self.capable_pick(Capability::Reasoning, query.complexity)
                .map(|p| (p, "priority: reasoning-capable".to_string()))
        } else if query.intent == Intent::Code {
            self.best_capable(Capability::Code, query.complexity)
                .map(|p| (p, "priority: best code model".to_string()))
        } else if query.complexity == Complexity::Complex {
            self.cost_book
                .highest_tier(Complexity::Complex)
                .cloned()
                .map(|p| (p, "priority: highest tier for complex query".to_string()))
        } else {
            None
        };

        let (profile, reason) = match picked.or_else(|| {
            self.cheapest_suitable(query)
                .map(|p| (p, "priority: cheapest suitable".to_string()))
        }) {
            Some(pair) => pair,
            None => return self.decide_emergency(query),
        };
        self.direct_decision(profile, Strategy::Priority, reason, query)
    }

    fn decide_cost_optimized(&self, query: &ClassifiedQuery) -> RoutingDecision {
        let (input, output) = self.token_estimates(query);
        let ranked = self.cost_book.models_by_cost(query.complexity, input, output);
        let wants_search = query.is_realtime || query.intent == Intent::Search;

        let pick = if wants_search {
            ranked
                .iter()
                .find(|(p, _)| p.has_capability(Capability::WebSearch))
                .or_else(|| ranked.first())
        } else {
            ranked.first()
        };

        match pick {
            Some((profile, estimate)) => RoutingDecision {
                provider: profile.provider.clone(),
                model: profile.model.clone(),
                strategy: Strategy::CostOptimized,
                reason: if wants_search {
                    "cost-optimized: cheapest search-capable".to_string()
                } else {
                    "cost-optimized: cheapest suitable".to_string()
                },
                estimated_cost: estimate.estimated_cost,
                cascade_chain: None,
                emergency_mode: false,
            },
            None => self.decide_emergency(query),
        }
    }

    fn decide_cascade(&self, query: &ClassifiedQuery) -> RoutingDecision {
        let (input, output) = self.token_estimates(query);
        let ladder: &[(&str, &str, f64)] = match query.complexity {
            Complexity::Simple => &[
                ("perplexity", "sonar", 6.0),
                ("openai", "gpt-4o-mini", 7.0),
                ("anthropic", "claude-3-5-haiku", 7.5),
            ],
            Complexity::Medium => &[
                ("perplexity", "sonar", 7.0),
                ("openai", "gpt-4o-mini", 8.5),
                ("openai", "gpt-4o", 9.0),
            ],
            Complexity::Complex => &[
                ("perplexity", "sonar-pro", 7.5),
                ("anthropic", "claude-sonnet-4", 8.5),
                ("anthropic", "claude-opus-4", 9.0),
            ],
        };

        let mut chain: Vec<CascadeStep> = ladder
            .iter()
            .map(|(provider, model, threshold)| CascadeStep {
                provider: (*provider).to_string(),
                model: (*model).to_string(),
                quality_threshold: threshold.max(self.config.cascade_min_quality),
                max_cost: self
                    .cost_book
                    .estimate(provider, model, input, output)
                    .estimated_cost,
            })
            .collect();

        // Realtime queries must open on a search-capable rung.
        if query.is_realtime {
            let first_is_search = self
                .cost_book
                .get(&chain[0].provider, &chain[0].model)
                .is_some_and(|p| p.has_capability(Capability::WebSearch));
            if !first_is_search {
                if let Some(search) = self.capable_pick(Capability::WebSearch, query.complexity) {
                    let threshold = chain[0].quality_threshold;
                    chain[0] = CascadeStep {
                        max_cost: self
                            .cost_book
                            .estimate(&search.provider, &search.model, input, output)
                            .estimated_cost,
                        provider: search.provider,
                        model: search.model,
                        quality_threshold: threshold,
                    };
                }
            }
        }

        let head = &chain[0];
        RoutingDecision {
            provider: head.provider.clone(),
            model: head.model.clone(),
            strategy: Strategy::Cascade,
            reason: format!(
                "cascade ladder for {} complexity, {} rungs",
                query.complexity.as_str(),
                chain.len()
            ),
            estimated_cost: head.max_cost,
            cascade_chain: Some(chain),
            emergency_mode: false,
        }
    }

    fn decide_emergency(&self, query: &ClassifiedQuery) -> RoutingDecision {
        let (input, output) = self.token_estimates(query);
        let remaining = self.budget.status(crate::budget::BudgetPeriod::Daily).remaining;

        let within = self
            .cost_book
            .models_by_cost(query.complexity, input, output)
            .into_iter()
            .filter(|(p, _)| !self.budget.is_provider_disabled(&p.provider))
            .find(|(_, est)| est.estimated_cost <= remaining)
            .map(|(p, _)| p);

        let (profile, reason) = match within {
            Some(p) => {
                (p, format!("emergency: cheapest within ${remaining:.4} daily remaining"))
            }
            None => {
                // Nothing fits; fall back to the cheapest model on the books
                // that is not itself disabled.
                let fallback = self
                    .cost_book
                    .profiles()
                    .iter()
                    .filter(|p| !self.budget.is_provider_disabled(&p.provider))
                    .min_by_key(|p| {
                        p.input_micro_per_1k + p.output_micro_per_1k + p.per_request_micro
                    })
                    .cloned()
                    .or_else(|| self.cost_book.cheapest_overall());
                match fallback {
                    Some(p) => (p, "emergency: nothing fits budget, hardcoded cheapest".to_string()),
                    None => {
                        // Empty registry; synthesise a zero-cost placeholder
                        // so the caller still gets a deterministic decision.
                        return RoutingDecision {
                            provider: "none".to_string(),
                            model: "none".to_string(),
                            strategy: Strategy::Emergency,
                            reason: "emergency: empty cost book".to_string(),
                            estimated_cost: 0.0,
                            cascade_chain: None,
                            emergency_mode: true,
                        };
                    }
                }
            }
        };

        let estimate = self.cost_book.estimate(&profile.provider, &profile.model, input, output);
        RoutingDecision {
            provider: profile.provider,
            model: profile.model,
            strategy: Strategy::Emergency,
            reason,
            estimated_cost: estimate.estimated_cost,
            cascade_chain: None,
            emergency_mode: true,
        }
    }

    // ── Selection helpers ──────────────────────────────────────────────

    fn token_estimates(&self, query: &ClassifiedQuery) -> (u64, u64) {
        let input = query.estimated_tokens;
        (input, estimate_output_tokens(query.complexity, input))
    }

    /// Capable model, preferring one suitable for the band.
    fn capable_pick(&self, cap: Capability, complexity: Complexity) -> Option<ModelCostProfile> {
        let capable = self.cost_book.by_capability(cap);
        capable
            .iter()
            .find(|p| p.suitable_for.contains(&complexity))
            .or_else(|| capable.first())
            .map(|p| (*p).clone())
    }

    /// Highest-tier capable model, preferring suitability.
    fn best_capable(&self, cap: Capability, complexity: Complexity) -> Option<ModelCostProfile> {
        let capable = self.cost_book.by_capability(cap);
        capable
            .iter()
            .filter(|p| p.suitable_for.contains(&complexity))
            .max_by_key(|p| p.tier)
            .or_else(|| capable.iter().max_by_key(|p| p.tier))
            .map(|p| (*p).clone())
    }

    fn cheapest_suitable(&self, query: &ClassifiedQuery) -> Option<ModelCostProfile> {
        let (input, output) = self.token_estimates(query);
        self.cost_book
            .models_by_cost(query.complexity, input, output)
            .into_iter()
            .next()
            .map(|(p, _)| p)
    }

    fn direct_decision(
        &self,
        profile: ModelCostProfile,
        strategy: Strategy,
        reason: String,
        query: &ClassifiedQuery,
    ) -> RoutingDecision {
        let (input, output) = self.token_estimates(query);
        let estimate = self.cost_book.estimate(&profile.provider, &profile.model, input, output);
        RoutingDecision {
            provider: profile.provider,
            model: profile.model,
            strategy,
            reason,
            estimated_cost: estimate.estimated_cost,
            cascade_chain: None,
            emergency_mode: false,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{BudgetConfig, BudgetPeriod};
    use crate::classify::Classifier;
    use crate::costbook::ActualCost;

    fn router() -> Router {
        router_with_budget(BudgetTracker::new(BudgetConfig::default()))
    }

    fn router_with_budget(budget: BudgetTracker) -> Router {
        Router::new(Arc::new(CostBook::new()), Arc::new(budget), RouterConfig::default())
    }

    fn query(text: &str) -> ClassifiedQuery {
        Classifier::new().classify(text)
    }

    fn spend(tracker: &BudgetTracker, usd: f64) {
        tracker.record_cost(ActualCost {
            provider: "openai".into(),
            model: "gpt-4o".into(),
            input_tokens: 100,
            output_tokens: 100,
            total_cost: usd,
            timestamp: chrono::Utc::now(),
        });
    }

    // -- strategy resolution ----------------------------------------------

    #[test]
    fn test_default_strategy_is_cascade() {
        let d = router().decide(&query("Explain quantum computing"), None);
        assert_eq!(d.strategy, Strategy::Cascade);
        assert!(d.cascade_chain.is_some());
    }

    #[test]
    fn test_override_wins_when_not_latched() {
        let d = router().decide(&query("Explain quantum computing"), Some(Strategy::Priority));
        assert_eq!(d.strategy, Strategy::Priority);
    }

    #[test]
    fn test_latch_overrides_override() {
        let budget = BudgetTracker::new(BudgetConfig::default());
        budget.set_emergency_mode(true);
        let r = router_with_budget(budget);
        let d = r.decide(&query("Explain quantum computing"), Some(Strategy::Priority));
        assert_eq!(d.strategy, Strategy::Emergency);
        assert!(d.emergency_mode);
    }

    // -- cascade ----------------------------------------------------------

    #[test]
    fn test_medium_ladder_shape() {
        let q = query("Explain how does a distributed consensus algorithm reach agreement in detail across many nodes of a cluster");
        assert_eq!(q.complexity, Complexity::Medium, "score {}", q.complexity_score);
        let d = router().decide(&q, None);
        let chain = d.cascade_chain.expect("chain");
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0].model, "sonar");
        assert!((chain[0].quality_threshold - 7.0).abs() < 1e-9);
        assert_eq!(chain[1].model, "gpt-4o-mini");
        assert!((chain[1].quality_threshold - 8.5).abs() < 1e-9);
        assert_eq!(chain[2].model, "gpt-4o");
        assert!((chain[2].quality_threshold - 9.0).abs() < 1e-9);
    }

    #[test]
    fn test_realtime_chain_opens_search_capable() {
        let q = query("What is the current Bitcoin price?");
        assert!(q.is_realtime);
        let d = router().decide(&q, None);
        let chain = d.cascade_chain.expect("chain");
        let book = CostBook::new();
        let head = book.get(&chain[0].provider, &chain[0].model).expect("head registered");
        assert!(head.has_capability(Capability::WebSearch), "head {:?}", head.key());
    }

    #[test]
    fn test_chain_thresholds_ascend() {
        let d = router().decide(&query("Explain quantum computing"), None);
        let chain = d.cascade_chain.expect("chain");
        for pair in chain.windows(2) {
            assert!(pair[0].quality_threshold <= pair[1].quality_threshold);
        }
    }

    #[test]
    fn test_cascade_min_quality_floors_thresholds() {
        let r = Router::new(
            Arc::new(CostBook::new()),
            Arc::new(BudgetTracker::new(BudgetConfig::default())),
            RouterConfig { cascade_min_quality: 8.0, ..RouterConfig::default() },
        );
        let d = r.decide(&query("hello there"), None);
        for step in d.cascade_chain.expect("chain") {
            assert!(step.quality_threshold >= 8.0);
        }
    }

    #[test]
    fn test_decision_head_matches_chain_head() {
        let d = router().decide(&query("Explain quantum computing"), None);
        let chain = d.cascade_chain.as_ref().expect("chain");
        assert_eq!(d.provider, chain[0].provider);
        assert_eq!(d.model, chain[0].model);
        assert!((d.estimated_cost - chain[0].max_cost).abs() < 1e-12);
    }

    // -- priority ---------------------------------------------------------

    #[test]
    fn test_priority_search_for_realtime() {
        let d = router().decide(&query("What is the current Bitcoin price?"), Some(Strategy::Priority));
        assert_eq!(d.provider, "perplexity");
    }

    #[test]
    fn test_priority_reasoning_picks_reasoning_capable() {
        let q = query("Prove that the halting problem is undecidable");
        assert_eq!(q.intent, Intent::Reasoning);
        let d = router().decide(&q, Some(Strategy::Priority));
        let book = CostBook::new();
        let p = book.get(&d.provider, &d.model).expect("registered");
        assert!(p.has_capability(Capability::Reasoning), "picked {}", p.key());
    }

    #[test]
    fn test_priority_chat_falls_back_to_cheapest() {
        let d = router().decide(&query("hello there friend"), Some(Strategy::Priority));
        assert_eq!(d.model, "gpt-4o-mini");
    }

    // -- cost-optimized ---------------------------------------------------

    #[test]
    fn test_cost_optimized_picks_cheapest() {
        let d = router().decide(&query("Explain quantum computing"), Some(Strategy::CostOptimized));
        assert_eq!(d.model, "gpt-4o-mini");
        assert!(d.cascade_chain.is_none());
    }

    #[test]
    fn test_cost_optimized_search_filter() {
        let d = router().decide(
            &query("What is the current Bitcoin price?"),
            Some(Strategy::CostOptimized),
        );
        assert_eq!(d.provider, "perplexity");
    }

    // -- emergency --------------------------------------------------------

    #[test]
    fn test_emergency_picks_cheapest_within_remaining() {
        let budget = BudgetTracker::new(BudgetConfig::default());
        budget.set_emergency_mode(true);
        let r = router_with_budget(budget);
        let d = r.decide(&query("hello there"), None);
        assert_eq!(d.strategy, Strategy::Emergency);
        assert!(d.emergency_mode);
        // anthropic is on the default disable list.
        assert_ne!(d.provider, "anthropic");
    }

    #[test]
    fn test_emergency_avoids_disabled_provider_for_complex() {
        let budget = BudgetTracker::new(BudgetConfig::default());
        budget.set_emergency_mode(true);
        let r = router_with_budget(budget);
        let q = query(
            "Analyze the architecture, compare and contrast the trade-off of each \
             approach, and design a comprehensive step by step migration plan",
        );
        assert_eq!(q.complexity, Complexity::Complex);
        let d = r.decide(&q, None);
        assert_ne!(d.provider, "anthropic");
        assert!(d.emergency_mode);
    }

    #[test]
    fn test_emergency_fallback_when_budget_spent() {
        let budget = BudgetTracker::new(BudgetConfig {
            daily_limit: 5.0,
            ..BudgetConfig::default()
        });
        spend(&budget, 5.0);
        assert!(budget.status(BudgetPeriod::Daily).remaining.abs() < 1e-9);
        budget.set_emergency_mode(true);
        let r = router_with_budget(budget);
        let d = r.decide(&query("hello there"), None);
        // Nothing fits a zero budget; hardcoded cheapest non-disabled model.
        assert_eq!(d.model, "gpt-4o-mini");
    }
}
