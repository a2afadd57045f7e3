//! Model cost profiles and pure cost estimation.
//!
//! The cost book is the single authoritative source for per-model pricing;
//! provider adapters derive their estimates from it rather than carrying
//! their own tables. Costs are stored as micro-dollars (1 USD = 1 000 000
//! micro-dollars) to avoid floating-point drift in long-running
//! aggregations; USD `f64` values appear only at the API surface.

use crate::classify::Complexity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Capability a model can advertise; routing filters on these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Can ground answers in live web results and return citations.
    WebSearch,
    /// Tuned for multi-step reasoning.
    Reasoning,
    /// Strong at writing and fixing code.
    Code,
}

/// Process-lifetime pricing and suitability record for one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCostProfile {
    /// Provider name, e.g. `"perplexity"`.
    pub provider: String,
    /// Model identifier, e.g. `"sonar"`.
    pub model: String,
    /// Input cost per 1 000 tokens, micro-dollars.
    pub input_micro_per_1k: u64,
    /// Output cost per 1 000 tokens, micro-dollars.
    pub output_micro_per_1k: u64,
    /// Flat per-request fee, micro-dollars.
    pub per_request_micro: u64,
    /// Context window in tokens.
    pub context_window: u32,
    /// Maximum output tokens the model will produce.
    pub max_output_tokens: u32,
    /// Complexity bands this model is suitable for.
    pub suitable_for: BTreeSet<Complexity>,
    /// Advertised capabilities.
    pub capabilities: BTreeSet<Capability>,
    /// Quality tier, 1 (cheapest) to 3 (frontier).
    pub tier: u8,
}

impl ModelCostProfile {
    /// Input cost per 1 000 tokens in USD.
    pub fn input_cost_per_1k(&self) -> f64 {
        micro_to_usd(self.input_micro_per_1k)
    }

    /// Output cost per 1 000 tokens in USD.
    pub fn output_cost_per_1k(&self) -> f64 {
        micro_to_usd(self.output_micro_per_1k)
    }

    /// Per-request fee in USD.
    pub fn per_request_cost(&self) -> f64 {
        micro_to_usd(self.per_request_micro)
    }

    /// True if the profile advertises the capability.
    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    /// `"provider/model"` display key.
    pub fn key(&self) -> String {
        format!("{}/{}", self.provider, self.model)
    }
}

/// Cost component breakdown, USD.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    /// Input-token component.
    pub input_cost: f64,
    /// Output-token component.
    pub output_cost: f64,
    /// Flat per-request component.
    pub per_request_cost: f64,
}

/// Pure cost estimate for a prospective call. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    /// Provider name.
    pub provider: String,
    /// Model identifier.
    pub model: String,
    /// Input tokens the estimate assumed.
    pub estimated_input_tokens: u64,
    /// Output tokens the estimate assumed.
    pub estimated_output_tokens: u64,
    /// Total estimated cost in USD; always equals the breakdown sum.
    pub estimated_cost: f64,
    /// Per-component costs.
    pub breakdown: CostBreakdown,
}

/// Actual cost of a completed provider call. Immutable; appended to the
/// budget log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActualCost {
    /// Provider name.
    pub provider: String,
    /// Model identifier.
    pub model: String,
    /// Billed input tokens.
    pub input_tokens: u64,
    /// Billed output tokens.
    pub output_tokens: u64,
    /// Total cost in USD.
    pub total_cost: f64,
    /// When the call completed.
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Static registry of model cost profiles plus pure estimation functions.
#[derive(Debug, Clone)]
pub struct CostBook {
    profiles: Vec<ModelCostProfile>,
}

impl Default for CostBook {
    fn default() -> Self {
        Self::new()
    }
}

impl CostBook {
    /// Registry with the built-in provider pricing tables.
    pub fn new() -> Self {
        Self { profiles: default_profiles() }
    }

    /// Registry over caller-supplied profiles (test seam).
    pub fn with_profiles(profiles: Vec<ModelCostProfile>) -> Self {
        Self { profiles }
    }

    /// All registered profiles.
    pub fn profiles(&self) -> &[ModelCostProfile] {
        &self.profiles
    }

    /// Look up one profile.
    pub fn get(&self, provider: &str, model: &str) -> Option<&ModelCostProfile> {
        self.profiles
            .iter()
            .find(|p| p.provider == provider && p.model == model)
    }

    /// Estimate the cost of a call.
    ///
    /// An unknown model yields an explicit zero-cost estimate rather than
    /// an error; the caller can still route, and accounting records zero.
    pub fn estimate(
        &self,
        provider: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> CostEstimate {
        match self.get(provider, model) {
            Some(p) => {
                let input_micro = tokens_cost_micro(input_tokens, p.input_micro_per_1k);
                let output_micro = tokens_cost_micro(output_tokens, p.output_micro_per_1k);
                let total_micro = input_micro + output_micro + p.per_request_micro as u128;
                CostEstimate {
                    provider: provider.to_string(),
                    model: model.to_string(),
                    estimated_input_tokens: input_tokens,
                    estimated_output_tokens: output_tokens,
                    estimated_cost: micro128_to_usd(total_micro),
                    breakdown: CostBreakdown {
                        input_cost: micro128_to_usd(input_micro),
                        output_cost: micro128_to_usd(output_micro),
                        per_request_cost: micro_to_usd(p.per_request_micro),
                    },
                }
            }
            None => CostEstimate {
                provider: provider.to_string(),
                model: model.to_string(),
                estimated_input_tokens: input_tokens,
                estimated_output_tokens: output_tokens,
                estimated_cost: 0.0,
                breakdown: CostBreakdown {
                    input_cost: 0.0,
                    output_cost: 0.0,
                    per_request_cost: 0.0,
                },
            },
        }
    }

    /// Build an [`ActualCost`] from billed usage, stamped now.
    pub fn actual(
        &self,
        provider: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> ActualCost {
        let estimate = self.estimate(provider, model, input_tokens, output_tokens);
        ActualCost {
            provider: provider.to_string(),
            model: model.to_string(),
            input_tokens,
            output_tokens,
            total_cost: estimate.estimated_cost,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Suitable models ranked ascending by estimated cost.
    pub fn models_by_cost(
        &self,
        complexity: Complexity,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Vec<(ModelCostProfile, CostEstimate)> {
        let mut ranked: Vec<(ModelCostProfile, CostEstimate)> = self
            .profiles
            .iter()
            .filter(|p| p.suitable_for.contains(&complexity))
            .map(|p| {
                let est = self.estimate(&p.provider, &p.model, input_tokens, output_tokens);
                (p.clone(), est)
            })
            .collect();
        ranked.sort_by(|a, b| {
            a.1.estimated_cost
                .partial_cmp(&b.1.estimated_cost)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked
    }

    /// First entry of the cost ranking whose estimate fits in `remaining`
    /// USD, or `None` when nothing fits.
    pub fn cheapest_within_budget(
        &self,
        complexity: Complexity,
        input_tokens: u64,
        output_tokens: u64,
        remaining: f64,
    ) -> Option<ModelCostProfile> {
        self.models_by_cost(complexity, input_tokens, output_tokens)
            .into_iter()
            .find(|(_, est)| est.estimated_cost <= remaining)
            .map(|(p, _)| p)
    }

    /// The hardcoded cheapest registered model, used as the emergency
    /// fallback when nothing fits the remaining budget.
    pub fn cheapest_overall(&self) -> Option<ModelCostProfile> {
        let mut ranked: Vec<&ModelCostProfile> = self.profiles.iter().collect();
        ranked.sort_by_key(|p| p.input_micro_per_1k + p.output_micro_per_1k + p.per_request_micro);
        ranked.first().map(|p| (*p).clone())
    }

    /// Profiles advertising `cap`, in registry order.
    pub fn by_capability(&self, cap: Capability) -> Vec<&ModelCostProfile> {
        self.profiles.iter().filter(|p| p.has_capability(cap)).collect()
    }

    /// Highest-tier profile suitable for `complexity`.
    pub fn highest_tier(&self, complexity: Complexity) -> Option<&ModelCostProfile> {
        self.profiles
            .iter()
            .filter(|p| p.suitable_for.contains(&complexity))
            .max_by_key(|p| p.tier)
    }
}

/// Expected output length per complexity band given the input length.
pub fn estimate_output_tokens(complexity: Complexity, input_tokens: u64) -> u64 {
    match complexity {
        Complexity::Simple => (2 * input_tokens).clamp(50, 200),
        Complexity::Medium => (3 * input_tokens).clamp(200, 800),
        Complexity::Complex => (4 * input_tokens).clamp(500, 4000),
    }
}

// ── Helpers ────────────────────────────────────────────────────────────

fn tokens_cost_micro(tokens: u64, rate_micro_per_1k: u64) -> u128 {
    (tokens as u128 * rate_micro_per_1k as u128) / 1000
}

/// Convert micro-dollars to USD.
pub(crate) fn micro_to_usd(micro: u64) -> f64 {
    micro as f64 / 1_000_000.0
}

fn micro128_to_usd(micro: u128) -> f64 {
    micro as f64 / 1_000_000.0
}

/// Round a USD amount to the nearest micro-dollar.
pub(crate) fn round_micro_usd(usd: f64) -> f64 {
    (usd * 1_000_000.0).round() / 1_000_000.0
}

fn profile(
    provider: &str,
    model: &str,
    input_micro_per_1k: u64,
    output_micro_per_1k: u64,
    per_request_micro: u64,
    context_window: u32,
    max_output_tokens: u32,
    suitable_for: &[Complexity],
    capabilities: &[Capability],
    tier: u8,
) -> ModelCostProfile {
    ModelCostProfile {
        provider: provider.to_string(),
        model: model.to_string(),
        input_micro_per_1k,
        output_micro_per_1k,
        per_request_micro,
        context_window,
        max_output_tokens,
        suitable_for: suitable_for.iter().copied().collect(),
        capabilities: capabilities.iter().copied().collect(),
        tier,
    }
}

/// Built-in pricing tables. The per-request fee on Perplexity models is
/// $0.005; this table is authoritative over any adapter-level constant.
fn default_profiles() -> Vec<ModelCostProfile> {
    use Capability::*;
    use Complexity::*;
    vec![
        profile("perplexity", "sonar", 1_000, 1_000, 5_000, 127_000, 4_000, &[Simple, Medium], &[WebSearch], 1),
        profile("perplexity", "sonar-pro", 3_000, 15_000, 5_000, 200_000, 8_000, &[Medium, Complex], &[WebSearch], 2),
        profile("openai", "gpt-4o-mini", 150, 600, 0, 128_000, 16_384, &[Simple, Medium], &[Code], 1),
        profile("openai", "gpt-4o", 2_500, 10_000, 0, 128_000, 16_384, &[Medium, Complex], &[Code], 2),
        profile("anthropic", "claude-3-5-haiku", 800, 4_000, 0, 200_000, 8_192, &[Simple, Medium], &[Code], 1),
        profile("anthropic", "claude-sonnet-4", 3_000, 15_000, 0, 200_000, 64_000, &[Medium, Complex], &[Reasoning, Code], 2),
        profile("anthropic", "claude-opus-4", 15_000, 75_000, 0, 200_000, 32_000, &[Complex], &[Reasoning, Code], 3),
    ]
}

// ── Tests ──────────────────────────────────────────────────────────────
