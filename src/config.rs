//! Gateway configuration.
//!
//! ## Responsibility
//! Parse and validate the TOML configuration file and hand each subsystem
//! its own typed view. Every field has either a required value or a
//! documented default, and all semantic constraints are checked before a
//! config is accepted.
//!
//! ## NOT Responsible For
//! - Building subsystems from config (that belongs to the orchestrator)
//! - Provider HTTP wiring (that belongs to `provider`)

use crate::budget::{AlertAction, AlertThreshold, BudgetConfig};
use crate::cache::SemanticCacheConfig;
use crate::classify::ComplexityThresholds;
use crate::router::{RouterConfig, Strategy};
use crate::GatewayError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ── Default value functions ────────────────────────────────────────────

/// Default routing strategy: cascade.
fn default_strategy() -> Strategy {
    Strategy::Cascade
}

/// Default cascade acceptance floor: none.
fn default_cascade_min_quality() -> f64 {
    0.0
}

/// Default simple/medium boundary.
fn default_medium_threshold() -> f64 {
    0.30
}

/// Default medium/complex boundary.
fn default_complex_threshold() -> f64 {
    0.70
}

/// Default daily budget: $5.
fn default_daily_limit() -> f64 {
    5.0
}

/// Default weekly budget: $25.
fn default_weekly_limit() -> f64 {
    25.0
}

/// Default monthly budget: $100.
fn default_monthly_limit() -> f64 {
    100.0
}

/// Default emergency latch threshold: 95% of daily budget.
fn default_emergency_threshold() -> f64 {
    95.0
}

/// Providers disabled under emergency mode by default.
fn default_disable_providers() -> Vec<String> {
    vec!["anthropic".to_string()]
}

/// Default cache similarity threshold.
fn default_similarity_threshold() -> f64 {
    0.82
}

/// Default cache capacity.
fn default_max_entries() -> usize {
    1000
}

/// Default cache TTL: one hour.
fn default_ttl_ms() -> u64 {
    60 * 60 * 1000
}

/// Default realtime cache TTL: five minutes.
fn default_realtime_ttl_ms() -> u64 {
    5 * 60 * 1000
}

/// Default HTTP port.
fn default_port() -> u16 {
    8080
}

/// Default bind host.
fn default_host() -> String {
    "0.0.0.0".to_string()
}

/// Default CORS origin.
fn default_cors_origin() -> String {
    "*".to_string()
}

// ── Sections ───────────────────────────────────────────────────────────

/// Credentials and model list for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProviderSection {
    /// API key; presence enables the adapter.
    pub api_key: String,
    /// Models this provider serves.
    #[serde(default)]
    pub models: Vec<String>,
    /// Override the API base URL (proxies, mock servers).
    pub base_url: Option<String>,
}

/// Classifier band boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ComplexityThresholdSection {
    /// Scores above this are at least medium.
    #[serde(default = "default_medium_threshold")]
    pub medium: f64,
    /// Scores above this are complex.
    #[serde(default = "default_complex_threshold")]
    pub complex: f64,
}

impl Default for ComplexityThresholdSection {
    fn default() -> Self {
        Self { medium: default_medium_threshold(), complex: default_complex_threshold() }
    }
}

/// Routing options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RoutingSection {
    /// Strategy when the request does not override.
    #[serde(default = "default_strategy")]
    pub default_strategy: Strategy,
    /// Floor applied to every cascade step threshold, `[0, 10]`.
    #[serde(default = "default_cascade_min_quality")]
    pub cascade_min_quality: f64,
    /// Classifier band boundaries.
    #[serde(default)]
    pub complexity_thresholds: ComplexityThresholdSection,
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            default_strategy: default_strategy(),
            cascade_min_quality: default_cascade_min_quality(),
            complexity_thresholds: ComplexityThresholdSection::default(),
        }
    }
}

/// One period's spending ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LimitSection {
    /// Ceiling in USD. Non-positive means unlimited.
    pub limit: f64,
}

/// Budget options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BudgetSection {
    /// Daily ceiling.
    #[serde(default = "default_daily_section")]
    pub daily: LimitSection,
    /// Weekly ceiling.
    #[serde(default = "default_weekly_section")]
    pub weekly: LimitSection,
    /// Monthly ceiling.
    #[serde(default = "default_monthly_section")]
    pub monthly: LimitSection,
    /// Daily percent-used at which emergency mode latches, `[0, 100]`.
    #[serde(default = "default_emergency_threshold")]
    pub emergency_threshold: f64,
    /// Providers refused while emergency mode is latched.
    #[serde(default = "default_disable_providers")]
    pub disable_providers: Vec<String>,
}

fn default_daily_section() -> LimitSection {
    LimitSection { limit: default_daily_limit() }
}

fn default_weekly_section() -> LimitSection {
    LimitSection { limit: default_weekly_limit() }
}

fn default_monthly_section() -> LimitSection {
    LimitSection { limit: default_monthly_limit() }
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            daily: default_daily_section(),
            weekly: default_weekly_section(),
            monthly: default_monthly_section(),
            emergency_threshold: default_emergency_threshold(),
            disable_providers: default_disable_providers(),
        }
    }
}

/// Cache storage adapter choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CacheAdapter {
    /// In-process map.
    Memory,
    /// Redis; requires `redis_url` and the `redis-cache` feature.
    Redis,
}

/// Cache options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CacheSection {
    /// Storage adapter.
    #[serde(default = "default_cache_adapter")]
    pub adapter: CacheAdapter,
    /// Minimum cosine similarity for a semantic hit, `[0, 1]`.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    /// Entry capacity.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Default TTL, milliseconds.
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    /// TTL for realtime-classified queries, milliseconds.
    #[serde(default = "default_realtime_ttl_ms")]
    pub realtime_ttl_ms: u64,
    /// Redis connection URL for the redis adapter.
    pub redis_url: Option<String>,
}

fn default_cache_adapter() -> CacheAdapter {
    CacheAdapter::Memory
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            adapter: default_cache_adapter(),
            similarity_threshold: default_similarity_threshold(),
            max_entries: default_max_entries(),
            ttl_ms: default_ttl_ms(),
            realtime_ttl_ms: default_realtime_ttl_ms(),
            redis_url: None,
        }
    }
}

/// CORS options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CorsSection {
    /// Allowed origin, `"*"` for any.
    #[serde(default = "default_cors_origin")]
    pub origin: String,
}

impl Default for CorsSection {
    fn default() -> Self {
        Self { origin: default_cors_origin() }
    }
}

/// HTTP server options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ServerSection {
    /// TCP port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bind host.
    #[serde(default = "default_host")]
    pub host: String,
    /// CORS options.
    #[serde(default)]
    pub cors: CorsSection,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self { port: default_port(), host: default_host(), cors: CorsSection::default() }
    }
}

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
pub struct GatewayConfig {
    /// Provider credentials keyed by provider name.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSection>,
    /// Routing options.
    #[serde(default)]
    pub routing: RoutingSection,
    /// Budget options.
    #[serde(default)]
    pub budget: BudgetSection,
    /// Cache options.
    #[serde(default)]
    pub cache: CacheSection,
    /// Server options.
    #[serde(default)]
    pub server: ServerSection,
}

impl GatewayConfig {
    /// Parse from TOML text and validate.
    pub fn from_toml_str(text: &str) -> Result<Self, GatewayError> {
        let config: GatewayConfig = toml::from_str(text)
            .map_err(|e| GatewayError::InvalidInput(format!("config parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file path.
    pub fn from_path(path: &std::path::Path) -> Result<Self, GatewayError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::InvalidInput(format!("config read error: {e}")))?;
        Self::from_toml_str(&text)
    }

    /// Check semantic constraints.
    pub fn validate(&self) -> Result<(), GatewayError> {
        let invalid = |msg: String| Err(GatewayError::InvalidInput(msg));

        let r = &self.routing;
        if !(0.0..=10.0).contains(&r.cascade_min_quality) {
            return invalid(format!(
                "routing.cascade_min_quality must be in [0, 10], got {}",
                r.cascade_min_quality
            ));
        }
        let t = &r.complexity_thresholds;
        if !(0.0 < t.medium && t.medium < t.complex && t.complex <= 1.0) {
            return invalid(format!(
                "complexity thresholds must satisfy 0 < medium < complex <= 1, got {} / {}",
                t.medium, t.complex
            ));
        }

        let b = &self.budget;
        if !(0.0..=100.0).contains(&b.emergency_threshold) {
            return invalid(format!(
                "budget.emergency_threshold must be in [0, 100], got {}",
                b.emergency_threshold
            ));
        }

        let c = &self.cache;
        if !(0.0..=1.0).contains(&c.similarity_threshold) {
            return invalid(format!(
                "cache.similarity_threshold must be in [0, 1], got {}",
                c.similarity_threshold
            ));
        }
        if c.max_entries == 0 {
            return invalid("cache.max_entries must be positive".to_string());
        }
        if c.adapter == CacheAdapter::Redis && c.redis_url.is_none() {
            return invalid("cache.adapter = redis requires cache.redis_url".to_string());
        }

        Ok(())
    }

    /// Budget tracker view. Alert ladder: 50% log, 80% notify, then the
    /// configured emergency threshold latches.
    pub fn budget_config(&self) -> BudgetConfig {
        BudgetConfig {
            daily_limit: self.budget.daily.limit,
            weekly_limit: self.budget.weekly.limit,
            monthly_limit: self.budget.monthly.limit,
            alert_thresholds: vec![
                AlertThreshold { percentage: 50.0, action: AlertAction::Log },
                AlertThreshold { percentage: 80.0, action: AlertAction::Notify },
                AlertThreshold {
                    percentage: self.budget.emergency_threshold,
                    action: AlertAction::EmergencyMode,
                },
            ],
            emergency_latch_enabled: true,
            disable_providers: self.budget.disable_providers.clone(),
        }
    }

    /// Router view.
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            default_strategy: self.routing.default_strategy,
            cascade_min_quality: self.routing.cascade_min_quality,
        }
    }

    /// Classifier view.
    pub fn classifier_thresholds(&self) -> ComplexityThresholds {
        ComplexityThresholds {
            simple_max: self.routing.complexity_thresholds.medium,
            medium_max: self.routing.complexity_thresholds.complex,
        }
    }

    /// Semantic cache view.
    pub fn cache_config(&self) -> SemanticCacheConfig {
        SemanticCacheConfig {
            similarity_threshold: self.cache.similarity_threshold,
            max_entries: self.cache.max_entries,
            default_ttl_ms: self.cache.ttl_ms,
        }
    }
}

/// Export the JSON Schema for [`GatewayConfig`], enabling IDE completion
/// when editing TOML config files.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(GatewayConfig);
    serde_json::to_string_pretty(&schema)
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_gives_defaults() {
        let config = GatewayConfig::from_toml_str("").expect("empty config is valid");
        assert_eq!(config.routing.default_strategy, Strategy::Cascade);
        assert!((config.budget.daily.limit - 5.0).abs() < f64::EPSILON);
        assert!((config.cache.similarity_threshold - 0.82).abs() < f64::EPSILON);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.cache.adapter, CacheAdapter::Memory);
    }

    #[test]
    fn test_full_toml_parses() {
        let text = r#"
[providers.openai]
api_key = "sk-test"
models = ["gpt-4o-mini", "gpt-4o"]

[providers.perplexity]
api_key = "pplx-test"
models = ["sonar"]
base_url = "http://localhost:9999"

[routing]
default_strategy = "cost-optimized"
cascade_min_quality = 6.5

[routing.complexity_thresholds]
medium = 0.25
complex = 0.65

[budget.daily]
limit = 10.0

[budget.weekly]
limit = 50.0

[budget.monthly]
limit = 150.0

[budget]
emergency_threshold = 90.0
disable_providers = ["anthropic", "openai"]

[cache]
adapter = "memory"
similarity_threshold = 0.9
max_entries = 500
ttl_ms = 120000
realtime_ttl_ms = 60000

[server]
port = 3000
host = "127.0.0.1"

[server.cors]
origin = "https://dashboard.example.com"
"#;
        let config = GatewayConfig::from_toml_str(text).expect("full config parses");
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers["perplexity"].base_url.as_deref(), Some("http://localhost:9999"));
        assert_eq!(config.routing.default_strategy, Strategy::CostOptimized);
        assert!((config.routing.complexity_thresholds.complex - 0.65).abs() < f64::EPSILON);
        assert!((config.budget.daily.limit - 10.0).abs() < f64::EPSILON);
        assert_eq!(config.budget.disable_providers.len(), 2);
        assert_eq!(config.cache.max_entries, 500);
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.cors.origin, "https://dashboard.example.com");
    }

    #[test]
    fn test_validation_rejects_bad_cascade_quality() {
        let text = "[routing]\ncascade_min_quality = 11.0\n";
        assert!(GatewayConfig::from_toml_str(text).is_err());
    }

    #[test]
    fn test_validation_rejects_inverted_thresholds() {
        let text = "[routing.complexity_thresholds]\nmedium = 0.8\ncomplex = 0.3\n";
        assert!(GatewayConfig::from_toml_str(text).is_err());
    }

    #[test]
    fn test_validation_rejects_bad_similarity() {
        let text = "[cache]\nsimilarity_threshold = 1.5\n";
        assert!(GatewayConfig::from_toml_str(text).is_err());
    }

    #[test]
    fn test_validation_rejects_redis_without_url() {
        let text = "[cache]\nadapter = \"redis\"\n";
        let err = GatewayConfig::from_toml_str(text).expect_err("must require redis_url");
        assert!(err.to_string().contains("redis_url"));
    }

    #[test]
    fn test_validation_rejects_bad_emergency_threshold() {
        let text = "[budget]\nemergency_threshold = 150.0\n";
        assert!(GatewayConfig::from_toml_str(text).is_err());
    }

    #[test]
    fn test_budget_config_alert_ladder() {
        let config = GatewayConfig::default();
        let bc = config.budget_config();
        assert_eq!(bc.alert_thresholds.len(), 3);
        assert_eq!(bc.alert_thresholds[0].action, AlertAction::Log);
        assert_eq!(bc.alert_thresholds[1].action, AlertAction::Notify);
        assert_eq!(bc.alert_thresholds[2].action, AlertAction::EmergencyMode);
        assert!((bc.alert_thresholds[2].percentage - 95.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_classifier_thresholds_mapping() {
        let mut config = GatewayConfig::default();
        config.routing.complexity_thresholds = ComplexityThresholdSection { medium: 0.2, complex: 0.6 };
        let t = config.classifier_thresholds();
        assert!((t.simple_max - 0.2).abs() < f64::EPSILON);
        assert!((t.medium_max - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn test_round_trip_toml() {
        let config = GatewayConfig::default();
        let text = toml::to_string_pretty(&config).expect("serializes");
        let back = GatewayConfig::from_toml_str(&text).expect("round trips");
        assert_eq!(config, back);
    }

    #[test]
    fn test_export_schema_is_valid_json() {
        let schema = export_schema().expect("schema exports");
        let parsed: serde_json::Value = serde_json::from_str(&schema).expect("valid JSON");
        assert!(parsed.get("properties").is_some() || parsed.get("$ref").is_some());
    }
}
