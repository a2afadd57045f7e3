//! Provider abstraction and adapters.
//!
//! Every upstream LLM vendor is reached through the uniform [`Provider`]
//! trait: chat, model listing, cost estimation, and a health probe.
//! Adapters included here:
//!
//! - [`EchoProvider`] — zero-cost test/demo double that echoes the prompt.
//! - [`ScriptedProvider`] — returns pre-programmed responses and failures,
//!   for exercising routing and cascade behaviour without a network.
//! - [`HttpProvider`] — OpenAI-compatible chat-completions client over
//!   reqwest; Perplexity and OpenAI both speak this shape, and the builder
//!   takes a base URL so compatible endpoints and mock servers work too.
//!
//! Adapter cost figures always derive from the [`CostBook`]; adapters
//! carry no pricing tables of their own.

use crate::costbook::CostBook;
use crate::GatewayError;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One turn of prior conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `"user"` or `"assistant"`.
    pub role: String,
    /// Message body.
    pub content: String,
}

/// Uniform chat request handed to any adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Request id, propagated for tracing.
    pub id: String,
    /// The user query.
    pub content: String,
    /// Optional system prompt.
    pub system_prompt: Option<String>,
    /// Prior turns, oldest first.
    pub conversation_history: Vec<ChatMessage>,
    /// Generation cap.
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
}

impl ChatRequest {
    /// Minimal request around a query string.
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            system_prompt: None,
            conversation_history: Vec::new(),
            max_tokens: None,
            temperature: None,
        }
    }
}

/// Billed token usage.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt-side tokens.
    pub input: u64,
    /// Completion-side tokens.
    pub output: u64,
    /// `input + output` unless the vendor says otherwise.
    pub total: u64,
}

/// Uniform response from any adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Echoes the request id.
    pub id: String,
    /// Response body.
    pub content: String,
    /// Provider that served the call.
    pub provider: String,
    /// Model that served the call.
    pub model: String,
    /// Billed usage.
    pub tokens: TokenUsage,
    /// Adapter-level cost estimate, USD, derived from the cost book.
    pub cost: f64,
    /// Wall-clock duration of the call.
    pub response_time_ms: u64,
    /// Citation URLs, when the vendor returns them.
    pub citations: Vec<String>,
    /// Vendor finish reason, when present.
    pub finish_reason: Option<String>,
}

/// The uniform capability every provider adapter implements.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name as registered (e.g. `"openai"`).
    fn name(&self) -> &str;

    /// Perform a chat call against `model`.
    async fn chat(&self, request: &ChatRequest, model: &str)
        -> Result<ProviderResponse, GatewayError>;

    /// Models this adapter can serve.
    fn available_models(&self) -> Vec<String>;

    /// Adapter-level cost estimate, USD.
    fn estimate_cost(&self, input_tokens: u64, output_tokens: u64, model: &str) -> f64;

    /// Cheap liveness probe.
    async fn health_check(&self) -> bool;
}

/// Per-step call deadline: reasoning-capable models get longer.
pub fn call_timeout(reasoning_capable: bool) -> Duration {
    if reasoning_capable {
        Duration::from_secs(120)
    } else {
        Duration::from_secs(60)
    }
}

// ── Retry ──────────────────────────────────────────────────────────────

/// Retry policy for provider calls: exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// First backoff delay.
    pub base_delay: Duration,
    /// Backoff ceiling.
    pub max_delay: Duration,
    /// Uniform jitter applied as +/- this many milliseconds.
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter_ms: 200,
        }
    }
}

impl RetryPolicy {
    /// Backoff for a zero-based attempt number, jittered.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        jittered(exp, self.jitter_ms)
    }
}

/// +/- `jitter_ms` of uniform noise, never below zero.
fn jittered(base: Duration, jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return base;
    }
    use rand::Rng;
    let offset = rand::thread_rng().gen_range(0..=2 * jitter_ms) as i64 - jitter_ms as i64;
    let base_ms = base.as_millis() as i64;
    Duration::from_millis((base_ms + offset).max(0) as u64)
}

/// Call a provider with retries. Only retryable (provider) failures are
/// retried; a 429 retry-after hint stretches the backoff.
pub async fn call_with_retry(
    provider: &dyn Provider,
    request: &ChatRequest,
    model: &str,
    policy: &RetryPolicy,
) -> Result<ProviderResponse, GatewayError> {
    let mut attempt = 0u32;
    loop {
        match provider.chat(request, model).await {
            Ok(response) => {
                if attempt > 0 {
                    debug!(provider = provider.name(), attempt, "provider call recovered");
                }
                return Ok(response);
            }
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let mut delay = policy.delay_for(attempt);
                if let GatewayError::Provider { retry_after_ms: Some(hint), .. } = &e {
                    delay = delay.max(Duration::from_millis(*hint));
                }
                warn!(
                    provider = provider.name(),
                    model,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "provider call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ── Registry and health ────────────────────────────────────────────────

/// Providers registered at startup, looked up by name per decision.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own name.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    /// Look up an adapter.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered adapters.
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Point-in-time health snapshot for one provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    /// Registered and reachable at last probe.
    pub live: bool,
    /// Recent calls are succeeding.
    pub healthy: bool,
    /// Latency of the most recent observation.
    pub latency_ms: Option<u64>,
    /// Successes over total observed calls, 1.0 when idle.
    pub success_rate: f64,
}

#[derive(Default)]
struct HealthCounters {
    successes: AtomicU64,
    failures: AtomicU64,
    last_latency_ms: AtomicU64,
}

/// Rolling per-provider health, fed from call outcomes.
#[derive(Default)]
pub struct HealthTracker {
    counters: DashMap<String, HealthCounters>,
}

impl HealthTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful call.
    pub fn record_success(&self, provider: &str, latency_ms: u64) {
        let entry = self.counters.entry(provider.to_string()).or_default();
        entry.successes.fetch_add(1, Ordering::Relaxed);
        entry.last_latency_ms.store(latency_ms.max(1), Ordering::Relaxed);
    }

    /// Record a failed call.
    pub fn record_failure(&self, provider: &str) {
        let entry = self.counters.entry(provider.to_string()).or_default();
        entry.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot for one provider. A provider with no observations is
    /// reported live and healthy.
    pub fn snapshot(&self, provider: &str) -> ProviderHealth {
        match self.counters.get(provider) {
            Some(c) => {
                let successes = c.successes.load(Ordering::Relaxed);
                let failures = c.failures.load(Ordering::Relaxed);
                let total = successes + failures;
                let success_rate =
                    if total == 0 { 1.0 } else { successes as f64 / total as f64 };
                let last = c.last_latency_ms.load(Ordering::Relaxed);
                ProviderHealth {
                    live: true,
                    healthy: success_rate >= 0.5,
                    latency_ms: if last == 0 { None } else { Some(last) },
                    success_rate,
                }
            }
            None => ProviderHealth { live: true, healthy: true, latency_ms: None, success_rate: 1.0 },
        }
    }
}

// ── Echo adapter ───────────────────────────────────────────────────────

/// Zero-cost echo adapter for demos and smoke tests.
pub struct EchoProvider {
    delay_ms: u64,
}

impl EchoProvider {
    /// Echo with a default 10 ms simulated latency.
    pub fn new() -> Self {
        Self { delay_ms: 10 }
    }

    /// Echo with a custom simulated latency.
    pub fn with_delay(delay_ms: u64) -> Self {
        Self { delay_ms }
    }
}

impl Default for EchoProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn chat(
        &self,
        request: &ChatRequest,
        model: &str,
    ) -> Result<ProviderResponse, GatewayError> {
        let start = Instant::now();
        tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        let tokens = crate::classify::estimate_tokens(&request.content);
        Ok(ProviderResponse {
            id: request.id.clone(),
            content: request.content.clone(),
            provider: "echo".to_string(),
            model: model.to_string(),
            tokens: TokenUsage { input: tokens, output: tokens, total: tokens * 2 },
            cost: 0.0,
            response_time_ms: start.elapsed().as_millis() as u64,
            citations: Vec::new(),
            finish_reason: Some("stop".to_string()),
        })
    }

    fn available_models(&self) -> Vec<String> {
        vec!["echo".to_string()]
    }

    fn estimate_cost(&self, _input_tokens: u64, _output_tokens: u64, _model: &str) -> f64 {
        0.0
    }

    async fn health_check(&self) -> bool {
        true
    }
}

// ── Scripted adapter ───────────────────────────────────────────────────

/// One scripted reply.
#[derive(Debug, Clone)]
pub struct ScriptedReply {
    /// Response body.
    pub content: String,
    /// Citations to attach.
    pub citations: Vec<String>,
    /// Billed input tokens.
    pub input_tokens: u64,
    /// Billed output tokens.
    pub output_tokens: u64,
    /// Reported cost, USD.
    pub cost: f64,
}

impl ScriptedReply {
    /// A plain reply with default usage.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            citations: Vec::new(),
            input_tokens: 100,
            output_tokens: 200,
            cost: 0.001,
        }
    }
}

/// Deterministic adapter: pops one scripted result per call. An exhausted
/// script fails the call, which surfaces scripting mistakes loudly.
pub struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<Result<ScriptedReply, String>>>,
    calls: AtomicU64,
    healthy: bool,
}

impl ScriptedProvider {
    /// New scripted adapter.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU64::new(0),
            healthy: true,
        }
    }

    /// Queue a successful reply.
    pub fn push_reply(&self, reply: ScriptedReply) -> &Self {
        if let Ok(mut s) = self.script.lock() {
            s.push_back(Ok(reply));
        }
        self
    }

    /// Queue a failure with the given message.
    pub fn push_failure(&self, message: impl Into<String>) -> &Self {
        if let Ok(mut s) = self.script.lock() {
            s.push_back(Err(message.into()));
        }
        self
    }

    /// Calls served so far.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Mark the provider unhealthy for health probes.
    pub fn set_unhealthy(mut self) -> Self {
        self.healthy = false;
        self
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(
        &self,
        request: &ChatRequest,
        model: &str,
    ) -> Result<ProviderResponse, GatewayError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match next {
            Some(Ok(reply)) => Ok(ProviderResponse {
                id: request.id.clone(),
                content: reply.content,
                provider: self.name.clone(),
                model: model.to_string(),
                tokens: TokenUsage {
                    input: reply.input_tokens,
                    output: reply.output_tokens,
                    total: reply.input_tokens + reply.output_tokens,
                },
                cost: reply.cost,
                response_time_ms: 5,
                citations: reply.citations,
                finish_reason: Some("stop".to_string()),
            }),
            Some(Err(message)) => Err(GatewayError::Provider {
                provider: self.name.clone(),
                model: model.to_string(),
                status: Some(500),
                message,
                retry_after_ms: None,
            }),
            None => Err(GatewayError::Provider {
                provider: self.name.clone(),
                model: model.to_string(),
                status: None,
                message: "script exhausted".to_string(),
                retry_after_ms: None,
            }),
        }
    }

    fn available_models(&self) -> Vec<String> {
        vec!["scripted".to_string()]
    }

    fn estimate_cost(&self, _input_tokens: u64, _output_tokens: u64, _model: &str) -> f64 {
        0.001
    }

    async fn health_check(&self) -> bool {
        self.healthy
    }
}

// ── HTTP adapter (OpenAI-compatible) ───────────────────────────────────

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct WireChoiceMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    /// Perplexity attaches source URLs here.
    #[serde(default)]
    citations: Vec<String>,
}

/// OpenAI-compatible chat-completions adapter. Perplexity, OpenAI, and
/// most proxies speak this wire shape.
pub struct HttpProvider {
    name: String,
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    models: Vec<String>,
    cost_book: Arc<CostBook>,
    timeout: Duration,
}

impl HttpProvider {
    /// New adapter. `name` must match the provider name in the cost book
    /// for pricing derivation to work.
    pub fn new(
        name: impl Into<String>,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        models: Vec<String>,
        cost_book: Arc<CostBook>,
    ) -> Self {
        Self {
            name: name.into(),
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into(),
            models,
            cost_book,
            timeout: Duration::from_secs(60),
        }
    }

    /// Override the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn wire_messages<'a>(&self, request: &'a ChatRequest) -> Vec<WireMessage<'a>> {
        let mut messages = Vec::with_capacity(request.conversation_history.len() + 2);
        if let Some(system) = &request.system_prompt {
            messages.push(WireMessage { role: "system", content: system });
        }
        for turn in &request.conversation_history {
            messages.push(WireMessage { role: &turn.role, content: &turn.content });
        }
        messages.push(WireMessage { role: "user", content: &request.content });
        messages
    }

    fn wrap_error(
        &self,
        model: &str,
        status: Option<u16>,
        message: String,
        retry_after_ms: Option<u64>,
    ) -> GatewayError {
        GatewayError::Provider {
            provider: self.name.clone(),
            model: model.to_string(),
            status,
            message,
            retry_after_ms,
        }
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(
        &self,
        request: &ChatRequest,
        model: &str,
    ) -> Result<ProviderResponse, GatewayError> {
        let started = Instant::now();
        let wire = WireRequest {
            model,
            messages: self.wire_messages(request),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .timeout(self.timeout)
            .json(&wire)
            .send()
            .await
            .map_err(|e| self.wrap_error(model, None, format!("request failed: {e}"), None))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000);
            let body = response.text().await.unwrap_or_default();
            return Err(self.wrap_error(
                model,
                Some(status.as_u16()),
                format!("upstream {status}: {body}"),
                retry_after_ms,
            ));
        }

        let parsed: WireResponse = response
            .json()
            .await
            .map_err(|e| self.wrap_error(model, None, format!("bad response body: {e}"), None))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| self.wrap_error(model, None, "no choices in response".into(), None))?;

        let usage = parsed.usage.unwrap_or(WireUsage {
            prompt_tokens: crate::classify::estimate_tokens(&request.content),
            completion_tokens: crate::classify::estimate_tokens(&choice.message.content),
            total_tokens: 0,
        });
        let total = if usage.total_tokens > 0 {
            usage.total_tokens
        } else {
            usage.prompt_tokens + usage.completion_tokens
        };

        Ok(ProviderResponse {
            id: request.id.clone(),
            content: choice.message.content,
            provider: self.name.clone(),
            model: model.to_string(),
            tokens: TokenUsage {
                input: usage.prompt_tokens,
                output: usage.completion_tokens,
                total,
            },
            cost: self
                .cost_book
                .estimate(&self.name, model, usage.prompt_tokens, usage.completion_tokens)
                .estimated_cost,
            response_time_ms: started.elapsed().as_millis() as u64,
            citations: parsed.citations,
            finish_reason: choice.finish_reason,
        })
    }

    fn available_models(&self) -> Vec<String> {
        self.models.clone()
    }

    fn estimate_cost(&self, input_tokens: u64, output_tokens: u64, model: &str) -> f64 {
        self.cost_book
            .estimate(&self.name, model, input_tokens, output_tokens)
            .estimated_cost
    }

    async fn health_check(&self) -> bool {
        // A HEAD against the models listing is the cheapest authenticated
        // probe these APIs offer.
        let probe = self
            .client
            .get(format!("{}/models", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        matches!(probe, Ok(r) if r.status().is_success())
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_provider_round_trip() {
        let p = EchoProvider::with_delay(0);
        let resp = p
            .chat(&ChatRequest::new("r1", "hello world"), "echo")
            .await
            .expect("echo succeeds");
        assert_eq!(resp.content, "hello world");
        assert_eq!(resp.provider, "echo");
        assert!(resp.cost.abs() < f64::EPSILON);
        assert!(p.health_check().await);
    }

    #[tokio::test]
    async fn test_scripted_provider_pops_in_order() {
        let p = ScriptedProvider::new("mock");
        p.push_reply(ScriptedReply::text("first"));
        p.push_reply(ScriptedReply::text("second"));
        let a = p.chat(&ChatRequest::new("r", "q"), "m").await.expect("first");
        let b = p.chat(&ChatRequest::new("r", "q"), "m").await.expect("second");
        assert_eq!(a.content, "first");
        assert_eq!(b.content, "second");
        assert_eq!(p.call_count(), 2);
    }

    #[tokio::test]
    async fn test_scripted_provider_failure_and_exhaustion() {
        let p = ScriptedProvider::new("mock");
        p.push_failure("upstream 500");
        let err = p.chat(&ChatRequest::new("r", "q"), "m").await.expect_err("scripted failure");
        assert!(matches!(err, GatewayError::Provider { .. }));
        let err = p.chat(&ChatRequest::new("r", "q"), "m").await.expect_err("exhausted");
        assert!(err.to_string().contains("script exhausted"));
    }

    #[tokio::test]
    async fn test_retry_recovers_after_transient_failure() {
        let p = ScriptedProvider::new("mock");
        p.push_failure("blip");
        p.push_reply(ScriptedReply::text("recovered"));
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            jitter_ms: 0,
            ..RetryPolicy::default()
        };
        let resp = call_with_retry(&p, &ChatRequest::new("r", "q"), "m", &policy)
            .await
            .expect("retry recovers");
        assert_eq!(resp.content, "recovered");
        assert_eq!(p.call_count(), 2);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_cap() {
        let p = ScriptedProvider::new("mock");
        for _ in 0..5 {
            p.push_failure("persistent");
        }
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            jitter_ms: 0,
            ..RetryPolicy::default()
        };
        let err = call_with_retry(&p, &ChatRequest::new("r", "q"), "m", &policy)
            .await
            .expect_err("exhausted retries");
        assert!(matches!(err, GatewayError::Provider { .. }));
        // 1 initial + 2 retries.
        assert_eq!(p.call_count(), 3);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter_ms: 0,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(20), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let d = jittered(base, 200);
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1200));
        }
    }

    #[test]
    fn test_call_timeout_tiers() {
        assert_eq!(call_timeout(false), Duration::from_secs(60));
        assert_eq!(call_timeout(true), Duration::from_secs(120));
    }

    #[test]
    fn test_registry_register_and_lookup() {
        let mut reg = ProviderRegistry::new();
        reg.register(Arc::new(EchoProvider::new()));
        reg.register(Arc::new(ScriptedProvider::new("mock")));
        assert_eq!(reg.len(), 2);
        assert!(reg.get("echo").is_some());
        assert!(reg.get("nope").is_none());
        assert_eq!(reg.names(), vec!["echo".to_string(), "mock".to_string()]);
    }

    #[test]
    fn test_health_tracker_rates() {
        let t = HealthTracker::new();
        t.record_success("openai", 120);
        t.record_success("openai", 90);
        t.record_failure("openai");
        let h = t.snapshot("openai");
        assert!(h.healthy);
        assert!((h.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(h.latency_ms, Some(90));

        t.record_failure("flaky");
        t.record_failure("flaky");
        t.record_success("flaky", 10);
        assert!(!t.snapshot("flaky").healthy);
    }

    #[test]
    fn test_health_tracker_unknown_provider_is_optimistic() {
        let h = HealthTracker::new().snapshot("fresh");
        assert!(h.live && h.healthy);
        assert!((h.success_rate - 1.0).abs() < f64::EPSILON);
    }
}
