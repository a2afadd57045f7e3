//! Query classification.
//!
//! Analyses raw query text and produces a [`ClassifiedQuery`]: a complexity
//! band, an intent, a real-time flag, and a token estimate. The score drives
//! routing and budgeting downstream.
//!
//! | Score        | Band    |
//! |--------------|---------|
//! | `<= 0.30`    | simple  |
//! | `<= 0.70`    | medium  |
//! | `> 0.70`     | complex |
//!
//! ## Heuristics
//!
//! 1. **Length** — a monotonically non-decreasing bin over estimated tokens.
//! 2. **Keywords** — heavy indicators add, moderate indicators add less,
//!    simple-lookup indicators subtract; repeats beyond the first match of a
//!    list earn diminishing returns.
//! 3. **Structure** — multiple sentences, multiple question marks, and list
//!    markers each add a small boost.
//!
//! The raw sum is clamped to `[0.0, 1.0]`. Classification is a pure
//! function: no I/O, identical output for identical input.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Derived difficulty band of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    /// Short factual lookups and greetings.
    Simple,
    /// Explanations and moderate transformations.
    Medium,
    /// Multi-part analysis, design, or deep reasoning.
    Complex,
}

impl Complexity {
    /// Canonical lowercase label, as used in artifacts and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Medium => "medium",
            Self::Complex => "complex",
        }
    }
}

/// Dominant intent of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// Wants fresh or external facts.
    Search,
    /// Wants derivation, proof, or analysis.
    Reasoning,
    /// Conversational default.
    Chat,
    /// Wants generated prose, poetry, or fiction.
    Creative,
    /// Wants code written, fixed, or explained.
    Code,
}

impl Intent {
    /// Canonical lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Reasoning => "reasoning",
            Self::Chat => "chat",
            Self::Creative => "creative",
            Self::Code => "code",
        }
    }
}

/// Classification output for a single query. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedQuery {
    /// The raw query text.
    pub text: String,
    /// Difficulty band after thresholding.
    pub complexity: Complexity,
    /// Raw clamped complexity score in `[0.0, 1.0]`.
    pub complexity_score: f64,
    /// Dominant intent.
    pub intent: Intent,
    /// True iff any real-time keyword matched.
    pub is_realtime: bool,
    /// `ceil(len / 4)` token estimate.
    pub estimated_tokens: u64,
    /// Keywords that contributed to the decision.
    pub matched_indicators: BTreeSet<String>,
}

impl ClassifiedQuery {
    /// Whether the cache should be bypassed for this query.
    ///
    /// Real-time answers go stale immediately and creative output should
    /// not repeat, so neither is cached or served from cache.
    pub fn should_skip_cache(&self) -> bool {
        self.is_realtime || self.intent == Intent::Creative
    }

    /// Suggested cache TTL in milliseconds: 5 minutes for real-time
    /// queries, 30 minutes for search, one hour otherwise.
    pub fn suggest_cache_ttl_ms(&self) -> u64 {
        if self.is_realtime {
            5 * 60 * 1000
        } else if self.intent == Intent::Search {
            30 * 60 * 1000
        } else {
            60 * 60 * 1000
        }
    }
}

/// Complexity band thresholds. Scores at or below `simple_max` classify as
/// simple; at or below `medium_max` as medium; above as complex.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComplexityThresholds {
    /// Upper bound of the simple band.
    pub simple_max: f64,
    /// Upper bound of the medium band.
    pub medium_max: f64,
}

impl Default for ComplexityThresholds {
    fn default() -> Self {
        Self { simple_max: 0.30, medium_max: 0.70 }
    }
}

// ── Keyword tables ─────────────────────────────────────────────────────

/// Heavy indicators: analysis, design, and multi-constraint work.
const COMPLEX_INDICATORS: &[&str] = &[
    "analyze",
    "analyse",
    "architecture",
    "algorithm",
    "optimize",
    "refactor",
    "trade-off",
    "tradeoffs",
    "prove",
    "derive",
    "design a",
    "implement",
    "step by step",
    "in depth",
    "comprehensive",
    "compare and contrast",
];

/// Moderate indicators: explanation and transformation.
const MEDIUM_INDICATORS: &[&str] = &[
    "explain",
    "how does",
    "how do",
    "why does",
    "summarize",
    "summarise",
    "describe",
    "difference between",
    "convert",
    "translate",
];

/// Lookup indicators: subtract from the score.
const SIMPLE_INDICATORS: &[&str] = &[
    "what is",
    "who is",
    "when is",
    "when did",
    "where is",
    "define",
    "meaning of",
    "hello",
    "thanks",
    "thank you",
];

const SEARCH_KEYWORDS: &[&str] = &[
    "search", "find", "look up", "latest", "news", "current", "price", "weather", "stock",
    "who won", "score", "release date",
];

const REASONING_KEYWORDS: &[&str] = &[
    "why", "prove", "analyze", "analyse", "solve", "calculate", "logic", "reason", "math",
    "theorem", "deduce",
];

const CREATIVE_KEYWORDS: &[&str] = &[
    "poem", "story", "haiku", "song", "lyrics", "fiction", "imagine", "creative", "brainstorm",
];

const CODE_KEYWORDS: &[&str] = &[
    "code", "function", "bug", "compile", "stack trace", "python", "rust", "javascript",
    "typescript", "sql", "regex", "api", "debug", "unit test",
];

/// Real-time markers: any match sets `is_realtime` and biases search.
const REALTIME_KEYWORDS: &[&str] = &[
    "today", "tonight", "now", "latest", "breaking", "current", "currently", "this week",
    "right now", "live",
];

// ── Classifier ─────────────────────────────────────────────────────────

/// Pure query classifier. Stateless and cheap to construct.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    thresholds: ComplexityThresholds,
}

impl Classifier {
    /// Create a classifier with the default 0.30 / 0.70 thresholds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a classifier with custom band thresholds.
    pub fn with_thresholds(thresholds: ComplexityThresholds) -> Self {
        Self { thresholds }
    }

    /// Classify a query.
    pub fn classify(&self, text: &str) -> ClassifiedQuery {
        let lower = text.to_lowercase();
        let tokens = tokenize(&lower);
        let estimated_tokens = estimate_tokens(text);
        let mut matched = BTreeSet::new();

        let mut score = length_signal(estimated_tokens);
        score += keyword_signal(&lower, &tokens, COMPLEX_INDICATORS, 0.25, 0.08, &mut matched);
        score += keyword_signal(&lower, &tokens, MEDIUM_INDICATORS, 0.12, 0.04, &mut matched);
        score -= keyword_signal(&lower, &tokens, SIMPLE_INDICATORS, 0.15, 0.05, &mut matched);
        score += structure_signal(text);
        let complexity_score = score.clamp(0.0, 1.0);

        let complexity = if complexity_score <= self.thresholds.simple_max {
            Complexity::Simple
        } else if complexity_score <= self.thresholds.medium_max {
            Complexity::Medium
        } else {
            Complexity::Complex
        };

        let mut is_realtime = false;
        for kw in REALTIME_KEYWORDS {
            if matches_keyword(&lower, &tokens, kw) {
                matched.insert((*kw).to_string());
                is_realtime = true;
            }
        }

        let intent = self.pick_intent(&lower, &tokens, estimated_tokens, is_realtime, &mut matched);

        ClassifiedQuery {
            text: text.to_string(),
            complexity,
            complexity_score,
            intent,
            is_realtime,
            estimated_tokens,
            matched_indicators: matched,
        }
    }

    /// Score each intent's keyword list and take the maximum; `chat` starts
    /// from a 0.15 prior plus a short-message bonus so terse small talk
    /// does not get misrouted.
    fn pick_intent(
        &self,
        lower: &str,
        tokens: &[String],
        estimated_tokens: u64,
        is_realtime: bool,
        matched: &mut BTreeSet<String>,
    ) -> Intent {
        let mut search = intent_score(lower, tokens, SEARCH_KEYWORDS, 0.2, matched);
        let reasoning = intent_score(lower, tokens, REASONING_KEYWORDS, 0.2, matched);
        let creative = intent_score(lower, tokens, CREATIVE_KEYWORDS, 0.30, matched);
        let code = intent_score(lower, tokens, CODE_KEYWORDS, 0.2, matched);

        let mut chat = 0.15;
        if estimated_tokens <= 10 {
            chat += 0.10;
        }
        if is_realtime {
            search += 0.50;
        }

        let mut best = (Intent::Chat, chat);
        for (intent, s) in [
            (Intent::Search, search),
            (Intent::Reasoning, reasoning),
            (Intent::Creative, creative),
            (Intent::Code, code),
        ] {
            if s > best.1 {
                best = (intent, s);
            }
        }
        best.0
    }
}

// ── Signals ────────────────────────────────────────────────────────────

/// `ceil(len / 4)`.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64 + 3) / 4
}

/// Length bin, monotonically non-decreasing in the token estimate.
fn length_signal(estimated_tokens: u64) -> f64 {
    match estimated_tokens {
        0..=15 => 0.05,
        16..=40 => 0.12,
        41..=100 => 0.20,
        101..=250 => 0.30,
        _ => 0.40,
    }
}

/// Weighted keyword matches with diminishing returns: the first match of a
/// list earns `first`, each further match earns `rest`.
fn keyword_signal(
    lower: &str,
    tokens: &[String],
    list: &[&str],
    first: f64,
    rest: f64,
    matched: &mut BTreeSet<String>,
) -> f64 {
    let mut hits = 0usize;
    for kw in list {
        if matches_keyword(lower, tokens, kw) {
            matched.insert((*kw).to_string());
            hits += 1;
        }
    }
    match hits {
        0 => 0.0,
        n => first + rest * (n - 1) as f64,
    }
}

/// Intent keyword score: flat weight per match, no diminishing returns.
fn intent_score(
    lower: &str,
    tokens: &[String],
    list: &[&str],
    weight: f64,
    matched: &mut BTreeSet<String>,
) -> f64 {
    let mut score = 0.0;
    for kw in list {
        if matches_keyword(lower, tokens, kw) {
            matched.insert((*kw).to_string());
            score += weight;
        }
    }
    score
}

/// Additive boosts for multi-sentence, multi-question, and list structure.
fn structure_signal(text: &str) -> f64 {
    let mut boost = 0.0;
    let sentences = text
        .split(['.', '!', '?'])
        .filter(|s| !s.trim().is_empty())
        .count();
    if sentences >= 3 {
        boost += 0.05;
    }
    if text.matches('?').count() >= 2 {
        boost += 0.05;
    }
    let list_lines = text
        .lines()
        .map(str::trim_start)
        .filter(|l| {
            l.starts_with("- ")
                || l.starts_with("* ")
                || l.chars().next().is_some_and(|c| c.is_ascii_digit()) && l.contains(". ")
        })
        .count();
    if list_lines >= 2 {
        boost += 0.08;
    }
    boost
}

/// Phrase keywords (containing a space) match as substrings of the
/// lowercased text; single-word keywords must match a whole token so that
/// "now" does not fire inside "know".
fn matches_keyword(lower: &str, tokens: &[String], kw: &str) -> bool {
    if kw.contains(' ') {
        lower.contains(kw)
    } else {
        tokens.iter().any(|t| t == kw)
    }
}

/// Lowercased alphanumeric tokens; punctuation splits.
fn tokenize(lower: &str) -> Vec<String> {
    lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(text: &str) -> ClassifiedQuery {
        Classifier::new().classify(text)
    }

    // -- token estimate ---------------------------------------------------

    #[test]
    fn test_estimate_tokens_is_ceil_len_over_4() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("a"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(&"x".repeat(101)), 26);
    }

    #[test]
    fn test_classify_is_pure() {
        let a = classify("Explain quantum computing");
        let b = classify("Explain quantum computing");
        assert_eq!(a.complexity, b.complexity);
        assert!((a.complexity_score - b.complexity_score).abs() < f64::EPSILON);
        assert_eq!(a.intent, b.intent);
        assert_eq!(a.matched_indicators, b.matched_indicators);
    }

    // -- complexity -------------------------------------------------------

    #[test]
    fn test_short_lookup_is_simple() {
        let q = classify("What is the capital of France?");
        assert_eq!(q.complexity, Complexity::Simple, "got {q:?}");
    }

    #[test]
    fn test_explain_prompt_is_not_complex() {
        let q = classify("Explain quantum computing");
        assert_ne!(q.complexity, Complexity::Complex);
    }

    #[test]
    fn test_analysis_prompt_is_complex() {
        let q = classify(
            "Analyze the architecture of this distributed system and design a \
             step by step migration plan. Compare and contrast the trade-off \
             of each option:\n1. Strangler pattern\n2. Big-bang rewrite\n3. Branch by abstraction",
        );
        assert_eq!(q.complexity, Complexity::Complex, "score {}", q.complexity_score);
    }

    #[test]
    fn test_score_is_clamped_to_unit_range() {
        let long = "analyze architecture algorithm optimize refactor prove derive ".repeat(50);
        let q = classify(&long);
        assert!(q.complexity_score >= 0.0 && q.complexity_score <= 1.0);
    }

    #[test]
    fn test_simple_indicators_subtract() {
        let with = classify("What is a mutex?");
        let without = classify("mutex semantics overview");
        assert!(with.complexity_score <= without.complexity_score);
    }

    #[test]
    fn test_custom_thresholds_move_the_bands() {
        let strict = Classifier::with_thresholds(ComplexityThresholds {
            simple_max: 0.01,
            medium_max: 0.02,
        });
        let q = strict.classify("Explain how does garbage collection work");
        assert_eq!(q.complexity, Complexity::Complex);
    }

    #[test]
    fn test_multiple_questions_boost_score() {
        let one = classify("Is Rust memory safe?");
        let many = classify("Is Rust memory safe? Is it fast? Is it portable?");
        assert!(many.complexity_score > one.complexity_score);
    }

    // -- intent -----------------------------------------------------------

    #[test]
    fn test_bitcoin_price_is_simple_search_realtime() {
        let q = classify("What is the current Bitcoin price?");
        assert_eq!(q.complexity, Complexity::Simple, "score {}", q.complexity_score);
        assert_eq!(q.intent, Intent::Search);
        assert!(q.is_realtime);
    }

    #[test]
    fn test_poem_prompt_is_creative() {
        let q = classify("Write a poem about the ocean at sunset");
        assert_eq!(q.intent, Intent::Creative);
        assert!(!q.is_realtime);
    }

    #[test]
    fn test_code_prompt_is_code_intent() {
        let q = classify("Fix this Rust function that fails to compile with a borrow error");
        assert_eq!(q.intent, Intent::Code);
    }

    #[test]
    fn test_greeting_defaults_to_chat() {
        let q = classify("Hello there!");
        assert_eq!(q.intent, Intent::Chat);
    }

    #[test]
    fn test_reasoning_prompt() {
        let q = classify("Prove that the sum of two even numbers is even");
        assert_eq!(q.intent, Intent::Reasoning);
    }

    #[test]
    fn test_now_does_not_match_inside_know() {
        let q = classify("I know a good book about compilers, summarize its ideas");
        assert!(!q.is_realtime, "token matching must not fire on substrings");
    }

    #[test]
    fn test_realtime_biases_search_over_chat() {
        let q = classify("latest football score");
        assert_eq!(q.intent, Intent::Search);
        assert!(q.is_realtime);
    }

    // -- cache policy helpers ---------------------------------------------

    #[test]
    fn test_should_skip_cache_for_realtime() {
        let q = classify("What is the current Bitcoin price?");
        assert!(q.should_skip_cache());
    }

    #[test]
    fn test_should_skip_cache_for_creative() {
        let q = classify("Write a poem about the ocean at sunset");
        assert!(q.should_skip_cache());
    }

    #[test]
    fn test_plain_query_is_cacheable() {
        let q = classify("Explain quantum computing");
        assert!(!q.should_skip_cache());
    }

    #[test]
    fn test_ttl_suggestions() {
        let realtime = classify("latest news on the election today");
        assert_eq!(realtime.suggest_cache_ttl_ms(), 5 * 60 * 1000);

        let search = classify("find the release date of that film");
        assert_eq!(search.suggest_cache_ttl_ms(), 30 * 60 * 1000);

        let other = classify("Explain quantum computing");
        assert_eq!(other.suggest_cache_ttl_ms(), 60 * 60 * 1000);
    }

    // -- indicators -------------------------------------------------------

    #[test]
    fn test_matched_indicators_recorded() {
        let q = classify("Analyze the algorithm and explain why it is correct");
        assert!(q.matched_indicators.contains("analyze"));
        assert!(q.matched_indicators.contains("explain"));
        assert!(q.matched_indicators.contains("why"));
    }

    #[test]
    fn test_labels_are_lowercase() {
        assert_eq!(Complexity::Complex.as_str(), "complex");
        assert_eq!(Intent::Search.as_str(), "search");
    }
}
