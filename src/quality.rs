//! Response quality estimation.
//!
//! Maps a (response, classified query) pair to a 0-10 score built from six
//! weighted signals, with a letter grade, a confidence derived from signal
//! agreement, and an accept / escalate / reject recommendation whose bars
//! depend on query complexity. Pure: no I/O, no clocks.

use crate::classify::{ClassifiedQuery, Complexity, Intent};
use serde::{Deserialize, Serialize};

/// Signal weights; they sum to 1.0.
const W_CITATIONS: f64 = 0.25;
const W_CONFIDENCE: f64 = 0.20;
const W_STRUCTURE: f64 = 0.20;
const W_LENGTH: f64 = 0.15;
const W_LATENCY: f64 = 0.10;
const W_EFFICIENCY: f64 = 0.10;

const REFUSAL_PATTERNS: &[&str] = &[
    "i cannot",
    "i can't",
    "i'm unable",
    "i am unable",
    "i won't be able",
    "as an ai",
];

const HIGH_CONFIDENCE: &[&str] = &[
    "definitely",
    "certainly",
    "clearly",
    "specifically",
    "in fact",
    "precisely",
];

const LOW_CONFIDENCE: &[&str] = &[
    "i'm not sure",
    "not sure",
    "might be",
    "may be",
    "possibly",
    "perhaps",
    "i think",
    "unclear",
    "uncertain",
];

/// Everything the estimator needs to know about a response.
#[derive(Debug, Clone)]
pub struct QualityInput<'a> {
    /// Response body.
    pub text: &'a str,
    /// Citation URLs attached by the provider, if any.
    pub citations: &'a [String],
    /// Whether the producing provider is search-capable; uncited answers
    /// from a search provider are penalised harder.
    pub provider_is_search: bool,
    /// Wall-clock time of the producing call.
    pub response_time_ms: Option<u64>,
    /// Billed input tokens.
    pub input_tokens: Option<u64>,
    /// Billed output tokens.
    pub output_tokens: Option<u64>,
}

/// One scored signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualitySignal {
    /// Signal name, stable for dashboards.
    pub name: String,
    /// Raw score in `[0, 10]`.
    pub score: f64,
    /// Weight applied to the overall score.
    pub weight: f64,
    /// Human-readable account of how the score came about.
    pub detail: String,
}

/// Letter grade over the overall score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Grade {
    /// `>= 8.5`
    A,
    /// `>= 7.0`
    B,
    /// `>= 5.0`
    C,
    /// `>= 3.0`
    D,
    /// Below 3.0.
    F,
}

/// What the router should do with the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    /// Good enough for this complexity band.
    Accept,
    /// Worth trying a stronger model.
    Escalate,
    /// Unusable.
    Reject,
}

/// Full quality report. Immutable; one per scored response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    /// Weighted sum of signal scores, `[0, 10]`.
    pub overall_score: f64,
    /// The six signals in fixed order.
    pub signals: Vec<QualitySignal>,
    /// Letter grade.
    pub grade: Grade,
    /// Agreement-based confidence in `[0.2, 1.0]`.
    pub confidence: f64,
    /// Routing recommendation.
    pub recommendation: Recommendation,
}

/// Multi-signal quality scorer. Stateless and cheap to construct.
#[derive(Debug, Clone, Copy, Default)]
pub struct QualityEstimator;

impl QualityEstimator {
    /// New estimator.
    pub fn new() -> Self {
        Self
    }

    /// Score a response against its classified query.
    pub fn evaluate(&self, input: &QualityInput<'_>, query: &ClassifiedQuery) -> QualityReport {
        let signals = vec![
            citation_signal(input),
            confidence_language_signal(input.text),
            structure_signal(input.text, query),
            length_signal(input.text, query.complexity),
            latency_signal(input.response_time_ms, query.complexity),
            efficiency_signal(input.input_tokens, input.output_tokens),
        ];

        let overall_score: f64 = signals.iter().map(|s| s.score * s.weight).sum();
        let confidence = agreement_confidence(&signals);
        let grade = grade_for(overall_score);
        let recommendation = recommend(overall_score, query.complexity);

        QualityReport { overall_score, signals, grade, confidence, recommendation }
    }
}

// ── Signals ────────────────────────────────────────────────────────────

fn citation_signal(input: &QualityInput<'_>) -> QualitySignal {
    let count = input.citations.len();
    let mut score: f64 = match count {
        0 if input.provider_is_search => 3.0,
        0 => 6.0,
        1 => 6.0,
        2..=5 => 9.0,
        6..=8 => 7.5,
        _ => 6.0,
    };

    let distinct = distinct_hostnames(input.citations);
    let wanted = count.min(3);
    if count > 0 && distinct >= wanted {
        score += 0.5;
    }
    let score = score.min(10.0);

    QualitySignal {
        name: "citation_quality".to_string(),
        score,
        weight: W_CITATIONS,
        detail: format!("{count} citations across {distinct} hosts"),
    }
}

fn confidence_language_signal(text: &str) -> QualitySignal {
    let lower = text.to_lowercase();

    if let Some(pattern) = REFUSAL_PATTERNS.iter().find(|p| lower.contains(**p)) {
        return QualitySignal {
            name: "confidence_language".to_string(),
            score: 1.0,
            weight: W_CONFIDENCE,
            detail: format!("refusal pattern: {pattern:?}"),
        };
    }

    let high = HIGH_CONFIDENCE.iter().filter(|p| lower.contains(**p)).count() as f64;
    let low = LOW_CONFIDENCE.iter().filter(|p| lower.contains(**p)).count() as f64;
    let adjustment = (0.5 * (high - 2.0 * low)).clamp(-5.0, 3.0);
    let score = (7.0 + adjustment).clamp(0.0, 10.0);

    QualitySignal {
        name: "confidence_language".to_string(),
        score,
        weight: W_CONFIDENCE,
        detail: format!("{high} assertive, {low} hedging markers"),
    }
}

fn structure_signal(text: &str, query: &ClassifiedQuery) -> QualitySignal {
    let has_heading = text.lines().any(|l| l.trim_start().starts_with('#'));
    let has_bullets = text
        .lines()
        .map(str::trim_start)
        .any(|l| l.starts_with("- ") || l.starts_with("* "));
    let has_numbered = text
        .lines()
        .map(str::trim_start)
        .filter(|l| l.chars().next().is_some_and(|c| c.is_ascii_digit()) && l.contains(". "))
        .count()
        >= 2;
    let has_code = text.contains("```");
    let has_bold = text.contains("**");
    let paragraphs = text.split("\n\n").filter(|p| !p.trim().is_empty()).count();

    let mut credits: f64 = 0.0;
    if has_heading {
        credits += 1.0;
    }
    if has_bullets {
        credits += 1.0;
    }
    if has_numbered {
        credits += 1.0;
    }
    if has_code {
        credits += 1.5;
    }
    if has_bold {
        credits += 0.5;
    }
    if paragraphs >= 3 {
        credits += 1.0;
    }

    // Simple answers need little scaffolding; complex answers earn more
    // for having it.
    let scale = match query.complexity {
        Complexity::Simple => 0.6,
        Complexity::Medium => 1.0,
        Complexity::Complex => 1.2,
    };
    let mut score = 5.0 + credits * scale;
    if query.intent == Intent::Code && !has_code {
        score -= 2.0;
    }
    let score = score.clamp(0.0, 10.0);

    QualitySignal {
        name: "structural_completeness".to_string(),
        score,
        weight: W_STRUCTURE,
        detail: format!("credits {credits:.1} x{scale}, {paragraphs} paragraphs"),
    }
}

fn length_signal(text: &str, complexity: Complexity) -> QualitySignal {
    let (min, max, ideal) = match complexity {
        Complexity::Simple => (50.0, 500.0, 200.0),
        Complexity::Medium => (150.0, 1500.0, 600.0),
        Complexity::Complex => (300.0, 4000.0, 1500.0),
    };
    let words = text.split_whitespace().count() as f64;

    let (score, detail) = if words < min {
        (((words / min) * 7.0).max(2.0), format!("{words} words, short of {min}"))
    } else if words > max {
        let over = words / max;
        ((10.0 - 3.0 * (over - 1.0)).max(4.0), format!("{words} words, over {max}"))
    } else {
        let drift = (words - ideal).abs() / ideal;
        ((10.0 - 3.0 * drift).max(7.0), format!("{words} words, ideal {ideal}"))
    };

    QualitySignal { name: "length_appropriateness".to_string(), score, weight: W_LENGTH, detail }
}

fn latency_signal(response_time_ms: Option<u64>, complexity: Complexity) -> QualitySignal {
    let baseline = match complexity {
        Complexity::Simple => 2000.0,
        Complexity::Medium => 5000.0,
        Complexity::Complex => 10_000.0,
    };
    let (score, detail) = match response_time_ms {
        None => (7.0, "latency unknown".to_string()),
        Some(ms) => {
            let ratio = ms as f64 / baseline;
            let score = if ratio <= 0.5 {
                10.0
            } else if ratio <= 1.0 {
                9.0
            } else if ratio <= 2.0 {
                6.0
            } else {
                3.0
            };
            (score, format!("{ms}ms vs {baseline}ms baseline"))
        }
    };

    QualitySignal { name: "latency_vs_expected".to_string(), score, weight: W_LATENCY, detail }
}

fn efficiency_signal(input_tokens: Option<u64>, output_tokens: Option<u64>) -> QualitySignal {
    let (score, detail) = match (input_tokens, output_tokens) {
        (Some(input), Some(output)) if input > 0 => {
            let ratio = output as f64 / input as f64;
            let score = if ratio < 0.5 {
                4.0
            } else if ratio <= 5.0 {
                9.0
            } else if ratio <= 10.0 {
                7.0
            } else {
                5.0
            };
            (score, format!("out/in ratio {ratio:.2}"))
        }
        _ => (5.0, "token usage unknown".to_string()),
    };

    QualitySignal { name: "token_efficiency".to_string(), score, weight: W_EFFICIENCY, detail }
}

// ── Aggregation ────────────────────────────────────────────────────────

/// `max(0.2, min(1.0, 1 - sigma/5))` over raw signal scores, where sigma
/// is the population standard deviation. Signals in agreement make the
/// overall score trustworthy; wild disagreement does not.
fn agreement_confidence(signals: &[QualitySignal]) -> f64 {
    if signals.is_empty() {
        return 0.2;
    }
    let n = signals.len() as f64;
    let mean = signals.iter().map(|s| s.score).sum::<f64>() / n;
    let variance = signals.iter().map(|s| (s.score - mean).powi(2)).sum::<f64>() / n;
    (1.0 - variance.sqrt() / 5.0).clamp(0.2, 1.0)
}

fn grade_for(score: f64) -> Grade {
    if score >= 8.5 {
        Grade::A
    } else if score >= 7.0 {
        Grade::B
    } else if score >= 5.0 {
        Grade::C
    } else if score >= 3.0 {
        Grade::D
    } else {
        Grade::F
    }
}

/// Acceptance bars rise with complexity: a simple query is happy with a 6,
/// a complex one demands an 8.
fn recommend(score: f64, complexity: Complexity) -> Recommendation {
    let (accept, reject) = match complexity {
        Complexity::Simple => (6.0, 3.0),
        Complexity::Medium => (7.0, 4.0),
        Complexity::Complex => (8.0, 5.0),
    };
    if score >= accept {
        Recommendation::Accept
    } else if score < reject {
        Recommendation::Reject
    } else {
        Recommendation::Escalate
    }
}

/// Distinct citation hostnames, scheme and `www.` stripped.
fn distinct_hostnames(citations: &[String]) -> usize {
    let mut hosts: Vec<String> = citations
        .iter()
        .map(|url| {
            let rest = url.split("://").nth(1).unwrap_or(url);
            let host = rest.split('/').next().unwrap_or(rest);
            host.trim_start_matches("www.").to_lowercase()
        })
        .filter(|h| !h.is_empty())
        .collect();
    hosts.sort();
    hosts.dedup();
    hosts.len()
}

// ── Tests ──────────────────────────────────────────────────────────────
