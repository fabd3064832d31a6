//! Keyword-driven objective analysis

use super::types::{Capability, Complexity, ObjectiveAnalysis, ObjectiveType};
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::resource::ResourceSpec;
use std::collections::BTreeSet;
use std::time::Duration;

/// Words are matched by prefix, so "test" also matches "testing"
const CAPABILITY_KEYWORDS: &[(Capability, &[&str])] = &[
    (
        Capability::Coding,
        &["implement", "build", "create", "develop", "code", "fix", "refactor", "feature", "api"],
    ),
    (
        Capability::Analysis,
        &["analy", "review", "audit", "investigat", "assess", "evaluat", "inspect"],
    ),
    (
        Capability::Testing,
        &["test", "verif", "validat", "qa", "coverage"],
    ),
    (
        Capability::Research,
        &["research", "explor", "compar", "survey", "study"],
    ),
    (
        Capability::Documentation,
        &["document", "docs", "readme", "guide", "explain"],
    ),
    (
        Capability::Optimization,
        &["optimi", "performance", "speed", "efficien", "latency", "scal"],
    ),
    (
        Capability::DataProcessing,
        &["data", "etl", "pipeline", "transform", "csv", "migrat", "ingest"],
    ),
];

/// First match wins on ties
const TYPE_KEYWORDS: &[(ObjectiveType, &[&str])] = &[
    (ObjectiveType::Testing, &["test", "verif", "qa"]),
    (ObjectiveType::Documentation, &["document", "docs", "readme"]),
    (ObjectiveType::Optimization, &["optimi", "performance", "speed"]),
    (ObjectiveType::Analysis, &["analy", "review", "audit", "investigat"]),
    (ObjectiveType::Research, &["research", "explor", "survey"]),
    (ObjectiveType::DataProcessing, &["data", "etl", "ingest"]),
    (
        ObjectiveType::Development,
        &["implement", "build", "create", "develop", "fix", "refactor"],
    ),
];

const COMPLEXITY_KEYWORDS: &[&str] = &[
    "complex",
    "distributed",
    "scalab",
    "integrat",
    "architect",
    "multiple",
    "system",
    "security",
    "concurren",
    "enterprise",
    "realtime",
    "end-to-end",
];

/// Words at which the length component saturates
const LENGTH_SATURATION: f64 = 50.0;
/// Complexity keyword hits at which that component saturates
const KEYWORD_SATURATION: f64 = 3.0;
/// Capabilities at which that component saturates
const CAPABILITY_SATURATION: f64 = 4.0;

const BASE_MINUTES_PER_CAPABILITY: f64 = 15.0;

/// Classifies objectives with fixed rule tables
#[derive(Debug, Clone, Default)]
pub struct ObjectiveAnalyzer;

impl ObjectiveAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, objective: &str) -> OrchestrationResult<ObjectiveAnalysis> {
        let objective = objective.trim();
        if objective.is_empty() {
            return Err(OrchestrationError::InvalidObjective(
                "objective is empty".to_string(),
            ));
        }

        let words = tokenize(objective);
        let mut keywords = BTreeSet::new();

        let mut capabilities: Vec<Capability> = CAPABILITY_KEYWORDS
            .iter()
            .filter(|(_, patterns)| {
                let hits = matches(&words, patterns);
                keywords.extend(hits.iter().cloned());
                !hits.is_empty()
            })
            .map(|(capability, _)| *capability)
            .collect();

        let objective_type = TYPE_KEYWORDS
            .iter()
            .map(|(kind, patterns)| (*kind, matches(&words, patterns).len()))
            .fold((ObjectiveType::General, 0), |best, (kind, hits)| {
                if hits > best.1 {
                    (kind, hits)
                } else {
                    best
                }
            })
            .0;

        if capabilities.is_empty() {
            capabilities.push(default_capability(objective_type));
        }

        let complexity_hits = matches(&words, COMPLEXITY_KEYWORDS);
        keywords.extend(complexity_hits.iter().cloned());

        let complexity_score = complexity_score(
            words.len(),
            complexity_hits.len(),
            capabilities.len(),
        );
        let complexity = Complexity::from_score(complexity_score);

        Ok(ObjectiveAnalysis {
            objective: objective.to_string(),
            objective_type,
            estimated_duration: estimate_duration(complexity_score, capabilities.len()),
            estimated_resources: estimate_resources(complexity_score),
            capabilities,
            complexity_score,
            complexity,
            keywords: keywords.into_iter().collect(),
        })
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '-' || c == '_'))
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Words that start with one of `patterns`, deduplicated
fn matches(words: &[String], patterns: &[&str]) -> Vec<String> {
    let mut found: Vec<String> = words
        .iter()
        .filter(|w| patterns.iter().any(|p| w.starts_with(p)))
        .cloned()
        .collect();
    found.sort();
    found.dedup();
    found
}

fn default_capability(objective_type: ObjectiveType) -> Capability {
    match objective_type {
        ObjectiveType::Testing => Capability::Testing,
        ObjectiveType::Research => Capability::Research,
        ObjectiveType::Documentation => Capability::Documentation,
        ObjectiveType::Optimization => Capability::Optimization,
        ObjectiveType::DataProcessing => Capability::DataProcessing,
        ObjectiveType::Development => Capability::Coding,
        ObjectiveType::Analysis | ObjectiveType::General => Capability::Analysis,
    }
}

/// Length 30%, complexity keywords 40%, capability count 30%
fn complexity_score(word_count: usize, keyword_hits: usize, capability_count: usize) -> f64 {
    let length = (word_count as f64 / LENGTH_SATURATION).min(1.0);
    let keywords = (keyword_hits as f64 / KEYWORD_SATURATION).min(1.0);
    let breadth = (capability_count as f64 / CAPABILITY_SATURATION).min(1.0);
    (0.3 * length + 0.4 * keywords + 0.3 * breadth).clamp(0.0, 1.0)
}

fn estimate_duration(score: f64, capability_count: usize) -> Duration {
    let minutes = BASE_MINUTES_PER_CAPABILITY * capability_count as f64 * (1.0 + 2.0 * score);
    Duration::from_secs((minutes * 60.0).round() as u64)
}

fn estimate_resources(score: f64) -> ResourceSpec {
    ResourceSpec::new(
        1.0 + score,
        512.0 * (1.0 + 3.0 * score),
        1024.0,
    )
}
