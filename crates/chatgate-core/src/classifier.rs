//! Task classification: an ordered table of keyword rules, first match wins.

use crate::config::RoutingConfig;
use crate::types::TaskType;

/// One routing rule. A message matches when it contains any `any_of` term,
/// plus any `and_any_of` term (if non-empty), and none of `none_of`.
struct Rule {
    name: &'static str,
    any_of: &'static [&'static str],
    and_any_of: &'static [&'static str],
    none_of: &'static [&'static str],
    outcome: TaskType,
}

const RESEARCH_INTENT: &[&str] = &[
    "研究一下",
    "研究",
    "调研",
    "调查报告",
    "分析报告",
    "研究报告",
    "research",
    "investigate",
    "study",
    "analysis report",
];

const ANALYSIS_TERMS: &[&str] = &["分析", "analyze", "analysis"];

const DATASET_TERMS: &[&str] = &["数据", "data", "表格", "table", "csv", "excel"];

const COURTESY_TERMS: &[&str] = &["帮我", "请", "可以", "能", "help", "please", "can"];

const DATA_DOMAIN: &[&str] = &[
    "数据",
    "表格",
    "图表",
    "可视化",
    "csv",
    "excel",
    "数据分析",
    "统计",
    "data",
    "table",
    "chart",
    "visualization",
    "statistics",
    "statistical",
];

const RULES: &[Rule] = &[
    Rule {
        name: "research-intent",
        any_of: RESEARCH_INTENT,
        and_any_of: &[],
        none_of: &[],
        outcome: TaskType::Research,
    },
    Rule {
        name: "analysis-of-dataset",
        any_of: ANALYSIS_TERMS,
        and_any_of: DATASET_TERMS,
        none_of: &[],
        outcome: TaskType::Data,
    },
    Rule {
        name: "bare-analysis",
        any_of: ANALYSIS_TERMS,
        and_any_of: &[],
        none_of: COURTESY_TERMS,
        outcome: TaskType::Research,
    },
    Rule {
        name: "data-domain",
        any_of: DATA_DOMAIN,
        and_any_of: &[],
        none_of: &[],
        outcome: TaskType::Data,
    },
];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

impl Rule {
    fn matches(&self, lowered: &str) -> bool {
        contains_any(lowered, self.any_of)
            && (self.and_any_of.is_empty() || contains_any(lowered, self.and_any_of))
            && !contains_any(lowered, self.none_of)
    }
}

/// Detect the task type from message text alone. Never returns `Auto`.
pub fn detect(message: &str) -> TaskType {
    let lowered = message.to_lowercase();
    match RULES.iter().find(|rule| rule.matches(&lowered)) {
        Some(rule) => {
            tracing::debug!(
                target: "chatgate::classifier",
                rule = rule.name,
                outcome = rule.outcome.as_str(),
                "task rule matched"
            );
            rule.outcome
        }
        None => TaskType::General,
    }
}

/// Resolve the provider task type for a request. An explicit override wins
/// unconditionally; otherwise detection applies subject to routing toggles.
pub fn classify(message: &str, requested: TaskType, routing: &RoutingConfig) -> TaskType {
    if requested != TaskType::Auto {
        return requested;
    }
    if !routing.auto_route {
        return TaskType::General;
    }
    match detect(message) {
        TaskType::Research if !routing.research_enabled => TaskType::General,
        TaskType::Data if !routing.data_enabled => TaskType::General,
        other => other,
    }
}
