//! Deterministic rule matching
//! Mission: Priority-ordered, explainable categorization without side effects

use chrono::Utc;
use regex::RegexBuilder;
use tracing::warn;

use crate::error::{CoreError, CoreResult};
use crate::models::{
    Explainability, ExplainReason, MatchType, Rule, RuleConditions, Transaction, MAX_REGEX_LEN,
};

/// Result of one rule pass over a transaction.
#[derive(Debug, Clone)]
pub struct RuleOutcome {
    pub category_id: Option<String>,
    pub tags: Vec<String>,
    pub explainability: Explainability,
}

impl RuleOutcome {
    pub fn no_match() -> Self {
        Self {
            category_id: None,
            tags: Vec::new(),
            explainability: Explainability::no_match(),
        }
    }
}

/// Pattern shapes with catastrophic backtracking potential. Rejected at
/// rule-create time; anything that slips through is skipped at evaluation.
const REDOS_SHAPES: &[&str] = &["(.*)+", "(.+)+", "([^]+)+", "(.*)*", "(.+)*"];

/// Create-time validation for user-supplied patterns.
pub fn validate_regex_pattern(pattern: &str) -> CoreResult<()> {
    if pattern.chars().count() > MAX_REGEX_LEN {
        return Err(CoreError::Validation(format!(
            "regex exceeds {MAX_REGEX_LEN} characters"
        )));
    }
    for shape in REDOS_SHAPES {
        if pattern.contains(shape) {
            return Err(CoreError::Validation(
                "regex contains a pattern prone to catastrophic backtracking".into(),
            ));
        }
    }
    if compile_ci(pattern).is_none() {
        return Err(CoreError::Validation("regex does not compile".into()));
    }
    Ok(())
}

fn compile_ci(pattern: &str) -> Option<regex::Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .size_limit(1 << 20)
        .build()
        .ok()
}

/// Outcome of testing one rule's condition bag against a transaction.
struct ConditionMatch {
    match_type: MatchType,
    matched_value: String,
    matched_pattern: String,
}

/// Apply a condition bag in fixed order, short-circuiting on the first
/// failed gate. Every set condition must hold; the first textual condition
/// that is set decides the match type. A bag with no textual condition
/// never matches, whatever its numeric gates say.
fn match_rule(tx: &Transaction, conditions: &RuleConditions) -> Option<ConditionMatch> {
    if let Some(account_id) = &conditions.account_id {
        if account_id != &tx.account_id {
            return None;
        }
    }
    if let Some(min) = conditions.amount_min {
        if tx.amount < min {
            return None;
        }
    }
    if let Some(max) = conditions.amount_max {
        if tx.amount > max {
            return None;
        }
    }

    let merchant = tx.merchant_normalized.to_lowercase();

    if let Some(exact) = &conditions.merchant_exact {
        if merchant != exact.to_lowercase() {
            return None;
        }
    }
    if let Some(contains) = &conditions.merchant_contains {
        if !merchant.contains(&contains.to_lowercase()) {
            return None;
        }
    }
    if let Some(pattern) = &conditions.merchant_regex {
        match compile_ci(pattern) {
            Some(re) => {
                if !re.is_match(&tx.merchant_normalized) {
                    return None;
                }
            }
            None => {
                warn!("Invalid rule regex skipped: {pattern}");
                return None;
            }
        }
    }
    if let Some(needle) = &conditions.description_contains {
        if !tx
            .description
            .to_lowercase()
            .contains(&needle.to_lowercase())
        {
            return None;
        }
    }

    // All set conditions held; the first textual one names the match.
    if let Some(exact) = &conditions.merchant_exact {
        return Some(ConditionMatch {
            match_type: MatchType::Exact,
            matched_value: tx.merchant_normalized.clone(),
            matched_pattern: exact.clone(),
        });
    }
    if let Some(contains) = &conditions.merchant_contains {
        return Some(ConditionMatch {
            match_type: MatchType::Contains,
            matched_value: tx.merchant_normalized.clone(),
            matched_pattern: contains.clone(),
        });
    }
    if let Some(pattern) = &conditions.merchant_regex {
        return Some(ConditionMatch {
            match_type: MatchType::Regex,
            matched_value: tx.merchant_normalized.clone(),
            matched_pattern: pattern.clone(),
        });
    }
    if let Some(needle) = &conditions.description_contains {
        return Some(ConditionMatch {
            match_type: MatchType::Description,
            matched_value: tx.description.clone(),
            matched_pattern: needle.clone(),
        });
    }

    None
}

/// Run the owner's rules over one transaction. Pure: no store access, no
/// statistics writes. Highest priority wins; ties keep the supplied order,
/// which the store emits as creation order, so the result is stable for a
/// given rule set.
pub fn categorize_with_rules(tx: &Transaction, rules: &[Rule]) -> RuleOutcome {
    let mut candidates: Vec<&Rule> = rules.iter().filter(|r| r.enabled).collect();
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority));

    for rule in candidates {
        if let Some(m) = match_rule(tx, &rule.conditions) {
            return RuleOutcome {
                category_id: Some(rule.action.category_id.clone()),
                tags: rule.action.add_tags.clone(),
                explainability: Explainability {
                    reason: ExplainReason::RuleMatch,
                    rule_id: Some(rule.id.clone()),
                    rule_name: Some(rule.name.clone()),
                    match_type: Some(m.match_type),
                    matched_value: Some(m.matched_value),
                    matched_pattern: Some(m.matched_pattern),
                    confidence: m.match_type.confidence(),
                    timestamp: Utc::now(),
                    llm_model: None,
                    llm_reasoning: None,
                },
            };
        }
    }

    RuleOutcome::no_match()
}
