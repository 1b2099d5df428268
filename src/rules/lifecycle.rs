//! Rule lifecycle
//! Mission: Rule CRUD, reorder, and the correction-to-suggestion loop

use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::models::{
    clamp_priority, validate_tags, DismissedSuggestion, Rule, RuleAction, RuleConditions,
    RuleSource, RuleSuggestion, SuggestedRule, Transaction, DEFAULT_SUGGESTION_RULE_PRIORITY,
    DEFAULT_USER_RULE_PRIORITY, MAX_RULES_PER_OWNER, PRIORITY_MAX, PRIORITY_MIN,
};
use crate::rules::engine::validate_regex_pattern;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct CreateRuleInput {
    pub name: String,
    pub enabled: Option<bool>,
    pub priority: Option<i64>,
    pub conditions: RuleConditions,
    pub action: RuleAction,
    pub source: Option<RuleSource>,
}

/// Partial update; None leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct UpdateRuleInput {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub priority: Option<i64>,
    pub conditions: Option<RuleConditions>,
    pub action: Option<RuleAction>,
}

pub struct RuleService {
    store: Arc<Store>,
}

impl RuleService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    fn validate_conditions(conditions: &RuleConditions) -> CoreResult<()> {
        if conditions.is_empty() {
            return Err(CoreError::Validation(
                "rule requires at least one condition".into(),
            ));
        }
        if let Some(pattern) = &conditions.merchant_regex {
            validate_regex_pattern(pattern)?;
        }
        Ok(())
    }

    pub fn create_rule(&self, owner: &str, input: CreateRuleInput) -> CoreResult<Rule> {
        if self.store.count_rules(owner)? >= MAX_RULES_PER_OWNER as i64 {
            return Err(CoreError::Validation(format!(
                "rule limit of {MAX_RULES_PER_OWNER} reached"
            )));
        }
        Self::validate_conditions(&input.conditions)?;
        validate_tags(&input.action.add_tags)?;

        let source = input.source.unwrap_or(RuleSource::User);
        let default_priority = match source {
            RuleSource::Suggestion => DEFAULT_SUGGESTION_RULE_PRIORITY,
            _ => DEFAULT_USER_RULE_PRIORITY,
        };
        let priority = clamp_priority(input.priority.unwrap_or(default_priority));

        let now = Utc::now();
        let rule = Rule {
            id: Uuid::new_v4().to_string(),
            owner_id: owner.to_string(),
            name: input.name,
            enabled: input.enabled.unwrap_or(true),
            priority,
            conditions: input.conditions,
            action: input.action,
            source,
            match_count: 0,
            last_matched_at: None,
            created_at: now,
            updated_at: now,
        };
        self.store.create_rule(owner, &rule)?;
        info!("📏 Rule created: {} ({})", rule.name, rule.id);
        Ok(rule)
    }

    pub fn update_rule(&self, owner: &str, id: &str, input: UpdateRuleInput) -> CoreResult<Rule> {
        let mut rule = self.store.get_rule(owner, id)?;

        if let Some(name) = input.name {
            rule.name = name;
        }
        if let Some(enabled) = input.enabled {
            rule.enabled = enabled;
        }
        if let Some(priority) = input.priority {
            rule.priority = clamp_priority(priority);
        }
        if let Some(conditions) = input.conditions {
            Self::validate_conditions(&conditions)?;
            rule.conditions = conditions;
        }
        if let Some(action) = input.action {
            validate_tags(&action.add_tags)?;
            rule.action = action;
        }
        rule.updated_at = Utc::now();

        self.store.update_rule(owner, &rule)?;
        Ok(rule)
    }

    /// Deletion is immediate and never rewrites already-categorized
    /// transactions.
    pub fn delete_rule(&self, owner: &str, id: &str) -> CoreResult<()> {
        self.store.delete_rule(owner, id)
    }

    /// Assign priorities 1000, 999, ... down the supplied id list in one
    /// batch. Ids not listed keep their priority; the list is not required
    /// to cover every rule.
    pub fn reorder(&self, owner: &str, rule_ids: &[String]) -> CoreResult<()> {
        let assignments: Vec<(String, i64)> = rule_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), (PRIORITY_MAX - i as i64).max(PRIORITY_MIN)))
            .collect();
        self.store.set_rule_priorities(owner, &assignments)
    }

    /// Fires on any correction that changes a transaction's category.
    /// At most one suggestion per correction; suppressed when the merchant
    /// is too short, already covered by a rule, or previously dismissed.
    pub fn generate_suggestion(
        &self,
        owner: &str,
        tx: &Transaction,
        new_category_id: &str,
    ) -> CoreResult<Option<RuleSuggestion>> {
        let merchant = tx.merchant_normalized.trim();
        if merchant.chars().count() < 3 {
            return Ok(None);
        }

        let merchant_lower = merchant.to_lowercase();
        for rule in self.store.list_rules(owner)? {
            let covered = rule
                .conditions
                .merchant_exact
                .as_deref()
                .is_some_and(|m| m.to_lowercase() == merchant_lower)
                || rule
                    .conditions
                    .merchant_contains
                    .as_deref()
                    .is_some_and(|m| m.to_lowercase() == merchant_lower);
            if covered {
                return Ok(None);
            }
        }

        if self
            .store
            .dismissed_suggestion_exists(owner, merchant, new_category_id)?
        {
            return Ok(None);
        }

        Ok(Some(RuleSuggestion {
            id: Uuid::new_v4().to_string(),
            message: format!("Always categorize \"{merchant}\" this way?"),
            rule: SuggestedRule {
                name: format!("Auto: {merchant}"),
                priority: DEFAULT_SUGGESTION_RULE_PRIORITY,
                conditions: RuleConditions {
                    merchant_contains: Some(merchant.to_string()),
                    ..Default::default()
                },
                action: RuleAction {
                    category_id: new_category_id.to_string(),
                    add_tags: vec![],
                },
            },
        }))
    }

    /// Record that a (merchant, category) suggestion should never be
    /// re-offered.
    pub fn dismiss_suggestion(
        &self,
        owner: &str,
        merchant_normalized: &str,
        category_id: &str,
    ) -> CoreResult<DismissedSuggestion> {
        let dismissed = DismissedSuggestion {
            id: Uuid::new_v4().to_string(),
            owner_id: owner.to_string(),
            merchant_normalized: merchant_normalized.to_string(),
            category_id: category_id.to_string(),
            dismissed_at: Utc::now(),
        };
        self.store.insert_dismissed_suggestion(owner, &dismissed)?;
        Ok(dismissed)
    }

    /// Materialize a suggestion template into a persistent rule.
    pub fn accept_suggestion(&self, owner: &str, template: SuggestedRule) -> CoreResult<Rule> {
        self.create_rule(
            owner,
            CreateRuleInput {
                name: template.name,
                enabled: Some(true),
                priority: Some(template.priority),
                conditions: template.conditions,
                action: template.action,
                source: Some(RuleSource::Suggestion),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Explainability;
    use tempfile::NamedTempFile;

    fn service() -> (RuleService, Arc<Store>, NamedTempFile) {
        let temp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(temp.path().to_str().unwrap()).unwrap());
        (RuleService::new(store.clone()), store, temp)
    }

    fn contains_input(needle: &str, category: &str) -> CreateRuleInput {
        CreateRuleInput {
            name: format!("match {needle}"),
            enabled: None,
            priority: None,
            conditions: RuleConditions {
                merchant_contains: Some(needle.to_string()),
                ..Default::default()
            },
            action: RuleAction {
                category_id: category.to_string(),
                add_tags: vec![],
            },
            source: None,
        }
    }

    fn corrected_tx(merchant: &str) -> Transaction {
        let now = Utc::now();
        Transaction {
            id: "t1".into(),
            owner_id: "u1".into(),
            account_id: "acc1".into(),
            import_id: "imp1".into(),
            posted_at: now,
            amount: -1500,
            description: merchant.into(),
            merchant_raw: merchant.into(),
            merchant_normalized: merchant.into(),
            category_id: Some("default-dining".into()),
            auto_category: None,
            manual_override: true,
            explainability: Explainability::manual(),
            notes: None,
            tags: vec![],
            corrected_at: Some(now),
            is_split_parent: false,
            split_parent_id: None,
            receipt_line_items: None,
            tx_key: "k1".into(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn create_applies_defaults_and_clamps() {
        let (svc, _store, _tmp) = service();

        let user_rule = svc.create_rule("u1", contains_input("A", "c")).unwrap();
        assert_eq!(user_rule.priority, DEFAULT_USER_RULE_PRIORITY);
        assert!(user_rule.enabled);
        assert_eq!(user_rule.source, RuleSource::User);

        let mut clamped = contains_input("B", "c");
        clamped.priority = Some(5000);
        assert_eq!(svc.create_rule("u1", clamped).unwrap().priority, 1000);

        let mut floor = contains_input("C", "c");
        floor.priority = Some(0);
        assert_eq!(svc.create_rule("u1", floor).unwrap().priority, 1);
    }

    #[test]
    fn zero_condition_rules_rejected() {
        let (svc, _store, _tmp) = service();
        let mut input = contains_input("A", "c");
        input.conditions = RuleConditions::default();
        assert!(matches!(
            svc.create_rule("u1", input),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn rule_cap_enforced_and_restored_by_delete() {
        let (svc, _store, _tmp) = service();
        let mut last_id = String::new();
        for i in 0..MAX_RULES_PER_OWNER {
            let rule = svc
                .create_rule("u1", contains_input(&format!("M{i}"), "c"))
                .unwrap();
            last_id = rule.id;
        }
        assert!(matches!(
            svc.create_rule("u1", contains_input("OVER", "c")),
            Err(CoreError::Validation(_))
        ));

        svc.delete_rule("u1", &last_id).unwrap();
        assert!(svc.create_rule("u1", contains_input("OVER", "c")).is_ok());
    }

    #[test]
    fn invalid_regex_rejected_at_create() {
        let (svc, _store, _tmp) = service();
        let mut input = contains_input("A", "c");
        input.conditions = RuleConditions {
            merchant_regex: Some("(.*)+bad".into()),
            ..Default::default()
        };
        assert!(matches!(
            svc.create_rule("u1", input),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn partial_update_leaves_other_fields() {
        let (svc, _store, _tmp) = service();
        let rule = svc.create_rule("u1", contains_input("A", "c")).unwrap();

        let updated = svc
            .update_rule(
                "u1",
                &rule.id,
                UpdateRuleInput {
                    enabled: Some(false),
                    priority: Some(1001),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(!updated.enabled);
        assert_eq!(updated.priority, 1000);
        assert_eq!(updated.name, rule.name);
        assert_eq!(
            updated.conditions.merchant_contains.as_deref(),
            Some("A")
        );
    }

    #[test]
    fn reorder_assigns_descending_from_1000() {
        let (svc, store, _tmp) = service();
        let a = svc.create_rule("u1", contains_input("A", "c")).unwrap();
        let b = svc.create_rule("u1", contains_input("B", "c")).unwrap();
        let c = svc.create_rule("u1", contains_input("C", "c")).unwrap();

        svc.reorder("u1", &[c.id.clone(), a.id.clone()]).unwrap();

        assert_eq!(store.get_rule("u1", &c.id).unwrap().priority, 1000);
        assert_eq!(store.get_rule("u1", &a.id).unwrap().priority, 999);
        // Absent ids are untouched.
        assert_eq!(
            store.get_rule("u1", &b.id).unwrap().priority,
            DEFAULT_USER_RULE_PRIORITY
        );
    }

    #[test]
    fn suggestion_generated_then_suppressed_by_accept() {
        let (svc, _store, _tmp) = service();
        let tx = corrected_tx("CHIPOTLE");

        let suggestion = svc
            .generate_suggestion("u1", &tx, "default-dining")
            .unwrap()
            .expect("first correction should suggest");
        assert_eq!(suggestion.rule.priority, DEFAULT_SUGGESTION_RULE_PRIORITY);
        assert_eq!(
            suggestion.rule.conditions.merchant_contains.as_deref(),
            Some("CHIPOTLE")
        );
        assert_eq!(suggestion.rule.action.category_id, "default-dining");

        let rule = svc.accept_suggestion("u1", suggestion.rule).unwrap();
        assert_eq!(rule.source, RuleSource::Suggestion);

        // A rule now covers the merchant, so no further suggestion.
        assert!(svc
            .generate_suggestion("u1", &tx, "default-dining")
            .unwrap()
            .is_none());
    }

    #[test]
    fn suggestion_suppressed_after_dismissal() {
        let (svc, _store, _tmp) = service();
        let tx = corrected_tx("CHIPOTLE");

        svc.dismiss_suggestion("u1", "CHIPOTLE", "default-dining")
            .unwrap();
        assert!(svc
            .generate_suggestion("u1", &tx, "default-dining")
            .unwrap()
            .is_none());

        // A different target category is a different suggestion.
        assert!(svc
            .generate_suggestion("u1", &tx, "default-groceries")
            .unwrap()
            .is_some());
    }

    #[test]
    fn short_merchants_never_suggest() {
        let (svc, _store, _tmp) = service();
        let tx = corrected_tx("AB");
        assert!(svc
            .generate_suggestion("u1", &tx, "default-dining")
            .unwrap()
            .is_none());
    }
}
