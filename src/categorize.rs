//! Categorization orchestrator
//! Mission: Rules first, classifier second, confidence-gated in between

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::CoreResult;
use crate::llm::{CategoryChoice, ClassifyInput, ClassifyOutcome, LlmClient};
use crate::models::{
    AutoCategory, Explainability, ExplainReason, Rule, Transaction,
};
use crate::rules::{categorize_with_rules, RuleOutcome};
use crate::store::Store;

/// Rule matches at or above this confidence short-circuit the classifier.
pub const CONFIDENCE_GATE: f64 = 0.7;

/// One categorization decision, ready to be applied to a transaction.
#[derive(Debug, Clone)]
pub struct Categorization {
    pub category_id: Option<String>,
    pub tags: Vec<String>,
    pub explainability: Explainability,
}

impl From<RuleOutcome> for Categorization {
    fn from(outcome: RuleOutcome) -> Self {
        Self {
            category_id: outcome.category_id,
            tags: outcome.tags,
            explainability: outcome.explainability,
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecategorizeOutcome {
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
}

pub struct Orchestrator {
    store: Arc<Store>,
    llm: Arc<LlmClient>,
    llm_enabled: bool,
}

impl Orchestrator {
    pub fn new(store: Arc<Store>, llm: Arc<LlmClient>, llm_enabled: bool) -> Self {
        Self {
            store,
            llm,
            llm_enabled,
        }
    }

    fn category_choices(&self, owner: &str) -> CoreResult<Vec<CategoryChoice>> {
        Ok(self
            .store
            .list_categories(owner)?
            .into_iter()
            .filter(|c| !c.is_hidden)
            .map(|c| CategoryChoice {
                id: c.id,
                name: c.name,
            })
            .collect())
    }

    /// Best-effort match statistics, off the request path.
    fn bump_stats_async(&self, owner: &str, rule_id: &str) {
        let store = self.store.clone();
        let owner = owner.to_string();
        let rule_id = rule_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.bump_rule_stats(&owner, &rule_id) {
                debug!("Rule stat bump dropped: {e}");
            }
        });
    }

    fn accept_rule_outcome(&self, owner: &str, outcome: &RuleOutcome) -> bool {
        let accepted = outcome.category_id.is_some()
            && outcome.explainability.confidence >= CONFIDENCE_GATE;
        if accepted {
            if let Some(rule_id) = &outcome.explainability.rule_id {
                self.bump_stats_async(owner, rule_id);
            }
        }
        accepted
    }

    fn merge_llm_outcome(rule_outcome: RuleOutcome, llm_outcome: ClassifyOutcome) -> Categorization {
        // A provider failure is signalled by the absent model name; degrade
        // to whatever the rule pass already produced.
        if llm_outcome.model.is_none() {
            return rule_outcome.into();
        }

        if let Some(category_id) = llm_outcome.category_id {
            return Categorization {
                category_id: Some(category_id),
                tags: Vec::new(),
                explainability: Explainability {
                    reason: ExplainReason::Llm,
                    confidence: llm_outcome.confidence,
                    timestamp: Utc::now(),
                    llm_model: llm_outcome.model,
                    llm_reasoning: Some(llm_outcome.reasoning),
                    ..Explainability::no_match()
                },
            };
        }

        // The classifier answered "no idea"; keep its reasoning on record.
        Categorization {
            category_id: None,
            tags: Vec::new(),
            explainability: Explainability {
                llm_reasoning: Some(llm_outcome.reasoning),
                ..Explainability::no_match()
            },
        }
    }

    async fn categorize_with(
        &self,
        owner: &str,
        tx: &Transaction,
        rules: &[Rule],
        categories: &[CategoryChoice],
    ) -> Categorization {
        let rule_outcome = categorize_with_rules(tx, rules);
        if self.accept_rule_outcome(owner, &rule_outcome) {
            return rule_outcome.into();
        }
        if !self.llm_enabled {
            // Rule result as-is, possibly a plain no-match.
            return rule_outcome.into();
        }

        let llm_outcome = self
            .llm
            .classify_transaction(
                &ClassifyInput {
                    description: tx.description.clone(),
                    merchant_raw: tx.merchant_raw.clone(),
                    amount: tx.amount,
                },
                categories,
            )
            .await;
        Self::merge_llm_outcome(rule_outcome, llm_outcome)
    }

    /// Single-transaction flow with a per-call rule cache.
    pub async fn categorize_one(&self, owner: &str, tx: &Transaction) -> CoreResult<Categorization> {
        let rules = self.store.list_enabled_rules(owner)?;
        let categories = if self.llm_enabled {
            self.category_choices(owner)?
        } else {
            Vec::new()
        };
        Ok(self.categorize_with(owner, tx, &rules, &categories).await)
    }

    /// Batch flow: rule pass over everything, then one bounded-concurrency
    /// classifier sweep over the entries that failed the confidence gate.
    /// Results are keyed by transaction id; no input order is promised.
    pub async fn categorize_batch(
        &self,
        owner: &str,
        txs: &[Transaction],
    ) -> CoreResult<HashMap<String, Categorization>> {
        let rules = self.store.list_enabled_rules(owner)?;
        let mut results: HashMap<String, Categorization> = HashMap::with_capacity(txs.len());
        let mut second_pass: Vec<(String, RuleOutcome)> = Vec::new();

        for tx in txs {
            let outcome = categorize_with_rules(tx, &rules);
            if self.accept_rule_outcome(owner, &outcome) {
                results.insert(tx.id.clone(), outcome.into());
            } else {
                second_pass.push((tx.id.clone(), outcome));
            }
        }

        if !self.llm_enabled || second_pass.is_empty() {
            for (id, outcome) in second_pass {
                results.insert(id, outcome.into());
            }
            return Ok(results);
        }

        let categories = self.category_choices(owner)?;
        let by_id: HashMap<&str, &Transaction> =
            txs.iter().map(|t| (t.id.as_str(), t)).collect();
        let items: Vec<(String, ClassifyInput)> = second_pass
            .iter()
            .filter_map(|(id, _)| {
                by_id.get(id.as_str()).map(|tx| {
                    (
                        id.clone(),
                        ClassifyInput {
                            description: tx.description.clone(),
                            merchant_raw: tx.merchant_raw.clone(),
                            amount: tx.amount,
                        },
                    )
                })
            })
            .collect();

        let mut llm_results = self.llm.classify_batch(items, &categories).await;
        for (id, rule_outcome) in second_pass {
            let merged = match llm_results.remove(&id) {
                Some(llm_outcome) => Self::merge_llm_outcome(rule_outcome, llm_outcome),
                None => rule_outcome.into(),
            };
            results.insert(id, merged);
        }
        Ok(results)
    }

    /// Re-run categorization over a set of transactions. Manual overrides
    /// are skipped unless explicitly included; each row fails on its own
    /// and never the scan.
    pub async fn recategorize(
        &self,
        owner: &str,
        transaction_ids: &[String],
        include_manual_overrides: bool,
    ) -> CoreResult<RecategorizeOutcome> {
        let txs = self.store.list_transactions_by_ids(owner, transaction_ids)?;
        let rules = self.store.list_enabled_rules(owner)?;
        let categories = if self.llm_enabled {
            self.category_choices(owner)?
        } else {
            Vec::new()
        };

        let mut outcome = RecategorizeOutcome::default();
        for mut tx in txs {
            if tx.manual_override && !include_manual_overrides {
                outcome.skipped += 1;
                continue;
            }

            let decision = self.categorize_with(owner, &tx, &rules, &categories).await;
            if decision.category_id == tx.category_id {
                outcome.skipped += 1;
                continue;
            }

            tx.category_id = decision.category_id.clone();
            tx.auto_category = Some(AutoCategory {
                category_id: decision.category_id,
                explainability: decision.explainability.clone(),
            });
            tx.explainability = decision.explainability;
            tx.updated_at = Utc::now();

            match self.store.update_transaction(owner, &tx) {
                Ok(()) => outcome.updated += 1,
                Err(e) => {
                    warn!("Recategorization failed for {}: {e}", tx.id);
                    outcome.errors += 1;
                }
            }
        }
        Ok(outcome)
    }
}
