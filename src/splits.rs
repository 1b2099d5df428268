//! Split/unsplit protocol
//! Mission: Divide a transaction into sibling records without ever showing
//! partial state

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::models::{
    validate_notes, AutoCategory, Cents, Explainability, Transaction, MAX_SPLITS, MIN_SPLITS,
};
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct SplitInput {
    pub amount: Cents,
    pub category_id: Option<String>,
    pub notes: Option<String>,
}

pub struct SplitService {
    store: Arc<Store>,
}

impl SplitService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Split a parent into `splits.len()` children inside one store
    /// transaction. The parent flips to hidden split-parent state and each
    /// child inherits its account, import, date and merchant.
    pub fn split(
        &self,
        owner: &str,
        parent_id: &str,
        splits: &[SplitInput],
    ) -> CoreResult<Vec<Transaction>> {
        if splits.len() < MIN_SPLITS || splits.len() > MAX_SPLITS {
            return Err(CoreError::Validation(format!(
                "split count must be between {MIN_SPLITS} and {MAX_SPLITS}"
            )));
        }
        for split in splits {
            if let Some(notes) = &split.notes {
                validate_notes(notes)?;
            }
            if let Some(category_id) = &split.category_id {
                if !self.store.category_exists(owner, category_id)? {
                    return Err(CoreError::Validation(format!(
                        "unknown category: {category_id}"
                    )));
                }
            }
        }

        // Validation against the parent re-runs inside the transaction so a
        // racing split cannot slip between check and commit.
        self.store.run_in_transaction(|conn| {
            let parent = Store::get_transaction_conn(conn, owner, parent_id)?;

            if parent.is_split_parent {
                return Err(CoreError::Conflict("transaction is already split".into()));
            }
            if parent.split_parent_id.is_some() {
                return Err(CoreError::Validation(
                    "cannot split a split child".into(),
                ));
            }

            let sum: Cents = splits.iter().map(|s| s.amount).sum();
            if sum != parent.amount {
                return Err(CoreError::Validation(format!(
                    "split amounts sum to {sum}, parent is {}",
                    parent.amount
                )));
            }
            let parent_sign = parent.amount.signum();
            if splits
                .iter()
                .any(|s| s.amount == 0 || s.amount.signum() != parent_sign)
            {
                return Err(CoreError::Validation(
                    "every split must carry the parent's sign".into(),
                ));
            }

            Store::set_split_parent_conn(conn, owner, parent_id, true)?;

            let total = splits.len();
            let now = Utc::now();
            let mut children = Vec::with_capacity(total);
            for (i, split) in splits.iter().enumerate() {
                let index = i + 1;
                let manual = split.category_id.is_some();
                let explainability = Explainability::split();
                let child = Transaction {
                    id: Uuid::new_v4().to_string(),
                    owner_id: parent.owner_id.clone(),
                    account_id: parent.account_id.clone(),
                    import_id: parent.import_id.clone(),
                    posted_at: parent.posted_at,
                    amount: split.amount,
                    description: format!("{} (Split {index}/{total})", parent.description),
                    merchant_raw: parent.merchant_raw.clone(),
                    merchant_normalized: parent.merchant_normalized.clone(),
                    category_id: split.category_id.clone(),
                    auto_category: manual.then(|| AutoCategory {
                        category_id: None,
                        explainability: explainability.clone(),
                    }),
                    manual_override: manual,
                    explainability,
                    notes: split.notes.clone(),
                    tags: Vec::new(),
                    corrected_at: None,
                    is_split_parent: false,
                    split_parent_id: Some(parent.id.clone()),
                    receipt_line_items: None,
                    tx_key: format!("{}_split_{index}", parent.tx_key),
                    created_at: now,
                    updated_at: now,
                };
                Store::insert_transaction_conn(conn, &child)?;
                children.push(child);
            }
            Ok(children)
        })
    }

    /// Delete every child and restore the parent's visibility in one
    /// transaction. Returns the number of deleted children.
    pub fn unsplit(&self, owner: &str, parent_id: &str) -> CoreResult<usize> {
        self.store.run_in_transaction(|conn| {
            let parent = Store::get_transaction_conn(conn, owner, parent_id)?;
            if !parent.is_split_parent {
                return Err(CoreError::Validation(
                    "transaction is not a split parent".into(),
                ));
            }
            let deleted = Store::delete_split_children_conn(conn, owner, parent_id)?;
            Store::set_split_parent_conn(conn, owner, parent_id, false)?;
            Ok(deleted)
        })
    }

    pub fn children(&self, owner: &str, parent_id: &str) -> CoreResult<Vec<Transaction>> {
        // Ownership check rides on the parent lookup.
        let parent = self.store.get_transaction(owner, parent_id)?;
        self.store.split_children(owner, &parent.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Account, AccountType, ExplainReason};
    use crate::store::TransactionFilter;
    use tempfile::NamedTempFile;

    fn service() -> (SplitService, Arc<Store>, NamedTempFile) {
        let temp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(temp.path().to_str().unwrap()).unwrap());
        (SplitService::new(store.clone()), store, temp)
    }

    fn seed_parent(store: &Store, amount: Cents) -> Transaction {
        let now = Utc::now();
        let account = Account {
            id: "acc1".into(),
            owner_id: "u1".into(),
            name: "Chequing".into(),
            account_type: AccountType::Checking,
            institution: None,
            last_four: None,
            created_at: now,
            updated_at: now,
        };
        let _ = store.create_account("u1", &account);

        let tx = Transaction {
            id: Uuid::new_v4().to_string(),
            owner_id: "u1".into(),
            account_id: "acc1".into(),
            import_id: "imp1".into(),
            posted_at: now,
            amount,
            description: "BIG BOX RUN".into(),
            merchant_raw: "BIG BOX".into(),
            merchant_normalized: "BIG BOX".into(),
            category_id: None,
            auto_category: None,
            manual_override: false,
            explainability: Explainability::no_match(),
            notes: None,
            tags: vec![],
            corrected_at: None,
            is_split_parent: false,
            split_parent_id: None,
            receipt_line_items: None,
            tx_key: format!("key-{}", Uuid::new_v4()),
            created_at: now,
            updated_at: now,
        };
        store.insert_transaction("u1", &tx).unwrap();
        tx
    }

    fn amounts(values: &[Cents]) -> Vec<SplitInput> {
        values
            .iter()
            .map(|&amount| SplitInput {
                amount,
                category_id: None,
                notes: None,
            })
            .collect()
    }

    #[test]
    fn split_preserves_sum_and_hides_parent() {
        let (svc, store, _tmp) = service();
        let parent = seed_parent(&store, -10_000);

        let children = svc
            .split("u1", &parent.id, &amounts(&[-4000, -3500, -2500]))
            .unwrap();
        assert_eq!(children.len(), 3);
        assert_eq!(children.iter().map(|c| c.amount).sum::<Cents>(), -10_000);
        assert!(children
            .iter()
            .all(|c| c.split_parent_id.as_deref() == Some(parent.id.as_str())));
        assert_eq!(children[0].description, "BIG BOX RUN (Split 1/3)");
        assert_eq!(children[2].tx_key, format!("{}_split_3", parent.tx_key));
        assert!(children
            .iter()
            .all(|c| c.explainability.reason == ExplainReason::Split
                && c.explainability.confidence == 1.0));

        // The parent is now hidden; only children list.
        let page = store
            .list_transactions("u1", &TransactionFilter::default(), None, 50)
            .unwrap();
        assert_eq!(page.items.len(), 3);
        assert!(page.items.iter().all(|t| t.split_parent_id.is_some()));
    }

    #[test]
    fn manual_override_set_only_with_category() {
        let (svc, store, _tmp) = service();
        let parent = seed_parent(&store, -6000);

        let splits = vec![
            SplitInput {
                amount: -4000,
                category_id: Some("default-groceries".into()),
                notes: None,
            },
            SplitInput {
                amount: -2000,
                category_id: None,
                notes: Some("snacks".into()),
            },
        ];
        let children = svc.split("u1", &parent.id, &splits).unwrap();
        assert!(children[0].manual_override);
        assert!(children[0].auto_category.is_some());
        assert!(!children[1].manual_override);
        assert_eq!(children[1].notes.as_deref(), Some("snacks"));
    }

    #[test]
    fn sum_mismatch_rejected_without_side_effects() {
        let (svc, store, _tmp) = service();
        let parent = seed_parent(&store, -10_000);

        let err = svc
            .split("u1", &parent.id, &amounts(&[-4000, -3000]))
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));

        // No partial state: parent untouched, no children.
        let reloaded = store.get_transaction("u1", &parent.id).unwrap();
        assert!(!reloaded.is_split_parent);
        assert!(store.split_children("u1", &parent.id).unwrap().is_empty());
    }

    #[test]
    fn sign_mismatch_rejected() {
        let (svc, store, _tmp) = service();
        let parent = seed_parent(&store, -5000);
        let err = svc
            .split("u1", &parent.id, &amounts(&[-6000, 1000]))
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn arity_bounds_enforced() {
        let (svc, store, _tmp) = service();
        let parent = seed_parent(&store, -11_000);

        assert!(svc
            .split("u1", &parent.id, &amounts(&[-11_000]))
            .is_err());
        let eleven: Vec<Cents> = vec![-1000; 11];
        assert!(svc.split("u1", &parent.id, &amounts(&eleven)).is_err());
    }

    #[test]
    fn double_split_conflicts_and_child_split_rejected() {
        let (svc, store, _tmp) = service();
        let parent = seed_parent(&store, -10_000);
        let children = svc
            .split("u1", &parent.id, &amounts(&[-5000, -5000]))
            .unwrap();

        assert!(matches!(
            svc.split("u1", &parent.id, &amounts(&[-5000, -5000])),
            Err(CoreError::Conflict(_))
        ));
        assert!(matches!(
            svc.split("u1", &children[0].id, &amounts(&[-2500, -2500])),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn unsplit_restores_parent_and_reports_count() {
        let (svc, store, _tmp) = service();
        let parent = seed_parent(&store, -10_000);
        svc.split("u1", &parent.id, &amounts(&[-4000, -3500, -2500]))
            .unwrap();

        let deleted = svc.unsplit("u1", &parent.id).unwrap();
        assert_eq!(deleted, 3);

        let restored = store.get_transaction("u1", &parent.id).unwrap();
        assert!(!restored.is_split_parent);
        assert_eq!(restored.amount, parent.amount);
        assert_eq!(restored.tx_key, parent.tx_key);

        let page = store
            .list_transactions("u1", &TransactionFilter::default(), None, 50)
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id, parent.id);

        // Not a split parent anymore.
        assert!(matches!(
            svc.unsplit("u1", &parent.id),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn split_then_unsplit_allows_resplit() {
        let (svc, store, _tmp) = service();
        let parent = seed_parent(&store, -9000);
        svc.split("u1", &parent.id, &amounts(&[-4500, -4500]))
            .unwrap();
        svc.unsplit("u1", &parent.id).unwrap();
        // txKey uniqueness holds because the old children are gone.
        let children = svc
            .split("u1", &parent.id, &amounts(&[-3000, -3000, -3000]))
            .unwrap();
        assert_eq!(children.len(), 3);
    }
}
