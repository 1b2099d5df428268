//! Monthly aggregation read-path
//! Mission: Deterministic in-memory reductions that drive the dashboards
//!
//! Repeated calls against a frozen data set yield byte-equal outputs:
//! every sort order is total and the uncategorized bucket has a fixed
//! position among ties.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{CoreError, CoreResult};
use crate::models::{Cents, Transaction};
use crate::store::Store;

/// Expense merchants reported per month.
const TOP_MERCHANTS: usize = 10;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryBreakdown {
    /// None is the Uncategorized bucket.
    pub category_id: Option<String>,
    pub amount: Cents,
    pub count: usize,
    /// Share of total expenses, 0..=100.
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MerchantBreakdown {
    pub merchant: String,
    pub amount: Cents,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailySummary {
    pub date: String,
    pub income: Cents,
    pub expenses: Cents,
    pub net: Cents,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyOverview {
    pub month: String,
    pub total_income: Cents,
    pub total_expenses: Cents,
    pub net: Cents,
    pub transaction_count: usize,
    pub categorized_count: usize,
    pub uncategorized_count: usize,
    pub manual_override_count: usize,
    pub categories: Vec<CategoryBreakdown>,
    pub merchants: Vec<MerchantBreakdown>,
    pub daily: Vec<DailySummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendingTrend {
    pub month: String,
    pub previous_month: String,
    pub current: MonthlyOverview,
    pub previous: MonthlyOverview,
    /// Percent changes; null whenever the prior base is zero.
    pub income_change: Option<f64>,
    pub expenses_change: Option<f64>,
    pub net_change: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSummary {
    pub account_id: String,
    pub account_name: Option<String>,
    pub income: Cents,
    pub expenses: Cents,
    pub net: Cents,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthCategories {
    pub month: String,
    pub categories: Vec<CategoryBreakdown>,
}

/// Inclusive instant range `[first second, last second]` of a YYYY-MM month.
pub fn month_range(month: &str) -> CoreResult<(DateTime<Utc>, DateTime<Utc>)> {
    let first = NaiveDate::parse_from_str(&format!("{month}-01"), "%Y-%m-%d")
        .map_err(|_| CoreError::Validation(format!("month must be YYYY-MM, got {month:?}")))?;
    let next_month = if first.month() == 12 {
        NaiveDate::from_ymd_opt(first.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(first.year(), first.month() + 1, 1)
    }
    .ok_or_else(|| CoreError::Validation(format!("month out of range: {month:?}")))?;

    let start = first
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| CoreError::Internal("month start".into()))?
        .and_utc();
    let end = next_month
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| CoreError::Internal("month end".into()))?
        .and_utc()
        - Duration::seconds(1);
    Ok((start, end))
}

/// YYYY-MM immediately before the given month.
pub fn previous_month(month: &str) -> CoreResult<String> {
    let (start, _) = month_range(month)?;
    let prev_end = start - Duration::seconds(1);
    Ok(prev_end.format("%Y-%m").to_string())
}

fn percent_change(current: Cents, previous: Cents) -> Option<f64> {
    if previous == 0 {
        return None;
    }
    Some(((current - previous) as f64 / previous.abs() as f64) * 100.0)
}

/// Single-pass reduction over one month of transactions.
fn reduce_month(month: &str, start: DateTime<Utc>, txs: &[Transaction]) -> MonthlyOverview {
    let mut total_income: Cents = 0;
    let mut total_expenses: Cents = 0;
    let mut categorized_count = 0usize;
    let mut uncategorized_count = 0usize;
    let mut manual_override_count = 0usize;

    let mut category_amounts: HashMap<Option<String>, (Cents, usize)> = HashMap::new();
    let mut merchant_amounts: HashMap<String, (Cents, usize)> = HashMap::new();
    let mut day_buckets: HashMap<String, (Cents, Cents, usize)> = HashMap::new();

    for tx in txs {
        if tx.amount > 0 {
            total_income += tx.amount;
        } else {
            total_expenses += tx.amount;
        }
        if tx.category_id.is_some() {
            categorized_count += 1;
        } else {
            uncategorized_count += 1;
        }
        if tx.manual_override {
            manual_override_count += 1;
        }

        // Expense-only breakdowns.
        if tx.amount < 0 {
            let cat = category_amounts.entry(tx.category_id.clone()).or_default();
            cat.0 += tx.amount;
            cat.1 += 1;
            let merchant = merchant_amounts
                .entry(tx.merchant_normalized.clone())
                .or_default();
            merchant.0 += tx.amount;
            merchant.1 += 1;
        }

        let day = tx.posted_at.format("%Y-%m-%d").to_string();
        let bucket = day_buckets.entry(day).or_default();
        if tx.amount > 0 {
            bucket.0 += tx.amount;
        } else {
            bucket.1 += tx.amount;
        }
        bucket.2 += 1;
    }

    let expense_abs = total_expenses.unsigned_abs() as f64;
    let mut categories: Vec<CategoryBreakdown> = category_amounts
        .into_iter()
        .map(|(category_id, (amount, count))| CategoryBreakdown {
            category_id,
            amount,
            count,
            percentage: if expense_abs > 0.0 {
                (amount.unsigned_abs() as f64 / expense_abs) * 100.0
            } else {
                0.0
            },
        })
        .collect();
    // Largest expense first; ties resolve by id with Uncategorized last.
    categories.sort_by(|a, b| {
        a.amount.cmp(&b.amount).then_with(|| {
            match (&a.category_id, &b.category_id) {
                (Some(x), Some(y)) => x.cmp(y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            }
        })
    });

    let mut merchants: Vec<MerchantBreakdown> = merchant_amounts
        .into_iter()
        .map(|(merchant, (amount, count))| MerchantBreakdown {
            merchant,
            amount,
            count,
        })
        .collect();
    merchants.sort_by(|a, b| {
        a.amount
            .cmp(&b.amount)
            .then_with(|| a.merchant.cmp(&b.merchant))
    });
    merchants.truncate(TOP_MERCHANTS);

    // Zero-filled per-day series covering the whole month.
    let mut daily = Vec::new();
    let mut day = start.date_naive();
    while day.format("%Y-%m").to_string() == month {
        let key = day.format("%Y-%m-%d").to_string();
        let (income, expenses, count) = day_buckets.get(&key).copied().unwrap_or_default();
        daily.push(DailySummary {
            date: key,
            income,
            expenses,
            net: income + expenses,
            count,
        });
        day += Duration::days(1);
    }

    MonthlyOverview {
        month: month.to_string(),
        total_income,
        total_expenses,
        net: total_income + total_expenses,
        transaction_count: txs.len(),
        categorized_count,
        uncategorized_count,
        manual_override_count,
        categories,
        merchants,
        daily,
    }
}

pub struct AnalyticsService {
    store: Arc<Store>,
}

impl AnalyticsService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn monthly_overview(&self, owner: &str, month: &str) -> CoreResult<MonthlyOverview> {
        let (start, end) = month_range(month)?;
        let txs = self.store.transactions_in_range(owner, start, end)?;
        Ok(reduce_month(month, start, &txs))
    }

    /// Current month alongside the previous one, with percent changes that
    /// go null whenever the prior base is zero.
    pub fn spending_trend(&self, owner: &str, month: &str) -> CoreResult<SpendingTrend> {
        let prev = previous_month(month)?;
        let current = self.monthly_overview(owner, month)?;
        let previous = self.monthly_overview(owner, &prev)?;

        Ok(SpendingTrend {
            month: month.to_string(),
            previous_month: prev,
            income_change: percent_change(current.total_income, previous.total_income),
            expenses_change: percent_change(current.total_expenses, previous.total_expenses),
            net_change: percent_change(current.net, previous.net),
            current,
            previous,
        })
    }

    /// Category breakdowns for an explicit list of months.
    pub fn categories_over_months(
        &self,
        owner: &str,
        months: &[String],
    ) -> CoreResult<Vec<MonthCategories>> {
        months
            .iter()
            .map(|month| {
                let overview = self.monthly_overview(owner, month)?;
                Ok(MonthCategories {
                    month: month.clone(),
                    categories: overview.categories,
                })
            })
            .collect()
    }

    /// Per-account rollup for one month, every account listed even when
    /// silent that month.
    pub fn accounts_overview(&self, owner: &str, month: &str) -> CoreResult<Vec<AccountSummary>> {
        let (start, end) = month_range(month)?;
        let txs = self.store.transactions_in_range(owner, start, end)?;
        let accounts = self.store.list_accounts(owner)?;

        let mut buckets: HashMap<String, (Cents, Cents, usize)> = HashMap::new();
        for tx in &txs {
            let bucket = buckets.entry(tx.account_id.clone()).or_default();
            if tx.amount > 0 {
                bucket.0 += tx.amount;
            } else {
                bucket.1 += tx.amount;
            }
            bucket.2 += 1;
        }

        let mut summaries: Vec<AccountSummary> = accounts
            .into_iter()
            .map(|account| {
                let (income, expenses, count) =
                    buckets.remove(&account.id).unwrap_or_default();
                AccountSummary {
                    account_id: account.id,
                    account_name: Some(account.name),
                    income,
                    expenses,
                    net: income + expenses,
                    count,
                }
            })
            .collect();
        // Transactions referencing accounts that vanished still count.
        let mut orphans: Vec<AccountSummary> = buckets
            .into_iter()
            .map(|(account_id, (income, expenses, count))| AccountSummary {
                account_id,
                account_name: None,
                income,
                expenses,
                net: income + expenses,
                count,
            })
            .collect();
        orphans.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        summaries.extend(orphans);
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Explainability;
    use chrono::TimeZone;
    use tempfile::NamedTempFile;
    use uuid::Uuid;

    fn service() -> (AnalyticsService, Arc<Store>, NamedTempFile) {
        let temp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(temp.path().to_str().unwrap()).unwrap());
        (AnalyticsService::new(store.clone()), store, temp)
    }

    fn seed_tx(
        store: &Store,
        day: u32,
        amount: Cents,
        merchant: &str,
        category: Option<&str>,
        manual: bool,
    ) {
        let posted = Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap();
        let now = Utc::now();
        let tx = Transaction {
            id: Uuid::new_v4().to_string(),
            owner_id: "u1".into(),
            account_id: "acc1".into(),
            import_id: "imp1".into(),
            posted_at: posted,
            amount,
            description: merchant.into(),
            merchant_raw: merchant.into(),
            merchant_normalized: merchant.into(),
            category_id: category.map(str::to_string),
            auto_category: None,
            manual_override: manual,
            explainability: Explainability::no_match(),
            notes: None,
            tags: vec![],
            corrected_at: None,
            is_split_parent: false,
            split_parent_id: None,
            receipt_line_items: None,
            tx_key: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
        };
        store.insert_transaction("u1", &tx).unwrap();
    }

    #[test]
    fn month_range_bounds() {
        let (start, end) = month_range("2024-02").unwrap();
        assert_eq!(start.to_rfc3339(), "2024-02-01T00:00:00+00:00");
        // 2024 is a leap year.
        assert_eq!(end.to_rfc3339(), "2024-02-29T23:59:59+00:00");

        let (start, end) = month_range("2023-12").unwrap();
        assert_eq!(start.to_rfc3339(), "2023-12-01T00:00:00+00:00");
        assert_eq!(end.to_rfc3339(), "2023-12-31T23:59:59+00:00");

        assert!(month_range("2024-13").is_err());
        assert!(month_range("march").is_err());
    }

    #[test]
    fn previous_month_rolls_over_years() {
        assert_eq!(previous_month("2024-03").unwrap(), "2024-02");
        assert_eq!(previous_month("2024-01").unwrap(), "2023-12");
    }

    #[test]
    fn overview_totals_and_counts() {
        let (svc, store, _tmp) = service();
        seed_tx(&store, 5, -5000, "COFFEE SHOP", Some("default-dining"), false);
        seed_tx(&store, 5, -3000, "COFFEE SHOP", Some("default-dining"), true);
        seed_tx(&store, 10, -2000, "GROCER", None, false);
        seed_tx(&store, 15, 100_000, "EMPLOYER", Some("default-income"), false);

        let overview = svc.monthly_overview("u1", "2024-03").unwrap();
        assert_eq!(overview.total_income, 100_000);
        assert_eq!(overview.total_expenses, -10_000);
        assert_eq!(overview.net, 90_000);
        assert_eq!(overview.transaction_count, 4);
        assert_eq!(overview.categorized_count, 3);
        assert_eq!(overview.uncategorized_count, 1);
        assert_eq!(overview.manual_override_count, 1);

        // Category breakdown is expense-only with an uncategorized bucket.
        assert_eq!(overview.categories.len(), 2);
        assert_eq!(
            overview.categories[0].category_id.as_deref(),
            Some("default-dining")
        );
        assert_eq!(overview.categories[0].amount, -8000);
        assert!((overview.categories[0].percentage - 80.0).abs() < 1e-9);
        assert_eq!(overview.categories[1].category_id, None);
        assert!((overview.categories[1].percentage - 20.0).abs() < 1e-9);

        // Merchants: expenses only, biggest first.
        assert_eq!(overview.merchants[0].merchant, "COFFEE SHOP");
        assert_eq!(overview.merchants[0].amount, -8000);
        assert!(!overview
            .merchants
            .iter()
            .any(|m| m.merchant == "EMPLOYER"));
    }

    #[test]
    fn daily_series_zero_filled() {
        let (svc, store, _tmp) = service();
        seed_tx(&store, 5, -5000, "SHOP", None, false);

        let overview = svc.monthly_overview("u1", "2024-03").unwrap();
        assert_eq!(overview.daily.len(), 31);
        assert_eq!(overview.daily[0].date, "2024-03-01");
        assert_eq!(overview.daily[0].count, 0);
        assert_eq!(overview.daily[4].date, "2024-03-05");
        assert_eq!(overview.daily[4].expenses, -5000);
        assert_eq!(overview.daily[4].net, -5000);
        assert_eq!(overview.daily[30].date, "2024-03-31");
    }

    #[test]
    fn overview_is_deterministic() {
        let (svc, store, _tmp) = service();
        // Equal amounts force the tie-break paths.
        seed_tx(&store, 1, -1000, "ALPHA", Some("b-cat"), false);
        seed_tx(&store, 2, -1000, "BETA", Some("a-cat"), false);
        seed_tx(&store, 3, -1000, "GAMMA", None, false);

        let first = serde_json::to_string(&svc.monthly_overview("u1", "2024-03").unwrap()).unwrap();
        let second =
            serde_json::to_string(&svc.monthly_overview("u1", "2024-03").unwrap()).unwrap();
        assert_eq!(first, second);

        let overview = svc.monthly_overview("u1", "2024-03").unwrap();
        let ids: Vec<_> = overview
            .categories
            .iter()
            .map(|c| c.category_id.clone())
            .collect();
        assert_eq!(
            ids,
            vec![Some("a-cat".into()), Some("b-cat".into()), None]
        );
    }

    #[test]
    fn trend_nulls_on_zero_base() {
        let (svc, store, _tmp) = service();
        // Current month only; previous month is empty.
        seed_tx(&store, 5, -5000, "SHOP", None, false);

        let trend = svc.spending_trend("u1", "2024-03").unwrap();
        assert_eq!(trend.previous_month, "2024-02");
        assert!(trend.income_change.is_none());
        assert!(trend.expenses_change.is_none());
        assert!(trend.net_change.is_none());
    }

    #[test]
    fn trend_computes_percent_changes() {
        let (svc, store, _tmp) = service();
        // February: 100 spent. March: 150 spent.
        let feb = Utc.with_ymd_and_hms(2024, 2, 10, 0, 0, 0).unwrap();
        let now = Utc::now();
        let tx = Transaction {
            id: Uuid::new_v4().to_string(),
            owner_id: "u1".into(),
            account_id: "acc1".into(),
            import_id: "imp1".into(),
            posted_at: feb,
            amount: -10_000,
            description: "SHOP".into(),
            merchant_raw: "SHOP".into(),
            merchant_normalized: "SHOP".into(),
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
            tx_key: "feb".into(),
            created_at: now,
            updated_at: now,
        };
        store.insert_transaction("u1", &tx).unwrap();
        seed_tx(&store, 10, -15_000, "SHOP", None, false);

        let trend = svc.spending_trend("u1", "2024-03").unwrap();
        let change = trend.expenses_change.unwrap();
        assert!((change - (-50.0)).abs() < 1e-9);
    }

    #[test]
    fn accounts_overview_lists_silent_accounts() {
        let (svc, store, _tmp) = service();
        let now = Utc::now();
        for (id, name) in [("acc1", "Chequing"), ("acc2", "Savings")] {
            store
                .create_account(
                    "u1",
                    &crate::models::Account {
                        id: id.into(),
                        owner_id: "u1".into(),
                        name: name.into(),
                        account_type: crate::models::AccountType::Checking,
                        institution: None,
                        last_four: None,
                        created_at: now,
                        updated_at: now,
                    },
                )
                .unwrap();
        }
        seed_tx(&store, 5, -5000, "SHOP", None, false);

        let summaries = svc.accounts_overview("u1", "2024-03").unwrap();
        assert_eq!(summaries.len(), 2);
        let acc1 = summaries.iter().find(|s| s.account_id == "acc1").unwrap();
        assert_eq!(acc1.expenses, -5000);
        assert_eq!(acc1.count, 1);
        let acc2 = summaries.iter().find(|s| s.account_id == "acc2").unwrap();
        assert_eq!(acc2.count, 0);
        assert_eq!(acc2.net, 0);
    }
}
