//! Entity persistence over SQLite
//! Mission: Owner-scoped storage with keyset pagination and batch writes
//!
//! Every operation takes the requester as owner scope; the adapter injects
//! an `owner_id = ?` predicate on every filter and rejects payloads carrying
//! a different owner. Cross-owner lookups come back as NotFound so record
//! existence never leaks.

use anyhow::{Context as AnyhowContext, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};
use crate::models::{
    Account, AccountType, Category, DismissedSuggestion, FileKind, Import, ImportStatus, Rule,
    RuleSource, Transaction,
};
use crate::store::cursor::{Page, PageCursor};

/// Schema tuned the same way as any write-heavy SQLite deployment here:
/// WAL for concurrent reads during imports, NORMAL sync, in-memory temp.
const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS accounts (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    name TEXT NOT NULL,
    account_type TEXT NOT NULL,
    institution TEXT,
    last_four TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS imports (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    account_id TEXT NOT NULL,
    filename TEXT NOT NULL,
    file_type TEXT NOT NULL,
    status TEXT NOT NULL,
    transaction_count INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    created_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE TABLE IF NOT EXISTS categories (
    id TEXT PRIMARY KEY,
    owner_id TEXT,
    name TEXT NOT NULL,
    icon TEXT NOT NULL,
    color TEXT NOT NULL,
    is_default INTEGER NOT NULL DEFAULT 0,
    parent_id TEXT,
    sort_order INTEGER NOT NULL DEFAULT 0,
    is_hidden INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS transactions (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    account_id TEXT NOT NULL,
    import_id TEXT NOT NULL,
    posted_at TEXT NOT NULL,
    amount INTEGER NOT NULL,
    description TEXT NOT NULL,
    merchant_raw TEXT NOT NULL,
    merchant_normalized TEXT NOT NULL,
    category_id TEXT,
    auto_category_json TEXT,
    manual_override INTEGER NOT NULL DEFAULT 0,
    explainability_json TEXT NOT NULL,
    notes TEXT,
    tags_json TEXT NOT NULL DEFAULT '[]',
    corrected_at TEXT,
    is_split_parent INTEGER NOT NULL DEFAULT 0,
    split_parent_id TEXT,
    receipt_line_items_json TEXT,
    tx_key TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rules (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    name TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    priority INTEGER NOT NULL,
    conditions_json TEXT NOT NULL,
    action_json TEXT NOT NULL,
    source TEXT NOT NULL,
    match_count INTEGER NOT NULL DEFAULT 0,
    last_matched_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS dismissed_suggestions (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    merchant_normalized TEXT NOT NULL,
    category_id TEXT NOT NULL,
    dismissed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS merchants (
    owner_id TEXT NOT NULL,
    merchant_raw TEXT NOT NULL,
    merchant_normalized TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (owner_id, merchant_raw)
) WITHOUT ROWID;
"#;

/// Composite indexes the read paths depend on. Audited at startup so a
/// missing one fails fast as IndexMissing instead of a slow table scan.
const REQUIRED_INDEXES: &[(&str, &str)] = &[
    (
        "idx_tx_owner_posted",
        "CREATE INDEX IF NOT EXISTS idx_tx_owner_posted
         ON transactions(owner_id, posted_at DESC)",
    ),
    (
        "idx_tx_owner_category_posted",
        "CREATE INDEX IF NOT EXISTS idx_tx_owner_category_posted
         ON transactions(owner_id, category_id, posted_at DESC)",
    ),
    (
        "idx_tx_owner_account_posted",
        "CREATE INDEX IF NOT EXISTS idx_tx_owner_account_posted
         ON transactions(owner_id, account_id, posted_at DESC)",
    ),
    (
        "idx_tx_owner_merchant_posted",
        "CREATE INDEX IF NOT EXISTS idx_tx_owner_merchant_posted
         ON transactions(owner_id, merchant_normalized, posted_at DESC)",
    ),
    (
        "idx_tx_owner_manual_posted",
        "CREATE INDEX IF NOT EXISTS idx_tx_owner_manual_posted
         ON transactions(owner_id, manual_override, posted_at DESC)",
    ),
    (
        "idx_tx_owner_split_posted",
        "CREATE INDEX IF NOT EXISTS idx_tx_owner_split_posted
         ON transactions(owner_id, is_split_parent, posted_at DESC)",
    ),
    (
        "idx_tx_owner_import_posted",
        "CREATE INDEX IF NOT EXISTS idx_tx_owner_import_posted
         ON transactions(owner_id, import_id, posted_at DESC)",
    ),
    (
        "idx_tx_owner_txkey",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_tx_owner_txkey
         ON transactions(owner_id, tx_key)",
    ),
    (
        "idx_rules_owner_enabled_priority",
        "CREATE INDEX IF NOT EXISTS idx_rules_owner_enabled_priority
         ON rules(owner_id, enabled, priority DESC)",
    ),
];

/// Built-in category set, seeded once with a NULL owner.
const DEFAULT_CATEGORIES: &[(&str, &str, &str, &str)] = &[
    ("default-groceries", "Groceries", "cart", "#4CAF50"),
    ("default-dining", "Dining", "utensils", "#FF9800"),
    ("default-transport", "Transport", "car", "#2196F3"),
    ("default-shopping", "Shopping", "bag", "#9C27B0"),
    ("default-entertainment", "Entertainment", "film", "#E91E63"),
    ("default-health", "Health", "heart", "#F44336"),
    ("default-utilities", "Utilities", "bolt", "#FFC107"),
    ("default-housing", "Housing", "home", "#795548"),
    ("default-travel", "Travel", "plane", "#00BCD4"),
    ("default-income", "Income", "trending-up", "#8BC34A"),
    ("default-fees", "Fees & Charges", "receipt", "#607D8B"),
    ("default-other", "Other", "dots", "#9E9E9E"),
];

/// Consistent micro-second RFC-3339 rendering so text ordering matches
/// instant ordering.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_ts_opt(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

fn json_col<T: DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn json_col_opt<T: DeserializeOwned>(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<T>> {
    raw.map(|s| json_col(idx, &s)).transpose()
}

fn to_json<T: Serialize>(value: &T) -> CoreResult<String> {
    serde_json::to_string(value).map_err(|e| CoreError::Internal(e.to_string()))
}

fn enum_col<T, F: Fn(&str) -> Option<T>>(idx: usize, raw: &str, parse: F) -> rusqlite::Result<T> {
    parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown enum value: {raw}").into(),
        )
    })
}

/// SQL-side transaction filters. Merchant substring, tag and amount filters
/// are applied by the caller after the page is fetched (source-mirroring);
/// everything here is backed by a composite index.
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub category_id: Option<String>,
    pub uncategorized: bool,
    pub account_id: Option<String>,
    pub import_id: Option<String>,
    /// Split parents are hidden from listings by default; the children are
    /// the canonical visible records.
    pub include_split_parents: bool,
}

/// Entity store over a single SQLite file.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database at {db_path}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize schema")?;
        for (_, create) in REQUIRED_INDEXES {
            conn.execute_batch(create).context("Failed to create index")?;
        }
        Self::seed_default_categories(&conn)?;
        info!("📊 Store initialized at {db_path}");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn seed_default_categories(conn: &Connection) -> Result<()> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM categories WHERE is_default = 1",
            [],
            |row| row.get(0),
        )?;
        if count > 0 {
            return Ok(());
        }

        let now = fmt_ts(Utc::now());
        for (sort, (id, name, icon, color)) in DEFAULT_CATEGORIES.iter().enumerate() {
            conn.execute(
                "INSERT INTO categories
                 (id, owner_id, name, icon, color, is_default, parent_id, sort_order, is_hidden, created_at, updated_at)
                 VALUES (?1, NULL, ?2, ?3, ?4, 1, NULL, ?5, 0, ?6, ?6)",
                params![id, name, icon, color, sort as i64, now],
            )?;
        }
        info!("🏷️  Seeded {} default categories", DEFAULT_CATEGORIES.len());
        Ok(())
    }

    /// Verify every index the read paths rely on still exists. A dropped
    /// index surfaces as IndexMissing with its name, distinct from generic
    /// unavailability, so the operator knows what to recreate.
    pub fn audit_indexes(&self) -> CoreResult<()> {
        let conn = self.conn.lock();
        for (name, _) in REQUIRED_INDEXES {
            let found: Option<String> = conn
                .query_row(
                    "SELECT name FROM sqlite_master WHERE type = 'index' AND name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;
            if found.is_none() {
                return Err(CoreError::IndexMissing((*name).to_string()));
            }
        }
        Ok(())
    }

    /// Run a closure against one store transaction. Either every write in
    /// the closure lands or none do; split/unsplit ride on this.
    pub fn run_in_transaction<T>(
        &self,
        f: impl FnOnce(&Connection) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| CoreError::StoreUnavailable(e.to_string()))?;
        let out = f(&tx)?;
        tx.commit()
            .map_err(|e| CoreError::StoreUnavailable(e.to_string()))?;
        Ok(out)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> CoreResult<T>) -> CoreResult<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    fn guard_owner(owner: &str, payload_owner: &str) -> CoreResult<()> {
        if owner != payload_owner {
            // Cross-owner writes collapse into NotFound, same as reads.
            return Err(CoreError::NotFound);
        }
        Ok(())
    }

    // ───────────────────────── accounts ─────────────────────────

    pub fn create_account(&self, owner: &str, account: &Account) -> CoreResult<()> {
        Self::guard_owner(owner, &account.owner_id)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO accounts
                 (id, owner_id, name, account_type, institution, last_four, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    account.id,
                    account.owner_id,
                    account.name,
                    account.account_type.as_str(),
                    account.institution,
                    account.last_four,
                    fmt_ts(account.created_at),
                    fmt_ts(account.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_account(&self, owner: &str, id: &str) -> CoreResult<Account> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, owner_id, name, account_type, institution, last_four, created_at, updated_at
                 FROM accounts WHERE id = ?1 AND owner_id = ?2",
                params![id, owner],
                row_to_account,
            )
            .optional()?
            .ok_or(CoreError::NotFound)
        })
    }

    pub fn list_accounts(&self, owner: &str) -> CoreResult<Vec<Account>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, owner_id, name, account_type, institution, last_four, created_at, updated_at
                 FROM accounts WHERE owner_id = ?1 ORDER BY created_at ASC, id ASC",
            )?;
            let rows = stmt
                .query_map(params![owner], row_to_account)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // ───────────────────────── categories ─────────────────────────

    /// Defaults plus the owner's own categories, stable sort order.
    pub fn list_categories(&self, owner: &str) -> CoreResult<Vec<Category>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, owner_id, name, icon, color, is_default, parent_id, sort_order, is_hidden, created_at, updated_at
                 FROM categories WHERE owner_id IS NULL OR owner_id = ?1
                 ORDER BY is_default DESC, sort_order ASC, name ASC",
            )?;
            let rows = stmt
                .query_map(params![owner], row_to_category)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// A category is visible if it is a default or belongs to the owner.
    pub fn category_exists(&self, owner: &str, id: &str) -> CoreResult<bool> {
        self.with_conn(|conn| {
            let found: Option<String> = conn
                .query_row(
                    "SELECT id FROM categories
                     WHERE id = ?1 AND (owner_id IS NULL OR owner_id = ?2)",
                    params![id, owner],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    // ───────────────────────── imports ─────────────────────────

    pub fn create_import(&self, owner: &str, import: &Import) -> CoreResult<()> {
        Self::guard_owner(owner, &import.owner_id)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO imports
                 (id, owner_id, account_id, filename, file_type, status, transaction_count, error_message, created_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    import.id,
                    import.owner_id,
                    import.account_id,
                    import.filename,
                    import.file_type.as_str(),
                    import.status.as_str(),
                    import.transaction_count,
                    import.error_message,
                    fmt_ts(import.created_at),
                    import.completed_at.map(fmt_ts),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_import(&self, owner: &str, id: &str) -> CoreResult<Import> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, owner_id, account_id, filename, file_type, status, transaction_count, error_message, created_at, completed_at
                 FROM imports WHERE id = ?1 AND owner_id = ?2",
                params![id, owner],
                row_to_import,
            )
            .optional()?
            .ok_or(CoreError::NotFound)
        })
    }

    pub fn list_imports(&self, owner: &str) -> CoreResult<Vec<Import>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, owner_id, account_id, filename, file_type, status, transaction_count, error_message, created_at, completed_at
                 FROM imports WHERE owner_id = ?1 ORDER BY created_at DESC, id DESC",
            )?;
            let rows = stmt
                .query_map(params![owner], row_to_import)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Advance the import state machine. Illegal transitions are a
    /// Conflict; terminal states only ever gain observational fields.
    pub fn transition_import(
        &self,
        owner: &str,
        id: &str,
        next: ImportStatus,
        transaction_count: Option<i64>,
        error_message: Option<&str>,
    ) -> CoreResult<()> {
        self.with_conn(|conn| {
            let current: ImportStatus = conn
                .query_row(
                    "SELECT status FROM imports WHERE id = ?1 AND owner_id = ?2",
                    params![id, owner],
                    |row| {
                        let raw: String = row.get(0)?;
                        enum_col(0, &raw, ImportStatus::parse)
                    },
                )
                .optional()?
                .ok_or(CoreError::NotFound)?;

            if !current.can_transition_to(next) {
                return Err(CoreError::Conflict(format!(
                    "import transition {} -> {} not allowed",
                    current.as_str(),
                    next.as_str()
                )));
            }

            let completed_at = next.is_terminal().then(|| fmt_ts(Utc::now()));
            conn.execute(
                "UPDATE imports
                 SET status = ?3,
                     transaction_count = COALESCE(?4, transaction_count),
                     error_message = COALESCE(?5, error_message),
                     completed_at = COALESCE(?6, completed_at)
                 WHERE id = ?1 AND owner_id = ?2",
                params![
                    id,
                    owner,
                    next.as_str(),
                    transaction_count,
                    error_message,
                    completed_at
                ],
            )?;
            debug!("Import {id}: {} -> {}", current.as_str(), next.as_str());
            Ok(())
        })
    }

    // ───────────────────────── transactions ─────────────────────────

    pub fn insert_transaction(&self, owner: &str, t: &Transaction) -> CoreResult<()> {
        Self::guard_owner(owner, &t.owner_id)?;
        self.with_conn(|conn| Self::insert_transaction_conn(conn, t))
    }

    /// Transaction-scoped insert, shared by the normal path and split
    /// commits running inside `run_in_transaction`.
    pub fn insert_transaction_conn(conn: &Connection, t: &Transaction) -> CoreResult<()> {
        conn.execute(
            "INSERT INTO transactions
             (id, owner_id, account_id, import_id, posted_at, amount, description,
              merchant_raw, merchant_normalized, category_id, auto_category_json,
              manual_override, explainability_json, notes, tags_json, corrected_at,
              is_split_parent, split_parent_id, receipt_line_items_json, tx_key,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                     ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
            params![
                t.id,
                t.owner_id,
                t.account_id,
                t.import_id,
                fmt_ts(t.posted_at),
                t.amount,
                t.description,
                t.merchant_raw,
                t.merchant_normalized,
                t.category_id,
                t.auto_category
                    .as_ref()
                    .map(to_json)
                    .transpose()?,
                t.manual_override as i64,
                to_json(&t.explainability)?,
                t.notes,
                to_json(&t.tags)?,
                t.corrected_at.map(fmt_ts),
                t.is_split_parent as i64,
                t.split_parent_id,
                t.receipt_line_items
                    .as_ref()
                    .map(to_json)
                    .transpose()?,
                t.tx_key,
                fmt_ts(t.created_at),
                fmt_ts(t.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_transaction(&self, owner: &str, id: &str) -> CoreResult<Transaction> {
        self.with_conn(|conn| Self::get_transaction_conn(conn, owner, id))
    }

    pub fn get_transaction_conn(
        conn: &Connection,
        owner: &str,
        id: &str,
    ) -> CoreResult<Transaction> {
        conn.query_row(
            &format!("SELECT {TX_COLUMNS} FROM transactions WHERE id = ?1 AND owner_id = ?2"),
            params![id, owner],
            row_to_transaction,
        )
        .optional()?
        .ok_or(CoreError::NotFound)
    }

    /// Full-row update of the mutable fields. Identity and provenance
    /// columns (owner, account, import, txKey, createdAt) never change.
    pub fn update_transaction(&self, owner: &str, t: &Transaction) -> CoreResult<()> {
        Self::guard_owner(owner, &t.owner_id)?;
        self.with_conn(|conn| Self::update_transaction_conn(conn, t))
    }

    pub fn update_transaction_conn(conn: &Connection, t: &Transaction) -> CoreResult<()> {
        let changed = conn.execute(
            "UPDATE transactions SET
                posted_at = ?3, amount = ?4, description = ?5, merchant_raw = ?6,
                merchant_normalized = ?7, category_id = ?8, auto_category_json = ?9,
                manual_override = ?10, explainability_json = ?11, notes = ?12,
                tags_json = ?13, corrected_at = ?14, is_split_parent = ?15,
                split_parent_id = ?16, receipt_line_items_json = ?17, updated_at = ?18
             WHERE id = ?1 AND owner_id = ?2",
            params![
                t.id,
                t.owner_id,
                fmt_ts(t.posted_at),
                t.amount,
                t.description,
                t.merchant_raw,
                t.merchant_normalized,
                t.category_id,
                t.auto_category.as_ref().map(to_json).transpose()?,
                t.manual_override as i64,
                to_json(&t.explainability)?,
                t.notes,
                to_json(&t.tags)?,
                t.corrected_at.map(fmt_ts),
                t.is_split_parent as i64,
                t.split_parent_id,
                t.receipt_line_items.as_ref().map(to_json).transpose()?,
                fmt_ts(t.updated_at),
            ],
        )?;
        if changed == 0 {
            return Err(CoreError::NotFound);
        }
        Ok(())
    }

    pub fn tx_key_exists(&self, owner: &str, tx_key: &str) -> CoreResult<bool> {
        self.with_conn(|conn| {
            let found: Option<String> = conn
                .query_row(
                    "SELECT id FROM transactions WHERE owner_id = ?1 AND tx_key = ?2",
                    params![owner, tx_key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Keyset-paginated listing over `(posted_at DESC, id DESC)`. Fetches
    /// `limit + 1` rows; the surplus row only flips `has_more`.
    pub fn list_transactions(
        &self,
        owner: &str,
        filter: &TransactionFilter,
        cursor: Option<&PageCursor>,
        limit: usize,
    ) -> CoreResult<Page<Transaction>> {
        self.with_conn(|conn| {
            let mut sql = format!(
                "SELECT {TX_COLUMNS} FROM transactions WHERE owner_id = ?1"
            );
            let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(owner.to_string())];

            if !filter.include_split_parents {
                sql.push_str(" AND is_split_parent = 0");
            }
            if let Some(start) = filter.start {
                args.push(Box::new(fmt_ts(start)));
                sql.push_str(&format!(" AND posted_at >= ?{}", args.len()));
            }
            if let Some(end) = filter.end {
                args.push(Box::new(fmt_ts(end)));
                sql.push_str(&format!(" AND posted_at <= ?{}", args.len()));
            }
            if filter.uncategorized {
                sql.push_str(" AND category_id IS NULL");
            } else if let Some(category_id) = &filter.category_id {
                args.push(Box::new(category_id.clone()));
                sql.push_str(&format!(" AND category_id = ?{}", args.len()));
            }
            if let Some(account_id) = &filter.account_id {
                args.push(Box::new(account_id.clone()));
                sql.push_str(&format!(" AND account_id = ?{}", args.len()));
            }
            if let Some(import_id) = &filter.import_id {
                args.push(Box::new(import_id.clone()));
                sql.push_str(&format!(" AND import_id = ?{}", args.len()));
            }
            if let Some(cur) = cursor {
                args.push(Box::new(cur.posted_at.clone()));
                let p = args.len();
                args.push(Box::new(cur.id.clone()));
                let i = args.len();
                sql.push_str(&format!(
                    " AND (posted_at < ?{p} OR (posted_at = ?{p} AND id < ?{i}))"
                ));
            }

            args.push(Box::new((limit + 1) as i64));
            sql.push_str(&format!(
                " ORDER BY posted_at DESC, id DESC LIMIT ?{}",
                args.len()
            ));

            let mut stmt = conn.prepare(&sql)?;
            let mut items = stmt
                .query_map(
                    rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                    row_to_transaction,
                )?
                .collect::<Result<Vec<_>, _>>()?;

            let has_more = items.len() > limit;
            items.truncate(limit);
            let next_cursor = if has_more {
                items.last().map(|t| {
                    PageCursor {
                        posted_at: fmt_ts(t.posted_at),
                        id: t.id.clone(),
                    }
                    .encode()
                })
            } else {
                None
            };

            Ok(Page {
                items,
                has_more,
                next_cursor,
            })
        })
    }

    pub fn list_transactions_by_ids(
        &self,
        owner: &str,
        ids: &[String],
    ) -> CoreResult<Vec<Transaction>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            let placeholders = (2..=ids.len() + 1)
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT {TX_COLUMNS} FROM transactions
                 WHERE owner_id = ?1 AND id IN ({placeholders})"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut args: Vec<&dyn rusqlite::ToSql> = vec![&owner as &dyn rusqlite::ToSql];
            for id in ids {
                args.push(id as &dyn rusqlite::ToSql);
            }
            let rows = stmt
                .query_map(rusqlite::params_from_iter(args), row_to_transaction)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Every non-split-parent transaction in `[start, end]`, oldest first.
    /// The aggregator's single pass rides on this.
    pub fn transactions_in_range(
        &self,
        owner: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> CoreResult<Vec<Transaction>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TX_COLUMNS} FROM transactions
                 WHERE owner_id = ?1 AND is_split_parent = 0
                   AND posted_at >= ?2 AND posted_at <= ?3
                 ORDER BY posted_at ASC, id ASC"
            ))?;
            let rows = stmt
                .query_map(
                    params![owner, fmt_ts(start), fmt_ts(end)],
                    row_to_transaction,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn split_children(&self, owner: &str, parent_id: &str) -> CoreResult<Vec<Transaction>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TX_COLUMNS} FROM transactions
                 WHERE owner_id = ?1 AND split_parent_id = ?2
                 ORDER BY tx_key ASC"
            ))?;
            let rows = stmt
                .query_map(params![owner, parent_id], row_to_transaction)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Delete all children of one split parent; returns the deleted count.
    pub fn delete_split_children_conn(
        conn: &Connection,
        owner: &str,
        parent_id: &str,
    ) -> CoreResult<usize> {
        let n = conn.execute(
            "DELETE FROM transactions WHERE owner_id = ?1 AND split_parent_id = ?2",
            params![owner, parent_id],
        )?;
        Ok(n)
    }

    pub fn set_split_parent_conn(
        conn: &Connection,
        owner: &str,
        id: &str,
        flag: bool,
    ) -> CoreResult<()> {
        let changed = conn.execute(
            "UPDATE transactions SET is_split_parent = ?3, updated_at = ?4
             WHERE id = ?1 AND owner_id = ?2",
            params![id, owner, flag as i64, fmt_ts(Utc::now())],
        )?;
        if changed == 0 {
            return Err(CoreError::NotFound);
        }
        Ok(())
    }

    pub fn count_transactions(&self, owner: &str, filter: &TransactionFilter) -> CoreResult<i64> {
        self.with_conn(|conn| {
            let mut sql = "SELECT COUNT(*) FROM transactions WHERE owner_id = ?1".to_string();
            let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(owner.to_string())];
            if !filter.include_split_parents {
                sql.push_str(" AND is_split_parent = 0");
            }
            if let Some(start) = filter.start {
                args.push(Box::new(fmt_ts(start)));
                sql.push_str(&format!(" AND posted_at >= ?{}", args.len()));
            }
            if let Some(end) = filter.end {
                args.push(Box::new(fmt_ts(end)));
                sql.push_str(&format!(" AND posted_at <= ?{}", args.len()));
            }
            if let Some(account_id) = &filter.account_id {
                args.push(Box::new(account_id.clone()));
                sql.push_str(&format!(" AND account_id = ?{}", args.len()));
            }
            let n: i64 = conn.query_row(
                &sql,
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                |row| row.get(0),
            )?;
            Ok(n)
        })
    }

    // ───────────────────────── rules ─────────────────────────

    pub fn create_rule(&self, owner: &str, rule: &Rule) -> CoreResult<()> {
        Self::guard_owner(owner, &rule.owner_id)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO rules
                 (id, owner_id, name, enabled, priority, conditions_json, action_json,
                  source, match_count, last_matched_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    rule.id,
                    rule.owner_id,
                    rule.name,
                    rule.enabled as i64,
                    rule.priority,
                    to_json(&rule.conditions)?,
                    to_json(&rule.action)?,
                    rule.source.as_str(),
                    rule.match_count,
                    rule.last_matched_at.map(fmt_ts),
                    fmt_ts(rule.created_at),
                    fmt_ts(rule.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_rule(&self, owner: &str, id: &str) -> CoreResult<Rule> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {RULE_COLUMNS} FROM rules WHERE id = ?1 AND owner_id = ?2"),
                params![id, owner],
                row_to_rule,
            )
            .optional()?
            .ok_or(CoreError::NotFound)
        })
    }

    /// All of an owner's rules, priority-descending. Ties resolve by
    /// creation time then id, which keeps the order stable for one rule set.
    pub fn list_rules(&self, owner: &str) -> CoreResult<Vec<Rule>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RULE_COLUMNS} FROM rules WHERE owner_id = ?1
                 ORDER BY priority DESC, created_at ASC, id ASC"
            ))?;
            let rows = stmt
                .query_map(params![owner], row_to_rule)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn list_enabled_rules(&self, owner: &str) -> CoreResult<Vec<Rule>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RULE_COLUMNS} FROM rules WHERE owner_id = ?1 AND enabled = 1
                 ORDER BY priority DESC, created_at ASC, id ASC"
            ))?;
            let rows = stmt
                .query_map(params![owner], row_to_rule)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn update_rule(&self, owner: &str, rule: &Rule) -> CoreResult<()> {
        Self::guard_owner(owner, &rule.owner_id)?;
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE rules SET
                    name = ?3, enabled = ?4, priority = ?5, conditions_json = ?6,
                    action_json = ?7, source = ?8, updated_at = ?9
                 WHERE id = ?1 AND owner_id = ?2",
                params![
                    rule.id,
                    rule.owner_id,
                    rule.name,
                    rule.enabled as i64,
                    rule.priority,
                    to_json(&rule.conditions)?,
                    to_json(&rule.action)?,
                    rule.source.as_str(),
                    fmt_ts(rule.updated_at),
                ],
            )?;
            if changed == 0 {
                return Err(CoreError::NotFound);
            }
            Ok(())
        })
    }

    pub fn delete_rule(&self, owner: &str, id: &str) -> CoreResult<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "DELETE FROM rules WHERE id = ?1 AND owner_id = ?2",
                params![id, owner],
            )?;
            if changed == 0 {
                return Err(CoreError::NotFound);
            }
            Ok(())
        })
    }

    pub fn count_rules(&self, owner: &str) -> CoreResult<i64> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM rules WHERE owner_id = ?1",
                params![owner],
                |row| row.get(0),
            )?;
            Ok(n)
        })
    }

    /// Batch priority assignment for reorder. Absent ids are untouched.
    pub fn set_rule_priorities(
        &self,
        owner: &str,
        assignments: &[(String, i64)],
    ) -> CoreResult<()> {
        self.run_in_transaction(|conn| {
            let now = fmt_ts(Utc::now());
            for (id, priority) in assignments {
                conn.execute(
                    "UPDATE rules SET priority = ?3, updated_at = ?4
                     WHERE id = ?1 AND owner_id = ?2",
                    params![id, owner, priority, now],
                )?;
            }
            Ok(())
        })
    }

    /// Best-effort match statistics: a single atomic increment, never a
    /// read-modify-write transaction in the request path. Racing increments
    /// may lose an update, which is acceptable for counters.
    pub fn bump_rule_stats(&self, owner: &str, rule_id: &str) -> CoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE rules
                 SET match_count = match_count + 1, last_matched_at = ?3
                 WHERE id = ?1 AND owner_id = ?2",
                params![rule_id, owner, fmt_ts(Utc::now())],
            )?;
            Ok(())
        })
    }

    // ───────────────────────── dismissed suggestions ─────────────────────────

    pub fn insert_dismissed_suggestion(
        &self,
        owner: &str,
        d: &DismissedSuggestion,
    ) -> CoreResult<()> {
        Self::guard_owner(owner, &d.owner_id)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO dismissed_suggestions
                 (id, owner_id, merchant_normalized, category_id, dismissed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    d.id,
                    d.owner_id,
                    d.merchant_normalized,
                    d.category_id,
                    fmt_ts(d.dismissed_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn dismissed_suggestion_exists(
        &self,
        owner: &str,
        merchant_normalized: &str,
        category_id: &str,
    ) -> CoreResult<bool> {
        self.with_conn(|conn| {
            let found: Option<String> = conn
                .query_row(
                    "SELECT id FROM dismissed_suggestions
                     WHERE owner_id = ?1 AND merchant_normalized = ?2 AND category_id = ?3",
                    params![owner, merchant_normalized, category_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    // ───────────────────────── merchant cache ─────────────────────────

    pub fn cached_merchant(&self, owner: &str, merchant_raw: &str) -> CoreResult<Option<String>> {
        self.with_conn(|conn| {
            let found: Option<String> = conn
                .query_row(
                    "SELECT merchant_normalized FROM merchants
                     WHERE owner_id = ?1 AND merchant_raw = ?2",
                    params![owner, merchant_raw],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found)
        })
    }

    pub fn cache_merchant(
        &self,
        owner: &str,
        merchant_raw: &str,
        merchant_normalized: &str,
    ) -> CoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO merchants (owner_id, merchant_raw, merchant_normalized, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(owner_id, merchant_raw)
                 DO UPDATE SET merchant_normalized = ?3, updated_at = ?4",
                params![owner, merchant_raw, merchant_normalized, fmt_ts(Utc::now())],
            )?;
            Ok(())
        })
    }
}

const TX_COLUMNS: &str = "id, owner_id, account_id, import_id, posted_at, amount, description, \
     merchant_raw, merchant_normalized, category_id, auto_category_json, manual_override, \
     explainability_json, notes, tags_json, corrected_at, is_split_parent, split_parent_id, \
     receipt_line_items_json, tx_key, created_at, updated_at";

const RULE_COLUMNS: &str = "id, owner_id, name, enabled, priority, conditions_json, action_json, \
     source, match_count, last_matched_at, created_at, updated_at";

fn row_to_account(row: &Row<'_>) -> rusqlite::Result<Account> {
    let type_raw: String = row.get(3)?;
    let created: String = row.get(6)?;
    let updated: String = row.get(7)?;
    Ok(Account {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        account_type: enum_col(3, &type_raw, AccountType::parse)?,
        institution: row.get(4)?,
        last_four: row.get(5)?,
        created_at: parse_ts(6, &created)?,
        updated_at: parse_ts(7, &updated)?,
    })
}

fn row_to_category(row: &Row<'_>) -> rusqlite::Result<Category> {
    let created: String = row.get(9)?;
    let updated: String = row.get(10)?;
    Ok(Category {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        icon: row.get(3)?,
        color: row.get(4)?,
        is_default: row.get::<_, i64>(5)? != 0,
        parent_id: row.get(6)?,
        sort_order: row.get(7)?,
        is_hidden: row.get::<_, i64>(8)? != 0,
        created_at: parse_ts(9, &created)?,
        updated_at: parse_ts(10, &updated)?,
    })
}

fn row_to_import(row: &Row<'_>) -> rusqlite::Result<Import> {
    let file_type_raw: String = row.get(4)?;
    let status_raw: String = row.get(5)?;
    let created: String = row.get(8)?;
    Ok(Import {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        account_id: row.get(2)?,
        filename: row.get(3)?,
        file_type: enum_col(4, &file_type_raw, FileKind::parse)?,
        status: enum_col(5, &status_raw, ImportStatus::parse)?,
        transaction_count: row.get(6)?,
        error_message: row.get(7)?,
        created_at: parse_ts(8, &created)?,
        completed_at: parse_ts_opt(9, row.get(9)?)?,
    })
}

fn row_to_transaction(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    let posted: String = row.get(4)?;
    let explain_raw: String = row.get(12)?;
    let tags_raw: String = row.get(14)?;
    let created: String = row.get(20)?;
    let updated: String = row.get(21)?;
    Ok(Transaction {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        account_id: row.get(2)?,
        import_id: row.get(3)?,
        posted_at: parse_ts(4, &posted)?,
        amount: row.get(5)?,
        description: row.get(6)?,
        merchant_raw: row.get(7)?,
        merchant_normalized: row.get(8)?,
        category_id: row.get(9)?,
        auto_category: json_col_opt(10, row.get(10)?)?,
        manual_override: row.get::<_, i64>(11)? != 0,
        explainability: json_col(12, &explain_raw)?,
        notes: row.get(13)?,
        tags: json_col(14, &tags_raw)?,
        corrected_at: parse_ts_opt(15, row.get(15)?)?,
        is_split_parent: row.get::<_, i64>(16)? != 0,
        split_parent_id: row.get(17)?,
        receipt_line_items: json_col_opt(18, row.get(18)?)?,
        tx_key: row.get(19)?,
        created_at: parse_ts(20, &created)?,
        updated_at: parse_ts(21, &updated)?,
    })
}

fn row_to_rule(row: &Row<'_>) -> rusqlite::Result<Rule> {
    let conditions_raw: String = row.get(5)?;
    let action_raw: String = row.get(6)?;
    let source_raw: String = row.get(7)?;
    let created: String = row.get(10)?;
    let updated: String = row.get(11)?;
    Ok(Rule {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        enabled: row.get::<_, i64>(3)? != 0,
        priority: row.get(4)?,
        conditions: json_col(5, &conditions_raw)?,
        action: json_col(6, &action_raw)?,
        source: enum_col(7, &source_raw, RuleSource::parse)?,
        match_count: row.get(8)?,
        last_matched_at: parse_ts_opt(9, row.get(9)?)?,
        created_at: parse_ts(10, &created)?,
        updated_at: parse_ts(11, &updated)?,
    })
}
