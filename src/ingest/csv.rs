//! Deterministic delimited-statement parser
//! Mission: Parse the common bank CSV shapes without touching a model

use chrono::{NaiveDate, Utc};
use tracing::debug;

use crate::llm::ParsedRow;

/// Header aliases for the date column.
const DATE_ALIASES: &[&str] = &["date", "posted date", "transaction date", "posting date"];
/// Single signed amount column.
const AMOUNT_ALIASES: &[&str] = &["amount", "transaction amount"];
/// Paired columns: amount = credit - debit.
const DEBIT_ALIASES: &[&str] = &["debit", "withdrawal"];
const CREDIT_ALIASES: &[&str] = &["credit", "deposit"];
const DESCRIPTION_ALIASES: &[&str] = &[
    "description",
    "merchant",
    "name",
    "transaction description",
    "memo",
];

#[derive(Debug)]
struct ColumnMap {
    date: usize,
    description: usize,
    amount: Option<usize>,
    debit: Option<usize>,
    credit: Option<usize>,
}

/// Split one CSV line, honoring double-quoted fields with embedded commas
/// and doubled quotes as escapes.
fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' => in_quotes = true,
            ',' if !in_quotes => {
                fields.push(current.trim().to_string());
                current = String::new();
            }
            _ => current.push(c),
        }
    }
    fields.push(current.trim().to_string());
    fields
}

fn find_column(headers: &[String], aliases: &[&str]) -> Option<usize> {
    headers
        .iter()
        .position(|h| aliases.contains(&h.to_lowercase().trim()))
}

fn resolve_columns(headers: &[String]) -> Option<ColumnMap> {
    let date = find_column(headers, DATE_ALIASES)?;
    let description = find_column(headers, DESCRIPTION_ALIASES)?;
    let amount = find_column(headers, AMOUNT_ALIASES);
    let debit = find_column(headers, DEBIT_ALIASES);
    let credit = find_column(headers, CREDIT_ALIASES);

    if amount.is_none() && debit.is_none() && credit.is_none() {
        return None;
    }
    Some(ColumnMap {
        date,
        description,
        amount,
        debit,
        credit,
    })
}

/// Money strings arrive as "$1,234.56", "(50.00)" never; we strip currency
/// markers, thousands separators and stray quotes, then parse cents.
fn parse_money(raw: &str) -> Option<i64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | '"' | '\''))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let value: f64 = cleaned.parse().ok()?;
    Some((value * 100.0).round() as i64)
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    for format in ["%Y-%m-%d", "%m/%d/%Y", "%m/%d/%y", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Some(date);
        }
    }
    None
}

/// Parse a delimited statement into transaction rows. Returns an empty
/// vector when the header cannot be resolved or every row is rejected; the
/// pipeline falls back to the multimodal parser in that case.
pub fn parse_statement(text: &str) -> Vec<ParsedRow> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());

    let Some(header_line) = lines.next() else {
        return Vec::new();
    };
    let headers = split_fields(header_line);
    let Some(columns) = resolve_columns(&headers) else {
        debug!("No recognizable header row; deferring to the multimodal parser");
        return Vec::new();
    };

    let mut rows = Vec::new();
    for line in lines {
        let fields = split_fields(line);
        let Some(date_raw) = fields.get(columns.date) else {
            continue;
        };
        let Some(date) = parse_date(date_raw) else {
            debug!("Rejecting row with unparsable date: {date_raw}");
            continue;
        };

        let amount = match columns.amount.and_then(|i| fields.get(i)) {
            Some(raw) if !raw.is_empty() => parse_money(raw),
            _ => {
                // Paired columns: both optional per row, amount = credit - debit.
                let debit = columns
                    .debit
                    .and_then(|i| fields.get(i))
                    .and_then(|raw| parse_money(raw))
                    .unwrap_or(0);
                let credit = columns
                    .credit
                    .and_then(|i| fields.get(i))
                    .and_then(|raw| parse_money(raw))
                    .unwrap_or(0);
                Some(credit - debit)
            }
        };
        let Some(amount) = amount else {
            continue;
        };
        if amount == 0 {
            continue;
        }

        let description = fields
            .get(columns.description)
            .cloned()
            .unwrap_or_default();
        if description.is_empty() {
            continue;
        }

        let posted_at = match date.and_hms_opt(0, 0, 0) {
            Some(dt) => dt.and_utc(),
            None => Utc::now(),
        };
        rows.push(ParsedRow {
            posted_at,
            amount,
            merchant_raw: description.clone(),
            description,
        });
    }
    rows
}
