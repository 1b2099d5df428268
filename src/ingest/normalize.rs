//! Merchant normalization
//! Mission: Collapse raw statement descriptors into stable merchant names

use regex::Regex;
use std::sync::OnceLock;

/// Statement noise that carries no merchant signal.
const NOISE_TOKENS: &[&str] = &["PURCHASE", "PAYMENT", "DEBIT", "CREDIT", "POS", "CHECKCARD"];

fn store_number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[#*]\d+").expect("static pattern"))
}

fn long_digit_run_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d{4,}").expect("static pattern"))
}

/// Deterministic merchant normalizer: uppercase, drop store-number tails
/// (`#123`, `*456`), strip runs of four or more digits, remove noise
/// tokens, collapse whitespace. Callers treat a result shorter than three
/// characters as "needs the secondary normalizer".
pub fn normalize_merchant(raw: &str) -> String {
    let upper = raw.to_uppercase();
    let without_store = store_number_re().replace_all(&upper, " ");
    let without_digits = long_digit_run_re().replace_all(&without_store, " ");

    without_digits
        .split_whitespace()
        .map(|token| token.trim_matches(|c: char| matches!(c, '#' | '*' | '-' | '/')))
        .filter(|token| !token.is_empty() && !NOISE_TOKENS.contains(token))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether the deterministic result is strong enough to keep.
pub fn is_confident(normalized: &str) -> bool {
    normalized.chars().count() >= 3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_numbers_removed() {
        assert_eq!(normalize_merchant("COFFEE SHOP #123"), "COFFEE SHOP");
        assert_eq!(normalize_merchant("SQ *STARBUCKS #12345"), "SQ STARBUCKS");
        assert_eq!(normalize_merchant("WALMART *9876"), "WALMART");
    }

    #[test]
    fn long_digit_runs_stripped() {
        assert_eq!(normalize_merchant("AMZN MKTP 4421890001"), "AMZN MKTP");
        // Short digit runs survive (street numbers, "7-ELEVEN" style names).
        assert_eq!(normalize_merchant("7-ELEVEN 221"), "7-ELEVEN 221");
    }

    #[test]
    fn noise_tokens_removed() {
        assert_eq!(
            normalize_merchant("POS PURCHASE TIM HORTONS"),
            "TIM HORTONS"
        );
        assert_eq!(normalize_merchant("CHECKCARD DEBIT GROCER"), "GROCER");
    }

    #[test]
    fn uppercases_and_collapses_whitespace() {
        assert_eq!(normalize_merchant("  corner   store  "), "CORNER STORE");
        assert_eq!(normalize_merchant("Salary"), "SALARY");
    }

    #[test]
    fn confidence_threshold() {
        assert!(is_confident("IGA"));
        assert!(!is_confident("IG"));
        assert!(!is_confident(""));
        // All-noise descriptors collapse to empty and need the secondary.
        assert!(!is_confident(&normalize_merchant("POS DEBIT 99887766")));
    }
}
