//! Rule engine and lifecycle
//! Mission: Deterministic matching plus the learning loop above it

pub mod engine;
pub mod lifecycle;

pub use engine::{categorize_with_rules, validate_regex_pattern, RuleOutcome};
pub use lifecycle::{CreateRuleInput, RuleService, UpdateRuleInput};
