//! Store adapter
//! Mission: Entity-level persistence with owner scoping on every operation

pub mod cursor;
pub mod sqlite;

pub use cursor::{Page, PageCursor};
pub use sqlite::{Store, TransactionFilter};
