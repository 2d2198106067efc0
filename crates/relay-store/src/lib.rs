//! SQLite persistence for the relay engine: the append-only usage ledger,
//! session lifecycle rows with their step logs, and the revision-checked
//! knowledge store.

pub mod database;
pub mod error;
pub mod knowledge;
pub mod ledger;
pub mod row_helpers;
pub mod schema;
pub mod sessions;

pub use database::Database;
pub use error::StoreError;
pub use knowledge::{KnowledgeEntry, KnowledgeRepo};
pub use ledger::{BackendUsageSummary, UsageLedger};
pub use sessions::{SessionRecord, SessionRepo};
