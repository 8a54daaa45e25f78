pub mod entities;
pub mod helpers;
pub mod interfaces;
pub mod sqlite;

pub use helpers::*;
pub use interfaces::{FillInsert, LedgerRepository, RecordError, RecordQuery, SortOrder};
pub use sqlite::SqliteLedgerRepository;
