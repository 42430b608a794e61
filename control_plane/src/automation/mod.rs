//! Rule-driven automation of recordings and archives.

pub mod archiver;
pub mod engine;
pub mod repository;
pub mod rule_store;

pub use archiver::PeriodicArchiver;
pub use engine::RuleEngine;
pub use repository::{MemoryRuleRepository, RuleRepository, SqliteRuleRepository};
pub use rule_store::RuleStore;
