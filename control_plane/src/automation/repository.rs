//! Durable storage for automated rules.
//!
//! Rules are stored as their JSON form, one row per rule name. Loading runs
//! every stored rule back through the validating builder; rows that no
//! longer validate are skipped.

use chrono::Utc;
use log::{info, warn};
use parking_lot::Mutex;
use rule_engine::{MatchExpressionEvaluator, Rule, RuleBuilder};
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::AutomationError;

/// Rule persistence. Implementations are blocking; async callers run them
/// on the blocking pool.
pub trait RuleRepository: Send + Sync {
    /// Every stored rule that still validates.
    fn load_all(&self, evaluator: &dyn MatchExpressionEvaluator) -> Result<Vec<Rule>, AutomationError>;

    /// Inserts or replaces the rule with the same name.
    fn save(&self, rule: &Rule) -> Result<(), AutomationError>;

    /// Returns false if no rule with that name was stored.
    fn delete(&self, name: &str) -> Result<bool, AutomationError>;
}

fn rebuild(
    rows: Vec<(String, String)>,
    evaluator: &dyn MatchExpressionEvaluator,
) -> Vec<Rule> {
    let mut rules = Vec::with_capacity(rows.len());
    for (name, rule_json) in rows {
        match RuleBuilder::from_json(&rule_json).and_then(|b| b.build(evaluator)) {
            Ok(rule) => rules.push(rule),
            Err(e) => warn!("Skipping stored rule {} that failed validation: {}", name, e),
        }
    }
    rules
}

fn to_json(rule: &Rule) -> Result<String, AutomationError> {
    serde_json::to_string(rule).map_err(|e| AutomationError::Repository(e.to_string()))
}

// ================================================================================================
// SQLITE
// ================================================================================================

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS rules (
    name        TEXT PRIMARY KEY,
    rule_json   TEXT NOT NULL,
    enabled     INTEGER NOT NULL DEFAULT 1,
    updated_at  TEXT NOT NULL
);
";

#[derive(Debug)]
pub struct SqliteRuleRepository {
    db: Mutex<Connection>,
}

impl SqliteRuleRepository {
    /// Opens (creating if needed) the rule database at `path`.
    pub fn open(path: &Path) -> Result<Self, AutomationError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    AutomationError::Repository(format!("Failed to create storage directory: {}", e))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, AutomationError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, AutomationError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }
}

impl RuleRepository for SqliteRuleRepository {
    fn load_all(&self, evaluator: &dyn MatchExpressionEvaluator) -> Result<Vec<Rule>, AutomationError> {
        // Release the connection before re-validating.
        let rows: Vec<(String, String)> = {
            let conn = self.db.lock();
            let mut stmt = conn.prepare("SELECT name, rule_json FROM rules ORDER BY name")?;
            let collected = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            collected
        };

        let rules = rebuild(rows, evaluator);
        info!("Loaded {} rule(s) from SQLite", rules.len());
        Ok(rules)
    }

    fn save(&self, rule: &Rule) -> Result<(), AutomationError> {
        let rule_json = to_json(rule)?;
        let conn = self.db.lock();
        conn.execute(
            "INSERT OR REPLACE INTO rules (name, rule_json, enabled, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                rule.name(),
                rule_json,
                rule.is_enabled(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<bool, AutomationError> {
        let conn = self.db.lock();
        let removed = conn.execute("DELETE FROM rules WHERE name = ?1", params![name])?;
        Ok(removed > 0)
    }
}

// ================================================================================================
// IN MEMORY
// ================================================================================================

/// Keeps rule JSON in memory. Loading still re-validates.
#[derive(Debug, Default)]
pub struct MemoryRuleRepository {
    rows: Mutex<BTreeMap<String, String>>,
}

impl MemoryRuleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores raw JSON under a name without validation.
    pub fn insert_raw(&self, name: impl Into<String>, rule_json: impl Into<String>) {
        self.rows.lock().insert(name.into(), rule_json.into());
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RuleRepository for MemoryRuleRepository {
    fn load_all(&self, evaluator: &dyn MatchExpressionEvaluator) -> Result<Vec<Rule>, AutomationError> {
        let rows: Vec<(String, String)> = self
            .rows
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(rebuild(rows, evaluator))
    }

    fn save(&self, rule: &Rule) -> Result<(), AutomationError> {
        let rule_json = to_json(rule)?;
        self.rows.lock().insert(rule.name().to_string(), rule_json);
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<bool, AutomationError> {
        Ok(self.rows.lock().remove(name).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rule_engine::CompiledEvaluator;

    fn rule(name: &str) -> Rule {
        RuleBuilder::new()
            .name(name)
            .match_expression("target.alias == 'foo'")
            .event_specifier("template=Continuous")
            .archival_period_seconds(60)
            .preserved_archives(3)
            .build(&CompiledEvaluator::new())
            .unwrap()
    }

    #[test]
    fn test_sqlite_save_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("rules.db");
        let evaluator = CompiledEvaluator::new();

        {
            let repo = SqliteRuleRepository::open(&path).unwrap();
            repo.save(&rule("a")).unwrap();
            repo.save(&rule("b")).unwrap();
            repo.save(&rule("a")).unwrap();
        }

        let repo = SqliteRuleRepository::open(&path).unwrap();
        let loaded = repo.load_all(&evaluator).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], rule("a"));

        assert!(repo.delete("a").unwrap());
        assert!(!repo.delete("a").unwrap());
        assert_eq!(repo.load_all(&evaluator).unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_rows_are_skipped() {
        let repo = SqliteRuleRepository::in_memory().unwrap();
        repo.save(&rule("good")).unwrap();
        {
            let conn = repo.db.lock();
            conn.execute(
                "INSERT INTO rules (name, rule_json, updated_at) VALUES ('bad', ?1, 'now')",
                params![r#"{"name":"bad","matchExpression":"System.exit(0)","eventSpecifier":"archive"}"#],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO rules (name, rule_json, updated_at) VALUES ('garbage', 'not json', 'now')",
                [],
            )
            .unwrap();
        }

        let loaded = repo.load_all(&CompiledEvaluator::new()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name(), "good");
    }

    #[test]
    fn test_memory_repository() {
        let repo = MemoryRuleRepository::new();
        repo.save(&rule("a")).unwrap();
        repo.insert_raw("broken", "{}");
        assert_eq!(repo.len(), 2);
        assert_eq!(repo.load_all(&CompiledEvaluator::new()).unwrap().len(), 1);
        assert!(repo.delete("a").unwrap());
    }
}
