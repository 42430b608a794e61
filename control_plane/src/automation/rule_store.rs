//! In-memory rule set: the fast read path for evaluation.

use parking_lot::RwLock;
use rule_engine::Rule;
use std::collections::HashMap;
use std::sync::Arc;

/// Rules keyed by name. Mutations take the write lock; evaluation only reads.
#[derive(Debug, Default)]
pub struct RuleStore {
    rules: RwLock<HashMap<String, Arc<Rule>>>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a rule unless one with the same name exists. Returns false
    /// (and leaves the set unchanged) on a name collision.
    pub fn insert_new(&self, rule: Arc<Rule>) -> bool {
        let mut rules = self.rules.write();
        if rules.contains_key(rule.name()) {
            return false;
        }
        rules.insert(rule.name().to_string(), rule);
        true
    }

    /// Inserts or replaces.
    pub fn upsert(&self, rule: Arc<Rule>) -> Option<Arc<Rule>> {
        self.rules.write().insert(rule.name().to_string(), rule)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Rule>> {
        self.rules.write().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Rule>> {
        self.rules.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rules.read().contains_key(name)
    }

    /// All rules sorted by name.
    pub fn all(&self) -> Vec<Arc<Rule>> {
        let mut rules: Vec<Arc<Rule>> = self.rules.read().values().cloned().collect();
        rules.sort_by(|a, b| a.name().cmp(b.name()));
        rules
    }

    pub fn enabled(&self) -> Vec<Arc<Rule>> {
        self.all().into_iter().filter(|r| r.is_enabled()).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
