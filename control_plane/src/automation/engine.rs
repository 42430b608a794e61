//! Rule automation engine.
//!
//! Keeps the rule set and the set of known targets, and acts on every
//! (rule, target) pair whose match expression holds. Each pair is actioned
//! at most once while both the rule and the target exist; the claim is
//! taken before acting and released only if the action fails. Forgetting a
//! claim cancels its action and any archiver it started.

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use rule_engine::{
    ConnectionDescriptor, EventSpecifier, MatchExpressionEvaluator, Rule, RuleBuilder, Target,
    TargetId,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::archiver::PeriodicArchiver;
use super::repository::RuleRepository;
use super::rule_store::RuleStore;
use crate::discovery::DiscoveryEvent;
use crate::error::{AutomationError, RecordingError};
use crate::notifications::{Notification, NotificationCategory, NotificationSink};
use crate::recordings::{RecordingManager, ReplacementPolicy, StartRequest};
use crate::target_control::RecordingOptions;

type PairKey = (String, TargetId);

#[derive(Clone)]
struct Claim {
    id: u64,
    /// Cancelled when the rule or the target is forgotten
    cancel: CancellationToken,
}

struct EngineInner {
    rules: RuleStore,
    repository: Arc<dyn RuleRepository>,
    evaluator: Arc<dyn MatchExpressionEvaluator>,
    recordings: RecordingManager,
    notifications: Arc<dyn NotificationSink>,
    targets: RwLock<HashMap<TargetId, Target>>,
    actioned: Mutex<HashMap<PairKey, Claim>>,
    claims: AtomicU64,
    /// Serializes rule add, remove and enable
    mutations: tokio::sync::Mutex<()>,
    /// Rule actions in flight
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

/// The automation service. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RuleEngine {
    inner: Arc<EngineInner>,
}

async fn blocking<T, F>(f: F) -> Result<T, AutomationError>
where
    F: FnOnce() -> Result<T, AutomationError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AutomationError::Repository(format!("repository task failed: {}", e)))?
}

impl RuleEngine {
    pub fn new(
        recordings: RecordingManager,
        repository: Arc<dyn RuleRepository>,
        evaluator: Arc<dyn MatchExpressionEvaluator>,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                rules: RuleStore::new(),
                repository,
                evaluator,
                recordings,
                notifications,
                targets: RwLock::new(HashMap::new()),
                actioned: Mutex::new(HashMap::new()),
                claims: AtomicU64::new(1),
                mutations: tokio::sync::Mutex::new(()),
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn notify(&self, category: NotificationCategory, rule: &Rule) {
        self.inner
            .notifications
            .send(Notification::new(category, json!(rule)));
    }

    /// Loads persisted rules into the rule set. Returns how many were loaded.
    pub async fn load(&self) -> Result<usize, AutomationError> {
        let repository = Arc::clone(&self.inner.repository);
        let evaluator = Arc::clone(&self.inner.evaluator);
        let rules = blocking(move || repository.load_all(evaluator.as_ref())).await?;

        let count = rules.len();
        for rule in rules {
            let rule = Arc::new(rule);
            self.inner.rules.upsert(Arc::clone(&rule));
            if rule.is_enabled() {
                self.apply_rule(&rule);
            }
        }
        info!("Rule engine loaded {} rule(s)", count);
        Ok(count)
    }

    // ============================================================================================
    // RULE CRUD
    // ============================================================================================

    /// Validates, persists and activates a rule, then evaluates it against
    /// every known target. Nothing is stored if validation fails.
    pub async fn add_rule(&self, builder: RuleBuilder) -> Result<Arc<Rule>, AutomationError> {
        let rule = Arc::new(builder.build(self.inner.evaluator.as_ref())?);
        let _mutation = self.inner.mutations.lock().await;

        if !self.inner.rules.insert_new(Arc::clone(&rule)) {
            return Err(AutomationError::DuplicateRule(rule.name().to_string()));
        }

        let repository = Arc::clone(&self.inner.repository);
        let to_save = Arc::clone(&rule);
        if let Err(e) = blocking(move || repository.save(&to_save)).await {
            self.inner.rules.remove(rule.name());
            return Err(e);
        }

        info!("Added {}", rule);
        self.notify(NotificationCategory::RuleActivated, &rule);
        if rule.is_enabled() {
            self.apply_rule(&rule);
        }
        Ok(rule)
    }

    /// Removes a rule. With `clean`, the rule's recordings are stopped on
    /// every target it was applied to.
    pub async fn remove_rule(&self, name: &str, clean: bool) -> Result<Arc<Rule>, AutomationError> {
        let mutation = self.inner.mutations.lock().await;
        let rule = self
            .inner
            .rules
            .get(name)
            .ok_or_else(|| AutomationError::RuleNotFound(name.to_string()))?;

        let repository = Arc::clone(&self.inner.repository);
        let owned_name = name.to_string();
        blocking(move || repository.delete(&owned_name)).await?;
        self.inner.rules.remove(name);
        let expression = rule.match_expression();
        if !self
            .inner
            .rules
            .all()
            .iter()
            .any(|r| r.match_expression() == expression)
        {
            self.inner.evaluator.forget(expression);
        }

        let applied_to = self.forget_rule(name);
        drop(mutation);

        if clean && !rule.is_archiver() {
            let recording = rule.recording_name();
            for target in applied_to {
                let descriptor = ConnectionDescriptor::new(target.clone());
                match self
                    .inner
                    .recordings
                    .stop_recording(&descriptor, &recording)
                    .await
                {
                    Ok(_) => info!("Stopped {} on {} for removed rule", recording, target),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => warn!("Failed to stop {} on {}: {}", recording, target, e),
                }
            }
        }

        info!("Removed rule {}", rule.name());
        self.notify(NotificationCategory::RuleDeleted, &rule);
        Ok(rule)
    }

    /// Enables or disables a rule. Disabling stops its archivers; enabling
    /// evaluates it against every known target.
    pub async fn set_rule_enabled(
        &self,
        name: &str,
        enabled: bool,
    ) -> Result<Arc<Rule>, AutomationError> {
        let _mutation = self.inner.mutations.lock().await;
        let current = self
            .inner
            .rules
            .get(name)
            .ok_or_else(|| AutomationError::RuleNotFound(name.to_string()))?;
        if current.is_enabled() == enabled {
            return Ok(current);
        }

        let updated = Arc::new(current.with_enabled(enabled));
        let repository = Arc::clone(&self.inner.repository);
        let to_save = Arc::clone(&updated);
        blocking(move || repository.save(&to_save)).await?;
        self.inner.rules.upsert(Arc::clone(&updated));

        if enabled {
            self.apply_rule(&updated);
        } else {
            self.forget_rule(name);
        }
        info!("Rule {} {}", name, if enabled { "enabled" } else { "disabled" });
        self.notify(NotificationCategory::RuleActivated, &updated);
        Ok(updated)
    }

    pub fn list_rules(&self) -> Vec<Arc<Rule>> {
        self.inner.rules.all()
    }

    pub fn get_rule(&self, name: &str) -> Option<Arc<Rule>> {
        self.inner.rules.get(name)
    }

    pub fn known_targets(&self) -> Vec<Target> {
        let mut targets: Vec<Target> = self.inner.targets.read().values().cloned().collect();
        targets.sort_by(|a, b| a.id().cmp(b.id()));
        targets
    }

    // ============================================================================================
    // DISCOVERY
    // ============================================================================================

    pub async fn handle_discovery_event(&self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Found(target) => {
                debug!("Target found: {} ({})", target.id(), target.alias());
                self.inner
                    .targets
                    .write()
                    .insert(target.id().clone(), target.clone());
                for rule in self.inner.rules.enabled() {
                    self.consider(&rule, &target);
                }
            }
            DiscoveryEvent::Lost(target) => {
                debug!("Target lost: {} ({})", target.id(), target.alias());
                self.inner.targets.write().remove(target.id());
                self.forget_target(target.id());
                self.inner
                    .recordings
                    .connections()
                    .on_target_removed(target.id())
                    .await;
            }
        }
    }

    /// Consumes the discovery feed until it closes or the engine shuts down.
    pub fn run(&self, mut feed: mpsc::Receiver<DiscoveryEvent>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = feed.recv() => match event {
                        Some(event) => engine.handle_discovery_event(event).await,
                        None => break,
                    },
                    _ = engine.inner.shutdown.cancelled() => break,
                }
            }
            debug!("Rule engine discovery loop stopped");
        })
    }

    /// Waits for every rule action started so far to finish.
    pub async fn wait_idle(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();
    }

    /// Stops archivers and the discovery loop, cancels in-flight actions and
    /// waits for them to wind down.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!("Rule engine stopped");
    }

    // ============================================================================================
    // EVALUATION
    // ============================================================================================

    fn apply_rule(&self, rule: &Arc<Rule>) {
        for target in self.known_targets() {
            self.consider(rule, &target);
        }
    }

    /// Evaluates one pair and, on a new match, claims it and spawns the action.
    fn consider(&self, rule: &Arc<Rule>, target: &Target) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }

        match self.inner.evaluator.evaluate(rule.match_expression(), target) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!("Rule {} could not be evaluated on {}: {}", rule.name(), target.id(), e);
                return;
            }
        }

        let key: PairKey = (rule.name().to_string(), target.id().clone());
        let claim = {
            let mut actioned = self.inner.actioned.lock();
            if actioned.contains_key(&key) {
                return;
            }
            let claim = Claim {
                id: self.inner.claims.fetch_add(1, Ordering::SeqCst),
                cancel: self.inner.shutdown.child_token(),
            };
            actioned.insert(key.clone(), claim.clone());
            claim
        };

        info!("Rule {} matched {}", rule.name(), target.id());
        let engine = self.clone();
        let rule = Arc::clone(rule);
        let target = target.clone();
        self.inner.tasks.spawn(async move {
            // Once the claim is forgotten the action must not take another step.
            let outcome = tokio::select! {
                biased;
                _ = claim.cancel.cancelled() => {
                    debug!("Dropping action of rule {} on {}", rule.name(), target.id());
                    return;
                }
                outcome = engine.act(&rule, &target, &claim) => outcome,
            };
            if let Err(e) = outcome {
                warn!(
                    "Rule {} failed to act on {}: {}",
                    rule.name(),
                    target.id(),
                    e
                );
                engine.release(&key, claim.id);
            }
        });
    }

    fn release(&self, key: &PairKey, claim: u64) {
        let mut actioned = self.inner.actioned.lock();
        if actioned.get(key).map(|c| c.id) == Some(claim) {
            actioned.remove(key);
        }
    }

    async fn act(
        &self,
        rule: &Arc<Rule>,
        target: &Target,
        claim: &Claim,
    ) -> Result<(), RecordingError> {
        let recordings = &self.inner.recordings;
        let descriptor = target.descriptor();

        match rule.event_specifier() {
            EventSpecifier::Archive => {
                let snapshot = recordings
                    .create_verified_snapshot(&descriptor)
                    .await?
                    .ok_or_else(|| RecordingError::SnapshotCreation {
                        target: target.id().clone(),
                        reason: "snapshot was unreadable".to_string(),
                    })?;

                let archived = recordings
                    .archive_recording(&descriptor, &snapshot.name, target.alias())
                    .await;
                // The snapshot only exists to be archived.
                if let Err(e) = recordings.delete_recording(&descriptor, &snapshot.name).await {
                    warn!(
                        "Failed to delete snapshot {} on {}: {}",
                        snapshot.name,
                        target.id(),
                        e
                    );
                }
                let archived = archived?;
                info!(
                    "Rule {} archived {} as {}",
                    rule.name(),
                    target.id(),
                    archived.name
                );
            }
            EventSpecifier::Template {
                name,
                template_type,
            } => {
                let options = RecordingOptions::builder(rule.recording_name())
                    .to_disk(true)
                    .max_age_seconds(rule.max_age_seconds())
                    .max_size_bytes(rule.max_size_bytes())
                    .build();
                let request = StartRequest::new(options, name.clone())
                    .template_type(*template_type)
                    .replace(ReplacementPolicy::Always);
                recordings.start_recording(&descriptor, request).await?;

                if rule.archival_period_seconds() > 0 {
                    self.start_archiver(rule, target, claim);
                }
            }
        }
        Ok(())
    }

    // The archiver lives as long as the claim.
    fn start_archiver(&self, rule: &Arc<Rule>, target: &Target, claim: &Claim) {
        if claim.cancel.is_cancelled() {
            debug!("Rule {} was forgotten before archiving {}", rule.name(), target.id());
            return;
        }
        let cancel = claim.cancel.child_token();

        let archiver = PeriodicArchiver::new(
            self.inner.recordings.clone(),
            Arc::clone(rule),
            target.clone(),
            cancel,
        );
        tokio::spawn(archiver.run());
    }

    /// Drops and cancels the claims of a rule. Returns the targets it had
    /// been applied to.
    fn forget_rule(&self, name: &str) -> Vec<TargetId> {
        let mut applied_to = Vec::new();
        self.inner.actioned.lock().retain(|(rule, target), claim| {
            if rule == name {
                claim.cancel.cancel();
                applied_to.push(target.clone());
                false
            } else {
                true
            }
        });
        applied_to.sort();
        applied_to
    }

    fn forget_target(&self, id: &TargetId) {
        self.inner.actioned.lock().retain(|(_, target), claim| {
            if target == id {
                claim.cancel.cancel();
                false
            } else {
                true
            }
        });
    }
}
