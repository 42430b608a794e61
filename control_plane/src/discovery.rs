//! Target discovery: platform strategies and the found/lost event feed.

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::RwLock;
use rule_engine::{Target, TargetId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DiscoveryConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Found(Target),
    Lost(Target),
}

impl DiscoveryEvent {
    pub fn target(&self) -> &Target {
        match self {
            DiscoveryEvent::Found(t) | DiscoveryEvent::Lost(t) => t,
        }
    }
}

/// A way of finding targets on some deployment platform.
#[async_trait]
pub trait PlatformStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Higher wins when several strategies are available.
    fn priority(&self) -> i32;

    /// Probes whether this platform is usable from here.
    async fn is_available(&self) -> bool;

    /// Targets currently visible on the platform.
    async fn list_targets(&self) -> Result<Vec<Target>, String>;
}

/// Picks the highest-priority available strategy. Ties go to the earlier
/// entry in `strategies`.
pub async fn select_platform(
    strategies: &[Arc<dyn PlatformStrategy>],
) -> Option<Arc<dyn PlatformStrategy>> {
    let mut ordered: Vec<&Arc<dyn PlatformStrategy>> = strategies.iter().collect();
    ordered.sort_by_key(|s| std::cmp::Reverse(s.priority()));

    for strategy in ordered {
        if strategy.is_available().await {
            info!("Selected {} platform strategy", strategy.name());
            return Some(Arc::clone(strategy));
        }
        debug!("Platform strategy {} is not available", strategy.name());
    }
    None
}

// ================================================================================================
// STATIC STRATEGY
// ================================================================================================

/// Targets listed in configuration, changeable at runtime.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    targets: RwLock<Vec<Target>>,
}

impl StaticDiscovery {
    pub const PRIORITY: i32 = 0;

    pub fn new(targets: Vec<Target>) -> Self {
        Self {
            targets: RwLock::new(targets),
        }
    }

    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self::new(
            config
                .static_targets
                .iter()
                .map(|t| Target::new(t.connect_url.as_str(), t.alias.as_str()))
                .collect(),
        )
    }

    /// Adds or replaces a target.
    pub fn add(&self, target: Target) {
        let mut targets = self.targets.write();
        targets.retain(|t| t.id() != target.id());
        targets.push(target);
    }

    pub fn remove(&self, id: &TargetId) -> bool {
        let mut targets = self.targets.write();
        let before = targets.len();
        targets.retain(|t| t.id() != id);
        targets.len() != before
    }
}

#[async_trait]
impl PlatformStrategy for StaticDiscovery {
    fn name(&self) -> &str {
        "static"
    }

    fn priority(&self) -> i32 {
        Self::PRIORITY
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn list_targets(&self) -> Result<Vec<Target>, String> {
        Ok(self.targets.read().clone())
    }
}

// ================================================================================================
// POLLER
// ================================================================================================

/// Turns periodic target listings into a found/lost event stream.
pub struct DiscoveryPoller {
    strategy: Arc<dyn PlatformStrategy>,
    known: HashMap<TargetId, Target>,
}

impl DiscoveryPoller {
    pub fn new(strategy: Arc<dyn PlatformStrategy>) -> Self {
        Self {
            strategy,
            known: HashMap::new(),
        }
    }

    /// Lists targets once and returns the changes since the previous poll.
    /// A target whose attributes changed is reported lost, then found.
    pub async fn poll(&mut self) -> Result<Vec<DiscoveryEvent>, String> {
        let current: HashMap<TargetId, Target> = self
            .strategy
            .list_targets()
            .await?
            .into_iter()
            .map(|t| (t.id().clone(), t))
            .collect();

        let mut events = Vec::new();
        for (id, old) in &self.known {
            match current.get(id) {
                Some(new) if new == old => {}
                _ => events.push(DiscoveryEvent::Lost(old.clone())),
            }
        }
        for (id, new) in &current {
            match self.known.get(id) {
                Some(old) if old == new => {}
                _ => events.push(DiscoveryEvent::Found(new.clone())),
            }
        }

        self.known = current;
        Ok(events)
    }

    /// Polls every `period` and forwards events until cancelled or the
    /// receiver is dropped.
    pub fn spawn(
        mut self,
        period: Duration,
        feed: mpsc::Sender<DiscoveryEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Starting {} discovery with {:?} poll interval",
                self.strategy.name(),
                period
            );
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.cancelled() => break,
                }
                match self.poll().await {
                    Ok(events) => {
                        for event in events {
                            if feed.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!("Discovery via {} failed: {}", self.strategy.name(), e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        name: &'static str,
        priority: i32,
        available: bool,
    }

    #[async_trait]
    impl PlatformStrategy for Fixed {
        fn name(&self) -> &str {
            self.name
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        async fn is_available(&self) -> bool {
            self.available
        }
        async fn list_targets(&self) -> Result<Vec<Target>, String> {
            Ok(Vec::new())
        }
    }

    fn fixed(name: &'static str, priority: i32, available: bool) -> Arc<dyn PlatformStrategy> {
        Arc::new(Fixed {
            name,
            priority,
            available,
        })
    }

    #[tokio::test]
    async fn test_select_platform_prefers_available_highest_priority() {
        let strategies = vec![
            fixed("static", 0, true),
            fixed("kube", 15, false),
            fixed("podman", 10, true),
            fixed("docker", 10, true),
        ];
        let selected = select_platform(&strategies).await.unwrap();
        assert_eq!(selected.name(), "podman");
    }

    #[tokio::test]
    async fn test_select_platform_none_available() {
        let strategies = vec![fixed("kube", 15, false)];
        assert!(select_platform(&strategies).await.is_none());
    }

    #[tokio::test]
    async fn test_poller_reports_changes() {
        let discovery = Arc::new(StaticDiscovery::new(vec![Target::new("a:1", "a")]));
        let mut poller = DiscoveryPoller::new(discovery.clone());

        let events = poller.poll().await.unwrap();
        assert_eq!(events, vec![DiscoveryEvent::Found(Target::new("a:1", "a"))]);
        assert!(poller.poll().await.unwrap().is_empty());

        discovery.remove(&TargetId::new("a:1"));
        discovery.add(Target::new("b:1", "b"));
        let events = poller.poll().await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.contains(&DiscoveryEvent::Lost(Target::new("a:1", "a"))));
        assert!(events.contains(&DiscoveryEvent::Found(Target::new("b:1", "b"))));
    }
}
