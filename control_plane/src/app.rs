//! Application context wiring the services together.
//!
//! Owns the connection manager and its reaper, the recording manager, the
//! rule engine, and the discovery poller feeding it.

use log::{info, warn};
use rule_engine::CompiledEvaluator;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::automation::{RuleEngine, RuleRepository, SqliteRuleRepository};
use crate::config::ControlPlaneConfig;
use crate::connection::ConnectionManager;
use crate::discovery::{select_platform, DiscoveryPoller, PlatformStrategy, StaticDiscovery};
use crate::error::AutomationError;
use crate::notifications::{
    BroadcastNotificationSink, FanoutNotificationSink, LogNotificationSink, Notification,
    NotificationSink,
};
use crate::recordings::{ArchiveStore, FsArchiveStore, RecordingManager};
use crate::target_control::ConnectionFactory;

const DISCOVERY_FEED_CAPACITY: usize = 256;
const NOTIFICATION_CAPACITY: usize = 1024;

/// Builder for a running ControlPlane.
pub struct ControlPlaneBuilder {
    config: ControlPlaneConfig,
    factory: Arc<dyn ConnectionFactory>,
    archives: Option<Arc<dyn ArchiveStore>>,
    repository: Option<Arc<dyn RuleRepository>>,
    strategies: Vec<Arc<dyn PlatformStrategy>>,
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl ControlPlaneBuilder {
    /// Archive store. Defaults to the filesystem under `storage.archive_dir`.
    pub fn archives(mut self, archives: Arc<dyn ArchiveStore>) -> Self {
        self.archives = Some(archives);
        self
    }

    /// Rule repository. Defaults to SQLite at `storage.rules_db_path`.
    pub fn repository(mut self, repository: Arc<dyn RuleRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Adds a discovery strategy. Without any, the configured static
    /// targets are used.
    pub fn strategy(mut self, strategy: Arc<dyn PlatformStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Adds a notification sink next to the log and broadcast sinks.
    pub fn sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Loads persisted rules and starts every background task.
    pub async fn start(self) -> Result<ControlPlane, AutomationError> {
        let config = self.config;

        let repository: Arc<dyn RuleRepository> = match self.repository {
            Some(repository) => repository,
            None => Arc::new(SqliteRuleRepository::open(&config.storage.rules_db_path)?),
        };
        let archives: Arc<dyn ArchiveStore> = match self.archives {
            Some(archives) => archives,
            None => Arc::new(FsArchiveStore::new(&config.storage.archive_dir)),
        };

        let broadcast = BroadcastNotificationSink::new(NOTIFICATION_CAPACITY);
        let mut fanout = FanoutNotificationSink::new()
            .with(Arc::new(LogNotificationSink))
            .with(Arc::new(broadcast.clone()));
        for sink in self.sinks {
            fanout = fanout.with(sink);
        }
        let notifications: Arc<dyn NotificationSink> = Arc::new(fanout);

        let connections = ConnectionManager::new(self.factory, config.connection.clone());
        let recordings = RecordingManager::new(
            connections.clone(),
            archives,
            Arc::clone(&notifications),
        );
        let rules = RuleEngine::new(
            recordings.clone(),
            repository,
            Arc::new(CompiledEvaluator::new()),
            notifications,
        );
        rules.load().await?;

        let shutdown = CancellationToken::new();
        let mut tasks = vec![connections.spawn_reaper()];

        let mut strategies = self.strategies;
        if strategies.is_empty() {
            strategies.push(Arc::new(StaticDiscovery::from_config(&config.discovery)));
        }
        match select_platform(&strategies).await {
            Some(strategy) => {
                let (feed, events) = mpsc::channel(DISCOVERY_FEED_CAPACITY);
                tasks.push(rules.run(events));
                tasks.push(DiscoveryPoller::new(strategy).spawn(
                    config.discovery.poll_interval,
                    feed,
                    shutdown.child_token(),
                ));
            }
            None => warn!("No platform strategy is available, targets will not be discovered"),
        }

        info!(
            "Control plane started ({} rule(s), max {} connections)",
            rules.list_rules().len(),
            config.connection.max_open
        );
        Ok(ControlPlane {
            config,
            connections,
            recordings,
            rules,
            broadcast,
            shutdown,
            tasks,
        })
    }
}

/// The running control plane.
pub struct ControlPlane {
    config: ControlPlaneConfig,
    connections: ConnectionManager,
    recordings: RecordingManager,
    rules: RuleEngine,
    broadcast: BroadcastNotificationSink,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ControlPlane {
    pub fn builder(config: ControlPlaneConfig, factory: Arc<dyn ConnectionFactory>) -> ControlPlaneBuilder {
        ControlPlaneBuilder {
            config,
            factory,
            archives: None,
            repository: None,
            strategies: Vec::new(),
            sinks: Vec::new(),
        }
    }

    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn recordings(&self) -> &RecordingManager {
        &self.recordings
    }

    pub fn rules(&self) -> &RuleEngine {
        &self.rules
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.broadcast.subscribe()
    }

    /// Stops discovery and automation, then closes every connection.
    pub async fn shutdown(self) {
        info!("Control plane shutting down");
        self.shutdown.cancel();
        self.rules.shutdown().await;
        self.connections.close_all().await;
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!("Control plane stopped");
    }
}
