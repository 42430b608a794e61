//! Fire-and-forget notifications about recordings and rules.

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationCategory {
    RecordingCreated,
    RecordingDeleted,
    RecordingStopped,
    SnapshotCreated,
    SnapshotDeleted,
    RuleActivated,
    RuleDeleted,
}

impl fmt::Display for NotificationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NotificationCategory::RecordingCreated => "RecordingCreated",
            NotificationCategory::RecordingDeleted => "RecordingDeleted",
            NotificationCategory::RecordingStopped => "RecordingStopped",
            NotificationCategory::SnapshotCreated => "SnapshotCreated",
            NotificationCategory::SnapshotDeleted => "SnapshotDeleted",
            NotificationCategory::RuleActivated => "RuleActivated",
            NotificationCategory::RuleDeleted => "RuleDeleted",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub category: NotificationCategory,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(category: NotificationCategory, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            category,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Receives notifications. Sending never fails and never blocks.
pub trait NotificationSink: Send + Sync {
    fn send(&self, notification: Notification);
}

/// Writes each notification to the log.
#[derive(Debug, Default)]
pub struct LogNotificationSink;

impl NotificationSink for LogNotificationSink {
    fn send(&self, notification: Notification) {
        info!(
            "Notification {}: {}",
            notification.category, notification.payload
        );
    }
}

/// Publishes notifications to any number of subscribers.
///
/// Slow subscribers lose the oldest messages once `capacity` is exceeded.
#[derive(Debug, Clone)]
pub struct BroadcastNotificationSink {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastNotificationSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl NotificationSink for BroadcastNotificationSink {
    fn send(&self, notification: Notification) {
        // No subscribers is fine.
        let _ = self.tx.send(notification);
    }
}

/// Forwards every notification to each inner sink.
#[derive(Default)]
pub struct FanoutNotificationSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl NotificationSink for FanoutNotificationSink {
    fn send(&self, notification: Notification) {
        for sink in &self.sinks {
            sink.send(notification.clone());
        }
    }
}
