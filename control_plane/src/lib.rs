//! # Flightdeck Control Plane
//!
//! Pooled control connections to profiled targets, recording lifecycle
//! operations over those connections, and a rule engine that starts
//! recordings and archives on every discovered target a rule matches.

// Core modules
pub mod app;
pub mod automation;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod loopback;
pub mod notifications;
pub mod recordings;
pub mod target_control;

// Re-export commonly used types
pub use app::{ControlPlane, ControlPlaneBuilder};
pub use automation::{RuleEngine, RuleRepository, SqliteRuleRepository};
pub use config::ControlPlaneConfig;
pub use connection::{ConnectionManager, RetryPolicy};
pub use discovery::{DiscoveryEvent, PlatformStrategy, StaticDiscovery};
pub use error::{AutomationError, ConnectionError, RecordingError};
pub use notifications::{Notification, NotificationCategory, NotificationSink};
pub use recordings::{ArchiveStore, RecordingManager};
pub use target_control::{ConnectionFactory, ControlChannel};
