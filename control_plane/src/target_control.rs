//! Contracts for talking to a target over its control channel.
//!
//! The wire protocol lives behind `ConnectionFactory` and `ControlChannel`;
//! everything in this crate only sees these traits and the plain data
//! types below.

use async_trait::async_trait;
use rule_engine::{Credentials, TargetId, TemplateType};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::io::AsyncRead;

/// Name of the synthetic template that enables every event type.
pub const ALL_EVENTS_TEMPLATE: &str = "ALL";

/// Error reported by a control channel or connection factory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ChannelError(pub String);

impl ChannelError {
    pub fn new(reason: impl Into<String>) -> Self {
        ChannelError(reason.into())
    }
}

pub type ChannelResult<T> = Result<T, ChannelError>;

/// Byte stream of a recording's content.
pub type RecordingStream = Box<dyn AsyncRead + Send + Unpin>;

// ================================================================================================
// RECORDING DATA
// ================================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordingState {
    Running,
    Stopped,
}

impl fmt::Display for RecordingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordingState::Running => write!(f, "RUNNING"),
            RecordingState::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Options applied to a recording when it is started or updated.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingOptions {
    pub name: String,
    pub to_disk: Option<bool>,
    pub max_age_seconds: Option<u64>,
    pub max_size_bytes: Option<u64>,
    /// No fixed duration
    pub continuous: bool,
}

impl RecordingOptions {
    pub fn builder(name: impl Into<String>) -> RecordingOptionsBuilder {
        RecordingOptionsBuilder::new(name)
    }
}

/// Builder for RecordingOptions.
#[derive(Debug, Clone)]
pub struct RecordingOptionsBuilder {
    options: RecordingOptions,
}

impl RecordingOptionsBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            options: RecordingOptions {
                name: name.into(),
                continuous: true,
                ..Default::default()
            },
        }
    }

    pub fn to_disk(mut self, to_disk: bool) -> Self {
        self.options.to_disk = Some(to_disk);
        self
    }

    /// Non-positive values leave the limit unset.
    pub fn max_age_seconds(mut self, seconds: i64) -> Self {
        self.options.max_age_seconds = u64::try_from(seconds).ok().filter(|s| *s > 0);
        self
    }

    /// Non-positive values leave the limit unset.
    pub fn max_size_bytes(mut self, bytes: i64) -> Self {
        self.options.max_size_bytes = u64::try_from(bytes).ok().filter(|b| *b > 0);
        self
    }

    pub fn continuous(mut self, continuous: bool) -> Self {
        self.options.continuous = continuous;
        self
    }

    pub fn build(self) -> RecordingOptions {
        self.options
    }
}

/// A recording as listed by the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingDescriptor {
    /// Target-assigned handle id
    pub id: i64,
    pub name: String,
    pub state: RecordingState,
    pub options: RecordingOptions,
    pub is_snapshot: bool,
}

/// Handle returned by a successful snapshot.
pub type SnapshotDescriptor = RecordingDescriptor;

/// An event template offered by the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub name: String,
    pub description: String,
    pub provider: String,
    #[serde(rename = "type")]
    pub template_type: TemplateType,
}

impl Template {
    /// The synthetic `ALL` template listed next to the target's own templates.
    pub fn all_events() -> Self {
        Template {
            name: ALL_EVENTS_TEMPLATE.to_string(),
            description: "Enable all available events in the target, with default option values. \
                          This will create a large amount of data, and some events may cause high \
                          overhead in the target."
                .to_string(),
            provider: "flightdeck".to_string(),
            template_type: TemplateType::Target,
        }
    }
}

/// What a started recording should capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventSettings {
    /// A named template known to the target
    Template {
        name: String,
        template_type: Option<TemplateType>,
    },
    /// An explicit list of event type ids, each enabled with defaults
    Events(Vec<String>),
}

// ================================================================================================
// CONTRACTS
// ================================================================================================

/// An open control channel to one target.
///
/// Callers hold exclusive access for the duration of a unit of work, hence
/// `&mut self` throughout.
#[async_trait]
pub trait ControlChannel: Send {
    async fn list_recordings(&mut self) -> ChannelResult<Vec<RecordingDescriptor>>;

    /// Opens the recording's content. `Ok(None)` if no such recording.
    async fn open_stream(&mut self, name: &str, raw: bool) -> ChannelResult<Option<RecordingStream>>;

    /// Closes (removes) a recording on the target.
    async fn close_recording(&mut self, id: i64) -> ChannelResult<()>;

    async fn stop_recording(&mut self, id: i64) -> ChannelResult<()>;

    /// Creates a snapshot of all currently recorded data and returns its handle.
    async fn get_snapshot_recording(&mut self) -> ChannelResult<RecordingDescriptor>;

    async fn update_recording_options(
        &mut self,
        id: i64,
        options: &RecordingOptions,
    ) -> ChannelResult<()>;

    async fn start_recording(
        &mut self,
        options: &RecordingOptions,
        events: &EventSettings,
    ) -> ChannelResult<RecordingDescriptor>;

    async fn list_templates(&mut self) -> ChannelResult<Vec<Template>>;

    /// Every event type id the target can record.
    async fn list_event_types(&mut self) -> ChannelResult<Vec<String>>;

    async fn disconnect(&mut self);
}

/// Opens control channels.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn open(
        &self,
        target: &TargetId,
        credentials: Option<&Credentials>,
    ) -> ChannelResult<Box<dyn ControlChannel>>;
}
