//! In-process targets.
//!
//! `LoopbackFactory` implements the connection contracts against simulated
//! targets held in memory. It backs the standalone server and the test
//! suites, and counts physical opens and disconnects so pooling behavior
//! can be observed.

use async_trait::async_trait;
use log::debug;
use parking_lot::{Mutex, RwLock};
use rule_engine::{Credentials, TargetId, TemplateType};
use std::collections::{BTreeMap, HashMap};
use std::io::{self, Cursor};
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};

use crate::target_control::{
    ChannelError, ChannelResult, ConnectionFactory, ControlChannel, EventSettings,
    RecordingDescriptor, RecordingOptions, RecordingState, RecordingStream, Template,
};

/// How a simulated target handles snapshot requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotBehavior {
    #[default]
    Normal,
    /// The snapshot is created but never takes the name it is given
    Unregistered,
    /// The snapshot is created with no content
    Empty,
    /// Reading the snapshot's content fails
    Unreadable,
}

/// Content stream that fails on the first read.
struct BrokenStream;

impl AsyncRead for BrokenStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "snapshot content unavailable",
        )))
    }
}

#[derive(Debug, Clone)]
struct StoredRecording {
    descriptor: RecordingDescriptor,
    events: Option<EventSettings>,
}

#[derive(Debug)]
struct TargetState {
    next_id: i64,
    recordings: BTreeMap<i64, StoredRecording>,
    templates: Vec<Template>,
    event_types: Vec<String>,
    snapshots: SnapshotBehavior,
    payload: Vec<u8>,
    closed: Vec<i64>,
}

/// A simulated profiled process.
#[derive(Debug)]
pub struct LoopbackTarget {
    state: Mutex<TargetState>,
}

impl Default for LoopbackTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTarget {
    /// A target offering the `Continuous` and `Profiling` templates.
    pub fn new() -> Self {
        let template = |name: &str, description: &str| Template {
            name: name.to_string(),
            description: description.to_string(),
            provider: "Loopback".to_string(),
            template_type: TemplateType::Target,
        };
        Self {
            state: Mutex::new(TargetState {
                next_id: 1,
                recordings: BTreeMap::new(),
                templates: vec![
                    template("Continuous", "Low overhead configuration safe for continuous use"),
                    template("Profiling", "Low overhead configuration for profiling"),
                ],
                event_types: vec![
                    "jdk.CPULoad".to_string(),
                    "jdk.GarbageCollection".to_string(),
                    "jdk.ThreadPark".to_string(),
                ],
                snapshots: SnapshotBehavior::Normal,
                payload: b"FLR\0loopback-recording".to_vec(),
                closed: Vec::new(),
            }),
        }
    }

    pub fn with_template(self, template: Template) -> Self {
        self.state.lock().templates.push(template);
        self
    }

    pub fn set_snapshot_behavior(&self, behavior: SnapshotBehavior) {
        self.state.lock().snapshots = behavior;
    }

    /// Content served for every non-empty recording.
    pub fn set_payload(&self, payload: impl Into<Vec<u8>>) {
        self.state.lock().payload = payload.into();
    }

    pub fn recordings(&self) -> Vec<RecordingDescriptor> {
        self.state
            .lock()
            .recordings
            .values()
            .map(|r| r.descriptor.clone())
            .collect()
    }

    pub fn recording(&self, name: &str) -> Option<RecordingDescriptor> {
        self.recordings().into_iter().find(|r| r.name == name)
    }

    /// Event settings a recording was started with.
    pub fn events_of(&self, name: &str) -> Option<EventSettings> {
        self.state
            .lock()
            .recordings
            .values()
            .find(|r| r.descriptor.name == name)
            .and_then(|r| r.events.clone())
    }

    /// Ids passed to `close_recording`, in call order.
    pub fn closed_ids(&self) -> Vec<i64> {
        self.state.lock().closed.clone()
    }

    /// Adds a recording as if started out of band.
    pub fn insert_recording(&self, name: &str, state: RecordingState) -> RecordingDescriptor {
        let mut target = self.state.lock();
        let id = target.next_id;
        target.next_id += 1;
        let descriptor = RecordingDescriptor {
            id,
            name: name.to_string(),
            state,
            options: RecordingOptions::builder(name).build(),
            is_snapshot: false,
        };
        target.recordings.insert(
            id,
            StoredRecording {
                descriptor: descriptor.clone(),
                events: None,
            },
        );
        descriptor
    }
}

// ================================================================================================
// CHANNEL
// ================================================================================================

struct LoopbackChannel {
    id: TargetId,
    target: Arc<LoopbackTarget>,
    disconnects: Arc<AtomicUsize>,
}

fn no_such_recording(id: i64) -> ChannelError {
    ChannelError::new(format!("no recording with id {}", id))
}

#[async_trait]
impl ControlChannel for LoopbackChannel {
    async fn list_recordings(&mut self) -> ChannelResult<Vec<RecordingDescriptor>> {
        Ok(self.target.recordings())
    }

    async fn open_stream(&mut self, name: &str, _raw: bool) -> ChannelResult<Option<RecordingStream>> {
        let state = self.target.state.lock();
        let Some(recording) = state.recordings.values().find(|r| r.descriptor.name == name) else {
            return Ok(None);
        };
        let stream: RecordingStream = match (recording.descriptor.is_snapshot, state.snapshots) {
            (true, SnapshotBehavior::Empty) => Box::new(Cursor::new(Vec::new())),
            (true, SnapshotBehavior::Unreadable) => Box::new(BrokenStream),
            _ => Box::new(Cursor::new(state.payload.clone())),
        };
        Ok(Some(stream))
    }

    async fn close_recording(&mut self, id: i64) -> ChannelResult<()> {
        let mut state = self.target.state.lock();
        state.closed.push(id);
        state
            .recordings
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| no_such_recording(id))
    }

    async fn stop_recording(&mut self, id: i64) -> ChannelResult<()> {
        let mut state = self.target.state.lock();
        let recording = state.recordings.get_mut(&id).ok_or_else(|| no_such_recording(id))?;
        recording.descriptor.state = RecordingState::Stopped;
        Ok(())
    }

    async fn get_snapshot_recording(&mut self) -> ChannelResult<RecordingDescriptor> {
        let mut state = self.target.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        let name = format!("Snapshot {}", id);
        let descriptor = RecordingDescriptor {
            id,
            name: name.clone(),
            state: RecordingState::Stopped,
            options: RecordingOptions::builder(name).to_disk(true).build(),
            is_snapshot: true,
        };
        state.recordings.insert(
            id,
            StoredRecording {
                descriptor: descriptor.clone(),
                events: None,
            },
        );
        Ok(descriptor)
    }

    async fn update_recording_options(
        &mut self,
        id: i64,
        options: &RecordingOptions,
    ) -> ChannelResult<()> {
        let mut state = self.target.state.lock();
        let unregistered = state.snapshots == SnapshotBehavior::Unregistered;
        let recording = state.recordings.get_mut(&id).ok_or_else(|| no_such_recording(id))?;
        if recording.descriptor.is_snapshot && unregistered {
            return Ok(());
        }
        recording.descriptor.options = options.clone();
        recording.descriptor.name = options.name.clone();
        Ok(())
    }

    async fn start_recording(
        &mut self,
        options: &RecordingOptions,
        events: &EventSettings,
    ) -> ChannelResult<RecordingDescriptor> {
        let mut state = self.target.state.lock();
        if state.recordings.values().any(|r| r.descriptor.name == options.name) {
            return Err(ChannelError::new(format!(
                "recording {} already exists",
                options.name
            )));
        }
        let id = state.next_id;
        state.next_id += 1;
        let descriptor = RecordingDescriptor {
            id,
            name: options.name.clone(),
            state: RecordingState::Running,
            options: options.clone(),
            is_snapshot: false,
        };
        state.recordings.insert(
            id,
            StoredRecording {
                descriptor: descriptor.clone(),
                events: Some(events.clone()),
            },
        );
        Ok(descriptor)
    }

    async fn list_templates(&mut self) -> ChannelResult<Vec<Template>> {
        Ok(self.target.state.lock().templates.clone())
    }

    async fn list_event_types(&mut self) -> ChannelResult<Vec<String>> {
        Ok(self.target.state.lock().event_types.clone())
    }

    async fn disconnect(&mut self) {
        debug!("Loopback channel to {} disconnected", self.id);
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

// ================================================================================================
// FACTORY
// ================================================================================================

/// Opens channels to registered loopback targets.
#[derive(Default)]
pub struct LoopbackFactory {
    targets: RwLock<HashMap<TargetId, Arc<LoopbackTarget>>>,
    credentials: RwLock<HashMap<TargetId, Credentials>>,
    opens: AtomicUsize,
    disconnects: Arc<AtomicUsize>,
    failures: AtomicU32,
    open_delay: Mutex<Duration>,
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a target under `id` and returns it.
    pub fn register(&self, id: impl Into<TargetId>) -> Arc<LoopbackTarget> {
        let target = Arc::new(LoopbackTarget::new());
        self.targets.write().insert(id.into(), Arc::clone(&target));
        target
    }

    pub fn unregister(&self, id: &TargetId) -> bool {
        self.targets.write().remove(id).is_some()
    }

    pub fn target(&self, id: &TargetId) -> Option<Arc<LoopbackTarget>> {
        self.targets.read().get(id).cloned()
    }

    /// Opens to `id` will be refused unless these credentials are supplied.
    pub fn require_credentials(&self, id: impl Into<TargetId>, credentials: Credentials) {
        self.credentials.write().insert(id.into(), credentials);
    }

    /// The next `count` opens fail regardless of target.
    pub fn fail_next_opens(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Every open waits this long before completing.
    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock() = delay;
    }

    /// Physical open attempts so far, failed ones included.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory for LoopbackFactory {
    async fn open(
        &self,
        target: &TargetId,
        credentials: Option<&Credentials>,
    ) -> ChannelResult<Box<dyn ControlChannel>> {
        let delay = *self.open_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.opens.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ChannelError::new(format!("connection to {} refused", target)));
        }

        if let Some(required) = self.credentials.read().get(target) {
            if credentials != Some(required) {
                return Err(ChannelError::new(format!(
                    "authentication failed for {}",
                    target
                )));
            }
        }

        let loopback = self
            .target(target)
            .ok_or_else(|| ChannelError::new(format!("no target listening at {}", target)))?;
        Ok(Box::new(LoopbackChannel {
            id: target.clone(),
            target: loopback,
            disconnects: Arc::clone(&self.disconnects),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_unknown_target_is_refused() {
        let factory = LoopbackFactory::new();
        let result = factory.open(&TargetId::new("service:jmx:rmi:///missing"), None).await;
        assert!(result.is_err());
        assert_eq!(factory.open_count(), 1);
    }

    #[tokio::test]
    async fn test_failures_are_consumed() {
        let factory = LoopbackFactory::new();
        let id = TargetId::new("loop://a");
        factory.register(id.clone());
        factory.fail_next_opens(2);

        assert!(factory.open(&id, None).await.is_err());
        assert!(factory.open(&id, None).await.is_err());
        assert!(factory.open(&id, None).await.is_ok());
        assert_eq!(factory.open_count(), 3);
    }

    #[tokio::test]
    async fn test_credentials_are_checked() {
        let factory = LoopbackFactory::new();
        let id = TargetId::new("loop://secure");
        factory.register(id.clone());
        factory.require_credentials(id.clone(), Credentials::new("admin", "secret"));

        assert!(factory.open(&id, None).await.is_err());
        assert!(factory
            .open(&id, Some(&Credentials::new("admin", "wrong")))
            .await
            .is_err());
        assert!(factory
            .open(&id, Some(&Credentials::new("admin", "secret")))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_channel_recording_lifecycle() {
        let factory = LoopbackFactory::new();
        let id = TargetId::new("loop://a");
        let target = factory.register(id.clone());
        let mut channel = factory.open(&id, None).await.unwrap();

        let options = RecordingOptions::builder("r1").build();
        let events = EventSettings::Template {
            name: "Continuous".to_string(),
            template_type: None,
        };
        let started = channel.start_recording(&options, &events).await.unwrap();
        assert_eq!(started.state, RecordingState::Running);
        assert!(channel.start_recording(&options, &events).await.is_err());

        let mut content = Vec::new();
        channel
            .open_stream("r1", false)
            .await
            .unwrap()
            .unwrap()
            .read_to_end(&mut content)
            .await
            .unwrap();
        assert!(!content.is_empty());

        channel.stop_recording(started.id).await.unwrap();
        assert_eq!(target.recording("r1").unwrap().state, RecordingState::Stopped);

        channel.close_recording(started.id).await.unwrap();
        assert!(target.recordings().is_empty());
        assert!(channel.close_recording(started.id).await.is_err());

        channel.disconnect().await;
        assert_eq!(factory.disconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_snapshots_have_no_content() {
        let factory = LoopbackFactory::new();
        let id = TargetId::new("loop://a");
        let target = factory.register(id.clone());
        target.set_snapshot_behavior(SnapshotBehavior::Empty);
        let mut channel = factory.open(&id, None).await.unwrap();

        let snapshot = channel.get_snapshot_recording().await.unwrap();
        let mut content = Vec::new();
        channel
            .open_stream(&snapshot.name, false)
            .await
            .unwrap()
            .unwrap()
            .read_to_end(&mut content)
            .await
            .unwrap();
        assert!(content.is_empty());
    }
}
