//! Recording lifecycle operations on targets.
//!
//! Each operation is one unit of work through the connection manager, so
//! calls against one target are serialized and calls against different
//! targets run in parallel.

use chrono::Utc;
use log::{info, warn};
use rule_engine::{ConnectionDescriptor, TargetId, TemplateType};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

use super::archive::{ArchiveStore, ArchivedRecording};
use crate::connection::{ConnectedChannel, ConnectionManager, LeasedStream};
use crate::error::RecordingError;
use crate::notifications::{Notification, NotificationCategory, NotificationSink};
use crate::target_control::{
    ChannelError, EventSettings, RecordingDescriptor, RecordingOptions, RecordingState,
    SnapshotDescriptor, Template, ALL_EVENTS_TEMPLATE,
};

fn channel_error(target: &TargetId, e: ChannelError) -> RecordingError {
    RecordingError::Target {
        target: target.clone(),
        reason: e.to_string(),
    }
}

/// What to do when a recording with the requested name already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacementPolicy {
    /// Fail with `AlreadyExists`
    Never,
    /// Close the existing recording and start a fresh one
    Always,
}

/// A recording start request.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub options: RecordingOptions,
    pub template: String,
    pub template_type: Option<TemplateType>,
    pub replace: ReplacementPolicy,
}

impl StartRequest {
    pub fn new(options: RecordingOptions, template: impl Into<String>) -> Self {
        Self {
            options,
            template: template.into(),
            template_type: None,
            replace: ReplacementPolicy::Never,
        }
    }

    pub fn template_type(mut self, template_type: Option<TemplateType>) -> Self {
        self.template_type = template_type;
        self
    }

    pub fn replace(mut self, replace: ReplacementPolicy) -> Self {
        self.replace = replace;
        self
    }
}

/// Archive file name: `<alias>_<recording>_<UTC timestamp>.jfr`.
pub fn archive_file_name(alias: &str, recording: &str) -> String {
    let safe = |s: &str| -> String {
        s.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
            .collect()
    };
    format!(
        "{}_{}_{}.jfr",
        safe(alias),
        safe(recording),
        Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
    )
}

#[derive(Clone)]
pub struct RecordingManager {
    connections: ConnectionManager,
    archives: Arc<dyn ArchiveStore>,
    notifications: Arc<dyn NotificationSink>,
}

impl RecordingManager {
    pub fn new(
        connections: ConnectionManager,
        archives: Arc<dyn ArchiveStore>,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            connections,
            archives,
            notifications,
        }
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    fn notify(&self, category: NotificationCategory, payload: serde_json::Value) {
        self.notifications.send(Notification::new(category, payload));
    }

    // ============================================================================================
    // READ
    // ============================================================================================

    pub async fn list_recordings(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Vec<RecordingDescriptor>, RecordingError> {
        self.connections
            .with_connection(descriptor, |mut channel: ConnectedChannel| async move {
                let target = channel.target().clone();
                channel
                    .list_recordings()
                    .await
                    .map_err(|e| channel_error(&target, e))
            })
            .await
    }

    /// Opens a recording's content. `None` when there is no such recording.
    ///
    /// The stream holds a lease on the connection until dropped.
    pub async fn get_recording(
        &self,
        descriptor: &ConnectionDescriptor,
        name: &str,
    ) -> Result<Option<LeasedStream>, RecordingError> {
        self.connections
            .with_connection(descriptor, |mut channel: ConnectedChannel| async move {
                let target = channel.target().clone();
                let stream = channel
                    .open_stream(name, false)
                    .await
                    .map_err(|e| channel_error(&target, e))?;
                Ok::<_, RecordingError>(stream.map(|s| LeasedStream::new(s, channel.lease())))
            })
            .await
    }

    /// The target's templates plus the synthetic `ALL` template.
    pub async fn list_templates(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Vec<Template>, RecordingError> {
        let mut templates = self
            .connections
            .with_connection(descriptor, |mut channel: ConnectedChannel| async move {
                let target = channel.target().clone();
                channel
                    .list_templates()
                    .await
                    .map_err(|e| channel_error(&target, e))
            })
            .await?;
        templates.push(Template::all_events());
        Ok(templates)
    }

    // ============================================================================================
    // START / STOP / DELETE
    // ============================================================================================

    pub async fn start_recording(
        &self,
        descriptor: &ConnectionDescriptor,
        request: StartRequest,
    ) -> Result<RecordingDescriptor, RecordingError> {
        let started = self
            .connections
            .with_connection(descriptor, |mut channel: ConnectedChannel| async move {
                let target = channel.target().clone();
                let err = |e| channel_error(&target, e);

                let existing = channel.list_recordings().await.map_err(err)?;
                if let Some(previous) = existing.iter().find(|r| r.name == request.options.name) {
                    match request.replace {
                        ReplacementPolicy::Never => {
                            return Err(RecordingError::AlreadyExists {
                                target: target.clone(),
                                name: previous.name.clone(),
                            })
                        }
                        ReplacementPolicy::Always => {
                            info!("Replacing recording {} on {}", previous.name, target);
                            channel.close_recording(previous.id).await.map_err(err)?;
                        }
                    }
                }

                let events = if request.template == ALL_EVENTS_TEMPLATE {
                    EventSettings::Events(channel.list_event_types().await.map_err(err)?)
                } else {
                    let templates = channel.list_templates().await.map_err(err)?;
                    let known = templates.iter().any(|t| {
                        t.name == request.template
                            && request.template_type.map_or(true, |ty| ty == t.template_type)
                    });
                    if !known {
                        return Err(RecordingError::UnknownTemplate {
                            target: target.clone(),
                            template: request.template.clone(),
                        });
                    }
                    EventSettings::Template {
                        name: request.template.clone(),
                        template_type: request.template_type,
                    }
                };

                channel
                    .start_recording(&request.options, &events)
                    .await
                    .map_err(err)
            })
            .await?;

        info!(
            "Started recording {} on {}",
            started.name,
            descriptor.target_id()
        );
        self.notify(
            NotificationCategory::RecordingCreated,
            json!({ "target": descriptor.target_id(), "recording": &started }),
        );
        Ok(started)
    }

    pub async fn stop_recording(
        &self,
        descriptor: &ConnectionDescriptor,
        name: &str,
    ) -> Result<RecordingDescriptor, RecordingError> {
        let stopped = self
            .connections
            .with_connection(descriptor, |mut channel: ConnectedChannel| async move {
                let target = channel.target().clone();
                let err = |e| channel_error(&target, e);

                let mut recording = channel
                    .list_recordings()
                    .await
                    .map_err(err)?
                    .into_iter()
                    .find(|r| r.name == name)
                    .ok_or_else(|| RecordingError::NotFound {
                        target: target.clone(),
                        name: name.to_string(),
                    })?;

                if recording.state == RecordingState::Running {
                    channel.stop_recording(recording.id).await.map_err(err)?;
                    recording.state = RecordingState::Stopped;
                }
                Ok::<_, RecordingError>(recording)
            })
            .await?;

        self.notify(
            NotificationCategory::RecordingStopped,
            json!({ "target": descriptor.target_id(), "recording": &stopped }),
        );
        Ok(stopped)
    }

    /// Closes the recording on the target, then deletes archived copies
    /// stored under the same (target, name).
    pub async fn delete_recording(
        &self,
        descriptor: &ConnectionDescriptor,
        name: &str,
    ) -> Result<(), RecordingError> {
        let deleted = self
            .connections
            .with_connection(descriptor, |mut channel: ConnectedChannel| async move {
                let target = channel.target().clone();
                let err = |e| channel_error(&target, e);

                let recording = channel
                    .list_recordings()
                    .await
                    .map_err(err)?
                    .into_iter()
                    .find(|r| r.name == name)
                    .ok_or_else(|| RecordingError::NotFound {
                        target: target.clone(),
                        name: name.to_string(),
                    })?;
                channel.close_recording(recording.id).await.map_err(err)?;
                Ok::<_, RecordingError>(recording)
            })
            .await?;

        let target = descriptor.target_id();
        if let Err(e) = self.archives.delete(target, name).await {
            warn!(
                "Recording {} closed on {} but archive cleanup failed: {}",
                name, target, e
            );
        }

        let category = if deleted.is_snapshot {
            NotificationCategory::SnapshotDeleted
        } else {
            NotificationCategory::RecordingDeleted
        };
        info!("Deleted recording {} on {}", name, target);
        self.notify(category, json!({ "target": target, "recording": name }));
        Ok(())
    }

    // ============================================================================================
    // SNAPSHOTS
    // ============================================================================================

    /// Takes a snapshot and names it with the next free `snapshot-N`.
    ///
    /// If the target does not list the renamed snapshot afterwards, the
    /// handle is closed and `SnapshotCreation` returned. There is no retry.
    pub async fn create_snapshot(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<SnapshotDescriptor, RecordingError> {
        let snapshot = self
            .connections
            .with_connection(descriptor, |mut channel: ConnectedChannel| async move {
                let target = channel.target().clone();
                let failed = |reason: String| RecordingError::SnapshotCreation {
                    target: target.clone(),
                    reason,
                };

                let handle = channel
                    .get_snapshot_recording()
                    .await
                    .map_err(|e| failed(e.to_string()))?;

                let taken: HashSet<String> = match channel.list_recordings().await {
                    Ok(existing) => existing
                        .into_iter()
                        .filter(|r| r.id != handle.id)
                        .map(|r| r.name)
                        .collect(),
                    Err(e) => {
                        discard_snapshot(&mut channel, &target, handle.id).await;
                        return Err(failed(e.to_string()));
                    }
                };
                let name = next_free_name("snapshot", handle.id, &taken);

                let options = RecordingOptions::builder(&name)
                    .to_disk(handle.options.to_disk.unwrap_or(true))
                    .build();
                if let Err(e) = channel.update_recording_options(handle.id, &options).await {
                    discard_snapshot(&mut channel, &target, handle.id).await;
                    return Err(failed(e.to_string()));
                }

                let listed = channel
                    .list_recordings()
                    .await
                    .ok()
                    .and_then(|all| all.into_iter().find(|r| r.name == name));
                match listed {
                    Some(snapshot) => Ok(snapshot),
                    None => {
                        discard_snapshot(&mut channel, &target, handle.id).await;
                        Err(failed(format!(
                            "snapshot {} was not registered by the target",
                            name
                        )))
                    }
                }
            })
            .await?;

        info!(
            "Created snapshot {} on {}",
            snapshot.name,
            descriptor.target_id()
        );
        self.notify(
            NotificationCategory::SnapshotCreated,
            json!({ "target": descriptor.target_id(), "recording": &snapshot }),
        );
        Ok(snapshot)
    }

    /// Checks that a snapshot is readable.
    ///
    /// Returns true if at least one byte could be read. An empty or
    /// unreadable snapshot is deleted and false returned.
    pub async fn verify_snapshot(
        &self,
        descriptor: &ConnectionDescriptor,
        name: &str,
    ) -> Result<bool, RecordingError> {
        let mut stream = match self.get_recording(descriptor, name).await? {
            Some(stream) => stream,
            None => {
                return Err(RecordingError::SnapshotCreation {
                    target: descriptor.target_id().clone(),
                    reason: format!("snapshot {} no longer exists", name),
                })
            }
        };

        let mut first = [0u8; 1];
        let readable = matches!(stream.read(&mut first).await, Ok(n) if n > 0);
        drop(stream);

        if readable {
            return Ok(true);
        }
        warn!(
            "Snapshot {} on {} is unreadable, deleting it",
            name,
            descriptor.target_id()
        );
        self.delete_recording(descriptor, name).await?;
        Ok(false)
    }

    /// `create_snapshot` followed by `verify_snapshot`. `None` if the new
    /// snapshot was unreadable (and has been removed).
    pub async fn create_verified_snapshot(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Option<SnapshotDescriptor>, RecordingError> {
        let snapshot = self.create_snapshot(descriptor).await?;
        if self.verify_snapshot(descriptor, &snapshot.name).await? {
            Ok(Some(snapshot))
        } else {
            Ok(None)
        }
    }

    // ============================================================================================
    // ARCHIVES
    // ============================================================================================

    /// Copies a recording's content into the archive store.
    pub async fn archive_recording(
        &self,
        descriptor: &ConnectionDescriptor,
        name: &str,
        alias: &str,
    ) -> Result<ArchivedRecording, RecordingError> {
        let target = descriptor.target_id();
        let mut stream = self
            .get_recording(descriptor, name)
            .await?
            .ok_or_else(|| RecordingError::NotFound {
                target: target.clone(),
                name: name.to_string(),
            })?;

        let taken: HashSet<String> = self
            .list_archived(target)
            .await?
            .into_iter()
            .map(|a| a.name)
            .collect();
        let file_name = unused_archive_name(archive_file_name(alias, name), &taken);
        let archived = self
            .archives
            .store(target, &file_name, &mut stream)
            .await
            .map_err(|e| RecordingError::Archive(format!("storing {}: {}", file_name, e)))?;
        info!(
            "Archived recording {} on {} as {} ({} bytes)",
            name, target, archived.name, archived.size
        );
        Ok(archived)
    }

    pub async fn list_archived(
        &self,
        target: &TargetId,
    ) -> Result<Vec<ArchivedRecording>, RecordingError> {
        self.archives
            .list_archived(target)
            .await
            .map_err(|e| RecordingError::Archive(e.to_string()))
    }

    pub async fn delete_archive(&self, target: &TargetId, name: &str) -> Result<bool, RecordingError> {
        self.archives
            .delete(target, name)
            .await
            .map_err(|e| RecordingError::Archive(e.to_string()))
    }
}

/// `<base>-<n>` for the first n >= start not in `taken`.
fn next_free_name(base: &str, start: i64, taken: &HashSet<String>) -> String {
    let mut n = start;
    loop {
        let candidate = format!("{}-{}", base, n);
        if !taken.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// `name`, or `<stem>.<n>.jfr` for the first n >= 1 not in `taken`.
fn unused_archive_name(name: String, taken: &HashSet<String>) -> String {
    if !taken.contains(&name) {
        return name;
    }
    let stem = name.strip_suffix(".jfr").unwrap_or(name.as_str());
    let mut n = 1;
    loop {
        let candidate = format!("{}.{}.jfr", stem, n);
        if !taken.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

// Partially created snapshots are closed; a failure to do so is only logged.
async fn discard_snapshot(channel: &mut ConnectedChannel, target: &TargetId, id: i64) {
    if let Err(e) = channel.close_recording(id).await {
        warn!("Failed to close orphaned snapshot {} on {}: {}", id, target, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_free_name() {
        let taken: HashSet<String> = ["snapshot-1", "snapshot-2"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(next_free_name("snapshot", 1, &taken), "snapshot-3");
        assert_eq!(next_free_name("snapshot", 5, &taken), "snapshot-5");
        assert_eq!(next_free_name("snapshot", 1, &HashSet::new()), "snapshot-1");
    }

    #[test]
    fn test_unused_archive_name() {
        let taken: HashSet<String> = ["a_r_1.jfr", "a_r_1.1.jfr"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(unused_archive_name("a_r_2.jfr".to_string(), &taken), "a_r_2.jfr");
        assert_eq!(unused_archive_name("a_r_1.jfr".to_string(), &taken), "a_r_1.2.jfr");
    }

    #[test]
    fn test_archive_file_name() {
        let name = archive_file_name("my app", "auto_rule");
        assert!(name.starts_with("my-app_auto_rule_"));
        assert!(name.ends_with("Z.jfr"));
    }
}
