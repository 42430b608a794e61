//! Periodic archival of rule-started recordings.

use log::{debug, info, warn};
use rule_engine::{Rule, Target};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{ConnectionError, RecordingError};
use crate::recordings::RecordingManager;

/// Longest interval between archives; larger periods are clamped to it.
pub const MAX_ARCHIVAL_PERIOD: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// The archival interval for a rule's `archivalPeriodSeconds`, at least one
/// second and at most `MAX_ARCHIVAL_PERIOD`.
pub fn archival_period(seconds: i64) -> Duration {
    Duration::from_secs(seconds.max(1) as u64).min(MAX_ARCHIVAL_PERIOD)
}

/// Deletes the oldest names beyond `keep`. `keep == 0` means unbounded.
/// Returns the names deleted.
pub async fn prune_oldest(
    recordings: &RecordingManager,
    target: &Target,
    archived: &mut VecDeque<String>,
    keep: usize,
) -> Vec<String> {
    let mut pruned = Vec::new();
    if keep == 0 {
        return pruned;
    }
    while archived.len() > keep {
        let Some(oldest) = archived.pop_front() else {
            break;
        };
        match recordings.delete_archive(target.id(), &oldest).await {
            Ok(_) => {
                debug!("Pruned archive {} for {}", oldest, target.id());
                pruned.push(oldest);
            }
            Err(e) => warn!("Failed to prune archive {} for {}: {}", oldest, target.id(), e),
        }
    }
    pruned
}

/// Archives of `recording` already present for the target, oldest first.
pub async fn existing_archives(
    recordings: &RecordingManager,
    target: &Target,
    recording: &str,
) -> VecDeque<String> {
    let marker = format!("_{}_", recording);
    match recordings.list_archived(target.id()).await {
        Ok(archives) => archives
            .into_iter()
            .filter(|a| a.name.contains(&marker))
            .map(|a| a.name)
            .collect(),
        Err(e) => {
            warn!("Could not list archives for {}: {}", target.id(), e);
            VecDeque::new()
        }
    }
}

/// Copies a rule's recording to the archive store every
/// `archivalPeriodSeconds`, keeping at most `preservedArchives` copies.
pub struct PeriodicArchiver {
    recordings: RecordingManager,
    rule: Arc<Rule>,
    target: Target,
    archived: VecDeque<String>,
    cancel: CancellationToken,
}

impl PeriodicArchiver {
    pub fn new(
        recordings: RecordingManager,
        rule: Arc<Rule>,
        target: Target,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            recordings,
            rule,
            target,
            archived: VecDeque::new(),
            cancel,
        }
    }

    /// Runs until cancelled or the recording disappears.
    pub async fn run(mut self) {
        let recording = self.rule.recording_name();
        self.archived = existing_archives(&self.recordings, &self.target, &recording).await;

        let period = archival_period(self.rule.archival_period_seconds());
        info!(
            "Archiving {} on {} every {:?}",
            recording,
            self.target.id(),
            period
        );

        let now = tokio::time::Instant::now();
        let start = now.checked_add(period).unwrap_or(now);
        let mut ticker = tokio::time::interval_at(start, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.cancel.cancelled() => break,
            }

            match self.archive_once().await {
                Ok(()) => {}
                Err(RecordingError::NotFound { .. }) => {
                    info!(
                        "Recording {} is gone from {}, stopping archiver",
                        recording,
                        self.target.id()
                    );
                    break;
                }
                Err(RecordingError::Connection(ConnectionError::Cancelled(_)))
                | Err(RecordingError::Connection(ConnectionError::Closed)) => break,
                Err(e) => warn!(
                    "Periodic archive of {} on {} failed: {}",
                    recording,
                    self.target.id(),
                    e
                ),
            }
        }
        debug!("Archiver for {} on {} stopped", recording, self.target.id());
    }

    /// Archives the recording once and prunes.
    pub async fn archive_once(&mut self) -> Result<(), RecordingError> {
        let archived = self
            .recordings
            .archive_recording(
                &self.target.descriptor(),
                &self.rule.recording_name(),
                self.target.alias(),
            )
            .await?;
        self.archived.push_back(archived.name);

        let keep = self.rule.preserved_archives().max(0) as usize;
        prune_oldest(&self.recordings, &self.target, &mut self.archived, keep).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archival_period_is_bounded() {
        assert_eq!(archival_period(10), Duration::from_secs(10));
        assert_eq!(archival_period(0), Duration::from_secs(1));
        assert_eq!(archival_period(-5), Duration::from_secs(1));
        assert_eq!(archival_period(i64::MAX), MAX_ARCHIVAL_PERIOD);
    }
}
