//! On-disk checkpoint store.

use super::{Checkpoint, CheckpointState, RunStatus, FORMAT_VERSION};
use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

const FILE_PREFIX: &str = "checkpoint-";
const FILE_SUFFIX: &str = ".json";

/// How persistence failures are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Delay before the second attempt; doubled each time after.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

/// Listing entry for a checkpoint; the band results are not loaded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointSummary {
    pub id: Uuid,
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub sequence: u64,
    pub status: RunStatus,
    pub completed_bands: usize,
    pub total_bands: usize,
    pub resumable: bool,
    pub path: PathBuf,
}

/// Just enough of a checkpoint file to list it.
#[derive(Deserialize)]
struct Header {
    id: Uuid,
    created_at: DateTime<Utc>,
    sequence: u64,
    format_version: u32,
    metadata: HeaderMetadata,
    execution: HeaderExecution,
}

#[derive(Deserialize)]
struct HeaderMetadata {
    run_id: Uuid,
}

#[derive(Deserialize)]
struct HeaderExecution {
    status: RunStatus,
    next_band: usize,
    total_bands: usize,
    resumable: bool,
}

/// Directory of checkpoint files with bounded retention.
#[derive(Debug)]
pub struct CheckpointManager {
    dir: PathBuf,
    retention: usize,
    sequence: AtomicU64,
    /// Serializes create, prune and delete.
    write_lock: Mutex<()>,
}

impl CheckpointManager {
    /// Open (creating if needed) a checkpoint directory.
    pub async fn open(dir: impl Into<PathBuf>, retention: usize) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| EngineError::persistence(&dir, e))?;

        let manager = Self {
            dir,
            retention: retention.max(1),
            sequence: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        };

        let next = manager
            .list()
            .await?
            .iter()
            .map(|s| s.sequence + 1)
            .max()
            .unwrap_or(0);
        manager.sequence.store(next, Ordering::SeqCst);

        debug!(
            "Opened checkpoint directory {} (next sequence {})",
            manager.dir.display(),
            next
        );
        Ok(manager)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    /// Persist `state` as a new checkpoint, then prune old ones.
    pub async fn create(&self, state: &CheckpointState) -> Result<Checkpoint> {
        let _guard = self.write_lock.lock().await;

        let checkpoint = Checkpoint {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            format_version: FORMAT_VERSION,
            remaining_bands: state.remaining_bands().to_vec(),
            state: state.clone(),
        };

        let bytes = serde_json::to_vec_pretty(&checkpoint)?;
        let file_name = format!(
            "{}{}-{:06}{}",
            FILE_PREFIX,
            checkpoint.created_at.format("%Y%m%dT%H%M%S%.3fZ"),
            checkpoint.sequence,
            FILE_SUFFIX
        );
        let path = self.dir.join(file_name);

        let dir = self.dir.clone();
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&dir, &target, &bytes))
            .await
            .map_err(|e| EngineError::persistence(&path, std::io::Error::other(e)))??;

        debug!(
            "Wrote checkpoint {} ({}, {} results)",
            checkpoint.id,
            checkpoint.state.execution.status,
            checkpoint.state.results.len()
        );

        self.prune_locked().await?;
        Ok(checkpoint)
    }

    /// [`create`](Self::create), retrying retryable failures with
    /// exponential backoff.
    pub async fn create_with_retry(
        &self,
        state: &CheckpointState,
        policy: RetryPolicy,
    ) -> Result<Checkpoint> {
        let attempts = policy.attempts.max(1);
        let mut delay = policy.base_delay;
        let mut attempt = 1;
        loop {
            match self.create(state).await {
                Ok(checkpoint) => return Ok(checkpoint),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(
                        "Checkpoint attempt {}/{} failed: {}; retrying in {:?}",
                        attempt, attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// All valid checkpoints, oldest first. Unreadable files are skipped.
    pub async fn list(&self) -> Result<Vec<CheckpointSummary>> {
        Ok(self.scan().await?.0)
    }

    /// Valid checkpoints, oldest first, and the checkpoint files that could
    /// not be read, parsed or have another format version.
    async fn scan(&self) -> Result<(Vec<CheckpointSummary>, Vec<PathBuf>)> {
        let mut summaries = Vec::new();
        let mut rejected = Vec::new();
        for path in self.checkpoint_files().await? {
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Skipping unreadable checkpoint {}: {}", path.display(), e);
                    rejected.push(path);
                    continue;
                }
            };
            match serde_json::from_slice::<Header>(&bytes) {
                Ok(header) if header.format_version == FORMAT_VERSION => {
                    summaries.push(CheckpointSummary {
                        id: header.id,
                        run_id: header.metadata.run_id,
                        created_at: header.created_at,
                        sequence: header.sequence,
                        status: header.execution.status,
                        completed_bands: header.execution.next_band,
                        total_bands: header.execution.total_bands,
                        resumable: header.execution.resumable,
                        path,
                    });
                }
                Ok(header) => {
                    warn!(
                        "Skipping checkpoint {} with format version {}",
                        path.display(),
                        header.format_version
                    );
                    rejected.push(path);
                }
                Err(e) => {
                    warn!("Skipping corrupt checkpoint {}: {}", path.display(), e);
                    rejected.push(path);
                }
            }
        }
        summaries.sort_by(|a, b| {
            a.sequence
                .cmp(&b.sequence)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok((summaries, rejected))
    }

    /// Most recent valid checkpoint, if any.
    pub async fn restore_latest(&self) -> Result<Option<Checkpoint>> {
        let summaries = self.list().await?;
        for summary in summaries.iter().rev() {
            match self.load(&summary.path).await {
                Ok(checkpoint) => return Ok(Some(checkpoint)),
                Err(e) => warn!("Skipping checkpoint {}: {}", summary.id, e),
            }
        }
        Ok(None)
    }

    /// Load a checkpoint by full id or unique id prefix.
    pub async fn restore(&self, id: &str) -> Result<Checkpoint> {
        let summary = self.find(id).await?;
        self.load(&summary.path).await
    }

    /// Remove a checkpoint by full id or unique id prefix.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let summary = self.find(id).await?;
        tokio::fs::remove_file(&summary.path)
            .await
            .map_err(|e| EngineError::persistence(&summary.path, e))?;
        info!("Deleted checkpoint {}", summary.id);
        Ok(())
    }

    async fn find(&self, id: &str) -> Result<CheckpointSummary> {
        let needle = id.trim().to_ascii_lowercase();
        let mut matches: Vec<CheckpointSummary> = self
            .list()
            .await?
            .into_iter()
            .filter(|s| !needle.is_empty() && s.id.to_string().starts_with(&needle))
            .collect();
        if matches.len() == 1 {
            Ok(matches.remove(0))
        } else {
            Err(EngineError::CheckpointNotFound { id: id.to_string() })
        }
    }

    async fn load(&self, path: &Path) -> Result<Checkpoint> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| EngineError::persistence(path, e))?;
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)?;
        if checkpoint.format_version != FORMAT_VERSION {
            return Err(EngineError::Serialization {
                context: "checkpoint",
                details: format!("unsupported format version {}", checkpoint.format_version),
            });
        }
        Ok(checkpoint)
    }

    /// Keep at most `retention` checkpoint files. Files that cannot be
    /// restored go first, oldest modification time first, then the oldest
    /// valid checkpoints. Caller holds the write lock.
    async fn prune_locked(&self) -> Result<()> {
        let (summaries, rejected) = self.scan().await?;
        let total = summaries.len() + rejected.len();
        if total <= self.retention {
            return Ok(());
        }
        let mut excess = total - self.retention;

        let mut stale = Vec::with_capacity(rejected.len());
        for path in rejected {
            let modified = tokio::fs::metadata(&path)
                .await
                .and_then(|m| m.modified())
                .ok();
            stale.push((modified, path));
        }
        stale.sort();
        for (_, path) in stale.into_iter().take(excess) {
            excess -= 1;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("Pruned unusable checkpoint file {}", path.display()),
                Err(e) => warn!("Failed to prune {}: {}", path.display(), e),
            }
        }

        for summary in summaries.iter().take(excess) {
            match tokio::fs::remove_file(&summary.path).await {
                Ok(()) => debug!("Pruned checkpoint {}", summary.id),
                Err(e) => warn!("Failed to prune {}: {}", summary.path.display(), e),
            }
        }
        Ok(())
    }

    async fn checkpoint_files(&self) -> Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| EngineError::persistence(&self.dir, e))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| EngineError::persistence(&self.dir, e))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(FILE_PREFIX) && name.ends_with(FILE_SUFFIX) {
                files.push(entry.path());
            }
        }
        Ok(files)
    }
}

/// Write `bytes` to a temp file in `dir`, fsync, then rename over `path`.
fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| EngineError::persistence(dir, e))?;
    tmp.write_all(bytes)
        .map_err(|e| EngineError::persistence(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| EngineError::persistence(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| EngineError::persistence(path, e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CurrentBandState, TestMetadata};
    use crate::models::{BandPhase, BandPlan, BandResult, TestConfiguration};
    use tempfile::TempDir;

    fn state() -> CheckpointState {
        let plan = vec![
            BandPlan {
                index: 0,
                workers: 1,
                connections: 2,
            },
            BandPlan {
                index: 1,
                workers: 2,
                connections: 4,
            },
        ];
        let mut state = CheckpointState::new(TestMetadata::new(
            "synthetic",
            TestConfiguration::default(),
            plan.clone(),
        ));
        let mut result = BandResult::no_data(&plan[0]);
        result.total_tps = 1234.567_890_123;
        result.avg_latency_ms = 0.1 + 0.2;
        result.tps_samples = vec![1.0 / 3.0, 2.0 / 3.0];
        state.results.push(result);
        state.execution.status = RunStatus::Running;
        state.execution.next_band = 1;
        state.execution.current_band = Some(CurrentBandState {
            plan: plan[1],
            phase: BandPhase::Execution,
            started_at: Utc::now(),
            operations_seen: 42,
        });
        state
    }

    #[tokio::test]
    async fn test_round_trip_is_exact() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::open(dir.path(), 10).await.unwrap();

        let original = state();
        let created = manager.create(&original).await.unwrap();
        let restored = manager.restore_latest().await.unwrap().unwrap();

        assert_eq!(restored, created);
        assert_eq!(restored.state, original);
        assert_eq!(restored.state.results[0].tps_samples[0], 1.0 / 3.0);
    }

    #[tokio::test]
    async fn test_retention_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::open(dir.path(), 3).await.unwrap();

        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(manager.create(&state()).await.unwrap().id);
        }

        let listed: Vec<Uuid> = manager.list().await.unwrap().iter().map(|s| s.id).collect();
        assert_eq!(listed, ids[2..].to_vec());

        let latest = manager.restore_latest().await.unwrap().unwrap();
        assert_eq!(latest.id, ids[4]);
    }

    #[tokio::test]
    async fn test_corrupt_and_temp_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::open(dir.path(), 10).await.unwrap();
        let good = manager.create(&state()).await.unwrap();

        std::fs::write(
            dir.path().join("checkpoint-99991231T235959.999Z-999999.json"),
            b"{\"id\": truncated",
        )
        .unwrap();
        std::fs::write(dir.path().join(".tmpAbC123"), b"partial write").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();

        let listed = manager.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, good.id);
        assert_eq!(listed[0].completed_bands, 1);
        assert_eq!(listed[0].total_bands, 2);

        let latest = manager.restore_latest().await.unwrap().unwrap();
        assert_eq!(latest.id, good.id);
    }

    #[tokio::test]
    async fn test_retention_counts_unusable_files() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::open(dir.path(), 3).await.unwrap();

        let older = dir.path().join("checkpoint-20240101T000000.000Z-000000.json");
        let newer = dir.path().join("checkpoint-20240102T000000.000Z-000001.json");
        std::fs::write(&older, b"{\"id\": truncated").unwrap();
        std::fs::write(&newer, b"{\"format_version\": 99}").unwrap();
        let hour_ago = std::time::SystemTime::now() - Duration::from_secs(3600);
        std::fs::File::options()
            .write(true)
            .open(&older)
            .unwrap()
            .set_modified(hour_ago)
            .unwrap();

        let mut ids = Vec::new();
        ids.push(manager.create(&state()).await.unwrap().id);
        assert!(older.exists() && newer.exists());

        ids.push(manager.create(&state()).await.unwrap().id);
        assert!(!older.exists());
        assert!(newer.exists());

        ids.push(manager.create(&state()).await.unwrap().id);
        ids.push(manager.create(&state()).await.unwrap().id);
        assert!(!newer.exists());

        let files = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, 3);
        let listed: Vec<Uuid> = manager.list().await.unwrap().iter().map(|s| s.id).collect();
        assert_eq!(listed, ids[1..].to_vec());
    }

    #[tokio::test]
    async fn test_restore_and_delete_by_prefix() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::open(dir.path(), 10).await.unwrap();
        let checkpoint = manager.create(&state()).await.unwrap();
        let prefix = &checkpoint.id.to_string()[..8];

        let restored = manager.restore(prefix).await.unwrap();
        assert_eq!(restored.id, checkpoint.id);

        manager.delete(prefix).await.unwrap();
        let err = manager.restore(prefix).await.unwrap_err();
        assert!(matches!(err, EngineError::CheckpointNotFound { .. }));
        assert!(manager.restore_latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sequence_continues_after_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let manager = CheckpointManager::open(dir.path(), 10).await.unwrap();
            manager.create(&state()).await.unwrap();
            manager.create(&state()).await.unwrap();
        }
        let manager = CheckpointManager::open(dir.path(), 10).await.unwrap();
        let next = manager.create(&state()).await.unwrap();
        assert_eq!(next.sequence, 2);
    }

    #[tokio::test]
    async fn test_create_fails_when_directory_is_gone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoints");
        let manager = CheckpointManager::open(&path, 10).await.unwrap();
        std::fs::remove_dir_all(&path).unwrap();

        let policy = RetryPolicy {
            attempts: 2,
            base_delay: Duration::from_millis(1),
        };
        let err = manager.create_with_retry(&state(), policy).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.code(), "BSC-4001");
    }
}
