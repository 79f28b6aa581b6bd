use std::collections::BTreeSet;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::warn;

use crate::chunked::checksum_bytes;

/// One contiguous slice of a file, identified by its sequence index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Zero-based position of the chunk within the file.
    pub index: u32,
    /// Byte offset within the file.
    pub offset: u64,
    /// Length of the plain chunk bytes.
    pub size: usize,
    /// Chunk payload; compressed and/or encrypted when the flags say so.
    pub data: Vec<u8>,
    pub compressed: bool,
    pub encrypted: bool,
    /// SHA-256 hex checksum of the plain bytes.
    pub checksum: String,
}

impl Chunk {
    /// Creates a plain chunk from raw file bytes.
    pub fn new(index: u32, offset: u64, data: Vec<u8>) -> Self {
        Self {
            index,
            offset,
            size: data.len(),
            checksum: checksum_bytes(&data),
            data,
            compressed: false,
            encrypted: false,
        }
    }
}

/// Direction of a transfer job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

/// Lifecycle of a transfer job.
///
/// ```text
/// Pending -> InFlight -> Completed
///                     -> PartiallyFailed
///                     -> Aborted
/// Pending -> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InFlight,
    Completed,
    PartiallyFailed,
    Aborted,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::PartiallyFailed | Self::Aborted
        )
    }

    fn can_become(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InFlight)
                | (Self::Pending, Self::Aborted)
                | (Self::InFlight, Self::Completed)
                | (Self::InFlight, Self::PartiallyFailed)
                | (Self::InFlight, Self::Aborted)
        )
    }
}

/// Snapshot of a job's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobProgress {
    pub job_id: String,
    pub direction: Direction,
    pub file_name: String,
    pub status: JobStatus,
    /// Chunks that reached a final outcome (succeeded or exhausted retries).
    pub completed: u32,
    pub total: u32,
    pub failed: Vec<u32>,
    pub error: String,
}

/// Tracks one upload or download (thread-safe).
///
/// The completed counter only moves forward and never exceeds the total.
pub struct TransferJob {
    inner: RwLock<JobInner>,
}

struct JobInner {
    id: String,
    direction: Direction,
    file_name: String,
    status: JobStatus,
    total: u32,
    completed: u32,
    failed: BTreeSet<u32>,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    error: String,
}

impl TransferJob {
    /// Creates a pending job with a fresh identifier.
    pub fn new(direction: Direction, file_name: impl Into<String>, total: u32) -> Self {
        Self {
            inner: RwLock::new(JobInner {
                id: uuid::Uuid::new_v4().to_string(),
                direction,
                file_name: file_name.into(),
                status: JobStatus::Pending,
                total,
                completed: 0,
                failed: BTreeSet::new(),
                started_at: None,
                finished_at: None,
                error: String::new(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, JobInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, JobInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(s: &mut JobInner, next: JobStatus) -> bool {
        if !s.status.can_become(next) {
            warn!(job = %s.id, from = ?s.status, to = ?next, "ignoring invalid job transition");
            return false;
        }
        s.status = next;
        let now = Instant::now();
        match next {
            JobStatus::InFlight => s.started_at = Some(now),
            JobStatus::Pending => {}
            _ => s.finished_at = Some(now),
        }
        true
    }

    /// Moves a pending job in flight.
    pub fn start(&self) -> bool {
        Self::transition(&mut self.write(), JobStatus::InFlight)
    }

    /// Replaces the total once it becomes known (downloads learn it late).
    pub fn set_total(&self, total: u32) {
        let mut s = self.write();
        s.total = total.max(s.completed);
    }

    /// Records a chunk that was transferred. Returns the new snapshot.
    pub fn record_success(&self) -> JobProgress {
        let mut s = self.write();
        Self::advance(&mut s);
        Self::snapshot(&s)
    }

    /// Records a chunk operation that exhausted its retries.
    ///
    /// Downloads may not know the index of a blob they failed to fetch; such
    /// failures advance progress without entering the failed set.
    pub fn record_failure(&self, index: Option<u32>) -> JobProgress {
        let mut s = self.write();
        if let Some(index) = index {
            s.failed.insert(index);
        }
        Self::advance(&mut s);
        Self::snapshot(&s)
    }

    fn advance(s: &mut JobInner) {
        if s.completed < s.total {
            s.completed += 1;
        }
    }

    /// Closes an in-flight job: `Completed` when nothing failed, otherwise
    /// `PartiallyFailed`.
    pub fn finish(&self) -> JobStatus {
        let mut s = self.write();
        let next = if s.failed.is_empty() {
            JobStatus::Completed
        } else {
            JobStatus::PartiallyFailed
        };
        Self::transition(&mut s, next);
        s.status
    }

    /// Closes the job after an unrecoverable error.
    pub fn fail(&self, err: &str) {
        let mut s = self.write();
        s.error = err.to_string();
        if s.status == JobStatus::Pending {
            Self::transition(&mut s, JobStatus::InFlight);
        }
        Self::transition(&mut s, JobStatus::PartiallyFailed);
    }

    /// Marks the job as aborted by cancellation.
    pub fn abort(&self) {
        Self::transition(&mut self.write(), JobStatus::Aborted);
    }

    pub fn progress(&self) -> JobProgress {
        Self::snapshot(&self.read())
    }

    fn snapshot(s: &JobInner) -> JobProgress {
        JobProgress {
            job_id: s.id.clone(),
            direction: s.direction,
            file_name: s.file_name.clone(),
            status: s.status,
            completed: s.completed,
            total: s.total,
            failed: s.failed.iter().copied().collect(),
            error: s.error.clone(),
        }
    }

    pub fn id(&self) -> String {
        self.read().id.clone()
    }

    pub fn status(&self) -> JobStatus {
        self.read().status
    }

    /// Indices that exhausted their retries, ascending.
    pub fn failed(&self) -> Vec<u32> {
        self.read().failed.iter().copied().collect()
    }

    /// Returns `true` if the job is pending or in flight.
    pub fn is_active(&self) -> bool {
        !self.read().status.is_terminal()
    }

    /// Time spent in flight so far, or in total once finished.
    pub fn elapsed(&self) -> Option<Duration> {
        let s = self.read();
        let started = s.started_at?;
        Some(s.finished_at.unwrap_or_else(Instant::now) - started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_new_computes_checksum() {
        let c = Chunk::new(2, 8, b"abcd".to_vec());
        assert_eq!(c.size, 4);
        assert_eq!(c.checksum, checksum_bytes(b"abcd"));
        assert!(!c.compressed && !c.encrypted);
    }

    #[test]
    fn job_lifecycle_completed() {
        let job = TransferJob::new(Direction::Upload, "a.txt", 2);
        assert_eq!(job.status(), JobStatus::Pending);
        assert!(job.is_active());
        assert!(job.start());

        let p = job.record_success();
        assert_eq!((p.completed, p.total), (1, 2));
        job.record_success();
        assert_eq!(job.finish(), JobStatus::Completed);
        assert!(!job.is_active());
        assert!(job.elapsed().is_some());
    }

    #[test]
    fn job_with_failures_is_partially_failed() {
        let job = TransferJob::new(Direction::Upload, "a.txt", 3);
        job.start();
        job.record_success();
        job.record_failure(Some(2));
        let p = job.record_failure(Some(1));
        assert_eq!(p.completed, 3);
        assert_eq!(p.failed, vec![1, 2]);
        assert_eq!(job.finish(), JobStatus::PartiallyFailed);
    }

    #[test]
    fn anonymous_failure_only_advances_progress() {
        let job = TransferJob::new(Direction::Download, "a.txt", 2);
        job.start();
        job.record_success();
        let p = job.record_failure(None);
        assert_eq!(p.completed, 2);
        assert!(p.failed.is_empty());
        assert_eq!(job.finish(), JobStatus::Completed);
    }

    #[test]
    fn completed_never_exceeds_total() {
        let job = TransferJob::new(Direction::Download, "a.txt", 1);
        job.start();
        job.record_success();
        let p = job.record_success();
        assert_eq!(p.completed, 1);
        assert_eq!(p.total, 1);
    }

    #[test]
    fn terminal_states_are_sticky() {
        let job = TransferJob::new(Direction::Upload, "a.txt", 1);
        job.start();
        job.abort();
        assert_eq!(job.status(), JobStatus::Aborted);
        assert!(!job.start());
        assert_eq!(job.finish(), JobStatus::Aborted);
    }

    #[test]
    fn pending_job_can_abort_but_not_complete() {
        let job = TransferJob::new(Direction::Upload, "a.txt", 1);
        assert_eq!(job.finish(), JobStatus::Pending);
        job.abort();
        assert_eq!(job.status(), JobStatus::Aborted);
    }

    #[test]
    fn fail_records_error() {
        let job = TransferJob::new(Direction::Download, "a.txt", 0);
        job.fail("manifest not found");
        let p = job.progress();
        assert_eq!(p.status, JobStatus::PartiallyFailed);
        assert_eq!(p.error, "manifest not found");
    }

    #[test]
    fn set_total_never_drops_below_completed() {
        let job = TransferJob::new(Direction::Download, "a.txt", 4);
        job.start();
        job.record_success();
        job.record_success();
        job.set_total(1);
        assert_eq!(job.progress().total, 2);
    }

    #[test]
    fn ids_are_unique() {
        let a = TransferJob::new(Direction::Upload, "a", 1);
        let b = TransferJob::new(Direction::Upload, "a", 1);
        assert_ne!(a.id(), b.id());
    }
}
