//! Conflict resolution between a local record and its remote copy.
//!
//! The engine consults a [`ConflictResolver`] whenever both sides hold a version of
//! the same id and the local one has not been pushed yet. The default,
//! [`LastWriterWins`], keeps the copy with the later `updatedAt`; the other copy's
//! fields are discarded wholesale.

use crate::task::TaskRecord;

/// Which copy survives a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    Remote,
}

pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, local: &TaskRecord, remote: &TaskRecord) -> Winner;
}

/// Last-Write-Wins on `updatedAt`.
///
/// The remote copy wins only when it is strictly newer. On a tie the local copy is
/// kept and pushed. Other devices then pull it, because pulls follow the time the
/// remote received a write, so every replica ends up with whichever tied copy
/// reached the remote last.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriterWins;

impl ConflictResolver for LastWriterWins {
    fn resolve(&self, local: &TaskRecord, remote: &TaskRecord) -> Winner {
        if remote.updated_at > local.updated_at {
            Winner::Remote
        } else {
            Winner::Local
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn make_task(title: &str, offset_ms: i64) -> TaskRecord {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut task = TaskRecord::new("t1", title);
        task.created_at = base;
        task.updated_at = base + Duration::milliseconds(offset_ms);
        task
    }

    #[test]
    fn test_newer_remote_wins() {
        let local = make_task("local", 0);
        let remote = make_task("remote", 10);
        assert_eq!(LastWriterWins.resolve(&local, &remote), Winner::Remote);
    }

    #[test]
    fn test_older_remote_loses() {
        let local = make_task("local", 10);
        let remote = make_task("remote", 0);
        assert_eq!(LastWriterWins.resolve(&local, &remote), Winner::Local);
    }

    #[test]
    fn test_tie_keeps_local() {
        let local = make_task("local", 5);
        let remote = make_task("remote", 5);
        assert_eq!(LastWriterWins.resolve(&local, &remote), Winner::Local);
    }
}
