//! Best-effort map from session id to where that session starts in the event log.
//!
//! The index only ever narrows where a scan may *start*. A session missing from
//! the index means "scan everything", and failures to read or write the index
//! file are logged and ignored.

use crate::event_log::EventLog;
use crate::snapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

pub const DEFAULT_INDEX_TTL: Duration = Duration::from_secs(300);

/// Extra lines past `offset + count` covered by a lookup, for appends the index has not seen.
const LOOKUP_SLACK: u64 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIndexEntry {
    pub session_id: String,
    /// Lines in the log before this session's first record.
    pub offset: u64,
    pub count: u64,
    pub last_seen: DateTime<Utc>,
}

impl SessionIndexEntry {
    fn merge(&mut self, other: &SessionIndexEntry) {
        self.offset = self.offset.min(other.offset);
        self.count = self.count.max(other.count);
        if other.last_seen > self.last_seen {
            self.last_seen = other.last_seen;
        }
    }
}

type IndexMap = BTreeMap<String, SessionIndexEntry>;

struct CachedIndex {
    loaded_at: Instant,
    /// Index file mtime as of the last load or write; `None` when it was absent.
    file_mtime: Option<SystemTime>,
    /// When this handle last wrote the file.
    written_at: Option<Instant>,
    entries: IndexMap,
}

pub struct SessionIndex {
    path: PathBuf,
    ttl: Duration,
    cache: Option<CachedIndex>,
    writes: u64,
}

impl SessionIndex {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
            cache: None,
            writes: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of times this handle rewrote the index file.
    pub fn write_count(&self) -> u64 {
        self.writes
    }

    /// Records a sighting of `session_id`. Must run before the session's record is
    /// appended so that a new entry's offset is a true lower bound.
    ///
    /// Repeat sightings only touch the in-memory copy until the last write is older
    /// than the TTL; the offset, the only part readers rely on, never changes.
    pub fn update(&mut self, session_id: &str, log: &EventLog) {
        let now = Utc::now();
        let ttl = self.ttl;
        self.entries();
        let Some(cache) = self.cache.as_mut() else {
            return;
        };

        if let Some(entry) = cache.entries.get_mut(session_id) {
            entry.count += 1;
            entry.last_seen = now;
            if cache.written_at.is_some_and(|at| at.elapsed() < ttl) {
                return;
            }
        } else {
            cache.entries.insert(
                session_id.to_string(),
                SessionIndexEntry {
                    session_id: session_id.to_string(),
                    offset: log.line_count(),
                    count: 1,
                    last_seen: now,
                },
            );
        }
        self.persist();
    }

    /// Candidate line range `[offset, offset + count + slack)` for a session.
    ///
    /// `None` means the session is unknown and callers must scan the whole log.
    pub fn lookup(&mut self, session_id: &str) -> Option<Range<u64>> {
        self.entries()
            .get(session_id)
            .map(|e| e.offset..e.offset + e.count + LOOKUP_SLACK)
    }

    pub fn entry(&mut self, session_id: &str) -> Option<SessionIndexEntry> {
        self.entries().get(session_id).cloned()
    }

    /// Drops the in-memory copy and the file, e.g. after the log was rewritten.
    pub fn invalidate(&mut self) {
        self.cache = None;
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!("failed to remove session index {:?}: {}", self.path, e);
            }
        }
    }

    /// Merges the in-memory entries into whatever is on disk and writes the result.
    fn persist(&mut self) {
        let mut merged = self.load_from_disk();
        let Some(cache) = self.cache.as_mut() else {
            return;
        };
        for (id, entry) in &cache.entries {
            merged
                .entry(id.clone())
                .and_modify(|existing| existing.merge(entry))
                .or_insert_with(|| entry.clone());
        }

        match snapshot::write_json(&self.path, &merged) {
            Ok(()) => {
                self.writes += 1;
                cache.written_at = Some(Instant::now());
                cache.file_mtime = file_mtime(&self.path);
            }
            Err(e) => tracing::debug!("session index write failed for {:?}: {}", self.path, e),
        }
        cache.entries = merged;
    }

    /// The cached entries, reloaded when the TTL ran out or the file changed on disk
    /// (another process wrote it, or a log rewrite deleted it).
    fn entries(&mut self) -> &IndexMap {
        let on_disk = file_mtime(&self.path);
        let stale = self
            .cache
            .as_ref()
            .map_or(true, |c| c.loaded_at.elapsed() >= self.ttl || c.file_mtime != on_disk);
        if stale {
            self.cache = None;
        }
        let path = &self.path;
        &self
            .cache
            .get_or_insert_with(|| CachedIndex {
                loaded_at: Instant::now(),
                file_mtime: on_disk,
                written_at: None,
                entries: snapshot::read_json(path).unwrap_or_default(),
            })
            .entries
    }

    fn load_from_disk(&self) -> IndexMap {
        snapshot::read_json(&self.path).unwrap_or_default()
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UsageDraft;
    use std::fs;
    use tempfile::TempDir;

    fn setup(tmp: &TempDir) -> (EventLog, SessionIndex) {
        let data = tmp.path().join("data");
        (
            EventLog::new(data.join("usage.ndjson")),
            SessionIndex::new(data.join("session-index.json"), DEFAULT_INDEX_TTL),
        )
    }

    fn record(index: &mut SessionIndex, log: &EventLog, session: &str) {
        index.update(session, log);
        log.append(&UsageDraft::new("claude-sonnet-4.5", 1, 1).stamp(session))
            .expect("append");
    }

    #[test]
    fn first_sighting_records_current_line_count() {
        let tmp = TempDir::new().expect("tempdir");
        let (log, mut index) = setup(&tmp);
        record(&mut index, &log, "a");
        record(&mut index, &log, "a");
        record(&mut index, &log, "b");
        record(&mut index, &log, "a");

        let a = index.entry("a").expect("a indexed");
        assert_eq!((a.offset, a.count), (0, 3));
        let b = index.entry("b").expect("b indexed");
        assert_eq!((b.offset, b.count), (2, 1));
        assert_eq!(index.lookup("b"), Some(2..13));
        assert_eq!(index.lookup("missing"), None);
    }

    #[test]
    fn index_survives_a_fresh_handle() {
        let tmp = TempDir::new().expect("tempdir");
        let (log, mut index) = setup(&tmp);
        record(&mut index, &log, "a");
        record(&mut index, &log, "b");

        let mut reopened = SessionIndex::new(index.path(), DEFAULT_INDEX_TTL);
        assert_eq!(reopened.lookup("b"), Some(1..12));
    }

    #[test]
    fn concurrent_handles_keep_the_earliest_offset() {
        let tmp = TempDir::new().expect("tempdir");
        let (log, mut first) = setup(&tmp);
        let mut second = SessionIndex::new(first.path(), DEFAULT_INDEX_TTL);

        // Both handles load their caches before either writes.
        assert_eq!(first.lookup("shared"), None);
        assert_eq!(second.lookup("shared"), None);

        record(&mut first, &log, "shared");
        record(&mut second, &log, "shared");

        let entry = second.entry("shared").expect("indexed");
        assert_eq!(entry.offset, 0);
        assert_eq!(entry.count, 2);
    }

    #[test]
    fn stale_cache_is_reloaded_after_ttl() {
        let tmp = TempDir::new().expect("tempdir");
        let (log, mut writer) = setup(&tmp);
        let mut reader = SessionIndex::new(writer.path(), Duration::ZERO);
        assert_eq!(reader.lookup("late"), None);

        record(&mut writer, &log, "late");
        assert_eq!(reader.lookup("late"), Some(0..11));
    }

    #[test]
    fn corrupt_index_file_is_ignored() {
        let tmp = TempDir::new().expect("tempdir");
        let (log, mut index) = setup(&tmp);
        fs::create_dir_all(tmp.path().join("data")).expect("dir");
        fs::write(index.path(), "{{{").expect("write garbage");

        assert_eq!(index.lookup("a"), None);
        record(&mut index, &log, "a");
        assert_eq!(index.lookup("a"), Some(0..11));
    }

    #[test]
    fn invalidate_removes_file_and_cache() {
        let tmp = TempDir::new().expect("tempdir");
        let (log, mut index) = setup(&tmp);
        record(&mut index, &log, "a");
        index.invalidate();
        assert!(!index.path().exists());
        assert_eq!(index.lookup("a"), None);
    }

    #[test]
    fn repeat_sightings_skip_the_file_while_warm() {
        let tmp = TempDir::new().expect("tempdir");
        let (log, mut index) = setup(&tmp);
        for _ in 0..5 {
            record(&mut index, &log, "a");
        }
        assert_eq!(index.write_count(), 1);
        assert_eq!(index.entry("a").map(|e| e.count), Some(5));

        record(&mut index, &log, "b");
        assert_eq!(index.write_count(), 2);
        let mut reopened = SessionIndex::new(index.path(), DEFAULT_INDEX_TTL);
        let a = reopened.entry("a").expect("a persisted");
        assert_eq!((a.offset, a.count), (0, 5));
    }

    #[test]
    fn expired_write_window_persists_repeat_sightings() {
        let tmp = TempDir::new().expect("tempdir");
        let (log, _) = setup(&tmp);
        let mut index = SessionIndex::new(tmp.path().join("idx.json"), Duration::ZERO);
        record(&mut index, &log, "a");
        record(&mut index, &log, "a");
        assert_eq!(index.write_count(), 2);
    }

    #[test]
    fn deleted_file_drops_a_warm_cache() {
        let tmp = TempDir::new().expect("tempdir");
        let (log, mut index) = setup(&tmp);
        record(&mut index, &log, "a");
        let mut other = SessionIndex::new(index.path(), DEFAULT_INDEX_TTL);
        other.invalidate();

        assert_eq!(index.lookup("a"), None);
    }
}
