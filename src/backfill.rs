use crate::error::LedgerError;
use crate::event_log::EventLog;
use crate::models::{EventId, TokenUsageRecord};
use crate::pricing::normalize_model_name;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

/// Set of event ids a backfill has already written to the log.
pub struct BackfillState {
    conn: Connection,
}

impl BackfillState {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        let this = Self { conn };
        this.init()?;
        Ok(this)
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let this = Self {
            conn: Connection::open_in_memory()?,
        };
        this.init()?;
        Ok(this)
    }

    fn init(&self) -> Result<(), LedgerError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS processed_events (
                event_id TEXT PRIMARY KEY,
                processed_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Returns `true` only the first time `id` is marked.
    pub fn mark_processed(&self, id: &EventId) -> Result<bool, LedgerError> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO processed_events (event_id, processed_at) VALUES (?, ?)",
            params![id.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(inserted > 0)
    }

    /// Marks a batch in one transaction and returns how many were new.
    pub fn mark_many<'a>(
        &mut self,
        ids: impl IntoIterator<Item = &'a EventId>,
    ) -> Result<usize, LedgerError> {
        let tx = self.conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO processed_events (event_id, processed_at) VALUES (?, ?)",
            )?;
            for id in ids {
                inserted += stmt.execute(params![id.as_str(), now])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn is_processed(&self, id: &EventId) -> Result<bool, LedgerError> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM processed_events WHERE event_id = ?",
                [id.as_str()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn total_processed(&self) -> Result<u64, LedgerError> {
        let total: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM processed_events", [], |row| row.get(0))?;
        Ok(total.max(0) as u64)
    }

    /// Forgets every processed id so the next backfill re-ingests everything.
    pub fn reset(&self) -> Result<(), LedgerError> {
        self.conn.execute("DELETE FROM processed_events", [])?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub appended: usize,
    pub skipped: usize,
}

/// Appends replayed transcript records to the log at most once per event id.
pub struct Reconciler {
    log: EventLog,
    state: BackfillState,
}

impl Reconciler {
    pub fn new(log: EventLog, state: BackfillState) -> Self {
        Self { log, state }
    }

    pub fn state(&self) -> &BackfillState {
        &self.state
    }

    /// Marks every event already in the log, covering records appended by a run
    /// that crashed before it could mark them.
    pub fn seed_from_log(&mut self) -> Result<usize, LedgerError> {
        let ids: Vec<EventId> = self.log.read_all().iter().map(|r| r.event_id()).collect();
        let added = self.state.mark_many(&ids)?;
        tracing::debug!(scanned = ids.len(), added, "seeded backfill state from event log");
        Ok(added)
    }

    pub fn ingest(
        &mut self,
        records: impl IntoIterator<Item = TokenUsageRecord>,
    ) -> Result<BackfillReport, LedgerError> {
        let mut report = BackfillReport::default();
        for mut record in records {
            if !record.is_valid() {
                report.skipped += 1;
                continue;
            }
            record.model_name = normalize_model_name(&record.model_name);
            let id = record.event_id();
            if self.state.is_processed(&id)? {
                report.skipped += 1;
                continue;
            }
            // Append before marking: a crash in between leaves a duplicate that
            // seed_from_log catches, never a lost event.
            self.log.append(&record)?;
            self.state.mark_processed(&id)?;
            report.appended += 1;
        }
        tracing::info!(
            appended = report.appended,
            skipped = report.skipped,
            "backfill batch ingested"
        );
        Ok(report)
    }
}
