//! Per-session materialized summaries, refreshed incrementally from the event log.
//!
//! A summary on disk is trusted while its mtime is not older than the log's. When
//! the log moves on, only the lines past `last_log_offset` are folded in.

use crate::event_log::EventLog;
use crate::models::{AnalyticsSummary, TokenUsageRecord, TopAgent};
use crate::pricing::PricingResolver;
use crate::snapshot;
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

pub const DEFAULT_TOP_AGENTS: usize = 10;

pub struct SummaryCache {
    dir: PathBuf,
    log: EventLog,
    pricing: Arc<PricingResolver>,
    top_limit: usize,
    rebuilds: u64,
}

impl SummaryCache {
    pub fn new(
        dir: impl Into<PathBuf>,
        log: EventLog,
        pricing: Arc<PricingResolver>,
        top_limit: usize,
    ) -> Self {
        Self {
            dir: dir.into(),
            log,
            pricing,
            top_limit: top_limit.max(1),
            rebuilds: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of rebuilds this handle has run. A cache hit leaves it unchanged.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds
    }

    pub fn summary_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(snapshot::file_name_for(session_id))
    }

    /// The cached summary when it is at least as new as the log, otherwise an
    /// incremental rebuild.
    pub fn load_analytics_fast(&mut self, session_id: &str) -> AnalyticsSummary {
        let path = self.summary_path(session_id);
        let summary_mtime = fs::metadata(&path).and_then(|m| m.modified()).ok();
        let log_mtime = self.log.modified().unwrap_or(SystemTime::UNIX_EPOCH);

        if summary_mtime.is_some_and(|mtime| mtime >= log_mtime) {
            if let Some(cached) = self.read_summary(&path, session_id) {
                return cached;
            }
        }
        self.rebuild_summary_incremental(session_id)
    }

    /// Folds log lines past the saved offset into the saved summary and persists it.
    pub fn rebuild_summary_incremental(&mut self, session_id: &str) -> AnalyticsSummary {
        self.rebuilds += 1;
        let path = self.summary_path(session_id);
        let line_count = self.log.line_count();

        let mut summary = match self.read_summary(&path, session_id) {
            Some(prev) if prev.last_log_offset <= line_count => prev,
            Some(prev) => {
                tracing::debug!(
                    session = session_id,
                    offset = prev.last_log_offset,
                    lines = line_count,
                    "summary offset is past the end of the log, rebuilding from scratch"
                );
                empty_summary(session_id)
            }
            None => empty_summary(session_id),
        };

        let slice = self.log.read_from(summary.last_log_offset);
        for record in slice.records.iter().filter(|r| r.session_id == session_id) {
            self.fold(&mut summary, record);
        }

        summary.cache_hit_rate = summary.totals.tokens.cache_hit_rate();
        summary.last_log_offset += slice.lines_read;
        summary.last_updated = Some(Utc::now());

        if let Err(e) = snapshot::write_json(&path, &summary) {
            tracing::debug!("failed to persist summary {:?}: {}", path, e);
        }
        summary
    }

    /// Drops the cached file and rebuilds from the first line of the log.
    pub fn rebuild_analytics_summary(&mut self, session_id: &str) -> AnalyticsSummary {
        let path = self.summary_path(session_id);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!("failed to remove summary {:?}: {}", path, e);
            }
        }
        self.rebuild_summary_incremental(session_id)
    }

    fn fold(&self, summary: &mut AnalyticsSummary, record: &TokenUsageRecord) {
        let totals = record.totals();
        let cost = self.pricing.cost(&record.model_name, &totals);
        summary.totals.tokens.add(&totals);
        summary.totals.estimated_cost += cost;

        let key = record.agent_key();
        match summary.top_agents.iter_mut().find(|a| a.agent == key) {
            Some(agent) => {
                agent.cost += cost;
                agent.tokens = agent.tokens.saturating_add(totals.total());
            }
            None => summary.top_agents.push(TopAgent {
                agent: key.to_string(),
                cost,
                tokens: totals.total(),
            }),
        }
        summary.top_agents.sort_by(|a, b| b.cost.total_cmp(&a.cost));
        summary.top_agents.truncate(self.top_limit);
    }

    fn read_summary(&self, path: &Path, session_id: &str) -> Option<AnalyticsSummary> {
        snapshot::read_json::<AnalyticsSummary>(path).filter(|s| s.session_id == session_id)
    }
}

fn empty_summary(session_id: &str) -> AnalyticsSummary {
    AnalyticsSummary {
        session_id: session_id.to_string(),
        ..Default::default()
    }
}
