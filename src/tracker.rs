//! Per-process token tracker: the live session's running totals plus the
//! cross-session report built from the event log.

use crate::config::LedgerPaths;
use crate::event_log::EventLog;
use crate::models::{
    AllStats, ModelStat, SessionTokenStats, StatsSource, TokenTotals, TokenUsageRecord, TopAgent,
    UsageDraft, UsageTally,
};
use crate::pricing::PricingResolver;
use crate::providers::UsageReportSource;
use crate::session_index::SessionIndex;
use crate::snapshot;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub struct TokenTracker {
    session_id: String,
    state_dir: PathBuf,
    summary_dir: PathBuf,
    log: EventLog,
    index: SessionIndex,
    pricing: Arc<PricingResolver>,
    reports: Option<Arc<dyn UsageReportSource>>,
    stats: SessionTokenStats,
}

impl TokenTracker {
    /// Opens the tracker for `session_id` (a fresh id when `None`), restoring the
    /// persisted snapshot when it belongs to the same session.
    pub fn new(
        paths: &LedgerPaths,
        session_id: Option<String>,
        index_ttl: Duration,
        pricing: Arc<PricingResolver>,
        reports: Option<Arc<dyn UsageReportSource>>,
    ) -> Self {
        let session_id = session_id
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut tracker = Self {
            stats: SessionTokenStats::new(session_id.clone()),
            session_id,
            state_dir: paths.state_dir.clone(),
            summary_dir: paths.summary_dir.clone(),
            log: EventLog::new(&paths.log_file),
            index: SessionIndex::new(&paths.index_file, index_ttl),
            pricing,
            reports,
        };
        if let Some(restored) = tracker.read_snapshot(&tracker.session_id) {
            tracing::debug!(
                session = %tracker.session_id,
                records = restored.record_count,
                "restored session stats"
            );
            tracker.stats = restored;
        }
        tracker
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn stats(&self) -> &SessionTokenStats {
        &self.stats
    }

    pub fn event_log(&self) -> &EventLog {
        &self.log
    }

    pub fn pricing(&self) -> &PricingResolver {
        &self.pricing
    }

    /// Stamps and appends one record, then folds it into the session totals.
    ///
    /// If the append fails the record is returned but not counted, so the totals
    /// never drift from what the log can reproduce.
    pub fn record_token_usage(&mut self, draft: UsageDraft) -> TokenUsageRecord {
        let record = draft.stamp(&self.session_id);

        self.index.update(&record.session_id, &self.log);
        if let Err(e) = self.log.append(&record) {
            tracing::warn!(
                session = %self.session_id,
                "failed to append usage record to {:?}: {}",
                self.log.path(),
                e
            );
            return record;
        }

        self.stats.apply(&record);
        self.persist();
        record
    }

    /// Stats for `session_id` (this tracker's session when `None`): the persisted
    /// snapshot when it matches, otherwise a replay of the event log.
    pub fn load_session_stats(&mut self, session_id: Option<&str>) -> SessionTokenStats {
        let target = session_id.unwrap_or(&self.session_id).to_string();
        if let Some(snapshot) = self.read_snapshot(&target) {
            return snapshot;
        }

        let rebuilt = self.replay_session(&target);
        if target == self.session_id {
            self.stats = rebuilt.clone();
            self.persist();
        }
        rebuilt
    }

    /// Agents of this session ordered by cost, highest first. Equal costs keep
    /// first-seen order.
    pub fn get_top_agents(&self, limit: usize) -> Vec<TopAgent> {
        let mut ranked = rank_agents(&self.stats, &self.pricing);
        ranked.truncate(limit);
        ranked
    }

    /// Totals across every session ever logged. A configured usage report supplies
    /// the model-level numbers; agent attribution always comes from the local log.
    pub async fn get_all_stats(&self) -> AllStats {
        let local = self.scan_all();

        let Some(reports) = &self.reports else {
            return local;
        };
        match reports.fetch_model_totals().await {
            Ok(rows) => merge_report(local, rows, reports.name(), &self.pricing),
            Err(e) => {
                tracing::warn!(
                    source = reports.name(),
                    "usage report unavailable, using local log: {e}"
                );
                local
            }
        }
    }

    /// Drops records older than `retention_days` and invalidates every view whose
    /// offsets described the old file.
    pub fn cleanup_old_logs(&mut self, retention_days: u32) -> usize {
        let before = self.log.line_count();
        let removed = match self.log.cleanup_old_logs(retention_days) {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!("event log cleanup failed: {e}");
                return 0;
            }
        };

        if self.log.line_count() != before {
            self.index.invalidate();
            self.clear_summaries();
        }
        removed
    }

    /// Forgets this session's in-memory and persisted state. The log is untouched.
    pub fn reset(&mut self) {
        self.stats = SessionTokenStats::new(self.session_id.clone());
        let path = self.state_file(&self.session_id);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!("failed to remove session snapshot {:?}: {}", path, e);
            }
        }
    }

    fn replay_session(&mut self, session_id: &str) -> SessionTokenStats {
        let start = self
            .index
            .lookup(session_id)
            .map(|range| range.start)
            .filter(|start| *start <= self.log.line_count())
            .unwrap_or(0);

        let mut stats = fold_session(self.log.read_from(start).records, session_id);
        if start > 0 && stats.record_count == 0 {
            tracing::debug!(session = session_id, start, "index hint found nothing, full scan");
            stats = fold_session(self.log.read_all(), session_id);
        }
        stats
    }

    fn scan_all(&self) -> AllStats {
        let records = self.log.read_all();
        let mut sessions: HashSet<&str> = HashSet::new();
        let mut totals = TokenTotals::default();
        let mut by_model: BTreeMap<String, UsageTally> = BTreeMap::new();
        let mut agents = SessionTokenStats::new("*");

        for record in &records {
            sessions.insert(record.session_id.as_str());
            totals.add(&record.totals());
            let tally = by_model.entry(record.model_name.clone()).or_default();
            tally.calls += 1;
            tally.totals.add(&record.totals());
            agents.apply(record);
        }

        let by_model: Vec<ModelStat> = by_model
            .into_iter()
            .map(|(model, tally)| ModelStat {
                cost: self.pricing.cost(&model, &tally.totals),
                model,
                calls: tally.calls,
                totals: tally.totals,
            })
            .collect();

        AllStats {
            sessions: sessions.len(),
            records: records.len() as u64,
            totals,
            estimated_cost: by_model.iter().map(|m| m.cost).sum(),
            by_model: sorted_by_cost(by_model),
            by_agent: rank_agents(&agents, &self.pricing),
            source: StatsSource::Local,
        }
    }

    fn clear_summaries(&self) {
        let Ok(entries) = fs::read_dir(&self.summary_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Err(e) = fs::remove_file(&path) {
                    tracing::debug!("failed to remove summary {:?}: {}", path, e);
                }
            }
        }
    }

    fn state_file(&self, session_id: &str) -> PathBuf {
        self.state_dir.join(snapshot::file_name_for(session_id))
    }

    fn read_snapshot(&self, session_id: &str) -> Option<SessionTokenStats> {
        let stats: SessionTokenStats = snapshot::read_json(&self.state_file(session_id))?;
        if stats.session_id != session_id {
            tracing::debug!(
                expected = session_id,
                found = %stats.session_id,
                "session snapshot belongs to another session"
            );
            return None;
        }
        Some(stats)
    }

    fn persist(&self) {
        let path = self.state_file(&self.session_id);
        if let Err(e) = snapshot::write_json(&path, &self.stats) {
            tracing::debug!("failed to persist session stats to {:?}: {}", path, e);
        }
    }
}

fn fold_session(records: Vec<TokenUsageRecord>, session_id: &str) -> SessionTokenStats {
    let mut stats = SessionTokenStats::new(session_id);
    for record in records.iter().filter(|r| r.session_id == session_id) {
        stats.apply(record);
    }
    stats
}

/// Every agent in `stats`, priced per contributing model and sorted by cost.
pub fn rank_agents(stats: &SessionTokenStats, pricing: &PricingResolver) -> Vec<TopAgent> {
    let mut ranked: Vec<TopAgent> = stats
        .by_agent
        .iter()
        .map(|agent| TopAgent {
            agent: agent.agent.clone(),
            cost: agent
                .by_model
                .iter()
                .map(|(model, totals)| pricing.cost(model, totals))
                .sum(),
            tokens: agent.totals.total(),
        })
        .collect();
    // Stable sort: ties stay in first-seen order.
    ranked.sort_by(|a, b| b.cost.total_cmp(&a.cost));
    ranked
}

fn sorted_by_cost(mut models: Vec<ModelStat>) -> Vec<ModelStat> {
    models.sort_by(|a, b| b.cost.total_cmp(&a.cost));
    models
}

fn merge_report(
    local: AllStats,
    rows: Vec<crate::providers::ModelReport>,
    source: &str,
    pricing: &PricingResolver,
) -> AllStats {
    let mut by_model: BTreeMap<String, TokenTotals> = BTreeMap::new();
    for row in rows {
        by_model.entry(row.model).or_default().add(&row.totals);
    }

    let mut totals = TokenTotals::default();
    let models: Vec<ModelStat> = by_model
        .into_iter()
        .map(|(model, model_totals)| {
            totals.add(&model_totals);
            let calls = local
                .by_model
                .iter()
                .find(|m| m.model == model)
                .map_or(0, |m| m.calls);
            ModelStat {
                cost: pricing.cost(&model, &model_totals),
                model,
                calls,
                totals: model_totals,
            }
        })
        .collect();

    AllStats {
        sessions: local.sessions,
        records: local.records,
        totals,
        estimated_cost: models.iter().map(|m| m.cost).sum(),
        by_model: sorted_by_cost(models),
        by_agent: local.by_agent,
        source: StatsSource::Report(source.to_string()),
    }
}
