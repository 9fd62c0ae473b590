use crate::backfill::{BackfillState, Reconciler};
use crate::config::{self, LedgerConfig, LedgerPaths};
use crate::error::LedgerError;
use crate::models::{
    AllStats, AnalyticsSummary, SessionTokenStats, TokenUsageRecord, TopAgent, UsageDraft,
};
use crate::pricing::PricingResolver;
use crate::providers::anthropic::AnthropicUsageReport;
use crate::providers::{build_http_client, UsageReportSource};
use crate::summary::SummaryCache;
use crate::tracker::TokenTracker;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

/// Session context owning the tracker, the summary cache and the shared pricing.
pub struct UsageLedger {
    paths: LedgerPaths,
    config: LedgerConfig,
    client: Option<Client>,
    pricing: Arc<PricingResolver>,
    tracker: TokenTracker,
    summaries: SummaryCache,
}

impl UsageLedger {
    /// Resolves the home directory, loads its config and opens the ledger.
    pub async fn open_default(session_id: Option<String>) -> Result<Self, LedgerError> {
        let paths = LedgerPaths::resolve()?;
        config::ensure_initialized(&paths)?;
        let config = config::load_config(&paths)?;
        Self::open(paths, config, session_id).await
    }

    /// Picks the pricing source once and wires the usage report when a key exists.
    pub async fn open(
        paths: LedgerPaths,
        config: LedgerConfig,
        session_id: Option<String>,
    ) -> Result<Self, LedgerError> {
        paths.ensure_dirs()?;
        let client = build_http_client(config.pricing.timeout_secs)?;

        let cache_path = config
            .pricing
            .cache_file
            .then(|| paths.pricing_cache.clone());
        let pricing = PricingResolver::connect(&client, &config.pricing, cache_path).await;
        tracing::info!(source = pricing.source_name(), "pricing resolved");

        let reports: Option<Arc<dyn UsageReportSource>> = if config.reports.enabled {
            match config::get_api_key("anthropic") {
                Some(key) => Some(Arc::new(AnthropicUsageReport::new(
                    client.clone(),
                    key,
                    &config.reports,
                ))),
                None => {
                    tracing::debug!("no admin key for usage reports, using local log only");
                    None
                }
            }
        } else {
            None
        };

        let mut ledger = Self::from_parts(paths, config, Arc::new(pricing), reports, session_id);
        ledger.client = Some(client);
        Ok(ledger)
    }

    pub fn from_parts(
        paths: LedgerPaths,
        config: LedgerConfig,
        pricing: Arc<PricingResolver>,
        reports: Option<Arc<dyn UsageReportSource>>,
        session_id: Option<String>,
    ) -> Self {
        let tracker = TokenTracker::new(
            &paths,
            session_id,
            Duration::from_secs(config.index_ttl_secs),
            pricing.clone(),
            reports,
        );
        let summaries = SummaryCache::new(
            &paths.summary_dir,
            tracker.event_log().clone(),
            pricing.clone(),
            config.top_agents_limit,
        );
        tracing::debug!(session = tracker.session_id(), "usage ledger opened");
        Self {
            paths,
            config,
            client: None,
            pricing,
            tracker,
            summaries,
        }
    }

    pub fn paths(&self) -> &LedgerPaths {
        &self.paths
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn pricing(&self) -> &PricingResolver {
        &self.pricing
    }

    pub fn session_id(&self) -> &str {
        self.tracker.session_id()
    }

    pub fn tracker(&self) -> &TokenTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut TokenTracker {
        &mut self.tracker
    }

    pub fn summaries_mut(&mut self) -> &mut SummaryCache {
        &mut self.summaries
    }

    pub fn record_token_usage(&mut self, draft: UsageDraft) -> TokenUsageRecord {
        self.tracker.record_token_usage(draft)
    }

    pub fn load_session_stats(&mut self, session_id: Option<&str>) -> SessionTokenStats {
        self.tracker.load_session_stats(session_id)
    }

    pub fn get_top_agents(&self, limit: usize) -> Vec<TopAgent> {
        self.tracker.get_top_agents(limit)
    }

    pub async fn get_all_stats(&self) -> AllStats {
        self.tracker.get_all_stats().await
    }

    /// Summary for `session_id`, defaulting to this ledger's session.
    pub fn load_analytics_fast(&mut self, session_id: Option<&str>) -> AnalyticsSummary {
        let session = session_id.unwrap_or(self.tracker.session_id()).to_string();
        self.summaries.load_analytics_fast(&session)
    }

    /// Applies the configured retention window.
    pub fn cleanup_old_logs(&mut self) -> usize {
        self.tracker.cleanup_old_logs(self.config.retention_days)
    }

    /// Opens a reconciler over this ledger's log and persisted backfill state.
    pub fn reconciler(&self) -> Result<Reconciler, LedgerError> {
        let state = BackfillState::open(&self.paths.backfill_db)?;
        Ok(Reconciler::new(self.tracker.event_log().clone(), state))
    }

    /// Makes a new live-pricing load attempt if none was made since the last reset.
    /// Returns the name of the source now in use.
    pub async fn refresh_pricing(&mut self) -> Result<&'static str, LedgerError> {
        let client = match &self.client {
            Some(client) => client.clone(),
            None => {
                let client = build_http_client(self.config.pricing.timeout_secs)?;
                self.client = Some(client.clone());
                client
            }
        };
        let cache_path = self
            .config
            .pricing
            .cache_file
            .then(|| self.paths.pricing_cache.clone());
        self.pricing
            .ensure_loaded(&client, &self.config.pricing, cache_path)
            .await;
        Ok(self.pricing.source_name())
    }

    /// Drops this session's derived state and the cached pricing source. The event
    /// log is kept.
    pub fn teardown(&mut self) {
        self.tracker.reset();
        self.pricing.reset_adapter_cache();
        let path = self.summaries.summary_path(self.tracker.session_id());
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!("failed to remove summary {:?}: {}", path, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PricingSettings, ReportSettings};
    use crate::models::StatsSource;
    use tempfile::TempDir;

    fn offline_config() -> LedgerConfig {
        LedgerConfig {
            pricing: PricingSettings {
                live: false,
                ..Default::default()
            },
            reports: ReportSettings {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn offline_open_uses_static_pricing_and_local_stats() {
        let tmp = TempDir::new().expect("tempdir");
        let mut ledger = UsageLedger::open(
            LedgerPaths::under(tmp.path()),
            offline_config(),
            Some("s1".into()),
        )
        .await
        .expect("open");
        assert_eq!(ledger.pricing().source_name(), "static");
        assert_eq!(ledger.session_id(), "s1");

        ledger.record_token_usage(UsageDraft::new("claude-sonnet-4.5", 1000, 500));
        let all = ledger.get_all_stats().await;
        assert_eq!(all.source, StatsSource::Local);
        assert_eq!(all.records, 1);
    }

    #[test]
    fn summary_and_tracker_agree() {
        let tmp = TempDir::new().expect("tempdir");
        let mut ledger = UsageLedger::from_parts(
            LedgerPaths::under(tmp.path()),
            offline_config(),
            Arc::new(PricingResolver::static_only()),
            None,
            Some("s1".into()),
        );
        ledger.record_token_usage(UsageDraft::new("claude-sonnet-4.5", 1000, 500));
        ledger.record_token_usage(UsageDraft::new("claude-opus-4.6", 2000, 1000).with_agent("planner"));

        let summary = ledger.load_analytics_fast(None);
        assert_eq!(summary.totals.tokens, ledger.tracker().stats().totals);
        let top = ledger.get_top_agents(10);
        assert_eq!(summary.top_agents.len(), top.len());
        for (cached, live) in summary.top_agents.iter().zip(&top) {
            assert_eq!(cached.agent, live.agent);
            assert_eq!(cached.tokens, live.tokens);
            assert!((cached.cost - live.cost).abs() < 1e-12);
        }
    }

    #[test]
    fn reconciler_skips_records_already_recorded() {
        let tmp = TempDir::new().expect("tempdir");
        let mut ledger = UsageLedger::from_parts(
            LedgerPaths::under(tmp.path()),
            offline_config(),
            Arc::new(PricingResolver::static_only()),
            None,
            Some("s1".into()),
        );
        let live = ledger.record_token_usage(UsageDraft::new("claude-haiku-4.5", 10, 1));

        let mut reconciler = ledger.reconciler().expect("reconciler");
        reconciler.seed_from_log().expect("seed");
        let report = reconciler.ingest([live]).expect("ingest");
        assert_eq!(report.appended, 0);
        assert_eq!(ledger.tracker().event_log().read_all().len(), 1);
    }

    #[tokio::test]
    async fn teardown_resets_pricing_and_refresh_reloads_it() {
        use crate::providers::litellm::RawPricing;
        use std::collections::HashMap;

        let tmp = TempDir::new().expect("tempdir");
        let paths = LedgerPaths::under(tmp.path());
        let models = HashMap::from([(
            "claude-sonnet-4-5".to_string(),
            RawPricing {
                input_cost_per_token: Some(3e-6),
                output_cost_per_token: Some(15e-6),
                cache_creation_input_token_cost: None,
                cache_read_input_token_cost: None,
            },
        )]);
        crate::snapshot::write_json(&paths.pricing_cache, &models).expect("seed cache");

        let mut config = offline_config();
        config.pricing = PricingSettings {
            url: Some("http://127.0.0.1:9/prices.json".into()),
            timeout_secs: 2,
            ..Default::default()
        };
        let mut ledger = UsageLedger::open(paths, config, Some("s1".into()))
            .await
            .expect("open");
        assert_eq!(ledger.pricing().source_name(), "litellm");

        ledger.teardown();
        assert_eq!(ledger.pricing().source_name(), "static");
        assert_eq!(ledger.tracker().pricing().source_name(), "static");

        assert_eq!(ledger.refresh_pricing().await.expect("refresh"), "litellm");
        assert_eq!(ledger.tracker().pricing().source_name(), "litellm");
    }

    #[test]
    fn teardown_keeps_the_log() {
        let tmp = TempDir::new().expect("tempdir");
        let paths = LedgerPaths::under(tmp.path());
        let mut ledger = UsageLedger::from_parts(
            paths.clone(),
            offline_config(),
            Arc::new(PricingResolver::static_only()),
            None,
            Some("s1".into()),
        );
        ledger.record_token_usage(UsageDraft::new("claude-haiku-4.5", 10, 1));
        ledger.load_analytics_fast(None);
        ledger.teardown();

        assert_eq!(ledger.tracker().stats().record_count, 0);
        assert!(!paths.summary_dir.join("s1.json").exists());
        assert_eq!(ledger.load_session_stats(None).record_count, 1);
    }
}
