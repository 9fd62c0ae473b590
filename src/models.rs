use crate::pricing::normalize_model_name;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::{self, Write};

/// Agent key used for records that carry no agent name.
pub const MAIN_SESSION_AGENT: &str = "(main session)";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
}

impl TokenTotals {
    pub fn add(&mut self, other: &TokenTotals) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.cache_creation_tokens = self
            .cache_creation_tokens
            .saturating_add(other.cache_creation_tokens);
        self.cache_read_tokens = self.cache_read_tokens.saturating_add(other.cache_read_tokens);
    }

    pub fn total(&self) -> u64 {
        self.input_tokens
            .saturating_add(self.output_tokens)
            .saturating_add(self.cache_creation_tokens)
            .saturating_add(self.cache_read_tokens)
    }

    /// Share of prompt tokens served from cache, as a percentage in `[0, 100]`.
    pub fn cache_hit_rate(&self) -> f64 {
        let denom = self.input_tokens as u128
            + self.cache_creation_tokens as u128
            + self.cache_read_tokens as u128;
        if denom == 0 {
            return 0.0;
        }
        (self.cache_read_tokens as u128 * 100) as f64 / denom as f64
    }
}

/// One model call, exactly as stored in the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsageRecord {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    pub model_name: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
}

impl TokenUsageRecord {
    /// Rejects records that deserialized but carry no usable identity.
    pub fn is_valid(&self) -> bool {
        !self.session_id.trim().is_empty() && !self.model_name.trim().is_empty()
    }

    pub fn totals(&self) -> TokenTotals {
        TokenTotals {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cache_creation_tokens: self.cache_creation_tokens,
            cache_read_tokens: self.cache_read_tokens,
        }
    }

    pub fn agent_key(&self) -> &str {
        match self.agent_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name,
            _ => MAIN_SESSION_AGENT,
        }
    }

    pub fn event_id(&self) -> EventId {
        EventId::compute(&self.session_id, &self.timestamp, &self.model_name)
    }
}

/// Deduplication key over `(session, timestamp, normalized model)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn compute(session_id: &str, timestamp: &DateTime<Utc>, model_name: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(session_id.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(
            timestamp
                .to_rfc3339_opts(SecondsFormat::AutoSi, true)
                .as_bytes(),
        );
        hasher.update(b"\x1f");
        hasher.update(normalize_model_name(model_name).as_bytes());

        let digest = hasher.finalize();
        let mut out = String::with_capacity(digest.len() * 2);
        for byte in digest {
            let _ = write!(&mut out, "{:02x}", byte);
        }
        Self(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a producer knows about a model call before it is stamped.
#[derive(Debug, Clone, Default)]
pub struct UsageDraft {
    pub agent_name: Option<String>,
    pub model_name: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    /// Overrides the "now" stamp, e.g. when replaying a transcript.
    pub timestamp: Option<DateTime<Utc>>,
}

impl UsageDraft {
    pub fn new(model_name: impl Into<String>, input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            model_name: model_name.into(),
            input_tokens,
            output_tokens,
            ..Default::default()
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent_name = Some(agent.into());
        self
    }

    pub fn with_cache(mut self, creation: u64, read: u64) -> Self {
        self.cache_creation_tokens = creation;
        self.cache_read_tokens = read;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn stamp(self, session_id: &str) -> TokenUsageRecord {
        TokenUsageRecord {
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            session_id: session_id.to_string(),
            agent_name: self
                .agent_name
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty()),
            model_name: normalize_model_name(&self.model_name),
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cache_creation_tokens: self.cache_creation_tokens,
            cache_read_tokens: self.cache_read_tokens,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageTally {
    pub calls: u64,
    pub totals: TokenTotals,
}

impl UsageTally {
    fn add(&mut self, totals: &TokenTotals) {
        self.calls += 1;
        self.totals.add(totals);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentUsage {
    pub agent: String,
    pub calls: u64,
    pub totals: TokenTotals,
    /// Per-model split so cost can be priced per contributing model.
    pub by_model: BTreeMap<String, TokenTotals>,
}

/// Running aggregate for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTokenStats {
    pub session_id: String,
    pub record_count: u64,
    pub totals: TokenTotals,
    /// Insertion-ordered so ties in cost sort deterministically.
    pub by_agent: Vec<AgentUsage>,
    pub by_model: BTreeMap<String, UsageTally>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl SessionTokenStats {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            record_count: 0,
            totals: TokenTotals::default(),
            by_agent: Vec::new(),
            by_model: BTreeMap::new(),
            last_updated: None,
        }
    }

    pub fn total_input_tokens(&self) -> u64 {
        self.totals.input_tokens
    }

    pub fn apply(&mut self, record: &TokenUsageRecord) {
        let totals = record.totals();
        self.record_count += 1;
        self.totals.add(&totals);

        let key = record.agent_key();
        let idx = match self.by_agent.iter().position(|a| a.agent == key) {
            Some(idx) => idx,
            None => {
                self.by_agent.push(AgentUsage {
                    agent: key.to_string(),
                    calls: 0,
                    totals: TokenTotals::default(),
                    by_model: BTreeMap::new(),
                });
                self.by_agent.len() - 1
            }
        };
        let agent = &mut self.by_agent[idx];
        agent.calls += 1;
        agent.totals.add(&totals);
        agent
            .by_model
            .entry(record.model_name.clone())
            .or_default()
            .add(&totals);

        self.by_model
            .entry(record.model_name.clone())
            .or_default()
            .add(&totals);

        self.last_updated = Some(match self.last_updated {
            Some(prev) if prev > record.timestamp => prev,
            _ => record.timestamp,
        });
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopAgent {
    pub agent: String,
    pub cost: f64,
    pub tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryTotals {
    #[serde(flatten)]
    pub tokens: TokenTotals,
    pub estimated_cost: f64,
}

/// Materialized per-session view persisted by the summary cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSummary {
    pub session_id: String,
    pub last_updated: Option<DateTime<Utc>>,
    /// Complete log lines already folded into `totals`.
    pub last_log_offset: u64,
    pub totals: SummaryTotals,
    pub top_agents: Vec<TopAgent>,
    pub cache_hit_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelStat {
    pub model: String,
    pub calls: u64,
    pub totals: TokenTotals,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsSource {
    Local,
    Report(String),
}

/// Cross-session report over everything ever logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllStats {
    pub sessions: usize,
    pub records: u64,
    pub totals: TokenTotals,
    pub estimated_cost: f64,
    pub by_model: Vec<ModelStat>,
    pub by_agent: Vec<TopAgent>,
    pub source: StatsSource,
}
