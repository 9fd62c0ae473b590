pub mod backfill;
pub mod config;
pub mod error;
pub mod event_log;
pub mod models;
pub mod pricing;
pub mod providers;
pub mod service;
pub mod session_index;
pub mod snapshot;
pub mod summary;
pub mod tracker;

pub use backfill::{BackfillReport, BackfillState, Reconciler};
pub use config::{LedgerConfig, LedgerPaths};
pub use error::LedgerError;
pub use event_log::EventLog;
pub use models::{
    AllStats, AnalyticsSummary, EventId, SessionTokenStats, TokenTotals, TokenUsageRecord,
    TopAgent, UsageDraft, MAIN_SESSION_AGENT,
};
pub use pricing::{ModelPricing, PricingResolver, PricingSource};
pub use service::UsageLedger;
pub use session_index::SessionIndex;
pub use summary::SummaryCache;
pub use tracker::TokenTracker;
