use crate::error::LedgerError;
use crate::models::TokenTotals;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

pub mod anthropic;
pub mod litellm;

/// Model-level totals from an external usage report. Reports have no agent concept.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelReport {
    pub model: String,
    pub totals: TokenTotals,
}

#[async_trait]
pub trait UsageReportSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_model_totals(&self) -> Result<Vec<ModelReport>, LedgerError>;
}

pub fn build_http_client(timeout_secs: u64) -> Result<Client, LedgerError> {
    let client = Client::builder()
        .connect_timeout(Duration::from_secs(timeout_secs.min(10)))
        .timeout(Duration::from_secs(timeout_secs))
        .build()?;
    Ok(client)
}
