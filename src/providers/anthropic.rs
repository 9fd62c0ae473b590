use crate::config::ReportSettings;
use crate::error::LedgerError;
use crate::models::TokenTotals;
use crate::pricing::normalize_model_name;
use crate::providers::{ModelReport, UsageReportSource};
use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use reqwest::Client;
use serde_json::Value;

const DEFAULT_BASE: &str = "https://api.anthropic.com";
const REPORT_PATH: &str = "/v1/organizations/usage_report/messages";
const MAX_PAGES: usize = 50;

pub struct AnthropicUsageReport {
    client: Client,
    api_key: String,
    base_url: Option<String>,
    lookback_days: u32,
}

impl AnthropicUsageReport {
    pub fn new(client: Client, api_key: String, settings: &ReportSettings) -> Self {
        Self {
            client,
            api_key,
            base_url: settings.base_url.clone(),
            lookback_days: settings.lookback_days,
        }
    }

    fn resolve_report_url(base_url: Option<&str>) -> Result<url::Url, LedgerError> {
        let mut parsed = url::Url::parse(base_url.unwrap_or(DEFAULT_BASE))?;
        let path = parsed.path().to_string();
        if path.is_empty() || path == "/" || path == "/v1" || path == "/v1/" {
            parsed.set_path(REPORT_PATH);
        }
        Ok(parsed)
    }

    fn report_url(&self, page: Option<&str>) -> Result<url::Url, LedgerError> {
        let end = Utc::now();
        let start = Duration::try_days(i64::from(self.lookback_days))
            .and_then(|window| end.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let mut url = Self::resolve_report_url(self.base_url.as_deref())?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair(
                    "starting_at",
                    &start.to_rfc3339_opts(SecondsFormat::Secs, true),
                )
                .append_pair("ending_at", &end.to_rfc3339_opts(SecondsFormat::Secs, true))
                .append_pair("bucket_width", "1d")
                .append_pair("group_by[]", "model");
            if let Some(page) = page {
                query.append_pair("page", page);
            }
        }
        Ok(url)
    }

    /// Accepts both bucketed (`data[].results[]`) and flat (`data[]`) report shapes.
    fn parse_items(body: &Value) -> Vec<ModelReport> {
        let buckets = body
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::new();
        for bucket in &buckets {
            match bucket.get("results").and_then(Value::as_array) {
                Some(results) => out.extend(results.iter().map(Self::parse_result)),
                None => out.push(Self::parse_result(bucket)),
            }
        }
        out
    }

    fn parse_result(item: &Value) -> ModelReport {
        let model = item
            .get("model")
            .and_then(Value::as_str)
            .map(normalize_model_name)
            .unwrap_or_else(|| "unknown".to_string());

        let field = |names: &[&str]| -> u64 {
            names
                .iter()
                .find_map(|n| item.get(*n).and_then(Value::as_u64))
                .unwrap_or(0)
        };

        let cache_creation = match item.get("cache_creation") {
            Some(Value::Object(parts)) => parts.values().filter_map(Value::as_u64).sum::<u64>(),
            _ => field(&["cache_creation_input_tokens"]),
        };

        ModelReport {
            model,
            totals: TokenTotals {
                input_tokens: field(&["uncached_input_tokens", "input_tokens", "tokens_in"]),
                output_tokens: field(&["output_tokens", "tokens_out"]),
                cache_creation_tokens: cache_creation,
                cache_read_tokens: field(&["cache_read_input_tokens"]),
            },
        }
    }
}

#[async_trait]
impl UsageReportSource for AnthropicUsageReport {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn fetch_model_totals(&self) -> Result<Vec<ModelReport>, LedgerError> {
        let mut out = Vec::new();
        let mut page: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let url = self.report_url(page.as_deref())?;
            let response = self
                .client
                .get(url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01")
                .send()
                .await?;

            let status = response.status();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(LedgerError::Report(
                    "Anthropic rejected credentials (unauthorized).".into(),
                ));
            }
            let body: Value = response.error_for_status()?.json().await?;
            out.extend(Self::parse_items(&body));

            let has_more = body.get("has_more").and_then(Value::as_bool).unwrap_or(false);
            page = body
                .get("next_page")
                .and_then(Value::as_str)
                .map(ToString::to_string);
            if !has_more || page.is_none() {
                return Ok(out);
            }
        }

        tracing::warn!("usage report truncated after {MAX_PAGES} pages");
        Ok(out)
    }
}
