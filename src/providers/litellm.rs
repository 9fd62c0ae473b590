use crate::config::PricingSettings;
use crate::error::LedgerError;
use crate::pricing::{normalize_model_name, ModelPricing, PricingSource};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const LITELLM_PRICING_URL: &str =
    "https://raw.githubusercontent.com/BerriAI/litellm/main/model_prices_and_context_window.json";

const KEY_PREFIXES: &[&str] = &["anthropic/", "claude-", "bedrock/", "vertex_ai/"];

/// Absolute per-token prices as published in the LiteLLM price list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPricing {
    pub input_cost_per_token: Option<f64>,
    pub output_cost_per_token: Option<f64>,
    pub cache_creation_input_token_cost: Option<f64>,
    pub cache_read_input_token_cost: Option<f64>,
}

/// Live price list, loaded once per process.
pub struct ExternalPricingSource {
    models: HashMap<String, RawPricing>,
}

impl ExternalPricingSource {
    /// Fetch from the network, falling back to the last cached copy.
    pub async fn load(
        client: &Client,
        settings: &PricingSettings,
        cache_path: Option<PathBuf>,
    ) -> Result<Self, LedgerError> {
        let url = settings.url.as_deref().unwrap_or(LITELLM_PRICING_URL);
        let timeout = Duration::from_secs(settings.timeout_secs);

        match Self::fetch(client, url, timeout).await {
            Ok(source) => {
                if let Some(path) = cache_path.as_deref().filter(|_| settings.cache_file) {
                    if let Err(e) = source.save_cache(path) {
                        tracing::debug!("failed to cache price list at {:?}: {}", path, e);
                    }
                }
                return Ok(source);
            }
            Err(e) => tracing::debug!("price list fetch from {url} failed: {e}"),
        }

        if let Some(path) = cache_path.as_deref().filter(|_| settings.cache_file) {
            match Self::load_cache(path) {
                Ok(source) => {
                    tracing::info!("using cached price list from {:?}", path);
                    return Ok(source);
                }
                Err(e) => tracing::debug!("no usable cached price list: {e}"),
            }
        }

        Err(LedgerError::PricingUnavailable(format!(
            "could not fetch {url} and no cached copy is available"
        )))
    }

    async fn fetch(client: &Client, url: &str, timeout: Duration) -> Result<Self, LedgerError> {
        let raw: HashMap<String, serde_json::Value> = client
            .get(url)
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Self::from_models(Self::parse_raw_data(raw))
    }

    fn from_models(models: HashMap<String, RawPricing>) -> Result<Self, LedgerError> {
        if models.is_empty() {
            return Err(LedgerError::PricingUnavailable(
                "price list contains no priced models".into(),
            ));
        }
        Ok(Self { models })
    }

    /// Keeps only entries that price both input and output.
    fn parse_raw_data(raw: HashMap<String, serde_json::Value>) -> HashMap<String, RawPricing> {
        raw.into_iter()
            .filter_map(|(name, value)| {
                let pricing = serde_json::from_value::<RawPricing>(value).ok()?;
                (pricing.input_cost_per_token.is_some() && pricing.output_cost_per_token.is_some())
                    .then(|| (name.to_ascii_lowercase(), pricing))
            })
            .collect()
    }

    fn save_cache(&self, path: &Path) -> Result<(), LedgerError> {
        crate::snapshot::write_json(path, &self.models)
    }

    fn load_cache(path: &Path) -> Result<Self, LedgerError> {
        let raw = std::fs::read_to_string(path)?;
        let models: HashMap<String, RawPricing> = serde_json::from_str(&raw)?;
        Self::from_models(models)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Exact name, then known key prefixes (each also with dotted versions dashed),
    /// then the longest key overlapping the name.
    fn find(&self, model: &str) -> Option<&RawPricing> {
        let name = normalize_model_name(model);
        // Price-list keys spell versions with dashes (`claude-opus-4-6`).
        let dashed = name.replace('.', "-");
        let candidates = if dashed == name {
            vec![name.as_str()]
        } else {
            vec![name.as_str(), dashed.as_str()]
        };

        for candidate in &candidates {
            if let Some(pricing) = self.models.get(*candidate) {
                return Some(pricing);
            }
            for prefix in KEY_PREFIXES {
                if let Some(pricing) = self.models.get(&format!("{prefix}{candidate}")) {
                    return Some(pricing);
                }
            }
        }

        self.models
            .iter()
            .filter(|(key, _)| {
                let bare = key.rsplit('/').next().unwrap_or(key.as_str());
                bare.len() >= 6 && (bare.contains(name.as_str()) || name.contains(bare))
            })
            .max_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| b.cmp(a)))
            .map(|(_, pricing)| pricing)
    }
}

impl PricingSource for ExternalPricingSource {
    fn name(&self) -> &'static str {
        "litellm"
    }

    fn is_healthy(&self) -> bool {
        !self.models.is_empty()
    }

    fn lookup(&self, model: &str) -> Result<ModelPricing, LedgerError> {
        let raw = self
            .find(model)
            .ok_or_else(|| LedgerError::PricingUnavailable(format!("no live price for {model}")))?;
        match (raw.input_cost_per_token, raw.output_cost_per_token) {
            (Some(input), Some(output)) => Ok(ModelPricing::from_per_token(
                input,
                output,
                raw.cache_creation_input_token_cost,
                raw.cache_read_input_token_cost,
            )),
            _ => Err(LedgerError::PricingUnavailable(format!(
                "incomplete live price for {model}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn sonnet() -> RawPricing {
        RawPricing {
            input_cost_per_token: Some(3e-6),
            output_cost_per_token: Some(15e-6),
            cache_creation_input_token_cost: Some(3.75e-6),
            cache_read_input_token_cost: Some(0.3e-6),
        }
    }

    fn source_with(entries: &[(&str, RawPricing)]) -> ExternalPricingSource {
        ExternalPricingSource::from_models(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
        .expect("non-empty")
    }

    #[test]
    fn parse_raw_data_skips_unpriced_entries() {
        let raw = HashMap::from([
            (
                "Claude-Sonnet-4-5".to_string(),
                json!({ "input_cost_per_token": 3e-6, "output_cost_per_token": 15e-6 }),
            ),
            ("embedding-only".to_string(), json!({ "input_cost_per_token": 1e-7 })),
            ("sample_spec".to_string(), json!("documentation")),
        ]);
        let models = ExternalPricingSource::parse_raw_data(raw);
        assert_eq!(models.len(), 1);
        assert!(models.contains_key("claude-sonnet-4-5"));
    }

    #[test]
    fn lookup_derives_cache_ratios() {
        let source = source_with(&[("claude-sonnet-4-5", sonnet())]);
        let pricing = source.lookup("Claude-Sonnet-4-5").expect("priced");
        assert!((pricing.output_per_million - 15.0).abs() < 1e-9);
        assert!((pricing.cache_write_markup - 0.25).abs() < 1e-9);
        assert!((pricing.cache_read_discount - 0.9).abs() < 1e-9);
    }

    #[test]
    fn lookup_tries_prefixes_then_longest_overlap() {
        let source = source_with(&[
            ("anthropic/claude-opus-4-6", sonnet()),
            ("claude-haiku-4-5-20251001", sonnet()),
            ("claude-haiku-4-5", RawPricing {
                output_cost_per_token: Some(5e-6),
                ..sonnet()
            }),
        ]);
        assert!(source.find("claude-opus-4-6").is_some());
        let haiku = source.lookup("claude-haiku-4-5-20251001-extended").expect("fuzzy");
        assert!((haiku.output_per_million - 15.0).abs() < 1e-9);
        assert!(source.lookup("gpt-4o").is_err());
    }

    #[test]
    fn dotted_versions_match_dashed_keys_before_shorter_ones() {
        let source = source_with(&[
            ("claude-opus-4", RawPricing {
                input_cost_per_token: Some(15e-6),
                output_cost_per_token: Some(75e-6),
                ..sonnet()
            }),
            ("claude-opus-4-6", RawPricing {
                input_cost_per_token: Some(5e-6),
                output_cost_per_token: Some(25e-6),
                ..sonnet()
            }),
            ("anthropic/claude-haiku-4-5", RawPricing {
                output_cost_per_token: Some(5e-6),
                ..sonnet()
            }),
        ]);
        let opus = source.lookup("claude-opus-4.6").expect("dashed key");
        assert!((opus.output_per_million - 25.0).abs() < 1e-9);
        let haiku = source.lookup("claude-haiku-4.5").expect("prefixed dashed key");
        assert!((haiku.output_per_million - 5.0).abs() < 1e-9);
        let legacy = source.lookup("claude-opus-4").expect("exact key");
        assert!((legacy.output_per_million - 75.0).abs() < 1e-9);
    }

    #[test]
    fn empty_price_list_is_unavailable() {
        assert!(ExternalPricingSource::from_models(HashMap::new()).is_err());
    }

    #[tokio::test]
    async fn unreachable_url_falls_back_to_cached_copy() {
        let tmp = TempDir::new().expect("tempdir");
        let cache = tmp.path().join("pricing.json");
        source_with(&[("claude-sonnet-4-5", sonnet())])
            .save_cache(&cache)
            .expect("seed cache");

        let settings = PricingSettings {
            url: Some("http://127.0.0.1:9/prices.json".into()),
            timeout_secs: 2,
            ..Default::default()
        };
        let loaded = ExternalPricingSource::load(&Client::new(), &settings, Some(cache.clone()))
            .await
            .expect("cached copy");
        assert_eq!(loaded.len(), 1);

        let no_cache = ExternalPricingSource::load(&Client::new(), &settings, None).await;
        assert!(matches!(no_cache, Err(LedgerError::PricingUnavailable(_))));
    }
}
