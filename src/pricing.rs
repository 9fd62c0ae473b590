use crate::config::PricingSettings;
use crate::error::LedgerError;
use crate::models::TokenTotals;
use crate::providers::litellm::ExternalPricingSource;
use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const PROVIDER_PREFIXES: &[&str] = &["anthropic/", "anthropic.", "bedrock/", "vertex_ai/"];

pub const DEFAULT_CACHE_WRITE_MARKUP: f64 = 0.25;
pub const DEFAULT_CACHE_READ_DISCOUNT: f64 = 0.90;

/// Cost schedule in USD per million tokens. Cache tokens are priced relative to input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub cache_write_markup: f64,
    pub cache_read_discount: f64,
}

impl ModelPricing {
    /// Derives the relative cache schedule from absolute per-token prices.
    pub fn from_per_token(
        input: f64,
        output: f64,
        cache_write: Option<f64>,
        cache_read: Option<f64>,
    ) -> Self {
        let cache_write_markup = match cache_write {
            Some(cw) if input > 0.0 => cw / input - 1.0,
            _ => DEFAULT_CACHE_WRITE_MARKUP,
        };
        let cache_read_discount = match cache_read {
            Some(cr) if input > 0.0 => 1.0 - cr / input,
            _ => DEFAULT_CACHE_READ_DISCOUNT,
        };
        Self {
            input_per_million: input * 1_000_000.0,
            output_per_million: output * 1_000_000.0,
            cache_write_markup,
            cache_read_discount,
        }
    }

    pub fn cost(&self, totals: &TokenTotals) -> f64 {
        let input_rate = self.input_per_million / 1_000_000.0;
        let output_rate = self.output_per_million / 1_000_000.0;
        let write_rate = input_rate * (1.0 + self.cache_write_markup);
        let read_rate = input_rate * (1.0 - self.cache_read_discount);

        totals.input_tokens as f64 * input_rate
            + totals.output_tokens as f64 * output_rate
            + totals.cache_creation_tokens as f64 * write_rate
            + totals.cache_read_tokens as f64 * read_rate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelTier {
    Haiku,
    Sonnet,
    Opus,
}

impl ModelTier {
    /// Substring match on the model id; anything unrecognized prices as Sonnet.
    pub fn from_model(model: &str) -> Self {
        let lower = model.to_ascii_lowercase();
        if lower.contains("haiku") {
            ModelTier::Haiku
        } else if lower.contains("opus") {
            ModelTier::Opus
        } else {
            ModelTier::Sonnet
        }
    }

    /// Typical output size relative to the prompt.
    pub fn output_ratio(self) -> f64 {
        match self {
            ModelTier::Haiku => 0.30,
            ModelTier::Sonnet => 0.40,
            ModelTier::Opus => 0.50,
        }
    }

    fn static_pricing(self) -> ModelPricing {
        let (input, output) = match self {
            ModelTier::Haiku => (0.80, 4.0),
            ModelTier::Sonnet => (3.0, 15.0),
            ModelTier::Opus => (15.0, 75.0),
        };
        ModelPricing {
            input_per_million: input,
            output_per_million: output,
            cache_write_markup: DEFAULT_CACHE_WRITE_MARKUP,
            cache_read_discount: DEFAULT_CACHE_READ_DISCOUNT,
        }
    }
}

pub fn normalize_model_name(raw: &str) -> String {
    let mut name = raw.trim().to_ascii_lowercase();
    loop {
        let Some(prefix) = PROVIDER_PREFIXES
            .iter()
            .copied()
            .find(|p| name.starts_with(*p))
        else {
            break;
        };
        name = name[prefix.len()..].to_string();
    }
    if name.is_empty() {
        "unknown".into()
    } else {
        name
    }
}

/// Guesses output tokens for producers that only saw the prompt.
pub fn estimate_output_tokens(model: &str, input_tokens: u64) -> u64 {
    (input_tokens as f64 * ModelTier::from_model(model).output_ratio()).round() as u64
}

pub trait PricingSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_healthy(&self) -> bool {
        true
    }

    fn lookup(&self, model: &str) -> Result<ModelPricing, LedgerError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StaticTablePricingSource;

impl StaticTablePricingSource {
    pub fn pricing_for(&self, model: &str) -> ModelPricing {
        ModelTier::from_model(model).static_pricing()
    }
}

impl PricingSource for StaticTablePricingSource {
    fn name(&self) -> &'static str {
        "static"
    }

    fn lookup(&self, model: &str) -> Result<ModelPricing, LedgerError> {
        Ok(self.pricing_for(model))
    }
}

/// Resolves model names to prices, preferring a live source chosen once per load attempt.
///
/// The live source sits behind a lock so a resolver shared through `Arc` can still be
/// reset and reloaded.
pub struct PricingResolver {
    external: RwLock<Option<Arc<dyn PricingSource>>>,
    load_attempted: AtomicBool,
    fallback: StaticTablePricingSource,
    fallback_logged: AtomicBool,
}

impl PricingResolver {
    pub fn static_only() -> Self {
        Self {
            external: RwLock::new(None),
            load_attempted: AtomicBool::new(false),
            fallback: StaticTablePricingSource,
            fallback_logged: AtomicBool::new(false),
        }
    }

    pub fn with_source(source: Arc<dyn PricingSource>) -> Self {
        let resolver = Self::static_only();
        *resolver.external.write() = Some(source);
        resolver.load_attempted.store(true, Ordering::Relaxed);
        resolver
    }

    /// Builds a resolver and makes its live-source load attempt.
    pub async fn connect(
        client: &Client,
        settings: &PricingSettings,
        cache_path: Option<PathBuf>,
    ) -> Self {
        let resolver = Self::static_only();
        resolver.ensure_loaded(client, settings, cache_path).await;
        resolver
    }

    /// Makes the live-source load attempt unless one was already made since the
    /// last reset. Any failure degrades to the static table.
    pub async fn ensure_loaded(
        &self,
        client: &Client,
        settings: &PricingSettings,
        cache_path: Option<PathBuf>,
    ) {
        if self.load_attempted.swap(true, Ordering::AcqRel) {
            return;
        }
        if !settings.live {
            return;
        }

        match ExternalPricingSource::load(client, settings, cache_path).await {
            Ok(source) => {
                tracing::debug!(models = source.len(), "live pricing source loaded");
                *self.external.write() = Some(Arc::new(source));
                self.fallback_logged.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::warn!("live pricing unavailable, using static table: {e}");
                self.fallback_logged.store(true, Ordering::Relaxed);
            }
        }
    }

    pub fn source_name(&self) -> &'static str {
        match self.external.read().as_ref() {
            Some(source) if source.is_healthy() => source.name(),
            _ => self.fallback.name(),
        }
    }

    pub fn lookup_pricing(&self, model: &str) -> ModelPricing {
        let external = self.external.read().clone();
        if let Some(source) = external {
            let attempt = if source.is_healthy() {
                source.lookup(model)
            } else {
                Err(LedgerError::PricingUnavailable(format!(
                    "{} is unhealthy",
                    source.name()
                )))
            };
            match attempt {
                Ok(pricing) => return pricing,
                Err(e) => {
                    if !self.fallback_logged.swap(true, Ordering::Relaxed) {
                        tracing::warn!(
                            source = source.name(),
                            "falling back to static pricing: {e}"
                        );
                    }
                }
            }
        }
        self.fallback.pricing_for(model)
    }

    pub fn cost(&self, model: &str, totals: &TokenTotals) -> f64 {
        self.lookup_pricing(model).cost(totals)
    }

    /// Forgets the live source and the load attempt, so the next `ensure_loaded`
    /// tries again.
    pub fn reset_adapter_cache(&self) {
        *self.external.write() = None;
        self.load_attempted.store(false, Ordering::Release);
        self.fallback_logged.store(false, Ordering::Relaxed);
    }
}

impl Default for PricingResolver {
    fn default() -> Self {
        Self::static_only()
    }
}
