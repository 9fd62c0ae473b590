use crate::error::LedgerError;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const SERVICE_NAME: &str = "usage-ledger";
pub const HOME_ENV: &str = "USAGE_LEDGER_HOME";

const DEFAULT_RETENTION_DAYS: u32 = 30;
const DEFAULT_INDEX_TTL_SECS: u64 = 300;
const DEFAULT_TOP_AGENTS: usize = 10;

fn app_home_dir() -> Result<PathBuf, LedgerError> {
    if let Ok(custom) = std::env::var(HOME_ENV) {
        if !custom.trim().is_empty() {
            return Ok(PathBuf::from(custom));
        }
    }

    if let Some(dirs) = ProjectDirs::from("dev", "usage-ledger", SERVICE_NAME) {
        let candidate = dirs.data_local_dir().to_path_buf();
        if fs::create_dir_all(&candidate).is_ok() {
            return Ok(candidate);
        }
    }

    let cwd = std::env::current_dir()?;
    Ok(cwd.join(".usage-ledger"))
}

/// Every on-disk location, derived from one home directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerPaths {
    pub root: PathBuf,
    pub log_file: PathBuf,
    pub index_file: PathBuf,
    pub state_dir: PathBuf,
    pub summary_dir: PathBuf,
    pub backfill_db: PathBuf,
    pub pricing_cache: PathBuf,
}

impl LedgerPaths {
    pub fn under(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let data = root.join("data");
        Self {
            log_file: data.join("usage.ndjson"),
            index_file: data.join("session-index.json"),
            backfill_db: data.join("backfill.sqlite"),
            state_dir: root.join("state"),
            summary_dir: root.join("summaries"),
            pricing_cache: root.join("cache").join("pricing.json"),
            root,
        }
    }

    pub fn resolve() -> Result<Self, LedgerError> {
        Ok(Self::under(app_home_dir()?))
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config").join("config.toml")
    }

    pub fn ensure_dirs(&self) -> Result<(), LedgerError> {
        fs::create_dir_all(self.root.join("config"))?;
        fs::create_dir_all(self.root.join("data"))?;
        fs::create_dir_all(&self.state_dir)?;
        fs::create_dir_all(&self.summary_dir)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub retention_days: u32,
    pub index_ttl_secs: u64,
    pub top_agents_limit: usize,
    pub pricing: PricingSettings,
    pub reports: ReportSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingSettings {
    /// Try the live price list before the static table.
    pub live: bool,
    pub url: Option<String>,
    pub timeout_secs: u64,
    /// Keep a copy of the last good price list for offline starts.
    pub cache_file: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportSettings {
    pub enabled: bool,
    pub base_url: Option<String>,
    pub lookback_days: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            retention_days: DEFAULT_RETENTION_DAYS,
            index_ttl_secs: DEFAULT_INDEX_TTL_SECS,
            top_agents_limit: DEFAULT_TOP_AGENTS,
            pricing: PricingSettings::default(),
            reports: ReportSettings::default(),
        }
    }
}

impl Default for PricingSettings {
    fn default() -> Self {
        Self {
            live: true,
            url: None,
            timeout_secs: 15,
            cache_file: true,
        }
    }
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: None,
            lookback_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

fn validate_url(field: &str, raw: &Option<String>) -> Result<(), LedgerError> {
    if let Some(raw) = raw {
        url::Url::parse(raw)
            .map_err(|e| LedgerError::Config(format!("invalid {field} '{raw}': {e}")))?;
    }
    Ok(())
}

fn normalize_config(config: &mut LedgerConfig) -> Result<bool, LedgerError> {
    let mut changed = false;

    if config.retention_days == 0 {
        config.retention_days = DEFAULT_RETENTION_DAYS;
        changed = true;
    }
    if config.index_ttl_secs == 0 {
        config.index_ttl_secs = DEFAULT_INDEX_TTL_SECS;
        changed = true;
    }
    if config.top_agents_limit == 0 {
        config.top_agents_limit = DEFAULT_TOP_AGENTS;
        changed = true;
    }
    if config.pricing.timeout_secs == 0 {
        config.pricing.timeout_secs = PricingSettings::default().timeout_secs;
        changed = true;
    }
    if config.reports.lookback_days == 0 {
        config.reports.lookback_days = DEFAULT_RETENTION_DAYS;
        changed = true;
    }

    for url in [&mut config.pricing.url, &mut config.reports.base_url] {
        if url.as_deref().is_some_and(|u| u.trim().is_empty()) {
            *url = None;
            changed = true;
        }
    }
    validate_url("pricing.url", &config.pricing.url)?;
    validate_url("reports.base_url", &config.reports.base_url)?;

    Ok(changed)
}

pub fn load_config(paths: &LedgerPaths) -> Result<LedgerConfig, LedgerError> {
    let path = paths.config_file();
    if !path.exists() {
        return Ok(LedgerConfig::default());
    }

    let raw = fs::read_to_string(&path)?;
    let mut parsed: LedgerConfig = toml::from_str(&raw)?;
    if normalize_config(&mut parsed)? {
        save_config(paths, &parsed)?;
    }
    Ok(parsed)
}

pub fn save_config(paths: &LedgerPaths, config: &LedgerConfig) -> Result<(), LedgerError> {
    paths.ensure_dirs()?;
    let raw = toml::to_string_pretty(config)?;
    fs::write(paths.config_file(), raw)?;
    Ok(())
}

pub fn ensure_initialized(paths: &LedgerPaths) -> Result<(), LedgerError> {
    paths.ensure_dirs()?;
    if !Path::new(&paths.config_file()).exists() {
        save_config(paths, &LedgerConfig::default())?;
    }
    Ok(())
}

/// Admin key for a usage-report provider: OS keyring first, then `<PROVIDER>_ADMIN_KEY`.
pub fn get_api_key(provider: &str) -> Option<String> {
    let normalized = provider.trim().to_ascii_lowercase();
    match keyring::Entry::new(SERVICE_NAME, &format!("provider:{normalized}"))
        .and_then(|entry| entry.get_password())
    {
        Ok(value) if !value.is_empty() => return Some(value),
        Ok(_) | Err(keyring::Error::NoEntry) => {}
        Err(e) => tracing::debug!("keyring lookup for {normalized} failed: {e}"),
    }

    let env_name = format!(
        "{}_ADMIN_KEY",
        normalized.to_ascii_uppercase().replace('-', "_")
    );
    std::env::var(env_name).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn paths_are_derived_from_home() {
        let paths = LedgerPaths::under("/tmp/ledger-home");
        assert_eq!(
            paths.log_file,
            PathBuf::from("/tmp/ledger-home/data/usage.ndjson")
        );
        assert_eq!(
            paths.config_file(),
            PathBuf::from("/tmp/ledger-home/config/config.toml")
        );
        assert_eq!(paths.summary_dir, PathBuf::from("/tmp/ledger-home/summaries"));
    }

    #[test]
    fn home_env_overrides_platform_dir() {
        let tmp = TempDir::new().expect("tempdir");
        temp_env::with_var(HOME_ENV, Some(tmp.path()), || {
            let paths = LedgerPaths::resolve().expect("resolve");
            assert_eq!(paths.root, tmp.path());
        });
    }

    #[test]
    fn missing_config_yields_defaults() {
        let tmp = TempDir::new().expect("tempdir");
        let paths = LedgerPaths::under(tmp.path());
        let cfg = load_config(&paths).expect("load");
        assert_eq!(cfg, LedgerConfig::default());
        assert_eq!(cfg.index_ttl_secs, 300);
    }

    #[test]
    fn normalize_clamps_zero_values_and_persists() {
        let tmp = TempDir::new().expect("tempdir");
        let paths = LedgerPaths::under(tmp.path());
        paths.ensure_dirs().expect("dirs");
        fs::write(
            paths.config_file(),
            "retention_days = 0\ntop_agents_limit = 0\n[reports]\nbase_url = \"\"\n",
        )
        .expect("write config");

        let cfg = load_config(&paths).expect("load");
        assert_eq!(cfg.retention_days, 30);
        assert_eq!(cfg.top_agents_limit, 10);
        assert_eq!(cfg.reports.base_url, None);

        let rewritten = fs::read_to_string(paths.config_file()).expect("read back");
        assert!(rewritten.contains("retention_days = 30"));
    }

    #[test]
    fn invalid_url_is_a_config_error() {
        let mut cfg = LedgerConfig::default();
        cfg.pricing.url = Some("not a url".into());
        let err = normalize_config(&mut cfg).expect_err("expected validation error");
        assert!(err.to_string().contains("invalid pricing.url"));
    }

    #[test]
    fn ensure_initialized_is_idempotent() {
        let tmp = TempDir::new().expect("tempdir");
        let paths = LedgerPaths::under(tmp.path());
        ensure_initialized(&paths).expect("first init");
        let first = fs::read_to_string(paths.config_file()).expect("read");
        ensure_initialized(&paths).expect("second init");
        let second = fs::read_to_string(paths.config_file()).expect("read");
        assert_eq!(first, second);
        assert!(paths.state_dir.exists());
    }

    #[test]
    fn admin_key_falls_back_to_env() {
        temp_env::with_var("TESTPROVIDER_ADMIN_KEY", Some("sk-admin"), || {
            assert_eq!(get_api_key("testprovider").as_deref(), Some("sk-admin"));
        });
        temp_env::with_var_unset("TESTPROVIDER_ADMIN_KEY", || {
            assert_eq!(get_api_key("testprovider"), None);
        });
    }
}
