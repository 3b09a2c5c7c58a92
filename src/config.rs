use crate::services::{
    archive_service::ServiceSettings, expiry_reclaimer::ReclaimerConfig,
    lifecycle_engine::LifecyclePolicy, validation::UploadPolicy,
};
use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

const ENV_PREFIX: &str = "ARCHIVE_STORE_";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub temp_delete_ttl_hours: i64,
    pub staging_ttl_hours: i64,
    pub reclaim_interval_secs: u64,
    pub reclaim_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub max_tags: usize,
    pub max_upload_bytes: usize,
    pub allowed_content_types: Vec<String>,
    pub upload_retry_attempts: usize,
    pub allow_restore_from_temp: bool,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Versioned archive store with soft, temporary and hard deletes")]
pub struct Args {
    /// Host to bind to (overrides ARCHIVE_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides ARCHIVE_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where archive blobs are stored (overrides ARCHIVE_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides ARCHIVE_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Hours a temp-deleted archive is kept (overrides ARCHIVE_STORE_TEMP_DELETE_TTL_HOURS)
    #[arg(long)]
    pub temp_delete_ttl_hours: Option<i64>,

    /// Seconds between reclaim passes (overrides ARCHIVE_STORE_RECLAIM_INTERVAL_SECS)
    #[arg(long)]
    pub reclaim_interval_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Read `ARCHIVE_STORE_<name>` through `lookup`, falling back to `default`.
fn setting<T>(lookup: &dyn Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let key = format!("{}{}", ENV_PREFIX, name);
    match lookup(&key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        None => Ok(default),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::from_sources(args, &|key| env::var(key).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge `args` over values from `lookup`; CLI flags win.
    pub fn from_sources(args: Args, lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let allowed_content_types = lookup(&format!("{}ALLOWED_CONTENT_TYPES", ENV_PREFIX))
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_else(|| vec!["application/pdf".to_string()]);

        let cfg = Self {
            host: match args.host {
                Some(host) => host,
                None => setting(lookup, "HOST", "0.0.0.0".to_string())?,
            },
            port: match args.port {
                Some(port) => port,
                None => setting(lookup, "PORT", 3000)?,
            },
            storage_dir: match args.storage_dir {
                Some(dir) => dir,
                None => setting(lookup, "STORAGE_DIR", "./data/archives".to_string())?,
            },
            database_url: match args.database_url {
                Some(url) => url,
                None => setting(
                    lookup,
                    "DATABASE_URL",
                    "sqlite://./data/meta/archive_store.db".to_string(),
                )?,
            },
            temp_delete_ttl_hours: match args.temp_delete_ttl_hours {
                Some(hours) => hours,
                None => setting(lookup, "TEMP_DELETE_TTL_HOURS", 24)?,
            },
            staging_ttl_hours: setting(lookup, "STAGING_TTL_HOURS", 24)?,
            reclaim_interval_secs: match args.reclaim_interval_secs {
                Some(secs) => secs,
                None => setting(lookup, "RECLAIM_INTERVAL_SECS", 3600)?,
            },
            reclaim_timeout_secs: setting(lookup, "RECLAIM_TIMEOUT_SECS", 300)?,
            request_timeout_secs: setting(lookup, "REQUEST_TIMEOUT_SECS", 10)?,
            max_tags: setting(lookup, "MAX_TAGS", 5)?,
            max_upload_bytes: setting(lookup, "MAX_UPLOAD_BYTES", 3 * 1024 * 1024)?,
            allowed_content_types,
            upload_retry_attempts: setting(lookup, "UPLOAD_RETRY_ATTEMPTS", 3)?,
            allow_restore_from_temp: setting(lookup, "ALLOW_RESTORE_FROM_TEMP", true)?,
        };

        if cfg.temp_delete_ttl_hours <= 0 {
            anyhow::bail!("temp delete TTL must be positive, got {}", cfg.temp_delete_ttl_hours);
        }
        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            upload: UploadPolicy {
                max_tags: self.max_tags,
                max_upload_bytes: self.max_upload_bytes,
                allowed_content_types: self.allowed_content_types.clone(),
            },
            lifecycle: LifecyclePolicy {
                temp_delete_ttl: chrono::Duration::hours(self.temp_delete_ttl_hours),
                allow_restore_from_temp: self.allow_restore_from_temp,
            },
            reclaimer: ReclaimerConfig {
                interval: Duration::from_secs(self.reclaim_interval_secs),
                staging_ttl: chrono::Duration::hours(self.staging_ttl_hours),
                pass_timeout: Duration::from_secs(self.reclaim_timeout_secs),
                ..ReclaimerConfig::default()
            },
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            upload_retry_attempts: self.upload_retry_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_environment() {
        let cfg = AppConfig::from_sources(Args::default(), &|_| None).unwrap();
        assert_eq!(cfg.addr(), "0.0.0.0:3000");
        assert_eq!(cfg.temp_delete_ttl_hours, 24);
        assert_eq!(cfg.max_tags, 5);
        assert_eq!(cfg.allowed_content_types, vec!["application/pdf"]);
        assert!(cfg.allow_restore_from_temp);

        let settings = cfg.service_settings();
        assert_eq!(settings.request_timeout, Duration::from_secs(10));
        assert_eq!(settings.lifecycle.temp_delete_ttl, chrono::Duration::hours(24));
    }

    #[test]
    fn cli_flags_override_environment() {
        let lookup = lookup_from(&[
            ("ARCHIVE_STORE_PORT", "8080"),
            ("ARCHIVE_STORE_TEMP_DELETE_TTL_HOURS", "48"),
            ("ARCHIVE_STORE_ALLOWED_CONTENT_TYPES", "application/pdf, image/png"),
            ("ARCHIVE_STORE_ALLOW_RESTORE_FROM_TEMP", "false"),
        ]);
        let args = Args {
            port: Some(9000),
            ..Args::default()
        };
        let cfg = AppConfig::from_sources(args, &lookup).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.temp_delete_ttl_hours, 48);
        assert_eq!(cfg.allowed_content_types, vec!["application/pdf", "image/png"]);
        assert!(!cfg.allow_restore_from_temp);
    }

    #[test]
    fn malformed_values_are_reported_with_the_variable_name() {
        let lookup = lookup_from(&[("ARCHIVE_STORE_MAX_TAGS", "many")]);
        let err = AppConfig::from_sources(Args::default(), &lookup).unwrap_err();
        assert!(format!("{:#}", err).contains("ARCHIVE_STORE_MAX_TAGS"));

        let lookup = lookup_from(&[("ARCHIVE_STORE_TEMP_DELETE_TTL_HOURS", "0")]);
        assert!(AppConfig::from_sources(Args::default(), &lookup).is_err());
    }
}
