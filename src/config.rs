// ABOUTME: Runtime settings from command line, environment and an optional TOML file
// ABOUTME: Command-line and environment values win over the file, the file over defaults

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;
use serde::Deserialize;

use crate::events::{DEFAULT_CHANNEL, DEFAULT_MAILBOX};
use crate::postgres::TlsPolicy;
use crate::sync::{RetryPolicy, DEFAULT_CHUNK_SIZE, DEFAULT_LEASE_TTL, DEFAULT_WATERMARK_COLUMN};
use crate::utils::{mask_password, validate_connection_string, validate_source_target_different};

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_EVENTS_ADDR: &str = "127.0.0.1:7878";
pub const DEFAULT_SUBMIT_ADDR: &str = "127.0.0.1:7879";

/// Keys accepted in `replicator.toml`. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub source_url: Option<String>,
    pub target_url: Option<String>,
    pub chunk_size: Option<usize>,
    pub watermark_column: Option<String>,
    pub retry_delay_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub workers: Option<usize>,
    pub mailbox: Option<usize>,
    pub redis_url: Option<String>,
    pub redis_channel: Option<String>,
    pub events_addr: Option<SocketAddr>,
    pub submit_addr: Option<SocketAddr>,
    pub table_leases: Option<bool>,
    pub lease_ttl_secs: Option<u64>,
    pub allow_self_signed_certs: Option<bool>,
}

impl FileConfig {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

/// Settings shared by every subcommand.
#[derive(Debug, Clone, Default, Args)]
pub struct SettingsArgs {
    /// Path to a TOML config file
    #[arg(long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Source database URL
    #[arg(long = "source", env = "SOURCE_DB_URI", global = true)]
    pub source_url: Option<String>,
    /// Target database URL
    #[arg(long = "target", env = "TARGET_DB_URI", global = true)]
    pub target_url: Option<String>,
    /// Rows per chunk for keyed tables (default 10000)
    #[arg(long, env = "CHUNK_SIZE", global = true)]
    pub chunk_size: Option<usize>,
    /// Column guarding updates against older rows (default server_modified_date)
    #[arg(long, env = "WATERMARK_COLUMN", global = true)]
    pub watermark_column: Option<String>,
    /// Seconds to wait before re-running a transiently failed job (default 30)
    #[arg(long, env = "RETRY_DELAY_SECS", global = true)]
    pub retry_delay_secs: Option<u64>,
    /// Retries before a job fails for good (default 5)
    #[arg(long, env = "MAX_RETRIES", global = true)]
    pub max_retries: Option<u32>,
    /// Worker tasks running jobs concurrently (default 4)
    #[arg(long, env = "SYNC_WORKERS", global = true)]
    pub workers: Option<usize>,
    /// Events buffered per observer before it is dropped (default 1024)
    #[arg(long, env = "EVENT_MAILBOX", global = true)]
    pub mailbox: Option<usize>,
    /// Redis URL for cross-process event fan-out
    #[arg(long, env = "REDIS_URL", global = true)]
    pub redis_url: Option<String>,
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(long = "allow-self-signed-certs", global = true, default_value_t = false)]
    pub allow_self_signed_certs: bool,
}

/// Fully resolved and validated settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub source_url: String,
    pub target_url: String,
    pub chunk_size: usize,
    pub watermark_column: String,
    pub retry: RetryPolicy,
    pub workers: usize,
    pub mailbox: usize,
    pub redis_url: Option<String>,
    pub redis_channel: String,
    pub events_addr: SocketAddr,
    pub submit_addr: SocketAddr,
    pub table_leases: bool,
    pub lease_ttl: Duration,
    pub tls: TlsPolicy,
}

fn default_addr(addr: &str) -> Result<SocketAddr> {
    addr.parse()
        .with_context(|| format!("Invalid default address {}", addr))
}

impl SettingsArgs {
    /// Merge these values over the config file (if any) and defaults.
    pub fn resolve(&self) -> Result<Settings> {
        let file = match &self.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        self.resolve_with(file)
    }

    pub fn resolve_with(&self, file: FileConfig) -> Result<Settings> {
        let source_url = self
            .source_url
            .clone()
            .or(file.source_url)
            .context("Source database URL not provided. Use --source or SOURCE_DB_URI.")?;
        let target_url = self
            .target_url
            .clone()
            .or(file.target_url)
            .context("Target database URL not provided. Use --target or TARGET_DB_URI.")?;

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy::new(
            self.retry_delay_secs
                .or(file.retry_delay_secs)
                .map(Duration::from_secs)
                .unwrap_or(defaults.delay),
            self.max_retries
                .or(file.max_retries)
                .unwrap_or(defaults.max_retries),
        );

        let settings = Settings {
            source_url,
            target_url,
            chunk_size: self
                .chunk_size
                .or(file.chunk_size)
                .unwrap_or(DEFAULT_CHUNK_SIZE),
            watermark_column: self
                .watermark_column
                .clone()
                .or(file.watermark_column)
                .unwrap_or_else(|| DEFAULT_WATERMARK_COLUMN.to_string()),
            retry,
            workers: self.workers.or(file.workers).unwrap_or(DEFAULT_WORKERS),
            mailbox: self.mailbox.or(file.mailbox).unwrap_or(DEFAULT_MAILBOX),
            redis_url: self.redis_url.clone().or(file.redis_url),
            redis_channel: file
                .redis_channel
                .unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
            events_addr: match file.events_addr {
                Some(addr) => addr,
                None => default_addr(DEFAULT_EVENTS_ADDR)?,
            },
            submit_addr: match file.submit_addr {
                Some(addr) => addr,
                None => default_addr(DEFAULT_SUBMIT_ADDR)?,
            },
            table_leases: file.table_leases.unwrap_or(true),
            lease_ttl: file
                .lease_ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_LEASE_TTL),
            tls: TlsPolicy {
                allow_self_signed: self.allow_self_signed_certs
                    || file.allow_self_signed_certs.unwrap_or(false),
            },
        };
        settings.validate()?;
        Ok(settings)
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        validate_connection_string(&self.source_url).context("Invalid source URL")?;
        validate_connection_string(&self.target_url).context("Invalid target URL")?;
        validate_source_target_different(&self.source_url, &self.target_url)?;

        if self.chunk_size == 0 {
            bail!("chunk_size must be greater than 0");
        }
        if self.workers == 0 {
            bail!("workers must be greater than 0");
        }
        if self.mailbox == 0 {
            bail!("mailbox must be greater than 0");
        }
        if self.watermark_column.trim().is_empty() {
            bail!("watermark_column cannot be empty");
        }
        Ok(())
    }

    /// One-line summary safe to log.
    pub fn describe(&self) -> String {
        format!(
            "source={} target={} chunk_size={} watermark={} retry={:?}x{} workers={}",
            mask_password(&self.source_url),
            mask_password(&self.target_url),
            self.chunk_size,
            self.watermark_column,
            self.retry.delay,
            self.retry.max_retries,
            self.workers
        )
    }
}
