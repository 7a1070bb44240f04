use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

/// Raw CLI/env arguments, deliberately left `Option`-typed with no
/// `default_value` so [`AgentConfig::load`] can tell "unset" apart from "set
/// to the default" when layering in the `--config` file — clap's `env`
/// attribute already gives environment variables precedence over the flag
/// itself, so whatever survives here is `env > flag`, ready to be layered
/// over `file > default`.
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "metrics-agent", version, about = "Metrics collection agent")]
struct Args {
    #[arg(long, env = "ADDRESS")]
    address: Option<String>,

    #[arg(long, env = "REPORT_INTERVAL")]
    report_interval: Option<u64>,

    #[arg(long, env = "POLL_INTERVAL")]
    poll_interval: Option<u64>,

    #[arg(long, env = "KEY")]
    key: Option<String>,

    #[arg(long, env = "RATE_LIMIT")]
    rate_limit: Option<usize>,

    #[arg(long, env = "CRYPTO_KEY")]
    crypto_key: Option<PathBuf>,

    #[arg(long, env = "TRUSTED_SUBNET")]
    trusted_subnet: Option<String>,

    #[arg(long, env = "CONFIG")]
    config: Option<PathBuf>,
}

/// Shape of the optional `--config`/`CONFIG` JSON file, mirroring
/// `metrics-server`'s `FileConfig` — every field optional, only filling in
/// whatever the CLI/env layer left unset.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    address: Option<String>,
    report_interval: Option<u64>,
    poll_interval: Option<u64>,
    key: Option<String>,
    rate_limit: Option<usize>,
    crypto_key: Option<PathBuf>,
    trusted_subnet: Option<String>,
}

impl FileConfig {
    fn load(path: &Option<PathBuf>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at '{}'", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file at '{}' as JSON", path.display()))
    }
}

/// Resolved agent configuration: `env > flag > file > default`, exactly
/// spec.md §6's precedence rule.
#[derive(Debug, Clone)]
pub(crate) struct AgentConfig {
    pub(crate) address: String,
    pub(crate) report_interval_secs: u64,
    pub(crate) poll_interval_secs: u64,
    pub(crate) hmac_key: Option<String>,
    pub(crate) rate_limit: usize,
    pub(crate) crypto_public_key_path: Option<PathBuf>,
    pub(crate) trusted_subnet_source_ip: Option<String>,
}

impl AgentConfig {
    pub(crate) fn load() -> Result<Self> {
        let args = Args::parse();
        let file = FileConfig::load(&args.config)?;
        Self::merge(args, file)
    }

    fn merge(args: Args, file: FileConfig) -> Result<Self> {
        let config = AgentConfig {
            address: args.address.or(file.address).unwrap_or_else(|| "127.0.0.1:8080".to_string()),
            report_interval_secs: args.report_interval.or(file.report_interval).unwrap_or(10),
            poll_interval_secs: args.poll_interval.or(file.poll_interval).unwrap_or(2),
            hmac_key: args.key.or(file.key),
            rate_limit: args.rate_limit.or(file.rate_limit).unwrap_or(0),
            crypto_public_key_path: args.crypto_key.or(file.crypto_key),
            trusted_subnet_source_ip: args.trusted_subnet.or(file.trusted_subnet),
        };

        if config.report_interval_secs == 0 {
            anyhow::bail!("REPORT_INTERVAL must be > 0");
        }
        if config.poll_interval_secs == 0 {
            anyhow::bail!("POLL_INTERVAL must be > 0");
        }
        Ok(config)
    }

    pub(crate) fn server_url(&self) -> Result<String> {
        let address = &self.address;
        if address.starts_with("http://") || address.starts_with("https://") {
            Ok(address.clone())
        } else {
            Ok(format!("http://{address}"))
        }
        .context("failed to build server url")
    }

    pub(crate) fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_falls_back_through_file_to_defaults() {
        let args = Args::default();
        let file = FileConfig {
            address: Some("0.0.0.0:7070".to_string()),
            rate_limit: Some(4),
            ..Default::default()
        };
        let config = AgentConfig::merge(args, file).unwrap();
        assert_eq!(config.address, "0.0.0.0:7070");
        assert_eq!(config.rate_limit, 4);
        assert_eq!(config.poll_interval_secs, 2);
    }

    #[test]
    fn merge_prefers_cli_env_layer_over_file() {
        let args = Args {
            address: Some("127.0.0.1:9999".to_string()),
            ..Default::default()
        };
        let file = FileConfig {
            address: Some("0.0.0.0:7070".to_string()),
            ..Default::default()
        };
        let config = AgentConfig::merge(args, file).unwrap();
        assert_eq!(config.address, "127.0.0.1:9999");
    }

    #[test]
    fn merge_rejects_zero_report_interval() {
        let args = Args {
            report_interval: Some(0),
            ..Default::default()
        };
        let error = AgentConfig::merge(args, FileConfig::default()).unwrap_err();
        assert!(error.to_string().contains("REPORT_INTERVAL"));
    }
}
