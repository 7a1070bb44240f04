use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone)]
pub(crate) struct AppConfig {
    pub(crate) bind: SocketAddr,
    pub(crate) grpc_bind: SocketAddr,
    pub(crate) hmac_key: Option<String>,
    pub(crate) crypto_private_key_path: Option<PathBuf>,
    pub(crate) trusted_subnet: Option<ipnet::IpNet>,
    pub(crate) store_interval: Duration,
    pub(crate) file_storage_path: Option<PathBuf>,
    pub(crate) restore: bool,
    pub(crate) database_dsn: Option<String>,
    pub(crate) request_timeout_ms: u64,
    pub(crate) max_body_bytes: usize,
    pub(crate) max_concurrency: usize,
}

/// Shape of the optional `config/CONFIG` JSON file (spec.md §6's `config`
/// option). Every field is optional: the file only overrides values the
/// defaults would otherwise supply, and is itself overridden by any
/// matching environment variable — `env > file > default`.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    address: Option<String>,
    grpc_address: Option<String>,
    key: Option<String>,
    crypto_key: Option<String>,
    trusted_subnet: Option<String>,
    store_interval: Option<u64>,
    file_storage_path: Option<String>,
    restore: Option<bool>,
    database_dsn: Option<String>,
}

impl FileConfig {
    fn load() -> Result<Self> {
        let Some(path) = parse_optional_string("CONFIG") else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file at '{path}'"))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file at '{path}' as JSON"))
    }
}

impl AppConfig {
    pub(crate) fn from_env() -> Result<Self> {
        let file = FileConfig::load()?;

        let bind = parse_socket_addr("ADDRESS", file.address.as_deref(), "127.0.0.1:8080")?;
        let grpc_bind = parse_socket_addr(
            "GRPC_ADDRESS",
            file.grpc_address.as_deref(),
            "127.0.0.1:8081",
        )?;
        let hmac_key = parse_optional_string("KEY").or(file.key);
        let crypto_private_key_path =
            parse_optional_path_layered("CRYPTO_KEY", file.crypto_key)?;
        let trusted_subnet = parse_optional_subnet_layered("TRUSTED_SUBNET", file.trusted_subnet)?;
        let store_interval = Duration::from_secs(parse_u64(
            "STORE_INTERVAL",
            file.store_interval,
            300,
        )?);
        let file_storage_path =
            parse_optional_path_layered("FILE_STORAGE_PATH", file.file_storage_path)?;
        let restore = parse_bool("RESTORE", file.restore, true)?;
        let database_dsn = parse_optional_string("DATABASE_DSN").or(file.database_dsn);
        let request_timeout_ms = parse_u64("REQUEST_TIMEOUT_MS", None, 2000)?;
        let max_body_bytes = parse_usize("MAX_BODY_BYTES", 1_048_576)?;
        let max_concurrency = parse_usize("MAX_CONCURRENCY", 256)?;

        if max_body_bytes == 0 {
            anyhow::bail!("MAX_BODY_BYTES must be > 0");
        }
        if max_concurrency == 0 {
            anyhow::bail!("MAX_CONCURRENCY must be > 0");
        }

        Ok(Self {
            bind,
            grpc_bind,
            hmac_key,
            crypto_private_key_path,
            trusted_subnet,
            store_interval,
            file_storage_path,
            restore,
            database_dsn,
            request_timeout_ms,
            max_body_bytes,
            max_concurrency,
        })
    }
}

fn parse_socket_addr(key: &str, from_file: Option<&str>, default: &str) -> Result<SocketAddr> {
    let raw = env::var(key)
        .ok()
        .or_else(|| from_file.map(str::to_string))
        .unwrap_or_else(|| default.to_string());
    raw.parse()
        .with_context(|| format!("{key} must be a valid socket address, got '{raw}'"))
}

fn parse_usize(key: &str, default: usize) -> Result<usize> {
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    raw.parse()
        .with_context(|| format!("{key} must be a positive integer, got '{raw}'"))
}

fn parse_u64(key: &str, from_file: Option<u64>, default: u64) -> Result<u64> {
    let raw = match env::var(key) {
        Ok(raw) => raw,
        Err(_) => match from_file {
            Some(value) => return Ok(value),
            None => default.to_string(),
        },
    };
    raw.parse()
        .with_context(|| format!("{key} must be a positive integer, got '{raw}'"))
}

fn parse_bool(key: &str, from_file: Option<bool>, default: bool) -> Result<bool> {
    let raw = match env::var(key) {
        Ok(raw) => raw,
        Err(_) => match from_file {
            Some(value) => return Ok(value),
            None => (if default { "true" } else { "false" }).to_string(),
        },
    };

    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("{key} must be a boolean, got '{raw}'"),
    }
}

fn parse_optional_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}

fn parse_optional_path_layered(key: &str, from_file: Option<String>) -> Result<Option<PathBuf>> {
    match env::var(key) {
        Ok(raw) if !raw.is_empty() => Ok(Some(PathBuf::from(raw))),
        _ => Ok(from_file.filter(|value| !value.is_empty()).map(PathBuf::from)),
    }
}

fn parse_subnet(key: &str, raw: &str) -> Result<ipnet::IpNet> {
    if raw.contains('/') {
        raw.parse()
            .with_context(|| format!("{key} must be a valid CIDR, got '{raw}'"))
    } else {
        let addr: IpAddr = raw
            .parse()
            .with_context(|| format!("{key} must be a valid IP or CIDR, got '{raw}'"))?;
        ipnet::IpNet::new(addr, if addr.is_ipv4() { 32 } else { 128 })
            .with_context(|| format!("{key} must be a valid IP or CIDR, got '{raw}'"))
    }
}

fn parse_optional_subnet_layered(
    key: &str,
    from_file: Option<String>,
) -> Result<Option<ipnet::IpNet>> {
    match env::var(key) {
        Ok(raw) if !raw.is_empty() => Ok(Some(parse_subnet(key, &raw)?)),
        _ => match from_file.filter(|value| !value.is_empty()) {
            Some(raw) => Ok(Some(parse_subnet(key, &raw)?)),
            None => Ok(None),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    const CONFIG_KEYS: &[&str] = &[
        "ADDRESS",
        "GRPC_ADDRESS",
        "KEY",
        "CRYPTO_KEY",
        "TRUSTED_SUBNET",
        "STORE_INTERVAL",
        "FILE_STORAGE_PATH",
        "RESTORE",
        "DATABASE_DSN",
        "REQUEST_TIMEOUT_MS",
        "MAX_BODY_BYTES",
        "MAX_CONCURRENCY",
        "CONFIG",
    ];

    fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn capture(keys: &[&str]) -> Self {
            let saved = keys
                .iter()
                .map(|key| ((*key).to_string(), env::var(key).ok()))
                .collect();
            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in &self.saved {
                if let Some(value) = value {
                    env::set_var(key, value);
                } else {
                    env::remove_var(key);
                }
            }
        }
    }

    fn with_env<R>(pairs: &[(&str, &str)], f: impl FnOnce() -> R) -> R {
        let _lock = env_lock().lock().expect("env test mutex must be lockable");
        let _guard = EnvGuard::capture(CONFIG_KEYS);

        for key in CONFIG_KEYS {
            env::remove_var(key);
        }
        for (key, value) in pairs {
            env::set_var(key, value);
        }

        f()
    }

    #[test]
    fn from_env_uses_expected_defaults() {
        let config = with_env(&[], || AppConfig::from_env().expect("default config must parse"));
        assert_eq!(config.bind, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(config.store_interval, Duration::from_secs(300));
        assert!(config.restore);
        assert!(config.hmac_key.is_none());
        assert!(config.database_dsn.is_none());
        assert!(config.trusted_subnet.is_none());
    }

    #[test]
    fn from_env_applies_overrides() {
        let config = with_env(
            &[
                ("ADDRESS", "0.0.0.0:9090"),
                ("KEY", "secret"),
                ("STORE_INTERVAL", "0"),
                ("FILE_STORAGE_PATH", "/tmp/metrics.bin"),
                ("RESTORE", "false"),
                ("TRUSTED_SUBNET", "10.0.0.0/24"),
            ],
            || AppConfig::from_env().expect("override config must parse"),
        );
        assert_eq!(config.bind, "0.0.0.0:9090".parse::<SocketAddr>().unwrap());
        assert_eq!(config.hmac_key.as_deref(), Some("secret"));
        assert_eq!(config.store_interval, Duration::ZERO);
        assert_eq!(config.file_storage_path, Some(PathBuf::from("/tmp/metrics.bin")));
        assert!(!config.restore);
        assert_eq!(config.trusted_subnet.unwrap().to_string(), "10.0.0.0/24");
    }

    #[test]
    fn from_env_rejects_invalid_bool() {
        let error = with_env(&[("RESTORE", "not-a-bool")], || {
            AppConfig::from_env().expect_err("invalid bool must fail")
        });
        assert!(error.to_string().contains("RESTORE must be a boolean"));
    }

    #[test]
    fn from_env_rejects_zero_max_body_bytes() {
        let error = with_env(&[("MAX_BODY_BYTES", "0")], || {
            AppConfig::from_env().expect_err("zero body limit must fail")
        });
        assert!(error.to_string().contains("MAX_BODY_BYTES must be > 0"));
    }

    #[test]
    fn from_env_falls_back_to_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"address":"0.0.0.0:7070","restore":false,"store_interval":60}"#,
        )
        .unwrap();

        let config = with_env(&[("CONFIG", path.to_str().unwrap())], || {
            AppConfig::from_env().expect("config file must parse")
        });
        assert_eq!(config.bind, "0.0.0.0:7070".parse::<SocketAddr>().unwrap());
        assert!(!config.restore);
        assert_eq!(config.store_interval, Duration::from_secs(60));
    }

    #[test]
    fn env_var_overrides_config_file_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"address":"0.0.0.0:7070"}"#).unwrap();

        let config = with_env(
            &[
                ("CONFIG", path.to_str().unwrap()),
                ("ADDRESS", "0.0.0.0:9999"),
            ],
            || AppConfig::from_env().expect("config must parse"),
        );
        assert_eq!(config.bind, "0.0.0.0:9999".parse::<SocketAddr>().unwrap());
    }
}
