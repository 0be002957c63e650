use clap::Parser;
use lib_relay::{FeedConfig, LifecycleConfig, PeerConfig, ReconnectPolicy, DEFAULT_FEED_URL};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_CONFIG_FILE: &str = "server_relay.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Price feed WebSocket relay", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "LISTEN_PORT", help = "Port to listen on for subscriber connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "RELAY_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "UPSTREAM_URL", help = "Upstream price feed WebSocket URL.")]
    pub upstream_url: Option<String>,

    #[clap(long, env = "CORS_ALLOWED", value_delimiter = ',', help = "Comma separated list of allowed CORS origins.")]
    pub cors_allowed: Option<Vec<String>>,

    #[clap(long = "release", env = "VERSION", help = "Release number reported at startup.")]
    pub release: Option<u64>,

    #[clap(long, env = "RECONNECT_BASE_DELAY_MS", help = "Base delay in milliseconds for upstream reconnect attempts.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[clap(long, env = "RECONNECT_MAX_DELAY_MS", help = "Maximum delay in milliseconds for upstream reconnect attempts.")]
    pub reconnect_max_delay_ms: Option<u64>,

    #[clap(long, env = "PING_PERIOD_SECONDS", help = "Seconds between heartbeat requests on every connection.")]
    pub ping_period_seconds: Option<u64>,

    #[clap(long, env = "WRITE_WAIT_SECONDS", help = "Deadline in seconds for a single frame write.")]
    pub write_wait_seconds: Option<u64>,

    #[clap(long, env = "REFRESH_INTERVAL_SECONDS", help = "Seconds between unconditional liveness frames to the upstream.")]
    pub refresh_interval_seconds: Option<u64>,

    #[clap(long, env = "GRACEFUL_TIMEOUT_SECONDS", help = "Seconds each module gets to stop on shutdown.")]
    pub graceful_timeout_seconds: Option<u64>,

    #[clap(long, env = "MAX_MESSAGE_SIZE", help = "Largest inbound WebSocket message in bytes.")]
    pub max_message_size: Option<usize>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            upstream_url: other.upstream_url.or(self.upstream_url),
            cors_allowed: other.cors_allowed.or(self.cors_allowed),
            release: other.release.or(self.release),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            ping_period_seconds: other.ping_period_seconds.or(self.ping_period_seconds),
            write_wait_seconds: other.write_wait_seconds.or(self.write_wait_seconds),
            refresh_interval_seconds: other.refresh_interval_seconds.or(self.refresh_interval_seconds),
            graceful_timeout_seconds: other.graceful_timeout_seconds.or(self.graceful_timeout_seconds),
            max_message_size: other.max_message_size.or(self.max_message_size),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(9000),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            upstream_url: Some(DEFAULT_FEED_URL.to_string()),
            cors_allowed: Some(Vec::new()),
            release: Some(0),
            reconnect_base_delay_ms: Some(1000),
            reconnect_max_delay_ms: Some(60000),
            ping_period_seconds: Some(5 * 60),
            write_wait_seconds: Some(5),
            refresh_interval_seconds: Some(10 * 60),
            graceful_timeout_seconds: Some(15),
            max_message_size: Some(1024 * 100),
            ..Default::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Fully resolved and validated settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub log_dir: PathBuf,
    pub log_level: log::LevelFilter,
    pub upstream_url: String,
    pub cors_allowed: Vec<String>,
    pub release: u64,
    pub peer: PeerConfig,
    pub feed: FeedConfig,
    pub reconnect: ReconnectPolicy,
    pub lifecycle: LifecycleConfig,
}

pub fn load_config() -> Result<Settings, ConfigError> {
    // Environment variables are folded in by clap.
    resolve(Config::parse())
}

/// Layers defaults, the config file and CLI/env values, then validates.
pub fn resolve(cli: Config) -> Result<Settings, ConfigError> {
    let mut current_config = Config::defaults();

    match &cli.config_path {
        Some(path) => {
            current_config = current_config.merge(read_config_file(path)?);
        }
        None => {
            let path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if path.exists() {
                current_config = current_config.merge(read_config_file(&path)?);
            } else {
                log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
            }
        }
    }

    validate(current_config.merge(cli))
}

fn read_config_file(path: &Path) -> Result<Config, ConfigError> {
    let config_str = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str::<Config>(&config_str).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn validate(config: Config) -> Result<Settings, ConfigError> {
    let port = config.port.unwrap_or(9000);
    if port == 0 {
        return Err(invalid("port", "must be between 1 and 65535"));
    }

    let upstream_url = config.upstream_url.unwrap_or_else(|| DEFAULT_FEED_URL.to_string());
    if !(upstream_url.starts_with("ws://") || upstream_url.starts_with("wss://")) {
        return Err(invalid("upstream_url", format!("{} is not a ws:// or wss:// URL", upstream_url)));
    }

    let level_name = config.log_level.unwrap_or_else(|| "info".to_string());
    let log_level = match level_name.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        other => return Err(invalid("log_level", format!("unknown level {}", other))),
    };

    let base = config.reconnect_base_delay_ms.unwrap_or(1000);
    let max = config.reconnect_max_delay_ms.unwrap_or(60000);
    if base == 0 || base > max {
        return Err(invalid(
            "reconnect delays",
            format!("base {}ms must be non-zero and not above max {}ms", base, max),
        ));
    }

    let seconds = |field: &'static str, value: Option<u64>, default: u64| {
        match value.unwrap_or(default) {
            0 => Err(invalid(field, "must be at least one second")),
            secs => Ok(Duration::from_secs(secs)),
        }
    };
    let ping_period = seconds("ping_period_seconds", config.ping_period_seconds, 5 * 60)?;
    let write_wait = seconds("write_wait_seconds", config.write_wait_seconds, 5)?;
    let refresh_interval = seconds("refresh_interval_seconds", config.refresh_interval_seconds, 10 * 60)?;
    let graceful_timeout = seconds("graceful_timeout_seconds", config.graceful_timeout_seconds, 15)?;

    let max_message_size = config.max_message_size.unwrap_or(1024 * 100);
    if max_message_size < 1024 {
        return Err(invalid("max_message_size", "must be at least 1024 bytes"));
    }

    let cors_allowed = config
        .cors_allowed
        .unwrap_or_default()
        .into_iter()
        .map(|origin| origin.trim().to_string())
        .filter(|origin| !origin.is_empty())
        .collect();

    Ok(Settings {
        port,
        log_dir: config.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
        log_level,
        upstream_url,
        cors_allowed,
        release: config.release.unwrap_or(0),
        peer: PeerConfig::default()
            .write_wait(write_wait)
            .ping_period(ping_period)
            .max_message_size(max_message_size),
        feed: FeedConfig::default().refresh_interval(refresh_interval),
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_millis(base),
            max_delay: Duration::from_millis(max),
        },
        lifecycle: LifecycleConfig {
            graceful_timeout,
            ..LifecycleConfig::default()
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn cli(args: &[&str]) -> Config {
        let mut argv = vec!["server_relay"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults_are_valid() {
        let settings = validate(Config::defaults()).unwrap();
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.upstream_url, DEFAULT_FEED_URL);
        assert_eq!(settings.peer.write_wait, Duration::from_secs(5));
        assert_eq!(settings.peer.ping_period, Duration::from_secs(300));
        assert_eq!(settings.feed.refresh_interval, Duration::from_secs(600));
        assert_eq!(settings.lifecycle.graceful_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_file_is_overridden_by_cli() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"port": 7000, "logLevel": "debug", "corsAllowed": ["https://a.example"]}}"#).unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let settings = resolve(cli(&["--config-path", &path, "--port", "7100"])).unwrap();

        assert_eq!(settings.port, 7100);
        assert_eq!(settings.log_level, log::LevelFilter::Debug);
        assert_eq!(settings.cors_allowed, vec!["https://a.example".to_string()]);
    }

    #[test]
    fn test_cors_list_is_split_on_commas() {
        let settings = validate(Config::defaults().merge(cli(&[
            "--cors-allowed",
            "https://a.example, https://b.example",
        ])))
        .unwrap();
        assert_eq!(settings.cors_allowed, vec!["https://a.example", "https://b.example"]);
    }

    #[test]
    fn test_malformed_file_is_fatal() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let err = resolve(cli(&["--config-path", &path])).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_missing_explicit_file_is_fatal() {
        let err = resolve(cli(&["--config-path", "/definitely/not/here.conf"])).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let bad_url = Config {
            upstream_url: Some("http://example.com".to_string()),
            ..Config::defaults()
        };
        assert!(matches!(validate(bad_url), Err(ConfigError::Invalid { field: "upstream_url", .. })));

        let bad_level = Config {
            log_level: Some("loud".to_string()),
            ..Config::defaults()
        };
        assert!(matches!(validate(bad_level), Err(ConfigError::Invalid { field: "log_level", .. })));

        let bad_delays = Config {
            reconnect_base_delay_ms: Some(5000),
            reconnect_max_delay_ms: Some(1000),
            ..Config::defaults()
        };
        assert!(validate(bad_delays).is_err());

        let zero_wait = Config {
            write_wait_seconds: Some(0),
            ..Config::defaults()
        };
        assert!(matches!(validate(zero_wait), Err(ConfigError::Invalid { field: "write_wait_seconds", .. })));
    }
}
