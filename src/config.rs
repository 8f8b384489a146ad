//! Service configuration.
//!
//! Settings are layered, later sources overriding earlier ones:
//! 1. Defaults embedded in the binary (`config/default.toml`)
//! 2. A user-specified configuration file (`--config`)
//! 3. Environment variables prefixed with `FABSTREAM__`, using `__` between
//!    section and key (`FABSTREAM__STORE__BUCKET=telemetry`)
//! 4. Command-line arguments, which also read the environment names used by
//!    existing deployments (`KAFKA_BOOTSTRAP_SERVERS`, `INFLUX_URL`, ...)

use chrono_tz::Tz;
use clap::Parser;
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Command-line arguments.
#[derive(Parser, Debug, Default)]
#[command(author, version, about)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Server host address
    #[arg(long, env = "FABSTREAM_HOST")]
    pub host: Option<String>,

    /// Server port
    #[arg(long, env = "FABSTREAM_PORT")]
    pub port: Option<u16>,

    /// Message bus backend ("kafka" or "memory")
    #[arg(long)]
    pub bus_backend: Option<String>,

    /// Kafka bootstrap servers
    #[arg(long, env = "KAFKA_BOOTSTRAP_SERVERS")]
    pub bootstrap_servers: Option<String>,

    /// Kafka consumer group
    #[arg(long, env = "KAFKA_GROUP_ID")]
    pub group_id: Option<String>,

    /// Offset reset policy for partitions without a committed offset
    #[arg(long, env = "KAFKA_AUTO_OFFSET_RESET")]
    pub auto_offset_reset: Option<String>,

    /// Topics to subscribe to (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub topics: Option<Vec<String>>,

    /// Time-series store URL
    #[arg(long, env = "INFLUX_URL")]
    pub store_url: Option<String>,

    /// Time-series store API token
    #[arg(long, env = "INFLUX_TOKEN", hide_env_values = true)]
    pub store_token: Option<String>,

    /// Time-series store organisation
    #[arg(long, env = "INFLUX_ORG")]
    pub store_org: Option<String>,

    /// Time-series store bucket
    #[arg(long, env = "INFLUX_BUCKET")]
    pub store_bucket: Option<String>,

    /// IANA timezone used for local-time rendering
    #[arg(long, env = "LOCAL_TIMEZONE")]
    pub local_timezone: Option<String>,

    /// Do not start draining the bus at start-up
    #[arg(long)]
    pub no_autostart: bool,
}

/// Complete service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub bus: BusSettings,
    pub stream: StreamSettings,
    pub store: StoreSettings,
    pub history: HistorySettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Which message bus implementation feeds the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    Kafka,
    Memory,
}

/// Message bus connection and consumption options.
#[derive(Debug, Clone, Deserialize)]
pub struct BusSettings {
    pub backend: BusBackend,
    pub bootstrap_servers: String,
    pub group_id: String,
    pub auto_offset_reset: String,
    pub topics: Vec<String>,
    /// Upper bound on a single poll; also bounds how long `stop` waits to be noticed.
    pub poll_timeout_ms: u64,
    /// Payload field holding the device identifier.
    pub device_field: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamSettings {
    /// Sampling interval for live streams whose caller asked for 0.
    pub sample_interval_ms: u64,
    pub stop_grace_ms: u64,
    pub autostart: bool,
}

#[derive(Clone, Deserialize)]
pub struct StoreSettings {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
    pub timeout_secs: u64,
}

impl std::fmt::Debug for StoreSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreSettings")
            .field("url", &self.url)
            .field("token", &"<redacted>")
            .field("org", &self.org)
            .field("bucket", &self.bucket)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistorySettings {
    pub local_timezone: String,
    pub chunk_minutes: u64,
    #[serde(default)]
    pub allow_raw_query: bool,
}

impl BusSettings {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

impl StreamSettings {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

impl HistorySettings {
    pub fn chunk_duration(&self) -> Duration {
        Duration::from_secs(self.chunk_minutes * 60)
    }

    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        self.local_timezone.parse::<Tz>().map_err(|_| {
            ConfigError::Message(format!("unknown timezone '{}'", self.local_timezone))
        })
    }
}

impl Settings {
    /// Loads configuration from all available sources.
    pub fn new(cli: CliArgs) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml));

        if let Some(ref config_path) = cli.config {
            builder = builder.add_source(File::from(config_path.clone()));
        }

        builder = builder.add_source(
            Environment::with_prefix("FABSTREAM")
                .prefix_separator("__")
                .separator("__"),
        );

        if let Some(ref host) = cli.host {
            builder = builder.set_override("server.host", host.as_str())?;
        }
        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", i64::from(port))?;
        }
        if let Some(ref backend) = cli.bus_backend {
            builder = builder.set_override("bus.backend", backend.as_str())?;
        }
        if let Some(ref servers) = cli.bootstrap_servers {
            builder = builder.set_override("bus.bootstrap_servers", servers.as_str())?;
        }
        if let Some(ref group) = cli.group_id {
            builder = builder.set_override("bus.group_id", group.as_str())?;
        }
        if let Some(ref reset) = cli.auto_offset_reset {
            builder = builder.set_override("bus.auto_offset_reset", reset.as_str())?;
        }
        if let Some(ref topics) = cli.topics {
            builder = builder.set_override("bus.topics", topics.clone())?;
        }
        if let Some(ref url) = cli.store_url {
            builder = builder.set_override("store.url", url.as_str())?;
        }
        if let Some(ref token) = cli.store_token {
            builder = builder.set_override("store.token", token.as_str())?;
        }
        if let Some(ref org) = cli.store_org {
            builder = builder.set_override("store.org", org.as_str())?;
        }
        if let Some(ref bucket) = cli.store_bucket {
            builder = builder.set_override("store.bucket", bucket.as_str())?;
        }
        if let Some(ref tz) = cli.local_timezone {
            builder = builder.set_override("history.local_timezone", tz.as_str())?;
        }
        if cli.no_autostart {
            builder = builder.set_override("stream.autostart", false)?;
        }

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Rejects settings the engines cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.poll_timeout_ms == 0 {
            return Err(ConfigError::Message("bus.poll_timeout_ms must be positive".into()));
        }
        if self.bus.topics.is_empty() {
            return Err(ConfigError::Message("bus.topics must not be empty".into()));
        }
        if self.stream.sample_interval_ms == 0 {
            return Err(ConfigError::Message("stream.sample_interval_ms must be positive".into()));
        }
        if self.history.chunk_minutes == 0 {
            return Err(ConfigError::Message("history.chunk_minutes must be positive".into()));
        }
        self.history.timezone()?;
        Ok(())
    }
}
