use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// =============================================================================
// File config (figment-deserialized from defaults / TOML file / env vars)
// =============================================================================
//
//   config.toml:     [broker]
//                    connect_timeout_secs = 20
//
//   env var:         AOC_BROKER__CONNECT_TIMEOUT_SECS=20   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub broker: BrokerFileConfig,
    #[serde(default)]
    pub sync: SyncFileConfig,
}

/// Broker connection tunables (lives under `[broker]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrokerFileConfig {
    /// Full broker URL. Overrides the derivation from `console_host`.
    #[serde(default)]
    pub url: Option<String>,
    /// Hostname the console is served from; the broker lives on the sibling
    /// `mqtt.` subdomain.
    #[serde(default)]
    pub console_host: Option<String>,
    #[serde(default = "default_secure")]
    pub secure: bool,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_max_packet_kb")]
    pub max_packet_kb: usize,
}

impl Default for BrokerFileConfig {
    fn default() -> Self {
        Self {
            url: None,
            console_host: None,
            secure: default_secure(),
            username: default_username(),
            client_id_prefix: default_client_id_prefix(),
            connect_timeout_secs: default_connect_timeout_secs(),
            keep_alive_secs: default_keep_alive_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            max_packet_kb: default_max_packet_kb(),
        }
    }
}

/// Aggregation and RPC tunables (lives under `[sync]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncFileConfig {
    #[serde(default = "default_loading_grace_secs")]
    pub loading_grace_secs: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for SyncFileConfig {
    fn default() -> Self {
        Self {
            loading_grace_secs: default_loading_grace_secs(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

fn default_secure() -> bool {
    true
}
fn default_username() -> String {
    "bitswan-frontend".to_string()
}
fn default_client_id_prefix() -> String {
    "aoc-console-".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    30
}
fn default_keep_alive_secs() -> u64 {
    60
}
fn default_reconnect_delay_secs() -> u64 {
    5
}
fn default_max_packet_kb() -> usize {
    16 * 1024
}
fn default_loading_grace_secs() -> u64 {
    10
}
fn default_call_timeout_secs() -> u64 {
    10
}

/// Build a figment that layers: defaults → TOML file → AOC_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `AOC_BROKER__URL=wss://mqtt.example.com/mqtt`  →  `broker.url`
///   `AOC_SYNC__CALL_TIMEOUT_SECS=5`  →  `sync.call_timeout_secs = 5`
pub fn load_config(config_file: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()));
    if let Some(path) = config_file {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed("AOC_").split("__"))
}

// =============================================================================
// Resolved runtime config
// =============================================================================

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub url: String,
    pub username: String,
    pub client_id_prefix: String,
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
    pub reconnect_delay: Duration,
    pub max_packet_bytes: usize,
}

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub broker: BrokerConfig,
    /// How long `is_loading` may stay true with no workspace data.
    pub loading_grace: Duration,
    /// Default deadline for correlated calls.
    pub call_timeout: Duration,
}

impl SyncConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        let b = &fc.broker;
        let url = b.url.clone().unwrap_or_else(|| {
            broker_url(b.console_host.as_deref().unwrap_or("localhost"), b.secure)
        });
        Self {
            broker: BrokerConfig {
                url,
                username: b.username.clone(),
                client_id_prefix: b.client_id_prefix.clone(),
                connect_timeout: Duration::from_secs(b.connect_timeout_secs),
                keep_alive: Duration::from_secs(b.keep_alive_secs),
                reconnect_delay: Duration::from_secs(b.reconnect_delay_secs),
                max_packet_bytes: b.max_packet_kb * 1024,
            },
            loading_grace: Duration::from_secs(fc.sync.loading_grace_secs),
            call_timeout: Duration::from_secs(fc.sync.call_timeout_secs),
        }
    }

    pub fn load(config_file: Option<&Path>) -> Result<Self, figment::Error> {
        let fc: FileConfig = load_config(config_file).extract()?;
        Ok(Self::from_file(&fc))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}

/// Replace the first DNS label with `mqtt`: `console.example.com` becomes
/// `mqtt.example.com`. Single-label hosts are returned unchanged.
pub fn derive_broker_host(console_host: &str) -> String {
    match console_host.split_once('.') {
        Some((_, rest)) if !rest.is_empty() => format!("mqtt.{rest}"),
        _ => console_host.to_string(),
    }
}

pub fn broker_url(console_host: &str, secure: bool) -> String {
    let scheme = if secure { "wss" } else { "ws" };
    format!("{scheme}://{}/mqtt", derive_broker_host(console_host))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn broker_host_substitutes_first_label() {
        assert_eq!(derive_broker_host("aoc.acme.example.com"), "mqtt.acme.example.com");
        assert_eq!(derive_broker_host("localhost"), "localhost");
    }

    #[test]
    fn broker_url_scheme_follows_secure_flag() {
        assert_eq!(broker_url("aoc.example.com", true), "wss://mqtt.example.com/mqtt");
        assert_eq!(broker_url("aoc.example.com", false), "ws://mqtt.example.com/mqtt");
    }

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.broker.url, "wss://localhost/mqtt");
        assert_eq!(config.broker.username, "bitswan-frontend");
        assert_eq!(config.broker.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.loading_grace, Duration::from_secs(10));
        assert_eq!(config.call_timeout, Duration::from_secs(10));
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[broker]\nconsole_host = \"ops.example.org\"\nconnect_timeout_secs = 15\n\n[sync]\ncall_timeout_secs = 3"
        )
        .unwrap();

        let fc: FileConfig = load_config(Some(file.path())).extract().unwrap();
        let config = SyncConfig::from_file(&fc);
        assert_eq!(config.broker.url, "wss://mqtt.example.org/mqtt");
        assert_eq!(config.broker.connect_timeout, Duration::from_secs(15));
        assert_eq!(config.call_timeout, Duration::from_secs(3));
        // Untouched keys keep their defaults.
        assert_eq!(config.loading_grace, Duration::from_secs(10));
    }

    #[test]
    fn explicit_url_wins_over_console_host() {
        let fc = FileConfig {
            broker: BrokerFileConfig {
                url: Some("ws://127.0.0.1:9001/mqtt".into()),
                console_host: Some("aoc.example.com".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(SyncConfig::from_file(&fc).broker.url, "ws://127.0.0.1:9001/mqtt");
    }
}
