use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default TOML config path, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "./bitmap.toml";

/// Command-line flags. Only flags that were actually given override the
/// lower layers, so every value field is optional here.
#[derive(Parser, Serialize, Clone, Debug, Default)]
#[command(name = "bitmap-server", version, about = "Bitmap community platform server")]
pub struct Cli {
    /// Port to listen on
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Bind address
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,

    /// Path to TOML config file
    #[arg(long)]
    #[serde(skip)]
    pub config: Option<String>,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    #[serde(skip)]
    pub generate_config: bool,
}

/// Resolved server configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind_address: String,
    #[serde(default)]
    pub json_logs: bool,
    /// WebSocket settings (loaded from [ws] section in TOML)
    #[serde(default)]
    pub ws: WsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3030,
            bind_address: "0.0.0.0".to_string(),
            json_logs: false,
            ws: WsConfig::default(),
        }
    }
}

/// Settings for the notification WebSocket endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WsConfig {
    /// Route the WebSocket upgrade is served on (default: "/")
    #[serde(default = "default_ws_path")]
    pub path: String,

    /// Seconds a new connection may stay unregistered before it is closed (default: 10)
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Outbound frames queued per connection before deliveries are dropped (default: 64)
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    /// Largest inbound message accepted from a client, in bytes (default: 64 KiB)
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    /// Seconds between server keepalive pings (default: 30)
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Seconds to wait for a pong before closing (default: 10)
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            path: default_ws_path(),
            handshake_timeout_secs: default_handshake_timeout(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            max_message_bytes: default_max_message_bytes(),
            ping_interval_secs: default_ping_interval(),
            pong_timeout_secs: default_pong_timeout(),
        }
    }
}

// Durations are clamped to at least one second.
impl WsConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs.max(1))
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs.max(1))
    }
}

fn default_ws_path() -> String {
    "/".to_string()
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_outbound_queue_capacity() -> usize {
    64
}

fn default_max_message_bytes() -> usize {
    64 * 1024
}

fn default_ping_interval() -> u64 {
    30
}

fn default_pong_timeout() -> u64 {
    10
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (BITMAP_*) < CLI args
    pub fn load(cli: &Cli) -> Result<Self, figment::Error> {
        Self::figment(cli).extract()
    }

    /// The merged provider stack, before extraction.
    /// Nested keys use a double underscore in env vars: `BITMAP_WS__PATH`.
    pub fn figment(cli: &Cli) -> Figment {
        let config_path = cli.config.as_deref().unwrap_or(DEFAULT_CONFIG_PATH);

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("BITMAP_").split("__"))
            .merge(Serialized::defaults(cli))
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Bitmap Server Configuration
# Place this file at ./bitmap.toml or specify with --config <path>
# All settings can be overridden via environment variables (BITMAP_PORT,
# BITMAP_WS__HANDSHAKE_TIMEOUT_SECS, etc.) or CLI flags (--port, etc.)

# Server port (default: 3030)
# port = 3030

# Bind address (default: 0.0.0.0 — all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# ---- Notification WebSocket ----
# [ws]

# Route serving the WebSocket upgrade (default: "/")
# path = "/"

# Close connections that have not registered within this many seconds
# handshake_timeout_secs = 10

# Frames queued per connection before new deliveries are dropped
# outbound_queue_capacity = 64

# Largest inbound message accepted from a client, in bytes
# max_message_bytes = 65536

# Keepalive: ping every N seconds, close if no pong within M seconds
# ping_interval_secs = 30
# pong_timeout_secs = 10
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_without_file_or_env() {
        Jail::expect_with(|_jail| {
            let config = Config::load(&Cli::default())?;
            assert_eq!(config, Config::default());
            assert_eq!(config.port, 3030);
            assert_eq!(config.ws.path, "/");
            Ok(())
        });
    }

    #[test]
    fn test_toml_then_env_then_cli() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "bitmap.toml",
                r#"
                port = 4000
                bind_address = "127.0.0.1"

                [ws]
                handshake_timeout_secs = 3
                outbound_queue_capacity = 8
                "#,
            )?;
            jail.set_env("BITMAP_BIND_ADDRESS", "10.0.0.1");
            jail.set_env("BITMAP_WS__OUTBOUND_QUEUE_CAPACITY", "16");

            let config = Config::load(&Cli::default())?;
            assert_eq!(config.port, 4000);
            assert_eq!(config.bind_address, "10.0.0.1");
            assert_eq!(config.ws.handshake_timeout_secs, 3);
            assert_eq!(config.ws.outbound_queue_capacity, 16);
            assert_eq!(config.ws.ping_interval_secs, 30);

            let cli = Cli {
                port: Some(5000),
                ..Cli::default()
            };
            let config = Config::load(&cli)?;
            assert_eq!(config.port, 5000);
            assert_eq!(config.bind_address, "10.0.0.1");
            Ok(())
        });
    }

    #[test]
    fn test_explicit_config_path() {
        Jail::expect_with(|jail| {
            jail.create_file("custom.toml", "[ws]\npath = \"/notifications\"\n")?;
            let cli = Cli {
                config: Some("custom.toml".to_string()),
                ..Cli::default()
            };
            let config = Config::load(&cli)?;
            assert_eq!(config.ws.path, "/notifications");
            Ok(())
        });
    }

    #[test]
    fn test_zero_durations_are_clamped_to_one_second() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "bitmap.toml",
                r#"
                [ws]
                handshake_timeout_secs = 0
                ping_interval_secs = 0
                pong_timeout_secs = 0
                "#,
            )?;
            let config = Config::load(&Cli::default())?;
            assert_eq!(config.ws.handshake_timeout(), Duration::from_secs(1));
            assert_eq!(config.ws.ping_interval(), Duration::from_secs(1));
            assert_eq!(config.ws.pong_timeout(), Duration::from_secs(1));
            Ok(())
        });
    }

    #[test]
    fn test_template_parses_as_toml() {
        let template = generate_config_template();
        let parsed: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string(&template))
            .extract()
            .unwrap();
        assert_eq!(parsed, Config::default());
    }
}
