//! Layered configuration loading utilities.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;

mod deserializer;

/// Root application configuration deserialized from layered sources.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub paper: PaperConfig,
    #[serde(default)]
    pub risk: RiskConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_ws_addr")]
    pub ws_addr: String,
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    /// Upgrade paths accepted by the WebSocket endpoint.
    #[serde(default = "default_ws_paths")]
    pub ws_paths: Vec<String>,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_pong_timeout_ms")]
    pub pong_timeout_ms: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
    /// Seconds between snapshot writes; `0` disables periodic persistence.
    #[serde(default = "default_persist_interval_secs")]
    pub persist_interval_secs: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// Minimum level forwarded to clients as `log` events (`off` disables).
    #[serde(default = "default_forward_level")]
    pub forward_level: String,
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PaperConfig {
    #[serde(default = "default_paper_symbols")]
    pub symbols: Vec<String>,
    #[serde(default = "default_start_price")]
    pub start_price: Decimal,
    /// Standard deviation of each random-walk step, as a fraction of price.
    #[serde(default = "default_volatility")]
    pub volatility: f64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_quote_currency")]
    pub quote_currency: String,
    #[serde(
        default = "default_initial_balances",
        with = "deserializer::uppercase_key"
    )]
    pub initial_balances: HashMap<String, Decimal>,
    #[serde(default = "default_fee_bps")]
    pub fee_bps: Decimal,
}

/// Pre-trade limits applied to `place_order`. An unset limit is not enforced.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RiskConfig {
    /// Largest quantity accepted for a single order.
    #[serde(default)]
    pub max_order_size: Option<Decimal>,
    /// Largest absolute position per symbol after the order fills.
    #[serde(default)]
    pub max_position_size: Option<Decimal>,
    /// Realized loss for the current UTC day, in quote currency, after which new
    /// orders are refused.
    #[serde(default)]
    pub max_daily_loss: Option<Decimal>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_addr: default_ws_addr(),
            http_addr: default_http_addr(),
            ws_paths: default_ws_paths(),
            max_clients: default_max_clients(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl ServerConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms.max(1))
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval_ms(),
            pong_timeout_ms: default_pong_timeout_ms(),
        }
    }
}

impl HeartbeatConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.max(1))
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms.max(1))
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: default_state_path(),
            persist_interval_secs: default_persist_interval_secs(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_path: None,
            forward_level: default_forward_level(),
            status_interval_secs: default_status_interval_secs(),
        }
    }
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            symbols: default_paper_symbols(),
            start_price: default_start_price(),
            volatility: default_volatility(),
            tick_interval_ms: default_tick_interval_ms(),
            quote_currency: default_quote_currency(),
            initial_balances: default_initial_balances(),
            fee_bps: default_fee_bps(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ws_addr() -> String {
    "127.0.0.1:8765".into()
}

fn default_http_addr() -> String {
    "127.0.0.1:8766".into()
}

fn default_ws_paths() -> Vec<String> {
    vec!["/ws".into(), "/api/stream".into()]
}

fn default_max_clients() -> usize {
    256
}

fn default_outbound_queue_capacity() -> usize {
    1024
}

fn default_command_timeout_ms() -> u64 {
    10_000
}

fn default_ping_interval_ms() -> u64 {
    15_000
}

fn default_pong_timeout_ms() -> u64 {
    20_000
}

fn default_history_limit() -> usize {
    1000
}

fn default_state_path() -> PathBuf {
    PathBuf::from("./state/snapshot.json")
}

fn default_persist_interval_secs() -> u64 {
    30
}

fn default_forward_level() -> String {
    "info".to_string()
}

fn default_status_interval_secs() -> u64 {
    10
}

fn default_paper_symbols() -> Vec<String> {
    vec!["BTC-USDT".into(), "ETH-USDT".into()]
}

fn default_start_price() -> Decimal {
    Decimal::from(30_000)
}

fn default_volatility() -> f64 {
    0.0005
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

fn default_quote_currency() -> String {
    "USDT".to_string()
}

fn default_initial_balances() -> HashMap<String, Decimal> {
    let mut balances = HashMap::new();
    balances.insert(default_quote_currency(), Decimal::new(10_000, 0));
    balances
}

fn default_fee_bps() -> Decimal {
    Decimal::from(10)
}

/// Loads configuration by merging files and environment variables.
///
/// Sources (lowest to highest precedence):
/// 1. `config/default.toml` (optional)
/// 2. `config/{environment}.toml` (if `environment` is Some)
/// 3. `config/local.toml` (optional, ignored in git)
/// 4. Environment variables prefixed with `HELM__`, e.g. `HELM__SERVER__WS_ADDR`
pub fn load_config(env: Option<&str>) -> Result<AppConfig> {
    load_config_from(Path::new("config"), env)
}

/// Same as [`load_config`] but reading files from `base_path`.
pub fn load_config_from(base_path: &Path, env: Option<&str>) -> Result<AppConfig> {
    let mut builder =
        Config::builder().add_source(File::from(base_path.join("default.toml")).required(false));
    if let Some(env_name) = env {
        builder = builder
            .add_source(File::from(base_path.join(format!("{env_name}.toml"))).required(false));
    }

    builder = builder.add_source(File::from(base_path.join("local.toml")).required(false));

    builder = builder.add_source(
        Environment::with_prefix("HELM")
            .prefix_separator("__")
            .separator("__")
            .ignore_empty(true),
    );

    let config = builder.build()?;
    config
        .try_deserialize()
        .map_err(|err: ConfigError| err.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn empty_directory_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(dir.path(), None).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.server.ws_paths, vec!["/ws", "/api/stream"]);
        assert_eq!(config.heartbeat.ping_interval(), Duration::from_secs(15));
        assert_eq!(config.heartbeat.pong_timeout(), Duration::from_secs(20));
        assert_eq!(config.bus.history_limit, 1000);
        assert_eq!(
            config.paper.initial_balances.get("USDT"),
            Some(&Decimal::from(10_000))
        );
        assert!(config.risk.max_order_size.is_none());
    }

    #[test]
    fn risk_limits_are_read_from_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("default.toml"),
            "[risk]\nmax_order_size = 2\nmax_daily_loss = 500\n",
        )
        .unwrap();
        let config = load_config_from(dir.path(), None).unwrap();
        assert_eq!(config.risk.max_order_size, Some(Decimal::from(2)));
        assert_eq!(config.risk.max_position_size, None);
        assert_eq!(config.risk.max_daily_loss, Some(Decimal::from(500)));
    }

    #[test]
    fn environment_file_overrides_default() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("default.toml"),
            "[heartbeat]\nping_interval_ms = 1000\npong_timeout_ms = 2000\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("staging.toml"),
            "[heartbeat]\npong_timeout_ms = 500\n\n[paper.initial_balances]\nusdc = 250\n",
        )
        .unwrap();
        let config = load_config_from(dir.path(), Some("staging")).unwrap();
        assert_eq!(config.heartbeat.ping_interval_ms, 1000);
        assert_eq!(config.heartbeat.pong_timeout_ms, 500);
        assert_eq!(
            config.paper.initial_balances.get("USDC"),
            Some(&Decimal::from(250))
        );
    }
}
