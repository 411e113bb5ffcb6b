use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::coaching::fees::FeePercent;
use crate::coaching::guard::DEFAULT_DAILY_MESSAGE_CAP;
use crate::coaching::issuer::DEFAULT_PLACEHOLDER_PLAYERS;
use crate::coaching::webhook::DEFAULT_TOLERANCE_SECS;
use crate::error::CoachlineError;
use crate::utils::{get_env_list_with_prefix, get_env_with_prefix};

/// Main configuration for a coachline service
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub coaching: CoachingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum request body size in bytes (default: 1MB)
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

/// Payment pipeline settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoachingConfig {
    /// Platform share of each payment.
    #[serde(default = "default_fee_percent")]
    pub fee_percent: FeePercent,
    /// Player text messages allowed per conversation per UTC day.
    #[serde(default = "default_daily_message_cap")]
    pub daily_message_cap: u32,
    /// Upper bound on every processor call.
    #[serde(default = "default_processor_timeout_secs")]
    pub processor_timeout_secs: u64,
    /// Webhook endpoint secret. Never serialized.
    #[serde(skip, default = "default_webhook_secret")]
    pub webhook_secret: SecretString,
    #[serde(default = "default_webhook_tolerance_secs")]
    pub webhook_tolerance_secs: i64,
    /// Player ids that never get a conversation.
    #[serde(default = "default_placeholder_players")]
    pub placeholder_players: Vec<String>,
    /// Currency for checkout charges.
    #[serde(default = "default_currency")]
    pub currency: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_size: default_max_body_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for CoachingConfig {
    fn default() -> Self {
        Self {
            fee_percent: default_fee_percent(),
            daily_message_cap: default_daily_message_cap(),
            processor_timeout_secs: default_processor_timeout_secs(),
            webhook_secret: default_webhook_secret(),
            webhook_tolerance_secs: default_webhook_tolerance_secs(),
            placeholder_players: default_placeholder_players(),
            currency: default_currency(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_body_size() -> usize {
    1024 * 1024
}

fn default_fee_percent() -> FeePercent {
    FeePercent::DEFAULT
}

fn default_daily_message_cap() -> u32 {
    DEFAULT_DAILY_MESSAGE_CAP
}

fn default_processor_timeout_secs() -> u64 {
    10
}

fn default_webhook_secret() -> SecretString {
    SecretString::from(String::new())
}

fn default_webhook_tolerance_secs() -> i64 {
    DEFAULT_TOLERANCE_SECS
}

fn default_placeholder_players() -> Vec<String> {
    DEFAULT_PLACEHOLDER_PLAYERS
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

fn default_currency() -> String {
    "usd".to_string()
}

impl ServerConfig {
    pub fn addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }
}

impl CoachingConfig {
    /// Processor call timeout.
    #[must_use]
    pub fn processor_timeout(&self) -> Duration {
        Duration::from_secs(self.processor_timeout_secs)
    }
}

/// Builder for Config with environment variable support
#[must_use = "builder does nothing until you call build()"]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.config.server.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.server.port = port;
        self
    }

    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.config.server.max_body_size = max_body_size;
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn with_json_logging(mut self, enabled: bool) -> Self {
        self.config.logging.json = enabled;
        self
    }

    pub fn with_fee_percent(mut self, fee: FeePercent) -> Self {
        self.config.coaching.fee_percent = fee;
        self
    }

    pub fn with_daily_message_cap(mut self, cap: u32) -> Self {
        self.config.coaching.daily_message_cap = cap;
        self
    }

    pub fn with_processor_timeout_secs(mut self, secs: u64) -> Self {
        self.config.coaching.processor_timeout_secs = secs;
        self
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.coaching.webhook_secret = SecretString::from(secret.into());
        self
    }

    pub fn with_webhook_tolerance_secs(mut self, secs: i64) -> Self {
        self.config.coaching.webhook_tolerance_secs = secs;
        self
    }

    pub fn with_placeholder_players(mut self, ids: Vec<String>) -> Self {
        self.config.coaching.placeholder_players = ids;
        self
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.config.coaching.currency = currency.into().to_ascii_lowercase();
        self
    }

    /// Load configuration from environment variables with COACHLINE_ prefix
    pub fn from_env(mut self) -> Self {
        if let Some(host) = get_env_with_prefix("HOST") {
            self.config.server.host = host;
        }
        // COACHLINE_PORT first, then PORT for platform-provided ports
        if let Some(port) = get_env_with_prefix("PORT") {
            if let Ok(p) = port.parse() {
                self.config.server.port = p;
            }
        }
        if let Some(max_body_size) = get_env_with_prefix("MAX_BODY_SIZE") {
            if let Ok(size) = max_body_size.parse() {
                self.config.server.max_body_size = size;
            }
        }
        if let Some(level) = get_env_with_prefix("LOG_LEVEL") {
            self.config.logging.level = level;
        }
        if let Some(json) = get_env_with_prefix("LOG_JSON") {
            self.config.logging.json = json.parse().unwrap_or(false);
        }

        let coaching = &mut self.config.coaching;
        if let Some(fee) = get_env_with_prefix("FEE_PERCENT") {
            match fee.parse() {
                Ok(fee) => coaching.fee_percent = fee,
                Err(e) => tracing::warn!(error = %e, "Ignoring FEE_PERCENT"),
            }
        }
        if let Some(cap) = get_env_with_prefix("DAILY_MESSAGE_CAP") {
            if let Ok(cap) = cap.parse() {
                coaching.daily_message_cap = cap;
            }
        }
        if let Some(secs) = get_env_with_prefix("PROCESSOR_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse() {
                coaching.processor_timeout_secs = secs;
            }
        }
        if let Some(secret) = get_env_with_prefix("WEBHOOK_SECRET") {
            coaching.webhook_secret = SecretString::from(secret);
        }
        if let Some(secs) = get_env_with_prefix("WEBHOOK_TOLERANCE_SECS") {
            if let Ok(secs) = secs.parse() {
                coaching.webhook_tolerance_secs = secs;
            }
        }
        if let Some(ids) = get_env_list_with_prefix("PLACEHOLDER_PLAYERS") {
            coaching.placeholder_players = ids;
        }
        if let Some(currency) = get_env_with_prefix("CURRENCY") {
            coaching.currency = currency.trim().to_ascii_lowercase();
        }

        self
    }

    /// Build the configuration, validating all settings
    ///
    /// # Errors
    ///
    /// Returns an error if the server address, log level, message cap,
    /// timeouts or currency are invalid, or if no webhook secret is set.
    pub fn build(self) -> crate::error::Result<Config> {
        self.config.server.addr().map_err(|e| {
            CoachlineError::bad_request(format!(
                "Invalid server address {}:{} - {}",
                self.config.server.host, self.config.server.port, e
            ))
        })?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.config.logging.level.to_lowercase().as_str()) {
            return Err(CoachlineError::bad_request(format!(
                "Invalid log level: {}. Must be one of: {}",
                self.config.logging.level,
                valid_log_levels.join(", ")
            )));
        }

        if self.config.server.port == 0 {
            return Err(CoachlineError::bad_request("Server port must be greater than 0"));
        }

        if self.config.server.max_body_size == 0 {
            return Err(CoachlineError::bad_request(
                "Maximum body size must be greater than 0",
            ));
        }

        let coaching = &self.config.coaching;
        if coaching.daily_message_cap == 0 {
            return Err(CoachlineError::bad_request(
                "Daily message cap must be greater than 0",
            ));
        }
        if coaching.processor_timeout_secs == 0 {
            return Err(CoachlineError::bad_request(
                "Processor timeout must be greater than 0",
            ));
        }
        if coaching.webhook_secret.expose_secret().trim().is_empty() {
            return Err(CoachlineError::bad_request(
                "Webhook secret must be set (COACHLINE_WEBHOOK_SECRET)",
            ));
        }
        if coaching.webhook_tolerance_secs <= 0 {
            return Err(CoachlineError::bad_request(
                "Webhook tolerance must be greater than 0",
            ));
        }
        if coaching.currency.len() != 3 || !coaching.currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(CoachlineError::bad_request(format!(
                "Invalid currency: {}",
                coaching.currency
            )));
        }

        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
