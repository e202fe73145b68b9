use super::ConfigError;
use super::validator::require_non_empty;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub bridge: BridgeConfig,
    pub googlechat: GoogleChatConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub room: RoomConfig,
    #[serde(default)]
    pub ghosts: GhostsConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub backfill: BackfillConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    pub domain: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_bridge_id")]
    pub bridge_id: String,
    #[serde(alias = "as_token")]
    pub appservice_token: String,
    #[serde(alias = "hs_token")]
    pub homeserver_token: String,
    #[serde(default)]
    pub homeserver_url: String,
    #[serde(default = "default_bot_localpart")]
    pub bot_localpart: String,
    #[serde(default)]
    pub disable_typing_notifications: bool,
    #[serde(default)]
    pub disable_read_receipts: bool,
    #[serde(default)]
    pub disable_deletion_forwarding: bool,
    #[serde(default = "default_relay_format")]
    pub relay_format: String,
    #[serde(default)]
    pub admin_mxid: Option<String>,
    #[serde(default)]
    pub metadata_sync_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleChatConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_upload_base_url")]
    pub upload_base_url: String,
    pub bot_user_id: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub webhook_token: String,
    #[serde(default = "default_supports_edits")]
    pub supports_edits: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(alias = "console", default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub conn_string: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub max_connections: Option<u32>,
    #[serde(default)]
    pub min_connections: Option<u32>,
}

impl DatabaseConfig {
    pub fn db_type(&self) -> DbType {
        let url = self.connection_string();
        if url.starts_with("sqlite://") {
            DbType::Sqlite
        } else if url.starts_with("memory://") {
            DbType::Memory
        } else {
            DbType::Postgres
        }
    }

    pub fn connection_string(&self) -> String {
        if let Some(ref url) = self.url {
            url.clone()
        } else if let Some(ref conn) = self.conn_string {
            conn.clone()
        } else if let Some(ref file) = self.filename {
            format!("sqlite://{}", file)
        } else {
            String::new()
        }
    }

    pub fn sqlite_path(&self) -> Option<String> {
        if let DbType::Sqlite = self.db_type() {
            let url = self.connection_string();
            Some(url.strip_prefix("sqlite://").unwrap_or(&url).to_string())
        } else {
            None
        }
    }

    pub fn max_connections(&self) -> Option<u32> {
        match self.db_type() {
            DbType::Postgres => self.max_connections,
            DbType::Sqlite | DbType::Memory => Some(1),
        }
    }

    pub fn min_connections(&self) -> Option<u32> {
        match self.db_type() {
            DbType::Postgres => self.min_connections,
            DbType::Sqlite | DbType::Memory => Some(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbType {
    Postgres,
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomConfig {
    #[serde(default = "default_visibility")]
    pub default_visibility: String,
    #[serde(default = "default_room_alias_prefix")]
    pub room_alias_prefix: String,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            default_visibility: default_visibility(),
            room_alias_prefix: default_room_alias_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GhostsConfig {
    #[serde(default = "default_username_template")]
    pub username_template: String,
    #[serde(default = "default_displayname_template")]
    pub displayname_template: String,
}

impl Default for GhostsConfig {
    fn default() -> Self {
        Self {
            username_template: default_username_template(),
            displayname_template: default_displayname_template(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_room_count")]
    pub room_count: i32,
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
    #[serde(default = "default_echo_ttl_ms")]
    pub echo_ttl_ms: u64,
    #[serde(default = "default_pending_timeout_ms")]
    pub pending_timeout_ms: u64,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_send_retries")]
    pub send_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_event_age_ms")]
    pub max_event_age_ms: i64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            room_count: default_room_count(),
            event_queue_capacity: default_event_queue_capacity(),
            echo_ttl_ms: default_echo_ttl_ms(),
            pending_timeout_ms: default_pending_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            send_retries: default_send_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_event_age_ms: default_max_event_age_ms(),
        }
    }
}

impl LimitsConfig {
    pub fn echo_ttl(&self) -> Duration {
        Duration::from_millis(self.echo_ttl_ms)
    }

    pub fn pending_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct BackfillConfig {
    #[serde(default)]
    pub initial_limit: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    #[serde(default = "default_metrics_bind_address")]
    pub bind_address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
            bind_address: default_metrics_bind_address(),
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::load_from_str(&content)
    }

    pub fn load_from_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_non_empty(&self.bridge.domain, "bridge.domain")?;
        require_non_empty(&self.bridge.appservice_token, "bridge.appservice_token")?;
        require_non_empty(&self.bridge.homeserver_token, "bridge.homeserver_token")?;
        require_non_empty(&self.googlechat.bot_user_id, "googlechat.bot_user_id")?;
        require_non_empty(&self.googlechat.webhook_token, "googlechat.webhook_token")?;

        if self.database.connection_string().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "database connection string cannot be empty".to_string(),
            ));
        }

        if self.bridge.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "bridge.port must be between 1 and 65535".to_string(),
            ));
        }

        if self.limits.event_queue_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "limits.event_queue_capacity must be at least 1".to_string(),
            ));
        }

        if !self.ghosts.username_template.contains(":id") {
            return Err(ConfigError::InvalidConfig(
                "ghosts.username_template must contain :id".to_string(),
            ));
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(ConfigError::InvalidConfig(format!(
                    "logging.format must be pretty or json, got {other}"
                )));
            }
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("GOOGLECHAT_BRIDGE_ACCESS_TOKEN") {
            self.googlechat.access_token = value;
        }
        if let Ok(value) = std::env::var("GOOGLECHAT_BRIDGE_WEBHOOK_TOKEN") {
            self.googlechat.webhook_token = value;
        }
        if let Ok(value) = std::env::var("GOOGLECHAT_BRIDGE_AS_TOKEN") {
            self.bridge.appservice_token = value;
        }
        if let Ok(value) = std::env::var("GOOGLECHAT_BRIDGE_HS_TOKEN") {
            self.bridge.homeserver_token = value;
        }
    }

    pub fn bot_user_id(&self) -> String {
        format!("@{}:{}", self.bridge.bot_localpart, self.bridge.domain)
    }
}

fn default_port() -> u16 {
    9006
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_bridge_id() -> String {
    "googlechat".to_string()
}

fn default_bot_localpart() -> String {
    "googlechatbot".to_string()
}

fn default_relay_format() -> String {
    ":sender: :message".to_string()
}

fn default_api_base_url() -> String {
    "https://chat.googleapis.com/v1".to_string()
}

fn default_upload_base_url() -> String {
    "https://chat.googleapis.com/upload/v1".to_string()
}

fn default_supports_edits() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_visibility() -> String {
    "private".to_string()
}

fn default_room_alias_prefix() -> String {
    "googlechat_".to_string()
}

fn default_username_template() -> String {
    "googlechat_:id".to_string()
}

fn default_displayname_template() -> String {
    ":name (Google Chat)".to_string()
}

fn default_room_count() -> i32 {
    -1
}

fn default_event_queue_capacity() -> usize {
    1024
}

fn default_echo_ttl_ms() -> u64 {
    30_000
}

fn default_pending_timeout_ms() -> u64 {
    5_000
}

fn default_send_timeout_ms() -> u64 {
    15_000
}

fn default_send_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_max_event_age_ms() -> i64 {
    900_000
}

fn default_metrics_port() -> u16 {
    9001
}

fn default_metrics_bind_address() -> String {
    "127.0.0.1".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
bridge:
  domain: example.org
  as_token: as-secret
  hs_token: hs-secret
  homeserver_url: http://localhost:8008
googlechat:
  bot_user_id: users/100
  webhook_token: hook-secret
database:
  url: memory://
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = Config::load_from_str(MINIMAL).expect("config parses");
        assert_eq!(config.bridge.port, 9006);
        assert_eq!(config.bridge.appservice_token, "as-secret");
        assert_eq!(config.database.db_type(), DbType::Memory);
        assert_eq!(config.limits.echo_ttl_ms, 30_000);
        assert_eq!(config.limits.pending_timeout(), Duration::from_secs(5));
        assert_eq!(config.ghosts.username_template, "googlechat_:id");
        assert!(config.googlechat.supports_edits);
        assert_eq!(config.bot_user_id(), "@googlechatbot:example.org");
    }

    #[test]
    fn empty_domain_is_rejected() {
        let yaml = MINIMAL.replace("domain: example.org", "domain: \"\"");
        let err = Config::load_from_str(&yaml).expect_err("empty domain must fail");
        assert!(err.to_string().contains("bridge.domain"));
    }

    #[test]
    fn empty_webhook_token_is_rejected() {
        let yaml = MINIMAL.replace("webhook_token: hook-secret", "webhook_token: \"\"");
        let err = Config::load_from_str(&yaml).expect_err("empty webhook token must fail");
        assert!(err.to_string().contains("googlechat.webhook_token"));
    }

    #[test]
    fn username_template_requires_id_placeholder() {
        let yaml = format!("{MINIMAL}ghosts:\n  username_template: googlechat_static\n");
        let err = Config::load_from_str(&yaml).expect_err("template without :id must fail");
        assert!(err.to_string().contains(":id"));
    }

    #[test]
    fn sqlite_filename_builds_connection_string() {
        let db = DatabaseConfig {
            url: None,
            conn_string: None,
            filename: Some("/tmp/bridge.db".to_string()),
            max_connections: Some(8),
            min_connections: None,
        };
        assert_eq!(db.db_type(), DbType::Sqlite);
        assert_eq!(db.sqlite_path().as_deref(), Some("/tmp/bridge.db"));
        assert_eq!(db.max_connections(), Some(1));
    }
}
