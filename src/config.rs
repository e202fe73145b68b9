pub use self::parser::{
    BackfillConfig, BridgeConfig, Config, DatabaseConfig, DbType, GhostsConfig,
    GoogleChatConfig, LimitsConfig, LoggingConfig, MetricsConfig, RoomConfig,
};
pub use self::validator::ConfigError;

mod parser;
mod validator;
