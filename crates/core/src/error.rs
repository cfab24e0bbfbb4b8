pub type Result<T> = std::result::Result<T, PerchError>;

#[derive(Debug, thiserror::Error)]
pub enum PerchError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("invalid channel: {0}")]
    InvalidChannel(String),

    #[error("invalid subscription pattern: {0}")]
    InvalidPattern(String),

    #[error("event channel closed")]
    ChannelClosed,

    #[error("subscriber lagged, {0} events dropped")]
    Lagged(u64),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid account {jid}: {reason}")]
    InvalidAccount { jid: String, reason: String },

    #[error("duplicate account {0}")]
    DuplicateAccount(String),

    #[error("no platform configuration directory available")]
    NoConfigDir,
}
