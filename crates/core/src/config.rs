use std::collections::HashSet;
use std::path::Path;
#[cfg(feature = "native")]
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub accounts: Vec<AccountConfig>,
    pub timeouts: TimeoutConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Bare JID used to log in, e.g. "alice@example.com"
    pub jid: String,
    pub password: String,
    /// Resource to request if the server refuses to assign one
    #[serde(default = "default_resource")]
    pub resource: String,
    /// Host to connect to instead of the JID's domain
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub tls: TlsPolicy,
    #[serde(default = "default_true")]
    pub auto_connect: bool,
    /// 0 retries forever
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

impl AccountConfig {
    pub const DEFAULT_PORT: u16 = 5222;

    pub fn new(jid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            jid: jid.into(),
            password: password.into(),
            resource: default_resource(),
            server: None,
            port: None,
            tls: TlsPolicy::default(),
            auto_connect: true,
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }

    /// The domain part of the configured JID.
    pub fn domain(&self) -> &str {
        let bare = self.jid.split('/').next().unwrap_or_default();
        bare.rsplit_once('@').map(|(_, domain)| domain).unwrap_or(bare)
    }

    pub fn host(&self) -> &str {
        self.server.as_deref().unwrap_or_else(|| self.domain())
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(Self::DEFAULT_PORT)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidAccount {
            jid: self.jid.clone(),
            reason: reason.to_string(),
        };

        let Some((local, domain)) = self.jid.split_once('@') else {
            return Err(invalid("missing '@'"));
        };
        if local.is_empty() {
            return Err(invalid("empty localpart"));
        }
        if domain.is_empty() || domain.contains('/') || domain.contains('@') {
            return Err(invalid("account JID must be a bare JID"));
        }
        if self.password.is_empty() {
            return Err(invalid("empty password"));
        }
        Ok(())
    }
}

/// When STARTTLS is negotiated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsPolicy {
    /// Upgrade when offered; refuse a plaintext-only server.
    #[default]
    Required,
    /// Upgrade when offered, otherwise stay in plaintext.
    Opportunistic,
    /// Plaintext only; intended for local test servers.
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_seconds: u64,
    pub roster_seconds: u64,
    pub query_seconds: u64,
    pub carbons_seconds: u64,
    pub ping_seconds: u64,
    pub archive_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_seconds: 30,
            roster_seconds: 15,
            query_seconds: 10,
            carbons_seconds: 8,
            ping_seconds: 8,
            archive_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

fn default_resource() -> String {
    "perch".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

impl Config {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.display().to_string(),
                source,
            })?;
        }
        std::fs::write(path, contents).map_err(|source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    #[cfg(feature = "native")]
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        directories::ProjectDirs::from("im", "perch", "perch")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for account in &self.accounts {
            account.validate()?;
            if !seen.insert(account.jid.to_lowercase()) {
                return Err(ConfigError::DuplicateAccount(account.jid.clone()));
            }
        }
        Ok(())
    }

    pub fn account(&self, jid: &str) -> Option<&AccountConfig> {
        self.accounts
            .iter()
            .find(|account| account.jid.eq_ignore_ascii_case(jid))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    use super::*;

    const SAMPLE: &str = r#"
        [[accounts]]
        jid = "alice@example.com"
        password = "secret"

        [[accounts]]
        jid = "bob@chat.example.org"
        password = "hunter2"
        resource = "laptop"
        server = "xmpp.example.org"
        port = 5223
        tls = "disabled"
        auto_connect = false

        [timeouts]
        roster_seconds = 20
    "#;

    #[test]
    fn parses_accounts_with_defaults() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.accounts.len(), 2);

        let alice = &config.accounts[0];
        assert_eq!(alice.resource, "perch");
        assert_eq!(alice.tls, TlsPolicy::Required);
        assert_eq!(alice.host(), "example.com");
        assert_eq!(alice.port(), 5222);
        assert!(alice.auto_connect);

        let bob = config.account("BOB@chat.example.org").unwrap();
        assert_eq!(bob.host(), "xmpp.example.org");
        assert_eq!(bob.port(), 5223);
        assert_eq!(bob.tls, TlsPolicy::Disabled);
        assert_eq!(bob.domain(), "chat.example.org");

        assert_eq!(config.timeouts.roster_seconds, 20);
        assert_eq!(config.timeouts.carbons_seconds, 8);
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn parses_opportunistic_tls() {
        let input = r#"
            [[accounts]]
            jid = "dave@example.com"
            password = "pw"
            tls = "opportunistic"
        "#;
        let config = Config::from_toml_str(input).unwrap();
        assert_eq!(config.accounts[0].tls, TlsPolicy::Opportunistic);
    }

    #[test]
    fn rejects_duplicate_accounts() {
        let input = r#"
            [[accounts]]
            jid = "alice@example.com"
            password = "a"
            [[accounts]]
            jid = "Alice@example.com"
            password = "b"
        "#;
        assert_matches!(
            Config::from_toml_str(input),
            Err(ConfigError::DuplicateAccount(_))
        );
    }

    #[test]
    fn rejects_full_jid_account() {
        let input = r#"
            [[accounts]]
            jid = "alice@example.com/phone"
            password = "a"
        "#;
        assert_matches!(
            Config::from_toml_str(input),
            Err(ConfigError::InvalidAccount { .. })
        );
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config
            .accounts
            .push(AccountConfig::new("carol@example.net", "pw"));
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
