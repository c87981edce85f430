//! qgate.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::types::{ResultMode, ServerTarget};

/// Resource requested when exchanging credentials for an Azure Analysis Services server.
pub const ASAZURE_RESOURCE: &str = "https://*.asazure.windows.net";
/// Resource requested when exchanging credentials for a Power BI Premium workspace.
pub const POWERBI_RESOURCE: &str = "https://analysis.windows.net/powerbi/api";

/// Errors raised while validating a loaded configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("required config value {0} is missing")]
    Missing(&'static str),

    #[error("unexpected server URI scheme {0}")]
    UnknownScheme(String),

    #[error("invalid duration for {field}: {reason}")]
    Duration { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub backend: BackendConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub query: QuerySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// `asazure://…`, `powerbi://…`, or a plain `host[:port]` for on-prem servers.
    pub server: String,
    /// Database used when the route does not name one.
    pub database: Option<String>,
    pub tenant_id: Option<String>,
    /// Defaults to `true` for on-prem servers and `false` for cloud servers.
    pub allow_anonymous: Option<bool>,
    /// Backend user for descriptors that carry no `User Id`.
    pub default_user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_realm")]
    pub realm: String,
    #[serde(default = "default_authority")]
    pub authority: String,
    /// Overrides the resource derived from the server scheme.
    pub resource: Option<String>,
    /// Treat `X-Forwarded-Proto: https` as an encrypted transport.
    #[serde(default)]
    pub trust_forwarded_proto: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            realm: default_realm(),
            authority: default_authority(),
            resource: None,
            trust_forwarded_proto: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_guard_window")]
    pub guard_window: String,
    #[serde(default = "default_validity")]
    pub default_validity: String,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            guard_window: default_guard_window(),
            default_validity: default_validity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySettings {
    #[serde(default = "default_command_timeout")]
    pub command_timeout: String,
    #[serde(default)]
    pub result_mode: ResultMode,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            command_timeout: default_command_timeout(),
            result_mode: ResultMode::default(),
        }
    }
}

fn default_realm() -> String {
    "*.asazure.windows.net".to_string()
}

fn default_authority() -> String {
    "https://login.microsoftonline.com".to_string()
}

fn default_guard_window() -> String {
    "60s".to_string()
}

fn default_validity() -> String {
    "5m".to_string()
}

fn default_command_timeout() -> String {
    "120s".to_string()
}

fn parse_duration(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value).map_err(|e| ConfigError::Duration {
        field,
        reason: e.to_string(),
    })
}

impl GatewayConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: GatewayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Minimal config targeting `server`, used by tests and the `--server` flag.
    pub fn for_server(server: &str, database: &str, tenant_id: &str) -> Self {
        GatewayConfig {
            backend: BackendConfig {
                server: server.to_string(),
                database: Some(database.to_string()),
                tenant_id: Some(tenant_id.to_string()),
                allow_anonymous: None,
                default_user: None,
            },
            auth: AuthConfig::default(),
            pool: PoolSettings::default(),
            query: QuerySettings::default(),
        }
    }

    /// Check required values and parse every duration once so bad input fails at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.server.trim().is_empty() {
            return Err(ConfigError::Missing("backend.server"));
        }
        let target = self.target()?;
        if target.is_cloud() && self.tenant_id().is_none() {
            return Err(ConfigError::Missing("backend.tenant_id"));
        }
        self.guard_window()?;
        self.default_validity()?;
        self.command_timeout()?;
        Ok(())
    }

    /// Classify the configured server by its URI scheme.
    pub fn target(&self) -> Result<ServerTarget, ConfigError> {
        match self.backend.server.split_once("://") {
            Some(("asazure", _)) => Ok(ServerTarget::Cloud {
                resource: self
                    .auth
                    .resource
                    .clone()
                    .unwrap_or_else(|| ASAZURE_RESOURCE.to_string()),
            }),
            Some(("powerbi", _)) => Ok(ServerTarget::Cloud {
                resource: self
                    .auth
                    .resource
                    .clone()
                    .unwrap_or_else(|| POWERBI_RESOURCE.to_string()),
            }),
            Some((scheme, _)) => Err(ConfigError::UnknownScheme(scheme.to_string())),
            None => Ok(ServerTarget::OnPrem),
        }
    }

    pub fn allow_anonymous(&self) -> bool {
        self.backend
            .allow_anonymous
            .unwrap_or_else(|| matches!(self.target(), Ok(ServerTarget::OnPrem)))
    }

    pub fn default_database(&self) -> Option<&str> {
        self.backend
            .database
            .as_deref()
            .filter(|db| !db.trim().is_empty())
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.backend
            .tenant_id
            .as_deref()
            .filter(|t| !t.trim().is_empty())
    }

    pub fn guard_window(&self) -> Result<Duration, ConfigError> {
        parse_duration("pool.guard_window", &self.pool.guard_window)
    }

    pub fn default_validity(&self) -> Result<Duration, ConfigError> {
        parse_duration("pool.default_validity", &self.pool.default_validity)
    }

    pub fn command_timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration("query.command_timeout", &self.query.command_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let toml_str = r#"
[backend]
server = "localhost:5432"
database = "sales"
"#;
        let config = GatewayConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.backend.server, "localhost:5432");
        assert_eq!(config.default_database(), Some("sales"));
        assert_eq!(config.target().unwrap(), ServerTarget::OnPrem);
        assert!(config.allow_anonymous());
        assert_eq!(config.guard_window().unwrap(), Duration::from_secs(60));
        assert_eq!(config.default_validity().unwrap(), Duration::from_secs(300));
        assert_eq!(config.command_timeout().unwrap(), Duration::from_secs(120));
        assert_eq!(config.query.result_mode, ResultMode::Streaming);
    }

    #[test]
    fn test_cloud_server_requires_tenant() {
        let toml_str = r#"
[backend]
server = "asazure://westus.asazure.windows.net/srv"
"#;
        let err = GatewayConfig::from_toml_str(toml_str).unwrap_err();
        assert!(err.to_string().contains("tenant_id"));
    }

    #[test]
    fn test_cloud_resource_derivation() {
        let aas = GatewayConfig::for_server("asazure://westus.asazure.windows.net/srv", "db", "t");
        assert_eq!(
            aas.target().unwrap(),
            ServerTarget::Cloud { resource: ASAZURE_RESOURCE.to_string() }
        );
        assert!(!aas.allow_anonymous());

        let pbi = GatewayConfig::for_server("powerbi://api.powerbi.com/v1.0/myorg/ws", "db", "t");
        assert_eq!(
            pbi.target().unwrap(),
            ServerTarget::Cloud { resource: POWERBI_RESOURCE.to_string() }
        );
    }

    #[test]
    fn test_unknown_scheme_rejected() {
        let config = GatewayConfig::for_server("ftp://example.com", "db", "t");
        assert!(matches!(config.validate(), Err(ConfigError::UnknownScheme(s)) if s == "ftp"));
    }

    #[test]
    fn test_explicit_anonymous_overrides_default() {
        let mut config = GatewayConfig::for_server("localhost", "db", "t");
        config.backend.allow_anonymous = Some(false);
        assert!(!config.allow_anonymous());
    }

    #[test]
    fn test_bad_duration_rejected() {
        let toml_str = r#"
[backend]
server = "localhost"

[pool]
guard_window = "soon"
"#;
        let err = GatewayConfig::from_toml_str(toml_str).unwrap_err();
        assert!(err.to_string().contains("pool.guard_window"));
    }

    #[test]
    fn test_buffered_mode_parses() {
        let toml_str = r#"
[backend]
server = "localhost"

[query]
result_mode = "buffered"
"#;
        let config = GatewayConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.query.result_mode, ResultMode::Buffered);
    }
}
