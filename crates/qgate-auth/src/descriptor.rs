//! Connection descriptors and the descriptor builder.
//!
//! A [`ConnectionDescriptor`] is the `Key=Value;` connection string handed to
//! the backend. It doubles as the session pool key, so building one must be
//! byte-stable: the same target and effective credential always produce the
//! same string, and different credentials never do.

use std::fmt;
use std::sync::Arc;

use qgate_core::GatewayConfig;
use tracing::debug;
use uuid::Uuid;

use crate::credential::Credential;
use crate::error::{AuthError, AuthResult};
use crate::token::TokenIssuer;

pub const DATA_SOURCE: &str = "Data Source";
pub const CATALOG: &str = "Catalog";
pub const USER_ID: &str = "User Id";
pub const PASSWORD: &str = "Password";

/// Backend connection string, also used as the session pool key.
///
/// `Display` and `Debug` mask every `Password` value; use [`as_str`](Self::as_str)
/// only when handing the descriptor to the backend.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConnectionDescriptor(String);

impl ConnectionDescriptor {
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Look up a field by key, case-insensitively.
    pub fn field(&self, key: &str) -> Option<String> {
        parse_pairs(&self.0)
            .into_iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    /// The descriptor with password values replaced by `********`.
    pub fn redacted(&self) -> String {
        let mut out = String::with_capacity(self.0.len());
        for (key, value) in parse_pairs(&self.0) {
            out.push_str(&key);
            out.push('=');
            if key.eq_ignore_ascii_case(PASSWORD) || key.eq_ignore_ascii_case("pwd") {
                out.push_str("********");
            } else {
                out.push_str(&quote_value(&value));
            }
            out.push(';');
        }
        out
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionDescriptor")
            .field(&self.redacted())
            .finish()
    }
}

/// Quote a value if it contains characters that would break `Key=Value;` parsing.
fn quote_value(value: &str) -> String {
    let needs_quotes = value.contains(';')
        || value.starts_with('"')
        || value.starts_with(char::is_whitespace)
        || value.ends_with(char::is_whitespace);
    if needs_quotes {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Split `Key=Value;` pairs, honoring double-quoted values with `""` escapes.
fn parse_pairs(raw: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut chars = raw.chars().peekable();

    loop {
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            chars.next();
            if c == '=' {
                break;
            }
            key.push(c);
        }
        let key = key.trim().to_string();

        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                if c == '"' {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        value.push('"');
                    } else {
                        break;
                    }
                } else {
                    value.push(c);
                }
            }
            // Skip to the separator.
            for c in chars.by_ref() {
                if c == ';' {
                    break;
                }
            }
        } else {
            for c in chars.by_ref() {
                if c == ';' {
                    break;
                }
                value.push(c);
            }
            value = value.trim().to_string();
        }

        if !key.is_empty() {
            pairs.push((key, value));
        }
        if chars.peek().is_none() {
            break;
        }
    }
    pairs
}

fn push_field(out: &mut String, key: &str, value: &str) {
    out.push_str(key);
    out.push('=');
    out.push_str(&quote_value(value));
    out.push(';');
}

// ── Principal classification ────────────────────────────────────

/// What a Basic principal names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrincipalKind {
    /// A bare client id; the configured tenant issues its token.
    ServicePrincipal { client_id: String },
    /// `client_id@tenant_id`, optionally prefixed with `app:`.
    TenantServicePrincipal { client_id: String, tenant_id: String },
    /// Anything else; passed through to the backend as user name and password.
    User(String),
}

impl PrincipalKind {
    /// Classify a principal. Attempts run in order and the first match wins.
    pub fn classify(principal: &str) -> Self {
        parse_service_principal(principal)
            .or_else(|| parse_tenant_service_principal(principal))
            .unwrap_or_else(|| PrincipalKind::User(principal.to_string()))
    }
}

fn parse_uuid(s: &str) -> Option<String> {
    Uuid::parse_str(s.trim()).ok().map(|u| u.to_string())
}

fn parse_service_principal(principal: &str) -> Option<PrincipalKind> {
    parse_uuid(principal).map(|client_id| PrincipalKind::ServicePrincipal { client_id })
}

fn parse_tenant_service_principal(principal: &str) -> Option<PrincipalKind> {
    let principal = principal.strip_prefix("app:").unwrap_or(principal);
    let (client, tenant) = principal.split_once('@')?;
    Some(PrincipalKind::TenantServicePrincipal {
        client_id: parse_uuid(client)?,
        tenant_id: parse_uuid(tenant)?,
    })
}

// ── Builder ─────────────────────────────────────────────────────

/// Turns a credential and a target database into a [`ConnectionDescriptor`].
pub struct DescriptorBuilder {
    server: String,
    tenant_id: Option<String>,
    allow_anonymous: bool,
    issuer: Arc<dyn TokenIssuer>,
}

impl DescriptorBuilder {
    pub fn new(
        server: &str,
        tenant_id: Option<&str>,
        allow_anonymous: bool,
        issuer: Arc<dyn TokenIssuer>,
    ) -> Self {
        Self {
            server: server.to_string(),
            tenant_id: tenant_id.map(str::to_string),
            allow_anonymous,
            issuer,
        }
    }

    pub fn from_config(config: &GatewayConfig, issuer: Arc<dyn TokenIssuer>) -> Self {
        Self::new(
            &config.backend.server,
            config.tenant_id(),
            config.allow_anonymous(),
            issuer,
        )
    }

    pub fn allows_anonymous(&self) -> bool {
        self.allow_anonymous
    }

    /// Build the descriptor for `credential` against `database`.
    ///
    /// Service principals trigger one token exchange (served from cache when
    /// the issuer caches). Exchange failures are returned, not retried.
    pub async fn build(
        &self,
        credential: &Credential,
        database: &str,
    ) -> AuthResult<ConnectionDescriptor> {
        let mut out = String::new();
        push_field(&mut out, DATA_SOURCE, &self.server);

        match credential {
            Credential::None => {
                if !self.allow_anonymous {
                    return Err(AuthError::AnonymousNotAllowed);
                }
                push_field(&mut out, CATALOG, database);
            }
            Credential::Basic { principal, secret } => match PrincipalKind::classify(principal) {
                PrincipalKind::ServicePrincipal { client_id } => {
                    let tenant_id = self
                        .tenant_id
                        .as_deref()
                        .ok_or_else(|| AuthError::MissingTenant(client_id.clone()))?;
                    let token = self.issuer.exchange(&client_id, secret, tenant_id).await?;
                    debug!(client_id = %client_id, tenant_id, "service principal token obtained");
                    push_field(&mut out, PASSWORD, &token);
                    push_field(&mut out, CATALOG, database);
                }
                PrincipalKind::TenantServicePrincipal {
                    client_id,
                    tenant_id,
                } => {
                    let token = self.issuer.exchange(&client_id, secret, &tenant_id).await?;
                    debug!(client_id = %client_id, tenant_id = %tenant_id, "service principal token obtained");
                    push_field(&mut out, PASSWORD, &token);
                    push_field(&mut out, CATALOG, database);
                }
                PrincipalKind::User(user) => {
                    push_field(&mut out, USER_ID, &user);
                    push_field(&mut out, PASSWORD, secret);
                    push_field(&mut out, CATALOG, database);
                }
            },
            Credential::Bearer { token } => {
                push_field(&mut out, PASSWORD, token);
                push_field(&mut out, CATALOG, database);
                push_field(&mut out, "Persist Security Info", "True");
                push_field(&mut out, "Impersonation Level", "Impersonate");
            }
        }

        Ok(ConnectionDescriptor(out))
    }
}
