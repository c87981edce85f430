//! `Authorization` header parsing.
//!
//! Resolution is pure: no network or database access, and the same header
//! always resolves to the same [`Credential`].

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// A normalized request credential.
///
/// `Debug` never prints the secret or the token.
#[derive(Clone, PartialEq, Eq, Default)]
pub enum Credential {
    /// No usable `Authorization` header.
    #[default]
    None,
    /// HTTP Basic; `principal` may be `domain:user` for domain-qualified identities.
    Basic { principal: String, secret: String },
    /// HTTP Bearer with an opaque (usually JWT) access token.
    Bearer { token: String },
}

impl Credential {
    /// Resolve a raw `Authorization` header value.
    ///
    /// Unknown schemes, malformed base64, and Basic payloads that do not split
    /// into `user:secret` or `domain:user:secret` all resolve to [`Credential::None`].
    pub fn resolve(header: Option<&str>) -> Self {
        let Some(header) = header else {
            return Credential::None;
        };

        let (scheme, parameter) = match header.trim().split_once(char::is_whitespace) {
            Some((scheme, parameter)) => (scheme, parameter.trim()),
            None => return Credential::None,
        };
        if parameter.is_empty() {
            return Credential::None;
        }

        if scheme.eq_ignore_ascii_case("bearer") {
            Credential::Bearer {
                token: parameter.to_string(),
            }
        } else if scheme.eq_ignore_ascii_case("basic") {
            decode_basic(parameter).unwrap_or(Credential::None)
        } else {
            Credential::None
        }
    }

    /// Lowercase scheme name, safe to log.
    pub fn scheme(&self) -> &'static str {
        match self {
            Credential::None => "none",
            Credential::Basic { .. } => "basic",
            Credential::Bearer { .. } => "bearer",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Credential::None)
    }

    /// The bearer token, if this is a bearer credential.
    pub fn bearer_token(&self) -> Option<&str> {
        match self {
            Credential::Bearer { token } => Some(token),
            _ => None,
        }
    }
}

fn decode_basic(parameter: &str) -> Option<Credential> {
    let bytes = STANDARD.decode(parameter).ok()?;
    let decoded = String::from_utf8(bytes).ok()?;
    let parts: Vec<&str> = decoded.split(':').collect();
    match parts.as_slice() {
        [user, secret] => Some(Credential::Basic {
            principal: (*user).to_string(),
            secret: (*secret).to_string(),
        }),
        [domain, user, secret] => Some(Credential::Basic {
            principal: format!("{domain}:{user}"),
            secret: (*secret).to_string(),
        }),
        _ => None,
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::None => f.write_str("None"),
            Credential::Basic { principal, .. } => f
                .debug_struct("Basic")
                .field("principal", principal)
                .field("secret", &"********")
                .finish(),
            Credential::Bearer { .. } => f
                .debug_struct("Bearer")
                .field("token", &"********")
                .finish(),
        }
    }
}
