//! Shared gateway types.

use serde::{Deserialize, Serialize};

/// How the result writer moves serialized rows to the response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultMode {
    /// Rows are written to the response as they are read (bounded memory).
    #[default]
    Streaming,
    /// Rows are serialized into memory first, then copied to the response.
    /// Memory grows with the result size; intended for diagnostics.
    Buffered,
}

/// What kind of deployment the configured server points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerTarget {
    /// A cloud endpoint that accepts Azure AD tokens for `resource`.
    Cloud { resource: String },
    /// An on-prem server reached by host name.
    OnPrem,
}

impl ServerTarget {
    pub fn is_cloud(&self) -> bool {
        matches!(self, ServerTarget::Cloud { .. })
    }

    pub fn resource(&self) -> Option<&str> {
        match self {
            ServerTarget::Cloud { resource } => Some(resource),
            ServerTarget::OnPrem => None,
        }
    }
}
