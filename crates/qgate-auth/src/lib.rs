//! qgate-auth — who is calling, and how the backend should see them.
//!
//! # Components
//!
//! - **`credential`** — `Authorization` header → [`Credential`]
//! - **`descriptor`** — [`Credential`] + target → [`ConnectionDescriptor`]
//! - **`token`** — JWT expiry decoding and service-principal token exchange

pub mod credential;
pub mod descriptor;
pub mod error;
pub mod token;

pub use credential::Credential;
pub use descriptor::{ConnectionDescriptor, DescriptorBuilder, PrincipalKind};
pub use error::{AuthError, AuthResult};
pub use token::{AadTokenIssuer, CachingTokenIssuer, TokenIssuer, decode_expiry};
