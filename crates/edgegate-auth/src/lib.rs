//! Credential verification for edge agents
//!
//! The tunnel server treats verification as an external capability behind the
//! [`CredentialVerifier`] trait. Two implementations ship with the crate:
//! HS256 JWTs scoped to one environment, and static per-environment keys.

pub mod jwt;
pub mod verifier;

pub use jwt::{EdgeClaims, JwtCredentialVerifier};
pub use verifier::{AuthError, CredentialVerifier, StaticCredentialVerifier};
