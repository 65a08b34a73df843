//! Credential verifier trait and the static-key implementation

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

/// Authentication errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("Credential expired")]
    Expired,

    #[error("Credential issued for environment '{issued_for}', not '{requested}'")]
    WrongEnvironment {
        issued_for: String,
        requested: String,
    },

    #[error("No credential registered for environment '{0}'")]
    UnknownEnvironment(String),
}

/// Verifies the credential an agent presents for an environment
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// Returns `Ok(())` if `credential` authorises a tunnel for `environment_id`
    async fn verify(&self, environment_id: &str, credential: &str) -> Result<(), AuthError>;
}

/// Verifier backed by a fixed key per environment
///
/// Only SHA-256 digests of the keys are kept in memory and comparisons run
/// over the full digest.
#[derive(Debug, Default)]
pub struct StaticCredentialVerifier {
    keys: RwLock<HashMap<String, [u8; 32]>>,
}

impl StaticCredentialVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(self, environment_id: impl Into<String>, key: &str) -> Self {
        self.set_key(environment_id, key);
        self
    }

    /// Register or replace the key for an environment
    pub fn set_key(&self, environment_id: impl Into<String>, key: &str) {
        if let Ok(mut keys) = self.keys.write() {
            keys.insert(environment_id.into(), digest(key));
        }
    }

    /// Forget the key for an environment
    pub fn remove_key(&self, environment_id: &str) {
        if let Ok(mut keys) = self.keys.write() {
            keys.remove(environment_id);
        }
    }
}

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

fn digests_match(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[async_trait]
impl CredentialVerifier for StaticCredentialVerifier {
    async fn verify(&self, environment_id: &str, credential: &str) -> Result<(), AuthError> {
        let expected = self
            .keys
            .read()
            .map_err(|_| AuthError::InvalidCredential("key table unavailable".to_string()))?
            .get(environment_id)
            .copied()
            .ok_or_else(|| AuthError::UnknownEnvironment(environment_id.to_string()))?;

        if digests_match(&expected, &digest(credential)) {
            Ok(())
        } else {
            Err(AuthError::InvalidCredential("key mismatch".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_key_accepts_match() {
        let verifier = StaticCredentialVerifier::new().with_key("E1", "edge-key");
        assert!(verifier.verify("E1", "edge-key").await.is_ok());
    }

    #[tokio::test]
    async fn test_static_key_rejects_mismatch() {
        let verifier = StaticCredentialVerifier::new().with_key("E1", "edge-key");
        assert!(matches!(
            verifier.verify("E1", "other").await,
            Err(AuthError::InvalidCredential(_))
        ));
    }

    #[tokio::test]
    async fn test_static_key_is_scoped_to_environment() {
        let verifier = StaticCredentialVerifier::new()
            .with_key("E1", "edge-key")
            .with_key("E2", "second-key");

        assert!(verifier.verify("E2", "edge-key").await.is_err());
        assert_eq!(
            verifier.verify("E3", "edge-key").await,
            Err(AuthError::UnknownEnvironment("E3".to_string()))
        );
    }

    #[tokio::test]
    async fn test_removed_key_no_longer_verifies() {
        let verifier = StaticCredentialVerifier::new().with_key("E1", "edge-key");
        verifier.remove_key("E1");
        assert!(verifier.verify("E1", "edge-key").await.is_err());
    }
}
