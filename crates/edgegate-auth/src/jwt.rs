//! JWT credentials for edge agents

use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::verifier::{AuthError, CredentialVerifier};

/// JWT claims carried by an edge agent token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeClaims {
    /// Subject (environment identifier)
    pub sub: String,
    /// Issued at (timestamp)
    pub iat: i64,
    /// Expiration time (timestamp)
    pub exp: i64,
    /// Issuer
    pub iss: String,
}

impl EdgeClaims {
    pub fn new(environment_id: impl Into<String>, issuer: impl Into<String>, validity: Duration) -> Self {
        let now = Utc::now();
        Self {
            sub: environment_id.into(),
            iat: now.timestamp(),
            exp: (now + validity).timestamp(),
            iss: issuer.into(),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }
}

/// HS256 verifier: the token's `sub` must name the environment being registered
pub struct JwtCredentialVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtCredentialVerifier {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.validate_nbf = false;
        validation.leeway = 0;

        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    /// Decode and check signature and expiry
    pub fn decode_claims(&self, token: &str) -> Result<EdgeClaims, AuthError> {
        let data = decode::<EdgeClaims>(token, &self.decoding_key, &self.validation).map_err(
            |e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidCredential(e.to_string()),
            },
        )?;

        if data.claims.is_expired() {
            return Err(AuthError::Expired);
        }

        Ok(data.claims)
    }

    /// Mint a token for an agent
    pub fn encode(secret: &[u8], claims: &EdgeClaims) -> Result<String, AuthError> {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret),
        )
        .map_err(|e| AuthError::InvalidCredential(e.to_string()))
    }
}

#[async_trait]
impl CredentialVerifier for JwtCredentialVerifier {
    async fn verify(&self, environment_id: &str, credential: &str) -> Result<(), AuthError> {
        let claims = self.decode_claims(credential)?;

        if claims.sub != environment_id {
            tracing::debug!(
                environment_id = %environment_id,
                issued_for = %claims.sub,
                "Edge token presented for a different environment"
            );
            return Err(AuthError::WrongEnvironment {
                issued_for: claims.sub,
                requested: environment_id.to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"edge-secret";

    #[tokio::test]
    async fn test_valid_token_for_environment() {
        let claims = EdgeClaims::new("E1", "edgegate", Duration::hours(1));
        let token = JwtCredentialVerifier::encode(SECRET, &claims).unwrap();

        let verifier = JwtCredentialVerifier::new(SECRET);
        assert!(verifier.verify("E1", &token).await.is_ok());
    }

    #[tokio::test]
    async fn test_token_for_other_environment_rejected() {
        let claims = EdgeClaims::new("E1", "edgegate", Duration::hours(1));
        let token = JwtCredentialVerifier::encode(SECRET, &claims).unwrap();

        let verifier = JwtCredentialVerifier::new(SECRET);
        let err = verifier.verify("E2", &token).await.unwrap_err();
        assert_eq!(
            err,
            AuthError::WrongEnvironment {
                issued_for: "E1".to_string(),
                requested: "E2".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let claims = EdgeClaims::new("E1", "edgegate", Duration::hours(-2));
        let token = JwtCredentialVerifier::encode(SECRET, &claims).unwrap();

        let verifier = JwtCredentialVerifier::new(SECRET);
        assert_eq!(verifier.verify("E1", &token).await, Err(AuthError::Expired));
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let claims = EdgeClaims::new("E1", "edgegate", Duration::hours(1));
        let token = JwtCredentialVerifier::encode(b"other-secret", &claims).unwrap();

        let verifier = JwtCredentialVerifier::new(SECRET);
        assert!(matches!(
            verifier.verify("E1", &token).await,
            Err(AuthError::InvalidCredential(_))
        ));
    }

    #[tokio::test]
    async fn test_issuer_enforced_when_configured() {
        let claims = EdgeClaims::new("E1", "someone-else", Duration::hours(1));
        let token = JwtCredentialVerifier::encode(SECRET, &claims).unwrap();

        let verifier = JwtCredentialVerifier::new(SECRET).with_issuer("edgegate");
        assert!(verifier.verify("E1", &token).await.is_err());
    }

    #[tokio::test]
    async fn test_garbage_token_rejected() {
        let verifier = JwtCredentialVerifier::new(SECRET);
        assert!(verifier.verify("E1", "not-a-jwt").await.is_err());
    }
}
