//! Bearer-token validation for relay links.
//!
//! The token is a signed HS256 claim presented as the `token` query
//! parameter at link establishment. Its `clientId` claim names the PeerId
//! the link is authorized to use.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use signal_proto::PeerId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,
    #[error("token rejected: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("token carries no clientId")]
    MissingClientId,
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(rename = "clientId", default)]
    client_id: String,
    #[allow(dead_code)]
    exp: u64,
}

/// Validate `token` against the shared secret and return the PeerId it
/// authorizes.
pub fn authenticate(token: &str, secret: &str) -> Result<PeerId, AuthError> {
    if token.is_empty() {
        return Err(AuthError::MissingToken);
    }
    let key = DecodingKey::from_secret(secret.as_bytes());
    let validation = Validation::new(Algorithm::HS256);
    let data = decode::<Claims>(token, &key, &validation)?;
    if data.claims.client_id.is_empty() {
        return Err(AuthError::MissingClientId);
    }
    Ok(PeerId::from(data.claims.client_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &str = "test-secret";

    #[derive(Serialize)]
    struct TestClaims<'a> {
        #[serde(rename = "clientId", skip_serializing_if = "Option::is_none")]
        client_id: Option<&'a str>,
        exp: u64,
    }

    fn mint(client_id: Option<&str>, exp_offset_secs: i64, secret: &str) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        let claims = TestClaims {
            client_id,
            exp: (now + exp_offset_secs).max(0) as u64,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_yields_client_id() {
        let token = mint(Some("vehicle-1"), 3600, SECRET);
        assert_eq!(
            authenticate(&token, SECRET).unwrap(),
            PeerId::from("vehicle-1")
        );
    }

    #[test]
    fn expired_token_is_rejected() {
        let token = mint(Some("vehicle-1"), -3600, SECRET);
        assert!(matches!(
            authenticate(&token, SECRET),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = mint(Some("vehicle-1"), 3600, "other-secret");
        assert!(matches!(
            authenticate(&token, SECRET),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn missing_client_id_is_rejected() {
        let token = mint(None, 3600, SECRET);
        assert!(matches!(
            authenticate(&token, SECRET),
            Err(AuthError::MissingClientId)
        ));
    }

    #[test]
    fn empty_token_is_rejected() {
        assert!(matches!(
            authenticate("", SECRET),
            Err(AuthError::MissingToken)
        ));
    }
}
