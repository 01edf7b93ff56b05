use botgate_core::GatewayError;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

/// Claims carried by a bearer token. Only the identity fields reach the
/// rest of the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    /// User id.
    pub sub: i64,
    pub username: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub exp: i64,
    pub iat: i64,
}

impl AccessClaims {
    pub fn new(user_id: i64, username: impl Into<String>, roles: Vec<String>, ttl: Duration) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            sub: user_id,
            username: username.into(),
            roles,
            iat: now.unix_timestamp(),
            exp: (now + ttl).unix_timestamp(),
        }
    }
}

/// Verifies HS256 bearer tokens with a single symmetric key. The algorithm
/// is pinned: tokens whose header claims anything else fail verification.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn hs256(secret: impl AsRef<[u8]>) -> Self {
        let validation = Validation::new(Algorithm::HS256);
        Self {
            key: DecodingKey::from_secret(secret.as_ref()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<AccessClaims, GatewayError> {
        decode::<AccessClaims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|err| GatewayError::unauthenticated(format!("invalid bearer token: {err}")))
    }
}

/// Token minting counterpart, used by tests and the admin tooling.
#[derive(Clone)]
pub struct TokenSigner {
    key: EncodingKey,
}

impl TokenSigner {
    pub fn hs256(secret: impl AsRef<[u8]>) -> Self {
        Self {
            key: EncodingKey::from_secret(secret.as_ref()),
        }
    }

    pub fn sign(&self, claims: &AccessClaims) -> Result<String, GatewayError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.key)
            .map_err(|err| GatewayError::Internal(anyhow::Error::new(err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let signer = TokenSigner::hs256("top-secret");
        let verifier = TokenVerifier::hs256("top-secret");
        let claims = AccessClaims::new(7, "alice", vec!["admin".into()], Duration::minutes(5));
        let token = signer.sign(&claims).expect("sign");
        let verified = verifier.verify(&token).expect("verify");
        assert_eq!(verified.sub, 7);
        assert_eq!(verified.username, "alice");
        assert_eq!(verified.roles, vec!["admin".to_string()]);
    }

    #[test]
    fn wrong_key_is_rejected() {
        let signer = TokenSigner::hs256("one");
        let verifier = TokenVerifier::hs256("two");
        let claims = AccessClaims::new(1, "bob", Vec::new(), Duration::minutes(5));
        let token = signer.sign(&claims).expect("sign");
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let signer = TokenSigner::hs256("k");
        let verifier = TokenVerifier::hs256("k");
        let claims = AccessClaims::new(1, "bob", Vec::new(), Duration::minutes(-10));
        let token = signer.sign(&claims).expect("sign");
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn foreign_algorithm_is_rejected() {
        // An unsigned token (`alg: none`) must never pass the HS256 pin.
        let header = r#"{"alg":"none","typ":"JWT"}"#;
        let claims = r#"{"sub":1,"username":"bob","roles":[],"exp":4102444800,"iat":0}"#;
        use base64::Engine as _;
        let b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let token = format!("{}.{}.", b64.encode(header), b64.encode(claims));
        let verifier = TokenVerifier::hs256("k");
        assert!(verifier.verify(&token).is_err());
    }
}
