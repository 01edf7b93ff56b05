use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use botgate_core::GatewayError;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Default literal prefix carried by every issued key.
pub const DEFAULT_KEY_PREFIX: &str = "bgk_";

/// Parses and hashes opaque API keys. The stored side keeps only the hex
/// SHA-256 of the full presented string.
#[derive(Debug, Clone)]
pub struct ApiKeyCodec {
    prefix: String,
}

impl ApiKeyCodec {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Checks the configured prefix and that the remainder decodes as
    /// URL-safe base64.
    pub fn validate_format(&self, raw: &str) -> Result<(), GatewayError> {
        let rest = raw
            .strip_prefix(&self.prefix)
            .ok_or_else(|| GatewayError::unauthenticated("api key prefix mismatch"))?;
        if rest.is_empty() {
            return Err(GatewayError::unauthenticated("empty api key"));
        }
        URL_SAFE_NO_PAD
            .decode(rest)
            .map_err(|_| GatewayError::unauthenticated("malformed api key"))?;
        Ok(())
    }

    /// Mints a fresh key string. Only the caller ever sees it; stores get
    /// [`hash_key`] of it.
    pub fn generate(&self) -> String {
        let mut buf = [0u8; 24];
        rand::rng().fill_bytes(&mut buf);
        format!("{}{}", self.prefix, URL_SAFE_NO_PAD.encode(buf))
    }
}

/// Deterministic digest used to locate and verify stored keys.
pub fn hash_key(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// Constant-time digest comparison; the lookup already matched, this keeps
/// the final check timing-independent.
pub fn hashes_match(presented: &str, stored: &str) -> bool {
    presented.as_bytes().ct_eq(stored.as_bytes()).into()
}
