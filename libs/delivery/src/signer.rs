use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// `base64(HMAC-SHA256(secret, body))`, carried in `X-Webhook-Signature`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(body);
    B64.encode(mac.finalize().into_bytes())
}

/// Verification counterpart, for consumers and tests.
pub fn verify(secret: &str, body: &[u8], signature: &str) -> bool {
    let Ok(provided) = B64.decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify() {
        let body = br#"{"event":"new_message"}"#;
        let signature = sign("secret", body);
        assert!(verify("secret", body, &signature));
    }

    #[test]
    fn wrong_secret_fails() {
        let body = b"payload";
        let signature = sign("one", body);
        assert!(!verify("two", body, &signature));
    }

    #[test]
    fn tampered_body_fails() {
        let signature = sign("secret", b"payload");
        assert!(!verify("secret", b"payload!", &signature));
    }

    #[test]
    fn garbage_signature_fails() {
        assert!(!verify("secret", b"payload", "not base64 !!"));
    }
}
