//! Credential resolution and chat-level authorization.
//!
//! Requests authenticate with either a signed bearer token or an opaque API
//! key; both resolve to a [`botgate_core::Principal`] placed in the request
//! extensions. The [`AclEvaluator`] answers `(principal, chat, action)`
//! questions against the store with a short-TTL cache in front.

mod acl;
mod apikey;
mod middleware;
mod token;

pub use acl::AclEvaluator;
pub use apikey::{hash_key, hashes_match, ApiKeyCodec, DEFAULT_KEY_PREFIX};
pub use middleware::{authenticate, Authenticator, OptionalAuth, RequireAuth};
pub use token::{AccessClaims, TokenSigner, TokenVerifier};
