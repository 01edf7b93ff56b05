use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap, Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use botgate_core::{GatewayError, Principal};
use botgate_store::{GatewayStore as _, SharedStore};
use time::OffsetDateTime;

use crate::apikey::{hash_key, hashes_match, ApiKeyCodec};
use crate::token::TokenVerifier;

/// Largest form body the resolver will buffer looking for credentials.
const FORM_BODY_LIMIT: usize = 256 * 1024;

/// Resolves a request credential into a [`Principal`].
#[derive(Clone)]
pub struct Authenticator {
    verifier: TokenVerifier,
    codec: ApiKeyCodec,
    store: SharedStore,
}

#[derive(Debug, PartialEq, Eq)]
enum Credential {
    Bearer(String),
    Key(String),
}

impl Authenticator {
    pub fn new(verifier: TokenVerifier, codec: ApiKeyCodec, store: SharedStore) -> Self {
        Self {
            verifier,
            codec,
            store,
        }
    }

    async fn resolve(&self, credential: Credential) -> Result<Principal, GatewayError> {
        match credential {
            Credential::Bearer(token) => self.resolve_bearer(&token),
            Credential::Key(raw) => self.resolve_api_key(&raw).await,
        }
    }

    /// Verifies a bearer token into a user principal.
    pub fn resolve_bearer(&self, token: &str) -> Result<Principal, GatewayError> {
        let claims = self.verifier.verify(token)?;
        Ok(Principal::User {
            id: claims.sub,
            username: claims.username,
            roles: claims.roles,
        })
    }

    /// Resolves a presented opaque key into a key principal.
    pub async fn resolve_api_key(&self, raw: &str) -> Result<Principal, GatewayError> {
        self.codec.validate_format(raw)?;
        let digest = hash_key(raw);
        let record = self
            .store
            .api_key_by_hash(&digest)
            .await
            .map_err(|e| GatewayError::Internal(anyhow::Error::new(e)))?
            .ok_or_else(|| GatewayError::unauthenticated("unknown api key"))?;
        if !hashes_match(&digest, &record.key_hash) {
            return Err(GatewayError::unauthenticated("api key mismatch"));
        }
        if !record.active {
            return Err(GatewayError::unauthenticated("api key disabled"));
        }
        if let Some(expires) = record.expires_at {
            if expires <= OffsetDateTime::now_utc() {
                return Err(GatewayError::unauthenticated("api key expired"));
            }
        }
        let store = Arc::clone(&self.store);
        let key_id = record.id;
        // Last-used bump must neither block nor fail the request.
        tokio::spawn(async move {
            if let Err(err) = store.touch_api_key(key_id, OffsetDateTime::now_utc()).await {
                tracing::debug!(key_id, error = %err, "failed to bump api key last_used");
            }
        });
        Ok(Principal::Key { id: record.id })
    }
}

fn credential_from_parts(headers: &HeaderMap, query: Option<&str>) -> Option<Credential> {
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        let token = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty());
        if let Some(token) = token {
            return Some(Credential::Bearer(token.to_string()));
        }
    }
    if let Some(value) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        let value = value.trim();
        if !value.is_empty() {
            return Some(Credential::Key(value.to_string()));
        }
    }
    query.and_then(|q| credential_from_pairs(url::form_urlencoded::parse(q.as_bytes())))
}

fn credential_from_pairs<'a>(
    pairs: impl Iterator<Item = (std::borrow::Cow<'a, str>, std::borrow::Cow<'a, str>)>,
) -> Option<Credential> {
    let mut api_key = None;
    let mut token = None;
    for (name, value) in pairs {
        let value = value.trim().to_string();
        if value.is_empty() {
            continue;
        }
        match name.as_ref() {
            "api_key" if api_key.is_none() => api_key = Some(value),
            "token" if token.is_none() => token = Some(value),
            _ => {}
        }
    }
    api_key
        .map(Credential::Key)
        .or(token.map(Credential::Bearer))
}

fn is_form_content(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"))
}

/// Extracts a credential in fixed precedence (bearer header, key header,
/// query, POST form) and resolves it. Requests without any credential pass
/// through with no principal; `RequireAuth` decides per route.
pub async fn authenticate(req: Request<Body>, next: Next) -> Response {
    let Some(auth) = req.extensions().get::<Arc<Authenticator>>().cloned() else {
        return next.run(req).await;
    };

    let mut credential = credential_from_parts(req.headers(), req.uri().query());
    let mut req = req;
    if credential.is_none() && req.method() == Method::POST && is_form_content(req.headers()) {
        let (parts, body) = req.into_parts();
        let bytes = match to_bytes(body, FORM_BODY_LIMIT).await {
            Ok(bytes) => bytes,
            Err(_) => return StatusCode::BAD_REQUEST.into_response(),
        };
        credential = credential_from_pairs(url::form_urlencoded::parse(&bytes));
        req = Request::from_parts(parts, Body::from(bytes));
    }

    if let Some(credential) = credential {
        match auth.resolve(credential).await {
            Ok(principal) => {
                metrics::counter!("auth_resolved_total", "kind" => principal.kind()).increment(1);
                req.extensions_mut().insert(principal);
            }
            Err(GatewayError::Internal(err)) => {
                tracing::error!(error = %err, "credential lookup failed");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
            Err(err) => {
                tracing::debug!(error = %err, "credential rejected");
                return StatusCode::UNAUTHORIZED.into_response();
            }
        }
    }

    next.run(req).await
}

/// Rejects requests without a resolved principal.
pub struct RequireAuth(pub Principal);

impl<S> FromRequestParts<S> for RequireAuth
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        std::future::ready(
            parts
                .extensions
                .get::<Principal>()
                .cloned()
                .map(RequireAuth)
                .ok_or(StatusCode::UNAUTHORIZED),
        )
    }
}

/// Records the principal when present, proceeds with none otherwise.
pub struct OptionalAuth(pub Option<Principal>);

impl<S> FromRequestParts<S> for OptionalAuth
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        std::future::ready(Ok(OptionalAuth(
            parts.extensions.get::<Principal>().cloned(),
        )))
    }
}
