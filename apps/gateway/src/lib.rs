//! Gateway service wiring: state assembly and the axum router. The binary
//! lives in `main.rs`; tests drive the router through `tower::ServiceExt`.

pub mod config;
mod error;
#[cfg(feature = "grpc")]
pub mod grpc;
mod ingest;
mod messages;
mod rate;
mod reqid;
mod webhooks;
mod ws;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Extension, Router,
};
use botgate_auth::{authenticate, AclEvaluator, ApiKeyCodec, Authenticator, TokenVerifier};
use botgate_broker::Broker;
use botgate_bus::{
    InMemoryEventBus, InMemoryJobQueue, InMemoryKvStore, SharedEventBus, SharedJobQueue,
    SharedKvStore,
};
use botgate_hub::Hub;
use botgate_store::{MemoryStore, SharedStore};

pub use rate::PrincipalRateLimiter;

#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub hub: Arc<Hub>,
    pub queue: SharedJobQueue,
    pub acl: AclEvaluator,
    pub authenticator: Arc<Authenticator>,
    pub limiter: PrincipalRateLimiter,
}

impl AppState {
    /// Wires the service from its capability implementations.
    pub fn assemble(
        store: SharedStore,
        bus: SharedEventBus,
        kv: SharedKvStore,
        queue: SharedJobQueue,
        jwt_secret: &str,
        api_key_prefix: &str,
        limiter: PrincipalRateLimiter,
    ) -> Self {
        let acl = AclEvaluator::new(Arc::clone(&store), kv);
        let (broker, tap) = Broker::new(bus);
        let hub = Hub::new(broker, tap, acl.clone());
        let authenticator = Arc::new(Authenticator::new(
            TokenVerifier::hs256(jwt_secret),
            ApiKeyCodec::new(api_key_prefix),
            Arc::clone(&store),
        ));
        Self {
            store,
            hub,
            queue,
            acl,
            authenticator,
            limiter,
        }
    }

    /// Everything in-process: memory store, broadcast bus, channel queue.
    /// The default for single-instance dev runs and the test suites.
    pub fn in_process(jwt_secret: &str) -> Self {
        Self::assemble(
            Arc::new(MemoryStore::new()),
            Arc::new(InMemoryEventBus::new()),
            Arc::new(InMemoryKvStore::new()),
            Arc::new(InMemoryJobQueue::new()),
            jwt_secret,
            botgate_auth::DEFAULT_KEY_PREFIX,
            PrincipalRateLimiter::new(60, 1),
        )
    }
}

/// Builds the full `/api/v1` surface. The ingest route authenticates by
/// path secret and stays outside the client middleware stack.
pub fn build_router(state: AppState) -> Router {
    let client_api = Router::new()
        .route(
            "/chats/{id}/messages",
            get(messages::list_messages).post(messages::send_message),
        )
        .route(
            "/webhooks",
            get(webhooks::list_webhooks).post(webhooks::create_webhook),
        )
        .route(
            "/webhooks/{id}",
            get(webhooks::get_webhook).delete(webhooks::delete_webhook),
        )
        .route("/ws", get(ws::ws_handler))
        .layer(middleware::from_fn(rate::rate_limit))
        .layer(middleware::from_fn(authenticate))
        .layer(Extension(Arc::clone(&state.authenticator)))
        .layer(Extension(state.limiter.clone()));

    Router::new()
        .route(
            "/api/v1/telegram/webhook/{secret}",
            post(ingest::telegram_webhook),
        )
        .nest("/api/v1", client_api)
        .layer(middleware::from_fn(reqid::with_request_id))
        .with_state(state)
}
