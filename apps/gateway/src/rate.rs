use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Instant,
};

use axum::{
    body::Body,
    http::{HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use botgate_core::{GatewayError, Principal};

use crate::error::ApiError;

/// Per-principal token bucket. The check-and-decrement runs under one lock
/// guard, so concurrent requests cannot both pass on the last token.
#[derive(Clone)]
pub struct PrincipalRateLimiter {
    buckets: Arc<Mutex<HashMap<(&'static str, i64), Bucket>>>,
    capacity: u32,
    refill_per_sec: u32,
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

pub struct Decision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_secs: u64,
}

impl PrincipalRateLimiter {
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            capacity,
            refill_per_sec,
        }
    }

    pub fn check(&self, principal: &Principal) -> Decision {
        let key = (principal.kind(), principal.id());
        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");
        let bucket = buckets.entry(key).or_insert(Bucket {
            tokens: self.capacity as f64,
            last: Instant::now(),
        });

        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        if elapsed > 0.0 {
            bucket.tokens =
                (bucket.tokens + elapsed * self.refill_per_sec as f64).min(self.capacity as f64);
            bucket.last = now;
        }

        let allowed = bucket.tokens >= 1.0;
        if allowed {
            bucket.tokens -= 1.0;
        }
        let refill = (self.refill_per_sec as f64).max(0.1);
        let reset_secs = ((self.capacity as f64 - bucket.tokens) / refill).ceil() as u64;
        Decision {
            allowed,
            limit: self.capacity,
            remaining: bucket.tokens.floor().max(0.0) as u32,
            reset_secs,
        }
    }
}

/// Applies the limiter to authenticated requests and stamps the
/// `X-RateLimit-*` headers either way.
pub async fn rate_limit(req: Request<Body>, next: Next) -> Response {
    let Some(limiter) = req.extensions().get::<PrincipalRateLimiter>().cloned() else {
        return next.run(req).await;
    };
    let Some(principal) = req.extensions().get::<Principal>().cloned() else {
        return next.run(req).await;
    };

    let decision = limiter.check(&principal);
    if !decision.allowed {
        metrics::counter!("rate_limit_rejections_total", "kind" => principal.kind())
            .increment(1);
        let mut response = ApiError(GatewayError::RateLimited {
            retry_after_secs: decision.reset_secs.max(1),
        })
        .into_response();
        stamp_headers(&mut response, &decision);
        return response;
    }

    let mut response = next.run(req).await;
    stamp_headers(&mut response, &decision);
    response
}

fn stamp_headers(response: &mut Response, decision: &Decision) {
    let headers = response.headers_mut();
    for (name, value) in [
        ("x-ratelimit-limit", decision.limit as u64),
        ("x-ratelimit-remaining", decision.remaining as u64),
        ("x-ratelimit-reset", decision.reset_secs),
    ] {
        if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
            headers.insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: i64) -> Principal {
        Principal::User {
            id,
            username: "alice".into(),
            roles: Vec::new(),
        }
    }

    #[test]
    fn burst_is_bounded_by_capacity() {
        let limiter = PrincipalRateLimiter::new(2, 0);
        assert!(limiter.check(&user(1)).allowed);
        assert!(limiter.check(&user(1)).allowed);
        let third = limiter.check(&user(1));
        assert!(!third.allowed);
        assert_eq!(third.remaining, 0);
    }

    #[test]
    fn principals_have_independent_buckets() {
        let limiter = PrincipalRateLimiter::new(1, 0);
        assert!(limiter.check(&user(1)).allowed);
        assert!(limiter.check(&user(2)).allowed);
        assert!(limiter.check(&Principal::Key { id: 1 }).allowed);
        assert!(!limiter.check(&user(1)).allowed);
    }

    #[test]
    fn tokens_refill_over_time() {
        let limiter = PrincipalRateLimiter::new(1, 50);
        assert!(limiter.check(&user(1)).allowed);
        assert!(!limiter.check(&user(1)).allowed);
        std::thread::sleep(std::time::Duration::from_millis(40));
        assert!(limiter.check(&user(1)).allowed);
    }
}
