use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
    time::{Duration, Instant},
};

use metrics::counter;
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
enum State {
    Closed { consecutive_failures: u32 },
    Open { last_failure: Instant },
    HalfOpen,
}

/// Per-destination failure accounting. Non-blocking: a denied request is
/// the caller's cue to reschedule, never to wait here.
pub struct CircuitBreaker {
    state: State,
    settings: BreakerSettings,
    url: String,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings, url: impl Into<String>) -> Self {
        Self {
            state: State::Closed {
                consecutive_failures: 0,
            },
            settings,
            url: url.into(),
        }
    }

    /// Admits the request or rejects it. An open breaker past the reset
    /// timeout admits exactly one half-open probe.
    pub fn try_acquire(&mut self) -> bool {
        match self.state {
            State::Closed { .. } => true,
            State::HalfOpen => false,
            State::Open { last_failure } => {
                if last_failure.elapsed() >= self.settings.reset_timeout {
                    info!(url = %self.url, "circuit breaker half-open probe");
                    self.state = State::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn on_success(&mut self) {
        if !matches!(
            self.state,
            State::Closed {
                consecutive_failures: 0
            }
        ) {
            counter!("delivery_circuit_events_total", "state" => "closed").increment(1);
        }
        self.state = State::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn on_failure(&mut self) {
        match self.state {
            State::Closed {
                ref mut consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.settings.failure_threshold {
                    self.open();
                }
            }
            State::HalfOpen => self.open(),
            State::Open { .. } => {}
        }
    }

    fn open(&mut self) {
        warn!(
            url = %self.url,
            reset_in = ?self.settings.reset_timeout,
            "circuit breaker opened"
        );
        counter!("delivery_circuit_events_total", "state" => "open").increment(1);
        self.state = State::Open {
            last_failure: Instant::now(),
        };
    }
}

/// Lazily populated map of breakers, one per destination URL.
pub struct BreakerRegistry {
    settings: BreakerSettings,
    breakers: RwLock<HashMap<String, Arc<Mutex<CircuitBreaker>>>>,
}

impl BreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn breaker(&self, url: &str) -> Arc<Mutex<CircuitBreaker>> {
        if let Some(found) = self
            .breakers
            .read()
            .expect("breaker registry lock poisoned")
            .get(url)
        {
            return Arc::clone(found);
        }
        let mut writable = self
            .breakers
            .write()
            .expect("breaker registry lock poisoned");
        // Second existence check: another task may have inserted while we
        // waited for the write lock.
        Arc::clone(writable.entry(url.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(CircuitBreaker::new(
                self.settings.clone(),
                url,
            )))
        }))
    }
}
