//! Per-host backoff tracking for outbound HTTP
//!
//! Tools that hit remote hosts record failures here so repeated failures
//! against the same host produce growing backoff hints. The hint travels back
//! to the agent inside the error observation; the manager itself never sleeps.

use parking_lot::RwLock;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Minimum backoff delay in seconds
const MIN_BACKOFF_SECS: u64 = 2;
/// Maximum backoff delay in seconds
const MAX_BACKOFF_SECS: u64 = 60;
/// Quiet period after which a host's error streak is forgotten
const RESET_AFTER_SECS: u64 = 120;

#[derive(Debug, Clone)]
struct BackoffState {
    current_delay: u64,
    last_error_at: Instant,
    error_count: u32,
}

impl BackoffState {
    fn fresh(now: Instant) -> Self {
        BackoffState {
            current_delay: MIN_BACKOFF_SECS,
            last_error_at: now,
            error_count: 0,
        }
    }
}

/// Backoff state keyed by host name
pub struct HttpRetryManager {
    states: RwLock<HashMap<String, BackoffState>>,
}

impl HttpRetryManager {
    pub fn new() -> Self {
        HttpRetryManager {
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Process-wide instance shared by all HTTP tools
    pub fn global() -> &'static HttpRetryManager {
        use once_cell::sync::OnceCell;
        static INSTANCE: OnceCell<HttpRetryManager> = OnceCell::new();
        INSTANCE.get_or_init(HttpRetryManager::new)
    }

    /// Forget the error streak for a host
    pub fn record_success(&self, host: &str) {
        if self.states.write().remove(host).is_some() {
            log::debug!("[HTTP_RETRY] Success for '{}', backoff reset", host);
        }
    }

    /// Record a failure and return the suggested wait in seconds
    pub fn record_error(&self, host: &str) -> u64 {
        let now = Instant::now();
        let mut states = self.states.write();
        let state = states
            .entry(host.to_string())
            .or_insert_with(|| BackoffState::fresh(now));

        if state.error_count > 0
            && now.duration_since(state.last_error_at) > Duration::from_secs(RESET_AFTER_SECS)
        {
            *state = BackoffState::fresh(now);
        }

        state.error_count += 1;
        if state.error_count > 1 {
            state.current_delay = (state.current_delay * 2).min(MAX_BACKOFF_SECS);
        }
        state.last_error_at = now;

        log::warn!(
            "[HTTP_RETRY] Error #{} for '{}', backoff: {}s",
            state.error_count,
            host,
            state.current_delay
        );

        state.current_delay
    }

    pub fn current_delay(&self, host: &str) -> Option<u64> {
        self.states.read().get(host).map(|s| s.current_delay)
    }

    /// Whether an HTTP status indicates a transient failure
    pub fn is_retryable_status(status: u16) -> bool {
        matches!(
            status,
            408 | // Request Timeout
            429 | // Too Many Requests
            500 | // Internal Server Error (sometimes transient)
            502 | // Bad Gateway
            503 | // Service Unavailable
            504 | // Gateway Timeout
            520..=524 // Cloudflare origin errors
        )
    }
}

impl Default for HttpRetryManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a reqwest transport error is worth retrying
pub fn is_reqwest_error_retryable(err: &reqwest::Error) -> bool {
    err.is_timeout()
        || err.is_connect()
        || err.is_request()
        || err
            .status()
            .map(|s| HttpRetryManager::is_retryable_status(s.as_u16()))
            .unwrap_or(false)
}

/// Parse a `Retry-After` header given in seconds
pub fn retry_after_secs(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}
