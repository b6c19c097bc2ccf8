//! Request admission: URL validation and a per-client sliding-window budget.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("no URL provided")]
    MissingUrl,

    #[error("not a valid http(s) URL: {0}")]
    InvalidUrl(String),

    #[error("too many requests, retry in {}s", .retry_after.as_secs().max(1))]
    RateLimited { retry_after: Duration },
}

/// Request timestamps per client inside the trailing window. In-memory only.
#[derive(Debug)]
pub struct RateLimitLedger {
    window: Duration,
    capacity: usize,
    entries: HashMap<String, VecDeque<Instant>>,
}

impl RateLimitLedger {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity,
            entries: HashMap::new(),
        }
    }

    /// Records a request at `now` if the client still has budget, otherwise
    /// returns how long until the oldest entry leaves the window.
    pub fn try_record(&mut self, client: &str, now: Instant) -> Result<(), Duration> {
        let timestamps = self.entries.entry(client.to_string()).or_default();

        while let Some(oldest) = timestamps.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        if timestamps.len() < self.capacity {
            timestamps.push_back(now);
            return Ok(());
        }

        let retry_after = timestamps
            .front()
            .map(|oldest| self.window.saturating_sub(now.saturating_duration_since(*oldest)))
            .unwrap_or(self.window);
        Err(retry_after)
    }

    /// Drops clients whose every timestamp has aged out.
    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.entries.retain(|_, timestamps| {
            timestamps
                .back()
                .is_some_and(|latest| now.saturating_duration_since(*latest) < window)
        });
    }

    pub fn tracked_clients(&self) -> usize {
        self.entries.len()
    }
}

pub struct RequestGate {
    ledger: Mutex<RateLimitLedger>,
}

impl RequestGate {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            ledger: Mutex::new(RateLimitLedger::new(window, capacity)),
        }
    }

    pub fn admit(&self, client: &str, requested_url: Option<&str>) -> Result<Url, Rejection> {
        self.admit_at(client, requested_url, Instant::now())
    }

    /// URL checks run first so malformed requests never consume budget.
    pub fn admit_at(
        &self,
        client: &str,
        requested_url: Option<&str>,
        now: Instant,
    ) -> Result<Url, Rejection> {
        let url = validate_url(requested_url)?;

        let mut ledger = self
            .ledger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        ledger.prune(now);
        ledger.try_record(client, now).map_err(|retry_after| {
            debug!(client, retry_after_secs = retry_after.as_secs(), "rate limited");
            Rejection::RateLimited { retry_after }
        })?;
        debug!(client, tracked_clients = ledger.tracked_clients(), "admitted");

        Ok(url)
    }
}

pub fn validate_url(requested_url: Option<&str>) -> Result<Url, Rejection> {
    let raw = requested_url
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(Rejection::MissingUrl)?;

    let url = Url::parse(raw).map_err(|_| Rejection::InvalidUrl(raw.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(Rejection::InvalidUrl(raw.to_string()));
    }
    Ok(url)
}
