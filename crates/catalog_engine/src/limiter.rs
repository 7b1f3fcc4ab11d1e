//! Per-domain admission gate.
//!
//! Every outbound request passes through [`DomainLimiter::acquire`], which
//! holds one of `max_parallelism` slots for the duration of the request and
//! spaces request starts by `min_delay` plus random jitter.

use std::sync::Arc;
use std::time::Duration;

use catalog_core::RateLimitRule;
use catalog_logging::harvest_info;
use rand::Rng;
use tokio::sync::{AcquireError, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use url::Url;

use crate::{FailureKind, FetchError, FetchOutput, Fetcher};

struct DomainGate {
    rule: RateLimitRule,
    slots: Arc<Semaphore>,
    last_start: Mutex<Option<Instant>>,
}

impl DomainGate {
    fn new(rule: RateLimitRule) -> Self {
        let slots = Arc::new(Semaphore::new(rule.parallelism()));
        Self {
            rule,
            slots,
            last_start: Mutex::new(None),
        }
    }

    async fn admit(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        let permit = self.slots.clone().acquire_owned().await?;
        let mut last_start = self.last_start.lock().await;
        if let Some(previous) = *last_start {
            let gap = self.rule.min_delay + random_jitter(self.rule.jitter);
            tokio::time::sleep_until(previous + gap).await;
        }
        *last_start = Some(Instant::now());
        Ok(permit)
    }
}

fn random_jitter(range: Duration) -> Duration {
    let micros = u64::try_from(range.as_micros()).unwrap_or(u64::MAX);
    if micros == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(rand::rng().random_range(0..=micros))
}

/// Held while a request is in flight; dropping it frees the slot.
#[derive(Debug)]
pub struct DomainPermit {
    _permit: Option<OwnedSemaphorePermit>,
}

/// Rules are checked in order; the first whose pattern matches the host applies.
/// All hosts matched by one rule share its slots.
pub struct DomainLimiter {
    gates: Vec<DomainGate>,
}

impl DomainLimiter {
    pub fn new(rules: Vec<RateLimitRule>) -> Self {
        Self {
            gates: rules.into_iter().map(DomainGate::new).collect(),
        }
    }

    pub fn rule_for(&self, host: &str) -> Option<&RateLimitRule> {
        self.gate_for(host).map(|gate| &gate.rule)
    }

    fn gate_for(&self, host: &str) -> Option<&DomainGate> {
        self.gates.iter().find(|gate| gate.rule.matches(host))
    }

    /// Wait for a slot on `host`. Hosts without a rule are admitted immediately.
    pub async fn acquire(&self, host: &str) -> Result<DomainPermit, AcquireError> {
        let Some(gate) = self.gate_for(host) else {
            return Ok(DomainPermit { _permit: None });
        };
        let permit = gate.admit().await?;
        Ok(DomainPermit {
            _permit: Some(permit),
        })
    }

    /// Fail every pending and future `acquire`.
    pub fn close(&self) {
        for gate in &self.gates {
            gate.slots.close();
        }
    }
}

/// A [`Fetcher`] whose requests are admitted by a [`DomainLimiter`].
#[derive(Clone)]
pub struct ThrottledFetcher {
    inner: Arc<dyn Fetcher>,
    limiter: Arc<DomainLimiter>,
}

impl ThrottledFetcher {
    pub fn new(inner: Arc<dyn Fetcher>, limiter: Arc<DomainLimiter>) -> Self {
        Self { inner, limiter }
    }
}

#[async_trait::async_trait]
impl Fetcher for ThrottledFetcher {
    async fn fetch(&self, url: &str, referer: Option<&str>) -> Result<FetchOutput, FetchError> {
        let parsed =
            Url::parse(url).map_err(|err| FetchError::new(FailureKind::InvalidUrl, err.to_string()))?;
        let host = parsed.host_str().unwrap_or_default();
        let _permit = self
            .limiter
            .acquire(host)
            .await
            .map_err(|_| FetchError::new(FailureKind::Cancelled, "rate limiter closed"))?;
        harvest_info!("Visiting {}", url);
        self.inner.fetch(url, referer).await
    }
}
