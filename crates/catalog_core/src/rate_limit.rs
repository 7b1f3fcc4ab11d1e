use std::time::Duration;

/// Per-domain admission rule: at most `max_parallelism` requests in flight, and
/// at least `min_delay + U[0, jitter]` between two request starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRule {
    /// `*`, an exact host, or `*.suffix`.
    pub domain_pattern: String,
    pub max_parallelism: usize,
    pub min_delay: Duration,
    pub jitter: Duration,
}

impl RateLimitRule {
    pub fn new(domain_pattern: impl Into<String>, max_parallelism: usize) -> Self {
        Self {
            domain_pattern: domain_pattern.into(),
            max_parallelism: max_parallelism.max(1),
            min_delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, min_delay: Duration, jitter: Duration) -> Self {
        self.min_delay = min_delay;
        self.jitter = jitter;
        self
    }

    pub fn matches(&self, host: &str) -> bool {
        domain_matches(&self.domain_pattern, host)
    }

    /// Parallelism clamped to at least one slot.
    pub fn parallelism(&self) -> usize {
        self.max_parallelism.max(1)
    }
}

/// Case-insensitive host match. `*.example.com` covers `example.com` and all subdomains.
pub fn domain_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim().trim_end_matches('.').to_ascii_lowercase();
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    if pattern == "*" {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return host == suffix || host.ends_with(&format!(".{suffix}"));
    }
    pattern == host
}
