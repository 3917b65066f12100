use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Minimum spacing between two consecutive requests.
    pub min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(1000),
        }
    }
}

/// Proactive spacing of outgoing requests, independent of retry backoff.
///
/// Shared by every source and attempt of one client; concurrent callers
/// queue on the lock so spacing holds across sources.
pub struct RequestThrottle {
    config: ThrottleConfig,
    last_request: Mutex<Option<Instant>>,
    total_requests: AtomicU64,
    total_wait_ms: AtomicU64,
}

impl RequestThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            last_request: Mutex::new(None),
            total_requests: AtomicU64::new(0),
            total_wait_ms: AtomicU64::new(0),
        }
    }

    /// Wait until the next request may be sent. Returns the time spent waiting.
    pub async fn acquire(&self) -> Duration {
        let mut last = self.last_request.lock().await;

        let waited = match *last {
            Some(previous) => {
                let ready_at = previous + self.config.min_interval;
                let now = Instant::now();
                if ready_at > now {
                    let wait = ready_at - now;
                    debug!("⏳ Throttling request for {:?}", wait);
                    // Lock stays held so queued callers line up behind this one
                    time::sleep(wait).await;
                    wait
                } else {
                    Duration::ZERO
                }
            }
            None => Duration::ZERO,
        };

        *last = Some(Instant::now());
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_wait_ms
            .fetch_add(waited.as_millis() as u64, Ordering::Relaxed);

        waited
    }

    pub fn get_stats(&self) -> ThrottleStats {
        ThrottleStats {
            min_interval: self.config.min_interval,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_wait_ms: self.total_wait_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ThrottleStats {
    pub min_interval: Duration,
    pub total_requests: u64,
    pub total_wait_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_first_request_is_not_delayed() {
        let throttle = RequestThrottle::new(ThrottleConfig::default());
        assert_eq!(throttle.acquire().await, Duration::ZERO);
        assert_eq!(throttle.get_stats().total_requests, 1);
    }

    #[tokio::test]
    async fn test_enforces_min_spacing() {
        let throttle = RequestThrottle::new(ThrottleConfig {
            min_interval: Duration::from_millis(50),
        });

        let start = Instant::now();
        throttle.acquire().await;
        throttle.acquire().await;
        throttle.acquire().await;

        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(throttle.get_stats().total_requests, 3);
    }

    #[tokio::test]
    async fn test_spacing_holds_for_concurrent_callers() {
        let throttle = Arc::new(RequestThrottle::new(ThrottleConfig {
            min_interval: Duration::from_millis(40),
        }));

        let start = Instant::now();
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let throttle = throttle.clone();
                tokio::spawn(async move { throttle.acquire().await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(start.elapsed() >= Duration::from_millis(80));
    }
}
