//! Request logging.
//!
//! Per-request latency with a slow-request warning, plus per-route hit
//! counters flushed as a summary on an interval (and once at shutdown) so
//! chatty polling routes do not drown the log.

use axum::extract::State;
use axum::middleware::Next;
use axum::response::Response;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Default)]
struct RouteCounter {
    hits: u64,
    total_ms: u128,
    slowest_ms: u128,
}

pub struct RequestLog {
    slow: Duration,
    counters: Mutex<HashMap<String, RouteCounter>>,
}

impl RequestLog {
    pub fn new(slow_ms: u64) -> Self {
        Self {
            slow: Duration::from_millis(slow_ms),
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, method: &str, path: &str, status: u16, elapsed: Duration) {
        let elapsed_ms = elapsed.as_millis();
        if elapsed >= self.slow {
            warn!(
                http.method = method,
                http.path = path,
                http.status = status,
                http.elapsed_ms = elapsed_ms as u64,
                "slow request"
            );
        } else {
            debug!(
                http.method = method,
                http.path = path,
                http.status = status,
                http.elapsed_ms = elapsed_ms as u64,
                "request"
            );
        }

        let key = format!("{method} {path}");
        let mut counters = self.counters.lock().unwrap();
        let counter = counters.entry(key).or_default();
        counter.hits += 1;
        counter.total_ms += elapsed_ms;
        counter.slowest_ms = counter.slowest_ms.max(elapsed_ms);
    }

    /// Log and reset the per-route counters.
    pub fn flush_summary(&self) {
        let drained: Vec<(String, RouteCounter)> = {
            let mut counters = self.counters.lock().unwrap();
            counters.drain().collect()
        };
        if drained.is_empty() {
            return;
        }
        for (route, counter) in drained {
            info!(
                http.route = %route,
                http.hits = counter.hits,
                http.avg_ms = (counter.total_ms / counter.hits as u128) as u64,
                http.slowest_ms = counter.slowest_ms as u64,
                "request summary"
            );
        }
    }

    /// Periodic summary flusher; flushes once more when `shutdown` fires.
    pub fn spawn_summary_task(
        self: &std::sync::Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let log = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => log.flush_summary(),
                    _ = shutdown.cancelled() => {
                        log.flush_summary();
                        return;
                    }
                }
            }
        })
    }
}

/// Axum middleware wrapping every request.
pub async fn track(
    State(state): State<crate::web::AppState>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    state
        .reqlog
        .record(&method, &path, response.status().as_u16(), started.elapsed());
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate_and_flush() {
        let log = RequestLog::new(1500);
        log.record("GET", "/health", 200, Duration::from_millis(3));
        log.record("GET", "/health", 200, Duration::from_millis(5));
        log.record("POST", "/house/commands", 200, Duration::from_millis(40));

        {
            let counters = log.counters.lock().unwrap();
            assert_eq!(counters.len(), 2);
            assert_eq!(counters["GET /health"].hits, 2);
            assert_eq!(counters["GET /health"].slowest_ms, 5);
        }

        log.flush_summary();
        assert!(log.counters.lock().unwrap().is_empty());
    }
}
