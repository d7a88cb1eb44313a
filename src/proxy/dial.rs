use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::codes;
use crate::metrics::MetricsRegistry;

/// Wait between failed dial attempts. The backoff is fixed, not exponential;
/// the deadline, not the attempt count, bounds retries.
pub const RETRY_DELAY: Duration = Duration::from_secs(10);

/// Attempt to connect to `host:port` until `deadline_budget` has elapsed.
///
/// Each failed attempt increments the `tcp` backend-failure counter, is
/// logged at debug level, and is followed by the shorter of `retry_delay`
/// and the remaining budget. Once the budget is exhausted the last error is
/// logged at error level and returned.
pub async fn connect_with_deadline(
    host: &str,
    port: u16,
    deadline_budget: Duration,
    retry_delay: Duration,
    metrics: &Arc<MetricsRegistry>,
) -> std::io::Result<TcpStream> {
    let target = if host.contains(':') {
        // IPv6 literal
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    };

    let deadline = Instant::now() + deadline_budget;
    debug!(code = codes::CONNECTING, target = %target, "Connecting to backend server");

    loop {
        let last_err = match TcpStream::connect(&target).await {
            Ok(stream) => return Ok(stream),
            Err(e) => e,
        };

        metrics.record_tcp_failure();
        debug!(
            code = codes::BACKEND_CONNECTION_FAILED,
            target = %target,
            error = %last_err,
            "Connection to SSH backend failed, retrying"
        );

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            error!(
                code = codes::BACKEND_CONNECTION_FAILED,
                target = %target,
                error = %last_err,
                "Connection to SSH backend failed, giving up"
            );
            return Err(last_err);
        }
        tokio::time::sleep(retry_delay.min(remaining)).await;
        if Instant::now() >= deadline {
            error!(
                code = codes::BACKEND_CONNECTION_FAILED,
                target = %target,
                error = %last_err,
                "Connection to SSH backend failed, giving up"
            );
            return Err(last_err);
        }
    }
}
