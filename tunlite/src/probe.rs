//! Loopback port readiness probe.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use crate::runtime::constants::{LOOPBACK, probe};

/// Floor for a single connect attempt, so a spent budget still gets one try.
const MIN_ATTEMPT: Duration = Duration::from_millis(20);

/// Outcome of waiting for a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready { elapsed: Duration },
    TimedOut { elapsed: Duration },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready { .. })
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            Readiness::Ready { elapsed } | Readiness::TimedOut { elapsed } => *elapsed,
        }
    }
}

/// Wait for a listener on `127.0.0.1:port`, retrying every 200 ms.
pub async fn wait_until_listening(port: u16, timeout: Duration) -> Readiness {
    wait_until_listening_with_interval(port, timeout, probe::RETRY_INTERVAL).await
}

/// Same as [`wait_until_listening`] with an explicit retry interval.
///
/// Each connect attempt is bounded by the interval, and the final sleep is
/// clipped so the probe returns close to `timeout`.
pub async fn wait_until_listening_with_interval(
    port: u16,
    timeout: Duration,
    interval: Duration,
) -> Readiness {
    let addr = SocketAddr::from((LOOPBACK, port));
    let start = Instant::now();
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let remaining = timeout.saturating_sub(start.elapsed());
        let attempt_bound = interval.min(remaining).max(MIN_ATTEMPT);

        if let Ok(Ok(stream)) = tokio::time::timeout(attempt_bound, TcpStream::connect(addr)).await
        {
            drop(stream);
            let elapsed = start.elapsed();
            tracing::debug!(port, attempts, elapsed_ms = elapsed.as_millis() as u64, "Port is listening");
            return Readiness::Ready { elapsed };
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            tracing::debug!(port, attempts, elapsed_ms = elapsed.as_millis() as u64, "Port probe timed out");
            return Readiness::TimedOut { elapsed };
        }

        tokio::time::sleep(interval.min(timeout - elapsed)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn free_port() -> u16 {
        let listener = TcpListener::bind((LOOPBACK, 0)).await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_ready_immediately_when_listening() {
        let listener = TcpListener::bind((LOOPBACK, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let result = wait_until_listening(port, Duration::from_secs(2)).await;
        assert!(result.is_ready());
        assert!(result.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_ready_after_delayed_listener() {
        let port = free_port().await;
        let server = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let listener = TcpListener::bind((LOOPBACK, port)).await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(listener);
        });

        let result = wait_until_listening(port, Duration::from_secs(5)).await;
        assert!(result.is_ready(), "got {:?}", result);
        assert!(result.elapsed() >= Duration::from_millis(400));
        assert!(result.elapsed() < Duration::from_millis(1500));
        server.abort();
    }

    #[tokio::test]
    async fn test_times_out_at_default_bound() {
        let port = free_port().await;

        let result = wait_until_listening(port, probe::TIMEOUT).await;
        assert!(!result.is_ready());
        let elapsed = result.elapsed();
        assert!(elapsed >= Duration::from_millis(9_700), "elapsed {:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(10_300), "elapsed {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_zero_timeout_still_tries_once() {
        let listener = TcpListener::bind((LOOPBACK, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let result = wait_until_listening(port, Duration::ZERO).await;
        assert!(result.is_ready());
    }
}
