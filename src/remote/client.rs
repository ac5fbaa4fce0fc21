use std::future::Future;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use prometheus::Counter;
use tracing::{debug, warn};

use crate::record::codec::Compression;

use super::cluster::Member;

/// Path of the inbound batch endpoint on every member.
pub const BATCH_PATH: &str = "/remote/v1/batch";

/// Delivers encoded batches to another member.
pub trait RemoteTransport: Send + Sync + 'static {
    fn send(
        &self,
        member: &Member,
        payload: &[u8],
        compression: Compression,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// HTTP transport: POSTs batches to the member's inbound endpoint.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .context("building HTTP client")?;

        Ok(Self { client })
    }
}

impl RemoteTransport for HttpTransport {
    async fn send(&self, member: &Member, payload: &[u8], compression: Compression) -> Result<()> {
        let url = format!("http://{}{BATCH_PATH}", member.address);

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .body(payload.to_vec());

        if let Some(encoding) = compression.content_encoding() {
            request = request.header("Content-Encoding", encoding);
        }

        let resp = request
            .send()
            .await
            .with_context(|| format!("sending batch to {}", member.name))?;

        let status = resp.status();
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        if !status.is_success() {
            bail!("member {} answered {status}", member.name);
        }

        Ok(())
    }
}

/// Bounded retry with exponential backoff for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Limit for each attempt.
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Sends `payload`, retrying failed or timed-out attempts.
    ///
    /// Every failed attempt increments `errors`. Returns the last error once
    /// retries are exhausted.
    pub async fn send_with_retry<T: RemoteTransport>(
        &self,
        transport: &T,
        member: &Member,
        payload: &[u8],
        compression: Compression,
        errors: &Counter,
    ) -> Result<()> {
        let mut retry = 0;
        loop {
            let result = match tokio::time::timeout(
                self.timeout,
                transport.send(member, payload, compression),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!(
                    "send to {} timed out after {:?}",
                    member.name,
                    self.timeout
                )),
            };

            let err = match result {
                Ok(()) => {
                    if retry > 0 {
                        debug!(member = %member.name, retries = retry, "remote send recovered");
                    }
                    return Ok(());
                }
                Err(e) => e,
            };

            errors.inc();
            if retry >= self.max_retries {
                return Err(err.context(format!("giving up after {} attempts", retry + 1)));
            }

            let delay = self.backoff(retry);
            warn!(
                member = %member.name,
                attempt = retry + 1,
                delay = ?delay,
                error = %err,
                "remote send failed, retrying",
            );
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            timeout: Duration::from_secs(1),
        }
    }

    /// Fails the first `failures` calls, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    impl RemoteTransport for Flaky {
        async fn send(&self, _: &Member, _: &[u8], _: Compression) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                bail!("connection refused");
            }
            Ok(())
        }
    }

    /// Never answers.
    struct Hung;

    impl RemoteTransport for Hung {
        async fn send(&self, _: &Member, _: &[u8], _: Compression) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn counter() -> Counter {
        Counter::new("test_errors", "test").unwrap()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy(5);
        assert_eq!(p.backoff(0), Duration::from_millis(100));
        assert_eq!(p.backoff(1), Duration::from_millis(200));
        assert_eq!(p.backoff(2), Duration::from_millis(350));
        assert_eq!(p.backoff(40), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let transport = Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
        };
        let errors = counter();
        policy(3)
            .send_with_retry(
                &transport,
                &Member::new("b", "b:1"),
                b"{}",
                Compression::None,
                &errors,
            )
            .await
            .unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert_eq!(errors.get(), 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let transport = Flaky {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        };
        let errors = counter();
        let result = policy(2)
            .send_with_retry(
                &transport,
                &Member::new("b", "b:1"),
                b"{}",
                Compression::None,
                &errors,
            )
            .await;
        assert!(result.is_err());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert_eq!(errors.get(), 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let errors = counter();
        let result = policy(1)
            .send_with_retry(
                &Hung,
                &Member::new("b", "b:1"),
                b"{}",
                Compression::None,
                &errors,
            )
            .await;
        assert!(result.is_err());
        assert_eq!(errors.get(), 2.0);
    }
}
