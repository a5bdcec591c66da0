use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use sealsnap_core::{Backend, BackendType, Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Exponential backoff for transient remote failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Adds up to 25% of random delay on top of each backoff.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Single attempt, for tests and interactive checks.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let millis = base.min(self.max_backoff.as_millis() as f64) as u64;

        let jitter = if self.jitter {
            rand::thread_rng().gen_range(0..=millis / 4)
        } else {
            0
        };

        Duration::from_millis(millis + jitter)
    }
}

pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Io(_) => true,
            Error::Transport(msg) => {
                let msg = msg.to_lowercase();
                [
                    "timeout",
                    "timed out",
                    "connection",
                    "rate limit",
                    "throttl",
                    "temporarily unavailable",
                    "try again",
                    "503",
                    "429",
                ]
                .iter()
                .any(|pattern| msg.contains(pattern))
            }

            Error::Authentication
            | Error::MalformedObject(_)
            | Error::UnsafePath(_)
            | Error::CacheInconsistency => false,

            _ => false,
        }
    }
}

/// Runs `operation` until it succeeds, fails with a permanent error or runs
/// out of attempts.
pub async fn retry_with_backoff<F, Fut, T>(config: &RetryConfig, operation_name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        let err = match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation = operation_name, attempt = attempt + 1, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        attempt += 1;
        if !err.is_retryable() || attempt >= config.max_attempts {
            if attempt > 1 {
                warn!(operation = operation_name, attempts = attempt, error = %err, "Giving up");
            }
            return Err(err);
        }

        let delay = config.delay(attempt - 1);
        warn!(
            operation = operation_name,
            attempt,
            max_attempts = config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Transport operation failed, retrying"
        );
        sleep(delay).await;
    }
}

/// Wraps a remote transport so every call goes through [`retry_with_backoff`].
pub struct RetryingBackend {
    inner: Arc<dyn Backend>,
    config: RetryConfig,
}

impl RetryingBackend {
    pub fn new(inner: Arc<dyn Backend>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl Backend for RetryingBackend {
    fn url(&self) -> String {
        self.inner.url()
    }

    async fn init(&self) -> Result<()> {
        // Not idempotent, a retried init would see its own layout
        self.inner.init().await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        retry_with_backoff(&self.config, "exists", || self.inner.exists(path)).await
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        retry_with_backoff(&self.config, "read", || self.inner.read(path)).await
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        retry_with_backoff(&self.config, "write", || self.inner.write(path, data.clone())).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        retry_with_backoff(&self.config, "delete", || self.inner.delete(path)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        retry_with_backoff(&self.config, "list", || self.inner.list(prefix)).await
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        retry_with_backoff(&self.config, "create_dir", || self.inner.create_dir(path)).await
    }

    async fn delete_dir(&self, path: &str) -> Result<()> {
        retry_with_backoff(&self.config, "delete_dir", || self.inner.delete_dir(path)).await
    }

    fn backend_type(&self) -> BackendType {
        self.inner.backend_type()
    }

    fn default_threads(&self) -> usize {
        self.inner.default_threads()
    }
}
