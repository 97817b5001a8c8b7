//! Retry wrapper applied at the storage boundary.

use std::ops::Range;
use std::sync::Arc;
use std::thread;

use tracing::warn;

use super::{ObjectStore, PutMode};
use crate::config::RetryConfig;
use crate::error::{Result, VexError};

/// Retries transient failures of the inner store with bounded exponential
/// backoff. When the budget runs out the caller gets
/// [`VexError::Unavailable`]; every other error passes through unchanged.
#[derive(Debug, Clone)]
pub struct RetryingStore {
    inner: Arc<dyn ObjectStore>,
    policy: RetryConfig,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn ObjectStore>, policy: RetryConfig) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &Arc<dyn ObjectStore> {
        &self.inner
    }

    fn with_retry<T>(&self, op: &str, path: &str, mut f: impl FnMut(u32) -> Result<T>) -> Result<T> {
        let mut attempt = 0u32;
        loop {
            match f(attempt) {
                Err(e) if e.is_transient() => {
                    if attempt >= self.policy.max_retries {
                        return Err(VexError::Unavailable(format!(
                            "{} {} failed after {} retries: {}",
                            op, path, attempt, e
                        )));
                    }
                    let delay = self.policy.delay(attempt);
                    warn!(op, path, attempt, ?delay, error = %e, "transient storage error, retrying");
                    thread::sleep(delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

impl ObjectStore for RetryingStore {
    fn put_file(&self, path: &str, bytes: &[u8], mode: PutMode) -> Result<()> {
        self.with_retry("put", path, |attempt| {
            match self.inner.put_file(path, bytes, mode) {
                // A retried create may find the object its own earlier,
                // unacknowledged attempt wrote.
                Err(VexError::AlreadyExists { .. }) if attempt > 0 => {
                    match self.inner.get(path) {
                        Ok(existing) if existing == bytes => Ok(()),
                        Ok(_) => Err(VexError::AlreadyExists {
                            path: path.to_string(),
                        }),
                        Err(e) => Err(e),
                    }
                }
                other => other,
            }
        })
    }

    fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.with_retry("get", path, |_| self.inner.get(path))
    }

    fn get_range(&self, path: &str, range: Range<u64>) -> Result<Vec<u8>> {
        self.with_retry("get_range", path, |_| self.inner.get_range(path, range.clone()))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.with_retry("list", prefix, |_| self.inner.list(prefix))
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.with_retry("delete", path, |_| self.inner.delete(path))
    }

    fn head(&self, path: &str) -> Result<Option<u64>> {
        self.with_retry("head", path, |_| self.inner.head(path))
    }
}
