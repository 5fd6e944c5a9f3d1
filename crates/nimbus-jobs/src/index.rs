//! Keyed job index with backoff on transient failures.

use nimbus_core::{ClientError, IndexStore, JobDescriptor, ValidationError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Job index unavailable after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: ClientError,
    },
    #[error("Job index request failed: {0}")]
    Store(#[from] ClientError),
    #[error("Invalid index record for {job_id}: {source}")]
    InvalidRecord {
        job_id: String,
        #[source]
        source: ValidationError,
    },
}

/// Exponential backoff for index writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBackoff {
    /// Delay before the second attempt; doubles after every failure.
    pub base: Duration,
    pub max_attempts: u32,
}

impl Default for IndexBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_attempts: 5,
        }
    }
}

impl IndexBackoff {
    /// Delay after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Job index over an [`IndexStore`].
#[derive(Clone)]
pub struct JobIndex {
    store: Arc<dyn IndexStore>,
    backoff: IndexBackoff,
}

impl JobIndex {
    pub fn new(store: Arc<dyn IndexStore>) -> Self {
        Self {
            store,
            backoff: IndexBackoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: IndexBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Upsert the descriptor's full snapshot.
    ///
    /// Transient failures are retried with exponential backoff; anything else
    /// fails immediately.
    pub async fn record(&self, descriptor: &JobDescriptor) -> Result<(), IndexError> {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.store.put(descriptor.to_record()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.backoff.delay_after(attempt);
                    tracing::warn!(
                        "Index write for {} failed (attempt {}), retrying in {:?}: {}",
                        descriptor.job_id(),
                        attempt,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    return Err(IndexError::Exhausted {
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => return Err(IndexError::Store(e)),
            }
        }
    }

    /// Descriptor recorded for a job, if any.
    pub async fn lookup(&self, job_id: &str) -> Result<Option<JobDescriptor>, IndexError> {
        let Some(record) = self.store.get(job_id).await? else {
            return Ok(None);
        };
        JobDescriptor::try_from(record)
            .map(Some)
            .map_err(|source| IndexError::InvalidRecord {
                job_id: job_id.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use nimbus_core::IndexRecord;
    use nimbus_core::memory::MemoryIndex;

    fn descriptor() -> JobDescriptor {
        JobDescriptor::new(
            "abc123",
            "run_abc",
            "nimbus_primary",
            "s3://logs/abc123.log",
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        )
        .unwrap()
    }

    fn fast() -> IndexBackoff {
        IndexBackoff {
            base: Duration::from_millis(1),
            max_attempts: 3,
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let backoff = IndexBackoff::default();
        assert_eq!(backoff.delay_after(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_after(3), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_record_and_lookup() {
        let store = Arc::new(MemoryIndex::default());
        let index = JobIndex::new(store.clone());
        index.record(&descriptor()).await.unwrap();

        let record = store.record("abc123").unwrap();
        assert_eq!(record.time_stamp, "20240501-12:00:00-UTC");
        assert_eq!(index.lookup("abc123").await.unwrap(), Some(descriptor()));
        assert_eq!(index.lookup("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_record_retries_throttling() {
        let store = Arc::new(MemoryIndex::default());
        store.fail_next_puts(2);
        let index = JobIndex::new(store.clone()).with_backoff(fast());
        index.record(&descriptor()).await.unwrap();
        assert_eq!(store.put_calls(), 3);
        assert!(store.record("abc123").is_some());
    }

    #[tokio::test]
    async fn test_record_gives_up_after_budget() {
        let store = Arc::new(MemoryIndex::default());
        store.fail_next_puts(10);
        let index = JobIndex::new(store.clone()).with_backoff(fast());
        let err = index.record(&descriptor()).await.unwrap_err();
        assert!(matches!(err, IndexError::Exhausted { attempts: 3, .. }));
        assert_eq!(store.put_calls(), 3);
    }

    #[tokio::test]
    async fn test_lookup_rejects_bad_timestamp() {
        let store = Arc::new(MemoryIndex::default());
        store
            .put(IndexRecord {
                job_id: "bad".to_string(),
                execution_name: "run".to_string(),
                state_machine: "sm".to_string(),
                log_location: String::new(),
                time_stamp: "yesterday".to_string(),
            })
            .await
            .unwrap();
        let index = JobIndex::new(store);
        assert!(matches!(
            index.lookup("bad").await,
            Err(IndexError::InvalidRecord { .. })
        ));
    }
}
