//! Retry manager: runs fallible operations under a [`RetryPolicy`].

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::classifier::{ErrorClassifier, ErrorType};
use super::policy::RetryPolicy;
use crate::Result;
use crate::error::ProcessingError;

/// One failed attempt of a named operation.
#[derive(Debug, Clone, Serialize)]
pub struct RetryAttempt {
    pub attempt_number: u32,
    pub timestamp: DateTime<Utc>,
    pub error: String,
    /// Seconds waited before the next attempt. Zero when no retry followed.
    pub delay_before_retry: f64,
    pub operation_name: String,
}

/// Events emitted by the retry manager.
#[derive(Debug, Clone)]
pub enum RetryEvent {
    /// An attempt failed and another one is scheduled.
    Attempted {
        operation: String,
        attempt: u32,
        error: String,
    },
    /// The operation failed for good.
    Exhausted { operation: String, error: String },
    /// The operation succeeded after at least one retry.
    Succeeded { operation: String, retries: u32 },
}

/// Aggregate view over the attempt history.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetryStatistics {
    pub total_operations: usize,
    pub total_attempts: usize,
    pub failed_operations: usize,
    pub success_rate: f64,
    pub average_attempts: f64,
}

pub struct RetryManager {
    policy: RetryPolicy,
    classifier: ErrorClassifier,
    history: Mutex<HashMap<String, Vec<RetryAttempt>>>,
    event_tx: broadcast::Sender<RetryEvent>,
}

impl RetryManager {
    pub fn new(policy: RetryPolicy) -> Result<Self> {
        policy.validate()?;
        let (event_tx, _) = broadcast::channel(64);

        Ok(Self {
            policy,
            classifier: ErrorClassifier::new(),
            history: Mutex::new(HashMap::new()),
            event_tx,
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RetryEvent> {
        self.event_tx.subscribe()
    }

    /// Run `operation` until it succeeds or retrying is no longer allowed.
    ///
    /// The backoff sleep suspends the calling task. The error returned is
    /// always the one produced by the last attempt.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        operation_name: &str,
        mut operation: F,
    ) -> std::result::Result<T, ProcessingError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ProcessingError>>,
    {
        let mut attempt = 1u32;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        let retries = attempt - 1;
                        info!(
                            operation = %operation_name,
                            retries,
                            "Operation succeeded after retry"
                        );
                        let _ = self.event_tx.send(RetryEvent::Succeeded {
                            operation: operation_name.to_string(),
                            retries,
                        });
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let error_type = self.classifier.classify(&err);
                    let retryable = self.should_retry(&err, error_type, attempt);
                    let delay = if retryable {
                        self.policy.calculate_delay(attempt)
                    } else {
                        std::time::Duration::ZERO
                    };

                    self.record_attempt(operation_name, attempt, &err, delay.as_secs_f64());

                    if !retryable {
                        warn!(
                            operation = %operation_name,
                            attempt,
                            error_type = %error_type,
                            error = %err,
                            "Retry exhausted"
                        );
                        let _ = self.event_tx.send(RetryEvent::Exhausted {
                            operation: operation_name.to_string(),
                            error: err.to_string(),
                        });
                        return Err(err);
                    }

                    debug!(
                        operation = %operation_name,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Attempt failed, retrying"
                    );
                    let _ = self.event_tx.send(RetryEvent::Attempted {
                        operation: operation_name.to_string(),
                        attempt,
                        error: err.to_string(),
                    });

                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn should_retry(&self, err: &ProcessingError, error_type: ErrorType, attempt: u32) -> bool {
        if matches!(error_type, ErrorType::Critical | ErrorType::Permanent) {
            return false;
        }
        if attempt >= self.policy.max_attempts {
            return false;
        }
        self.policy.allows(err.kind())
    }

    fn record_attempt(&self, operation_name: &str, attempt: u32, err: &ProcessingError, delay: f64) {
        let record = RetryAttempt {
            attempt_number: attempt,
            timestamp: Utc::now(),
            error: err.to_string(),
            delay_before_retry: delay,
            operation_name: operation_name.to_string(),
        };
        self.history
            .lock()
            .entry(operation_name.to_string())
            .or_default()
            .push(record);
    }

    /// Attempt history for one operation, or for all operations when `None`.
    pub fn attempt_history(&self, operation_name: Option<&str>) -> Vec<RetryAttempt> {
        let history = self.history.lock();
        match operation_name {
            Some(name) => history.get(name).cloned().unwrap_or_default(),
            None => history.values().flatten().cloned().collect(),
        }
    }

    pub fn clear_history(&self, operation_name: Option<&str>) {
        let mut history = self.history.lock();
        match operation_name {
            Some(name) => {
                history.remove(name);
            }
            None => history.clear(),
        }
    }

    pub fn statistics(&self) -> RetryStatistics {
        let history = self.history.lock();
        if history.is_empty() {
            return RetryStatistics::default();
        }

        let total_operations = history.len();
        let total_attempts = history.values().map(Vec::len).sum::<usize>();
        let failed_operations = history
            .values()
            .filter(|attempts| {
                attempts
                    .last()
                    .is_some_and(|a| a.attempt_number >= self.policy.max_attempts)
            })
            .count();

        RetryStatistics {
            total_operations,
            total_attempts,
            failed_operations,
            success_rate: (total_operations - failed_operations) as f64 / total_operations as f64,
            average_attempts: total_attempts as f64 / total_operations as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(max_attempts)
            .with_base_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5))
            .with_jitter(false)
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let manager = RetryManager::new(fast_policy(3)).unwrap();
        let result = manager
            .execute_with_retry("ok", || async { Ok::<_, ProcessingError>(7) })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert!(manager.attempt_history(Some("ok")).is_empty());
    }

    #[tokio::test]
    async fn test_temporary_failure_invoked_max_attempts_times() {
        for max_attempts in 1..=5 {
            let manager = RetryManager::new(fast_policy(max_attempts)).unwrap();
            let calls = Arc::new(AtomicU32::new(0));

            let result: std::result::Result<(), _> = manager
                .execute_with_retry("flaky", || {
                    let calls = calls.clone();
                    async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                        Err(ProcessingError::Connection(format!("failure {n}")))
                    }
                })
                .await;

            assert_eq!(calls.load(Ordering::SeqCst), max_attempts);
            let err = result.unwrap_err();
            assert_eq!(err.to_string(), format!("connection error: failure {max_attempts}"));
            assert_eq!(
                manager.attempt_history(Some("flaky")).len(),
                max_attempts as usize
            );
        }
    }

    #[tokio::test]
    async fn test_permanent_and_critical_invoked_once() {
        let manager = RetryManager::new(fast_policy(5)).unwrap();

        for err in [
            ProcessingError::NotFound("a.pdf".into()),
            ProcessingError::http(400, "bad request"),
            ProcessingError::OutOfMemory("alloc".into()),
        ] {
            let calls = Arc::new(AtomicU32::new(0));
            let message = err.to_string();
            let err = Arc::new(parking_lot::Mutex::new(Some(err)));

            let result: std::result::Result<(), _> = manager
                .execute_with_retry("fatal", || {
                    let calls = calls.clone();
                    let err = err.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(err.lock().take().unwrap_or(ProcessingError::Cancelled))
                    }
                })
                .await;

            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert_eq!(result.unwrap_err().to_string(), message);
        }
    }

    #[tokio::test]
    async fn test_kind_outside_retry_set_is_not_retried() {
        let policy = fast_policy(4).with_retry_on(vec![ErrorKind::Timeout]);
        let manager = RetryManager::new(policy).unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        let result: std::result::Result<(), _> = manager
            .execute_with_retry("format", || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ProcessingError::Format("corrupt".into()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_events_and_eventual_success() {
        let manager = RetryManager::new(fast_policy(3)).unwrap();
        let mut rx = manager.subscribe();
        let calls = Arc::new(AtomicU32::new(0));

        let value = manager
            .execute_with_retry("eventually", || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ProcessingError::Timeout("slow".into()))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, "done");

        let mut attempted = 0;
        let mut succeeded = None;
        while let Ok(event) = rx.try_recv() {
            match event {
                RetryEvent::Attempted { .. } => attempted += 1,
                RetryEvent::Succeeded { retries, .. } => succeeded = Some(retries),
                RetryEvent::Exhausted { .. } => panic!("unexpected exhaustion"),
            }
        }
        assert_eq!(attempted, 2);
        assert_eq!(succeeded, Some(2));

        let history = manager.attempt_history(Some("eventually"));
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].attempt_number, 1);
        assert!(history[0].delay_before_retry > 0.0);
    }

    #[tokio::test]
    async fn test_statistics_and_clear() {
        let manager = RetryManager::new(fast_policy(2)).unwrap();

        let _: std::result::Result<(), _> = manager
            .execute_with_retry("always_fails", || async {
                Err(ProcessingError::Connection("down".into()))
            })
            .await;

        let calls = Arc::new(AtomicU32::new(0));
        let _ = manager
            .execute_with_retry("recovers", || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(ProcessingError::Connection("blip".into()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        let stats = manager.statistics();
        assert_eq!(stats.total_operations, 2);
        assert_eq!(stats.total_attempts, 3);
        assert_eq!(stats.failed_operations, 1);
        assert!((stats.success_rate - 0.5).abs() < f64::EPSILON);
        assert!((stats.average_attempts - 1.5).abs() < f64::EPSILON);

        manager.clear_history(Some("recovers"));
        assert_eq!(manager.attempt_history(None).len(), 2);
        manager.clear_history(None);
        assert_eq!(manager.statistics(), RetryStatistics::default());
    }

    #[test]
    fn test_invalid_policy_rejected() {
        assert!(RetryManager::new(RetryPolicy::default().with_max_attempts(0)).is_err());
    }
}
