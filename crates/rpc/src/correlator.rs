//! Matches responses arriving on connection reader tasks to waiting callers.

use crate::error::{Error, Result};
use crate::protocol::ResponseBody;

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Outcome delivered to a waiting caller.
pub type CallResult = Result<ResponseBody>;

#[derive(Debug)]
struct PendingCall {
    sender: oneshot::Sender<CallResult>,
    created_at: Instant,
}

/// Correlation map from request id to the caller waiting on it.
///
/// Every entry leaves the map exactly once: on completion, on timeout, or when
/// the [`PendingHandle`] is dropped by a cancelled caller.
#[derive(Clone, Debug, Default)]
pub struct Correlator {
    pending: Arc<DashMap<u64, PendingCall>>,
}

/// Receiving side of one pending call. Dropping it releases the entry.
#[derive(Debug)]
pub struct PendingHandle {
    id: u64,
    receiver: oneshot::Receiver<CallResult>,
    pending: Arc<DashMap<u64, PendingCall>>,
}

impl PendingHandle {
    /// Request id this handle waits on.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for PendingHandle {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

impl Correlator {
    /// Create an empty correlator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending call for `id`.
    pub fn register(&self, id: u64) -> PendingHandle {
        let (sender, receiver) = oneshot::channel();
        let call = PendingCall {
            sender,
            created_at: Instant::now(),
        };

        if self.pending.insert(id, call).is_some() {
            warn!("request id {} registered twice, dropping the older waiter", id);
        }

        PendingHandle {
            id,
            receiver,
            pending: Arc::clone(&self.pending),
        }
    }

    /// Resolve the pending call for `id`.
    ///
    /// Returns `false` when no call is waiting, which means the response is a
    /// duplicate or arrived after its caller gave up.
    pub fn complete(&self, id: u64, result: CallResult) -> bool {
        let Some((_, call)) = self.pending.remove(&id) else {
            warn!("no pending call for request id {}, dropping late or duplicate result", id);
            return false;
        };

        debug!(
            "completing request {} after {:?}",
            id,
            call.created_at.elapsed()
        );

        // The receiver may have been dropped between removal and send
        call.sender.send(result).is_ok()
    }

    /// Fail every listed call that is still pending.
    pub fn fail_all(&self, ids: impl IntoIterator<Item = u64>, error: &Error) {
        for id in ids {
            if let Some((_, call)) = self.pending.remove(&id) {
                let _ = call.sender.send(Err(error.clone()));
            }
        }
    }

    /// Wait for the pending call to resolve or `timeout` to elapse.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when nothing arrives in time, or the error the
    /// call was completed with.
    pub async fn wait(&self, mut handle: PendingHandle, timeout: Duration) -> Result<ResponseBody> {
        match tokio::time::timeout(timeout, &mut handle.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Network(format!(
                "pending call {} was dropped without a result",
                handle.id
            ))),
            Err(_) => {
                self.pending.remove(&handle.id);
                debug!("request {} timed out after {:?}", handle.id, timeout);
                Err(Error::Timeout(timeout))
            }
        }
    }

    /// Whether a call is pending for `id`.
    #[must_use]
    pub fn contains(&self, id: u64) -> bool {
        self.pending.contains_key(&id)
    }

    /// Number of pending calls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no call is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Status;
    use serde_json::json;

    #[tokio::test]
    async fn test_complete_resolves_waiter() {
        let correlator = Correlator::new();
        let handle = correlator.register(1);
        assert!(correlator.contains(1));

        assert!(correlator.complete(1, Ok(ResponseBody::success(json!("hello")))));

        let body = correlator
            .wait(handle, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(body.value, json!("hello"));
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn test_second_completion_is_noop() {
        let correlator = Correlator::new();
        let handle = correlator.register(2);

        assert!(correlator.complete(2, Ok(ResponseBody::status(Status::Success))));
        assert!(!correlator.complete(2, Ok(ResponseBody::failure("late"))));

        let body = correlator
            .wait(handle, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(body.status, Status::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_entry() {
        let correlator = Correlator::new();
        let handle = correlator.register(3);

        let started = tokio::time::Instant::now();
        let err = correlator
            .wait(handle, Duration::from_millis(500))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout(_)));
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(!correlator.contains(3));
        assert!(!correlator.complete(3, Ok(ResponseBody::heartbeat())));
    }

    #[tokio::test]
    async fn test_dropped_handle_releases_entry() {
        let correlator = Correlator::new();
        let handle = correlator.register(4);
        assert_eq!(correlator.len(), 1);

        drop(handle);
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn test_fail_all_delivers_error() {
        let correlator = Correlator::new();
        let first = correlator.register(5);
        let second = correlator.register(6);

        correlator.fail_all([5, 6, 7], &Error::Network("connection lost".to_string()));

        for handle in [first, second] {
            let err = correlator
                .wait(handle, Duration::from_secs(1))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Network(_)));
        }
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_completion_from_other_task() {
        let correlator = Correlator::new();
        let handles: Vec<_> = (0..100).map(|id| correlator.register(id)).collect();

        let completer = correlator.clone();
        tokio::spawn(async move {
            for id in (0..100).rev() {
                completer.complete(id, Ok(ResponseBody::success(json!(id))));
            }
        });

        for (id, handle) in handles.into_iter().enumerate() {
            let body = correlator
                .wait(handle, Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(body.value, json!(id));
        }
        assert!(correlator.is_empty());
    }
}
