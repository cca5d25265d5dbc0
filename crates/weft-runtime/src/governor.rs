//! Bounded concurrency governor for LLM calls.
//!
//! Every actor that issues an LLM call (coordinator injection handler,
//! sub-agent reply loop, spawned-agent loop, RPC chat path) acquires a
//! permit before the call and holds it for the duration. A limit of 1
//! serializes all LLM traffic; the default keeps bursts of simultaneously
//! awakened sub-agents below provider rate limits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::info;

use weft_types::WeftError;

/// Default number of concurrent LLM calls.
pub const DEFAULT_LLM_CONCURRENCY: usize = 5;

/// RAII permit for one in-flight LLM call. Dropping the permit releases the
/// slot on every exit path, including unwinding.
#[derive(Debug)]
pub struct LlmPermit {
    _permit: OwnedSemaphorePermit,
}

/// Counting semaphore with a reconfigurable capacity (floor 1).
pub struct ConcurrencyGovernor {
    semaphore: Arc<Semaphore>,
    limit: AtomicUsize,
    /// Serializes resizes so grow/shrink arithmetic never interleaves.
    resize: Mutex<()>,
}

impl ConcurrencyGovernor {
    /// Create a governor with the given capacity (values below 1 are raised
    /// to 1).
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit: AtomicUsize::new(limit),
            resize: Mutex::new(()),
        }
    }

    /// Acquire a permit, waiting until one frees up or `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<LlmPermit, WeftError> {
        tokio::select! {
            _ = cancel.cancelled() => {
                Err(WeftError::Canceled("llm permit acquisition cancelled".into()))
            }
            permit = self.semaphore.clone().acquire_owned() => {
                permit
                    .map(|p| LlmPermit { _permit: p })
                    .map_err(|_| WeftError::Unavailable("concurrency governor closed".into()))
            }
        }
    }

    /// Current capacity.
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::SeqCst)
    }

    /// Permits currently held.
    pub fn in_flight(&self) -> usize {
        self.limit().saturating_sub(self.semaphore.available_permits())
    }

    /// Reconfigure the capacity. Growing takes effect immediately; shrinking
    /// waits for enough in-flight calls to finish before retiring their
    /// slots.
    pub async fn set_limit(&self, new_limit: usize) {
        let new_limit = new_limit.max(1);
        let _guard = self.resize.lock().await;
        let current = self.limit.load(Ordering::SeqCst);
        if new_limit > current {
            self.semaphore.add_permits(new_limit - current);
        } else if new_limit < current {
            let retire = (current - new_limit) as u32;
            match self.semaphore.acquire_many(retire).await {
                Ok(permits) => permits.forget(),
                Err(_) => return,
            }
        }
        self.limit.store(new_limit, Ordering::SeqCst);
        info!(limit = new_limit, "llm concurrency limit updated");
    }
}

impl Default for ConcurrencyGovernor {
    fn default() -> Self {
        Self::new(DEFAULT_LLM_CONCURRENCY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_floor_of_one() {
        let governor = ConcurrencyGovernor::new(0);
        assert_eq!(governor.limit(), 1);
    }

    #[tokio::test]
    async fn test_bound_is_enforced() {
        let governor = Arc::new(ConcurrencyGovernor::new(2));
        let peak = Arc::new(AtomicUsize::new(0));
        let live = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::new();
        for _ in 0..10 {
            let governor = governor.clone();
            let peak = peak.clone();
            let live = live.clone();
            workers.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                let _permit = governor.acquire(&cancel).await.unwrap();
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                live.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for worker in workers {
            worker.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2, "peak {} > limit", peak.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_acquire_is_cancellable() {
        let governor = Arc::new(ConcurrencyGovernor::new(1));
        let cancel = CancellationToken::new();
        let _held = governor.acquire(&cancel).await.unwrap();

        let waiter = {
            let governor = governor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { governor.acquire(&cancel).await })
        };
        cancel.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, WeftError::Canceled(_)));
    }

    #[tokio::test]
    async fn test_resize() {
        let governor = ConcurrencyGovernor::new(2);
        governor.set_limit(4).await;
        assert_eq!(governor.limit(), 4);

        governor.set_limit(1).await;
        assert_eq!(governor.limit(), 1);

        let cancel = CancellationToken::new();
        let _p1 = governor.acquire(&cancel).await.unwrap();
        assert_eq!(governor.in_flight(), 1);
    }
}
