//! Process-wide cap on running question sessions.

use super::error::QuestionError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub const DEFAULT_MAX_CONCURRENT: usize = 64;

/// What `submit` does when every slot is taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionPolicy {
    /// Wait until a running session finishes.
    #[default]
    Block,
    /// Fail with `QuestionError::AtCapacity`.
    Reject,
}

struct Limits {
    max: usize,
    /// Permits still to retire after the bound was lowered below the running count.
    debt: usize,
}

struct Inner {
    semaphore: Arc<Semaphore>,
    limits: Mutex<Limits>,
    running: AtomicUsize,
}

impl Inner {
    fn limits(&self) -> MutexGuard<'_, Limits> {
        self.limits.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Held by a running session; gives its slot back (or retires it) on drop.
pub struct SessionPermit {
    permit: Option<OwnedSemaphorePermit>,
    inner: Arc<Inner>,
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        self.inner.running.fetch_sub(1, Ordering::SeqCst);
        if let Some(permit) = self.permit.take() {
            let mut limits = self.inner.limits();
            if limits.debt > 0 {
                limits.debt -= 1;
                permit.forget();
            }
        }
    }
}

pub struct ConcurrencyLimiter {
    inner: Arc<Inner>,
    policy: AdmissionPolicy,
    root: CancellationToken,
    tracker: TaskTracker,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrent: usize, policy: AdmissionPolicy, root: CancellationToken) -> Self {
        let max = max_concurrent.max(1);
        Self {
            inner: Arc::new(Inner {
                semaphore: Arc::new(Semaphore::new(max)),
                limits: Mutex::new(Limits { max, debt: 0 }),
                running: AtomicUsize::new(0),
            }),
            policy,
            root,
            tracker: TaskTracker::new(),
        }
    }

    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.limits().max
    }

    pub fn running(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Change the bound. Raising it admits waiters right away; lowering it takes effect
    /// as running sessions finish. Clamped to at least 1.
    pub fn set_max_concurrent(&self, n: usize) {
        let n = n.max(1);
        let mut limits = self.inner.limits();
        if n > limits.max {
            let mut grow = n - limits.max;
            let repaid = grow.min(limits.debt);
            limits.debt -= repaid;
            grow -= repaid;
            if grow > 0 {
                self.inner.semaphore.add_permits(grow);
            }
        } else if n < limits.max {
            let shrink = limits.max - n;
            let forgotten = self.inner.semaphore.forget_permits(shrink);
            limits.debt += shrink - forgotten;
        }
        log::info!("question concurrency limit {} -> {}", limits.max, n);
        limits.max = n;
    }

    /// Wait for (or, under `Reject`, try to take) a session slot.
    pub async fn acquire(&self) -> Result<SessionPermit, QuestionError> {
        if self.root.is_cancelled() {
            return Err(QuestionError::ShuttingDown);
        }
        let permit = match self.policy {
            AdmissionPolicy::Block => {
                let semaphore = self.inner.semaphore.clone();
                tokio::select! {
                    biased;
                    _ = self.root.cancelled() => return Err(QuestionError::ShuttingDown),
                    permit = semaphore.acquire_owned() => {
                        permit.map_err(|_| QuestionError::ShuttingDown)?
                    }
                }
            }
            AdmissionPolicy::Reject => match self.inner.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) => return Err(QuestionError::AtCapacity),
                Err(TryAcquireError::Closed) => return Err(QuestionError::ShuttingDown),
            },
        };
        self.inner.running.fetch_add(1, Ordering::SeqCst);
        Ok(SessionPermit {
            permit: Some(permit),
            inner: self.inner.clone(),
        })
    }

    /// Acquire a slot, then run `task` on the runtime while holding it.
    pub async fn submit<F>(&self, task: F) -> Result<(), QuestionError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = self.acquire().await?;
        self.spawn_with(permit, task);
        Ok(())
    }

    /// Run `task` under an already acquired permit.
    pub fn spawn_with<F>(&self, permit: SessionPermit, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(async move {
            let _permit = permit;
            task.await;
        });
    }

    /// Stop admitting work and wait for every submitted task to finish.
    pub async fn drain(&self) {
        self.root.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn blocks_past_the_bound_until_a_slot_frees() {
        let limiter = Arc::new(ConcurrencyLimiter::new(1, AdmissionPolicy::Block, CancellationToken::new()));
        let (release_tx, release_rx) = oneshot::channel::<()>();
        limiter
            .submit(async move {
                let _ = release_rx.await;
            })
            .await
            .unwrap();

        let second = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!second.is_finished());

        release_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), second)
            .await
            .expect("second acquire should proceed once the first task ends")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn reject_policy_fails_fast_at_capacity() {
        let limiter = ConcurrencyLimiter::new(1, AdmissionPolicy::Reject, CancellationToken::new());
        let held = limiter.acquire().await.unwrap();
        assert!(matches!(limiter.acquire().await, Err(QuestionError::AtCapacity)));
        drop(held);
        assert!(limiter.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn raising_the_bound_admits_waiters() {
        let limiter = Arc::new(ConcurrencyLimiter::new(1, AdmissionPolicy::Block, CancellationToken::new()));
        let _held = limiter.acquire().await.unwrap();
        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        limiter.set_max_concurrent(2);
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(limiter.max_concurrent(), 2);
    }

    #[tokio::test]
    async fn lowering_the_bound_retires_permits_as_sessions_finish() {
        let limiter = ConcurrencyLimiter::new(3, AdmissionPolicy::Reject, CancellationToken::new());
        let a = limiter.acquire().await.unwrap();
        let b = limiter.acquire().await.unwrap();
        limiter.set_max_concurrent(1);
        assert!(matches!(limiter.acquire().await, Err(QuestionError::AtCapacity)));
        drop(a);
        assert!(matches!(limiter.acquire().await, Err(QuestionError::AtCapacity)));
        drop(b);
        let c = limiter.acquire().await.unwrap();
        assert!(matches!(limiter.acquire().await, Err(QuestionError::AtCapacity)));
        drop(c);
        assert_eq!(limiter.running(), 0);
    }

    #[tokio::test]
    async fn cancellation_releases_blocked_submitters() {
        let root = CancellationToken::new();
        let limiter = Arc::new(ConcurrencyLimiter::new(1, AdmissionPolicy::Block, root.clone()));
        let _held = limiter.acquire().await.unwrap();
        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        root.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(QuestionError::ShuttingDown)));
        assert!(matches!(limiter.acquire().await, Err(QuestionError::ShuttingDown)));
    }

    #[test]
    fn zero_is_clamped_to_one() {
        let limiter = ConcurrencyLimiter::new(0, AdmissionPolicy::Block, CancellationToken::new());
        assert_eq!(limiter.max_concurrent(), 1);
        limiter.set_max_concurrent(0);
        assert_eq!(limiter.max_concurrent(), 1);
    }
}
