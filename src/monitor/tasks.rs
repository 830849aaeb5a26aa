//! Supervised background tasks
//!
//! Long waits (scaling, config consensus) run here instead of on the monitor
//! loop. Each task has a key so the loop can tell whether one is already in
//! flight for a service, and every task observes the pool shutdown signal.

use crate::common::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, warn};

pub struct TaskPool {
    tasks: Mutex<JoinSet<()>>,
    running: Arc<Mutex<BTreeSet<String>>>,
    shutdown_tx: watch::Sender<bool>,
}

/// Removes the task key when the task ends, aborted or not.
struct KeyGuard {
    key: String,
    running: Arc<Mutex<BTreeSet<String>>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.running.lock().remove(&self.key);
    }
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskPool {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            tasks: Mutex::new(JoinSet::new()),
            running: Arc::new(Mutex::new(BTreeSet::new())),
            shutdown_tx,
        }
    }

    /// Spawn `fut` under `key`. Returns false if a task with that key is
    /// still running.
    pub fn spawn<F>(&self, key: impl Into<String>, fut: F) -> bool
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let key = key.into();
        if !self.running.lock().insert(key.clone()) {
            return false;
        }
        let guard = KeyGuard {
            key,
            running: self.running.clone(),
        };
        let mut shutdown = self.shutdown_tx.subscribe();
        self.tasks.lock().spawn(async move {
            let guard = guard;
            tokio::select! {
                res = fut => match res {
                    Ok(()) => debug!(task = %guard.key, "task done"),
                    Err(e) => warn!(task = %guard.key, "task failed: {}", e),
                },
                _ = shutdown.changed() => debug!(task = %guard.key, "task cancelled"),
            }
        });
        true
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.running.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.running.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Collect finished tasks without blocking. Returns how many ended.
    pub fn reap(&self) -> usize {
        let mut tasks = self.tasks.lock();
        let mut reaped = 0;
        while let Some(res) = tasks.try_join_next() {
            if let Err(e) = res {
                if e.is_panic() {
                    warn!("background task panicked: {}", e);
                }
            }
            reaped += 1;
        }
        reaped
    }

    /// Signal every task to stop, then wait up to `grace` before aborting.
    pub async fn shutdown(&self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("abort {} background tasks after {:?}", tasks.len(), grace);
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}

/// Poll `predicate` every `poll` until it holds or `timeout` elapses.
///
/// Every bounded wait in the monitor goes through here.
pub async fn wait_until<F>(what: &str, timeout: Duration, poll: Duration, mut predicate: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Timeout(format!("{} after {:?}", what, timeout)));
        }
        tokio::time::sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_spawn_dedups_by_key() {
        let pool = TaskPool::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        assert!(pool.spawn("scale:ns/svc/web", async move {
            let _ = rx.await;
            Ok(())
        }));
        assert!(!pool.spawn("scale:ns/svc/web", async { Ok(()) }));
        assert!(pool.is_running("scale:ns/svc/web"));
        assert_eq!(pool.len(), 1);

        tx.send(()).unwrap();
        wait_until("task end", Duration::from_secs(1), Duration::from_millis(5), || {
            !pool.is_running("scale:ns/svc/web")
        })
        .await
        .unwrap();
        pool.reap();
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_cancels() {
        let pool = TaskPool::new();
        pool.spawn("forever", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        });
        pool.shutdown(Duration::from_secs(1)).await;
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_wait_until_times_out() {
        let calls = AtomicUsize::new(0);
        let res = wait_until("never", Duration::from_millis(30), Duration::from_millis(5), || {
            calls.fetch_add(1, Ordering::SeqCst);
            false
        })
        .await;
        assert!(matches!(res, Err(Error::Timeout(_))));
        assert!(calls.load(Ordering::SeqCst) > 1);
    }
}
