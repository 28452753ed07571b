use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Bounded runner for background jobs (OVDC reconciliation, forced
/// policy removal, cluster deletion).
///
/// At most `max_concurrency` jobs run at once; the rest wait for a permit.
/// Every job receives the runner's cancellation token and is expected to
/// check it between units of work. A job cancelled while still queued is
/// run anyway, without a permit and with the token already cancelled, so
/// it can finish its vCD task and close its sessions.
pub struct TaskRunner {
    permits: Arc<Semaphore>,
    cancellation_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskRunner {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            cancellation_token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Queue a job. Returns immediately.
    pub fn spawn<F, Fut>(&self, name: &str, job: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let token = self.cancellation_token.clone();
        let name = name.to_string();

        let handle = tokio::spawn(async move {
            let _permit = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    tracing::info!(job = %name, "Job cancelled before start, running its cleanup");
                    None
                }
                permit = permits.acquire_owned() => permit.ok(),
            };
            tracing::debug!(job = %name, "Starting background job");
            job(token).await;
            tracing::debug!(job = %name, "Background job completed");
        });

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Jobs queued or running.
    pub fn active(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|t| !t.is_finished())
            .count()
    }

    /// Cancel all jobs and wait up to `timeout` for them to finish.
    pub async fn shutdown(&self, timeout: Duration) {
        self.cancellation_token.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));

        tokio::time::timeout(timeout, async {
            for task in tasks {
                if let Err(e) = task.await {
                    tracing::error!("Background job failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Background job shutdown timed out after {:?}", timeout);
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use similar_asserts::assert_eq;

    use super::*;

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let runner = TaskRunner::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for i in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let done = Arc::clone(&done);
            runner.spawn(&format!("job-{i}"), move |_| async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        wait_idle(&runner).await;
        assert_eq!(done.load(Ordering::SeqCst), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn shutdown_cancels_jobs() {
        let runner = TaskRunner::new(1);
        let observed = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&observed);
        runner.spawn("long", move |token| async move {
            token.cancelled().await;
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let seen = Arc::clone(&observed);
        runner.spawn("queued", move |token| async move {
            if token.is_cancelled() {
                seen.fetch_add(100, Ordering::SeqCst);
            } else {
                seen.fetch_add(10, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        runner.shutdown(Duration::from_secs(1)).await;

        // the queued job only ran its cancellation path
        assert_eq!(observed.load(Ordering::SeqCst), 101);
        assert_eq!(runner.active(), 0);
    }

    async fn wait_idle(runner: &TaskRunner) {
        while runner.active() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
