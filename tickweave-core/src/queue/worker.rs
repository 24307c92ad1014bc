//! Async workers that run provider calls off the scheduling thread.
//!
//! Workers never touch queue state. Each call reports back with a single
//! message on an unbounded channel, which the queue drains with `try_recv`
//! at its pump point.

use crate::error::NarrativeError;
use crate::ids::RequestId;
use crate::narrative::NarrativeProvider;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Result of one provider call.
#[derive(Debug)]
pub struct WorkerMessage {
    pub id: RequestId,
    /// Zero-based attempt number this call belongs to.
    pub attempt: u32,
    pub result: Result<String, NarrativeError>,
    /// Wall-clock time the call took.
    pub elapsed: Duration,
}

/// Spawns provider calls on a tokio runtime and collects their results.
pub struct WorkerPool {
    handle: Handle,
    provider: Arc<dyn NarrativeProvider>,
    call_timeout: Duration,
    tx: mpsc::UnboundedSender<WorkerMessage>,
    rx: mpsc::UnboundedReceiver<WorkerMessage>,
    tasks: BTreeMap<RequestId, (u32, JoinHandle<()>)>,
    lost: Vec<(RequestId, u32)>,
}

impl WorkerPool {
    pub fn new(
        handle: Handle,
        provider: Arc<dyn NarrativeProvider>,
        call_timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            handle,
            provider,
            call_timeout,
            tx,
            rx,
            tasks: BTreeMap::new(),
            lost: Vec::new(),
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Start one call. Returns immediately.
    pub fn spawn(&mut self, id: RequestId, attempt: u32, prompt: String) {
        let provider = Arc::clone(&self.provider);
        let tx = self.tx.clone();
        let limit = self.call_timeout;
        debug!(request = %id, attempt, provider = provider.name(), "dispatching narrative call");

        let task = self.handle.spawn(async move {
            let started = Instant::now();
            let result = match tokio::time::timeout(limit, provider.call(&prompt)).await {
                Ok(result) => result,
                Err(_) => Err(NarrativeError::Timeout { duration: limit }),
            };
            // The receiver is gone only during teardown; nothing to report to.
            let _ = tx.send(WorkerMessage {
                id,
                attempt,
                result,
                elapsed: started.elapsed(),
            });
        });

        if let Some((_, previous)) = self.tasks.insert(id, (attempt, task)) {
            previous.abort();
        }
    }

    /// Every message that has arrived since the last drain, in arrival order.
    ///
    /// Tasks that ended without sending (panicked or aborted) are set aside
    /// for [`take_lost`](Self::take_lost).
    pub fn drain(&mut self) -> Vec<WorkerMessage> {
        // A task sends before it finishes, so anything finished now has
        // either queued its message already or never will.
        let finished: Vec<RequestId> = self
            .tasks
            .iter()
            .filter(|(_, (_, task))| task.is_finished())
            .map(|(id, _)| *id)
            .collect();

        let mut messages = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            trace!(request = %message.id, "worker message received");
            self.tasks.remove(&message.id);
            messages.push(message);
        }

        for id in finished {
            if let Some((attempt, _)) = self.tasks.remove(&id) {
                self.lost.push((id, attempt));
            }
        }
        messages
    }

    /// Calls whose task ended without reporting, found by the last drain.
    pub fn take_lost(&mut self) -> Vec<(RequestId, u32)> {
        std::mem::take(&mut self.lost)
    }

    /// Calls that have not reported back yet.
    pub fn running(&self) -> usize {
        self.tasks.values().filter(|(_, task)| !task.is_finished()).count()
    }

    /// Abort every running call.
    pub fn abort_all(&mut self) {
        for (_, (_, task)) in std::mem::take(&mut self.tasks) {
            task.abort();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl NarrativeProvider for Echo {
        async fn call(&self, prompt: &str) -> Result<String, NarrativeError> {
            Ok(format!("echo: {prompt}"))
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    struct Stuck;

    #[async_trait]
    impl NarrativeProvider for Stuck {
        async fn call(&self, _prompt: &str) -> Result<String, NarrativeError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(String::new())
        }

        fn name(&self) -> &str {
            "stuck"
        }
    }

    async fn drain_one(pool: &mut WorkerPool) -> WorkerMessage {
        loop {
            if let Some(message) = pool.drain().pop() {
                return message;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_call_reports_back() {
        let mut pool = WorkerPool::new(Handle::current(), Arc::new(Echo), Duration::from_secs(1));
        pool.spawn(RequestId::new(4), 0, "hi".into());
        let message = drain_one(&mut pool).await;
        assert_eq!(message.id, RequestId::new(4));
        assert_eq!(message.result, Ok("echo: hi".to_string()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_call_timeout_is_reported() {
        let limit = Duration::from_millis(20);
        let mut pool = WorkerPool::new(Handle::current(), Arc::new(Stuck), limit);
        pool.spawn(RequestId::new(1), 2, "slow".into());
        let message = drain_one(&mut pool).await;
        assert_eq!(message.attempt, 2);
        assert!(matches!(message.result, Err(NarrativeError::Timeout { .. })));
        assert_eq!(pool.running(), 0);
    }

    struct Panics;

    #[async_trait]
    impl NarrativeProvider for Panics {
        async fn call(&self, _prompt: &str) -> Result<String, NarrativeError> {
            panic!("provider bug");
        }

        fn name(&self) -> &str {
            "panics"
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_panicking_call_is_lost() {
        let mut pool = WorkerPool::new(Handle::current(), Arc::new(Panics), Duration::from_secs(1));
        pool.spawn(RequestId::new(9), 0, "boom".into());
        let lost = loop {
            assert!(pool.drain().is_empty());
            let lost = pool.take_lost();
            if !lost.is_empty() {
                break lost;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert_eq!(lost, vec![(RequestId::new(9), 0)]);
    }
}
