//! The single consumer of an endpoint's task queue.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::poll::{DefaultPollProcedure, PollContext, PollProcedure};
use crate::task::SensorTask;

/// Default capacity of an endpoint task queue.
pub const QUEUE_CAPACITY: usize = 10;

/// Drains one endpoint's queue, one task at a time.
pub struct PollWorker {
    endpoint: String,
    rx: mpsc::Receiver<SensorTask>,
    ctx: Arc<PollContext>,
    default_procedure: Arc<dyn PollProcedure>,
}

impl PollWorker {
    /// Create a worker and the sender side of its queue.
    pub fn new(
        endpoint: impl Into<String>,
        capacity: usize,
        ctx: Arc<PollContext>,
    ) -> (Self, mpsc::Sender<SensorTask>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = Self {
            endpoint: endpoint.into(),
            rx,
            ctx,
            default_procedure: Arc::new(DefaultPollProcedure),
        };
        (worker, tx)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Run tasks until the queue closes or `shutdown` flips to `true`.
    ///
    /// On shutdown the queue is closed and tasks already in it still run.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(endpoint = %self.endpoint, "Poll worker started");

        let mut stopping = *shutdown.borrow();
        if stopping {
            self.rx.close();
        }

        loop {
            let task = if stopping {
                self.rx.recv().await
            } else {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::debug!(endpoint = %self.endpoint, "Draining task queue");
                            self.rx.close();
                            stopping = true;
                        }
                        continue;
                    }
                    task = self.rx.recv() => task,
                }
            };

            match task {
                Some(task) => self.execute(task).await,
                None => break,
            }
        }

        tracing::info!(endpoint = %self.endpoint, "Poll worker stopped");
    }

    async fn execute(&self, task: SensorTask) {
        let procedure = task
            .procedure
            .clone()
            .unwrap_or_else(|| self.default_procedure.clone());

        if let Err(e) = procedure.run(&task, &self.ctx).await {
            tracing::debug!(
                endpoint = %self.endpoint,
                sensor = %task.sensor_id,
                error = %e,
                "Task finished with error"
            );
        }
    }

    /// Spawn the worker on the current runtime.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegisterMap;
    use crate::failure::FailureTracker;
    use crate::poll::PollError;
    use crate::sensor::{SensorTable, TaskKind};
    use crate::session::SessionRegistry;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use sensorlink_common::TopicBuilder;
    use sensorlink_framework::Publish;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct NullPublisher;

    #[async_trait]
    impl Publish for NullPublisher {
        async fn publish(&self, _topic: &str, _payload: Vec<u8>) -> sensorlink_framework::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recording {
        order: Mutex<Vec<String>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    #[async_trait]
    impl PollProcedure for Recording {
        async fn run(&self, task: &SensorTask, _ctx: &PollContext) -> Result<(), PollError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.order.lock().push(task.sensor_id.clone());
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn context() -> Arc<PollContext> {
        Arc::new(PollContext {
            sensors: Arc::new(SensorTable::default()),
            sessions: Arc::new(SessionRegistry::default()),
            failures: Arc::new(FailureTracker::default()),
            publisher: Arc::new(NullPublisher),
            registers: RegisterMap::default(),
            topics: TopicBuilder::default(),
        })
    }

    fn task(id: &str, procedure: Arc<dyn PollProcedure>) -> SensorTask {
        SensorTask {
            sensor_id: id.to_string(),
            address: 1,
            kind: TaskKind::DissolvedOxygen,
            attach: "dtu-1".to_string(),
            procedure: Some(procedure),
        }
    }

    #[tokio::test]
    async fn test_tasks_run_one_at_a_time_in_order() {
        let recording = Arc::new(Recording::default());
        let (worker, tx) = PollWorker::new("dtu-1", QUEUE_CAPACITY, context());
        let (_stop_tx, stop_rx) = watch::channel(false);
        let handle = worker.spawn(stop_rx);

        for id in ["a", "b", "c", "d"] {
            tx.send(task(id, recording.clone())).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        assert_eq!(*recording.order.lock(), vec!["a", "b", "c", "d"]);
        assert_eq!(recording.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_tasks() {
        let recording = Arc::new(Recording::default());
        let (worker, tx) = PollWorker::new("dtu-1", QUEUE_CAPACITY, context());

        for id in ["a", "b", "c"] {
            tx.send(task(id, recording.clone())).await.unwrap();
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        stop_tx.send(true).unwrap();
        worker.spawn(stop_rx).await.unwrap();

        assert_eq!(recording.order.lock().len(), 3);
        assert!(tx.is_closed());
    }
}
