//! Filter stage: evaluates the compiled rule tree against every record
//! from one sensor and fans survivors out to the pipeline processors.

use sentra_core::{EnvelopePool, FilterOperator, PipelineError, SharedEnvelope};
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Created,
    Running,
    Stopped,
}

/// Per-sensor filter worker.
///
/// The worker constructs and owns its inbound channel. The sensor pipe's
/// scanner holds the only sender once the worker is running, so the
/// channel closes exactly when the scanner exits and the evaluation loop
/// drains the remainder and finishes on its own.
pub struct FilterWorker {
    name: String,
    inbound_tx: Option<mpsc::Sender<SharedEnvelope>>,
    inbound_rx: Option<mpsc::Receiver<SharedEnvelope>>,
    outbound: Vec<mpsc::Sender<SharedEnvelope>>,
    filter: Arc<FilterOperator>,
    pool: Arc<EnvelopePool>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    state: WorkerState,
}

impl FilterWorker {
    pub fn new(
        name: impl Into<String>,
        capacity: usize,
        filter: Arc<FilterOperator>,
        pool: Arc<EnvelopePool>,
        outbound: Vec<mpsc::Sender<SharedEnvelope>>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        Self {
            name: name.into(),
            inbound_tx: Some(inbound_tx),
            inbound_rx: Some(inbound_rx),
            outbound,
            filter,
            pool,
            cancel: CancellationToken::new(),
            task: None,
            state: WorkerState::Created,
        }
    }

    /// Sender for the upstream sensor pipe. Available until the worker
    /// starts; starting drops the worker's own copy so only the upstream
    /// keeps the channel open.
    pub fn sender(&self) -> Option<mpsc::Sender<SharedEnvelope>> {
        self.inbound_tx.clone()
    }

    /// Spin up the evaluation task.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        if self.state != WorkerState::Created {
            return Err(PipelineError::AlreadyStarted {
                operation: "FilterWorker::start",
            });
        }
        let inbound = self.inbound_rx.take().ok_or_else(|| {
            PipelineError::invalid_operation("FilterWorker::start", "inbound channel is gone")
        })?;
        self.inbound_tx = None;

        let name = self.name.clone();
        let outbound = std::mem::take(&mut self.outbound);
        let filter = Arc::clone(&self.filter);
        let pool = Arc::clone(&self.pool);
        let cancel = self.cancel.clone();
        self.task = Some(tokio::spawn(run(
            name, inbound, outbound, filter, pool, cancel,
        )));
        self.state = WorkerState::Running;
        Ok(())
    }

    /// Drain and stop. On a clean shutdown the inbound channel has
    /// already closed and the task has finished; the cancellation token
    /// covers an upstream that never closed its side.
    pub async fn kill(&mut self) -> Result<(), PipelineError> {
        match self.state {
            WorkerState::Created => {
                return Err(PipelineError::NotStarted {
                    operation: "FilterWorker::kill",
                })
            }
            WorkerState::Stopped => {
                return Err(PipelineError::AlreadyStopped {
                    operation: "FilterWorker::kill",
                })
            }
            WorkerState::Running => {}
        }
        self.cancel.cancel();
        self.state = WorkerState::Stopped;
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|join_error| PipelineError::System(io::Error::other(join_error)))?;
        }
        Ok(())
    }
}

async fn run(
    name: String,
    mut inbound: mpsc::Receiver<SharedEnvelope>,
    outbound: Vec<mpsc::Sender<SharedEnvelope>>,
    filter: Arc<FilterOperator>,
    pool: Arc<EnvelopePool>,
    cancel: CancellationToken,
) {
    debug!(worker = %name, fan_out = outbound.len(), "filter worker started");
    loop {
        // Biased toward the channel: queued records drain before the
        // cancellation is honored.
        tokio::select! {
            biased;
            received = inbound.recv() => match received {
                Some(envelope) => evaluate(&name, envelope, &outbound, &filter, &pool).await,
                None => break,
            },
            () = cancel.cancelled() => break,
        }
    }
    debug!(worker = %name, "filter worker stopped");
}

async fn evaluate(
    name: &str,
    envelope: SharedEnvelope,
    outbound: &[mpsc::Sender<SharedEnvelope>],
    filter: &FilterOperator,
    pool: &EnvelopePool,
) {
    if filter.should_drop(&envelope.record) {
        debug!(worker = %name, event = %envelope.record.event_name, "record dropped by filter");
        pool.recycle(envelope);
        return;
    }
    if outbound.is_empty() {
        // Sensor feeds no pipeline; the record has no terminal consumer.
        pool.recycle(envelope);
        return;
    }

    // One pending disposition per downstream, counted before the first
    // enqueue so a fast consumer cannot observe a transient zero.
    envelope.retain(outbound.len() as i32);
    for sender in outbound {
        if let Err(failed) = sender.send(Arc::clone(&envelope)).await {
            warn!(worker = %name, "downstream processor is gone, releasing record");
            pool.release(failed.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentra_core::Record;

    fn deny_bash_filter() -> Arc<FilterOperator> {
        Arc::new(
            FilterOperator::from_yaml(
                r"
version: '1'
deny:
  shell:
    condition:
      eventname|contains: bash
",
            )
            .expect("filter compile failed"),
        )
    }

    fn envelope_for(pool: &EnvelopePool, event: &str) -> SharedEnvelope {
        let mut envelope = pool.acquire();
        envelope.record = Record {
            event_name: event.to_string(),
            ..Record::default()
        };
        EnvelopePool::share(envelope)
    }

    #[tokio::test]
    async fn test_denied_records_are_recycled() {
        let pool = EnvelopePool::new();
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let mut worker = FilterWorker::new(
            "sensor-a",
            8,
            deny_bash_filter(),
            Arc::clone(&pool),
            vec![out_tx],
        );
        let upstream = worker.sender().expect("sender available before start");
        worker.start().expect("start failed");

        upstream
            .send(envelope_for(&pool, "bashReadline"))
            .await
            .expect("send failed");
        upstream
            .send(envelope_for(&pool, "processCreate"))
            .await
            .expect("send failed");

        let delivered = out_rx.recv().await.expect("record missing");
        assert_eq!(delivered.record.event_name, "processCreate");
        assert_eq!(delivered.ref_count(), 1);
        assert_eq!(pool.recycled(), 1, "denied record went back to the pool");

        drop(upstream);
        worker.kill().await.expect("kill failed");
    }

    #[tokio::test]
    async fn test_fan_out_retains_per_edge() {
        let pool = EnvelopePool::new();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let mut worker = FilterWorker::new(
            "sensor-a",
            8,
            deny_bash_filter(),
            Arc::clone(&pool),
            vec![tx_a, tx_b],
        );
        let upstream = worker.sender().expect("sender available before start");
        worker.start().expect("start failed");

        upstream
            .send(envelope_for(&pool, "netConnect"))
            .await
            .expect("send failed");

        let first = rx_a.recv().await.expect("first copy missing");
        let second = rx_b.recv().await.expect("second copy missing");
        assert!(Arc::ptr_eq(&first, &second), "both edges share one envelope");
        assert_eq!(first.ref_count(), 2);

        drop(upstream);
        worker.kill().await.expect("kill failed");
    }

    #[tokio::test]
    async fn test_worker_exits_on_channel_close() {
        let pool = EnvelopePool::new();
        let (out_tx, _out_rx) = mpsc::channel(8);
        let mut worker = FilterWorker::new(
            "sensor-a",
            8,
            deny_bash_filter(),
            Arc::clone(&pool),
            vec![out_tx],
        );
        let upstream = worker.sender().expect("sender available before start");
        worker.start().expect("start failed");

        drop(upstream);
        worker.kill().await.expect("kill failed");
    }

    #[tokio::test]
    async fn test_kill_guards() {
        let pool = EnvelopePool::new();
        let mut worker =
            FilterWorker::new("sensor-a", 8, deny_bash_filter(), pool, Vec::new());

        assert!(matches!(
            worker.kill().await,
            Err(PipelineError::NotStarted { .. })
        ));

        worker.start().expect("start failed");
        assert!(matches!(
            worker.start(),
            Err(PipelineError::AlreadyStarted { .. })
        ));

        worker.kill().await.expect("kill failed");
        assert!(matches!(
            worker.kill().await,
            Err(PipelineError::AlreadyStopped { .. })
        ));
    }
}
