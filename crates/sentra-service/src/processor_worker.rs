//! Processor stage: the per-pipeline transform between the filter
//! workers and the pipeline's exporter.

use sentra_core::{EnvelopePool, PipelineError, SharedEnvelope};
use std::collections::BTreeMap;
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

/// Per-pipeline processor worker.
///
/// The transform is identity today; parser normalization, correlation,
/// and signature stages slot in here without changing the channel
/// contract. Several filter workers may hold senders to the inbound
/// channel (fan-in); it closes when the last of them exits. Reference
/// counts are untouched at this stage: each processor has exactly one
/// downstream, so the filter's retain already accounts for the exporter.
pub struct ProcessorWorker {
    name: String,
    /// Declared event shapes per sensor feeding this pipeline; future
    /// parser stages validate and type records against these.
    #[allow(dead_code)]
    events_header: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    inbound_tx: Option<mpsc::Sender<SharedEnvelope>>,
    inbound_rx: Option<mpsc::Receiver<SharedEnvelope>>,
    outbound: Option<mpsc::Sender<SharedEnvelope>>,
    pool: Arc<EnvelopePool>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    state: WorkerState,
}

impl ProcessorWorker {
    pub fn new(
        name: impl Into<String>,
        capacity: usize,
        events_header: BTreeMap<String, BTreeMap<String, Vec<String>>>,
        pool: Arc<EnvelopePool>,
        outbound: mpsc::Sender<SharedEnvelope>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        Self {
            name: name.into(),
            events_header,
            inbound_tx: Some(inbound_tx),
            inbound_rx: Some(inbound_rx),
            outbound: Some(outbound),
            pool,
            cancel: CancellationToken::new(),
            task: None,
            state: WorkerState::Created,
        }
    }

    /// Sender for an upstream filter worker. Available until the worker
    /// starts.
    pub fn sender(&self) -> Option<mpsc::Sender<SharedEnvelope>> {
        self.inbound_tx.clone()
    }

    pub fn start(&mut self) -> Result<(), PipelineError> {
        if self.state != WorkerState::Created {
            return Err(PipelineError::AlreadyStarted {
                operation: "ProcessorWorker::start",
            });
        }
        let inbound = self.inbound_rx.take().ok_or_else(|| {
            PipelineError::invalid_operation("ProcessorWorker::start", "inbound channel is gone")
        })?;
        let outbound = self.outbound.take().ok_or_else(|| {
            PipelineError::invalid_operation("ProcessorWorker::start", "outbound channel is gone")
        })?;
        self.inbound_tx = None;

        let name = self.name.clone();
        let pool = Arc::clone(&self.pool);
        let cancel = self.cancel.clone();
        self.task = Some(tokio::spawn(run(name, inbound, outbound, pool, cancel)));
        self.state = WorkerState::Running;
        Ok(())
    }

    /// Drain and stop; same contract as the filter worker.
    pub async fn kill(&mut self) -> Result<(), PipelineError> {
        match self.state {
            WorkerState::Created => {
                return Err(PipelineError::NotStarted {
                    operation: "ProcessorWorker::kill",
                })
            }
            WorkerState::Stopped => {
                return Err(PipelineError::AlreadyStopped {
                    operation: "ProcessorWorker::kill",
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
    outbound: mpsc::Sender<SharedEnvelope>,
    pool: Arc<EnvelopePool>,
    cancel: CancellationToken,
) {
    debug!(processor = %name, "processor worker started");
    loop {
        tokio::select! {
            biased;
            received = inbound.recv() => match received {
                Some(envelope) => {
                    if let Err(failed) = outbound.send(envelope).await {
                        warn!(processor = %name, "exporter is gone, releasing record");
                        pool.release(failed.0);
                    }
                }
                None => break,
            },
            () = cancel.cancelled() => break,
        }
    }
    debug!(processor = %name, "processor worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentra_core::Record;

    fn envelope_for(pool: &EnvelopePool, event: &str) -> SharedEnvelope {
        let mut envelope = pool.acquire();
        envelope.record = Record {
            event_name: event.to_string(),
            ..Record::default()
        };
        let shared = EnvelopePool::share(envelope);
        shared.retain(1);
        shared
    }

    #[tokio::test]
    async fn test_pass_through_preserves_order_and_counts() {
        let pool = EnvelopePool::new();
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let mut worker =
            ProcessorWorker::new("pipeline-a", 8, BTreeMap::new(), Arc::clone(&pool), out_tx);
        let upstream = worker.sender().expect("sender available before start");
        worker.start().expect("start failed");

        for event in ["first", "second"] {
            upstream
                .send(envelope_for(&pool, event))
                .await
                .expect("send failed");
        }

        let first = out_rx.recv().await.expect("record missing");
        let second = out_rx.recv().await.expect("record missing");
        assert_eq!(first.record.event_name, "first");
        assert_eq!(second.record.event_name, "second");
        assert_eq!(first.ref_count(), 1, "processor leaves counts untouched");

        drop(upstream);
        worker.kill().await.expect("kill failed");
    }

    #[tokio::test]
    async fn test_gone_exporter_releases_record() {
        let pool = EnvelopePool::new();
        let (out_tx, out_rx) = mpsc::channel(8);
        drop(out_rx);
        let mut worker =
            ProcessorWorker::new("pipeline-a", 8, BTreeMap::new(), Arc::clone(&pool), out_tx);
        let upstream = worker.sender().expect("sender available before start");
        worker.start().expect("start failed");

        upstream
            .send(envelope_for(&pool, "orphan"))
            .await
            .expect("send failed");
        drop(upstream);
        worker.kill().await.expect("kill failed");

        assert_eq!(pool.recycled(), 1, "record released when exporter is gone");
    }

    #[tokio::test]
    async fn test_kill_guards() {
        let pool = EnvelopePool::new();
        let (out_tx, _out_rx) = mpsc::channel(8);
        let mut worker = ProcessorWorker::new("pipeline-a", 8, BTreeMap::new(), pool, out_tx);

        assert!(matches!(
            worker.kill().await,
            Err(PipelineError::NotStarted { .. })
        ));
        worker.start().expect("start failed");
        worker.kill().await.expect("kill failed");
        assert!(matches!(
            worker.kill().await,
            Err(PipelineError::AlreadyStopped { .. })
        ));
    }
}
