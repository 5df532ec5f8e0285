//! Append-only file exporter: one JSON object per line, unbuffered at
//! the application layer.

use super::Exporter;
use async_trait::async_trait;
use sentra_core::{EnvelopePool, PipelineError, SharedEnvelope};
use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExporterState {
    Created,
    Running,
    Stopped,
}

/// Writes each envelope to the destination file as one JSON line.
pub struct FileExporter {
    name: String,
    sink: Option<File>,
    tx: Option<mpsc::Sender<SharedEnvelope>>,
    rx: Option<mpsc::Receiver<SharedEnvelope>>,
    pool: Arc<EnvelopePool>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    state: ExporterState,
}

impl FileExporter {
    /// Open the destination for append, creating the file if absent.
    /// Fails when the parent directory is missing or the path is not
    /// writable.
    pub fn new(
        name: impl Into<String>,
        destination: &Path,
        capacity: usize,
        pool: Arc<EnvelopePool>,
    ) -> Result<Self, PipelineError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(destination)
            .map_err(PipelineError::System)?;
        let (tx, rx) = mpsc::channel(capacity);
        Ok(Self {
            name: name.into(),
            sink: Some(File::from_std(file)),
            tx: Some(tx),
            rx: Some(rx),
            pool,
            cancel: CancellationToken::new(),
            task: None,
            state: ExporterState::Created,
        })
    }
}

#[async_trait]
impl Exporter for FileExporter {
    fn name(&self) -> &str {
        &self.name
    }

    fn sender(&self) -> Option<mpsc::Sender<SharedEnvelope>> {
        self.tx.clone()
    }

    fn start(&mut self) -> Result<(), PipelineError> {
        if self.state != ExporterState::Created {
            return Err(PipelineError::AlreadyStarted {
                operation: "Exporter::start",
            });
        }
        let inbound = self.rx.take().ok_or_else(|| {
            PipelineError::invalid_operation("Exporter::start", "inbound channel is gone")
        })?;
        let sink = self.sink.take().ok_or_else(|| {
            PipelineError::invalid_operation("Exporter::start", "sink is gone")
        })?;
        // Processors hold the only senders from here on, so the channel
        // closes when the last processor exits.
        self.tx = None;

        let name = self.name.clone();
        let pool = Arc::clone(&self.pool);
        let cancel = self.cancel.clone();
        self.task = Some(tokio::spawn(run(name, inbound, sink, pool, cancel)));
        self.state = ExporterState::Running;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), PipelineError> {
        match self.state {
            ExporterState::Created => {
                return Err(PipelineError::NotStarted {
                    operation: "Exporter::stop",
                })
            }
            ExporterState::Stopped => {
                return Err(PipelineError::AlreadyStopped {
                    operation: "Exporter::stop",
                })
            }
            ExporterState::Running => {}
        }
        self.cancel.cancel();
        self.state = ExporterState::Stopped;
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
    mut sink: File,
    pool: Arc<EnvelopePool>,
    cancel: CancellationToken,
) {
    debug!(exporter = %name, "export task started");
    loop {
        tokio::select! {
            biased;
            received = inbound.recv() => match received {
                Some(envelope) => write_record(&name, envelope, &mut sink, &pool).await,
                None => break,
            },
            () = cancel.cancelled() => break,
        }
    }
    if let Err(err) = sink.flush().await {
        error!(exporter = %name, error = %err, "failed to flush sink");
    }
    debug!(exporter = %name, "export task stopped");
}

async fn write_record(
    name: &str,
    envelope: SharedEnvelope,
    sink: &mut File,
    pool: &EnvelopePool,
) {
    match serde_json::to_vec(&envelope.record) {
        Ok(mut line) => {
            line.push(b'\n');
            if let Err(err) = sink.write_all(&line).await {
                // A telemetry sink that stopped accepting writes is
                // unrecoverable.
                error!(exporter = %name, error = %err, "fatal: failed to write record");
                panic!("exporter '{name}' failed to write record: {err}");
            }
        }
        Err(err) => {
            error!(exporter = %name, error = %err, "failed to serialize record, rejecting")
        }
    }
    pool.release(envelope);
}
