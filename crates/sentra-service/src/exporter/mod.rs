//! Terminal sinks. An exporter serializes each surviving envelope to
//! bytes and delivers it to a destination; it is also the stage that
//! performs the terminal reference-count decrement and pool return.
//!
//! Only the file sink exists today. Network destinations are validated by
//! the compose loader but rejected at service construction until a
//! network sink is implemented.

mod file;

pub use file::FileExporter;

use async_trait::async_trait;
use sentra_core::{PipelineError, SharedEnvelope};
use tokio::sync::mpsc;

/// A terminal sink fed by one or more pipeline processors.
#[async_trait]
pub trait Exporter: Send {
    fn name(&self) -> &str;

    /// Mint a sender for a processor. `None` once the export task has
    /// started and the exporter has given up its own handle.
    fn sender(&self) -> Option<mpsc::Sender<SharedEnvelope>>;

    /// Spawn the export task.
    fn start(&mut self) -> Result<(), PipelineError>;

    /// Drain, stop the task, flush and close the sink.
    async fn stop(&mut self) -> Result<(), PipelineError>;
}
