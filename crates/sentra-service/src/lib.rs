//! The sentra runtime: the graph of concurrent workers that carries a
//! record from a sensor subprocess's standard output to an exporter sink.
//!
//! ```text
//! sensor subprocess ──stdout──▶ SensorPipe ──▶ FilterWorker ──▶ ProcessorWorker ──▶ Exporter ──▶ sink
//! ```
//!
//! Edges are bounded mpsc channels of pooled envelopes. Each stage owns
//! the senders to its downstream; a stage exiting closes the downstream
//! channel, so shutdown drains the graph stage by stage instead of
//! polling queue lengths.

pub mod exporter;
mod filter_worker;
mod processor_worker;
mod sensor_pipe;
mod service;

pub use filter_worker::FilterWorker;
pub use processor_worker::ProcessorWorker;
pub use sensor_pipe::{SensorPipe, WrapFn};
pub use service::{Service, ServiceHandle, ServiceState, DEFAULT_CHANNEL_CAPACITY};
