//! Core building blocks for the sentra telemetry daemon: the record
//! envelope and its pool, the filter rule engine, and the error taxonomy
//! shared by the runtime.

pub mod envelope;
pub mod error;
pub mod filter;

pub use envelope::{Envelope, EnvelopePool, PoolTag, Record, SharedEnvelope};
pub use error::{FilterError, PipelineError};
pub use filter::{FilterMode, FilterOperator};
