use std::io;

/// Runtime errors raised by the pipeline graph: sensor subprocesses,
/// workers, exporters, and the service orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The sensor subprocess could not be spawned.
    #[error("sensor '{sensor}' failed to spawn: {source}")]
    SpawnFailed {
        sensor: String,
        #[source]
        source: io::Error,
    },

    /// The sensor subprocess terminated with a non-zero status.
    #[error("sensor '{sensor}' exited with status {code}")]
    SensorExited { sensor: String, code: i32 },

    /// A start was issued on a component that is already started.
    #[error("{operation}: already started")]
    AlreadyStarted { operation: &'static str },

    /// A wait or stop was issued on a component that was never started.
    #[error("{operation}: not started")]
    NotStarted { operation: &'static str },

    /// A second wait was issued on a component.
    #[error("{operation}: already waited")]
    AlreadyWaited { operation: &'static str },

    /// A second stop was issued on a component.
    #[error("{operation}: already stopped")]
    AlreadyStopped { operation: &'static str },

    /// Any other operation issued in the wrong lifecycle state.
    #[error("{operation}: {reason}")]
    InvalidOperation {
        operation: &'static str,
        reason: &'static str,
    },

    /// An envelope could not be marshalled or unmarshalled.
    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Exporter mode accepted by configuration but not implemented by the
    /// runtime.
    #[error("exporter '{name}' uses unsupported mode '{mode}'")]
    UnsupportedExporter { name: String, mode: String },

    /// Any I/O failure not otherwise classified.
    #[error("i/o error: {0}")]
    System(#[from] io::Error),

    /// Ordered aggregation of failures collected during shutdown.
    #[error("{}", display_joined(.0))]
    Joined(Vec<PipelineError>),
}

impl PipelineError {
    pub fn invalid_operation(operation: &'static str, reason: &'static str) -> Self {
        PipelineError::InvalidOperation { operation, reason }
    }

    /// Whether this is one of the lifecycle-guard kinds (a method called
    /// in the wrong state, not a runtime failure).
    pub fn is_state_guard(&self) -> bool {
        matches!(
            self,
            PipelineError::AlreadyStarted { .. }
                | PipelineError::NotStarted { .. }
                | PipelineError::AlreadyWaited { .. }
                | PipelineError::AlreadyStopped { .. }
                | PipelineError::InvalidOperation { .. }
        )
    }

    /// Collapse a list of failures into one error value, preserving order.
    /// Returns `None` when the list is empty.
    pub fn join(mut errors: Vec<PipelineError>) -> Option<PipelineError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(PipelineError::Joined(errors)),
        }
    }

    /// Join a primary failure with any that followed it.
    pub fn join_with(first: PipelineError, mut rest: Vec<PipelineError>) -> PipelineError {
        if rest.is_empty() {
            first
        } else {
            rest.insert(0, first);
            PipelineError::Joined(rest)
        }
    }
}

fn display_joined(errors: &[PipelineError]) -> String {
    errors
        .iter()
        .map(PipelineError::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Compile-time errors from the filter rule engine. Evaluation itself
/// never fails.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("failed to parse filter document: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid rule field '{key}': {reason}")]
    InvalidRuleField { key: String, reason: String },

    #[error("invalid value for rule '{key}': expected a scalar or a sequence of scalars")]
    InvalidValueKind { key: String },
}
