use std::path::PathBuf;

/// Errors raised while loading or validating a compose document. All of
/// them abort service construction.
#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("failed to read compose document: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse compose document: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The sensor executable does not exist on disk.
    #[error("sensor executable not found: {}", path.display())]
    SensorNotFound { path: PathBuf },

    #[error("invalid sensor '{name}': {reason}")]
    InvalidSensor { name: String, reason: String },

    #[error("invalid exporter '{name}': {reason}")]
    InvalidExporter { name: String, reason: String },

    #[error("invalid service section: {0}")]
    InvalidService(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensor_not_found_display() {
        let error = ComposeError::SensorNotFound {
            path: PathBuf::from("/opt/sensors/auditd"),
        };
        assert_eq!(
            error.to_string(),
            "sensor executable not found: /opt/sensors/auditd"
        );
    }

    #[test]
    fn test_invalid_exporter_display() {
        let error = ComposeError::InvalidExporter {
            name: "sink".to_string(),
            reason: "timeout is invalid".to_string(),
        };
        assert!(error.to_string().contains("sink"));
        assert!(error.to_string().contains("timeout"));
    }
}
