//! Loading and validation: document → wrapper structs → resolved specs.

use crate::error::ComposeError;
use crate::model::{
    Compose, ComposeDocument, Destination, ExporterEntry, ExporterSpec, PipelineEntry,
    PipelineSpec, SensorEntry, SensorSpec, ServiceEntry, ServiceSpec,
};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

impl Compose {
    /// Load and validate a compose document from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Compose, ComposeError> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&text)
    }

    /// Parse and validate a compose document.
    pub fn from_yaml(text: &str) -> Result<Compose, ComposeError> {
        let document: ComposeDocument = serde_yaml::from_str(text)?;
        let sensors = resolve_sensors(document.sensors)?;
        let exporters = resolve_exporters(document.exporters)?;
        let service = resolve_service(document.service, &sensors, &exporters)?;
        debug!(
            sensors = sensors.len(),
            exporters = exporters.len(),
            pipelines = service.pipelines.len(),
            "compose document loaded"
        );
        Ok(Compose {
            sensors,
            exporters,
            service,
        })
    }
}

fn resolve_sensors(
    entries: BTreeMap<String, SensorEntry>,
) -> Result<BTreeMap<String, Arc<SensorSpec>>, ComposeError> {
    let mut sensors = BTreeMap::new();
    for (name, entry) in entries {
        if entry.exec_path.is_empty() {
            return Err(ComposeError::InvalidSensor {
                name,
                reason: "exec_path is empty".to_string(),
            });
        }
        let exec_path = PathBuf::from(&entry.exec_path);
        let metadata = match fs::metadata(&exec_path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ComposeError::SensorNotFound { path: exec_path })
            }
            Err(err) => return Err(ComposeError::Io(err)),
        };
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(ComposeError::InvalidSensor {
                name,
                reason: "exec_path is not executable".to_string(),
            });
        }
        if entry.events_header.is_empty() {
            return Err(ComposeError::InvalidSensor {
                name,
                reason: "events_header is empty".to_string(),
            });
        }
        sensors.insert(
            name.clone(),
            Arc::new(SensorSpec {
                name,
                exec_path,
                param: entry.param,
                run_as_root: entry.run_as_root,
                events_header: entry.events_header,
            }),
        );
    }
    Ok(sensors)
}

fn resolve_exporters(
    entries: BTreeMap<String, ExporterEntry>,
) -> Result<BTreeMap<String, Arc<ExporterSpec>>, ComposeError> {
    let mut exporters = BTreeMap::new();
    for (name, entry) in entries {
        if entry.destination.is_empty() {
            return Err(ComposeError::InvalidExporter {
                name,
                reason: "destination is empty".to_string(),
            });
        }
        let destination = match entry.mode.as_str() {
            "file" => {
                let path = PathBuf::from(&entry.destination);
                let parent = match path.parent() {
                    Some(parent) if !parent.as_os_str().is_empty() => parent,
                    _ => Path::new("."),
                };
                if !parent.is_dir() {
                    return Err(ComposeError::InvalidExporter {
                        name,
                        reason: format!(
                            "destination parent directory '{}' does not exist",
                            parent.display()
                        ),
                    });
                }
                Destination::File(path)
            }
            "network" => match parse_network_destination(&entry.destination) {
                Some(addr) => Destination::Network(addr),
                None => {
                    return Err(ComposeError::InvalidExporter {
                        name,
                        reason: format!("destination '{}' is not IP:port", entry.destination),
                    })
                }
            },
            other => {
                return Err(ComposeError::InvalidExporter {
                    name,
                    reason: format!("mode '{other}' is not supported"),
                })
            }
        };
        if entry.timeout <= 0 {
            return Err(ComposeError::InvalidExporter {
                name,
                reason: "timeout is invalid".to_string(),
            });
        }
        exporters.insert(
            name.clone(),
            Arc::new(ExporterSpec {
                name,
                destination,
                timeout: Duration::from_millis(entry.timeout as u64),
            }),
        );
    }
    Ok(exporters)
}

/// `host:port` with the host a literal IP; `localhost` is normalized to
/// `127.0.0.1` first. The `u16` parse bounds the port to [0, 65535].
fn parse_network_destination(destination: &str) -> Option<SocketAddr> {
    let normalized = destination.replacen("localhost", "127.0.0.1", 1);
    let (host, port) = normalized.rsplit_once(':')?;
    let ip: IpAddr = host.parse().ok()?;
    let port: u16 = port.parse().ok()?;
    Some(SocketAddr::new(ip, port))
}

fn resolve_service(
    entry: ServiceEntry,
    sensors: &BTreeMap<String, Arc<SensorSpec>>,
    exporters: &BTreeMap<String, Arc<ExporterSpec>>,
) -> Result<ServiceSpec, ComposeError> {
    if entry.group.is_empty() {
        return Err(ComposeError::InvalidService("group is empty".to_string()));
    }
    if entry.description.is_empty() {
        return Err(ComposeError::InvalidService(
            "description is empty".to_string(),
        ));
    }
    if entry.pipelines.is_empty() {
        return Err(ComposeError::InvalidService(
            "pipelines is empty".to_string(),
        ));
    }
    if !entry.os.is_empty() && entry.os != std::env::consts::OS {
        return Err(ComposeError::InvalidService(format!(
            "declared os '{}' does not match host os '{}'",
            entry.os,
            std::env::consts::OS
        )));
    }
    if !entry.arch.is_empty() && entry.arch != std::env::consts::ARCH {
        return Err(ComposeError::InvalidService(format!(
            "declared arch '{}' does not match host arch '{}'",
            entry.arch,
            std::env::consts::ARCH
        )));
    }

    let mut pipelines = BTreeMap::new();
    for (name, pipeline) in entry.pipelines {
        pipelines.insert(
            name.clone(),
            resolve_pipeline(name, pipeline, sensors, exporters)?,
        );
    }

    let machine = nix::unistd::gethostname()
        .map(|hostname| hostname.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(ServiceSpec {
        machine,
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        group: entry.group,
        description: entry.description,
        pipelines,
    })
}

fn resolve_pipeline(
    name: String,
    entry: PipelineEntry,
    sensors: &BTreeMap<String, Arc<SensorSpec>>,
    exporters: &BTreeMap<String, Arc<ExporterSpec>>,
) -> Result<PipelineSpec, ComposeError> {
    if entry.sensors.is_empty() {
        return Err(ComposeError::InvalidService(format!(
            "pipeline '{name}' has no sensors"
        )));
    }
    if entry.exporter.is_empty() {
        return Err(ComposeError::InvalidService(format!(
            "pipeline '{name}' has no exporter"
        )));
    }

    let mut resolved = Vec::with_capacity(entry.sensors.len());
    for sensor_name in &entry.sensors {
        let sensor = sensors.get(sensor_name).ok_or_else(|| {
            ComposeError::InvalidService(format!(
                "pipeline '{name}' references undefined sensor '{sensor_name}'"
            ))
        })?;
        resolved.push(Arc::clone(sensor));
    }
    let exporter = exporters.get(&entry.exporter).ok_or_else(|| {
        ComposeError::InvalidService(format!(
            "pipeline '{name}' references undefined exporter '{}'",
            entry.exporter
        ))
    })?;

    Ok(PipelineSpec {
        name,
        sensors: resolved,
        exporter: Arc::clone(exporter),
    })
}
