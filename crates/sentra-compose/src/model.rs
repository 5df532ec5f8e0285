use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Raw serde shape of a compose document, mirrored field for field.
#[derive(Debug, Deserialize)]
pub(crate) struct ComposeDocument {
    #[serde(default)]
    pub sensors: BTreeMap<String, SensorEntry>,
    #[serde(default)]
    pub exporters: BTreeMap<String, ExporterEntry>,
    pub service: ServiceEntry,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SensorEntry {
    #[serde(default)]
    pub exec_path: String,
    #[serde(default)]
    pub param: String,
    #[serde(default)]
    pub run_as_root: bool,
    #[serde(default)]
    pub events_header: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ExporterEntry {
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub timeout: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServiceEntry {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub description: String,
    /// Optional target platform pin; when present it must match the host.
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub pipelines: BTreeMap<String, PipelineEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PipelineEntry {
    #[serde(default)]
    pub sensors: Vec<String>,
    #[serde(default)]
    pub exporter: String,
}

/// A validated sensor declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorSpec {
    pub name: String,
    pub exec_path: PathBuf,
    pub param: String,
    pub run_as_root: bool,
    /// Event name → ordered field names declared for that event.
    pub events_header: BTreeMap<String, Vec<String>>,
}

impl SensorSpec {
    /// Argument vector for the sensor subprocess: the parameter string
    /// split on whitespace. An empty parameter yields no arguments, so the
    /// sensor execs with argv = [exec_path] only.
    pub fn argv(&self) -> Vec<String> {
        self.param.split_whitespace().map(str::to_string).collect()
    }
}

/// Where an exporter delivers its records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    File(PathBuf),
    Network(SocketAddr),
}

impl Destination {
    pub fn mode(&self) -> &'static str {
        match self {
            Destination::File(_) => "file",
            Destination::Network(_) => "network",
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::File(path) => write!(f, "{}", path.display()),
            Destination::Network(addr) => write!(f, "{addr}"),
        }
    }
}

/// A validated exporter declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExporterSpec {
    pub name: String,
    pub destination: Destination,
    /// Per-record delivery timeout.
    pub timeout: Duration,
}

/// A validated pipeline: resolved sensors feeding one resolved exporter.
#[derive(Debug, Clone)]
pub struct PipelineSpec {
    pub name: String,
    pub sensors: Vec<Arc<SensorSpec>>,
    pub exporter: Arc<ExporterSpec>,
}

/// Host facts plus the declared pipelines.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub machine: String,
    pub os: String,
    pub arch: String,
    pub group: String,
    pub description: String,
    pub pipelines: BTreeMap<String, PipelineSpec>,
}

/// A fully resolved and validated compose document. Frozen after load.
#[derive(Debug, Clone)]
pub struct Compose {
    pub sensors: BTreeMap<String, Arc<SensorSpec>>,
    pub exporters: BTreeMap<String, Arc<ExporterSpec>>,
    pub service: ServiceSpec,
}

impl Compose {
    pub fn sensor(&self, name: &str) -> Option<&Arc<SensorSpec>> {
        self.sensors.get(name)
    }

    pub fn exporter(&self, name: &str) -> Option<&Arc<ExporterSpec>> {
        self.exporters.get(name)
    }
}

/// Stringifier emitting a document equivalent to the one that was loaded:
/// same sensors, exporters, and pipelines, deterministically ordered.
impl fmt::Display for Compose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "sensors:")?;
        for (name, sensor) in &self.sensors {
            writeln!(f, "  {name}:")?;
            writeln!(f, "    exec_path: '{}'", sensor.exec_path.display())?;
            writeln!(f, "    param: '{}'", sensor.param)?;
            writeln!(f, "    run_as_root: {}", sensor.run_as_root)?;
            writeln!(f, "    events_header:")?;
            for (event, fields) in &sensor.events_header {
                writeln!(f, "      {event}: [{}]", fields.join(", "))?;
            }
        }
        writeln!(f, "exporters:")?;
        for (name, exporter) in &self.exporters {
            writeln!(f, "  {name}:")?;
            writeln!(f, "    mode: {}", exporter.destination.mode())?;
            writeln!(f, "    destination: '{}'", exporter.destination)?;
            writeln!(f, "    timeout: {}", exporter.timeout.as_millis())?;
        }
        writeln!(f, "service:")?;
        writeln!(f, "  group: '{}'", self.service.group)?;
        writeln!(f, "  description: '{}'", self.service.description)?;
        writeln!(f, "  pipelines:")?;
        for (name, pipeline) in &self.service.pipelines {
            writeln!(f, "    {name}:")?;
            let sensors: Vec<&str> = pipeline
                .sensors
                .iter()
                .map(|sensor| sensor.name.as_str())
                .collect();
            writeln!(f, "      sensors: [{}]", sensors.join(", "))?;
            writeln!(f, "      exporter: {}", pipeline.exporter.name)?;
        }
        Ok(())
    }
}
