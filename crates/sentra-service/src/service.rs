//! Service orchestrator: builds the worker graph from a compose
//! document, starts it bottom-up, supervises the sensors, and tears the
//! graph down top-down with every stage's errors collected.

use crate::exporter::{Exporter, FileExporter};
use crate::filter_worker::FilterWorker;
use crate::processor_worker::ProcessorWorker;
use crate::sensor_pipe::{SensorPipe, WrapFn};
use futures::stream::{FuturesUnordered, StreamExt};
use sentra_compose::{Compose, Destination};
use sentra_core::{EnvelopePool, FilterOperator, PipelineError, Record, SharedEnvelope};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Default bound for every channel edge in the graph.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Lifecycle of a started service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    Stopping,
    Stopped,
}

/// The built (not yet started) worker graph. Owns every worker, the
/// envelope pool, and the compiled rule engine for its lifetime.
pub struct Service {
    compose: Arc<Compose>,
    pool: Arc<EnvelopePool>,
    exporters: BTreeMap<String, Box<dyn Exporter>>,
    processors: BTreeMap<String, ProcessorWorker>,
    filters: BTreeMap<String, FilterWorker>,
    pipes: BTreeMap<String, SensorPipe>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("exporters", &self.exporters.keys().collect::<Vec<_>>())
            .field("processors", &self.processors.keys().collect::<Vec<_>>())
            .field("filters", &self.filters.keys().collect::<Vec<_>>())
            .field("pipes", &self.pipes.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Service {
    pub fn new(compose: Arc<Compose>, filter: FilterOperator) -> Result<Self, PipelineError> {
        Self::with_channel_capacity(compose, filter, DEFAULT_CHANNEL_CAPACITY)
    }

    /// Build the graph leaves-first: pool, exporters, one processor per
    /// pipeline wired to its exporter, then one filter worker and one
    /// sensor pipe per sensor with the sensor's fan-out set.
    pub fn with_channel_capacity(
        compose: Arc<Compose>,
        filter: FilterOperator,
        capacity: usize,
    ) -> Result<Self, PipelineError> {
        let pool = EnvelopePool::new();
        let filter = Arc::new(filter);

        let mut exporters: BTreeMap<String, Box<dyn Exporter>> = BTreeMap::new();
        for (name, spec) in &compose.exporters {
            let exporter: Box<dyn Exporter> = match &spec.destination {
                Destination::File(path) => Box::new(FileExporter::new(
                    name.clone(),
                    path,
                    capacity,
                    Arc::clone(&pool),
                )?),
                Destination::Network(_) => {
                    return Err(PipelineError::UnsupportedExporter {
                        name: name.clone(),
                        mode: spec.destination.mode().to_string(),
                    })
                }
            };
            info!(exporter = %name, "exporter created");
            exporters.insert(name.clone(), exporter);
        }

        let mut processors = BTreeMap::new();
        for (name, pipeline) in &compose.service.pipelines {
            let exporter = exporters.get(&pipeline.exporter.name).ok_or_else(|| {
                PipelineError::invalid_operation(
                    "Service::new",
                    "pipeline references an unknown exporter",
                )
            })?;
            let outbound = exporter.sender().ok_or_else(|| {
                PipelineError::invalid_operation("Service::new", "exporter channel is gone")
            })?;
            let events_header = pipeline
                .sensors
                .iter()
                .map(|sensor| (sensor.name.clone(), sensor.events_header.clone()))
                .collect();
            processors.insert(
                name.clone(),
                ProcessorWorker::new(
                    name.clone(),
                    capacity,
                    events_header,
                    Arc::clone(&pool),
                    outbound,
                ),
            );
            info!(processor = %name, "processor created");
        }

        // Fan-out sets: every processor inbound whose pipeline includes
        // the sensor.
        let mut fan_out: BTreeMap<String, Vec<mpsc::Sender<SharedEnvelope>>> = compose
            .sensors
            .keys()
            .map(|name| (name.clone(), Vec::new()))
            .collect();
        for (pipeline_name, pipeline) in &compose.service.pipelines {
            let processor = processors.get(pipeline_name).ok_or_else(|| {
                PipelineError::invalid_operation("Service::new", "processor is missing")
            })?;
            for sensor in &pipeline.sensors {
                let sender = processor.sender().ok_or_else(|| {
                    PipelineError::invalid_operation("Service::new", "processor channel is gone")
                })?;
                fan_out
                    .get_mut(&sensor.name)
                    .ok_or_else(|| {
                        PipelineError::invalid_operation(
                            "Service::new",
                            "pipeline references an unknown sensor",
                        )
                    })?
                    .push(sender);
            }
        }

        let mut filters = BTreeMap::new();
        let mut pipes = BTreeMap::new();
        for name in compose.sensors.keys() {
            let outbound = fan_out.remove(name).unwrap_or_default();
            let worker = FilterWorker::new(
                name.clone(),
                capacity,
                Arc::clone(&filter),
                Arc::clone(&pool),
                outbound,
            );
            let inbound = worker.sender().ok_or_else(|| {
                PipelineError::invalid_operation("Service::new", "filter channel is gone")
            })?;
            pipes.insert(
                name.clone(),
                SensorPipe::new(name.clone(), inbound, pool_backed_wrap(Arc::clone(&pool))),
            );
            filters.insert(name.clone(), worker);
            info!(sensor = %name, "filter worker and sensor pipe created");
        }

        Ok(Self {
            compose,
            pool,
            exporters,
            processors,
            filters,
            pipes,
        })
    }

    /// The service's envelope pool (shared with every worker).
    pub fn pool(&self) -> Arc<EnvelopePool> {
        Arc::clone(&self.pool)
    }

    /// Start everything bottom-up — exporters, processors, filters, then
    /// the sensor subprocesses last so no record can reach a worker that
    /// is not yet running — and hand the graph to the supervising task.
    pub async fn start(mut self) -> Result<ServiceHandle, PipelineError> {
        if let Err(err) = self.start_workers() {
            // Partial start: release whatever was already running.
            let failures = self.shutdown_workers().await;
            return Err(PipelineError::join_with(err, failures));
        }

        let shutdown = CancellationToken::new();
        let done = CancellationToken::new();
        let state = Arc::new(RwLock::new(ServiceState::Running));
        let outcome = Arc::new(Mutex::new(ServiceOutcome::default()));
        tokio::spawn(supervise(
            self,
            shutdown.clone(),
            done.clone(),
            Arc::clone(&state),
            Arc::clone(&outcome),
        ));
        info!("service started");
        Ok(ServiceHandle {
            shutdown,
            done,
            state,
            outcome,
        })
    }

    fn start_workers(&mut self) -> Result<(), PipelineError> {
        for exporter in self.exporters.values_mut() {
            exporter.start()?;
        }
        for processor in self.processors.values_mut() {
            processor.start()?;
        }
        for filter in self.filters.values_mut() {
            filter.start()?;
        }
        let compose = Arc::clone(&self.compose);
        for (name, pipe) in self.pipes.iter_mut() {
            let spec = compose.sensor(name).ok_or_else(|| {
                PipelineError::invalid_operation("Service::start", "sensor spec is missing")
            })?;
            pipe.start(&spec.exec_path, &spec.argv())?;
        }
        Ok(())
    }

    /// Ordered teardown, top-down: sensor pipes, filter workers,
    /// processors, exporters. Each stage continues past failures so later
    /// stages still release their resources; lifecycle-misuse errors from
    /// components that never started are not failures here.
    async fn shutdown_workers(&mut self) -> Vec<PipelineError> {
        let mut failures = Vec::new();

        for (name, pipe) in self.pipes.iter_mut() {
            match pipe.stop().await {
                Ok(()) => {}
                Err(err) if err.is_state_guard() => {}
                Err(err) => {
                    error!(sensor = %name, error = %err, "failed to stop sensor pipe");
                    failures.push(err);
                }
            }
        }
        for (name, filter) in self.filters.iter_mut() {
            match filter.kill().await {
                Ok(()) => {}
                Err(err) if err.is_state_guard() => {}
                Err(err) => {
                    error!(sensor = %name, error = %err, "failed to kill filter worker");
                    failures.push(err);
                }
            }
        }
        for (name, processor) in self.processors.iter_mut() {
            match processor.kill().await {
                Ok(()) => {}
                Err(err) if err.is_state_guard() => {}
                Err(err) => {
                    error!(processor = %name, error = %err, "failed to kill processor");
                    failures.push(err);
                }
            }
        }
        for (name, exporter) in self.exporters.iter_mut() {
            match exporter.stop().await {
                Ok(()) => {}
                Err(err) if err.is_state_guard() => {}
                Err(err) => {
                    error!(exporter = %name, error = %err, "failed to stop exporter");
                    failures.push(err);
                }
            }
        }
        failures
    }
}

/// Parse function handed to every sensor pipe: one JSON line in, one
/// pool-backed envelope out.
fn pool_backed_wrap(pool: Arc<EnvelopePool>) -> WrapFn {
    Arc::new(move |line: &str| {
        let record: Record = serde_json::from_str(line)?;
        let mut envelope = pool.acquire();
        envelope.record = record;
        Ok(EnvelopePool::share(envelope))
    })
}

#[derive(Debug, Default)]
struct ServiceOutcome {
    sensor_failure: Option<PipelineError>,
    stop_failure: Option<PipelineError>,
}

/// Handle to a started service: the supervising task owns the workers;
/// the handle observes completion and triggers the stop sequence.
#[derive(Clone)]
pub struct ServiceHandle {
    shutdown: CancellationToken,
    done: CancellationToken,
    state: Arc<RwLock<ServiceState>>,
    outcome: Arc<Mutex<ServiceOutcome>>,
}

impl ServiceHandle {
    pub async fn state(&self) -> ServiceState {
        *self.state.read().await
    }

    /// Resolves once the service has fully stopped; yields the first
    /// fatal error observed, joined with any later shutdown errors.
    /// Cancel-safe.
    pub async fn wait(&self) -> Result<(), PipelineError> {
        self.done.cancelled().await;
        let mut outcome = self.outcome.lock().expect("outcome lock poisoned");
        match (outcome.sensor_failure.take(), outcome.stop_failure.take()) {
            (None, None) => Ok(()),
            (Some(sensor), None) => Err(sensor),
            (None, Some(stop)) => Err(stop),
            (Some(sensor), Some(stop)) => Err(PipelineError::join_with(sensor, vec![stop])),
        }
    }

    /// Trigger the ordered stop sequence and wait for it to finish. A
    /// second call fails with `AlreadyStopped`.
    pub async fn stop(&self) -> Result<(), PipelineError> {
        {
            let mut state = self.state.write().await;
            match *state {
                ServiceState::Running => *state = ServiceState::Stopping,
                _ => {
                    return Err(PipelineError::AlreadyStopped {
                        operation: "Service::stop",
                    })
                }
            }
        }
        self.shutdown.cancel();
        self.done.cancelled().await;
        let mut outcome = self.outcome.lock().expect("outcome lock poisoned");
        match outcome.stop_failure.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Owns the graph after start. Waits for the first fatal sensor error or
/// a stop request, then runs the ordered teardown and publishes the
/// outcome.
async fn supervise(
    mut service: Service,
    shutdown: CancellationToken,
    done: CancellationToken,
    state: Arc<RwLock<ServiceState>>,
    outcome: Arc<Mutex<ServiceOutcome>>,
) {
    let sensor_failure = {
        let mut waits: FuturesUnordered<_> = service
            .pipes
            .values_mut()
            .map(|pipe| pipe.wait())
            .collect();
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break None,
                finished = waits.next() => match finished {
                    Some(Err(err)) => {
                        warn!(error = %err, "sensor failed, shutting the service down");
                        break Some(err);
                    }
                    Some(Ok(())) => {}
                    None => {
                        // Every sensor exited cleanly; park until stop.
                        shutdown.cancelled().await;
                        break None;
                    }
                },
            }
        }
    };

    if sensor_failure.is_some() {
        *state.write().await = ServiceState::Stopping;
    }

    let failures = service.shutdown_workers().await;
    {
        let mut guard = outcome.lock().expect("outcome lock poisoned");
        guard.sensor_failure = sensor_failure;
        guard.stop_failure = PipelineError::join(failures);
    }
    *state.write().await = ServiceState::Stopped;
    info!("service stopped");
    done.cancel();
}
