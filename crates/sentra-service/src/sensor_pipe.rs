//! Sensor subprocess supervision. One pipe per sensor runs the
//! subprocess, scans its standard output line by line, and feeds parsed
//! envelopes into the filter worker's channel.

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use sentra_core::{PipelineError, SharedEnvelope};
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Longest stdout line the scanner will deliver; anything longer is
/// truncated at this boundary with a diagnostic.
const MAX_LINE_BYTES: usize = 1 << 20;

/// Converts one stdout line into an envelope. Wrap failures skip the line
/// without aborting the pipe.
pub type WrapFn = Arc<dyn Fn(&str) -> Result<SharedEnvelope, PipelineError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipeState {
    Created,
    Started,
    Stopped,
}

/// Runs one sensor subprocess and converts each line of its standard
/// output into an envelope on the downstream channel.
///
/// Two tasks serve the subprocess: the *scanner* (reads lines, wraps
/// them, enqueues envelopes, and drops the downstream sender at
/// end-of-stream) and the *supervisor* (sole observer of process exit).
/// Lifecycle is Created → Started → (Exited | Stopped); transitions are
/// one-way and misuse surfaces as the matching guard error
/// (`AlreadyStarted`, `NotStarted`, `AlreadyWaited`, `AlreadyStopped`).
pub struct SensorPipe {
    name: String,
    wrap: WrapFn,
    downstream: Option<mpsc::Sender<SharedEnvelope>>,
    scanner: Option<JoinHandle<()>>,
    supervisor: Option<JoinHandle<Result<(), PipelineError>>>,
    pid: Option<i32>,
    proc_exited: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
    state: PipeState,
    waited: bool,
}

impl SensorPipe {
    pub fn new(
        name: impl Into<String>,
        downstream: mpsc::Sender<SharedEnvelope>,
        wrap: WrapFn,
    ) -> Self {
        Self {
            name: name.into(),
            wrap,
            downstream: Some(downstream),
            scanner: None,
            supervisor: None,
            pid: None,
            proc_exited: Arc::new(AtomicBool::new(false)),
            stop_requested: Arc::new(AtomicBool::new(false)),
            state: PipeState::Created,
            waited: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the subprocess was started and has not yet been observed
    /// to exit.
    pub fn is_running(&self) -> bool {
        self.state == PipeState::Started && !self.proc_exited.load(Ordering::SeqCst)
    }

    /// Spawn the subprocess (in its own process group, stdout piped) and
    /// start the scanner and supervisor tasks.
    pub fn start(&mut self, program: &Path, args: &[String]) -> Result<(), PipelineError> {
        if self.state != PipeState::Created {
            return Err(PipelineError::AlreadyStarted {
                operation: "SensorPipe::start",
            });
        }
        let downstream = self.downstream.take().ok_or_else(|| {
            PipelineError::invalid_operation("SensorPipe::start", "downstream channel is gone")
        })?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PipelineError::SpawnFailed {
                sensor: self.name.clone(),
                source,
            })?;

        self.pid = child.id().map(|pid| pid as i32);
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::System(io::Error::other("stdout was not captured")))?;

        let scanner_name = self.name.clone();
        let wrap = Arc::clone(&self.wrap);
        self.scanner = Some(tokio::spawn(async move {
            scan_lines(scanner_name, stdout, wrap, downstream).await;
        }));

        let supervisor_name = self.name.clone();
        let proc_exited = Arc::clone(&self.proc_exited);
        let stop_requested = Arc::clone(&self.stop_requested);
        self.supervisor = Some(tokio::spawn(async move {
            supervise(supervisor_name, child, proc_exited, stop_requested).await
        }));

        self.state = PipeState::Started;
        info!(sensor = %self.name, pid = self.pid, "sensor pipe started");
        Ok(())
    }

    /// Block until the supervisor observes process exit and surface its
    /// classification. Cancel-safe: dropping the future before completion
    /// leaves the pipe waitable.
    pub async fn wait(&mut self) -> Result<(), PipelineError> {
        if self.state == PipeState::Created {
            return Err(PipelineError::NotStarted {
                operation: "SensorPipe::wait",
            });
        }
        if self.waited {
            return Err(PipelineError::AlreadyWaited {
                operation: "SensorPipe::wait",
            });
        }
        let supervisor = self.supervisor.as_mut().ok_or(PipelineError::AlreadyWaited {
            operation: "SensorPipe::wait",
        })?;
        let outcome = supervisor.await;
        self.supervisor = None;
        self.waited = true;
        match outcome {
            Ok(result) => result,
            Err(join_error) => Err(PipelineError::System(io::Error::other(join_error))),
        }
    }

    /// Kill the subprocess's process group (skipped when the process
    /// already exited naturally) and wait for the scanner to drain to
    /// end-of-stream. The scanner exiting drops the downstream sender,
    /// which is what closes the filter worker's inbound channel.
    pub async fn stop(&mut self) -> Result<(), PipelineError> {
        match self.state {
            PipeState::Created => {
                return Err(PipelineError::NotStarted {
                    operation: "SensorPipe::stop",
                })
            }
            PipeState::Stopped => {
                return Err(PipelineError::AlreadyStopped {
                    operation: "SensorPipe::stop",
                })
            }
            PipeState::Started => {}
        }

        self.stop_requested.store(true, Ordering::SeqCst);
        if self.proc_exited.load(Ordering::SeqCst) {
            debug!(sensor = %self.name, "sensor already exited, skipping kill");
        } else if let Some(pid) = self.pid {
            // Kill the whole group so sensor grandchildren die too.
            match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                Err(errno) => {
                    return Err(PipelineError::System(io::Error::from_raw_os_error(
                        errno as i32,
                    )))
                }
            }
        }

        let scanner = self.scanner.take();
        self.state = PipeState::Stopped;
        if let Some(scanner) = scanner {
            if let Err(join_error) = scanner.await {
                return Err(PipelineError::System(io::Error::other(join_error)));
            }
        }
        info!(sensor = %self.name, "sensor pipe stopped");
        Ok(())
    }
}

async fn scan_lines(
    sensor: String,
    stdout: ChildStdout,
    wrap: WrapFn,
    downstream: mpsc::Sender<SharedEnvelope>,
) {
    debug!(sensor = %sensor, "scanner started");
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(mut line)) => {
                if line.len() > MAX_LINE_BYTES {
                    warn!(sensor = %sensor, length = line.len(), "line exceeds scanner buffer, truncating");
                    truncate_at_boundary(&mut line, MAX_LINE_BYTES);
                }
                match wrap(&line) {
                    Ok(envelope) => {
                        if downstream.send(envelope).await.is_err() {
                            warn!(sensor = %sensor, "downstream channel closed, scanner exiting");
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(sensor = %sensor, error = %err, "failed to wrap line, skipping")
                    }
                }
            }
            // Only end-of-stream terminates scanning.
            Ok(None) => break,
            Err(err) => {
                warn!(sensor = %sensor, error = %err, "error reading sensor output");
            }
        }
    }
    debug!(sensor = %sensor, "scanner reached end of stream");
}

fn truncate_at_boundary(line: &mut String, mut limit: usize) {
    while limit > 0 && !line.is_char_boundary(limit) {
        limit -= 1;
    }
    line.truncate(limit);
}

/// Sole observer of subprocess exit. A kill requested by `stop` counts as
/// a clean shutdown; everything else non-zero is a sensor failure.
async fn supervise(
    sensor: String,
    mut child: tokio::process::Child,
    proc_exited: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
) -> Result<(), PipelineError> {
    let status = child.wait().await;
    proc_exited.store(true, Ordering::SeqCst);
    match status {
        Ok(status) => {
            if status.success() {
                info!(sensor = %sensor, "sensor exited cleanly");
                Ok(())
            } else if let Some(code) = status.code() {
                warn!(sensor = %sensor, code, "sensor exited with failure status");
                Err(PipelineError::SensorExited { sensor, code })
            } else if stop_requested.load(Ordering::SeqCst) {
                info!(sensor = %sensor, "sensor terminated by stop");
                Ok(())
            } else {
                warn!(sensor = %sensor, "sensor terminated by unexpected signal");
                Err(PipelineError::SensorExited { sensor, code: -1 })
            }
        }
        Err(err) => Err(PipelineError::System(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentra_core::{EnvelopePool, Record};
    use std::path::PathBuf;
    use std::time::Duration;

    fn json_wrap() -> WrapFn {
        let pool = EnvelopePool::new();
        Arc::new(move |line: &str| {
            let record: Record = serde_json::from_str(line)?;
            let mut envelope = pool.acquire();
            envelope.record = record;
            Ok(EnvelopePool::share(envelope))
        })
    }

    fn sh(script: &str) -> (PathBuf, Vec<String>) {
        (
            PathBuf::from("/bin/sh"),
            vec!["-c".to_string(), script.to_string()],
        )
    }

    #[tokio::test]
    async fn test_spawn_failure_is_synchronous() {
        let (tx, _rx) = mpsc::channel(8);
        let mut pipe = SensorPipe::new("ghost", tx, json_wrap());
        let error = pipe
            .start(Path::new("/nonexistent/sensor"), &[])
            .expect_err("should fail to spawn");
        assert!(matches!(error, PipelineError::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn test_lines_become_envelopes_in_order() {
        let (tx, mut rx) = mpsc::channel(32);
        let mut pipe = SensorPipe::new("emitter", tx, json_wrap());
        let (program, args) = sh(
            r#"for i in 1 2 3; do echo "{\"eventname\":\"ev$i\",\"source\":\"test\",\"timestamp\":\"t\",\"log\":\"l\",\"metadata\":{}}"; done"#,
        );
        pipe.start(&program, &args).expect("start failed");

        for expected in ["ev1", "ev2", "ev3"] {
            let envelope = rx.recv().await.expect("envelope missing");
            assert_eq!(envelope.record.event_name, expected);
        }

        pipe.wait().await.expect("wait failed");
        assert!(rx.recv().await.is_none(), "scanner drops sender at EOF");
        pipe.stop().await.expect("stop after natural exit failed");
    }

    #[tokio::test]
    async fn test_unparsable_lines_are_skipped() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut pipe = SensorPipe::new("noisy", tx, json_wrap());
        let (program, args) = sh(
            r#"echo 'not json'; echo "{\"eventname\":\"good\",\"source\":\"s\",\"timestamp\":\"t\",\"log\":\"l\",\"metadata\":{}}""#,
        );
        pipe.start(&program, &args).expect("start failed");

        let envelope = rx.recv().await.expect("envelope missing");
        assert_eq!(envelope.record.event_name, "good");
        pipe.wait().await.expect("wait failed");
    }

    #[tokio::test]
    async fn test_nonzero_exit_classified() {
        let (tx, _rx) = mpsc::channel(8);
        let mut pipe = SensorPipe::new("failing", tx, json_wrap());
        let (program, args) = sh("exit 1");
        pipe.start(&program, &args).expect("start failed");

        let error = pipe.wait().await.expect_err("wait should surface exit 1");
        match error {
            PipelineError::SensorExited { sensor, code } => {
                assert_eq!(sensor, "failing");
                assert_eq!(code, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_stop_kills_long_running_sensor() {
        let (tx, _rx) = mpsc::channel(8);
        let mut pipe = SensorPipe::new("sleeper", tx, json_wrap());
        let (program, args) = sh("sleep 60");
        pipe.start(&program, &args).expect("start failed");
        let pid = pipe.pid.expect("pid recorded");
        assert!(pipe.is_running());

        tokio::time::sleep(Duration::from_millis(50)).await;
        pipe.stop().await.expect("stop failed");
        assert!(!pipe.is_running());
        pipe.wait().await.expect("kill by stop is a clean shutdown");

        // The group is gone once the child is reaped; poll briefly in
        // case a grandchild zombie is still being collected by init.
        let mut gone = killpg(Pid::from_raw(pid), None);
        for _ in 0..50 {
            if gone == Err(nix::errno::Errno::ESRCH) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            gone = killpg(Pid::from_raw(pid), None);
        }
        assert_eq!(gone, Err(nix::errno::Errno::ESRCH));
    }

    #[tokio::test]
    async fn test_lifecycle_guards() {
        let (tx, _rx) = mpsc::channel(8);
        let mut pipe = SensorPipe::new("guarded", tx, json_wrap());

        assert!(matches!(
            pipe.wait().await,
            Err(PipelineError::NotStarted { .. })
        ));
        assert!(matches!(
            pipe.stop().await,
            Err(PipelineError::NotStarted { .. })
        ));

        let (program, args) = sh("sleep 60");
        pipe.start(&program, &args).expect("start failed");
        assert!(matches!(
            pipe.start(&program, &args),
            Err(PipelineError::AlreadyStarted { .. })
        ));

        pipe.stop().await.expect("stop failed");
        assert!(matches!(
            pipe.stop().await,
            Err(PipelineError::AlreadyStopped { .. })
        ));

        pipe.wait().await.expect("wait failed");
        assert!(matches!(
            pipe.wait().await,
            Err(PipelineError::AlreadyWaited { .. })
        ));
    }
}
