//! Script Orchestrator.
//!
//! Each registered script owns a slot with two locks: an async `control`
//! mutex that serializes start and stop for that id, and a short-lived
//! `state` mutex guarding status and the log buffer. Slots never share a
//! lock, so unrelated scripts run and stop independently.
//!
//! A spawned process is owned by its supervisor task. Stop requests reach it
//! through SIGTERM to the process group and, after a grace period, through a
//! kill channel; the supervisor alone reaps the child and records the exit.
//!
//! Stdout and stderr are drained by separate reader tasks. Lines from one
//! stream keep their order; lines from the two streams interleave in arrival
//! order with no guarantee across streams. An output line longer than
//! [`MAX_LINE_BYTES`] is split into several log entries.

use crate::log::LogBuffer;
use crate::registry::{Registry, ScriptSpec};
use chrono::{DateTime, Utc};
use roster_core::Clock;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

const STOP_GRACE: Duration = Duration::from_secs(5);
const KILL_WAIT: Duration = Duration::from_secs(5);
const OUTPUT_DRAIN: Duration = Duration::from_secs(2);

/// Longest single log entry taken from a script's output.
pub const MAX_LINE_BYTES: usize = 4096;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RunnerError {
    #[error("script {0:?} not found")]
    ScriptNotFound(String),
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptStatus {
    #[default]
    Idle,
    Running,
    Stopping,
    Stopped,
    Completed,
    Failed,
}

impl ScriptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptStatus::Idle => "idle",
            ScriptStatus::Running => "running",
            ScriptStatus::Stopping => "stopping",
            ScriptStatus::Stopped => "stopped",
            ScriptStatus::Completed => "completed",
            ScriptStatus::Failed => "failed",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ScriptStatus::Running | ScriptStatus::Stopping)
    }
}

/// Point-in-time view of one script, as served to the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptRecord {
    pub id: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub long_running: bool,
    pub status: ScriptStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub last_log: String,
    pub log_size: usize,
}

#[derive(Debug, Clone)]
pub enum StartOutcome {
    Launched(ScriptRecord),
    /// The script was already running or stopping; nothing was spawned.
    AlreadyRunning(ScriptRecord),
}

impl StartOutcome {
    pub fn record(&self) -> &ScriptRecord {
        match self {
            StartOutcome::Launched(r) | StartOutcome::AlreadyRunning(r) => r,
        }
    }

    pub fn into_record(self) -> ScriptRecord {
        match self {
            StartOutcome::Launched(r) | StartOutcome::AlreadyRunning(r) => r,
        }
    }

    pub fn already_running(&self) -> bool {
        matches!(self, StartOutcome::AlreadyRunning(_))
    }
}

struct Running {
    pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<bool>,
}

#[derive(Default)]
struct SlotState {
    status: ScriptStatus,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    stop_requested: bool,
    logs: LogBuffer,
    running: Option<Running>,
}

struct Slot {
    spec: ScriptSpec,
    control: tokio::sync::Mutex<()>,
    state: parking_lot::Mutex<SlotState>,
}

impl Slot {
    fn record(&self) -> ScriptRecord {
        let state = self.state.lock();
        self.record_from(&state)
    }

    fn record_from(&self, state: &SlotState) -> ScriptRecord {
        ScriptRecord {
            id: self.spec.id.clone(),
            title: self.spec.title.clone(),
            description: self.spec.description.clone(),
            category: self.spec.category.clone(),
            long_running: self.spec.long_running,
            status: state.status,
            started_at: state.started_at,
            finished_at: state.finished_at,
            exit_code: state.exit_code,
            last_log: state.logs.last().unwrap_or_default().to_string(),
            log_size: state.logs.len(),
        }
    }

    fn log(&self, line: String) {
        self.state.lock().logs.push(line);
    }
}

pub struct ScriptRunner {
    project_root: PathBuf,
    clock: Arc<dyn Clock>,
    order: Vec<String>,
    slots: HashMap<String, Arc<Slot>>,
}

impl ScriptRunner {
    pub fn new(registry: Registry, project_root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        let specs = registry.into_scripts();
        let order = specs.iter().map(|s| s.id.clone()).collect();
        let slots = specs
            .into_iter()
            .map(|spec| {
                let id = spec.id.clone();
                let slot = Slot {
                    spec,
                    control: tokio::sync::Mutex::new(()),
                    state: parking_lot::Mutex::new(SlotState::default()),
                };
                (id, Arc::new(slot))
            })
            .collect();
        Self {
            project_root: project_root.into(),
            clock,
            order,
            slots,
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    fn slot(&self, id: &str) -> Result<&Arc<Slot>, RunnerError> {
        self.slots
            .get(id)
            .ok_or_else(|| RunnerError::ScriptNotFound(id.to_string()))
    }

    /// Every script in registry order.
    pub fn list(&self) -> Vec<ScriptRecord> {
        self.order
            .iter()
            .filter_map(|id| self.slots.get(id))
            .map(|slot| slot.record())
            .collect()
    }

    pub fn get(&self, id: &str) -> Result<ScriptRecord, RunnerError> {
        Ok(self.slot(id)?.record())
    }

    pub fn status(&self, id: &str) -> Result<ScriptStatus, RunnerError> {
        Ok(self.slot(id)?.state.lock().status)
    }

    /// The last `tail` buffered lines, oldest first.
    pub fn logs(&self, id: &str, tail: usize) -> Result<Vec<String>, RunnerError> {
        Ok(self.slot(id)?.state.lock().logs.tail(tail))
    }

    pub fn running_count(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| slot.state.lock().status.is_active())
            .count()
    }

    /// Launch a script unless it is already active.
    ///
    /// A process that cannot be spawned is not an error here: the slot moves
    /// to `failed` and the reason is written to its log.
    pub async fn start(&self, id: &str, params: &Map<String, Value>) -> Result<StartOutcome, RunnerError> {
        let slot = self.slot(id)?;
        let _control = slot.control.lock().await;

        {
            let state = slot.state.lock();
            if state.status.is_active() {
                tracing::debug!(script = id, status = state.status.as_str(), "start ignored; already active");
                return Ok(StartOutcome::AlreadyRunning(slot.record_from(&state)));
            }
        }

        let args = build_args(&slot.spec, params)?;
        let command_line = display_command(&slot.spec.program, &args);

        let mut cmd = Command::new(&slot.spec.program);
        cmd.args(&args)
            .current_dir(&self.project_root)
            .envs(&slot.spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let now = self.clock.now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(script = id, command = %command_line, error = %e, "script failed to start");
                let mut state = slot.state.lock();
                state.status = ScriptStatus::Failed;
                state.started_at = Some(now);
                state.finished_at = Some(now);
                state.exit_code = None;
                state.stop_requested = false;
                state.logs.clear();
                state.logs.push(format!("$ {command_line}"));
                state.logs.push(format!("Unable to start {id}: {e}"));
                return Ok(StartOutcome::Launched(slot.record_from(&state)));
            }
        };

        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(false);

        let record = {
            let mut state = slot.state.lock();
            state.status = ScriptStatus::Running;
            state.started_at = Some(now);
            state.finished_at = None;
            state.exit_code = None;
            state.stop_requested = false;
            state.logs.clear();
            state.logs.push(format!("$ {command_line}"));
            state.logs.push("Process started.");
            state.running = Some(Running {
                pid,
                kill: Some(kill_tx),
                exited: exit_rx,
            });
            slot.record_from(&state)
        };

        // Readers start after the buffer reset so no early output is lost.
        let readers: Vec<JoinHandle<()>> = [
            child.stdout.take().map(|s| spawn_reader(slot.clone(), s)),
            child.stderr.take().map(|s| spawn_reader(slot.clone(), s)),
        ]
        .into_iter()
        .flatten()
        .collect();

        tracing::info!(script = id, ?pid, command = %command_line, "script started");
        tokio::spawn(supervise(
            slot.clone(),
            self.clock.clone(),
            child,
            readers,
            kill_rx,
            exit_tx,
        ));
        Ok(StartOutcome::Launched(record))
    }

    /// Terminate a running script and wait for it to exit.
    ///
    /// A script that is not running is left untouched and its current record
    /// is returned.
    pub async fn stop(&self, id: &str) -> Result<ScriptRecord, RunnerError> {
        let slot = self.slot(id)?;
        let _control = slot.control.lock().await;

        let (pid, mut exited) = {
            let mut state = slot.state.lock();
            let handle = state.running.as_ref().map(|r| (r.pid, r.exited.clone()));
            match handle {
                Some(handle) if state.status == ScriptStatus::Running => {
                    state.stop_requested = true;
                    state.status = ScriptStatus::Stopping;
                    state.logs.push("Stopping process...");
                    handle
                }
                _ => return Ok(slot.record_from(&state)),
            }
        };

        tracing::info!(script = id, ?pid, "stopping script");
        request_termination(slot, pid);

        if !wait_exit(&mut exited, STOP_GRACE).await {
            tracing::warn!(script = id, grace_secs = STOP_GRACE.as_secs(), "script ignored termination; killing");
            force_kill(slot, pid);
            if !wait_exit(&mut exited, KILL_WAIT).await {
                tracing::error!(script = id, ?pid, "script did not exit after kill");
            }
        }

        Ok(slot.record())
    }

    /// Stop every active script. Used on daemon shutdown.
    pub async fn shutdown(&self) {
        for id in &self.order {
            let active = self
                .slots
                .get(id)
                .map(|slot| slot.state.lock().status.is_active())
                .unwrap_or(false);
            if active {
                if let Err(e) = self.stop(id).await {
                    tracing::warn!(script = %id, error = %e, "failed to stop script on shutdown");
                }
            }
        }
    }
}

/// Append start parameters to the script's base arguments.
///
/// Each declared parameter becomes `<flag> <value>`; a required parameter
/// must be present and non-blank.
fn build_args(spec: &ScriptSpec, params: &Map<String, Value>) -> Result<Vec<String>, RunnerError> {
    let mut args = spec.args.clone();
    for param in &spec.params {
        let value = params.get(&param.name).map(param_text).unwrap_or_default();
        if param.required && value.is_empty() {
            return Err(RunnerError::InvalidParams(format!(
                "{} is required to run {}",
                param.name, spec.id
            )));
        }
        args.push(param.flag.clone());
        args.push(value);
    }
    Ok(args)
}

fn param_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

fn display_command(program: &str, args: &[String]) -> String {
    std::iter::once(program.to_string())
        .chain(args.iter().map(|a| {
            if a.is_empty() || a.contains(char::is_whitespace) {
                format!("{a:?}")
            } else {
                a.clone()
            }
        }))
        .collect::<Vec<_>>()
        .join(" ")
}

fn spawn_reader<R>(slot: Arc<Slot>, stream: R) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match read_capped_line(&mut reader, &mut buf, MAX_LINE_BYTES).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf);
                    let line = text.trim_end();
                    if !line.is_empty() {
                        slot.log(line.to_string());
                    }
                }
                Err(e) => {
                    tracing::debug!(script = %slot.spec.id, error = %e, "output stream closed");
                    break;
                }
            }
        }
    })
}

/// Like `read_until(b'\n')`, but stops after `limit` bytes so one endless
/// line cannot grow the buffer without bound. The rest of the line is
/// returned by the next call.
async fn read_capped_line<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let start = buf.len();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            break;
        }
        let room = limit - (buf.len() - start);
        let window = &available[..available.len().min(room)];
        let (used, done) = match window.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (window.len(), window.len() == room),
        };
        buf.extend_from_slice(&window[..used]);
        reader.consume(used);
        if done {
            break;
        }
    }
    Ok(buf.len() - start)
}

async fn supervise(
    slot: Arc<Slot>,
    clock: Arc<dyn Clock>,
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    mut kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<bool>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = &mut kill_rx => {
            if let Err(e) = child.start_kill() {
                tracing::warn!(script = %slot.spec.id, error = %e, "kill failed");
            }
            child.wait().await
        }
    };

    // Output written just before exit is still in the pipes.
    for reader in readers {
        if tokio::time::timeout(OUTPUT_DRAIN, reader).await.is_err() {
            tracing::debug!(script = %slot.spec.id, "output still open after exit; detaching reader");
        }
    }

    let code = match &status {
        Ok(status) => exit_code(status),
        Err(e) => {
            tracing::warn!(script = %slot.spec.id, error = %e, "wait failed");
            -1
        }
    };

    let final_status = {
        let mut state = slot.state.lock();
        state.exit_code = Some(code);
        state.finished_at = Some(clock.now());
        state.status = if state.stop_requested {
            ScriptStatus::Stopped
        } else if code == 0 {
            ScriptStatus::Completed
        } else {
            ScriptStatus::Failed
        };
        state.stop_requested = false;
        state.running = None;
        state.logs.push(format!("Process exited with code {code}."));
        state.status
    };

    tracing::info!(script = %slot.spec.id, code, status = final_status.as_str(), "script exited");
    exit_tx.send_replace(true);
}

/// Exit code, or the negated signal number for signal deaths.
fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) -> Result<(), nix::Error> {
    let pgid = nix::unistd::Pid::from_raw(pid as i32);
    nix::sys::signal::killpg(pgid, signal)
}

fn request_termination(slot: &Slot, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        match signal_group(pid, nix::sys::signal::Signal::SIGTERM) {
            Ok(()) => return,
            Err(e) => tracing::warn!(script = %slot.spec.id, pid, error = %e, "SIGTERM failed"),
        }
    }
    force_kill(slot, pid);
}

fn force_kill(slot: &Slot, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // The leader may already be gone while children linger in the group.
        let _ = signal_group(pid, nix::sys::signal::Signal::SIGKILL);
    }
    #[cfg(not(unix))]
    let _ = pid;

    let kill = slot.state.lock().running.as_mut().and_then(|r| r.kill.take());
    if let Some(kill) = kill {
        let _ = kill.send(());
    }
}

async fn wait_exit(exited: &mut watch::Receiver<bool>, limit: Duration) -> bool {
    tokio::time::timeout(limit, exited.wait_for(|done| *done))
        .await
        .is_ok()
}
