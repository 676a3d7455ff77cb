//! Task lifecycle states and the parent-side task supervisor.
//!
//! A [`Task`] owns one child process and the command pipe into it (the
//! child's stdin). Commands are JSON frames; the child's stdout frames are
//! pumped onto the message bus by a dedicated thread started at spawn.
//! All mutators run under the owning group's lock.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::child;
use crate::message::{Frame, cmd};
use crate::runner::JsonMap;
use crate::units::MemValue;

/// Lifecycle states. `Unknown` is only produced by the tolerant frame-side
/// parser and marks a protocol violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Unknown,
    Init,
    Available,
    Loading,
    Waiting,
    Training,
    Finished,
    Exited,
    Exception,
    Interrupt,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("not a task status: {0:?}")]
pub struct StatusParseError(String);

impl TaskStatus {
    pub const ALL: [TaskStatus; 10] = [
        TaskStatus::Unknown,
        TaskStatus::Init,
        TaskStatus::Available,
        TaskStatus::Loading,
        TaskStatus::Waiting,
        TaskStatus::Training,
        TaskStatus::Finished,
        TaskStatus::Exited,
        TaskStatus::Exception,
        TaskStatus::Interrupt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Unknown => "UNKNOWN",
            TaskStatus::Init => "INIT",
            TaskStatus::Available => "AVAILABLE",
            TaskStatus::Loading => "LOADING",
            TaskStatus::Waiting => "WAITING",
            TaskStatus::Training => "TRAINING",
            TaskStatus::Finished => "FINISHED",
            TaskStatus::Exited => "EXITED",
            TaskStatus::Exception => "EXCEPTION",
            TaskStatus::Interrupt => "INTERRUPT",
        }
    }

    fn from_index(idx: u64) -> Option<TaskStatus> {
        TaskStatus::ALL.get(idx as usize).copied()
    }

    /// Tolerant parse for incoming frames: accepts a status name or an
    /// integer discriminant, anything else degrades to `Unknown`. Direct
    /// API use should go through `FromStr` instead.
    pub fn from_frame(value: &Value) -> TaskStatus {
        match value {
            Value::String(s) => s.parse().unwrap_or(TaskStatus::Unknown),
            Value::Number(n) => n
                .as_u64()
                .and_then(TaskStatus::from_index)
                .unwrap_or(TaskStatus::Unknown),
            _ => TaskStatus::Unknown,
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| StatusParseError(s.to_string()))
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a supervisor needs to spawn its child.
pub(crate) struct SpawnContext<'a> {
    /// Directory the task workdir is created under.
    pub group_workdir: &'a Path,
    /// Producer end of the bus queue, handed to the stdout pump thread.
    pub bus_sender: Sender<Frame>,
}

/// Parent-side handle for one task: identity, resource hints, lifecycle
/// bookkeeping, and the owned child process.
pub struct Task {
    pub task_id: String,
    /// Registry name of the task body to run in the child.
    pub runner: String,
    /// Opaque payload delivered to the body's factory.
    pub params: Value,
    pub estimate_memory: Option<MemValue>,
    pub estimate_cuda_memory: Option<MemValue>,
    /// GPU pin (`"cuda:N"`); `None` lets the scheduler pick.
    pub device: Option<String>,
    pub(crate) status: TaskStatus,
    /// Times the LOAD / TRAIN command has been issued.
    pub load_numbers: u32,
    pub train_numbers: u32,
    /// Last successful stage durations in ms; -1 = unset.
    pub load_time: i64,
    pub train_time: i64,
    pub workdir: Option<PathBuf>,
    /// Key/value pairs mirrored from the child via `set_item` frames.
    pub items: JsonMap,
    /// The map reported by a successful train, via `set_result`.
    pub result: JsonMap,

    process: Option<Child>,
    pipe: Option<ChildStdin>,
    pump: Option<JoinHandle<()>>,
}

impl Task {
    /// New task with a generated id.
    pub fn new(runner: impl Into<String>) -> Task {
        Task::with_id(Ulid::new().to_string(), runner)
    }

    pub fn with_id(task_id: impl Into<String>, runner: impl Into<String>) -> Task {
        Task {
            task_id: task_id.into(),
            runner: runner.into(),
            params: Value::Null,
            estimate_memory: None,
            estimate_cuda_memory: None,
            device: None,
            status: TaskStatus::Init,
            load_numbers: 0,
            train_numbers: 0,
            load_time: -1,
            train_time: -1,
            workdir: None,
            items: JsonMap::new(),
            result: JsonMap::new(),
            process: None,
            pipe: None,
            pump: None,
        }
    }

    pub fn params(mut self, params: Value) -> Task {
        self.params = params;
        self
    }

    pub fn estimate_memory(mut self, value: impl Into<MemValue>) -> Task {
        self.estimate_memory = Some(value.into());
        self
    }

    pub fn estimate_cuda_memory(mut self, value: impl Into<MemValue>) -> Task {
        self.estimate_cuda_memory = Some(value.into());
        self
    }

    pub fn device(mut self, device: impl Into<String>) -> Task {
        self.device = Some(device.into());
        self
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub(crate) fn has_pipe(&self) -> bool {
        self.pipe.is_some()
    }

    /// Spawn the child process. Non-blocking; the child announces itself
    /// with an AVAILABLE frame once its runtime is up.
    pub(crate) fn start(&mut self, ctx: &SpawnContext<'_>) -> Result<()> {
        info!(task_id = %self.task_id, "start");
        // A previous child (killed after a load interrupt) may still be
        // draining; reap it and its pump off-thread so neither lingers.
        if let Some(mut old) = self.process.take() {
            let old_pump = self.pump.take();
            std::thread::spawn(move || {
                let _ = old.wait();
                if let Some(pump) = old_pump {
                    let _ = pump.join();
                }
            });
        }
        let workdir = std::path::absolute(ctx.group_workdir.join(&self.task_id))
            .with_context(|| format!("resolve workdir for task {}", self.task_id))?;
        self.workdir = Some(workdir.clone());

        let exe = std::env::current_exe().context("resolve current exe")?;
        let mut command = Command::new(exe);
        command
            .env(child::ENV_CHILD, "1")
            .env(child::ENV_TASK_ID, &self.task_id)
            .env(child::ENV_RUNNER, &self.runner)
            .env(child::ENV_PARAMS, serde_json::to_string(&self.params)?)
            .env(child::ENV_WORKDIR, &workdir)
            .env(child::ENV_PARENT_PID, std::process::id().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut process = command
            .spawn()
            .with_context(|| format!("spawn child for task {}", self.task_id))?;
        self.pipe = process.stdin.take();

        let stdout = process.stdout.take().expect("child stdout piped");
        let sender = ctx.bus_sender.clone();
        let task_id = self.task_id.clone();
        self.pump = Some(std::thread::spawn(move || {
            pump_frames(stdout, sender, task_id);
        }));

        debug!(task_id = %self.task_id, pid = process.id(), "child spawned");
        self.process = Some(process);
        Ok(())
    }

    /// Command the LOAD stage. Increments the retry counter first; a closed
    /// pipe fails before the increment so a dying child cannot burn budget.
    pub(crate) fn start_load(&mut self) -> Result<()> {
        if self.pipe.is_none() {
            anyhow::bail!("task {}: command pipe is closed", self.task_id);
        }
        self.load_numbers += 1;
        info!(task_id = %self.task_id, retry = self.load_numbers, "start load");
        self.send_command(cmd::LOAD, json!({}))
    }

    /// Command the TRAIN stage on `device`. Increments the retry counter
    /// first, with the same closed-pipe guard as `start_load`.
    pub(crate) fn start_train(&mut self, device: &str) -> Result<()> {
        if self.pipe.is_none() {
            anyhow::bail!("task {}: command pipe is closed", self.task_id);
        }
        self.train_numbers += 1;
        info!(task_id = %self.task_id, retry = self.train_numbers, device, "start train");
        self.send_command(cmd::TRAIN, json!({ "device": device }))
    }

    /// Send EXIT and close the command pipe. Safe to call repeatedly; the
    /// child finishes its current worker before honoring the request.
    pub fn exit(&mut self) {
        let Some(mut pipe) = self.pipe.take() else {
            warn!(task_id = %self.task_id, "exit on a closed pipe");
            return;
        };
        let frame = Frame::new("", cmd::EXIT, json!({}));
        if let Ok(line) = serde_json::to_string(&frame) {
            let _ = writeln!(pipe, "{line}");
            let _ = pipe.flush();
        }
        info!(task_id = %self.task_id, "exit");
        // Dropping the pipe closes the child's stdin; EOF doubles as EXIT.
    }

    pub fn is_alive(&mut self) -> bool {
        match &mut self.process {
            Some(process) => matches!(process.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn send_command(&mut self, command: &str, data: Value) -> Result<()> {
        let Some(pipe) = &mut self.pipe else {
            anyhow::bail!("task {}: command pipe is closed", self.task_id);
        };
        let frame = Frame::new("", command, data);
        let line = serde_json::to_string(&frame)?;
        writeln!(pipe, "{line}")
            .with_context(|| format!("send {} to task {}", command, self.task_id))?;
        pipe.flush()
            .with_context(|| format!("flush {} to task {}", command, self.task_id))?;
        Ok(())
    }
}

/// Forward child stdout frames into the bus queue. Runs until the child
/// closes its stdout; lines that do not parse as frames are dropped with a
/// log line so stray prints from user code cannot poison the bus.
fn pump_frames(stdout: std::process::ChildStdout, sender: Sender<Frame>, task_id: String) {
    use std::io::BufRead;

    let reader = std::io::BufReader::new(stdout);
    for line in reader.lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Frame>(&line) {
            Ok(frame) => {
                if sender.send(frame).is_err() {
                    break;
                }
            }
            Err(_) => debug!(task_id = %task_id, line = %line, "ignoring non-frame stdout"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_names_strictly() {
        assert_eq!("TRAINING".parse::<TaskStatus>(), Ok(TaskStatus::Training));
        assert!("training".parse::<TaskStatus>().is_err());
        assert!("BOGUS".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn frame_parse_tolerates_garbage() {
        assert_eq!(
            TaskStatus::from_frame(&json!("WAITING")),
            TaskStatus::Waiting
        );
        assert_eq!(TaskStatus::from_frame(&json!(5)), TaskStatus::Training);
        assert_eq!(TaskStatus::from_frame(&json!(42)), TaskStatus::Unknown);
        assert_eq!(TaskStatus::from_frame(&json!("nope")), TaskStatus::Unknown);
        assert_eq!(TaskStatus::from_frame(&Value::Null), TaskStatus::Unknown);
    }

    #[test]
    fn new_task_defaults() {
        let task = Task::new("trainer");
        assert_eq!(task.status(), TaskStatus::Init);
        assert_eq!(task.load_numbers, 0);
        assert_eq!(task.load_time, -1);
        assert_eq!(task.train_time, -1);
        assert!(!task.task_id.is_empty());
    }

    #[test]
    fn exit_without_child_is_a_noop() {
        let mut task = Task::new("trainer");
        task.exit();
        task.exit();
        assert!(!task.is_alive());
    }
}
