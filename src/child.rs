//! In-child task runtime.
//!
//! A task child is this same binary re-executed with a private environment
//! handshake. On entry it moves into its workdir, announces AVAILABLE, and
//! then loops on stdin command frames. LOAD and TRAIN run the user body on
//! a fresh worker thread so the loop stays responsive to EXIT; stdout is
//! reserved for frames (logs go to stderr, as everywhere else).

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use serde_json::{Map, Value, json};
use tracing::{error, info, warn};

use crate::message::{Frame, cmd};
use crate::runner::{RunnerRegistry, TaskError, TaskRunner};
use crate::task::TaskStatus;

pub(crate) const ENV_CHILD: &str = "TASKHERD_CHILD";
pub(crate) const ENV_TASK_ID: &str = "TASKHERD_TASK_ID";
pub(crate) const ENV_RUNNER: &str = "TASKHERD_RUNNER";
pub(crate) const ENV_PARAMS: &str = "TASKHERD_PARAMS";
pub(crate) const ENV_WORKDIR: &str = "TASKHERD_WORKDIR";
pub(crate) const ENV_PARENT_PID: &str = "TASKHERD_PARENT_PID";

/// True when this process was spawned as a task child.
pub fn spawned_as_child() -> bool {
    std::env::var_os(ENV_CHILD).is_some()
}

struct Handshake {
    task_id: String,
    runner: String,
    params: Value,
    workdir: PathBuf,
    parent_pid: u32,
}

fn read_handshake() -> Result<Handshake> {
    let var = |name: &str| -> Result<String> {
        std::env::var(name).with_context(|| format!("missing child env {name}"))
    };
    let params = serde_json::from_str(&var(ENV_PARAMS)?).context("parse task params")?;
    Ok(Handshake {
        task_id: var(ENV_TASK_ID)?,
        runner: var(ENV_RUNNER)?,
        params,
        workdir: PathBuf::from(var(ENV_WORKDIR)?),
        parent_pid: var(ENV_PARENT_PID)?.parse().context("parse parent pid")?,
    })
}

/// Writes frames to stdout, one JSON line each. Shared between the command
/// loop and worker threads.
#[derive(Clone)]
struct FrameEmitter {
    task_id: String,
    out: Arc<Mutex<std::io::Stdout>>,
}

impl FrameEmitter {
    fn new(task_id: String) -> Self {
        FrameEmitter {
            task_id,
            out: Arc::new(Mutex::new(std::io::stdout())),
        }
    }

    fn emit(&self, command: &str, data: Value) {
        let frame = Frame::new(self.task_id.clone(), command, data);
        let Ok(line) = serde_json::to_string(&frame) else {
            error!(task_id = %self.task_id, command, "unserializable frame");
            return;
        };
        let mut out = self.out.lock().expect("stdout lock poisoned");
        let _ = writeln!(out, "{line}");
        let _ = out.flush();
    }

    fn update_status(&self, status: TaskStatus, extra: Value) {
        let mut data = match extra {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        data.insert("status".into(), json!(status.as_str()));
        info!(task_id = %self.task_id, status = %status, "update status");
        self.emit(cmd::UPDATE_STATUS, Value::Object(data));
    }
}

/// Handle passed to user task bodies: workdir, mirrored items, and the
/// emitter behind `set_item`.
pub struct RunContext {
    task_id: String,
    workdir: PathBuf,
    owner_pid: u32,
    items: Mutex<Map<String, Value>>,
    emitter: FrameEmitter,
}

impl RunContext {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Mirror a key/value pair to the parent-side task.
    ///
    /// Only callable from the process that created the context; the task
    /// child records its own pid at startup and refuses anything else.
    pub fn set_item(&self, key: impl Into<String>, value: Value) -> Result<()> {
        if std::process::id() != self.owner_pid {
            bail!("set_item is only available inside the task process");
        }
        let key = key.into();
        self.items
            .lock()
            .expect("items lock poisoned")
            .insert(key.clone(), value.clone());
        self.emitter
            .emit(cmd::SET_ITEM, json!({ "key": key, "value": value }));
        Ok(())
    }

    pub fn get_item(&self, key: &str) -> Option<Value> {
        self.items
            .lock()
            .expect("items lock poisoned")
            .get(key)
            .cloned()
    }
}

/// Shared state between the command loop and stage workers.
struct ChildState {
    runner: Mutex<Box<dyn TaskRunner>>,
    load_time: AtomicI64,
    train_time: AtomicI64,
}

/// Child process entry: run the command loop until EXIT (or stdin EOF),
/// then wait for in-flight workers.
pub fn run(registry: &RunnerRegistry) -> Result<()> {
    let handshake = read_handshake()?;
    info!(task_id = %handshake.task_id, parent_pid = handshake.parent_pid, "child run");

    std::fs::create_dir_all(&handshake.workdir)
        .with_context(|| format!("create workdir {}", handshake.workdir.display()))?;
    std::env::set_current_dir(&handshake.workdir)
        .with_context(|| format!("enter workdir {}", handshake.workdir.display()))?;

    let emitter = FrameEmitter::new(handshake.task_id.clone());
    let Some(runner) = registry.build(&handshake.runner, &handshake.params) else {
        emitter.update_status(
            TaskStatus::Exception,
            json!({
                "message": format!("unknown runner {:?}", handshake.runner),
                "stage": "LOAD",
            }),
        );
        bail!("unknown runner {:?}", handshake.runner);
    };

    let state = Arc::new(ChildState {
        runner: Mutex::new(runner),
        load_time: AtomicI64::new(-1),
        train_time: AtomicI64::new(-1),
    });
    let ctx = Arc::new(RunContext {
        task_id: handshake.task_id.clone(),
        workdir: handshake.workdir.clone(),
        owner_pid: std::process::id(),
        items: Mutex::new(Map::new()),
        emitter: emitter.clone(),
    });

    emitter.update_status(TaskStatus::Available, json!({}));

    let mut workers = Vec::new();
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let frame: Frame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(task_id = %handshake.task_id, "bad command frame: {e}");
                continue;
            }
        };
        match frame.cmd.as_str() {
            cmd::EXIT => {
                info!(task_id = %handshake.task_id, "receive EXIT signal");
                break;
            }
            cmd::LOAD => {
                info!(task_id = %handshake.task_id, "receive LOAD signal");
                let state = Arc::clone(&state);
                let ctx = Arc::clone(&ctx);
                let emitter = emitter.clone();
                workers.push(std::thread::spawn(move || {
                    run_load(&state, &ctx, &emitter);
                }));
            }
            cmd::TRAIN => {
                let device = frame.data["device"].as_str().unwrap_or_default().to_string();
                info!(task_id = %handshake.task_id, device, "receive TRAIN signal");
                let state = Arc::clone(&state);
                let ctx = Arc::clone(&ctx);
                let emitter = emitter.clone();
                workers.push(std::thread::spawn(move || {
                    run_train(&state, &ctx, &emitter, &device);
                }));
            }
            other => warn!(task_id = %handshake.task_id, cmd = other, "unknown command"),
        }
    }

    // Cooperative shutdown: let the current stage finish before exiting.
    for worker in workers {
        let _ = worker.join();
    }
    Ok(())
}

fn run_load(state: &ChildState, ctx: &RunContext, emitter: &FrameEmitter) {
    emitter.update_status(TaskStatus::Loading, json!({}));
    let started = Instant::now();
    let result = {
        let mut runner = state.runner.lock().expect("runner lock poisoned");
        runner.load(ctx)
    };
    match result {
        Ok(()) => {
            let elapsed = started.elapsed().as_millis() as i64;
            state.load_time.store(elapsed, Ordering::SeqCst);
            emitter.update_status(TaskStatus::Waiting, json!({}));
            info!(task_id = %ctx.task_id, elapsed_ms = elapsed, "load successful");
        }
        Err(TaskError::OutOfMemory) => {
            error!(task_id = %ctx.task_id, "OOM");
            emitter.update_status(TaskStatus::Interrupt, json!({ "stage": "LOAD" }));
        }
        Err(e) => {
            error!(task_id = %ctx.task_id, "error during loading: {e:?}");
            emitter.update_status(
                TaskStatus::Exception,
                json!({ "message": format!("{e:?}"), "stage": "LOAD" }),
            );
        }
    }
}

fn run_train(state: &ChildState, ctx: &RunContext, emitter: &FrameEmitter, device: &str) {
    emitter.update_status(TaskStatus::Training, json!({}));
    let started = Instant::now();
    let result = {
        let mut runner = state.runner.lock().expect("runner lock poisoned");
        runner.train(ctx, device)
    };
    match result {
        Ok(data) => {
            let elapsed = started.elapsed().as_millis() as i64;
            state.train_time.store(elapsed, Ordering::SeqCst);
            emitter.emit(cmd::SET_RESULT, Value::Object(data.clone()));
            emitter.update_status(
                TaskStatus::Finished,
                json!({
                    "load_time": state.load_time.load(Ordering::SeqCst),
                    "train_time": elapsed,
                    "data": data,
                }),
            );
            info!(task_id = %ctx.task_id, elapsed_ms = elapsed, "train successful");
        }
        Err(e) if e.is_cuda_oom() => {
            error!(task_id = %ctx.task_id, "cuda OOM");
            emitter.update_status(TaskStatus::Interrupt, json!({ "stage": "TRAIN" }));
        }
        Err(e) => {
            error!(task_id = %ctx.task_id, "error during training: {e:?}");
            emitter.update_status(
                TaskStatus::Exception,
                json!({ "message": format!("{e:?}"), "stage": "TRAIN" }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_item_mirrors_locally_and_guards_pid() {
        let ctx = RunContext {
            task_id: "t".into(),
            workdir: PathBuf::from("."),
            owner_pid: std::process::id(),
            items: Mutex::new(Map::new()),
            emitter: FrameEmitter::new("t".into()),
        };
        ctx.set_item("round", json!(3)).unwrap();
        assert_eq!(ctx.get_item("round"), Some(json!(3)));

        let foreign = RunContext {
            task_id: "t".into(),
            workdir: PathBuf::from("."),
            owner_pid: std::process::id() + 1,
            items: Mutex::new(Map::new()),
            emitter: FrameEmitter::new("t".into()),
        };
        assert!(foreign.set_item("round", json!(3)).is_err());
    }
}
