//! The engine: owns the config, the runner registry, the message bus, the
//! probes, and the submitted groups, and runs them strictly in submission
//! order.
//!
//! `Engine::start` is also the child-process pivot: when the private spawn
//! handshake is present in the environment, it runs the child task runtime
//! instead of scheduling and exits the process when the task is done. User
//! code therefore builds the engine the same way in both parent and child.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use tracing::{error, info};

use crate::child;
use crate::config::Config;
use crate::group::{TaskGroup, TaskOutcome, TaskStats};
use crate::message::MessageBus;
use crate::probe::{GpuProbe, HostProbe, NvmlProbe, SysinfoProbe};
use crate::runner::RunnerRegistry;
use crate::scheduler::GroupScheduler;

/// What a finished group looked like, in submission order.
#[derive(Debug)]
pub struct GroupReport {
    pub group_name: String,
    pub task_number: usize,
    pub success_number: usize,
    pub failed_number: usize,
    pub results: std::collections::BTreeMap<String, TaskOutcome>,
    pub task_stats: std::collections::BTreeMap<String, TaskStats>,
}

/// Temporarily enter a directory; restores the previous one on drop.
pub struct WorkdirGuard {
    previous: PathBuf,
}

impl WorkdirGuard {
    pub fn enter(dir: impl AsRef<std::path::Path>) -> Result<WorkdirGuard> {
        let previous = std::env::current_dir().context("read current dir")?;
        std::env::set_current_dir(dir.as_ref())
            .with_context(|| format!("enter {}", dir.as_ref().display()))?;
        Ok(WorkdirGuard { previous })
    }
}

impl Drop for WorkdirGuard {
    fn drop(&mut self) {
        if let Err(e) = std::env::set_current_dir(&self.previous) {
            error!(
                "restore workdir {}: {e}",
                self.previous.display()
            );
        }
    }
}

pub struct Engine {
    config: Config,
    registry: RunnerRegistry,
    // Defaults are built lazily in `start`, so spawned children never pay
    // for an NVML init they will not use.
    host_probe: Option<Box<dyn HostProbe>>,
    gpu_probe: Option<Box<dyn GpuProbe>>,
    groups: Vec<Arc<Mutex<TaskGroup>>>,
    known_ids: HashSet<String>,
}

impl Engine {
    pub fn new(config: Config, registry: RunnerRegistry) -> Engine {
        Engine {
            config,
            registry,
            host_probe: None,
            gpu_probe: None,
            groups: Vec::new(),
            known_ids: HashSet::new(),
        }
    }

    /// Swap the host telemetry source. Mostly for tests and exotic hosts.
    pub fn set_host_probe(&mut self, probe: impl HostProbe + 'static) {
        self.host_probe = Some(Box::new(probe));
    }

    pub fn set_gpu_probe(&mut self, probe: impl GpuProbe + 'static) {
        self.gpu_probe = Some(Box::new(probe));
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Submit a group. Groups run in submission order; ids are checked for
    /// global uniqueness here unless the config allows duplicates.
    pub fn add_group(&mut self, mut group: TaskGroup) -> Result<()> {
        group.index = self.groups.len() + 1;
        if self.config.scheduler.auto_adjust {
            group.auto_adjust_memory = group.estimate_memory.is_none();
            group.auto_adjust_cuda_memory = group.estimate_cuda_memory.is_none();
        }
        if !self.config.task.allow_duplicate_id {
            for task_id in group.task_ids() {
                if !self.known_ids.insert(task_id.clone()) {
                    bail!("duplicate task id {task_id:?} across groups");
                }
            }
        }
        self.groups.push(Arc::new(Mutex::new(group)));
        Ok(())
    }

    /// Run every submitted group to completion and return their reports.
    ///
    /// In a spawned task child this never returns: the child runtime runs
    /// the task and the process exits.
    pub fn start(mut self) -> Result<Vec<GroupReport>> {
        if child::spawned_as_child() {
            let code = match child::run(&self.registry) {
                Ok(()) => 0,
                Err(e) => {
                    error!("task child failed: {e:#}");
                    1
                }
            };
            std::process::exit(code);
        }

        let workdir =
            std::path::absolute(&self.config.workdir).context("resolve workdir")?;
        self.config.workdir = workdir.clone();
        std::fs::create_dir_all(&workdir)
            .with_context(|| format!("create workdir {}", workdir.display()))?;
        std::env::set_current_dir(&workdir)
            .with_context(|| format!("enter workdir {}", workdir.display()))?;

        let mut host_probe = self
            .host_probe
            .take()
            .unwrap_or_else(|| Box::new(SysinfoProbe::new()));
        let mut gpu_probe = self
            .gpu_probe
            .take()
            .unwrap_or_else(|| Box::new(NvmlProbe::new()));

        let mut bus = MessageBus::new();
        bus.start();

        let mut reports = Vec::new();
        for group in &self.groups {
            let name = {
                let g = group.lock().expect("group lock poisoned");
                g.group_name()
            };

            let result = if self.config.task.directory_grouping {
                std::fs::create_dir_all(&name)
                    .with_context(|| format!("create group dir {name}"))?;
                let guard = WorkdirGuard::enter(&name)?;
                {
                    let mut g = group.lock().expect("group lock poisoned");
                    g.workdir = Some(std::env::current_dir()?);
                }
                let result = GroupScheduler::new(&self.config, &mut *host_probe, &mut *gpu_probe)
                    .schedule(group, &bus);
                drop(guard);
                result
            } else {
                {
                    let mut g = group.lock().expect("group lock poisoned");
                    g.workdir = Some(workdir.clone());
                }
                GroupScheduler::new(&self.config, &mut *host_probe, &mut *gpu_probe)
                    .schedule(group, &bus)
            };
            if let Err(e) = &result {
                error!(group = %name, "schedule failed: {e:#}");
            }
            result?;

            let g = group.lock().expect("group lock poisoned");
            info!(
                group = %name,
                tasks = g.task_number(),
                success = g.success_number(),
                failed = g.failed_number(),
                "group finished"
            );
            reports.push(GroupReport {
                group_name: name,
                task_number: g.task_number(),
                success_number: g.success_number(),
                failed_number: g.failed_number(),
                results: g.results().clone(),
                task_stats: g.task_stats(),
            });
        }

        bus.stop();
        Ok(reports)
    }
}
