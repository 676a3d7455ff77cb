//! The group scheduler: a resource-aware admission loop.
//!
//! One group is scheduled at a time. Each tick reads the group's occupancy
//! counts, then tries at most one promotion per path — spawn an INIT task,
//! command LOAD on an AVAILABLE one, command TRAIN on a WAITING one — with
//! every promotion gated on live CPU / host-memory / GPU-memory telemetry.
//! Child status frames arrive on the bus and are folded into the group by
//! [`TaskHandler`] on the dispatcher thread, so the group sits behind a
//! mutex shared by both threads.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::group::TaskGroup;
use crate::message::{Handler, MessageBus, cmd};
use crate::probe::{GpuProbe, HostProbe};
use crate::report;
use crate::task::{SpawnContext, TaskStatus};
use crate::units::gib;

pub struct GroupScheduler<'a> {
    config: &'a Config,
    host: &'a mut dyn HostProbe,
    gpu: &'a mut dyn GpuProbe,
}

impl<'a> GroupScheduler<'a> {
    pub fn new(
        config: &'a Config,
        host: &'a mut dyn HostProbe,
        gpu: &'a mut dyn GpuProbe,
    ) -> Self {
        GroupScheduler { config, host, gpu }
    }

    /// Run the group to completion, then deliver its report.
    pub fn schedule(&mut self, group: &Arc<Mutex<TaskGroup>>, bus: &MessageBus) -> Result<()> {
        let (index, name) = {
            let g = lock(group);
            (g.index, g.group_name())
        };
        info!(group = %name, index, "schedule group");
        bus.register_default_handler(Arc::new(TaskHandler::new(Arc::clone(group), self.config)));

        let remain_memory = self.config.remain_limit.memory.as_bytes()?;
        let remain_cuda_memory = self.config.remain_limit.cuda_memory.as_bytes()?;

        let mut round = 1u64;
        while !lock(group).finished() {
            let (process_number, waiting_number, training_number) = lock(group).numbers();
            info!(
                round,
                waiting_number, training_number, process_number, "schedule round"
            );
            round += 1;

            let sched = &self.config.scheduler;
            if sched.max_process == 0 || process_number < sched.max_process {
                if self.cpu_free() {
                    if sched.max_waiting == 0 || waiting_number < sched.max_waiting {
                        if self.admit_init(group, bus)? {
                            std::thread::sleep(Duration::from_secs_f64(sched.spawn_cooldown));
                        }
                        if self.admit_load(group, bus, remain_memory)? {
                            std::thread::sleep(Duration::from_secs_f64(sched.spawn_cooldown));
                        }
                    } else {
                        info!("the maximum number of waiting has been reached");
                    }
                    self.admit_train(group, remain_cuda_memory)?;
                } else {
                    warn!("CPU utilization is too high");
                }
            } else {
                info!("the maximum number of processes has been reached");
            }

            debug!("sleeping");
            std::thread::sleep(Duration::from_secs_f64(sched.interval));
        }

        let g = lock(group);
        match report::deliver(self.config, &g) {
            Ok(path) => info!(group = %name, path = %path.display(), "group report written"),
            Err(e) => error!(group = %name, "group report failed: {e:#}"),
        }
        Ok(())
    }

    /// INIT path: spawn one task's child. Returns true when a spawn
    /// happened, so the tick can cool off before commanding it.
    fn admit_init(&mut self, group: &Arc<Mutex<TaskGroup>>, bus: &MessageBus) -> Result<bool> {
        let mut g = lock(group);
        let Some(task_id) = g.retrieve_task(TaskStatus::Init) else {
            debug!("no init task exists");
            return Ok(false);
        };
        let workdir = g
            .workdir
            .clone()
            .unwrap_or_else(|| self.config.workdir.clone());
        info!(task_id = %task_id, "task start");
        let started = {
            let Some(task) = g.task_in(TaskStatus::Init, &task_id) else {
                return Ok(false);
            };
            task.start(&SpawnContext {
                group_workdir: &workdir,
                bus_sender: bus.sender(),
            })
        };
        if let Err(e) = started {
            error!(task_id = %task_id, "spawn failed: {e:#}");
            g.report_exception(&task_id, "spawn", &format!("{e:#}"));
            g.move_task(&task_id, TaskStatus::Init, TaskStatus::Exception)?;
            return Ok(false);
        }
        Ok(true)
    }

    /// AVAILABLE path: either respawn a task whose child died in a load
    /// interrupt, or command LOAD when the host-memory gate passes.
    /// Returns true when a respawn happened.
    fn admit_load(
        &mut self,
        group: &Arc<Mutex<TaskGroup>>,
        bus: &MessageBus,
        remain_limit: u64,
    ) -> Result<bool> {
        let (task_id, workdir, alive, require_memory) = {
            let mut g = lock(group);
            let Some(task_id) = g.retrieve_task(TaskStatus::Available) else {
                debug!("no available task exists");
                return Ok(false);
            };
            let group_estimate = g.estimate_memory.clone();
            let workdir = g
                .workdir
                .clone()
                .unwrap_or_else(|| self.config.workdir.clone());
            let Some(task) = g.task_in(TaskStatus::Available, &task_id) else {
                return Ok(false);
            };
            let estimate = task
                .estimate_memory
                .clone()
                .or(group_estimate)
                .unwrap_or_else(|| self.config.scheduler.default_memory.clone());
            // A task whose pipe is gone is on its way out even if the
            // process has not fully exited yet; treat it as dead.
            let alive = task.is_alive() && task.has_pipe();
            (task_id, workdir, alive, estimate.as_bytes()?)
        };

        if !alive {
            // The previous child was killed after a load interrupt.
            let mut g = lock(group);
            if let Some(task) = g.task_in(TaskStatus::Available, &task_id) {
                info!(task_id = %task_id, "task restart");
                if let Err(e) = task.start(&SpawnContext {
                    group_workdir: &workdir,
                    bus_sender: bus.sender(),
                }) {
                    error!(task_id = %task_id, "respawn failed: {e:#}");
                    g.report_exception(&task_id, "spawn", &format!("{e:#}"));
                    g.move_task(&task_id, TaskStatus::Available, TaskStatus::Exception)?;
                    return Ok(false);
                }
            }
            return Ok(true);
        }

        if self.memory_free(require_memory, remain_limit) {
            let mut g = lock(group);
            if let Some(task) = g.task_in(TaskStatus::Available, &task_id) {
                info!(task_id = %task_id, "start load");
                if let Err(e) = task.start_load() {
                    error!(task_id = %task_id, "load command failed: {e:#}");
                }
            }
        } else {
            warn!("memory utilization is too high");
        }
        Ok(false)
    }

    /// WAITING path: command TRAIN on the first GPU that fits.
    fn admit_train(&mut self, group: &Arc<Mutex<TaskGroup>>, remain_limit: u64) -> Result<()> {
        let (task_id, require_cuda_memory, pin) = {
            let mut g = lock(group);
            let Some(task_id) = g.retrieve_task(TaskStatus::Waiting) else {
                info!("no waiting task exists");
                return Ok(());
            };
            let group_estimate = g.estimate_cuda_memory.clone();
            let Some(task) = g.task_in(TaskStatus::Waiting, &task_id) else {
                return Ok(());
            };
            let estimate = task
                .estimate_cuda_memory
                .clone()
                .or(group_estimate)
                .unwrap_or_else(|| self.config.scheduler.default_cuda_memory.clone());
            (task_id, estimate.as_bytes()?, task.device.clone())
        };

        let device_id = self.assign_cuda(require_cuda_memory, remain_limit, pin.as_deref());
        if device_id >= 0 {
            let device = format!("cuda:{device_id}");
            let mut g = lock(group);
            if let Some(task) = g.task_in(TaskStatus::Waiting, &task_id) {
                info!(task_id = %task_id, device = %device, "start train");
                if let Err(e) = task.start_train(&device) {
                    error!(task_id = %task_id, "train command failed: {e:#}");
                }
            }
        } else {
            warn!("GPU utilization is too high");
        }
        Ok(())
    }

    fn cpu_free(&mut self) -> bool {
        let cpu_percent = self.host.cpu_percent();
        debug!(cpu_percent, "CPU utilization");
        (cpu_percent as f64) < 100.0 * self.config.utilization_limit.cpu
    }

    fn memory_free(&mut self, require_memory: u64, remain_limit: u64) -> bool {
        let memory = self.host.memory();
        debug!(
            available_gib = gib(memory.available),
            total_gib = gib(memory.total),
            "memory utilization"
        );
        let available = memory.available as i64 - require_memory as i64;
        if available < 0 {
            return false;
        }
        if (available as f64) / (memory.total as f64)
            < 1.0 - self.config.utilization_limit.memory
        {
            return false;
        }
        available as u64 >= remain_limit
    }

    /// Pick the first GPU that passes both gates; -1 when none does. A pin
    /// restricts the candidates to that index; a malformed or out-of-range
    /// pin falls back to considering every GPU.
    fn assign_cuda(&mut self, require_cuda_memory: u64, remain_limit: u64, pin: Option<&str>) -> i64 {
        let mut gpus = self.gpu.gpus();
        if let Some(pin) = pin {
            match pin.trim().trim_start_matches("cuda:").parse::<usize>() {
                Ok(idx) if idx < gpus.len() => gpus = vec![gpus[idx]],
                _ => warn!(pin, "ignoring unusable device pin"),
            }
        }

        for gpu in &gpus {
            debug!(
                index = gpu.index,
                free_gib = gib(gpu.free),
                total_gib = gib(gpu.total),
                "gpu memory"
            );
            let available = gpu.free as i64 - require_cuda_memory as i64;
            if available < 0 {
                continue;
            }
            if (available as f64) / (gpu.total as f64)
                < 1.0 - self.config.utilization_limit.cuda_memory
            {
                continue;
            }
            if (available as u64) < remain_limit {
                continue;
            }
            debug!(index = gpu.index, "select gpu");
            return gpu.index as i64;
        }
        debug!("no free gpu");
        -1
    }
}

fn lock(group: &Arc<Mutex<TaskGroup>>) -> std::sync::MutexGuard<'_, TaskGroup> {
    group.lock().expect("group lock poisoned")
}

/// Routes a group's child frames into group state changes. Registered as
/// the bus's default handler while the group is being scheduled.
pub(crate) struct TaskHandler {
    group: Arc<Mutex<TaskGroup>>,
    load_nretry: u32,
    train_nretry: u32,
}

impl TaskHandler {
    pub(crate) fn new(group: Arc<Mutex<TaskGroup>>, config: &Config) -> Self {
        TaskHandler {
            group,
            load_nretry: config.scheduler.load_nretry,
            train_nretry: config.scheduler.train_nretry,
        }
    }

    fn handle_status(&self, source: &str, status: TaskStatus, data: Value) -> Result<()> {
        let mut group = lock(&self.group);
        let Some((from, load_numbers, train_numbers)) =
            group.get_task_mut(source).map(|task| {
                (task.status(), task.load_numbers, task.train_numbers)
            })
        else {
            warn!(task_id = source, "status from unknown task");
            return Ok(());
        };

        match status {
            TaskStatus::Exception => {
                let stage = data["stage"].as_str().unwrap_or_default().to_string();
                let message = data["message"].as_str().unwrap_or_default().to_string();
                if let Some(task) = group.get_task_mut(source) {
                    task.exit();
                }
                group.report_exception(source, &stage, &message);
                group.move_task(source, from, TaskStatus::Exception)?;
            }
            TaskStatus::Interrupt => {
                let stage = data["stage"].as_str().unwrap_or_default();
                if stage == "LOAD" {
                    if load_numbers < self.load_nretry {
                        // Kill the child; the scheduler respawns from
                        // AVAILABLE and retries the load there.
                        if let Some(task) = group.get_task_mut(source) {
                            task.exit();
                        }
                        group.move_task(source, from, TaskStatus::Available)?;
                    } else {
                        if let Some(task) = group.get_task_mut(source) {
                            task.exit();
                        }
                        group.report_exception(source, "load", "LoadNumbersExceed");
                        group.move_task(source, from, TaskStatus::Exception)?;
                    }
                } else if train_numbers < self.train_nretry {
                    // Training retries reuse the loaded state in the same
                    // child, so the process stays up.
                    group.move_task(source, from, TaskStatus::Waiting)?;
                } else {
                    if let Some(task) = group.get_task_mut(source) {
                        task.exit();
                    }
                    group.report_exception(source, "train", "TrainNumbersExceed");
                    group.move_task(source, from, TaskStatus::Exception)?;
                }
            }
            TaskStatus::Finished => {
                if let Some(task) = group.get_task_mut(source) {
                    // Mirror the child-measured stage timings.
                    task.load_time = data["load_time"].as_i64().unwrap_or(-1);
                    task.train_time = data["train_time"].as_i64().unwrap_or(-1);
                    task.exit();
                }
                group.move_task(source, from, TaskStatus::Exited)?;
                group.report_finish(source, &data);
            }
            other => {
                if other == TaskStatus::Unknown {
                    error!(task_id = source, "protocol violation: unknown status");
                }
                group.move_task(source, from, other)?;
            }
        }
        Ok(())
    }
}

impl Handler for TaskHandler {
    fn handle(&self, source: &str, command: &str, data: Value) -> Result<()> {
        match command {
            cmd::UPDATE_STATUS => {
                let mut map = match data {
                    Value::Object(map) => map,
                    _ => Map::new(),
                };
                let status_value = map.remove("status").unwrap_or(Value::Null);
                let status = TaskStatus::from_frame(&status_value);
                info!(task_id = source, status = %status, "receive update status signal");
                self.handle_status(source, status, Value::Object(map))
            }
            cmd::SET_RESULT => {
                let mut group = lock(&self.group);
                if let Some(task) = group.get_task_mut(source) {
                    task.result = match data {
                        Value::Object(map) => map,
                        _ => Map::new(),
                    };
                } else {
                    warn!(task_id = source, "result from unknown task");
                }
                Ok(())
            }
            cmd::SET_ITEM => {
                let mut group = lock(&self.group);
                if let Some(task) = group.get_task_mut(source) {
                    let key = data["key"].as_str().unwrap_or_default().to_string();
                    task.items.insert(key, data["value"].clone());
                } else {
                    warn!(task_id = source, "item from unknown task");
                }
                Ok(())
            }
            other => {
                warn!(task_id = source, cmd = other, "unhandled message");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::TaskOutcome;
    use crate::probe::{GpuStat, HostMemory, StaticGpuProbe, StaticHostProbe};
    use crate::task::Task;
    use serde_json::json;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn scheduler_parts() -> (Config, StaticHostProbe, StaticGpuProbe) {
        let config = Config::default();
        let host = StaticHostProbe::new(
            10.0,
            HostMemory {
                total: 64 * GIB,
                available: 48 * GIB,
            },
        );
        let gpu = StaticGpuProbe::new(vec![
            GpuStat {
                index: 0,
                total: 8 * GIB,
                free: 2 * GIB,
            },
            GpuStat {
                index: 1,
                total: 8 * GIB,
                free: 8 * GIB,
            },
        ]);
        (config, host, gpu)
    }

    #[test]
    fn cpu_gate_follows_utilization_limit() {
        let (config, mut host, mut gpu) = scheduler_parts();
        let mut scheduler = GroupScheduler::new(&config, &mut host, &mut gpu);
        assert!(scheduler.cpu_free());
        drop(scheduler);

        host.set_cpu_percent(85.0); // limit is 0.8 → 80%
        let mut scheduler = GroupScheduler::new(&config, &mut host, &mut gpu);
        assert!(!scheduler.cpu_free());
    }

    #[test]
    fn memory_gate_checks_fraction_and_floor() {
        let (config, mut host, mut gpu) = scheduler_parts();
        let mut scheduler = GroupScheduler::new(&config, &mut host, &mut gpu);
        // 48 GiB available, 2 GiB required, floor 1 GiB: fine.
        assert!(scheduler.memory_free(2 * GIB, GIB));
        // Requirement exceeding what is available.
        assert!(!scheduler.memory_free(50 * GIB, GIB));
        drop(scheduler);

        // Fraction gate: available-after must stay ≥ (1 - 0.8) of total.
        host.set_memory(HostMemory {
            total: 64 * GIB,
            available: 14 * GIB,
        });
        let mut scheduler = GroupScheduler::new(&config, &mut host, &mut gpu);
        assert!(!scheduler.memory_free(2 * GIB, GIB)); // 12/64 < 0.2
        drop(scheduler);

        // Floor gate: fraction passes (0.5/2 = 0.25) but under the 1 GiB floor.
        host.set_memory(HostMemory {
            total: 2 * GIB,
            available: 2 * GIB,
        });
        let mut scheduler = GroupScheduler::new(&config, &mut host, &mut gpu);
        assert!(!scheduler.memory_free(3 * GIB / 2, GIB));
    }

    #[test]
    fn gpu_assignment_picks_first_fitting_device() {
        let (config, mut host, mut gpu) = scheduler_parts();
        let mut scheduler = GroupScheduler::new(&config, &mut host, &mut gpu);
        // 1.5 GiB request: gpu 0 would keep only 0.5 GiB of its 8 GiB, which
        // fails both residual gates; gpu 1 fits.
        assert_eq!(scheduler.assign_cuda(3 * GIB / 2, GIB, None), 1);
        // A small request leaves gpu 0 above both gates.
        assert_eq!(scheduler.assign_cuda(GIB / 4, 0, None), 0);
    }

    #[test]
    fn gpu_assignment_serializes_when_memory_insufficient() {
        let (config, mut host, mut gpu) = scheduler_parts();
        gpu.set_gpus(vec![GpuStat {
            index: 0,
            total: 2 * GIB,
            free: 2 * GIB,
        }]);
        let mut scheduler = GroupScheduler::new(&config, &mut host, &mut gpu);
        // First 1.5 GiB task fits: 0.5 GiB remains, a quarter of the card.
        assert_eq!(scheduler.assign_cuda(3 * GIB / 2, 0, None), 0);
        drop(scheduler);
        // While it trains, free memory drops below the second request, so
        // the two tasks can never train in parallel.
        gpu.set_gpus(vec![GpuStat {
            index: 0,
            total: 2 * GIB,
            free: GIB / 2,
        }]);
        let mut scheduler = GroupScheduler::new(&config, &mut host, &mut gpu);
        assert_eq!(scheduler.assign_cuda(3 * GIB / 2, 0, None), -1);
    }

    #[test]
    fn gpu_pin_restricts_and_degrades() {
        let (config, mut host, mut gpu) = scheduler_parts();
        let mut scheduler = GroupScheduler::new(&config, &mut host, &mut gpu);
        // Pin to the busy device: it fails the gates, nothing else considered.
        assert_eq!(scheduler.assign_cuda(3 * GIB / 2, GIB, Some("cuda:0")), -1);
        // Pin to the free device.
        assert_eq!(scheduler.assign_cuda(3 * GIB / 2, GIB, Some("cuda:1")), 1);
        // Malformed and out-of-range pins fall back to all devices.
        assert_eq!(scheduler.assign_cuda(3 * GIB / 2, GIB, Some("cuda:x")), 1);
        assert_eq!(scheduler.assign_cuda(3 * GIB / 2, GIB, Some("cuda:9")), 1);
    }

    fn handler_with_task(status: TaskStatus, load_numbers: u32, train_numbers: u32) -> (TaskHandler, Arc<Mutex<TaskGroup>>) {
        let mut group = TaskGroup::named("g");
        group.add_task(Task::with_id("t", "runner")).unwrap();
        group.move_task("t", TaskStatus::Init, status).unwrap();
        {
            let task = group.get_task_mut("t").unwrap();
            task.load_numbers = load_numbers;
            task.train_numbers = train_numbers;
        }
        let group = Arc::new(Mutex::new(group));
        let mut config = Config::default();
        config.scheduler.load_nretry = 2;
        config.scheduler.train_nretry = 2;
        (TaskHandler::new(Arc::clone(&group), &config), group)
    }

    #[test]
    fn load_interrupt_with_budget_returns_to_available() {
        let (handler, group) = handler_with_task(TaskStatus::Loading, 1, 0);
        handler
            .handle("t", cmd::UPDATE_STATUS, json!({"status": "INTERRUPT", "stage": "LOAD"}))
            .unwrap();
        let g = group.lock().unwrap();
        assert_eq!(g.bucket_len(TaskStatus::Available), 1);
        assert!(!g.finished());
    }

    #[test]
    fn load_interrupt_without_budget_is_fatal() {
        let (handler, group) = handler_with_task(TaskStatus::Loading, 2, 0);
        handler
            .handle("t", cmd::UPDATE_STATUS, json!({"status": "INTERRUPT", "stage": "LOAD"}))
            .unwrap();
        let g = group.lock().unwrap();
        assert_eq!(g.bucket_len(TaskStatus::Exception), 1);
        assert_eq!(g.failed_number(), 1);
        assert_eq!(
            g.results()["t"],
            TaskOutcome::Fail {
                stage: "load".into(),
                message: "LoadNumbersExceed".into()
            }
        );
    }

    #[test]
    fn train_interrupt_with_budget_returns_to_waiting() {
        let (handler, group) = handler_with_task(TaskStatus::Training, 1, 1);
        handler
            .handle("t", cmd::UPDATE_STATUS, json!({"status": "INTERRUPT", "stage": "TRAIN"}))
            .unwrap();
        let g = group.lock().unwrap();
        assert_eq!(g.bucket_len(TaskStatus::Waiting), 1);
    }

    #[test]
    fn train_interrupt_without_budget_is_fatal() {
        let (handler, group) = handler_with_task(TaskStatus::Training, 1, 2);
        handler
            .handle("t", cmd::UPDATE_STATUS, json!({"status": "INTERRUPT", "stage": "TRAIN"}))
            .unwrap();
        let g = group.lock().unwrap();
        assert_eq!(
            g.results()["t"],
            TaskOutcome::Fail {
                stage: "train".into(),
                message: "TrainNumbersExceed".into()
            }
        );
    }

    #[test]
    fn finished_moves_to_exited_and_records_success() {
        let (handler, group) = handler_with_task(TaskStatus::Training, 1, 1);
        handler
            .handle(
                "t",
                cmd::UPDATE_STATUS,
                json!({
                    "status": "FINISHED",
                    "load_time": 12,
                    "train_time": 34,
                    "data": {"train_acc": 0.5},
                }),
            )
            .unwrap();
        let g = group.lock().unwrap();
        assert_eq!(g.bucket_len(TaskStatus::Exited), 1);
        assert_eq!(g.success_number(), 1);
        assert!(g.finished());
    }

    #[test]
    fn exception_records_stage_and_message() {
        let (handler, group) = handler_with_task(TaskStatus::Loading, 1, 0);
        handler
            .handle(
                "t",
                cmd::UPDATE_STATUS,
                json!({"status": "EXCEPTION", "stage": "LOAD", "message": "boom"}),
            )
            .unwrap();
        let g = group.lock().unwrap();
        assert_eq!(g.bucket_len(TaskStatus::Exception), 1);
        assert_eq!(
            g.results()["t"],
            TaskOutcome::Fail {
                stage: "LOAD".into(),
                message: "boom".into()
            }
        );
    }

    #[test]
    fn plain_status_update_moves_buckets() {
        let (handler, group) = handler_with_task(TaskStatus::Init, 0, 0);
        handler
            .handle("t", cmd::UPDATE_STATUS, json!({"status": "AVAILABLE"}))
            .unwrap();
        assert_eq!(group.lock().unwrap().bucket_len(TaskStatus::Available), 1);
    }

    #[test]
    fn set_result_and_set_item_mirror_into_task() {
        let (handler, group) = handler_with_task(TaskStatus::Training, 1, 1);
        handler
            .handle("t", cmd::SET_RESULT, json!({"train_acc": 0.9}))
            .unwrap();
        handler
            .handle("t", cmd::SET_ITEM, json!({"key": "round", "value": 3}))
            .unwrap();
        let mut g = group.lock().unwrap();
        let task = g.get_task_mut("t").unwrap();
        assert_eq!(task.result["train_acc"], json!(0.9));
        assert_eq!(task.items["round"], json!(3));
    }
}
