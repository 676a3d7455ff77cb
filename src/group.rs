//! Task groups: bucketed task containers keyed by lifecycle state.
//!
//! A group owns its tasks for their whole life. Tasks sit in exactly one
//! state bucket at a time; `move_task` is the only way membership changes
//! and it updates the task's status atomically with the move.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use anyhow::{Result, bail};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::report::{format_accuracy, format_duration_ms};
use crate::task::{Task, TaskStatus};
use crate::units::MemValue;

/// Per-task record in the group result, in the shape the report renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum TaskOutcome {
    Success {
        train_acc: String,
        val_acc: String,
        data: String,
        load_time: String,
        train_time: String,
    },
    Fail {
        stage: String,
        message: String,
    },
}

/// Lifecycle bookkeeping of one task, snapshotted into group reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStats {
    pub status: TaskStatus,
    pub load_numbers: u32,
    pub train_numbers: u32,
    pub load_time: i64,
    pub train_time: i64,
}

pub struct TaskGroup {
    pub(crate) index: usize,
    name: Option<String>,
    /// Fallback estimates for tasks that carry none of their own.
    pub estimate_memory: Option<MemValue>,
    pub estimate_cuda_memory: Option<MemValue>,
    /// Default GPU pin applied to tasks without one.
    pub device: Option<String>,
    // Reserved for automatic estimate updates; carried but never acted on.
    pub(crate) auto_adjust_memory: bool,
    pub(crate) auto_adjust_cuda_memory: bool,
    task_ids: HashSet<String>,
    buckets: HashMap<TaskStatus, HashMap<String, Task>>,
    pub(crate) task_number: usize,
    pub(crate) success_number: usize,
    pub(crate) failed_number: usize,
    results: BTreeMap<String, TaskOutcome>,
    pub(crate) workdir: Option<PathBuf>,
}

impl TaskGroup {
    /// Anonymous group; it reports as `group-N` from its submission index.
    pub fn new() -> TaskGroup {
        TaskGroup {
            index: 0,
            name: None,
            estimate_memory: None,
            estimate_cuda_memory: None,
            device: None,
            auto_adjust_memory: false,
            auto_adjust_cuda_memory: false,
            task_ids: HashSet::new(),
            buckets: TaskStatus::ALL
                .iter()
                .map(|status| (*status, HashMap::new()))
                .collect(),
            task_number: 0,
            success_number: 0,
            failed_number: 0,
            results: BTreeMap::new(),
            workdir: None,
        }
    }

    pub fn named(name: impl Into<String>) -> TaskGroup {
        let mut group = TaskGroup::new();
        group.name = Some(name.into());
        group
    }

    pub fn estimate_memory(mut self, value: impl Into<MemValue>) -> TaskGroup {
        self.estimate_memory = Some(value.into());
        self
    }

    pub fn estimate_cuda_memory(mut self, value: impl Into<MemValue>) -> TaskGroup {
        self.estimate_cuda_memory = Some(value.into());
        self
    }

    pub fn device(mut self, device: impl Into<String>) -> TaskGroup {
        self.device = Some(device.into());
        self
    }

    /// Directory name of the group; explicit name or `group-N`.
    pub fn group_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("group-{}", self.index),
        }
    }

    /// Submit a task. Fails on an id already present in this group; the
    /// engine checks cross-group uniqueness at `add_group`.
    pub fn add_task(&mut self, mut task: Task) -> Result<()> {
        if task.device.is_none() {
            task.device = self.device.clone();
        }
        if !self.task_ids.insert(task.task_id.clone()) {
            bail!("duplicate task id {:?} in group", task.task_id);
        }
        self.task_number += 1;
        self.bucket_mut(task.status())
            .insert(task.task_id.clone(), task);
        Ok(())
    }

    pub(crate) fn get_task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.buckets
            .values_mut()
            .find_map(|bucket| bucket.get_mut(task_id))
    }

    /// Borrow a task only if it currently sits in `status`; lets the
    /// scheduler re-check a candidate after dropping and re-taking the lock.
    pub(crate) fn task_in(&mut self, status: TaskStatus, task_id: &str) -> Option<&mut Task> {
        self.bucket_mut(status).get_mut(task_id)
    }

    /// Move a task between state buckets, updating its status with the
    /// move. Fails when the task is not in the `from` bucket.
    pub(crate) fn move_task(
        &mut self,
        task_id: &str,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<()> {
        let Some(mut task) = self.bucket_mut(from).remove(task_id) else {
            bail!("task {task_id:?} is not in {from} state");
        };
        task.status = to;
        self.bucket_mut(to).insert(task_id.to_string(), task);
        Ok(())
    }

    /// Pick one task id from a bucket uniformly at random. Random choice
    /// spreads retries across interrupted tasks.
    pub(crate) fn retrieve_task(&mut self, status: TaskStatus) -> Option<String> {
        let bucket = self.bucket_mut(status);
        if bucket.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..bucket.len());
        bucket.keys().nth(idx).cloned()
    }

    /// `(process, waiting, training)` counts for the admission gates.
    pub(crate) fn numbers(&self) -> (usize, usize, usize) {
        let len = |status: TaskStatus| {
            self.buckets
                .get(&status)
                .map(HashMap::len)
                .unwrap_or_default()
        };
        let waiting =
            len(TaskStatus::Available) + len(TaskStatus::Loading) + len(TaskStatus::Waiting);
        let training = len(TaskStatus::Training);
        (waiting + training, waiting, training)
    }

    /// Record a successful task. The FINISHED payload is
    /// `{load_time, train_time, data}`; `train_acc` / `val_acc` are pulled
    /// out of the nested data map and the remainder becomes the report's
    /// data column.
    pub(crate) fn report_finish(&mut self, task_id: &str, payload: &Value) {
        self.success_number += 1;
        let mut data = match payload.get("data") {
            Some(Value::Object(map)) => map.clone(),
            _ => serde_json::Map::new(),
        };
        let train_acc = data.remove("train_acc").and_then(|v| v.as_f64());
        let val_acc = data.remove("val_acc").and_then(|v| v.as_f64());
        let load_time = payload
            .get("load_time")
            .and_then(Value::as_i64)
            .unwrap_or(-1);
        let train_time = payload
            .get("train_time")
            .and_then(Value::as_i64)
            .unwrap_or(-1);
        self.results.insert(
            task_id.to_string(),
            TaskOutcome::Success {
                train_acc: format_accuracy(train_acc),
                val_acc: format_accuracy(val_acc),
                data: Value::Object(data).to_string(),
                load_time: format_duration_ms(load_time),
                train_time: format_duration_ms(train_time),
            },
        );
    }

    /// Record a fatal task failure.
    pub(crate) fn report_exception(&mut self, task_id: &str, stage: &str, message: &str) {
        self.failed_number += 1;
        self.results.insert(
            task_id.to_string(),
            TaskOutcome::Fail {
                stage: stage.to_string(),
                message: message.to_string(),
            },
        );
    }

    /// A group is done once every task is accounted for.
    pub fn finished(&self) -> bool {
        self.success_number + self.failed_number >= self.task_number
    }

    pub fn results(&self) -> &BTreeMap<String, TaskOutcome> {
        &self.results
    }

    pub fn task_number(&self) -> usize {
        self.task_number
    }

    pub fn success_number(&self) -> usize {
        self.success_number
    }

    pub fn failed_number(&self) -> usize {
        self.failed_number
    }

    pub(crate) fn task_ids(&self) -> impl Iterator<Item = &String> {
        self.task_ids.iter()
    }

    /// Snapshot every task's lifecycle counters.
    pub fn task_stats(&self) -> BTreeMap<String, TaskStats> {
        self.buckets
            .values()
            .flat_map(|bucket| bucket.iter())
            .map(|(task_id, task)| {
                (
                    task_id.clone(),
                    TaskStats {
                        status: task.status(),
                        load_numbers: task.load_numbers,
                        train_numbers: task.train_numbers,
                        load_time: task.load_time,
                        train_time: task.train_time,
                    },
                )
            })
            .collect()
    }

    fn bucket_mut(&mut self, status: TaskStatus) -> &mut HashMap<String, Task> {
        self.buckets.entry(status).or_default()
    }

    #[cfg(test)]
    pub(crate) fn bucket_len(&self, status: TaskStatus) -> usize {
        self.buckets
            .get(&status)
            .map(HashMap::len)
            .unwrap_or_default()
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        TaskGroup::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn group_with(ids: &[&str]) -> TaskGroup {
        let mut group = TaskGroup::named("g");
        for id in ids {
            group.add_task(Task::with_id(*id, "runner")).unwrap();
        }
        group
    }

    #[test]
    fn tasks_live_in_exactly_one_bucket() {
        let mut group = group_with(&["a", "b"]);
        group
            .move_task("a", TaskStatus::Init, TaskStatus::Available)
            .unwrap();

        let mut total = 0;
        for status in TaskStatus::ALL {
            total += group.bucket_len(status);
        }
        assert_eq!(total, 2);
        assert_eq!(group.bucket_len(TaskStatus::Init), 1);
        assert_eq!(group.bucket_len(TaskStatus::Available), 1);
        assert_eq!(
            group.get_task_mut("a").unwrap().status(),
            TaskStatus::Available
        );
    }

    #[test]
    fn move_from_wrong_bucket_fails() {
        let mut group = group_with(&["a"]);
        assert!(
            group
                .move_task("a", TaskStatus::Waiting, TaskStatus::Training)
                .is_err()
        );
        // Unchanged on failure.
        assert_eq!(group.bucket_len(TaskStatus::Init), 1);
    }

    #[test]
    fn duplicate_id_rejected() {
        let mut group = group_with(&["a"]);
        assert!(group.add_task(Task::with_id("a", "runner")).is_err());
        assert_eq!(group.task_number(), 1);
    }

    #[test]
    fn retrieve_returns_none_on_empty_bucket() {
        let mut group = group_with(&["a"]);
        assert!(group.retrieve_task(TaskStatus::Waiting).is_none());
        assert_eq!(group.retrieve_task(TaskStatus::Init).as_deref(), Some("a"));
    }

    #[test]
    fn numbers_split_waiting_and_training() {
        let mut group = group_with(&["a", "b", "c", "d"]);
        group
            .move_task("a", TaskStatus::Init, TaskStatus::Available)
            .unwrap();
        group
            .move_task("b", TaskStatus::Init, TaskStatus::Loading)
            .unwrap();
        group
            .move_task("c", TaskStatus::Init, TaskStatus::Training)
            .unwrap();
        assert_eq!(group.numbers(), (3, 2, 1));
    }

    #[test]
    fn finished_when_all_tasks_accounted() {
        let mut group = group_with(&["a", "b"]);
        assert!(!group.finished());
        group.report_finish(
            "a",
            &json!({"load_time": 10, "train_time": 20, "data": {}}),
        );
        group.report_exception("b", "load", "LoadNumbersExceed");
        assert!(group.finished());
        assert_eq!(group.success_number(), 1);
        assert_eq!(group.failed_number(), 1);
    }

    #[test]
    fn finish_record_formats_accuracies_from_nested_data() {
        let mut group = group_with(&["a"]);
        group.report_finish(
            "a",
            &json!({
                "load_time": 3723004,
                "train_time": -1,
                "data": {"train_acc": 0.9, "val_acc": 0.8, "epochs": 5},
            }),
        );
        match &group.results()["a"] {
            TaskOutcome::Success {
                train_acc,
                val_acc,
                data,
                load_time,
                train_time,
            } => {
                assert_eq!(train_acc, "90.00%");
                assert_eq!(val_acc, "80.00%");
                assert_eq!(data, r#"{"epochs":5}"#);
                assert_eq!(load_time, "01:02:03.004");
                assert_eq!(train_time, "--:--:--.---");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn missing_accuracies_render_dashes() {
        let mut group = group_with(&["a"]);
        group.report_finish("a", &json!({"load_time": 5, "train_time": 6, "data": {}}));
        match &group.results()["a"] {
            TaskOutcome::Success {
                train_acc, val_acc, ..
            } => {
                assert_eq!(train_acc, "-");
                assert_eq!(val_acc, "-");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn malformed_finish_data_coerced_to_empty() {
        let mut group = group_with(&["a"]);
        group.report_finish(
            "a",
            &json!({"load_time": 1, "train_time": 2, "data": "not a map"}),
        );
        match &group.results()["a"] {
            TaskOutcome::Success { data, .. } => assert_eq!(data, "{}"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
