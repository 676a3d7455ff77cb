//! User task bodies.
//!
//! A task body implements [`TaskRunner`]; the two stages mirror the task
//! lifecycle: `load` prepares everything memory-heavy, `train` does the
//! compute on an assigned device and returns the task's result map. Bodies
//! are registered by name in a [`RunnerRegistry`] inside the user's `main`,
//! and looked up again inside each child process, which re-runs that same
//! `main`.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

use crate::child::RunContext;

/// JSON object, the shape of task params and results.
pub type JsonMap = serde_json::Map<String, Value>;

/// Error taxonomy for task stages. The two out-of-memory variants are
/// recoverable interrupts (retried under the per-stage budgets); everything
/// else is fatal for the task.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Host memory exhausted while loading.
    #[error("out of memory")]
    OutOfMemory,
    /// Device memory exhausted while training.
    #[error("CUDA out of memory")]
    CudaOutOfMemory,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl TaskError {
    /// Device OOMs are also recognized by message, so bodies that merely
    /// bubble up a driver error string still trigger a training retry.
    pub(crate) fn is_cuda_oom(&self) -> bool {
        match self {
            TaskError::CudaOutOfMemory => true,
            TaskError::Failed(e) => format!("{e:#}").contains("CUDA out of memory"),
            TaskError::OutOfMemory => false,
        }
    }
}

/// A two-stage task body. `load` runs once per child process (restarted
/// from scratch after a host-OOM interrupt); `train` may be re-invoked on
/// the same loaded state after a device-OOM interrupt.
pub trait TaskRunner: Send {
    fn load(&mut self, ctx: &RunContext) -> Result<(), TaskError>;

    fn train(&mut self, ctx: &RunContext, device: &str) -> Result<JsonMap, TaskError>;
}

type RunnerFactory = Box<dyn Fn(&Value) -> Box<dyn TaskRunner> + Send + Sync>;

/// Name → factory table for task bodies. The factory receives the task's
/// params payload.
#[derive(Default)]
pub struct RunnerRegistry {
    factories: HashMap<String, RunnerFactory>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        RunnerRegistry::default()
    }

    /// Register a body under `name`, replacing any previous registration.
    pub fn register<F, R>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> R + Send + Sync + 'static,
        R: TaskRunner + 'static,
    {
        self.factories.insert(
            name.into(),
            Box::new(move |params| Box::new(factory(params))),
        );
    }

    pub fn build(&self, name: &str, params: &Value) -> Option<Box<dyn TaskRunner>> {
        self.factories.get(name).map(|f| f(params))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl TaskRunner for Nop {
        fn load(&mut self, _ctx: &RunContext) -> Result<(), TaskError> {
            Ok(())
        }

        fn train(&mut self, _ctx: &RunContext, _device: &str) -> Result<JsonMap, TaskError> {
            Ok(JsonMap::new())
        }
    }

    #[test]
    fn registry_builds_by_name() {
        let mut registry = RunnerRegistry::new();
        registry.register("nop", |_params| Nop);
        assert!(registry.contains("nop"));
        assert!(registry.build("nop", &Value::Null).is_some());
        assert!(registry.build("missing", &Value::Null).is_none());
    }

    #[test]
    fn cuda_oom_detected_by_variant_and_message() {
        assert!(TaskError::CudaOutOfMemory.is_cuda_oom());
        assert!(
            TaskError::Failed(anyhow::anyhow!("RuntimeError: CUDA out of memory. Tried..."))
                .is_cuda_oom()
        );
        assert!(!TaskError::OutOfMemory.is_cuda_oom());
        assert!(!TaskError::Failed(anyhow::anyhow!("shape mismatch")).is_cuda_oom());
    }
}
