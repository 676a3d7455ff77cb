//! taskherd — resource-aware local scheduler for heavyweight compute jobs.
//!
//! Work is described as [`Task`]s collected into ordered [`TaskGroup`]s.
//! Each task runs in its own child process, driven through a
//! LOAD → TRAIN → EXIT lifecycle over a command pipe; admission is throttled
//! against live CPU, host-memory, and GPU-memory pressure, and out-of-memory
//! interruptions are retried under per-stage budgets.
//!
//! A minimal user program registers its task bodies and starts the engine:
//!
//! ```no_run
//! use taskherd::{Config, Engine, JsonMap, RunContext, RunnerRegistry};
//! use taskherd::{Task, TaskError, TaskGroup, TaskRunner};
//!
//! struct Train;
//!
//! impl TaskRunner for Train {
//!     fn load(&mut self, _ctx: &RunContext) -> Result<(), TaskError> {
//!         Ok(()) // read datasets, allocate buffers, ...
//!     }
//!     fn train(&mut self, _ctx: &RunContext, _device: &str) -> Result<JsonMap, TaskError> {
//!         Ok(JsonMap::new())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut registry = RunnerRegistry::new();
//!     registry.register("train", |_params| Train);
//!
//!     let mut group = TaskGroup::named("experiment");
//!     group.add_task(Task::new("train").estimate_memory("512MiB"))?;
//!
//!     let mut engine = Engine::new(Config::detect()?, registry);
//!     engine.add_group(group)?;
//!     engine.start()?; // also the pivot into spawned task children
//!     Ok(())
//! }
//! ```

pub mod child;
pub mod config;
pub mod engine;
pub mod group;
pub mod mail;
pub mod message;
pub mod probe;
pub mod report;
pub mod runner;
pub mod scheduler;
pub mod task;
pub mod units;

pub use child::RunContext;
pub use config::Config;
pub use engine::{Engine, GroupReport, WorkdirGuard};
pub use group::{TaskGroup, TaskOutcome, TaskStats};
pub use message::{Frame, Handler, MessageBus};
pub use probe::{GpuProbe, GpuStat, HostMemory, HostProbe, StaticGpuProbe, StaticHostProbe};
pub use runner::{JsonMap, RunnerRegistry, TaskError, TaskRunner};
pub use task::{Task, TaskStatus};
pub use units::{ByteUnit, MemValue};
