//! 任务模块
//!
//! 传输任务记录、状态机和注册表

pub mod registry;
pub mod types;

pub use registry::{StopAction, TaskRegistry};
pub use types::{NewTask, Task, TaskEvent, TaskFilter, TaskKind, TaskPatch, TaskPayload, TaskStatus};
