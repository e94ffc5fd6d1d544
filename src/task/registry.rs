//! 任务注册表
//!
//! 所有传输任务记录的唯一权威存储：
//! - 创建/更新/查询/取消
//! - 全局事件通道 + 按任务ID的事件通道
//! - 状态只能沿状态机前进，进行中时进度单调不减
//!
//! 锁内完成状态修改和事件发送，观察者不会看到与状态不一致的进度。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{NewTask, Task, TaskEvent, TaskFilter, TaskPatch, TaskStatus};
use crate::error::{Result, TransferError};

/// 事件通道容量
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// 任务停止动作：调用后必须让任务及其派生的全部工作进入终态
pub type StopAction = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct RegistryState {
    tasks: HashMap<String, Task>,
    /// 插入顺序
    order: Vec<String>,
    stops: HashMap<String, StopAction>,
}

struct RegistryInner {
    state: RwLock<RegistryState>,
    events: broadcast::Sender<TaskEvent>,
    scoped: DashMap<String, broadcast::Sender<TaskEvent>>,
}

/// 任务注册表（可克隆，克隆共享同一份状态）
#[derive(Clone)]
pub struct TaskRegistry {
    inner: Arc<RegistryInner>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(RegistryInner {
                state: RwLock::new(RegistryState::default()),
                events,
                scoped: DashMap::new(),
            }),
        }
    }

    /// 订阅全局任务事件
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    /// 订阅指定任务的事件
    pub fn subscribe_task(&self, task_id: &str) -> broadcast::Receiver<TaskEvent> {
        self.inner
            .scoped
            .entry(task_id.to_string())
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// 向全局和任务通道广播（调用方持有状态锁）
    fn emit(&self, event: TaskEvent) {
        if let Some(task_id) = event.task_id() {
            if let Some(sender) = self.inner.scoped.get(task_id) {
                let _ = sender.send(event.clone());
            }
        }
        let _ = self.inner.events.send(event);
    }

    /// 创建任务，返回新任务ID
    pub fn create(&self, new_task: NewTask) -> String {
        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4().to_string(),
            kind: new_task.kind,
            status: TaskStatus::Pending,
            progress: 0.0,
            cancellable: new_task.cancellable,
            related_task_id: new_task.related_task_id,
            subtitle: None,
            payload: new_task.payload,
            created_at: now,
            updated_at: now,
        };
        let task_id = task.id.clone();

        debug!(
            "创建任务: id={}, kind={:?}, related={:?}",
            task_id, task.kind, task.related_task_id
        );

        let mut state = self.inner.state.write();
        state.order.push(task_id.clone());
        state.tasks.insert(task_id.clone(), task.clone());
        self.emit(TaskEvent::Added(task));

        task_id
    }

    /// 设置任务的停止动作
    ///
    /// 任务不存在或已结束（例如在设置前就被取消）时不设置，返回 false，
    /// 调用方需要自行停止。
    pub fn set_stop(&self, task_id: &str, stop: StopAction) -> bool {
        let mut state = self.inner.state.write();
        match state.tasks.get(task_id) {
            Some(task) if !task.status.is_terminal() => {
                state.stops.insert(task_id.to_string(), stop);
                true
            }
            _ => false,
        }
    }

    /// 设置停止动作；任务在此之前已被取消时直接触发 `cancel`
    pub fn set_stop_or_cancel(
        &self,
        task_id: &str,
        stop: StopAction,
        cancel: &CancellationToken,
    ) -> bool {
        if self.set_stop(task_id, stop) {
            return true;
        }
        if let Some(TaskStatus::Cancelled) = self.find(task_id).map(|t| t.status) {
            debug!("设置停止动作前任务已取消: id={}", task_id);
            cancel.cancel();
        }
        false
    }

    /// 浅合并更新任务
    ///
    /// 任务不存在时静默忽略（可能已被界面清除），返回是否生效。
    /// 状态只接受状态机允许的迁移；进行中的任务进度不会回退。
    pub fn update(&self, task_id: &str, patch: TaskPatch) -> bool {
        let mut state = self.inner.state.write();
        let Some(task) = state.tasks.get_mut(task_id) else {
            debug!("更新不存在的任务，忽略: id={}", task_id);
            return false;
        };

        apply_patch(task, patch);
        let snapshot = task.clone();
        if snapshot.status.is_terminal() {
            state.stops.remove(task_id);
        }
        self.emit(TaskEvent::Updated(snapshot));
        true
    }

    /// 查询单个任务
    pub fn find(&self, task_id: &str) -> Option<Task> {
        self.inner.state.read().tasks.get(task_id).cloned()
    }

    /// 按条件查询任务（插入顺序）
    pub fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let state = self.inner.state.read();
        state
            .order
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .filter(|task| filter.matches(task))
            .cloned()
            .collect()
    }

    /// 取消任务
    ///
    /// 状态置为 Cancelled，执行（并等待）停止动作，然后广播取消事件。
    /// 任务不存在或已处于终态时返回 false。
    pub async fn cancel(&self, task_id: &str) -> bool {
        let stop = {
            let mut state = self.inner.state.write();
            let Some(task) = state.tasks.get_mut(task_id) else {
                return false;
            };
            if task.status.is_terminal() {
                debug!("任务已处于终态，忽略取消: id={}, status={:?}", task_id, task.status);
                return false;
            }
            task.status = TaskStatus::Cancelled;
            task.updated_at = Utc::now();
            let snapshot = task.clone();
            let stop = state.stops.remove(task_id);
            self.emit(TaskEvent::Updated(snapshot));
            stop
        };

        info!("取消任务: id={}, has_stop={}", task_id, stop.is_some());

        if let Some(stop) = stop {
            stop().await;
        }

        let _guard = self.inner.state.read();
        self.emit(TaskEvent::Cancelled {
            task_id: task_id.to_string(),
        });
        true
    }

    /// 等待任务被取消（任务已取消时立即返回）
    pub async fn wait_cancelled(&self, task_id: &str) {
        let mut rx = self.subscribe_task(task_id);
        if self
            .find(task_id)
            .map_or(false, |t| t.status == TaskStatus::Cancelled)
        {
            return;
        }
        loop {
            match rx.recv().await {
                Ok(TaskEvent::Cancelled { .. }) => return,
                Ok(TaskEvent::Updated(task)) if task.status == TaskStatus::Cancelled => return,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("任务事件接收滞后: id={}, skipped={}", task_id, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// 暂停进行中的任务
    pub fn pause(&self, task_id: &str) -> Result<()> {
        self.transition(task_id, TaskStatus::InProcess, TaskStatus::Paused)
    }

    /// 恢复已暂停的任务
    pub fn resume(&self, task_id: &str) -> Result<()> {
        self.transition(task_id, TaskStatus::Paused, TaskStatus::InProcess)
    }

    fn transition(&self, task_id: &str, from: TaskStatus, to: TaskStatus) -> Result<()> {
        let mut state = self.inner.state.write();
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| TransferError::TaskNotFound(task_id.to_string()))?;
        if task.status != from {
            return Err(TransferError::InvalidTransition {
                from: task.status,
                to,
            });
        }
        task.status = to;
        task.updated_at = Utc::now();
        let snapshot = task.clone();
        self.emit(TaskEvent::Updated(snapshot));
        Ok(())
    }

    /// 重启任务（重试）
    ///
    /// 复用同一任务ID：状态重置为 InProcess，进度和计数清零。
    /// 只允许 Pending/Error/Cancelled 任务重启。
    pub fn restart(&self, task_id: &str) -> Result<()> {
        let mut state = self.inner.state.write();
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| TransferError::TaskNotFound(task_id.to_string()))?;
        match task.status {
            TaskStatus::Pending | TaskStatus::Error | TaskStatus::Cancelled => {}
            other => {
                return Err(TransferError::InvalidTransition {
                    from: other,
                    to: TaskStatus::InProcess,
                })
            }
        }

        info!("重启任务: id={}, 原状态={:?}", task_id, task.status);

        task.status = TaskStatus::InProcess;
        task.progress = 0.0;
        task.subtitle = None;
        task.payload.result_id = None;
        task.payload.items_done = 0;
        task.payload.bytes_done = 0;
        task.payload.speed = 0;
        task.updated_at = Utc::now();
        let snapshot = task.clone();
        self.emit(TaskEvent::Updated(snapshot));
        Ok(())
    }

    /// 清除所有任务（仅由界面触发）
    pub fn clear(&self) {
        self.clear_where(|_| true);
    }

    /// 清除已结束的任务
    pub fn clear_finished(&self) {
        self.clear_where(|task| task.status.is_terminal());
    }

    fn clear_where(&self, predicate: impl Fn(&Task) -> bool) {
        let mut guard = self.inner.state.write();
        let state = &mut *guard;
        let removed: Vec<String> = state
            .order
            .iter()
            .filter(|id| state.tasks.get(*id).map_or(true, &predicate))
            .cloned()
            .collect();
        if removed.is_empty() {
            return;
        }
        for id in &removed {
            state.tasks.remove(id);
            state.stops.remove(id);
            self.inner.scoped.remove(id);
        }
        state.order.retain(|id| state.tasks.contains_key(id));

        info!("清除任务: {} 个", removed.len());
        self.emit(TaskEvent::Cleared { task_ids: removed });
    }

    /// 当前任务数
    pub fn len(&self) -> usize {
        self.inner.state.read().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.len())
            .finish()
    }
}

fn apply_patch(task: &mut Task, patch: TaskPatch) {
    if let Some(next) = patch.status {
        if task.status.can_transition_to(next) {
            task.status = next;
        } else {
            debug!(
                "忽略非法状态迁移: id={}, {:?} -> {:?}",
                task.id, task.status, next
            );
        }
    }

    if let Some(progress) = patch.progress {
        let progress = progress.clamp(0.0, 1.0);
        if task.status != TaskStatus::InProcess || progress >= task.progress {
            task.progress = progress;
        }
    }

    if let Some(subtitle) = patch.subtitle {
        task.subtitle = Some(subtitle);
    }
    if let Some(result_id) = patch.result_id {
        task.payload.result_id = Some(result_id);
    }
    if let Some(v) = patch.items_total {
        task.payload.items_total = v;
    }
    if let Some(v) = patch.items_done {
        task.payload.items_done = v;
    }
    if let Some(v) = patch.bytes_total {
        task.payload.bytes_total = v;
    }
    if let Some(v) = patch.bytes_done {
        task.payload.bytes_done = v;
    }
    if let Some(v) = patch.speed {
        task.payload.speed = v;
    }
    task.updated_at = Utc::now();
}
