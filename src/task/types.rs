use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 任务类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    CreateFolder,
    UploadFile,
    UploadFolder,
    DownloadFile,
    DownloadFolder,
    MoveFile,
    MoveFolder,
    RenameFile,
    RenameFolder,
}

/// 任务状态
///
/// 状态机：`Pending -> InProcess -> {Success, Error, Cancelled}`，
/// 以及 `InProcess <-> Paused`。终态不可离开（重试走 `TaskRegistry::restart`）。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// 等待中
    Pending,
    /// 进行中
    InProcess,
    /// 已暂停
    Paused,
    /// 已完成
    Success,
    /// 失败
    Error,
    /// 已取消
    Cancelled,
}

impl TaskStatus {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Error | TaskStatus::Cancelled
        )
    }

    /// 是否允许迁移到目标状态
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        if *self == next {
            return true;
        }
        match self {
            Pending => matches!(next, InProcess | Error | Cancelled),
            InProcess => matches!(next, Paused | Success | Error | Cancelled),
            Paused => matches!(next, InProcess | Error | Cancelled),
            Success | Error | Cancelled => false,
        }
    }
}

/// 任务载荷（仅用于界面标题/图标渲染和重试，引擎核心不解释）
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskPayload {
    /// 涉及的文件/文件夹名
    pub name: String,
    /// 目标父目录ID（上传/移动）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_id: Option<String>,
    /// 来源项目ID（下载/移动）
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_ids: Vec<String>,
    /// 任务完成后产生的远程资源ID（如上传后的根目录ID，供界面跳转）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_id: Option<String>,
    /// 是否显示系统通知
    #[serde(default)]
    pub show_notification: bool,
    /// 总条目数（文件夹 + 文件）
    #[serde(default)]
    pub items_total: u64,
    /// 已处理条目数
    #[serde(default)]
    pub items_done: u64,
    /// 总字节数
    #[serde(default)]
    pub bytes_total: u64,
    /// 已处理字节数
    #[serde(default)]
    pub bytes_done: u64,
    /// 传输速度 (bytes/s)
    #[serde(default)]
    pub speed: u64,
}

impl TaskPayload {
    /// 以名称创建载荷
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// 任务记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// 任务ID
    pub id: String,
    /// 任务类型
    pub kind: TaskKind,
    /// 任务状态
    pub status: TaskStatus,
    /// 进度 [0.0, 1.0]
    pub progress: f64,
    /// 是否可取消（创建时确定）
    pub cancellable: bool,
    /// 父任务ID（子任务批量取消用）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_task_id: Option<String>,
    /// 失败时展示的副标题
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    /// 载荷
    pub payload: TaskPayload,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 最后更新时间
    pub updated_at: DateTime<Utc>,
}

/// 创建任务所需数据（不含 id/status/progress）
#[derive(Debug, Clone)]
pub struct NewTask {
    pub kind: TaskKind,
    pub cancellable: bool,
    pub related_task_id: Option<String>,
    pub payload: TaskPayload,
}

impl NewTask {
    pub fn new(kind: TaskKind, payload: TaskPayload) -> Self {
        Self {
            kind,
            cancellable: true,
            related_task_id: None,
            payload,
        }
    }

    /// 关联到父任务
    pub fn related_to(mut self, parent_id: &str) -> Self {
        self.related_task_id = Some(parent_id.to_string());
        self
    }
}

/// 任务浅合并补丁，`None` 字段保持原值
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub progress: Option<f64>,
    pub subtitle: Option<String>,
    pub result_id: Option<String>,
    pub items_total: Option<u64>,
    pub items_done: Option<u64>,
    pub bytes_total: Option<u64>,
    pub bytes_done: Option<u64>,
    pub speed: Option<u64>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn progress(progress: f64) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }

    /// 失败补丁（附带副标题）
    pub fn failed(subtitle: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Error),
            subtitle: Some(subtitle.into()),
            ..Default::default()
        }
    }
}

/// 任务查询条件（各条件之间为 AND）
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub related_task_id: Option<String>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        self.status.map_or(true, |s| task.status == s)
            && self
                .related_task_id
                .as_deref()
                .map_or(true, |r| task.related_task_id.as_deref() == Some(r))
    }
}

/// 任务事件（全局通道和按任务ID的通道都会收到）
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// 任务创建
    Added(Task),
    /// 任务更新（携带更新后的完整快照）
    Updated(Task),
    /// 任务被取消（stop 动作已执行完毕）
    Cancelled { task_id: String },
    /// 任务记录被清除
    Cleared { task_ids: Vec<String> },
}

impl TaskEvent {
    /// 事件对应的任务ID（清除事件为 None）
    pub fn task_id(&self) -> Option<&str> {
        match self {
            TaskEvent::Added(task) | TaskEvent::Updated(task) => Some(&task.id),
            TaskEvent::Cancelled { task_id } => Some(task_id),
            TaskEvent::Cleared { .. } => None,
        }
    }
}
