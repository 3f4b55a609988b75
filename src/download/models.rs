//! 下载任务的数据模型。
//!
//! 包含任务记录、任务状态、字节区间以及分块区间计算。

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// 默认分块大小：256 KiB。
pub const DEFAULT_CHUNK_SIZE: u64 = 1 << 18;
/// 单个分块的默认最大尝试次数。
pub const DEFAULT_MAX_RETRIES: u32 = 5;
/// 两次强制落盘之间的默认写入次数。
pub const DEFAULT_FLUSH_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TaskState {
    Downloading = 0,
    Paused = 1,
    Canceled = 2,
    Finished = 3,
    Errored = 4,
}

impl TaskState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TaskState::Downloading,
            1 => TaskState::Paused,
            2 => TaskState::Canceled,
            3 => TaskState::Finished,
            _ => TaskState::Errored,
        }
    }

    /// 新的 worker 可以从该状态继续（依赖本地文件恢复）。
    pub fn is_resumable(self) -> bool {
        matches!(self, TaskState::Paused | TaskState::Errored)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Downloading => "downloading",
            TaskState::Paused => "paused",
            TaskState::Canceled => "canceled",
            TaskState::Finished => "finished",
            TaskState::Errored => "errored",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个下载任务的记录。
///
/// 由调用方在启动 worker 之前创建；worker 结束时返回最终记录。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub remote_path: String,
    pub save_dir: PathBuf,
    pub save_name: String,
    pub total_size: u64,
    pub current_size: u64,
    pub state: TaskState,
}

impl TaskRecord {
    pub fn new(
        id: impl Into<String>,
        remote_path: impl Into<String>,
        save_dir: impl Into<PathBuf>,
        save_name: impl Into<String>,
        total_size: u64,
    ) -> Self {
        Self {
            id: id.into(),
            remote_path: remote_path.into(),
            save_dir: save_dir.into(),
            save_name: save_name.into(),
            total_size,
            current_size: 0,
            state: TaskState::Downloading,
        }
    }

    pub fn with_current_size(mut self, current_size: u64) -> Self {
        self.current_size = current_size;
        self
    }

    pub fn save_path(&self) -> PathBuf {
        self.save_dir.join(&self.save_name)
    }

    /// 复制一份处于 `Downloading` 状态的记录，供新的 worker 续传。
    pub fn restart(&self) -> Self {
        Self {
            state: TaskState::Downloading,
            ..self.clone()
        }
    }
}

/// 半开字节区间 `[start, stop)`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub stop: u64,
}

impl ByteRange {
    pub fn new(start: u64, stop: u64) -> Self {
        Self { start, stop }
    }

    pub fn len(&self) -> u64 {
        self.stop - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.stop <= self.start
    }

    /// HTTP `Range` 头的值，结束位置为闭区间。
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.stop.saturating_sub(1))
    }
}

/// 计算下一个分块区间；已经到达 `total` 时返回 `None`。
pub fn chunk_range(current: u64, total: u64, chunk_size: u64) -> Option<ByteRange> {
    if current >= total {
        return None;
    }
    let stop = current.saturating_add(chunk_size.max(1)).min(total);
    Some(ByteRange {
        start: current,
        stop,
    })
}
