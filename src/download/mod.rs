//! 下载流程模块入口。
//!
//! 子模块：
//! - `models`    — 任务记录 / 任务状态 / 字节区间
//! - `recovery`  — 本地残留文件恢复
//! - `writer`    — 顺序写入与周期落盘
//! - `events`    — 下载事件分发
//! - `worker`    — 单任务下载线程与控制句柄
//! - `progress`  — CLI 进度条

pub mod events;
pub mod models;
pub mod progress;
pub mod recovery;
pub mod worker;
pub mod writer;
