//! 可断点续传的分块 HTTP 下载。
//!
//! 每个任务一个线程，按固定大小的字节区间顺序请求并写入本地文件；
//! 重启后根据本地文件大小恢复进度，进度与结果通过 [`download::events`] 分发。

pub mod base_system;
pub mod download;
pub mod network_parser;
pub mod third_party;

pub use download::events::{DownloadEvent, EventFilter, EventKind, EventPublisher, Subscription};
pub use download::models::{ByteRange, TaskRecord, TaskState};
pub use download::worker::{Downloader, TaskHandle, WorkerSettings};
pub use network_parser::network::{FetchError, FetchSettings, HttpRangeFetcher, RangeFetcher};
pub use third_party::link_resolver::{
    DirectLink, DirectLinkResolver, LinkResolver, MetaApiResolver, RemoteMeta, ResolveError,
    ResolverKind,
};
