//! 单任务下载线程。
//!
//! 流程：本地恢复 → 链接解析 → 逐块（请求 → 写入）直到状态离开 `Downloading`。
//! 暂停/取消通过 [`TaskHandle`] 从其它线程发出，worker 在分块边界上观察到。

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::events::{DownloadEvent, EventPublisher};
use super::models::{
    ByteRange, DEFAULT_CHUNK_SIZE, DEFAULT_FLUSH_THRESHOLD, TaskRecord, TaskState, chunk_range,
};
use super::recovery::{self, OpenMode, RecoveryPlan};
use super::writer::{ChunkFile, FileWriter};
use crate::base_system::file_cleaner::remove_file_if_exists;
use crate::base_system::retry::RetryPolicy;
use crate::network_parser::network::{FetchError, FetchSettings, HttpRangeFetcher, RangeFetcher};
use crate::third_party::link_resolver::{DirectLink, LinkResolver, ResolveError};

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub chunk_size: u64,
    pub flush_threshold: u32,
    pub retry: RetryPolicy,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("write failed: {0}")]
    Write(#[source] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Network,
    Disk,
}

impl From<&TransferError> for Failure {
    fn from(err: &TransferError) -> Self {
        match err {
            TransferError::Fetch(_) => Failure::Network,
            TransferError::Write(_) => Failure::Disk,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkOutcome {
    Written,
    /// 状态已被外部改变，本块数据被丢弃。
    Interrupted,
}

struct Shared {
    template: TaskRecord,
    state: AtomicU8,
    current_size: AtomicU64,
    active: Mutex<bool>,
}

impl Shared {
    fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn current_size(&self) -> u64 {
        self.current_size.load(Ordering::Acquire)
    }

    fn active(&self) -> MutexGuard<'_, bool> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn snapshot(&self) -> TaskRecord {
        TaskRecord {
            current_size: self.current_size(),
            state: self.state(),
            ..self.template.clone()
        }
    }
}

/// 任务的外部控制句柄，可在任意线程克隆使用。
#[derive(Clone)]
pub struct TaskHandle {
    shared: Arc<Shared>,
}

impl TaskHandle {
    pub fn id(&self) -> &str {
        &self.shared.template.id
    }

    pub fn remote_path(&self) -> &str {
        &self.shared.template.remote_path
    }

    pub fn total_size(&self) -> u64 {
        self.shared.template.total_size
    }

    pub fn save_path(&self) -> PathBuf {
        self.shared.template.save_path()
    }

    pub fn state(&self) -> TaskState {
        self.shared.state()
    }

    pub fn current_size(&self) -> u64 {
        self.shared.current_size()
    }

    pub fn snapshot(&self) -> TaskRecord {
        self.shared.snapshot()
    }

    pub fn is_running(&self) -> bool {
        *self.shared.active()
    }

    /// 请求暂停；只有 `Downloading` 状态会被改变。返回是否生效。
    pub fn pause(&self) -> bool {
        let changed = self
            .shared
            .transition(TaskState::Downloading, TaskState::Paused);
        if changed {
            info!(target: "download", id = %self.id(), "请求暂停");
        }
        changed
    }

    /// 取消任务并删除本地文件。worker 仍在运行时由 worker 在退出前删除。
    pub fn stop(&self) {
        self.shared
            .state
            .store(TaskState::Canceled as u8, Ordering::Release);
        info!(target: "download", id = %self.id(), "请求取消");

        let active = self.shared.active();
        if !*active {
            discard_file(&self.shared.template);
        }
    }
}

fn discard_file(record: &TaskRecord) {
    let path = record.save_path();
    match remove_file_if_exists(&path) {
        Ok(true) => info!(target: "download", id = %record.id, "已删除 {}", path.display()),
        Ok(false) => {}
        Err(err) => {
            warn!(target: "download", id = %record.id, "删除 {} 失败: {}", path.display(), err)
        }
    }
}

/// 按恢复分支打开目标文件。
pub type FileOpener = dyn Fn(&Path, OpenMode) -> io::Result<Box<dyn ChunkFile>> + Send;

fn open_local(path: &Path, mode: OpenMode) -> io::Result<Box<dyn ChunkFile>> {
    Ok(Box::new(recovery::open(path, mode)?))
}

pub struct Downloader {
    shared: Arc<Shared>,
    fetcher: Box<dyn RangeFetcher>,
    opener: Box<FileOpener>,
    resolver: Arc<dyn LinkResolver>,
    events: EventPublisher,
    settings: WorkerSettings,
}

impl Downloader {
    pub fn new(
        record: TaskRecord,
        fetcher: Box<dyn RangeFetcher>,
        resolver: Arc<dyn LinkResolver>,
        events: EventPublisher,
        settings: WorkerSettings,
    ) -> Self {
        let shared = Shared {
            state: AtomicU8::new(record.state as u8),
            current_size: AtomicU64::new(record.current_size),
            active: Mutex::new(false),
            template: record,
        };
        Self {
            shared: Arc::new(shared),
            fetcher,
            opener: Box::new(open_local),
            resolver,
            events,
            settings,
        }
    }

    /// 使用 HTTP Range 请求的 worker，每个任务一个连接池。
    pub fn with_http(
        record: TaskRecord,
        fetch_settings: &FetchSettings,
        resolver: Arc<dyn LinkResolver>,
        events: EventPublisher,
        settings: WorkerSettings,
    ) -> Result<Self, FetchError> {
        let fetcher = HttpRangeFetcher::new(fetch_settings)?;
        Ok(Self::new(
            record,
            Box::new(fetcher),
            resolver,
            events,
            settings,
        ))
    }

    /// 替换打开本地文件的方式，例如包装句柄以统计或限制写入。
    pub fn with_file_opener<F>(mut self, opener: F) -> Self
    where
        F: Fn(&Path, OpenMode) -> io::Result<Box<dyn ChunkFile>> + Send + 'static,
    {
        self.opener = Box::new(opener);
        self
    }

    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// 在独立线程上运行，线程返回最终的任务记录。
    pub fn spawn(self) -> io::Result<(TaskHandle, JoinHandle<TaskRecord>)> {
        let handle = self.handle();
        let join = thread::Builder::new()
            .name(format!("dl-{}", self.shared.template.id))
            .spawn(move || self.run())?;
        Ok((handle, join))
    }

    /// 在当前线程上运行直到任务离开 `Downloading`。
    pub fn run(mut self) -> TaskRecord {
        *self.shared.active() = true;
        self.drive();

        {
            let mut active = self.shared.active();
            if self.shared.state() == TaskState::Canceled {
                discard_file(&self.shared.template);
            }
            *active = false;
        }

        let record = self.shared.snapshot();
        info!(
            target: "download",
            id = %record.id,
            state = %record.state,
            current = record.current_size,
            total = record.total_size,
            "任务结束"
        );
        record
    }

    fn id(&self) -> &str {
        &self.shared.template.id
    }

    fn drive(&mut self) {
        let state = self.shared.state();
        if state != TaskState::Downloading {
            debug!(target: "download", id = %self.id(), %state, "非下载状态，跳过");
            return;
        }

        let path = self.shared.template.save_path();
        let total = self.shared.template.total_size;

        let local = match recovery::inspect(&path) {
            Ok(local) => local,
            Err(err) => {
                error!(
                    target: "download",
                    id = %self.id(),
                    "检查本地文件 {} 失败: {}",
                    path.display(),
                    err
                );
                self.fail(Failure::Disk);
                return;
            }
        };
        let plan = recovery::plan(local, self.shared.current_size(), total);
        let current = plan.current_size(total);
        self.shared.current_size.store(current, Ordering::Release);
        debug!(target: "download", id = %self.id(), ?local, current, total, ?plan, "本地恢复");

        let mode = match plan {
            RecoveryPlan::Finished => {
                info!(target: "download", id = %self.id(), "本地文件已完整");
                self.finish();
                return;
            }
            RecoveryPlan::Open { mode, .. } => mode,
        };

        let link = match self.resolve() {
            Ok(link) => link,
            Err(err) => {
                error!(target: "download", id = %self.id(), "解析下载链接失败: {}", err);
                self.fail(Failure::Network);
                return;
            }
        };

        let file = match (self.opener)(&path, mode) {
            Ok(file) => file,
            Err(err) => {
                error!(
                    target: "download",
                    id = %self.id(),
                    "打开 {} 失败: {}",
                    path.display(),
                    err
                );
                self.fail(Failure::Disk);
                return;
            }
        };

        info!(target: "download", id = %self.id(), current, total, "开始下载");
        let mut writer = FileWriter::new(&path, file, current, self.settings.flush_threshold);
        self.transfer(&link, &mut writer);

        // 暂停/取消/出错时同样先落盘再关闭
        if let Err(err) = writer.close() {
            warn!(target: "download", id = %self.id(), "关闭文件失败: {}", err);
        }
    }

    fn resolve(&self) -> Result<DirectLink, ResolveError> {
        let remote_path = &self.shared.template.remote_path;
        let meta = self.resolver.resolve_metadata(remote_path)?;
        if let Some(size) = meta.size
            && size != self.shared.template.total_size
        {
            warn!(
                target: "download",
                id = %self.id(),
                remote = size,
                recorded = self.shared.template.total_size,
                "远端大小与记录不一致"
            );
        }
        let link = self.resolver.resolve_direct_link(&meta)?;
        if link.token.trim().is_empty() {
            return Err(ResolveError::EmptyToken);
        }
        if link.url.trim().is_empty() {
            return Err(ResolveError::MissingField("url"));
        }
        Ok(link)
    }

    fn transfer(&mut self, link: &DirectLink, writer: &mut FileWriter) {
        let total = self.shared.template.total_size;
        while self.shared.state() == TaskState::Downloading {
            let current = self.shared.current_size();
            let Some(range) = chunk_range(current, total, self.settings.chunk_size) else {
                match writer.close() {
                    Ok(()) => self.finish(),
                    Err(err) => {
                        error!(target: "download", id = %self.id(), "落盘失败: {}", err);
                        self.fail(Failure::Disk);
                    }
                }
                return;
            };

            match self.transfer_chunk(link, range, writer) {
                Ok(ChunkOutcome::Written) => {}
                Ok(ChunkOutcome::Interrupted) => return,
                Err(err) => {
                    error!(
                        target: "download",
                        id = %self.id(),
                        start = range.start,
                        stop = range.stop,
                        "分块重试耗尽: {}",
                        err
                    );
                    self.fail(Failure::from(&err));
                    return;
                }
            }
        }
    }

    fn transfer_chunk(
        &mut self,
        link: &DirectLink,
        range: ByteRange,
        writer: &mut FileWriter,
    ) -> Result<ChunkOutcome, TransferError> {
        let retry = self.settings.retry;
        let mut attempt = 0u32;
        loop {
            match self.attempt_chunk(link, range, writer) {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    attempt += 1;
                    if attempt >= retry.max_attempts {
                        return Err(err);
                    }
                    if self.shared.state() != TaskState::Downloading {
                        return Ok(ChunkOutcome::Interrupted);
                    }
                    warn!(
                        target: "download",
                        id = %self.id(),
                        attempt,
                        start = range.start,
                        "分块失败，准备重试: {}",
                        err
                    );
                    retry.sleep(attempt - 1);
                }
            }
        }
    }

    fn attempt_chunk(
        &mut self,
        link: &DirectLink,
        range: ByteRange,
        writer: &mut FileWriter,
    ) -> Result<ChunkOutcome, TransferError> {
        let bytes = self.fetcher.fetch(&link.url, range)?;
        if bytes.len() as u64 != range.len() {
            return Err(TransferError::Fetch(FetchError::BodyLength {
                expected: range.len(),
                actual: bytes.len() as u64,
            }));
        }
        if self.shared.state() != TaskState::Downloading {
            return Ok(ChunkOutcome::Interrupted);
        }

        if let Err(err) = writer.write_chunk(range, &bytes) {
            if let Err(rewind_err) = writer.rewind(range.start) {
                warn!(target: "download", id = %self.id(), "回退写入位置失败: {}", rewind_err);
            }
            return Err(TransferError::Write(err));
        }

        self.shared.current_size.store(range.stop, Ordering::Release);
        debug!(target: "download", id = %self.id(), current = range.stop, "写入分块");
        self.events.publish(DownloadEvent::Received {
            id: self.id().to_string(),
            current_size: range.stop,
        });
        Ok(ChunkOutcome::Written)
    }

    fn finish(&self) {
        if self
            .shared
            .transition(TaskState::Downloading, TaskState::Finished)
        {
            info!(target: "download", id = %self.id(), "下载完成");
            self.events.publish(DownloadEvent::Downloaded {
                id: self.id().to_string(),
            });
        }
    }

    fn fail(&self, failure: Failure) {
        if !self
            .shared
            .transition(TaskState::Downloading, TaskState::Errored)
        {
            return;
        }
        let id = self.id().to_string();
        self.events.publish(match failure {
            Failure::Network => DownloadEvent::NetworkError { id },
            Failure::Disk => DownloadEvent::DiskError { id },
        });
    }
}
