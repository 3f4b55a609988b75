//! 下载事件的进程级分发。
//!
//! 每个订阅者有两条通道：
//! - 进度（`Received`）走有界队列，队列满时丢弃最旧的一条，发布方永不阻塞；
//! - 终态事件走无界队列，订阅者存活期间不会丢失。
//!
//! 接收端总是先取完进度队列再取终态事件，保证同一任务内的先后顺序。

use std::cell::RefCell;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crossbeam_channel::{
    Receiver, RecvError, RecvTimeoutError, Sender, TrySendError, bounded, select, unbounded,
};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum DownloadEvent {
    Received { id: String, current_size: u64 },
    Downloaded { id: String },
    DiskError { id: String },
    NetworkError { id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Received,
    Downloaded,
    DiskError,
    NetworkError,
}

impl DownloadEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DownloadEvent::Received { .. } => EventKind::Received,
            DownloadEvent::Downloaded { .. } => EventKind::Downloaded,
            DownloadEvent::DiskError { .. } => EventKind::DiskError,
            DownloadEvent::NetworkError { .. } => EventKind::NetworkError,
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            DownloadEvent::Received { id, .. }
            | DownloadEvent::Downloaded { id }
            | DownloadEvent::DiskError { id }
            | DownloadEvent::NetworkError { id } => id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DownloadEvent::Received { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    kinds: Option<Vec<EventKind>>,
    task_id: Option<String>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_task(id: impl Into<String>) -> Self {
        Self {
            kinds: None,
            task_id: Some(id.into()),
        }
    }

    pub fn kinds(mut self, kinds: &[EventKind]) -> Self {
        self.kinds = Some(kinds.to_vec());
        self
    }

    pub fn matches(&self, event: &DownloadEvent) -> bool {
        if let Some(id) = &self.task_id
            && id != event.task_id()
        {
            return false;
        }
        match &self.kinds {
            Some(kinds) => kinds.contains(&event.kind()),
            None => true,
        }
    }
}

struct Subscriber {
    filter: EventFilter,
    alive: Weak<()>,
    tick_tx: Sender<DownloadEvent>,
    // 发布方持有一份接收端，用于在队列满时淘汰最旧的进度
    tick_evict: Receiver<DownloadEvent>,
    terminal_tx: Sender<DownloadEvent>,
}

impl Subscriber {
    fn deliver(&self, event: DownloadEvent) {
        if !event.is_terminal() {
            match self.tick_tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    let _ = self.tick_evict.try_recv();
                    let _ = self.tick_tx.try_send(event);
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        } else {
            let _ = self.terminal_tx.send(event);
        }
    }
}

/// 可克隆的事件发布方，多个 worker 共享同一实例。
#[derive(Clone)]
pub struct EventPublisher {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    tick_capacity: usize,
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventPublisher {
    /// `tick_capacity`：每个订阅者最多缓存的进度事件数。
    pub fn new(tick_capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            tick_capacity: tick_capacity.max(1),
        }
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let (tick_tx, ticks) = bounded(self.tick_capacity);
        let (terminal_tx, terminals) = unbounded();
        let token = Arc::new(());
        let subscriber = Subscriber {
            filter,
            alive: Arc::downgrade(&token),
            tick_tx,
            tick_evict: ticks.clone(),
            terminal_tx,
        };
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(subscriber);
        }
        Subscription {
            ticks,
            terminals,
            pending: RefCell::new(None),
            _token: token,
        }
    }

    pub fn publish(&self, event: DownloadEvent) {
        let Ok(mut subs) = self.subscribers.lock() else {
            return;
        };
        subs.retain(|s| s.alive.strong_count() > 0);
        for sub in subs.iter().filter(|s| s.filter.matches(&event)) {
            sub.deliver(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .map(|mut subs| {
                subs.retain(|s| s.alive.strong_count() > 0);
                subs.len()
            })
            .unwrap_or(0)
    }
}

/// 单个订阅者的接收端；丢弃后在下一次发布时被清理。
pub struct Subscription {
    ticks: Receiver<DownloadEvent>,
    terminals: Receiver<DownloadEvent>,
    pending: RefCell<Option<DownloadEvent>>,
    _token: Arc<()>,
}

impl Subscription {
    pub fn try_recv(&self) -> Option<DownloadEvent> {
        if let Ok(tick) = self.ticks.try_recv() {
            return Some(tick);
        }
        if let Some(terminal) = self.pending.borrow_mut().take() {
            return Some(terminal);
        }
        self.try_terminal()
    }

    // 两个通道分别读取，读终态前可能又到了进度
    fn try_terminal(&self) -> Option<DownloadEvent> {
        self.terminals.try_recv().ok().map(|t| self.after_ticks(t))
    }

    pub fn recv(&self) -> Result<DownloadEvent, RecvError> {
        if let Some(event) = self.try_recv() {
            return Ok(event);
        }
        select! {
            recv(self.ticks) -> tick => tick.or_else(|_| self.terminals.recv()),
            recv(self.terminals) -> terminal => terminal.map(|t| self.after_ticks(t)),
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<DownloadEvent, RecvTimeoutError> {
        if let Some(event) = self.try_recv() {
            return Ok(event);
        }
        select! {
            recv(self.ticks) -> tick => match tick {
                Ok(tick) => Ok(tick),
                Err(_) => self.terminals.recv_timeout(timeout),
            },
            recv(self.terminals) -> terminal => match terminal {
                Ok(terminal) => Ok(self.after_ticks(terminal)),
                Err(_) => Err(RecvTimeoutError::Disconnected),
            },
            default(timeout) => Err(RecvTimeoutError::Timeout),
        }
    }

    pub fn try_iter(&self) -> impl Iterator<Item = DownloadEvent> + '_ {
        std::iter::from_fn(move || self.try_recv())
    }

    // 终态事件与进度同时就绪时，先交付进度
    fn after_ticks(&self, terminal: DownloadEvent) -> DownloadEvent {
        match self.ticks.try_recv() {
            Ok(tick) => {
                *self.pending.borrow_mut() = Some(terminal);
                tick
            }
            Err(_) => terminal,
        }
    }
}
