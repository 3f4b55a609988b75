//! CLI 进度条：订阅下载事件并驱动 indicatif 字节进度条。

use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use super::events::{DownloadEvent, Subscription};
use super::models::TaskState;
use super::worker::TaskHandle;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct ProgressView {
    bar: ProgressBar,
}

impl ProgressView {
    pub fn new(label: &str, total: u64, start: u64) -> Self {
        let bar = ProgressBar::with_draw_target(Some(total), ProgressDrawTarget::stdout());
        Self::with_bar(bar, label, start)
    }

    /// 不绘制任何内容，用于非交互环境。
    pub fn hidden(total: u64, start: u64) -> Self {
        Self::with_bar(ProgressBar::hidden(), "", start).with_len(total)
    }

    fn with_bar(bar: ProgressBar, label: &str, start: u64) -> Self {
        let style = ProgressStyle::with_template(
            "{prefix} [{elapsed_precise}] {wide_bar} {bytes}/{total_bytes} {bytes_per_sec} ({eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar.set_prefix(label.to_string());
        bar.set_position(start);
        Self { bar }
    }

    fn with_len(self, total: u64) -> Self {
        self.bar.set_length(total);
        self
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    /// 应用一个事件；终态事件返回 `true`。
    pub fn apply(&self, event: &DownloadEvent) -> bool {
        match event {
            DownloadEvent::Received { current_size, .. } => {
                self.bar.set_position(*current_size);
                false
            }
            DownloadEvent::Downloaded { .. } => {
                if let Some(len) = self.bar.length() {
                    self.bar.set_position(len);
                }
                self.bar.finish_with_message("done");
                true
            }
            DownloadEvent::DiskError { .. } | DownloadEvent::NetworkError { .. } => {
                self.bar.abandon_with_message("failed");
                true
            }
        }
    }

    pub fn abandon(&self) {
        self.bar.abandon();
    }
}

/// 跟随任务直到出现终态事件，或 worker 以暂停/取消结束。
///
/// 返回收到的终态事件；暂停/取消没有终态事件，返回 `None`。
pub fn follow(
    subscription: &Subscription,
    view: &ProgressView,
    task: &TaskHandle,
) -> Option<DownloadEvent> {
    let terminal = follow_with(subscription, task, |event| view.apply(event));
    if terminal.is_none() {
        view.abandon();
    }
    terminal
}

/// 同 [`follow`]，每个事件交给 `on_event`，其返回 `true` 时结束。
pub fn follow_with(
    subscription: &Subscription,
    task: &TaskHandle,
    mut on_event: impl FnMut(&DownloadEvent) -> bool,
) -> Option<DownloadEvent> {
    loop {
        match subscription.recv_timeout(POLL_INTERVAL) {
            Ok(event) => {
                if on_event(&event) {
                    return Some(event);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if !task.is_running() && task.state() != TaskState::Downloading {
                    return subscription.try_iter().find(|event| on_event(event));
                }
            }
            Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
}

/// 以 JSON 行的形式输出事件，供脚本消费。
pub fn event_json(event: &DownloadEvent) -> String {
    serde_json::to_string(event).unwrap_or_else(|_| format!("{event:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn received_moves_bar_and_terminal_stops() {
        let view = ProgressView::hidden(600_000, 0);
        assert!(!view.apply(&DownloadEvent::Received {
            id: "t".into(),
            current_size: 262_144,
        }));
        assert_eq!(view.position(), 262_144);

        assert!(view.apply(&DownloadEvent::Downloaded { id: "t".into() }));
        assert_eq!(view.position(), 600_000);
    }

    #[test]
    fn events_serialize_as_tagged_json() {
        let line = event_json(&DownloadEvent::Received {
            id: "t".into(),
            current_size: 5,
        });
        assert_eq!(line, r#"{"event":"received","id":"t","current_size":5}"#);
        assert_eq!(
            event_json(&DownloadEvent::NetworkError { id: "t".into() }),
            r#"{"event":"network-error","id":"t"}"#
        );
    }

    #[test]
    fn errors_are_terminal() {
        let view = ProgressView::hidden(10, 4);
        assert_eq!(view.position(), 4);
        assert!(view.apply(&DownloadEvent::NetworkError { id: "t".into() }));
        assert!(view.apply(&DownloadEvent::DiskError { id: "t".into() }));
        assert_eq!(view.position(), 4);
    }
}
