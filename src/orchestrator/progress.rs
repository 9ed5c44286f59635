//! 进度汇总
//!
//! 计数全部来自原子累加，而不是波次开始时拍下的快照，
//! 因此并发结算时不会丢更新。每次结算后都会通过 `watch` 通道推送最新进度。

use crate::models::Stage;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;

/// 对外发布的进度
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub stage: Option<Stage>,
    /// 成功的条目数
    pub completed: usize,
    pub failed: usize,
    /// 本次调度的条目总数
    pub total: usize,
    /// 已结算（成功 + 失败）占比
    pub percent: f64,
    /// 当前波次，从 1 开始
    pub wave: usize,
    pub total_waves: usize,
    /// 最近结算的条目
    pub current_label: String,
    pub last_settled_at: Option<DateTime<Utc>>,
}

impl ProgressSnapshot {
    pub fn settled(&self) -> usize {
        self.completed + self.failed
    }

    /// 人类可读的状态行
    pub fn status_line(&self) -> String {
        let stage = self.stage.map(|s| s.label()).unwrap_or("空闲");
        let mut line = format!(
            "[{}] 第 {}/{} 批 · {}/{} ({:.0}%)",
            stage,
            self.wave,
            self.total_waves,
            self.settled(),
            self.total,
            self.percent
        );
        if self.failed > 0 {
            line.push_str(&format!(" · 失败 {}", self.failed));
        }
        if !self.current_label.is_empty() {
            line.push_str(&format!(" · 最近: {}", self.current_label));
        }
        line
    }
}

/// 进度汇总器
pub struct ProgressAggregator {
    completed: AtomicUsize,
    failed: AtomicUsize,
    total: AtomicUsize,
    wave: AtomicUsize,
    total_waves: AtomicUsize,
    detail: Mutex<ProgressDetail>,
    sender: watch::Sender<ProgressSnapshot>,
}

#[derive(Debug, Default)]
struct ProgressDetail {
    stage: Option<Stage>,
    label: String,
    last_settled_at: Option<DateTime<Utc>>,
}

impl Default for ProgressAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressAggregator {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(ProgressSnapshot::default());
        Self {
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            wave: AtomicUsize::new(0),
            total_waves: AtomicUsize::new(0),
            detail: Mutex::new(ProgressDetail::default()),
            sender,
        }
    }

    /// 订阅进度变化
    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.sender.subscribe()
    }

    /// 开始一个阶段，清零计数
    pub fn begin_stage(&self, stage: Stage, total: usize, total_waves: usize) {
        self.completed.store(0, Ordering::SeqCst);
        self.failed.store(0, Ordering::SeqCst);
        self.total.store(total, Ordering::SeqCst);
        self.wave.store(0, Ordering::SeqCst);
        self.total_waves.store(total_waves, Ordering::SeqCst);
        if let Ok(mut detail) = self.detail.lock() {
            *detail = ProgressDetail {
                stage: Some(stage),
                ..Default::default()
            };
        }
        self.publish();
    }

    /// 进入第 `wave` 个波次（从 0 开始）
    pub fn begin_wave(&self, wave: usize) {
        self.wave.store(wave + 1, Ordering::SeqCst);
        self.publish();
    }

    /// 条目结算
    pub fn on_item_settled(
        &self,
        item_label: &str,
        success: bool,
        at: DateTime<Utc>,
    ) -> ProgressSnapshot {
        if success {
            self.completed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        if let Ok(mut detail) = self.detail.lock() {
            detail.label = item_label.to_string();
            detail.last_settled_at = Some(at);
        }
        self.publish()
    }

    /// 当前进度
    pub fn snapshot(&self) -> ProgressSnapshot {
        let completed = self.completed.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let total = self.total.load(Ordering::SeqCst);
        let percent = if total == 0 {
            0.0
        } else {
            ((completed + failed) as f64 / total as f64 * 100.0).min(100.0)
        };
        let (stage, current_label, last_settled_at) = match self.detail.lock() {
            Ok(detail) => (detail.stage, detail.label.clone(), detail.last_settled_at),
            Err(_) => (None, String::new(), None),
        };
        ProgressSnapshot {
            stage,
            completed,
            failed,
            total,
            percent,
            wave: self.wave.load(Ordering::SeqCst),
            total_waves: self.total_waves.load(Ordering::SeqCst),
            current_label,
            last_settled_at,
        }
    }

    fn publish(&self) -> ProgressSnapshot {
        let snapshot = self.snapshot();
        self.sender.send_replace(snapshot.clone());
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_progress_updates_after_every_settlement() {
        let progress = ProgressAggregator::new();
        let rx = progress.subscribe();
        progress.begin_stage(Stage::Grade, 4, 2);
        progress.begin_wave(0);

        let snap = progress.on_item_settled("张三", true, Utc::now());
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.percent, 25.0);
        assert_eq!(rx.borrow().current_label, "张三");

        progress.on_item_settled("李四", false, Utc::now());
        let snap = progress.snapshot();
        assert_eq!(snap.settled(), 2);
        assert_eq!(snap.failed, 1);
        let line = snap.status_line();
        assert!(line.contains("第 1/2 批"));
        assert!(line.contains("2/4"));
        assert!(line.contains("李四"));
    }

    #[test]
    fn test_concurrent_settlements_are_not_lost() {
        let progress = Arc::new(ProgressAggregator::new());
        progress.begin_stage(Stage::Recognize, 800, 1);

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let progress = progress.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        progress.on_item_settled(&format!("{}-{}", t, i), i % 10 != 0, Utc::now());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snap = progress.snapshot();
        assert_eq!(snap.settled(), 800);
        assert_eq!(snap.failed, 80);
        assert_eq!(snap.percent, 100.0);
    }
}
