use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::info;

/// 全局关闭信号
///
/// 克隆后共享同一个信号；触发是单向的。
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// 等待信号触发 (已触发则立即返回)
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// 定时任务管理器
pub struct Scheduler {
    tasks: Mutex<HashMap<u64, AbortHandle>>,
    next_id: AtomicU64,
    shutdown: Shutdown,
}

impl Scheduler {
    pub fn new(shutdown: Shutdown) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown,
        }
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, HashMap<u64, AbortHandle>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 添加一个灵活调度任务
    ///
    /// `next_run` 接收当前时间，返回下一次执行时间；返回 None 时任务结束。
    /// 收到关闭信号后，正在等待的任务立即退出。
    pub fn add_schedule<C, F, Fut>(&self, mut next_run: C, mut task_gen: F) -> u64
    where
        C: FnMut(DateTime<Local>) -> Option<DateTime<Local>> + Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let shutdown = self.shutdown.clone();

        let mut next_time = next_run(Local::now());

        let handle = tokio::spawn(async move {
            while let Some(target_time) = next_time {
                let wait = (target_time - Local::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.wait() => break,
                }

                task_gen().await;

                next_time = next_run(Local::now());
            }
        });

        self.tasks().insert(id, handle.abort_handle());
        id
    }

    /// 固定间隔执行
    pub fn add_interval<F, Fut>(&self, every: Duration, task_gen: F) -> u64
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let step = chrono::Duration::from_std(every).ok();
        self.add_schedule(move |now| step.map(|s| now + s), task_gen)
    }

    pub fn remove(&self, id: u64) {
        if let Some(handle) = self.tasks().remove(&id) {
            handle.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks().is_empty()
    }

    /// 触发关闭信号并中止全部任务
    pub fn shutdown(&self) {
        info!(target: "Scheduler", "正在清理定时任务...");
        self.shutdown.trigger();
        for (_, handle) in self.tasks().drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn shutdown_wakes_waiters() {
        let shutdown = Shutdown::new();
        let waiter = {
            let s = shutdown.clone();
            tokio::spawn(async move { s.wait().await })
        };
        assert!(!shutdown.is_triggered());

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(shutdown.is_triggered());

        // 已触发后再等待立即返回
        shutdown.wait().await;
    }

    #[tokio::test]
    async fn interval_runs_until_shutdown() {
        let shutdown = Shutdown::new();
        let scheduler = Scheduler::new(shutdown.clone());
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        scheduler.add_interval(Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(scheduler.len(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        scheduler.shutdown();
        assert!(scheduler.is_empty());
        assert!(shutdown.is_triggered());

        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 1);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(runs.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn removed_task_stops() {
        let scheduler = Scheduler::new(Shutdown::new());
        let id = scheduler.add_interval(Duration::from_secs(3600), || async {});
        scheduler.remove(id);
        assert!(scheduler.is_empty());
    }
}
