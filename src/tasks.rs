//! 有界后台任务池：缓存回写、预扣费返还等“发出即忘”的写操作都经由这里执行。
//!
//! 队列满或任务失败时记入死信日志，调用方永远不会被阻塞或收到错误。
//! 另有一条单 worker 的有序通道，同一通道内的任务严格按提交顺序执行。

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use futures_util::future::BoxFuture;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};

const MAX_DEAD_LETTERS: usize = 1024;

type Job = (String, BoxFuture<'static, Result<(), String>>);

/// 失败或被拒绝的后台任务。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub label: String,
    pub error: String,
    pub failed_at: i64,
}

#[derive(Clone)]
pub struct BackgroundTasks {
    inner: Arc<Inner>,
}

struct Inner {
    sender: mpsc::Sender<Job>,
    ordered: mpsc::Sender<Job>,
    pending: AtomicUsize,
    idle: Notify,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
}

impl std::fmt::Debug for BackgroundTasks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundTasks")
            .field("pending", &self.pending())
            .finish()
    }
}

impl BackgroundTasks {
    /// 启动固定数量的 worker 和一条有序通道；必须在 tokio 运行时内调用。
    pub fn start(workers: usize, queue_capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>(queue_capacity.max(1));
        let (ordered, ordered_receiver) = mpsc::channel::<Job>(queue_capacity.max(1));
        let inner = Arc::new(Inner {
            sender,
            ordered,
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
            dead_letters: Mutex::new(VecDeque::new()),
        });

        let receiver = Arc::new(AsyncMutex::new(receiver));
        for worker in 0..workers.max(1) {
            spawn_worker(worker, Arc::clone(&receiver), Arc::downgrade(&inner));
        }
        spawn_worker(
            workers.max(1),
            Arc::new(AsyncMutex::new(ordered_receiver)),
            Arc::downgrade(&inner),
        );

        Self { inner }
    }

    /// 提交任务；队列已满时不等待，直接记入死信。
    pub fn spawn<F>(&self, label: impl Into<String>, job: F)
    where
        F: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.submit(&self.inner.sender, label.into(), Box::pin(job));
    }

    /// 提交到有序通道：与之前提交到该通道的任务按先后顺序执行。
    pub fn spawn_ordered<F>(&self, label: impl Into<String>, job: F)
    where
        F: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.submit(&self.inner.ordered, label.into(), Box::pin(job));
    }

    fn submit(
        &self,
        sender: &mpsc::Sender<Job>,
        label: String,
        job: BoxFuture<'static, Result<(), String>>,
    ) {
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(err) = sender.try_send((label.clone(), job)) {
            let reason = match err {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "queue closed",
            };
            tracing::warn!(task = %label, reason, "background task rejected");
            self.inner.push_dead_letter(label, reason.to_string());
            self.inner.finish_one();
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// 等待当前已提交的任务全部完成。
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner
            .dead_letters
            .lock()
            .map(|letters| letters.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Inner {
    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn push_dead_letter(&self, label: String, error: String) {
        if let Ok(mut letters) = self.dead_letters.lock() {
            if letters.len() >= MAX_DEAD_LETTERS {
                letters.pop_front();
            }
            letters.push_back(DeadLetter {
                label,
                error,
                failed_at: Utc::now().timestamp(),
            });
        }
    }
}

fn spawn_worker(
    worker: usize,
    receiver: Arc<AsyncMutex<mpsc::Receiver<Job>>>,
    inner: std::sync::Weak<Inner>,
) {
    tokio::spawn(async move {
        loop {
            let next = receiver.lock().await.recv().await;
            let Some((label, job)) = next else {
                break;
            };
            let result = job.await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            if let Err(error) = result {
                tracing::error!(worker, task = %label, %error, "background task failed");
                inner.push_dead_letter(label, error);
            }
            inner.finish_one();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;

    #[tokio::test]
    async fn runs_jobs_and_waits_for_idle() {
        let tasks = BackgroundTasks::start(2, 16);
        let counter = Arc::new(AtomicI64::new(0));
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            tasks.spawn("increment", async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        tasks.wait_idle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert!(tasks.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn failed_jobs_land_in_dead_letters() {
        let tasks = BackgroundTasks::start(1, 4);
        tasks.spawn("cache:set", async { Err("redis down".to_string()) });
        tasks.wait_idle().await;
        let letters = tasks.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].label, "cache:set");
        assert_eq!(letters[0].error, "redis down");
    }

    #[tokio::test]
    async fn ordered_jobs_run_in_submission_order() {
        let tasks = BackgroundTasks::start(4, 64);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..20u64 {
            let seen = Arc::clone(&seen);
            tasks.spawn_ordered("ordered", async move {
                // 先提交的任务睡得更久，乱序执行会被发现。
                tokio::time::sleep(std::time::Duration::from_millis(20 - i)).await;
                seen.lock().unwrap().push(i);
                Ok(())
            });
        }
        tasks.wait_idle().await;
        assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn dead_letter_log_keeps_the_newest_entries() {
        let tasks = BackgroundTasks::start(1, 4);
        for i in 0..MAX_DEAD_LETTERS + 3 {
            tasks.inner.push_dead_letter(format!("job-{i}"), "boom".into());
        }
        let letters = tasks.dead_letters();
        assert_eq!(letters.len(), MAX_DEAD_LETTERS);
        assert_eq!(letters[0].label, "job-3");
        assert_eq!(
            letters.last().map(|letter| letter.label.clone()),
            Some(format!("job-{}", MAX_DEAD_LETTERS + 2))
        );
    }

    #[tokio::test]
    async fn full_queue_rejects_without_blocking() {
        let tasks = BackgroundTasks::start(1, 1);
        let gate = Arc::new(Notify::new());
        for _ in 0..4 {
            let gate = Arc::clone(&gate);
            tasks.spawn("slow", async move {
                gate.notified().await;
                Ok(())
            });
        }
        assert!(
            tasks
                .dead_letters()
                .iter()
                .any(|letter| letter.error == "queue full")
        );
        gate.notify_waiters();
        // 被接收的任务可能还在等待，多次唤醒直到队列清空。
        while tasks.pending() > 0 {
            gate.notify_waiters();
            tokio::task::yield_now().await;
        }
        tasks.wait_idle().await;
    }
}
