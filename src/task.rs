use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, warn};

use crate::refresh::Field;

pub const DEFAULT_WORKERS: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub enum AsyncResult<T> {
    Success(T),
    Cancelled,
    Failed(String),
}

impl<T> AsyncResult<T> {
    pub fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(value) => AsyncResult::Success(value),
            Err(err) => AsyncResult::Failed(format!("{err:#}")),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AsyncResult::Success(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AsyncResult::Cancelled)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, AsyncResult::Failed(_))
    }

    pub fn success(self) -> Option<T> {
        match self {
            AsyncResult::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_ref(&self) -> AsyncResult<&T> {
        match self {
            AsyncResult::Success(value) => AsyncResult::Success(value),
            AsyncResult::Cancelled => AsyncResult::Cancelled,
            AsyncResult::Failed(reason) => AsyncResult::Failed(reason.clone()),
        }
    }

    pub fn map<U, F>(self, f: F) -> AsyncResult<U>
    where
        F: FnOnce(T) -> U,
    {
        match self {
            AsyncResult::Success(value) => AsyncResult::Success(f(value)),
            AsyncResult::Cancelled => AsyncResult::Cancelled,
            AsyncResult::Failed(reason) => AsyncResult::Failed(reason),
        }
    }

    pub fn outcome(&self) -> AsyncResult<()> {
        self.as_ref().map(|_| ())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn guard<T>(&self, result: AsyncResult<T>) -> AsyncResult<T> {
        if self.is_cancelled() {
            AsyncResult::Cancelled
        } else {
            result
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    LoadMore,
    Avatar,
    BlogTitle,
    Refresh(Field),
    Follow,
    Unfollow,
    Like,
    Unlike,
    Reblog,
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::LoadMore => "load-more",
            TaskKind::Avatar => "avatar",
            TaskKind::BlogTitle => "blog-title",
            TaskKind::Refresh(field) => field.name(),
            TaskKind::Follow => "follow",
            TaskKind::Unfollow => "unfollow",
            TaskKind::Like => "like",
            TaskKind::Unlike => "unlike",
            TaskKind::Reblog => "reblog",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Task {
    kind: TaskKind,
    job: Job,
}

#[derive(Clone)]
pub struct Spawner {
    jobs: Sender<Task>,
}

impl Spawner {
    // Queues `job`. Returns false when the pool has already shut down.
    pub fn spawn<F>(&self, kind: TaskKind, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let task = Task {
            kind,
            job: Box::new(job),
        };
        match self.jobs.send(task) {
            Ok(()) => true,
            Err(_) => {
                warn!("task: pool closed, dropping {kind} task");
                false
            }
        }
    }
}

pub struct TaskPool {
    spawner: Spawner,
    stop: Sender<()>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl TaskPool {
    pub fn new(workers: usize) -> Result<Self> {
        let workers = if workers == 0 {
            DEFAULT_WORKERS
        } else {
            workers
        };

        let (job_tx, job_rx) = unbounded::<Task>();
        let (stop_tx, stop_rx) = unbounded::<()>();

        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let rx_jobs = job_rx.clone();
            let rx_stop = stop_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("blogview-task-{index}"))
                .spawn(move || worker(rx_jobs, rx_stop))
                .context("task: spawn worker")?;
            handles.push(handle);
        }

        Ok(Self {
            spawner: Spawner { jobs: job_tx },
            stop: stop_tx,
            handles,
        })
    }

    pub fn spawner(&self) -> Spawner {
        self.spawner.clone()
    }

    pub fn spawn<F>(&self, kind: TaskKind, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawner.spawn(kind, job)
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    fn shutdown(&mut self) {
        for _ in &self.handles {
            let _ = self.stop.send(());
        }
        let current = thread::current().id();
        while let Some(handle) = self.handles.pop() {
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker(jobs: Receiver<Task>, stop: Receiver<()>) {
    loop {
        crossbeam_channel::select! {
            recv(stop) -> _ => break,
            recv(jobs) -> msg => {
                match msg {
                    Ok(task) => run(task),
                    Err(_) => break,
                }
            }
        }
    }
}

fn run(task: Task) {
    let kind = task.kind;
    debug!("task: running {kind}");
    if panic::catch_unwind(AssertUnwindSafe(task.job)).is_err() {
        warn!("task: {kind} task panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pool_runs_queued_jobs() {
        let pool = TaskPool::new(2).unwrap();
        let (tx, rx) = unbounded();
        for n in 0..5 {
            let tx = tx.clone();
            assert!(pool.spawn(TaskKind::Avatar, move || {
                let _ = tx.send(n);
            }));
        }
        let mut seen: Vec<i32> = (0..5)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn panicking_job_does_not_take_down_worker() {
        let pool = TaskPool::new(1).unwrap();
        pool.spawn(TaskKind::Reblog, || panic!("boom"));
        let (tx, rx) = unbounded();
        pool.spawn(TaskKind::Reblog, move || {
            let _ = tx.send(());
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn zero_workers_falls_back_to_default() {
        let pool = TaskPool::new(0).unwrap();
        assert_eq!(pool.workers(), DEFAULT_WORKERS);
    }

    #[test]
    fn spawner_reports_closed_pool() {
        let pool = TaskPool::new(1).unwrap();
        let spawner = pool.spawner();
        drop(pool);
        assert!(!spawner.spawn(TaskKind::LoadMore, || {}));
    }

    #[test]
    fn token_guard_overrides_result() {
        let token = CancelToken::new();
        assert_eq!(token.guard(AsyncResult::Success(1)), AsyncResult::Success(1));
        token.cancel();
        assert_eq!(token.guard(AsyncResult::Success(1)), AsyncResult::Cancelled);
    }

    #[test]
    fn from_result_keeps_error_chain() {
        let err: Result<()> = Err(anyhow::anyhow!("inner")).context("outer");
        match AsyncResult::from_result(err) {
            AsyncResult::Failed(reason) => assert_eq!(reason, "outer: inner"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
