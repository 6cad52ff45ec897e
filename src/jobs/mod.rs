//! Bounded-concurrency scheduler for cancellable, persisted background jobs.

pub mod model;
pub mod store;

use std::any::Any;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::ops::Bound;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::events::{EventBus, LifecycleEvent};

pub use model::{Job, JobId, JobStatus, INTERRUPTED_MESSAGE};
pub use store::{FileJobStore, JobStore, MemoryJobStore};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {id} is already {status}")]
    InvalidState { id: JobId, status: JobStatus },
    #[error("job store failure: {0:#}")]
    Store(anyhow::Error),
    #[error("job manager is shutting down")]
    ShuttingDown,
}

/// Returned by [`JobContext::checkpoint`] once the job has been cancelled.
#[derive(Debug, Error)]
#[error("job cancelled")]
pub struct JobCancelled;

pub type JobWork = Box<dyn FnOnce(JobContext) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Handed to every job's work.
#[derive(Clone)]
pub struct JobContext {
    id: JobId,
    instance: String,
    token: CancellationToken,
    manager: Weak<Inner>,
}

impl JobContext {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Percent complete, clamped to 100. Visible immediately; persisted with
    /// the next status transition.
    pub fn report_progress(&self, percent: u8) {
        if let Some(inner) = self.manager.upgrade() {
            if let Some(mut job) = inner.jobs.get_mut(&self.id) {
                if !job.status.is_terminal() {
                    job.progress_percent = Some(percent.min(100));
                }
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// `Err` once cancellation has been requested; use with `?` at safe points.
    pub fn checkpoint(&self) -> Result<(), JobCancelled> {
        if self.token.is_cancelled() {
            Err(JobCancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

struct Pending {
    work: JobWork,
    token: CancellationToken,
}

enum Next {
    Run(Job, Pending),
    /// The `Running` transition could not be persisted; the job was failed
    /// instead of started.
    Rejected(Job),
}

#[derive(Default)]
struct Scheduler {
    /// Per-instance FIFO queues.
    queues: BTreeMap<String, VecDeque<JobId>>,
    pending: HashMap<JobId, Pending>,
    running: HashMap<JobId, CancellationToken>,
    /// Instance served last, for round-robin between queues.
    last_instance: Option<String>,
    closed: bool,
}

struct Inner {
    store: Arc<dyn JobStore>,
    jobs: DashMap<JobId, Job>,
    sched: Mutex<Scheduler>,
    next_id: AtomicU64,
    slots: Arc<Semaphore>,
    wake: Notify,
    events: EventBus,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl JobManager {
    /// Load persisted jobs, fail any that were left unfinished by a previous
    /// run, and start dispatching. Must be called within a tokio runtime.
    pub fn open(
        store: Arc<dyn JobStore>,
        concurrency: usize,
        events: EventBus,
    ) -> Result<Self, JobError> {
        for mut job in store.load_pending_jobs().map_err(JobError::Store)? {
            warn!(
                job = job.id,
                instance = %job.instance_id,
                status = %job.status,
                "job was interrupted by a restart"
            );
            job.finish(JobStatus::Failed, Some(INTERRUPTED_MESSAGE.to_string()));
            store.save_job_status(&job).map_err(JobError::Store)?;
        }

        let jobs = DashMap::new();
        let mut max_id = 0;
        for job in store.load_jobs().map_err(JobError::Store)? {
            max_id = max_id.max(job.id);
            jobs.insert(job.id, job);
        }

        let concurrency = concurrency.max(1);
        let inner = Arc::new(Inner {
            store,
            jobs,
            sched: Mutex::new(Scheduler::default()),
            next_id: AtomicU64::new(max_id + 1),
            slots: Arc::new(Semaphore::new(concurrency)),
            wake: Notify::new(),
            events,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        });
        inner.tracker.spawn(dispatch(inner.clone()));
        debug!(concurrency, next_id = max_id + 1, "job manager started");
        Ok(Self { inner })
    }

    /// Enqueue `work` for `instance`. Returns as soon as the job is persisted.
    pub fn submit<F, Fut>(&self, instance: &str, kind: &str, work: F) -> Result<JobId, JobError>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.submit_boxed(instance, kind, Box::new(move |ctx| work(ctx).boxed()))
    }

    pub fn submit_boxed(&self, instance: &str, kind: &str, work: JobWork) -> Result<JobId, JobError> {
        let inner = &self.inner;
        let job = {
            let mut sched = inner.sched();
            if sched.closed {
                return Err(JobError::ShuttingDown);
            }
            let id = inner.next_id.fetch_add(1, Ordering::SeqCst);
            let job = Job::queued(id, instance, kind);
            inner.store.save_job_status(&job).map_err(JobError::Store)?;
            inner.jobs.insert(id, job.clone());
            sched
                .queues
                .entry(instance.to_string())
                .or_default()
                .push_back(id);
            sched.pending.insert(
                id,
                Pending {
                    work,
                    token: inner.shutdown.child_token(),
                },
            );
            job
        };
        info!(job = job.id, instance, kind, "job queued");
        let id = job.id;
        inner.events.emit(LifecycleEvent::JobStatusChanged(job));
        inner.wake.notify_one();
        Ok(id)
    }

    pub fn get(&self, id: JobId) -> Result<Job, JobError> {
        self.inner
            .jobs
            .get(&id)
            .map(|j| j.clone())
            .ok_or(JobError::NotFound(id))
    }

    /// Jobs ordered by id, optionally limited to one instance.
    pub fn list(&self, instance: Option<&str>) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .inner
            .jobs
            .iter()
            .filter(|j| instance.map_or(true, |i| j.instance_id == i))
            .map(|j| j.clone())
            .collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    /// Queued jobs are cancelled outright; running jobs are asked to stop
    /// and move to `Cancelling`. Returns the resulting status.
    pub fn cancel(&self, id: JobId) -> Result<JobStatus, JobError> {
        let inner = &self.inner;
        let changed = {
            let mut sched = inner.sched();
            let mut job = inner
                .jobs
                .get(&id)
                .map(|j| j.clone())
                .ok_or(JobError::NotFound(id))?;
            match job.status {
                JobStatus::Queued => {
                    job.finish(JobStatus::Cancelled, None);
                    inner.store.save_job_status(&job).map_err(JobError::Store)?;
                    if let Some(queue) = sched.queues.get_mut(&job.instance_id) {
                        queue.retain(|queued| *queued != id);
                        if queue.is_empty() {
                            sched.queues.remove(&job.instance_id);
                        }
                    }
                    sched.pending.remove(&id);
                    inner.jobs.insert(id, job.clone());
                    job
                }
                JobStatus::Running => {
                    job.status = JobStatus::Cancelling;
                    inner.store.save_job_status(&job).map_err(JobError::Store)?;
                    if let Some(token) = sched.running.get(&id) {
                        token.cancel();
                    }
                    inner.jobs.insert(id, job.clone());
                    job
                }
                JobStatus::Cancelling => return Ok(JobStatus::Cancelling),
                status => return Err(JobError::InvalidState { id, status }),
            }
        };
        info!(job = id, status = %changed.status, "job cancellation requested");
        let status = changed.status;
        inner.events.emit(LifecycleEvent::JobStatusChanged(changed));
        Ok(status)
    }

    /// Cancel every unfinished job of one instance.
    pub fn cancel_instance(&self, instance: &str) -> Vec<JobId> {
        let ids: Vec<JobId> = self
            .list(Some(instance))
            .into_iter()
            .filter(|j| !j.status.is_terminal())
            .map(|j| j.id)
            .collect();
        ids.into_iter()
            .filter(|id| match self.cancel(*id) {
                Ok(_) => true,
                Err(e) => {
                    debug!(job = id, error = %e, "skipping job during instance cancellation");
                    false
                }
            })
            .collect()
    }

    /// Forget finished jobs that ended before `cutoff`. Returns how many were removed.
    pub fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, JobError> {
        let expired: Vec<JobId> = self
            .inner
            .jobs
            .iter()
            .filter(|j| j.status.is_terminal() && j.ended_at.is_some_and(|end| end < cutoff))
            .map(|j| j.id)
            .collect();
        for id in &expired {
            self.inner.store.remove_job(*id).map_err(JobError::Store)?;
            self.inner.jobs.remove(id);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "pruned finished jobs");
        }
        Ok(expired.len())
    }

    /// Stop accepting work, cancel everything in flight and wait up to
    /// `timeout` for workers to return. Unfinished records are failed as
    /// interrupted on the next start.
    pub async fn shutdown(&self, timeout: Duration) {
        self.inner.sched().closed = true;
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        if tokio::time::timeout(timeout, self.inner.tracker.wait())
            .await
            .is_err()
        {
            warn!("jobs still running at shutdown");
        }
    }
}

impl Inner {
    fn sched(&self) -> MutexGuard<'_, Scheduler> {
        self.sched.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pick the next queued job round-robin across instances and mark it running.
    fn take_next(&self) -> Option<Next> {
        let mut sched = self.sched();
        if sched.closed {
            return None;
        }
        let instance = match &sched.last_instance {
            Some(last) => sched
                .queues
                .range::<String, _>((Bound::Excluded(last), Bound::Unbounded))
                .next()
                .map(|(k, _)| k.clone()),
            None => None,
        }
        .or_else(|| sched.queues.keys().next().cloned())?;

        let queue = sched.queues.get_mut(&instance)?;
        let id = queue.pop_front()?;
        if queue.is_empty() {
            sched.queues.remove(&instance);
        }
        sched.last_instance = Some(instance);
        let pending = sched.pending.remove(&id)?;

        let mut job = self.jobs.get(&id).map(|j| j.clone())?;
        job.status = JobStatus::Running;
        if let Err(e) = self.store.save_job_status(&job) {
            error!(job = id, error = %e, "failed to persist job start");
            job.finish(
                JobStatus::Failed,
                Some(format!("failed to persist job start: {:#}", e)),
            );
            if let Err(e) = self.store.save_job_status(&job) {
                error!(job = id, error = %e, "failed to persist job result");
            }
            self.jobs.insert(id, job.clone());
            return Some(Next::Rejected(job));
        }
        self.jobs.insert(id, job.clone());
        sched.running.insert(id, pending.token.clone());
        Some(Next::Run(job, pending))
    }

    fn complete(
        &self,
        id: JobId,
        token: &CancellationToken,
        outcome: Result<anyhow::Result<()>, Box<dyn Any + Send>>,
    ) {
        let (status, error) = match outcome {
            Ok(Ok(())) => (JobStatus::Succeeded, None),
            Ok(Err(_)) if token.is_cancelled() => (JobStatus::Cancelled, None),
            Ok(Err(e)) => (JobStatus::Failed, Some(format!("{:#}", e))),
            Err(panic) => (
                JobStatus::Failed,
                Some(format!("job panicked: {}", panic_message(&*panic))),
            ),
        };

        let finished = {
            let mut sched = self.sched();
            sched.running.remove(&id);
            let Some(mut job) = self.jobs.get(&id).map(|j| j.clone()) else {
                return;
            };
            job.finish(status, error);
            if let Err(e) = self.store.save_job_status(&job) {
                error!(job = id, error = %e, "failed to persist job result");
            }
            self.jobs.insert(id, job.clone());
            job
        };

        match finished.status {
            JobStatus::Failed => warn!(
                job = id,
                instance = %finished.instance_id,
                error = finished.error_message.as_deref().unwrap_or(""),
                "job failed"
            ),
            status => info!(job = id, instance = %finished.instance_id, %status, "job finished"),
        }
        self.events.emit(LifecycleEvent::JobStatusChanged(finished));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn dispatch(inner: Arc<Inner>) {
    loop {
        let permit: OwnedSemaphorePermit = tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            permit = inner.slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        let (job, pending) = loop {
            match inner.take_next() {
                Some(Next::Run(job, pending)) => break (job, pending),
                Some(Next::Rejected(job)) => {
                    inner.events.emit(LifecycleEvent::JobStatusChanged(job));
                    continue;
                }
                None => {}
            }
            tokio::select! {
                _ = inner.shutdown.cancelled() => return,
                _ = inner.wake.notified() => {}
            }
        };

        inner.events.emit(LifecycleEvent::JobStatusChanged(job.clone()));
        info!(job = job.id, instance = %job.instance_id, kind = %job.kind, "job started");

        let worker = inner.clone();
        inner.tracker.spawn(async move {
            let _permit = permit;
            let Pending { work, token } = pending;
            let ctx = JobContext {
                id: job.id,
                instance: job.instance_id.clone(),
                token: token.clone(),
                manager: Arc::downgrade(&worker),
            };
            let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| work(ctx))) {
                Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                Err(panic) => Err(panic),
            };
            worker.complete(job.id, &token, outcome);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    fn manager(concurrency: usize) -> (JobManager, Arc<MemoryJobStore>) {
        let store = Arc::new(MemoryJobStore::default());
        let jobs = JobManager::open(store.clone(), concurrency, EventBus::default()).unwrap();
        (jobs, store)
    }

    async fn wait_for(jobs: &JobManager, id: JobId, status: JobStatus) -> Job {
        for _ in 0..250 {
            let job = jobs.get(id).unwrap();
            if job.status == status {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {} never reached {:?}: {:?}", id, status, jobs.get(id));
    }

    #[tokio::test]
    async fn successful_job_is_persisted() {
        let (jobs, store) = manager(2);
        let id = jobs
            .submit("main", "compile", |ctx| async move {
                ctx.report_progress(50);
                Ok(())
            })
            .unwrap();
        let job = wait_for(&jobs, id, JobStatus::Succeeded).await;
        assert_eq!(job.progress_percent, Some(100));
        assert!(job.ended_at.is_some());
        assert_eq!(store.get(id).unwrap().status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn failure_and_panic_are_captured() {
        let (jobs, _) = manager(2);
        let failing = jobs
            .submit("main", "compile", |_| async { anyhow::bail!("compiler exploded") })
            .unwrap();
        let panicking = jobs
            .submit("main", "compile", |_| async { panic!("bad job") })
            .unwrap();

        let job = wait_for(&jobs, failing, JobStatus::Failed).await;
        assert_eq!(job.error_message.as_deref(), Some("compiler exploded"));
        let job = wait_for(&jobs, panicking, JobStatus::Failed).await;
        assert!(job.error_message.unwrap().contains("bad job"));

        // The pool survives.
        let ok = jobs.submit("main", "compile", |_| async { Ok(()) }).unwrap();
        wait_for(&jobs, ok, JobStatus::Succeeded).await;
    }

    #[tokio::test]
    async fn cancelling_queued_job_never_runs_it() {
        let (jobs, _) = manager(1);
        let (release, gate) = oneshot::channel::<()>();
        let blocker = jobs
            .submit("main", "compile", |_| async move {
                let _ = gate.await;
                Ok(())
            })
            .unwrap();
        wait_for(&jobs, blocker, JobStatus::Running).await;

        let ran = Arc::new(AtomicUsize::new(0));
        let flag = ran.clone();
        let queued = jobs
            .submit("main", "deploy", move |_| async move {
                flag.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert_eq!(jobs.cancel(queued).unwrap(), JobStatus::Cancelled);

        release.send(()).unwrap();
        wait_for(&jobs, blocker, JobStatus::Succeeded).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(jobs.get(queued).unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancelling_running_job_is_cooperative() {
        let (jobs, _) = manager(1);
        let id = jobs
            .submit("main", "compile", |ctx| async move {
                ctx.cancelled().await;
                ctx.checkpoint()?;
                Ok(())
            })
            .unwrap();
        wait_for(&jobs, id, JobStatus::Running).await;

        assert_eq!(jobs.cancel(id).unwrap(), JobStatus::Cancelling);
        let job = wait_for(&jobs, id, JobStatus::Cancelled).await;
        assert!(job.error_message.is_none());

        let err = jobs.cancel(id).unwrap_err();
        assert!(matches!(
            err,
            JobError::InvalidState {
                status: JobStatus::Cancelled,
                ..
            }
        ));
        assert!(matches!(jobs.cancel(9999), Err(JobError::NotFound(9999))));
        assert!(matches!(jobs.get(9999), Err(JobError::NotFound(9999))));
    }

    #[tokio::test]
    async fn concurrency_ceiling_is_respected() {
        let (jobs, _) = manager(3);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut ids = Vec::new();
        for i in 0..10 {
            let current = current.clone();
            let peak = peak.clone();
            let instance = format!("inst{}", i % 4);
            ids.push(
                jobs.submit(&instance, "compile", move |_| async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap(),
            );
        }
        for id in ids {
            wait_for(&jobs, id, JobStatus::Succeeded).await;
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn queues_are_fifo_per_instance_and_round_robin_across() {
        let (jobs, _) = manager(1);
        let (release, gate) = oneshot::channel::<()>();
        let blocker = jobs
            .submit("a", "block", |_| async move {
                let _ = gate.await;
                Ok(())
            })
            .unwrap();
        wait_for(&jobs, blocker, JobStatus::Running).await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut last = 0;
        for (instance, label) in [("a", "a1"), ("a", "a2"), ("b", "b1")] {
            let order = order.clone();
            last = jobs
                .submit(instance, "step", move |_| async move {
                    order.lock().unwrap().push(label);
                    Ok(())
                })
                .unwrap();
        }
        release.send(()).unwrap();
        wait_for(&jobs, last, JobStatus::Succeeded).await;
        for job in jobs.list(None) {
            wait_for(&jobs, job.id, JobStatus::Succeeded).await;
        }
        assert_eq!(*order.lock().unwrap(), vec!["b1", "a1", "a2"]);
    }

    #[tokio::test]
    async fn restart_fails_unfinished_jobs_and_continues_ids() {
        let mut running = Job::queued(4, "main", "compile");
        running.status = JobStatus::Running;
        let queued = Job::queued(5, "main", "deploy");
        let mut done = Job::queued(3, "main", "compile");
        done.finish(JobStatus::Succeeded, None);
        let store = Arc::new(MemoryJobStore::with_jobs([running, queued, done]));

        let jobs = JobManager::open(store.clone(), 1, EventBus::default()).unwrap();
        for id in [4, 5] {
            let job = jobs.get(id).unwrap();
            assert_eq!(job.status, JobStatus::Failed);
            assert_eq!(job.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));
            assert_eq!(store.get(id).unwrap().status, JobStatus::Failed);
        }
        assert_eq!(jobs.get(3).unwrap().status, JobStatus::Succeeded);

        let id = jobs.submit("main", "compile", |_| async { Ok(()) }).unwrap();
        assert_eq!(id, 6);
    }

    #[tokio::test]
    async fn prune_removes_old_finished_jobs() {
        let (jobs, store) = manager(1);
        let id = jobs.submit("main", "compile", |_| async { Ok(()) }).unwrap();
        wait_for(&jobs, id, JobStatus::Succeeded).await;

        assert_eq!(jobs.prune(Utc::now() - chrono::Duration::hours(1)).unwrap(), 0);
        assert_eq!(jobs.prune(Utc::now() + chrono::Duration::seconds(1)).unwrap(), 1);
        assert!(matches!(jobs.get(id), Err(JobError::NotFound(_))));
        assert!(store.get(id).is_none());
    }

    #[tokio::test]
    async fn cancel_instance_only_touches_that_instance() {
        let (jobs, _) = manager(1);
        let (release, gate) = oneshot::channel::<()>();
        let blocker = jobs
            .submit("other", "block", |_| async move {
                let _ = gate.await;
                Ok(())
            })
            .unwrap();
        wait_for(&jobs, blocker, JobStatus::Running).await;
        let a = jobs.submit("main", "compile", |_| async { Ok(()) }).unwrap();
        let b = jobs.submit("main", "deploy", |_| async { Ok(()) }).unwrap();

        let mut cancelled = jobs.cancel_instance("main");
        cancelled.sort();
        assert_eq!(cancelled, vec![a, b]);
        assert_eq!(jobs.get(blocker).unwrap().status, JobStatus::Running);
        release.send(()).unwrap();
        wait_for(&jobs, blocker, JobStatus::Succeeded).await;
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work() {
        let (jobs, _) = manager(1);
        jobs.shutdown(Duration::from_secs(1)).await;
        let err = jobs.submit("main", "compile", |_| async { Ok(()) }).unwrap_err();
        assert!(matches!(err, JobError::ShuttingDown));
    }

    /// Refuses to record jobs as running.
    #[derive(Default)]
    struct NoStartStore(MemoryJobStore);

    impl JobStore for NoStartStore {
        fn save_job_status(&self, job: &Job) -> anyhow::Result<()> {
            if job.status == JobStatus::Running {
                anyhow::bail!("disk full");
            }
            self.0.save_job_status(job)
        }

        fn load_jobs(&self) -> anyhow::Result<Vec<Job>> {
            self.0.load_jobs()
        }

        fn remove_job(&self, id: JobId) -> anyhow::Result<()> {
            self.0.remove_job(id)
        }
    }

    #[tokio::test]
    async fn job_whose_start_cannot_be_saved_never_runs() {
        let store = Arc::new(NoStartStore::default());
        let jobs = JobManager::open(store.clone(), 1, EventBus::default()).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let mut ids = Vec::new();
        for _ in 0..2 {
            let ran = ran.clone();
            ids.push(
                jobs.submit("main", "compile", move |_| async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap(),
            );
        }

        for id in ids {
            let job = wait_for(&jobs, id, JobStatus::Failed).await;
            assert!(job.error_message.unwrap().contains("disk full"));
            assert_eq!(store.0.get(id).unwrap().status, JobStatus::Failed);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}

