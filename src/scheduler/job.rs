// src/scheduler/job.rs

//! Dependency-counted jobs for the encoding graph.
//!
//! A job holds its work closure, the number of unfinished predecessors, and
//! the list of dependents to signal on completion. Readiness is push-driven:
//! the last predecessor to finish moves a waiting job to the ready queue, so
//! the queue never scans the graph. Handles are `Arc`s; a job is freed when
//! the last handle (including the ones held by predecessors) drops.

use std::sync::{Arc, Mutex};

pub type JobFn = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Created; dependencies may still be added.
    Paused,
    /// Submitted, predecessors outstanding.
    Waiting,
    /// In the ready queue.
    Ready,
    /// Claimed by a worker.
    Running,
    Done,
}

pub type JobHandle = Arc<Job>;

pub struct Job {
    inner: Mutex<JobInner>,
}

struct JobInner {
    state: JobState,
    func: Option<JobFn>,
    pending: usize,
    dependents: Vec<JobHandle>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("Job")
            .field("state", &inner.state)
            .field("pending", &inner.pending)
            .field("dependents", &inner.dependents.len())
            .finish()
    }
}

impl Job {
    pub fn create(f: impl FnOnce() + Send + 'static) -> JobHandle {
        Arc::new(Job {
            inner: Mutex::new(JobInner {
                state: JobState::Paused,
                func: Some(Box::new(f)),
                pending: 0,
                dependents: Vec::new(),
            }),
        })
    }

    /// Another handle to the same job, for keeping a proxy to it alive.
    pub fn copy_ref(self: &Arc<Self>) -> JobHandle {
        Arc::clone(self)
    }

    pub fn state(&self) -> JobState {
        self.inner.lock().unwrap().state
    }

    pub fn is_done(&self) -> bool {
        self.state() == JobState::Done
    }

    /// Claims the job for execution and takes its closure.
    pub(crate) fn take_func(&self) -> Option<JobFn> {
        let mut inner = self.inner.lock().unwrap();
        debug_assert_eq!(inner.state, JobState::Ready);
        inner.state = JobState::Running;
        inner.func.take()
    }

    /// Marks the job done and hands back the dependents to signal.
    pub(crate) fn complete(&self) -> Vec<JobHandle> {
        let mut inner = self.inner.lock().unwrap();
        debug_assert_eq!(inner.state, JobState::Running);
        inner.state = JobState::Done;
        std::mem::take(&mut inner.dependents)
    }

    /// Signals one finished predecessor. Returns true when the job just
    /// became ready to run.
    pub(crate) fn predecessor_done(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.pending > 0);
        inner.pending -= 1;
        if inner.pending == 0 && inner.state == JobState::Waiting {
            inner.state = JobState::Ready;
            true
        } else {
            false
        }
    }

    /// Transitions a submitted job out of `Paused`. Returns true when it is
    /// immediately ready.
    pub(crate) fn submit(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        debug_assert_eq!(inner.state, JobState::Paused);
        if inner.pending == 0 {
            inner.state = JobState::Ready;
            true
        } else {
            inner.state = JobState::Waiting;
            false
        }
    }
}

/// Makes `job` wait for `pred`. A dependency on an already finished job is a
/// no-op, so cross-frame edges can point at jobs from any earlier frame.
///
/// Predecessor and dependent are locked in that order everywhere, which keeps
/// this safe against completion running concurrently.
pub fn add_dependency(job: &JobHandle, pred: &JobHandle) {
    debug_assert!(!Arc::ptr_eq(job, pred), "job cannot depend on itself");

    let mut p = pred.inner.lock().unwrap();
    if p.state == JobState::Done {
        return;
    }
    {
        let mut j = job.inner.lock().unwrap();
        debug_assert!(matches!(j.state, JobState::Paused | JobState::Waiting));
        j.pending += 1;
    }
    p.dependents.push(Arc::clone(job));
}
