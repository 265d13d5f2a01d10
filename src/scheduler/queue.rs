// src/scheduler/queue.rs

//! Fixed worker pool draining the ready queue.
//!
//! One mutex protects the ready deque; two condition variables hang off it,
//! one for workers waiting for work and one for callers blocked in
//! [`JobQueue::wait_for`]. Completion signals both while holding the mutex,
//! so neither side can miss a wakeup. The mutex also carries the
//! happens-before edge between a job and its dependents, which is what lets
//! substreams move between workers without their own locks.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, trace};

use crate::scheduler::job::JobHandle;

pub struct JobQueue {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<QueueState>,
    work_available: Condvar,
    job_done: Condvar,
}

struct QueueState {
    ready: VecDeque<JobHandle>,
    stop: bool,
}

impl JobQueue {
    /// Spawns `threads` workers. At least one is required; a fully serial
    /// encode never constructs a queue.
    pub fn new(threads: usize) -> JobQueue {
        debug_assert!(threads > 0);
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                ready: VecDeque::new(),
                stop: false,
            }),
            work_available: Condvar::new(),
            job_done: Condvar::new(),
        });

        let workers = (0..threads)
            .map(|i| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("encoder-worker-{i}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        debug!("job queue started with {threads} workers");
        JobQueue { shared, workers }
    }

    /// Submits a job; it runs once all its dependencies have completed.
    pub fn submit(&self, job: &JobHandle) {
        if job.submit() {
            let mut state = self.shared.state.lock().unwrap();
            state.ready.push_back(job.copy_ref());
            self.shared.work_available.notify_one();
        }
    }

    /// Blocks until the given job has completed.
    pub fn wait_for(&self, job: &JobHandle) {
        let mut state = self.shared.state.lock().unwrap();
        while !job.is_done() {
            state = self.shared.job_done.wait(state).unwrap();
        }
        drop(state);
    }

    /// Signals the workers to exit once the queue drains and joins them.
    /// Submitted jobs must be waited for before stopping.
    pub fn stop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.stop = true;
            self.shared.work_available.notify_all();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        debug!("job queue stopped");
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if let Some(job) = state.ready.pop_front() {
                    break job;
                }
                if state.stop {
                    return;
                }
                state = shared.work_available.wait(state).unwrap();
            }
        };

        if let Some(func) = job.take_func() {
            trace!("job start");
            func();
            trace!("job done");
        }

        let dependents = job.complete();
        let mut newly_ready = Vec::new();
        for dep in dependents {
            if dep.predecessor_done() {
                newly_ready.push(dep);
            }
        }

        let mut state = shared.state.lock().unwrap();
        for dep in newly_ready {
            state.ready.push_back(dep);
            shared.work_available.notify_one();
        }
        shared.job_done.notify_all();
    }
}
