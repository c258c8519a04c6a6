//! Fixed worker pool driving the threaded execution modes.
//!
//! Each worker owns a FIFO job channel; submission returns a
//! [`TaskHandle`] whose `wait` is the fan-in barrier. There is no work
//! stealing and no dynamic balancing: load balance comes from the
//! scheduler slicing patterns (or partitions) evenly. Workers exit when
//! their channel closes; the pool joins them on drop.

use crate::error::{EngineError, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug)]
struct Worker {
    jobs: Option<Sender<Job>>,
    thread: Option<JoinHandle<()>>,
}

#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<Worker>,
}

/// Completion handle for one submitted job.
pub struct TaskHandle {
    done: Receiver<()>,
}

impl TaskHandle {
    /// Block until the job has run. Returns even if the worker went away.
    pub fn wait(self) {
        let _ = self.done.recv();
    }
}

impl WorkerPool {
    pub fn new(worker_count: usize) -> Result<Self> {
        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let (tx, rx): (Sender<Job>, Receiver<Job>) = unbounded();
            let thread = std::thread::Builder::new()
                .name(format!("phylo-worker-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .map_err(|_| EngineError::General("failed to spawn worker thread"))?;
            workers.push(Worker {
                jobs: Some(tx),
                thread: Some(thread),
            });
        }
        log::debug!("worker pool started with {worker_count} threads");
        Ok(WorkerPool { workers })
    }

    #[inline]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Enqueue a job on worker `worker`'s FIFO.
    pub fn submit<F>(&self, worker: usize, job: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let (tx, done) = bounded(1);
        let wrapped: Job = Box::new(move || {
            job();
            let _ = tx.send(());
        });
        // A send can only fail after teardown has closed the channel;
        // wait() then returns immediately.
        let _ = self.workers[worker]
            .jobs
            .as_ref()
            .expect("worker pool used after teardown")
            .send(wrapped);
        TaskHandle { done }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for worker in &mut self.workers {
            worker.jobs.take(); // close the channel, worker loop exits
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
    }
}
