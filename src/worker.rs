// Copyright 2024 The vev developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fixed-size pool of worker threads fed from one shared FIFO.
//!
//! Workers take request parsing, response construction, and send attempts
//! off the reactor thread. Jobs are nullary closures; there is no stealing
//! and no priority. Shutdown drops the sender side of the queue, and each
//! worker exits once `recv` reports the channel disconnected.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker threads consuming a shared unbounded job queue.
#[derive(Debug)]
pub struct WorkerPool {
    jobs: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `size` worker threads.
    pub fn new(size: usize) -> Self {
        let (tx, rx) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{i}"))
                .spawn(move || {
                    // recv errors once every sender is gone; that is shutdown.
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                    debug!(worker = i, "worker exiting");
                })
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }
        Self {
            jobs: Some(tx),
            workers,
        }
    }

    /// Queues a job and wakes one idle worker.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(tx) = &self.jobs {
            if tx.send(Box::new(job)).is_err() {
                warn!("job dropped: all workers have exited");
            }
        }
    }

    /// Closes the queue and joins every worker after it drains.
    pub fn shutdown(&mut self) {
        self.jobs.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::WorkerPool;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread::sleep;
    use std::time::{Duration, Instant};

    #[test]
    fn jobs_run_concurrently_on_distinct_workers() {
        let pool = WorkerPool::new(2);
        let (tx, rx) = mpsc::channel();
        for _ in 0..2 {
            let tx = tx.clone();
            pool.submit(move || {
                tx.send(Instant::now()).unwrap();
                sleep(Duration::from_millis(100));
            });
        }
        let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let gap = second.saturating_duration_since(first);
        // Both must start well before either finishes its 100ms sleep.
        assert!(gap < Duration::from_millis(90), "jobs serialized: {gap:?}");
    }

    #[test]
    fn shutdown_drains_queued_jobs() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new(1);
        for _ in 0..8 {
            let ran = ran.clone();
            pool.submit(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        assert_eq!(8, ran.load(Ordering::SeqCst));
    }
}
