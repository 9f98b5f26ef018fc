//! Fixed worker pool and task queue.
//!
//! Every rank runs `P` worker threads pulling from one FIFO task queue
//! of unlimited depth. Tasks are plain closures returning an `i32`
//! status (0 = ok); [`ThreadPool::add_task`] hands back a
//! [`TaskHandle`] that resolves when the closure returns. Tasks are free
//! to enqueue further tasks or send messages.

use std::thread::JoinHandle;

use flume::{Receiver, Sender};

type TaskFn = Box<dyn FnOnce() -> i32 + Send + 'static>;

struct Job {
    run: TaskFn,
    done: Sender<i32>,
}

/// Future for a submitted task, resolved with the task's return status.
pub struct TaskHandle {
    rx: Receiver<i32>,
}

impl TaskHandle {
    /// Block until the task completes and return its status.
    #[must_use]
    pub fn wait(self) -> i32 {
        self.rx.recv().unwrap_or(-1)
    }

    /// Non-blocking poll; `None` while the task is still running.
    #[must_use]
    pub fn try_wait(&self) -> Option<i32> {
        self.rx.try_recv().ok()
    }
}

/// Fixed-size worker pool, one per rank.
pub struct ThreadPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawn `threads` workers named `name-N`.
    #[must_use]
    pub fn new(threads: usize, name: &str) -> Self {
        let (tx, rx) = flume::unbounded::<Job>();
        let workers = (0..threads.max(1))
            .map(|i| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            let status = (job.run)();
                            // Receiver may be gone; nobody waiting is fine
                            let _ = job.done.send(status);
                        }
                    })
                    .expect("spawn pool worker")
            })
            .collect();
        Self {
            tx: Some(tx),
            workers,
        }
    }

    /// Queue a task. FIFO; runs on the first free worker.
    pub fn add_task<F>(&self, task: F) -> TaskHandle
    where
        F: FnOnce() -> i32 + Send + 'static,
    {
        let (done, rx) = flume::bounded(1);
        let job = Job {
            run: Box::new(task),
            done,
        };
        self.tx
            .as_ref()
            .expect("pool running")
            .send(job)
            .expect("pool queue open");
        TaskHandle { rx }
    }

    #[must_use]
    pub fn threads(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Closing the queue lets the workers drain and exit
        self.tx.take();
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn tasks_run_and_resolve() {
        let pool = ThreadPool::new(4, "test-worker");
        let h = pool.add_task(|| 7);
        assert_eq!(h.wait(), 7);
    }

    #[test]
    fn tasks_may_enqueue_tasks() {
        let pool = Arc::new(ThreadPool::new(2, "test-worker"));
        let count = Arc::new(AtomicUsize::new(0));

        let p2 = pool.clone();
        let c2 = count.clone();
        let outer = pool.add_task(move || {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let c = c2.clone();
                    p2.add_task(move || {
                        c.fetch_add(1, Ordering::SeqCst);
                        0
                    })
                })
                .collect();
            drop(handles);
            0
        });
        assert_eq!(outer.wait(), 0);

        // Drain the pool by dropping it; all inner tasks must have run
        drop(pool);
        while Arc::strong_count(&count) > 1 {
            std::thread::yield_now();
        }
        assert_eq!(count.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn fifo_order_on_single_worker() {
        let pool = ThreadPool::new(1, "test-worker");
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..5)
            .map(|i| {
                let order = order.clone();
                pool.add_task(move || {
                    order.lock().push(i);
                    0
                })
            })
            .collect();
        for h in handles {
            h.wait();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }
}
