//! Fixed-size worker pool.
//!
//! All workers pull from one shared MPMC queue, so an item is picked up by
//! whichever worker frees up first. Each worker owns a scratch buffer that is
//! handed to the handler for every item it processes.
//!
//! The queue is unbounded unless a capacity is configured, in which case
//! [`WorkerPool::submit`] blocks until a slot frees up.

use crossbeam_channel::{Receiver, Sender};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Pool of worker threads processing items of type `T`.
pub struct WorkerPool<T> {
    sender: Option<Sender<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawn `size` workers.
    ///
    /// `queue_capacity == 0` selects an unbounded queue. Every worker gets a
    /// zeroed scratch buffer of `buffer_size` bytes.
    pub fn new<H>(
        size: usize,
        queue_capacity: usize,
        buffer_size: usize,
        handler: H,
    ) -> io::Result<Self>
    where
        H: Fn(T, &mut [u8]) + Send + Sync + 'static,
    {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "worker pool needs at least one worker",
            ));
        }

        let (sender, receiver) = if queue_capacity == 0 {
            crossbeam_channel::unbounded()
        } else {
            crossbeam_channel::bounded(queue_capacity)
        };
        let handler = Arc::new(handler);

        let mut workers = Vec::with_capacity(size);
        for worker_id in 0..size {
            let receiver = receiver.clone();
            let handler = Arc::clone(&handler);

            let handle = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, receiver, buffer_size, handler))?;

            workers.push(handle);
        }

        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// Queue an item for the next free worker.
    pub fn submit(&self, item: T) -> io::Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "worker pool stopped"))?;
        sender
            .send(item)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "all workers exited"))
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Items waiting for a worker.
    pub fn queued(&self) -> usize {
        self.sender.as_ref().map_or(0, Sender::len)
    }
}

impl<T> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        // Closing the queue lets workers finish queued items and exit.
        self.sender.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop<T, H>(worker_id: usize, receiver: Receiver<T>, buffer_size: usize, handler: Arc<H>)
where
    H: Fn(T, &mut [u8]),
{
    let mut buffer = vec![0u8; buffer_size];
    debug!(worker = worker_id, buffer_size, "Worker started");

    while let Ok(item) = receiver.recv() {
        let result = panic::catch_unwind(AssertUnwindSafe(|| handler(item, &mut buffer[..])));
        if result.is_err() {
            error!(worker = worker_id, "Worker task panicked");
        }
    }

    debug!(worker = worker_id, "Worker stopped");
}
