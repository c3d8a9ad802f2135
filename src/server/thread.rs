use std::{
    sync::{Arc, Mutex, mpsc},
    thread,
};

use log::{debug, warn};

use crate::sync::lock;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of worker threads pulling jobs from a shared channel.
#[derive(Debug)]
pub struct ThreadPool {
    workers: Vec<Worker>,
    sender: Option<mpsc::Sender<Job>>,
}

impl ThreadPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);

        let mut workers = Vec::with_capacity(size);
        let (sender, receiver) = mpsc::channel();
        let receiver = Arc::new(Mutex::new(receiver));

        for id in 0..size {
            match Worker::spawn(id, Arc::clone(&receiver)) {
                Ok(worker) => workers.push(worker),
                Err(e) => warn!("failed to start worker {id}: {e}"),
            }
        }

        Self {
            workers,
            sender: Some(sender),
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queues `f` for the next idle worker. Returns false if no worker is left to run it.
    pub fn execute<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.workers.is_empty() {
            return false;
        }
        self.sender
            .as_ref()
            .is_some_and(|sender| sender.send(Box::new(f)).is_ok())
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.sender.take());

        for worker in self.workers.drain(..) {
            debug!("shutting down worker {}", worker.id);
            if worker.thread.join().is_err() {
                warn!("worker {} panicked", worker.id);
            }
        }
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn spawn(id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) -> std::io::Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("echo-worker-{id}"))
            .spawn(move || {
                loop {
                    let job = lock(&receiver).recv();
                    match job {
                        Ok(job) => {
                            debug!("worker {id} handling a connection");
                            job();
                        }
                        Err(_) => {
                            debug!("worker {id} stopping");
                            break;
                        }
                    }
                }
            })?;

        Ok(Self { id, thread })
    }
}
