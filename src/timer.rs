//! Cancellable scheduled tasks.
//!
//! Heartbeats and request timeouts are both expressed as a [`ScheduledTask`]. Every task
//! lives on one shared scheduler thread that keeps a deadline-ordered heap and sleeps on a
//! condvar until the earliest deadline, so the number of pending timers never affects the
//! number of threads. Tasks run on that thread and must not block.
//!
//! Cancellation and firing are decided under the same lock, so a task cancelled before its
//! deadline never runs.
use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Condvar, Mutex, OnceLock, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use log::{error, trace};

use crate::sync::lock;

enum Job {
    Once(Box<dyn FnOnce() + Send>),
    Repeating {
        period: Duration,
        task: Box<dyn FnMut() + Send>,
    },
}

#[derive(Debug, Default)]
struct Status {
    cancelled: AtomicBool,
    fired: AtomicBool,
}

struct Entry {
    name: String,
    status: Arc<Status>,
    job: Job,
}

#[derive(Default)]
struct Queue {
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    entries: HashMap<u64, Entry>,
    /// Repeating task currently running outside the lock.
    running: Option<u64>,
    next_id: u64,
    started: bool,
}

struct Scheduler {
    queue: Mutex<Queue>,
    wake: Condvar,
}

fn scheduler() -> &'static Scheduler {
    static SCHEDULER: OnceLock<Scheduler> = OnceLock::new();
    SCHEDULER.get_or_init(|| Scheduler {
        queue: Mutex::new(Queue::default()),
        wake: Condvar::new(),
    })
}

impl Scheduler {
    fn schedule(&'static self, name: &str, deadline: Instant, job: Job) -> io::Result<ScheduledTask> {
        let mut queue = lock(&self.queue);
        if !queue.started {
            thread::Builder::new()
                .name("scheduler".into())
                .spawn(move || self.run())?;
            queue.started = true;
        }

        let id = queue.next_id;
        queue.next_id += 1;
        let status = Arc::new(Status::default());
        queue.entries.insert(
            id,
            Entry {
                name: name.to_string(),
                status: Arc::clone(&status),
                job,
            },
        );
        queue.deadlines.push(Reverse((deadline, id)));
        self.wake.notify_one();

        Ok(ScheduledTask { id, status })
    }

    fn cancel(&self, task: &ScheduledTask) -> bool {
        let mut queue = lock(&self.queue);
        if task.status.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        let pending = queue.entries.remove(&task.id).is_some() || queue.running == Some(task.id);
        pending && !task.status.fired.load(Ordering::Acquire)
    }

    fn run(&self) {
        let mut queue = lock(&self.queue);
        loop {
            let Some(&Reverse((deadline, id))) = queue.deadlines.peek() else {
                queue = self.wake.wait(queue).unwrap_or_else(PoisonError::into_inner);
                continue;
            };
            let now = Instant::now();
            if deadline > now {
                queue = match self.wake.wait_timeout(queue, deadline - now) {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                };
                continue;
            }

            queue.deadlines.pop();
            let Some(Entry { name, status, job }) = queue.entries.remove(&id) else {
                continue;
            };

            match job {
                Job::Once(task) => {
                    status.fired.store(true, Ordering::Release);
                    drop(queue);
                    run_task(&name, task);
                    queue = lock(&self.queue);
                }
                Job::Repeating { period, mut task } => {
                    queue.running = Some(id);
                    drop(queue);
                    run_task(&name, &mut task);
                    queue = lock(&self.queue);
                    queue.running = None;

                    if status.cancelled.load(Ordering::Acquire) {
                        trace!("timer '{name}' stopped");
                        continue;
                    }
                    let next = (deadline + period).max(Instant::now());
                    queue.entries.insert(
                        id,
                        Entry {
                            name,
                            status,
                            job: Job::Repeating { period, task },
                        },
                    );
                    queue.deadlines.push(Reverse((next, id)));
                }
            }
        }
    }
}

fn run_task(name: &str, task: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
        error!("timer '{name}' panicked");
    }
}

/// Handle to a one-shot or repeating timer. Dropping the handle does not cancel it.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    id: u64,
    status: Arc<Status>,
}

impl ScheduledTask {
    /// Runs `task` once after `delay`.
    pub fn once<F>(name: &str, delay: Duration, task: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        scheduler().schedule(name, Instant::now() + delay, Job::Once(Box::new(task)))
    }

    /// Runs `task` after `initial`, then every `period` until cancelled. `period` must be
    /// non-zero.
    pub fn repeating<F>(name: &str, initial: Duration, period: Duration, task: F) -> io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        if period.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("timer '{name}' needs a non-zero period"),
            ));
        }
        let job = Job::Repeating {
            period,
            task: Box::new(task),
        };
        scheduler().schedule(name, Instant::now() + initial, job)
    }

    /// Cancels the task. Returns true if this call stopped a task that had not yet fired.
    pub fn cancel(&self) -> bool {
        scheduler().cancel(self)
    }

    pub fn is_cancelled(&self) -> bool {
        self.status.cancelled.load(Ordering::Acquire)
    }
}
