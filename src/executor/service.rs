//! Thread-per-submission execution service.
//!
//! No core threads, no ceiling and no queue: every [`ExecutionService::execute`]
//! spawns a fresh, named OS thread (`{name}:{n}`) and the thread exits when its
//! task does. Nothing idles and nothing waits in line. If the OS refuses a thread
//! the submission fails with the spawn error.
//!
//! The service counts two kinds of submissions:
//! - *pending*: thread spawned, task not begun yet,
//! - *active*: task running.
//!
//! [`shutdown`](ExecutionService::shutdown) rejects new work and lets both kinds
//! finish. [`shutdown_now`](ExecutionService::shutdown_now) additionally makes
//! pending submissions discard their task, and reports how many did. Running
//! tasks cannot be preempted; after `shutdown_now` they are abandoned, i.e. left to
//! finish on detached threads.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Default)]
struct Counters {
    shutdown: bool,
    shutdown_now: bool,
    pending: usize,
    active: usize,
    spawned: usize,
    discarded: usize,
}

impl Counters {
    fn outstanding(&self) -> usize {
        self.pending + self.active
    }
}

#[derive(Debug, Default)]
struct Shared {
    counters: Mutex<Counters>,
    idle: Condvar,
}

/// Why a submission was not executed.
#[derive(Debug)]
pub enum SubmitError {
    Shutdown,
    Spawn(io::Error),
}

#[derive(Debug, Clone)]
pub struct ExecutionService {
    name: String,
    shared: Arc<Shared>,
}

/// Decrements `active` when a task ends, unwinding included.
struct ActiveGuard<'a>(&'a Shared);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let mut counters = self.0.counters.lock();
        counters.active -= 1;
        if counters.outstanding() == 0 {
            self.0.idle.notify_all();
        }
    }
}

impl ExecutionService {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `task` on a new thread.
    pub fn execute<F>(&self, task: F) -> Result<(), SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        let index = {
            let mut counters = self.shared.counters.lock();
            if counters.shutdown {
                return Err(SubmitError::Shutdown);
            }
            counters.pending += 1;
            counters.spawned += 1;
            counters.spawned - 1
        };

        let shared = Arc::clone(&self.shared);
        let task: Task = Box::new(task);
        let spawned = thread::Builder::new()
            .name(format!("{}:{index}", self.name))
            .spawn(move || run_submission(&shared, task));

        match spawned {
            // Detached: completion is tracked through the counters, not the handle.
            Ok(_handle) => Ok(()),
            Err(e) => {
                let mut counters = self.shared.counters.lock();
                counters.pending -= 1;
                if counters.outstanding() == 0 {
                    self.shared.idle.notify_all();
                }
                Err(SubmitError::Spawn(e))
            }
        }
    }

    /// Stop accepting work. Running and pending tasks are left to finish.
    pub fn shutdown(&self) {
        self.shared.counters.lock().shutdown = true;
    }

    /// Stop accepting work and discard every submission that has not begun.
    ///
    /// Returns the number of discarded submissions.
    pub fn shutdown_now(&self) -> usize {
        let mut counters = self.shared.counters.lock();
        counters.shutdown = true;
        counters.shutdown_now = true;
        counters.pending
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.counters.lock().shutdown
    }

    /// Submissions that have not finished (pending or running).
    pub fn outstanding(&self) -> usize {
        self.shared.counters.lock().outstanding()
    }

    pub fn active(&self) -> usize {
        self.shared.counters.lock().active
    }

    /// Total submissions discarded after `shutdown_now`.
    pub fn discarded(&self) -> usize {
        self.shared.counters.lock().discarded
    }

    /// Block until nothing is outstanding or `timeout` passes. `true` if drained.
    ///
    /// A timeout too large to express as a deadline waits without one.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut counters = self.shared.counters.lock();
        while counters.outstanding() > 0 {
            match deadline {
                Some(deadline) => {
                    if self.shared.idle.wait_until(&mut counters, deadline).timed_out() {
                        return counters.outstanding() == 0;
                    }
                }
                None => self.shared.idle.wait(&mut counters),
            }
        }
        true
    }
}

fn run_submission(shared: &Shared, task: Task) {
    {
        let mut counters = shared.counters.lock();
        counters.pending -= 1;
        if counters.shutdown_now {
            // Released before waiters are woken, so whatever it owns is settled first.
            drop(task);
            counters.discarded += 1;
            if counters.outstanding() == 0 {
                shared.idle.notify_all();
            }
            tracing::debug!("Discarding submission that never started.");
            return;
        }
        counters.active += 1;
    }

    let _active = ActiveGuard(shared);
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        tracing::error!(
            "Task on thread {} panicked: {message}",
            thread::current().name().unwrap_or("<unnamed>")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn runs_each_submission_on_its_own_named_thread() {
        let service = ExecutionService::new("named");
        let (tx, rx) = mpsc::channel();
        for _ in 0..3 {
            let tx = tx.clone();
            service
                .execute(move || {
                    tx.send(thread::current().name().map(str::to_string)).unwrap();
                })
                .unwrap();
        }
        let mut names: Vec<String> = (0..3).map(|_| rx.recv().unwrap().unwrap()).collect();
        names.sort();
        assert_eq!(names, vec!["named:0", "named:1", "named:2"]);
        assert!(service.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn rejects_after_shutdown() {
        let service = ExecutionService::new("closed");
        service.shutdown();
        assert!(matches!(service.execute(|| {}), Err(SubmitError::Shutdown)));
        assert!(service.await_termination(Duration::ZERO));
    }

    #[test]
    fn await_termination_times_out_on_long_tasks() {
        let service = ExecutionService::new("slow");
        service
            .execute(|| thread::sleep(Duration::from_millis(300)))
            .unwrap();
        service.shutdown();
        assert!(!service.await_termination(Duration::from_millis(20)));
        assert!(service.await_termination(Duration::from_secs(5)));
        assert_eq!(service.outstanding(), 0);
    }

    #[test]
    fn unbounded_timeout_waits_for_completion() {
        let service = ExecutionService::new("forever");
        service
            .execute(|| thread::sleep(Duration::from_millis(30)))
            .unwrap();
        service.shutdown();
        assert!(service.await_termination(Duration::MAX));
        assert_eq!(service.outstanding(), 0);
    }

    #[test]
    fn panics_are_contained_and_counted_down() {
        let service = ExecutionService::new("panicky");
        service.execute(|| panic!("boom")).unwrap();
        assert!(service.await_termination(Duration::from_secs(5)));
        assert_eq!(service.active(), 0);
    }

    #[test]
    fn shutdown_now_reports_never_started_work() {
        let service = ExecutionService::new("now");
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        service
            .execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let discarded = service.shutdown_now();
        assert!(service.await_termination(Duration::from_secs(5)));
        // Either the task got going before the shutdown or it was discarded; never both.
        assert_eq!(ran.load(Ordering::SeqCst) + service.discarded(), 1);
        assert_eq!(service.discarded(), discarded);
    }

    struct CountDrop(Arc<AtomicUsize>);

    impl Drop for CountDrop {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn every_task_is_released_by_termination() {
        let service = ExecutionService::new("release");
        let released = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let owned = CountDrop(Arc::clone(&released));
            service
                .execute(move || {
                    let _owned = owned;
                    thread::sleep(Duration::from_millis(5));
                })
                .unwrap();
        }
        service.shutdown_now();
        assert!(service.await_termination(Duration::from_secs(5)));
        // Run or discarded, each task's captures are gone once the service is idle.
        assert_eq!(released.load(Ordering::SeqCst), 16);
    }
}
