use std::thread;

use crossbeam_channel::{Sender, unbounded};
use once_cell::sync::Lazy;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// The serial queue that orders every coordinator and table mutation: jobs
/// run one at a time, in submission order, on a single worker thread. All
/// cache instances in the process share one queue.
pub struct WorkQueue {
    tx: Sender<Job>,
}

impl WorkQueue {
    fn spawn() -> WorkQueue {
        let (tx, rx) = unbounded::<Job>();
        thread::Builder::new()
            .name("pixtable-work".into())
            .spawn(move || {
                for job in rx {
                    job();
                }
            })
            .expect("spawning the work queue thread failed");
        WorkQueue { tx }
    }

    /// The process-wide shared queue.
    pub fn shared() -> &'static WorkQueue {
        static SHARED: Lazy<WorkQueue> = Lazy::new(WorkQueue::spawn);
        &SHARED
    }

    /// Enqueue `job` behind everything already submitted.
    pub fn run(&self, job: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Box::new(job));
    }

    /// Block until every job submitted before this call has run.
    pub fn drain(&self) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.run(move || {
            let _ = tx.send(());
        });
        let _ = rx.recv();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn jobs_run_in_submission_order() {
        let queue = WorkQueue::spawn();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        for n in 0..16 {
            let log = log.clone();
            queue.run(move || log.lock().unwrap().push(n));
        }
        queue.drain();
        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn drain_waits_for_prior_jobs() {
        let queue = WorkQueue::spawn();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = counter.clone();
            queue.run(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        queue.drain();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }
}
