use std::fmt;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::sync::mpsc::{self, Sender};
use std::thread;

use crate::util::lock_unpoisoned;

pub const DEFAULT_DELIVERY_THREAD_NAME: &str = "netq-delivery";

pub type DeliveryJob = Box<dyn FnOnce() + Send>;

/// Where completed results are handed to their futures, and therefore where
/// continuations run.
pub trait DeliverySink: Send + Sync {
    fn execute(&self, job: DeliveryJob);
}

/// Runs each job on the calling thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineDelivery;

impl DeliverySink for InlineDelivery {
    fn execute(&self, job: DeliveryJob) {
        run_guarded(job);
    }
}

/// One long-lived thread draining jobs in submission order. The thread exits
/// once the sink is dropped and the backlog is empty.
pub struct DeliveryThread {
    sender: Mutex<Option<Sender<DeliveryJob>>>,
    name: String,
}

impl DeliveryThread {
    pub fn spawn() -> io::Result<Self> {
        Self::named(DEFAULT_DELIVERY_THREAD_NAME)
    }

    pub fn named(name: impl Into<String>) -> io::Result<Self> {
        let name = name.into();
        let (sender, receiver) = mpsc::channel::<DeliveryJob>();
        thread::Builder::new().name(name.clone()).spawn(move || {
            for job in receiver {
                run_guarded(job);
            }
            tracing::debug!("delivery thread stopped");
        })?;
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for DeliveryThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryThread")
            .field("name", &self.name)
            .finish()
    }
}

impl DeliverySink for DeliveryThread {
    fn execute(&self, job: DeliveryJob) {
        let sender = lock_unpoisoned(&self.sender);
        let rejected = match sender.as_ref() {
            Some(sender) => sender.send(job).err().map(|returned| returned.0),
            None => Some(job),
        };
        drop(sender);
        // The thread is gone; run the job here rather than lose a result.
        if let Some(job) = rejected {
            tracing::warn!(thread = %self.name, "delivery thread unavailable, running job inline");
            run_guarded(job);
        }
    }
}

impl Drop for DeliveryThread {
    fn drop(&mut self) {
        lock_unpoisoned(&self.sender).take();
    }
}

fn run_guarded(job: DeliveryJob) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        tracing::error!("delivery job panicked");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::{DeliverySink, DeliveryThread, InlineDelivery};

    #[test]
    fn delivery_thread_runs_jobs_in_order_on_its_own_thread() {
        let sink = DeliveryThread::named("test-delivery").expect("spawn delivery thread");
        let (tx, rx) = mpsc::channel();
        for index in 0..5 {
            let tx = tx.clone();
            sink.execute(Box::new(move || {
                let name = std::thread::current().name().map(str::to_owned);
                tx.send((index, name)).expect("send job result");
            }));
        }

        let received: Vec<_> = (0..5)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).expect("job result"))
            .collect();
        assert_eq!(
            received.iter().map(|(index, _)| *index).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4]
        );
        assert!(
            received
                .iter()
                .all(|(_, name)| name.as_deref() == Some("test-delivery"))
        );
    }

    #[test]
    fn panicking_job_does_not_stop_the_thread() {
        let sink = DeliveryThread::spawn().expect("spawn delivery thread");
        sink.execute(Box::new(|| panic!("boom")));
        let (tx, rx) = mpsc::channel();
        sink.execute(Box::new(move || tx.send(1).expect("send")));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).expect("job ran"), 1);
    }

    #[test]
    fn inline_delivery_runs_immediately() {
        let (tx, rx) = mpsc::channel();
        InlineDelivery.execute(Box::new(move || tx.send(()).expect("send")));
        assert!(rx.try_recv().is_ok());
    }
}
