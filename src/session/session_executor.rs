use std::future::Future;
use std::pin::Pin;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Runs a session's asynchronous message deliveries one after the other on a single task, so
///  listeners of a session are never called concurrently.
pub struct SessionExecutor {
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
}

impl SessionExecutor {
    /// NB: this spawns the executor task, so it must be called inside a Tokio runtime
    pub fn new() -> SessionExecutor {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                job.await;
            }
            trace!("session executor finished");
        });

        SessionExecutor {
            sender: Mutex::new(Some(sender)),
        }
    }

    /// returns `false` if the executor was shut down
    pub fn execute(&self, job: impl Future<Output = ()> + Send + 'static) -> bool {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(Box::pin(job)).is_ok(),
            None => false,
        }
    }

    /// Stops accepting jobs. This does not wait for jobs that are already queued: they still
    ///  run, and are expected to check for themselves whether there is anything left to do.
    pub fn shutdown(&self) {
        self.sender.lock().take();
    }
}
