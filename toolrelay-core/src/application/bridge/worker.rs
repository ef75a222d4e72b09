use super::error::BridgeError;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

type LocalFuture = Pin<Box<dyn Future<Output = ()>>>;
type Operation = Box<dyn FnOnce() -> LocalFuture + Send>;

enum Message {
    Run(Operation),
    Shutdown,
}

/// Clonable submission side of an [`AsyncBridge`].
#[derive(Clone)]
pub struct BridgeHandle {
    sender: mpsc::UnboundedSender<Message>,
    sequence: Arc<AtomicU64>,
    worker: ThreadId,
}

impl BridgeHandle {
    /// Runs `operation` on the bridge loop and blocks until it finishes.
    pub fn submit<F, Fut, T>(&self, operation: F) -> Result<T, BridgeError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
        T: Send + 'static,
    {
        self.submit_sequenced(operation).map(|(_, value)| value)
    }

    /// Like [`submit`](Self::submit), also returning the position of the
    /// operation in the bridge's execution order (starting at 1).
    pub fn submit_sequenced<F, Fut, T>(&self, operation: F) -> Result<(u64, T), BridgeError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
        T: Send + 'static,
    {
        if std::thread::current().id() == self.worker {
            return Err(BridgeError::Reentrant);
        }

        let (reply_tx, reply_rx) = std_mpsc::sync_channel(1);
        let sequence = Arc::clone(&self.sequence);
        let job: Operation = Box::new(move || {
            Box::pin(async move {
                let position = sequence.fetch_add(1, Ordering::SeqCst) + 1;
                let outcome = AssertUnwindSafe(async move { operation().await })
                    .catch_unwind()
                    .await
                    .map(|value| (position, value))
                    .map_err(|payload| BridgeError::OperationPanicked(panic_message(payload)));
                if reply_tx.send(outcome).is_err() {
                    debug!(position, "bridge caller went away before the result arrived");
                }
            })
        });

        self.sender
            .send(Message::Run(job))
            .map_err(|_| BridgeError::Closed)?;
        reply_rx.recv().map_err(|_| BridgeError::Closed)?
    }
}

/// One worker thread owning a current-thread runtime. Every submitted
/// operation runs to completion before the next one starts.
pub struct AsyncBridge {
    handle: BridgeHandle,
    worker: Option<JoinHandle<()>>,
    stopped: std_mpsc::Receiver<()>,
}

impl AsyncBridge {
    pub fn start() -> Result<Self, BridgeError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
        let (stopped_tx, stopped_rx) = std_mpsc::sync_channel(1);

        let worker = std::thread::Builder::new()
            .name("toolrelay-bridge".to_string())
            .spawn(move || run_worker(receiver, ready_tx, stopped_tx))
            .map_err(|err| BridgeError::Start(err.to_string()))?;

        let thread = ready_rx
            .recv()
            .map_err(|_| BridgeError::Start("bridge worker exited during startup".to_string()))?
            .map_err(BridgeError::Start)?;

        info!("Async bridge started");
        Ok(Self {
            handle: BridgeHandle {
                sender,
                sequence: Arc::new(AtomicU64::new(0)),
                worker: thread,
            },
            worker: Some(worker),
            stopped: stopped_rx,
        })
    }

    pub fn handle(&self) -> BridgeHandle {
        self.handle.clone()
    }

    pub fn submit<F, Fut, T>(&self, operation: F) -> Result<T, BridgeError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
        T: Send + 'static,
    {
        self.handle.submit(operation)
    }

    pub fn submit_sequenced<F, Fut, T>(&self, operation: F) -> Result<(u64, T), BridgeError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
        T: Send + 'static,
    {
        self.handle.submit_sequenced(operation)
    }

    /// Stops the loop after queued operations drain and joins the worker.
    /// A worker still busy after `timeout` is abandoned; teardown completes
    /// either way.
    pub fn teardown(mut self, timeout: Duration) {
        let _ = self.handle.sender.send(Message::Shutdown);
        match self.stopped.recv_timeout(timeout) {
            Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                if let Some(worker) = self.worker.take() {
                    if worker.join().is_err() {
                        warn!("bridge worker panicked during shutdown");
                    }
                }
                info!("Async bridge stopped");
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                warn!(?timeout, "bridge worker did not stop in time; abandoning thread");
                self.worker.take();
            }
        }
    }
}

impl Drop for AsyncBridge {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let _ = self.handle.sender.send(Message::Shutdown);
        }
    }
}

fn run_worker(
    mut receiver: mpsc::UnboundedReceiver<Message>,
    ready: std_mpsc::SyncSender<Result<ThreadId, String>>,
    stopped: std_mpsc::SyncSender<()>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "failed to build bridge runtime");
            let _ = ready.send(Err(err.to_string()));
            return;
        }
    };
    let _ = ready.send(Ok(std::thread::current().id()));

    runtime.block_on(async move {
        while let Some(message) = receiver.recv().await {
            match message {
                Message::Run(operation) => operation().await,
                Message::Shutdown => break,
            }
        }
    });
    drop(runtime);
    let _ = stopped.send(());
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}
