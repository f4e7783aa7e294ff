use super::types::{Event, PersistenceError, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Backend-specific durable append, driven by the single writer task
pub(crate) trait EventSink: Send + 'static {
    /// Persist one event and return the sequence number it was assigned
    fn append(&mut self, event: &Event) -> impl Future<Output = Result<u64>> + Send;

    /// Flush anything still buffered once the queue is closed
    fn finish(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Time left until appended but unsynced data should be synced even if
    /// no further event arrives
    fn idle_sync_due(&self) -> Option<Duration> {
        None
    }

    fn sync_idle(&mut self) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }

    fn name(&self) -> &'static str;
}

/// Event to be written, with optional completion notification
struct Submission {
    event: Event,
    ack: Option<oneshot::Sender<Result<u64>>>,
}

/// Bounded submission queue feeding exactly one writer task.
///
/// Submissions made before [`AsyncWriter::start`] wait in the queue; once it
/// is full, submitters are suspended until the writer frees a slot.
pub struct AsyncWriter {
    submit_tx: Mutex<Option<mpsc::Sender<Submission>>>,
    pending_rx: Mutex<Option<mpsc::Receiver<Submission>>>,
    errors_tx: Mutex<Option<mpsc::UnboundedSender<PersistenceError>>>,
    errors_rx: Mutex<Option<mpsc::UnboundedReceiver<PersistenceError>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncWriter {
    pub(crate) fn new(queue_capacity: usize) -> Self {
        let (submit_tx, pending_rx) = mpsc::channel(queue_capacity.max(1));
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();

        Self {
            submit_tx: Mutex::new(Some(submit_tx)),
            pending_rx: Mutex::new(Some(pending_rx)),
            errors_tx: Mutex::new(Some(errors_tx)),
            errors_rx: Mutex::new(Some(errors_rx)),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the writer task over `sink`. Only the first call succeeds.
    pub(crate) fn start<S: EventSink>(&self, sink: S) -> Result<()> {
        let rx = self
            .pending_rx
            .lock()
            .take()
            .ok_or(PersistenceError::AlreadyStarted)?;
        let errors = self
            .errors_tx
            .lock()
            .take()
            .ok_or(PersistenceError::AlreadyStarted)?;

        let handle = tokio::spawn(Self::writer_loop(sink, rx, errors));
        *self.handle.lock() = Some(handle);

        Ok(())
    }

    pub(crate) fn is_started(&self) -> bool {
        self.handle.lock().is_some()
    }

    /// Enqueue without waiting for durability
    pub async fn submit(&self, event: Event) -> Result<()> {
        self.enqueue(Submission { event, ack: None }).await
    }

    /// Enqueue and wait until the backend has appended the event
    pub async fn submit_acked(&self, event: Event) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Submission {
            event,
            ack: Some(tx),
        })
        .await?;

        rx.await.map_err(|_| PersistenceError::WriterClosed)?
    }

    async fn enqueue(&self, submission: Submission) -> Result<()> {
        let tx = self
            .submit_tx
            .lock()
            .clone()
            .ok_or(PersistenceError::WriterClosed)?;

        tx.send(submission)
            .await
            .map_err(|_| PersistenceError::WriterClosed)
    }

    /// Hand out the stream of asynchronous write failures (once)
    pub fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<PersistenceError>> {
        self.errors_rx.lock().take()
    }

    /// Stop accepting submissions and wait for the queue to drain
    pub async fn close(&self) {
        self.submit_tx.lock().take();
        self.errors_tx.lock().take();

        if let Some(rx) = self.pending_rx.lock().take() {
            if !rx.is_empty() {
                warn!(
                    "Discarding {} events submitted before the writer started",
                    rx.len()
                );
            }
        }

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Transaction log writer task failed: {}", e);
            }
        }
    }

    async fn writer_loop<S: EventSink>(
        mut sink: S,
        mut rx: mpsc::Receiver<Submission>,
        errors: mpsc::UnboundedSender<PersistenceError>,
    ) {
        info!("Transaction log writer started ({})", sink.name());

        let mut written = 0u64;
        let mut failed = 0u64;

        loop {
            let next = match sink.idle_sync_due() {
                Some(due) => tokio::select! {
                    next = rx.recv() => next,
                    _ = tokio::time::sleep(due) => {
                        if let Err(e) = sink.sync_idle().await {
                            warn!("Idle sync failed ({}): {}", sink.name(), e);
                            let _ = errors.send(e);
                        }
                        continue;
                    }
                },
                None => rx.recv().await,
            };
            let Some(Submission { event, ack }) = next else {
                break;
            };

            let result = sink.append(&event).await;

            match &result {
                Ok(sequence) => {
                    written += 1;
                    debug!(
                        "Appended {} key={} as sequence {}",
                        event.event_type(),
                        event.key(),
                        sequence
                    );
                }
                Err(e) => {
                    failed += 1;
                    warn!(
                        "Append failed for {} key={}: {}",
                        event.event_type(),
                        event.key(),
                        e
                    );
                }
            }

            match ack {
                Some(ack) => {
                    let _ = ack.send(result);
                }
                None => {
                    if let Err(e) = result {
                        let _ = errors.send(e);
                    }
                }
            }
        }

        if let Err(e) = sink.finish().await {
            let _ = errors.send(e);
        }

        info!(
            "Transaction log writer stopped ({}): {} written, {} failed",
            sink.name(),
            written,
            failed
        );
    }
}
