//! Dynamic batching for one model variant.
//!
//! A single task owns the open batch, so appending a request, checking the
//! triggers and opening the next batch never race. A triggered batch is only
//! sealed once it holds a dispatch slot; until then it keeps taking requests
//! up to `max_batch_size`.

use crate::{
    batch::{Batch, BatchId, SealReason},
    config::BatchingConfig,
    dispatcher::Dispatch,
    error::GatewayError,
    request::InferenceRequest,
    telemetry::Metrics,
};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        AcquireError, OwnedSemaphorePermit, Semaphore,
    },
    task::JoinHandle,
    time::{sleep_until, Instant, Sleep},
};

#[derive(Debug, Clone)]
pub struct AccumulatorSettings {
    pub max_batch_size: usize,
    pub max_batch_delay: Duration,
    pub queue_capacity: usize,
}

impl From<&BatchingConfig> for AccumulatorSettings {
    fn from(config: &BatchingConfig) -> Self {
        Self {
            max_batch_size: config.max_batch_size,
            max_batch_delay: config.max_batch_delay(),
            queue_capacity: config.queue_capacity,
        }
    }
}

/// Cheap, cloneable entry point into a running accumulator.
#[derive(Debug, Clone)]
pub struct AccumulatorHandle {
    variant: Arc<str>,
    tx: mpsc::Sender<InferenceRequest>,
}

impl AccumulatorHandle {
    /// Queues a request for batching without waiting.
    ///
    /// If the request cannot be queued it is resolved right away, so the
    /// caller's outcome handle always completes.
    pub fn enqueue(&self, request: InferenceRequest) {
        match self.tx.try_send(request) {
            Ok(()) => {}
            Err(TrySendError::Full(request)) => {
                tracing::warn!(variant = %self.variant, request_id = request.id, "Batching queue is full, rejecting request");
                request.reject(GatewayError::Overloaded(format!(
                    "batching queue for `{}` is full",
                    self.variant
                )));
            }
            Err(TrySendError::Closed(request)) => {
                request.reject(GatewayError::Internal(format!(
                    "accumulator for `{}` is not running",
                    self.variant
                )));
            }
        }
    }
}

struct OpenBatch {
    id: BatchId,
    created_at: Instant,
    deadline: Instant,
    // armed when the first request lands, dropped with the batch on seal
    timer: Pin<Box<Sleep>>,
    requests: Vec<InferenceRequest>,
}

impl OpenBatch {
    /// The trigger this batch has reached, if any.
    fn trigger(&self, max_batch_size: usize) -> Option<SealReason> {
        if self.requests.len() >= max_batch_size {
            Some(SealReason::Size)
        } else if self.deadline <= Instant::now() {
            Some(SealReason::Deadline)
        } else {
            None
        }
    }
}

enum Event {
    Slot(SealReason, Result<OwnedSemaphorePermit, AcquireError>),
    Request(Option<InferenceRequest>),
    Deadline,
}

pub struct Accumulator {
    variant: Arc<str>,
    settings: AccumulatorSettings,
    requests: mpsc::Receiver<InferenceRequest>,
    slots: Arc<Semaphore>,
    sealed: mpsc::Sender<Dispatch>,
    open: Option<OpenBatch>,
    next_batch_id: BatchId,
    metrics: Arc<Metrics>,
}

impl Accumulator {
    /// Starts the accumulator task. Each sealed batch is sent to `sealed`
    /// together with the slot it took from `slots`.
    ///
    /// The task stops once every handle is dropped, after flushing the open
    /// batch.
    pub fn spawn(
        variant: Arc<str>,
        settings: AccumulatorSettings,
        slots: Arc<Semaphore>,
        sealed: mpsc::Sender<Dispatch>,
        metrics: Arc<Metrics>,
    ) -> (AccumulatorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let accumulator = Self {
            variant: variant.clone(),
            settings,
            requests: rx,
            slots,
            sealed,
            open: None,
            next_batch_id: 0,
            metrics,
        };
        let task = tokio::spawn(accumulator.run());
        (AccumulatorHandle { variant, tx }, task)
    }

    async fn run(mut self) {
        tracing::debug!(
            variant = %self.variant,
            max_batch_size = self.settings.max_batch_size,
            max_batch_delay_ms = self.settings.max_batch_delay.as_millis() as u64,
            "Accumulator started"
        );

        loop {
            let max_batch_size = self.settings.max_batch_size;
            let trigger = self
                .open
                .as_ref()
                .and_then(|open| open.trigger(max_batch_size));
            let full = self
                .open
                .as_ref()
                .is_some_and(|open| open.requests.len() >= max_batch_size);
            // a triggered batch waits for a slot, not for its timer
            let timer = match trigger {
                None => self.open.as_mut().map(|open| open.timer.as_mut()),
                Some(_) => None,
            };
            let slots = self.slots.clone();

            let event = tokio::select! {
                biased;
                slot = slots.acquire_owned(), if trigger.is_some() => {
                    Event::Slot(trigger.unwrap_or(SealReason::Deadline), slot)
                }
                request = self.requests.recv(), if !full => Event::Request(request),
                _ = async {
                    match timer {
                        Some(timer) => timer.await,
                        None => std::future::pending().await,
                    }
                } => Event::Deadline,
            };

            match event {
                Event::Slot(reason, Ok(slot)) => {
                    if !self.seal(reason, slot).await {
                        break;
                    }
                }
                Event::Slot(_, Err(_)) => {
                    self.fail_open("dispatch slots are closed");
                    break;
                }
                Event::Request(Some(request)) => self.push(request),
                Event::Request(None) => break,
                // the next pass sees the expired deadline as a trigger
                Event::Deadline => {}
            }
        }

        self.flush().await;
        tracing::debug!(variant = %self.variant, "Accumulator stopped");
    }

    /// Adds a request to the open batch, opening one if needed.
    fn push(&mut self, request: InferenceRequest) {
        let open = match self.open.as_mut() {
            Some(open) => open,
            None => {
                let now = Instant::now();
                let deadline = now + self.settings.max_batch_delay;
                let id = self.next_batch_id;
                self.next_batch_id += 1;
                self.open.insert(OpenBatch {
                    id,
                    created_at: now,
                    deadline,
                    timer: Box::pin(sleep_until(deadline)),
                    requests: Vec::with_capacity(self.settings.max_batch_size),
                })
            }
        };
        open.requests.push(request);
    }

    /// Seals whatever is left once intake has stopped.
    async fn flush(&mut self) {
        if self.open.is_none() {
            return;
        }
        match self.slots.clone().acquire_owned().await {
            Ok(slot) => {
                self.seal(SealReason::Shutdown, slot).await;
            }
            Err(_) => self.fail_open("dispatch slots are closed"),
        }
    }

    /// Seals the open batch, if any, and forwards it with its slot.
    /// Returns false once the dispatcher is gone.
    async fn seal(&mut self, reason: SealReason, slot: OwnedSemaphorePermit) -> bool {
        let Some(open) = self.open.take() else {
            return true;
        };

        let batch = Batch::new(
            open.id,
            self.variant.clone(),
            open.created_at,
            open.deadline,
            reason,
            open.requests,
        );
        tracing::debug!(
            variant = %self.variant,
            batch_id = batch.id(),
            size = batch.len(),
            reason = %reason,
            "Sealed batch"
        );
        self.metrics
            .record_batch_size(&self.variant, reason.as_str(), batch.len());

        if let Err(mpsc::error::SendError(dispatch)) =
            self.sealed.send(Dispatch { batch, slot }).await
        {
            let batch = dispatch.batch;
            tracing::error!(variant = %self.variant, batch_id = batch.id(), "Dispatcher is gone, failing batch");
            batch.fail_all(GatewayError::Internal(format!(
                "dispatcher for `{}` is not running",
                self.variant
            )));
            return false;
        }
        true
    }

    fn fail_open(&mut self, reason: &str) {
        if let Some(open) = self.open.take() {
            tracing::error!(variant = %self.variant, batch_id = open.id, "{}, failing open batch", reason);
            for request in open.requests {
                request.reject(GatewayError::Internal(format!(
                    "{} for `{}`",
                    reason, self.variant
                )));
            }
        }
    }
}

impl Drop for Accumulator {
    fn drop(&mut self) {
        self.requests.close();
        while let Ok(request) = self.requests.try_recv() {
            request.reject(GatewayError::Internal(format!(
                "accumulator for `{}` stopped",
                self.variant
            )));
        }
    }
}
