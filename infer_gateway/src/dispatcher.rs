use crate::batch::Batch;
use std::sync::Arc;
use tokio::{
    sync::{mpsc, OwnedSemaphorePermit, Semaphore},
    task::{JoinError, JoinHandle, JoinSet},
};
use tonic::async_trait;

/// Consumes one sealed batch and resolves every slot in it.
#[async_trait]
pub trait BatchHandler: Send + Sync + 'static {
    async fn handle(&self, batch: Batch);
}

/// The dispatch slots of one variant. The accumulator takes a slot before it
/// seals a batch and the slot is released when that batch's handler returns.
pub fn dispatch_slots(max_inflight: usize) -> Arc<Semaphore> {
    Arc::new(Semaphore::new(max_inflight.max(1)))
}

/// A sealed batch together with the dispatch slot reserved for it.
#[derive(Debug)]
pub struct Dispatch {
    pub batch: Batch,
    pub slot: OwnedSemaphorePermit,
}

/// Hands sealed batches of one variant to its handler in FIFO order.
///
/// Every batch arrives with its dispatch slot already taken, so the number
/// of handlers running at once never exceeds the slot count.
pub struct Dispatcher {
    variant: Arc<str>,
    batches: mpsc::Receiver<Dispatch>,
    handler: Arc<dyn BatchHandler>,
}

impl Dispatcher {
    pub fn spawn(
        variant: Arc<str>,
        batches: mpsc::Receiver<Dispatch>,
        handler: Arc<dyn BatchHandler>,
    ) -> JoinHandle<()> {
        let dispatcher = Self {
            variant,
            batches,
            handler,
        };
        tokio::spawn(dispatcher.run())
    }

    async fn run(mut self) {
        let mut inflight = JoinSet::new();

        while let Some(Dispatch { batch, slot }) = self.batches.recv().await {
            while let Some(result) = inflight.try_join_next() {
                self.check(result);
            }

            tracing::debug!(variant = %self.variant, batch_id = batch.id(), size = batch.len(), "Dispatching batch");
            let handler = self.handler.clone();
            inflight.spawn(async move {
                let _slot = slot;
                handler.handle(batch).await;
            });
        }

        while let Some(result) = inflight.join_next().await {
            self.check(result);
        }
        tracing::debug!(variant = %self.variant, "Dispatcher stopped");
    }

    fn check(&self, result: Result<(), JoinError>) {
        // slots of a panicked handler resolve themselves on drop
        if let Err(e) = result {
            tracing::error!(variant = %self.variant, "Batch handler failed: {}", e);
        }
    }
}
