use crate::{
    error::GatewayError,
    postprocess::{DecodeOptions, InferenceOutput},
    preprocess::PreparedInput,
};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;

pub type RequestId = u64;

/// The single terminal result of one request.
pub type RequestOutcome = Result<InferenceOutput, GatewayError>;

/// A prepared client request travelling through the accumulator and a batch.
#[derive(Debug)]
pub struct InferenceRequest {
    pub id: RequestId,
    pub variant: Arc<str>,
    pub input: PreparedInput,
    pub arrived_at: Instant,
    /// Decoding overrides applied to this request's slot only.
    pub options: DecodeOptions,
    pub slot: ResultSlot,
}

impl InferenceRequest {
    /// Builds a request together with the handle its caller awaits.
    pub fn new(
        id: RequestId,
        variant: Arc<str>,
        input: PreparedInput,
        arrived_at: Instant,
    ) -> (Self, OutcomeHandle) {
        let (slot, handle) = ResultSlot::channel(id);
        let request = Self {
            id,
            variant,
            input,
            arrived_at,
            options: DecodeOptions::default(),
            slot,
        };
        (request, handle)
    }

    /// Resolves the request without it ever reaching a batch.
    pub fn reject(mut self, error: GatewayError) -> Delivery {
        self.slot.deliver(Err(error))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The caller stopped waiting; the outcome was computed and discarded.
    Abandoned,
    AlreadyResolved,
}

/// Write side of a request's one-shot result channel.
///
/// The sender is taken on the first delivery, which is the explicit
/// "resolved" flag. A slot dropped unresolved reports an internal error so
/// its caller never waits forever.
#[derive(Debug)]
pub struct ResultSlot {
    request_id: RequestId,
    sender: Option<oneshot::Sender<RequestOutcome>>,
}

impl ResultSlot {
    pub fn channel(request_id: RequestId) -> (Self, OutcomeHandle) {
        let (tx, rx) = oneshot::channel();
        let slot = Self {
            request_id,
            sender: Some(tx),
        };
        (slot, OutcomeHandle { request_id, rx })
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn is_resolved(&self) -> bool {
        self.sender.is_none()
    }

    pub fn deliver(&mut self, outcome: RequestOutcome) -> Delivery {
        match self.sender.take() {
            Some(tx) => match tx.send(outcome) {
                Ok(()) => Delivery::Delivered,
                Err(_) => {
                    tracing::debug!(request_id = self.request_id, "Caller went away, discarding outcome");
                    Delivery::Abandoned
                }
            },
            None => {
                tracing::error!(
                    request_id = self.request_id,
                    "Attempted to resolve a request twice"
                );
                Delivery::AlreadyResolved
            }
        }
    }
}

impl Drop for ResultSlot {
    fn drop(&mut self) {
        if let Some(tx) = self.sender.take() {
            tracing::error!(
                request_id = self.request_id,
                "Request dropped before an outcome was produced"
            );
            let _ = tx.send(Err(GatewayError::Internal(
                "request dropped before an outcome was produced".to_string(),
            )));
        }
    }
}

/// Read side of a request's result channel, held by the gateway.
#[derive(Debug)]
pub struct OutcomeHandle {
    request_id: RequestId,
    rx: oneshot::Receiver<RequestOutcome>,
}

impl OutcomeHandle {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub async fn wait(self) -> RequestOutcome {
        self.rx.await.unwrap_or_else(|_| {
            Err(GatewayError::Internal(
                "result channel closed without an outcome".to_string(),
            ))
        })
    }
}
