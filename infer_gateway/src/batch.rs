use crate::{
    error::GatewayError,
    request::{Delivery, InferenceRequest},
};
use ndarray::{Array4, ArrayView3, Axis};
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

pub type BatchId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealReason {
    /// The batch reached `max_batch_size`.
    Size,
    /// The oldest request waited `max_batch_delay`.
    Deadline,
    /// The accumulator stopped and flushed what it held.
    Shutdown,
}

impl SealReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SealReason::Size => "size",
            SealReason::Deadline => "deadline",
            SealReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for SealReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sealed, immutable group of requests dispatched in one backend call.
///
/// Slot `i` is `requests[i]`; the order is the order of arrival at the
/// accumulator and is what postprocessing demultiplexes by.
#[derive(Debug)]
pub struct Batch {
    id: BatchId,
    variant: Arc<str>,
    created_at: Instant,
    deadline: Instant,
    reason: SealReason,
    requests: Vec<InferenceRequest>,
}

impl Batch {
    pub(crate) fn new(
        id: BatchId,
        variant: Arc<str>,
        created_at: Instant,
        deadline: Instant,
        reason: SealReason,
        requests: Vec<InferenceRequest>,
    ) -> Self {
        debug_assert!(!requests.is_empty(), "a sealed batch holds at least one request");
        Self {
            id,
            variant,
            created_at,
            deadline,
            reason,
            requests,
        }
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn variant(&self) -> &str {
        &self.variant
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn reason(&self) -> SealReason {
        self.reason
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn requests(&self) -> &[InferenceRequest] {
        &self.requests
    }

    pub fn requests_mut(&mut self) -> &mut [InferenceRequest] {
        &mut self.requests
    }

    pub fn into_requests(self) -> Vec<InferenceRequest> {
        self.requests
    }

    /// Stacks every slot's tensor along a new leading batch axis.
    pub fn stack_inputs(&self) -> Result<Array4<f32>, GatewayError> {
        let views: Vec<ArrayView3<f32>> = self
            .requests
            .iter()
            .map(|request| request.input.tensor.view())
            .collect();

        ndarray::stack(Axis(0), &views).map_err(|e| {
            GatewayError::Internal(format!(
                "batch {} holds tensors of different shapes: {}",
                self.id, e
            ))
        })
    }

    /// Resolves every slot with the same failure.
    pub fn fail_all(self, error: GatewayError) -> usize {
        let mut delivered = 0;
        for mut request in self.requests {
            if request.slot.deliver(Err(error.clone())) == Delivery::Delivered {
                delivered += 1;
            }
        }
        delivered
    }
}
