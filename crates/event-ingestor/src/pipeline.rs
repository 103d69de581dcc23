//! The pipeline channel
//!
//! A bounded FIFO carrying canonical events from the ingestor to the batch
//! writer, with a broadcast tee feeding the webhook dispatcher. Flow
//! regulation is a first-class return value, not an exception:
//!
//! - channel full -> [`EnqueueOutcome::Dropped`] (drop-tail, counted)
//! - writer high-water flag set -> [`EnqueueOutcome::Backpressured`]
//!   (reject-incoming, counted separately)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use haflow_domain::Event;

use crate::metrics;

/// Outcome of one enqueue attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    Dropped,
    Backpressured,
}

/// Producer half of the pipeline (cheap to clone)
#[derive(Clone)]
pub struct EventPipeline {
    tx: mpsc::Sender<Event>,
    tee: broadcast::Sender<Event>,
    backpressure: Arc<AtomicBool>,
}

impl EventPipeline {
    /// Build the pipeline; the receiver goes to the batch writer
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (tee, _) = broadcast::channel(capacity.clamp(16, 4096));

        (
            Self {
                tx,
                tee,
                backpressure: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// Tee for the webhook dispatcher; events arrive in pipeline order
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tee.subscribe()
    }

    /// The flag the writer raises at high-water
    pub fn backpressure_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.backpressure)
    }

    /// Enqueue one event; never blocks the caller
    pub fn enqueue(&self, event: Event) -> EnqueueOutcome {
        if self.backpressure.load(Ordering::Relaxed) {
            metrics::PIPELINE_BACKPRESSURED.inc();
            return EnqueueOutcome::Backpressured;
        }

        match self.tx.try_send(event.clone()) {
            Ok(()) => {
                // Tee after acceptance: dropped events are not in the stream
                let _ = self.tee.send(event);
                metrics::EVENTS_ENQUEUED.inc();
                EnqueueOutcome::Accepted
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::PIPELINE_DROPPED.inc();
                EnqueueOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("pipeline closed, event discarded");
                EnqueueOutcome::Dropped
            }
        }
    }
}
