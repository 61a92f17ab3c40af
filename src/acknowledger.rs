//! Per-delivery acknowledgement capability.

use crate::error::QueueError;
use async_trait::async_trait;
use lapin::acker::Acker;
use lapin::options::{BasicAckOptions, BasicRejectOptions};
use std::fmt;

/// Settles a single delivery with the broker.
///
/// Only consumed jobs carry one; see `Job::ack` and `Job::reject`.
#[async_trait]
pub trait Acknowledger: Send + Sync + fmt::Debug {
    /// Confirms the delivery, removing it from its queue.
    async fn ack(&self) -> Result<(), QueueError>;

    /// Refuses the delivery. With `requeue == false` the broker dead-letters
    /// it into the buried queue; with `requeue == true` it goes back to the
    /// queue it came from.
    async fn reject(&self, requeue: bool) -> Result<(), QueueError>;
}

/// `Acknowledger` backed by the lapin acker of a delivery.
pub struct AmqpAcknowledger {
    acker: Acker,
    delivery_tag: u64,
}

impl AmqpAcknowledger {
    pub fn new(acker: Acker, delivery_tag: u64) -> Self {
        Self { acker, delivery_tag }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }
}

impl fmt::Debug for AmqpAcknowledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpAcknowledger")
            .field("delivery_tag", &self.delivery_tag)
            .finish()
    }
}

#[async_trait]
impl Acknowledger for AmqpAcknowledger {
    async fn ack(&self) -> Result<(), QueueError> {
        self.acker.ack(BasicAckOptions::default()).await?;
        log::debug!("Delivery {} acked", self.delivery_tag);
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), QueueError> {
        self.acker.reject(BasicRejectOptions { requeue }).await?;
        log::debug!("Delivery {} rejected (requeue: {})", self.delivery_tag, requeue);
        Ok(())
    }
}
