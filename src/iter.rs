//! Consumption handle over one queue subscription.

use crate::config::Configuration;
use crate::error::{QueueError, Result};
use crate::job::Job;
use crate::republish::{Fetch, Fetched};
use futures_util::{FutureExt, StreamExt};
use lapin::options::BasicCancelOptions;
use lapin::{Channel, Consumer};
use std::sync::Arc;

/// Sequence of jobs delivered to one consumer on a private channel.
///
/// Must be closed with `close` (or a `IterCloser`) when done; that cancels
/// the consumer and closes its channel.
pub struct JobIter {
    consumer: Consumer,
    closer: IterCloser,
    config: Arc<Configuration>,
}

/// Cancels the consumer of a `JobIter` from another task. A pending `next`
/// then returns `QueueError::AlreadyClosed`.
#[derive(Clone)]
pub struct IterCloser {
    consumer_tag: String,
    channel: Channel,
}

impl JobIter {
    pub(crate) fn new(
        consumer_tag: String,
        channel: Channel,
        consumer: Consumer,
        config: Arc<Configuration>,
    ) -> Self {
        Self {
            consumer,
            closer: IterCloser { consumer_tag, channel },
            config,
        }
    }

    /// Waits for the next delivery.
    pub async fn next(&mut self) -> Result<Job> {
        match self.consumer.next().await {
            Some(delivery) => Job::from_delivery(delivery?, &self.config).map_err(|m| m.error),
            None => Err(QueueError::AlreadyClosed),
        }
    }

    pub fn consumer_tag(&self) -> &str {
        &self.closer.consumer_tag
    }

    pub fn closer(&self) -> IterCloser {
        self.closer.clone()
    }

    pub async fn close(self) -> Result<()> {
        self.closer.close().await
    }
}

impl Fetch for JobIter {
    /// Returns a delivery if one is already buffered, `None` otherwise.
    fn try_fetch(&mut self) -> Result<Option<Fetched>> {
        let delivery = match self.consumer.next().now_or_never() {
            None => return Ok(None),
            Some(None) => return Err(QueueError::AlreadyClosed),
            Some(Some(delivery)) => delivery?,
        };

        Ok(Some(match Job::from_delivery(delivery, &self.config) {
            Ok(job) => Fetched::Job(job),
            Err(malformed) => Fetched::Malformed(malformed),
        }))
    }
}

impl IterCloser {
    /// Cancels the consumer, then closes the channel. Both steps always run;
    /// the first failure is returned.
    pub async fn close(&self) -> Result<()> {
        let cancelled = self
            .channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await;
        let closed = self.channel.close(200, "Consumer closed").await;

        match (cancelled, closed) {
            (Err(e), _) | (Ok(()), Err(e)) => {
                log::warn!("Closing consumer '{}' failed: {}", self.consumer_tag, e);
                Err(e.into())
            }
            (Ok(()), Ok(())) => {
                log::debug!("Consumer '{}' closed", self.consumer_tag);
                Ok(())
            }
        }
    }
}
