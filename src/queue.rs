//! Durable job queues: publishing, delayed publishing, transactions,
//! consumption and republishing of buried jobs.

use crate::broker::{max_priority_arg, Broker, Link};
use crate::condition::RepublishCondition;
use crate::config::Configuration;
use crate::error::{QueueError, Result};
use crate::iter::JobIter;
use crate::job::Job;
use crate::republish::{self, Publish};
use async_trait::async_trait;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Consumer};
use std::future::Future;
use std::time::Duration;

/// A named durable queue and, for main queues, its buried queue.
///
/// Rejecting a delivery without requeue dead-letters it into the buried
/// queue; `republish_buried` moves buried jobs back.
#[derive(Clone)]
pub struct Queue {
    name: String,
    broker: Broker,
    /// Private channel of a transaction; `None` uses the broker's channel.
    tx_link: Option<Link>,
    buried: Option<Box<Queue>>,
}

impl Queue {
    pub(crate) fn new(broker: Broker, name: String, buried: Option<Queue>) -> Self {
        Self {
            name,
            broker,
            tx_link: None,
            buried: buried.map(Box::new),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The buried queue, absent on buried queues and transactional views.
    pub fn buried_queue(&self) -> Option<&Queue> {
        self.buried.as_deref()
    }

    fn config(&self) -> &Configuration {
        self.broker.configuration()
    }

    async fn link(&self) -> Result<Link> {
        match &self.tx_link {
            Some(_) if self.broker.is_closed() => Err(QueueError::Closed),
            Some(link) => Ok(link.clone()),
            None => self.broker.link().await,
        }
    }

    /// Publishes `job` as a persistent message routed straight to this queue.
    pub async fn publish(&self, job: &Job) -> Result<()> {
        if job.is_empty() {
            return Err(QueueError::EmptyJob);
        }

        self.publish_raw(job.message_properties(self.config()), &job.raw).await?;

        log::debug!("Job {} published to '{}'", job.id, self.name);
        Ok(())
    }

    async fn publish_raw(&self, properties: BasicProperties, data: &[u8]) -> Result<()> {
        let channel = self.link().await?.channel;
        channel
            .basic_publish("", &self.name, BasicPublishOptions::default(), data, properties)
            .await?;
        Ok(())
    }

    /// Publishes `job` so that it reaches this queue once `delay` elapses.
    ///
    /// The job waits in a scratch queue named after its id whose messages
    /// expire after `delay` and dead-letter back here. The scratch queue
    /// expires itself after twice the delay. Delayed jobs carry no retry
    /// headers and never pass through the buried queue.
    ///
    /// Outside a transaction, declaring and publishing happen on a channel of
    /// their own: delaying a job again with another delay while its scratch
    /// queue still exists is refused by the broker, which closes the channel
    /// it was asked on.
    pub async fn publish_delayed(&self, job: &Job, delay: Duration) -> Result<()> {
        if job.is_empty() {
            return Err(QueueError::EmptyJob);
        }

        let link = self.link().await?;
        if self.tx_link.is_some() {
            self.delay_on(&link.channel, job, delay).await?;
        } else {
            let channel = link.connection.create_channel().await.map_err(QueueError::OpenChannel)?;
            let published = self.delay_on(&channel, job, delay).await;

            if let Err(e) = channel.close(200, "Delayed publish done").await {
                log::debug!("Delay channel of job {} already closed: {}", job.id, e);
            }
            published?;
        }

        log::debug!("Job {} delayed {:?} before reaching '{}'", job.id, delay, self.name);
        Ok(())
    }

    async fn delay_on(&self, channel: &Channel, job: &Job, delay: Duration) -> Result<()> {
        let ttl = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        let mut args = FieldTable::default();
        args.insert("x-dead-letter-exchange".into(), AMQPValue::LongString("".into()));
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(self.name.clone().into()),
        );
        args.insert("x-message-ttl".into(), AMQPValue::LongLongInt(ttl));
        // x-expires must be positive.
        args.insert("x-expires".into(), AMQPValue::LongLongInt(ttl.saturating_mul(2).max(1)));
        args.insert("x-max-priority".into(), max_priority_arg(self.config()));

        let delayed = channel
            .queue_declare(
                &job.id,
                QueueDeclareOptions { durable: true, auto_delete: true, ..Default::default() },
                args,
            )
            .await?;

        channel
            .basic_publish(
                "",
                delayed.name().as_str(),
                BasicPublishOptions::default(),
                &job.raw,
                job.properties(),
            )
            .await?;
        Ok(())
    }

    /// Runs `callback` inside an AMQP transaction on a private channel.
    ///
    /// Messages published through the queue handed to `callback` become
    /// visible only if it returns `Ok`; on `Err` they are rolled back and the
    /// callback's error is returned, unless the rollback itself fails.
    pub async fn transaction<F, Fut, T>(&self, callback: F) -> Result<T>
    where
        F: FnOnce(Queue) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let connection = self.link().await?.connection;
        let channel = connection.create_channel().await.map_err(QueueError::OpenChannel)?;

        let tx_queue = Queue {
            name: self.name.clone(),
            broker: self.broker.clone(),
            tx_link: Some(Link { connection, channel: channel.clone() }),
            buried: None,
        };
        let result = Self::run_transaction(&channel, tx_queue, callback).await;

        if let Err(e) = channel.close(200, "Transaction finished").await {
            log::warn!("Failed to close transaction channel for '{}': {}", self.name, e);
        }
        result
    }

    async fn run_transaction<F, Fut, T>(
        channel: &Channel,
        tx_queue: Queue,
        callback: F,
    ) -> Result<T>
    where
        F: FnOnce(Queue) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        channel.tx_select().await?;

        match callback(tx_queue).await {
            Ok(value) => {
                channel.tx_commit().await?;
                Ok(value)
            }
            Err(e) => {
                channel.tx_rollback().await?;
                log::warn!("Transaction rolled back: {}", e);
                Err(e)
            }
        }
    }

    /// Subscribes to this queue on a private channel allowing exactly
    /// `prefetch` unacknowledged deliveries in flight.
    pub async fn consume(&self, prefetch: u16) -> Result<JobIter> {
        let connection = self.link().await?.connection;
        let channel = connection.create_channel().await.map_err(QueueError::OpenChannel)?;
        let consumer_tag = self.broker.consumer_tag(&self.name);

        match self.register_consumer(&channel, &consumer_tag, prefetch).await {
            Ok(consumer) => {
                log::info!(
                    "Consumer '{}' started on '{}' with prefetch {}",
                    consumer_tag,
                    self.name,
                    prefetch
                );
                Ok(JobIter::new(consumer_tag, channel, consumer, self.broker.config()))
            }
            Err(e) => {
                if let Err(close_err) = channel.close(200, "Consumer setup failed").await {
                    log::warn!("Failed to close channel of '{}': {}", consumer_tag, close_err);
                }
                Err(e)
            }
        }
    }

    async fn register_consumer(
        &self,
        channel: &Channel,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<Consumer> {
        channel.basic_qos(prefetch, BasicQosOptions::default()).await?;
        let consumer = channel
            .basic_consume(
                &self.name,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(consumer)
    }

    /// Moves buried jobs back into this queue.
    ///
    /// Drains the buried queue one job at a time. Each job is acked off the
    /// buried queue, then republished here if it satisfies any of
    /// `conditions` (all jobs do when `conditions` is empty). Jobs that do
    /// not comply, jobs whose republish failed and messages whose headers do
    /// not decode are published to the buried queue again once draining
    /// stops. Republish and decoding failures are then reported together as
    /// `QueueError::RepublishFailed`.
    pub async fn republish_buried(&self, conditions: &[RepublishCondition]) -> Result<()> {
        let buried = self
            .buried
            .as_deref()
            .ok_or_else(|| QueueError::NoBuriedQueue(self.name.clone()))?;

        let mut iter = buried.consume(1).await?;
        let drained = republish::drain(&mut iter, self, conditions, self.config()).await;
        if let Err(e) = iter.close().await {
            log::warn!("Failed to close buried queue consumer of '{}': {}", self.name, e);
        }

        log::info!(
            "Republished {} buried jobs to '{}', {} not complying, {} failed, {} undecodable",
            drained.republished,
            self.name,
            drained.not_complying.len(),
            drained.failed.len(),
            drained.malformed.len()
        );
        republish::bury_again(buried, drained, self.config()).await
    }
}

#[async_trait]
impl Publish for Queue {
    async fn publish_job(&self, job: &Job) -> Result<()> {
        self.publish(job).await
    }

    async fn publish_message(&self, properties: BasicProperties, data: &[u8]) -> Result<()> {
        self.publish_raw(properties, data).await
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("transactional", &self.tx_link.is_some())
            .field("buried", &self.buried.as_ref().map(|b| b.name.as_str()))
            .finish()
    }
}
