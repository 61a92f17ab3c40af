//! The unit of work carried by a queue, and its mapping to AMQP messages.

use crate::acknowledger::{Acknowledger, AmqpAcknowledger};
use crate::config::Configuration;
use crate::error::{QueueError, Result};
use chrono::{DateTime, SubsecRound, Utc};
use lapin::message::Delivery;
use lapin::types::{AMQPValue, FieldTable};
use lapin::BasicProperties;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Content type set by `Job::encode`.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT: u8 = 2;

/// Message priority, 0 being the lowest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(pub u8);

impl Priority {
    pub const LOW: Priority = Priority(0);
    pub const NORMAL: Priority = Priority(4);
    pub const URGENT: Priority = Priority(8);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

impl From<u8> for Priority {
    fn from(p: u8) -> Self {
        Priority(p)
    }
}

/// A job: payload plus delivery metadata and retry bookkeeping.
#[derive(Clone)]
pub struct Job {
    pub id: String,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    pub content_type: String,
    pub raw: Vec<u8>,
    /// Prior delivery attempts, transported in the retries header.
    pub retries: i32,
    /// Classification of the last failure, transported in the error header.
    pub error_type: String,
    acknowledger: Option<Arc<dyn Acknowledger>>,
}

impl Job {
    /// Creates an empty job with a fresh id and the current time.
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            priority: Priority::default(),
            timestamp: Utc::now().trunc_subsecs(0),
            content_type: String::new(),
            raw: Vec::new(),
            retries: 0,
            error_type: String::new(),
            acknowledger: None,
        }
    }

    /// Creates a job whose payload is `payload` serialized as JSON.
    pub fn with_payload<T: Serialize>(payload: &T) -> Result<Self> {
        let mut job = Self::new();
        job.encode(payload)?;
        Ok(job)
    }

    /// Serializes `payload` into the job as JSON.
    pub fn encode<T: Serialize>(&mut self, payload: &T) -> Result<()> {
        self.raw = serde_json::to_vec(payload)?;
        self.content_type = JSON_CONTENT_TYPE.to_string();
        Ok(())
    }

    /// Deserializes the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.raw)?)
    }

    /// Payload length in bytes.
    pub fn size(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Whether the job came from a consumer and can be settled.
    pub fn is_consumed(&self) -> bool {
        self.acknowledger.is_some()
    }

    pub fn set_acknowledger(&mut self, acknowledger: Arc<dyn Acknowledger>) {
        self.acknowledger = Some(acknowledger);
    }

    /// Acknowledges the delivery this job came from.
    pub async fn ack(&self) -> Result<()> {
        self.acknowledger.as_ref().ok_or(QueueError::CannotAck)?.ack().await
    }

    /// Rejects the delivery this job came from. See `Acknowledger::reject`.
    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.acknowledger
            .as_ref()
            .ok_or(QueueError::CannotAck)?
            .reject(requeue)
            .await
    }

    /// Headers for the retry bookkeeping; only non-default values are set.
    pub(crate) fn headers(&self, config: &Configuration) -> FieldTable {
        let mut headers = FieldTable::default();
        if self.retries > 0 {
            headers.insert(config.retries_header.clone().into(), AMQPValue::LongInt(self.retries));
        }

        if !self.error_type.is_empty() {
            headers.insert(
                config.error_header.clone().into(),
                AMQPValue::LongString(self.error_type.clone().into()),
            );
        }
        headers
    }

    /// Properties of a persistent message carrying this job, without headers.
    pub(crate) fn properties(&self) -> BasicProperties {
        let timestamp = u64::try_from(self.timestamp.timestamp()).unwrap_or_default();
        BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_message_id(self.id.clone().into())
            .with_priority(self.priority.0)
            .with_timestamp(timestamp)
            .with_content_type(self.content_type.clone().into())
    }

    /// Decodes a delivery. A delivery whose headers do not decode comes back
    /// whole, still unsettled, as `Malformed`.
    /// Properties plus bookkeeping headers, as published to a queue.
    pub(crate) fn message_properties(&self, config: &Configuration) -> BasicProperties {
        self.properties().with_headers(self.headers(config))
    }

    pub(crate) fn from_delivery(
        delivery: Delivery,
        config: &Configuration,
    ) -> std::result::Result<Self, Malformed> {
        let Delivery { delivery_tag, properties, data, acker, .. } = delivery;
        let acknowledger: Arc<dyn Acknowledger> =
            Arc::new(AmqpAcknowledger::new(acker, delivery_tag));

        match read_bookkeeping(&properties, config) {
            Ok((retries, error_type)) => {
                let mut job = Self::from_parts(&properties, data, retries, error_type);
                job.acknowledger = Some(acknowledger);
                Ok(job)
            }
            Err(error) => Err(Malformed { properties, data, acknowledger, error }),
        }
    }

    /// Maps message properties and body into a job; the retries header must
    /// be a 32-bit integer and the error header a string when present.
    pub(crate) fn from_message(
        properties: &BasicProperties,
        data: Vec<u8>,
        config: &Configuration,
    ) -> Result<Self> {
        let (retries, error_type) = read_bookkeeping(properties, config)?;
        Ok(Self::from_parts(properties, data, retries, error_type))
    }

    fn from_parts(
        properties: &BasicProperties,
        data: Vec<u8>,
        retries: i32,
        error_type: String,
    ) -> Self {
        let timestamp = properties
            .timestamp()
            .and_then(|ts| i64::try_from(ts).ok())
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .unwrap_or_default();

        Self {
            id: message_id(properties),
            priority: Priority(properties.priority().unwrap_or_default()),
            timestamp,
            content_type: properties
                .content_type()
                .as_ref()
                .map(|s| s.to_string())
                .unwrap_or_default(),
            raw: data,
            retries,
            error_type,
            acknowledger: None,
        }
    }
}

/// A delivery whose retry headers could not be decoded into a `Job`.
pub(crate) struct Malformed {
    pub(crate) properties: BasicProperties,
    pub(crate) data: Vec<u8>,
    pub(crate) acknowledger: Arc<dyn Acknowledger>,
    pub(crate) error: QueueError,
}

impl Malformed {
    pub(crate) fn message_id(&self) -> String {
        message_id(&self.properties)
    }
}

fn message_id(properties: &BasicProperties) -> String {
    properties
        .message_id()
        .as_ref()
        .map(|s| s.to_string())
        .unwrap_or_default()
}

/// Reads the retries and error type headers, when present.
fn read_bookkeeping(properties: &BasicProperties, config: &Configuration) -> Result<(i32, String)> {
    let Some(headers) = properties.headers().as_ref() else {
        return Ok((0, String::new()));
    };

    let bad_header = |header: &str| QueueError::BadHeader {
        header: header.to_string(),
        message_id: message_id(properties),
    };

    let retries = match headers.inner().get(config.retries_header.as_str()) {
        None => 0,
        Some(AMQPValue::LongInt(retries)) => *retries,
        Some(_) => return Err(bad_header(&config.retries_header)),
    };

    let error_type = match headers.inner().get(config.error_header.as_str()) {
        None => String::new(),
        Some(AMQPValue::LongString(error_type)) => error_type.to_string(),
        Some(AMQPValue::ShortString(error_type)) => error_type.to_string(),
        Some(_) => return Err(bad_header(&config.error_header)),
    };

    Ok((retries, error_type))
}

impl Default for Job {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("timestamp", &self.timestamp)
            .field("content_type", &self.content_type)
            .field("size", &self.raw.len())
            .field("retries", &self.retries)
            .field("error_type", &self.error_type)
            .field("consumed", &self.acknowledger.is_some())
            .finish()
    }
}
