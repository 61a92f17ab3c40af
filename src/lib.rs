//! # AMQP Jobs
//! Durable job queues on top of RabbitMQ with automatic dead-lettering into
//! buried queues, delayed delivery, transactional publishing and a
//! republishing engine for buried jobs. The broker connection is supervised
//! and transparently re-established when it drops.

pub mod acknowledger;
pub mod backoff;
pub mod broker;
pub mod condition;
pub mod config;
pub mod error;
pub mod iter;
pub mod job;
pub mod queue;
mod republish;

// Re-export key components for easy access
pub use acknowledger::{Acknowledger, AmqpAcknowledger};
pub use backoff::{Backoff, BackoffConfig};
pub use broker::Broker;
pub use condition::RepublishCondition;
pub use config::{Configuration, ConfigurationBuilder};
pub use error::QueueError;
pub use iter::{IterCloser, JobIter};
pub use job::{Job, Priority};
pub use queue::Queue;
