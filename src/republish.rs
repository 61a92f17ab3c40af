//! Draining of a buried queue and re-burial of whatever could not go back.

use crate::condition::{comply, RepublishCondition};
use crate::config::Configuration;
use crate::error::{QueueError, Result};
use crate::job::{Job, Malformed};
use async_trait::async_trait;
use lapin::BasicProperties;

/// One delivery taken off the buried queue.
pub(crate) enum Fetched {
    Job(Job),
    Malformed(Malformed),
}

/// A source of buried deliveries that never waits.
pub(crate) trait Fetch: Send {
    fn try_fetch(&mut self) -> Result<Option<Fetched>>;
}

/// A destination queue.
#[async_trait]
pub(crate) trait Publish: Send + Sync {
    /// Publishes a job after validating it.
    async fn publish_job(&self, job: &Job) -> Result<()>;

    /// Publishes a message as is.
    async fn publish_message(&self, properties: BasicProperties, data: &[u8]) -> Result<()>;
}

/// What a drain of the buried queue left to clean up.
#[derive(Default)]
pub(crate) struct Drained {
    pub(crate) republished: usize,
    pub(crate) not_complying: Vec<Job>,
    pub(crate) failed: Vec<(Job, QueueError)>,
    pub(crate) malformed: Vec<Malformed>,
    pub(crate) error: Option<QueueError>,
}

/// Takes buried deliveries one at a time, acks each, and publishes the jobs
/// satisfying `conditions` to `main`. Stops once the source stays empty for
/// more than `buried_non_blocking_retries` polls, or on the first fetch or
/// ack failure.
pub(crate) async fn drain<F, P>(
    source: &mut F,
    main: &P,
    conditions: &[RepublishCondition],
    config: &Configuration,
) -> Drained
where
    F: Fetch,
    P: Publish,
{
    let mut drained = Drained::default();
    let mut empty_polls = 0;

    loop {
        let job = match source.try_fetch() {
            Ok(Some(Fetched::Job(job))) => job,
            Ok(Some(Fetched::Malformed(message))) => {
                empty_polls = 0;
                if let Err(e) = message.acknowledger.ack().await {
                    drained.error = Some(e);
                    break;
                }
                log::warn!(
                    "Buried message {} cannot be decoded: {}",
                    message.message_id(),
                    message.error
                );
                drained.malformed.push(message);
                continue;
            }
            Ok(None) => {
                // A job may still be on its way; give up after a few polls.
                if empty_polls > config.buried_non_blocking_retries {
                    break;
                }
                tokio::time::sleep(config.buried_poll_interval).await;
                empty_polls += 1;
                continue;
            }
            Err(e) => {
                drained.error = Some(e);
                break;
            }
        };
        empty_polls = 0;

        if let Err(e) = job.ack().await {
            drained.error = Some(e);
            break;
        }

        if !comply(conditions, &job) {
            drained.not_complying.push(job);
            continue;
        }

        match main.publish_job(&job).await {
            Ok(()) => drained.republished += 1,
            Err(e) => {
                log::warn!("Failed to republish buried job {}: {}", job.id, e);
                drained.failed.push((job, e));
            }
        }
    }

    drained
}

/// Publishes everything `drain` took but did not republish back to `buried`.
///
/// Jobs go back exactly as they were taken, without the validation a
/// republish applies, so whatever made a republish fail cannot also lose the
/// job. Every job is attempted. Failed republishes and undecodable messages
/// are reported together as `RepublishFailed`, after all of them were buried
/// again. A drain error takes precedence over that report.
pub(crate) async fn bury_again<P: Publish>(
    buried: &P,
    drained: Drained,
    config: &Configuration,
) -> Result<()> {
    let Drained { not_complying, failed, malformed, error, .. } = drained;
    let mut errors = Vec::new();

    for job in &not_complying {
        if let Err(e) = buried.publish_message(job.message_properties(config), &job.raw).await {
            log::error!("Job {} could not be buried again: {}", job.id, e);
            errors.push(format!("job {} could not be buried again: {}", job.id, e));
        }
    }

    for (job, err) in &failed {
        errors.push(format!("job {}: {}", job.id, err));
        if let Err(e) = buried.publish_message(job.message_properties(config), &job.raw).await {
            log::error!("Job {} could not be buried again: {}", job.id, e);
            errors.push(format!("job {} could not be buried again: {}", job.id, e));
        }
    }

    for message in malformed {
        let id = message.message_id();
        errors.push(message.error.to_string());
        if let Err(e) = buried.publish_message(message.properties, &message.data).await {
            log::error!("Message {} could not be buried again: {}", id, e);
            errors.push(format!("message {} could not be buried again: {}", id, e));
        }
    }

    if let Some(e) = error {
        return Err(e);
    }
    if !errors.is_empty() {
        return Err(QueueError::RepublishFailed(errors.join(": ")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acknowledger::Acknowledger;
    use lapin::types::{AMQPValue, FieldTable};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct CountingAcknowledger {
        acks: Mutex<usize>,
    }

    #[async_trait]
    impl Acknowledger for CountingAcknowledger {
        async fn ack(&self) -> Result<()> {
            *self.acks.lock().unwrap() += 1;
            Ok(())
        }

        async fn reject(&self, _requeue: bool) -> Result<()> {
            Err(QueueError::CannotAck)
        }
    }

    /// Hands out queued deliveries, then reports an empty queue.
    #[derive(Default)]
    struct Buffered {
        deliveries: VecDeque<Fetched>,
        polls: usize,
    }

    impl Fetch for Buffered {
        fn try_fetch(&mut self) -> Result<Option<Fetched>> {
            self.polls += 1;
            Ok(self.deliveries.pop_front())
        }
    }

    /// Records the message ids it receives; refuses jobs listed in `failing`.
    #[derive(Default)]
    struct Recorder {
        failing: Vec<String>,
        ids: Mutex<Vec<String>>,
        messages: Mutex<Vec<(BasicProperties, Vec<u8>)>>,
    }

    impl Recorder {
        fn ids(&self) -> Vec<String> {
            self.ids.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Publish for Recorder {
        async fn publish_job(&self, job: &Job) -> Result<()> {
            if self.failing.contains(&job.id) {
                return Err(QueueError::Closed);
            }
            self.ids.lock().unwrap().push(job.id.clone());
            Ok(())
        }

        async fn publish_message(&self, properties: BasicProperties, data: &[u8]) -> Result<()> {
            let id = properties.message_id().as_ref().map(|s| s.to_string()).unwrap_or_default();
            self.ids.lock().unwrap().push(id);
            self.messages.lock().unwrap().push((properties, data.to_vec()));
            Ok(())
        }
    }

    fn config() -> Configuration {
        Configuration::builder()
            .buried_non_blocking_retries(2)
            .buried_poll_interval(Duration::from_millis(1))
            .build()
    }

    fn buried_job(id: &str, retries: i32, acknowledger: &Arc<CountingAcknowledger>) -> Job {
        let mut job = Job::new();
        job.id = id.to_string();
        job.raw = id.as_bytes().to_vec();
        job.retries = retries;
        job.set_acknowledger(acknowledger.clone());
        job
    }

    fn malformed(id: &str, acknowledger: &Arc<CountingAcknowledger>) -> Malformed {
        let mut headers = FieldTable::default();
        headers.insert("x-retries".into(), AMQPValue::LongString("many".into()));
        let properties = BasicProperties::default()
            .with_message_id(id.into())
            .with_headers(headers);
        let error =
            Job::from_message(&properties, Vec::new(), &Configuration::default()).unwrap_err();

        Malformed {
            properties,
            data: id.as_bytes().to_vec(),
            acknowledger: acknowledger.clone(),
            error,
        }
    }

    #[tokio::test]
    async fn test_complying_jobs_are_acked_and_republished() {
        let acks = Arc::new(CountingAcknowledger::default());
        let mut source = Buffered::default();
        source.deliveries.push_back(Fetched::Job(buried_job("a", 0, &acks)));
        source.deliveries.push_back(Fetched::Job(buried_job("b", 5, &acks)));
        let main = Recorder::default();

        let drained = drain(&mut source, &main, &[], &config()).await;

        assert_eq!(drained.republished, 2);
        assert_eq!(main.ids(), vec!["a", "b"]);
        assert_eq!(*acks.acks.lock().unwrap(), 2);
        assert!(drained.error.is_none());
    }

    #[tokio::test]
    async fn test_drain_gives_up_after_bounded_empty_polls() {
        let mut source = Buffered::default();
        let main = Recorder::default();

        let drained = drain(&mut source, &main, &[], &config()).await;

        assert_eq!(drained.republished, 0);
        // Two retries allowed: the fourth empty poll ends the drain.
        assert_eq!(source.polls, 4);
    }

    #[tokio::test]
    async fn test_non_complying_jobs_are_buried_again() {
        let acks = Arc::new(CountingAcknowledger::default());
        let mut source = Buffered::default();
        source.deliveries.push_back(Fetched::Job(buried_job("fresh", 1, &acks)));
        source.deliveries.push_back(Fetched::Job(buried_job("stale", 9, &acks)));
        let main = Recorder::default();
        let buried = Recorder::default();

        let conditions = [RepublishCondition::retries_at_most(3)];
        let drained = drain(&mut source, &main, &conditions, &config()).await;
        bury_again(&buried, drained, &config()).await.unwrap();

        assert_eq!(main.ids(), vec!["fresh"]);
        assert_eq!(buried.ids(), vec!["stale"]);

        let messages = buried.messages.lock().unwrap();
        let (properties, data) = &messages[0];
        let restored = Job::from_message(properties, data.clone(), &config()).unwrap();
        assert_eq!(restored.retries, 9);
        assert_eq!(restored.raw, b"stale");
    }

    #[tokio::test]
    async fn test_failed_republish_is_buried_again_and_reported() {
        let acks = Arc::new(CountingAcknowledger::default());
        let mut source = Buffered::default();
        source.deliveries.push_back(Fetched::Job(buried_job("doomed", 0, &acks)));
        source.deliveries.push_back(Fetched::Job(buried_job("fine", 0, &acks)));
        let main = Recorder { failing: vec!["doomed".to_string()], ..Default::default() };
        let buried = Recorder::default();

        let drained = drain(&mut source, &main, &[], &config()).await;
        assert_eq!(drained.republished, 1);
        let err = bury_again(&buried, drained, &config()).await.unwrap_err();

        assert_eq!(buried.ids(), vec!["doomed"]);
        assert_eq!(main.ids(), vec!["fine"]);
        match err {
            QueueError::RepublishFailed(message) => {
                assert!(message.contains("job doomed: broker is closed"), "{}", message);
                assert!(!message.contains("fine"), "{}", message);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_undecodable_message_does_not_stop_the_drain() {
        let acks = Arc::new(CountingAcknowledger::default());
        let mut source = Buffered::default();
        source.deliveries.push_back(Fetched::Malformed(malformed("garbled", &acks)));
        source.deliveries.push_back(Fetched::Job(buried_job("next", 0, &acks)));
        let main = Recorder::default();
        let buried = Recorder::default();

        let drained = drain(&mut source, &main, &[], &config()).await;
        assert_eq!(*acks.acks.lock().unwrap(), 2);
        assert_eq!(main.ids(), vec!["next"]);

        let err = bury_again(&buried, drained, &config()).await.unwrap_err();
        assert_eq!(buried.ids(), vec!["garbled"]);
        let messages = buried.messages.lock().unwrap();
        assert_eq!(messages[0].1, b"garbled");
        // The message goes back untouched, headers included.
        assert!(Job::from_message(&messages[0].0, Vec::new(), &config()).is_err());
        assert!(err.to_string().contains("'x-retries' header from message garbled"));
    }

    #[tokio::test]
    async fn test_fetch_error_still_buries_collected_jobs() {
        struct Failing(Option<Job>);

        impl Fetch for Failing {
            fn try_fetch(&mut self) -> Result<Option<Fetched>> {
                match self.0.take() {
                    Some(job) => Ok(Some(Fetched::Job(job))),
                    None => Err(QueueError::AlreadyClosed),
                }
            }
        }

        let acks = Arc::new(CountingAcknowledger::default());
        let mut source = Failing(Some(buried_job("kept", 7, &acks)));
        let main = Recorder::default();
        let buried = Recorder::default();

        let conditions = [RepublishCondition::never()];
        let drained = drain(&mut source, &main, &conditions, &config()).await;
        let err = bury_again(&buried, drained, &config()).await.unwrap_err();

        assert!(matches!(err, QueueError::AlreadyClosed));
        assert_eq!(buried.ids(), vec!["kept"]);
    }
}
