use thiserror::Error;

/// Error type for every queue, broker and job operation.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Error originating from the underlying `lapin` library.
    #[error("RabbitMQ communication error: {0}")]
    Lapin(#[from] lapin::Error),

    /// The initial connection to the broker could not be established.
    #[error("failed to connect to RabbitMQ: {0}")]
    ConnectionFailed(#[source] lapin::Error),

    /// A channel could not be opened on the current connection.
    #[error("failed to open a channel: {0}")]
    OpenChannel(#[source] lapin::Error),

    /// A job without payload was handed to a publish operation.
    #[error("invalid empty job")]
    EmptyJob,

    /// The delivery stream of a job iterator has ended.
    #[error("already closed")]
    AlreadyClosed,

    /// The broker was closed; no further operations are possible.
    #[error("broker is closed")]
    Closed,

    /// `republish_buried` was called on a queue without a buried queue.
    #[error("queue '{0}' has no buried queue, called republish_buried on a buried queue?")]
    NoBuriedQueue(String),

    /// The job was not obtained from a consumer and cannot be acked or rejected.
    #[error("cannot acknowledge a job that was not consumed")]
    CannotAck,

    /// A known header was present on a delivery with an unexpected type.
    #[error("error retrieving '{header}' header from message {message_id}")]
    BadHeader { header: String, message_id: String },

    /// Some buried jobs could not be republished; they were buried again.
    #[error("couldn't republish some jobs: {0}")]
    RepublishFailed(String),

    /// Payload serialization or deserialization failure.
    #[error("failed to encode or decode job payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// A configuration value could not be parsed.
    #[error("invalid configuration value for {key}: {message}")]
    Config { key: String, message: String },

    /// Error returned by a transaction callback.
    #[error("transaction callback failed: {0}")]
    Callback(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl From<&str> for QueueError {
    fn from(s: &str) -> Self {
        QueueError::Callback(s.into())
    }
}

impl From<String> for QueueError {
    fn from(s: String) -> Self {
        QueueError::Callback(s.into())
    }
}

pub type Result<T, E = QueueError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_header_names_header_and_message() {
        let err = QueueError::BadHeader {
            header: "x-retries".to_string(),
            message_id: "abc".to_string(),
        };
        assert_eq!(err.to_string(), "error retrieving 'x-retries' header from message abc");
    }

    #[test]
    fn test_string_conversion_is_a_callback_error() {
        let err = QueueError::from("boom");
        assert!(matches!(err, QueueError::Callback(_)));
        assert_eq!(err.to_string(), "transaction callback failed: boom");
    }
}
