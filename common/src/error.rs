use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("association with `{ssid}` failed: {reason}")]
    AssociationFailed { ssid: String, reason: String },
    #[error("link driver error: {0}")]
    Driver(String),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("messaging client rejected request on `{topic}`: {reason}")]
    Rejected { topic: String, reason: String },
    #[error("messaging session is not connected")]
    NotConnected,
}

#[derive(Debug, Error)]
pub enum PwmError {
    #[error("pwm driver call `{call}` failed with code {code}")]
    Driver { call: &'static str, code: i32 },
    #[error("pwm channel already initialized")]
    AlreadyInitialized,
}

#[derive(Debug, Error)]
pub enum FanError {
    #[error("fan pwm initialization failed: {0}")]
    Init(#[source] PwmError),
    #[error("fan fade command failed: {0}")]
    Pwm(#[from] PwmError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("sensor timed out")]
    Timeout,
    #[error("sensor checksum mismatch")]
    Checksum,
    #[error("sensor bus error: {0}")]
    Bus(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("invalid payload for {topic}: {payload:?}")]
    InvalidStatus { topic: String, payload: String },
    #[error("invalid duty for {topic}: {payload:?}")]
    InvalidDuty { topic: String, payload: String },
    #[error("unhandled topic: {0}")]
    UnhandledTopic(String),
    #[error("non utf8 payload on {0}")]
    NonUtf8(String),
    #[error("oversized payload on {topic} ({len} bytes)")]
    Oversized { topic: String, len: usize },
}

/// Bootstrap failures only.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Fan(#[from] FanError),
    #[error("messaging client could not be started: {0}")]
    Messaging(String),
    #[error("failed to spawn `{name}` thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}
