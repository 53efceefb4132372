pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod error;
pub mod fan;
pub mod ports;
pub mod publisher;
pub mod router;
pub mod sampler;
pub mod shutdown;
pub mod status;
pub mod topics;
pub mod types;

#[cfg(test)]
mod test_support;

pub use config::{
    ConnectivityConfig, FanConfig, MessagingConfig, NetworkConfig, RuntimeConfig, SensorConfig,
};
pub use connectivity::{ConnectionWatch, ConnectivityManager, SupervisionEnd};
pub use coordinator::{Coordinator, SessionEnd};
pub use error::{
    CommandError, FanError, LinkError, NodeError, PublishError, PwmError, SensorError,
};
pub use fan::{FadeNotifier, FanActuator};
pub use ports::{HumiditySensor, Messaging, PwmChannel, SessionEvent, WifiLink};
pub use router::{Command, CommandRouter};
pub use sampler::SensorSampler;
pub use shutdown::Shutdown;
pub use status::StatusBoard;
pub use topics::*;
pub use types::{
    ConnectionOutcome, ConnectionState, FanCommandState, MessageId, NodeCounters, NodeStatus,
    QoS, TelemetryReading,
};
