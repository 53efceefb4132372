use std::{sync::Arc, time::Duration};

use crate::{
    config::FanConfig,
    error::{LinkError, PublishError, PwmError, SensorError},
    fan::FadeNotifier,
    types::{MessageId, QoS, TelemetryReading},
};

pub trait WifiLink: Send {
    /// Blocks until associated and addressed, or the attempt fails.
    fn connect(&mut self, ssid: &str, password: &str) -> Result<(), LinkError>;

    fn is_connected(&self) -> bool;
}

pub trait Messaging: Send + Sync {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<MessageId, PublishError>;

    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<MessageId, PublishError>;
}

impl<T: Messaging + ?Sized> Messaging for Arc<T> {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<MessageId, PublishError> {
        (**self).subscribe(topic, qos)
    }

    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<MessageId, PublishError> {
        (**self).publish(topic, payload, qos, retain)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Message { topic: String, payload: Vec<u8> },
}

// Duties are raw register values.
pub trait PwmChannel: Send {
    fn init(&mut self, config: &FanConfig) -> Result<(), PwmError>;

    /// `notify` may be called from any thread.
    fn on_fade_complete(&mut self, notifier: FadeNotifier) -> Result<(), PwmError>;

    fn set_fade_target(&mut self, raw_duty: u32, duration: Duration) -> Result<(), PwmError>;

    fn set_duty_immediate(&mut self, raw_duty: u32) -> Result<(), PwmError>;
}

pub trait HumiditySensor: Send {
    fn read(&mut self) -> Result<TelemetryReading, SensorError>;
}
