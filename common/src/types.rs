use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOutcome {
    Connected,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Self::AtMostOnce,
            1 => Self::AtLeastOnce,
            _ => Self::ExactlyOnce,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FanCommandState {
    #[serde(rename = "isOn")]
    pub is_on: bool,
    #[serde(rename = "lastOnDuty")]
    pub last_on_duty: u8,
    #[serde(rename = "currentTargetDuty")]
    pub current_target_duty: u8,
}

impl FanCommandState {
    pub fn new(default_on_duty: u8) -> Self {
        Self {
            is_on: false,
            last_on_duty: default_on_duty.min(100),
            current_target_duty: 0,
        }
    }
}

impl Default for FanCommandState {
    fn default() -> Self {
        Self::new(80)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FadeRequest {
    pub target_percent: u8,
    pub target_raw: u32,
    pub fade_duration: Duration,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeOutcome {
    Completed,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TelemetryReading {
    pub humidity: f32,
    pub temperature: f32,
}

impl TelemetryReading {
    pub fn humidity_payload(&self) -> String {
        format!("{:.1}", self.humidity)
    }

    pub fn temperature_payload(&self) -> String {
        format!("{:.1}", self.temperature)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeCounters {
    #[serde(rename = "commandsApplied")]
    pub commands_applied: u64,
    #[serde(rename = "commandsRejected")]
    pub commands_rejected: u64,
    #[serde(rename = "fadeTimeouts")]
    pub fade_timeouts: u64,
    #[serde(rename = "sensorFailures")]
    pub sensor_failures: u64,
    #[serde(rename = "publishFailures")]
    pub publish_failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub connection: &'static str,
    #[serde(rename = "retryCount")]
    pub retry_count: u32,
    pub fan: FanCommandState,
    #[serde(rename = "lastTelemetry")]
    pub last_telemetry: Option<TelemetryReading>,
    pub counters: NodeCounters,
}
