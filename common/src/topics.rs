use serde::{Deserialize, Serialize};

pub const TOPIC_FAN_STATUS: &str = "fan/status";
pub const TOPIC_FAN_OUTPUT: &str = "fan/output";
pub const TOPIC_FAN_READ: &str = "fan/read";

pub const TOPIC_SENSOR_TEMP: &str = "sensors/dht11/temp";
pub const TOPIC_SENSOR_HUMIDITY: &str = "sensors/dht11/humidity";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicBindings {
    pub status: String,
    pub output: String,
    pub read_back: String,
    pub temperature: String,
    pub humidity: String,
}

impl Default for TopicBindings {
    fn default() -> Self {
        Self {
            status: TOPIC_FAN_STATUS.to_string(),
            output: TOPIC_FAN_OUTPUT.to_string(),
            read_back: TOPIC_FAN_READ.to_string(),
            temperature: TOPIC_SENSOR_TEMP.to_string(),
            humidity: TOPIC_SENSOR_HUMIDITY.to_string(),
        }
    }
}

impl TopicBindings {
    pub fn command_topics(&self) -> [&str; 2] {
        [self.status.as_str(), self.output.as_str()]
    }

    /// Blank bindings fall back to the defaults.
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        for (value, fallback) in [
            (&mut self.status, defaults.status),
            (&mut self.output, defaults.output),
            (&mut self.read_back, defaults.read_back),
            (&mut self.temperature, defaults.temperature),
            (&mut self.humidity, defaults.humidity),
        ] {
            if value.trim().is_empty() {
                *value = fallback;
            }
        }
    }
}
