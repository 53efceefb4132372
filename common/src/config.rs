use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{topics::TopicBindings, types::QoS};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FanConfig {
    pub fade_duration_ms: u64,
    pub fade_timeout_margin_ms: u64,
    pub default_on_duty: u8,
    pub pwm_frequency_hz: u32,
    pub resolution_bits: u8,
    pub output_gpio: i32,
}

impl Default for FanConfig {
    fn default() -> Self {
        Self {
            fade_duration_ms: 1_000,
            fade_timeout_margin_ms: 200,
            default_on_duty: 80,
            pwm_frequency_hz: 5_000,
            resolution_bits: 13,
            output_gpio: 18,
        }
    }
}

impl FanConfig {
    pub fn fade_duration(&self) -> Duration {
        Duration::from_millis(self.fade_duration_ms)
    }

    pub fn fade_timeout(&self) -> Duration {
        Duration::from_millis(self.fade_duration_ms + self.fade_timeout_margin_ms)
    }

    pub fn max_raw_duty(&self) -> u32 {
        1_u32
            .checked_shl(u32::from(self.resolution_bits))
            .map_or(u32::MAX, |full| full - 1)
    }

    pub fn sanitize(&mut self) {
        self.fade_duration_ms = self.fade_duration_ms.clamp(50, 10_000);
        self.fade_timeout_margin_ms = self.fade_timeout_margin_ms.clamp(10, 5_000);
        self.default_on_duty = self.default_on_duty.min(100);
        self.pwm_frequency_hz = self.pwm_frequency_hz.clamp(100, 40_000);
        self.resolution_bits = self.resolution_bits.clamp(1, 20);
        if self.output_gpio < 0 {
            self.output_gpio = 18;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub sample_period_ms: u64,
    pub data_gpio: i32,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            sample_period_ms: 5_000,
            data_gpio: 4,
        }
    }
}

impl SensorConfig {
    pub fn sample_period(&self) -> Duration {
        Duration::from_millis(self.sample_period_ms)
    }

    pub fn sanitize(&mut self) {
        // DHT11 cannot be polled faster than once per second.
        self.sample_period_ms = self.sample_period_ms.max(1_000);
        if self.data_gpio < 0 {
            self.data_gpio = 4;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub health_check_interval_ms: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            retry_delay_ms: 1_000,
            health_check_interval_ms: 1_000,
        }
    }
}

impl ConnectivityConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn sanitize(&mut self) {
        self.max_retries = self.max_retries.min(100);
        self.retry_delay_ms = self.retry_delay_ms.min(60_000);
        self.health_check_interval_ms = self.health_check_interval_ms.clamp(100, 60_000);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    pub qos: u8,
    pub retain: bool,
    pub max_payload_bytes: usize,
    pub inbound_queue_depth: usize,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            qos: 0,
            retain: false,
            max_payload_bytes: 512,
            inbound_queue_depth: 16,
        }
    }
}

impl MessagingConfig {
    pub fn publish_qos(&self) -> QoS {
        QoS::from_level(self.qos)
    }

    pub fn sanitize(&mut self) {
        self.qos = self.qos.min(2);
        self.max_payload_bytes = self.max_payload_bytes.clamp(16, 4_096);
        self.inbound_queue_depth = self.inbound_queue_depth.clamp(1, 256);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_client_id: String,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_client_id: "esp32-fan-node".to_string(),
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        if self.mqtt_port == 0 {
            self.mqtt_port = 1883;
        }
        if self.mqtt_client_id.trim().is_empty() {
            self.mqtt_client_id = Self::default().mqtt_client_id;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub network: NetworkConfig,
    pub topics: TopicBindings,
    pub fan: FanConfig,
    pub sensor: SensorConfig,
    pub connectivity: ConnectivityConfig,
    pub messaging: MessagingConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.network.sanitize();
        self.topics.sanitize();
        self.fan.sanitize();
        self.sensor.sanitize();
        self.connectivity.sanitize();
        self.messaging.sanitize();
    }
}
