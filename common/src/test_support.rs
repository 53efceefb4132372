//! In-memory drivers for exercising the node without hardware.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use crate::{
    config::{ConnectivityConfig, FanConfig},
    error::{LinkError, PublishError, PwmError, SensorError},
    fan::FadeNotifier,
    ports::{HumiditySensor, Messaging, PwmChannel, WifiLink},
    types::{MessageId, QoS, TelemetryReading},
};

pub fn fast_fan_config() -> FanConfig {
    FanConfig {
        fade_duration_ms: 5,
        fade_timeout_margin_ms: 20,
        ..FanConfig::default()
    }
}

pub fn fast_connectivity_config(max_retries: u32) -> ConnectivityConfig {
    ConnectivityConfig {
        max_retries,
        retry_delay_ms: 0,
        health_check_interval_ms: 5,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeBehavior {
    Complete,
    Drop,
}

#[derive(Default)]
struct PwmInner {
    notifier: Option<FadeNotifier>,
    actual_raw: u32,
    fade_targets: Vec<u32>,
    immediate_writes: Vec<u32>,
    init_calls: u32,
}

#[derive(Clone)]
pub struct FakePwm {
    behavior: FadeBehavior,
    fail_init: bool,
    inner: Arc<Mutex<PwmInner>>,
}

impl FakePwm {
    pub fn new(behavior: FadeBehavior) -> Self {
        Self {
            behavior,
            fail_init: false,
            inner: Arc::default(),
        }
    }

    pub fn failing_init() -> Self {
        Self {
            fail_init: true,
            ..Self::new(FadeBehavior::Complete)
        }
    }

    pub fn actual_raw(&self) -> u32 {
        self.inner.lock().unwrap().actual_raw
    }

    pub fn fade_targets(&self) -> Vec<u32> {
        self.inner.lock().unwrap().fade_targets.clone()
    }

    pub fn immediate_writes(&self) -> Vec<u32> {
        self.inner.lock().unwrap().immediate_writes.clone()
    }

    pub fn init_calls(&self) -> u32 {
        self.inner.lock().unwrap().init_calls
    }

    pub fn fire_completion(&self) {
        if let Some(notifier) = &self.inner.lock().unwrap().notifier {
            notifier.notify();
        }
    }
}

impl PwmChannel for FakePwm {
    fn init(&mut self, _config: &FanConfig) -> Result<(), PwmError> {
        if self.fail_init {
            return Err(PwmError::Driver {
                call: "ledc_timer_config",
                code: -1,
            });
        }
        self.inner.lock().unwrap().init_calls += 1;
        Ok(())
    }

    fn on_fade_complete(&mut self, notifier: FadeNotifier) -> Result<(), PwmError> {
        self.inner.lock().unwrap().notifier = Some(notifier);
        Ok(())
    }

    fn set_fade_target(&mut self, raw_duty: u32, _duration: Duration) -> Result<(), PwmError> {
        let mut inner = self.inner.lock().unwrap();
        inner.fade_targets.push(raw_duty);
        if self.behavior == FadeBehavior::Complete {
            inner.actual_raw = raw_duty;
            if let Some(notifier) = &inner.notifier {
                notifier.notify();
            }
        }
        Ok(())
    }

    fn set_duty_immediate(&mut self, raw_duty: u32) -> Result<(), PwmError> {
        let mut inner = self.inner.lock().unwrap();
        inner.immediate_writes.push(raw_duty);
        inner.actual_raw = raw_duty;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Default)]
pub struct RecordingMessaging {
    published: Mutex<Vec<Published>>,
    subscriptions: Mutex<Vec<String>>,
    fail_publish: AtomicBool,
    next_id: AtomicU32,
}

impl RecordingMessaging {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    pub fn payloads_on(&self, topic: &str) -> Vec<String> {
        self.published()
            .into_iter()
            .filter(|message| message.topic == topic)
            .map(|message| message.payload)
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.published.lock().unwrap().clear();
    }
}

impl Messaging for RecordingMessaging {
    fn subscribe(&self, topic: &str, _qos: QoS) -> Result<MessageId, PublishError> {
        self.subscriptions.lock().unwrap().push(topic.to_string());
        Ok(MessageId(self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<MessageId, PublishError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(PublishError::NotConnected);
        }
        self.published.lock().unwrap().push(Published {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
            qos,
            retain,
        });
        Ok(MessageId(self.next_id.fetch_add(1, Ordering::SeqCst)))
    }
}

#[derive(Clone, Default)]
pub struct ScriptedSensor {
    script: Arc<Mutex<VecDeque<Result<TelemetryReading, SensorError>>>>,
    reads: Arc<AtomicU32>,
}

impl ScriptedSensor {
    pub fn new(script: Vec<Result<TelemetryReading, SensorError>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            reads: Arc::default(),
        }
    }

    pub fn reads(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }
}

impl HumiditySensor for ScriptedSensor {
    fn read(&mut self) -> Result<TelemetryReading, SensorError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(SensorError::Timeout))
    }
}

// An empty script falls back to `default_outcome`.
#[derive(Clone)]
pub struct ScriptedLink {
    script: Arc<Mutex<VecDeque<bool>>>,
    default_outcome: bool,
    connected: Arc<AtomicBool>,
    connect_calls: Arc<AtomicU32>,
}

impl ScriptedLink {
    pub fn new(script: Vec<bool>, default_outcome: bool) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            default_outcome,
            connected: Arc::default(),
            connect_calls: Arc::default(),
        }
    }

    pub fn always_failing() -> Self {
        Self::new(Vec::new(), false)
    }

    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn push_outcomes(&self, outcomes: &[bool]) {
        self.script.lock().unwrap().extend(outcomes.iter().copied());
    }
}

impl WifiLink for ScriptedLink {
    fn connect(&mut self, ssid: &str, _password: &str) -> Result<(), LinkError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.default_outcome);
        self.connected.store(outcome, Ordering::SeqCst);
        if outcome {
            Ok(())
        } else {
            Err(LinkError::AssociationFailed {
                ssid: ssid.to_string(),
                reason: "scripted failure".to_string(),
            })
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

pub fn reading(humidity: f32, temperature: f32) -> TelemetryReading {
    TelemetryReading {
        humidity,
        temperature,
    }
}
