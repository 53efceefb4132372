use std::sync::{Arc, Mutex, PoisonError};

use crate::{
    connectivity::ConnectionWatch,
    types::{FanCommandState, NodeCounters, NodeStatus, TelemetryReading},
};

// Never held across a blocking driver call.
#[derive(Debug, Clone)]
pub struct StatusBoard {
    fan: Arc<Mutex<FanCommandState>>,
    counters: Arc<Mutex<NodeCounters>>,
    last_telemetry: Arc<Mutex<Option<TelemetryReading>>>,
}

impl StatusBoard {
    pub fn new(default_on_duty: u8) -> Self {
        Self {
            fan: Arc::new(Mutex::new(FanCommandState::new(default_on_duty))),
            counters: Arc::default(),
            last_telemetry: Arc::default(),
        }
    }

    pub fn fan(&self) -> FanCommandState {
        *self.fan.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn update_fan<R>(&self, update: impl FnOnce(&mut FanCommandState) -> R) -> R {
        let mut fan = self.fan.lock().unwrap_or_else(PoisonError::into_inner);
        update(&mut fan)
    }

    pub fn counters(&self) -> NodeCounters {
        *self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, update: impl FnOnce(&mut NodeCounters)) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        update(&mut counters);
    }

    pub fn last_telemetry(&self) -> Option<TelemetryReading> {
        *self
            .last_telemetry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_last_telemetry(&self, reading: TelemetryReading) {
        *self
            .last_telemetry
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reading);
    }

    pub fn snapshot(&self, connection: &ConnectionWatch) -> NodeStatus {
        let (state, retry_count) = connection.snapshot();
        NodeStatus {
            connection: state.as_str(),
            retry_count,
            fan: self.fan(),
            last_telemetry: self.last_telemetry(),
            counters: self.counters(),
        }
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new(FanCommandState::default().last_on_duty)
    }
}
