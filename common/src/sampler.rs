use log::{info, warn};

use crate::{
    config::SensorConfig,
    ports::{HumiditySensor, Messaging},
    publisher::Publisher,
    shutdown::Shutdown,
    status::StatusBoard,
    topics::TopicBindings,
    types::TelemetryReading,
};

pub struct SensorSampler<S, M> {
    sensor: S,
    publisher: Publisher<M>,
    topics: TopicBindings,
    board: StatusBoard,
    config: SensorConfig,
}

impl<S: HumiditySensor, M: Messaging> SensorSampler<S, M> {
    pub fn new(
        sensor: S,
        publisher: Publisher<M>,
        topics: TopicBindings,
        config: SensorConfig,
        board: StatusBoard,
    ) -> Self {
        Self {
            sensor,
            publisher,
            topics,
            board,
            config,
        }
    }

    // Humidity goes out before temperature.
    pub fn sample_once(&mut self) -> Option<TelemetryReading> {
        let reading = match self.sensor.read() {
            Ok(reading) => reading,
            Err(err) => {
                warn!("sensor read failed: {err}");
                self.board.record(|counters| counters.sensor_failures += 1);
                return None;
            }
        };

        info!(
            "humidity: {:.1}%, temperature: {:.1}C",
            reading.humidity, reading.temperature
        );
        self.publisher
            .text(&self.topics.humidity, &reading.humidity_payload());
        self.publisher
            .text(&self.topics.temperature, &reading.temperature_payload());
        self.board.set_last_telemetry(reading);
        Some(reading)
    }

    /// The first read happens one full period after start.
    pub fn run(mut self, shutdown: &Shutdown) {
        info!(
            "sensor sampling every {} ms",
            self.config.sample_period().as_millis()
        );
        while !shutdown.wait_timeout(self.config.sample_period()) {
            self.sample_once();
        }
        info!("sensor sampling stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        config::MessagingConfig,
        error::SensorError,
        test_support::{reading, RecordingMessaging, ScriptedSensor},
        topics::{TOPIC_SENSOR_HUMIDITY, TOPIC_SENSOR_TEMP},
    };

    fn sampler(
        sensor: ScriptedSensor,
        messaging: Arc<RecordingMessaging>,
        board: StatusBoard,
        period_ms: u64,
    ) -> SensorSampler<ScriptedSensor, Arc<RecordingMessaging>> {
        let publisher = Publisher::new(messaging, &MessagingConfig::default(), board.clone());
        SensorSampler::new(
            sensor,
            publisher,
            TopicBindings::default(),
            SensorConfig {
                sample_period_ms: period_ms,
                ..SensorConfig::default()
            },
            board,
        )
    }

    #[test]
    fn publishes_humidity_then_temperature_with_one_decimal() {
        let messaging = RecordingMessaging::new();
        let board = StatusBoard::default();
        let sensor = ScriptedSensor::new(vec![Ok(reading(45.0, 23.0))]);
        let mut sampler = sampler(sensor, messaging.clone(), board.clone(), 5_000);

        assert_eq!(sampler.sample_once(), Some(reading(45.0, 23.0)));

        let published: Vec<_> = messaging
            .published()
            .into_iter()
            .map(|message| (message.topic, message.payload))
            .collect();
        assert_eq!(
            published,
            vec![
                (TOPIC_SENSOR_HUMIDITY.to_string(), "45.0".to_string()),
                (TOPIC_SENSOR_TEMP.to_string(), "23.0".to_string()),
            ]
        );
        assert_eq!(board.last_telemetry(), Some(reading(45.0, 23.0)));
    }

    #[test]
    fn failed_reads_publish_nothing() {
        let messaging = RecordingMessaging::new();
        let board = StatusBoard::default();
        let sensor = ScriptedSensor::new(vec![
            Err(SensorError::Timeout),
            Err(SensorError::Checksum),
            Err(SensorError::Timeout),
            Ok(reading(51.5, 19.0)),
        ]);
        let mut sampler = sampler(sensor, messaging.clone(), board.clone(), 5_000);

        for _ in 0..4 {
            sampler.sample_once();
        }

        assert_eq!(messaging.payloads_on(TOPIC_SENSOR_HUMIDITY), vec!["51.5"]);
        assert_eq!(messaging.payloads_on(TOPIC_SENSOR_TEMP), vec!["19.0"]);
        assert_eq!(board.counters().sensor_failures, 3);
    }

    #[test]
    fn run_samples_periodically_until_shutdown() {
        let messaging = RecordingMessaging::new();
        let sensor = ScriptedSensor::new(vec![Ok(reading(40.0, 20.0)); 100]);
        let sampler = sampler(sensor.clone(), messaging, StatusBoard::default(), 10);
        let shutdown = Shutdown::new();
        let stopper = shutdown.clone();

        let handle = thread::spawn(move || sampler.run(&shutdown));
        thread::sleep(Duration::from_millis(100));
        stopper.trigger();
        handle.join().unwrap();

        let reads = sensor.reads();
        assert!(reads >= 2, "expected periodic reads, got {reads}");
        thread::sleep(Duration::from_millis(30));
        assert_eq!(sensor.reads(), reads);
    }

    #[test]
    fn run_waits_one_period_before_first_read() {
        let messaging = RecordingMessaging::new();
        let sensor = ScriptedSensor::new(vec![Ok(reading(40.0, 20.0))]);
        let sampler = sampler(sensor.clone(), messaging, StatusBoard::default(), 5_000);
        let shutdown = Shutdown::new();
        shutdown.trigger();

        sampler.run(&shutdown);

        assert_eq!(sensor.reads(), 0);
    }
}
