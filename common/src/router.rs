use log::{info, warn};

use crate::{
    config::MessagingConfig,
    error::{CommandError, FanError},
    fan::FanActuator,
    ports::{Messaging, PwmChannel, SessionEvent},
    publisher::Publisher,
    status::StatusBoard,
    topics::TopicBindings,
    types::{FadeOutcome, FanCommandState},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    FanOn,
    FanOff,
    // `raw` is echoed on the read-back topic as received.
    SetDuty { duty: u8, raw: String },
}

impl Command {
    pub fn parse(topics: &TopicBindings, topic: &str, payload: &str) -> Result<Self, CommandError> {
        if topic == topics.status {
            return match payload {
                "ON" => Ok(Self::FanOn),
                "OFF" => Ok(Self::FanOff),
                _ => Err(CommandError::InvalidStatus {
                    topic: topic.to_string(),
                    payload: payload.to_string(),
                }),
            };
        }

        if topic == topics.output {
            return match payload.trim().parse::<i32>() {
                Ok(duty) if (0..=100).contains(&duty) => Ok(Self::SetDuty {
                    duty: duty as u8,
                    raw: payload.to_string(),
                }),
                _ => Err(CommandError::InvalidDuty {
                    topic: topic.to_string(),
                    payload: payload.to_string(),
                }),
            };
        }

        Err(CommandError::UnhandledTopic(topic.to_string()))
    }
}

/// Runs on the dispatch thread only. A fade blocks that thread, so fan
/// commands apply strictly in arrival order.
pub struct CommandRouter<P, M> {
    fan: FanActuator<P>,
    publisher: Publisher<M>,
    topics: TopicBindings,
    board: StatusBoard,
    max_payload_bytes: usize,
}

impl<P: PwmChannel, M: Messaging> CommandRouter<P, M> {
    pub fn new(
        fan: FanActuator<P>,
        messaging: M,
        topics: TopicBindings,
        messaging_config: &MessagingConfig,
        board: StatusBoard,
    ) -> Self {
        Self {
            fan,
            publisher: Publisher::new(messaging, messaging_config, board.clone()),
            topics,
            board,
            max_payload_bytes: messaging_config.max_payload_bytes,
        }
    }

    pub fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected => self.on_connected(),
            SessionEvent::Disconnected => info!("messaging session disconnected"),
            SessionEvent::Message { topic, payload } => self.on_message(&topic, &payload),
        }
    }

    pub fn on_connected(&mut self) {
        info!("messaging session connected");
        for topic in self.topics.command_topics() {
            self.publisher.subscribe(topic);
        }

        for topic in [
            &self.topics.read_back,
            &self.topics.temperature,
            &self.topics.humidity,
        ] {
            self.publisher.text(topic, "0");
        }
    }

    pub fn on_message(&mut self, topic: &str, payload: &[u8]) {
        if !self.topics.command_topics().contains(&topic) {
            warn!("unhandled topic: {topic}");
            return;
        }

        let parsed = self.decode(topic, payload).and_then(|message| {
            info!("processing {topic}: {message}");
            Command::parse(&self.topics, topic, message)
        });

        match parsed {
            Ok(command) => {
                self.board.record(|counters| counters.commands_applied += 1);
                self.apply(command);
            }
            Err(err) => {
                warn!("{err}");
                self.board.record(|counters| counters.commands_rejected += 1);
            }
        }
    }

    pub fn fan_state(&self) -> FanCommandState {
        self.board.fan()
    }

    pub fn applied_duty(&self) -> u8 {
        self.fan.applied_percent()
    }

    fn decode<'a>(&self, topic: &str, payload: &'a [u8]) -> Result<&'a str, CommandError> {
        if payload.len() > self.max_payload_bytes {
            return Err(CommandError::Oversized {
                topic: topic.to_string(),
                len: payload.len(),
            });
        }
        core::str::from_utf8(payload).map_err(|_| CommandError::NonUtf8(topic.to_string()))
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::FanOn => {
                let duty = self.board.update_fan(|fan| {
                    fan.is_on = true;
                    fan.current_target_duty = fan.last_on_duty;
                    fan.last_on_duty
                });
                let result = self.fan.turn_on(duty);
                self.settle(result);
                // Acknowledged whether or not the fade completed.
                self.publisher.text(&self.topics.read_back, &duty.to_string());
            }
            Command::FanOff => {
                self.board.update_fan(|fan| {
                    fan.is_on = false;
                    fan.current_target_duty = 0;
                });
                let result = self.fan.turn_off();
                self.settle(result);
            }
            Command::SetDuty { duty, raw } => {
                let is_on = self.board.update_fan(|fan| {
                    fan.last_on_duty = duty;
                    if fan.is_on {
                        fan.current_target_duty = duty;
                    }
                    fan.is_on
                });
                if is_on {
                    let result = self.fan.set_duty_fade(i32::from(duty));
                    self.settle(result);
                }
                // Echoes the last requested duty, even while the fan is off.
                self.publisher.text(&self.topics.read_back, &raw);
            }
        }
    }

    fn settle(&self, result: Result<FadeOutcome, FanError>) {
        match result {
            Ok(FadeOutcome::Completed) => {}
            Ok(FadeOutcome::TimedOut) => {
                self.board.record(|counters| counters.fade_timeouts += 1);
            }
            Err(err) => warn!("fan actuation failed: {err}"),
        }
    }
}
