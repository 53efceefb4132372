use log::{debug, info, warn};

use crate::{
    config::MessagingConfig,
    ports::Messaging,
    status::StatusBoard,
    types::{MessageId, QoS},
};

// Failures are logged and counted, never retried.
#[derive(Clone)]
pub struct Publisher<M> {
    messaging: M,
    qos: QoS,
    retain: bool,
    board: StatusBoard,
}

impl<M: Messaging> Publisher<M> {
    pub fn new(messaging: M, config: &MessagingConfig, board: StatusBoard) -> Self {
        Self {
            messaging,
            qos: config.publish_qos(),
            retain: config.retain,
            board,
        }
    }

    pub fn text(&self, topic: &str, payload: &str) -> Option<MessageId> {
        match self
            .messaging
            .publish(topic, payload.as_bytes(), self.qos, self.retain)
        {
            Ok(id) => {
                debug!("publish sent: topic {topic}, msg_id {}: {payload}", id.0);
                Some(id)
            }
            Err(err) => {
                warn!("publish failed: topic {topic}, payload {payload:?}: {err}");
                self.board.record(|counters| counters.publish_failures += 1);
                None
            }
        }
    }

    pub fn subscribe(&self, topic: &str) -> Option<MessageId> {
        match self.messaging.subscribe(topic, self.qos) {
            Ok(id) => {
                info!("subscribed to {topic}, msg_id={}", id.0);
                Some(id)
            }
            Err(err) => {
                warn!("subscribe to {topic} failed: {err}");
                None
            }
        }
    }
}
