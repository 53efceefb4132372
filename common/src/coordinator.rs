use std::thread::{self, JoinHandle};

use log::{error, info, warn};

use crate::{
    config::RuntimeConfig,
    connectivity::{ConnectionWatch, ConnectivityManager, SupervisionEnd},
    error::NodeError,
    fan::FanActuator,
    ports::{HumiditySensor, Messaging, PwmChannel, SessionEvent, WifiLink},
    publisher::Publisher,
    router::CommandRouter,
    sampler::SensorSampler,
    shutdown::Shutdown,
    status::StatusBoard,
    types::ConnectionOutcome,
};

const DISPATCH_STACK_SIZE: usize = 8 * 1024;
const SAMPLER_STACK_SIZE: usize = 4 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Stopped,
    ConnectivityFailed,
    // Sampling is stopped; the fan holds its last duty.
    ConnectivityLost,
}

/// PWM, then WiFi, then the messaging session, then sampling.
pub struct Coordinator<L, P, S> {
    config: RuntimeConfig,
    connectivity: ConnectivityManager<L>,
    pwm: P,
    sensor: S,
    board: StatusBoard,
    shutdown: Shutdown,
}

impl<L, P, S> Coordinator<L, P, S>
where
    L: WifiLink,
    P: PwmChannel + 'static,
    S: HumiditySensor + 'static,
{
    pub fn new(mut config: RuntimeConfig, link: L, pwm: P, sensor: S) -> Self {
        config.sanitize();
        let connectivity =
            ConnectivityManager::new(link, &config.network, config.connectivity.clone());
        Self {
            board: StatusBoard::new(config.fan.default_on_duty),
            connectivity,
            pwm,
            sensor,
            config,
            shutdown: Shutdown::new(),
        }
    }

    pub fn status_board(&self) -> StatusBoard {
        self.board.clone()
    }

    pub fn connection_watch(&self) -> ConnectionWatch {
        self.connectivity.watch()
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// `connect_messaging` is only invoked once WiFi is up. The dispatch
    /// thread exits when its inbound stream ends.
    pub fn run<M, I, F>(mut self, connect_messaging: F) -> Result<SessionEnd, NodeError>
    where
        M: Messaging + Clone + 'static,
        I: Iterator<Item = SessionEvent> + Send + 'static,
        F: FnOnce(&RuntimeConfig) -> Result<(M, I), NodeError>,
    {
        let fan = FanActuator::new(self.pwm, self.config.fan.clone())?;

        if self.connectivity.start() == ConnectionOutcome::Failed {
            error!("wifi unavailable; running without messaging or sampling");
            return Ok(SessionEnd::ConnectivityFailed);
        }

        let (messaging, inbound) = connect_messaging(&self.config)?;
        info!(
            "messaging client started for {}:{}",
            self.config.network.mqtt_host, self.config.network.mqtt_port
        );

        let router = CommandRouter::new(
            fan,
            messaging.clone(),
            self.config.topics.clone(),
            &self.config.messaging,
            self.board.clone(),
        );
        spawn_named("mqtt-dispatch", DISPATCH_STACK_SIZE, move || {
            let mut router = router;
            for event in inbound {
                router.handle_event(event);
            }
            info!("inbound session stream closed");
        })?;

        let sampler = SensorSampler::new(
            self.sensor,
            Publisher::new(messaging, &self.config.messaging, self.board.clone()),
            self.config.topics.clone(),
            self.config.sensor.clone(),
            self.board.clone(),
        );
        let sampler_shutdown = self.shutdown.clone();
        let sampler_handle = spawn_named("dht-sampler", SAMPLER_STACK_SIZE, move || {
            sampler.run(&sampler_shutdown)
        })?;

        let end = match self.connectivity.supervise(&self.shutdown) {
            SupervisionEnd::Stopped => SessionEnd::Stopped,
            SupervisionEnd::Failed => {
                error!("wifi lost and not recovered; stopping sensor sampling");
                self.shutdown.trigger();
                SessionEnd::ConnectivityLost
            }
        };

        if sampler_handle.join().is_err() {
            warn!("sensor sampler thread panicked");
        }
        Ok(end)
    }
}

fn spawn_named<F>(
    name: &'static str,
    stack_size: usize,
    body: F,
) -> Result<JoinHandle<()>, NodeError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .stack_size(stack_size)
        .spawn(body)
        .map_err(|source| NodeError::Spawn { name, source })
}
