use std::{
    sync::{mpsc::Sender, Arc, Mutex, PoisonError},
    thread,
};

use log::{error, info, warn};

use crate::{
    config::{ConnectivityConfig, NetworkConfig},
    ports::WifiLink,
    shutdown::Shutdown,
    types::{ConnectionOutcome, ConnectionState},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisionEnd {
    Stopped,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ConnectionWatch {
    inner: Arc<Mutex<(ConnectionState, u32)>>,
}

impl ConnectionWatch {
    pub fn snapshot(&self) -> (ConnectionState, u32) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store(&self, state: ConnectionState, retry_count: u32) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = (state, retry_count);
    }
}

enum Reconnect {
    Connected,
    Exhausted,
    Stopped,
}

/// The first association attempt is free; each further attempt consumes one
/// retry. `Failed` is terminal.
pub struct ConnectivityManager<L> {
    link: L,
    ssid: String,
    password: String,
    config: ConnectivityConfig,
    state: ConnectionState,
    retry_count: u32,
    watch: ConnectionWatch,
    observer: Option<Sender<ConnectionState>>,
}

impl<L: WifiLink> ConnectivityManager<L> {
    pub fn new(link: L, network: &NetworkConfig, config: ConnectivityConfig) -> Self {
        Self {
            link,
            ssid: network.wifi_ssid.clone(),
            password: network.wifi_pass.clone(),
            config,
            state: ConnectionState::Disconnected,
            retry_count: 0,
            watch: ConnectionWatch {
                inner: Arc::new(Mutex::new((ConnectionState::Disconnected, 0))),
            },
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Sender<ConnectionState>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn watch(&self) -> ConnectionWatch {
        self.watch.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn start(&mut self) -> ConnectionOutcome {
        match self.state {
            ConnectionState::Failed => return ConnectionOutcome::Failed,
            ConnectionState::Connected => return ConnectionOutcome::Connected,
            ConnectionState::Disconnected | ConnectionState::Connecting => {}
        }

        info!("wifi starting, connecting to `{}`", self.ssid);
        self.transition(ConnectionState::Connecting);
        if self.attempt() {
            return ConnectionOutcome::Connected;
        }
        match self.reconnect(None) {
            Reconnect::Connected => ConnectionOutcome::Connected,
            Reconnect::Exhausted | Reconnect::Stopped => ConnectionOutcome::Failed,
        }
    }

    /// Polls link health until `shutdown` fires or reconnection gives up.
    pub fn supervise(&mut self, shutdown: &Shutdown) -> SupervisionEnd {
        loop {
            if self.state == ConnectionState::Failed {
                return SupervisionEnd::Failed;
            }
            if shutdown.wait_timeout(self.config.health_check_interval()) {
                return SupervisionEnd::Stopped;
            }
            if self.link.is_connected() {
                continue;
            }

            warn!("wifi link to `{}` lost", self.ssid);
            self.transition(ConnectionState::Connecting);
            match self.reconnect(Some(shutdown)) {
                Reconnect::Connected => {}
                Reconnect::Exhausted => return SupervisionEnd::Failed,
                Reconnect::Stopped => {
                    info!("stop requested while reconnecting to `{}`", self.ssid);
                    return SupervisionEnd::Stopped;
                }
            }
        }
    }

    fn reconnect(&mut self, shutdown: Option<&Shutdown>) -> Reconnect {
        loop {
            if self.retry_count >= self.config.max_retries {
                error!(
                    "wifi association to `{}` failed after {} retries; operator intervention required",
                    self.ssid, self.retry_count
                );
                self.transition(ConnectionState::Failed);
                return Reconnect::Exhausted;
            }

            self.retry_count += 1;
            info!(
                "retrying wifi association ({}/{})",
                self.retry_count, self.config.max_retries
            );
            self.watch.store(self.state, self.retry_count);
            match shutdown {
                Some(shutdown) => {
                    if shutdown.wait_timeout(self.config.retry_delay()) {
                        return Reconnect::Stopped;
                    }
                }
                None if !self.config.retry_delay().is_zero() => {
                    thread::sleep(self.config.retry_delay());
                }
                None => {}
            }

            if self.attempt() {
                return Reconnect::Connected;
            }
        }
    }

    fn attempt(&mut self) -> bool {
        match self.link.connect(&self.ssid, &self.password) {
            Ok(()) => {
                self.retry_count = 0;
                self.transition(ConnectionState::Connected);
                true
            }
            Err(err) => {
                warn!("wifi connect attempt failed: {err}");
                false
            }
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            info!("wifi state {} -> {}", self.state.as_str(), next.as_str());
        }
        self.state = next;
        self.watch.store(next, self.retry_count);
        if let Some(observer) = &self.observer {
            let _ = observer.send(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::mpsc,
        time::{Duration, Instant},
    };

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::test_support::{fast_connectivity_config, ScriptedLink};

    fn manager(link: ScriptedLink, max_retries: u32) -> ConnectivityManager<ScriptedLink> {
        let network = NetworkConfig {
            wifi_ssid: "workshop".to_string(),
            ..NetworkConfig::default()
        };
        ConnectivityManager::new(link, &network, fast_connectivity_config(max_retries))
    }

    #[test]
    fn connects_on_first_attempt() {
        let link = ScriptedLink::new(vec![true], false);
        let mut manager = manager(link.clone(), 10);

        assert_eq!(manager.start(), ConnectionOutcome::Connected);
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.retry_count(), 0);
        assert_eq!(link.connect_calls(), 1);
    }

    #[test]
    fn fails_after_exactly_max_retries() {
        for max_retries in [0, 1, 3, 10] {
            let link = ScriptedLink::always_failing();
            let mut manager = manager(link.clone(), max_retries);

            assert_eq!(manager.start(), ConnectionOutcome::Failed);
            assert_eq!(manager.state(), ConnectionState::Failed);
            // Initial attempt plus one per retry.
            assert_eq!(link.connect_calls(), max_retries + 1);
        }
    }

    #[test]
    fn success_on_last_retry_resets_counter() {
        let mut script = vec![false; 10];
        script.push(true);
        let link = ScriptedLink::new(script, false);
        let mut manager = manager(link.clone(), 10);

        assert_eq!(manager.start(), ConnectionOutcome::Connected);
        assert_eq!(manager.retry_count(), 0);
        assert_eq!(link.connect_calls(), 11);
        assert_eq!(manager.watch().snapshot(), (ConnectionState::Connected, 0));
    }

    #[test]
    fn failed_is_terminal() {
        let link = ScriptedLink::always_failing();
        let mut manager = manager(link.clone(), 2);
        assert_eq!(manager.start(), ConnectionOutcome::Failed);

        link.push_outcomes(&[true]);
        assert_eq!(manager.start(), ConnectionOutcome::Failed);
        assert_eq!(link.connect_calls(), 3);
    }

    #[test]
    fn transitions_are_observed_in_order() {
        let (tx, rx) = mpsc::channel();
        let link = ScriptedLink::new(vec![false, true], false);
        let mut manager = manager(link, 10).with_observer(tx);

        manager.start();

        let seen: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            seen,
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
    }

    #[test]
    fn link_loss_reconnects_and_later_exhaustion_fails() {
        let link = ScriptedLink::new(vec![true], false);
        let mut manager = manager(link.clone(), 4);
        assert_eq!(manager.start(), ConnectionOutcome::Connected);

        // Recover once after two failed retries.
        link.push_outcomes(&[false, false, true]);
        link.drop_link();
        let shutdown = Shutdown::new();
        let stopper = shutdown.clone();
        let handle = thread::spawn(move || {
            let end = manager.supervise(&shutdown);
            (end, manager)
        });
        thread::sleep(Duration::from_millis(100));
        assert_eq!(link.connect_calls(), 4);

        // Second loss with nothing but failures: exactly max_retries attempts.
        link.drop_link();
        let (end, manager) = handle.join().unwrap();
        drop(stopper);

        assert_eq!(end, SupervisionEnd::Failed);
        assert_eq!(manager.state(), ConnectionState::Failed);
        assert_eq!(link.connect_calls(), 4 + 4);
    }

    #[test]
    fn observer_sees_recovery_then_failure_after_link_loss() {
        let (tx, rx) = mpsc::channel();
        let link = ScriptedLink::new(vec![true], false);
        let mut manager = manager(link.clone(), 2).with_observer(tx);
        assert_eq!(manager.start(), ConnectionOutcome::Connected);

        link.push_outcomes(&[false, true]);
        link.drop_link();
        let shutdown = Shutdown::new();
        let handle = thread::spawn(move || manager.supervise(&shutdown));
        thread::sleep(Duration::from_millis(100));
        link.drop_link();

        assert_eq!(handle.join().unwrap(), SupervisionEnd::Failed);
        let seen: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            seen,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Connecting,
                ConnectionState::Failed,
            ]
        );
    }

    #[test]
    fn stop_request_interrupts_retry_delay() {
        let link = ScriptedLink::new(vec![true], false);
        let network = NetworkConfig::default();
        let config = ConnectivityConfig {
            max_retries: 10,
            retry_delay_ms: 300,
            health_check_interval_ms: 5,
        };
        let mut manager = ConnectivityManager::new(link.clone(), &network, config);
        assert_eq!(manager.start(), ConnectionOutcome::Connected);

        link.drop_link();
        let shutdown = Shutdown::new();
        let stopper = shutdown.clone();
        let handle = thread::spawn(move || {
            let end = manager.supervise(&shutdown);
            (end, manager.state())
        });
        thread::sleep(Duration::from_millis(200));
        let triggered_at = Instant::now();
        stopper.trigger();
        let (end, state) = handle.join().unwrap();

        assert_eq!(end, SupervisionEnd::Stopped);
        assert_ne!(state, ConnectionState::Failed);
        assert!(link.connect_calls() < 1 + 10);
        assert!(triggered_at.elapsed() < Duration::from_millis(250));
    }

    #[test]
    fn supervise_stops_on_shutdown() {
        let link = ScriptedLink::new(vec![true], false);
        let mut manager = manager(link.clone(), 3);
        manager.start();

        let shutdown = Shutdown::new();
        shutdown.trigger();

        assert_eq!(manager.supervise(&shutdown), SupervisionEnd::Stopped);
        assert_eq!(link.connect_calls(), 1);
    }
}
