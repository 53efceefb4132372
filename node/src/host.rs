use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::mpsc};
use tracing::{error, info, warn};

use fan_node_common::{
    ConnectionWatch, Coordinator, FadeNotifier, FanConfig, HumiditySensor, LinkError, MessageId,
    Messaging, NetworkConfig, PublishError, PwmChannel, PwmError, QoS, RuntimeConfig, SensorError,
    SessionEnd, SessionEvent, StatusBoard, TelemetryReading, TopicBindings, WifiLink,
};

const DEFAULT_HTTP_PORT: u16 = 8080;
const MQTT_CAPACITY: usize = 64;
const SIM_ASSOCIATION_DELAY: Duration = Duration::from_millis(250);
const SIM_SENSOR_FAILURE_EVERY: u64 = 7;

#[derive(Clone)]
struct AppState {
    board: StatusBoard,
    watch: ConnectionWatch,
    topics: TopicBindings,
    inbound: mpsc::Sender<SessionEvent>,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct OutputParams {
    value: Option<String>,
}

#[derive(Debug, Serialize)]
struct InjectedCommand {
    topic: String,
    payload: String,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime.network);
    runtime.sanitize();

    let (inbound_tx, inbound_rx) = mpsc::channel(runtime.messaging.inbound_queue_depth);

    let coordinator = Coordinator::new(
        runtime.clone(),
        SimulatedLink::from_env(),
        SimulatedPwm::default(),
        SimulatedDht::default(),
    );
    let shutdown = coordinator.shutdown_handle();

    let app_state = AppState {
        board: coordinator.status_board(),
        watch: coordinator.connection_watch(),
        topics: runtime.topics.clone(),
        inbound: inbound_tx.clone(),
    };
    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/fan/toggle", post(handle_fan_toggle))
        .route("/api/fan/output", post(handle_fan_output))
        .with_state(app_state);

    let port = std::env::var("FAN_NODE_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(DEFAULT_HTTP_PORT);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind status server at {addr}"))?;
    info!("status api listening on http://{addr}");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            error!("status server stopped: {err}");
        }
    });

    let stopper = shutdown.clone();
    let ctrl_c = tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("ctrl-c handler unavailable: {err}");
            return;
        }
        info!("shutdown requested");
        stopper.trigger();
    });

    let handle = tokio::runtime::Handle::current();
    let node = tokio::task::spawn_blocking(move || {
        coordinator.run(move |config| {
            let (client, eventloop) = AsyncClient::new(mqtt_options(config), MQTT_CAPACITY);
            handle.spawn(poll_mqtt(eventloop, inbound_tx));
            let mut inbound_rx = inbound_rx;
            let inbound = std::iter::from_fn(move || inbound_rx.blocking_recv());
            Ok((Arc::new(MqttMessaging::new(client)), inbound))
        })
    });

    match node.await.context("node task panicked")?? {
        SessionEnd::Stopped => info!("node stopped"),
        end => {
            error!("node halted ({end:?}); status api stays up until ctrl-c");
            let _ = ctrl_c.await;
        }
    }
    Ok(())
}

fn apply_env_overrides(network: &mut NetworkConfig) {
    if let Ok(host) = std::env::var("MQTT_HOST") {
        network.mqtt_host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        network.mqtt_user = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        network.mqtt_pass = pass;
    }
}

fn mqtt_options(config: &RuntimeConfig) -> MqttOptions {
    let network = &config.network;
    let mut options = MqttOptions::new(
        network.mqtt_client_id.clone(),
        network.mqtt_host.clone(),
        network.mqtt_port,
    );
    options.set_keep_alive(Duration::from_secs(15));
    if !network.mqtt_user.is_empty() {
        options.set_credentials(network.mqtt_user.clone(), network.mqtt_pass.clone());
    }
    options
}

async fn poll_mqtt(mut eventloop: EventLoop, inbound: mpsc::Sender<SessionEvent>) {
    let mut connected = false;
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                connected = true;
                SessionEvent::Connected
            }
            Ok(Event::Incoming(Incoming::Publish(message))) => SessionEvent::Message {
                topic: message.topic,
                payload: message.payload.to_vec(),
            },
            Ok(_) => continue,
            Err(err) => {
                warn!("mqtt poll error: {err}");
                if connected {
                    connected = false;
                    if inbound.send(SessionEvent::Disconnected).await.is_err() {
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            }
        };

        if inbound.send(event).await.is_err() {
            break;
        }
    }
    info!("mqtt event loop stopped");
}

struct MqttMessaging {
    client: AsyncClient,
    next_id: AtomicU32,
}

impl MqttMessaging {
    fn new(client: AsyncClient) -> Self {
        Self {
            client,
            next_id: AtomicU32::new(1),
        }
    }

    fn next_id(&self) -> MessageId {
        MessageId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

fn to_rumqttc_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

impl Messaging for MqttMessaging {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<MessageId, PublishError> {
        self.client
            .try_subscribe(topic, to_rumqttc_qos(qos))
            .map_err(|err| PublishError::Rejected {
                topic: topic.to_string(),
                reason: err.to_string(),
            })?;
        Ok(self.next_id())
    }

    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<MessageId, PublishError> {
        self.client
            .try_publish(topic, to_rumqttc_qos(qos), retain, payload.to_vec())
            .map_err(|err| PublishError::Rejected {
                topic: topic.to_string(),
                reason: err.to_string(),
            })?;
        Ok(self.next_id())
    }
}

// Fails the first `FAN_NODE_SIM_WIFI_FAILURES` attempts.
struct SimulatedLink {
    failures_left: u32,
    connected: bool,
}

impl SimulatedLink {
    fn from_env() -> Self {
        let failures_left = std::env::var("FAN_NODE_SIM_WIFI_FAILURES")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(0);
        Self {
            failures_left,
            connected: false,
        }
    }
}

impl WifiLink for SimulatedLink {
    fn connect(&mut self, ssid: &str, _password: &str) -> Result<(), LinkError> {
        thread::sleep(SIM_ASSOCIATION_DELAY);
        if self.failures_left > 0 {
            self.failures_left -= 1;
            self.connected = false;
            return Err(LinkError::AssociationFailed {
                ssid: ssid.to_string(),
                reason: "simulated association failure".to_string(),
            });
        }
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// A newer fade supersedes an in-flight one.
#[derive(Default)]
struct SimulatedPwm {
    duty: Arc<AtomicU32>,
    generation: Arc<AtomicU64>,
    notifier: Option<FadeNotifier>,
    initialized: bool,
}

impl PwmChannel for SimulatedPwm {
    fn init(&mut self, config: &FanConfig) -> Result<(), PwmError> {
        if self.initialized {
            return Err(PwmError::AlreadyInitialized);
        }
        self.initialized = true;
        info!(
            "simulated pwm on gpio {} ({} Hz, max raw {})",
            config.output_gpio,
            config.pwm_frequency_hz,
            config.max_raw_duty()
        );
        Ok(())
    }

    fn on_fade_complete(&mut self, notifier: FadeNotifier) -> Result<(), PwmError> {
        self.notifier = Some(notifier);
        Ok(())
    }

    fn set_fade_target(&mut self, raw_duty: u32, duration: Duration) -> Result<(), PwmError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let current = Arc::clone(&self.generation);
        let duty = Arc::clone(&self.duty);
        let notifier = self.notifier.clone();

        thread::Builder::new()
            .name("pwm-fade".to_string())
            .spawn(move || {
                thread::sleep(duration);
                if current.load(Ordering::SeqCst) != generation {
                    return;
                }
                duty.store(raw_duty, Ordering::SeqCst);
                if let Some(notifier) = notifier {
                    notifier.notify();
                }
            })
            .map(drop)
            .map_err(|_| PwmError::Driver {
                call: "set_fade_target",
                code: -1,
            })
    }

    fn set_duty_immediate(&mut self, raw_duty: u32) -> Result<(), PwmError> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.duty.store(raw_duty, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct SimulatedDht {
    tick: u64,
}

impl HumiditySensor for SimulatedDht {
    fn read(&mut self) -> Result<TelemetryReading, SensorError> {
        self.tick = self.tick.saturating_add(1);
        if self.tick % SIM_SENSOR_FAILURE_EVERY == 0 {
            return Err(SensorError::Checksum);
        }
        Ok(TelemetryReading {
            humidity: 42.0 + ((self.tick % 6) as f32 * 0.5),
            temperature: 21.0 + ((self.tick % 8) as f32 * 0.2),
        })
    }
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.board.snapshot(&state.watch))
}

async fn handle_fan_toggle(State(state): State<AppState>) -> impl IntoResponse {
    let payload = if state.board.fan().is_on { "OFF" } else { "ON" };
    let topic = state.topics.status.clone();
    inject(&state, topic, payload.to_string()).await
}

async fn handle_fan_output(
    State(state): State<AppState>,
    Query(params): Query<OutputParams>,
) -> impl IntoResponse {
    let Some(value) = params.value else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let topic = state.topics.output.clone();
    inject(&state, topic, value).await
}

// Queued behind broker messages already waiting.
async fn inject(state: &AppState, topic: String, payload: String) -> axum::response::Response {
    let event = SessionEvent::Message {
        topic: topic.clone(),
        payload: payload.clone().into_bytes(),
    };
    if state.inbound.send(event).await.is_err() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Command dispatch stopped");
    }
    (StatusCode::ACCEPTED, Json(InjectedCommand { topic, payload })).into_response()
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("FAN_NODE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.fan-node"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => serde_json::from_slice::<RuntimeConfig>(&raw)
                .with_context(|| format!("invalid {}", self.runtime_path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}
