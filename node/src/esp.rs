use core::{ffi::c_void, convert::TryInto};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex, PoisonError,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use dht_sensor::{dht11, DhtError};
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS as MqttQoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::{Ets, BLOCK},
    gpio::{AnyIOPin, InputOutput, PinDriver, Pull},
    task::notification::{Notification, Notifier},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sys::{self, esp_err_t},
    wifi::{BlockingWifi, EspWifi},
};
use log::{error, info, warn};

use fan_node_common::{
    config::NetworkConfig, Coordinator, FadeNotifier, FanConfig, HumiditySensor, LinkError,
    MessageId, Messaging, NodeError, PublishError, PwmChannel, PwmError, QoS, RuntimeConfig,
    SensorError, SessionEnd, SessionEvent, TelemetryReading, WifiLink,
};

const NVS_NAMESPACE: &str = "fan_node";
const NVS_RUNTIME_KEY: &str = "runtime_json";

const LEDC_MODE: sys::ledc_mode_t = sys::ledc_mode_t_LEDC_LOW_SPEED_MODE;
const LEDC_TIMER: sys::ledc_timer_t = sys::ledc_timer_t_LEDC_TIMER_0;
const LEDC_CHANNEL: sys::ledc_channel_t = sys::ledc_channel_t_LEDC_CHANNEL_0;

const MQTT_POLL_RETRY: Duration = Duration::from_secs(2);

// LEDC fade service and its ISR callback are process-wide.
static LEDC_READY: AtomicBool = AtomicBool::new(false);

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_wifi_defaults(&mut runtime);
    runtime.sanitize();

    let Peripherals { modem, .. } = Peripherals::take()?;

    let link = EspWifiLink::new(modem, sys_loop, nvs_partition).context("wifi init failed")?;
    let sensor = Dht11Sensor::new(runtime.sensor.data_gpio)
        .with_context(|| format!("dht11 init failed on GPIO{}", runtime.sensor.data_gpio))?;

    let coordinator = Coordinator::new(runtime, link, LedcFan::default(), sensor);
    let end = coordinator.run(|config| {
        let (client, conn) = create_mqtt_client(&config.network)
            .map_err(|err| NodeError::Messaging(format!("{err:#}")))?;
        let (tx, rx) = mpsc::sync_channel(config.messaging.inbound_queue_depth);
        spawn_mqtt_receiver(conn, tx)?;
        Ok((Arc::new(EspMessaging::new(client)), rx.into_iter()))
    })?;

    match end {
        SessionEnd::Stopped => {
            info!("node stopped");
            Ok(())
        }
        end => {
            // Fan keeps its last duty; recovery needs a power cycle or new credentials.
            error!("node halted ({end:?}); waiting for operator");
            loop {
                thread::sleep(Duration::from_secs(60));
            }
        }
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        runtime.network.wifi_ssid = option_env!("WIFI_SSID").unwrap_or("CHANGE_ME").to_string();
    }

    if runtime.network.wifi_pass.is_empty() {
        runtime.network.wifi_pass = option_env!("WIFI_PASS").unwrap_or("CHANGE_ME").to_string();
    }
}

struct EspWifiLink {
    wifi: BlockingWifi<EspWifi<'static>>,
}

impl EspWifiLink {
    fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: EspDefaultNvsPartition,
    ) -> anyhow::Result<Self> {
        let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
        let wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;
        Ok(Self { wifi })
    }

    fn associate(&mut self, ssid: &str, password: &str) -> anyhow::Result<()> {
        let auth_method = if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: ssid.try_into().map_err(|_| anyhow!("wifi ssid too long"))?,
                password: password
                    .try_into()
                    .map_err(|_| anyhow!("wifi password too long"))?,
                auth_method,
                ..Default::default()
            }))?;

        if !self.wifi.is_started()? {
            self.wifi.start()?;
        }
        self.wifi.connect()?;
        self.wifi.wait_netif_up()?;
        Ok(())
    }
}

impl WifiLink for EspWifiLink {
    fn connect(&mut self, ssid: &str, password: &str) -> Result<(), LinkError> {
        match self.associate(ssid, password) {
            Ok(()) => {
                disable_wifi_power_save();
                Ok(())
            }
            Err(err) => {
                let _ = self.wifi.disconnect();
                Err(LinkError::AssociationFailed {
                    ssid: ssid.to_string(),
                    reason: format!("{err:#}"),
                })
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false)
    }
}

fn disable_wifi_power_save() {
    let rc = unsafe { sys::esp_wifi_set_ps(0) };
    if rc == sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn esp_check(call: &'static str, code: esp_err_t) -> Result<(), PwmError> {
    if code == sys::ESP_OK {
        Ok(())
    } else {
        Err(PwmError::Driver { call, code })
    }
}

// LEDC channel 0 on timer 0.
#[derive(Default)]
struct LedcFan;

impl PwmChannel for LedcFan {
    fn init(&mut self, config: &FanConfig) -> Result<(), PwmError> {
        if LEDC_READY.swap(true, Ordering::SeqCst) {
            return Err(PwmError::AlreadyInitialized);
        }

        let timer = sys::ledc_timer_config_t {
            speed_mode: LEDC_MODE,
            timer_num: LEDC_TIMER,
            duty_resolution: u32::from(config.resolution_bits),
            freq_hz: config.pwm_frequency_hz,
            clk_cfg: sys::soc_periph_ledc_clk_src_legacy_t_LEDC_AUTO_CLK,
            ..Default::default()
        };
        esp_check("ledc_timer_config", unsafe { sys::ledc_timer_config(&timer) })?;

        let channel = sys::ledc_channel_config_t {
            speed_mode: LEDC_MODE,
            channel: LEDC_CHANNEL,
            timer_sel: LEDC_TIMER,
            gpio_num: config.output_gpio,
            duty: 0,
            hpoint: 0,
            ..Default::default()
        };
        esp_check("ledc_channel_config", unsafe {
            sys::ledc_channel_config(&channel)
        })?;
        esp_check("ledc_fade_func_install", unsafe {
            sys::ledc_fade_func_install(0)
        })?;

        info!(
            "LEDC configured on GPIO{} ({} Hz, {} bit)",
            config.output_gpio, config.pwm_frequency_hz, config.resolution_bits
        );
        Ok(())
    }

    fn on_fade_complete(&mut self, notifier: FadeNotifier) -> Result<(), PwmError> {
        let isr_notifier = spawn_fade_relay(notifier)?;
        let mut callbacks = sys::ledc_cbs_t {
            fade_cb: Some(on_fade_end),
        };
        // The relay lives for the program, so the notifier is never released.
        let user_arg = Arc::into_raw(isr_notifier) as *mut c_void;
        esp_check("ledc_cb_register", unsafe {
            sys::ledc_cb_register(LEDC_MODE, LEDC_CHANNEL, &mut callbacks, user_arg)
        })
    }

    fn set_fade_target(&mut self, raw_duty: u32, duration: Duration) -> Result<(), PwmError> {
        let fade_ms = i32::try_from(duration.as_millis()).unwrap_or(i32::MAX);
        esp_check("ledc_set_fade_with_time", unsafe {
            sys::ledc_set_fade_with_time(LEDC_MODE, LEDC_CHANNEL, raw_duty, fade_ms)
        })?;
        esp_check("ledc_fade_start", unsafe {
            sys::ledc_fade_start(
                LEDC_MODE,
                LEDC_CHANNEL,
                sys::ledc_fade_mode_t_LEDC_FADE_NO_WAIT,
            )
        })
    }

    fn set_duty_immediate(&mut self, raw_duty: u32) -> Result<(), PwmError> {
        esp_check("ledc_set_duty", unsafe {
            sys::ledc_set_duty(LEDC_MODE, LEDC_CHANNEL, raw_duty)
        })?;
        esp_check("ledc_update_duty", unsafe {
            sys::ledc_update_duty(LEDC_MODE, LEDC_CHANNEL)
        })
    }
}

// ISR context: no allocation, no locking, no logging.
unsafe extern "C" fn on_fade_end(
    param: *const sys::ledc_cb_param_t,
    user_arg: *mut c_void,
) -> bool {
    if param.is_null() || user_arg.is_null() {
        return false;
    }
    if (*param).event != sys::ledc_cb_event_t_LEDC_FADE_END_EVT {
        return false;
    }
    let notifier = &*(user_arg as *const Notifier);
    notifier.notify_lsb()
}

// Task notifications must be awaited by the task that created them.
fn spawn_fade_relay(notifier: FadeNotifier) -> Result<Arc<Notifier>, PwmError> {
    let (ready_tx, ready_rx) = mpsc::sync_channel(1);

    thread::Builder::new()
        .name("fade-relay".into())
        .stack_size(4 * 1024)
        .spawn(move || {
            let notification = Notification::new();
            if ready_tx.send(notification.notifier()).is_err() {
                return;
            }
            loop {
                if notification.wait(BLOCK).is_some() {
                    notifier.notify();
                }
            }
        })
        .map_err(|_| PwmError::Driver {
            call: "fade_relay_spawn",
            code: sys::ESP_FAIL,
        })?;

    ready_rx.recv().map_err(|_| PwmError::Driver {
        call: "fade_relay_start",
        code: sys::ESP_FAIL,
    })
}

struct Dht11Sensor {
    pin: PinDriver<'static, AnyIOPin, InputOutput>,
    delay: Ets,
    gpio: i32,
}

impl Dht11Sensor {
    fn new(gpio: i32) -> anyhow::Result<Self> {
        let mut pin = PinDriver::input_output_od(unsafe { AnyIOPin::new(gpio) })?;
        pin.set_pull(Pull::Up)?;
        pin.set_high()?;
        Ok(Self {
            pin,
            delay: Ets,
            gpio,
        })
    }
}

impl HumiditySensor for Dht11Sensor {
    fn read(&mut self) -> Result<TelemetryReading, SensorError> {
        self.pin
            .set_high()
            .map_err(|err| SensorError::Bus(format!("GPIO{}: {err}", self.gpio)))?;

        match dht11::blocking::read(&mut self.delay, &mut self.pin) {
            Ok(reading) => Ok(TelemetryReading {
                humidity: f32::from(reading.relative_humidity),
                temperature: f32::from(reading.temperature),
            }),
            Err(DhtError::Timeout) => Err(SensorError::Timeout),
            Err(DhtError::ChecksumMismatch) => Err(SensorError::Checksum),
            Err(err) => Err(SensorError::Bus(format!("GPIO{}: {err:?}", self.gpio))),
        }
    }
}

struct EspMessaging {
    client: Mutex<EspMqttClient<'static>>,
}

impl EspMessaging {
    fn new(client: EspMqttClient<'static>) -> Self {
        Self {
            client: Mutex::new(client),
        }
    }
}

fn to_mqtt_qos(qos: QoS) -> MqttQoS {
    match qos {
        QoS::AtMostOnce => MqttQoS::AtMostOnce,
        QoS::AtLeastOnce => MqttQoS::AtLeastOnce,
        QoS::ExactlyOnce => MqttQoS::ExactlyOnce,
    }
}

impl Messaging for EspMessaging {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<MessageId, PublishError> {
        let mut client = self.client.lock().unwrap_or_else(PoisonError::into_inner);
        client
            .subscribe(topic, to_mqtt_qos(qos))
            .map(MessageId)
            .map_err(|err| PublishError::Rejected {
                topic: topic.to_string(),
                reason: format!("{err:?}"),
            })
    }

    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<MessageId, PublishError> {
        let mut client = self.client.lock().unwrap_or_else(PoisonError::into_inner);
        client
            .publish(topic, to_mqtt_qos(qos), retain, payload)
            .map(MessageId)
            .map_err(|err| PublishError::Rejected {
                topic: topic.to_string(),
                reason: format!("{err:?}"),
            })
    }
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some(network.mqtt_client_id.as_str()),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn spawn_mqtt_receiver(
    mut conn: EspMqttConnection,
    inbound: mpsc::SyncSender<SessionEvent>,
) -> Result<(), NodeError> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            let mut received: u64 = 0;
            loop {
                let event = match conn.next() {
                    Ok(event) => match event.payload() {
                        EventPayload::Connected(_) => SessionEvent::Connected,
                        EventPayload::Disconnected => SessionEvent::Disconnected,
                        EventPayload::Received {
                            topic: Some(topic),
                            data,
                            details: Details::Complete,
                            ..
                        } => {
                            received += 1;
                            SessionEvent::Message {
                                topic: topic.to_string(),
                                payload: data.to_vec(),
                            }
                        }
                        _ => continue,
                    },
                    Err(err) => {
                        warn!(
                            "mqtt receive loop error after {received} messages: {err:?}"
                        );
                        thread::sleep(MQTT_POLL_RETRY);
                        continue;
                    }
                };

                if inbound.send(event).is_err() {
                    warn!("inbound dispatch closed; mqtt receiver exiting");
                    break;
                }
            }
        })
        .map(drop)
        .map_err(|source| NodeError::Spawn {
            name: "mqtt-rx",
            source,
        })
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}
