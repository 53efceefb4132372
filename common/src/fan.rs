use std::{
    sync::mpsc::{self, Receiver, SyncSender},
    time::Duration,
};

use log::{info, warn};

use crate::{
    config::FanConfig,
    error::FanError,
    ports::PwmChannel,
    types::{FadeOutcome, FadeRequest},
};

struct FadeSignal {
    tx: SyncSender<()>,
    rx: Receiver<()>,
}

#[derive(Debug, Clone)]
pub struct FadeNotifier {
    tx: SyncSender<()>,
}

impl FadeNotifier {
    /// Never blocks; completions the waiter has not consumed yet are coalesced.
    pub fn notify(&self) {
        let _ = self.tx.try_send(());
    }
}

impl FadeSignal {
    fn new() -> Self {
        let (tx, rx) = mpsc::sync_channel(1);
        Self { tx, rx }
    }

    fn notifier(&self) -> FadeNotifier {
        FadeNotifier {
            tx: self.tx.clone(),
        }
    }

    fn drain(&self) {
        while self.rx.try_recv().is_ok() {}
    }

    fn wait(&self, timeout: Duration) -> bool {
        self.rx.recv_timeout(timeout).is_ok()
    }
}

pub fn percent_to_raw(percent: u8, max_raw_duty: u32) -> u32 {
    let percent = percent.min(100);
    ((f32::from(percent) / 100.0) * max_raw_duty as f32) as u32
}

pub fn clamp_percent(percent: i32) -> u8 {
    percent.clamp(0, 100) as u8
}

pub struct FanActuator<P> {
    pwm: P,
    config: FanConfig,
    signal: FadeSignal,
    applied_percent: u8,
}

impl<P: PwmChannel> FanActuator<P> {
    pub fn new(mut pwm: P, config: FanConfig) -> Result<Self, FanError> {
        let signal = FadeSignal::new();
        pwm.init(&config).map_err(FanError::Init)?;
        pwm.on_fade_complete(signal.notifier())
            .map_err(FanError::Init)?;
        pwm.set_duty_immediate(0).map_err(FanError::Init)?;
        info!(
            "fan pwm initialized ({} Hz, {} bit, gpio {})",
            config.pwm_frequency_hz, config.resolution_bits, config.output_gpio
        );

        Ok(Self {
            pwm,
            config,
            signal,
            applied_percent: 0,
        })
    }

    fn fade_request(&self, percent: i32) -> FadeRequest {
        let target_percent = clamp_percent(percent);
        FadeRequest {
            target_percent,
            target_raw: percent_to_raw(target_percent, self.config.max_raw_duty()),
            fade_duration: self.config.fade_duration(),
            timeout: self.config.fade_timeout(),
        }
    }

    /// Saturates `percent` to 0..=100. On fade timeout the duty is written directly.
    pub fn set_duty_fade(&mut self, percent: i32) -> Result<FadeOutcome, FanError> {
        let request = self.fade_request(percent);
        info!(
            "fading fan to {}% (raw: {})",
            request.target_percent, request.target_raw
        );

        self.signal.drain();
        self.pwm
            .set_fade_target(request.target_raw, request.fade_duration)?;

        if self.signal.wait(request.timeout) {
            self.applied_percent = request.target_percent;
            info!("fan fade to {}% complete", request.target_percent);
            return Ok(FadeOutcome::Completed);
        }

        warn!(
            "fan fade to {}% timed out after {} ms; setting duty directly",
            request.target_percent,
            request.timeout.as_millis()
        );
        self.pwm.set_duty_immediate(request.target_raw)?;
        self.applied_percent = request.target_percent;
        Ok(FadeOutcome::TimedOut)
    }

    pub fn turn_on(&mut self, percent: u8) -> Result<FadeOutcome, FanError> {
        info!("turning fan on to {percent}%");
        self.set_duty_fade(i32::from(percent))
    }

    pub fn turn_off(&mut self) -> Result<FadeOutcome, FanError> {
        info!("turning fan off");
        self.set_duty_fade(0)
    }

    pub fn applied_percent(&self) -> u8 {
        self.applied_percent
    }
}
