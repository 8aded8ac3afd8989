//! The poll loop owned by each registered device.
//!
//! A task exclusively owns its [`Client`] and therefore its session. The
//! supervisor only sees the task through a `watch` channel carrying the
//! latest [`DeviceStatus`] and an `mpsc` channel for commands.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::{DeviceConfig, SupervisorConfig},
    error::Error,
    response::{DeviceInfo, EnergyUsage},
    supervisor::{
        DeviceEvent, DeviceStatus,
        sink::{EnergyReading, ReadingSink},
    },
    transport::{Client, ProtocolClient},
};

/// Requests routed to the task that owns the session.
#[derive(Debug)]
pub(crate) enum DeviceCommand {
    SetState {
        on: bool,
        reply: oneshot::Sender<Result<(), Error>>,
    },
}

pub(crate) struct DeviceTask {
    pub(crate) config: DeviceConfig,
    pub(crate) client: Client,
    pub(crate) policy: SupervisorConfig,
    pub(crate) sink: Arc<dyn ReadingSink>,
    pub(crate) events: broadcast::Sender<DeviceEvent>,
    pub(crate) status: watch::Sender<DeviceStatus>,
    pub(crate) commands: mpsc::Receiver<DeviceCommand>,
    pub(crate) cancel: CancellationToken,
}

/// Mutable bookkeeping of one loop.
#[derive(Default)]
struct LoopState {
    consecutive_failures: u32,
    offline: bool,
    needs_reconnect: bool,
    suspended: bool,
    polls: u64,
    last_info: Option<DeviceInfo>,
}

impl DeviceTask {
    /// Runs until cancelled, then closes the client.
    pub(crate) async fn run(mut self) {
        let mut state = LoopState::default();
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(command) = self.commands.recv() => self.handle_command(command).await,
                _ = ticker.tick() => self.poll(&mut state).await,
            }
        }

        self.client.close();
        debug!("Poll loop stopped");
    }

    async fn handle_command(&mut self, command: DeviceCommand) {
        match command {
            DeviceCommand::SetState { on, reply } => {
                let result = self.client.set_device_on(on).await;
                match &result {
                    Ok(()) => info!(on, "Relay state changed"),
                    Err(e) => warn!(on, error = %e, "Failed to change relay state"),
                }
                let _ = reply.send(result);
            }
        }
    }

    async fn poll(&mut self, state: &mut LoopState) {
        if state.suspended {
            return;
        }

        if state.needs_reconnect {
            self.client.close();
            if let Err(err) = self.client.connect().await {
                self.record_failure(state, err);
                return;
            }
            debug!("Reconnected");
            state.needs_reconnect = false;
        }

        let every = u64::from(self.policy.device_info_every.max(1));
        let refresh_info = state.last_info.is_none() || state.polls % every == 0;
        state.polls += 1;

        if refresh_info {
            match self.client.get_device_info().await {
                Ok(info) => {
                    self.status.send_modify(|s| s.device_info = Some(info.clone()));
                    state.last_info = Some(info);
                }
                Err(err) => {
                    self.record_failure(state, err);
                    return;
                }
            }
        }

        match self.client.get_energy_usage().await {
            Ok(usage) => self.record_success(state, usage).await,
            Err(err) => self.record_failure(state, err),
        }
    }

    async fn record_success(&mut self, state: &mut LoopState, usage: EnergyUsage) {
        let now = Utc::now();
        let recovered = state.offline;
        state.consecutive_failures = 0;
        state.offline = false;

        self.status.send_modify(|s| {
            s.online = true;
            s.consecutive_failures = 0;
            s.last_success = Some(now);
            s.last_error = None;
            s.energy_usage = Some(usage);
        });

        if recovered {
            info!("Device back online");
            self.emit(DeviceEvent::Online {
                device_id: self.config.device_id.clone(),
            });
        }

        let reading = EnergyReading {
            device_id: self.config.device_id.clone(),
            device_name: self.config.device_name.clone(),
            room_id: self.config.room_id.clone(),
            usage,
            is_on: state.last_info.as_ref().map(|i| i.is_on),
            rssi: state.last_info.as_ref().map(|i| i.rssi),
            timestamp: now,
        };

        if let Err(e) = self.sink.publish(&reading).await {
            warn!(error = %e, "Failed to publish reading");
        }
        self.emit(DeviceEvent::Reading(reading));
    }

    fn record_failure(&mut self, state: &mut LoopState, err: Error) {
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let failures = state.consecutive_failures;
        let message = err.to_string();

        if err.is_retryable() {
            state.needs_reconnect = true;
        }

        let auth_failed = matches!(err, Error::Authentication(_));
        if auth_failed {
            state.suspended = true;
        }

        let goes_offline =
            !state.offline && (auth_failed || failures >= self.policy.offline_threshold);
        if goes_offline {
            state.offline = true;
        }

        self.status.send_modify(|s| {
            s.consecutive_failures = failures;
            s.last_error = Some(message.clone());
            if goes_offline {
                s.online = false;
            }
            if auth_failed {
                s.needs_attention = true;
            }
        });

        if auth_failed {
            error!(
                error = %err,
                "Device rejected credentials; polling suspended until the device is re-added"
            );
            self.emit(DeviceEvent::AuthenticationFailed {
                device_id: self.config.device_id.clone(),
                error: message.clone(),
            });
        } else {
            debug!(kind = %err.kind(), failures, error = %err, "Poll failed");
        }

        if goes_offline {
            warn!(failures, error = %err, "Device marked offline");
            self.emit(DeviceEvent::Offline {
                device_id: self.config.device_id.clone(),
                consecutive_failures: failures,
                error: message,
            });
        }
    }

    fn emit(&self, event: DeviceEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
