//! Device registry and per-device polling.
//!
//! [`DeviceSupervisor`] connects each configured device once, then hands the
//! connected client to a dedicated task that polls it on its own interval.
//! Tasks share nothing with each other; the registry lock is only taken to
//! insert, remove or snapshot entries.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tapo_core::{Credentials, DeviceConfig, ProtocolKind, SupervisorBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tapo_core::Error> {
//!     let supervisor = SupervisorBuilder::new().build();
//!     let mut events = supervisor.subscribe();
//!
//!     let config = DeviceConfig::new(
//!         "office-heater",
//!         "192.168.1.60",
//!         Credentials::new("user@example.com", "password"),
//!         ProtocolKind::Klap,
//!     )
//!     .with_poll_interval(Duration::from_secs(15));
//!     supervisor.add_device(config).await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     supervisor.stop().await;
//!     Ok(())
//! }
//! ```

mod device;
pub mod sink;

pub use sink::{EnergyReading, ReadingSink, TracingSink};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, info_span, warn};

use crate::{
    config::{ClientOptions, DeviceConfig, ProtocolKind, SupervisorConfig},
    error::Error,
    response::{DeviceInfo, EnergyUsage},
    transport::{Client, ProtocolClient},
};

use device::{DeviceCommand, DeviceTask};

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Builds protocol clients for newly added devices.
pub trait ClientFactory: Send + Sync {
    fn create(&self, config: &DeviceConfig, options: ClientOptions) -> Result<Client, Error>;
}

/// Factory producing clients that talk TCP to the configured address.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpClientFactory;

impl ClientFactory for TcpClientFactory {
    fn create(&self, config: &DeviceConfig, options: ClientOptions) -> Result<Client, Error> {
        Client::from_config(config, options)
    }
}

/// Point-in-time view of one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub device_name: String,
    pub room_id: String,
    pub ip_address: String,
    pub protocol: ProtocolKind,
    pub poll_interval_secs: u64,
    pub online: bool,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Set after an authentication failure; polling is suspended.
    pub needs_attention: bool,
    pub device_info: Option<DeviceInfo>,
    pub energy_usage: Option<EnergyUsage>,
}

impl DeviceStatus {
    fn registered(config: &DeviceConfig) -> Self {
        Self {
            device_id: config.device_id.clone(),
            device_name: config.device_name.clone(),
            room_id: config.room_id.clone(),
            ip_address: config.ip_address.clone(),
            protocol: config.protocol,
            poll_interval_secs: config.poll_interval.as_secs(),
            online: true,
            consecutive_failures: 0,
            last_success: None,
            last_error: None,
            needs_attention: false,
            device_info: None,
            energy_usage: None,
        }
    }
}

/// Notifications published by the supervisor and its poll loops.
///
/// Events of one device arrive in the order its loop produced them.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Registered {
        device_id: String,
    },
    Reading(EnergyReading),
    Offline {
        device_id: String,
        consecutive_failures: u32,
        error: String,
    },
    Online {
        device_id: String,
    },
    AuthenticationFailed {
        device_id: String,
        error: String,
    },
    Removed {
        device_id: String,
    },
}

impl DeviceEvent {
    pub fn device_id(&self) -> &str {
        match self {
            DeviceEvent::Registered { device_id }
            | DeviceEvent::Offline { device_id, .. }
            | DeviceEvent::Online { device_id }
            | DeviceEvent::AuthenticationFailed { device_id, .. }
            | DeviceEvent::Removed { device_id } => device_id,
            DeviceEvent::Reading(reading) => &reading.device_id,
        }
    }
}

struct DeviceHandle {
    status: watch::Receiver<DeviceStatus>,
    commands: mpsc::Sender<DeviceCommand>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Builder for [`DeviceSupervisor`].
pub struct SupervisorBuilder {
    config: SupervisorConfig,
    factory: Arc<dyn ClientFactory>,
    sink: Arc<dyn ReadingSink>,
    span: Option<Span>,
    event_capacity: usize,
}

impl Default for SupervisorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SupervisorBuilder {
    pub fn new() -> Self {
        Self {
            config: SupervisorConfig::default(),
            factory: Arc::new(TcpClientFactory),
            sink: Arc::new(TracingSink),
            span: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn ReadingSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn client_factory(mut self, factory: Arc<dyn ClientFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Parent span for everything the supervisor logs.
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> DeviceSupervisor {
        let (events, _) = broadcast::channel(self.event_capacity);
        DeviceSupervisor {
            config: self.config,
            factory: self.factory,
            sink: self.sink,
            span: self.span.unwrap_or_else(|| info_span!("supervisor")),
            devices: Mutex::new(HashMap::new()),
            events,
            shutdown: CancellationToken::new(),
        }
    }
}

/// Owns the device registry and one poll loop per device.
pub struct DeviceSupervisor {
    config: SupervisorConfig,
    factory: Arc<dyn ClientFactory>,
    sink: Arc<dyn ReadingSink>,
    span: Span,
    devices: Mutex<HashMap<String, DeviceHandle>>,
    events: broadcast::Sender<DeviceEvent>,
    shutdown: CancellationToken,
}

impl DeviceSupervisor {
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, DeviceHandle>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Connects to a device and starts polling it.
    ///
    /// On any error nothing is registered and no task is left running.
    pub async fn add_device(&self, config: DeviceConfig) -> Result<(), Error> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Configuration("supervisor has been stopped".into()));
        }

        let config = config.normalized(self.config.default_poll_interval);
        config.validate()?;
        if self.registry().contains_key(&config.device_id) {
            return Err(Error::Configuration(format!(
                "device {} is already registered",
                config.device_id
            )));
        }

        let span = info_span!(parent: &self.span, "device", device_id = %config.device_id);
        let mut client = self.factory.create(&config, self.config.client)?;
        client.connect().instrument(span.clone()).await?;

        let (status_tx, status_rx) = watch::channel(DeviceStatus::registered(&config));
        let (command_tx, command_rx) = mpsc::channel(8);
        let cancel = self.shutdown.child_token();
        let device_id = config.device_id.clone();

        let mut devices = self.registry();
        // `stop` cancels before draining, so this sees any stop that has
        // already emptied the registry.
        if self.shutdown.is_cancelled() {
            client.close();
            return Err(Error::Configuration("supervisor has been stopped".into()));
        }
        if devices.contains_key(&device_id) {
            client.close();
            return Err(Error::Configuration(format!(
                "device {} is already registered",
                device_id
            )));
        }

        info!(
            parent: &span,
            protocol = %config.protocol,
            address = %config.ip_address,
            interval_secs = config.poll_interval.as_secs(),
            "Device registered"
        );

        let _ = self.events.send(DeviceEvent::Registered {
            device_id: device_id.clone(),
        });

        let task = DeviceTask {
            config,
            client,
            policy: self.config,
            sink: Arc::clone(&self.sink),
            events: self.events.clone(),
            status: status_tx,
            commands: command_rx,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(task.run().instrument(span));

        devices.insert(
            device_id,
            DeviceHandle {
                status: status_rx,
                commands: command_tx,
                cancel,
                task: handle,
            },
        );
        Ok(())
    }

    /// Stops a device's loop, waits for it and forgets the device.
    pub async fn remove_device(&self, device_id: &str) -> Result<(), Error> {
        let handle = self
            .registry()
            .remove(device_id)
            .ok_or_else(|| Error::Configuration(format!("unknown device {}", device_id)))?;

        handle.cancel.cancel();
        if let Err(e) = handle.task.await {
            warn!(parent: &self.span, device_id, error = %e, "Poll task ended abnormally");
        }

        info!(parent: &self.span, device_id, "Device removed");
        let _ = self.events.send(DeviceEvent::Removed {
            device_id: device_id.to_string(),
        });
        Ok(())
    }

    /// Snapshot of every registered device, ordered by id.
    pub fn get_device_status(&self) -> Vec<DeviceStatus> {
        let mut statuses: Vec<DeviceStatus> = self
            .registry()
            .values()
            .map(|handle| handle.status.borrow().clone())
            .collect();
        statuses.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        statuses
    }

    /// Snapshot of one device.
    pub fn device_status(&self, device_id: &str) -> Option<DeviceStatus> {
        self.registry()
            .get(device_id)
            .map(|handle| handle.status.borrow().clone())
    }

    /// Switches a device's relay through the task that owns its session.
    pub async fn set_device_state(&self, device_id: &str, on: bool) -> Result<(), Error> {
        let commands = self
            .registry()
            .get(device_id)
            .map(|handle| handle.commands.clone())
            .ok_or_else(|| Error::Configuration(format!("unknown device {}", device_id)))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send(DeviceCommand::SetState {
                on,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::Protocol(format!("device {} is no longer polled", device_id)))?;

        reply_rx
            .await
            .map_err(|_| Error::Protocol(format!("device {} is no longer polled", device_id)))?
    }

    /// Subscribes to device events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Signals every loop to stop, waits for all of them and closes their
    /// clients. Later calls to `add_device` fail.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handles: Vec<(String, DeviceHandle)> = self.registry().drain().collect();
        debug!(parent: &self.span, devices = handles.len(), "Stopping supervisor");

        let results = futures::future::join_all(
            handles
                .into_iter()
                .map(|(id, handle)| async move { (id, handle.task.await) }),
        )
        .await;

        for (device_id, result) in results {
            if let Err(e) = result {
                warn!(
                    parent: &self.span,
                    device_id = %device_id,
                    error = %e,
                    "Poll task ended abnormally"
                );
            }
        }
        info!(parent: &self.span, "Supervisor stopped");
    }
}

impl Drop for DeviceSupervisor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
