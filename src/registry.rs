//! Registry of open sensors and the bridge to the control surface.
//!
//! Each opened port gets a blocking worker that owns its [`SensorConnection`]:
//! the worker interleaves queued commands with short transport reads, so one
//! slow device never holds up another. The registry itself is a single async
//! task that routes [`ControlCommand`]s to workers, chains the discovery
//! requests and forwards every [`DeviceEvent`] outwards.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, trace, warn};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::config::ExporterConfig;
use crate::events::{ControlCommand, DeviceEvent, EventSink};
use crate::sensor::{DeviceCommand, DeviceState, SensorConnection};
use crate::transport::{PortOpener, Transport};

const READ_BUF_LEN: usize = 4096;

struct DeviceHandle {
    commands: UnboundedSender<DeviceCommand>,
    worker: JoinHandle<()>,
}

pub struct SensorRegistry {
    config: ExporterConfig,
    opener: Arc<dyn PortOpener>,
    devices: HashMap<String, DeviceHandle>,
    events_tx: UnboundedSender<DeviceEvent>,
    events_rx: UnboundedReceiver<DeviceEvent>,
}

impl SensorRegistry {
    pub fn new(config: ExporterConfig, opener: Arc<dyn PortOpener>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            opener,
            devices: HashMap::new(),
            events_tx,
            events_rx,
        }
    }

    /// Ports with a running worker, sorted.
    pub fn ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = self.devices.keys().cloned().collect();
        ports.sort();
        ports
    }

    /// Serve until the command channel closes or the event receiver goes away.
    pub async fn run(
        mut self,
        mut commands: UnboundedReceiver<ControlCommand>,
        events: UnboundedSender<DeviceEvent>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                Some(event) = self.events_rx.recv() => {
                    self.observe(&event);
                    if events.send(event).is_err() {
                        break;
                    }
                }
            }
        }
        self.shutdown().await;
    }

    /// Route one command from the control surface.
    pub fn handle(&mut self, cmd: ControlCommand) {
        debug!("control command {:?}", cmd);
        match cmd {
            ControlCommand::StartScanning {} => self.start_scanning(),
            ControlCommand::RequestMacAddress { port } => {
                self.dispatch(&port, DeviceCommand::RequestMacAddress)
            }
            ControlCommand::ClearSensorStorage { port } => self.dispatch(&port, DeviceCommand::ClearStorage),
            ControlCommand::RequestFileData { exporting_sensors } => {
                let dir = self.config.batch_dir();
                info!("exporting {} sensors into {}", exporting_sensors.len(), dir.display());
                for sensor in exporting_sensors {
                    self.dispatch(
                        &sensor.port,
                        DeviceCommand::RequestFileData {
                            files: sensor.selected_file_list,
                            dir: dir.clone(),
                        },
                    );
                }
            }
            ControlCommand::StopExportingFileData { exporting_sensors } => {
                for sensor in exporting_sensors {
                    self.dispatch(&sensor.port, DeviceCommand::StopFileData);
                }
            }
            ControlCommand::SelectExportedData { port, field_ids } => {
                self.dispatch(&port, DeviceCommand::SelectExportedData(field_ids))
            }
        }
    }

    /// Follow-up requests implied by a device event, and bookkeeping on close.
    fn observe(&mut self, event: &DeviceEvent) {
        if let Some(port) = event.port() {
            trace!("{} event {:?}", port, event);
        }
        match event {
            DeviceEvent::MacAddressReady { port, .. } => self.dispatch(port, DeviceCommand::RequestTag),
            DeviceEvent::TagReady { port, .. } | DeviceEvent::StorageCleared { port } => {
                self.dispatch(port, DeviceCommand::RequestFlashInfo)
            }
            DeviceEvent::FlashInfoReady { port, .. } => self.dispatch(port, DeviceCommand::RequestFileInfo),
            DeviceEvent::ConnectionClosed { port, .. } => {
                if self.devices.remove(port).is_some() {
                    info!("{} removed", port);
                }
            }
            _ => {}
        }
    }

    fn start_scanning(&mut self) {
        for port in self.config.ports.clone() {
            if self.devices.contains_key(&port) {
                debug!("{} already open", port);
                continue;
            }
            match self.opener.open(&port) {
                Ok(transport) => {
                    self.spawn_worker(&port, transport);
                    self.events_tx.emit(DeviceEvent::SensorDiscovered {
                        port,
                        address: String::new(),
                    });
                }
                Err(e) => {
                    warn!("cannot open {}: {}", port, e);
                    self.events_tx.emit(DeviceEvent::Error {
                        port,
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    fn spawn_worker(&mut self, port: &str, transport: Box<dyn Transport>) {
        let conn = SensorConnection::new(port, transport, &self.config);
        let (commands, rx) = mpsc::unbounded_channel();
        let events = self.events_tx.clone();
        let worker = tokio::task::spawn_blocking(move || run_worker(conn, rx, events));
        self.devices
            .insert(port.to_string(), DeviceHandle { commands, worker });
    }

    fn dispatch(&mut self, port: &str, cmd: DeviceCommand) {
        let Some(device) = self.devices.get(port) else {
            warn!("{:?} for unknown port {}", cmd, port);
            self.events_tx.emit(DeviceEvent::Error {
                port: port.to_string(),
                message: format!("{} is not open", port),
            });
            return;
        };
        if device.commands.send(cmd).is_err() {
            debug!("{} worker already stopped", port);
        }
    }

    async fn shutdown(&mut self) {
        for (port, device) in self.devices.drain() {
            drop(device.commands);
            if let Err(e) = device.worker.await {
                warn!("{} worker panicked: {}", port, e);
            }
        }
    }
}

/// Blocking device loop: drain queued commands, then one timed read.
fn run_worker(
    mut conn: SensorConnection,
    mut commands: UnboundedReceiver<DeviceCommand>,
    mut events: UnboundedSender<DeviceEvent>,
) {
    let mut buf = vec![0u8; READ_BUF_LEN];
    'serve: loop {
        loop {
            match commands.try_recv() {
                Ok(cmd) => {
                    if let Err(e) = conn.command(cmd, &mut events).into_result() {
                        debug!("{}: command rejected: {}", conn.port(), e);
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break 'serve,
            }
        }
        if conn.state() == DeviceState::Closed || conn.service(&mut buf, &mut events).is_err() {
            break;
        }
    }
    info!("{} closed", conn.port());
    events.emit(DeviceEvent::ConnectionClosed {
        port: conn.port().to_string(),
        address: conn.address().to_string(),
    });
}
