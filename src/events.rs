//! Messages exchanged with the control surface.
//!
//! Both directions use the same JSON shape as the legacy event channel:
//! `{"event": "<name>", "parameters": {...}}`.

use serde::{Deserialize, Serialize};

use crate::fields::FieldId;
use crate::flash::RecordingFile;

/// Events emitted by the device layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "event",
    content = "parameters",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum DeviceEvent {
    SensorDiscovered {
        port: String,
        address: String,
    },
    MacAddressReady {
        port: String,
        address: String,
    },
    TagReady {
        port: String,
        tag: String,
    },
    FlashInfoReady {
        port: String,
        storage_space: u64,
        available_space: i64,
        file_count: usize,
    },
    FileInfoReady {
        port: String,
        file_list: Vec<RecordingFile>,
    },
    /// Running total for the batch; `lost_samples` counts samples dropped by forced resync.
    BytesExported {
        port: String,
        total_bytes: u64,
        lost_samples: u64,
    },
    FileExportDone {
        port: String,
        file_index: u8,
        is_all_done: bool,
        lost_samples: u64,
    },
    ExportedDir {
        path: String,
    },
    StorageCleared {
        port: String,
    },
    StorageClearError {
        port: String,
    },
    ConnectionClosed {
        port: String,
        address: String,
    },
    Error {
        port: String,
        message: String,
    },
}

impl DeviceEvent {
    /// Port the event concerns, if any.
    pub fn port(&self) -> Option<&str> {
        match self {
            DeviceEvent::SensorDiscovered { port, .. }
            | DeviceEvent::MacAddressReady { port, .. }
            | DeviceEvent::TagReady { port, .. }
            | DeviceEvent::FlashInfoReady { port, .. }
            | DeviceEvent::FileInfoReady { port, .. }
            | DeviceEvent::BytesExported { port, .. }
            | DeviceEvent::FileExportDone { port, .. }
            | DeviceEvent::StorageCleared { port }
            | DeviceEvent::StorageClearError { port }
            | DeviceEvent::ConnectionClosed { port, .. }
            | DeviceEvent::Error { port, .. } => Some(port),
            DeviceEvent::ExportedDir { .. } => None,
        }
    }
}

/// A sensor taking part in an export batch, with the files chosen for it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportingSensor {
    pub port: String,
    #[serde(default)]
    pub selected_file_list: Vec<RecordingFile>,
}

/// Commands accepted from the control surface.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(
    tag = "event",
    content = "parameters",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ControlCommand {
    StartScanning {},
    RequestMacAddress {
        port: String,
    },
    ClearSensorStorage {
        port: String,
    },
    RequestFileData {
        exporting_sensors: Vec<ExportingSensor>,
    },
    StopExportingFileData {
        exporting_sensors: Vec<ExportingSensor>,
    },
    SelectExportedData {
        port: String,
        #[serde(default, alias = "selectExportedDataIds")]
        field_ids: Vec<FieldId>,
    },
}

/// Destination for device events.
pub trait EventSink {
    fn emit(&mut self, event: DeviceEvent);
}

impl EventSink for Vec<DeviceEvent> {
    fn emit(&mut self, event: DeviceEvent) {
        self.push(event);
    }
}

impl EventSink for tokio::sync::mpsc::UnboundedSender<DeviceEvent> {
    fn emit(&mut self, event: DeviceEvent) {
        // The receiver only goes away during shutdown.
        let _ = self.send(event);
    }
}
