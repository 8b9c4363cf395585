//! DOT sensor driver and recording exporter.
//!
//! This crate talks to DOT wearable motion sensors over their serial docking
//! connection using the XBus/XBLE framed protocol, and exports recordings from
//! the sensors' onboard flash to CSV.
//!
//! # Layers
//!
//! 1. [`xbus`] builds and recognises frames; [`reassembler`] turns arbitrary
//!    transport reads back into frames.
//! 2. [`flash`] and [`fields`] decode flash layouts and per-sample records.
//! 3. [`sensor::SensorConnection`] is the per-device state machine and
//!    [`export::ExportSession`] the CSV side of an export batch.
//! 4. [`registry::SensorRegistry`] runs one worker per open port and bridges
//!    [`events::ControlCommand`]s and [`events::DeviceEvent`]s to a control
//!    surface.

pub mod config;
pub mod errors;
pub mod events;
pub mod export;
pub mod fields;
pub mod flash;
pub mod logging;
pub mod reassembler;
pub mod registry;
pub mod sensor;
pub mod transport;
pub mod xbus;

pub use config::ExporterConfig;
pub use errors::*;
pub use events::{ControlCommand, DeviceEvent, EventSink, ExportingSensor};
pub use fields::FieldId;
pub use flash::{FlashLayout, RecordingFile};
pub use registry::SensorRegistry;
pub use sensor::{CommandOutcome, DeviceCommand, DeviceState, SensorConnection};
pub use transport::{PortOpener, SerialOpener, Transport};
