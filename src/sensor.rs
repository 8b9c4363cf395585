//! Per-device protocol state machine.
//!
//! A `SensorConnection` owns one transport and drives exactly one request at a
//! time. Commands are accepted only from `Idle`; the file-info and file-data
//! loops re-issue their own per-file requests until the list is exhausted.
//! Bytes read from the transport are fed through [`SensorConnection::on_bytes`]
//! and handled according to the current state; nothing is interpreted while
//! idle.
//!
//! Faults never escape as errors. Transport failures close the connection and
//! are reported as [`DeviceEvent::Error`]; protocol oddities are logged and
//! skipped.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};

use crate::config::ExporterConfig;
use crate::errors::{DriverError, Result};
use crate::events::{DeviceEvent, EventSink};
use crate::export::{ExportSession, OpenOutcome, UnitOutcome};
use crate::fields::FieldId;
use crate::flash::{self, FlashLayout, RecordingFile};
use crate::reassembler::StreamReassembler;
use crate::transport::{self, Transport};
use crate::xbus;

/// Output file prefix until the device has reported its own tag.
pub const DEFAULT_TAG: &str = "Xsens DOT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Idle,
    RequestingMac,
    RequestingTag,
    RequestingFlashInfo,
    ClearingStorage,
    RequestingFileInfo,
    RequestingFileData,
    /// The transport failed; no further commands are accepted.
    Closed,
}

impl DeviceState {
    /// States bounded by the request timeout. File-data export is not.
    fn is_timed(self) -> bool {
        matches!(
            self,
            DeviceState::RequestingMac
                | DeviceState::RequestingTag
                | DeviceState::RequestingFlashInfo
                | DeviceState::ClearingStorage
                | DeviceState::RequestingFileInfo
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    RequestMacAddress,
    RequestTag,
    RequestFlashInfo,
    ClearStorage,
    /// Fetch names for every file found by the last flash-info request.
    RequestFileInfo,
    RequestFileData {
        files: Vec<RecordingFile>,
        dir: PathBuf,
    },
    StopFileData,
    /// An empty list selects [`FieldId::DEFAULT_SELECTION`].
    SelectExportedData(Vec<FieldId>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Accepted,
    Rejected(DeviceState),
}

impl CommandOutcome {
    pub fn into_result(self) -> Result<()> {
        match self {
            CommandOutcome::Accepted => Ok(()),
            CommandOutcome::Rejected(state) => Err(DriverError::Busy(state)),
        }
    }
}

pub struct SensorConnection {
    port: String,
    transport: Box<dyn Transport>,
    state: DeviceState,
    reassembler: StreamReassembler,
    address: String,
    tag: String,
    files: Vec<RecordingFile>,
    fields: Vec<FieldId>,
    /// 1-based index of the file whose info is outstanding.
    file_info_cursor: usize,
    export: Option<ExportSession>,
    retransmission_budget: u32,
    request_timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl SensorConnection {
    pub fn new(port: impl Into<String>, transport: Box<dyn Transport>, config: &ExporterConfig) -> Self {
        Self {
            port: port.into(),
            transport,
            state: DeviceState::Idle,
            reassembler: StreamReassembler::new(),
            address: String::new(),
            tag: DEFAULT_TAG.to_string(),
            files: Vec::new(),
            fields: FieldId::DEFAULT_SELECTION.to_vec(),
            file_info_cursor: 0,
            export: None,
            retransmission_budget: config.retransmission_budget,
            request_timeout: config.request_timeout,
            deadline: None,
        }
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// MAC address, empty until the device has reported it.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Recordings found by the last flash-info request.
    pub fn files(&self) -> &[RecordingFile] {
        &self.files
    }

    pub fn fields(&self) -> &[FieldId] {
        &self.fields
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    pub fn command<S: EventSink + ?Sized>(&mut self, cmd: DeviceCommand, sink: &mut S) -> CommandOutcome {
        match cmd {
            DeviceCommand::SelectExportedData(ids) => self.select_exported_data(ids, sink),
            DeviceCommand::StopFileData => self.stop_file_data(sink),
            other if self.state != DeviceState::Idle => {
                debug!("{}: {:?} rejected in {:?}", self.port, other, self.state);
                CommandOutcome::Rejected(self.state)
            }
            DeviceCommand::RequestMacAddress => {
                self.begin(DeviceState::RequestingMac, xbus::request_mac_address(), sink)
            }
            DeviceCommand::RequestTag => self.begin(DeviceState::RequestingTag, xbus::request_tag(), sink),
            DeviceCommand::RequestFlashInfo => {
                self.begin(DeviceState::RequestingFlashInfo, xbus::request_flash_info(), sink)
            }
            DeviceCommand::ClearStorage => {
                let now = u32::try_from(chrono::Utc::now().timestamp()).unwrap_or(u32::MAX);
                self.begin(DeviceState::ClearingStorage, xbus::clear_storage(now), sink)
            }
            DeviceCommand::RequestFileInfo => {
                if self.files.is_empty() {
                    sink.emit(DeviceEvent::FileInfoReady {
                        port: self.port.clone(),
                        file_list: Vec::new(),
                    });
                } else {
                    self.file_info_cursor = 1;
                    self.request_next_file_info(sink);
                }
                CommandOutcome::Accepted
            }
            DeviceCommand::RequestFileData { files, dir } => {
                if files.is_empty() {
                    info!("{}: no files selected for export", self.port);
                    return CommandOutcome::Accepted;
                }
                self.export = Some(ExportSession::new(
                    files,
                    dir,
                    self.fields.clone(),
                    self.retransmission_budget,
                ));
                self.start_next_file(sink);
                CommandOutcome::Accepted
            }
        }
    }

    fn begin<S: EventSink + ?Sized>(&mut self, next: DeviceState, frame: Vec<u8>, sink: &mut S) -> CommandOutcome {
        self.reassembler.clear();
        self.state = next;
        self.deadline = self.request_timeout.map(|t| Instant::now() + t);
        self.send(&frame, sink);
        CommandOutcome::Accepted
    }

    fn select_exported_data<S: EventSink + ?Sized>(&mut self, ids: Vec<FieldId>, sink: &mut S) -> CommandOutcome {
        if matches!(self.state, DeviceState::RequestingFileData | DeviceState::Closed) {
            return CommandOutcome::Rejected(self.state);
        }
        let fields = if ids.is_empty() {
            FieldId::DEFAULT_SELECTION.to_vec()
        } else {
            ids
        };
        let mut seen = HashSet::new();
        if fields.len() > FieldId::ALL.len() || !fields.iter().all(|id| seen.insert(*id)) {
            warn!("{}: refusing field selection {:?}", self.port, fields);
            return CommandOutcome::Rejected(self.state);
        }
        let wire: Vec<u8> = fields.iter().map(|&id| u8::from(id)).collect();
        let frame = match xbus::select_exported_data(&wire) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("{}: {}", self.port, e);
                return CommandOutcome::Rejected(self.state);
            }
        };
        info!("{}: exporting fields {:?}", self.port, fields);
        self.fields = fields;
        self.send(&frame, sink);
        CommandOutcome::Accepted
    }

    fn stop_file_data<S: EventSink + ?Sized>(&mut self, sink: &mut S) -> CommandOutcome {
        if self.state != DeviceState::RequestingFileData {
            return CommandOutcome::Rejected(self.state);
        }
        self.send(&xbus::stop_file_data(), sink);
        if let Some(mut session) = self.export.take() {
            if let Err(e) = session.stop() {
                warn!("{}: flushing stopped export failed: {}", self.port, e);
            }
        }
        self.reassembler.clear();
        if self.state != DeviceState::Closed {
            self.set_idle();
        }
        info!("{}: export stopped", self.port);
        CommandOutcome::Accepted
    }

    // ------------------------------------------------------------------------
    // Inbound bytes
    // ------------------------------------------------------------------------

    /// Read once from the transport, handle what arrived and check the request deadline.
    pub fn service<S: EventSink + ?Sized>(&mut self, buf: &mut [u8], sink: &mut S) -> Result<usize> {
        let n = match transport::read_chunk(&mut *self.transport, buf) {
            Ok(n) => n,
            Err(e) => {
                let err = DriverError::from(e);
                self.fail(&err, sink);
                return Err(err);
            }
        };
        if n > 0 {
            self.on_bytes(&buf[..n], sink);
        }
        self.poll(Instant::now(), sink);
        Ok(n)
    }

    /// Handle one transport read of arbitrary size.
    pub fn on_bytes<S: EventSink + ?Sized>(&mut self, bytes: &[u8], sink: &mut S) {
        match self.state {
            DeviceState::Idle | DeviceState::Closed => {
                trace!("{}: ignoring {} bytes in {:?}", self.port, bytes.len(), self.state);
                return;
            }
            DeviceState::RequestingFileData => {}
            _ => debug!("{} <- {}", self.port, hex::encode(bytes)),
        }
        self.reassembler.feed(bytes);

        match self.state {
            DeviceState::ClearingStorage => self.on_clear_storage(sink),
            DeviceState::RequestingMac => self.on_mac_address(sink),
            DeviceState::RequestingTag => self.on_tag(sink),
            DeviceState::RequestingFlashInfo => self.on_flash_info(sink),
            DeviceState::RequestingFileInfo => self.on_file_info(sink),
            DeviceState::RequestingFileData => self.on_file_data(sink),
            DeviceState::Idle | DeviceState::Closed => {}
        }
    }

    /// Abandon a timed request whose deadline has passed.
    pub fn poll<S: EventSink + ?Sized>(&mut self, now: Instant, sink: &mut S) {
        let Some(deadline) = self.deadline else {
            return;
        };
        if now < deadline || !self.state.is_timed() {
            return;
        }
        let state = self.state;
        let err = DriverError::Timeout(format!("no response to {:?}", state));
        warn!("{}: {}", self.port, err);
        sink.emit(DeviceEvent::Error {
            port: self.port.clone(),
            message: err.to_string(),
        });
        if state == DeviceState::ClearingStorage {
            sink.emit(DeviceEvent::StorageClearError {
                port: self.port.clone(),
            });
        }
        self.reassembler.clear();
        self.set_idle();
    }

    fn on_clear_storage<S: EventSink + ?Sized>(&mut self, sink: &mut S) {
        let cleared = xbus::storage_cleared_ack();
        while let Some(unit) = self.reassembler.next_unit() {
            if xbus::matches(&unit, &cleared) {
                info!("{}: storage cleared", self.port);
                self.set_idle();
                sink.emit(DeviceEvent::StorageCleared {
                    port: self.port.clone(),
                });
                return;
            }
        }
    }

    fn on_mac_address<S: EventSink + ?Sized>(&mut self, sink: &mut S) {
        let Some(data) = self.take_config_response() else {
            return;
        };
        if data.len() != xbus::MAC_ADDRESS_LEN {
            debug!("{}: ignoring {}-byte configuration response", self.port, data.len());
            return;
        }
        self.address = xbus::format_mac_address(&data);
        self.set_idle();
        sink.emit(DeviceEvent::MacAddressReady {
            port: self.port.clone(),
            address: self.address.clone(),
        });
    }

    fn on_tag<S: EventSink + ?Sized>(&mut self, sink: &mut S) {
        let Some(data) = self.take_config_response() else {
            return;
        };
        if data.is_empty() {
            return;
        }
        self.tag = String::from_utf8_lossy(&data).into_owned();
        self.set_idle();
        sink.emit(DeviceEvent::TagReady {
            port: self.port.clone(),
            tag: self.tag.clone(),
        });
    }

    /// Remove the first complete configuration response from the buffer.
    fn take_config_response(&mut self) -> Option<Vec<u8>> {
        let (end, data) = xbus::find_config_response(self.reassembler.as_slice())
            .map(|(end, data)| (end, data.to_vec()))?;
        let rest = self.reassembler.as_slice()[end..].to_vec();
        self.reassembler.clear();
        self.reassembler.feed(&rest);
        Some(data)
    }

    fn on_flash_info<S: EventSink + ?Sized>(&mut self, sink: &mut S) {
        let Some(response) = self
            .reassembler
            .take_if_ends_with(&xbus::flash_info_done(), xbus::FLASH_INFO_ACK_LEN)
        else {
            return;
        };
        self.set_idle();
        match FlashLayout::parse(&response) {
            Ok(layout) => {
                info!(
                    "{}: capacity {} bytes, {} used, {} files",
                    self.port,
                    layout.capacity,
                    layout.used,
                    layout.file_count()
                );
                sink.emit(DeviceEvent::FlashInfoReady {
                    port: self.port.clone(),
                    storage_space: layout.capacity,
                    available_space: layout.available(),
                    file_count: layout.file_count(),
                });
                self.files = layout.files;
            }
            Err(e) => {
                warn!("{}: unreadable flash info: {}", self.port, e);
                self.files.clear();
                sink.emit(DeviceEvent::Error {
                    port: self.port.clone(),
                    message: e.to_string(),
                });
            }
        }
    }

    fn request_next_file_info<S: EventSink + ?Sized>(&mut self, sink: &mut S) {
        let Some(index) = self.files.get(self.file_info_cursor - 1).map(|f| f.index) else {
            return;
        };
        self.begin(DeviceState::RequestingFileInfo, xbus::request_file_info(index), sink);
    }

    fn on_file_info<S: EventSink + ?Sized>(&mut self, sink: &mut S) {
        let done = xbus::file_info_done();
        let Some(response) = self.reassembler.take_if_ends_with(&done, done.len()) else {
            return;
        };
        let timestamp = match flash::file_info_timestamp(&response) {
            Ok(ts) => ts,
            Err(e) => {
                warn!("{}: unreadable file info: {}", self.port, e);
                self.set_idle();
                sink.emit(DeviceEvent::Error {
                    port: self.port.clone(),
                    message: e.to_string(),
                });
                return;
            }
        };
        if let Some(file) = self.files.get_mut(self.file_info_cursor - 1) {
            file.file_name = flash::recording_file_name(i64::from(timestamp));
            debug!("{}: file {} is {}", self.port, file.index, file.file_name);
        }

        self.file_info_cursor += 1;
        if self.file_info_cursor > self.files.len() {
            self.set_idle();
            sink.emit(DeviceEvent::FileInfoReady {
                port: self.port.clone(),
                file_list: self.files.clone(),
            });
        } else {
            self.request_next_file_info(sink);
        }
    }

    // ------------------------------------------------------------------------
    // File-data export
    // ------------------------------------------------------------------------

    /// Open the next file of the batch and request its data. Files whose
    /// output already exists are reported done without being requested.
    fn start_next_file<S: EventSink + ?Sized>(&mut self, sink: &mut S) {
        loop {
            let Some(session) = self.export.as_mut() else {
                self.set_idle();
                return;
            };
            let Some(index) = session.current_file().map(|f| f.index) else {
                self.export = None;
                self.set_idle();
                return;
            };

            match session.open_current(&self.tag, &self.address) {
                Ok(Some(OpenOutcome::Opened(_))) => {
                    let path = session.dir().display().to_string();
                    sink.emit(DeviceEvent::ExportedDir { path });
                    self.reassembler.clear();
                    self.state = DeviceState::RequestingFileData;
                    self.deadline = None;
                    self.send(&xbus::request_file_data(index), sink);
                    return;
                }
                Ok(Some(OpenOutcome::Exists(_))) => {
                    if !self.finish_file(sink) {
                        return;
                    }
                }
                Ok(None) => {
                    self.export = None;
                    self.set_idle();
                    return;
                }
                Err(e) => {
                    self.abort_export(&e, sink);
                    return;
                }
            }
        }
    }

    fn on_file_data<S: EventSink + ?Sized>(&mut self, sink: &mut S) {
        let done = xbus::file_data_done();
        let mut written = false;
        let mut file_done = false;

        while let Some(unit) = self.reassembler.next_unit() {
            if xbus::matches(&unit, &done) {
                file_done = true;
                break;
            }
            if xbus::recording_mid(&unit) != Some(xbus::NOTIFY_FILE_DATA) {
                continue;
            }
            let outcome = match self.export.as_mut() {
                Some(session) => session.accept(&unit),
                None => break,
            };
            match outcome {
                Ok(UnitOutcome::Written) => written = true,
                Ok(UnitOutcome::Resend(from)) => {
                    self.reassembler.clear();
                    self.send(&xbus::retransmit(from), sink);
                    break;
                }
                Ok(UnitOutcome::Duplicate | UnitOutcome::AwaitingResend | UnitOutcome::Dropped) => {}
                Err(e) => {
                    self.abort_export(&e, sink);
                    return;
                }
            }
        }

        if written {
            if let Some(session) = self.export.as_ref() {
                sink.emit(DeviceEvent::BytesExported {
                    port: self.port.clone(),
                    total_bytes: session.total_bytes(),
                    lost_samples: session.lost_samples(),
                });
            }
        }
        if file_done && self.finish_file(sink) {
            self.start_next_file(sink);
        }
    }

    /// Close the current file and report it. Returns true when more files remain.
    fn finish_file<S: EventSink + ?Sized>(&mut self, sink: &mut S) -> bool {
        let finished = match self.export.as_mut() {
            Some(session) => session.finish_file(),
            None => Ok(None),
        };
        let done = match finished {
            Ok(Some(done)) => done,
            Ok(None) => {
                self.export = None;
                self.set_idle();
                return false;
            }
            Err(e) => {
                self.abort_export(&e, sink);
                return false;
            }
        };

        info!(
            "{}: file {} exported{}",
            self.port,
            done.file_index,
            if done.is_all_done { ", batch complete" } else { "" }
        );
        self.reassembler.clear();
        sink.emit(DeviceEvent::FileExportDone {
            port: self.port.clone(),
            file_index: done.file_index,
            is_all_done: done.is_all_done,
            lost_samples: done.lost_samples,
        });
        if done.is_all_done {
            self.export = None;
            self.set_idle();
        }
        !done.is_all_done
    }

    fn abort_export<S: EventSink + ?Sized>(&mut self, err: &DriverError, sink: &mut S) {
        error!("{}: export aborted: {}", self.port, err);
        if let Some(mut session) = self.export.take() {
            let _ = session.stop();
        }
        self.reassembler.clear();
        sink.emit(DeviceEvent::Error {
            port: self.port.clone(),
            message: err.to_string(),
        });
        if self.state != DeviceState::Closed {
            self.set_idle();
        }
    }

    // ------------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------------

    fn send<S: EventSink + ?Sized>(&mut self, frame: &[u8], sink: &mut S) -> bool {
        debug!("{} -> {}", self.port, hex::encode(frame));
        let written = self
            .transport
            .write_all(frame)
            .and_then(|_| self.transport.flush());
        match written {
            Ok(()) => true,
            Err(e) => {
                self.fail(&DriverError::from(e), sink);
                false
            }
        }
    }

    /// Report a transport failure and close the connection for good.
    fn fail<S: EventSink + ?Sized>(&mut self, err: &DriverError, sink: &mut S) {
        error!("{}: transport failure: {}", self.port, err);
        sink.emit(DeviceEvent::Error {
            port: self.port.clone(),
            message: err.to_string(),
        });
        if self.state == DeviceState::ClearingStorage {
            sink.emit(DeviceEvent::StorageClearError {
                port: self.port.clone(),
            });
        }
        if let Some(mut session) = self.export.take() {
            let _ = session.stop();
        }
        self.reassembler.clear();
        self.deadline = None;
        self.state = DeviceState::Closed;
    }

    fn set_idle(&mut self) {
        self.state = DeviceState::Idle;
        self.deadline = None;
    }
}
