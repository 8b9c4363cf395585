//! In-memory DOT sensor that answers the host's frames like the real device.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dot_exporter::errors::{DriverError, Result};
use dot_exporter::fields::{self, FieldId};
use dot_exporter::transport::{PortOpener, Transport};
use dot_exporter::xbus;

pub const EXTENT: u64 = 55 * 4096;

#[derive(Debug, Clone)]
pub struct SimFile {
    /// Number of 0xCC extents; one sample is streamed per extent.
    pub extents: usize,
    pub created: u32,
}

#[derive(Debug)]
pub struct DeviceModel {
    pub mac: [u8; 6],
    pub tag: String,
    pub capacity: u32,
    pub files: Vec<SimFile>,
    /// Data count left out of the first transmission of a file.
    pub drop_once: Option<u32>,
    /// Largest read handed to the host.
    pub chunk: usize,
    /// Delay before every non-empty read.
    pub pace: Option<Duration>,
    /// Every frame the host wrote.
    pub received: Vec<Vec<u8>>,
    fields: Vec<FieldId>,
    streaming: Option<usize>,
    outbox: VecDeque<u8>,
}

impl DeviceModel {
    pub fn new(capacity: u32, files: Vec<SimFile>) -> Self {
        Self {
            mac: [0x02, 0x01, 0x00, 0xCD, 0x22, 0xD4],
            tag: "DOT".into(),
            capacity,
            files,
            drop_once: None,
            chunk: 13,
            pace: None,
            received: Vec::new(),
            fields: FieldId::DEFAULT_SELECTION.to_vec(),
            streaming: None,
            outbox: VecDeque::new(),
        }
    }

    pub fn received_with_mid(&self, mid: u8) -> usize {
        self.received
            .iter()
            .filter(|f| xbus::recording_mid(f) == Some(mid))
            .count()
    }

    fn reply(&mut self, bytes: &[u8]) {
        self.outbox.extend(bytes.iter().copied());
    }

    fn handle(&mut self, frame: &[u8]) {
        self.received.push(frame.to_vec());
        let group = frame[xbus::GROUP_OFFSET];
        let mid = frame[xbus::XBLE_MID_OFFSET];
        let args = &frame[xbus::XBLE_DATA_OFFSET..frame.len() - 2];

        if group == xbus::GROUP_CONFIGURATION {
            let data = match mid {
                xbus::CMD_REQUEST_MAC => self.mac.to_vec(),
                _ => self.tag.clone().into_bytes(),
            };
            let mut payload = vec![xbus::GROUP_CONFIGURATION, data.len() as u8];
            payload.extend(data);
            self.reply(&xbus::encode(xbus::MID_COMMAND, &payload).unwrap());
            return;
        }

        match mid {
            xbus::CMD_CLEAR_STORAGE => {
                self.files.clear();
                self.reply(&xbus::ack(mid, &[]).unwrap());
                self.reply(&xbus::storage_cleared_ack());
            }
            xbus::CMD_REQUEST_FLASH_INFO => {
                let response = self.flash_info();
                self.reply(&response);
            }
            xbus::CMD_REQUEST_FILE_INFO => {
                let index = args[0];
                let created = self.files[index as usize - 1].created;
                let mut data = vec![0u8; 20];
                data[10..14].copy_from_slice(&created.to_le_bytes());
                self.reply(&xbus::ack(mid, &[index]).unwrap());
                self.reply(&xbus::command(
                    xbus::GROUP_DATA_RECORDING,
                    xbus::NOTIFY_FILE_INFO_DATA,
                    &data,
                ).unwrap());
                self.reply(&xbus::file_info_done());
            }
            xbus::CMD_SELECT_EXPORTED_DATA => {
                self.fields = args
                    .iter()
                    .filter_map(|&id| FieldId::try_from(id).ok())
                    .collect();
            }
            xbus::CMD_REQUEST_FILE_DATA => {
                let index = args[0] as usize;
                self.streaming = Some(index);
                self.outbox.clear();
                self.reply(&xbus::ack(mid, &[args[0]]).unwrap());
                let drop = self.drop_once.take();
                self.stream_from(index, 0, drop);
            }
            xbus::CMD_RETRANSMIT => {
                let from = u32::from_le_bytes([args[0], args[1], args[2], args[3]]);
                self.outbox.clear();
                if let Some(index) = self.streaming {
                    self.stream_from(index, from, None);
                }
            }
            xbus::CMD_STOP_FILE_DATA => {
                self.streaming = None;
                self.outbox.clear();
            }
            _ => {}
        }
    }

    fn stream_from(&mut self, index: usize, from: u32, skip: Option<u32>) {
        let samples = self.files[index - 1].extents as u32;
        let body_len = fields::sample_len(&self.fields) - fields::DATA_COUNT_LEN;
        for count in from..samples {
            if Some(count) == skip {
                continue;
            }
            let mut data = count.to_le_bytes().to_vec();
            data.extend(std::iter::repeat(0u8).take(body_len));
            if self.fields.first() == Some(&FieldId::Timestamp) {
                data[4..8].copy_from_slice(&(count * 16_667).to_le_bytes());
            }
            self.reply(&xbus::command(
                xbus::GROUP_DATA_RECORDING,
                xbus::NOTIFY_FILE_DATA,
                &data,
            ).unwrap());
        }
        self.reply(&xbus::file_data_done());
    }

    fn flash_info(&self) -> Vec<u8> {
        let mut first = vec![0u8; 128];
        first[14..18].copy_from_slice(&self.capacity.to_le_bytes());
        let mut markers = Vec::new();
        for file in &self.files {
            markers.push(0xEE);
            markers.extend(std::iter::repeat(0xCC).take(file.extents));
        }
        markers.resize(128, 0xFF);

        let mut bytes = xbus::ack(xbus::CMD_REQUEST_FLASH_INFO, &[]).unwrap();
        bytes.extend(xbus::command(
            xbus::GROUP_DATA_RECORDING,
            xbus::NOTIFY_FLASH_INFO_DATA,
            &first,
        ).unwrap());
        bytes.extend(xbus::command(
            xbus::GROUP_DATA_RECORDING,
            xbus::NOTIFY_FLASH_INFO_DATA,
            &markers,
        ).unwrap());
        bytes.extend(xbus::flash_info_done());
        bytes
    }
}

/// Transport end of a [`DeviceModel`].
#[derive(Clone)]
pub struct SimulatedDevice(pub Arc<Mutex<DeviceModel>>);

impl SimulatedDevice {
    pub fn new(model: DeviceModel) -> Self {
        Self(Arc::new(Mutex::new(model)))
    }
}

impl Read for SimulatedDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let pace = self.0.lock().unwrap().pace;
        if let Some(delay) = pace {
            std::thread::sleep(delay);
        }
        let mut model = self.0.lock().unwrap();
        if model.outbox.is_empty() {
            drop(model);
            std::thread::sleep(Duration::from_millis(1));
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(model.chunk).min(model.outbox.len());
        for slot in buf.iter_mut().take(n) {
            *slot = model.outbox.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for SimulatedDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().handle(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Opens simulated devices by port name.
pub struct SimOpener {
    pub devices: Vec<(String, SimulatedDevice)>,
}

impl PortOpener for SimOpener {
    fn open(&self, port: &str) -> Result<Box<dyn Transport>> {
        self.devices
            .iter()
            .find(|(name, _)| name == port)
            .map(|(_, dev)| Box::new(dev.clone()) as Box<dyn Transport>)
            .ok_or_else(|| DriverError::Protocol(format!("no device on {port}")))
    }
}
