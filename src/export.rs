//! Per-device export batch: CSV output and file-data sequencing.
//!
//! A batch exports the selected recordings one after another into a single
//! directory. Only one output file is open at a time. Incoming file-data units
//! are accepted strictly in data-count order; a gap asks the device to resend
//! from the first missing sample, and a gap that survives the retransmission
//! budget is skipped over and counted as lost.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::errors::Result;
use crate::fields::{self, FieldId, Sample};
use crate::flash::RecordingFile;
use crate::xbus;

/// First line of every export, understood by spreadsheet tools.
pub const CSV_SEPARATOR_HINT: &str = "sep=,";

/// Header, MID and data count inside the XBLE length of a file-data unit.
const UNIT_OVERHEAD: u64 = 5;

/// Result of preparing the output for the current file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    Opened(PathBuf),
    /// The target already exists and is left untouched.
    Exists(PathBuf),
}

/// What happened to one file-data unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    /// Decoded and appended to the output.
    Written,
    /// Sequence number already consumed.
    Duplicate,
    /// A gap was found; ask the device to resend from this data count.
    Resend(u32),
    /// Still waiting for the resend to close a gap.
    AwaitingResend,
    /// In sequence but not decodable with the current selection.
    Dropped,
}

/// Summary of a file whose end-of-export notification arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileDone {
    pub file_index: u8,
    pub is_all_done: bool,
    pub lost_samples: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Retransmission {
    expected: u32,
    retrying: bool,
    countdown: u32,
    /// Highest data count seen past the gap while retrying.
    max_received: u32,
}

#[derive(Debug)]
pub struct ExportSession {
    files: Vec<RecordingFile>,
    /// 1-based position in `files`.
    cursor: usize,
    dir: PathBuf,
    fields: Vec<FieldId>,
    budget: u32,
    retry: Retransmission,
    output: Option<BufWriter<File>>,
    total_bytes: u64,
    batch_lost: u64,
    file_samples: u64,
    file_lost: u64,
}

impl ExportSession {
    pub fn new(files: Vec<RecordingFile>, dir: PathBuf, fields: Vec<FieldId>, budget: u32) -> Self {
        Self {
            files,
            cursor: 1,
            dir,
            fields,
            budget,
            retry: Retransmission::default(),
            output: None,
            total_bytes: 0,
            batch_lost: 0,
            file_samples: 0,
            file_lost: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn current_file(&self) -> Option<&RecordingFile> {
        self.files.get(self.cursor.checked_sub(1)?)
    }

    /// True once the cursor has moved past the last selected file.
    pub fn is_all_done(&self) -> bool {
        self.cursor > self.files.len()
    }

    /// Data bytes accepted since the batch started.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Samples skipped by forced resync since the batch started.
    pub fn lost_samples(&self) -> u64 {
        self.batch_lost
    }

    pub fn expected_data_count(&self) -> u32 {
        self.retry.expected
    }

    /// `<dir>/<tag>_<mac without colons>_<file name>.csv` for the current file.
    pub fn output_path(&self, tag: &str, mac: &str) -> Option<PathBuf> {
        let file = self.current_file()?;
        let name = format!("{}_{}_{}.csv", tag, mac.replace(':', ""), file.file_name);
        Some(self.dir.join(name))
    }

    /// Create the batch directory and the current file's CSV with its two header lines.
    pub fn open_current(&mut self, tag: &str, mac: &str) -> Result<Option<OpenOutcome>> {
        let Some(path) = self.output_path(tag, mac) else {
            return Ok(None);
        };
        fs::create_dir_all(&self.dir)?;
        self.retry = Retransmission::default();
        self.file_samples = 0;
        self.file_lost = 0;

        if path.exists() {
            warn!("{} already exists, not overwriting", path.display());
            return Ok(Some(OpenOutcome::Exists(path)));
        }

        let mut out = BufWriter::new(File::create(&path)?);
        writeln!(out, "{}", CSV_SEPARATOR_HINT)?;
        writeln!(out, "{}", fields::header_row(&self.fields))?;
        self.output = Some(out);
        info!("exporting to {}", path.display());
        Ok(Some(OpenOutcome::Opened(path)))
    }

    /// Feed one complete file-data unit through the sequence discipline.
    pub fn accept(&mut self, frame: &[u8]) -> Result<UnitOutcome> {
        let received = fields::data_count(frame)?;
        let expected = self.retry.expected;

        if received > expected {
            self.retry.max_received = self.retry.max_received.max(received);
            if !self.retry.retrying {
                warn!("data count gap: expected {}, received {}", expected, received);
                self.retry.retrying = true;
                self.retry.countdown = self.budget;
                return Ok(UnitOutcome::Resend(expected));
            }
            self.retry.countdown = self.retry.countdown.saturating_sub(1);
            if self.retry.countdown > 0 {
                return Ok(UnitOutcome::AwaitingResend);
            }
            let lost = u64::from(received - expected);
            warn!(
                "resend did not close gap at {}, skipping {} samples",
                expected, lost
            );
            self.file_lost += lost;
            self.batch_lost += lost;
            self.retry.expected = received;
        } else if received < expected {
            return Ok(UnitOutcome::Duplicate);
        }

        self.retry = Retransmission {
            expected: received.wrapping_add(1),
            ..Retransmission::default()
        };

        let sample = match Sample::decode(frame, &self.fields) {
            Ok(sample) => sample,
            Err(e) => {
                warn!("dropping sample {}: {}", received, e);
                self.file_lost += 1;
                self.batch_lost += 1;
                return Ok(UnitOutcome::Dropped);
            }
        };
        if let Some(out) = self.output.as_mut() {
            writeln!(out, "{}", sample.csv_row())?;
        }
        self.file_samples += 1;
        self.total_bytes += u64::from(frame[xbus::XBLE_LEN_OFFSET]).saturating_sub(UNIT_OVERHEAD);
        Ok(UnitOutcome::Written)
    }

    /// Close the current output and move to the next selected file.
    pub fn finish_file(&mut self) -> Result<Option<FileDone>> {
        let Some(file_index) = self.current_file().map(|f| f.index) else {
            return Ok(None);
        };
        if self.retry.retrying {
            let lost = u64::from(self.retry.max_received - self.retry.expected) + 1;
            warn!(
                "file {} ended with a gap open at {}, {} samples lost",
                file_index, self.retry.expected, lost
            );
            self.file_lost += lost;
            self.batch_lost += lost;
            self.retry = Retransmission::default();
        }
        let closed = self.close_output();
        debug!(
            "file {} done: {} samples, {} lost",
            file_index, self.file_samples, self.file_lost
        );
        self.cursor += 1;
        closed?;
        Ok(Some(FileDone {
            file_index,
            is_all_done: self.is_all_done(),
            lost_samples: self.file_lost,
        }))
    }

    /// Flush what was written so far; the rest of the batch is abandoned.
    pub fn stop(&mut self) -> Result<()> {
        self.cursor = self.files.len() + 1;
        self.close_output()
    }

    fn close_output(&mut self) -> Result<()> {
        if let Some(mut out) = self.output.take() {
            out.flush()?;
        }
        Ok(())
    }
}

impl Drop for ExportSession {
    fn drop(&mut self) {
        let _ = self.close_output();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn unit(count: u32, body: &[u8]) -> Vec<u8> {
        let mut data = count.to_le_bytes().to_vec();
        data.extend_from_slice(body);
        xbus::command(xbus::GROUP_DATA_RECORDING, xbus::NOTIFY_FILE_DATA, &data).unwrap()
    }

    fn ts(count: u32) -> Vec<u8> {
        unit(count, &(count * 10).to_le_bytes())
    }

    fn file(index: u8, name: &str) -> RecordingFile {
        RecordingFile {
            index,
            file_name: name.into(),
            size: 0,
        }
    }

    fn session(tmp: &TempDir, budget: u32) -> ExportSession {
        ExportSession::new(
            vec![file(1, "20200913_122640"), file(2, "20200913_130000")],
            tmp.path().join("20200914_080000"),
            vec![FieldId::Timestamp],
            budget,
        )
    }

    #[test]
    fn csv_starts_with_hint_and_header() {
        let tmp = TempDir::new().unwrap();
        let mut s = session(&tmp, 200);
        let opened = s.open_current("Xsens DOT", "D4:22:CD:00:01:02").unwrap();
        let path = tmp
            .path()
            .join("20200914_080000/Xsens DOT_D422CD000102_20200913_122640.csv");
        assert_eq!(opened, Some(OpenOutcome::Opened(path.clone())));

        assert_eq!(s.accept(&ts(0)).unwrap(), UnitOutcome::Written);
        assert_eq!(s.accept(&ts(1)).unwrap(), UnitOutcome::Written);
        let done = s.finish_file().unwrap().unwrap();
        assert_eq!(done.file_index, 1);
        assert!(!done.is_all_done);

        let text = fs::read_to_string(path).unwrap();
        assert_eq!(text, "sep=,\nPacketCounter,SampleTimeFine,\n0,0,\n1,10,\n");
        assert_eq!(s.total_bytes(), 8);
    }

    #[test]
    fn euler_acc_gyr_rows_follow_header_in_arrival_order() {
        let tmp = TempDir::new().unwrap();
        let selection = vec![FieldId::EulerAngles, FieldId::CalibratedAcc, FieldId::CalibratedGyr];
        let mut s = ExportSession::new(vec![file(1, "f")], tmp.path().to_path_buf(), selection, 200);
        let Some(OpenOutcome::Opened(path)) = s.open_current("tag", "mac").unwrap() else {
            panic!("output not opened");
        };

        for count in 0..3u32 {
            let body: Vec<u8> = (0..9)
                .flat_map(|i| (count as f32 + i as f32 * 0.5).to_le_bytes())
                .collect();
            assert_eq!(s.accept(&unit(count, &body)).unwrap(), UnitOutcome::Written);
        }
        s.finish_file().unwrap();

        let text = fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2 + 3);
        let columns = lines[1].matches(',').count();
        assert_eq!(columns, 10);
        for (count, row) in lines[2..].iter().enumerate() {
            assert!(row.ends_with(','));
            let cells: Vec<&str> = row.trim_end_matches(',').split(',').collect();
            assert_eq!(cells.len(), columns);
            assert_eq!(cells[0], count.to_string());
            assert_eq!(cells[1], count.to_string());
            assert_eq!(cells[9], (count as f32 + 4.0).to_string());
        }
        assert_eq!(s.total_bytes(), 3 * 36);
    }

    #[test]
    fn gap_requests_exactly_one_resend() {
        let tmp = TempDir::new().unwrap();
        let mut s = session(&tmp, 200);
        s.open_current("tag", "00:00:00:00:00:01").unwrap();

        assert_eq!(s.accept(&ts(0)).unwrap(), UnitOutcome::Written);
        assert_eq!(s.accept(&ts(3)).unwrap(), UnitOutcome::Resend(1));
        assert_eq!(s.accept(&ts(4)).unwrap(), UnitOutcome::AwaitingResend);
        assert_eq!(s.expected_data_count(), 1);

        assert_eq!(s.accept(&ts(1)).unwrap(), UnitOutcome::Written);
        assert_eq!(s.accept(&ts(2)).unwrap(), UnitOutcome::Written);
        assert_eq!(s.accept(&ts(1)).unwrap(), UnitOutcome::Duplicate);
        assert_eq!(s.lost_samples(), 0);
    }

    #[test]
    fn exhausted_budget_forces_resync_and_counts_loss() {
        let tmp = TempDir::new().unwrap();
        let mut s = session(&tmp, 2);
        s.open_current("tag", "mac").unwrap();

        assert_eq!(s.accept(&ts(0)).unwrap(), UnitOutcome::Written);
        assert_eq!(s.accept(&ts(5)).unwrap(), UnitOutcome::Resend(1));
        assert_eq!(s.accept(&ts(6)).unwrap(), UnitOutcome::AwaitingResend);
        assert_eq!(s.accept(&ts(7)).unwrap(), UnitOutcome::Written);
        assert_eq!(s.expected_data_count(), 8);
        assert_eq!(s.lost_samples(), 6);

        let done = s.finish_file().unwrap().unwrap();
        assert_eq!(done.lost_samples, 6);
    }

    #[test]
    fn file_ending_during_resend_counts_the_open_gap() {
        let tmp = TempDir::new().unwrap();
        let mut s = session(&tmp, 200);
        s.open_current("tag", "mac").unwrap();

        assert_eq!(s.accept(&ts(0)).unwrap(), UnitOutcome::Written);
        assert_eq!(s.accept(&ts(2)).unwrap(), UnitOutcome::Resend(1));
        assert_eq!(s.accept(&ts(3)).unwrap(), UnitOutcome::AwaitingResend);

        let done = s.finish_file().unwrap().unwrap();
        assert_eq!(done.lost_samples, 3);
        assert_eq!(s.lost_samples(), 3);

        // The next file starts with a clean sequence.
        s.open_current("tag", "mac").unwrap();
        assert_eq!(s.accept(&ts(0)).unwrap(), UnitOutcome::Written);
        assert_eq!(s.finish_file().unwrap().unwrap().lost_samples, 0);
    }

    #[test]
    fn existing_output_is_not_overwritten() {
        let tmp = TempDir::new().unwrap();
        let mut s = session(&tmp, 200);
        let path = s.output_path("tag", "AA:BB").unwrap();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "keep").unwrap();

        assert_eq!(
            s.open_current("tag", "AA:BB").unwrap(),
            Some(OpenOutcome::Exists(path.clone()))
        );
        s.accept(&ts(0)).unwrap();
        s.finish_file().unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "keep");
    }

    #[test]
    fn last_file_reports_batch_done() {
        let tmp = TempDir::new().unwrap();
        let mut s = session(&tmp, 200);
        s.open_current("tag", "mac").unwrap();
        assert!(!s.finish_file().unwrap().unwrap().is_all_done);
        s.open_current("tag", "mac").unwrap();
        let done = s.finish_file().unwrap().unwrap();
        assert_eq!(done.file_index, 2);
        assert!(done.is_all_done);
        assert!(s.finish_file().unwrap().is_none());
        assert_eq!(s.open_current("tag", "mac").unwrap(), None);
    }

    #[test]
    fn short_unit_is_dropped_without_stalling() {
        let tmp = TempDir::new().unwrap();
        let mut s = ExportSession::new(
            vec![file(1, "f")],
            tmp.path().to_path_buf(),
            vec![FieldId::EulerAngles],
            200,
        );
        s.open_current("tag", "mac").unwrap();
        assert_eq!(s.accept(&unit(0, &[0; 4])).unwrap(), UnitOutcome::Dropped);
        assert_eq!(s.expected_data_count(), 1);
        assert_eq!(s.lost_samples(), 1);
    }
}
