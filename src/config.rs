//! Runtime settings shared by the registry and every sensor connection.

use std::path::PathBuf;
use std::time::Duration;

use crate::flash;

/// Serial speed of DOT docking stations.
pub const DEFAULT_BAUD_RATE: u32 = 921_600;
/// Out-of-order file-data units tolerated before skipping a gap.
pub const DEFAULT_RETRANSMISSION_BUDGET: u32 = 200;

#[derive(Debug, Clone)]
pub struct ExporterConfig {
    /// Serial ports opened on `startScanning`.
    pub ports: Vec<String>,
    pub baud_rate: u32,
    /// Blocking read timeout; also the cadence at which timeouts are checked.
    pub read_timeout: Duration,
    /// Root of the per-batch export directories.
    pub export_root: PathBuf,
    pub retransmission_budget: u32,
    /// Deadline for non-streaming requests. `None` waits forever.
    pub request_timeout: Option<Duration>,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout: Duration::from_millis(20),
            export_root: PathBuf::from("data"),
            retransmission_budget: DEFAULT_RETRANSMISSION_BUDGET,
            request_timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl ExporterConfig {
    /// Directory for an export batch starting now.
    pub fn batch_dir(&self) -> PathBuf {
        self.export_root.join(flash::batch_dir_name())
    }
}
