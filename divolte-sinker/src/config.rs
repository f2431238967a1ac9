use std::path::PathBuf;
use std::time::Duration;

/// Schema written into container headers when the sinker runs without an
/// upstream mapping, i.e. records are opaque byte blobs.
pub const DEFAULT_SCHEMA_JSON: &str = r#""bytes""#;

/// Options of the session binning sink.
#[derive(Debug, Clone)]
pub struct SessionBinningConfig {
    /// Session length. Also the width of one round on the time axis.
    pub session_timeout: Duration,

    /// Destination directory on the remote file system.
    pub dir: PathBuf,

    /// Age after which a file with unsynced records is synced anyway.
    pub sync_file_after_duration: Duration,

    /// Number of unsynced records that forces a sync.
    pub sync_file_after_records: u32,

    /// Replication factor passed through to file creation.
    pub replication: u16,

    /// Schema JSON embedded in the header of every container file.
    pub schema_json: String,
}

impl Default for SessionBinningConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(30 * 60),
            dir: PathBuf::from("divolte-tracking"),
            sync_file_after_duration: Duration::from_secs(30),
            sync_file_after_records: 1000,
            replication: 1,
            schema_json: DEFAULT_SCHEMA_JSON.to_string(),
        }
    }
}

impl SessionBinningConfig {
    pub fn session_timeout_ms(&self) -> u64 {
        self.session_timeout.as_millis() as u64
    }

    pub fn sync_file_after_ms(&self) -> u64 {
        self.sync_file_after_duration.as_millis() as u64
    }
}
