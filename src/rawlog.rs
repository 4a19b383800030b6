//! Hourly append-only raw frame capture.
//!
//! One text file per hour under `<logs>/raw/YYYY-MM-DD_HH.txt`, one line
//! per accepted frame: receive time, IMEI, frame hex. These files are an
//! operator-facing forensic artifact, not a protocol surface.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::models::{iso_millis, Imei};

/// Shared handle over the capture writers. Cheap to clone; one per
/// process, used from every connection task.
#[derive(Clone)]
pub struct RawLog {
    inner: Arc<Mutex<Writers>>,
}

struct Writers {
    directory: PathBuf,
    open: HashMap<String, BufWriter<File>>,
}

impl RawLog {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Writers {
                directory: directory.into(),
                open: HashMap::new(),
            })),
        }
    }

    /// Append one frame line. Failures are logged and swallowed: capture
    /// must never interfere with the ingest path.
    pub fn append(&self, timestamp: DateTime<Utc>, imei: &Imei, frame_hex: &str) {
        let Ok(mut writers) = self.inner.lock() else {
            return;
        };
        if let Err(e) = writers.append(timestamp, imei, frame_hex) {
            warn!("Raw capture write failed: {}", e);
        }
    }

    /// Flush all open writers.
    pub fn flush(&self) {
        if let Ok(mut writers) = self.inner.lock() {
            for writer in writers.open.values_mut() {
                let _ = writer.flush();
            }
        }
    }
}

impl Writers {
    fn append(
        &mut self,
        timestamp: DateTime<Utc>,
        imei: &Imei,
        frame_hex: &str,
    ) -> std::io::Result<()> {
        let hour = timestamp.format("%Y-%m-%d_%H").to_string();
        let writer = self.get_or_create_writer(&hour)?;
        writeln!(
            writer,
            "{} {} {}",
            iso_millis::to_string(&timestamp),
            imei,
            frame_hex
        )?;
        Ok(())
    }

    fn get_or_create_writer(&mut self, hour: &str) -> std::io::Result<&mut BufWriter<File>> {
        if !self.open.contains_key(hour) {
            // A new hour started; earlier writers are done for good.
            for (_, mut writer) in self.open.drain() {
                let _ = writer.flush();
            }

            let path = self.directory.join("raw").join(format!("{hour}.txt"));
            fs::create_dir_all(path.parent().unwrap_or(Path::new(".")))?;
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            self.open.insert(hour.to_string(), BufWriter::new(file));
        }

        Ok(self.open.get_mut(hour).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn frames_land_in_hourly_files() {
        let dir = tempdir().unwrap();
        let log = RawLog::new(dir.path());
        let imei = Imei::try_from("864275079658715").unwrap();

        let first = Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap();
        let second = Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 1).unwrap();
        log.append(first, &imei, "00000000deadbeef");
        log.append(second, &imei, "00000000cafebabe");
        log.flush();

        let first_file = dir.path().join("raw/2024-01-01_10.txt");
        let second_file = dir.path().join("raw/2024-01-01_11.txt");
        let first_contents = fs::read_to_string(first_file).unwrap();
        let second_contents = fs::read_to_string(second_file).unwrap();

        assert!(first_contents.contains("deadbeef"));
        assert!(first_contents.contains("864275079658715"));
        assert!(second_contents.contains("cafebabe"));
    }

    #[test]
    fn appends_accumulate_within_the_hour() {
        let dir = tempdir().unwrap();
        let log = RawLog::new(dir.path());
        let imei = Imei::try_from("864275079658715").unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();

        log.append(ts, &imei, "aa");
        log.append(ts, &imei, "bb");
        log.flush();

        let contents = fs::read_to_string(dir.path().join("raw/2024-01-01_10.txt")).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
