//! Diagnostic dumps of the flattened records of one window.

use crate::sync::flatten::FlatRecord;
use crate::sync::window::TimeWindow;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// `bookings_<start>_<end>.json` for `window`.
pub fn snapshot_file_name(window: &TimeWindow) -> String {
    format!(
        "bookings_{}_{}.json",
        window.start.format("%Y%m%dT%H%M%SZ"),
        window.end.format("%Y%m%dT%H%M%SZ")
    )
}

/// Write `records` as a pretty-printed JSON array into `dir`, creating it if needed.
pub fn write_snapshot(dir: &Path, window: &TimeWindow, records: &[FlatRecord]) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(snapshot_file_name(window));

    let mut writer = BufWriter::new(fs::File::create(&path)?);
    serde_json::to_writer_pretty(&mut writer, records)?;
    writer.write_all(b"\n")?;
    writer.flush()?;

    log::info!("window {}: wrote {} records to {}", window, records.len(), path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::flatten::flatten;
    use chrono::{TimeZone, Utc};
    use serde_json::{Value, json};

    #[test]
    fn writes_a_json_array_named_after_the_window() {
        let dir = tempfile::tempdir().unwrap();
        let window = TimeWindow::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 1, 31, 0, 0, 0).unwrap(),
        )
        .unwrap();
        let records = vec![flatten(&json!({"id": 1, "customer": {"name": "Acme"}}), "")];

        let path = write_snapshot(&dir.path().join("snapshots"), &window, &records).unwrap();
        assert_eq!(
            path.file_name().and_then(|name| name.to_str()),
            Some("bookings_20250101T000000Z_20250131T000000Z.json")
        );

        let written: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, json!([{"id": 1, "customer.name": "Acme"}]));
    }
}
