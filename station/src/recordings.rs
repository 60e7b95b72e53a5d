use chrono::{DateTime, Local};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// `{title with spaces as underscores}_{YYYYMMDD_HHMMSS}.{ext}`
pub fn file_name(title: &str, now: &DateTime<Local>, extension: &str) -> String {
    format!("{}_{}.{}", title.replace(' ', "_"), now.format("%Y%m%d_%H%M%S"), extension)
}

/// Finished recordings with the given extension, newest first.
///
/// Names end in their start time, so reverse name order is close to reverse
/// chronological order. A missing directory has no recordings.
pub fn list(dir: &Path, extension: &str) -> io::Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut recordings = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().map_or(false, |ext| ext == extension) {
            recordings.push(path);
        }
    }

    recordings.sort_by(|a, b| b.file_name().cmp(&a.file_name()));
    Ok(recordings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn name_has_underscored_title_and_timestamp() {
        let now = Local.ymd(2024, 11, 2).and_hms(7, 3, 9);
        assert_eq!(file_name("Front Gate Cam", &now, "mjpeg"), "Front_Gate_Cam_20241102_070309.mjpeg");
    }

    #[test]
    fn lists_newest_first_and_filters_extension() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["Gate_20240101_100000.mjpeg", "Gate_20240301_090000.mjpeg", "Yard_20240201_120000.mjpeg", "notes.txt"].iter() {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        fs::create_dir(dir.path().join("old.mjpeg")).unwrap();

        let names: Vec<_> = list(dir.path(), "mjpeg").unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();

        assert_eq!(names, vec!["Yard_20240201_120000.mjpeg", "Gate_20240301_090000.mjpeg", "Gate_20240101_100000.mjpeg"]);
    }

    #[test]
    fn missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list(&dir.path().join("nope"), "mjpeg").unwrap().is_empty());
    }
}
