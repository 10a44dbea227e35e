//! Low-level helpers shared by the prodstat crates.
//!
//! Derived artifacts (statistics tables, checkpoints, timing series) are written
//! through [`write_text_atomic`] so a crashed run never leaves half a file behind.

pub mod atomic_io;
pub mod data_dir;
pub mod time_utils;

pub use atomic_io::write_text_atomic;
pub use data_dir::{resolve_data_dir, DATA_DIR_APP_NAME};
pub use time_utils::{current_unix_timestamp, parse_calendar_date, today_utc};

#[cfg(test)]
mod tests {
    use std::fs::read_to_string;

    use super::*;

    #[test]
    fn unit_write_text_atomic_writes_content() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("nested").join("catalogStat-PREOPS-1.txt");
        write_text_atomic(&path, "task  cpu\n").expect("write");
        let contents = read_to_string(&path).expect("read");
        assert_eq!(contents, "task  cpu\n");
    }

    #[test]
    fn regression_write_text_atomic_replaces_existing_file_without_leftovers() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("summary.csv");
        write_text_atomic(&path, "old").expect("first write");
        write_text_atomic(&path, "new").expect("second write");
        assert_eq!(read_to_string(&path).expect("read"), "new");
        let leftovers = std::fs::read_dir(tempdir.path())
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().contains(".tmp-"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn regression_write_text_atomic_rejects_directory_destination() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let error = write_text_atomic(tempdir.path(), "x").expect_err("directory rejected");
        assert!(error.to_string().contains("is a directory"));
    }
}
