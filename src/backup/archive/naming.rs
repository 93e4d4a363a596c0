//! `<archive_root>/<host>/<YYYY>/<MM>/<key>-<YYYY-MM-DD_HHMMSS>.<ext>`

use chrono::{DateTime, Datelike, Local, NaiveDateTime, TimeZone};
use std::path::{Path, PathBuf};

pub static TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H%M%S";
/// Length of a formatted [`TIMESTAMP_FORMAT`] timestamp.
static TIMESTAMP_LEN: usize = 17;

pub fn archive_file_name<Tz: TimeZone>(key: &str, ext: &str, time: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{key}-{}.{ext}", time.format(TIMESTAMP_FORMAT))
}

pub fn host_dir<P: AsRef<Path>>(archive_root: P, host: &str) -> PathBuf {
    archive_root.as_ref().join(host)
}

pub fn month_dir<P: AsRef<Path>, Tz: TimeZone>(archive_root: P, host: &str, time: &DateTime<Tz>) -> PathBuf {
    host_dir(archive_root, host)
        .join(format!("{:04}", time.year()))
        .join(format!("{:02}", time.month()))
}

/// Timestamp encoded in `file_name` if it is exactly `<key>-<timestamp>.<ext>`.
pub fn parse_archive_time(file_name: &str, key: &str, ext: &str) -> Option<NaiveDateTime> {
    let stamp = file_name
        .strip_prefix(key)?
        .strip_prefix('-')?
        .strip_suffix(ext)?
        .strip_suffix('.')?;
    if stamp.len() != TIMESTAMP_LEN {
        return None;
    }
    NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()
}

/// Interprets a filename timestamp in local time. Ambiguous wall clock times
/// (DST fold) resolve to the earlier instant.
pub fn local_time(naive: NaiveDateTime) -> Option<DateTime<Local>> {
    Local.from_local_datetime(&naive).earliest()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    #[test]
    fn test_file_name_and_dir() {
        let time = Local.from_local_datetime(&at(2024, 3, 7, 9, 5, 1)).earliest().unwrap();
        assert_eq!(archive_file_name("www", "tar.xz", &time), "www-2024-03-07_090501.tar.xz");
        assert_eq!(
            month_dir("/archive", "web1", &time),
            PathBuf::from("/archive/web1/2024/03")
        );
    }

    #[test]
    fn test_parse_round_trip() {
        assert_eq!(
            parse_archive_time("www-2024-03-07_090501.tar.xz", "www", "tar.xz"),
            Some(at(2024, 3, 7, 9, 5, 1))
        );
    }

    #[test]
    fn test_parse_rejects_foreign_files() {
        for name in [
            "www-2024-03-07_090501.tar",
            "wwwx-2024-03-07_090501.tar.xz",
            "www-2024-03-07.tar.xz",
            "www-2024-13-07_090501.tar.xz",
            "www-2024-03-07_090501.tar.xz.part",
            "notes.txt",
        ] {
            assert_eq!(parse_archive_time(name, "www", "tar.xz"), None, "{name}");
        }
    }

    #[test]
    fn test_key_with_dash_prefix_not_confused() {
        // "www" must not claim archives of "www-old"
        assert_eq!(
            parse_archive_time("www-old-2024-03-07_090501.tar.xz", "www", "tar.xz"),
            None
        );
        assert!(parse_archive_time("www-old-2024-03-07_090501.tar.xz", "www-old", "tar.xz").is_some());
    }
}
