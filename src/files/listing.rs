use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use tracing::debug;

use super::{
    path::join,
    types::{FileInfo, FileType},
};

/// Command producing the listing format `parse_listing` understands.
///
/// With `--time-style=iso`, GNU `ls` prints `MM-DD HH:MM` for recent files and
/// `YYYY-MM-DD` with no time for older ones; the parser accepts both.
pub fn list_command(dir: &str) -> Vec<String> {
    vec![
        "ls".to_string(),
        "-la".to_string(),
        "--time-style=iso".to_string(),
        dir.to_string(),
    ]
}

/// Parse `ls -la` output. Lines that do not look like entries are skipped.
pub fn parse_listing(dir: &str, output: &str) -> Vec<FileInfo> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.starts_with("total "))
        .filter_map(|line| {
            let entry = parse_line(dir, line);
            if entry.is_none() {
                debug!(line, "Skipping unparseable listing line");
            }
            entry
        })
        .filter(|info| info.name != "." && info.name != "..")
        .collect()
}

fn parse_line(dir: &str, line: &str) -> Option<FileInfo> {
    // permissions, links, owner, group, size, date
    let (fields, rest) = take_fields(line, 6)?;
    let permissions = fields[0];
    let size_bytes = fields[4].parse().ok()?;
    let date = parse_date(fields[5]);

    let (time, raw_name) = match take_fields(rest, 1) {
        Some((token, after)) if looks_like_time(token[0]) => {
            (NaiveTime::parse_from_str(token[0], "%H:%M").ok(), after)
        }
        // Older files get `YYYY-MM-DD ` padded to the width of `MM-DD HH:MM`.
        _ => (None, rest.strip_prefix(' ').unwrap_or(rest)),
    };
    if raw_name.is_empty() {
        return None;
    }

    let file_type = if permissions.starts_with('d') {
        FileType::Directory
    } else {
        FileType::File
    };
    let name = if permissions.starts_with('l') {
        raw_name
            .split_once(" -> ")
            .map_or(raw_name, |(link, _)| link)
    } else {
        raw_name
    };

    Some(FileInfo {
        name: name.to_string(),
        absolute_path: join(dir, name),
        file_type,
        size_bytes,
        modified_at: date.map(|d| NaiveDateTime::new(d, time.unwrap_or_default())),
        permissions: permissions.to_string(),
    })
}

/// Split off `n` whitespace-separated fields. The remainder keeps everything after
/// the single separator that follows the last field, so names keep their spaces.
fn take_fields(line: &str, n: usize) -> Option<(Vec<&str>, &str)> {
    let mut fields = Vec::with_capacity(n);
    let mut rest = line;
    for _ in 0..n {
        rest = rest.trim_start();
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        if end == 0 {
            return None;
        }
        fields.push(&rest[..end]);
        rest = &rest[end..];
    }
    Some((fields, rest.strip_prefix(' ').unwrap_or(rest)))
}

fn looks_like_time(token: &str) -> bool {
    let bytes = token.as_bytes();
    bytes.len() == 5
        && bytes[2] == b':'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == 2 || b.is_ascii_digit())
}

fn parse_date(token: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(token, "%Y-%m-%d").ok().or_else(|| {
        // `--time-style=iso` drops the year for recent files.
        let year = Utc::now().year();
        NaiveDate::parse_from_str(&format!("{year}-{token}"), "%Y-%m-%d").ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
total 24
drwxr-xr-x 4 app  app  4096 2024-05-01 10:00 .
drwxr-xr-x 1 root root 4096 2024-05-01 09:00 ..
-rw-r--r-- 1 app  app   742 2024-05-02 12:34 server.properties
drwxr-xr-x 2 app  app  4096 2024-05-03 08:15 plugins
-rw-r--r-- 1 app  app    12 2024-05-04 23:59 my notes  v2.txt
lrwxrwxrwx 1 app  app     9 2024-05-05 07:00 latest -> logs/2024
";

    #[test]
    fn parses_entries_and_skips_dot_entries() {
        let files = parse_listing("/data", LISTING);
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            ["server.properties", "plugins", "my notes  v2.txt", "latest"]
        );

        let props = &files[0];
        assert_eq!(props.absolute_path, "/data/server.properties");
        assert_eq!(props.file_type, FileType::File);
        assert_eq!(props.size_bytes, 742);
        assert_eq!(props.permissions, "-rw-r--r--");
        assert_eq!(
            props.modified_at.unwrap().to_string(),
            "2024-05-02 12:34:00"
        );

        assert_eq!(files[1].file_type, FileType::Directory);
        assert_eq!(files[3].absolute_path, "/data/latest");
    }

    #[test]
    fn empty_directory_yields_nothing() {
        assert!(parse_listing("/data", "total 0\n").is_empty());
    }

    #[test]
    fn root_directory_paths_have_single_slash() {
        let files = parse_listing("/", "-rw-r--r-- 1 a a 1 2024-01-01 00:00 x\n");
        assert_eq!(files[0].absolute_path, "/x");
    }

    #[test]
    fn missing_time_column_still_parses() {
        let files = parse_listing("/data", "-rw-r--r-- 1 a a 5 2019-02-03 old.log\n");
        assert_eq!(files[0].name, "old.log");
        assert_eq!(
            files[0].modified_at.unwrap().to_string(),
            "2019-02-03 00:00:00"
        );
    }

    #[test]
    fn iso_rows_without_year_use_the_current_year() {
        assert_eq!(list_command("/data")[2], "--time-style=iso");

        let files = parse_listing(
            "/data",
            "-rw-r--r-- 1 a a 5 05-02 12:34 recent.log\n-rw-r--r-- 1 a a 5 2019-02-03  old.log\n",
        );
        assert_eq!(files.len(), 2);
        let recent = files[0].modified_at.unwrap();
        assert_eq!(recent.year(), Utc::now().year());
        assert_eq!(recent.format("%m-%d %H:%M").to_string(), "05-02 12:34");
        assert_eq!(files[1].name, "old.log");
    }

    #[test]
    fn device_rows_are_skipped() {
        let files = parse_listing("/dev", "crw-rw-rw- 1 root root 1, 3 2024-01-01 00:00 null\n");
        assert!(files.is_empty());
    }
}
