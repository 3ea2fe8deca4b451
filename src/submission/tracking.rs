//! Submission Tracking Log
//!
//! Append-only text file with one line per submission:
//!
//! ```text
//! 2026-03-02T14:05:11Z<TAB>si_relax_dos<TAB>1042
//! ```

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info, warn};

use super::entry::SubmissionResult;
use crate::error::{LegoError, Result};

/// One line of the tracking log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingEntry {
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub pk: u64,
}

impl TrackingEntry {
    pub fn new(name: impl Into<String>, pk: u64) -> Self {
        Self {
            timestamp: Utc::now(),
            name: name.into(),
            pk,
        }
    }

    /// Formats the entry as a log line, without the trailing newline.
    pub fn to_line(&self) -> String {
        let name: String = self
            .name
            .chars()
            .map(|c| if matches!(c, '\t' | '\n' | '\r') { ' ' } else { c })
            .collect();
        format!(
            "{}\t{}\t{}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            name,
            self.pk
        )
    }

    /// Parses a log line; `None` if it is malformed.
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut fields = line.trim_end_matches(&['\r', '\n'][..]).splitn(3, '\t');
        let timestamp = DateTime::parse_from_rfc3339(fields.next()?.trim()).ok()?;
        let name = fields.next()?.to_string();
        let pk = fields.next()?.trim().parse().ok()?;

        Some(Self {
            timestamp: timestamp.with_timezone(&Utc),
            name,
            pk,
        })
    }
}

/// The tracking file.
#[derive(Debug, Clone)]
pub struct TrackingLog {
    path: PathBuf,
}

impl TrackingLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records a submission stamped with the current time.
    pub fn record(&self, result: &SubmissionResult) -> Result<TrackingEntry> {
        let entry = TrackingEntry::new(result.name.clone(), result.pk);
        self.append(&entry)?;
        Ok(entry)
    }

    /// Appends one entry, creating the file (and its directory) if needed.
    pub fn append(&self, entry: &TrackingEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| LegoError::io(parent, e))?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| LegoError::io(&self.path, e))?;
        writeln!(file, "{}", entry.to_line()).map_err(|e| LegoError::io(&self.path, e))?;

        info!("Tracked PK {} in {}", entry.pk, self.path.display());
        Ok(())
    }

    /// Reads every well-formed entry in file order.
    ///
    /// A missing file is an empty log. Malformed lines are skipped.
    pub fn entries(&self) -> Result<Vec<TrackingEntry>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No tracking file at {}", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(LegoError::io(&self.path, e)),
        };

        let mut entries = Vec::new();
        for (number, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match TrackingEntry::parse_line(line) {
                Some(entry) => entries.push(entry),
                None => warn!(
                    "Skipping malformed line {} in {}",
                    number + 1,
                    self.path.display()
                ),
            }
        }
        Ok(entries)
    }

    /// The last `n` entries.
    pub fn tail(&self, n: usize) -> Result<Vec<TrackingEntry>> {
        let mut entries = self.entries()?;
        let skip = entries.len().saturating_sub(n);
        Ok(entries.split_off(skip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn entry(name: &str, pk: u64) -> TrackingEntry {
        TrackingEntry {
            timestamp: Utc.with_ymd_and_hms(2026, 3, 2, 14, 5, 11).unwrap(),
            name: name.to_string(),
            pk,
        }
    }

    #[test]
    fn test_line_format() {
        assert_eq!(
            entry("si_relax", 1042).to_line(),
            "2026-03-02T14:05:11Z\tsi_relax\t1042"
        );
    }

    #[test]
    fn test_tabs_in_names_are_replaced() {
        let line = entry("a\tb\nc", 3).to_line();
        assert_eq!(line.matches('\t').count(), 2);
        assert_eq!(TrackingEntry::parse_line(&line).unwrap().name, "a b c");
    }

    #[test]
    fn test_parse_line() {
        let parsed = TrackingEntry::parse_line("2026-03-02T14:05:11+01:00\tnio_u\t77\n").unwrap();
        assert_eq!(parsed.name, "nio_u");
        assert_eq!(parsed.pk, 77);
        assert_eq!(parsed.timestamp, Utc.with_ymd_and_hms(2026, 3, 2, 13, 5, 11).unwrap());

        assert!(TrackingEntry::parse_line("yesterday\tx\t1").is_none());
        assert!(TrackingEntry::parse_line("2026-03-02T14:05:11Z\tx").is_none());
        assert!(TrackingEntry::parse_line("2026-03-02T14:05:11Z\tx\tpk").is_none());
    }

    #[test]
    fn test_append_then_read_in_order() {
        let temp_dir = tempdir().unwrap();
        let log = TrackingLog::new(temp_dir.path().join("logs/submissions.log"));

        log.append(&entry("first", 1)).unwrap();
        log.append(&entry("second", 2)).unwrap();
        let recorded = log
            .record(&SubmissionResult {
                pk: 3,
                name: "third".to_string(),
                stages: vec!["relax".to_string()],
            })
            .unwrap();

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], entry("first", 1));
        assert_eq!(entries[2].pk, 3);
        assert_eq!(entries[2].name, recorded.name);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let temp_dir = tempdir().unwrap();
        let log = TrackingLog::new(temp_dir.path().join("none.log"));
        assert!(log.entries().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("t.log");
        fs::write(
            &path,
            "garbage\n\n2026-03-02T14:05:11Z\tok\t5\nalso\tgarbage\t!\n",
        )
        .unwrap();

        let entries = TrackingLog::new(&path).entries().unwrap();
        assert_eq!(entries, vec![entry("ok", 5)]);
    }

    #[test]
    fn test_tail() {
        let temp_dir = tempdir().unwrap();
        let log = TrackingLog::new(temp_dir.path().join("t.log"));
        for pk in 1..=5 {
            log.append(&entry("p", pk)).unwrap();
        }

        let pks: Vec<u64> = log.tail(2).unwrap().iter().map(|e| e.pk).collect();
        assert_eq!(pks, vec![4, 5]);
        assert_eq!(log.tail(10).unwrap().len(), 5);
    }
}
