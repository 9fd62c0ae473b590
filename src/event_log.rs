//! Append-only NDJSON log of token-usage records shared by every process of a session.
//!
//! Offsets are counted in complete (newline-terminated) lines. A trailing line
//! without its newline is treated as still being written and is neither parsed
//! nor counted.

use crate::error::LedgerError;
use crate::models::TokenUsageRecord;
use chrono::{Duration, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug, Clone, Default)]
pub struct LogSlice {
    pub records: Vec<TokenUsageRecord>,
    /// Complete lines consumed past the starting offset, corrupt ones included.
    pub lines_read: u64,
}

#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one line with a single write so concurrent appenders never interleave.
    pub fn append(&self, record: &TokenUsageRecord) -> Result<(), LedgerError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    pub fn read_all(&self) -> Vec<TokenUsageRecord> {
        self.read_from(0).records
    }

    pub fn read_from(&self, offset: u64) -> LogSlice {
        let mut slice = LogSlice::default();
        let Some(mut reader) = self.open_reader() else {
            return slice;
        };

        let mut buf = Vec::new();
        let mut line_no: u64 = 0;
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("failed to read {:?} at line {}: {}", self.path, line_no + 1, e);
                    break;
                }
            }
            if buf.last() != Some(&b'\n') {
                break;
            }
            line_no += 1;
            if line_no <= offset {
                continue;
            }
            slice.lines_read += 1;
            if let Some(record) = parse_line(&buf, &self.path, line_no) {
                slice.records.push(record);
            }
        }
        slice
    }

    pub fn line_count(&self) -> u64 {
        let Some(mut reader) = self.open_reader() else {
            return 0;
        };
        let mut chunk = [0u8; 64 * 1024];
        let mut count = 0u64;
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => count += chunk[..n].iter().filter(|b| **b == b'\n').count() as u64,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!("failed to count lines in {:?}: {}", self.path, e);
                    break;
                }
            }
        }
        count
    }

    pub fn modified(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }

    /// Rewrites the log without records older than `retention_days` and returns how many
    /// were removed.
    ///
    /// Not safe against concurrent appenders: a line written by another process between
    /// the read and the rename is lost.
    pub fn cleanup_old_logs(&self, retention_days: u32) -> Result<usize, LedgerError> {
        // A window reaching past the earliest representable time expires nothing.
        let Some(cutoff) = Duration::try_days(i64::from(retention_days))
            .and_then(|window| Utc::now().checked_sub_signed(window))
        else {
            return Ok(0);
        };
        let Some(mut reader) = self.open_reader() else {
            return Ok(0);
        };

        let mut kept: Vec<u8> = Vec::new();
        let mut removed = 0usize;
        let mut dropped_corrupt = 0usize;
        let mut buf = Vec::new();
        let mut line_no = 0u64;
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 || buf.last() != Some(&b'\n') {
                break;
            }
            line_no += 1;
            if buf.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match parse_line(&buf, &self.path, line_no) {
                Some(record) if record.timestamp < cutoff => removed += 1,
                Some(_) => kept.extend_from_slice(&buf),
                None => dropped_corrupt += 1,
            }
        }

        if removed == 0 && dropped_corrupt == 0 {
            return Ok(0);
        }

        let mut temp_name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        temp_name.push(format!(".{}.cleanup", std::process::id()));
        let temp_path = self.path.with_file_name(temp_name);

        let mut file = File::create(&temp_path)?;
        file.write_all(&kept)?;
        file.sync_all()?;
        drop(file);
        if let Err(e) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }

        tracing::info!(
            removed,
            dropped_corrupt,
            retention_days,
            "event log retention cleanup"
        );
        Ok(removed)
    }

    fn open_reader(&self) -> Option<BufReader<File>> {
        match File::open(&self.path) {
            Ok(file) => Some(BufReader::new(file)),
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    tracing::warn!("failed to open event log {:?}: {}", self.path, e);
                }
                None
            }
        }
    }
}

fn parse_line(raw: &[u8], path: &Path, line_no: u64) -> Option<TokenUsageRecord> {
    let text = match std::str::from_utf8(raw) {
        Ok(text) => text.trim(),
        Err(_) => {
            tracing::debug!("non-utf8 event at {:?}:{}", path, line_no);
            return None;
        }
    };
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str::<TokenUsageRecord>(text) {
        Ok(record) if record.is_valid() => Some(record),
        Ok(_) => {
            tracing::debug!("event without session or model at {:?}:{}", path, line_no);
            None
        }
        Err(e) => {
            tracing::debug!("malformed event at {:?}:{}: {}", path, line_no, e);
            None
        }
    }
}
