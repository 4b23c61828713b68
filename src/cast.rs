//! Cast Writer (C2, spec §4.2): the single writer appending asciinema-v2
//! style records to a session's `stream-out` file.
//!
//! Grounded on the donor's direct `File` + `write_all` pattern in
//! `tty_spawn.rs`'s output pump, generalized with the batched-fsync policy
//! §4.2 asks for (every 64 records or 100ms, whichever comes first) and a
//! `Closed` guard once `write_exit` has run, since the cast format requires
//! `exit` to be the last line.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::{AppError, AppResult};
use crate::protocol::{AsciinemaHeader, CastRecord};

const FLUSH_EVERY: u32 = 64;
const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Appends records to one session's `stream-out`. Not `Sync` on its own —
/// callers serialize access the same way the PTY Host serializes its own
/// output pump per session (one writer, one session, spec §5).
pub struct CastWriter {
    file: File,
    path: PathBuf,
    start: Instant,
    pending: u32,
    last_flush: Instant,
    closed: bool,
}

impl CastWriter {
    /// Creates `stream-out` and writes the asciinema header as line 1.
    pub fn create(dir: &Path, header: &AsciinemaHeader) -> AppResult<Self> {
        let path = dir.join("stream-out");
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)?;
        writeln!(file, "{}", serde_json::to_string(header)?)?;
        file.flush()?;
        Ok(Self {
            file,
            path,
            start: Instant::now(),
            pending: 0,
            last_flush: Instant::now(),
            closed: false,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Seconds elapsed since the writer was created, used to stamp every
    /// non-exit record (spec §6 cast format: `t` is relative to session start).
    #[must_use]
    pub fn elapsed(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    pub fn write_output(&mut self, data: &[u8]) -> AppResult<()> {
        self.append(&CastRecord::Output {
            time: self.elapsed(),
            data: data.to_vec(),
        })
    }

    pub fn write_input(&mut self, data: &[u8]) -> AppResult<()> {
        self.append(&CastRecord::Input {
            time: self.elapsed(),
            data: data.to_vec(),
        })
    }

    pub fn write_resize(&mut self, cols: u16, rows: u16) -> AppResult<()> {
        self.append(&CastRecord::Resize {
            time: self.elapsed(),
            cols,
            rows,
        })
    }

    /// Writes the terminal `exit` record and closes the writer. Any further
    /// write attempt returns `AppError::SessionExited`.
    pub fn write_exit(&mut self, code: i32, session_id: &str) -> AppResult<()> {
        self.append(&CastRecord::Exit {
            code,
            session_id: session_id.to_string(),
        })?;
        self.file.flush()?;
        self.file.sync_all()?;
        self.closed = true;
        Ok(())
    }

    fn append(&mut self, record: &CastRecord) -> AppResult<()> {
        if self.closed {
            return Err(AppError::SessionExited);
        }
        writeln!(self.file, "{}", record.to_json_line())?;
        self.pending += 1;

        if self.pending >= FLUSH_EVERY || self.last_flush.elapsed() >= FLUSH_INTERVAL {
            self.file.flush()?;
            self.file.sync_all()?;
            self.pending = 0;
            self.last_flush = Instant::now();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn header() -> AsciinemaHeader {
        AsciinemaHeader::new(80, 24, "xterm-256color", "/bin/bash")
    }

    #[test]
    fn header_is_first_line() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = CastWriter::create(tmp.path(), &header()).unwrap();
        let content = fs::read_to_string(writer.path()).unwrap();
        let first_line = content.lines().next().unwrap();
        let parsed: AsciinemaHeader = serde_json::from_str(first_line).unwrap();
        assert_eq!(parsed.width, 80);
    }

    #[test]
    fn exit_is_last_line_and_closes_writer() {
        let tmp = tempfile::tempdir().unwrap();
        let mut writer = CastWriter::create(tmp.path(), &header()).unwrap();
        writer.write_output(b"hello\n").unwrap();
        writer.write_exit(0, "sess-1").unwrap();

        let err = writer.write_output(b"late").unwrap_err();
        assert!(matches!(err, AppError::SessionExited));

        let content = fs::read_to_string(writer.path()).unwrap();
        let last_line = content.lines().last().unwrap();
        let record = CastRecord::parse_line(last_line).unwrap();
        assert!(record.is_exit());
    }

    #[test]
    fn records_round_trip_through_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mut writer = CastWriter::create(tmp.path(), &header()).unwrap();
        writer.write_output(b"out").unwrap();
        writer.write_input(b"in").unwrap();
        writer.write_resize(100, 40).unwrap();
        writer.write_exit(1, "sess-2").unwrap();

        let content = fs::read_to_string(writer.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 5); // header + 4 records
        assert!(CastRecord::parse_line(lines[1]).is_some());
        assert!(CastRecord::parse_line(lines[2]).is_some());
        assert!(CastRecord::parse_line(lines[3]).is_some());
        assert!(CastRecord::parse_line(lines[4]).unwrap().is_exit());
    }
}
