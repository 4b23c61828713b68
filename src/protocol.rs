//! The on-disk and on-wire data model (spec §3).
//!
//! `Session` is the root aggregate; `CastRecord` is the tagged union written
//! one-per-line into `stream-out`; `ActivityStatus`, `BufferSnapshot`, and
//! `RemoteRegistration` round out the rest of §3.

use std::collections::HashMap;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionSource {
    Local,
    Remote,
}

/// The root aggregate described in spec §3.
///
/// Invariants this type alone cannot enforce (status monotonicity,
/// `exit_code` iff exited, `pid` write-once) are upheld by `store::update_session`
/// callers, not by the struct itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub command: Vec<String>,
    #[serde(rename = "workingDir")]
    pub working_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub status: SessionStatus,
    #[serde(rename = "exitCode", skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(rename = "startedAt")]
    pub started_at: Timestamp,
    pub term: String,
    pub cols: u16,
    pub rows: u16,
    pub source: SessionSource,
    #[serde(rename = "remoteId", skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    #[serde(rename = "remoteName", skip_serializing_if = "Option::is_none")]
    pub remote_name: Option<String>,
    #[serde(rename = "remoteUrl", skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
}

/// Exit codes are accepted as written to the cast file but clamped to
/// `[-1, 255]` for anything a client displays (spec §8 boundary behavior).
#[must_use]
pub const fn clamp_exit_code_for_display(code: i32) -> i32 {
    if code < -1 {
        -1
    } else if code > 255 {
        255
    } else {
        code
    }
}

impl Session {
    #[must_use]
    pub fn new_starting(
        id: String,
        command: Vec<String>,
        working_dir: String,
        term: String,
        cols: u16,
        rows: u16,
    ) -> Self {
        Self {
            id,
            name: None,
            command,
            working_dir,
            pid: None,
            status: SessionStatus::Starting,
            exit_code: None,
            started_at: Timestamp::now(),
            term,
            cols,
            rows,
            source: SessionSource::Local,
            remote_id: None,
            remote_name: None,
            remote_url: None,
        }
    }
}

/// One line of `stream-out`: `[t, "o"|"i"|"r", data]` or `["exit", code, id]`.
///
/// `t` is seconds (fractional) since session start, monotonic within a file.
#[derive(Debug, Clone, PartialEq)]
pub enum CastRecord {
    Output { time: f64, data: Vec<u8> },
    Input { time: f64, data: Vec<u8> },
    Resize { time: f64, cols: u16, rows: u16 },
    Exit { code: i32, session_id: String },
}

impl CastRecord {
    /// `true` for the terminal `exit` record, which MUST be the last line.
    #[must_use]
    pub const fn is_exit(&self) -> bool {
        matches!(self, Self::Exit { .. })
    }

    #[must_use]
    pub fn time(&self) -> Option<f64> {
        match self {
            Self::Output { time, .. } | Self::Input { time, .. } | Self::Resize { time, .. } => {
                Some(*time)
            }
            Self::Exit { .. } => None,
        }
    }

    /// Returns the same record with its timestamp rewritten, used by the
    /// Stream Watcher to normalize the replay segment to `t=0` relative deltas.
    #[must_use]
    pub fn with_time(&self, time: f64) -> Self {
        match self {
            Self::Output { data, .. } => Self::Output {
                time,
                data: data.clone(),
            },
            Self::Input { data, .. } => Self::Input {
                time,
                data: data.clone(),
            },
            Self::Resize { cols, rows, .. } => Self::Resize {
                time,
                cols: *cols,
                rows: *rows,
            },
            Self::Exit { code, session_id } => Self::Exit {
                code: *code,
                session_id: session_id.clone(),
            },
        }
    }

    /// Serializes to the one-line JSON array form used on disk and over SSE.
    ///
    /// Output/input bytes are passed through `String::from_utf8_lossy` — the
    /// spec calls the cast format "UTF-8 safe", and lossy conversion is how
    /// the donor's `StreamWriter` treated child bytes too.
    #[must_use]
    pub fn to_json_line(&self) -> String {
        let value = match self {
            Self::Output { time, data } => {
                serde_json::json!([time, "o", String::from_utf8_lossy(data)])
            }
            Self::Input { time, data } => {
                serde_json::json!([time, "i", String::from_utf8_lossy(data)])
            }
            Self::Resize { time, cols, rows } => {
                serde_json::json!([time, "r", format!("{cols}x{rows}")])
            }
            Self::Exit { code, session_id } => {
                serde_json::json!(["exit", code, session_id])
            }
        };
        value.to_string()
    }

    /// Parses one line of `stream-out`. Returns `None` for the header line
    /// (callers special-case line 1) or malformed input, which the Stream
    /// Watcher and Session Store treat as `Corrupt` and skip/log.
    #[must_use]
    pub fn parse_line(line: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(line).ok()?;
        let arr = value.as_array()?;
        if arr.len() == 3 && arr[0].as_str() == Some("exit") {
            let code = arr[1].as_i64()? as i32;
            let session_id = arr[2].as_str()?.to_string();
            return Some(Self::Exit { code, session_id });
        }
        if arr.len() != 3 {
            return None;
        }
        let time = arr[0].as_f64()?;
        let tag = arr[1].as_str()?;
        let data = arr[2].as_str()?;
        match tag {
            "o" => Some(Self::Output {
                time,
                data: data.as_bytes().to_vec(),
            }),
            "i" => Some(Self::Input {
                time,
                data: data.as_bytes().to_vec(),
            }),
            "r" => {
                let (cols, rows) = data.split_once('x')?;
                Some(Self::Resize {
                    time,
                    cols: cols.parse().ok()?,
                    rows: rows.parse().ok()?,
                })
            }
            _ => None,
        }
    }
}

/// Line 1 of `stream-out`: the asciinema-v2 header object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsciinemaHeader {
    pub version: u32,
    pub width: u32,
    pub height: u32,
    pub timestamp: i64,
    pub env: HashMap<String, String>,
}

impl AsciinemaHeader {
    #[must_use]
    pub fn new(cols: u16, rows: u16, term: &str, shell: &str) -> Self {
        let mut env = HashMap::new();
        env.insert("SHELL".to_string(), shell.to_string());
        env.insert("TERM".to_string(), term.to_string());
        Self {
            version: 2,
            width: u32::from(cols),
            height: u32::from(rows),
            timestamp: Timestamp::now().as_second(),
            env,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: SessionStatus,
}

/// `{ isActive, timestamp, session }`, recomputed by the Activity Monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityStatus {
    #[serde(rename = "isActive")]
    pub is_active: bool,
    pub timestamp: Timestamp,
    pub session: SessionInfo,
}

/// One cell of a `BufferSnapshot`: codepoint plus fg/bg color and attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    pub codepoint: char,
    pub fg: Color,
    pub bg: Color,
    pub attrs: Attrs,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            codepoint: ' ',
            fg: Color::Default,
            bg: Color::Default,
            attrs: Attrs::empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Default,
    Indexed(u8),
    Rgb(u8, u8, u8),
}

/// The seven SGR attributes named in spec §4.4/§9. None of them combine with
/// surprising semantics, so a plain struct of bools reads more plainly here
/// than pulling in the `bitflags` crate for seven fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Attrs {
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub inverse: bool,
    pub dim: bool,
    pub invisible: bool,
    pub strikethrough: bool,
}

impl Attrs {
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            bold: false,
            italic: false,
            underline: false,
            inverse: false,
            dim: false,
            invisible: false,
            strikethrough: false,
        }
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        !(self.bold
            || self.italic
            || self.underline
            || self.inverse
            || self.dim
            || self.invisible
            || self.strikethrough)
    }
}

/// A row-major viewport snapshot (no scrollback), produced on demand by C4.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferSnapshot {
    pub cols: u32,
    pub rows: u32,
    pub cursor_x: i32,
    pub cursor_y: i32,
    pub viewport_y: i32,
    /// `rows` rows of `cols` cells each, or an empty `Vec` for a blank row.
    pub grid: Vec<Vec<Cell>>,
}

/// HQ-only registry entry (spec §3, §4.9). `bearer_token` is never serialized
/// back out over `/api/remotes` (the table says "no token").
#[derive(Debug, Clone)]
pub struct RemoteRegistration {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub bearer_token: String,
    pub last_healthy: Timestamp,
    pub owned_session_ids: Vec<String>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoteRegistrationPublic {
    pub id: String,
    pub name: String,
    #[serde(rename = "baseUrl")]
    pub base_url: String,
}

impl From<&RemoteRegistration> for RemoteRegistrationPublic {
    fn from(r: &RemoteRegistration) -> Self {
        Self {
            id: r.id.clone(),
            name: r.name.clone(),
            base_url: r.base_url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cast_record_round_trips_through_json_line() {
        let rec = CastRecord::Output {
            time: 1.5,
            data: b"hello\n".to_vec(),
        };
        let line = rec.to_json_line();
        let parsed = CastRecord::parse_line(&line).unwrap();
        assert_eq!(parsed, rec);
    }

    #[test]
    fn resize_record_round_trips() {
        let rec = CastRecord::Resize {
            time: 0.25,
            cols: 100,
            rows: 30,
        };
        let parsed = CastRecord::parse_line(&rec.to_json_line()).unwrap();
        assert_eq!(parsed, rec);
    }

    #[test]
    fn exit_record_round_trips_and_is_last() {
        let rec = CastRecord::Exit {
            code: 0,
            session_id: "abc".to_string(),
        };
        assert!(rec.is_exit());
        let parsed = CastRecord::parse_line(&rec.to_json_line()).unwrap();
        assert_eq!(parsed, rec);
    }

    #[test]
    fn with_time_rewrites_only_timed_variants() {
        let rec = CastRecord::Input {
            time: 9.0,
            data: b"x".to_vec(),
        };
        let rewritten = rec.with_time(0.0);
        assert_eq!(rewritten.time(), Some(0.0));

        let exit = CastRecord::Exit {
            code: 0,
            session_id: "s".to_string(),
        };
        assert_eq!(exit.with_time(0.0).time(), None);
    }

    #[test]
    fn malformed_line_is_none() {
        assert!(CastRecord::parse_line("not json").is_none());
        assert!(CastRecord::parse_line("{\"version\":2}").is_none());
    }
}
