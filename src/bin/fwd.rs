//! `fwd`: the CLI forwarder (spec §6). Creates a session in the same
//! `CONTROL_DIR` a running `vibetunneld` would use, without going through
//! HTTP — grounded directly on the donor's `sessions::spawn_command`, which
//! did the same thing before the HTTP server existed. Reuses the exact
//! Session Store and Cast Writer contracts `vibetunneld`'s Session Manager
//! does; the only addition over a server-created session is that this
//! process attaches its own terminal to it, the way the donor's interactive
//! (non-`--serve`) mode attaches to its controlling terminal.

use std::env;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use argument_parser::Parser;

use vibetunnel::cast::CastWriter;
use vibetunnel::protocol::{AsciinemaHeader, CastRecord, Session, SessionStatus};
use vibetunnel::pty::{self, PtyHandle, RawModeGuard};
use vibetunnel::store::SessionStore;
use vibetunnel::utils::{init_tracing, terminal_size};

const TAIL_POLL: Duration = Duration::from_millis(50);

fn main() -> Result<()> {
    init_tracing();

    let mut parser = Parser::from_env();
    let mut control_dir = default_control_dir()?;
    let mut session_id = None::<String>;
    let mut command = Vec::<String>::new();

    while let Some(param) = parser.param()? {
        match param {
            p if p.is_long("control-dir") => control_dir = parser.value()?,
            p if p.is_long("session-id") => session_id = Some(parser.value()?),
            p if p.is_pos() => command.push(parser.value()?),
            p if p.is_long("help") => {
                println!("Usage: fwd [--session-id ID] [--control-dir PATH] <command> [args...]");
                return Ok(());
            }
            _ => return Err(parser.unexpected().into()),
        }
    }

    if command.is_empty() {
        return Err(anyhow!("usage: fwd [--session-id ID] <command> [args...]"));
    }

    let exit_code = run(control_dir, session_id, command)?;
    std::process::exit(exit_code);
}

fn run(control_dir: PathBuf, session_id: Option<String>, command: Vec<String>) -> Result<i32> {
    let store = SessionStore::new(control_dir);
    let id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let size = terminal_size();
    let term = env::var("TERM").unwrap_or_else(|_| "xterm-256color".to_string());
    let working_dir = env::current_dir()?.to_string_lossy().to_string();

    let session = Session::new_starting(
        id.clone(),
        command.clone(),
        working_dir.clone(),
        term.clone(),
        size.width,
        size.height,
    );
    let dir = store.create_session_dir(&session)?;

    let shell = env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
    let header = AsciinemaHeader::new(size.width, size.height, &term, &shell);
    let cast = CastWriter::create(&dir, &header)?;
    let stream_out = dir.join("stream-out");

    let (exit_tx, exit_rx) = mpsc::channel::<i32>();
    let store_for_exit = store.clone();
    let id_for_exit = id.clone();
    let handle = pty::spawn(
        &id,
        &command,
        Path::new(&working_dir),
        size.width,
        size.height,
        &term,
        &[],
        &dir.join("stdin"),
        &dir.join("control"),
        cast,
        None,
        move |code| {
            let result = store_for_exit.update_session(&id_for_exit, |s| {
                s.status = SessionStatus::Exited;
                s.exit_code = Some(code);
            });
            if let Err(err) = result {
                tracing::warn!(session_id = %id_for_exit, error = %err, "failed to record fwd session exit");
            }
            // The receiver may already be gone if stdin forwarding panicked;
            // a send failure there just means the main thread timed out some
            // other way and doesn't need this code anymore.
            let _ = exit_tx.send(code);
        },
    )?;

    let pid = handle.pid().as_raw() as u32;
    handle.wait_until_running(pty::RUNNING_GRACE);
    store.update_session(&id, |s| {
        s.pid = Some(pid);
        s.status = SessionStatus::Running;
    })?;

    let handle = Arc::new(handle);
    let raw_mode = RawModeGuard::enable().ok();

    let input_handle = handle.clone();
    std::thread::spawn(move || pump_stdin(&input_handle));

    std::thread::spawn(move || tail_to_stdout(&stream_out));

    let code = exit_rx.recv().unwrap_or(1);
    drop(raw_mode);
    Ok(code)
}

/// Forwards the invoking terminal's raw stdin into the PTY master — the
/// donor's own interactive mode reads and writes the controlling terminal
/// directly rather than going through a named pipe, since `fwd` (unlike
/// `vibetunneld`) owns the terminal it's attached to.
fn pump_stdin(handle: &PtyHandle) {
    let mut stdin = io::stdin();
    let mut buf = [0u8; 4096];
    loop {
        match stdin.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if handle.write_input(&buf[..n]).is_err() {
                    return;
                }
            }
        }
    }
}

/// Tails `stream-out` the same way the Stream Watcher does for an SSE
/// client, but decodes straight back to raw bytes on the local terminal
/// instead of re-framing as `data:` events (spec §6: "Exit code mirrors
/// child's" — the local terminal should see exactly what the cast records).
fn tail_to_stdout(path: &Path) {
    let mut offset = match wait_for_header(path) {
        Some(offset) => offset,
        None => return,
    };
    let stdout = io::stdout();

    loop {
        std::thread::sleep(TAIL_POLL);
        let Ok(metadata) = std::fs::metadata(path) else {
            continue;
        };
        let len = metadata.len();
        if len <= offset {
            continue;
        }
        let Ok(mut file) = File::open(path) else {
            continue;
        };
        if file.seek(SeekFrom::Start(offset)).is_err() {
            continue;
        }
        let mut buf = String::new();
        if file.by_ref().take(len - offset).read_to_string(&mut buf).is_err() {
            offset = len;
            continue;
        }
        offset = len;

        let mut out = stdout.lock();
        for line in buf.lines() {
            let Some(record) = CastRecord::parse_line(line) else {
                continue;
            };
            match record {
                CastRecord::Output { data, .. } => {
                    let _ = out.write_all(&data);
                    let _ = out.flush();
                }
                CastRecord::Exit { .. } => return,
                CastRecord::Input { .. } | CastRecord::Resize { .. } => {}
            }
        }
    }
}

fn wait_for_header(path: &Path) -> Option<u64> {
    for _ in 0..200 {
        if let Ok(file) = File::open(path) {
            let mut reader = BufReader::new(file);
            let mut header = String::new();
            if reader.read_line(&mut header).unwrap_or(0) > 0 {
                return Some(header.len() as u64);
            }
        }
        std::thread::sleep(TAIL_POLL);
    }
    None
}

fn default_control_dir() -> Result<PathBuf> {
    if let Ok(dir) = env::var("CONTROL_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let home = env::home_dir().ok_or_else(|| anyhow!("unable to determine home directory"))?;
    Ok(home.join(".vibetunnel/control"))
}
