//! PTY Host (C3, spec §4.3): spawns a child behind a pseudo-terminal,
//! pumps bytes between the child, the on-disk cast file, and the named
//! pipes clients write input/control messages into, and reaps the child
//! on exit.
//!
//! Grounded on the donor's `tty_spawn.rs`: `openpty` + raw-mode setup +
//! `fork`/`execvp` and the `login_tty_compat` cross-platform reimplementation
//! of `login_tty` for Linux, the `select()`-with-100ms-timeout multi-fd pump,
//! and `mkfifo_atomic` for the named pipes. Unlike the donor's CLI (which
//! optionally attaches to its own controlling terminal), this server spawns
//! every session the way the donor's *detached* branch does — the spawned
//! child's controlling terminal is the PTY slave, never this process's own
//! stdin/stdout.

use std::env;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::pty::{openpty, Winsize};
use nix::sys::select::{select, FdSet};
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::Mode;
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, LocalFlags, SetArg};
use nix::sys::time::TimeVal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, execvp, fork, mkfifo, read, setsid, write, ForkResult, Pid};
use tracing::warn;

use crate::cast::CastWriter;
use crate::emulator::Emulator;
use crate::error::{AppError, AppResult};

const READ_BUF: usize = 4096;
const SELECT_TIMEOUT_US: i64 = 100_000;
const KILL_GRACE: Duration = Duration::from_secs(3);
/// How long `PtyHandle::wait_until_running` waits for the child's first
/// output before giving up and considering the session `running` anyway
/// (spec §4.3: "`status` is set to `running` on first observed output OR
/// after 100 ms, whichever comes first").
pub const RUNNING_GRACE: Duration = Duration::from_millis(100);

#[cfg(target_os = "linux")]
const TIOCSCTTY: u64 = 0x540E;

/// A running PTY-backed session. Owns the master fd and the child pid; the
/// communication loop that reads/writes it runs on a dedicated thread
/// spawned by `PtyHost::spawn`.
pub struct PtyHandle {
    master: OwnedFd,
    child: Pid,
    first_output: Receiver<()>,
}

impl PtyHandle {
    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.child
    }

    /// Blocks until the communication loop has observed the first byte of
    /// output from the child, or `timeout` elapses — whichever comes first
    /// (spec §4.3). Callers use this to gate the `starting → running`
    /// transition instead of flipping it the instant the PID is known.
    pub fn wait_until_running(&self, timeout: Duration) {
        let _ = self.first_output.recv_timeout(timeout);
    }

    pub fn resize(&self, cols: u16, rows: u16) -> AppResult<()> {
        set_winsize(
            self.master.as_fd(),
            Winsize {
                ws_row: rows,
                ws_col: cols,
                ws_xpixel: 0,
                ws_ypixel: 0,
            },
        )
        .map_err(|e| AppError::IoError(io::Error::from_raw_os_error(e as i32)))
    }

    pub fn write_input(&self, data: &[u8]) -> AppResult<()> {
        write_all(self.master.as_fd(), data)
            .map_err(|e| AppError::IoError(io::Error::from_raw_os_error(e as i32)))
    }

    /// SIGTERM, then SIGKILL after `KILL_GRACE` if the child hasn't exited
    /// (spec §4.3 escalation policy).
    pub fn kill(&self) -> AppResult<()> {
        let _ = kill(self.child, Signal::SIGTERM);
        let deadline = Instant::now() + KILL_GRACE;
        loop {
            match waitpid(self.child, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {
                    if Instant::now() >= deadline {
                        let _ = kill(self.child, Signal::SIGKILL);
                        let _ = waitpid(self.child, None);
                        return Ok(());
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Ok(_) | Err(_) => return Ok(()),
            }
        }
    }
}

/// Resolves the shell-alias rule in spec §4.3/§9: if the program name
/// contains a path separator and exists, or resolves via `PATH`, exec it
/// directly with `args`; otherwise treat it as a shell builtin/alias and
/// wrap the whole command line through `<user_shell> -i -l -c "..."`. The
/// shell comes from `$SHELL`, falling back to `zsh → bash → sh`.
#[must_use]
pub fn resolve_command(command: &[String]) -> Vec<String> {
    let Some(program) = command.first() else {
        return command.to_vec();
    };
    if (program.contains('/') && Path::new(program).exists()) || which(program).is_some() {
        return command.to_vec();
    }
    let shell = user_shell();
    let joined = shell_words::join(command);
    vec![
        shell,
        "-i".to_string(),
        "-l".to_string(),
        "-c".to_string(),
        joined,
    ]
}

fn which(program: &str) -> Option<std::path::PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

fn user_shell() -> String {
    if let Ok(shell) = env::var("SHELL") {
        if !shell.is_empty() {
            return shell;
        }
    }
    for candidate in ["zsh", "bash", "sh"] {
        if let Some(path) = which(candidate) {
            return path.to_string_lossy().to_string();
        }
    }
    "/bin/sh".to_string()
}

/// Creates a FIFO at `path` if one isn't already there.
pub fn create_fifo(path: &Path) -> AppResult<()> {
    match mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR) {
        Ok(()) | Err(Errno::EEXIST) => Ok(()),
        Err(err) => Err(AppError::IoError(io::Error::from_raw_os_error(err as i32))),
    }
}

/// Spawns `command` behind a PTY of size `cols`x`rows`, forking a child that
/// execs into it, and starts the communication loop on a background thread.
/// `on_exit` runs on that thread once the child has been reaped. `env`
/// (spec §4.3's creation contract) is applied on top of the allowlisted
/// terminal variables `term_env` derives, so a caller-supplied value wins
/// on collision.
#[allow(clippy::too_many_arguments)]
pub fn spawn(
    session_id: &str,
    command: &[String],
    working_dir: &Path,
    cols: u16,
    rows: u16,
    term: &str,
    env: &[(String, String)],
    stdin_fifo: &Path,
    control_fifo: &Path,
    mut cast: CastWriter,
    emulator: Option<Arc<Emulator>>,
    on_exit: impl FnOnce(i32) + Send + 'static,
) -> AppResult<PtyHandle> {
    let resolved = resolve_command(command);
    let args: Vec<CString> = resolved
        .iter()
        .filter_map(|s| CString::new(s.as_bytes()).ok())
        .collect();
    if args.is_empty() {
        return Err(AppError::InvalidInput("empty command".to_string()));
    }

    create_fifo(stdin_fifo)?;
    create_fifo(control_fifo)?;

    let winsize = Some(Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    });
    let termios: Option<nix::sys::termios::Termios> = None;
    let pty =
        openpty(&winsize, &termios).map_err(|e| AppError::Fatal(format!("openpty: {e}")))?;

    match unsafe { fork() }.map_err(|e| AppError::Fatal(format!("fork: {e}")))? {
        ForkResult::Parent { child } => {
            drop(pty.slave);
            let master = pty.master;
            let stdin_path = stdin_fifo.to_path_buf();
            let control_path = control_fifo.to_path_buf();
            let session_id = session_id.to_string();
            let master_dup_fd = unsafe { libc::dup(master.as_raw_fd()) };
            if master_dup_fd < 0 {
                return Err(AppError::Fatal("dup master: failed".to_string()));
            }
            let master_dup = unsafe { OwnedFd::from_raw_fd(master_dup_fd) };
            let (first_output_tx, first_output_rx) = mpsc::sync_channel::<()>(1);

            std::thread::spawn(move || {
                let code = communication_loop(
                    &master,
                    child,
                    &stdin_path,
                    &control_path,
                    &mut cast,
                    emulator.as_deref(),
                    &first_output_tx,
                );
                let code = code.unwrap_or(1);
                let _ = cast.write_exit(code, &session_id);
                on_exit(code);
            });

            Ok(PtyHandle {
                master: master_dup,
                child,
                first_output: first_output_rx,
            })
        }
        ForkResult::Child => {
            let mut env_vars = term_env(term);
            env_vars.extend(env.iter().cloned());
            // Never returns on success: execs into the target program.
            let _ = run_child(&pty.master, pty.slave, working_dir, &env_vars, &args);
            std::process::exit(127);
        }
    }
}

fn term_env(term: &str) -> Vec<(String, String)> {
    let mut vars = vec![("TERM".to_string(), term.to_string())];
    for key in ["LANG", "LC_ALL", "PATH", "USER", "HOME"] {
        if let Ok(value) = env::var(key) {
            vars.push((key.to_string(), value));
        }
    }
    vars
}

fn run_child(
    master: &OwnedFd,
    slave: OwnedFd,
    working_dir: &Path,
    env_vars: &[(String, String)],
    args: &[CString],
) -> AppResult<()> {
    close(master.as_raw_fd()).ok();
    let _ = setsid();

    let slave_fd = slave.as_raw_fd();
    unsafe {
        login_tty_compat(slave_fd)?;
    }

    let _ = env::set_current_dir(working_dir);
    for (key, value) in env_vars {
        env::set_var(key, value);
    }

    match execvp(&args[0], args) {
        Ok(_infallible) => unreachable!(),
        Err(err) => Err(AppError::Fatal(format!("execvp: {err}"))),
    }
}

/// Cross-platform reimplementation of `login_tty` (the donor's own
/// comment: "on systems without it, implement manually"). Linux lacks the
/// libc symbol; macOS/BSD have it natively but this crate targets the
/// server deployment surface (primarily Linux containers), so only the
/// manual path is carried forward.
unsafe fn login_tty_compat(fd: i32) -> AppResult<()> {
    #[cfg(target_os = "linux")]
    {
        if libc::ioctl(fd, TIOCSCTTY as libc::c_ulong, 0) == -1
            && libc::ioctl(fd, TIOCSCTTY as libc::c_ulong, 1) == -1
        {
            return Err(AppError::Fatal("ioctl TIOCSCTTY failed".to_string()));
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        if libc::ioctl(fd, libc::TIOCSCTTY as libc::c_ulong, 0) == -1
            && libc::ioctl(fd, libc::TIOCSCTTY as libc::c_ulong, 1) == -1
        {
            return Err(AppError::Fatal("ioctl TIOCSCTTY failed".to_string()));
        }
    }

    if libc::dup2(fd, 0) == -1 || libc::dup2(fd, 1) == -1 || libc::dup2(fd, 2) == -1 {
        return Err(AppError::Fatal("dup2 onto stdio failed".to_string()));
    }
    if fd > 2 {
        libc::close(fd);
    }
    Ok(())
}

/// A parsed line from the `control` pipe (spec §4.3).
enum ControlCommand {
    Resize { cols: u16, rows: u16 },
    Kill { signal: Signal },
}

fn parse_control_line(line: &str) -> Option<ControlCommand> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    match value.get("cmd")?.as_str()? {
        "resize" => Some(ControlCommand::Resize {
            cols: value.get("cols")?.as_u64()? as u16,
            rows: value.get("rows")?.as_u64()? as u16,
        }),
        "kill" => {
            let signal = match value.get("signal").and_then(serde_json::Value::as_str) {
                Some("KILL") => Signal::SIGKILL,
                _ => Signal::SIGTERM,
            };
            Some(ControlCommand::Kill { signal })
        }
        other => {
            warn!(cmd = other, "ignoring unknown control command");
            None
        }
    }
}

fn communication_loop(
    master: &OwnedFd,
    child: Pid,
    stdin_fifo: &Path,
    control_fifo: &Path,
    cast: &mut CastWriter,
    emulator: Option<&Emulator>,
    first_output_tx: &SyncSender<()>,
) -> AppResult<i32> {
    let mut stdin_file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(stdin_fifo)?;
    let mut control_file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(control_fifo)?;

    let mut buf = [0u8; READ_BUF];
    let mut control_buf = Vec::new();
    let mut done = false;
    let mut kill_deadline: Option<Instant> = None;
    let mut signaled_first_output = false;

    while !done {
        let mut read_fds = FdSet::new();
        let mut timeout = TimeVal::new(0, SELECT_TIMEOUT_US);
        read_fds.insert(master.as_fd());
        read_fds.insert(stdin_file.as_fd());
        read_fds.insert(control_file.as_fd());

        match select(None, Some(&mut read_fds), None, None, Some(&mut timeout)) {
            Ok(0) | Err(Errno::EINTR | Errno::EAGAIN) => {}
            Ok(_) => {
                if read_fds.contains(stdin_file.as_fd()) {
                    match read(&stdin_file, &mut buf) {
                        Ok(0) | Err(Errno::EAGAIN | Errno::EINTR) => {}
                        Ok(n) => {
                            write_all(master.as_fd(), &buf[..n])
                                .map_err(|e| AppError::Fatal(format!("write master: {e}")))?;
                            let _ = cast.write_input(&buf[..n]);
                        }
                        Err(err) => return Err(AppError::Fatal(format!("read stdin fifo: {err}"))),
                    }
                }

                if read_fds.contains(control_file.as_fd()) {
                    match read(&control_file, &mut buf) {
                        Ok(0) | Err(Errno::EAGAIN | Errno::EINTR) => {}
                        Ok(n) => {
                            control_buf.extend_from_slice(&buf[..n]);
                            while let Some(pos) = control_buf.iter().position(|&b| b == b'\n') {
                                let line: Vec<u8> = control_buf.drain(..=pos).collect();
                                let Ok(text) = std::str::from_utf8(&line) else {
                                    continue;
                                };
                                match parse_control_line(text.trim()) {
                                    Some(ControlCommand::Resize { cols, rows }) => {
                                        let _ = set_winsize(
                                            master.as_fd(),
                                            Winsize {
                                                ws_row: rows,
                                                ws_col: cols,
                                                ws_xpixel: 0,
                                                ws_ypixel: 0,
                                            },
                                        );
                                        let _ = cast.write_resize(cols, rows);
                                        if let Some(emulator) = emulator {
                                            emulator.resize(cols, rows);
                                        }
                                    }
                                    Some(ControlCommand::Kill { signal }) => {
                                        let _ = kill(child, signal);
                                        if signal == Signal::SIGTERM {
                                            kill_deadline = Some(Instant::now() + KILL_GRACE);
                                        }
                                    }
                                    None => {}
                                }
                            }
                        }
                        Err(err) => return Err(AppError::Fatal(format!("read control fifo: {err}"))),
                    }
                }

                if read_fds.contains(master.as_fd()) {
                    match read(master, &mut buf) {
                        Ok(0) | Err(Errno::EIO) => done = true,
                        Ok(n) => {
                            let _ = cast.write_output(&buf[..n]);
                            if let Some(emulator) = emulator {
                                emulator.feed(&buf[..n]);
                            }
                            if !signaled_first_output {
                                let _ = first_output_tx.try_send(());
                                signaled_first_output = true;
                            }
                        }
                        Err(Errno::EAGAIN | Errno::EINTR) => {}
                        Err(err) => return Err(AppError::Fatal(format!("read master: {err}"))),
                    }
                }
            }
            Err(err) => return Err(AppError::Fatal(format!("select: {err}"))),
        }

        if !done {
            match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {
                    if let Some(deadline) = kill_deadline {
                        if Instant::now() >= deadline {
                            let _ = kill(child, Signal::SIGKILL);
                            kill_deadline = None;
                        }
                    }
                }
                Ok(status) => {
                    return Ok(exit_code_of(status));
                }
                Err(_) => done = true,
            }
        }
    }

    Ok(match waitpid(child, None) {
        Ok(WaitStatus::Exited(_, status)) => status,
        Ok(WaitStatus::Signaled(_, signal, _)) => 128 + signal as i32,
        _ => 1,
    })
}

fn exit_code_of(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        _ => 1,
    }
}

fn set_winsize(fd: BorrowedFd, winsize: Winsize) -> Result<(), Errno> {
    nix::ioctl_write_ptr_bad!(_set_window_size, libc::TIOCSWINSZ, Winsize);
    unsafe { _set_window_size(fd.as_raw_fd(), &winsize) }
}

fn write_all(fd: BorrowedFd, mut buf: &[u8]) -> Result<(), Errno> {
    while !buf.is_empty() {
        let n = write(fd, buf)?;
        buf = &buf[n..];
    }
    Ok(())
}

/// Puts the calling process's stdin into raw mode and restores it on drop —
/// used only by the `fwd` forwarder, which (unlike the server) is directly
/// attached to a real terminal.
pub struct RawModeGuard {
    original: nix::sys::termios::Termios,
}

impl RawModeGuard {
    pub fn enable() -> AppResult<Self> {
        let original = tcgetattr(io::stdin())
            .map_err(|e| AppError::IoError(io::Error::from_raw_os_error(e as i32)))?;
        let mut raw = original.clone();
        cfmakeraw(&mut raw);
        raw.local_flags.remove(LocalFlags::ECHO);
        tcsetattr(io::stdin(), SetArg::TCSAFLUSH, &raw)
            .map_err(|e| AppError::IoError(io::Error::from_raw_os_error(e as i32)))?;
        Ok(Self { original })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = tcsetattr(io::stdin(), SetArg::TCSAFLUSH, &self.original);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_command_keeps_absolute_paths() {
        let resolved = resolve_command(&["/bin/echo".to_string(), "hi".to_string()]);
        assert_eq!(resolved, vec!["/bin/echo".to_string(), "hi".to_string()]);
    }

    #[test]
    fn resolve_command_keeps_path_resolvable_programs() {
        let resolved = resolve_command(&["ls".to_string(), "-la".to_string()]);
        assert_eq!(resolved, vec!["ls".to_string(), "-la".to_string()]);
    }

    #[test]
    fn resolve_command_wraps_shell_builtins() {
        let resolved = resolve_command(&["nonexistent-builtin-xyz".to_string()]);
        assert!(resolved.len() >= 4);
        assert_eq!(resolved[1], "-i");
        assert_eq!(resolved[2], "-l");
        assert_eq!(resolved[3], "-c");
    }

    #[test]
    fn parse_control_line_extracts_resize_dimensions() {
        match parse_control_line(r#"{"cmd":"resize","cols":100,"rows":40}"#).unwrap() {
            ControlCommand::Resize { cols, rows } => assert_eq!((cols, rows), (100, 40)),
            ControlCommand::Kill { .. } => panic!("expected resize"),
        }
    }

    #[test]
    fn parse_control_line_extracts_kill_signal() {
        match parse_control_line(r#"{"cmd":"kill","signal":"KILL"}"#).unwrap() {
            ControlCommand::Kill { signal } => assert_eq!(signal, Signal::SIGKILL),
            ControlCommand::Resize { .. } => panic!("expected kill"),
        }
    }

    #[test]
    fn parse_control_line_ignores_unknown_commands() {
        assert!(parse_control_line(r#"{"cmd":"ping"}"#).is_none());
    }
}
