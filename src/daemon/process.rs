//! Process bookkeeping: the PID file, the fork into the background and
//! the env var that marks the daemon child.

use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use tracing::info;

use crate::control::ControlClient;
use crate::error::{BoreError, Result};
use crate::paths::{write_private, Paths};

pub const DAEMON_ENV_VAR: &str = "BORE_DAEMON";

/// Whether this process is the post-fork daemon child.
pub fn is_daemon_child() -> bool {
    std::env::var(DAEMON_ENV_VAR).map(|v| v == "1").unwrap_or(false)
}

/// Re-exec ourselves detached, with stdout/stderr appended to the log
/// file and the child marker set.
pub fn fork(paths: &Paths) -> Result<()> {
    let exe = std::env::current_exe()?;

    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.log())?;

    let mut command = Command::new(exe);
    command
        .arg("start")
        .env(DAEMON_ENV_VAR, "1")
        .stdin(Stdio::null())
        .stdout(Stdio::from(log.try_clone()?))
        .stderr(Stdio::from(log))
        .current_dir("/");

    unsafe {
        command.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    command.spawn()?;
    Ok(())
}

pub fn write_pid(paths: &Paths) -> Result<()> {
    let pid = std::process::id();
    write_private(&paths.pid(), pid.to_string().as_bytes())?;
    Ok(())
}

pub fn read_pid(paths: &Paths) -> Result<i32> {
    let data = std::fs::read_to_string(paths.pid())?;
    data.trim()
        .parse()
        .map_err(|_| BoreError::State(format!("malformed PID file {}", paths.pid().display())))
}

pub fn remove_pid(paths: &Paths) {
    let _ = std::fs::remove_file(paths.pid());
}

/// Signal 0 probes liveness without touching the process.
pub fn is_process_running(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Stop a running daemon: graceful control-socket stop first, SIGTERM as
/// the fallback. A stale PID file is cleaned up along the way.
pub async fn stop_daemon(paths: &Paths) -> Result<()> {
    let pid = read_pid(paths)
        .map_err(|_| BoreError::State("daemon not running (no PID file)".to_string()))?;

    if !is_process_running(pid) {
        remove_pid(paths);
        return Err(BoreError::State(
            "daemon not running (stale PID file removed)".to_string(),
        ));
    }

    let client = ControlClient::new(paths.socket());
    if client.stop().await.is_ok() {
        info!("daemon asked to stop via control socket");
        return Ok(());
    }

    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        return Err(BoreError::Io(std::io::Error::last_os_error()));
    }
    info!(pid, "sent SIGTERM to daemon");
    Ok(())
}
