//! External process coordinators.
//!
//! The backend cooperates with two independent OS processes: the HPC
//! pipeline that ingests the board's data packets, and the FITS writer that
//! serializes its output. Both are black boxes controlled through a narrow
//! text command channel (a named pipe for the pipeline, stdin for the
//! writer) and observed through the shared status store plus a liveness
//! poll. This module manages their lifecycle.

use crate::error::{Error, Result};
use nix::sys::stat::Mode;
use nix::unistd;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};

// Grace period allowed for a voluntary exit before escalating to SIGKILL,
// and again after the kill.
const STOP_GRACE: Duration = Duration::from_secs(2);
// Settle delay after spawning, so the process is listening before the
// caller sends its first command.
const START_SETTLE: Duration = Duration::from_millis(500);

/// Command channel of a managed process.
#[derive(Debug, Clone)]
pub enum CommandChannel {
    /// A named pipe the process reads commands from.
    Fifo(PathBuf),
    /// The process reads commands from its stdin.
    Stdin,
}

/// Coordinator for one managed external process.
///
/// At most one child is live per coordinator; starting again first stops
/// and reclaims the previous child.
#[derive(Debug)]
pub struct Coordinator {
    name: &'static str,
    program: String,
    args: Vec<String>,
    channel: CommandChannel,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
}

impl Coordinator {
    /// Creates a coordinator for the given program. No process is started.
    pub fn new(
        name: &'static str,
        program: impl Into<String>,
        args: Vec<String>,
        channel: CommandChannel,
    ) -> Coordinator {
        Coordinator {
            name,
            program: program.into(),
            args,
            channel,
            child: None,
            stdin: None,
        }
    }

    /// Returns whether the process is alive.
    ///
    /// A crashed child is reaped here and surfaces as not running; the crash
    /// itself is not escalated.
    pub fn running(&mut self) -> bool {
        match &mut self.child {
            None => false,
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    tracing::warn!(process = self.name, %status, "process exited");
                    self.child = None;
                    self.stdin = None;
                    false
                }
                Err(err) => {
                    tracing::warn!(process = self.name, %err, "liveness poll failed");
                    false
                }
            },
        }
    }

    /// Starts the process, stopping a previous instance first.
    ///
    /// Blocks for a short settle delay after spawning so that the process is
    /// ready to take commands when this returns.
    pub async fn start(&mut self) -> Result<()> {
        if self.running() {
            tracing::info!(process = self.name, "already running, restarting");
            self.stop().await?;
        }
        if let CommandChannel::Fifo(path) = &self.channel {
            ensure_fifo(path)?;
        }
        let mut command = Command::new(&self.program);
        command.args(&self.args).kill_on_drop(true);
        if matches!(self.channel, CommandChannel::Stdin) {
            command.stdin(Stdio::piped());
        }
        let mut child = command.spawn().map_err(|err| {
            Error::Configuration(format!("cannot spawn {} ({}): {err}", self.name, self.program))
        })?;
        self.stdin = child.stdin.take();
        self.child = Some(child);
        tracing::info!(process = self.name, program = %self.program, "started");
        tokio::time::sleep(START_SETTLE).await;
        Ok(())
    }

    /// Stops the process.
    ///
    /// Sends the graceful `quit` command, waits up to a grace period, then
    /// escalates to a kill signal and waits again. Returns whether the kill
    /// was required. No-op returning `false` if nothing is running.
    pub async fn stop(&mut self) -> Result<bool> {
        if !self.running() {
            return Ok(false);
        }
        if let Err(err) = self.send_command("quit").await {
            tracing::warn!(process = self.name, %err, "graceful quit not delivered");
        }
        // dropping our stdin handle also signals EOF to stdin-driven readers
        self.stdin = None;
        let mut child = self.child.take().expect("running() checked above");
        let forced = match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(status) => {
                let status = status
                    .map_err(|err| Error::Device(format!("wait for {} failed: {err}", self.name)))?;
                tracing::info!(process = self.name, %status, "stopped gracefully");
                false
            }
            Err(_) => {
                tracing::warn!(process = self.name, "grace period expired, killing");
                child
                    .start_kill()
                    .map_err(|err| Error::Device(format!("kill {} failed: {err}", self.name)))?;
                let _ = tokio::time::timeout(STOP_GRACE, child.wait()).await;
                true
            }
        };
        Ok(forced)
    }

    /// Sends one line of text over the command channel.
    ///
    /// Fails with [`Error::ProcessNotRunning`] if no process is started.
    /// Returns `Ok(false)` without blocking when the channel is not ready
    /// (for a named pipe, when the process has not opened its end yet);
    /// callers may retry.
    pub async fn send_command(&mut self, text: &str) -> Result<bool> {
        if !self.running() {
            return Err(Error::ProcessNotRunning(self.name));
        }
        match &self.channel {
            CommandChannel::Fifo(path) => {
                let mut file = match std::fs::OpenOptions::new()
                    .write(true)
                    .custom_flags(nix::libc::O_NONBLOCK)
                    .open(path)
                {
                    Ok(file) => file,
                    Err(err) => {
                        tracing::warn!(
                            process = self.name,
                            fifo = %path.display(),
                            %err,
                            "command channel not ready"
                        );
                        return Ok(false);
                    }
                };
                match writeln!(file, "{text}") {
                    Ok(()) => Ok(true),
                    Err(err) => {
                        tracing::warn!(process = self.name, %err, "command write failed");
                        Ok(false)
                    }
                }
            }
            CommandChannel::Stdin => {
                let stdin = self
                    .stdin
                    .as_mut()
                    .ok_or(Error::ProcessNotRunning(self.name))?;
                // a line always fits in the pipe buffer, so this never
                // stalls the control task
                let line = format!("{text}\n");
                stdin
                    .write_all(line.as_bytes())
                    .await
                    .map_err(|err| Error::Device(format!("stdin write failed: {err}")))?;
                Ok(true)
            }
        }
    }
}

fn ensure_fifo(path: &PathBuf) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    unistd::mkfifo(path, Mode::from_bits_truncate(0o644))
        .map_err(|err| Error::Configuration(format!("cannot create fifo {}: {err}", path.display())))
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn command_without_process_is_rejected() {
        let mut hpc = Coordinator::new("hpc", "/bin/true", vec![], CommandChannel::Stdin);
        assert!(matches!(
            hpc.send_command("start").await,
            Err(Error::ProcessNotRunning("hpc"))
        ));
        // stop with nothing running is a no-op
        assert!(!hpc.stop().await.unwrap());
    }

    #[tokio::test]
    async fn graceful_stop_is_not_forced() {
        let mut writer = Coordinator::new(
            "fits",
            "/bin/sh",
            vec!["-c".to_string(), "read line; exit 0".to_string()],
            CommandChannel::Stdin,
        );
        writer.start().await.unwrap();
        assert!(writer.running());
        let forced = writer.stop().await.unwrap();
        assert!(!forced);
        assert!(!writer.running());
    }

    #[tokio::test]
    async fn unresponsive_process_is_killed() {
        let mut writer = Coordinator::new(
            "fits",
            "/bin/sh",
            vec!["-c".to_string(), "sleep 30".to_string()],
            CommandChannel::Stdin,
        );
        writer.start().await.unwrap();
        let forced = writer.stop().await.unwrap();
        assert!(forced);
        assert!(!writer.running());
    }

    #[tokio::test]
    async fn crashed_process_surfaces_as_not_running() {
        let mut hpc = Coordinator::new("hpc", "/bin/true", vec![], CommandChannel::Stdin);
        hpc.start().await.unwrap();
        // /bin/true exits immediately; the settle delay has passed
        assert!(!hpc.running());
        assert!(matches!(
            hpc.send_command("start").await,
            Err(Error::ProcessNotRunning("hpc"))
        ));
    }

    #[tokio::test]
    async fn fifo_without_reader_is_nonfatal() {
        let fifo = std::env::temp_dir().join(format!("velad-test-fifo-{}", std::process::id()));
        let mut hpc = Coordinator::new(
            "hpc",
            "/bin/sh",
            vec!["-c".to_string(), "sleep 30".to_string()],
            CommandChannel::Fifo(fifo.clone()),
        );
        hpc.start().await.unwrap();
        // nothing has opened the read end, so the write is dropped
        assert!(!hpc.send_command("start").await.unwrap());
        hpc.stop().await.unwrap();
        let _ = std::fs::remove_file(&fifo);
    }
}
