use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;
use wait_timeout::ChildExt;

use crate::config::TargetConfig;

/// How long pipe readers may lag behind the child's exit before the captured
/// output is given up on.
const OUTPUT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn target '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to wait for target '{program}': {reason}")]
    Wait { program: String, reason: String },
}

/// Normalized result of one supervised invocation.
#[derive(Debug, Clone)]
pub struct Execution {
    pub exit_code: i32,
    pub output: String,
    pub timed_out: bool,
    pub elapsed: Duration,
}

/// Launches the target once per iteration and bounds it with a watchdog.
pub struct ProcessSupervisor {
    command: Vec<String>,
    working_dir: Option<PathBuf>,
    timeout: Duration,
}

impl ProcessSupervisor {
    pub fn new(target: &TargetConfig, timeout: Duration) -> Self {
        Self {
            command: target.command.clone(),
            working_dir: target.working_dir.clone(),
            timeout,
        }
    }

    /// Runs `<command...> <map_path> <action_sequence>`.
    ///
    /// Spawn and wait failures are environment errors and are returned as
    /// `Err`. A hung target is not an error: the watchdog kills it and the
    /// result carries `timed_out = true`.
    pub fn execute(
        &self,
        map_path: &Path,
        action_sequence: &str,
    ) -> Result<Execution, SupervisorError> {
        let program = self.command.first().cloned().unwrap_or_default();
        let mut cmd = Command::new(&program);
        cmd.args(self.command.iter().skip(1))
            .arg(map_path)
            .arg(action_sequence)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = self.working_dir.as_ref() {
            cmd.current_dir(dir);
        }
        // Own process group, so the watchdog can take down everything the
        // target started.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            program: program.clone(),
            source,
        })?;

        let stdout_rx = spawn_pipe_reader(child.stdout.take());
        let stderr_rx = spawn_pipe_reader(child.stderr.take());

        let timeout = self.timeout;
        let watchdog = thread::Builder::new()
            .name("fuzz-watchdog".to_string())
            .spawn(move || watch(child, timeout))
            .map_err(|e| SupervisorError::Wait {
                program: program.clone(),
                reason: format!("failed to start watchdog: {}", e),
            })?;

        let (status, timed_out) = watchdog
            .join()
            .map_err(|_| SupervisorError::Wait {
                program: program.clone(),
                reason: "watchdog thread panicked".to_string(),
            })?
            .map_err(|e| SupervisorError::Wait {
                program: program.clone(),
                reason: e.to_string(),
            })?;
        let elapsed = started.elapsed();

        let output = collect_output(&stdout_rx, &stderr_rx, &program, OUTPUT_GRACE);
        Ok(Execution {
            exit_code: exit_code_of(&status),
            output,
            timed_out,
            elapsed,
        })
    }
}

/// Watchdog body. Owns the child, so it is the only party that can kill it.
fn watch(mut child: Child, timeout: Duration) -> std::io::Result<(ExitStatus, bool)> {
    match child.wait_timeout(timeout)? {
        Some(status) => {
            // Anything the target left running would keep its pipes open.
            if let Err(e) = kill_leftovers(&child) {
                warn!(error = %e, "failed to stop processes left behind by target");
            }
            Ok((status, false))
        }
        None => {
            terminate(&mut child)?;
            let status = child.wait()?;
            Ok((status, true))
        }
    }
}

/// SIGKILL to the target's whole process group, so a target ignoring
/// SIGTERM and any children it forked are all stopped.
#[cfg(unix)]
fn terminate(child: &mut Child) -> std::io::Result<()> {
    kill_process_group(child)
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> std::io::Result<()> {
    match child.kill() {
        Ok(()) => Ok(()),
        // Exited between the deadline and the kill.
        Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn kill_leftovers(child: &Child) -> std::io::Result<()> {
    kill_process_group(child)
}

#[cfg(not(unix))]
fn kill_leftovers(_child: &Child) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn kill_process_group(child: &Child) -> std::io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let pgid = i32::try_from(child.id()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "child pid out of range")
    })?;
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        // Group already empty.
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn spawn_pipe_reader<R>(pipe: Option<R>) -> mpsc::Receiver<std::io::Result<Vec<u8>>>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    match pipe {
        Some(mut pipe) => {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let result = pipe.read_to_end(&mut buf).map(|_| buf);
                let _ = tx.send(result);
            });
        }
        None => {
            let _ = tx.send(Ok(Vec::new()));
        }
    }
    rx
}

/// Stdout followed by stderr. Any capture failure, or a pipe still open
/// `grace` after the target exited, degrades to an empty string; it never
/// fails the iteration.
fn collect_output(
    stdout_rx: &mpsc::Receiver<std::io::Result<Vec<u8>>>,
    stderr_rx: &mpsc::Receiver<std::io::Result<Vec<u8>>>,
    program: &str,
    grace: Duration,
) -> String {
    let deadline = Instant::now() + grace;
    let mut merged = Vec::new();
    for (name, rx) in [("stdout", stdout_rx), ("stderr", stderr_rx)] {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(Ok(bytes)) => merged.extend_from_slice(&bytes),
            Ok(Err(e)) => {
                warn!(target_program = program, pipe = name, error = %e, "failed to read target output");
                return String::new();
            }
            Err(_) => {
                warn!(
                    target_program = program,
                    pipe = name,
                    "target output still open after exit; dropping captured output"
                );
                return String::new();
            }
        }
    }
    String::from_utf8_lossy(&merged).into_owned()
}

#[cfg(unix)]
fn exit_code_of(status: &ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

#[cfg(not(unix))]
fn exit_code_of(status: &ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
