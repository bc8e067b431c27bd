//! Child processes in their own process group: bounded capture, timeouts and
//! group-wide termination.

use std::collections::BTreeSet;
use std::io::Read;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Extra time the reader threads get to drain pipes once the group is gone.
const READER_DRAIN: Duration = Duration::from_secs(1);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Run `cmd` in a fresh process group, capturing at most `output_limit_bytes` of each stream.
///
/// Both pipes are drained on reader threads while the child runs; excess bytes are counted
/// and dropped. On timeout the whole group is killed, not just the leader. Background
/// processes still in the group when the leader exits are killed too, so an inherited
/// pipe cannot hold the call past its timeout.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    debug!(program = ?cmd.get_program(), "spawning child process");
    let mut child = cmd.spawn().map_err(|err| {
        error!(program = ?cmd.get_program(), err = %err, "failed to spawn command");
        anyhow::Error::new(err).context("spawn command")
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => {
            if group_has_members(&child)? {
                warn!("command left processes in its group, killing them");
                terminate_group(&mut child, Duration::ZERO)?;
            }
            status
        }
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing process group"
            );
            timed_out = true;
            terminate_group(&mut child, Duration::ZERO)?
        }
    };

    let join_deadline = deadline.max(Instant::now()) + READER_DRAIN;
    let (stdout, stdout_truncated) =
        join_output(stdout_handle, join_deadline).context("join stdout")?;
    let (stderr, stderr_truncated) =
        join_output(stderr_handle, join_deadline).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// Terminate the process group led by `child` and reap the leader.
///
/// Sends SIGTERM to the group, polls until the group is empty or `grace`
/// elapses, then sends SIGKILL to whatever is left. A group that is already
/// gone (`ESRCH`) is not an error.
#[instrument(skip_all, fields(pid = child.id(), grace_ms = grace.as_millis() as u64))]
pub fn terminate_group(child: &mut Child, grace: Duration) -> Result<ExitStatus> {
    let pgid = group_id(child)?;
    if !grace.is_zero() {
        debug!("sending SIGTERM to process group");
        signal_group(pgid, Signal::SIGTERM)?;
        let deadline = Instant::now() + grace;
        loop {
            // Reap the leader as soon as it exits so it stops counting as a member.
            child.try_wait().context("poll group leader")?;
            if !group_alive(pgid)? {
                debug!("process group exited within grace period");
                break;
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(GROUP_POLL_INTERVAL);
        }
    }

    if group_alive(pgid)? {
        warn!("process group still alive, sending SIGKILL");
        signal_group(pgid, Signal::SIGKILL)?;
    }
    child.wait().context("reap group leader")
}

/// Process groups launched on the patcher's behalf that are still running.
///
/// Clones share one set. A shutdown handler uses it to reach children that
/// live outside the patcher's own process group.
#[derive(Debug, Clone, Default)]
pub struct GroupTracker {
    groups: Arc<Mutex<BTreeSet<i32>>>,
}

impl GroupTracker {
    pub fn track(&self, child: &Child) -> Result<()> {
        let pgid = group_id(child)?;
        self.lock().insert(pgid.as_raw());
        Ok(())
    }

    pub fn untrack(&self, child: &Child) {
        if let Ok(pgid) = group_id(child) {
            self.lock().remove(&pgid.as_raw());
        }
    }

    pub fn active(&self) -> Vec<i32> {
        self.lock().iter().copied().collect()
    }

    /// SIGTERM every tracked group, wait up to `grace` for them to empty,
    /// then SIGKILL whatever is left. Returns the groups that were signalled.
    #[instrument(skip_all, fields(grace_ms = grace.as_millis() as u64))]
    pub fn terminate_all(&self, grace: Duration) -> Vec<i32> {
        let groups = self.active();
        if groups.is_empty() {
            return groups;
        }
        warn!(groups = ?groups, "terminating tracked process groups");
        for &pgid in &groups {
            if let Err(err) = signal_group(Pid::from_raw(pgid), Signal::SIGTERM) {
                warn!(pgid, err = %format!("{err:#}"), "SIGTERM failed");
            }
        }
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline && groups.iter().any(|&pgid| alive_or_unknown(pgid)) {
            thread::sleep(GROUP_POLL_INTERVAL);
        }
        for &pgid in &groups {
            if alive_or_unknown(pgid) {
                warn!(pgid, "process group still alive, sending SIGKILL");
                if let Err(err) = signal_group(Pid::from_raw(pgid), Signal::SIGKILL) {
                    warn!(pgid, err = %format!("{err:#}"), "SIGKILL failed");
                }
            }
        }
        groups
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<i32>> {
        match self.groups.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn alive_or_unknown(pgid: i32) -> bool {
    group_alive(Pid::from_raw(pgid)).unwrap_or(true)
}

/// Whether the process group led by `child` still has members.
pub fn group_has_members(child: &Child) -> Result<bool> {
    group_alive(group_id(child)?)
}

fn group_id(child: &Child) -> Result<Pid> {
    let raw = i32::try_from(child.id()).context("child pid out of range")?;
    Ok(Pid::from_raw(raw))
}

fn signal_group(pgid: Pid, signal: Signal) -> Result<()> {
    match killpg(pgid, signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(anyhow!("killpg {pgid} {signal:?}: {err}")),
    }
}

fn group_alive(pgid: Pid) -> Result<bool> {
    match killpg(pgid, None) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        // EPERM means a member exists that we may not signal.
        Err(Errno::EPERM) => Ok(true),
        Err(err) => Err(anyhow!("probe process group {pgid}: {err}")),
    }
}

/// Join a reader thread, giving up at `deadline`.
///
/// A pipe can outlive the group when a process escaped it (`setsid`); that
/// reader is abandoned and its output dropped.
fn join_output(
    handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>,
    deadline: Instant,
) -> Result<(Vec<u8>, usize)> {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!("output pipe still open after the command finished, abandoning reader");
            return Ok((Vec::new(), 0));
        }
        thread::sleep(Duration::from_millis(10));
    }
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
