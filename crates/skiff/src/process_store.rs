use chrono::{DateTime, Utc};
use futures::future::join_all;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::errors::ProcessError;

pub const DEFAULT_TIMEOUT_SECS: u64 = 120;
pub const MAX_TIMEOUT_SECS: u64 = 600;

/// How long a terminated process group gets before it is force killed
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Completed,
    Failed,
    Killed,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            ProcessStatus::Running => "running",
            ProcessStatus::Completed => "completed",
            ProcessStatus::Failed => "failed",
            ProcessStatus::Killed => "killed",
        };
        f.write_str(status)
    }
}

/// Snapshot of a shell command started in the background
#[derive(Debug, Clone, Serialize)]
pub struct BackgroundProcess {
    pub id: String,
    pub command: String,
    pub status: ProcessStatus,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
}

/// Output of a command run to completion
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

#[derive(Clone, Copy, Debug)]
enum Signal {
    Terminate,
    Kill,
}

struct Entry {
    process: BackgroundProcess,
    /// The shell leads its own process group, so its pid names the whole job
    pgid: Option<u32>,
    /// Set once the shell is reaped and every holder of its output pipes is gone
    exited: watch::Receiver<bool>,
}

/// Registry of background shell commands.
///
/// Clones share the same underlying table. Each started command gets one capture task per
/// output stream plus a waiter task that reaps the child and records its exit status.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    processes: Arc<Mutex<HashMap<String, Entry>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `command` under `bash -c` in `cwd` and return its id without waiting
    pub fn start(&self, command: &str, cwd: &Path) -> Result<String, ProcessError> {
        let mut child = shell_command(command, cwd)
            .spawn()
            .map_err(|e| ProcessError::Spawn(e.to_string()))?;

        let id = new_process_id();
        let (exit_tx, exit_rx) = watch::channel(false);

        self.processes.lock().unwrap().insert(
            id.clone(),
            Entry {
                process: BackgroundProcess {
                    id: id.clone(),
                    command: command.to_string(),
                    status: ProcessStatus::Running,
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: None,
                    started_at: Utc::now(),
                },
                pgid: child.id(),
                exited: exit_rx,
            },
        );

        let readers: Vec<JoinHandle<()>> = [
            child
                .stdout
                .take()
                .map(|out| self.spawn_capture(id.clone(), out, Stream::Stdout)),
            child
                .stderr
                .take()
                .map(|err| self.spawn_capture(id.clone(), err, Stream::Stderr)),
        ]
        .into_iter()
        .flatten()
        .collect();

        let registry = self.clone();
        let process_id = id.clone();
        tokio::spawn(async move {
            let exit_code = match child.wait().await {
                Ok(status) => exit_code_of(status),
                Err(e) => {
                    tracing::warn!(id = %process_id, error = %e, "failed to wait on background process");
                    -1
                }
            };
            join_all(readers).await;
            registry.finish(&process_id, exit_code);
            let _ = exit_tx.send(true);
        });

        tracing::info!(%id, command, "started background process");
        Ok(id)
    }

    fn spawn_capture<R>(&self, id: String, reader: R, stream: Stream) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let processes = self.processes.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&line);
                        let mut processes = processes.lock().unwrap();
                        let Some(entry) = processes.get_mut(&id) else {
                            break;
                        };
                        match stream {
                            Stream::Stdout => entry.process.stdout.push_str(&text),
                            Stream::Stderr => entry.process.stderr.push_str(&text),
                        }
                    }
                    Err(e) => {
                        tracing::debug!(%id, error = %e, "output capture stopped");
                        break;
                    }
                }
            }
        })
    }

    fn finish(&self, id: &str, exit_code: i32) {
        let mut processes = self.processes.lock().unwrap();
        if let Some(entry) = processes.get_mut(id) {
            entry.process.exit_code = Some(exit_code);
            if entry.process.status == ProcessStatus::Running {
                entry.process.status = if exit_code == 0 {
                    ProcessStatus::Completed
                } else {
                    ProcessStatus::Failed
                };
            }
            tracing::info!(%id, exit_code, status = %entry.process.status, "background process exited");
        }
    }

    pub fn get(&self, id: &str) -> Option<BackgroundProcess> {
        self.processes
            .lock()
            .unwrap()
            .get(id)
            .map(|entry| entry.process.clone())
    }

    /// Everything captured so far, optionally restricted to lines matching `filter`
    pub fn output(
        &self,
        id: &str,
        filter: Option<&str>,
    ) -> Result<BackgroundProcess, ProcessError> {
        let filter = filter
            .filter(|pattern| !pattern.is_empty())
            .map(Regex::new)
            .transpose()
            .map_err(|e| ProcessError::InvalidFilter(e.to_string()))?;

        let mut process = self
            .get(id)
            .ok_or_else(|| ProcessError::NotFound(id.to_string()))?;

        if let Some(filter) = filter {
            process.stdout = matching_lines(&process.stdout, &filter);
            process.stderr = matching_lines(&process.stderr, &filter);
        }
        Ok(process)
    }

    /// Terminate the process group, wait for it to exit and drop it from the registry.
    ///
    /// The whole group is signalled, so jobs the shell put in the background die with it
    /// even after the shell itself has exited.
    pub async fn kill(&self, id: &str) -> Result<BackgroundProcess, ProcessError> {
        let (pgid, mut exited) = {
            let processes = self.processes.lock().unwrap();
            let entry = processes
                .get(id)
                .ok_or_else(|| ProcessError::NotFound(id.to_string()))?;
            (entry.pgid, entry.exited.clone())
        };

        let already_exited = *exited.borrow();
        if let (Some(pgid), false) = (pgid, already_exited) {
            signal_group(pgid, Signal::Terminate);
            let graceful = tokio::time::timeout(TERMINATE_GRACE, exited.wait_for(|done| *done))
                .await
                .is_ok();
            if !graceful {
                tracing::warn!(%id, pgid, "process group ignored SIGTERM, sending SIGKILL");
                signal_group(pgid, Signal::Kill);
                let _ = tokio::time::timeout(TERMINATE_GRACE, exited.wait_for(|done| *done)).await;
            }
        }

        let mut entry = self
            .processes
            .lock()
            .unwrap()
            .remove(id)
            .ok_or_else(|| ProcessError::NotFound(id.to_string()))?;
        entry.process.status = ProcessStatus::Killed;

        tracing::info!(%id, "killed background process");
        Ok(entry.process)
    }

    /// Kill every tracked process, returning the ids that were terminated
    pub async fn kill_all(&self) -> Vec<String> {
        let ids = self.ids();
        let results = join_all(ids.iter().map(|id| self.kill(id))).await;
        ids.into_iter()
            .zip(results)
            .filter_map(|(id, result)| result.ok().map(|_| id))
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.processes.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Run `command` to completion, killing its process group after `timeout_secs`.
///
/// The command only completes once the shell has exited and its output pipes are closed,
/// so anything it backgrounds while still holding stdout counts against the timeout. If
/// the returned future is dropped early, the process group is killed.
pub async fn run_foreground(
    command: &str,
    cwd: &Path,
    timeout_secs: u64,
) -> Result<CommandOutput, ProcessError> {
    let mut child = shell_command(command, cwd)
        .spawn()
        .map_err(|e| ProcessError::Spawn(e.to_string()))?;
    let mut group = GroupGuard::new(child.id());

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let capture = async {
        let (status, stdout, stderr) =
            tokio::join!(child.wait(), read_all(stdout), read_all(stderr));
        status.map(|status| CommandOutput {
            stdout,
            stderr,
            exit_code: exit_code_of(status),
        })
    };

    let result = tokio::time::timeout(Duration::from_secs(timeout_secs), capture).await;
    match result {
        Ok(output) => {
            group.release();
            output.map_err(|e| ProcessError::Io(e.to_string()))
        }
        Err(_) => {
            tracing::warn!(command, timeout_secs, "command timed out, killing process group");
            group.kill();
            let _ = child.kill().await;
            Err(ProcessError::Timeout(timeout_secs))
        }
    }
}

/// Kills a foreground process group when dropped, unless released first
struct GroupGuard {
    pgid: Option<u32>,
}

impl GroupGuard {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    fn release(&mut self) {
        self.pgid = None;
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            signal_group(pgid, Signal::Kill);
        }
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Timeout in seconds for a foreground command: unset or below 1 falls back to the
/// default, anything above the maximum is capped
pub fn clamp_timeout(requested: Option<i64>) -> u64 {
    match requested {
        Some(secs) if secs >= 1 => (secs as u64).min(MAX_TIMEOUT_SECS),
        _ => DEFAULT_TIMEOUT_SECS,
    }
}

fn shell_command(command: &str, cwd: &Path) -> Command {
    let mut cmd = Command::new("bash");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

fn new_process_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        let _ = reader.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn matching_lines(text: &str, filter: &Regex) -> String {
    text.lines()
        .filter(|line| filter.is_match(line))
        .map(|line| format!("{}\n", line))
        .collect()
}

/// Exit code, or the negated signal number when the process was killed by a signal
fn exit_code_of(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    status.code().unwrap_or(-1)
}

/// Send `signal` to every process in the group led by `pgid`.
/// Returns false when the group is already gone.
#[cfg(unix)]
fn signal_group(pgid: u32, signal: Signal) -> bool {
    let signo = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: killpg takes plain integers and touches no memory
    if unsafe { libc::killpg(pgid as libc::pid_t, signo) } == 0 {
        tracing::debug!(pgid, ?signal, "signalled process group");
        return true;
    }

    let err = std::io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::ESRCH) {
        tracing::warn!(pgid, ?signal, error = %err, "failed to signal process group");
    }
    false
}

#[cfg(not(unix))]
fn signal_group(_pgid: u32, _signal: Signal) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Whether `pid` is still a live (non-zombie) process
    #[cfg(target_os = "linux")]
    fn process_alive(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.trim_start().chars().next())
                .map(|state| state != 'Z' && state != 'X')
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    async fn wait_for_death(pid: u32) -> bool {
        for _ in 0..100 {
            if !process_alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[cfg(target_os = "linux")]
    async fn read_pid_file(path: &Path) -> u32 {
        for _ in 0..100 {
            if let Ok(text) = std::fs::read_to_string(path) {
                if let Ok(pid) = text.trim().parse() {
                    return pid;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no pid written to {}", path.display());
    }

    async fn wait_until_exited(registry: &ProcessRegistry, id: &str) -> BackgroundProcess {
        for _ in 0..200 {
            let process = registry.get(id).expect("process should stay registered");
            if process.status != ProcessStatus::Running {
                return process;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("process {} did not exit in time", id);
    }

    #[tokio::test]
    async fn test_background_output_and_natural_exit() {
        let dir = TempDir::new().unwrap();
        let registry = ProcessRegistry::new();

        let id = registry
            .start("echo hello; echo oops >&2; sleep 0.2; echo world", dir.path())
            .unwrap();
        assert_eq!(id.len(), 8);
        assert_eq!(registry.get(&id).unwrap().status, ProcessStatus::Running);

        let process = wait_until_exited(&registry, &id).await;
        assert_eq!(process.status, ProcessStatus::Completed);
        assert_eq!(process.exit_code, Some(0));
        assert_eq!(process.stdout, "hello\nworld\n");
        assert_eq!(process.stderr, "oops\n");

        // Exited processes remain addressable
        assert!(registry.output(&id, None).is_ok());
        assert_eq!(registry.ids(), vec![id]);
    }

    #[tokio::test]
    async fn test_background_failure_records_exit_code() {
        let dir = TempDir::new().unwrap();
        let registry = ProcessRegistry::new();

        let id = registry.start("exit 3", dir.path()).unwrap();
        let process = wait_until_exited(&registry, &id).await;

        assert_eq!(process.status, ProcessStatus::Failed);
        assert_eq!(process.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_output_grows_monotonically() {
        let dir = TempDir::new().unwrap();
        let registry = ProcessRegistry::new();

        let id = registry
            .start("for i in 1 2 3 4 5; do echo $i; sleep 0.1; done", dir.path())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let first = registry.output(&id, None).unwrap().stdout;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let second = registry.output(&id, None).unwrap().stdout;

        assert!(second.starts_with(&first));
        assert!(second.len() >= first.len());

        let done = wait_until_exited(&registry, &id).await;
        assert_eq!(done.stdout, "1\n2\n3\n4\n5\n");
    }

    #[tokio::test]
    async fn test_output_filter() {
        let dir = TempDir::new().unwrap();
        let registry = ProcessRegistry::new();

        let id = registry
            .start("for i in 1 2 3 4; do echo Line $i; done", dir.path())
            .unwrap();
        wait_until_exited(&registry, &id).await;

        let filtered = registry.output(&id, Some("Line [24]")).unwrap();
        assert_eq!(filtered.stdout, "Line 2\nLine 4\n");

        let unfiltered = registry.output(&id, Some("")).unwrap();
        assert_eq!(unfiltered.stdout, "Line 1\nLine 2\nLine 3\nLine 4\n");

        assert!(matches!(
            registry.output(&id, Some("Line [")),
            Err(ProcessError::InvalidFilter(_))
        ));
    }

    #[tokio::test]
    async fn test_kill_removes_process() {
        let dir = TempDir::new().unwrap();
        let registry = ProcessRegistry::new();

        let id = registry.start("echo started; sleep 30", dir.path()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let killed = registry.kill(&id).await.unwrap();
        assert_eq!(killed.status, ProcessStatus::Killed);
        assert!(registry.get(&id).is_none());
        assert!(registry.ids().is_empty());

        assert_eq!(
            registry.kill(&id).await.unwrap_err(),
            ProcessError::NotFound(id)
        );
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_kill_stops_backgrounded_children() {
        let dir = TempDir::new().unwrap();
        let registry = ProcessRegistry::new();

        // The shell exits right away while `sleep` keeps the output pipes open
        let id = registry.start("sleep 30 & echo $!", dir.path()).unwrap();
        let mut pid = None;
        for _ in 0..100 {
            if let Ok(parsed) = registry.get(&id).unwrap().stdout.trim().parse::<u32>() {
                pid = Some(parsed);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let pid = pid.expect("background pid should be reported");
        assert!(process_alive(pid));

        let started = std::time::Instant::now();
        let killed = registry.kill(&id).await.unwrap();

        assert_eq!(killed.status, ProcessStatus::Killed);
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
        assert!(wait_for_death(pid).await, "sleep {} survived kill", pid);
        assert!(registry.get(&id).is_none());
    }

    #[tokio::test]
    async fn test_kill_after_natural_exit() {
        let dir = TempDir::new().unwrap();
        let registry = ProcessRegistry::new();

        let id = registry.start("echo done", dir.path()).unwrap();
        wait_until_exited(&registry, &id).await;

        let killed = registry.kill(&id).await.unwrap();
        assert_eq!(killed.status, ProcessStatus::Killed);
        assert_eq!(killed.stdout, "done\n");
        assert!(registry.get(&id).is_none());
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let registry = ProcessRegistry::new();
        let err = registry.output("deadbeef", None).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_kill_all() {
        let dir = TempDir::new().unwrap();
        let registry = ProcessRegistry::new();

        let first = registry.start("sleep 30", dir.path()).unwrap();
        let second = registry.start("sleep 30", dir.path()).unwrap();

        let mut killed = registry.kill_all().await;
        killed.sort();
        let mut expected = vec![first, second];
        expected.sort();

        assert_eq!(killed, expected);
        assert!(registry.ids().is_empty());
    }

    #[tokio::test]
    async fn test_registries_are_isolated() {
        let dir = TempDir::new().unwrap();
        let a = ProcessRegistry::new();
        let b = ProcessRegistry::new();

        let id = a.start("echo a", dir.path()).unwrap();
        assert!(a.get(&id).is_some());
        assert!(b.get(&id).is_none());

        let shared = a.clone();
        assert!(shared.get(&id).is_some());
    }

    #[tokio::test]
    async fn test_run_foreground() {
        let dir = TempDir::new().unwrap();

        let output = run_foreground("echo out; echo err >&2", dir.path(), 10)
            .await
            .unwrap();
        assert_eq!(
            output,
            CommandOutput {
                stdout: "out\n".into(),
                stderr: "err\n".into(),
                exit_code: 0
            }
        );

        let output = run_foreground("exit 2", dir.path(), 10).await.unwrap();
        assert_eq!(output.exit_code, 2);

        let output = run_foreground("pwd", dir.path(), 10).await.unwrap();
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(
            Path::new(output.stdout.trim()).canonicalize().unwrap(),
            expected
        );
    }

    #[tokio::test]
    async fn test_run_foreground_timeout() {
        let dir = TempDir::new().unwrap();
        let started = std::time::Instant::now();

        let err = run_foreground("sleep 10", dir.path(), 1).await.unwrap_err();

        assert_eq!(err, ProcessError::Timeout(1));
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_run_foreground_timeout_covers_backgrounded_children() {
        let dir = TempDir::new().unwrap();
        let started = std::time::Instant::now();

        let result = run_foreground("sleep 6 & echo $! > bg.pid; echo hi", dir.path(), 1).await;

        assert_eq!(result, Err(ProcessError::Timeout(1)));
        assert!(started.elapsed() < Duration::from_secs(4), "took {:?}", started.elapsed());

        #[cfg(target_os = "linux")]
        {
            let pid = read_pid_file(&dir.path().join("bg.pid")).await;
            assert!(wait_for_death(pid).await, "sleep {} outlived the timeout", pid);
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_dropped_foreground_command_kills_its_group() {
        let dir = TempDir::new().unwrap();

        let run = run_foreground("sleep 30 & echo $! > bg.pid; wait", dir.path(), 60);
        assert!(tokio::time::timeout(Duration::from_millis(500), run)
            .await
            .is_err());

        let pid = read_pid_file(&dir.path().join("bg.pid")).await;
        assert!(wait_for_death(pid).await, "sleep {} outlived its command", pid);
    }

    #[test]
    fn test_clamp_timeout() {
        assert_eq!(clamp_timeout(None), 120);
        assert_eq!(clamp_timeout(Some(0)), 120);
        assert_eq!(clamp_timeout(Some(-5)), 120);
        assert_eq!(clamp_timeout(Some(1)), 1);
        assert_eq!(clamp_timeout(Some(30)), 30);
        assert_eq!(clamp_timeout(Some(600)), 600);
        assert_eq!(clamp_timeout(Some(1000)), 600);
    }
}
