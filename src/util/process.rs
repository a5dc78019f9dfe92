use std::ffi::OsString;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::cancel::CancellationToken;

/// How long a stopped process group gets between SIGTERM and SIGKILL.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A captured, non-interactive child process invocation.
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
    pub current_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
        }
    }

    /// `sh -c <script>`.
    pub fn shell(script: &str) -> Self {
        let mut spec = Self::new(shell_program());
        spec.args = vec![OsString::from("-c"), OsString::from(script)];
        spec
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn display(&self) -> String {
        let mut rendered = self.program.to_string_lossy().into_owned();
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(&arg.to_string_lossy());
        }
        rendered
    }
}

pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    /// Stdout followed by stderr, lossily decoded.
    pub fn combined(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&self.stderr);
        if !text.is_empty() && !stderr.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&stderr);
        text
    }
}

/// Run `spec` to completion with both streams captured. Returns `None` when
/// `cancel` fired first; the process group is stopped before returning.
pub fn run(spec: CommandSpec, cancel: &CancellationToken) -> io::Result<Option<CommandOutput>> {
    let mut command = Command::new(&spec.program);
    command.args(&spec.args);
    if let Some(dir) = &spec.current_dir {
        command.current_dir(dir);
    }
    for (key, value) in &spec.env {
        command.env(key, value);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    isolate(&mut command);

    let mut child = command.spawn()?;
    let stdout = child.stdout.take().map(capture);
    let stderr = child.stderr.take().map(capture);
    let status = loop {
        if cancel.is_cancelled() {
            terminate(&mut child, TERMINATE_GRACE)?;
            return Ok(None);
        }
        if let Some(status) = child.try_wait()? {
            break status;
        }
        thread::sleep(POLL_INTERVAL);
    };
    Ok(Some(CommandOutput {
        status,
        stdout: collected(stdout),
        stderr: collected(stderr),
    }))
}

fn capture<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        buf
    })
}

fn collected(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// Start the child as the leader of a new process group. Terminal signals
/// then reach only stackhut, and [`terminate`] can stop everything the child
/// spawned.
pub fn isolate(command: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    #[cfg(not(unix))]
    let _ = command;
}

/// Stop a child started with [`isolate`] and its whole process group:
/// SIGTERM first, SIGKILL for whatever is left after `grace`. The leader is
/// always reaped.
#[cfg(unix)]
pub fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    let Ok(group) = libc::pid_t::try_from(child.id()) else {
        let _ = child.kill();
        return child.wait();
    };
    signal_group(group, libc::SIGTERM);
    let deadline = Instant::now() + grace;
    let mut status = None;
    loop {
        if status.is_none() {
            status = child.try_wait()?;
        }
        if status.is_some() && !signal_group(group, 0) {
            break;
        }
        if Instant::now() >= deadline {
            signal_group(group, libc::SIGKILL);
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }
    match status {
        Some(status) => Ok(status),
        None => child.wait(),
    }
}

#[cfg(not(unix))]
pub fn terminate(child: &mut Child, _grace: Duration) -> io::Result<ExitStatus> {
    let _ = child.kill();
    child.wait()
}

/// `true` if some member of `group` accepted the signal.
#[cfg(unix)]
fn signal_group(group: libc::pid_t, signal: libc::c_int) -> bool {
    // SAFETY: killpg takes no pointers; a group that is already gone yields ESRCH.
    unsafe { libc::killpg(group, signal) == 0 }
}

/// POSIX shell used for `exec`/`install` steps and local entrypoints.
pub fn shell_program() -> PathBuf {
    which::which("sh").unwrap_or_else(|_| PathBuf::from("/bin/sh"))
}

/// `PATH` with the artifact root and its `bin/` directory in front.
pub fn path_with_root(root: &std::path::Path) -> OsString {
    let mut dirs = vec![root.join("bin"), root.to_path_buf()];
    if let Some(existing) = std::env::var_os("PATH") {
        dirs.extend(std::env::split_paths(&existing));
    }
    std::env::join_paths(dirs).unwrap_or_else(|_| root.as_os_str().to_os_string())
}

#[cfg(all(test, unix))]
mod tests {
    use std::io::{BufRead, BufReader};

    use super::*;

    #[test]
    fn captures_both_streams() {
        let output = run(
            CommandSpec::shell("echo out; echo err >&2; exit 3"),
            &CancellationToken::new(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(output.combined(), "out\nerr\n");
    }

    #[test]
    fn applies_env_and_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec::shell("echo \"$GREETING\" > greeting.txt")
            .env("GREETING", "hello")
            .current_dir(dir.path());
        let output = run(spec, &CancellationToken::new()).unwrap().unwrap();
        assert!(output.status.success());
        let written = std::fs::read_to_string(dir.path().join("greeting.txt")).unwrap();
        assert_eq!(written, "hello\n");
    }

    #[test]
    fn cancelled_command_returns_nothing() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trigger.cancel();
        });
        let started = Instant::now();
        let output = run(CommandSpec::shell("trap '' TERM; sleep 30"), &cancel).unwrap();
        canceller.join().unwrap();
        assert!(output.is_none());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn terminate_reaches_the_whole_group() {
        let mut command = Command::new(shell_program());
        command
            .arg("-c")
            .arg("(trap '' TERM; sleep 30) & echo $!; wait")
            .stdout(Stdio::piped());
        isolate(&mut command);
        let mut child = command.spawn().unwrap();
        let mut line = String::new();
        BufReader::new(child.stdout.take().unwrap())
            .read_line(&mut line)
            .unwrap();
        let background: u32 = line.trim().parse().unwrap();

        terminate(&mut child, Duration::from_millis(200)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while running(background) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!running(background), "pid {background} survived");
    }

    /// Present in `/proc` and not a zombie.
    #[cfg(target_os = "linux")]
    fn running(pid: u32) -> bool {
        std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .map(|stat| {
                stat.rsplit_once(") ")
                    .is_some_and(|(_, rest)| !rest.starts_with('Z'))
            })
            .unwrap_or(false)
    }
}
