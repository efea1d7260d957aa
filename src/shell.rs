//! Persistent shell session.
//!
//! A single shell process runs every command of a run, so state such as
//! exported variables and the current directory carries over from one block
//! to the next. Completion is detected by framing each command with a
//! boundary token unique to that invocation:
//!
//! ```text
//! <command>
//! printf '%s %d\n' __mdtest_<token>__ "$?"
//! printf '%s\n' __mdtest_<token>__ >&2
//! ```
//!
//! One reader task per stream turns output into [`Frame`]s and feeds a single
//! channel; [`ShellSession::exec`] consumes frames until both boundaries of its
//! own token arrive. A marker carrying any other token is ordinary output.

use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Matches a boundary line, with any unterminated command output before it.
static BOUNDARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.*?)__mdtest_([0-9a-f]{32})__(?: (-?\d+))?\s*$").expect("valid boundary regex")
});

/// Error type for shell operations.
#[derive(Debug, Error)]
pub enum ShellError {
    /// The shell process could not be spawned.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// `exec` was called before `start`.
    #[error("shell session is not running")]
    NotStarted,
    /// Writing to the shell's input failed.
    #[error("failed to write to shell: {0}")]
    Io(#[from] std::io::Error),
    /// The command wrote to standard error or exited non-zero.
    #[error("{}", describe_failure(*code))]
    CommandFailed { code: Option<i32>, output: String },
    /// No completion boundary arrived in time.
    #[error("command timed out after {}s", after.as_secs())]
    Timeout { after: Duration, output: String },
    /// The shell closed its output, usually because the command ran `exit`.
    #[error("shell exited before the command completed")]
    Exited { output: String },
}

fn describe_failure(code: Option<i32>) -> String {
    match code {
        Some(0) => "command wrote to standard error".to_string(),
        Some(code) => format!("command exited with status {code}"),
        None => "command wrote to standard error and did not complete".to_string(),
    }
}

impl ShellError {
    /// Output captured before the failure.
    pub fn output(&self) -> &str {
        match self {
            ShellError::CommandFailed { output, .. }
            | ShellError::Timeout { output, .. }
            | ShellError::Exited { output } => output,
            _ => "",
        }
    }

    /// Whether the shell's state is unknown after this error, so the session
    /// must be restarted before it runs anything else.
    pub fn requires_reset(&self) -> bool {
        matches!(
            self,
            ShellError::Timeout { .. }
                | ShellError::Exited { .. }
                | ShellError::Io(_)
                | ShellError::CommandFailed { code: None, .. }
        )
    }
}

/// Output of a command that completed successfully.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Line(Stream, String),
    /// A marker line. `before` is output that lacked a trailing newline and
    /// `raw` is the whole line, delivered as output if the token is foreign.
    Boundary {
        stream: Stream,
        token: String,
        code: Option<i32>,
        before: String,
        raw: String,
    },
    Closed(Stream),
}

fn parse_line(stream: Stream, line: &str) -> Frame {
    let Some(caps) = BOUNDARY.captures(line) else {
        return Frame::Line(stream, line.to_string());
    };

    Frame::Boundary {
        stream,
        token: caps[2].to_string(),
        code: caps.get(3).and_then(|m| m.as_str().parse().ok()),
        before: caps[1].to_string(),
        raw: line.to_string(),
    }
}

async fn read_frames<R>(reader: R, stream: Stream, tx: mpsc::UnboundedSender<Frame>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => {
                let _ = tx.send(Frame::Closed(stream));
                return;
            }
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                if tx.send(parse_line(stream, line)).is_err() {
                    return;
                }
            }
        }
    }
}

fn new_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn framed_script(command: &str, token: &str) -> String {
    format!(
        "{command}\nprintf '%s %d\\n' __mdtest_{token}__ \"$?\"\nprintf '%s\\n' __mdtest_{token}__ >&2\n"
    )
}

/// Accumulates the frames of one invocation.
struct Collector<'a> {
    token: &'a str,
    expect_error: bool,
    combined: Vec<String>,
    stdout: Vec<String>,
    stderr: Vec<String>,
    code: Option<i32>,
    stderr_done: bool,
    failed: bool,
    debug: bool,
}

impl<'a> Collector<'a> {
    fn new(token: &'a str, expect_error: bool, debug: bool) -> Self {
        Self {
            token,
            expect_error,
            combined: Vec::new(),
            stdout: Vec::new(),
            stderr: Vec::new(),
            code: None,
            stderr_done: false,
            failed: false,
            debug,
        }
    }

    /// Feed one frame. Returns true once both boundaries have arrived.
    fn accept(&mut self, frame: Frame) -> Result<bool, ShellError> {
        match frame {
            Frame::Line(stream, line) => self.push_line(stream, line),
            Frame::Boundary {
                stream,
                token,
                code,
                before,
                raw,
            } => {
                if token != self.token {
                    tracing::debug!("Treating foreign marker on {stream:?} as output");
                    self.push_line(stream, raw);
                } else {
                    if !before.is_empty() {
                        self.push_line(stream, before);
                    }
                    match stream {
                        Stream::Stdout => self.code = Some(code.unwrap_or(-1)),
                        Stream::Stderr => self.stderr_done = true,
                    }
                }
            }
            Frame::Closed(_) => {
                return Err(ShellError::Exited {
                    output: self.output(),
                });
            }
        }
        Ok(self.code.is_some() && self.stderr_done)
    }

    fn push_line(&mut self, stream: Stream, line: String) {
        if self.debug {
            tracing::debug!("{stream:?}: {line}");
        }
        if stream == Stream::Stderr {
            if self.expect_error {
                tracing::debug!("Ignoring expected error output: {line}");
            } else {
                self.failed = true;
            }
            self.stderr.push(line.clone());
        } else {
            self.stdout.push(line.clone());
        }
        self.combined.push(line);
    }

    fn output(&self) -> String {
        self.combined.join("\n")
    }

    fn finish(self) -> Result<CommandOutput, ShellError> {
        let code = self.code.unwrap_or(-1);
        if !self.expect_error && (self.failed || code != 0) {
            return Err(ShellError::CommandFailed {
                code: Some(code),
                output: self.output(),
            });
        }
        Ok(CommandOutput {
            exit_code: code,
            stdout: self.stdout.join("\n"),
            stderr: self.stderr.join("\n"),
        })
    }
}

struct Process {
    child: Child,
    stdin: ChildStdin,
    frames: mpsc::UnboundedReceiver<Frame>,
    readers: Vec<JoinHandle<()>>,
}

impl Process {
    /// Kill the shell's whole process group.
    fn kill_group(&mut self) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;

            if let Some(pid) = self.child.id()
                && let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL)
            {
                tracing::debug!("killpg({pid}) failed: {e}");
            }
        }
        for reader in &self.readers {
            reader.abort();
        }
    }
}

/// One long-lived shell process.
///
/// At most one command may be in flight at a time; `exec` takes `&mut self`
/// to enforce it.
pub struct ShellSession {
    program: String,
    work_dir: PathBuf,
    debug: bool,
    process: Option<Process>,
}

impl ShellSession {
    pub fn new(program: impl Into<String>, work_dir: impl Into<PathBuf>, debug: bool) -> Self {
        Self {
            program: program.into(),
            work_dir: work_dir.into(),
            debug,
            process: None,
        }
    }

    /// Spawn the shell. A running shell is left untouched.
    pub fn start(&mut self) -> Result<(), ShellError> {
        if self.process.is_some() {
            return Ok(());
        }

        let mut cmd = Command::new(&self.program);
        cmd.current_dir(&self.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|source| ShellError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let (stdin, stdout, stderr) = match (
            child.stdin.take(),
            child.stdout.take(),
            child.stderr.take(),
        ) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.start_kill();
                return Err(ShellError::Spawn {
                    program: self.program.clone(),
                    source: std::io::Error::other("shell pipes unavailable"),
                });
            }
        };

        let (tx, frames) = mpsc::unbounded_channel();
        let readers = vec![
            tokio::spawn(read_frames(stdout, Stream::Stdout, tx.clone())),
            tokio::spawn(read_frames(stderr, Stream::Stderr, tx)),
        ];

        tracing::debug!(
            "Started {} (pid {:?}) in {}",
            self.program,
            child.id(),
            self.work_dir.display()
        );

        self.process = Some(Process {
            child,
            stdin,
            frames,
            readers,
        });
        Ok(())
    }

    /// Terminate the shell and every process in its group.
    pub async fn end(&mut self) {
        let Some(mut process) = self.process.take() else {
            return;
        };
        process.kill_group();
        if let Err(e) = process.child.kill().await {
            tracing::debug!("Shell already gone: {e}");
        }
        tracing::debug!("Stopped {}", self.program);
    }

    /// Replace the shell with a fresh one.
    pub async fn reset(&mut self) -> Result<(), ShellError> {
        tracing::debug!("Resetting shell session");
        self.end().await;
        self.start()
    }

    /// Run a command and wait for it to complete.
    ///
    /// Fails on any standard error output or a non-zero exit status unless
    /// `expect_error` is set. The returned output never contains boundary lines.
    pub async fn exec(
        &mut self,
        command: &str,
        timeout: Duration,
        expect_error: bool,
    ) -> Result<CommandOutput, ShellError> {
        let debug = self.debug;
        let process = self.process.as_mut().ok_or(ShellError::NotStarted)?;

        // Anything still queued belongs to an earlier command.
        while let Ok(frame) = process.frames.try_recv() {
            if let Frame::Closed(_) = frame {
                return Err(ShellError::Exited {
                    output: String::new(),
                });
            }
            tracing::debug!("Discarding leftover frame {frame:?}");
        }

        let token = new_token();
        process
            .stdin
            .write_all(framed_script(command, &token).as_bytes())
            .await?;
        process.stdin.flush().await?;

        let deadline = Instant::now() + timeout;
        let mut collector = Collector::new(&token, expect_error, debug);
        loop {
            match tokio::time::timeout_at(deadline, process.frames.recv()).await {
                Err(_) if collector.failed => {
                    return Err(ShellError::CommandFailed {
                        code: None,
                        output: collector.output(),
                    });
                }
                Err(_) => {
                    return Err(ShellError::Timeout {
                        after: timeout,
                        output: collector.output(),
                    });
                }
                Ok(None) => {
                    return Err(ShellError::Exited {
                        output: collector.output(),
                    });
                }
                Ok(Some(frame)) => {
                    if collector.accept(frame)? {
                        break;
                    }
                }
            }
        }
        collector.finish()
    }
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        if let Some(mut process) = self.process.take() {
            tracing::debug!("Shell session dropped while running, killing it");
            process.kill_group();
            let _ = process.child.start_kill();
        }
    }
}
