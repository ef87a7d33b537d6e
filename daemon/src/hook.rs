/// Pre- and post-migration hook commands.
///
/// A hook is an external command supplied by the application.  It runs to
/// completion with stdin closed; everything it writes to stdout or stderr is
/// forwarded to the service log one line at a time.
use std::fmt;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::error::NotifyError;
use crate::redact::ServiceLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Pre,
    Post,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookKind::Pre => f.write_str("pre-migration"),
            HookKind::Post => f.write_str("post-migration"),
        }
    }
}

/// Argument vector parsed once, at startup, from a shell-style command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookCommand {
    line: String,
    argv: Vec<String>,
}

impl HookCommand {
    /// Splits `line` with POSIX shell quoting rules.  Fails on unbalanced
    /// quotes or an empty command.
    pub fn parse(line: &str) -> Result<Self, NotifyError> {
        let argv = shlex::split(line)
            .filter(|argv| !argv.is_empty())
            .ok_or_else(|| NotifyError::InvalidCommand(line.to_string()))?;
        Ok(Self {
            line: line.to_string(),
            argv,
        })
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    pub fn args(&self) -> &[String] {
        &self.argv[1..]
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// The command line as configured.
    pub fn line(&self) -> &str {
        &self.line
    }
}

/// How a hook process ended.  A non-zero exit is reported, never raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookOutcome {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
}

impl HookOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs hook commands.  The dispatcher only sees this trait so that tests can
/// observe hook invocations without spawning processes.
#[async_trait]
pub trait HookRunner: Send + Sync {
    async fn run(&self, kind: HookKind, command: &HookCommand) -> Result<HookOutcome, NotifyError>;
}

/// The two hooks of one service instance plus the runner that executes them.
pub struct Hooks {
    pub pre: HookCommand,
    pub post: HookCommand,
    pub runner: Box<dyn HookRunner>,
}

impl Hooks {
    pub async fn run(&self, kind: HookKind) -> Result<HookOutcome, NotifyError> {
        let command = match kind {
            HookKind::Pre => &self.pre,
            HookKind::Post => &self.post,
        };
        self.runner.run(kind, command).await
    }
}

/// Spawns hooks as child processes and blocks until they exit.
pub struct ProcessHookRunner {
    log: ServiceLog,
}

impl ProcessHookRunner {
    pub fn new(log: ServiceLog) -> Self {
        Self { log }
    }
}

#[async_trait]
impl HookRunner for ProcessHookRunner {
    async fn run(&self, kind: HookKind, command: &HookCommand) -> Result<HookOutcome, NotifyError> {
        self.log
            .debug(format!("{kind}: running command {:?}", command.argv()));

        let mut child = Command::new(command.program())
            .args(command.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| NotifyError::Hook { kind, source })?;

        let stdout = child.stdout.take().map(BufReader::new);
        let stderr = child.stderr.take().map(BufReader::new);
        forward_lines(stdout, stderr, |line| {
            self.log.debug(format!("{kind}: '{line}'"));
        })
        .await;

        let status = child
            .wait()
            .await
            .map_err(|source| NotifyError::Hook { kind, source })?;
        let outcome = HookOutcome {
            exit_code: status.code(),
        };

        if outcome.success() {
            self.log.debug(format!("{kind}: command completed"));
        } else {
            self.log
                .warn(format!("{kind}: command completed with {status}"));
        }
        Ok(outcome)
    }
}

/// Interleaves the lines of both streams, in arrival order, until both end.
async fn forward_lines<A, B>(mut out: Option<A>, mut err: Option<B>, mut emit: impl FnMut(&str))
where
    A: AsyncBufRead + Unpin,
    B: AsyncBufRead + Unpin,
{
    let mut out_buf = Vec::new();
    let mut err_buf = Vec::new();

    while out.is_some() || err.is_some() {
        tokio::select! {
            read = next_line(out.as_mut(), &mut out_buf), if out.is_some() => {
                match read {
                    Some(line) => emit(&line),
                    None => out = None,
                }
            }
            read = next_line(err.as_mut(), &mut err_buf), if err.is_some() => {
                match read {
                    Some(line) => emit(&line),
                    None => err = None,
                }
            }
        }
    }
}

/// Reads one line, lossily decoded, without its line terminator.  `None` at
/// end of stream or on a read error.
///
/// `buf` outlives the call: a read dropped by `select!` leaves its partial
/// line there, and the next call completes it.  It is only cleared once a
/// line has been taken out.
async fn next_line<R>(reader: Option<&mut R>, buf: &mut Vec<u8>) -> Option<String>
where
    R: AsyncBufRead + Unpin,
{
    let reader = reader?;
    match reader.read_until(b'\n', buf).await {
        Err(_) => None,
        Ok(0) if buf.is_empty() => None,
        Ok(_) => {
            let mut line = buf.as_slice();
            if let Some(rest) = line.strip_suffix(b"\n") {
                line = rest.strip_suffix(b"\r").unwrap_or(rest);
            }
            let line = String::from_utf8_lossy(line).into_owned();
            buf.clear();
            Some(line)
        }
    }
}
