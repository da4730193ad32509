//! Subprocess execution behind a trait so callers can be driven by a fake.

use std::{
    path::PathBuf,
    process::Stdio,
    time::{Duration, Instant},
};

use {
    async_trait::async_trait,
    tokio::{
        io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
        process::Command,
    },
    tracing::{debug, warn},
};

/// Marker appended to a stream cut at the output cap.
pub const TRUNCATION_MARKER: &str = "\n... [output truncated]";

/// A fully described external command.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    /// Bytes written to the child's stdin, which is then closed.
    pub stdin: Option<String>,
    pub current_dir: Option<PathBuf>,
    /// Per-stream cap. `None` keeps everything.
    pub max_output_bytes: Option<usize>,
    /// When `false`, stdout and stderr are discarded.
    pub capture: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
            stdin: None,
            current_dir: None,
            max_output_bytes: None,
            capture: true,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn max_output_bytes(mut self, cap: usize) -> Self {
        self.max_output_bytes = Some(cap);
        self
    }

    #[must_use]
    pub fn capture(mut self, capture: bool) -> Self {
        self.capture = capture;
        self
    }

    /// Program and arguments joined for logging.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// What a finished (or abandoned) command produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal or by the timeout.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.code == Some(0)
    }

    /// Exit code with `-1` standing in for "no code".
    pub fn exit_code(&self) -> i32 {
        self.code.unwrap_or(-1)
    }
}

/// Runs external commands.
///
/// Returns `Err` only when the process could not be started; non-zero exits
/// and timeouts are reported through [`CommandOutput`].
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput>;
}

/// [`CommandRunner`] on tokio child processes.
///
/// A child that outlives its timeout is killed when its handle is dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
        debug!(
            command = %spec.display(),
            timeout_secs = spec.timeout.as_secs(),
            "spawning command"
        );

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args).kill_on_drop(true);
        if let Some(ref dir) = spec.current_dir {
            cmd.current_dir(dir);
        }
        let output_mode = || {
            if spec.capture {
                Stdio::piped()
            } else {
                Stdio::null()
            }
        };
        cmd.stdout(output_mode());
        cmd.stderr(output_mode());
        cmd.stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let started = Instant::now();
        let mut child = cmd.spawn()?;

        if let Some(ref input) = spec.stdin
            && let Some(mut pipe) = child.stdin.take()
        {
            pipe.write_all(input.as_bytes()).await?;
            pipe.shutdown().await?;
        }

        let cap = spec.max_output_bytes;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let finished = async {
            tokio::try_join!(
                child.wait(),
                read_capped(stdout, cap),
                read_capped(stderr, cap)
            )
        };

        match tokio::time::timeout(spec.timeout, finished).await {
            Ok(Ok((status, stdout, stderr))) => {
                let result = CommandOutput {
                    code: status.code(),
                    stdout: truncate_output(&stdout, cap),
                    stderr: truncate_output(&stderr, cap),
                    timed_out: false,
                    duration: started.elapsed(),
                };
                debug!(
                    program = %spec.program,
                    exit_code = result.exit_code(),
                    stdout_len = result.stdout.len(),
                    stderr_len = result.stderr.len(),
                    "command finished"
                );
                Ok(result)
            },
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(command = %spec.display(), "command timed out");
                Ok(CommandOutput {
                    code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    timed_out: true,
                    duration: started.elapsed(),
                })
            },
        }
    }
}

/// Bytes kept past the cap, enough to finish a split UTF-8 sequence and to
/// tell a stream that hit the cap from one that ended exactly on it.
const CAP_OVERSHOOT: u64 = 4;

/// Read a pipe to EOF, keeping at most `cap` (plus a few) bytes and
/// discarding the rest so the child never blocks on a full pipe.
async fn read_capped(
    pipe: Option<impl AsyncRead + Unpin>,
    cap: Option<usize>,
) -> std::io::Result<Vec<u8>> {
    let mut kept = Vec::new();
    let Some(mut pipe) = pipe else {
        return Ok(kept);
    };
    match cap {
        None => {
            pipe.read_to_end(&mut kept).await?;
        },
        Some(cap) => {
            let limit = u64::try_from(cap)
                .unwrap_or(u64::MAX)
                .saturating_add(CAP_OVERSHOOT);
            let mut head = pipe.take(limit);
            head.read_to_end(&mut kept).await?;
            let mut rest = head.into_inner();
            tokio::io::copy(&mut rest, &mut tokio::io::sink()).await?;
        },
    }
    Ok(kept)
}

/// Decode `bytes` lossily and cut at `cap` bytes on a char boundary.
pub fn truncate_output(bytes: &[u8], cap: Option<usize>) -> String {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if let Some(cap) = cap
        && text.len() > cap
    {
        let mut cut = cap;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str(TRUNCATION_MARKER);
    }
    text
}
