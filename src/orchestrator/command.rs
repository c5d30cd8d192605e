use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use log::debug;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

const TAIL_LINES: usize = 20;

/// One external command invocation: program, arguments, working directory,
/// an explicit environment overlay and a hard timeout. The overlay is applied
/// to this child only; the supervisor never mutates the process environment.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub timeout: Duration,
    /// If set, emit an advisory "still working" line to the caller when the
    /// child has been silent for this long. Advisory only; synthetic lines
    /// are not part of the captured output.
    pub silence_notice: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: &str, timeout: Duration) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            timeout,
            silence_notice: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I: IntoIterator<Item = S>, S: Into<String>>(mut self, args: I) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn envs(mut self, overlay: &HashMap<String, String>) -> Self {
        self.env
            .extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} timed out after {after:?}")]
    Timeout { program: String, after: Duration },
    #[error("{program} exited with code {exit_code}; last output:\n{tail}")]
    Failed {
        program: String,
        exit_code: i32,
        tail: String,
    },
}

/// Captured result of a completed (possibly non-zero) command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub lines: Vec<String>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Last few lines, for error surfacing.
    pub fn tail(&self) -> String {
        let skip = self.lines.len().saturating_sub(TAIL_LINES);
        self.lines[skip..].join("\n")
    }

    pub fn require_success(self, program: &str) -> Result<CommandOutput, CommandError> {
        if self.success() {
            Ok(self)
        } else {
            Err(CommandError::Failed {
                program: program.to_string(),
                exit_code: self.exit_code,
                tail: self.tail(),
            })
        }
    }
}

fn spawn_line_reader<R: AsyncRead + Unpin + Send + 'static>(
    stream: R,
    tx: mpsc::Sender<String>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Run a command, merging stdout and stderr into one line stream delivered to
/// `on_line` as it is produced, while accumulating it for the final result.
///
/// Lines are complete (no partial delivery) and arrive in per-stream emission
/// order. The child is killed if `spec.timeout` elapses. A non-zero exit is
/// not an error here; callers decide via `require_success`.
pub async fn run<F>(spec: &CommandSpec, mut on_line: F) -> Result<CommandOutput, CommandError>
where
    F: FnMut(&str) + Send,
{
    debug!("Running command: {} {:?}", spec.program, spec.args);

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.cwd {
        cmd.current_dir(dir);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn().map_err(|source| CommandError::Spawn {
        program: spec.program.clone(),
        source,
    })?;

    let (tx, mut rx) = mpsc::channel::<String>(256);
    if let Some(stdout) = child.stdout.take() {
        spawn_line_reader(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_line_reader(stderr, tx.clone());
    }
    drop(tx);

    let started = tokio::time::Instant::now();
    let deadline = started + spec.timeout;
    let mut last_output = started;
    let mut lines = Vec::new();

    loop {
        let silence_deadline = spec.silence_notice.map(|quiet| last_output + quiet);
        tokio::select! {
            received = rx.recv() => match received {
                Some(line) => {
                    on_line(&line);
                    lines.push(line);
                    last_output = tokio::time::Instant::now();
                }
                // Both streams closed; fall through to wait for exit
                None => break,
            },
            _ = tokio::time::sleep_until(deadline) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(CommandError::Timeout {
                    program: spec.program.clone(),
                    after: spec.timeout,
                });
            }
            _ = sleep_until_opt(silence_deadline) => {
                let quiet_secs = started.elapsed().as_secs();
                on_line(&format!("still working... ({quiet_secs}s elapsed, no output)"));
                last_output = tokio::time::Instant::now();
            }
        }
    }

    let status = match tokio::time::timeout_at(deadline, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(source)) => {
            return Err(CommandError::Spawn {
                program: spec.program.clone(),
                source,
            })
        }
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(CommandError::Timeout {
                program: spec.program.clone(),
                after: spec.timeout,
            });
        }
    };

    Ok(CommandOutput {
        exit_code: status.code().unwrap_or(-1),
        lines,
    })
}
