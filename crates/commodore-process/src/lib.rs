//! Subprocess execution for commodore.
//!
//! Every external tool commodore drives (git, the Kapitan-compatible
//! templating engine, the jsonnet bundler, a standalone jsonnet
//! interpreter) is invoked through this crate so that output capture,
//! working directories, environment injection and timeouts are handled
//! in one place.
//!
//! The binaries are overridable through environment variables
//! (`COMMODORE_GIT_BIN` and friends), which doubles as the seam used by
//! the test suites to substitute fake executables.
//!
//! # Example
//!
//! ```ignore
//! use commodore_process::Invocation;
//!
//! let out = Invocation::new("git").args(["--version"]).run().expect("run");
//! assert!(out.success());
//! ```

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Result of a command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code (or -1 when not available).
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Whether execution exceeded the configured timeout.
    pub timed_out: bool,
    /// Total wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl CommandOutput {
    /// Whether the command exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A single external command invocation.
///
/// Built up with the usual builder methods and executed with
/// [`Invocation::run`] (capture regardless of exit code) or
/// [`Invocation::run_ok`] (non-zero exit becomes an error carrying the
/// command line and stderr).
#[derive(Debug, Clone)]
pub struct Invocation {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    envs: BTreeMap<String, String>,
    timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            envs: BTreeMap::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }

    /// Pass a host environment variable through unchanged, if set.
    pub fn passthrough(mut self, key: &str) -> Self {
        if let Ok(v) = std::env::var(key) {
            self.envs.insert(key.to_string(), v);
        }
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// One-line rendering of the command for error messages.
    pub fn display(&self) -> String {
        let mut s = self.program.clone();
        for a in &self.args {
            s.push(' ');
            s.push_str(a);
        }
        s
    }

    /// Run the command and capture its output, regardless of exit code.
    pub fn run(&self) -> Result<CommandOutput> {
        let start = Instant::now();

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.cwd {
            command.current_dir(dir);
        }
        for (k, v) in &self.envs {
            command.env(k, v);
        }

        let Some(timeout_dur) = self.timeout else {
            let output = command
                .output()
                .with_context(|| format!("failed to run command: {}", self.display()))?;
            return Ok(CommandOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                timed_out: false,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        };

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn command: {}", self.display()))?;

        let deadline = Instant::now() + timeout_dur;
        loop {
            match child
                .try_wait()
                .with_context(|| format!("failed to poll command: {}", self.display()))?
            {
                Some(status) => {
                    return Ok(CommandOutput {
                        exit_code: status.code().unwrap_or(-1),
                        stdout: read_pipe(child.stdout.take()),
                        stderr: read_pipe(child.stderr.take()),
                        timed_out: false,
                        duration_ms: start.elapsed().as_millis() as u64,
                    });
                }
                None => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();

                        let mut stderr = read_pipe(child.stderr.take());
                        stderr.push_str(&format!(
                            "\n{} timed out after {}",
                            self.program,
                            humantime::format_duration(timeout_dur)
                        ));

                        return Ok(CommandOutput {
                            exit_code: -1,
                            stdout: read_pipe(child.stdout.take()),
                            stderr,
                            timed_out: true,
                            duration_ms: start.elapsed().as_millis() as u64,
                        });
                    }

                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }

    /// Run the command and fail on non-zero exit, attaching the command
    /// line and captured stderr to the error.
    pub fn run_ok(&self) -> Result<CommandOutput> {
        let out = self.run()?;
        if !out.success() {
            bail!(
                "command failed with exit code {}: {}\n{}",
                out.exit_code,
                self.display(),
                out.stderr.trim()
            );
        }
        Ok(out)
    }
}

fn read_pipe<R: Read>(stream: Option<R>) -> String {
    let mut buffer = Vec::new();
    if let Some(mut s) = stream {
        let _ = s.read_to_end(&mut buffer);
    }
    String::from_utf8_lossy(&buffer).to_string()
}

fn program_from_env(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

/// Path of the git binary (`COMMODORE_GIT_BIN`, default `git`).
pub fn git_program() -> String {
    program_from_env("COMMODORE_GIT_BIN", "git")
}

/// Path of the templating engine binary (`COMMODORE_ENGINE_BIN`, default
/// `kapitan`).
pub fn engine_program() -> String {
    program_from_env("COMMODORE_ENGINE_BIN", "kapitan")
}

/// Path of the jsonnet bundler binary (`COMMODORE_JB_BIN`, default `jb`).
pub fn jb_program() -> String {
    program_from_env("COMMODORE_JB_BIN", "jb")
}

/// Path of the jsonnet interpreter used for postprocessing filters
/// (`COMMODORE_JSONNET_BIN`, default `jsonnet`).
pub fn jsonnet_program() -> String {
    program_from_env("COMMODORE_JSONNET_BIN", "jsonnet")
}

/// Shortcut for a git invocation rooted in `dir`.
pub fn git_in(dir: impl AsRef<Path>) -> Invocation {
    Invocation::new(git_program()).current_dir(dir)
}

/// Check if a command exists in PATH.
pub fn command_exists(program: &str) -> bool {
    which::which(program).is_ok()
}

/// Get the full path to a command.
pub fn which(program: &str) -> Option<PathBuf> {
    which::which(program).ok()
}
