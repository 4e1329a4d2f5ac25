//! Running the instrumented target once per testcase.
//!
//! `CommandExecutor` drives a libFuzzer binary directly: unit timeout and
//! RSS limit go on the command line, the injection directive and sanitizer
//! options go in the environment, and an outer watchdog kills the whole
//! process group if the binary fails to enforce its own timeout.

use crate::injection::{FIXREVERTER_ENV, InjectionDirective};
use crate::sanitizer::SanitizerOptions;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// Default libFuzzer `-timeout` for a single unit.
pub const DEFAULT_UNIT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default libFuzzer `-rss_limit_mb`.
pub const DEFAULT_RSS_LIMIT_MB: u64 = 2048;
/// Slack given to the target to enforce its own timeout before the
/// watchdog kills it.
pub const DEFAULT_WATCHDOG_MARGIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    Ok,
    Timeout,
    /// Non-zero exit or death by signal. Whether this is an interesting
    /// crash is decided by an `Oracle`, not here.
    Crash(String),
}

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to spawn target {binary:?}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Error waiting for target {binary:?}: {source}")]
    Wait {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Default, Clone)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

/// Everything captured from one run of the target.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub output: ProcessOutput,
    pub elapsed: Duration,
}

impl ExecutionResult {
    pub fn timed_out(&self) -> bool {
        self.status == ExecutionStatus::Timeout
    }

    /// stdout followed by stderr, lossily decoded.
    pub fn combined_output(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.output.stdout).into_owned();
        if !self.output.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&String::from_utf8_lossy(&self.output.stderr));
        }
        text
    }
}

/// An `Executor` runs the target binary once against one testcase.
///
/// Implementations must not interpret the outcome: a crashing run is an
/// `Ok` result with a `Crash` status, and only failures to run the target
/// at all are errors.
pub trait Executor {
    /// Path of the binary under test.
    fn target(&self) -> &Path;

    /// Runs the target on `testcase` and waits for it to finish.
    ///
    /// # Arguments
    /// * `testcase`: input file handed to the target as its last argument.
    /// * `directive`: which injection points to enable. `Baseline` leaves the
    ///   target's default in effect.
    ///
    /// # Returns
    /// The captured `ExecutionResult`, or an `ExecutorError` if the target
    /// could not be started or waited on.
    fn execute_sync(
        &mut self,
        testcase: &Path,
        directive: &InjectionDirective,
    ) -> Result<ExecutionResult, ExecutorError>;
}

#[derive(Debug, Clone)]
pub struct CommandExecutorConfig {
    pub binary: PathBuf,
    pub unit_timeout: Duration,
    pub rss_limit_mb: u64,
    pub watchdog_margin: Duration,
    pub sanitizer: SanitizerOptions,
}

impl CommandExecutorConfig {
    pub fn new(binary: PathBuf) -> Self {
        Self {
            binary,
            unit_timeout: DEFAULT_UNIT_TIMEOUT,
            rss_limit_mb: DEFAULT_RSS_LIMIT_MB,
            watchdog_margin: DEFAULT_WATCHDOG_MARGIN,
            sanitizer: SanitizerOptions::default(),
        }
    }

    pub fn watchdog_timeout(&self) -> Duration {
        self.unit_timeout + self.watchdog_margin
    }
}

/// Executes an instrumented libFuzzer binary as a child process.
///
/// The child runs from the binary's own directory in a fresh process
/// group, so a watchdog expiry takes down anything it forked as well.
pub struct CommandExecutor {
    config: CommandExecutorConfig,
    binary: PathBuf,
}

impl CommandExecutor {
    pub fn new(config: CommandExecutorConfig) -> Self {
        // The child's cwd changes, so relative paths must be resolved first.
        let binary = std::path::absolute(&config.binary).unwrap_or_else(|_| config.binary.clone());
        Self { config, binary }
    }

    pub fn config(&self) -> &CommandExecutorConfig {
        &self.config
    }

    fn build_command(&self, testcase: &Path, directive: &InjectionDirective) -> Command {
        let testcase = std::path::absolute(testcase).unwrap_or_else(|_| testcase.to_path_buf());

        let mut cmd = Command::new(&self.binary);
        cmd.arg(format!("-timeout={}", self.config.unit_timeout.as_secs()))
            .arg(format!("-rss_limit_mb={}", self.config.rss_limit_mb))
            .arg(&testcase);

        if let Some(dir) = self.binary.parent().filter(|d| !d.as_os_str().is_empty()) {
            cmd.current_dir(dir);
        }

        for (key, value) in self.config.sanitizer.env_vars() {
            cmd.env(key, value);
        }
        match directive.env_value() {
            Some(value) => cmd.env(FIXREVERTER_ENV, value),
            None => cmd.env_remove(FIXREVERTER_ENV),
        };

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        cmd
    }

    /// Waits for the child up to `timeout`. `Ok(None)` means the watchdog
    /// fired and the process group was killed.
    fn run_and_wait_with_timeout(
        &self,
        child: &mut Child,
        timeout: Duration,
    ) -> Result<Option<ExitStatus>, ExecutorError> {
        let waited = child.wait_timeout(timeout);
        self.settle(child, waited, timeout)
    }

    /// Leaves no member of the child's process group running, whatever the
    /// outcome of waiting on it, so the pipe readers can finish.
    fn settle(
        &self,
        child: &mut Child,
        waited: std::io::Result<Option<ExitStatus>>,
        timeout: Duration,
    ) -> Result<Option<ExitStatus>, ExecutorError> {
        match waited {
            Ok(Some(status)) => {
                // The leader is already reaped here. Its pgid cannot be
                // reused while any group member is alive; once the group is
                // empty this only risks hitting a new process that took the
                // same id and made itself a group leader, which we accept.
                kill_process_group(child, false);
                Ok(Some(status))
            }
            Ok(None) => {
                warn!("Target {:?} exceeded watchdog of {timeout:?}, killing", self.binary);
                kill_process_group(child, true);
                child.wait().map_err(|source| ExecutorError::Wait {
                    binary: self.binary.clone(),
                    source,
                })?;
                Ok(None)
            }
            Err(source) => {
                warn!("Waiting on target {:?} failed, killing: {source}", self.binary);
                kill_process_group(child, true);
                let _ = child.wait();
                Err(ExecutorError::Wait {
                    binary: self.binary.clone(),
                    source,
                })
            }
        }
    }
}

fn kill_process_group(child: &mut Child, report: bool) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        match i32::try_from(child.id()) {
            Ok(pgid) => {
                if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                    if report {
                        warn!("Failed to kill process group {pgid}: {e}");
                        let _ = child.kill();
                    }
                }
            }
            Err(_) => {
                let _ = child.kill();
            }
        }
    }
    #[cfg(not(unix))]
    {
        if report {
            let _ = child.kill();
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            if let Err(e) = pipe.read_to_end(&mut buf) {
                debug!("Error reading target output: {e}");
            }
            buf
        })
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

fn describe_exit(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("Exited with code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("Terminated by signal {signal}");
        }
    }
    "Exited abnormally".to_string()
}

impl Executor for CommandExecutor {
    fn target(&self) -> &Path {
        &self.binary
    }

    fn execute_sync(
        &mut self,
        testcase: &Path,
        directive: &InjectionDirective,
    ) -> Result<ExecutionResult, ExecutorError> {
        let mut cmd = self.build_command(testcase, directive);
        debug!(
            "Running {:?} on {:?} with {}={:?}",
            self.binary,
            testcase,
            FIXREVERTER_ENV,
            directive.env_value()
        );

        let start_time = Instant::now();
        let mut child = cmd.spawn().map_err(|source| ExecutorError::Spawn {
            binary: self.binary.clone(),
            source,
        })?;

        let stdout_reader = drain(child.stdout.take());
        let stderr_reader = drain(child.stderr.take());

        let waited = self.run_and_wait_with_timeout(&mut child, self.config.watchdog_timeout());
        let stdout = collect(stdout_reader);
        let stderr = collect(stderr_reader);
        let elapsed = start_time.elapsed();
        let exit_status = waited?;

        let mut output = ProcessOutput {
            stdout,
            stderr,
            ..Default::default()
        };

        let status = match exit_status {
            Some(exit) => {
                output.exit_code = exit.code();
                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    output.signal = exit.signal();
                }
                if exit.success() {
                    ExecutionStatus::Ok
                } else {
                    ExecutionStatus::Crash(describe_exit(&exit))
                }
            }
            None => ExecutionStatus::Timeout,
        };

        Ok(ExecutionResult {
            status,
            output,
            elapsed,
        })
    }
}
