//! Allow-listed external program execution.
//!
//! Every call into the `aws` CLI and the OpenSSH tools goes through
//! [`SafeCommand`], which validates each argument before anything is spawned
//! and never goes through a local shell.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command as TokioCommand;

/// Programs that may be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum AllowedProgram {
    /// The AWS CLI.
    Aws,
    /// OpenSSH client.
    Ssh,
    /// OpenSSH secure copy.
    Scp,
    /// OpenSSH key generator.
    SshKeygen,
}

impl AllowedProgram {
    /// Program name looked up on `PATH`.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Ssh => "ssh",
            Self::Scp => "scp",
            Self::SshKeygen => "ssh-keygen",
        }
    }
}

impl fmt::Display for AllowedProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors that can occur during command execution.
#[derive(Debug, Error)]
pub enum CommandError {
    /// An argument contained a forbidden character.
    #[error("invalid {field}: forbidden character {character:?}")]
    InvalidArgument {
        /// Which part of the command was rejected.
        field: &'static str,
        /// The offending character.
        character: char,
    },

    /// The program path is unusable.
    #[error("invalid program path '{0}'")]
    InvalidProgramPath(String),

    /// The program could not be started.
    #[error("failed to run {command}: {source}")]
    Spawn {
        /// The command line.
        command: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The command returned a non-zero exit code.
    #[error("command '{command}' exited with code {exit_code}: {stderr}")]
    NonZeroExit {
        /// The command that was executed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Standard output.
        stdout: String,
        /// Standard error output.
        stderr: String,
    },

    /// The command did not finish in time.
    #[error("command '{command}' timed out after {timeout_secs}s")]
    Timeout {
        /// The command that was executed.
        command: String,
        /// Timeout in seconds.
        timeout_secs: u64,
    },
}

impl CommandError {
    /// Combined stdout and stderr of a failed command, if it produced any.
    #[must_use]
    pub fn output(&self) -> String {
        match self {
            Self::NonZeroExit { stdout, stderr, .. } => join_output(stdout, stderr),
            _ => String::new(),
        }
    }

    /// Returns true if the failure happened before the program ran.
    #[must_use]
    pub fn is_validation_error(&self) -> bool {
        matches!(self, Self::InvalidArgument { .. } | Self::InvalidProgramPath(_))
    }
}

fn join_output(stdout: &str, stderr: &str) -> String {
    match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
        (true, _) => stderr.to_string(),
        (false, true) => stdout.to_string(),
        (false, false) => format!("{stdout}\n{stderr}"),
    }
}

/// Characters that are never allowed in command arguments.
const FORBIDDEN_CHARS: &[char] = &['\0', '\n', '\r'];

/// Validates a command argument.
pub fn validate_argument(arg: &str, field: &'static str) -> Result<(), CommandError> {
    match arg.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
        Some(character) => Err(CommandError::InvalidArgument { field, character }),
        None => Ok(()),
    }
}

fn validate_program_path(path: &str) -> Result<(), CommandError> {
    let bad = path.is_empty()
        || path.contains("..")
        || path
            .chars()
            .any(|c| FORBIDDEN_CHARS.contains(&c) || matches!(c, ';' | '&' | '|' | '$' | '`'));
    if bad {
        return Err(CommandError::InvalidProgramPath(path.to_string()));
    }
    Ok(())
}

/// Output from a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Standard output.
    pub stdout: Vec<u8>,
    /// Standard error.
    pub stderr: Vec<u8>,
    /// Exit status code (0 for success).
    pub exit_code: i32,
}

impl CommandOutput {
    /// Stdout as UTF-8, replacing invalid characters.
    #[must_use]
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stderr as UTF-8, replacing invalid characters.
    #[must_use]
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Stdout followed by stderr.
    #[must_use]
    pub fn combined(&self) -> String {
        join_output(&self.stdout_lossy(), &self.stderr_lossy())
    }

    /// Returns true if the command exited with 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A command builder that validates all inputs.
#[derive(Debug)]
pub struct SafeCommand {
    program: AllowedProgram,
    program_path: Option<String>,
    args: Vec<String>,
    env_vars: Vec<(String, String)>,
    timeout: Option<Duration>,
    error: Option<CommandError>,
}

impl SafeCommand {
    /// Creates a command for `program`.
    #[must_use]
    pub fn new(program: AllowedProgram) -> Self {
        Self {
            program,
            program_path: None,
            args: Vec::new(),
            env_vars: Vec::new(),
            timeout: None,
            error: None,
        }
    }

    fn record(&mut self, result: Result<(), CommandError>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                self.error.get_or_insert(e);
                false
            }
        }
    }

    /// Runs the program from `path` instead of searching `PATH`.
    #[must_use]
    pub fn with_program_path(mut self, path: &str) -> Self {
        if self.record(validate_program_path(path)) {
            self.program_path = Some(path.to_string());
        }
        self
    }

    /// Adds one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        let arg = arg.as_ref();
        if self.record(validate_argument(arg, "argument")) {
            self.args.push(arg.to_string());
        }
        self
    }

    /// Adds several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self = self.arg(arg);
        }
        self
    }

    /// Sets an environment variable.
    #[must_use]
    pub fn env(mut self, key: &str, value: &str) -> Self {
        if self.record(validate_argument(key, "env_key")) && self.record(validate_argument(value, "env_value")) {
            self.env_vars.push((key.to_string(), value.to_string()));
        }
        self
    }

    /// Kills the program if it runs longer than `timeout`.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Returns true if any input was rejected.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.error.is_some()
    }

    /// The command line, for logs and errors.
    #[must_use]
    pub fn command_description(&self) -> String {
        let program = self.program_path.as_deref().unwrap_or(self.program.as_str());
        if self.args.is_empty() {
            return program.to_string();
        }
        format!("{program} {}", self.args.join(" "))
    }

    /// Runs the command and fails on a non-zero exit code.
    pub async fn execute(self) -> Result<CommandOutput, CommandError> {
        let description = self.command_description();
        let output = self.execute_unchecked().await?;
        if !output.success() {
            return Err(CommandError::NonZeroExit {
                command: description,
                exit_code: output.exit_code,
                stdout: output.stdout_lossy(),
                stderr: output.stderr_lossy(),
            });
        }
        Ok(output)
    }

    /// Runs the command and returns its output whatever the exit code.
    pub async fn execute_unchecked(self) -> Result<CommandOutput, CommandError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let description = self.command_description();
        let program = self.program_path.as_deref().unwrap_or(self.program.as_str());

        let mut cmd = TokioCommand::new(program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.env_vars {
            cmd.env(key, value);
        }

        tracing::trace!(command = %description, "executing");
        let running = cmd.output();
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, running).await.map_err(|_| CommandError::Timeout {
                command: description.clone(),
                timeout_secs: limit.as_secs(),
            })?,
            None => running.await,
        }
        .map_err(|source| CommandError::Spawn {
            command: description,
            source,
        })?;

        Ok(CommandOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}
