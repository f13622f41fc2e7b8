//! Subprocess execution for the firewall CLIs.
//!
//! The iptables and nftables backends talk to the kernel through their
//! command-line tools. Running them behind [`CommandRunner`] keeps the
//! argument building and output parsing testable without root.

use std::io::{self, Write};
use std::process::{Command, Stdio};

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Exit status was zero.
    pub success: bool,
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
}

/// Runs external commands.
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`.
    ///
    /// # Errors
    ///
    /// Returns an error only if the process could not be spawned; a non-zero
    /// exit is reported through [`CommandOutput::success`].
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput>;

    /// Run `program` with `args`, feeding `stdin` to it.
    ///
    /// # Errors
    ///
    /// Same as [`CommandRunner::run`].
    fn run_with_stdin(&self, program: &str, args: &[String], stdin: &str) -> io::Result<CommandOutput>;
}

/// Runs commands on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        tracing::trace!(program, ?args, "Running command");
        let output = Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()?;
        Ok(to_output(&output))
    }

    fn run_with_stdin(&self, program: &str, args: &[String], stdin: &str) -> io::Result<CommandOutput> {
        tracing::trace!(program, ?args, "Running command with stdin");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(stdin.as_bytes())?;
        }

        let output = child.wait_with_output()?;
        Ok(to_output(&output))
    }
}

fn to_output(output: &std::process::Output) -> CommandOutput {
    CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        success: output.status.success(),
        code: output.status.code(),
    }
}

/// Convert borrowed arguments into the owned form [`CommandRunner`] takes.
#[must_use]
pub fn args<S: AsRef<str>>(args: &[S]) -> Vec<String> {
    args.iter().map(|s| s.as_ref().to_string()).collect()
}
