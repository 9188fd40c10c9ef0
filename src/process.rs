//! External process execution.
//!
//! Every external tool (`btrfs`, `mount`, `chroot`, the package tool) is run
//! through [`Cmd`], which captures exit status, stdout and stderr. Non-zero
//! exits fail the call unless `allow_fail` is set, in which case the caller
//! inspects [`CmdOutput::success`] and decides. Stdin is never connected.

use anyhow::{bail, Context, Result};
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::process::{Command, Stdio};

use crate::logging::Logger;

/// Captured result of a finished child process.
#[derive(Debug)]
pub struct CmdOutput {
    pub success: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CmdOutput {
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Builder for a single child-process invocation.
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            error_msg: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(OsString::from(arg));
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_os_string());
        }
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.as_os_str().to_os_string());
        self
    }

    /// Message used instead of the generic one when the child exits non-zero.
    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    /// Return the captured output even on non-zero exit.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Run the child to completion.
    ///
    /// Fails on spawn errors always, and on non-zero exit unless
    /// `allow_fail` was set.
    pub fn run(self) -> Result<CmdOutput> {
        Logger::log(&format!("Running: {} {}", self.program, self.render_args()));

        let output = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to execute {}", self.program))?;

        let result = CmdOutput {
            success: output.status.success(),
            stdout: output.stdout,
            stderr: output.stderr,
        };

        if !result.success && !self.allow_fail {
            let msg = self
                .error_msg
                .unwrap_or_else(|| format!("{} failed", self.program));
            bail!("{}: {}", msg, result.stderr_str().trim());
        }

        Ok(result)
    }

    fn render_args(&self) -> String {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Run a single command string through `sh -c`.
///
/// Reserved for the rare spot where a pipeline cannot be expressed as one
/// argv; everything else goes through [`Cmd`].
pub fn run_shell(command: &str) -> Result<CmdOutput> {
    Cmd::new("sh").args(["-c", command]).run()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout() {
        let out = Cmd::new("echo").arg("hello").run().unwrap();
        assert!(out.success);
        assert_eq!(out.stdout_str().trim(), "hello");
    }

    #[test]
    fn nonzero_exit_fails_by_default() {
        let result = Cmd::new("false").error_msg("false failed").run();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("false failed"));
    }

    #[test]
    fn allow_fail_returns_output() {
        let out = Cmd::new("false").allow_fail().run().unwrap();
        assert!(!out.success);
    }

    #[test]
    fn spawn_error_fails_even_with_allow_fail() {
        let result = Cmd::new("definitely_not_a_real_command_12345")
            .allow_fail()
            .run();
        assert!(result.is_err());
    }

    #[test]
    fn shell_pipeline() {
        let out = run_shell("echo one two | wc -w").unwrap();
        assert_eq!(out.stdout_str().trim(), "2");
    }
}
