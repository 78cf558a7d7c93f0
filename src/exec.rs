//! External command invocation.
//!
//! The workload-manager binaries are opaque external processes; this module
//! wraps their invocation and output capture. A non-empty stderr is not an
//! error by itself: callers interpret it (for `squeue` it means the job is
//! no longer known to the scheduler).

use std::process::Stdio;

use tokio::process::Command;
use tracing::trace;

/// The captured output of a finished external command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// The process exit code, if the process exited normally.
    pub exit_code: Option<i32>,
}

/// An external command invocation, optionally run through a shell.
#[derive(Debug, Clone)]
pub struct ExecTask {
    /// The binary to invoke.
    command: String,
    /// Arguments passed to the binary.
    args: Vec<String>,
    /// Whether to run the command line through `sh -c`.
    shell: bool,
    /// Environment variables applied to the child process.
    envs: Vec<(String, String)>,
}

impl ExecTask {
    /// Create a new task for the given binary.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            shell: false,
            envs: Vec::new(),
        }
    }

    /// Append a single argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run the command line through `sh -c`.
    pub fn shell(mut self, shell: bool) -> Self {
        self.shell = shell;
        self
    }

    /// Apply environment variables to the child process.
    pub fn envs<I, K, V>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.envs
            .extend(envs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Runs the command to completion, capturing stdout and stderr.
    ///
    /// The child is killed if the invoking future is dropped, so a cancelled
    /// request does not leave scheduler commands behind.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be spawned or waited on.
    pub async fn execute(&self) -> std::io::Result<ExecOutput> {
        let mut command = if self.shell {
            let mut command = Command::new("sh");
            command.arg("-c").arg(self.command_line());
            command
        } else {
            let mut command = Command::new(&self.command);
            command.args(&self.args);
            command
        };

        for (name, value) in &self.envs {
            command.env(name, value);
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        trace!(?command, "spawning external command");

        let output = command.spawn()?.wait_with_output().await?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }

    /// Renders the full command line for shell-mode invocation.
    fn command_line(&self) -> String {
        std::iter::once(self.command.clone())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_stdout_and_exit_code() {
        let output = ExecTask::new("echo").arg("hello").execute().await.unwrap();
        assert_eq!(output.stdout, "hello\n");
        assert_eq!(output.stderr, "");
        assert_eq!(output.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_captures_stderr_without_failing() {
        let output = ExecTask::new("sh")
            .args(["-c", "echo oops >&2"])
            .execute()
            .await
            .unwrap();
        assert_eq!(output.stdout, "");
        assert_eq!(output.stderr, "oops\n");
        assert_eq!(output.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_shell_mode_joins_arguments() {
        let output = ExecTask::new("echo")
            .args(["a", "b"])
            .shell(true)
            .execute()
            .await
            .unwrap();
        assert_eq!(output.stdout, "a b\n");
    }

    #[tokio::test]
    async fn test_envs_reach_the_child() {
        let output = ExecTask::new("sh")
            .args(["-c", "printf %s \"$GREETING\""])
            .envs([("GREETING", "hi")])
            .execute()
            .await
            .unwrap();
        assert_eq!(output.stdout, "hi");
    }

    #[tokio::test]
    async fn test_nonzero_exit_code() {
        let output = ExecTask::new("sh")
            .args(["-c", "exit 3"])
            .execute()
            .await
            .unwrap();
        assert_eq!(output.exit_code, Some(3));
    }
}
