//! Remote command execution.
//!
//! The orchestrator talks to worker nodes through the [`RemoteExecutor`]
//! trait so its state machine is made of typed calls. Turning an argv into
//! an actual shell invocation happens in exactly one place, the executors
//! below; nothing else in the crate formats command strings.

use std::process::{Command, Stdio};

use super::error::RemoteError;

/// ssh reserves exit status 255 for its own failures (unreachable host,
/// auth, closed connection). Remote programs returning 255 are
/// indistinguishable, which is acceptable here.
const SSH_FAILURE: i32 = 255;

/// One command to run on a node.
#[derive(Debug, Clone)]
pub struct RemoteCommand {
    argv: Vec<String>,
    background: bool,
    log_file: Option<String>,
    allow_failure: bool,
}

impl RemoteCommand {
    pub fn new(argv: &[&str]) -> Self {
        Self::from_argv(argv.iter().map(|s| s.to_string()).collect())
    }

    pub fn from_argv(argv: Vec<String>) -> Self {
        Self {
            argv,
            background: false,
            log_file: None,
            allow_failure: false,
        }
    }

    /// Fire and forget: the caller gets no exit status. Anything that needs
    /// the outcome must poll side-channel files instead.
    pub fn background(mut self) -> Self {
        self.background = true;
        self
    }

    /// Redirect stdout and stderr to a file on the node.
    pub fn log_to(mut self, path: &str) -> Self {
        self.log_file = Some(path.to_string());
        self
    }

    /// A nonzero exit is expected and not an error, e.g. deleting a
    /// ringbuffer that does not exist.
    pub fn allow_failure(mut self) -> Self {
        self.allow_failure = true;
        self
    }

    pub fn is_background(&self) -> bool {
        self.background
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }

    /// The shell line this command turns into on the remote side.
    pub fn shell_line(&self) -> String {
        let mut line = self
            .argv
            .iter()
            .map(|arg| quote(arg))
            .collect::<Vec<_>>()
            .join(" ");
        if let Some(log) = &self.log_file {
            line.push_str(&format!(" > {} 2>&1", quote(log)));
        } else if self.allow_failure {
            line.push_str(" 2> /dev/null");
        }
        if self.background {
            line.push_str(" &");
        }
        line
    }
}

/// Quote an argument for the remote shell.
fn quote(arg: &str) -> String {
    if arg.is_empty() {
        return String::from("''");
    }
    let safe = arg
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "/_-.:=+,@%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

pub trait RemoteExecutor: Send + Sync {
    /// Run a command on a node. Background commands return as soon as the
    /// dispatch succeeded; their outcome is never observed here.
    fn execute(&self, host: &str, command: &RemoteCommand) -> Result<(), RemoteError>;

    /// Run a foreground command and capture its stdout.
    fn capture(&self, host: &str, command: &RemoteCommand) -> Result<String, RemoteError>;
}

/// The production executor: one ssh invocation per command.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    pub connect_timeout_sec: u32,
}

impl SshExecutor {
    pub fn new(connect_timeout_sec: u32) -> Self {
        Self {
            connect_timeout_sec,
        }
    }

    fn ssh_command(&self, host: &str, command: &RemoteCommand) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout_sec))
            .arg(host)
            .arg(command.shell_line());
        cmd
    }
}

impl RemoteExecutor for SshExecutor {
    fn execute(&self, host: &str, command: &RemoteCommand) -> Result<(), RemoteError> {
        log::debug!("{}: {}", host, command.shell_line());
        let mut cmd = self.ssh_command(host, command);
        if command.background {
            cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
            let mut child = cmd.spawn().map_err(|source| RemoteError::SpawnFailed {
                host: host.to_string(),
                source,
            })?;
            // reap the ssh process without blocking the launch sequence
            std::thread::spawn(move || {
                let _ = child.wait();
            });
            return Ok(());
        }

        let status = cmd.status().map_err(|source| RemoteError::SpawnFailed {
            host: host.to_string(),
            source,
        })?;
        check_status(host, status.code(), command.allow_failure)
    }

    fn capture(&self, host: &str, command: &RemoteCommand) -> Result<String, RemoteError> {
        let output = self
            .ssh_command(host, command)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| RemoteError::SpawnFailed {
                host: host.to_string(),
                source,
            })?;
        check_status(host, output.status.code(), command.allow_failure)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Runs commands on the local machine instead of over ssh. Used for offline
/// debug observations and in tests; the host argument is only logged.
#[derive(Debug, Clone, Default)]
pub struct LocalExecutor;

impl RemoteExecutor for LocalExecutor {
    fn execute(&self, host: &str, command: &RemoteCommand) -> Result<(), RemoteError> {
        log::debug!("{} (local): {}", host, command.shell_line());
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command.shell_line());
        if command.background {
            cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
            let mut child = cmd.spawn().map_err(|source| RemoteError::SpawnFailed {
                host: host.to_string(),
                source,
            })?;
            std::thread::spawn(move || {
                let _ = child.wait();
            });
            return Ok(());
        }
        let status = cmd.status().map_err(|source| RemoteError::SpawnFailed {
            host: host.to_string(),
            source,
        })?;
        check_status(host, status.code(), command.allow_failure)
    }

    fn capture(&self, host: &str, command: &RemoteCommand) -> Result<String, RemoteError> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(command.shell_line())
            .stdin(Stdio::null())
            .output()
            .map_err(|source| RemoteError::SpawnFailed {
                host: host.to_string(),
                source,
            })?;
        check_status(host, output.status.code(), command.allow_failure)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn check_status(host: &str, code: Option<i32>, allow_failure: bool) -> Result<(), RemoteError> {
    match code {
        Some(0) | None => Ok(()),
        Some(SSH_FAILURE) => Err(RemoteError::NodeUnreachable(host.to_string())),
        Some(code) if allow_failure => {
            log::debug!("{}: ignoring exit status {}", host, code);
            Ok(())
        }
        Some(code) => Err(RemoteError::CommandFailed {
            host: host.to_string(),
            code,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_line_plain() {
        let cmd = RemoteCommand::new(&["dada_db", "-d", "-k", "dada"]);
        assert_eq!(cmd.shell_line(), "dada_db -d -k dada");
    }

    #[test]
    fn test_shell_line_quotes_spaces() {
        let cmd = RemoteCommand::new(&["echo", "two words"]);
        assert_eq!(cmd.shell_line(), "echo 'two words'");
    }

    #[test]
    fn test_shell_line_background_and_log() {
        let cmd = RemoteCommand::new(&["fill_ringbuffer", "-k", "dada"])
            .log_to("/tmp/log.txt")
            .background();
        assert_eq!(
            cmd.shell_line(),
            "fill_ringbuffer -k dada > /tmp/log.txt 2>&1 &"
        );
    }

    #[test]
    fn test_local_executor_status() {
        let exec = LocalExecutor;
        assert!(exec.execute("test", &RemoteCommand::new(&["true"])).is_ok());
        match exec.execute("test", &RemoteCommand::new(&["false"])) {
            Err(RemoteError::CommandFailed { code: 1, .. }) => (),
            _ => panic!(),
        }
        // an expected failure is swallowed
        assert!(exec
            .execute("test", &RemoteCommand::new(&["false"]).allow_failure())
            .is_ok());
    }

    #[test]
    fn test_local_capture() {
        let exec = LocalExecutor;
        let out = exec
            .capture("test", &RemoteCommand::new(&["echo", "hello"]))
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }
}
