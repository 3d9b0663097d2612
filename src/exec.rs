//! External process execution
//!
//! Every `ip`, `wg`, `iptables`, `systemctl`, `apt-get` and `easyrsa`
//! invocation goes through a [`CommandRunner`]. Arguments are passed as a
//! vector (never a shell string) and secrets travel through stdin.

use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{VpnError, VpnResult};
use crate::validation;

/// Default bound applied when a spec is built without an explicit timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A single external invocation
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Fed to the child's stdin and then closed
    pub stdin: Option<String>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            stdin: None,
            env: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
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

    pub fn stdin<S: Into<String>>(mut self, input: S) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Command line as shown in logs and errors. Stdin is never included.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}

/// Captured result of a finished process
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: &str) -> Self {
        Self { code: Some(0), stdout: stdout.to_string(), stderr: String::new() }
    }

    pub fn failed(code: i32, stderr: &str) -> Self {
        Self { code: Some(code), stdout: String::new(), stderr: stderr.to_string() }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs external commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. A non-zero exit is reported through
    /// [`CommandOutput::code`], not as an error. Spawn failures and timeouts
    /// are errors.
    async fn run(&self, spec: &CommandSpec) -> VpnResult<CommandOutput>;
}

/// Runner backed by `tokio::process`
#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> VpnResult<CommandOutput> {
        debug!("Running: {}", spec);

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if spec.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| VpnError::ExternalFailure {
            step: "spawn".to_string(),
            cmd: spec.display(),
            code: None,
            stderr: e.to_string(),
        })?;

        if let (Some(input), Some(mut stdin)) = (spec.stdin.as_ref(), child.stdin.take()) {
            stdin.write_all(input.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(VpnError::Timeout(format!(
                    "'{}' did not finish within {}s",
                    spec.display(),
                    spec.timeout.as_secs()
                )));
            }
        };

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Run a command and turn a non-zero exit into [`VpnError::ExternalFailure`]
pub async fn run_checked(runner: &dyn CommandRunner, spec: &CommandSpec, step: &str) -> VpnResult<CommandOutput> {
    let output = runner.run(spec).await.map_err(|e| e.in_step(step))?;
    if !output.success() {
        return Err(VpnError::ExternalFailure {
            step: step.to_string(),
            cmd: spec.display(),
            code: output.code,
            stderr: validation::sanitize_error_message(&output.stderr),
        });
    }
    Ok(output)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    type Responder = Box<dyn Fn(&CommandSpec) -> CommandOutput + Send + Sync>;

    /// Answers every command through a closure and records what ran
    pub struct ScriptedRunner {
        respond: Responder,
        calls: Mutex<Vec<CommandSpec>>,
    }

    impl ScriptedRunner {
        pub fn new<F>(respond: F) -> Self
        where
            F: Fn(&CommandSpec) -> CommandOutput + Send + Sync + 'static,
        {
            Self { respond: Box::new(respond), calls: Mutex::new(Vec::new()) }
        }

        /// Every command succeeds with empty output
        pub fn succeeding() -> Self {
            Self::new(|_| CommandOutput::ok(""))
        }

        pub fn calls(&self) -> Vec<CommandSpec> {
            self.calls.lock().unwrap().clone()
        }

        pub fn command_lines(&self) -> Vec<String> {
            self.calls().iter().map(CommandSpec::display).collect()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, spec: &CommandSpec) -> VpnResult<CommandOutput> {
            self.calls.lock().unwrap().push(spec.clone());
            Ok((self.respond)(spec))
        }
    }
}
