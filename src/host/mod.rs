// src/host/mod.rs

//! Host collaborators driven through external commands.

pub mod iproute;
pub mod iptables;

use std::process::Stdio;

use tokio::process::Command;
use tracing::trace;

pub use iproute::IprouteInterfaces;
pub use iptables::IptablesFilter;

/// Result of one external command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Trimmed stderr, falling back to the exit code
    pub fn failure_message(&self, program: &str) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("{} exited with {:?}", program, self.code)
        } else {
            format!("{}: {}", program, stderr)
        }
    }
}

/// Runs `program` with `args` and captures its output
pub async fn run(program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
    trace!(program, ?args, "Running host command");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await?;
    Ok(CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

pub(crate) fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: ToString,
{
    items.into_iter().map(|s| s.to_string()).collect()
}
