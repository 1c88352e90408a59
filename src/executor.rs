use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::ExecutorConfig;

/// Slack on top of the executor's own timeout before the subprocess is
/// killed outright.
const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("executor timed out")]
    Timeout,
    #[error("executor failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The external command agent. One dispatch per actionable caller turn; the
/// caller serializes invocations within a session.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn dispatch(&self, utterance: &str) -> Result<String, ExecutorError>;
}

/// Runs the agent binary per dispatch and captures its reply from stdout.
pub struct SubprocessExecutor {
    command: String,
    session_id: String,
    timeout: Duration,
}

impl SubprocessExecutor {
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            command: config.command.clone(),
            session_id: config.chat_id.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

#[async_trait]
impl Executor for SubprocessExecutor {
    async fn dispatch(&self, utterance: &str) -> Result<String, ExecutorError> {
        // Spoken "new line" tends to be transcribed as a literal backslash-n.
        let message = utterance.replace("\\n", "\n");
        let timeout_arg = self.timeout.as_secs().to_string();

        let mut command = Command::new(&self.command);
        command
            .args([
                "agent",
                "--session-id",
                &self.session_id,
                "--message",
                &message,
                "--timeout",
                &timeout_arg,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!("Dispatching to executor: {:.80}", message);
        let child = command.spawn()?;

        // Dropping the wait future on timeout drops the child, which kills
        // the process because of kill_on_drop.
        let output = match timeout(self.timeout + KILL_GRACE, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!("Executor timed out after {:?}", self.timeout);
                return Err(ExecutorError::Timeout);
            }
        };

        if !output.status.success() {
            tracing::warn!("Executor exited with {}", output.status);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() && !stderr.contains("DeprecationWarning") {
            tracing::warn!("Executor stderr: {:.200}", stderr);
        }

        let reply = normalize_reply(&String::from_utf8_lossy(&output.stdout));
        tracing::info!("Executor reply: {:.120}", reply);
        Ok(reply)
    }
}

/// Strip framework noise the agent runtime prints around its actual answer.
pub fn normalize_reply(raw: &str) -> String {
    raw.lines()
        .filter(|line| {
            let trimmed = line.trim();
            !trimmed.is_empty()
                && !trimmed.contains("DeprecationWarning")
                && !trimmed.starts_with("(node:")
                && !trimmed.starts_with("(Use `node")
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn strips_runtime_noise() {
        let raw = "(node:1234) [DEP0040] DeprecationWarning: punycode is deprecated\n\
                   (Use `node --trace-deprecation ...` to show where)\n\
                   \n\
                   Opened Spotify.\n";
        assert_eq!(normalize_reply(raw), "Opened Spotify.");
    }

    #[test]
    fn keeps_multi_line_replies() {
        let raw = "First line.\n\nSecond line.\n";
        assert_eq!(normalize_reply(raw), "First line.\nSecond line.");
    }

    #[tokio::test]
    async fn subprocess_receives_the_literal_utterance() {
        let executor = SubprocessExecutor {
            command: "echo".to_string(),
            session_id: "main".to_string(),
            timeout: Duration::from_secs(5),
        };
        let reply = executor.dispatch("open Spotify").await.unwrap();
        assert!(reply.contains("open Spotify"), "reply: {}", reply);
        assert!(reply.contains("--session-id main"), "reply: {}", reply);
    }
}
