//! Command execution result

use serde::{Deserialize, Serialize};

/// Captured output of one remote command
///
/// A non-zero exit status is not an error at this layer; callers decide.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the server closed the channel without reporting a status
    pub exit_status: Option<u32>,
}

impl Response {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_status: None,
        }
    }

    pub fn with_exit_status(mut self, exit_status: u32) -> Self {
        self.exit_status = Some(exit_status);
        self
    }

    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}
