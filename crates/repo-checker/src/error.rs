use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckerError {
    #[error("failed to launch git: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("git {command} failed (exit {status:?}): {stderr}")]
    Git { command: String, status: Option<i32>, stderr: String },
    #[error("remote has no ref refs/heads/{branch}")]
    RefNotFound { branch: String },
}

impl CheckerError {
    /// A listing without the branch is a miss worth retrying on the next tick;
    /// anything else means the remote itself is unusable.
    pub fn is_retryable(&self) -> bool { matches!(self, Self::RefNotFound { .. }) }
}
