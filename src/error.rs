use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not ready: no engine loaded")]
    SessionNotReady,

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("A generation is already in progress for this session")]
    GenerationInProgress,

    #[error("Engine failure: {0}")]
    EngineFailure(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker error: {0}")]
    Worker(String),
}

impl SessionError {
    /// Stable snake_case identifier handed to host `on_error` callbacks.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::SessionNotReady => "session_not_ready",
            SessionError::InvalidConfig(_) => "invalid_config",
            SessionError::GenerationInProgress => "generation_in_progress",
            SessionError::EngineFailure(_) => "engine_failure",
            SessionError::Io(_) => "io",
            SessionError::Worker(_) => "worker",
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::InvalidConfig(e.to_string())
    }
}
