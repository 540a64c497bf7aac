use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("expression error: {0}")]
    Expression(String),
    #[error("chain expansion error: {0}")]
    Expansion(String),
    #[error("invalid task descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("database operation failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("work queue operation failed: {0}")]
    Queue(String),
    #[error("task not found: id={id}")]
    TaskNotFound { id: i64 },
    #[error("scheduling attempt not found: id={id}")]
    AttemptNotFound { id: i64 },
    #[error("file product not found: {directory}/{filename}")]
    ProductNotFound { directory: String, filename: String },
    #[error("product version not found: id={id}")]
    ProductVersionNotFound { id: i64 },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    pub fn expression<S: Into<String>>(msg: S) -> Self {
        Self::Expression(msg.into())
    }
    pub fn expansion<S: Into<String>>(msg: S) -> Self {
        Self::Expansion(msg.into())
    }
    pub fn invalid_descriptor<S: Into<String>>(msg: S) -> Self {
        Self::InvalidDescriptor(msg.into())
    }
    pub fn queue<S: Into<String>>(msg: S) -> Self {
        Self::Queue(msg.into())
    }
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Submission-time errors: the chain is rejected as a whole and
    /// nothing is persisted.
    pub fn is_submission_error(&self) -> bool {
        matches!(
            self,
            PipelineError::Expression(_)
                | PipelineError::Expansion(_)
                | PipelineError::InvalidDescriptor(_)
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Database(_) | PipelineError::Queue(_))
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Internal(err.to_string())
    }
}
