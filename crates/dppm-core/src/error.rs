use thiserror::Error;

#[derive(Debug, Error)]
pub enum DppmError {
    #[error("decomposition failed: {0}")]
    Decomposition(String),

    #[error("merge failed: {0}")]
    Merge(String),

    #[error("planning failed for subtask {subtask_id}: {message}")]
    Planning { subtask_id: String, message: String },

    #[error("reflection failed: {0}")]
    Reflection(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl DppmError {
    /// Fatal errors abort the run before anything is executed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DppmError::Decomposition(_)
                | DppmError::Merge(_)
                | DppmError::Cancelled
                | DppmError::InvalidInput(_)
        )
    }
}
