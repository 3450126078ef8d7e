use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("remote store error: {0}")]
    Remote(String),
    #[error("local cache I/O error: {0}")]
    Cache(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("record not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Remote(err.to_string())
    }
}

pub type RepoResult<T> = Result<T, RepositoryError>;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("failed to read defects: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("escalation endpoint request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("escalation endpoint rejected the alert ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("no template configured for threshold {0}")]
    MissingTemplate(u32),
    #[error("mail transport failed: {0}")]
    Mail(String),
}
