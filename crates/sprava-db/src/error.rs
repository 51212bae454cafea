use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The referenced user, conversation or message does not exist.
    #[error("not found")]
    NotFound,

    /// The caller is not allowed to perform the operation (blocked pair,
    /// non-participant, non-author).
    #[error("forbidden")]
    Forbidden,

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database lock poisoned")]
    LockPoisoned,

    /// The blocking task running the query panicked or was cancelled.
    #[error("store task failed: {0}")]
    TaskFailed(String),
}

impl StoreError {
    /// True for failures of the store itself, as opposed to a rejected request.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            Self::Sqlite(_) | Self::LockPoisoned | Self::TaskFailed(_)
        )
    }
}
