pub mod deployments;
pub mod files;
pub mod workflow;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("unique constraint violation")]
    UniqueViolation,
    #[error("foreign key constraint violation")]
    ForeignKey,
    #[error("database timeout")]
    Timeout,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Map driver errors onto the repository taxonomy. Postgres error codes:
/// 23505 unique_violation, 23503 foreign_key_violation.
pub(crate) fn map_db_err(e: sqlx::Error) -> RepoError {
    if matches!(e, sqlx::Error::PoolTimedOut) {
        return RepoError::Timeout;
    }
    if let sqlx::Error::Database(db) = &e {
        match db.code().as_deref() {
            Some("23505") => return RepoError::UniqueViolation,
            Some("23503") => return RepoError::ForeignKey,
            _ => {}
        }
    }
    RepoError::Database(e)
}
