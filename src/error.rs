use thiserror::Error;

/// Errors surfaced by the `queue-harness` binary's own argument parsing and
/// thread setup. The lock-free queue core never returns this type — see
/// `concurrent::queue` for why.
#[derive(Error, Debug, Clone)]
pub enum DbError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("runtime error: {0}")]
    Runtime(String),
}

impl From<std::io::Error> for DbError {
    fn from(e: std::io::Error) -> Self {
        DbError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
