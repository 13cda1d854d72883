use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Fail(String),

    #[error("Invalid graph structure: {0}")]
    InvalidGraph(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Kernel not found: {0}")]
    KernelNotFound(String),
}

/// Checks a programming invariant and panics with the formatted message when it does not hold.
///
/// Used where a failure means the graph and its execution plan have diverged. Recoverable
/// conditions return an [`Error`] instead.
#[macro_export]
macro_rules! enforce {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            panic!("Invariant violation: {}", format!($($arg)+));
        }
    };
}
