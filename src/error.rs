use thiserror::Error;

/// Failure taxonomy shared by every layer of the crate. The syscall layer
/// sitting above this crate maps these to user-visible codes.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,
    #[error("name already present in directory")]
    AlreadyExists,
    #[error("out of free sectors or directory slots")]
    NoSpace,
    #[error("size exceeds the maximum indirection capacity")]
    TooLarge,
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("operation not allowed")]
    NotAllowed,
    #[error("unknown file descriptor")]
    BadHandle,
    #[error("offset beyond end of file")]
    OutOfRange,
    #[error("device i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FsError>;
