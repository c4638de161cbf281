use core::fmt;

/// File-store error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    AlreadyExists,
    InvalidName,
    NoSpace,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FsError::NotFound => write!(f, "No such file"),
            FsError::AlreadyExists => write!(f, "File exists"),
            FsError::InvalidName => write!(f, "Invalid file name"),
            FsError::NoSpace => write!(f, "No space left"),
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;
