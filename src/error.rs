//! Sorting errors.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io;

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// Invalid sorter configuration (zero partition size and the like).
    Configuration(String),
    /// Temporary directory or file creation error.
    TempDir(io::Error),
    /// Workers thread pool initialization error.
    ThreadPoolBuild(rayon::ThreadPoolBuildError),
    /// Common I/O error.
    IO(io::Error),
    /// Data serialization or deserialization error.
    Serialization(Box<dyn Error + Send + Sync>),
    /// A partition handle was loaded after it had been consumed or released, or was never dumped.
    Exhausted(String),
    /// Input data stream error.
    Input(Box<dyn Error + Send + Sync>),
}

impl SortError {
    pub(crate) fn serialization<E>(err: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        SortError::Serialization(Box::new(err))
    }
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::Configuration(_) | SortError::Exhausted(_) => None,
            SortError::TempDir(err) => Some(err),
            SortError::ThreadPoolBuild(err) => Some(err),
            SortError::IO(err) => Some(err),
            SortError::Serialization(err) => Some(err.as_ref()),
            SortError::Input(err) => Some(err.as_ref()),
        }
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::Configuration(msg) => write!(f, "invalid sorter configuration: {}", msg),
            SortError::TempDir(err) => write!(f, "temporary directory or file not created: {}", err),
            SortError::ThreadPoolBuild(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::IO(err) => write!(f, "I/O operation failed: {}", err),
            SortError::Serialization(err) => write!(f, "data serialization error: {}", err),
            SortError::Exhausted(msg) => write!(f, "partition not available: {}", msg),
            SortError::Input(err) => write!(f, "input data stream error: {}", err),
        }
    }
}

impl From<io::Error> for SortError {
    fn from(err: io::Error) -> Self {
        SortError::IO(err)
    }
}
