use std::io;
use thiserror::Error;

/// type alias for all operations in this crate that could fail with a [`KvError`]
pub type Result<T> = std::result::Result<T, KvError>;

/// Error variants used throughout reactorkv.
/// It wraps any lower level errors from third party crates
#[derive(Error)]
pub enum KvError {
    /// variant for errors caused by std::io
    #[error("IO error")]
    Io {
        /// source of the IO Error
        #[from]
        source: io::Error,
    },

    /// variant for attempts to store an entry under an empty key
    #[error("Key cannot be empty")]
    EmptyKey,

    /// variant for errors when parsing strings to some other type
    #[error("{}", .0)]
    Parsing(String),

    /// variant for unexpected data received on the wire
    #[error("{}", .0)]
    Protocol(String),

    /// variant for failures while bringing up server infrastructure
    #[error("{}", .0)]
    Startup(String),
}

/// a custom Debug implementation that will write the entire error chain
impl std::fmt::Debug for KvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

/// writes the entire error chain of the given error `e`, to the formatter.
fn error_chain_fmt(
    e: &impl std::error::Error,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    writeln!(f, "{}\n", e)?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by: {}", cause)?;
        current = cause.source();
    }
    Ok(())
}
