//! Error types and the related `Result<T>`

use camino::Utf8PathBuf;
use thiserror::Error;

pub type ZipResult<T> = Result<T, ZipError>;

#[derive(Debug, Error)]
pub enum ZipError {
    /// An error from underlying I/O,
    /// such as a caller-provided chunk generator failing.
    #[error("I/O Error")]
    Io(#[from] std::io::Error),

    /// A file on disk couldn't be opened, read, or stat'd.
    ///
    /// This can happen halfway through an archive.
    /// Whatever was already written is not a valid ZIP and should be discarded.
    #[error("Couldn't access {path}")]
    ResourceAccess {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The archive's size was requested, but an entry's size isn't known
    /// until its contents are streamed.
    #[error("Size of {0} isn't known before streaming")]
    UnknownSize(String),

    /// An entry's CRC or sizes were needed before its data descriptor was written.
    ///
    /// This means the stream driver fed the assembler out of order,
    /// and shouldn't happen.
    #[error("Data descriptor for {0} hasn't been written yet")]
    DescriptorNotWritten(String),

    /// The name is longer than a ZIP header can describe (65535 bytes).
    #[error("Name {0} is too long for a Zip archive ({1} bytes)")]
    NameTooLong(String, usize),

    /// The archive's size was requested after streaming began.
    #[error("Archive size can't be estimated once streaming has started")]
    AlreadyStreaming,

    /// A blocking [`ZipStream`] was asked to read an entry
    /// whose contents can only be produced asynchronously.
    ///
    /// [`ZipStream`]: ../write/struct.ZipStream.html
    #[error("{0} produces its contents asynchronously; use an AsyncZipStream")]
    AsyncSource(String),
}
