use thiserror::Error;

pub use color_eyre::eyre::eyre;

use crate::wire::response::{ErrPayload, ErrPayloadBytes};

pub type Result<T> = core::result::Result<T, Error>;

/// Errors raised by the core.
///
/// Variants are grouped the way the design separates them: usage errors are
/// returned synchronously from the call that violated the contract; connection
/// and operation errors flow through the callback surface instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("server error: {0}")]
    ServerError(#[from] ErrPayload),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("bad config: {0}")]
    BadConfigError(String),

    #[error("a bug in mariadb-core: {0}")]
    LibraryBug(color_eyre::Report),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("truncated or malformed packet")]
    InvalidPacket,

    #[error("unexpected end of packet")]
    UnexpectedEof,

    #[error("not connected")]
    NotConnected,

    #[error("operation already in progress")]
    OperationInProgress,

    #[error("pipeline busy: a statement-scope operation cannot start while queries are in flight")]
    PipelineBusy,

    #[error("unknown statement handle")]
    UnknownStatementHandle,

    #[error("connection reset")]
    Reset,

    #[error("connection finished")]
    Finished,

    #[error("skipped")]
    Skipped,

    #[error("connector timed out waiting for the server")]
    Timeout,

    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

impl<'buf> From<ErrPayloadBytes<'buf>> for Error {
    fn from(value: ErrPayloadBytes<'buf>) -> Self {
        match ErrPayload::try_from(value) {
            Ok(err_payload) => Error::ServerError(err_payload),
            Err(err) => err,
        }
    }
}

impl From<core::convert::Infallible> for Error {
    fn from(err: core::convert::Infallible) -> Self {
        match err {}
    }
}

impl Error {
    pub fn from_debug(err: impl std::fmt::Debug) -> Self {
        Self::LibraryBug(color_eyre::eyre::eyre!(format!("{err:#?}")))
    }

    /// True for errors that terminate the connection, as opposed to a single operation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::IoError(_) | Error::InvalidPacket | Error::UnexpectedEof | Error::Timeout | Error::ConnectionLost(_)
        )
    }
}

impl<Src, Dst: ?Sized> From<zerocopy::CastError<Src, Dst>> for Error {
    fn from(err: zerocopy::CastError<Src, Dst>) -> Self {
        Self::LibraryBug(color_eyre::eyre::eyre!("{err:#?}"))
    }
}
