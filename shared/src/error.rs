use std::io;
use std::string::FromUtf8Error;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    #[error("i/o timeout")]
    ErrTimeout,
    #[error("transport not connected")]
    ErrNotConnected,
    #[error("invalid parameter")]
    ErrInvalidParameter,
    #[error("feature or algorithm unsupported")]
    ErrUnsupported,
    #[error("out of memory")]
    ErrOutOfMemory,
    #[error("certificate verification failed")]
    ErrCertificate,
    #[error("no certificate found")]
    ErrNoCertificate,
    #[error("session closed")]
    ErrSessionClosed,

    //Transport errors
    #[error("ICE channel must exist and be running")]
    ErrIceNotRunning,
    #[error("operation already pending on this message")]
    ErrPendingTx,
    #[error("transport registration failed")]
    ErrRegistrationFailed,

    //Wire-format errors
    #[error("packet is too short")]
    ErrShortPacket,
    #[error("unexpected packet")]
    ErrUnexpectedPacket,
    #[error("unsupported protocol version")]
    ErrUnsupportedProtocolVersion,
    #[error("cookie mismatch")]
    ErrCookieMismatch,

    //Configuration errors
    #[error("can't load CA list")]
    ErrLoadCaList,
    #[error("can't load identity certificate or key")]
    ErrLoadIdentity,

    #[error("mutex poison: {0}")]
    PoisonError(String),
    #[error("{0}")]
    Io(#[source] IoError),
    #[error("utf8: {0}")]
    Utf8(#[from] FromUtf8Error),
    #[error("{0}")]
    Std(#[source] StdError),
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn from_std<T>(error: T) -> Self
    where
        T: std::error::Error + Send + Sync + 'static,
    {
        Error::Std(StdError(Box::new(error)))
    }

    pub fn downcast_ref<T: std::error::Error + 'static>(&self) -> Option<&T> {
        if let Error::Std(s) = self {
            return s.0.downcast_ref();
        }

        None
    }
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}

/// An escape hatch to preserve stack traces when we don't know the error.
///
/// This crate exports seam traits such as `DtlsEngine` and `IceChannel`.
/// Their implementations live in crates higher up the stack and produce
/// errors local to those crates. `Error::from_std` lets them surface here
/// without losing the underlying error (and stack trace!).
#[derive(Debug, Error)]
#[error("{0}")]
pub struct StdError(pub Box<dyn std::error::Error + Send + Sync>);

impl PartialEq for StdError {
    fn eq(&self, _: &Self) -> bool {
        false
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Error::PoisonError(e.to_string())
    }
}
