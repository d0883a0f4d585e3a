use std::any::Any;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("server has no listener")]
    MissingListener,

    #[error("server has no forking strategy")]
    MissingForkingStrategy,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("panic in connection handler: {0}")]
    HandlerPanic(String),

    #[error("panic in background job: {0}")]
    BackgroundJobPanic(String),

    #[error("panic in service: {0}")]
    ServicePanic(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Reports whether an I/O error means the other side of the connection is
/// gone. Typed error kinds are checked first; the message fallback covers
/// platform errors that only surface as text.
pub fn is_broken_pipe(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected => true,
        _ => {
            let message = err.to_string();
            message.contains("use of closed network connection")
                || message.contains("broken pipe")
                || message.contains("reset by peer")
                || message.contains("unexpected EOF")
                || message.contains("closed pipe")
        }
    }
}

/// Reports whether an I/O error is a read/write timeout. Unix surfaces
/// timeouts as `WouldBlock`, Windows as `TimedOut`.
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// The canonical end-of-stream error used wherever broken-pipe class failures
/// are remapped at the socket boundary.
pub(crate) fn eof_error() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "end of stream")
}

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broken_pipe_matches_typed_kinds() {
        let err = io::Error::new(io::ErrorKind::ConnectionReset, "connection reset");
        assert!(is_broken_pipe(&err));

        let err = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert!(is_broken_pipe(&err));

        let err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert!(!is_broken_pipe(&err));
    }

    #[test]
    fn broken_pipe_falls_back_to_message() {
        let err = io::Error::new(io::ErrorKind::Other, "use of closed network connection");
        assert!(is_broken_pipe(&err));
    }

    #[test]
    fn timeout_predicate() {
        assert!(is_timeout(&io::Error::new(io::ErrorKind::WouldBlock, "t")));
        assert!(is_timeout(&io::Error::new(io::ErrorKind::TimedOut, "t")));
        assert!(!is_timeout(&io::Error::new(io::ErrorKind::Other, "t")));
    }
}
