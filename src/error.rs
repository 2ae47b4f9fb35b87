use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: Kind,
    pub message: String,
}

#[derive(Debug)]
pub enum Kind {
    TransportError(TransportErrorKind),
    RouterError(RouterErrorKind),
    RelayError(RelayErrorKind),
    WebRTCError(webrtc::Error),
    UtilError(webrtc_util::Error),
    IOError(std::io::Error),
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TransportErrorKind {
    TransportClosedError,
    WriteBackpressureError,
    TrackNotFoundError,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RouterErrorKind {
    RouterClosedError,
    PublisherAlreadyExistsError,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RelayErrorKind {
    InvalidPacketError,
    UnmarshalError,
}

impl Error {
    pub fn new_transport(message: String, kind: TransportErrorKind) -> Error {
        Error {
            kind: Kind::TransportError(kind),
            message,
        }
    }

    pub fn new_router(message: String, kind: RouterErrorKind) -> Error {
        Error {
            kind: Kind::RouterError(kind),
            message,
        }
    }

    pub fn new_relay(message: String, kind: RelayErrorKind) -> Error {
        Error {
            kind: Kind::RelayError(kind),
            message,
        }
    }

    /// True when the error only means the transport has been closed.
    pub fn is_closed(&self) -> bool {
        matches!(
            self.kind,
            Kind::TransportError(TransportErrorKind::TransportClosedError)
        )
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::TransportError(kind) => write!(f, "transport error {:?}", kind),
            Kind::RouterError(kind) => write!(f, "router error {:?}", kind),
            Kind::RelayError(kind) => write!(f, "relay error {:?}", kind),
            Kind::WebRTCError(err) => write!(f, "webrtc error {}", err),
            Kind::UtilError(err) => write!(f, "webrtc util error {}", err),
            Kind::IOError(err) => write!(f, "io error {}", err),
        }
    }
}

impl From<webrtc::Error> for Error {
    fn from(err: webrtc::Error) -> Self {
        Error {
            message: err.to_string(),
            kind: Kind::WebRTCError(err),
        }
    }
}

impl From<webrtc_util::Error> for Error {
    fn from(err: webrtc_util::Error) -> Self {
        Error {
            message: err.to_string(),
            kind: Kind::UtilError(err),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error {
            message: err.to_string(),
            kind: Kind::IOError(err),
        }
    }
}
