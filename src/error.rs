use thiserror::Error;
use uuid::Uuid;

/// A failure reported by the transport collaborator.
///
/// Cloneable so that a single failed connect attempt can be handed to every
/// caller that was waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("link is not connected")]
    Disconnected,

    #[error("device {0} not found")]
    DeviceNotFound(String),

    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    #[error("characteristic {0} does not support notifications")]
    NotifyUnsupported(Uuid),

    #[error("{0}")]
    Backend(String),
}

#[cfg(feature = "bluest")]
impl From<bluest::Error> for TransportError {
    fn from(err: bluest::Error) -> Self {
        TransportError::Backend(err.to_string())
    }
}

/// A payload did not have the shape its characteristic kind requires.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid utf-8 payload: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("failed to connect to {identity}: {source}")]
    Connection {
        identity: String,
        source: TransportError,
    },

    #[error("failed to read {uuid}: {source}")]
    Read { uuid: Uuid, source: TransportError },

    #[error("failed to write {uuid}: {source}")]
    Write { uuid: Uuid, source: TransportError },

    #[error("failed to subscribe to {uuid}: {source}")]
    Subscribe { uuid: Uuid, source: TransportError },

    #[error("scan failed: {0}")]
    Scan(TransportError),

    #[error("failed to list characteristics: {0}")]
    Discovery(TransportError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Connection {
            identity: "FB:EC:25:DE:1A:92".to_string(),
            source: TransportError::Backend("le-connection-abort-by-local".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "failed to connect to FB:EC:25:DE:1A:92: le-connection-abort-by-local"
        );

        let err: Error = DecodeError::Length { expected: 6, actual: 4 }.into();
        assert_eq!(err.to_string(), "expected 6 bytes, got 4");
    }
}
