use shared::EncodeError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("username is longer than the payload limit")]
    NameTooLong,
    #[error("login timed out after {attempts} tries")]
    HandshakeTimeout { attempts: u32 },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("username {0:?} is already being used")]
    NameConflict(String),
    #[error("lost connection to the server ({seconds}s without a packet)")]
    ServerTimeout { seconds: u64 },
    #[error("receive task failed: {0}")]
    Receiver(io::Error),
    #[error("could not resolve server address {0:?}")]
    Resolve(String),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_failure_is_not_a_protocol_error() {
        let error = ClientError::from(EncodeError::TextTooLong(500));
        assert!(matches!(error, ClientError::Encode(EncodeError::TextTooLong(500))));
        assert_eq!(error.to_string(), EncodeError::TextTooLong(500).to_string());
    }

    #[test]
    fn test_resolve_failure_names_the_host() {
        let error = ClientError::Resolve("chat.invalid".to_string());
        assert_eq!(
            error.to_string(),
            "could not resolve server address \"chat.invalid\""
        );
    }
}
