//! Frame parse errors.

use thiserror::Error;

/// Errors raised while parsing a frame from the byte stream.
///
/// Fatal errors abort parsing and leave the stream unusable. Everything else
/// is recoverable: the first one is recorded on the frame and parsing
/// continues on a best-effort basis.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("line exceeds maximum length of {max} bytes")]
    LineTooLong { max: usize },

    #[error("frame exceeds maximum of {max} headers")]
    TooManyHeaders { max: usize },

    #[error("unknown STOMP command: {0}")]
    UnknownCommand(String),

    #[error("invalid header line, no ':' separator: {0}")]
    InvalidHeader(String),

    #[error("header '{header}' not specified for {command}")]
    MissingHeader {
        header: &'static str,
        command: &'static str,
    },

    #[error("invalid value '{value}' for header '{header}'")]
    InvalidHeaderValue { header: &'static str, value: String },

    #[error("missing NULL terminator after body (content-length {content_length})")]
    MissingTerminator { content_length: usize },
}

impl ParseError {
    /// Returns whether the connection can no longer be parsed after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ParseError::LineTooLong { .. } | ParseError::TooManyHeaders { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ParseError::LineTooLong { max: 1024 }.is_fatal());
        assert!(ParseError::TooManyHeaders { max: 1000 }.is_fatal());

        assert!(!ParseError::UnknownCommand("FOO".to_string()).is_fatal());
        assert!(!ParseError::InvalidHeader("bogus".to_string()).is_fatal());
        assert!(!ParseError::MissingHeader {
            header: "destination",
            command: "SEND"
        }
        .is_fatal());
        assert!(!ParseError::InvalidHeaderValue {
            header: "content-length",
            value: "abc".to_string()
        }
        .is_fatal());
        assert!(!ParseError::MissingTerminator { content_length: 5 }.is_fatal());
    }

    #[test]
    fn test_parse_error_display() {
        let err = ParseError::LineTooLong { max: 1024 };
        assert!(err.to_string().contains("1024"));

        let err = ParseError::UnknownCommand("FROB".to_string());
        assert!(err.to_string().contains("FROB"));

        let err = ParseError::MissingHeader {
            header: "passcode",
            command: "CONNECT",
        };
        let msg = err.to_string();
        assert!(msg.contains("passcode"));
        assert!(msg.contains("CONNECT"));

        let err = ParseError::MissingTerminator { content_length: 42 };
        assert!(err.to_string().contains("42"));
    }
}
