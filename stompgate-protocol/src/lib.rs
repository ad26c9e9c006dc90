//! # stompgate-protocol
//!
//! STOMP wire protocol implementation for stompgate.
//!
//! This crate provides:
//! - The frame model (command, ordered headers, body, parse stage)
//! - An incremental stream parser that resumes across partial buffers
//! - A frame serializer
//! - Protocol revisions and well-known header names

pub mod codec;
pub mod error;
pub mod frame;
pub mod version;

pub use codec::{Decoder, Encoder};
pub use error::ParseError;
pub use frame::{header, Command, Frame, Headers, ParseStage};
pub use version::{negotiate, StompVersion, SUPPORTED_VERSIONS};

/// Default port for the STOMP listener.
pub const DEFAULT_PORT: u16 = 7672;

/// Maximum length of a command line in bytes.
pub const MAX_COMMAND_LEN: usize = 1024;

/// Maximum length of a header line in bytes.
pub const MAX_HEADER_LEN: usize = 10 * 1024;

/// Maximum number of headers in one frame.
pub const MAX_HEADERS: usize = 1000;

/// Body terminator when no content-length is declared.
pub const NULL_BYTE: u8 = 0;

/// Line terminator.
pub const NEWLINE: u8 = b'\n';

/// Bytes written after every serialized body.
pub const END_OF_FRAME: [u8; 2] = [NULL_BYTE, NEWLINE];
