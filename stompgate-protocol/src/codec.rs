//! Stream parser and serializer for STOMP frames.
//!
//! Parsing is incremental. Each step either completes and advances the
//! frame's [`ParseStage`], or reports that more data is needed without
//! consuming the incomplete line or byte run, so the caller can feed more
//! bytes and call again.

use crate::error::ParseError;
use crate::frame::{header, Command, Frame, ParseStage};
use crate::{END_OF_FRAME, MAX_COMMAND_LEN, MAX_HEADERS, MAX_HEADER_LEN, NEWLINE, NULL_BYTE};
use bytes::{Buf, BufMut, BytesMut};

/// Serializes frames.
pub struct Encoder;

impl Encoder {
    /// Encodes a frame into a new buffer.
    pub fn encode(frame: &Frame) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::encoded_len(frame));
        Self::encode_into(frame, &mut buf);
        buf
    }

    /// Appends the encoded frame to `buf`.
    pub fn encode_into(frame: &Frame, buf: &mut BytesMut) {
        buf.put_slice(frame.command().as_str().as_bytes());
        buf.put_u8(NEWLINE);
        for (key, value) in frame.headers().iter() {
            buf.put_slice(key.as_bytes());
            buf.put_u8(b':');
            buf.put_slice(value.as_bytes());
            buf.put_u8(NEWLINE);
        }
        buf.put_u8(NEWLINE);
        buf.put_slice(frame.body_bytes());
        buf.put_slice(&END_OF_FRAME);
    }

    fn encoded_len(frame: &Frame) -> usize {
        let headers: usize = frame
            .headers()
            .iter()
            .map(|(k, v)| k.len() + v.len() + 2)
            .sum();
        frame.command().as_str().len() + 1 + headers + 1 + frame.body_bytes().len() + 2
    }
}

/// Buffers inbound bytes and decodes frames from them.
///
/// Holds at most one partially parsed frame; its [`ParseStage`] records where
/// parsing resumes when more bytes arrive.
pub struct Decoder {
    buffer: BytesMut,
    frame: Option<Frame>,
    /// Bytes of an unbounded body already searched for the terminator.
    scanned: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            frame: None,
            scanned: 0,
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next frame from the buffer.
    ///
    /// Returns `Ok(Some(frame))` once a frame is complete, `Ok(None)` if more
    /// data is needed, or `Err` on a fatal parse error. Recoverable errors are
    /// recorded on the returned frame instead (see [`Frame::parse_error`]).
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ParseError> {
        match self.advance() {
            Ok(done) => Ok(done),
            Err(e) => {
                self.frame = None;
                self.scanned = 0;
                Err(e)
            }
        }
    }

    fn advance(&mut self) -> Result<Option<Frame>, ParseError> {
        loop {
            let Some(frame) = self.frame.as_mut() else {
                match parse_command(&mut self.buffer)? {
                    Some(frame) => {
                        self.frame = Some(frame);
                        continue;
                    }
                    None => return Ok(None),
                }
            };

            let progressed = match frame.parse_stage() {
                ParseStage::Command | ParseStage::Header => parse_headers(frame, &mut self.buffer)?,
                ParseStage::Body => parse_body(frame, &mut self.buffer, &mut self.scanned),
                ParseStage::Terminator => parse_terminator(frame, &mut self.buffer),
                ParseStage::Done => {
                    self.scanned = 0;
                    return Ok(self.frame.take());
                }
            };
            if !progressed {
                return Ok(None);
            }
        }
    }

    /// Returns the stage of the frame currently being parsed, if any.
    pub fn in_progress(&self) -> Option<ParseStage> {
        self.frame.as_ref().map(Frame::parse_stage)
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer and drops any partial frame.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.frame = None;
        self.scanned = 0;
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads one LF-terminated line, without the terminator.
///
/// Returns `Ok(None)` and consumes nothing if no terminator is buffered yet.
fn read_line(buf: &mut BytesMut, max: usize) -> Result<Option<BytesMut>, ParseError> {
    let window = buf.len().min(max + 1);
    match buf[..window].iter().position(|b| *b == NEWLINE) {
        Some(pos) => {
            let line = buf.split_to(pos);
            buf.advance(1);
            Ok(Some(line))
        }
        None if buf.len() > max => Err(ParseError::LineTooLong { max }),
        None => Ok(None),
    }
}

/// Parses a command line and starts a new frame.
///
/// Blank lines before the command are heart-beats and are skipped. An
/// unrecognized command yields an ERROR frame carrying the parse error.
pub fn parse_command(buf: &mut BytesMut) -> Result<Option<Frame>, ParseError> {
    let line = loop {
        let Some(raw) = read_line(buf, MAX_COMMAND_LEN)? else {
            return Ok(None);
        };
        let line = String::from_utf8_lossy(&raw).into_owned();
        if !line.trim().is_empty() {
            break line;
        }
    };

    let frame = match Command::match_line(&line) {
        Some(command) => Frame::parsing(command),
        None => {
            let mut frame = Frame::parsing(Command::Error);
            frame.record_error(ParseError::UnknownCommand(line.trim().to_string()));
            frame
        }
    };
    tracing::trace!("parsed command line: {}", frame.command());
    Ok(Some(frame))
}

/// Parses header lines until the blank line that ends the header section.
///
/// Returns `Ok(true)` once the frame has moved on to [`ParseStage::Body`].
pub fn parse_headers(frame: &mut Frame, buf: &mut BytesMut) -> Result<bool, ParseError> {
    while let Some(raw) = read_line(buf, MAX_HEADER_LEN)? {
        let line = String::from_utf8_lossy(&raw);
        if line.trim().is_empty() {
            enter_body(frame);
            return Ok(true);
        }

        let (key, value) = match line.find(':') {
            Some(index) => (line[..index].trim(), line[index + 1..].trim()),
            None => {
                frame.record_error(ParseError::InvalidHeader(line.trim().to_string()));
                let cut = line.char_indices().last().map_or(0, |(i, _)| i);
                (line[..cut].trim(), "")
            }
        };
        frame.headers_mut().insert(key, value);

        if frame.headers().len() > MAX_HEADERS {
            return Err(ParseError::TooManyHeaders { max: MAX_HEADERS });
        }
    }
    frame.set_stage(ParseStage::Header);
    Ok(false)
}

fn enter_body(frame: &mut Frame) {
    frame.check_required_headers();

    let declared = frame.get_header(header::CONTENT_LENGTH).map(str::to_string);
    if let Some(value) = declared {
        match value.trim().parse::<usize>() {
            Ok(len) => frame.set_content_length(Some(len)),
            Err(_) => frame.record_error(ParseError::InvalidHeaderValue {
                header: header::CONTENT_LENGTH,
                value,
            }),
        }
    }
    frame.set_stage(ParseStage::Body);
}

/// Reads the body.
///
/// With a declared content length, waits for exactly that many bytes and
/// moves on to the terminator. Otherwise reads up to the NULL byte, then
/// leniently swallows a trailing CR/LF or LF if already buffered.
pub fn parse_body(frame: &mut Frame, buf: &mut BytesMut, scanned: &mut usize) -> bool {
    if let Some(len) = frame.content_length() {
        if buf.len() < len {
            return false;
        }
        frame.set_body(buf.split_to(len).freeze());
        frame.set_stage(ParseStage::Terminator);
        return true;
    }

    let start = (*scanned).min(buf.len());
    let Some(offset) = buf[start..].iter().position(|b| *b == NULL_BYTE) else {
        *scanned = buf.len();
        return false;
    };
    frame.set_body(buf.split_to(start + offset).freeze());
    buf.advance(1);
    *scanned = 0;

    if matches!(buf.first(), Some(b'\n') | Some(b'\r')) {
        buf.advance(1);
    }
    if buf.first() == Some(&NEWLINE) {
        buf.advance(1);
    }
    frame.set_stage(ParseStage::Done);
    true
}

/// Consumes the single NULL byte after a content-length bounded body.
///
/// Any other byte is consumed too and recorded as a recoverable error.
pub fn parse_terminator(frame: &mut Frame, buf: &mut BytesMut) -> bool {
    if buf.is_empty() {
        return false;
    }
    let byte = buf.get_u8();
    if byte != NULL_BYTE {
        let content_length = frame.content_length().unwrap_or_default();
        tracing::warn!(
            "{} frame: expected NULL terminator after {} body bytes, got {:#04x}",
            frame.command(),
            content_length,
            byte
        );
        frame.record_error(ParseError::MissingTerminator { content_length });
    }
    frame.set_stage(ParseStage::Done);
    true
}
