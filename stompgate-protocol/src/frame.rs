//! STOMP frame model.
//!
//! Wire layout:
//!
//! ```text
//! COMMAND<LF>
//! key:value<LF>          (zero or more, insertion order preserved)
//! <LF>
//! body bytes
//! <NUL><LF>
//! ```

use crate::error::ParseError;
use bytes::Bytes;
use std::fmt;

/// Well-known header names.
pub mod header {
    pub const LOGIN: &str = "login";
    pub const PASSCODE: &str = "passcode";
    pub const CLIENT_ID: &str = "client-id";
    pub const ACCEPT_VERSION: &str = "accept-version";
    pub const HEART_BEAT: &str = "heart-beat";

    pub const SESSION: &str = "session";
    pub const VERSION: &str = "version";
    pub const SERVER: &str = "server";

    pub const RECEIPT: &str = "receipt";
    pub const RECEIPT_ID: &str = "receipt-id";
    pub const TRANSACTION: &str = "transaction";
    pub const CONTENT_LENGTH: &str = "content-length";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const MESSAGE: &str = "message";

    pub const DESTINATION: &str = "destination";
    pub const ID: &str = "id";
    pub const ACK: &str = "ack";
    pub const SELECTOR: &str = "selector";
    pub const DURABLE_SUBSCRIBER_NAME: &str = "durable-subscriber-name";
    pub const NO_LOCAL: &str = "no-local";

    pub const SUBSCRIPTION: &str = "subscription";
    pub const MESSAGE_ID: &str = "message-id";

    pub const EXPIRES: &str = "expires";
    pub const PRIORITY: &str = "priority";
    pub const TYPE: &str = "type";
    pub const PERSISTENT: &str = "persistent";
    pub const REPLY_TO: &str = "reply-to";
    pub const CORRELATION_ID: &str = "correlation-id";
    pub const TIMESTAMP: &str = "timestamp";
    pub const REDELIVERED: &str = "redelivered";
}

/// Frame command vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Disconnect,
    Send,
    Subscribe,
    Unsubscribe,
    Begin,
    Commit,
    Abort,
    Ack,
    Nack,
    Message,
    Receipt,
    Error,
    Unknown,
}

/// Command tokens in prefix-match order: a token that is a prefix of another
/// (CONNECT of CONNECTED) comes after it.
const COMMAND_TOKENS: [(&str, Command); 15] = [
    ("CONNECTED", Command::Connected),
    ("RECEIPT", Command::Receipt),
    ("MESSAGE", Command::Message),
    ("ERROR", Command::Error),
    ("CONNECT", Command::Connect),
    ("STOMP", Command::Stomp),
    ("SEND", Command::Send),
    ("SUBSCRIBE", Command::Subscribe),
    ("ACK", Command::Ack),
    ("NACK", Command::Nack),
    ("UNSUBSCRIBE", Command::Unsubscribe),
    ("BEGIN", Command::Begin),
    ("COMMIT", Command::Commit),
    ("ABORT", Command::Abort),
    ("DISCONNECT", Command::Disconnect),
];

impl Command {
    /// Matches a command line against the vocabulary by prefix.
    pub fn match_line(line: &str) -> Option<Command> {
        COMMAND_TOKENS
            .iter()
            .find(|(token, _)| line.starts_with(token))
            .map(|(_, command)| *command)
    }

    /// Returns the wire token.
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Disconnect => "DISCONNECT",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Unknown => "UNKNOWN",
        }
    }

    /// Headers that must be present once the header section has been parsed.
    pub fn required_headers(&self) -> &'static [&'static str] {
        match self {
            Command::Connect | Command::Stomp => &[header::LOGIN, header::PASSCODE],
            Command::Send => &[header::DESTINATION],
            _ => &[],
        }
    }

    /// Returns whether clients may send this command.
    pub fn is_client_command(&self) -> bool {
        !matches!(
            self,
            Command::Connected
                | Command::Message
                | Command::Receipt
                | Command::Error
                | Command::Unknown
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incremental parse progress of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStage {
    Command,
    Header,
    Body,
    Terminator,
    Done,
}

/// Ordered header map with unique keys.
///
/// Re-inserting a key overwrites its value in place; insertion order is
/// otherwise preserved and is the serialization order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites a header, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => Some(std::mem::replace(v, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// A STOMP frame.
///
/// Frames produced by the [`Decoder`](crate::Decoder) are complete
/// ([`ParseStage::Done`]) and handed out by value; outbound frames are built
/// with the by-value builder methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    command: Command,
    headers: Headers,
    body: Bytes,
    content_length: Option<usize>,
    stage: ParseStage,
    fatal: bool,
    parse_error: Option<ParseError>,
}

impl Frame {
    /// Creates a complete frame with no headers and an empty body.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Headers::new(),
            body: Bytes::new(),
            content_length: None,
            stage: ParseStage::Done,
            fatal: false,
            parse_error: None,
        }
    }

    /// Creates an empty frame at the start of header parsing.
    pub(crate) fn parsing(command: Command) -> Self {
        Self {
            stage: ParseStage::Header,
            ..Self::new(command)
        }
    }

    /// Adds or overwrites a header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key, value);
        self
    }

    /// Adds a header only when `value` is present.
    pub fn header_opt(self, key: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(value) => self.header(key, value),
            None => self,
        }
    }

    /// Sets the body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Marks an ERROR frame as fatal: the connection closes after delivery.
    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn get_header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }

    /// Returns the body as UTF-8 text, replacing invalid sequences.
    pub fn body_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Declared content length, if a well-formed `content-length` header was parsed.
    pub fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    pub fn parse_stage(&self) -> ParseStage {
        self.stage
    }

    /// Returns whether this is an ERROR frame after which the connection must close.
    pub fn is_fatal(&self) -> bool {
        self.command == Command::Error && self.fatal
    }

    /// The first recoverable error recorded while parsing this frame.
    pub fn parse_error(&self) -> Option<&ParseError> {
        self.parse_error.as_ref()
    }

    /// Value of the `receipt` header, if the client requested one.
    pub fn receipt(&self) -> Option<&str> {
        self.headers.get(header::RECEIPT)
    }

    pub(crate) fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub(crate) fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }

    pub(crate) fn set_content_length(&mut self, len: Option<usize>) {
        self.content_length = len;
    }

    pub(crate) fn set_stage(&mut self, stage: ParseStage) {
        self.stage = stage;
    }

    /// Records a recoverable error; only the first one is kept.
    pub(crate) fn record_error(&mut self, err: ParseError) {
        if self.parse_error.is_none() {
            tracing::error!("{} frame: {}", self.command, err);
            self.parse_error = Some(err);
        }
    }

    /// Checks the command's required headers, recording the first missing one.
    pub(crate) fn check_required_headers(&mut self) {
        let missing = self
            .command
            .required_headers()
            .iter()
            .copied()
            .find(|key| !self.headers.contains(key));
        if let Some(key) = missing {
            self.record_error(ParseError::MissingHeader {
                header: key,
                command: self.command.as_str(),
            });
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.command)?;
        for (i, (k, v)) in self.headers.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            if k == header::PASSCODE {
                write!(f, "{}=****", k)?;
            } else {
                write!(f, "{}={}", k, v)?;
            }
        }
        f.write_str("]")
    }
}
