//! Collaborator interfaces consumed by the dispatcher.
//!
//! The broker integration supplies a [`BrokerConnection`] per client
//! connection and a [`DestinationFactory`]; the transport supplies a
//! [`FrameSink`]. Value types crossing these seams live here as well.

use crate::error::{BrokerError, SinkClosed};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use stompgate_protocol::Frame;

/// Whether a destination is point-to-point or publish/subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestinationKind {
    Queue,
    Topic,
}

/// A provider destination handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    name: String,
    kind: DestinationKind,
    temporary: bool,
}

impl Destination {
    pub fn new(name: impl Into<String>, kind: DestinationKind) -> Self {
        Self {
            name: name.into(),
            kind,
            temporary: false,
        }
    }

    pub fn temporary(name: impl Into<String>, kind: DestinationKind) -> Self {
        Self {
            name: name.into(),
            kind,
            temporary: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DestinationKind {
        self.kind
    }

    pub fn is_queue(&self) -> bool {
        self.kind == DestinationKind::Queue
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match (self.kind, self.temporary) {
            (DestinationKind::Queue, false) => "queue",
            (DestinationKind::Topic, false) => "topic",
            (DestinationKind::Queue, true) => "temp-queue",
            (DestinationKind::Topic, true) => "temp-topic",
        };
        write!(f, "{}:{}", kind, self.name)
    }
}

/// Subscription acknowledgement mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    #[default]
    Auto,
    /// Cumulative: acknowledging a message acknowledges all earlier ones.
    Client,
    ClientIndividual,
}

impl AckMode {
    /// Parses an `ack` header value.
    pub fn from_header(value: &str) -> Option<Self> {
        match value {
            "auto" => Some(AckMode::Auto),
            "client" => Some(AckMode::Client),
            "client-individual" => Some(AckMode::ClientIndividual),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::ClientIndividual => "client-individual",
        }
    }

    /// Returns whether deliveries stay pending until the client acknowledges them.
    pub fn needs_ack(&self) -> bool {
        !matches!(self, AckMode::Auto)
    }
}

/// CONNECT credentials.
#[derive(Clone, Default)]
pub struct Credentials {
    pub login: String,
    pub passcode: String,
    pub client_id: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("passcode", &"****")
            .field("client_id", &self.client_id)
            .finish()
    }
}

/// Message payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Text(String),
    Bytes(Bytes),
}

impl MessageBody {
    pub fn to_bytes(&self) -> Bytes {
        match self {
            MessageBody::Text(text) => Bytes::copy_from_slice(text.as_bytes()),
            MessageBody::Bytes(bytes) => bytes.clone(),
        }
    }
}

/// A broker message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Assigned by the broker on send.
    pub id: Option<String>,
    pub destination: Destination,
    pub body: MessageBody,
    pub reply_to: Option<Destination>,
    pub correlation_id: Option<String>,
    pub message_type: Option<String>,
    /// 0 (lowest) to 9.
    pub priority: u8,
    pub persistent: bool,
    /// Expiration time in epoch milliseconds, 0 for never.
    pub expires: i64,
    /// Send time in epoch milliseconds, assigned by the broker.
    pub timestamp: i64,
    pub redelivered: bool,
    /// User properties in header order.
    pub properties: Vec<(String, String)>,
}

impl Message {
    pub const DEFAULT_PRIORITY: u8 = 4;

    pub fn new(destination: Destination, body: MessageBody) -> Self {
        Self {
            id: None,
            destination,
            body,
            reply_to: None,
            correlation_id: None,
            message_type: None,
            priority: Self::DEFAULT_PRIORITY,
            persistent: true,
            expires: 0,
            timestamp: 0,
            redelivered: false,
            properties: Vec::new(),
        }
    }
}

/// Parameters of a SUBSCRIBE.
#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    pub id: String,
    pub destination: Destination,
    pub ack_mode: AckMode,
    pub selector: Option<String>,
    pub durable_name: Option<String>,
    pub no_local: bool,
    pub transaction: Option<String>,
}

/// Which delivered message an ACK or NACK refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckAddress {
    /// Any subscription on the connection whose id starts with `prefix`.
    Prefix { prefix: String, message_id: String },
    Subscription {
        subscription_id: String,
        message_id: String,
    },
}

/// Marks where the message id begins in a combined ack id.
pub const MESSAGE_ID_TOKEN: &str = "ID:";

impl AckAddress {
    /// Splits a combined `id` header at the last `ID:` token.
    ///
    /// The subscription id is everything before the token; the message id is
    /// the token and everything after it.
    pub fn from_combined(id: &str) -> Option<Self> {
        let index = id.rfind(MESSAGE_ID_TOKEN)?;
        Some(AckAddress::Subscription {
            subscription_id: id[..index].to_string(),
            message_id: id[index..].to_string(),
        })
    }

    pub fn message_id(&self) -> &str {
        match self {
            AckAddress::Prefix { message_id, .. } => message_id,
            AckAddress::Subscription { message_id, .. } => message_id,
        }
    }
}

/// Receives messages the broker delivers to a subscription.
pub trait DeliveryListener: Send + Sync {
    fn deliver(
        &self,
        subscription_id: &str,
        ack_mode: AckMode,
        message: &Message,
    ) -> Result<(), BrokerError>;
}

/// A subscription created by the broker.
pub trait Subscription: Send {
    fn id(&self) -> &str;

    /// Starts handing messages to the listener. Nothing is delivered before.
    fn start_delivery(&self) -> Result<(), BrokerError>;
}

/// One client's session with the broker.
///
/// Calls may block on broker I/O; the dispatcher makes them synchronously.
pub trait BrokerConnection: Send + Sync {
    /// Authenticates and returns the broker session id.
    fn connect(&self, credentials: &Credentials) -> Result<String, BrokerError>;

    fn disconnect(&self, graceful: bool) -> Result<(), BrokerError>;

    fn send(&self, message: Message, transaction: Option<&str>) -> Result<(), BrokerError>;

    fn create_subscriber(
        &self,
        request: SubscriptionRequest,
        listener: Arc<dyn DeliveryListener>,
    ) -> Result<Box<dyn Subscription>, BrokerError>;

    /// Closes a subscriber by id or durable name, returning the id it resolved to.
    fn close_subscriber(
        &self,
        id: Option<&str>,
        durable_name: Option<&str>,
    ) -> Result<Option<String>, BrokerError>;

    fn acknowledge(
        &self,
        address: &AckAddress,
        transaction: Option<&str>,
        negative: bool,
    ) -> Result<(), BrokerError>;

    fn begin_transaction(&self, id: &str) -> Result<(), BrokerError>;

    fn commit_transaction(&self, id: &str) -> Result<(), BrokerError>;

    fn abort_transaction(&self, id: &str) -> Result<(), BrokerError>;
}

/// Creates destination handles.
pub trait DestinationFactory: Send + Sync {
    fn create_destination(
        &self,
        name: &str,
        kind: DestinationKind,
    ) -> Result<Destination, BrokerError>;

    fn create_temporary_destination(&self, kind: DestinationKind)
        -> Result<Destination, BrokerError>;

    /// Name prefix of temporary destinations the broker assigns.
    fn temporary_prefix(&self, kind: DestinationKind) -> &str;
}

/// Hands frames to the client's transport.
pub trait FrameSink: Send + Sync {
    fn deliver(&self, frame: Frame) -> Result<(), SinkClosed>;
}
