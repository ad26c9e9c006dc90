//! Per-connection command dispatcher.
//!
//! A [`ProtocolHandler`] interprets decoded frames as commands, validates
//! them against the negotiated protocol version, calls the broker and
//! emits RECEIPT, CONNECTED and ERROR frames through the [`FrameSink`].
//! It is the only component that decides whether a connection closes.

use crate::broker::{
    AckAddress, AckMode, BrokerConnection, Credentials, DeliveryListener, DestinationFactory,
    FrameSink, Message, Subscription, SubscriptionRequest,
};
use crate::destination::DestinationResolver;
use crate::error::{BridgeError, BrokerError};
use crate::fault::{FaultInjector, NoFaults};
use crate::message::{self, default_subscription_id, DEFAULT_SUBSCRIPTION_PREFIX};
use crate::session::ConnectionState;
use std::sync::Arc;
use stompgate_protocol::version::join_versions;
use stompgate_protocol::{
    header, negotiate, Command, Frame, ParseError, StompVersion, SUPPORTED_VERSIONS,
};

/// What the transport should do after a frame has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Dispatcher settings shared by all connections.
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    /// Value of the CONNECTED `server` header.
    pub server_name: String,
    /// Versions offered during negotiation.
    pub versions: Vec<StompVersion>,
    /// Report recoverable parse errors with fatal ERROR frames.
    pub close_on_parse_error: bool,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            server_name: format!("stompgate/{}", env!("CARGO_PKG_VERSION")),
            versions: SUPPORTED_VERSIONS.to_vec(),
            close_on_parse_error: false,
        }
    }
}

/// Builds an ERROR frame reporting `err` for the command `origin`.
///
/// The body carries the error and its causes; fatal frames say that the
/// connection will be closed.
pub fn error_frame(origin: &str, err: &BridgeError, fatal: bool) -> Frame {
    let message = format!(
        "{}: {}{}",
        origin,
        err.summary(),
        if fatal { ", connection will be closed" } else { "" }
    );
    let body = err.chain();

    let supported = match err {
        BridgeError::Negotiation(mismatch) => Some(mismatch.supported.clone()),
        _ => None,
    };
    let frame = Frame::new(Command::Error)
        .header(header::MESSAGE, message)
        .header_opt(header::VERSION, supported)
        .header(header::CONTENT_TYPE, "text/plain")
        .header(header::CONTENT_LENGTH, body.len().to_string())
        .body(body.into_bytes());
    if fatal {
        frame.fatal()
    } else {
        frame
    }
}

fn missing(frame: &Frame, key: &'static str) -> BridgeError {
    BridgeError::MissingHeader {
        header: key,
        command: frame.command().as_str(),
    }
}

/// Turns broker deliveries into MESSAGE frames.
pub struct MessageForwarder {
    resolver: Arc<DestinationResolver>,
    sink: Arc<dyn FrameSink>,
}

impl MessageForwarder {
    pub fn new(resolver: Arc<DestinationResolver>, sink: Arc<dyn FrameSink>) -> Self {
        Self { resolver, sink }
    }
}

impl DeliveryListener for MessageForwarder {
    fn deliver(
        &self,
        subscription_id: &str,
        ack_mode: AckMode,
        message: &Message,
    ) -> Result<(), BrokerError> {
        let frame =
            message::to_message_frame(subscription_id, ack_mode.needs_ack(), message, &self.resolver);
        self.sink
            .deliver(frame)
            .map_err(|e| BrokerError::Delivery(e.to_string()))
    }
}

/// Command dispatcher for one client connection.
pub struct ProtocolHandler {
    state: ConnectionState,
    broker: Arc<dyn BrokerConnection>,
    resolver: Arc<DestinationResolver>,
    sink: Arc<dyn FrameSink>,
    forwarder: Arc<dyn DeliveryListener>,
    faults: Arc<dyn FaultInjector>,
    settings: HandlerSettings,
}

impl ProtocolHandler {
    /// Creates a dispatcher; `peer` labels the connection in logs.
    pub fn new(
        peer: impl Into<String>,
        broker: Arc<dyn BrokerConnection>,
        destinations: Arc<dyn DestinationFactory>,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        let resolver = Arc::new(DestinationResolver::new(destinations));
        let forwarder = Arc::new(MessageForwarder::new(resolver.clone(), sink.clone()));
        Self {
            state: ConnectionState::new(peer),
            broker,
            resolver,
            sink,
            forwarder,
            faults: Arc::new(NoFaults),
            settings: HandlerSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: HandlerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_fault_injector(mut self, faults: Arc<dyn FaultInjector>) -> Self {
        self.faults = faults;
        self
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn resolver(&self) -> &DestinationResolver {
        &self.resolver
    }

    /// Handles one decoded frame.
    pub fn handle(&self, frame: Frame) -> Flow {
        self.state.record_frame();
        tracing::debug!("[{}] {}", self.state.peer(), frame);

        if let Some(err) = frame.parse_error() {
            let origin = match err {
                ParseError::UnknownCommand(_) => Command::Unknown.as_str(),
                _ => frame.command().as_str(),
            };
            let fatal = err.is_fatal() || self.settings.close_on_parse_error;
            return self.report(origin, BridgeError::Parse(err.clone()), fatal);
        }

        let command = frame.command();
        let result = match command {
            Command::Connect | Command::Stomp => self.on_connect(&frame),
            Command::Connected
            | Command::Message
            | Command::Receipt
            | Command::Error
            | Command::Unknown => Err(BridgeError::UnknownCommand(command.to_string())),
            _ if !self.state.is_connected() => Err(BridgeError::NotConnected),
            Command::Disconnect => self.on_disconnect(&frame),
            Command::Send => self.on_send(&frame),
            Command::Subscribe => self.on_subscribe(&frame),
            Command::Unsubscribe => self.on_unsubscribe(&frame),
            Command::Begin | Command::Commit | Command::Abort => self.on_transaction(&frame),
            Command::Ack => self.on_ack(&frame, false),
            Command::Nack => self.on_ack(&frame, true),
        };

        match result {
            Ok(()) if command == Command::Disconnect => Flow::Close,
            Ok(()) => Flow::Continue,
            Err(err) if command == Command::Disconnect => {
                let fatal = err.is_fatal();
                self.report(command.as_str(), err, fatal);
                Flow::Close
            }
            Err(err) => {
                let fatal = err.is_fatal();
                self.report(command.as_str(), err, fatal)
            }
        }
    }

    /// Reports a fatal codec error; the connection must close afterwards.
    pub fn handle_parse_failure(&self, err: ParseError) -> Flow {
        self.report("FRAME", BridgeError::Parse(err), true);
        Flow::Close
    }

    /// Logs a failed command and tries to tell the client.
    fn report(&self, origin: &str, err: BridgeError, fatal: bool) -> Flow {
        tracing::error!("[{}] {} failed: {}", self.state.peer(), origin, err.summary());

        let reply = error_frame(origin, &err, fatal);
        if let Err(send_err) = self.sink.deliver(reply) {
            tracing::warn!(
                "[{}] unable to send ERROR frame for '{}': {}",
                self.state.peer(),
                err.summary(),
                send_err
            );
            return Flow::Close;
        }
        if fatal {
            Flow::Close
        } else {
            Flow::Continue
        }
    }

    /// Returns the negotiated version; callers run only once connected.
    fn version(&self) -> StompVersion {
        self.state.version().unwrap_or(StompVersion::OLDEST)
    }

    fn check_fault(&self, command: Command) -> Result<(), BridgeError> {
        match self.faults.before_call(command) {
            Some(err) => Err(BridgeError::Broker(err)),
            None => Ok(()),
        }
    }

    fn send_receipt(&self, frame: &Frame) -> Result<(), BridgeError> {
        if let Some(receipt) = frame.receipt() {
            let reply = Frame::new(Command::Receipt).header(header::RECEIPT_ID, receipt);
            self.sink.deliver(reply)?;
        }
        Ok(())
    }

    fn required<'a>(&self, frame: &'a Frame, key: &'static str) -> Result<&'a str, BridgeError> {
        frame.get_header(key).ok_or_else(|| missing(frame, key))
    }

    fn on_connect(&self, frame: &Frame) -> Result<(), BridgeError> {
        if self.state.is_connected() {
            return Err(BridgeError::AlreadyConnected);
        }
        let version = negotiate(frame.get_header(header::ACCEPT_VERSION), &self.settings.versions)?;

        let credentials = Credentials {
            login: frame.get_header(header::LOGIN).unwrap_or_default().to_string(),
            passcode: frame.get_header(header::PASSCODE).unwrap_or_default().to_string(),
            client_id: frame.get_header(header::CLIENT_ID).map(str::to_string),
        };
        tracing::debug!(
            "[{}] {} login={} version={}",
            self.state.peer(),
            frame.command(),
            credentials.login,
            version
        );

        self.check_fault(frame.command())?;
        let session_id = self.broker.connect(&credentials)?;
        if !self.state.establish(version, session_id.clone()) {
            return Err(BridgeError::AlreadyConnected);
        }

        let reply = Frame::new(Command::Connected)
            .header(header::SESSION, session_id.as_str())
            .header(header::VERSION, version.as_str())
            .header(header::HEART_BEAT, "0,0")
            .header(header::SERVER, self.settings.server_name.as_str())
            .header_opt(header::RECEIPT_ID, frame.receipt());
        self.sink.deliver(reply)?;

        tracing::info!(
            "[{}] connected: session={} version={} (offered {})",
            self.state.peer(),
            session_id,
            version,
            join_versions(&self.settings.versions)
        );
        Ok(())
    }

    fn on_disconnect(&self, frame: &Frame) -> Result<(), BridgeError> {
        self.check_fault(Command::Disconnect)?;
        self.broker.disconnect(true)?;
        self.state.mark_closed();
        self.resolver.clear();
        self.send_receipt(frame)?;
        tracing::info!("[{}] disconnected", self.state.peer());
        Ok(())
    }

    fn on_send(&self, frame: &Frame) -> Result<(), BridgeError> {
        self.required(frame, header::DESTINATION)?;
        let transaction = frame.get_header(header::TRANSACTION);

        let message = message::from_send_frame(frame, &self.resolver)?;
        self.check_fault(Command::Send)?;
        self.broker.send(message, transaction)?;

        self.send_receipt(frame)
    }

    fn on_subscribe(&self, frame: &Frame) -> Result<(), BridgeError> {
        let wire = self.required(frame, header::DESTINATION)?;
        let ack_mode = match frame.get_header(header::ACK) {
            None => AckMode::Auto,
            Some(value) => AckMode::from_header(value).ok_or_else(|| {
                BridgeError::InvalidHeaderValue {
                    header: header::ACK,
                    value: value.to_string(),
                }
            })?,
        };
        let id = match frame.get_header(header::ID) {
            Some(id) => id.to_string(),
            None if self.version() == StompVersion::OLDEST => default_subscription_id(wire),
            None => return Err(missing(frame, header::ID)),
        };

        if !self.state.reserve_subscription(&id) {
            return Err(BridgeError::DuplicateSubscription(id));
        }

        let subscription = match self.create_subscriber(frame, wire, &id, ack_mode) {
            Ok(subscription) => subscription,
            Err(err) => {
                self.state.release_subscription(&id);
                return Err(err);
            }
        };

        let started = self
            .send_receipt(frame)
            .and_then(|_| subscription.start_delivery().map_err(BridgeError::from));
        if let Err(err) = started {
            if let Err(close_err) = self.broker.close_subscriber(Some(&id), None) {
                tracing::debug!(
                    "[{}] unable to close subscriber {} after failure: {}",
                    self.state.peer(),
                    id,
                    close_err
                );
            }
            self.state.release_subscription(&id);
            return Err(err);
        }

        tracing::debug!(
            "[{}] subscribed {} to {} (ack={})",
            self.state.peer(),
            id,
            wire,
            ack_mode.as_str()
        );
        Ok(())
    }

    fn create_subscriber(
        &self,
        frame: &Frame,
        wire: &str,
        id: &str,
        ack_mode: AckMode,
    ) -> Result<Box<dyn Subscription>, BridgeError> {
        let destination = self.resolver.resolve(wire)?;
        let request = SubscriptionRequest {
            id: id.to_string(),
            destination,
            ack_mode,
            selector: frame.get_header(header::SELECTOR).map(str::to_string),
            durable_name: frame
                .get_header(header::DURABLE_SUBSCRIBER_NAME)
                .map(str::to_string),
            no_local: frame
                .get_header(header::NO_LOCAL)
                .is_some_and(|v| v.eq_ignore_ascii_case("true")),
            transaction: frame.get_header(header::TRANSACTION).map(str::to_string),
        };

        self.check_fault(Command::Subscribe)?;
        Ok(self.broker.create_subscriber(request, self.forwarder.clone())?)
    }

    fn on_unsubscribe(&self, frame: &Frame) -> Result<(), BridgeError> {
        let durable_name = frame.get_header(header::DURABLE_SUBSCRIBER_NAME);
        let id = match (frame.get_header(header::ID), durable_name) {
            (Some(id), _) => Some(id.to_string()),
            (None, Some(_)) => None,
            (None, None) if self.version() == StompVersion::OLDEST => {
                let wire = frame
                    .get_header(header::DESTINATION)
                    .ok_or(BridgeError::UnsubscribeTarget)?;
                Some(default_subscription_id(wire))
            }
            (None, None) => return Err(missing(frame, header::ID)),
        };

        self.check_fault(Command::Unsubscribe)?;
        let resolved = self
            .broker
            .close_subscriber(id.as_deref(), durable_name)?;
        if let Some(closed) = id.or(resolved) {
            self.state.release_subscription(&closed);
        }

        self.send_receipt(frame)
    }

    fn on_transaction(&self, frame: &Frame) -> Result<(), BridgeError> {
        let transaction = self.required(frame, header::TRANSACTION)?;
        let command = frame.command();

        self.check_fault(command)?;
        match command {
            Command::Begin => self.broker.begin_transaction(transaction)?,
            Command::Commit => self.broker.commit_transaction(transaction)?,
            _ => self.broker.abort_transaction(transaction)?,
        }
        tracing::debug!("[{}] {} {}", self.state.peer(), command, transaction);

        self.send_receipt(frame)
    }

    fn on_ack(&self, frame: &Frame, negative: bool) -> Result<(), BridgeError> {
        let version = self.version();
        if negative && !version.supports_nack() {
            return Err(BridgeError::UnknownCommand(Command::Nack.to_string()));
        }

        let address = self.ack_address(frame, version)?;
        if let AckAddress::Subscription {
            subscription_id, ..
        } = &address
        {
            if !self.state.has_subscription(subscription_id) {
                return Err(BridgeError::UnknownSubscription(subscription_id.clone()));
            }
        }
        let transaction = frame.get_header(header::TRANSACTION);

        self.check_fault(frame.command())?;
        self.broker.acknowledge(&address, transaction, negative)?;

        self.send_receipt(frame)
    }

    /// Resolves which delivery an ACK or NACK refers to.
    fn ack_address(&self, frame: &Frame, version: StompVersion) -> Result<AckAddress, BridgeError> {
        let message_id = frame.get_header(header::MESSAGE_ID);
        let subscription = frame.get_header(header::SUBSCRIPTION);

        if version.uses_combined_ack_id() {
            let id = self.required(frame, header::ID)?;
            let address =
                AckAddress::from_combined(id).ok_or_else(|| BridgeError::InvalidHeaderValue {
                    header: header::ID,
                    value: id.to_string(),
                })?;
            if subscription.is_some() || message_id.is_some() {
                tracing::warn!(
                    "[{}] {} uses id={}, ignoring subscription={:?} message-id={:?}",
                    self.state.peer(),
                    frame.command(),
                    id,
                    subscription,
                    message_id
                );
            }
            return Ok(address);
        }

        let message_id = self.required(frame, header::MESSAGE_ID)?.to_string();
        match subscription {
            Some(subscription_id) => Ok(AckAddress::Subscription {
                subscription_id: subscription_id.to_string(),
                message_id,
            }),
            None if version == StompVersion::OLDEST => {
                tracing::warn!(
                    "[{}] {} without subscription header, acknowledging {} on {}*",
                    self.state.peer(),
                    frame.command(),
                    message_id,
                    DEFAULT_SUBSCRIPTION_PREFIX
                );
                Ok(AckAddress::Prefix {
                    prefix: DEFAULT_SUBSCRIPTION_PREFIX.to_string(),
                    message_id,
                })
            }
            None => Err(missing(frame, header::SUBSCRIPTION)),
        }
    }

    /// Tears the connection down without a DISCONNECT frame.
    ///
    /// With `detached`, broker teardown is handed to the tokio blocking pool
    /// and never awaited; its failures are only logged. Outside a runtime it
    /// runs inline.
    pub fn close(&self, detached: bool) {
        if !self.state.mark_closed() {
            return;
        }
        self.resolver.clear();

        let broker = self.broker.clone();
        let peer = self.state.peer().to_string();
        let teardown = move || match broker.disconnect(false) {
            Ok(()) => tracing::debug!("[{}] broker connection closed", peer),
            Err(e) => tracing::warn!("[{}] closing broker connection failed: {}", peer, e),
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) if detached => {
                runtime.spawn_blocking(teardown);
            }
            _ => teardown(),
        }
    }
}
