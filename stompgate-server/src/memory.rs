//! Process-local reference broker.
//!
//! Queues hand each message to one started subscriber, round-robin, and hold
//! messages while nobody listens. Topics fan out to every subscriber of the
//! destination. Nothing is persisted.

use crate::auth::CredentialValidator;
use crate::broker::{
    AckAddress, AckMode, BrokerConnection, Credentials, DeliveryListener, Destination,
    DestinationFactory, DestinationKind, Message, Subscription, SubscriptionRequest,
};
use crate::config::Config;
use crate::error::BrokerError;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Reference broker settings.
#[derive(Debug, Clone)]
pub struct MemoryBrokerSettings {
    /// Name prefix of broker-assigned temporary queues.
    pub temp_queue_prefix: String,
    /// Name prefix of broker-assigned temporary topics.
    pub temp_topic_prefix: String,
    /// When set, CONNECT credentials must match a configured user.
    pub credentials: Option<CredentialValidator>,
}

impl Default for MemoryBrokerSettings {
    fn default() -> Self {
        Self {
            temp_queue_prefix: "tmp.queue.".to_string(),
            temp_topic_prefix: "tmp.topic.".to_string(),
            credentials: None,
        }
    }
}

impl MemoryBrokerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            temp_queue_prefix: config.broker.temp_queue_prefix.clone(),
            temp_topic_prefix: config.broker.temp_topic_prefix.clone(),
            credentials: CredentialValidator::from_config(&config.auth),
        }
    }
}

/// A subscriber registered with the broker.
struct Consumer {
    connection: u64,
    id: String,
    destination: Destination,
    ack_mode: AckMode,
    no_local: bool,
    durable_name: Option<String>,
    listener: Arc<dyn DeliveryListener>,
    started: bool,
    /// Topic messages published before delivery started.
    held: VecDeque<Message>,
    /// Delivered, awaiting ACK or NACK.
    pending: Vec<Message>,
}

impl Consumer {
    /// Hands a message to the listener, returning it on failure.
    fn deliver(&mut self, message: Message) -> Result<(), Message> {
        match self.listener.deliver(&self.id, self.ack_mode, &message) {
            Ok(()) => {
                if self.ack_mode.needs_ack() {
                    self.pending.push(message);
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    "[conn-{}] delivery to {} failed: {}",
                    self.connection,
                    self.id,
                    e
                );
                Err(message)
            }
        }
    }
}

/// A durable topic subscription, kept across detach.
struct DurableEntry {
    destination: Destination,
    /// Connection currently attached, if any.
    attached: Option<u64>,
    no_local_connection: Option<u64>,
    backlog: VecDeque<Message>,
}

#[derive(Default)]
struct BrokerState {
    /// Consumers in creation order.
    consumers: Vec<Consumer>,
    /// Queue messages waiting for a started consumer.
    backlog: HashMap<Destination, VecDeque<Message>>,
    /// Round-robin position per queue.
    cursors: HashMap<Destination, usize>,
    durables: HashMap<String, DurableEntry>,
}

impl BrokerState {
    fn position(&self, connection: u64, id: &str) -> Option<usize> {
        self.consumers
            .iter()
            .position(|c| c.connection == connection && c.id == id)
    }

    fn active(&self, destination: &Destination) -> Vec<usize> {
        self.consumers
            .iter()
            .enumerate()
            .filter(|(_, c)| c.started && c.destination == *destination)
            .map(|(i, _)| i)
            .collect()
    }

    fn route(&mut self, message: Message, sender: u64) {
        let now = chrono::Utc::now().timestamp_millis();
        if message.expires != 0 && message.expires <= now {
            tracing::debug!("dropping expired message {:?}", message.id);
            return;
        }
        match message.destination.kind() {
            DestinationKind::Queue => {
                if let Err(message) = self.deliver_queue(message) {
                    self.backlog
                        .entry(message.destination.clone())
                        .or_default()
                        .push_back(message);
                }
            }
            DestinationKind::Topic => self.publish(message, sender),
        }
    }

    /// Delivers to the next started consumer of the queue.
    fn deliver_queue(&mut self, message: Message) -> Result<(), Message> {
        let active = self.active(&message.destination);
        if active.is_empty() {
            return Err(message);
        }
        let cursor = self
            .cursors
            .entry(message.destination.clone())
            .or_insert(0);
        let index = active[*cursor % active.len()];
        *cursor = cursor.wrapping_add(1);
        self.consumers[index].deliver(message)
    }

    /// Moves backlog messages to started consumers until none is left.
    fn flush_queue(&mut self, destination: &Destination) {
        loop {
            let Some(message) = self
                .backlog
                .get_mut(destination)
                .and_then(VecDeque::pop_front)
            else {
                break;
            };
            if let Err(message) = self.deliver_queue(message) {
                if let Some(backlog) = self.backlog.get_mut(destination) {
                    backlog.push_front(message);
                }
                break;
            }
        }
    }

    fn publish(&mut self, message: Message, sender: u64) {
        for consumer in self.consumers.iter_mut().filter(|c| {
            c.destination == message.destination && !(c.no_local && c.connection == sender)
        }) {
            if consumer.started {
                // Topic deliveries that fail are dropped.
                let _ = consumer.deliver(message.clone());
            } else {
                consumer.held.push_back(message.clone());
            }
        }
        for entry in self.durables.values_mut().filter(|e| {
            e.attached.is_none()
                && e.destination == message.destination
                && e.no_local_connection != Some(sender)
        }) {
            entry.backlog.push_back(message.clone());
        }
    }

    /// Removes a consumer, returning its undelivered and unacknowledged
    /// messages to where they came from.
    fn remove(&mut self, index: usize, drop_durable: bool) -> Consumer {
        let mut consumer = self.consumers.remove(index);
        let mut unfinished: VecDeque<Message> = consumer
            .pending
            .drain(..)
            .map(|mut m| {
                m.redelivered = true;
                m
            })
            .collect();
        unfinished.extend(consumer.held.drain(..));

        if let Some(name) = &consumer.durable_name {
            if drop_durable {
                self.durables.remove(name);
            } else if let Some(entry) = self.durables.get_mut(name) {
                entry.attached = None;
                unfinished.append(&mut entry.backlog);
                entry.backlog = unfinished;
            }
            return consumer;
        }

        if consumer.destination.is_queue() && !unfinished.is_empty() {
            let backlog = self
                .backlog
                .entry(consumer.destination.clone())
                .or_default();
            while let Some(message) = unfinished.pop_back() {
                backlog.push_front(message);
            }
            let destination = consumer.destination.clone();
            self.flush_queue(&destination);
        }
        consumer
    }

    fn acknowledge(
        &mut self,
        connection: u64,
        address: &AckAddress,
        negative: bool,
    ) -> Result<(), BrokerError> {
        let message_id = address.message_id();
        let (label, exact) = match address {
            AckAddress::Prefix { prefix, .. } => (prefix.as_str(), false),
            AckAddress::Subscription {
                subscription_id, ..
            } => (subscription_id.as_str(), true),
        };
        if exact && self.position(connection, label).is_none() {
            return Err(BrokerError::SubscriptionNotFound(label.to_string()));
        }

        let candidates = self.consumers.iter_mut().filter(|c| {
            c.connection == connection
                && if exact {
                    c.id == label
                } else {
                    c.id.starts_with(label)
                }
        });
        for consumer in candidates {
            let Some(pos) = consumer
                .pending
                .iter()
                .position(|m| m.id.as_deref() == Some(message_id))
            else {
                continue;
            };
            let settled = match consumer.ack_mode {
                AckMode::Client => consumer.pending.drain(..=pos).count(),
                _ => {
                    consumer.pending.remove(pos);
                    1
                }
            };
            tracing::debug!(
                "[conn-{}] {} {} message(s) on {} up to {}",
                connection,
                if negative { "rejected" } else { "acknowledged" },
                settled,
                consumer.id,
                message_id
            );
            return Ok(());
        }

        Err(BrokerError::MessageNotFound {
            subscription: label.to_string(),
            message_id: message_id.to_string(),
        })
    }
}

struct BrokerInner {
    settings: MemoryBrokerSettings,
    state: Mutex<BrokerState>,
    next_connection: AtomicU64,
    next_temporary: AtomicU64,
}

/// The shared broker; open one [`MemoryConnection`] per client.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new(settings: MemoryBrokerSettings) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                settings,
                state: Mutex::new(BrokerState::default()),
                next_connection: AtomicU64::new(1),
                next_temporary: AtomicU64::new(1),
            }),
        }
    }

    pub fn open_connection(&self) -> Arc<MemoryConnection> {
        let id = self.inner.next_connection.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("[conn-{}] opened", id);
        Arc::new(MemoryConnection {
            broker: self.inner.clone(),
            id,
            session: Mutex::new(SessionState::default()),
        })
    }

    /// Number of registered subscribers across all connections.
    pub fn consumer_count(&self) -> usize {
        self.inner.state.lock().consumers.len()
    }

    /// Number of queue messages waiting for a subscriber.
    pub fn backlog_len(&self, destination: &Destination) -> usize {
        self.inner
            .state
            .lock()
            .backlog
            .get(destination)
            .map_or(0, VecDeque::len)
    }

    pub fn durable_count(&self) -> usize {
        self.inner.state.lock().durables.len()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(MemoryBrokerSettings::default())
    }
}

enum TransactedOp {
    Send(Message),
    Ack { address: AckAddress, negative: bool },
}

#[derive(Default)]
struct SessionState {
    session_id: Option<String>,
    closed: bool,
    transactions: HashMap<String, Vec<TransactedOp>>,
}

/// One client's connection to the [`MemoryBroker`].
pub struct MemoryConnection {
    broker: Arc<BrokerInner>,
    id: u64,
    session: Mutex<SessionState>,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn check_open(&self) -> Result<(), BrokerError> {
        let session = self.session.lock();
        if session.closed {
            return Err(BrokerError::Closed);
        }
        if session.session_id.is_none() {
            return Err(BrokerError::NotConnected);
        }
        Ok(())
    }

    /// Buffers `op` when a transaction is named, returning it otherwise.
    fn enlist(
        &self,
        transaction: Option<&str>,
        op: TransactedOp,
    ) -> Result<Option<TransactedOp>, BrokerError> {
        let Some(tx) = transaction else {
            return Ok(Some(op));
        };
        let mut session = self.session.lock();
        let ops = session
            .transactions
            .get_mut(tx)
            .ok_or_else(|| BrokerError::TransactionNotFound(tx.to_string()))?;
        ops.push(op);
        Ok(None)
    }

    fn apply(&self, op: TransactedOp) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        match op {
            TransactedOp::Send(message) => {
                state.route(message, self.id);
                Ok(())
            }
            TransactedOp::Ack { address, negative } => {
                state.acknowledge(self.id, &address, negative)
            }
        }
    }

    fn temporary_name(&self, kind: DestinationKind) -> String {
        let n = self.broker.next_temporary.fetch_add(1, Ordering::Relaxed);
        format!("{}{}.{}", self.temporary_prefix(kind), self.id, n)
    }
}

impl BrokerConnection for MemoryConnection {
    fn connect(&self, credentials: &Credentials) -> Result<String, BrokerError> {
        if let Some(validator) = &self.broker.settings.credentials {
            if !validator.validate(&credentials.login, &credentials.passcode) {
                return Err(BrokerError::AuthenticationFailed(credentials.login.clone()));
            }
        }

        let mut session = self.session.lock();
        if session.closed {
            return Err(BrokerError::Closed);
        }
        let session_id = session
            .session_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        tracing::debug!(
            "[conn-{}] session {} for login '{}'",
            self.id,
            session_id,
            credentials.login
        );
        Ok(session_id)
    }

    fn disconnect(&self, graceful: bool) -> Result<(), BrokerError> {
        let aborted = {
            let mut session = self.session.lock();
            if session.closed {
                return Ok(());
            }
            session.closed = true;
            std::mem::take(&mut session.transactions).len()
        };

        let mut state = self.broker.state.lock();
        while let Some(index) = state.consumers.iter().position(|c| c.connection == self.id) {
            state.remove(index, false);
        }
        tracing::debug!(
            "[conn-{}] closed (graceful={}, {} open transaction(s) discarded)",
            self.id,
            graceful,
            aborted
        );
        Ok(())
    }

    fn send(&self, mut message: Message, transaction: Option<&str>) -> Result<(), BrokerError> {
        self.check_open()?;
        message.id = Some(format!("ID:{}", Uuid::new_v4().simple()));
        message.timestamp = chrono::Utc::now().timestamp_millis();

        match self.enlist(transaction, TransactedOp::Send(message))? {
            Some(op) => self.apply(op),
            None => Ok(()),
        }
    }

    fn create_subscriber(
        &self,
        request: SubscriptionRequest,
        listener: Arc<dyn DeliveryListener>,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        self.check_open()?;
        if let Some(selector) = &request.selector {
            tracing::debug!(
                "[conn-{}] selector '{}' on {} is not evaluated",
                self.id,
                selector,
                request.id
            );
        }

        let mut state = self.broker.state.lock();
        if state.position(self.id, &request.id).is_some() {
            return Err(BrokerError::SubscriptionExists(request.id));
        }

        let mut held = VecDeque::new();
        if let Some(name) = &request.durable_name {
            let entry = state
                .durables
                .entry(name.clone())
                .or_insert_with(|| DurableEntry {
                    destination: request.destination.clone(),
                    attached: None,
                    no_local_connection: None,
                    backlog: VecDeque::new(),
                });
            if entry.attached.is_some() {
                return Err(BrokerError::DurableSubscriptionActive(name.clone()));
            }
            if entry.destination != request.destination {
                entry.destination = request.destination.clone();
                entry.backlog.clear();
            }
            entry.attached = Some(self.id);
            entry.no_local_connection = request.no_local.then_some(self.id);
            held = std::mem::take(&mut entry.backlog);
        }

        state.consumers.push(Consumer {
            connection: self.id,
            id: request.id.clone(),
            destination: request.destination,
            ack_mode: request.ack_mode,
            no_local: request.no_local,
            durable_name: request.durable_name,
            listener,
            started: false,
            held,
            pending: Vec::new(),
        });

        Ok(Box::new(MemorySubscription {
            broker: self.broker.clone(),
            connection: self.id,
            id: request.id,
        }))
    }

    fn close_subscriber(
        &self,
        id: Option<&str>,
        durable_name: Option<&str>,
    ) -> Result<Option<String>, BrokerError> {
        let mut state = self.broker.state.lock();

        if let Some(id) = id {
            let index = state
                .position(self.id, id)
                .ok_or_else(|| BrokerError::SubscriptionNotFound(id.to_string()))?;
            let drop_durable = durable_name.is_some();
            state.remove(index, drop_durable);
            return Ok(Some(id.to_string()));
        }

        let Some(name) = durable_name else {
            return Ok(None);
        };
        let attached = state.consumers.iter().position(|c| {
            c.connection == self.id && c.durable_name.as_deref() == Some(name)
        });
        match attached {
            Some(index) => Ok(Some(state.remove(index, true).id)),
            None if state.durables.remove(name).is_some() => Ok(None),
            None => Err(BrokerError::SubscriptionNotFound(name.to_string())),
        }
    }

    fn acknowledge(
        &self,
        address: &AckAddress,
        transaction: Option<&str>,
        negative: bool,
    ) -> Result<(), BrokerError> {
        self.check_open()?;
        let op = TransactedOp::Ack {
            address: address.clone(),
            negative,
        };
        match self.enlist(transaction, op)? {
            Some(op) => self.apply(op),
            None => Ok(()),
        }
    }

    fn begin_transaction(&self, id: &str) -> Result<(), BrokerError> {
        self.check_open()?;
        let mut session = self.session.lock();
        if session.transactions.contains_key(id) {
            return Err(BrokerError::TransactionExists(id.to_string()));
        }
        session.transactions.insert(id.to_string(), Vec::new());
        Ok(())
    }

    fn commit_transaction(&self, id: &str) -> Result<(), BrokerError> {
        self.check_open()?;
        let ops = self
            .session
            .lock()
            .transactions
            .remove(id)
            .ok_or_else(|| BrokerError::TransactionNotFound(id.to_string()))?;
        tracing::debug!("[conn-{}] committing {} with {} op(s)", self.id, id, ops.len());
        for op in ops {
            self.apply(op)?;
        }
        Ok(())
    }

    fn abort_transaction(&self, id: &str) -> Result<(), BrokerError> {
        self.check_open()?;
        let ops = self
            .session
            .lock()
            .transactions
            .remove(id)
            .ok_or_else(|| BrokerError::TransactionNotFound(id.to_string()))?;
        tracing::debug!("[conn-{}] aborted {}, discarding {} op(s)", self.id, id, ops.len());
        Ok(())
    }
}

impl DestinationFactory for MemoryConnection {
    fn create_destination(
        &self,
        name: &str,
        kind: DestinationKind,
    ) -> Result<Destination, BrokerError> {
        if name.is_empty() {
            return Err(BrokerError::InvalidDestination(name.to_string()));
        }
        Ok(Destination::new(name, kind))
    }

    fn create_temporary_destination(
        &self,
        kind: DestinationKind,
    ) -> Result<Destination, BrokerError> {
        Ok(Destination::temporary(self.temporary_name(kind), kind))
    }

    fn temporary_prefix(&self, kind: DestinationKind) -> &str {
        match kind {
            DestinationKind::Queue => &self.broker.settings.temp_queue_prefix,
            DestinationKind::Topic => &self.broker.settings.temp_topic_prefix,
        }
    }
}

struct MemorySubscription {
    broker: Arc<BrokerInner>,
    connection: u64,
    id: String,
}

impl Subscription for MemorySubscription {
    fn id(&self) -> &str {
        &self.id
    }

    fn start_delivery(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        let index = state
            .position(self.connection, &self.id)
            .ok_or_else(|| BrokerError::SubscriptionNotFound(self.id.clone()))?;

        let consumer = &mut state.consumers[index];
        consumer.started = true;
        while let Some(message) = consumer.held.pop_front() {
            if let Err(message) = consumer.deliver(message) {
                consumer.held.push_front(message);
                return Err(BrokerError::Delivery(format!(
                    "listener of {} refused a held message",
                    self.id
                )));
            }
        }

        if consumer.destination.is_queue() {
            let destination = consumer.destination.clone();
            state.flush_queue(&destination);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MessageBody;

    #[derive(Default)]
    struct Inbox {
        received: Mutex<Vec<(String, Message)>>,
    }

    impl Inbox {
        fn ids(&self) -> Vec<String> {
            self.received
                .lock()
                .iter()
                .map(|(sub, m)| format!("{}:{}", sub, m.body_text()))
                .collect()
        }

        fn message_ids(&self) -> Vec<String> {
            self.received
                .lock()
                .iter()
                .filter_map(|(_, m)| m.id.clone())
                .collect()
        }
    }

    impl DeliveryListener for Inbox {
        fn deliver(
            &self,
            subscription_id: &str,
            _ack_mode: AckMode,
            message: &Message,
        ) -> Result<(), BrokerError> {
            self.received
                .lock()
                .push((subscription_id.to_string(), message.clone()));
            Ok(())
        }
    }

    trait BodyText {
        fn body_text(&self) -> String;
    }

    impl BodyText for Message {
        fn body_text(&self) -> String {
            String::from_utf8_lossy(&self.body.to_bytes()).into_owned()
        }
    }

    fn queue(name: &str) -> Destination {
        Destination::new(name, DestinationKind::Queue)
    }

    fn topic(name: &str) -> Destination {
        Destination::new(name, DestinationKind::Topic)
    }

    fn text(destination: &Destination, body: &str) -> Message {
        Message::new(destination.clone(), MessageBody::Text(body.to_string()))
    }

    fn connected(broker: &MemoryBroker) -> Arc<MemoryConnection> {
        let connection = broker.open_connection();
        connection.connect(&Credentials::default()).unwrap();
        connection
    }

    fn request(id: &str, destination: &Destination, ack_mode: AckMode) -> SubscriptionRequest {
        SubscriptionRequest {
            id: id.to_string(),
            destination: destination.clone(),
            ack_mode,
            selector: None,
            durable_name: None,
            no_local: false,
            transaction: None,
        }
    }

    fn subscribe(
        connection: &MemoryConnection,
        request: SubscriptionRequest,
        inbox: &Arc<Inbox>,
    ) -> Box<dyn Subscription> {
        let subscription = connection.create_subscriber(request, inbox.clone()).unwrap();
        subscription.start_delivery().unwrap();
        subscription
    }

    #[test]
    fn test_requires_connect() {
        let broker = MemoryBroker::default();
        let connection = broker.open_connection();
        let err = connection.send(text(&queue("q"), "x"), None).unwrap_err();
        assert_eq!(err, BrokerError::NotConnected);
    }

    #[test]
    fn test_authentication() {
        let validator = CredentialValidator::new([(
            "admin".to_string(),
            CredentialValidator::hash_passcode("s3cret"),
        )]);
        let broker = MemoryBroker::new(MemoryBrokerSettings {
            credentials: Some(validator),
            ..MemoryBrokerSettings::default()
        });

        let connection = broker.open_connection();
        let wrong = Credentials {
            login: "admin".to_string(),
            passcode: "nope".to_string(),
            client_id: None,
        };
        assert_eq!(
            connection.connect(&wrong),
            Err(BrokerError::AuthenticationFailed("admin".to_string()))
        );

        let right = Credentials {
            passcode: "s3cret".to_string(),
            ..wrong
        };
        let session = connection.connect(&right).unwrap();
        assert_eq!(connection.connect(&right).unwrap(), session);
    }

    #[test]
    fn test_queue_holds_until_subscriber_starts() {
        let broker = MemoryBroker::default();
        let producer = connected(&broker);
        let q = queue("orders");
        producer.send(text(&q, "a"), None).unwrap();
        producer.send(text(&q, "b"), None).unwrap();
        assert_eq!(broker.backlog_len(&q), 2);

        let consumer = connected(&broker);
        let inbox = Arc::new(Inbox::default());
        let subscription = consumer
            .create_subscriber(request("s", &q, AckMode::Auto), inbox.clone())
            .unwrap();
        assert!(inbox.ids().is_empty());

        subscription.start_delivery().unwrap();
        assert_eq!(inbox.ids(), vec!["s:a", "s:b"]);
        assert_eq!(broker.backlog_len(&q), 0);
    }

    #[test]
    fn test_queue_round_robin() {
        let broker = MemoryBroker::default();
        let connection = connected(&broker);
        let q = queue("work");
        let inbox = Arc::new(Inbox::default());
        let _a = subscribe(&connection, request("a", &q, AckMode::Auto), &inbox);
        let _b = subscribe(&connection, request("b", &q, AckMode::Auto), &inbox);

        for body in ["1", "2", "3", "4"] {
            connection.send(text(&q, body), None).unwrap();
        }
        assert_eq!(inbox.ids(), vec!["a:1", "b:2", "a:3", "b:4"]);
    }

    #[test]
    fn test_topic_fan_out_and_no_local() {
        let broker = MemoryBroker::default();
        let publisher = connected(&broker);
        let other = connected(&broker);
        let t = topic("prices");
        let inbox = Arc::new(Inbox::default());

        let mut local = request("local", &t, AckMode::Auto);
        local.no_local = true;
        let _l = subscribe(&publisher, local, &inbox);
        let _r = subscribe(&other, request("remote", &t, AckMode::Auto), &inbox);

        publisher.send(text(&t, "p"), None).unwrap();
        other.send(text(&t, "o"), None).unwrap();
        assert_eq!(inbox.ids(), vec!["remote:p", "local:o", "remote:o"]);

        // Nobody subscribed: dropped.
        publisher.send(text(&topic("empty"), "x"), None).unwrap();
        assert_eq!(inbox.ids().len(), 3);
    }

    #[test]
    fn test_message_ids_and_timestamps_assigned() {
        let broker = MemoryBroker::default();
        let connection = connected(&broker);
        let q = queue("q");
        let inbox = Arc::new(Inbox::default());
        let _s = subscribe(&connection, request("s", &q, AckMode::Auto), &inbox);

        connection.send(text(&q, "x"), None).unwrap();
        let received = inbox.received.lock();
        let message = &received[0].1;
        assert!(message.id.as_deref().unwrap().starts_with("ID:"));
        assert!(message.timestamp > 0);
    }

    #[test]
    fn test_expired_messages_dropped() {
        let broker = MemoryBroker::default();
        let connection = connected(&broker);
        let q = queue("q");
        let mut message = text(&q, "old");
        message.expires = 1;
        connection.send(message, None).unwrap();
        assert_eq!(broker.backlog_len(&q), 0);
    }

    #[test]
    fn test_cumulative_client_ack() {
        let broker = MemoryBroker::default();
        let connection = connected(&broker);
        let q = queue("q");
        let inbox = Arc::new(Inbox::default());
        let _s = subscribe(&connection, request("s", &q, AckMode::Client), &inbox);
        for body in ["1", "2", "3"] {
            connection.send(text(&q, body), None).unwrap();
        }
        let ids = inbox.message_ids();

        let second = AckAddress::Subscription {
            subscription_id: "s".to_string(),
            message_id: ids[1].clone(),
        };
        connection.acknowledge(&second, None, false).unwrap();

        // The first was settled by the cumulative ACK.
        let first = AckAddress::Subscription {
            subscription_id: "s".to_string(),
            message_id: ids[0].clone(),
        };
        assert!(matches!(
            connection.acknowledge(&first, None, false),
            Err(BrokerError::MessageNotFound { .. })
        ));

        let third = AckAddress::Prefix {
            prefix: "s".to_string(),
            message_id: ids[2].clone(),
        };
        connection.acknowledge(&third, None, true).unwrap();
    }

    #[test]
    fn test_individual_ack() {
        let broker = MemoryBroker::default();
        let connection = connected(&broker);
        let q = queue("q");
        let inbox = Arc::new(Inbox::default());
        let _s = subscribe(&connection, request("s", &q, AckMode::ClientIndividual), &inbox);
        connection.send(text(&q, "1"), None).unwrap();
        connection.send(text(&q, "2"), None).unwrap();
        let ids = inbox.message_ids();

        let address = |id: &str| AckAddress::Subscription {
            subscription_id: "s".to_string(),
            message_id: id.to_string(),
        };
        connection.acknowledge(&address(&ids[1]), None, false).unwrap();
        connection.acknowledge(&address(&ids[0]), None, false).unwrap();

        assert_eq!(
            connection.acknowledge(&address(&ids[0]), None, false),
            Err(BrokerError::MessageNotFound {
                subscription: "s".to_string(),
                message_id: ids[0].clone(),
            })
        );
        assert_eq!(
            connection.acknowledge(
                &AckAddress::Subscription {
                    subscription_id: "nope".to_string(),
                    message_id: ids[0].clone(),
                },
                None,
                false
            ),
            Err(BrokerError::SubscriptionNotFound("nope".to_string()))
        );
    }

    #[test]
    fn test_transactions_buffer_until_commit() {
        let broker = MemoryBroker::default();
        let connection = connected(&broker);
        let q = queue("q");

        assert_eq!(
            connection.send(text(&q, "x"), Some("tx")),
            Err(BrokerError::TransactionNotFound("tx".to_string()))
        );

        connection.begin_transaction("tx").unwrap();
        assert_eq!(
            connection.begin_transaction("tx"),
            Err(BrokerError::TransactionExists("tx".to_string()))
        );
        connection.send(text(&q, "1"), Some("tx")).unwrap();
        connection.send(text(&q, "2"), Some("tx")).unwrap();
        assert_eq!(broker.backlog_len(&q), 0);

        connection.commit_transaction("tx").unwrap();
        assert_eq!(broker.backlog_len(&q), 2);

        connection.begin_transaction("tx").unwrap();
        connection.send(text(&q, "3"), Some("tx")).unwrap();
        connection.abort_transaction("tx").unwrap();
        assert_eq!(broker.backlog_len(&q), 2);
        assert!(connection.commit_transaction("tx").is_err());
    }

    #[test]
    fn test_disconnect_requeues_unacknowledged() {
        let broker = MemoryBroker::default();
        let producer = connected(&broker);
        let consumer = connected(&broker);
        let q = queue("q");
        let inbox = Arc::new(Inbox::default());
        let _s = subscribe(&consumer, request("s", &q, AckMode::Client), &inbox);
        producer.send(text(&q, "1"), None).unwrap();
        assert_eq!(broker.backlog_len(&q), 0);

        consumer.disconnect(false).unwrap();
        consumer.disconnect(false).unwrap();
        assert_eq!(broker.consumer_count(), 0);
        assert_eq!(broker.backlog_len(&q), 1);
        assert_eq!(consumer.send(text(&q, "x"), None), Err(BrokerError::Closed));

        let late = connected(&broker);
        let late_inbox = Arc::new(Inbox::default());
        let _l = subscribe(&late, request("l", &q, AckMode::Auto), &late_inbox);
        let received = late_inbox.received.lock();
        assert_eq!(received.len(), 1);
        assert!(received[0].1.redelivered);
    }

    #[test]
    fn test_durable_subscription_keeps_messages_while_detached() {
        let broker = MemoryBroker::default();
        let publisher = connected(&broker);
        let t = topic("audit");
        let inbox = Arc::new(Inbox::default());

        let first = connected(&broker);
        let mut durable = request("d", &t, AckMode::Auto);
        durable.durable_name = Some("audit-log".to_string());
        let _d = subscribe(&first, durable.clone(), &inbox);

        let second = connected(&broker);
        assert!(matches!(
            second.create_subscriber(durable.clone(), inbox.clone()),
            Err(BrokerError::DurableSubscriptionActive(_))
        ));

        first.disconnect(true).unwrap();
        publisher.send(text(&t, "while-away"), None).unwrap();
        assert_eq!(broker.durable_count(), 1);

        let _again = subscribe(&second, durable, &inbox);
        assert_eq!(inbox.ids(), vec!["d:while-away"]);

        let resolved = second.close_subscriber(None, Some("audit-log")).unwrap();
        assert_eq!(resolved.as_deref(), Some("d"));
        assert_eq!(broker.durable_count(), 0);
        assert!(second.close_subscriber(None, Some("audit-log")).is_err());
    }

    #[test]
    fn test_close_subscriber_by_id() {
        let broker = MemoryBroker::default();
        let connection = connected(&broker);
        let inbox = Arc::new(Inbox::default());
        let _s = subscribe(&connection, request("s", &queue("q"), AckMode::Auto), &inbox);

        assert_eq!(
            connection.close_subscriber(Some("s"), None).unwrap().as_deref(),
            Some("s")
        );
        assert_eq!(
            connection.close_subscriber(Some("s"), None),
            Err(BrokerError::SubscriptionNotFound("s".to_string()))
        );
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        assert!(MemoryBrokerSettings::from_config(&config).credentials.is_none());

        config.auth.required = true;
        config.broker.temp_queue_prefix = "q.".to_string();
        let settings = MemoryBrokerSettings::from_config(&config);
        assert!(settings.credentials.is_some());
        assert_eq!(settings.temp_queue_prefix, "q.");
    }

    #[test]
    fn test_temporary_destinations() {
        let broker = MemoryBroker::default();
        let connection = connected(&broker);
        let temp = connection
            .create_temporary_destination(DestinationKind::Queue)
            .unwrap();
        assert!(temp.is_temporary());
        assert!(temp.name().starts_with("tmp.queue."));
        assert_eq!(connection.temporary_prefix(DestinationKind::Topic), "tmp.topic.");

        let other = connection
            .create_temporary_destination(DestinationKind::Queue)
            .unwrap();
        assert_ne!(temp, other);
        assert!(connection
            .create_destination("", DestinationKind::Queue)
            .is_err());
    }
}
