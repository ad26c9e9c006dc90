//! Conversion between STOMP frames and broker messages.

use crate::broker::{Message, MessageBody};
use crate::destination::DestinationResolver;
use crate::error::BridgeError;
use stompgate_protocol::{header, Command, Frame};

/// Prefix of subscription ids synthesized for 1.0 clients that omit `id`.
pub const DEFAULT_SUBSCRIPTION_PREFIX: &str = "/subscription-to/";

/// Synthesized subscription id for a destination.
pub fn default_subscription_id(destination: &str) -> String {
    format!("{}{}", DEFAULT_SUBSCRIPTION_PREFIX, destination)
}

/// Words reserved by the message selector grammar.
const SELECTOR_KEYWORDS: [&str; 10] = [
    "NULL", "TRUE", "FALSE", "NOT", "AND", "OR", "BETWEEN", "LIKE", "IN", "IS",
];

/// Headers of a SEND frame that never become message properties.
const NON_PROPERTY_HEADERS: [&str; 10] = [
    header::DESTINATION,
    header::CONTENT_LENGTH,
    header::TRANSACTION,
    header::RECEIPT,
    header::PRIORITY,
    header::PERSISTENT,
    header::EXPIRES,
    header::CORRELATION_ID,
    header::TYPE,
    header::REPLY_TO,
];

/// Returns whether `name` can be used as a message property.
///
/// Property names follow the selector identifier rules: not a reserved
/// word, an identifier start character, then identifier characters.
pub fn is_valid_property_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if SELECTOR_KEYWORDS
        .iter()
        .any(|keyword| keyword.eq_ignore_ascii_case(name))
    {
        return false;
    }
    let starts = first.is_alphabetic() || first == '_' || first == '$';
    starts && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

fn parse_header<T: std::str::FromStr>(
    frame: &Frame,
    key: &'static str,
) -> Result<Option<T>, BridgeError> {
    match frame.get_header(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| BridgeError::InvalidHeaderValue {
                header: key,
                value: value.to_string(),
            }),
    }
}

/// Builds the broker message for a SEND frame.
///
/// A declared content length makes a bytes message, otherwise the body is
/// text. Remaining headers become properties; names that are not valid
/// property names are dropped.
pub fn from_send_frame(frame: &Frame, resolver: &DestinationResolver) -> Result<Message, BridgeError> {
    let wire = frame
        .get_header(header::DESTINATION)
        .ok_or(BridgeError::MissingHeader {
            header: header::DESTINATION,
            command: Command::Send.as_str(),
        })?;
    let destination = resolver.resolve(wire)?;

    let body = match frame.content_length() {
        Some(_) => MessageBody::Bytes(frame.body_bytes().clone()),
        None => MessageBody::Text(frame.body_text().into_owned()),
    };
    let mut message = Message::new(destination, body);

    if let Some(priority) = parse_header::<u8>(frame, header::PRIORITY)? {
        if priority > 9 {
            return Err(BridgeError::InvalidHeaderValue {
                header: header::PRIORITY,
                value: priority.to_string(),
            });
        }
        message.priority = priority;
    }
    if let Some(persistent) = frame.get_header(header::PERSISTENT) {
        message.persistent = persistent.trim().eq_ignore_ascii_case("true");
    }
    if let Some(expires) = parse_header::<i64>(frame, header::EXPIRES)? {
        message.expires = expires;
    }
    message.correlation_id = frame.get_header(header::CORRELATION_ID).map(str::to_string);
    message.message_type = frame.get_header(header::TYPE).map(str::to_string);
    message.reply_to = frame
        .get_header(header::REPLY_TO)
        .map(|reply_to| resolver.resolve(reply_to))
        .transpose()?;

    for (key, value) in frame.headers().iter() {
        if NON_PROPERTY_HEADERS.contains(&key) {
            continue;
        }
        if !is_valid_property_name(key) {
            tracing::warn!("dropping header '{}', not a valid message property name", key);
            continue;
        }
        message.properties.push((key.to_string(), value.to_string()));
    }

    Ok(message)
}

/// Builds the MESSAGE frame for a delivery.
///
/// Temporary destinations named in the message are remembered by the
/// resolver so the client can reply to them.
pub fn to_message_frame(
    subscription_id: &str,
    needs_ack: bool,
    message: &Message,
    resolver: &DestinationResolver,
) -> Frame {
    let message_id = message.id.as_deref().unwrap_or_default();
    let body = message.body.to_bytes();

    let mut frame = Frame::new(Command::Message)
        .header(header::SUBSCRIPTION, subscription_id)
        .header(header::DESTINATION, resolver.to_wire_name(&message.destination))
        .header(header::MESSAGE_ID, message_id);
    if needs_ack {
        frame = frame.header(header::ACK, format!("{}{}", subscription_id, message_id));
    }
    frame = frame
        .header_opt(
            header::REPLY_TO,
            message.reply_to.as_ref().map(|d| resolver.to_wire_name(d)),
        )
        .header_opt(header::CORRELATION_ID, message.correlation_id.clone())
        .header(header::EXPIRES, message.expires.to_string())
        .header(header::REDELIVERED, message.redelivered.to_string())
        .header(header::PRIORITY, message.priority.to_string())
        .header(header::TIMESTAMP, message.timestamp.to_string())
        .header_opt(header::TYPE, message.message_type.clone());
    for (key, value) in &message.properties {
        frame = frame.header(key.clone(), value.clone());
    }
    frame
        .header(header::CONTENT_LENGTH, body.len().to_string())
        .body(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Destination, DestinationFactory, DestinationKind};
    use crate::error::BrokerError;
    use std::sync::Arc;
    use stompgate_protocol::Decoder;

    struct PlainFactory;

    impl DestinationFactory for PlainFactory {
        fn create_destination(
            &self,
            name: &str,
            kind: DestinationKind,
        ) -> Result<Destination, BrokerError> {
            Ok(Destination::new(name, kind))
        }

        fn create_temporary_destination(
            &self,
            kind: DestinationKind,
        ) -> Result<Destination, BrokerError> {
            Ok(Destination::temporary("broker.tmp.1", kind))
        }

        fn temporary_prefix(&self, _kind: DestinationKind) -> &str {
            "broker.tmp."
        }
    }

    fn resolver() -> DestinationResolver {
        DestinationResolver::new(Arc::new(PlainFactory))
    }

    fn parsed(bytes: &[u8]) -> Frame {
        let mut decoder = Decoder::new();
        decoder.extend(bytes);
        decoder.decode_frame().unwrap().unwrap()
    }

    #[test]
    fn test_property_names() {
        assert!(is_valid_property_name("orderId"));
        assert!(is_valid_property_name("_hidden"));
        assert!(is_valid_property_name("$money2"));
        assert!(!is_valid_property_name(""));
        assert!(!is_valid_property_name("AND"));
        assert!(!is_valid_property_name("between"));
        assert!(!is_valid_property_name("x-custom"));
        assert!(!is_valid_property_name("9lives"));
    }

    #[test]
    fn test_text_message_from_send() {
        let frame = parsed(
            b"SEND\ndestination:/queue/orders\nreceipt:r1\ntransaction:t1\n\
              priority:7\npersistent:false\nexpires:1000\ncorrelation-id:c-1\n\
              type:order\nreply-to:/topic/replies\norderId:42\nx-trace:abc\n\nhello\0",
        );
        let message = from_send_frame(&frame, &resolver()).unwrap();

        assert_eq!(message.destination, Destination::new("orders", DestinationKind::Queue));
        assert_eq!(message.body, MessageBody::Text("hello".to_string()));
        assert_eq!(message.priority, 7);
        assert!(!message.persistent);
        assert_eq!(message.expires, 1000);
        assert_eq!(message.correlation_id.as_deref(), Some("c-1"));
        assert_eq!(message.message_type.as_deref(), Some("order"));
        assert_eq!(
            message.reply_to,
            Some(Destination::new("replies", DestinationKind::Topic))
        );
        assert_eq!(message.properties, vec![("orderId".to_string(), "42".to_string())]);
    }

    #[test]
    fn test_bytes_message_when_length_declared() {
        let frame = parsed(b"SEND\ndestination:/topic/t\ncontent-length:3\n\na\0b\0\n");
        let message = from_send_frame(&frame, &resolver()).unwrap();
        assert_eq!(message.body, MessageBody::Bytes(bytes::Bytes::from_static(b"a\0b")));
        assert!(message.properties.is_empty());
        assert_eq!(message.priority, Message::DEFAULT_PRIORITY);
        assert!(message.persistent);
    }

    #[test]
    fn test_invalid_priority() {
        let frame = parsed(b"SEND\ndestination:/queue/q\npriority:high\n\n\0");
        let err = from_send_frame(&frame, &resolver()).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::InvalidHeaderValue { header: "priority", .. }
        ));

        let frame = parsed(b"SEND\ndestination:/queue/q\npriority:12\n\n\0");
        assert!(from_send_frame(&frame, &resolver()).is_err());
    }

    #[test]
    fn test_message_frame_header_order() {
        let mut message = Message::new(
            Destination::new("orders", DestinationKind::Queue),
            MessageBody::Text("hi".to_string()),
        );
        message.id = Some("ID:7".to_string());
        message.correlation_id = Some("c-9".to_string());
        message.timestamp = 1_700_000_000_000;
        message.reply_to = Some(Destination::temporary("broker.tmp.5", DestinationKind::Queue));
        message.properties.push(("orderId".to_string(), "42".to_string()));

        let resolver = resolver();
        let frame = to_message_frame("sub-1", true, &message, &resolver);
        let keys: Vec<_> = frame.headers().iter().map(|(k, _)| k).collect();
        assert_eq!(
            keys,
            vec![
                "subscription",
                "destination",
                "message-id",
                "ack",
                "reply-to",
                "correlation-id",
                "expires",
                "redelivered",
                "priority",
                "timestamp",
                "orderId",
                "content-length",
            ]
        );
        assert_eq!(frame.get_header("ack"), Some("sub-1ID:7"));
        assert_eq!(frame.get_header("destination"), Some("/queue/orders"));
        assert_eq!(frame.get_header("reply-to"), Some("/temp-queue/broker.tmp.5"));
        assert_eq!(frame.get_header("content-length"), Some("2"));
        assert_eq!(&frame.body_bytes()[..], b"hi");

        // The announced temporary reply-to is now resolvable.
        assert!(resolver.resolve("/temp-queue/broker.tmp.5").is_ok());
    }

    #[test]
    fn test_auto_ack_delivery_has_no_ack_header() {
        let message = Message::new(
            Destination::new("t", DestinationKind::Topic),
            MessageBody::Text(String::new()),
        );
        let frame = to_message_frame("sub-2", false, &message, &resolver());
        assert!(frame.get_header("ack").is_none());
        assert_eq!(frame.get_header("content-length"), Some("0"));
    }

    #[test]
    fn test_default_subscription_id() {
        assert_eq!(
            default_subscription_id("/queue/a"),
            "/subscription-to//queue/a"
        );
    }
}
