//! # stompgate-server
//!
//! STOMP bridge for stompgate.
//!
//! This crate provides:
//! - The per-connection command dispatcher
//! - Wire destination resolution with temporary destination caches
//! - Collaborator traits for the broker and the outbound transport
//! - An in-memory reference broker
//! - A TCP host with configuration and credential checks

pub mod auth;
pub mod broker;
pub mod config;
pub mod destination;
pub mod error;
pub mod fault;
pub mod handler;
pub mod memory;
pub mod message;
pub mod server;
pub mod session;

pub use auth::CredentialValidator;
pub use broker::{
    AckAddress, AckMode, BrokerConnection, Credentials, DeliveryListener, Destination,
    DestinationFactory, DestinationKind, FrameSink, Message, MessageBody, Subscription,
    SubscriptionRequest,
};
pub use config::{AuthConfig, BrokerConfig, Config, ConfigError, NetworkConfig, ProtocolConfig};
pub use destination::DestinationResolver;
pub use error::{BridgeError, BrokerError, ServerError, SinkClosed};
pub use fault::{FaultInjector, NoFaults, ScriptedFaults};
pub use handler::{Flow, HandlerSettings, ProtocolHandler};
pub use memory::{MemoryBroker, MemoryBrokerSettings, MemoryConnection};
pub use server::{Server, ServerConfig};
pub use session::ConnectionState;
