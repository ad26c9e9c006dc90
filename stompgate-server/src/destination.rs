//! Wire destination names to provider destination handles.
//!
//! Wire names use a fixed prefix scheme:
//!
//! ```text
//! /queue/<name>        /topic/<name>
//! /temp-queue/<name>   /temp-topic/<name>
//! ```
//!
//! Temporary names are kept per connection in four caches: destinations the
//! client declared (created lazily through the factory) and broker-assigned
//! temporaries seen during delivery, each split by queue and topic.

use crate::broker::{Destination, DestinationFactory, DestinationKind};
use crate::error::BridgeError;
use dashmap::DashMap;
use std::sync::Arc;

pub const QUEUE_PREFIX: &str = "/queue/";
pub const TOPIC_PREFIX: &str = "/topic/";
pub const TEMP_QUEUE_PREFIX: &str = "/temp-queue/";
pub const TEMP_TOPIC_PREFIX: &str = "/temp-topic/";

/// A parsed wire destination name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireName<'a> {
    Named(&'a str, DestinationKind),
    Temporary(&'a str, DestinationKind),
}

impl<'a> WireName<'a> {
    pub fn parse(wire: &'a str) -> Result<Self, BridgeError> {
        let parsed = [
            (QUEUE_PREFIX, DestinationKind::Queue, false),
            (TOPIC_PREFIX, DestinationKind::Topic, false),
            (TEMP_QUEUE_PREFIX, DestinationKind::Queue, true),
            (TEMP_TOPIC_PREFIX, DestinationKind::Topic, true),
        ]
        .into_iter()
        .find_map(|(prefix, kind, temporary)| {
            let name = wire.strip_prefix(prefix)?.trim();
            Some(if temporary {
                WireName::Temporary(name, kind)
            } else {
                WireName::Named(name, kind)
            })
        });
        parsed.ok_or_else(|| BridgeError::InvalidDestination(wire.to_string()))
    }
}

/// Renders a destination handle as its wire name.
pub fn wire_name(destination: &Destination) -> String {
    let prefix = match (destination.kind(), destination.is_temporary()) {
        (DestinationKind::Queue, false) => QUEUE_PREFIX,
        (DestinationKind::Topic, false) => TOPIC_PREFIX,
        (DestinationKind::Queue, true) => TEMP_QUEUE_PREFIX,
        (DestinationKind::Topic, true) => TEMP_TOPIC_PREFIX,
    };
    format!("{}{}", prefix, destination.name())
}

/// Per-connection destination resolver.
pub struct DestinationResolver {
    factory: Arc<dyn DestinationFactory>,
    temp_queues: DashMap<String, Destination>,
    temp_topics: DashMap<String, Destination>,
    broker_temp_queues: DashMap<String, Destination>,
    broker_temp_topics: DashMap<String, Destination>,
}

impl DestinationResolver {
    pub fn new(factory: Arc<dyn DestinationFactory>) -> Self {
        Self {
            factory,
            temp_queues: DashMap::new(),
            temp_topics: DashMap::new(),
            broker_temp_queues: DashMap::new(),
            broker_temp_topics: DashMap::new(),
        }
    }

    fn client_cache(&self, kind: DestinationKind) -> &DashMap<String, Destination> {
        match kind {
            DestinationKind::Queue => &self.temp_queues,
            DestinationKind::Topic => &self.temp_topics,
        }
    }

    fn broker_cache(&self, kind: DestinationKind) -> &DashMap<String, Destination> {
        match kind {
            DestinationKind::Queue => &self.broker_temp_queues,
            DestinationKind::Topic => &self.broker_temp_topics,
        }
    }

    fn is_broker_origin(&self, name: &str, kind: DestinationKind) -> bool {
        let prefix = self.factory.temporary_prefix(kind);
        !prefix.is_empty() && name.starts_with(prefix)
    }

    fn broker_lookup(&self, name: &str, kind: DestinationKind) -> Result<Destination, BridgeError> {
        self.broker_cache(kind)
            .get(name)
            .map(|d| d.clone())
            .ok_or_else(|| BridgeError::DestinationNotFound(name.to_string()))
    }

    /// Resolves a wire name, creating a client-declared temporary destination
    /// on first reference.
    pub fn resolve(&self, wire: &str) -> Result<Destination, BridgeError> {
        match WireName::parse(wire)? {
            WireName::Named(name, kind) => Ok(self.factory.create_destination(name, kind)?),
            WireName::Temporary(name, kind) if self.is_broker_origin(name, kind) => {
                self.broker_lookup(name, kind)
            }
            WireName::Temporary(name, kind) => {
                let entry = self
                    .client_cache(kind)
                    .entry(name.to_string())
                    .or_try_insert_with(|| self.factory.create_temporary_destination(kind))?;
                tracing::debug!("temporary destination {} -> {}", wire, *entry);
                Ok(entry.clone())
            }
        }
    }

    /// Renders a handle as its wire name, remembering broker-assigned
    /// temporaries so the client can refer to them later.
    pub fn to_wire_name(&self, destination: &Destination) -> String {
        if destination.is_temporary() {
            self.broker_cache(destination.kind())
                .entry(destination.name().to_string())
                .or_insert_with(|| destination.clone());
        }
        wire_name(destination)
    }

    /// Number of cached temporary destinations, client-declared and broker-origin.
    pub fn cached(&self) -> (usize, usize) {
        (
            self.temp_queues.len() + self.temp_topics.len(),
            self.broker_temp_queues.len() + self.broker_temp_topics.len(),
        )
    }

    /// Drops every cached temporary destination.
    pub fn clear(&self) {
        self.temp_queues.clear();
        self.temp_topics.clear();
        self.broker_temp_queues.clear();
        self.broker_temp_topics.clear();
    }
}
