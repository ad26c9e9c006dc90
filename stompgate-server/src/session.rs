//! Per-connection protocol state.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;
use stompgate_protocol::StompVersion;

/// Established by a successful CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Established {
    version: StompVersion,
    /// Session id handed out by the broker.
    session_id: String,
}

/// Protocol state of one client connection.
pub struct ConnectionState {
    /// Transport label used in log lines, usually the peer address.
    peer: String,

    /// Set once by CONNECT; immutable afterwards.
    established: OnceLock<Established>,

    /// Ids of the currently open subscriptions.
    subscriptions: Mutex<HashSet<String>>,

    /// Frames dispatched so far.
    frame_count: AtomicU64,

    closed: AtomicBool,
}

impl ConnectionState {
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            established: OnceLock::new(),
            subscriptions: Mutex::new(HashSet::new()),
            frame_count: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Records the outcome of CONNECT. Returns false if already connected.
    pub fn establish(&self, version: StompVersion, session_id: String) -> bool {
        self.established
            .set(Established {
                version,
                session_id,
            })
            .is_ok()
    }

    pub fn is_connected(&self) -> bool {
        self.established.get().is_some()
    }

    /// Negotiated protocol version, once connected.
    pub fn version(&self) -> Option<StompVersion> {
        self.established.get().map(|e| e.version)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.established.get().map(|e| e.session_id.as_str())
    }

    /// Claims a subscription id. Returns false if it is already in use.
    pub fn reserve_subscription(&self, id: &str) -> bool {
        self.subscriptions.lock().insert(id.to_string())
    }

    /// Frees a subscription id. Returns false if it was not in use.
    pub fn release_subscription(&self, id: &str) -> bool {
        self.subscriptions.lock().remove(id)
    }

    pub fn has_subscription(&self, id: &str) -> bool {
        self.subscriptions.lock().contains(id)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub fn record_frame(&self) {
        self.frame_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::Relaxed)
    }

    /// Marks the connection closed. Returns true only for the first call.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
