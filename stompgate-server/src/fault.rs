//! Fault injection at the broker seam.
//!
//! The dispatcher consults its [`FaultInjector`] before every broker call,
//! so tests can make a given command fail deterministically.

use crate::error::BrokerError;
use parking_lot::Mutex;
use std::collections::HashMap;
use stompgate_protocol::Command;

/// Decides whether the broker call for a command should fail.
pub trait FaultInjector: Send + Sync {
    /// Returns the error to raise instead of calling the broker.
    fn before_call(&self, command: Command) -> Option<BrokerError>;
}

/// Never injects anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFaults;

impl FaultInjector for NoFaults {
    fn before_call(&self, _command: Command) -> Option<BrokerError> {
        None
    }
}

/// Fails scripted commands a fixed number of times.
#[derive(Debug, Default)]
pub struct ScriptedFaults {
    scripted: Mutex<HashMap<Command, Vec<BrokerError>>>,
}

impl ScriptedFaults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `error` for the next broker call made for `command`.
    pub fn fail_next(&self, command: Command, error: BrokerError) {
        self.scripted
            .lock()
            .entry(command)
            .or_default()
            .insert(0, error);
    }

    /// Number of injected faults not yet raised.
    pub fn pending(&self) -> usize {
        self.scripted.lock().values().map(Vec::len).sum()
    }
}

impl FaultInjector for ScriptedFaults {
    fn before_call(&self, command: Command) -> Option<BrokerError> {
        self.scripted.lock().get_mut(&command)?.pop()
    }
}
