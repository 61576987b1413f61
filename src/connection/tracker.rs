//! Groups and per-hub state tracking.
//!
//! Both values must survive reconnects: the groups token is echoed on every
//! resume request so the server can restore subscriptions, and the per-hub
//! state dictionary rides on outbound frames so the server can detect
//! staleness. The tracker is shared by reference between the state machine
//! and the invocation multiplexer.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;

/// Reconnect-surviving connection state.
#[derive(Default)]
pub struct StateTracker {
    groups_token: RwLock<Option<String>>,
    hub_state: RwLock<HashMap<String, HashMap<String, Value>>>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_groups_token(&self, token: String) {
        *self.groups_token.write() = Some(token);
    }

    pub fn groups_token(&self) -> Option<String> {
        self.groups_token.read().clone()
    }

    /// Merges state entries received for a hub.
    pub fn apply_state(&self, hub: &str, entries: HashMap<String, Value>) {
        let mut state = self.hub_state.write();
        state
            .entry(hub.to_lowercase())
            .or_default()
            .extend(entries);
    }

    /// Snapshot of a hub's state for inclusion on an outbound frame.
    /// `None` when no state has been recorded for the hub.
    pub fn state_snapshot(&self, hub: &str) -> Option<HashMap<String, Value>> {
        self.hub_state.read().get(&hub.to_lowercase()).cloned()
    }

    /// Clears everything. Used on explicit restart, never on reconnect.
    pub fn reset(&self) {
        *self.groups_token.write() = None;
        self.hub_state.write().clear();
    }
}
