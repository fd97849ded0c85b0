//! Listener registry
//!
//! Thread-safe directory of every receiver the sender has heard from:
//! enabled state, display name, freshness, and measured round-trip time.
//! Mutated concurrently by the control task, the enable/disable path, and
//! the periodic stale sweep; fields are independent, so last-writer-wins
//! per field is all the atomicity required.

use std::net::SocketAddr;

use dashmap::DashMap;
use serde::Serialize;

use crate::clock::now_millis;

/// Snapshot of one known listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenerInfo {
    /// Stream destination (listener ip, stream port)
    pub addr: SocketAddr,
    /// Display name from the Hello packet; empty until one arrives
    pub name: String,
    /// Disabled listeners stay registered but receive no audio
    pub enabled: bool,
    /// Wall-clock millis of the last control packet from this listener
    pub last_seen_ms: i64,
    /// Last measured round-trip time, if any ping has been answered
    pub rtt_ms: Option<i64>,
}

impl ListenerInfo {
    /// Name for logs and UIs: the Hello name, or the address when the
    /// listener never sent one.
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            self.addr.to_string()
        } else {
            self.name.clone()
        }
    }
}

/// Directory of known listeners, keyed by stream destination address.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    entries: DashMap<SocketAddr, ListenerInfo>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or refreshes a listener. Returns true when the address was
    /// not registered before.
    ///
    /// Fresh entries default to enabled. A provided non-empty name
    /// overwrites the stored one; `None` or an empty name never clears it.
    /// `last_seen_ms` is always refreshed.
    pub fn upsert(&self, addr: SocketAddr, name: Option<&str>) -> bool {
        let now = now_millis();
        match self.entries.entry(addr) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let info = occupied.get_mut();
                if let Some(name) = name {
                    if !name.is_empty() {
                        info.name = name.to_string();
                    }
                }
                info.last_seen_ms = now;
                false
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(ListenerInfo {
                    addr,
                    name: name.unwrap_or_default().to_string(),
                    enabled: true,
                    last_seen_ms: now,
                    rtt_ms: None,
                });
                true
            }
        }
    }

    /// Removes a listener, returning its final snapshot.
    pub fn remove(&self, addr: SocketAddr) -> Option<ListenerInfo> {
        self.entries.remove(&addr).map(|(_, info)| info)
    }

    /// Current snapshot of one listener.
    pub fn get(&self, addr: SocketAddr) -> Option<ListenerInfo> {
        self.entries.get(&addr).map(|entry| entry.value().clone())
    }

    /// Enables or disables a listener. Returns false when unknown.
    pub fn set_enabled(&self, addr: SocketAddr, enabled: bool) -> bool {
        match self.entries.get_mut(&addr) {
            Some(mut info) => {
                info.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Records a measured round-trip time. Unknown addresses are ignored.
    pub fn set_rtt(&self, addr: SocketAddr, rtt_ms: i64) {
        if let Some(mut info) = self.entries.get_mut(&addr) {
            info.rtt_ms = Some(rtt_ms);
        }
    }

    /// All listeners, sorted by address string for stable rendering.
    pub fn snapshot(&self) -> Vec<ListenerInfo> {
        let mut all: Vec<ListenerInfo> =
            self.entries.iter().map(|entry| entry.value().clone()).collect();
        all.sort_by_key(|info| info.addr.to_string());
        all
    }

    /// Stream destinations of every enabled listener.
    pub fn snapshot_enabled(&self) -> Vec<SocketAddr> {
        self.entries
            .iter()
            .filter(|entry| entry.value().enabled)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Addresses not heard from within `threshold_ms`. Pure query; callers
    /// decide whether to remove.
    pub fn stale_addresses(&self, threshold_ms: i64) -> Vec<SocketAddr> {
        let now = now_millis();
        self.entries
            .iter()
            .filter(|entry| now - entry.value().last_seen_ms > threshold_ms)
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rewinds a listener's last-seen clock so staleness is testable
    /// without sleeping.
    #[cfg(test)]
    pub(crate) fn backdate(&self, addr: SocketAddr, by_ms: i64) {
        if let Some(mut info) = self.entries.get_mut(&addr) {
            info.last_seen_ms -= by_ms;
        }
    }
}
