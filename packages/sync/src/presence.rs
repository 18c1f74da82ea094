//! The peer presence channel.
//!
//! A signaling-assisted collaborator-to-collaborator channel carrying only
//! ephemeral data: identity announcements and live cursor positions. It
//! sits entirely outside the patch/undo system; collaborator entries live
//! in the transient half of the document state and are never persisted.
//!
//! Cursor broadcasts are best-effort and throttled; a dropped update is
//! inconsequential and is never queued, acknowledged, or retried.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use easel_editor::Command;
use easel_model::{CanvasState, Collaborator, Point};

/// Fixed cursor color palette. A joining collaborator takes the first
/// color not already in use.
pub const PRESENCE_PALETTE: &[&str] = &[
    "#e6194b", "#3cb44b", "#4363d8", "#f58231", "#911eb4", "#42d4f4", "#f032e6", "#9a6324",
];

#[derive(Debug, Clone, Copy)]
pub struct PresenceOptions {
    /// Minimum interval between outgoing cursor broadcasts.
    pub cursor_min_interval: Duration,
}

impl Default for PresenceOptions {
    fn default() -> Self {
        Self {
            cursor_min_interval: Duration::from_millis(80),
        }
    }
}

/// The peer message contract: exactly two kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PeerMessage {
    /// Identity announcement, broadcast once per new connection.
    Hello { name: String },
    /// Live cursor position, throttled and best-effort.
    Cursor { x: f64, y: f64 },
}

/// Outgoing half of the peer channel. Send is fire-and-forget.
pub trait PeerTransport: Send + Sync {
    fn send(&self, peer_id: &str, message: &PeerMessage);
}

/// Local end of the presence channel for one session.
pub struct PresenceChannel {
    local_name: String,
    transport: Arc<dyn PeerTransport>,
    peers: BTreeSet<String>,
    last_cursor_broadcast: Option<Instant>,
    options: PresenceOptions,
}

impl PresenceChannel {
    pub fn new(
        local_name: impl Into<String>,
        transport: Arc<dyn PeerTransport>,
        options: PresenceOptions,
    ) -> Self {
        Self {
            local_name: local_name.into(),
            transport,
            peers: BTreeSet::new(),
            last_cursor_broadcast: None,
            options,
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// A peer channel opened: announce our identity to the newcomer.
    pub fn peer_opened(&mut self, peer_id: &str) {
        self.peers.insert(peer_id.to_string());
        self.transport.send(
            peer_id,
            &PeerMessage::Hello {
                name: self.local_name.clone(),
            },
        );
    }

    pub fn peer_closed(&mut self, peer_id: &str) {
        self.peers.remove(peer_id);
    }

    /// Translate an incoming message into the store command it implies.
    ///
    /// A cursor update for a collaborator that no longer exists is stale
    /// and silently ignored.
    pub fn handle_message(
        &mut self,
        peer_id: &str,
        message: PeerMessage,
        state: &CanvasState,
    ) -> Option<Command> {
        match message {
            PeerMessage::Hello { name } => {
                let existing = state.document.collaborators.get(peer_id);
                let color = existing
                    .map(|c| c.color.clone())
                    .unwrap_or_else(|| next_color(state));
                let cursor = existing.map(|c| c.cursor).unwrap_or_default();
                Some(Command::UpsertCollaborator(Collaborator {
                    id: peer_id.to_string(),
                    name,
                    color,
                    cursor,
                }))
            }
            PeerMessage::Cursor { x, y } => {
                if state.document.collaborators.contains_key(peer_id) {
                    Some(Command::SetCollaboratorCursor {
                        id: peer_id.to_string(),
                        cursor: Point::new(x, y),
                    })
                } else {
                    None
                }
            }
        }
    }

    /// Broadcast the local cursor to every open peer, throttled to the
    /// configured minimum interval.
    pub fn broadcast_cursor(&mut self, at: Point) {
        let now = Instant::now();
        if let Some(last) = self.last_cursor_broadcast {
            if now.duration_since(last) < self.options.cursor_min_interval {
                return;
            }
        }
        self.last_cursor_broadcast = Some(now);

        let message = PeerMessage::Cursor { x: at.x, y: at.y };
        for peer in &self.peers {
            self.transport.send(peer, &message);
        }
    }
}

/// First palette color not already taken by a collaborator.
fn next_color(state: &CanvasState) -> String {
    let used: BTreeSet<&str> = state
        .document
        .collaborators
        .values()
        .map(|c| c.color.as_str())
        .collect();
    PRESENCE_PALETTE
        .iter()
        .find(|color| !used.contains(**color))
        .copied()
        .unwrap_or(PRESENCE_PALETTE[0])
        .to_string()
}

/// Transport double that records every send, for tests.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    sent: Arc<Mutex<Vec<(String, PeerMessage)>>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, PeerMessage)> {
        self.sent.lock().unwrap().clone()
    }
}

impl PeerTransport for RecordingTransport {
    fn send(&self, peer_id: &str, message: &PeerMessage) {
        self.sent
            .lock()
            .unwrap()
            .push((peer_id.to_string(), message.clone()));
    }
}
