//! Presence reconciliation: merges inbound peer events into the current
//! visitor set and exposes an immutable read model for rendering.
//!
//! ## Architecture
//!
//! ```text
//! relay PeerEvent (JSON text frame)
//!       │
//!       ▼
//! PresenceStore::apply()
//!       │  location present → upsert, opacity 1.0 / 0.4 by `active`
//!       │  location null    → remove
//!       │  malformed        → rejected, table untouched
//!       ▼
//! PresenceStore::snapshot()
//!       │  { local, others }, local visitor split out
//!       ▼
//! Renderer (external)
//! ```
//!
//! Events for different uids commute; for the same uid the last applied
//! wins. Re-applying an event leaves the table as it was.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use thiserror::Error;

use crate::identity::IdentityStore;
use crate::protocol::{Coordinates, PeerEvent, ProtocolError};

/// Opacity of a peer that is actively connected.
pub const ACTIVE_OPACITY: f32 = 1.0;
/// Opacity of a peer kept at its last-known position after going inactive.
pub const INACTIVE_OPACITY: f32 = 0.4;

/// Reasons an event is discarded.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("peer event without uid")]
    MissingUid,
    #[error(transparent)]
    MalformedLocation(#[from] ProtocolError),
}

/// Display properties of a visitor: the event's fields plus opacity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VisitorProperties {
    pub uid: String,
    pub name: String,
    pub location: Option<String>,
    pub active: bool,
    pub opacity: f32,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// One known peer (or the local user) with last-known coordinates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Visitor {
    pub uid: String,
    pub coordinates: Coordinates,
    pub properties: VisitorProperties,
}

impl Visitor {
    fn from_event(event: &PeerEvent, coordinates: Coordinates) -> Self {
        Self {
            uid: event.uid.clone(),
            coordinates,
            properties: VisitorProperties {
                uid: event.uid.clone(),
                name: event.name.clone(),
                location: event.location.clone(),
                active: event.active,
                opacity: if event.active {
                    ACTIVE_OPACITY
                } else {
                    INACTIVE_OPACITY
                },
                extra: event.extra.clone(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.properties.name
    }

    pub fn opacity(&self) -> f32 {
        self.properties.opacity
    }

    pub fn is_active(&self) -> bool {
        self.properties.active
    }
}

/// Read model handed to the renderer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PresenceSnapshot {
    /// The local user, drawn as a distinct layer.
    pub local: Option<Visitor>,
    /// Every other visitor, ordered by uid.
    pub others: Vec<Visitor>,
}

impl PresenceSnapshot {
    pub fn is_empty(&self) -> bool {
        self.local.is_none() && self.others.is_empty()
    }

    pub fn other(&self, uid: &str) -> Option<&Visitor> {
        self.others.iter().find(|v| v.uid == uid)
    }
}

/// Effect of a single `apply` on the visitor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableChange {
    Upserted,
    Removed,
    Unchanged,
}

/// Result of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub table: TableChange,
    /// The relay echoed a different name for the local uid and it was adopted.
    pub adopted_name: bool,
}

impl ApplyOutcome {
    /// Whether the read model changed and should be re-published.
    pub fn changed(&self) -> bool {
        self.table != TableChange::Unchanged
    }
}

/// The authoritative visitor table for one room.
pub struct PresenceStore {
    local_uid: String,
    visitors: HashMap<String, Visitor>,
}

impl PresenceStore {
    /// Empty table for the given local identity.
    pub fn new(local_uid: impl Into<String>) -> Self {
        Self {
            local_uid: local_uid.into(),
            visitors: HashMap::new(),
        }
    }

    /// Apply one inbound event.
    ///
    /// Malformed events are rejected before anything is touched, including
    /// the local name sync.
    pub fn apply(
        &mut self,
        event: &PeerEvent,
        identity: &mut IdentityStore,
    ) -> Result<ApplyOutcome, ReconcileError> {
        if event.uid.is_empty() {
            return Err(ReconcileError::MissingUid);
        }
        let coordinates = event.coordinates()?;

        // The relay is authoritative for the local name. An empty echo never
        // wipes a name the user typed.
        let adopted_name = event.uid == self.local_uid
            && !event.name.is_empty()
            && identity.set_name(event.name.clone());
        if adopted_name {
            log::info!("Adopted name {:?} from relay", event.name);
        }

        let table = match coordinates {
            Some(coordinates) => {
                let visitor = Visitor::from_event(event, coordinates);
                if self.visitors.get(&event.uid) == Some(&visitor) {
                    TableChange::Unchanged
                } else {
                    self.visitors.insert(event.uid.clone(), visitor);
                    TableChange::Upserted
                }
            }
            None => match self.visitors.remove(&event.uid) {
                Some(_) => TableChange::Removed,
                None => TableChange::Unchanged,
            },
        };

        log::trace!("Applied event for {}: {table:?}", event.uid);
        Ok(ApplyOutcome {
            table,
            adopted_name,
        })
    }

    /// Immutable copy of the current table, local visitor split out.
    pub fn snapshot(&self) -> PresenceSnapshot {
        let mut others: Vec<Visitor> = self
            .visitors
            .values()
            .filter(|v| v.uid != self.local_uid)
            .cloned()
            .collect();
        others.sort_by(|a, b| a.uid.cmp(&b.uid));

        PresenceSnapshot {
            local: self.visitors.get(&self.local_uid).cloned(),
            others,
        }
    }

    /// Drop every visitor (connection teardown or room switch).
    pub fn clear(&mut self) {
        self.visitors.clear();
    }

    pub fn get(&self, uid: &str) -> Option<&Visitor> {
        self.visitors.get(uid)
    }

    /// Number of visitors, the local one included.
    pub fn len(&self) -> usize {
        self.visitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visitors.is_empty()
    }

    pub fn local_uid(&self) -> &str {
        &self.local_uid
    }
}

// ===================================================================
// Tests
// ===================================================================
