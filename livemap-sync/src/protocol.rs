//! JSON text-frame protocol between presence clients and the relay.
//!
//! Wire format (one JSON object per WebSocket text frame):
//! ```text
//! client → relay   {"uid": "…", "name": "…", "location": "lon,lat" | null}
//! relay  → client  {"uid": "…", "name": "…", "location": "lon,lat" | null, "active": bool}
//! ```
//!
//! `location = null` means the sender is not sharing right now. The relay
//! adds `active`, which drops to `false` once the sender's connection is gone.
//!
//! Connection endpoint: `{relay_url}?room-id={room}&uid={uid}`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Query parameter carrying the room identifier.
pub const ROOM_PARAM: &str = "room-id";
/// Query parameter carrying the sending identity.
pub const UID_PARAM: &str = "uid";

const MAX_ID_LEN: usize = 128;

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(#[source] serde_json::Error),
    #[error("deserialization error: {0}")]
    Deserialization(#[source] serde_json::Error),
    #[error("malformed location {0:?}")]
    MalformedLocation(String),
    #[error("invalid room id {0:?}")]
    InvalidRoomId(String),
    #[error("missing query parameter {0:?}")]
    MissingParam(&'static str),
    #[error("connection closed")]
    ConnectionClosed,
}

/// A `(longitude, latitude)` pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lon: f64,
    pub lat: f64,
}

impl Coordinates {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    /// Parse the wire form `"lon,lat"`.
    ///
    /// Exactly two comma-separated finite numbers are accepted; anything
    /// else is rejected so that no `NaN` ever reaches the visitor table.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let malformed = || ProtocolError::MalformedLocation(raw.to_string());

        let mut fields = raw.split(',');
        let (Some(lon), Some(lat), None) = (fields.next(), fields.next(), fields.next()) else {
            return Err(malformed());
        };

        let lon: f64 = lon.trim().parse().map_err(|_| malformed())?;
        let lat: f64 = lat.trim().parse().map_err(|_| malformed())?;
        if !lon.is_finite() || !lat.is_finite() {
            return Err(malformed());
        }

        Ok(Self { lon, lat })
    }

    /// Offset by `(dx, dy)` degrees.
    pub fn offset(&self, dx: f64, dy: f64) -> Self {
        Self {
            lon: self.lon + dx,
            lat: self.lat + dy,
        }
    }

    /// Wire form, full precision.
    pub fn to_wire(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.lon, self.lat)
    }
}

/// Outbound location report (client → relay).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationReport {
    pub uid: String,
    #[serde(default)]
    pub name: String,
    /// `"lon,lat"`, or `None` when not sharing.
    #[serde(default)]
    pub location: Option<String>,
}

impl LocationReport {
    pub fn new(uid: impl Into<String>, name: impl Into<String>, location: Option<String>) -> Self {
        Self {
            uid: uid.into(),
            name: name.into(),
            location,
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Serialization)
    }

    /// Deserialize from a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Deserialization)
    }
}

fn default_active() -> bool {
    true
}

/// Inbound peer event (relay → client).
///
/// Fields the relay adds beyond the documented ones are kept in `extra`
/// and carried through into the visitor's properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerEvent {
    pub uid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl PeerEvent {
    pub fn new(
        uid: impl Into<String>,
        name: impl Into<String>,
        location: Option<String>,
        active: bool,
    ) -> Self {
        Self {
            uid: uid.into(),
            name: name.into(),
            location,
            active,
            extra: BTreeMap::new(),
        }
    }

    /// Parsed location; `Ok(None)` when the peer reports none.
    pub fn coordinates(&self) -> Result<Option<Coordinates>, ProtocolError> {
        self.location.as_deref().map(Coordinates::parse).transpose()
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Serialization)
    }

    /// Deserialize from a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Deserialization)
    }
}

/// Room (block/page) identifier scoping who sees whom.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId(String);

impl RoomId {
    /// Validate a room identifier.
    ///
    /// Restricted to `[A-Za-z0-9._-]` so it can sit verbatim in the query.
    pub fn parse(raw: impl Into<String>) -> Result<Self, ProtocolError> {
        let raw = raw.into();
        if is_query_safe(&raw) {
            Ok(Self(raw))
        } else {
            Err(ProtocolError::InvalidRoomId(raw))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether `value` can sit verbatim in the endpoint query.
///
/// Non-empty, at most 128 characters from `[A-Za-z0-9._-]`. Applies to room
/// ids and uids alike.
pub fn is_query_safe(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_ID_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Build the relay endpoint for a room and identity.
pub fn endpoint(relay_url: &str, room: &RoomId, uid: &str) -> String {
    let sep = if relay_url.contains('?') { '&' } else { '?' };
    format!("{relay_url}{sep}{ROOM_PARAM}={room}&{UID_PARAM}={uid}")
}

/// Room and identity parsed from an endpoint query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointParams {
    pub room: RoomId,
    pub uid: String,
}

impl EndpointParams {
    /// Parse `room-id=…&uid=…` (order-insensitive, unknown keys ignored).
    pub fn from_query(query: &str) -> Result<Self, ProtocolError> {
        let mut room = None;
        let mut uid = None;
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some((ROOM_PARAM, value)) => room = Some(RoomId::parse(value)?),
                Some((UID_PARAM, value)) if !value.is_empty() => uid = Some(value.to_string()),
                _ => {}
            }
        }
        Ok(Self {
            room: room.ok_or(ProtocolError::MissingParam(ROOM_PARAM))?,
            uid: uid.ok_or(ProtocolError::MissingParam(UID_PARAM))?,
        })
    }
}
