//! # livemap-sync: live-location presence for shared maps
//!
//! Clients in the same room periodically report who they are and where they
//! are; a relay fans the reports out, and every client reconciles them into a
//! current visitor set that a map renderer can draw.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐     WebSocket      ┌──────────────┐
//! │ PresenceClient   │ ◄─────────────────► │ Relay        │
//! │ (per user)       │     JSON frames     │ (per room)   │
//! └──┬─────┬─────┬───┘                     └──────┬───────┘
//!    │     │     │                                │
//!    ▼     ▼     ▼                                ▼
//! Identity │  PresenceStore ──► snapshot   ┌───────────────┐
//! Store    │  (reconciler)      (renderer) │ BroadcastGroup│
//!          ▼                               │ (fan-out)     │
//!   LocationSource → PrivacyFilter         └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages and the `"lon,lat"` codec
//! - [`identity`]: persisted uid, display name and sharing mode
//! - [`location`]: polled position sources with a freshness window
//! - [`privacy`]: full / off / fuzzy location reporting
//! - [`presence`]: the reconciler and its renderer read model
//! - [`client`]: connection state machine and event loop
//! - [`broadcast`]: relay-side room fan-out
//! - [`relay`]: reference relay server
//! - [`config`]: client and relay configuration

pub mod broadcast;
pub mod client;
pub mod config;
pub mod identity;
pub mod location;
pub mod presence;
pub mod privacy;
pub mod protocol;
pub mod relay;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use client::{Backoff, ClientHandle, ConnectionState, PresenceClient, ReportGate};
pub use config::{BackoffConfig, ClientConfig, RelayConfig};
pub use identity::{
    FsKeyValueStore, Identity, IdentityStore, KeyValueStore, MemoryKeyValueStore, SharingMode,
    StoreError,
};
pub use location::{
    CachedLocationSource, FixedLocationSource, LocationError, LocationSource, PositionSample,
    ScriptedLocationSource,
};
pub use presence::{
    ApplyOutcome, PresenceSnapshot, PresenceStore, ReconcileError, TableChange, Visitor,
    VisitorProperties,
};
pub use privacy::{FuzzOffset, PrivacyFilter};
pub use protocol::{Coordinates, LocationReport, PeerEvent, ProtocolError, RoomId};
pub use relay::{Relay, RelayError, RelayStats};
