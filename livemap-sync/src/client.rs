//! Presence client: one WebSocket connection per room, driven by a single
//! event loop task.
//!
//! ```text
//!  ClientHandle ──commands──┐
//!                           ▼
//!  poll timer ───────► PresenceClient::run ◄──── relay frames (PeerEvent)
//!                      │        │        │
//!                      │        │        └── PresenceStore::apply ──► snapshot watch
//!                      │        └── IdentityStore (name, sharing mode)
//!                      └── LocationSource → PrivacyFilter → ReportGate → relay
//! ```
//!
//! State machine: `Disconnected → Connecting → Open → (Closed | Reconnecting) → …`
//!
//! - Entering `Open` sends one report immediately, bypassing duplicate
//!   suppression.
//! - The poll timer only runs while sharing; `Off` stops it entirely.
//! - A room switch closes the socket and clears the visitor table before the
//!   next connection opens.
//! - A lost connection freezes the table until the next open; the relay's
//!   replay then rebuilds it from scratch.
//! - Connect attempts are bounded by `connect_timeout` and still serve
//!   commands, so shutdown and room switches never wait on a stalled relay.
//! - Transport and positioning failures are logged and retried, never fatal.

use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::{BackoffConfig, ClientConfig};
use crate::identity::{Identity, IdentityStore, SharingMode};
use crate::location::{CachedLocationSource, LocationSource};
use crate::presence::{PresenceSnapshot, PresenceStore};
use crate::privacy::PrivacyFilter;
use crate::protocol::{endpoint, LocationReport, PeerEvent, ProtocolError, RoomId};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

// ────────────────────────────────────────────────────────────────────────────
// Backoff
// ────────────────────────────────────────────────────────────────────────────

/// Exponential reconnect delay, reset on every successful open.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    next: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let next = config.initial.min(config.max);
        Self { config, next }
    }

    /// Delay to wait before the next attempt; grows the one after it.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        let grown = delay.as_secs_f64() * self.config.factor.max(1.0);
        self.next = Duration::from_secs_f64(grown.min(self.config.max.as_secs_f64()));
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.config.initial.min(self.config.max);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Duplicate suppression
// ────────────────────────────────────────────────────────────────────────────

/// Remembers the location of the last report that reached the socket.
#[derive(Debug, Clone, Default)]
pub struct ReportGate {
    /// `None` until something is sent on the current connection.
    last_sent: Option<Option<String>>,
}

impl ReportGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a report carrying `location` should go out.
    ///
    /// The first report on a connection and forced reports always pass.
    pub fn should_send(&self, location: &Option<String>, force: bool) -> bool {
        force || self.last_sent.as_ref() != Some(location)
    }

    pub fn record(&mut self, location: Option<String>) {
        self.last_sent = Some(location);
    }

    /// Forget the last report (new connection).
    pub fn reset(&mut self) {
        self.last_sent = None;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Handle
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum Command {
    SetName(String),
    SetSharingMode(SharingMode),
    SwitchRoom(RoomId),
    Shutdown,
}

/// Cloneable handle to a running [`PresenceClient`].
#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<PresenceSnapshot>,
    state: watch::Receiver<ConnectionState>,
    identity: watch::Receiver<Identity>,
}

impl ClientHandle {
    /// Change the display name; persisted and broadcast immediately.
    pub async fn set_name(&self, name: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(Command::SetName(name.into())).await
    }

    /// Change the sharing mode; persisted and broadcast immediately.
    pub async fn set_sharing_mode(&self, mode: SharingMode) -> Result<(), ProtocolError> {
        self.send(Command::SetSharingMode(mode)).await
    }

    /// Leave the current room and join `room` with an empty visitor table.
    pub async fn switch_room(&self, room: RoomId) -> Result<(), ProtocolError> {
        self.send(Command::SwitchRoom(room)).await
    }

    /// Close the connection and stop the event loop.
    pub async fn shutdown(&self) -> Result<(), ProtocolError> {
        self.send(Command::Shutdown).await
    }

    /// Renderer read model, re-published on every table change.
    pub fn snapshots(&self) -> watch::Receiver<PresenceSnapshot> {
        self.snapshots.clone()
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Local identity as last seen by the event loop.
    pub fn identity(&self) -> Identity {
        self.identity.borrow().clone()
    }

    async fn send(&self, command: Command) -> Result<(), ProtocolError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Event loop
// ────────────────────────────────────────────────────────────────────────────

/// What to do after a connection attempt or session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    /// Connect again right away (room switch).
    Reconnect,
    /// Connection lost or refused; wait out the backoff first.
    Retry,
    Shutdown,
}

/// The presence client. Owns every piece of mutable client state; only
/// [`PresenceClient::run`] touches it.
pub struct PresenceClient<L> {
    config: ClientConfig,
    identity: IdentityStore,
    privacy: PrivacyFilter,
    presence: PresenceStore,
    location: CachedLocationSource<L>,
    room: RoomId,
    backoff: Backoff,
    gate: ReportGate,
    commands: mpsc::Receiver<Command>,
    snapshot_tx: watch::Sender<PresenceSnapshot>,
    state_tx: watch::Sender<ConnectionState>,
    identity_tx: watch::Sender<Identity>,
}

impl<L: LocationSource> PresenceClient<L> {
    /// Create a client for `room` and the handle that controls it.
    ///
    /// Nothing happens until [`run`](Self::run) is awaited or spawned.
    pub fn new(
        config: ClientConfig,
        identity: IdentityStore,
        location: L,
        room: RoomId,
    ) -> (Self, ClientHandle) {
        let (command_tx, commands) = mpsc::channel(config.command_capacity.max(1));
        let (snapshot_tx, snapshots) = watch::channel(PresenceSnapshot::default());
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (identity_tx, identity_rx) = watch::channel(identity.identity().clone());

        let client = Self {
            privacy: PrivacyFilter::new(config.fuzz_radius_deg),
            presence: PresenceStore::new(identity.uid()),
            location: CachedLocationSource::new(
                location,
                config.position_max_age,
                config.position_timeout,
            ),
            backoff: Backoff::new(config.backoff.clone()),
            gate: ReportGate::new(),
            config,
            identity,
            room,
            commands,
            snapshot_tx,
            state_tx,
            identity_tx,
        };
        let handle = ClientHandle {
            commands: command_tx,
            snapshots,
            state,
            identity: identity_rx,
        };
        (client, handle)
    }

    /// Replace the session's fuzz offset.
    pub fn with_privacy(mut self, privacy: PrivacyFilter) -> Self {
        self.privacy = privacy;
        self
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    /// Spawn the event loop onto the current runtime.
    pub fn spawn(self) -> JoinHandle<()>
    where
        L: 'static,
    {
        tokio::spawn(self.run())
    }

    /// Run until shut down (by command or by dropping every handle).
    pub async fn run(mut self) {
        let mut next = Next::Reconnect;
        loop {
            if next == Next::Retry {
                next = self.wait_backoff().await;
                if next == Next::Shutdown {
                    break;
                }
            }

            next = self.connect().await;
            if next == Next::Shutdown {
                break;
            }
        }

        self.set_state(ConnectionState::Closed);
        log::info!("Presence client for {} stopped", self.identity.uid());
    }

    /// One connection attempt, then the session if it opens.
    async fn connect(&mut self) -> Next {
        let url = endpoint(&self.config.relay_url, &self.room, self.identity.uid());
        self.set_state(ConnectionState::Connecting);
        log::info!("Connecting to room {} at {}", self.room, self.config.relay_url);

        let attempt = tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(url),
        );
        tokio::pin!(attempt);
        loop {
            tokio::select! {
                result = &mut attempt => return match result {
                    Ok(Ok((ws, _))) => {
                        self.backoff.reset();
                        self.session(ws).await
                    }
                    Ok(Err(e)) => {
                        log::warn!("Connection to room {} failed: {e}", self.room);
                        Next::Retry
                    }
                    Err(_) => {
                        log::warn!(
                            "Connection to room {} timed out after {:?}",
                            self.room,
                            self.config.connect_timeout
                        );
                        Next::Retry
                    }
                },
                command = self.commands.recv() => {
                    if let Some(next) = self.on_idle_command(command) {
                        return next;
                    }
                }
            }
        }
    }

    /// Drive one open connection until it ends.
    async fn session(&mut self, ws: WsStream) -> Next {
        let (mut sink, mut stream) = ws.split();
        self.gate.reset();
        self.set_state(ConnectionState::Open);
        log::info!("Joined room {} as {}", self.room, self.identity.uid());

        // The relay replays everyone it still knows; anyone else is gone.
        if !self.presence.is_empty() {
            self.presence.clear();
            self.snapshot_tx.send_replace(self.presence.snapshot());
        }

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; the open report covers it.
        ticker.tick().await;

        if let Err(e) = self.send_report(&mut sink, true).await {
            log::warn!("Failed to announce presence: {e}");
            return Next::Retry;
        }

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.on_frame(text.as_str()),
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            return Next::Retry;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Relay closed the connection for room {}", self.room);
                        return Next::Retry;
                    }
                    Some(Err(e)) => {
                        log::warn!("Connection error in room {}: {e}", self.room);
                        return Next::Retry;
                    }
                    Some(Ok(_)) => {}
                },

                _ = ticker.tick(), if self.identity.sharing_mode().is_sharing() => {
                    if let Err(e) = self.send_report(&mut sink, false).await {
                        log::warn!("Failed to send location report: {e}");
                        return Next::Retry;
                    }
                }

                command = self.commands.recv() => {
                    let Some(command) = command else {
                        let _ = sink.close().await;
                        return Next::Shutdown;
                    };
                    match command {
                        Command::SetName(name) => {
                            if self.set_name(name) {
                                if let Err(e) = self.send_report(&mut sink, true).await {
                                    log::warn!("Failed to broadcast name change: {e}");
                                    return Next::Retry;
                                }
                            }
                        }
                        Command::SetSharingMode(mode) => {
                            if self.set_sharing_mode(mode) {
                                if mode.is_sharing() {
                                    ticker.reset();
                                }
                                if let Err(e) = self.send_report(&mut sink, true).await {
                                    log::warn!("Failed to broadcast sharing mode: {e}");
                                    return Next::Retry;
                                }
                            }
                        }
                        Command::SwitchRoom(room) => {
                            if room != self.room {
                                let _ = sink.close().await;
                                self.enter_room(room);
                                return Next::Reconnect;
                            }
                        }
                        Command::Shutdown => {
                            let _ = sink.close().await;
                            return Next::Shutdown;
                        }
                    }
                }
            }
        }
    }

    /// Sleep out the backoff while still serving commands.
    async fn wait_backoff(&mut self) -> Next {
        let delay = self.backoff.next_delay();
        self.set_state(ConnectionState::Reconnecting);
        log::debug!("Reconnecting to room {} in {delay:?}", self.room);

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Next::Reconnect,
                command = self.commands.recv() => {
                    if let Some(next) = self.on_idle_command(command) {
                        return next;
                    }
                }
            }
        }
    }

    /// Apply a command that arrived while no connection is open.
    ///
    /// Identity changes are kept for the next open report.
    fn on_idle_command(&mut self, command: Option<Command>) -> Option<Next> {
        match command {
            None | Some(Command::Shutdown) => Some(Next::Shutdown),
            Some(Command::SetName(name)) => {
                self.set_name(name);
                None
            }
            Some(Command::SetSharingMode(mode)) => {
                self.set_sharing_mode(mode);
                None
            }
            Some(Command::SwitchRoom(room)) if room != self.room => {
                self.enter_room(room);
                self.backoff.reset();
                Some(Next::Reconnect)
            }
            Some(Command::SwitchRoom(_)) => None,
        }
    }

    fn on_frame(&mut self, text: &str) {
        let event = match PeerEvent::decode(text) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Dropping malformed frame: {e}");
                return;
            }
        };

        match self.presence.apply(&event, &mut self.identity) {
            Ok(outcome) => {
                if outcome.changed() {
                    self.snapshot_tx.send_replace(self.presence.snapshot());
                }
                if outcome.adopted_name {
                    self.publish_identity();
                }
            }
            Err(e) => log::warn!("Dropping event for {:?}: {e}", event.uid),
        }
    }

    /// Build the report to send now, or `None` if there is nothing to send.
    async fn build_report(&mut self, force: bool) -> Option<LocationReport> {
        let mode = self.identity.sharing_mode();
        let location = if mode.is_sharing() {
            match self.location.fix().await {
                Ok(sample) => self.privacy.report(&sample, mode),
                Err(e) if force => match self.location.last().copied() {
                    Some(sample) => {
                        log::warn!("Position unavailable ({e}), reusing last fix");
                        self.privacy.report(&sample, mode)
                    }
                    None => {
                        // Still announce the name; peers draw nothing.
                        log::warn!("Position unavailable ({e}), announcing without a location");
                        None
                    }
                },
                Err(e) => {
                    log::warn!("Skipping location report: {e}");
                    return None;
                }
            }
        } else {
            None
        };

        if !self.gate.should_send(&location, force) {
            log::trace!("Location unchanged, report suppressed");
            return None;
        }
        Some(LocationReport::new(
            self.identity.uid(),
            self.identity.name(),
            location,
        ))
    }

    async fn send_report(&mut self, sink: &mut WsSink, force: bool) -> Result<(), tungstenite::Error> {
        let Some(report) = self.build_report(force).await else {
            return Ok(());
        };
        let frame = match report.encode() {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Failed to encode location report: {e}");
                return Ok(());
            }
        };

        sink.send(Message::text(frame)).await?;
        log::debug!("Sent report for {} in room {}", report.uid, self.room);
        self.gate.record(report.location);
        Ok(())
    }

    fn set_name(&mut self, name: String) -> bool {
        let changed = self.identity.set_name(name);
        if changed {
            self.publish_identity();
        }
        changed
    }

    fn set_sharing_mode(&mut self, mode: SharingMode) -> bool {
        let changed = self.identity.set_sharing_mode(mode);
        if changed {
            log::info!("Sharing mode is now {mode}");
            self.publish_identity();
        }
        changed
    }

    /// Switch rooms: nothing from the old room survives.
    fn enter_room(&mut self, room: RoomId) {
        log::info!("Switching from room {} to {room}", self.room);
        self.room = room;
        self.presence.clear();
        self.gate.reset();
        self.snapshot_tx.send_replace(self.presence.snapshot());
    }

    fn publish_identity(&self) {
        self.identity_tx.send_replace(self.identity.identity().clone());
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::{FixedLocationSource, LocationError, ScriptedLocationSource};
    use crate::privacy::FuzzOffset;
    use crate::protocol::Coordinates;
    use tokio::time::timeout;

    fn room(id: &str) -> RoomId {
        RoomId::parse(id).unwrap()
    }

    fn alice() -> IdentityStore {
        let mut identity = Identity::with_uid("a");
        identity.name = "Alice".into();
        IdentityStore::in_memory(identity)
    }

    /// A relay url nobody listens on.
    fn dead_relay() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("ws://127.0.0.1:{port}/stream")
    }

    fn fast_config(relay_url: String) -> ClientConfig {
        ClientConfig {
            relay_url,
            backoff: BackoffConfig {
                initial: Duration::from_millis(20),
                max: Duration::from_millis(50),
                factor: 2.0,
            },
            ..ClientConfig::default()
        }
    }

    async fn wait_for_state(
        rx: &mut watch::Receiver<ConnectionState>,
        want: ConnectionState,
    ) {
        timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
            .await
            .expect("timed out waiting for state")
            .unwrap();
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 8000, 16000, 30000, 30000]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_factor_below_one_is_constant() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(1),
            factor: 0.5,
        });
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
    }

    #[test]
    fn test_report_gate() {
        let mut gate = ReportGate::new();
        let here = Some("1,2".to_string());

        assert!(gate.should_send(&here, false));
        gate.record(here.clone());
        assert!(!gate.should_send(&here, false));
        assert!(gate.should_send(&here, true));
        assert!(gate.should_send(&None, false));

        gate.record(None);
        assert!(!gate.should_send(&None, false));

        gate.reset();
        assert!(gate.should_send(&None, false));
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let (client, handle) = PresenceClient::new(
            ClientConfig::default(),
            alice(),
            FixedLocationSource::new(0.0, 0.0),
            room("block-1"),
        );

        assert_eq!(handle.connection_state(), ConnectionState::Disconnected);
        assert!(handle.snapshot().is_empty());
        assert_eq!(handle.identity().name, "Alice");
        assert_eq!(client.room().as_str(), "block-1");
    }

    #[tokio::test]
    async fn test_handle_errors_once_client_dropped() {
        let (client, handle) = PresenceClient::new(
            ClientConfig::default(),
            alice(),
            FixedLocationSource::new(0.0, 0.0),
            room("block-1"),
        );
        drop(client);
        assert!(matches!(
            handle.set_name("Bob").await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_build_report_full_then_suppressed() {
        let (mut client, _handle) = PresenceClient::new(
            ClientConfig::default(),
            alice(),
            FixedLocationSource::new(-122.33, 47.60),
            room("r"),
        );

        let report = client.build_report(true).await.unwrap();
        assert_eq!(report.uid, "a");
        assert_eq!(report.name, "Alice");
        assert_eq!(
            Coordinates::parse(report.location.as_deref().unwrap()).unwrap(),
            Coordinates::new(-122.33, 47.60)
        );

        client.gate.record(report.location.clone());
        assert!(client.build_report(false).await.is_none());
        assert!(client.build_report(true).await.is_some());
    }

    #[tokio::test]
    async fn test_build_report_off_is_null() {
        let mut identity = alice();
        identity.set_sharing_mode(SharingMode::Off);
        let (mut client, _handle) = PresenceClient::new(
            ClientConfig::default(),
            identity,
            FixedLocationSource::new(1.0, 2.0),
            room("r"),
        );

        let report = client.build_report(true).await.unwrap();
        assert_eq!(report.location, None);
    }

    #[tokio::test]
    async fn test_build_report_fuzzy_uses_session_offset() {
        let mut identity = alice();
        identity.set_sharing_mode(SharingMode::Fuzzy);
        let (client, _handle) = PresenceClient::new(
            ClientConfig::default(),
            identity,
            FixedLocationSource::new(10.0, 20.0),
            room("r"),
        );
        let mut client = client.with_privacy(PrivacyFilter::with_offset(FuzzOffset::new(0.01, -0.01)));

        let report = client.build_report(true).await.unwrap();
        let c = Coordinates::parse(report.location.as_deref().unwrap()).unwrap();
        assert!((c.lon - 10.01).abs() < 1e-9);
        assert!((c.lat - 19.99).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_build_report_positioning_error_skips_cycle() {
        let config = ClientConfig {
            position_max_age: Duration::ZERO,
            ..ClientConfig::default()
        };
        let source = ScriptedLocationSource::new(vec![
            Err(LocationError::PermissionDenied),
            Ok(Coordinates::new(3.0, 4.0)),
            Err(LocationError::Timeout),
        ]);
        let (mut client, _handle) = PresenceClient::new(config, alice(), source, room("r"));

        // Timer cycle with no fix: skipped.
        assert!(client.build_report(false).await.is_none());
        assert!(client.build_report(true).await.is_some());
        // Forced after a failure falls back to the last known fix.
        let report = client.build_report(true).await.unwrap();
        assert_eq!(report.location.as_deref(), Some("3,4"));
    }

    #[tokio::test]
    async fn test_forced_report_without_any_fix_announces_name() {
        let source = ScriptedLocationSource::new(vec![Err(LocationError::PermissionDenied)]);
        let (mut client, _handle) =
            PresenceClient::new(ClientConfig::default(), alice(), source, room("r"));

        let report = client.build_report(true).await.unwrap();
        assert_eq!(report.name, "Alice");
        assert_eq!(report.location, None);

        // Timer cycles stay quiet until a fix arrives.
        client.gate.record(report.location);
        assert!(client.build_report(false).await.is_none());
    }

    #[tokio::test]
    async fn test_on_frame_publishes_snapshot() {
        let (mut client, handle) = PresenceClient::new(
            ClientConfig::default(),
            alice(),
            FixedLocationSource::new(0.0, 0.0),
            room("r"),
        );

        client.on_frame(r#"{"uid":"b","name":"Bob","location":"-122.30,47.62","active":true}"#);
        assert_eq!(handle.snapshot().others.len(), 1);

        client.on_frame("not json");
        client.on_frame(r#"{"uid":"b","location":"garbage","active":true}"#);
        assert_eq!(handle.snapshot().others[0].name(), "Bob");

        client.on_frame(r#"{"uid":"b","location":null}"#);
        assert!(handle.snapshot().others.is_empty());
    }

    #[tokio::test]
    async fn test_on_frame_adopts_relay_name() {
        let (mut client, handle) = PresenceClient::new(
            ClientConfig::default(),
            alice(),
            FixedLocationSource::new(0.0, 0.0),
            room("r"),
        );

        client.on_frame(r#"{"uid":"a","name":"Alicia","location":"1,1","active":true}"#);
        assert_eq!(handle.identity().name, "Alicia");
        assert!(handle.snapshot().local.is_some());
    }

    #[tokio::test]
    async fn test_enter_room_clears_table() {
        let (mut client, handle) = PresenceClient::new(
            ClientConfig::default(),
            alice(),
            FixedLocationSource::new(0.0, 0.0),
            room("one"),
        );
        client.on_frame(r#"{"uid":"b","location":"1,1","active":true}"#);
        assert!(!handle.snapshot().is_empty());

        client.enter_room(room("two"));
        assert!(handle.snapshot().is_empty());
        assert_eq!(client.room().as_str(), "two");
    }

    #[tokio::test]
    async fn test_unreachable_relay_reconnects_until_shutdown() {
        let (client, handle) = PresenceClient::new(
            fast_config(dead_relay()),
            alice(),
            FixedLocationSource::new(0.0, 0.0),
            room("r"),
        );
        let task = client.spawn();

        let mut state = handle.state();
        wait_for_state(&mut state, ConnectionState::Reconnecting).await;

        // Commands are still served between attempts.
        handle.set_name("Alicia").await.unwrap();
        handle.set_sharing_mode(SharingMode::Off).await.unwrap();
        handle.shutdown().await.unwrap();

        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(handle.connection_state(), ConnectionState::Closed);
        let identity = handle.identity();
        assert_eq!(identity.name, "Alicia");
        assert_eq!(identity.sharing_mode, SharingMode::Off);
    }

    /// A relay that completes TCP but never answers the WebSocket upgrade.
    async fn stalled_relay() -> (tokio::net::TcpListener, String) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/stream", listener.local_addr().unwrap());
        (listener, url)
    }

    #[tokio::test]
    async fn test_stalled_handshake_times_out_into_backoff() {
        let (_listener, url) = stalled_relay().await;
        let config = ClientConfig {
            connect_timeout: Duration::from_millis(100),
            ..fast_config(url)
        };
        let (client, handle) =
            PresenceClient::new(config, alice(), FixedLocationSource::new(0.0, 0.0), room("r"));
        let mut state = handle.state();
        let task = client.spawn();

        wait_for_state(&mut state, ConnectionState::Reconnecting).await;
        handle.shutdown().await.unwrap();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_cancels_stalled_connect() {
        let (_listener, url) = stalled_relay().await;
        let config = ClientConfig {
            connect_timeout: Duration::from_secs(60),
            ..fast_config(url)
        };
        let (client, handle) =
            PresenceClient::new(config, alice(), FixedLocationSource::new(0.0, 0.0), room("r"));
        let mut state = handle.state();
        let task = client.spawn();
        wait_for_state(&mut state, ConnectionState::Connecting).await;

        handle.set_name("Alicia").await.unwrap();
        handle.shutdown().await.unwrap();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(handle.connection_state(), ConnectionState::Closed);
        assert_eq!(handle.identity().name, "Alicia");
    }

    #[tokio::test]
    async fn test_room_switch_abandons_stalled_connect() {
        use tokio::io::AsyncReadExt;

        let (listener, url) = stalled_relay().await;
        let config = ClientConfig {
            connect_timeout: Duration::from_secs(60),
            ..fast_config(url)
        };
        let (client, handle) =
            PresenceClient::new(config, alice(), FixedLocationSource::new(0.0, 0.0), room("one"));
        let task = client.spawn();

        let (_first, _) = listener.accept().await.unwrap();
        handle.switch_room(room("two")).await.unwrap();

        let (mut second, _) = timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 512];
        while !request.windows(2).any(|w| w == b"\r\n") {
            let n = timeout(Duration::from_secs(5), second.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0, "connection closed before the request line");
            request.extend_from_slice(&buf[..n]);
        }
        let request = String::from_utf8_lossy(&request);
        assert!(request.contains("room-id=two"), "{request}");

        handle.shutdown().await.unwrap();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dropping_all_handles_stops_client() {
        let (client, handle) = PresenceClient::new(
            fast_config(dead_relay()),
            alice(),
            FixedLocationSource::new(0.0, 0.0),
            room("r"),
        );
        let mut state = handle.state();
        let task = client.spawn();
        wait_for_state(&mut state, ConnectionState::Reconnecting).await;

        drop(handle);
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(*state.borrow(), ConnectionState::Closed);
    }
}
