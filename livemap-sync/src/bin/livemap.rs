//! `livemap`: run a presence relay or a command-line presence client.

use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::info;

use livemap_sync::{
    ClientConfig, FixedLocationSource, FsKeyValueStore, IdentityStore, KeyValueStore,
    MemoryKeyValueStore, PresenceClient, PresenceSnapshot, Relay, RelayConfig, RoomId,
    SharingMode,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Live-location presence relay and client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay server
    Relay {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: String,
        /// WebSocket path clients connect to
        #[arg(long, default_value = "/stream")]
        path: String,
    },
    /// Join a room with a fixed position and log what is seen
    Client {
        /// Relay endpoint, without query
        #[arg(long, default_value = "ws://127.0.0.1:8080/stream")]
        relay: String,
        /// Room (block/page) identifier
        #[arg(long)]
        room: String,
        /// Display name to set before joining
        #[arg(long)]
        name: Option<String>,
        /// Sharing mode: full, off or fuzzy
        #[arg(long)]
        mode: Option<SharingMode>,
        /// Longitude to report
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        lon: f64,
        /// Latitude to report
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        lat: f64,
        /// Where the identity is stored (platform data directory by default)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Command::Relay { bind, path } => {
            let relay = Relay::new(RelayConfig {
                bind_addr: bind,
                path,
                ..RelayConfig::default()
            });
            tokio::select! {
                result = relay.run() => result?,
                _ = tokio::signal::ctrl_c() => info!("Relay shutting down"),
            }
        }
        Command::Client {
            relay,
            room,
            name,
            mode,
            lon,
            lat,
            data_dir,
        } => {
            let room = RoomId::parse(room)?;
            let mut identity = IdentityStore::load(open_store(data_dir));
            if let Some(name) = name {
                identity.set_name(name);
            }
            if let Some(mode) = mode {
                identity.set_sharing_mode(mode);
            }
            info!(
                "Identity {} ({:?}), sharing {}",
                identity.uid(),
                identity.name(),
                identity.sharing_mode()
            );

            let config = ClientConfig {
                relay_url: relay,
                ..ClientConfig::default()
            };
            let (client, handle) =
                PresenceClient::new(config, identity, FixedLocationSource::new(lon, lat), room);
            let task = client.spawn();

            let mut snapshots = handle.snapshots();
            loop {
                tokio::select! {
                    changed = snapshots.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        log_snapshot(&snapshots.borrow_and_update());
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("Leaving room");
                        handle.shutdown().await?;
                        break;
                    }
                }
            }
            task.await?;
        }
    }

    Ok(())
}

/// Identity storage: the given directory, the platform data directory, or
/// memory if neither can be opened.
fn open_store(data_dir: Option<PathBuf>) -> Box<dyn KeyValueStore> {
    let store = match data_dir {
        Some(dir) => FsKeyValueStore::new(dir),
        None => FsKeyValueStore::at_default_location(),
    };
    match store {
        Ok(store) => {
            info!("Identity stored in {}", store.base().display());
            Box::new(store)
        }
        Err(e) => {
            log::warn!("Identity storage unavailable, using memory: {e}");
            Box::new(MemoryKeyValueStore::new())
        }
    }
}

fn log_snapshot(snapshot: &PresenceSnapshot) {
    match &snapshot.local {
        Some(me) => info!("me: {} at {}", me.name(), me.coordinates),
        None => info!("me: not on the map"),
    }
    for visitor in &snapshot.others {
        info!(
            "  {} {:?} at {} (opacity {})",
            visitor.uid,
            visitor.name(),
            visitor.coordinates,
            visitor.opacity()
        );
    }
}
