//! Edge Link client: headless entry point.
//!
//! Loads the configuration, initialises logging, builds the [`AppState`], and
//! runs one subcommand against it.
//!
//! # Usage
//!
//! ```text
//! edge-link [OPTIONS] <COMMAND>
//!
//! Commands:
//!   scan            Print nearby devices as they are discovered
//!   pair            Pair with a device (key or pair_device/... route)
//!   list            Show every known device as JSON
//!   forget          Delete a paired device and its bookmark
//!   bookmarks       Add, remove or list bookmarks
//!   connect         Open a session, send control messages, hold it open
//!   reset-key       Regenerate the client key (closes every session)
//!   reset-database  Delete every paired device and bookmark
//!   about           Print version and client key fingerprint
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable                   | Description                          |
//! |----------------------------|--------------------------------------|
//! | `EDGE_LINK_CONFIG`         | Path of the config file              |
//! | `EDGE_LINK_DATA_DIR`       | Directory for registry and key files |
//! | `EDGE_LINK_DISCOVERY_PORT` | UDP port devices announce on         |
//! | `RUST_LOG`                 | Overrides `client.log_level`         |
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load_config()         -- TOML file or defaults
//!  └─ AppState::build()     -- stores, discovery, transport, managers
//!  └─ run(command)
//!       └─ AppState::shutdown()
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use edge_core::{DeviceKey, PairingRoute};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use edge_client::application::pair_device::PairingRequest;
use edge_client::application::transport::AddressResolver;
use edge_client::infrastructure::app_state::{AppState, PairedDeviceDto};
use edge_client::infrastructure::storage::config::{
    config_file_path, data_dir, load_config_from, AppConfig,
};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Edge Link client.
///
/// Discovers IoT edge devices on the local network, pairs with them, and
/// opens shared secure sessions.
#[derive(Debug, Parser)]
#[command(
    name = "edge-link",
    about = "Discover, pair with, and connect to IoT edge devices",
    version
)]
struct Cli {
    /// Config file to read instead of the platform default.
    #[arg(long, env = "EDGE_LINK_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for the registry, bookmarks, and client key files.
    #[arg(long, env = "EDGE_LINK_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// UDP port devices announce themselves on.
    #[arg(long, env = "EDGE_LINK_DISCOVERY_PORT")]
    discovery_port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print nearby devices as they are discovered.
    Scan {
        /// Stop after this many seconds (Ctrl-C stops earlier).
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
    /// Pair with a device.
    Pair {
        /// `productId/deviceId` or a `pair_device/...` route.
        target: String,
        /// Device address; looked up by discovery when omitted.
        #[arg(long)]
        address: Option<SocketAddr>,
        #[arg(long)]
        password: Option<String>,
        /// Out-of-band session-config-token.
        #[arg(long)]
        sct: Option<String>,
        /// Name to store when the device does not report one.
        #[arg(long)]
        name: Option<String>,
        /// Bookmark the device after pairing.
        #[arg(long)]
        bookmark: bool,
        /// How long to listen for the device before pairing.
        #[arg(long, default_value_t = 3)]
        discover_secs: u64,
    },
    /// Show every known device as JSON.
    List {
        /// Listen this long first so nearby devices show up too.
        #[arg(long, default_value_t = 0)]
        discover_secs: u64,
    },
    /// Delete a paired device and its bookmark.
    Forget { key: DeviceKey },
    /// Add, remove or list bookmarks.
    Bookmarks {
        #[command(subcommand)]
        action: BookmarkAction,
    },
    /// Open a session, send control messages, and hold it until Ctrl-C or
    /// the device drops the link.
    Connect {
        key: DeviceKey,
        /// Control message to send once connected (repeatable).
        #[arg(long = "send")]
        messages: Vec<String>,
        /// How long to listen for the device before connecting.
        #[arg(long, default_value_t = 3)]
        discover_secs: u64,
    },
    /// Regenerate the client key.  Every device must be paired again.
    ResetKey,
    /// Delete every paired device and bookmark.
    ResetDatabase {
        /// Confirm the wipe.
        #[arg(long)]
        yes: bool,
    },
    /// Print version and client key fingerprint.
    About,
}

#[derive(Debug, Subcommand)]
enum BookmarkAction {
    Add { key: DeviceKey },
    Remove { key: DeviceKey },
    List,
}

impl Cli {
    /// Loads the config file and applies command-line overrides.
    fn load_config(&self) -> anyhow::Result<AppConfig> {
        let path = match &self.config {
            Some(path) => path.clone(),
            None => config_file_path().context("cannot locate the config file")?,
        };
        let mut config = load_config_from(&path)
            .with_context(|| format!("failed to load config from {}", path.display()))?;

        if let Some(dir) = &self.data_dir {
            config.client.data_dir = Some(dir.clone());
        }
        if let Some(port) = self.discovery_port {
            config.discovery.port = port;
        }
        Ok(config)
    }
}

/// Parses the `pair` target into a request.
fn pairing_request(target: &str) -> anyhow::Result<PairingRequest> {
    if target.contains('?') || target.starts_with("pair_device/") {
        let route = PairingRoute::parse(target)
            .with_context(|| format!("invalid pairing route {target:?}"))?;
        return Ok(PairingRequest::from_route(&route));
    }
    let key: DeviceKey = target
        .parse()
        .with_context(|| format!("invalid device key {target:?}"))?;
    Ok(PairingRequest::manual(key))
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    // Level comes from the config file; `RUST_LOG` wins when set.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.client.log_level)),
        )
        .init();

    info!("Edge Link {} starting", env!("CARGO_PKG_VERSION"));

    let state = AppState::build(config).context("failed to initialise the client")?;

    // Ctrl-C cancels whatever the command is waiting on.
    let cancel = CancellationToken::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                cancel_on_signal.cancel();
            }
            Err(e) => error!("failed to listen for Ctrl-C: {e}"),
        }
    });

    let result = run(&state, cli.command, &cancel).await;
    state.shutdown().await;
    result
}

async fn run(state: &Arc<AppState>, command: Command, cancel: &CancellationToken) -> anyhow::Result<()> {
    match command {
        Command::Scan { seconds } => scan(state, Duration::from_secs(seconds), cancel).await,

        Command::Pair {
            target,
            address,
            password,
            sct,
            name,
            bookmark,
            discover_secs,
        } => {
            let mut request = pairing_request(&target)?;
            if let Some(address) = address {
                request = request.with_address(address);
            } else {
                wait_for_device(state, &request.key, Duration::from_secs(discover_secs), cancel)
                    .await;
            }
            if let Some(password) = password {
                request = request.with_password(password);
            }
            if let Some(sct) = sct {
                request = request.with_sct(sct);
            }
            if let Some(name) = name {
                request = request.with_display_name(name);
            }

            let record = if bookmark {
                state
                    .pairing
                    .pair_and_bookmark(request, &state.bookmarks, cancel)
                    .await?
            } else {
                state.pairing.pair(request, cancel).await?
            };
            print_json(&PairedDeviceDto::from(&record))
        }

        Command::List { discover_secs } => {
            if discover_secs > 0 {
                let mut rx = state.discovery.start_scanning();
                let _ = tokio::time::timeout(Duration::from_secs(discover_secs), async {
                    while !cancel.is_cancelled() && rx.changed().await.is_ok() {}
                })
                .await;
            }
            print_json(&state.overview()?.all())
        }

        Command::Forget { key } => match state.forget(&key)? {
            Some(record) => print_json(&PairedDeviceDto::from(&record)),
            None => anyhow::bail!("{key} is not paired"),
        },

        Command::Bookmarks { action } => match action {
            BookmarkAction::Add { key } => {
                if !state.bookmarks.add(&key)? {
                    info!("{key} was already bookmarked");
                }
                Ok(())
            }
            BookmarkAction::Remove { key } => {
                if !state.bookmarks.remove(&key)? {
                    info!("{key} was not bookmarked");
                }
                Ok(())
            }
            BookmarkAction::List => print_json(&state.overview()?.bookmarked()),
        },

        Command::Connect {
            key,
            messages,
            discover_secs,
        } => {
            wait_for_device(state, &key, Duration::from_secs(discover_secs), cancel).await;
            let handle = state.sessions.acquire(&key, cancel).await?;
            info!("connected to {key} (handle {})", handle.id());

            for message in &messages {
                handle.send(message).await?;
            }

            tokio::select! {
                _ = cancel.cancelled() => {}
                reason = handle.closed() => warn!("session to {key} closed: {reason:?}"),
            }
            handle.release();
            Ok(())
        }

        Command::ResetKey => {
            let identity = state.reset_client_key().await?;
            println!("new client key {}", identity.fingerprint);
            Ok(())
        }

        Command::ResetDatabase { yes } => {
            if !yes {
                anyhow::bail!("refusing to delete every paired device without --yes");
            }
            let removed = state.reset_database().await?;
            println!("removed {removed} paired device(s)");
            Ok(())
        }

        Command::About => {
            println!("{}", state.credentials.version());
            println!("data directory: {}", data_dir(&state.config)?.display());
            Ok(())
        }
    }
}

/// Prints each new discovery snapshot until `duration` elapses.
async fn scan(state: &AppState, duration: Duration, cancel: &CancellationToken) -> anyhow::Result<()> {
    let mut rx = state.discovery.start_scanning();
    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = &mut deadline => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = rx.borrow_and_update().clone();
                println!("-- {} device(s)", snapshot.len());
                for device in snapshot {
                    let name = device.name.as_deref().unwrap_or("-");
                    println!("{}  {}  {}", device.key, device.address, name);
                }
            }
        }
    }
    Ok(())
}

/// Starts discovery and waits until `key` shows up or `limit` passes.
async fn wait_for_device(
    state: &AppState,
    key: &DeviceKey,
    limit: Duration,
    cancel: &CancellationToken,
) {
    let mut rx = state.discovery.start_scanning();
    let found = tokio::time::timeout(limit, async {
        while state.discovery.resolve(key).is_none() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = rx.changed() => if changed.is_err() { return },
            }
        }
    })
    .await;
    if found.is_err() {
        warn!("{key} was not heard on the network within {limit:?}");
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_pair_with_route() {
        // Arrange / Act
        let cli = Cli::parse_from([
            "edge-link",
            "pair",
            "pair_device/pr/dev?password=pw&",
            "--bookmark",
        ]);

        // Assert
        match cli.command {
            Command::Pair { target, bookmark, discover_secs, .. } => {
                assert_eq!(target, "pair_device/pr/dev?password=pw&");
                assert!(bookmark);
                assert_eq!(discover_secs, 3);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_cli_parses_device_key_argument() {
        let cli = Cli::parse_from(["edge-link", "forget", "pr/dev"]);
        match cli.command {
            Command::Forget { key } => assert_eq!(key, DeviceKey::new("pr", "dev")),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_cli_rejects_malformed_device_key() {
        let result = Cli::try_parse_from(["edge-link", "connect", "no-slash"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_connect_collects_repeated_send_flags() {
        let cli = Cli::parse_from(["edge-link", "connect", "pr/dev", "--send", "a", "--send", "b"]);
        match cli.command {
            Command::Connect { messages, .. } => assert_eq!(messages, vec!["a", "b"]),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_pairing_request_from_route_carries_password() {
        let request = pairing_request("pair_device/pr/dev?password=pw&").unwrap();
        assert_eq!(request.key, DeviceKey::new("pr", "dev"));
        assert_eq!(request.password.as_deref(), Some("pw"));
    }

    #[test]
    fn test_pairing_request_from_plain_key() {
        let request = pairing_request("pr/dev").unwrap();
        assert_eq!(request.key, DeviceKey::new("pr", "dev"));
        assert_eq!(request.password, None);
    }

    #[test]
    fn test_pairing_request_rejects_garbage() {
        assert!(pairing_request("garbage").is_err());
    }

    #[test]
    fn test_cli_overrides_apply_to_loaded_config() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        let cli = Cli::parse_from([
            "edge-link",
            "--config",
            config_path.to_str().unwrap(),
            "--data-dir",
            "/srv/edge",
            "--discovery-port",
            "7000",
            "about",
        ]);

        // Act
        let config = cli.load_config().unwrap();

        // Assert
        assert_eq!(config.client.data_dir, Some(PathBuf::from("/srv/edge")));
        assert_eq!(config.discovery.port, 7000);
    }
}
