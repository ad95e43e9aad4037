//! board-server: Hub daemon for collaborative file boards.
//!
//! `serve` stores boards under a root directory and relays changes between
//! client sessions. `follow` runs a headless sync session against a hub and
//! logs what happens on the board.

use anyhow::{Context, Result};
use board_sync::{CanvasDocument, InMemoryCanvas, SyncEvent, SyncSession, SystemClock};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use board_server::{
    BoardStore, ClientOptions, Config, FileWatcher, Hub, NativeFs, RemoteTransport,
    WebSocketServer,
};

#[derive(Parser, Debug)]
#[command(name = "board-server")]
#[command(about = "Collaborative file board hub")]
struct Args {
    /// Directory holding config.json
    #[arg(long, global = true, default_value = "./config", env = "BOARD_CONFIG_PATH")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve boards from a storage directory
    Serve {
        /// Storage root, one folder per board
        #[arg(short, long, env = "BOARD_ROOT")]
        root: PathBuf,

        /// Address to listen on for client sessions
        #[arg(short, long, default_value = "0.0.0.0:8080", env = "BOARD_LISTEN")]
        listen: String,

        /// Do not watch the storage root for external edits
        #[arg(long)]
        no_watch: bool,
    },
    /// Follow a board headlessly and log sync activity
    Follow {
        /// Hub URL, e.g. ws://localhost:8080
        #[arg(long, env = "BOARD_URL")]
        url: String,

        /// Board to join
        #[arg(long)]
        board: String,

        /// Bearer token for the hub
        #[arg(long, env = "BOARD_TOKEN")]
        token: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,board_server=debug,board_sync=debug"
    } else {
        "info,board_server=info,board_sync=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::load(&args.config)?;

    match args.command {
        Command::Serve {
            root,
            listen,
            no_watch,
        } => serve(config, root, listen, no_watch).await,
        Command::Follow { url, board, token } => follow(config, url, board, token).await,
    }
}

async fn serve(config: Config, root: PathBuf, listen: String, no_watch: bool) -> Result<()> {
    info!("Starting board-server");
    info!("Storage root: {:?}", root);

    std::fs::create_dir_all(&root)
        .with_context(|| format!("Failed to create storage root: {:?}", root))?;

    if config.tokens.is_empty() {
        warn!("No tokens configured, accepting every session");
    }

    let peer_id = uuid::Uuid::new_v4().to_string();
    let server = WebSocketServer::new(peer_id, config.tokens.clone());
    let listener = WebSocketServer::bind(&listen).await?;
    let store = BoardStore::new(NativeFs::new(root.clone()));

    let watcher = if no_watch {
        None
    } else {
        let watcher = FileWatcher::new(root, config.watch_debounce())?;
        info!("Watching {:?}", watcher.root());
        Some(watcher)
    };

    info!("Hub running. Press Ctrl+C to stop.");
    Hub::new(server, store)
        .run(listener, watcher, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}

async fn follow(config: Config, url: String, board: String, token: Option<String>) -> Result<()> {
    info!("Following board {} on {}", board, url);

    let transport = RemoteTransport::connect(ClientOptions {
        url,
        peer_id: uuid::Uuid::new_v4().to_string(),
        token,
        reconnect: config.client.reconnect.clone(),
    });
    let session = SyncSession::new(
        config.client.session_config(&board),
        transport.clone(),
        Arc::new(SystemClock),
    );

    let _events = session.manager().subscribe(|event| match event {
        SyncEvent::SyncFailed { error, .. } => warn!("Sync failed: {}", error),
        SyncEvent::ChangeApplied { path, .. } => info!("Applied change to {}", path),
        SyncEvent::ConflictDetected { conflict, .. } => {
            info!("Conflict on element {}", conflict.element_id)
        }
        other => tracing::debug!("{:?}", other),
    });

    session.initialize();
    let canvas = Arc::new(InMemoryCanvas::new());
    session.set_document_instance(canvas.clone());

    tokio::select! {
        _ = transport.drive(&session, config.client.tick_interval()) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    info!(
        "Board {} has {} element(s), sync status {:?}",
        board,
        canvas.elements().len(),
        session.indicator()
    );
    session.shutdown();
    transport.close();
    Ok(())
}
