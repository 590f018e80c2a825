//! troved: trove backup peer daemon.
//!
//! `troved [<dialect> <peer_id> <access_point> <mc_addr> <mc_port> <mdb_addr> <mdb_port> <mdr_addr> <mdr_port>]`

use std::sync::Arc;

use anyhow::{Context, Result};

use trove_core::config::{ConfigError, TroveConfig};
use trove_services::{ChunkStore, FsStore, PeerState};
use troved::channel::{open_multicast, receive_loop};
use troved::{ChannelKind, Channels, Peer, PeerOptions};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = TroveConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = match TroveConfig::load() {
        Ok(config) => config,
        Err(e @ (ConfigError::InvalidDialect(_) | ConfigError::InvalidValue(..))) => {
            return Err(e).context("invalid configuration override");
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            TroveConfig::default()
        }
    };

    let args: Vec<String> = std::env::args().skip(1).collect();
    if !args.is_empty() {
        config
            .apply_args(&args)
            .context("invalid startup arguments")?;
    }
    let access_point = config.access_point()?;

    tracing::info!(
        peer = config.peer.id,
        dialect = %config.peer.dialect,
        access_point = %access_point,
        "troved starting"
    );

    // Storage
    let peer_dir = config.storage.peer_dir(config.peer.id);
    let store = FsStore::new(peer_dir.clone())?;
    let saved = store.load_state().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "ignoring unreadable saved state");
        None
    });
    let restarted = saved.is_some();
    let state = match saved {
        Some(saved) => PeerState::from_persisted(saved),
        None => PeerState::new(config.storage.max_bytes),
    };
    tracing::info!(root = %peer_dir.display(), restarted, "chunk store initialized");

    // Channels
    let (control, control_socket) = open_multicast(ChannelKind::Control, config.network.control)?;
    let (backup, backup_socket) = open_multicast(ChannelKind::BackupData, config.network.backup)?;
    let (restore, restore_socket) =
        open_multicast(ChannelKind::RestoreData, config.network.restore)?;

    let store: Arc<dyn ChunkStore> = Arc::new(store);
    let peer = Peer::new(
        PeerOptions {
            id: config.peer.id,
            dialect: config.peer.dialect,
            protocol: config.protocol.clone(),
        },
        Channels {
            control,
            backup,
            restore,
        },
        state,
        store,
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let control_task = tokio::spawn(receive_loop(ChannelKind::Control, control_socket, peer.clone()));
    let backup_task = tokio::spawn(receive_loop(ChannelKind::BackupData, backup_socket, peer.clone()));
    let restore_task =
        tokio::spawn(receive_loop(ChannelKind::RestoreData, restore_socket, peer.clone()));
    let persist_task = tokio::spawn(peer.clone().persist_loop());

    let api_task = {
        let state = trove_api::ApiState {
            control: Arc::new(peer.clone()),
        };
        tokio::spawn(async move {
            if let Err(e) = trove_api::serve(state, access_point).await {
                tracing::error!(error = %e, "control API failed");
            }
        })
    };

    if restarted {
        peer.announce_startup();
    }

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = control_task       => tracing::error!("control receive loop exited: {:?}", r),
        r = backup_task        => tracing::error!("backup receive loop exited: {:?}", r),
        r = restore_task       => tracing::error!("restore receive loop exited: {:?}", r),
        r = persist_task       => tracing::error!("persist loop exited: {:?}", r),
        r = api_task           => tracing::error!("control API exited: {:?}", r),
    }

    peer.persist_if_dirty();
    Ok(())
}
