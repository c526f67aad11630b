//! EmberLink Server
//!
//! Demo binary: hosts a backend and a frontend on the in-process loopback
//! transport, walks through the signed handshake, replicates a pawn both
//! ways and tears the session down.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use emberlink::entity::{Pawn, Player};
use emberlink::network::{LoopbackNetwork, NUM_STREAMS};
use emberlink::{
    Credentials, EntityRegistry, NetworkConfig, NetworkJob, NetworkManager, TICK_RATE, VERSION,
};

fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    info!("EmberLink Server v{}", VERSION);
    info!("Service Rate: {} Hz", TICK_RATE);

    demo_session()
}

fn registry() -> EntityRegistry {
    let mut registry = EntityRegistry::new();
    registry.register_player_type(Player::TYPE_NAME, Player::construct);
    registry.register(Pawn::TYPE_NAME, Pawn::construct);
    registry
}

/// Demo session over the loopback transport.
fn demo_session() -> Result<()> {
    info!("=== Starting Demo Session ===");

    let network = LoopbackNetwork::new();
    let data_dir = std::env::temp_dir().join("emberlink-demo");

    // Optional JSON config path as the first argument; env overrides
    // otherwise.
    let mut config = match std::env::args().nth(1) {
        Some(path) => NetworkConfig::from_file(std::path::Path::new(&path))?,
        None => NetworkConfig::from_env(),
    };
    config.password = "demo".to_string();
    config.rcon_password = "demo-rcon".to_string();
    config.data_dir = data_dir.join("server");

    let transport = network
        .host(
            "127.0.0.1",
            7938,
            config.max_peers,
            NUM_STREAMS,
            config.in_bandwidth,
            config.out_bandwidth,
        )
        .context("failed to host")?;
    let backend = Arc::new(NetworkManager::host(
        config.clone(),
        registry(),
        Box::new(transport),
    )?);
    backend.define_cvar("sv_motd", "welcome to emberlink", true);

    let mut client_config = config.clone();
    client_config.data_dir = data_dir.join("client");
    let frontend = Arc::new(NetworkManager::connect(
        client_config,
        registry(),
        Box::new(network.client()),
        "127.0.0.1",
        7938,
        Credentials {
            username: "astra".to_string(),
            password: "demo".to_string(),
            user_password: String::new(),
        },
    )?);

    let mut backend_job = NetworkJob::start(Arc::clone(&backend), TICK_RATE)?;
    let mut frontend_job = NetworkJob::start(Arc::clone(&frontend), TICK_RATE)?;

    wait_for(|| frontend.local_peer_id().is_some(), "authentication")?;
    let peer_id = frontend.local_peer_id().unwrap_or(-1);
    info!("authenticated as peer {}", peer_id);
    info!("motd: {:?}", frontend.get_cvar("sv_motd"));

    // Backend spawns a pawn and hands it to the client.
    let pawn = backend.instantiate(Pawn::TYPE_NAME)?;
    backend.with_entity(pawn, |e| {
        if let Some(p) = e.as_any_mut().downcast_mut::<Pawn>() {
            p.label.set("ember".to_string());
            p.owner_peer.set(peer_id);
        }
    });
    backend.add_pending_update(pawn);
    wait_for(|| frontend.has_entity(pawn), "pawn replication")?;
    info!("pawn {} replicated to the client", pawn);

    // The owner drives the transform over the unreliable path.
    for step in 0..30u32 {
        frontend.with_entity(pawn, |e| {
            if let Some(p) = e.as_any_mut().downcast_mut::<Pawn>() {
                p.x.set(step as f32 * 0.5);
                p.y.set(step as f32 * 0.25);
            }
        });
        frontend.add_pending_update_unreliable(pawn);
        std::thread::sleep(Duration::from_millis(16));
    }
    let server_x = backend
        .with_entity(pawn, |e| {
            e.as_any()
                .downcast_ref::<Pawn>()
                .map(|p| *p.x.get())
                .unwrap_or_default()
        })
        .unwrap_or_default();
    info!("backend sees pawn at x = {:.2}", server_x);

    // Events and rcon round-trip.
    frontend.queue_event(1, b"hello from the client", None);
    frontend.send_rcon("status");
    std::thread::sleep(Duration::from_millis(100));
    for event in backend.drain_events() {
        info!(
            "backend event {} from peer {:?}: {} bytes",
            event.event_id,
            event.from,
            event.payload.len()
        );
    }
    for command in backend.drain_rcon() {
        info!("backend rcon: {}", command);
    }

    info!(
        "clocks: backend {:.3}s, frontend {:.3}s",
        backend.distributed_time(),
        frontend.distributed_time()
    );

    info!("=== Shutting Down ===");
    frontend_job.stop();
    frontend.shutdown();
    backend_job.stop();
    backend.shutdown();
    Ok(())
}

fn wait_for(mut condition: impl FnMut() -> bool, what: &str) -> Result<()> {
    for _ in 0..200 {
        if condition() {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    anyhow::bail!("timed out waiting for {what}")
}
