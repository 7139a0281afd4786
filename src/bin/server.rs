//! worldgate-server binary
//!
//! Runs a single-process transition demo: one authority plus N loopback
//! participants, one full world transition, then a barrier summary.
//!
//! ## Configuration (env / TOML via `config` crate)
//!
//! | Key                        | Default   | Description                         |
//! |----------------------------|-----------|-------------------------------------|
//! | `WORLDGATE_BOOT_WORLD`     | `Lobby`   | World every node starts in          |
//! | `WORLDGATE_TARGET_WORLD`   | `Arena`   | World to transition to              |
//! | `WORLDGATE_CLIENTS`        | `2`       | Number of remote participants       |
//! | `WORLDGATE_REPLICATION`    | `prefab`  | `prefab` or `scene` resync mode     |
//! | `WORLDGATE_TICK_RATE_HZ`   | `30`      | Harness pump rate                   |
//! | `--worlds-file`            | *(none)*  | TOML world catalog (`[worlds]` map) |

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use worldgate::loopback::{LoopbackHarness, StoredEntity};
use worldgate::{
    BufferedMessage, ClientId, CoordinatorConfig, EntityId, ReplicationMode, Vec3,
    CONTROL_CHANNEL,
};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "worldgate-server", about = "World transition coordinator demo", version)]
struct Args {
    /// World every node boots into
    #[arg(long, env = "WORLDGATE_BOOT_WORLD", default_value = "Lobby")]
    boot_world: String,

    /// World to transition the cluster to
    #[arg(long, env = "WORLDGATE_TARGET_WORLD", default_value = "Arena")]
    target_world: String,

    /// Number of remote participants
    #[arg(long, env = "WORLDGATE_CLIENTS", default_value_t = 2)]
    clients: u64,

    /// Replication mode: prefab | scene
    #[arg(long, env = "WORLDGATE_REPLICATION", default_value = "prefab", value_parser = parse_mode)]
    replication: ReplicationMode,

    /// Harness pump rate (Hz)
    #[arg(long, env = "WORLDGATE_TICK_RATE_HZ", default_value_t = 30.0)]
    tick_rate_hz: f32,

    /// Optional TOML world catalog; defaults to {Lobby: 0, Arena: 1}
    #[arg(long)]
    worlds_file: Option<PathBuf>,
}

fn parse_mode(s: &str) -> Result<ReplicationMode, String> {
    match s {
        "prefab" => Ok(ReplicationMode::PrefabResync),
        "scene" => Ok(ReplicationMode::SceneAuthoredResync),
        other => Err(format!("unknown replication mode '{}'", other)),
    }
}

// ---------------------------------------------------------------------------
// World catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WorldCatalog {
    worlds: HashMap<String, u32>,
}

fn load_catalog(path: Option<&PathBuf>) -> Result<Vec<(String, u32)>> {
    let catalog = match path {
        Some(path) => {
            let settings = config::Config::builder()
                .add_source(config::File::from(path.as_path()))
                .add_source(config::Environment::with_prefix("WORLDGATE").separator("__"))
                .build()
                .context("Failed to read world catalog")?;
            settings
                .try_deserialize::<WorldCatalog>()
                .context("World catalog must be a [worlds] name → index table")?
        }
        None => WorldCatalog {
            worlds: HashMap::from([("Lobby".to_string(), 0), ("Arena".to_string(), 1)]),
        },
    };
    let mut worlds: Vec<(String, u32)> = catalog.worlds.into_iter().collect();
    worlds.sort_by_key(|(_, index)| *index);
    Ok(worlds)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("worldgate=debug".parse()?),
        )
        .init();

    let args = Args::parse();
    let worlds = load_catalog(args.worlds_file.as_ref())?;
    let catalog: Vec<(&str, u32)> = worlds.iter().map(|(n, i)| (n.as_str(), *i)).collect();

    info!(
        "Starting worldgate-server ({} worlds, {} clients, {:?})",
        catalog.len(),
        args.clients,
        args.replication
    );

    let config = CoordinatorConfig {
        replication_mode: args.replication,
        ..Default::default()
    };
    let clients: Vec<ClientId> = (1..=args.clients).map(ClientId).collect();
    let local_client = ClientId(0);
    let boot_index = catalog
        .iter()
        .find(|(name, _)| *name == args.boot_world)
        .map(|(_, index)| *index)
        .context("Boot world is not in the catalog")?;

    let mut harness = LoopbackHarness::new(
        &catalog,
        &clients,
        Some(local_client),
        Some(boot_index),
        config,
    )?;

    // A persistent survivor that rides through quarantine into the new world.
    let mut survivor = StoredEntity::new(EntityId(1), local_client, 0xC0FF_EE00);
    survivor.persistent = true;
    harness.store.insert(survivor);

    let ticket = harness.request_transition(&args.target_world)?;
    info!(
        "transition {} → '{}' requested (load {:?})",
        ticket.correlation, ticket.world, ticket.load
    );

    // Player entities constructed while the new world loads; these are the
    // "fresh" set that lands in each client's snapshot.
    for (i, &client) in clients.iter().enumerate() {
        let mut player = StoredEntity::new(EntityId(100 + i as u64), client, 0xBEEF_0000);
        player.is_player = true;
        player.position = Vec3::new(i as f32 * 2.0, 0.0, 0.0);
        harness.store.insert(player);
    }

    // A message that outruns entity creation: buffered now, replayed once
    // the first player entity exists on its client.
    if let Some(&first) = clients.first() {
        if let Some(node) = harness.participant(first) {
            node.buffer.push(BufferedMessage {
                target: EntityId(100),
                sender: local_client,
                channel: CONTROL_CHANNEL,
                payload: b"hello-from-before-you-existed".to_vec(),
                received_at: Instant::now(),
            });
        }
    }

    let harness = Arc::new(Mutex::new(harness));
    let pump = {
        let harness = harness.clone();
        let tick = std::time::Duration::from_secs_f32(1.0 / args.tick_rate_hz);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(tick);
            loop {
                timer.tick().await;
                let complete = {
                    let mut h = harness.lock();
                    h.step();
                    h.authority.barrier_complete(&h.connections)
                };
                if complete {
                    break;
                }
            }
        })
    };

    tokio::select! {
        _ = pump => info!("acknowledgment barrier satisfied"),
        _ = tokio::signal::ctrl_c() => warn!("interrupted before the barrier completed"),
    }

    let h = harness.lock();
    for node in &h.participants {
        for events in &node.events {
            info!(
                "{}: acked {}: {} entities, {} replayed messages",
                node.coordinator.client_id(),
                events.acked,
                events.spawned.len(),
                events.replayed.len()
            );
        }
    }
    if let Some(progress) = h.authority.tracker().get(ticket.correlation) {
        info!(
            "transition {}: {} clients done",
            ticket.correlation,
            progress.done_clients().len()
        );
    }
    Ok(())
}
