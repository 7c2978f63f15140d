//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p netstate_server -- [--addr 127.0.0.1:40000] [--tick-hz 64]
//!       [--config server.json] [--npcs 0] [--print-config]
//!
//! The server listens for client connections, spawns one character per
//! client, runs a fixed timestep simulation and replicates snapshots.

use std::{env, path::Path, time::Duration};

use anyhow::Context;
use netstate_server::server::GameServer;
use netstate_shared::config::EngineConfig;
use tracing::info;

struct Args {
    cfg: EngineConfig,
    npcs: u32,
    print_config: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let argv: Vec<String> = env::args().collect();

    // Config file first so flags override it.
    let mut cfg = match argv.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < argv.len() => EngineConfig::load(Path::new(&argv[i + 1]))?,
        _ => EngineConfig::default(),
    };
    let mut npcs = 0;
    let mut print_config = false;

    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--addr" if i + 1 < argv.len() => {
                cfg.server_addr = argv[i + 1].clone();
                i += 2;
            }
            "--tick-hz" if i + 1 < argv.len() => {
                cfg.tick_hz = argv[i + 1].parse().context("parse --tick-hz")?;
                i += 2;
            }
            "--npcs" if i + 1 < argv.len() => {
                npcs = argv[i + 1].parse().context("parse --npcs")?;
                i += 2;
            }
            "--config" => i += 2,
            "--print-config" => {
                print_config = true;
                i += 1;
            }
            _ => i += 1,
        }
    }
    Ok(Args {
        cfg,
        npcs,
        print_config,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let Args {
        cfg,
        npcs,
        print_config,
    } = parse_args()?;
    if print_config {
        println!(
            "{}",
            serde_json::to_string_pretty(&cfg).context("serialize config")?
        );
        return Ok(());
    }
    info!(addr = %cfg.server_addr, tick_hz = cfg.tick_hz, "Starting server");

    let mut server = GameServer::new(cfg.clone()).await.context("create server")?;
    let local = server.local_addr()?;
    info!(%local, "Server listening");

    for _ in 0..npcs {
        server.spawn_entity(None);
    }

    let tick_interval = Duration::from_secs_f32(cfg.fixed_dt());
    let mut next_tick = tokio::time::Instant::now();

    loop {
        // Accept new clients (non-blocking).
        match server.try_accept(Duration::from_millis(1)).await {
            Ok(Some(cid)) => info!(client_id = ?cid, "New client accepted"),
            Ok(None) => {}
            Err(e) => info!(error = %e, "Handshake failed"),
        }

        server.step(tick_interval.as_secs_f32()).await?;

        if server.tick() % cfg.tick_hz.max(1) == 0 {
            info!(
                tick = server.tick(),
                clients = server.client_count(),
                entities = server.entity_ids().len(),
                "Status"
            );
        }

        // Wait for next tick.
        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }
}
