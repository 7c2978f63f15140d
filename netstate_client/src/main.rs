//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p netstate_client -- [--addr 127.0.0.1:40000] [--name Player]
//!       [--config client.json]
//!
//! The client connects to the server, predicts its own character and
//! interpolates everyone else's.
//!
//! Console commands:
//!   forward|back|left|right - Hold a direction
//!   stop                    - Release all directions
//!   yaw <radians>           - Set look direction
//!   jump                    - Jump once
//!   status                  - Show client status
//!   quit                    - Exit client

use std::env;
use std::io::{BufRead, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use netstate_client::client::{ClientState, GameClient};
use netstate_client::input::InputState;
use netstate_shared::config::EngineConfig;
use tokio::sync::mpsc;
use tracing::info;

fn parse_args() -> anyhow::Result<EngineConfig> {
    let args: Vec<String> = env::args().collect();
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => EngineConfig::load(Path::new(&args[i + 1]))?,
        _ => EngineConfig::default(),
    };
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--name" if i + 1 < args.len() => {
                cfg.player_name = args[i + 1].clone();
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().context("parse --tick-hz")?;
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

/// Applies one console line to the held input. Returns output lines.
fn exec_console(client: &GameClient, input: &mut InputState, line: &str) -> Vec<String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        ["forward"] => input.forward = 1.0,
        ["back"] => input.forward = -1.0,
        ["left"] => input.right = -1.0,
        ["right"] => input.right = 1.0,
        ["stop"] => {
            input.forward = 0.0;
            input.right = 0.0;
        }
        ["yaw", v] => match v.parse() {
            Ok(yaw) => input.yaw = yaw,
            Err(e) => return vec![format!("bad yaw: {e}")],
        },
        ["jump"] => input.jump = true,
        ["status"] => {
            let mut out = vec![
                format!("State: {:?}", client.state),
                format!("Client ID: {:?}", client.client_id),
                format!("Tick: {}", client.tick_count()),
            ];
            for id in client.entity_ids() {
                if let Some(pose) = client.render_pose(id) {
                    out.push(format!("  {:?}: drawn at {:?}", id, pose.position));
                }
                if let Some(stats) = client.prediction_stats(id) {
                    out.push(format!("    prediction: {stats:?}"));
                }
            }
            return out;
        }
        [] => {}
        _ => return vec![format!("Unknown command: {line}")],
    }
    Vec::new()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(server = %cfg.server_addr, name = %cfg.player_name, "Starting client");

    let mut client = GameClient::connect(&cfg).await.context("connect")?;

    // Set up console input channel.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);

    // Spawn stdin reader thread.
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            if stdin.lock().read_line(&mut line).is_err() {
                break;
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Client connected. Type 'status' for info, 'quit' to exit.");
    println!();

    let tick_interval = Duration::from_secs_f32(cfg.fixed_dt());
    let mut next_tick = tokio::time::Instant::now();
    let mut input = InputState::default();

    loop {
        while let Ok(line) = console_rx.try_recv() {
            if line == "quit" || line == "exit" {
                client.disconnect("quit").await?;
                return Ok(());
            }
            for out in exec_console(&client, &mut input, &line) {
                println!("{out}");
            }
        }

        client.tick(&input).await?;
        // Jump is a press, not a hold.
        input.jump = false;

        if let ClientState::Disconnected(reason) = &client.state {
            println!("Disconnected from server: {reason}");
            break;
        }

        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }

    Ok(())
}
