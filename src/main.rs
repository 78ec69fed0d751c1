//! Arena Net demo
//!
//! Runs a host or a client tick loop and logs every network event.
//!
//! ```text
//! arena-net host   [config.json]
//! arena-net client [config.json]
//! ```

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use arena_net::{Client, GameState, Host, NetConfig, NetEvent, VERSION};

/// Seconds between demo obstacle spawns once the game runs.
const BUBBLE_PERIOD: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("failed to set tracing subscriber")?;

    let mut args = std::env::args().skip(1);
    let mode = args.next().unwrap_or_default();
    let config = match args.next() {
        Some(path) => NetConfig::load(&path).with_context(|| format!("loading {path}"))?,
        None => NetConfig::from_env()?,
    };

    info!("Arena Net v{}", VERSION);
    info!("Tick Rate: {} Hz", config.tick_rate);

    match mode.as_str() {
        "host" => run_host(config).await,
        "client" => run_client(config).await,
        other => bail!("unknown mode {other:?}, expected `host` or `client`"),
    }
}

fn log_event(event: &NetEvent) {
    match serde_json::to_string(event) {
        Ok(json) => info!(target: "arena_net::events", "{json}"),
        Err(e) => warn!("unserializable event {:?}: {}", event, e),
    }
}

async fn run_host(config: NetConfig) -> Result<()> {
    let dt = config.tick_interval();
    let mut host = Host::bind(config).await?;
    info!("Hosting on {}", host.local_addr());

    let mut ticker = interval(dt);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut events = Vec::new();
    let mut since_bubble = Duration::ZERO;
    let mut path = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                host.tick(dt, &mut events);
                for event in events.drain(..) {
                    log_event(&event);
                    if let NetEvent::GameStateChanged { state: GameState::StartGame } = event {
                        host.change_game_state(GameState::Game);
                    }
                }

                if host.game_state() == GameState::Game {
                    since_bubble += dt;
                    if since_bubble >= BUBBLE_PERIOD {
                        since_bubble = Duration::ZERO;
                        path = (path + 1) % 4;
                        host.spawn_bubble(path);
                    }
                    if !host.records().is_empty() && !host.any_lives_remaining() {
                        host.change_game_state(GameState::GameOver);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                host.shutdown(&mut events);
                events.drain(..).for_each(|e| log_event(&e));
                return Ok(());
            }
        }
    }
}

async fn run_client(config: NetConfig) -> Result<()> {
    let dt = config.tick_interval();
    let mut events = Vec::new();
    let connected = Client::connect(config, &mut events).await;
    events.drain(..).for_each(|e| log_event(&e));
    let mut client = connected?;

    let mut ticker = interval(dt);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                client.tick(&mut events);
                for event in events.drain(..) {
                    log_event(&event);
                    if let NetEvent::PlayerSpawned { record } = event {
                        if Some(record.net_id) == client.net_id() {
                            client.ready_to_update();
                            client.request_start();
                        }
                    }
                }
                if client.is_closed() {
                    info!("Connection ended");
                    return Ok(());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                client.disconnect();
                return Ok(());
            }
        }
    }
}
