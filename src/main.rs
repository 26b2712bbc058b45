//! Skirmish Server
//!
//! Runs a session over WebSockets (`host [port]`, `join <address> [port]`),
//! or with no arguments plays a short in-process demo match and prints the
//! result.
//!
//! Set `SKIRMISH_CONFIG` to a JSON file to override session settings and
//! `RUST_LOG` to change log verbosity.

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use skirmish::{
    game::{combat::PlayerHitboxes, spawn::StaticSpawnPoints},
    network::{LoopbackNetwork, Transport, WsTransport},
    MatchPhase, PeerId, SessionConfig, SessionEvent, SessionManager, Vec3, DEFAULT_PORT, VERSION,
};

/// Simulation frame length (60 Hz).
const FRAME: Duration = Duration::from_micros(16_667);

fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")?;

    info!("Skirmish Server v{}", VERSION);
    let config = load_config()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("host") => {
            let port = parse_port(args.get(1))?;
            run_host(config, port)
        }
        Some("join") => {
            let Some(address) = args.get(1) else {
                bail!("usage: skirmish-server join <address> [port]");
            };
            let port = parse_port(args.get(2))?;
            run_client(config, address, port)
        }
        Some(other) => bail!("unknown command {:?} (expected host, join, or nothing for the demo)", other),
        None => demo_match(config),
    }
}

fn load_config() -> Result<SessionConfig> {
    match std::env::var("SKIRMISH_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path))?;
            let config = SessionConfig::from_json(&raw).with_context(|| format!("Invalid config in {}", path))?;
            info!("Loaded config from {}", path);
            Ok(config)
        }
        Err(_) => Ok(SessionConfig::default()),
    }
}

fn parse_port(arg: Option<&String>) -> Result<u16> {
    match arg {
        Some(s) => s.parse().with_context(|| format!("Invalid port {:?}", s)),
        None => Ok(DEFAULT_PORT),
    }
}

fn log_events(rx: &mut broadcast::Receiver<SessionEvent>) {
    loop {
        match rx.try_recv() {
            Ok(event) => info!(event = event.name(), "{:?}", event),
            Err(broadcast::error::TryRecvError::Lagged(n)) => warn!("Dropped {} session events", n),
            Err(_) => break,
        }
    }
}

fn run_session<T: Transport>(session: &mut SessionManager<T>) {
    let mut events = session.subscribe();
    let mut last = Instant::now();

    while session.is_active() {
        let now = Instant::now();
        session.tick(now - last);
        last = now;
        log_events(&mut events);
        std::thread::sleep(FRAME);
    }
    log_events(&mut events);
}

fn run_host(config: SessionConfig, port: u16) -> Result<()> {
    let transport = WsTransport::new(config.connect_timeout())?;
    let max_peers = config.max_peers;
    let mut session = SessionManager::new(config, transport, Box::new(StaticSpawnPoints::ring(8, 20.0)));

    session.start_host(port, max_peers)?;
    session.notify_scene_ready()?;
    run_session(&mut session);
    Ok(())
}

fn run_client(config: SessionConfig, address: &str, port: u16) -> Result<()> {
    let transport = WsTransport::new(config.connect_timeout())?;
    let mut session = SessionManager::new(config, transport, Box::new(StaticSpawnPoints::ring(8, 20.0)));

    let local = session.join_host(address, port)?;
    info!("Joined as {}", local);
    session.notify_scene_ready()?;
    run_session(&mut session);
    Ok(())
}

/// Host plus two clients on the in-process transport.
fn demo_match(config: SessionConfig) -> Result<()> {
    info!("=== Starting Demo Match ===");

    let config = SessionConfig {
        match_duration_secs: 20.0,
        rng_seed: config.rng_seed.or(Some(12345)),
        ..config
    };
    let port = config.port;
    let net = LoopbackNetwork::new();
    let spawn_points = || Box::new(StaticSpawnPoints::ring(4, 10.0));

    let mut host = SessionManager::new(config.clone(), net.endpoint(), spawn_points());
    let mut host_events = host.subscribe();
    host.start_host(port, 2)?;
    host.notify_scene_ready()?;

    let mut clients = Vec::new();
    for _ in 0..2 {
        let mut client = SessionManager::new(config.clone(), net.endpoint(), spawn_points());
        client.join_host("localhost", port)?;
        client.notify_scene_ready()?;
        clients.push(client);
    }

    // Fixed stations: host at the centre, clients on two sides
    let stations = [Vec3::ZERO, Vec3::new(0.0, 0.0, -10.0), Vec3::new(10.0, 0.0, 0.0)];
    let mut frames = 0u64;

    while host.match_phase() != MatchPhase::Ended {
        host.update_local_entity(stations[0], Vec3::ZERO, Vec3::ZERO).ok();
        host.tick(FRAME);

        for (i, client) in clients.iter_mut().enumerate() {
            let me = stations[i + 1];
            client.update_local_entity(me, Vec3::ZERO, Vec3::ZERO).ok();
            client.tick(FRAME);

            // Client 2 shoots at the host, client 3 joins the fight after five seconds
            if i == 1 && frames < 300 {
                continue;
            }
            let aim = if i == 0 { stations[0] } else { stations[1] };
            let hitboxes = PlayerHitboxes::from_entities(client.entities(), PlayerHitboxes::DEFAULT_RADIUS);
            let _ = client.fire(&hitboxes, me, aim - me);
        }

        log_events(&mut host_events);
        frames += 1;
        if frames > 60 * 60 * 10 {
            bail!("demo match did not end");
        }
    }

    // Let the result reach the clients
    for _ in 0..4 {
        host.tick(Duration::ZERO);
        for client in &mut clients {
            client.tick(Duration::ZERO);
        }
    }
    log_events(&mut host_events);

    info!("=== Match Results ===");
    for (rank, line) in host.scoreboard().iter().enumerate() {
        info!("#{}: {} - {} kills, {} deaths", rank + 1, line.peer, line.kills, line.deaths);
    }
    let winner = host.winner();
    info!("Winner: {}", winner.map_or_else(|| "none (tie)".to_string(), |p: PeerId| p.to_string()));

    for client in &clients {
        if client.winner() != winner {
            warn!("Client {:?} disagrees on the winner", client.local_id());
        }
    }

    println!("{}", host.snapshot().to_json()?);
    Ok(())
}
