mod cluster;

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use meridian_core::fairness::stats::total_used;
use meridian_core::telemetry::{init_tracing, LogFormat};
use meridian_core::{
    Direction, Hooks, LogTrace, MeridianConfig, ObjectId, ObjectMessage, ServerMessage, ServiceTag,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use cluster::Cluster;

#[derive(Parser)]
#[command(
    name = "meridian-sim",
    about = "Run fair space-server links over an in-memory network"
)]
struct Args {
    /// Config file. Without it meridian.toml and /etc/meridian/meridian.toml
    /// are tried before falling back to defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 4)]
    servers: u32,

    #[arg(long, default_value_t = 2000)]
    duration_ms: u64,

    /// Objects hosted per server.
    #[arg(long, default_value_t = 8)]
    objects: u32,

    /// Server messages offered per server per millisecond.
    #[arg(long, default_value_t = 2)]
    load: u32,

    #[arg(long, default_value_t = 1 << 20)]
    stream_capacity_bytes: usize,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Log every message at trace level.
    #[arg(long)]
    trace_messages: bool,
}

fn load_config(explicit: Option<&Path>) -> MeridianConfig {
    let fallback = [Path::new("meridian.toml"), Path::new("/etc/meridian/meridian.toml")];
    let candidates: Vec<&Path> = match explicit {
        Some(path) => vec![path],
        None => fallback.to_vec(),
    };

    for path in candidates {
        if explicit.is_some() || path.exists() {
            match MeridianConfig::load(path) {
                Ok(config) => {
                    info!(path = %path.display(), "loaded configuration");
                    return config;
                }
                Err(e) => {
                    eprintln!("{e}");
                    std::process::exit(1);
                }
            }
        }
    }

    info!("no config file found, using defaults");
    MeridianConfig::default()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(LogFormat::for_build(), "info");
    let args = Args::parse();
    if args.servers < 2 {
        eprintln!("--servers must be at least 2");
        std::process::exit(2);
    }

    let config = load_config(args.config.as_deref());
    let mut hooks = Hooks::default();
    if args.trace_messages {
        hooks = hooks.with_trace(Arc::new(LogTrace));
    }

    let cluster = Cluster::start(&config, args.servers, args.stream_capacity_bytes, hooks)?;

    // Heavier weights toward lower-numbered peers so the split is visible in
    // the report.
    for server in &cluster.servers {
        for peer in &cluster.servers {
            if peer.id != server.id {
                let weight = 1.0 + f64::from(args.servers - peer.id.0);
                server.link.set_server_weight(peer.id, weight)?;
            }
        }
    }

    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut hosted: Vec<(ObjectId, usize)> = Vec::new();
    for (index, server) in cluster.servers.iter().enumerate() {
        for _ in 0..args.objects {
            let object = ObjectId::random();
            server.objects.register_client(object, rng.gen_range(1.0..4.0))?;
            cluster.locator.insert(object, server.id);
            hosted.push((object, index));
        }
    }

    let started = Instant::now();
    let deadline = started + Duration::from_millis(args.duration_ms);
    let mut next_id = 0u64;
    let mut offered = 0u64;
    let mut rejected = 0u64;

    while Instant::now() < deadline {
        for (index, server) in cluster.servers.iter().enumerate() {
            for _ in 0..args.load {
                next_id += 1;
                let mut peer = rng.gen_range(0..cluster.servers.len());
                if peer == index {
                    peer = (peer + 1) % cluster.servers.len();
                }
                let service = if rng.gen_bool(0.5) {
                    ServiceTag::LOCATION
                } else {
                    ServiceTag::PROXIMITY
                };
                let payload = vec![0u8; rng.gen_range(64..1024)];
                let message = ServerMessage::new(
                    next_id,
                    server.id,
                    cluster.servers[peer].id,
                    service,
                    payload,
                );
                offered += 1;
                if server.forwarder.push(message).is_err() {
                    rejected += 1;
                }
            }

            if !hosted.is_empty() {
                let (source, host) = hosted[rng.gen_range(0..hosted.len())];
                let (destination, _) = hosted[rng.gen_range(0..hosted.len())];
                next_id += 1;
                let message = ObjectMessage::new(next_id, source, destination, vec![0u8; 128]);
                offered += 1;
                if cluster.servers[host].objects.push(message).is_err() {
                    rejected += 1;
                }
            }
        }
        for server in &cluster.servers {
            let _ = server.link.service(Direction::Objects);
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    // Let the queues drain before reporting.
    std::thread::sleep(Duration::from_millis(200));

    let elapsed = started.elapsed().as_secs_f64();
    for (id, report) in cluster.reports()? {
        for info in &report.send {
            info!(
                server = %id,
                peer = %info.key,
                weight = info.weight,
                queued = info.used,
                "send queue"
            );
        }
        let busiest_object = report
            .objects
            .iter()
            .filter_map(|info| info.utilization())
            .fold(0.0, f64::max);
        info!(
            server = %id,
            send_capacity = report.send_capacity,
            receive_capacity = report.receive_capacity,
            send_blocked = report.send_blocked,
            send_queued = total_used(&report.send),
            receive_queued = total_used(&report.receive),
            object_queued = total_used(&report.objects),
            object_queues = report.objects.len(),
            busiest_object,
            "link report"
        );
    }

    let mut delivered = 0u64;
    for server in &cluster.servers {
        let messages = server.tally.messages.load(Ordering::Relaxed);
        let bytes = server.tally.bytes.load(Ordering::Relaxed);
        delivered += messages;
        info!(
            server = %server.id,
            messages,
            object_messages = server.tally.object_messages.load(Ordering::Relaxed),
            bytes_per_sec = bytes as f64 / elapsed,
            "received"
        );
    }
    if rejected > 0 {
        warn!(rejected, "messages rejected by full queues");
    }
    info!(offered, delivered, rejected, "simulation finished");

    cluster.shutdown()?;
    Ok(())
}
