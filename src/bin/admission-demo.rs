//! Demo CLI driving all four admission primitives against synthetic
//! traffic, grounded on the teacher's `main.rs` + `server::bootstrap`
//! tracing setup.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use admission_core::concurrency_gate::ConcurrencyGate;
use admission_core::config::{AdmissionConfig, PacketConcurrencyLimitAttribute, PacketRateLimitAttribute};
use admission_core::connection_limiter::ConnectionLimiter;
use admission_core::endpoint::NetworkEndpoint;
use admission_core::policy_limiter::{PolicyContext, PolicyRateLimiter};
use admission_core::scheduler::TokioTaskManager;
use anyhow::Result;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "admission-demo", about = "Exercise the admission-core primitives against synthetic traffic")]
struct Cli {
    /// Path to an admission config file (falls back to built-in defaults)
    #[arg(short, long, default_value = "admission.toml")]
    config: PathBuf,

    /// Number of synthetic requests to drive per simulated endpoint
    #[arg(short, long, default_value_t = 20)]
    requests: u32,
}

fn init_tracing() {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(16_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false),
        )
        .init();

    std::mem::forget(guard);
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let started = Instant::now();

    let config = AdmissionConfig::load(&cli.config)?;
    let metrics = admission_core::metrics::Metrics::install();
    let task_manager = TokioTaskManager::new();

    let policy_limiter = PolicyRateLimiter::new(config.policy_limiter.clone(), task_manager.clone())?;
    let concurrency_gate = ConcurrencyGate::new(config.concurrency_gate.clone(), task_manager.clone())?;
    let connection_limiter = ConnectionLimiter::new(config.connection_limiter.clone(), task_manager.clone())?;

    let endpoints = [
        NetworkEndpoint::new("198.51.100.10:443"),
        NetworkEndpoint::new("198.51.100.11:443"),
        NetworkEndpoint::new("::ffff:198.51.100.10:443"),
    ];
    let declared = PacketRateLimitAttribute {
        requests_per_second: 10,
        burst: 5,
    };
    let concurrency_attr = PacketConcurrencyLimitAttribute {
        max: 4,
        queue: true,
        queue_max: 8,
    };
    const OPCODE: u16 = 1;

    for endpoint in &endpoints {
        if !connection_limiter.is_connection_allowed(endpoint) {
            tracing::warn!(endpoint = %endpoint, "connection rejected: per-ip cap reached");
            continue;
        }

        for i in 0..cli.requests {
            let context = PolicyContext {
                endpoint: endpoint.clone(),
                declared,
            };
            let decision = policy_limiter.check(OPCODE, &context)?;
            tracing::info!(
                endpoint = %endpoint,
                request = i,
                allowed = decision.allowed,
                retry_after_ms = decision.retry_after_ms,
                credit = decision.credit,
                "rate decision"
            );

            if decision.allowed {
                match concurrency_gate.try_enter(OPCODE, concurrency_attr) {
                    Some(_lease) => tracing::info!(endpoint = %endpoint, request = i, "concurrency slot acquired"),
                    None => tracing::warn!(endpoint = %endpoint, request = i, "concurrency gate at capacity"),
                }
            }
        }

        connection_limiter.connection_closed(endpoint);
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    tracing::info!(elapsed = %humantime::format_duration(started.elapsed()), "demo run finished");
    println!("{}", metrics.render());
    Ok(())
}
