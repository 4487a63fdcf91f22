use anyhow::Result;
use clap::{Parser, Subcommand};
use std::env;
use tracing::info;

use skymux::commands::consolidate::{ConsolidateConfig, handle_consolidate};
use skymux::tuning::{DEFAULT_WORKERS, DRY_RUN_WORKERS};

#[derive(Parser)]
#[command(name = "skymux")]
#[command(about = "Consolidates ADS-B bundles from edge receivers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log verbosity (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the consolidator pipeline
    Run {
        /// Bus server URL
        #[arg(long, default_value = "nats://localhost:4222")]
        nats_url: String,
        /// Topic (stream) the edge receivers publish bundles on
        #[arg(long, default_value = "adsb-inbound")]
        input: String,
        /// Durable subscription name on the input topic
        #[arg(long, default_value = "consolidator")]
        subscription: String,
        /// Webhook that stores the live-sky snapshot in the shared cache
        #[arg(long)]
        snapshot_url: Option<String>,
        /// Storage sink endpoint for track fragments,
        /// e.g. http://localhost:8080/fdb/add-frag
        #[arg(long)]
        track_post_url: Option<String>,
        /// Reference service URL for the airframe lookup table
        #[arg(long)]
        airframes_url: Option<String>,
        /// Reference service URL for the schedule lookup table
        #[arg(long)]
        schedules_url: Option<String>,
        /// Write worker count (defaults: 256, or 16 in dry-run)
        #[arg(long)]
        workers: Option<usize>,
        /// Admin HTTP port
        #[arg(long, default_value_t = 8081)]
        admin_port: u16,
        /// Dry run: disposable subscription, log-only sinks by default
        #[arg(long)]
        dry_run: bool,
        /// Receiver names whose bundles are silently dropped (repeatable)
        #[arg(long = "blacklist")]
        blacklist: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Sentry is optional everywhere; errors-only when configured.
    let _sentry_guard = env::var("SENTRY_DSN").ok().map(|dsn| {
        sentry::init(sentry::ClientOptions {
            dsn: dsn.parse().ok(),
            release: Some(env!("CARGO_PKG_VERSION").into()),
            attach_stacktrace: true,
            ..Default::default()
        })
    });

    init_tracing(cli.verbose, _sentry_guard.is_some());

    match cli.command {
        Commands::Run {
            nats_url,
            input,
            subscription,
            snapshot_url,
            track_post_url,
            airframes_url,
            schedules_url,
            workers,
            admin_port,
            dry_run,
            blacklist,
        } => {
            let workers = workers.unwrap_or(if dry_run {
                DRY_RUN_WORKERS
            } else {
                DEFAULT_WORKERS
            });
            handle_consolidate(ConsolidateConfig {
                nats_url,
                input_topic: input,
                subscription,
                snapshot_url,
                track_post_url,
                airframes_url,
                schedules_url,
                workers,
                admin_port,
                dry_run,
                blacklist,
            })
            .await
        }
    }
}

fn init_tracing(verbose: u8, sentry_enabled: bool) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    if sentry_enabled {
        registry.with(sentry::integrations::tracing::layer()).init();
        info!("sentry error tracking enabled");
    } else {
        registry.init();
    }
}
