use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use featwatch_core::Frequency;
use featwatch_events::{CancelToken, EventPublisher, EventSubscriber};
use featwatch_pipeline::{maybe_build_scheduler, run_subscriptions, trigger_batch, PipelineConfig, Services};
use featwatch_storage::FakeDataGenerator;
use featwatch_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "featwatch")]
#[command(about = "Saved-search change notification pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    /// Run every pipeline listener, plus the cadence scheduler when enabled.
    Worker,
    /// Serve the HTTP ingress.
    Serve,
    /// Publish one batch refresh for a cadence.
    Trigger { frequency: String },
    /// Insert deterministic fake saved searches and subscriptions.
    Seed {
        #[arg(long, default_value_t = 42)]
        seed: u64,
        #[arg(long, default_value_t = 5)]
        users: usize,
        #[arg(long, default_value_t = 20)]
        searches: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = PipelineConfig::from_env();
    init_tracing(config.log_json);

    match cli.command.unwrap_or(Commands::Worker) {
        Commands::Migrate => {
            let services = Services::connect(config).await?;
            featwatch_storage::migrate(services.store.pool())
                .await
                .context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Worker => run_worker(config).await?,
        Commands::Serve => {
            let port = config.web_port;
            let services = Services::connect(config).await?;
            let state = AppState::new(
                services.store.clone(),
                services.store.clone(),
                services.queue.clone(),
                services.config.topics.clone(),
            );
            featwatch_web::serve(state, port, shutdown_signal()).await?;
        }
        Commands::Trigger { frequency } => {
            let frequency = match frequency.parse::<Frequency>() {
                Ok(Frequency::Unknown) | Err(_) => bail!("unknown frequency {frequency:?}"),
                Ok(frequency) => frequency,
            };
            let services = Services::connect(config).await?;
            let id = trigger_batch(
                services.queue.as_ref(),
                &services.config.topics.batch_triggers,
                frequency,
            )
            .await
            .context("publishing batch trigger")?;
            println!("batch trigger published: frequency={frequency} message_id={id}");
        }
        Commands::Seed {
            seed,
            users,
            searches,
        } => {
            let services = Services::connect(config).await?;
            let data = FakeDataGenerator::from_seed(seed).generate(users, searches);
            services
                .store
                .apply_seed(&data)
                .await
                .context("inserting seed data")?;
            println!(
                "seed complete: seed={} searches={} channels={} subscriptions={}",
                seed,
                data.saved_searches.len(),
                data.channels.len(),
                data.subscriptions.len()
            );
        }
    }

    Ok(())
}

async fn run_worker(config: PipelineConfig) -> Result<()> {
    let services = Services::connect(config).await?;
    let routes = services.pipeline()?.routes(&services.config.topics);

    let publisher: Arc<dyn EventPublisher> = services.queue.clone();
    let mut scheduler = maybe_build_scheduler(&services.config, publisher).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
    }

    let cancel = CancelToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("shutdown requested");
            cancel.cancel();
        }
    });

    info!(worker_id = %services.config.worker_id, "worker started");
    let subscriber: Arc<dyn EventSubscriber> = services.queue.clone();
    let result = run_subscriptions(subscriber, routes, &cancel).await;

    if let Some(sched) = scheduler.as_mut() {
        if let Err(err) = sched.shutdown().await {
            warn!(error = %err, "scheduler did not shut down cleanly");
        }
    }
    result.context("pipeline listener failed")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

fn init_tracing(log_json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_is_the_default_command() {
        let cli = Cli::try_parse_from(["featwatch"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn seed_flags_parse() {
        let cli = Cli::try_parse_from(["featwatch", "seed", "--seed", "7", "--searches", "3"]).unwrap();
        match cli.command {
            Some(Commands::Seed {
                seed,
                users,
                searches,
            }) => {
                assert_eq!((seed, users, searches), (7, 5, 3));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn trigger_takes_a_frequency() {
        let cli = Cli::try_parse_from(["featwatch", "trigger", "weekly"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Trigger { frequency }) if frequency == "weekly"));
    }
}
