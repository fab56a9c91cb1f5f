//! expensio CLI: run the queue workers or push a task by hand.

use clap::{Parser, Subcommand};
use expensio::app::{
    AcknowledgingProcessor, MessageProcessingJob, ResponseSendingJob, WorkerProcessor,
};
use expensio::config::secrets::ExposeSecret;
use expensio::config::{Backend, Config};
use expensio::db::Db;
use expensio::jobs::{JobFactory, JobOptions};
use expensio::queue::QueueBackend;
use expensio::queue::amqp::{AmqpBackend, AmqpConnector};
use expensio::queue::memory::MemoryBackend;
use expensio::queue::pgmq::PgmqBackend;
use expensio::telemetry::{TelemetryConfig, init_telemetry};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "expensio", about = "Job queue workers for the Expensio bot")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the message worker until Ctrl-C
    Serve,
    /// Publish one task onto a queue
    Schedule {
        /// Queue name
        queue: String,
        /// JSON payload
        payload: String,
    },
}

/// What the backend was built on. Closed after the factory.
enum Connection {
    Amqp(Arc<AmqpConnector>),
    Pgmq(Arc<Db>),
    Memory,
}

impl Connection {
    async fn close(self) {
        match self {
            Connection::Amqp(connector) => {
                if let Err(e) = connector.close().await {
                    warn!(error = %e, "error closing RabbitMQ connection");
                }
            }
            Connection::Pgmq(db) => db.close().await,
            Connection::Memory => {}
        }
    }
}

async fn build_backend(config: &Config) -> anyhow::Result<(Arc<dyn QueueBackend>, Connection)> {
    match config.backend {
        Backend::RabbitMq => {
            let connector = Arc::new(AmqpConnector::from_config(&config.amqp));
            // Fail at startup rather than on the first publish.
            connector.connection().await?;
            let backend = AmqpBackend::from_config(Arc::clone(&connector), &config.amqp);
            Ok((Arc::new(backend), Connection::Amqp(connector)))
        }
        Backend::Pgmq => {
            let url = config
                .database_url
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required for the pgmq backend"))?;
            let db = Arc::new(Db::connect(url.expose_secret()).await?);
            db.migrate().await?;
            let backend = PgmqBackend::new(Arc::clone(&db));
            Ok((Arc::new(backend), Connection::Pgmq(db)))
        }
        Backend::Memory => {
            warn!("memory backend selected; queued tasks do not survive a restart");
            Ok((Arc::new(MemoryBackend::new()), Connection::Memory))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "expensio"))?;

    match cli.command {
        Command::Serve => cmd_serve(config).await,
        Command::Schedule { queue, payload } => cmd_schedule(config, queue, payload).await,
    }
}

async fn cmd_serve(config: Config) -> anyhow::Result<()> {
    let (backend, connection) = build_backend(&config).await?;
    let factory = JobFactory::new(backend, config.queue.clone())?;

    let responses = ResponseSendingJob::new(&factory, config.response_queue.clone());
    let processor = Arc::new(AcknowledgingProcessor::new(responses));
    let messages = MessageProcessingJob::new(&factory, config.message_queue.clone(), processor);

    let workers = WorkerProcessor::new(vec![messages.job().clone()]);
    let started = workers.start_workers().await;

    if started.is_ok() {
        info!(
            backend = ?config.backend,
            queue = %config.message_queue,
            "serving; press Ctrl-C to stop"
        );
        tokio::signal::ctrl_c().await?;
        info!("shutdown requested");
        workers.stop_workers().await;
    }

    factory.close().await?;
    connection.close().await;
    started?;
    Ok(())
}

async fn cmd_schedule(config: Config, queue: String, payload: String) -> anyhow::Result<()> {
    let payload: serde_json::Value = serde_json::from_str(&payload)?;

    let (backend, connection) = build_backend(&config).await?;
    let factory = JobFactory::new(backend, config.queue.clone())?;
    let job = factory.create_job(JobOptions::new(&queue));

    let scheduled = job.schedule(&payload).await;
    factory.close().await?;
    connection.close().await;
    scheduled?;

    println!("Scheduled onto {queue}");
    Ok(())
}
