mod client;
mod clients;
mod config;
mod connection;
mod error;
mod filter;
mod lifecycle;
mod listener;
mod logging;
mod models;
mod queue;
mod receiver;
mod scheduler;
mod sender;
mod spool;
mod store;
#[cfg(test)]
mod testing;
mod transport;
mod utils;

use crate::client::SubmitClient;
use crate::clients::{ensure_schema, setup_db_pool};
use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::error::StoreResult;
use crate::filter::FilterPipeline;
use crate::lifecycle::{shutdown_channel, wake_channel};
use crate::listener::{Listener, ListenerContext};
use crate::logging::LogFile;
use crate::queue::PgStore;
use crate::scheduler::Scheduler;
use crate::spool::SpoolTransport;
use crate::store::Store;

use actix_web::{App, HttpResponse, HttpServer, Responder, get};
use clap::{Parser, Subcommand};
use std::error::Error;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "smsd", version, about = "SMS store-and-forward gateway")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway (default).
    Serve,
    /// Queue a message on a running gateway. The body is read from stdin.
    Submit {
        /// `host:port` or unix socket path of the gateway.
        #[arg(long, env = "SMSD_SERVER", default_value = "127.0.0.1:11111")]
        server: String,
        /// Source tag known to the gateway.
        #[arg(long, env = "SMSD_SOURCE")]
        source: String,
        /// Ask for delivery reports.
        #[arg(long)]
        report: bool,
        /// Delete the message once done.
        #[arg(long)]
        delete: bool,
        /// `number` or `number=dstId`.
        #[arg(required = true)]
        recipients: Vec<String>,
    },
}

#[get("/health")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().body("OK")
}

// Graceful shutdown signal future
async fn shutdown_signal() {
    use tokio::signal;
    let ctrl_c = signal::ctrl_c();
    #[cfg(unix)]
    let mut term_signal = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("Failed to install SIGTERM handler");
    #[cfg(unix)]
    let terminate = term_signal.recv();
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received.");
}

fn scheduler_outcome(joined: Result<StoreResult<()>, JoinError>) -> Result<(), Box<dyn Error>> {
    Ok(joined??)
}

async fn serve() -> Result<(), Box<dyn Error>> {
    // --- Configuration ---
    let config = Config::load()?;
    let sentry_guard = config.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });
    let log_file = config.log_file.as_deref().map(LogFile::open).transpose()?;
    logging::init(log_file.clone(), sentry_guard.is_some());
    info!("Configuration loaded.");

    // 1. Connect to the Database
    info!("Connecting to database...");
    let db_pool = setup_db_pool(&config).await?;
    ensure_schema(&db_pool).await?;
    info!("Database connection established.");
    let store: Arc<dyn Store> = Arc::new(PgStore::new(db_pool, config.num_to_id_sql.clone()));

    // 2. Device, filter and scheduler
    let (stopper, shutdown) = shutdown_channel();
    let (waker, wakes) = wake_channel();
    let filter = config
        .filter_command()
        .map(|command| FilterPipeline::shell(command).with_response_timeout(config.filter_timeout()));
    match &filter {
        Some(filter) => info!(command = %filter.command(), "Incoming messages go through filter"),
        None => info!("No filter configured"),
    }
    info!(spool_dir = %config.spool_dir, "Using spool directory transport");
    let scheduler = Scheduler::new(
        store.clone(),
        Box::new(SpoolTransport::new(&config.spool_dir)),
        ConnectionManager::new(config.max_device_errors, config.backoff()),
        filter,
        config.local_prefix.clone(),
        config.poll_interval(),
        shutdown.clone(),
        wakes,
    );

    // 3. Submission listeners
    if config.sources.is_empty() {
        warn!("No sources configured, every submission will be refused");
    }
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
    let ctx = Arc::new(ListenerContext {
        store,
        waker,
        sources: config.sources.clone(),
        unknown_source_delay: config.unknown_source_delay(),
        fatal: fatal_tx,
    });
    let mut listeners = Vec::with_capacity(config.listen.len());
    for addr in &config.listen {
        let listener = Listener::bind(addr)
            .await
            .map_err(|e| format!("can't listen on {addr}: {e}"))?;
        listeners.push(tokio::spawn(listener.run(ctx.clone(), shutdown.clone())));
    }
    drop(ctx);

    #[cfg(unix)]
    logging::watch_hangup(log_file, shutdown.clone())?;

    // 4. Health check
    let health_server = HttpServer::new(|| App::new().service(health_check))
        .bind(config.health_addr.as_str())?
        .disable_signals()
        .run();
    let health_handle = health_server.handle();
    info!(addr = %config.health_addr, "Health check server running");

    let mut scheduler_task = tokio::spawn(scheduler.run());

    let supervise = async move {
        let outcome = tokio::select! {
            _ = shutdown_signal() => {
                stopper.stop();
                scheduler_outcome((&mut scheduler_task).await)
            }
            Some(err) = fatal_rx.recv() => {
                error!("Fatal database error while queueing a message: {}", err);
                stopper.stop();
                if let Err(e) = scheduler_outcome((&mut scheduler_task).await) {
                    error!("Scheduler failed while stopping: {}", e);
                }
                Err(err.into())
            }
            joined = &mut scheduler_task => scheduler_outcome(joined),
        };

        stopper.stop();
        for listener in listeners {
            let _ = listener.await;
        }
        health_handle.stop(true).await;
        outcome
    };

    let (served, outcome) = tokio::join!(health_server, supervise);
    served?;
    outcome?;
    info!("Gateway shut down.");
    drop(sentry_guard);
    Ok(())
}

async fn submit(
    server: String,
    source: String,
    report: bool,
    delete: bool,
    recipients: Vec<String>,
) -> Result<(), Box<dyn Error>> {
    let mut body = String::new();
    tokio::io::stdin().read_to_string(&mut body).await?;

    let mut client = SubmitClient::new(source, server);
    client.delete = delete;
    client.report = report;
    client.send(&body, &recipients).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve().await,
        Command::Submit {
            server,
            source,
            report,
            delete,
            recipients,
        } => submit(server, source, report, delete, recipients).await,
    }
}
