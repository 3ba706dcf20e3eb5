use replyflow_conversation::NatsConversationStore;
use replyflow_conversation::nats::CONVERSATIONS_BUCKET;
use replyflow_engine::{DryRunGateway, EventRouter, ExecutionEngine, MessagingGateway};
use replyflow_scheduler::{DurableScheduler, NatsTimerStore, SchedulerRunner, TIMERS_BUCKET};
use replyflow_server::{
    config::ServerConfig,
    db::{PgFlowStore, PgStatsStore},
    error::StartupError,
    gateway::HttpMessagingGateway,
    routes::{self, AppState},
};
use sqlx::postgres::PgPoolOptions;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(report) => {
            tracing::error!("{report}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> replyflow_core::Result<(), StartupError> {
    // Load configuration from environment
    let config = ServerConfig::from_env().map_err(|e| StartupError::Config {
        details: e.to_string(),
    })?;
    tracing::info!("Loaded configuration");

    // Create database connection pool
    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .map_err(|e| StartupError::Database {
            details: format!("failed to connect: {e}"),
        })?;

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .map_err(|e| StartupError::Database {
            details: format!("failed to run migrations: {e}"),
        })?;

    // Conversation state and timers live in JetStream KV
    let nats = async_nats::connect(&config.nats_url)
        .await
        .map_err(|e| StartupError::Nats {
            details: format!("failed to connect: {e}"),
        })?;
    let jetstream = async_nats::jetstream::new(nats);
    let conversations = NatsConversationStore::new(&jetstream, CONVERSATIONS_BUCKET)
        .await
        .map_err(|e| StartupError::Nats {
            details: e.to_string(),
        })?;
    let timers = Arc::new(
        NatsTimerStore::new(&jetstream, TIMERS_BUCKET)
            .await
            .map_err(|e| StartupError::Nats {
                details: e.to_string(),
            })?,
    );

    let gateway: Arc<dyn MessagingGateway> = if config.gateway.dry_run {
        tracing::warn!("Gateway in dry-run mode; no messages will be delivered");
        Arc::new(DryRunGateway::new())
    } else {
        Arc::new(
            HttpMessagingGateway::new(
                &config.gateway.base_url,
                &config.gateway.access_token,
                config.gateway.timeout(),
            )
            .map_err(|e| StartupError::Gateway {
                details: e.to_string(),
            })?,
        )
    };

    let engine = Arc::new(ExecutionEngine::new(
        Arc::new(PgFlowStore::new(db_pool.clone())),
        Arc::new(conversations),
        gateway,
        Arc::new(PgStatsStore::new(db_pool)),
        Arc::new(DurableScheduler::new(timers.clone())),
        config.engine.engine_config(),
    ));

    // Fire timers and sweep idle conversations in the background
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner_config = config
        .scheduler
        .runner_config()
        .map_err(|e| StartupError::Config {
            details: e.to_string(),
        })?;
    let runner = SchedulerRunner::new(engine.clone(), timers, runner_config);
    let runner_task = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { runner.run(shutdown).await }
    });

    let router = Arc::new(EventRouter::new(engine, config.dedup.build()));
    let app = routes::app(AppState::new(router));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|e| StartupError::Serve {
            details: format!("failed to bind to {}: {e}", config.bind_addr),
        })?;

    tracing::info!("listening on http://{}", config.bind_addr);

    let mut server_shutdown = shutdown_rx;
    let serve = axum::serve(listener, app.into_make_service()).with_graceful_shutdown(async move {
        let _ = server_shutdown.changed().await;
    });
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    serve.await.map_err(|e| StartupError::Serve {
        details: e.to_string(),
    })?;

    if let Err(e) = runner_task.await {
        tracing::warn!(error = %e, "Scheduler task ended abnormally");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
