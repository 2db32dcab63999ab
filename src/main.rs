use std::str::FromStr;
use std::sync::Arc;

use sequence_mailer::config::ServiceConfig;
use sequence_mailer::error::{ConfigError, Result};
use sequence_mailer::store::{LibSqlBackend, SequenceStore};
use sequence_mailer::tick::{self, TickConfig, TickOrchestrator};
use sequence_mailer::tracking::{OpenTracker, tracking_routes};
use sequence_mailer::transport::{Mailer, SmtpMailer};

#[tokio::main]
async fn main() {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = ServiceConfig::from_env()?;
    let schedule = cron::Schedule::from_str(&config.scheduler.tick_schedule).map_err(|e| {
        ConfigError::InvalidValue {
            key: "SEQUENCE_TICK_CRON".into(),
            message: e.to_string(),
        }
    })?;

    eprintln!("📬 Sequence Mailer v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Tick: {}", config.scheduler.tick_schedule);
    eprintln!(
        "   Cap: {} per identity per tick, {}s between sends",
        config.scheduler.max_per_hour,
        config.scheduler.delay_between_sends.as_secs()
    );
    eprintln!("   Tracking: http://0.0.0.0:{}/track", config.http_port);

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn SequenceStore> = Arc::new(LibSqlBackend::new_local(&config.db_path).await?);

    // ── Transport ────────────────────────────────────────────────────────
    let smtp = SmtpMailer::new(&config.senders)?;
    for identity in smtp.identities() {
        tracing::info!(identity, "Sender identity configured");
    }
    let mailer: Arc<dyn Mailer> = Arc::new(smtp);

    // ── Scheduler ────────────────────────────────────────────────────────
    let orchestrator = Arc::new(TickOrchestrator::new(
        Arc::clone(&store),
        mailer,
        TickConfig {
            policy: config.scheduler.admission_policy(),
            public_base_url: config.scheduler.public_base_url.clone(),
        },
    ));
    let tick_handle = tick::spawn_tick_loop(orchestrator, schedule);

    // ── Tracking server ──────────────────────────────────────────────────
    let app = tracking_routes(Arc::new(OpenTracker::new(store)));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port)).await?;
    tracing::info!(port = config.http_port, "Tracking server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutting down");
        })
        .await?;

    tick_handle.abort();
    Ok(())
}
