use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use intake_bot::advisor::CorrectionAdvisor;
use intake_bot::bot::Dispatcher;
use intake_bot::channels::{Channel, TelegramChannel};
use intake_bot::config::BotConfig;
use intake_bot::form::{FormEngine, SessionStore};
use intake_bot::llm::create_provider;
use intake_bot::notify::Notifier;
use intake_bot::payments::{AllowAll, PaymentEngine, spawn_expiry_task};
use intake_bot::routes::{OpsState, ops_routes};
use intake_bot::store::{Database, LibSqlBackend};

/// How often stale payment authorizations are swept.
const EXPIRY_SWEEP_PERIOD: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = BotConfig::from_env().context("Invalid configuration")?;

    // ── Logging ─────────────────────────────────────────────────────────
    let file_layer = config.log_dir.as_ref().map(|dir| {
        let appender = tracing_appender::rolling::daily(dir, "intake-bot.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false),
            guard,
        )
    });
    let (file_layer, _log_guard) = match file_layer {
        Some((layer, guard)) => (Some(layer), Some(guard)),
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    eprintln!("🤖 Intake Bot v{}", env!("CARGO_PKG_VERSION"));

    // ── Database ────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Transport ───────────────────────────────────────────────────────
    let telegram = Arc::new(TelegramChannel::new(
        config.bot_token.clone(),
        config.payment_provider_token.clone(),
    ));
    telegram
        .health_check()
        .await
        .context("Telegram health check failed")?;
    let notifier = Notifier::new(telegram.clone(), config.ops_chat_id);

    // ── Advisor ─────────────────────────────────────────────────────────
    let llm = create_provider(&config.advisor).context("Failed to build advisor provider")?;
    match &llm {
        Some(provider) => eprintln!("   Advisor: {}", provider.model_name()),
        None => eprintln!("   Advisor: disabled (fallback hints only)"),
    }
    let advisor = Arc::new(CorrectionAdvisor::new(llm, &config.advisor));

    // ── Payments ────────────────────────────────────────────────────────
    let payments = PaymentEngine::new(
        Arc::clone(&db),
        Arc::clone(&notifier),
        Arc::new(AllowAll),
        config.pricing.clone(),
        config.authorization_ttl,
    );
    let _expiry_handle = spawn_expiry_task(Arc::clone(&payments), EXPIRY_SWEEP_PERIOD);
    eprintln!(
        "   Pricing: {} {} / {} {}",
        config.pricing.fiat_price,
        config.pricing.fiat_currency,
        config.pricing.points_price,
        config.pricing.points_currency
    );

    // ── Form engine ─────────────────────────────────────────────────────
    let forms = Arc::new(FormEngine::new(
        SessionStore::new(),
        advisor,
        Arc::clone(&db),
        Arc::clone(&payments),
        Arc::clone(&notifier),
        config.persist_attempts,
    ));

    // ── Ops HTTP ────────────────────────────────────────────────────────
    if config.http_port != 0 {
        let app = ops_routes(OpsState {
            payments: Arc::clone(&payments),
            db: Arc::clone(&db),
        });
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port))
            .await
            .with_context(|| format!("Failed to bind ops port {}", config.http_port))?;
        eprintln!("   Ops HTTP: http://0.0.0.0:{}/health", config.http_port);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "Ops HTTP server stopped");
            }
        });
    } else {
        eprintln!("   Ops HTTP: disabled");
    }

    // ── Dispatcher ──────────────────────────────────────────────────────
    let dispatcher = Arc::new(Dispatcher::new(forms, payments, db, notifier));
    let events = telegram
        .start()
        .await
        .context("Failed to start Telegram polling")?;
    eprintln!("   Listening for updates.\n");

    dispatcher.run(events).await;
    Ok(())
}
