use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use axum::{body::Body, routing::get, Router};
use http::{HeaderValue, StatusCode};
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::SmartIpKeyExtractor;
use tower_governor::{GovernorError, GovernorLayer};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use clinic_calendar_sync::config::Config;
use clinic_calendar_sync::services::google_calendar::GoogleCalendarService;
use clinic_calendar_sync::services::init;
use clinic_calendar_sync::services::sync::CalendarLocks;
use clinic_calendar_sync::{middleware, routes, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clinic_calendar_sync=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting clinic calendar sync service");

    if config.sync.cron_secret.is_none() {
        tracing::warn!("CRON_SECRET is not set; cron and operator endpoints will reject every request");
    }
    if let Err(e) = config.sync.webhook_address() {
        tracing::warn!("Channel setup and renewal unavailable: {}", e);
    }

    // Initialize database
    let pool = init::init_db(&config).await?;

    let calendar = GoogleCalendarService::new(&config.google)?;

    let app_state = Arc::new(AppState {
        db: pool,
        config: config.clone(),
        calendar: Arc::new(calendar),
        locks: CalendarLocks::default(),
    });

    // Create shutdown notifier for background workers and std threads
    let (shutdown_tx, _shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    let thread_shutdown = Arc::new(AtomicBool::new(false));

    // Spawn background workers (returns JoinHandles so we can await shutdown)
    let bg_handles = init::spawn_background_workers(app_state.clone(), shutdown_tx.clone());

    // Webhook limiter. Google retries throttled notifications, so a 429 is safe.
    let mut webhooks_builder = GovernorConfigBuilder::default().key_extractor(SmartIpKeyExtractor);
    webhooks_builder.per_second(config.rate_limit.webhook_per_second.into());
    webhooks_builder.burst_size(config.rate_limit.webhook_burst);
    webhooks_builder.error_handler(rate_limit_response);

    let webhooks_gov_conf = Arc::new(
        webhooks_builder
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Failed to build webhooks governor config"))?,
    );

    // Background cleanup for webhooks limiter storage
    let webhooks_cleaner = {
        let limiter = webhooks_gov_conf.limiter().clone();
        let interval = Duration::from_secs(60);
        let flag = thread_shutdown.clone();
        std::thread::spawn(move || {
            // Use smaller sleep granularity to allow quick shutdown.
            let tick = Duration::from_secs(1);
            loop {
                for _ in 0..interval.as_secs() {
                    if flag.load(Ordering::SeqCst) {
                        tracing::info!("Webhooks rate limiter cleanup thread exiting");
                        return;
                    }
                    std::thread::sleep(tick);
                }
                tracing::debug!("webhooks rate limiter size: {}", limiter.len());
                limiter.retain_recent();
            }
        })
    };

    let webhooks_rate_layer = GovernorLayer {
        config: webhooks_gov_conf.clone(),
    };

    // Build router
    let mut app = Router::new()
        // Health check
        .route("/health", get(routes::health::health_check))
        // Google push notifications (rate limited)
        .merge(routes::webhooks::router().layer(webhooks_rate_layer))
        // Manual channel setup and resync
        .nest("/api/gcal", routes::gcal::router())
        // Scheduler-driven sweeps
        .nest("/api/cron", routes::cron::router())
        // Add shared state
        .with_state(app_state.clone())
        .layer(axum::middleware::from_fn(
            middleware::security_headers::security_headers,
        ))
        .layer(TraceLayer::new_for_http());

    match config.server.frontend_url.as_deref() {
        Some(origin) => {
            let origin = origin
                .parse::<HeaderValue>()
                .map_err(|_| anyhow::anyhow!("Invalid FRONTEND_URL for CORS: {}", origin))?;
            app = app.layer(
                CorsLayer::new()
                    .allow_origin(origin)
                    .allow_methods([http::Method::GET, http::Method::POST, http::Method::OPTIONS])
                    .allow_headers([
                        http::header::CONTENT_TYPE,
                        http::header::AUTHORIZATION,
                        http::header::ACCEPT,
                    ]),
            );
        }
        None => tracing::debug!("FRONTEND_URL not set; CORS disabled"),
    }

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Server listening on {}", addr);

    // Select between the server and the signal listener. On a signal, notify
    // workers and threads, then drop the server future to stop accepting.
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let server_fut = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    );

    let shutdown_tx_clone = shutdown_tx.clone();
    let thread_shutdown_clone = thread_shutdown.clone();

    let signal_fut = async move {
        wait_for_signal().await;
        tracing::info!("Shutdown signal received, notifying background workers and threads");
        let _ = shutdown_tx_clone.send(());
        thread_shutdown_clone.store(true, Ordering::SeqCst);
    };

    tokio::select! {
        res = server_fut => {
            if let Err(e) = res {
                tracing::error!("Server error: {}", e);
            }
        }
        _ = signal_fut => {
            tracing::info!("Signal handler completed; server future dropped to stop accepting new connections");
        }
    }

    // Give background workers some time to finish their work.
    let shutdown_wait = Duration::from_secs(15);
    tracing::info!(
        "Waiting up to {}s for background workers to exit",
        shutdown_wait.as_secs()
    );

    let bg_wait = async {
        for h in bg_handles {
            let _ = h.await;
        }
    };
    if tokio::time::timeout(shutdown_wait, bg_wait).await.is_err() {
        tracing::warn!("Background workers did not exit in time");
    }

    // The cleaner checks `thread_shutdown` every second.
    thread_shutdown.store(true, Ordering::SeqCst);
    if webhooks_cleaner.join().is_err() {
        tracing::warn!("Webhooks rate limiter cleanup thread panicked");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!("Failed to bind SIGTERM, waiting for Ctrl+C only: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to bind Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

/// JSON 429 in the same `{"error": {...}}` shape as `AppError`.
fn rate_limit_response(error: GovernorError) -> http::Response<Body> {
    let (status, body, headers) = match error {
        GovernorError::TooManyRequests { wait_time, headers } => {
            let body = serde_json::json!({
                "error": {
                    "code": "RATE_LIMITED",
                    "message": "Rate limit exceeded",
                    "details": { "retry_after_seconds": wait_time }
                }
            });
            let mut extra = headers.unwrap_or_default();
            extra.insert(http::header::RETRY_AFTER, HeaderValue::from(wait_time));
            (StatusCode::TOO_MANY_REQUESTS, body, Some(extra))
        }
        GovernorError::UnableToExtractKey => (
            StatusCode::BAD_REQUEST,
            serde_json::json!({
                "error": {
                    "code": "INVALID_REQUEST",
                    "message": "Unable to determine client IP for rate limiting"
                }
            }),
            None,
        ),
        GovernorError::Other { code, msg, headers } => (
            StatusCode::from_u16(code.as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            serde_json::json!({
                "error": {
                    "code": "RATE_LIMIT_ERROR",
                    "message": msg.unwrap_or_else(|| "Rate limiting error".to_string())
                }
            }),
            headers,
        ),
    };

    let mut resp = http::Response::new(Body::from(body.to_string()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    if let Some(hmap) = headers {
        for (name, value) in hmap.iter() {
            resp.headers_mut().append(name.clone(), value.clone());
        }
    }
    resp
}
