mod auth;
mod bedrock;
mod config;
mod constants;
mod db;
mod error;
mod metrics;
mod pricing;
mod quota;
mod request_context;
mod routes;
mod scheduler;
mod transforms;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    middleware,
    routing::{get, post},
};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use auth::{AuthRateLimiter, RateLimitConfig};
use bedrock::BedrockClient;
use config::{Config, JwtConfig, UPSTREAM_TIMEOUT};
use db::Store;
use metrics::{MetricsWorker, MetricsWorkerConfig};
use scheduler::Scheduler;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");
pub const BUILD_TIME: &str = env!("BUILD_TIME");

pub struct AppState {
    pub config: Config,
    pub jwt: JwtConfig,
    pub store: Option<Store>,
    pub metrics: Option<Arc<MetricsWorker>>,
    pub rate_limiter: Arc<AuthRateLimiter>,
    pub bedrock: BedrockClient,
}

#[derive(Parser)]
#[command(name = "bedrock-gateway")]
#[command(about = "Anthropic Messages to Bedrock Converse translating gateway")]
struct Args {
    /// Host to bind to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind to (overrides PORT)
    #[arg(short, long)]
    port: Option<u16>,
}

fn init_logging(environment: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| {
            std::env::var("LOG_LEVEL")
                .map_err(|_| ())
                .and_then(|level| tracing_subscriber::EnvFilter::try_new(level).map_err(|_| ()))
        })
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if environment == "production" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = Config::from_env();

    init_logging(&config.server.environment);

    if !config.bedrock.has_credentials() {
        let err = error::GatewayError::ConfigMissing(
            "AWS_BEDROCK_ACCESS_KEY, AWS_BEDROCK_SECRET_KEY, AWS_BEDROCK_REGION".into(),
        );
        error!(error = %err, "startup aborted");
        std::process::exit(1);
    }

    info!(
        version = VERSION,
        git_hash = GIT_HASH,
        build_time = BUILD_TIME,
        region = %config.bedrock.region,
        environment = %config.server.environment,
        instance_id = %config.server.instance_id,
        "bedrock gateway starting"
    );
    if config.bedrock.debug {
        warn!("debug mode enabled");
    }

    // Shared upstream client with connection pooling
    let http_client = reqwest::Client::builder()
        .timeout(UPSTREAM_TIMEOUT)
        .pool_max_idle_per_host(10)
        .build()
        .expect("failed to create HTTP client");

    let bedrock_client = BedrockClient::new(config.bedrock.clone(), http_client);

    // The store is optional: without it the gateway degrades to the
    // legacy unauthenticated mode instead of refusing to start
    let store = if config.database.is_configured() {
        match Store::connect(&config.database).await {
            Ok(store) => Some(store),
            Err(e) => {
                warn!(error = %e, "database connection failed, continuing without auth/quotas");
                None
            }
        }
    } else {
        info!("database not configured, continuing without auth/quotas");
        None
    };

    let metrics_worker = store.as_ref().map(|store| {
        let worker = Arc::new(MetricsWorker::new(
            store.clone(),
            MetricsWorkerConfig::default(),
        ));
        worker.start();
        worker
    });

    let daily_scheduler = store.as_ref().map(|store| Scheduler::start(store.clone()));

    let auth_enabled = store.is_some() && !config.jwt.secret_key.is_empty();
    if store.is_some() && config.jwt.secret_key.is_empty() {
        warn!("JWT_SECRET_KEY not configured, continuing without auth");
    }

    let state = Arc::new(AppState {
        jwt: config.jwt.clone(),
        store,
        metrics: metrics_worker.clone(),
        rate_limiter: AuthRateLimiter::new(RateLimitConfig::default()),
        bedrock: bedrock_client,
        config: config.clone(),
    });

    let messages_routes = if auth_enabled {
        info!("auth and quota enforcement enabled on /v1/messages");
        Router::new()
            .route("/v1/messages", post(routes::messages::messages))
            .route_layer(middleware::from_fn_with_state(
                state.clone(),
                quota::enforce_quota,
            ))
            .route_layer(middleware::from_fn_with_state(
                state.clone(),
                auth::require_auth,
            ))
    } else {
        warn!("/v1/messages running without authentication (legacy mode)");
        Router::new().route("/v1/messages", post(routes::messages::messages))
    };

    let app = Router::new()
        .route("/health", get(routes::health::health))
        .merge(messages_routes)
        .with_state(state.clone());

    let port = args.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{}:{}", args.host, port)
        .parse()
        .expect("invalid bind address");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind listener");
    info!(%addr, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("server error");

    // Shutdown order: scheduler first, then drain metrics, then the pool
    info!("shutting down");
    if let Some(scheduler) = &daily_scheduler {
        scheduler.stop().await;
    }
    if let Some(worker) = &metrics_worker {
        worker.stop().await;
    }
    if let Some(store) = &state.store {
        store.close().await;
    }
    info!("shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
