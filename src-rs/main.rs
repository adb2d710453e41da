mod auth;
mod config;
mod format;
mod forms;
mod handlers;
mod mailer;
mod middleware;
mod models;
mod notifications;
mod rate_limit;
mod serde_stripe;
mod state;
mod store;
mod stripe_api;
mod subscription;
mod sync;
mod webhook;

use std::{collections::HashSet, env, net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use axum::{
    extract::DefaultBodyLimit,
    http::Method,
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use config::Config;
use state::AppState;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let loaded_env_files = load_env_files()?;
    init_tracing();
    if loaded_env_files.is_empty() {
        tracing::warn!("No .env or .env.local file found. Using process environment only.");
    } else {
        let files = loaded_env_files
            .iter()
            .map(|path| path.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        tracing::info!(files = %files, "Loaded environment files");
    }

    let config = Config::from_env()?;

    if config.stripe_secret_key.is_none() {
        if config.production {
            return Err(anyhow::anyhow!(
                "STRIPE_SECRET_KEY environment variable is not set"
            ));
        }

        tracing::warn!(
            "STRIPE_SECRET_KEY is not set. Stripe functionality will not work until it is provided."
        );
    }

    if config.stripe_webhook_secret.is_none() {
        tracing::warn!("STRIPE_WEBHOOK_SECRET is not set. Webhooks will be rejected.");
    }

    let session_secret = match config.session_secret.clone() {
        Some(secret) => secret,
        None if config.production => {
            return Err(anyhow::anyhow!(
                "SESSION_SECRET environment variable is not set"
            ))
        }
        None => {
            tracing::warn!(
                "SESSION_SECRET is not set. Using a random secret; sessions end when the process restarts."
            );
            format!("{}{}", uuid::Uuid::new_v4().simple(), uuid::Uuid::new_v4().simple())
        }
    };

    let auth = auth::AuthService::new(
        session_secret.as_bytes(),
        chrono::Duration::hours(config.session_ttl_hours),
        chrono::Duration::hours(config.activation_token_ttl_hours),
    )?;
    let stripe = stripe_api::StripeApi::new(
        config.stripe_secret_key.clone(),
        config.stripe_webhook_secret.clone(),
    )?
    .with_base_url(config.stripe_api_base.clone());

    let store: Arc<dyn store::BillingStore> = match config.store_path.clone() {
        Some(path) => Arc::new(store::MemoryStore::with_snapshot(path).await?),
        None => {
            tracing::warn!("STORE_PATH is not set. Billing state is kept in memory only.");
            Arc::new(store::MemoryStore::new())
        }
    };

    let mailer: Arc<dyn mailer::Mailer> = match config.smtp.as_ref() {
        Some(smtp) => {
            let mailer = mailer::SmtpMailer::new(smtp, &config.from_email)
                .context("failed to configure SMTP mailer")?;
            tracing::info!(host = %smtp.host, port = smtp.port, "SMTP mailer configured");
            Arc::new(mailer)
        }
        None => {
            tracing::warn!("SMTP_HOST is not set. Outgoing email is written to the log.");
            Arc::new(mailer::LogMailer)
        }
    };

    let state = AppState::new(config.clone(), store, auth, stripe, mailer);

    let app = build_router(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    if let Some((cert_path, key_path)) = valid_tls_paths(&config) {
        let tls_config = RustlsConfig::from_pem_file(cert_path, key_path)
            .await
            .context("failed to load TLS certificate/key")?;

        tracing::info!(
            port = config.port,
            "TLS configuration loaded. Running in HTTPS mode."
        );

        axum_server::bind_rustls(addr, tls_config)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .context("HTTPS server failed")?;
    } else {
        tracing::info!(port = config.port, "Running in HTTP mode.");
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .context("failed to bind TCP listener")?;

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .context("HTTP server failed")?;
    }

    Ok(())
}

fn build_router(state: AppState) -> Router {
    let auth_router = Router::new()
        .route("/register", post(handlers::register))
        .route("/login", post(handlers::login))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_rate_limit,
        ))
        .route("/activate/{uid}/{token}", get(handlers::activate));

    let account_router = Router::new()
        .route("/customer", get(handlers::get_customer))
        .route("/billing/{id}", get(handlers::get_billing))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ));

    let subscription_router = Router::new()
        .route("/", get(handlers::get_subscription))
        .route("/plans", get(handlers::list_plans))
        .route("/subscribe", post(handlers::subscribe))
        .route("/payment-method", post(handlers::update_payment_method))
        .route("/plan", post(handlers::change_plan))
        .route("/cancel", post(handlers::cancel_subscription))
        .route("/portal", post(handlers::create_portal_session))
        .route("/checkout", post(handlers::create_checkout_session))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ));

    let paid_router = Router::new()
        .route("/pro", get(handlers::premium))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_paid_subscription,
        ));

    // Layers added later run first, so authentication wraps the gates.
    let premium_router = Router::new()
        .route("/", get(handlers::premium))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_entitlement,
        ))
        .merge(paid_router)
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ));

    let admin_router = Router::new()
        .route("/customers", get(handlers::admin_customers))
        .route("/events", get(handlers::admin_events))
        .route("/bills", get(handlers::admin_bills))
        .route_layer(axum_middleware::from_fn(middleware::require_staff))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ));

    let api_router = Router::new()
        .route("/config", get(handlers::get_public_config))
        .nest("/auth", auth_router)
        .nest("/subscription", subscription_router)
        .nest("/premium", premium_router)
        .nest("/admin", admin_router)
        .merge(account_router)
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::api_rate_limit,
        ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/api/stripe/webhook", post(handlers::handle_stripe_webhook))
        .nest("/health", Router::new().route("/", get(handlers::health)))
        .nest("/api", api_router)
        .fallback(handlers::not_found)
        .with_state(state)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn valid_tls_paths(config: &Config) -> Option<(String, String)> {
    let cert_path = config
        .tls_cert_path
        .as_ref()
        .map(|path| path.to_string_lossy().to_string());
    let key_path = config
        .tls_key_path
        .as_ref()
        .map(|path| path.to_string_lossy().to_string());

    match (cert_path, key_path) {
        (Some(cert_path), Some(key_path)) => {
            let cert_exists = std::path::Path::new(&cert_path).exists();
            let key_exists = std::path::Path::new(&key_path).exists();

            if cert_exists && key_exists {
                Some((cert_path, key_path))
            } else {
                if !key_exists {
                    tracing::error!(path = %key_path, "TLS key file not found");
                }
                if !cert_exists {
                    tracing::error!(path = %cert_path, "TLS certificate file not found");
                }
                tracing::error!("Proceeding without TLS.");
                None
            }
        }
        (Some(cert_path), None) => {
            tracing::error!(path = %cert_path, "TLS certificate file provided but TLS key path missing");
            tracing::error!("Proceeding without TLS.");
            None
        }
        (None, Some(key_path)) => {
            tracing::error!(path = %key_path, "TLS key file provided but TLS certificate path missing");
            tracing::error!("Proceeding without TLS.");
            None
        }
        (None, None) => None,
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn load_env_files() -> anyhow::Result<Vec<PathBuf>> {
    let mut roots = Vec::new();
    if let Ok(cwd) = env::current_dir() {
        roots.push(cwd);
    }
    if let Ok(executable_path) = env::current_exe() {
        if let Some(executable_dir) = executable_path.parent() {
            roots.push(executable_dir.to_path_buf());
        }
    }
    roots.push(PathBuf::from(env!("CARGO_MANIFEST_DIR")));

    let mut seen_roots = HashSet::new();
    let mut loaded = Vec::new();

    for root in roots {
        let key = root.to_string_lossy().to_string();
        if !seen_roots.insert(key) {
            continue;
        }

        for filename in [".env", ".env.local"] {
            let path = root.join(filename);
            if path.is_file() {
                dotenvy::from_path(&path)
                    .with_context(|| format!("failed to load {}", path.display()))?;
                loaded.push(path);
            }
        }
    }

    if loaded.is_empty() {
        if let Ok(path) = dotenvy::dotenv() {
            loaded.push(path);
        }
    }

    Ok(loaded)
}
