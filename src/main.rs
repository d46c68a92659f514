#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
pub mod auth;
pub mod content_diff;
pub mod database;
pub mod dreams;
pub mod error;
pub mod image_lifecycle;
pub mod image_sweep;
pub mod image_tasks;
pub mod media;
pub mod notifications;
pub mod s3_ops;
pub mod store_throttle;
pub mod structs;
pub mod websocket;

use std::{env, sync::Arc, time::Duration};

use database::AppState;

use tokio::signal;

use tower_http::{classify::ServerErrorsFailureClass, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post, Router},
    Json,
};

use std::net::SocketAddr;

use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};

use aws_sdk_s3::Client as S3Client;
use uuid::Uuid;

use crate::error::AppError;
use crate::notifications::ImageEventHub;
use crate::store_throttle::StoreThrottle;
use crate::structs::{DreamCreateRequest, DreamRow, DreamUpdateRequest};

async fn create_dream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<DreamCreateRequest>,
) -> Result<(StatusCode, Json<DreamRow>), AppError> {
    let user_id = auth::user_from_headers(&state, &headers)?;

    if req.title.trim().is_empty() {
        return Err(AppError::bad_request("create_dream", "Title must not be empty"));
    }

    let dream = dreams::create(&state, user_id, req).await?;
    Ok((StatusCode::CREATED, Json(dream)))
}

async fn get_dream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(dream_id): Path<Uuid>,
) -> Result<Json<DreamRow>, AppError> {
    let user_id = auth::user_from_headers(&state, &headers)?;
    let dream = dreams::fetch(&state, user_id, dream_id).await?;
    Ok(Json(dream))
}

async fn update_dream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(dream_id): Path<Uuid>,
    Json(req): Json<DreamUpdateRequest>,
) -> Result<Json<DreamRow>, AppError> {
    let user_id = auth::user_from_headers(&state, &headers)?;
    let dream = dreams::update(&state, user_id, dream_id, req).await?;
    Ok(Json(dream))
}

async fn delete_dream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(dream_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let user_id = auth::user_from_headers(&state, &headers)?;
    let positional = dreams::delete(&state, user_id, dream_id).await?;

    // Physical store deletion happens off the request path; progress and the
    // final summary arrive over the dream's notification channel.
    image_tasks::spawn_delete_task(
        state,
        image_tasks::DeleteImagesJob {
            dream_id,
            user_id,
            items: positional,
        },
    );

    Ok(StatusCode::NO_CONTENT)
}

fn media_routes() -> Router<Arc<AppState>> {
    let media_api_ratelimit: u32 = env::var("MEDIA_API_RATE_LIMIT_PER_MINUTE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(60);

    let base_router = Router::new()
        .route("/uploadSignature", post(media::upload_signature));

    // Allow disabling the media governor with MEDIA_API_RATE_LIMIT_PER_MINUTE=0
    if media_api_ratelimit == 0 {
        return base_router;
    }

    let media_governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(u64::from(media_api_ratelimit / 60).max(1))
            .burst_size((media_api_ratelimit / 2).max(1))
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .unwrap(),
    );

    let governor_limiter = media_governor_conf.limiter().clone();
    let interval = Duration::from_secs(60);
    // background task to prune governor state
    std::thread::spawn(move || loop {
        std::thread::sleep(interval);
        governor_limiter.retain_recent();
    });

    base_router.layer(GovernorLayer::new(media_governor_conf))
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().expect(
        "Expected .env file in the root directory containing the database connection string",
    );
    let _guard = sentry::init((
        env::var("SENTRY_URL").expect("SENTRY_URL must be set"),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            traces_sample_rate: 0.2,
            max_breadcrumbs: 50,
            send_default_pii: false,
            before_send: Some(Arc::new(|mut event| {
                // Never ship raw user identifiers
                if let Some(user) = &mut event.user {
                    user.ip_address = None;
                    user.email = None;
                    user.username = None;
                    if let Some(id) = &user.id {
                        if !id.starts_with("user_") && !id.starts_with("hash_") {
                            user.id = None;
                        }
                    }
                }

                static LAST_ERRORS: once_cell::sync::Lazy<
                    std::sync::Mutex<std::collections::HashMap<String, std::time::Instant>>,
                > = once_cell::sync::Lazy::new(|| {
                    std::sync::Mutex::new(std::collections::HashMap::new())
                });

                let event_key = format!(
                    "{}:{}:{}",
                    event.message.as_ref().map(|m| m.as_str()).unwrap_or(""),
                    event.level,
                    event
                        .exception
                        .values
                        .first()
                        .map(|e| e.ty.as_str())
                        .unwrap_or("")
                );

                let mut last_errors = LAST_ERRORS.lock().unwrap();
                let now = std::time::Instant::now();

                // Drop duplicates seen within the rate limit window
                if let Some(last_seen) = last_errors.get(&event_key) {
                    if now.duration_since(*last_seen).as_secs() < 60 {
                        return None;
                    }
                }

                last_errors.insert(event_key, now);
                last_errors.retain(|_, &mut v| now.duration_since(v).as_secs() < 300);

                Some(event)
            })),
            ..Default::default()
        },
    ));

    let s3_access_key_id = env::var("S3_ACCESS_KEY_ID").expect("S3_ACCESS_KEY_ID must be set");
    let s3_secret_access_key =
        env::var("S3_SECRET_ACCESS_KEY").expect("S3_SECRET_ACCESS_KEY must be set");
    let s3_domain = env::var("S3_DOMAIN").expect("S3_DOMAIN must be set");

    let credentials = aws_sdk_s3::config::Credentials::new(
        s3_access_key_id,
        s3_secret_access_key,
        None,
        None,
        "s3-credentials",
    );

    let region_provider =
        aws_config::meta::region::RegionProviderChain::default_provider().or_else("eu-central-1");
    let s3_config = aws_config::from_env()
        .region(region_provider)
        .credentials_provider(aws_sdk_s3::config::SharedCredentialsProvider::new(
            credentials,
        ))
        .endpoint_url(&s3_domain)
        .load()
        .await;

    let s3_service_config = aws_sdk_s3::config::Builder::from(&s3_config)
        .force_path_style(true)
        .build();

    let s3_client = S3Client::from_conf(s3_service_config);

    let store_max_rps: u32 = env::var("S3_MAX_RPS")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(120);
    let store_max_concurrency: usize = env::var("S3_MAX_CONCURRENCY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(32);
    let store_throttle = Arc::new(StoreThrottle::new(store_max_concurrency, store_max_rps));

    let pool = database::establish_pool_connection()
        .await
        .expect("Failed to establish database connection pool");

    let config = database::Config::from_env();

    let state = Arc::new(AppState {
        db_pool: Arc::new(pool),
        s3_client,
        store_throttle,
        image_events: ImageEventHub::new(),
        config,
    });

    // Provision the media bucket up front; workers re-check before uploads.
    if !s3_ops::ensure_bucket_exists(&state, &state.config.media_bucket).await {
        println!(
            "warning: media bucket '{}' could not be verified at startup",
            state.config.media_bucket
        );
    }

    // start the periodic purge of expired pending-delete images
    image_sweep::start_sweep_task(state.clone());

    // Enable tracing.
    let env_filter = if cfg!(debug_assertions) {
        // Debug build
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            format!(
                "{}=debug,tower_http=debug,axum=trace",
                env!("CARGO_CRATE_NAME")
            )
            .into()
        })
    } else {
        // Release build
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            format!(
                "{}=info,tower_http=info,axum=info",
                env!("CARGO_CRATE_NAME")
            )
            .into()
        })
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();

    let global_api_ratelimit: u32 = env::var("STANDARD_API_RATE_LIMIT_PER_MINUTE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(120);
    let global_governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(u64::from(global_api_ratelimit / 60).max(1))
            .burst_size((global_api_ratelimit / 2).max(1))
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .unwrap(),
    );

    let governor_limiter = global_governor_conf.limiter().clone();
    let interval = Duration::from_secs(60);
    // a separate background task to clean up
    std::thread::spawn(move || loop {
        std::thread::sleep(interval);
        governor_limiter.retain_recent();
    });

    // Build our application with routes. The WebSocket routes stay outside
    // the governor so long-lived connections don't eat the rate budget.
    let app = Router::new()
        .route("/dreams", post(create_dream))
        .route(
            "/dreams/{dream_id}",
            get(get_dream).put(update_dream).delete(delete_dream),
        )
        .route("/dreams/{dream_id}/images", post(media::dispatch_dream_images))
        .nest("/media", media_routes())
        .layer(GovernorLayer::new(global_governor_conf))
        .merge(websocket::routes())
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .on_request(())
                .on_response(())
                .on_failure(
                    |error: ServerErrorsFailureClass,
                     latency: Duration,
                     _span: &tracing::Span| {
                        match &error {
                            ServerErrorsFailureClass::StatusCode(code) => {
                                // Handlers report their own errors; a 5xx
                                // reaching this point escaped them.
                                if code.is_server_error() {
                                    sentry::capture_message(
                                        &format!(
                                            "unhandled server error {code}, latency={}ms",
                                            latency.as_millis()
                                        ),
                                        sentry::Level::Error,
                                    );
                                    tracing::error!(
                                        status = %code,
                                        latency_ms = %latency.as_millis(),
                                        "unhandled server error"
                                    );
                                }
                            }
                            ServerErrorsFailureClass::Error(msg) => {
                                tracing::warn!(
                                    error = %msg,
                                    latency_ms = %latency.as_millis(),
                                    "connection/protocol issue"
                                );
                            }
                        }
                    },
                ),
        );

    let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "localhost:8000".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await.unwrap();
    println!("listening on {}", listener.local_addr().unwrap());
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .unwrap();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
