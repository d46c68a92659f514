use std::env;
use std::sync::Arc;

use bb8_postgres::bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use tokio_postgres::NoTls;

use crate::notifications::ImageEventHub;
use crate::store_throttle::StoreThrottle;
use aws_sdk_s3::Client as S3Client;

/// Startup-validated service configuration. Everything comes from the
/// environment; there is no module-level mutable state anywhere else.
#[derive(Clone, Debug)]
pub struct Config {
    pub media_bucket: String,
    /// Substrings identifying our own storage domain inside content URLs.
    /// Third-party image URLs never match and are never tracked.
    pub media_url_markers: Vec<String>,
    pub jwt_secret: String,
    pub presign_expire_secs: u64,
    pub sweep_interval_secs: u64,
    pub sweep_threshold_hours: i64,
}

impl Config {
    pub fn from_env() -> Self {
        let media_bucket = env::var("S3_BUCKET_NAME").expect("S3_BUCKET_NAME must be set");
        let markers = env::var("MEDIA_URL_MARKERS")
            .unwrap_or_else(|_| media_bucket.clone())
            .split(',')
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();

        Self {
            media_bucket,
            media_url_markers: markers,
            jwt_secret: env::var("JWT_SECRET").expect("JWT_SECRET must be set"),
            presign_expire_secs: env_or("PRESIGN_EXPIRE_SECS", 3600),
            sweep_interval_secs: env_or("IMAGE_SWEEP_INTERVAL_SECS", 86_400),
            sweep_threshold_hours: env_or("IMAGE_SWEEP_THRESHOLD_HOURS", 24),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

pub struct AppState {
    pub db_pool: Arc<Pool<PostgresConnectionManager<NoTls>>>,
    pub s3_client: S3Client,
    pub store_throttle: Arc<StoreThrottle>,
    pub image_events: ImageEventHub,
    pub config: Config,
}

pub type SharedConn =
    bb8_postgres::bb8::PooledConnection<'static, PostgresConnectionManager<tokio_postgres::NoTls>>;

pub async fn establish_pool_connection() -> Result<
    Pool<PostgresConnectionManager<NoTls>>,
    Box<dyn std::error::Error + Send + Sync + 'static>,
> {
    let conn_manager = PostgresConnectionManager::new_from_stringlike(
        env::var("DATABASE_URL").expect("Expected DATABASE_URL to exist in the environment"),
        NoTls,
    )
    .unwrap();

    let pool = Pool::builder()
        .min_idle(Some(1))
        .max_size(15)
        .build(conn_manager)
        .await?;
    Ok(pool)
}
