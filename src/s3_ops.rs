use std::time::Duration;

use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use sentry::Level;
use tokio::time::sleep;

use crate::database::AppState;
use crate::store_throttle::StoreThrottle;

fn parse_retry_delay<E>(err: &SdkError<E>) -> Option<Duration> {
    let resp = err.raw_response()?;
    let headers = resp.headers();

    // Prefer standard header if present.
    // Retry-After can be either seconds or an HTTP-date; we only support seconds.
    if let Some(v) = headers.get("retry-after") {
        let s = v.to_string();
        if let Ok(secs) = s.trim().parse::<u64>() {
            return Some(Duration::from_secs(secs));
        }
    }

    for key in ["ratelimit-reset", "x-ratelimit-reset", "x-rate-limit-reset"] {
        if let Some(v) = headers.get(key) {
            let trimmed = v.to_string();
            let trimmed = trimmed.trim().to_string();
            if let Ok(secs) = trimmed.parse::<u64>() {
                return Some(Duration::from_secs(secs));
            }
            if let Ok(secs_f) = trimmed.parse::<f64>() {
                if secs_f.is_finite() && secs_f >= 0.0 {
                    return Some(Duration::from_secs_f64(secs_f));
                }
            }
        }
    }

    None
}

#[derive(Debug, Clone)]
pub enum S3OpError {
    TooManyRequests,
    NotFound,
    Forbidden,
    Other(String, Option<u16>),
}

impl std::fmt::Display for S3OpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for S3OpError {}

const MAX_RETRIES: usize = 3;
const BASE_BACKOFF_MS: u64 = 120;

async fn call_with_retry<T, E, F, Fut>(throttle: &StoreThrottle, make_call: F) -> Result<T, S3OpError>
where
    E: Send + Sync + std::fmt::Debug + 'static,
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, SdkError<E>>>,
{
    let mut attempt = 0;
    loop {
        let _slot = throttle.acquire().await;
        match make_call().await {
            Ok(res) => return Ok(res),
            Err(err) => {
                let status = err.raw_response().map(|r| r.status().as_u16());
                match status {
                    // Common transient 5xx are retryable (bounded).
                    Some(429 | 500 | 502 | 503 | 504) if attempt < MAX_RETRIES => {
                        attempt += 1;
                        let exp_backoff = Duration::from_millis(
                            BASE_BACKOFF_MS * 2u64.saturating_pow(attempt as u32),
                        );
                        let header_delay = parse_retry_delay(&err);
                        let delay = match header_delay {
                            Some(h) if h > exp_backoff => h,
                            _ => exp_backoff,
                        };
                        sleep(delay).await;
                        continue;
                    }
                    Some(404) => return Err(S3OpError::NotFound),
                    Some(403) => return Err(S3OpError::Forbidden),
                    Some(429) => return Err(S3OpError::TooManyRequests),
                    _ => return Err(S3OpError::Other(format!("{err:?}"), status)),
                }
            }
        }
    }
}

fn log_s3_error(op: &str, bucket: &str, key: Option<&str>, err: &S3OpError) {
    // NotFound on the bucket probe is expected behavior
    if op == "head_bucket" && matches!(err, S3OpError::NotFound) {
        return;
    }

    let location = key
        .map(|k| format!("{bucket}/{k}"))
        .unwrap_or_else(|| bucket.to_string());

    sentry::add_breadcrumb(sentry::Breadcrumb {
        category: Some("s3_ops".into()),
        message: Some(format!("s3_ops {op} failed for {location}: {err:?}")),
        level: Level::Warning,
        ..Default::default()
    });

    // Capture without the specific key so Sentry groups occurrences together.
    let grouped_message = match err {
        S3OpError::TooManyRequests => format!("s3_ops {op} TooManyRequests"),
        S3OpError::NotFound => format!("s3_ops {op} NotFound"),
        S3OpError::Forbidden => format!("s3_ops {op} Forbidden"),
        S3OpError::Other(_, Some(status)) => format!("s3_ops {op} status {status}"),
        S3OpError::Other(_, None) => format!("s3_ops {op} Other"),
    };

    match err {
        S3OpError::Other(_, _) | S3OpError::Forbidden => {
            sentry::capture_message(&grouped_message, Level::Error);
        }
        S3OpError::TooManyRequests => {
            sentry::capture_message(&grouped_message, Level::Warning);
        }
        S3OpError::NotFound => {}
    }
}

pub async fn put_object(
    state: &AppState,
    bucket: &str,
    key: &str,
    content_type: String,
    content_md5: String,
    body: Bytes,
) -> Result<aws_sdk_s3::operation::put_object::PutObjectOutput, S3OpError> {
    let res = call_with_retry::<_, aws_sdk_s3::operation::put_object::PutObjectError, _, _>(
        &state.store_throttle,
        || {
            state
                .s3_client
                .put_object()
                .bucket(bucket)
                .key(key)
                .content_length(body.len() as i64)
                .content_type(content_type.clone())
                .content_md5(content_md5.clone())
                .body(ByteStream::from(body.clone()))
                .send()
        },
    )
    .await;

    if let Err(ref err) = res {
        log_s3_error("put_object", bucket, Some(key), err);
    }

    res
}

pub async fn delete_object(
    state: &AppState,
    bucket: &str,
    key: &str,
) -> Result<aws_sdk_s3::operation::delete_object::DeleteObjectOutput, S3OpError> {
    let res = call_with_retry::<_, aws_sdk_s3::operation::delete_object::DeleteObjectError, _, _>(
        &state.store_throttle,
        || state.s3_client.delete_object().bucket(bucket).key(key).send(),
    )
    .await;

    if let Err(ref err) = res {
        log_s3_error("delete_object", bucket, Some(key), err);
    }

    res
}

/// Presigned PUT and GET URLs for a key. No network round-trip happens here;
/// signing is local, so no throttle or retry applies.
pub struct PresignedPair {
    pub upload_url: String,
    pub access_url: String,
}

pub async fn presign_upload(
    state: &AppState,
    bucket: &str,
    key: &str,
    content_type: &str,
    expires_in: Duration,
) -> Result<PresignedPair, S3OpError> {
    let config = PresigningConfig::expires_in(expires_in)
        .map_err(|err| S3OpError::Other(format!("{err:?}"), None))?;

    let put = state
        .s3_client
        .put_object()
        .bucket(bucket)
        .key(key)
        .content_type(content_type)
        .presigned(config.clone())
        .await
        .map_err(|err| S3OpError::Other(format!("{err:?}"), None))?;

    let get = state
        .s3_client
        .get_object()
        .bucket(bucket)
        .key(key)
        .presigned(config)
        .await
        .map_err(|err| S3OpError::Other(format!("{err:?}"), None))?;

    Ok(PresignedPair {
        upload_url: put.uri().to_string(),
        access_url: get.uri().to_string(),
    })
}

/// Head the media bucket and create it when missing. Returns whether the
/// bucket exists afterwards; callers treat `false` as a retryable condition.
pub async fn ensure_bucket_exists(state: &AppState, bucket: &str) -> bool {
    let head = call_with_retry::<_, aws_sdk_s3::operation::head_bucket::HeadBucketError, _, _>(
        &state.store_throttle,
        || state.s3_client.head_bucket().bucket(bucket).send(),
    )
    .await;

    match head {
        Ok(_) => true,
        Err(S3OpError::NotFound) => {
            let created =
                call_with_retry::<_, aws_sdk_s3::operation::create_bucket::CreateBucketError, _, _>(
                    &state.store_throttle,
                    || state.s3_client.create_bucket().bucket(bucket).send(),
                )
                .await;
            if let Err(ref err) = created {
                log_s3_error("create_bucket", bucket, None, err);
            }
            created.is_ok()
        }
        Err(err) => {
            log_s3_error("head_bucket", bucket, None, &err);
            false
        }
    }
}
