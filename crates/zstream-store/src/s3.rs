use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::{GetObjectError, GetObjectOutput};
use aws_sdk_s3::primitives::AggregatedBytes;

use zstream_core::{ChunkGrid, ChunkKey, Payload};

use crate::{check_chunk_len, chunk_path, Backoff, BlockingRuntime, ChunkStore, FetchError};

const MAX_ATTEMPTS: usize = 3;

/// Zarr v2 array under `s3://bucket/prefix`.
pub struct S3ChunkStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
    grid: ChunkGrid,
    rt: BlockingRuntime,
}

impl S3ChunkStore {
    /// Opens `bucket/prefix` (the `s3://` scheme already stripped) and reads `.zarray`.
    pub fn open(rest: &str) -> Result<Self> {
        let (bucket, prefix) = parse_bucket_prefix(rest)?;
        let rt = BlockingRuntime::new("zstream-s3")?;
        let client = rt.block_on(client_from_env())?;

        let meta_key = join_key(&prefix, ".zarray");
        let meta = rt
            .block_on(get_object_bytes(&client, &bucket, &meta_key, ChunkKey(0)))
            .map_err(|e| anyhow::anyhow!("read s3://{bucket}/{meta_key}: {e}"))?;
        let grid = ChunkGrid::from_zarray_json(&meta)?;

        tracing::info!(
            target: "zstream",
            event = "store_opened",
            backend = "s3",
            bucket = %bucket,
            prefix = %prefix,
            num_chunks = grid.num_chunks(),
            "opened s3 chunk store"
        );

        Ok(Self {
            client,
            bucket,
            prefix,
            grid,
            rt,
        })
    }

    pub fn grid(&self) -> &ChunkGrid {
        &self.grid
    }
}

impl ChunkStore for S3ChunkStore {
    fn fetch(&self, key: ChunkKey) -> Result<Payload, FetchError> {
        let object_key = join_key(&self.prefix, &chunk_path(&self.grid, key)?);
        let bytes = self.rt.block_on(get_object_bytes(
            &self.client,
            &self.bucket,
            &object_key,
            key,
        ))?;
        check_chunk_len(&self.grid, key, bytes.len())?;
        Ok(Arc::from(bytes))
    }
}

async fn get_object_bytes(
    client: &aws_sdk_s3::Client,
    bucket: &str,
    object_key: &str,
    key: ChunkKey,
) -> Result<Vec<u8>, FetchError> {
    let out: GetObjectOutput = s3_with_retry(key, || async move {
        client.get_object().bucket(bucket).key(object_key).send().await
    })
    .await
    .map_err(|err| map_get_err(key, err))?;
    let collected: AggregatedBytes = out
        .body
        .collect()
        .await
        .map_err(|e| FetchError::transient(key, e))?;
    Ok(collected.into_bytes().to_vec())
}

fn map_get_err(key: ChunkKey, err: SdkError<GetObjectError>) -> FetchError {
    if let SdkError::ServiceError(ref se) = err {
        if se.err().is_no_such_key() {
            return FetchError::NotFound { key };
        }
    }
    FetchError::transient(key, err)
}

fn s3_is_transient<E>(err: &SdkError<E>) -> bool {
    match err {
        SdkError::TimeoutError(_) => true,
        SdkError::DispatchFailure(_) => true,
        SdkError::ResponseError(_) => true,
        SdkError::ConstructionFailure(_) => false,
        SdkError::ServiceError(_) => err
            .raw_response()
            .map(|raw| {
                let status_u16: u16 = raw.status().into();
                status_u16 == 429 || status_u16 >= 500
            })
            .unwrap_or(false),
        _ => false,
    }
}

async fn s3_with_retry<T, E, F, Fut>(key: ChunkKey, mut f: F) -> Result<T, SdkError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SdkError<E>>>,
{
    let mut backoff = Backoff::new(MAX_ATTEMPTS, key);
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(err) => {
                if s3_is_transient(&err) && backoff.can_retry() {
                    backoff.wait().await;
                    continue;
                }
                return Err(err);
            }
        }
    }
}

fn join_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

fn parse_bucket_prefix(rest: &str) -> Result<(String, String)> {
    let s = rest.trim().trim_matches('/');
    let (bucket, prefix) = s.split_once('/').unwrap_or((s, ""));
    let bucket = bucket.trim();
    anyhow::ensure!(!bucket.is_empty(), "invalid s3 url (empty bucket): s3://{rest}");
    Ok((bucket.to_string(), prefix.trim_matches('/').to_string()))
}

/// Build an S3 client from the ambient environment.
///
/// - Default: standard AWS resolution (region/creds from env/config/role).
/// - Optional: override endpoint via `ZSTREAM_S3_ENDPOINT_URL` (MinIO or other S3-compatible stores).
/// - Optional: `ZSTREAM_S3_FORCE_PATH_STYLE=1` to force path-style addressing (defaults on
///   when an endpoint override is set).
async fn client_from_env() -> Result<aws_sdk_s3::Client> {
    let cfg = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

    let endpoint_url: Option<String> = std::env::var("ZSTREAM_S3_ENDPOINT_URL").ok();
    let force_path_style = match parse_env_bool("ZSTREAM_S3_FORCE_PATH_STYLE")? {
        Some(v) => v,
        None => endpoint_url.is_some(),
    };

    let mut b: S3ConfigBuilder = aws_sdk_s3::config::Builder::from(&cfg);
    if let Some(url) = endpoint_url {
        b = b.endpoint_url(url);
    }
    if force_path_style {
        b = b.force_path_style(true);
    }

    Ok(aws_sdk_s3::Client::from_conf(b.build()))
}

fn parse_env_bool(key: &str) -> Result<Option<bool>> {
    match std::env::var(key) {
        Ok(v) => {
            let b = match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "y" | "on" => true,
                "0" | "false" | "no" | "n" | "off" => false,
                _ => anyhow::bail!(
                    "invalid boolean env var {}={:?} (expected true/false/1/0)",
                    key,
                    v
                ),
            };
            Ok(Some(b))
        }
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(anyhow::Error::new(e)),
    }
}
