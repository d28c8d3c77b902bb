use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use zstream_core::{ChunkGrid, ChunkKey, Payload};

use crate::{check_chunk_len, chunk_path, Backoff, BlockingRuntime, ChunkStore, FetchError};

type HttpClient = reqwest::Client;

const MAX_ATTEMPTS: usize = 5;

/// Zarr v2 array served over plain HTTP(S): `GET <base>/.zarray`, `GET <base>/<i.j.k>`.
pub struct HttpChunkStore {
    base_url: String,
    grid: ChunkGrid,
    client: HttpClient,
    rt: BlockingRuntime,
}

impl HttpChunkStore {
    /// Connects to `base_url` and reads the array metadata.
    pub fn open(base_url: &str) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let rt = BlockingRuntime::new("zstream-http")?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(15))
            .build()?;

        let meta_url = format!("{base_url}/.zarray");
        let meta = rt.block_on(async {
            let resp = client.get(&meta_url).send().await?;
            if !resp.status().is_success() {
                anyhow::bail!("http GET failed: status={} url={}", resp.status(), meta_url);
            }
            Ok::<_, anyhow::Error>(resp.bytes().await?)
        })?;
        let grid = ChunkGrid::from_zarray_json(&meta)?;

        tracing::info!(
            target: "zstream",
            event = "store_opened",
            backend = "http",
            base_url = %base_url,
            num_chunks = grid.num_chunks(),
            "opened http chunk store"
        );

        Ok(Self {
            base_url,
            grid,
            client,
            rt,
        })
    }

    pub fn grid(&self) -> &ChunkGrid {
        &self.grid
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_chunk(&self, key: ChunkKey, url: &str) -> Result<Payload, FetchError> {
        let resp = http_with_retry(key, || self.client.get(url).send())
            .await
            .map_err(|e| FetchError::transient(key, e))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound { key });
        }
        if !status.is_success() {
            return Err(FetchError::transient(
                key,
                format!("http GET failed: status={status} url={url}"),
            ));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| FetchError::transient(key, e))?;
        check_chunk_len(&self.grid, key, bytes.len())?;
        Ok(Arc::from(bytes.as_ref()))
    }
}

impl ChunkStore for HttpChunkStore {
    fn fetch(&self, key: ChunkKey) -> Result<Payload, FetchError> {
        let url = format!("{}/{}", self.base_url, chunk_path(&self.grid, key)?);
        self.rt.block_on(self.get_chunk(key, &url))
    }
}

/// Retries connect/timeout errors and 408/429/5xx responses; returns the last response otherwise.
async fn http_with_retry<F, Fut>(
    key: ChunkKey,
    mut f: F,
) -> std::result::Result<reqwest::Response, reqwest::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<reqwest::Response, reqwest::Error>>,
{
    let mut backoff = Backoff::new(MAX_ATTEMPTS, key);
    loop {
        match f().await {
            Ok(resp) => {
                let status = resp.status();
                let transient = status == reqwest::StatusCode::TOO_MANY_REQUESTS
                    || status == reqwest::StatusCode::REQUEST_TIMEOUT
                    || status.is_server_error();
                if transient && backoff.can_retry() {
                    tracing::debug!(
                        target: "zstream",
                        event = "http_retry",
                        key = %key,
                        status = status.as_u16(),
                        "retrying chunk GET"
                    );
                    backoff.wait().await;
                    continue;
                }
                return Ok(resp);
            }
            Err(err) => {
                let transient = err.is_timeout() || err.is_connect();
                if transient && backoff.can_retry() {
                    backoff.wait().await;
                    continue;
                }
                return Err(err);
            }
        }
    }
}
