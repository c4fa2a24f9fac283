use crate::models::{Manifest, RouteData, ScheduleData};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::sync::RwLock;
use thiserror::Error;

/// Errors from dataset fetches. Cloneable so a shared in-flight load can fan
/// the same failure out to every waiter.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("GET {path} returned status {status}")]
    Status { path: String, status: u16 },
    #[error("GET {path} failed: {message}")]
    Transport { path: String, message: String },
    #[error("could not decode {path}: {message}")]
    Decode { path: String, message: String },
}

/// Byte source behind the data client. The production implementation is
/// [`HttpFetcher`]; tests substitute an in-memory map.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, path: &str) -> BoxFuture<'static, Result<Vec<u8>, FetchError>>;
}

/// Fetches dataset JSON (manifest, per-route geometry, per-route schedules)
/// on demand. Once the manifest is loaded, subsequent requests carry a
/// cache-busting `?v=<generatedAt>` revision parameter.
pub struct DataClient {
    fetcher: Arc<dyn Fetcher>,
    revision: RwLock<Option<String>>,
}

impl DataClient {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        DataClient {
            fetcher,
            revision: RwLock::new(None),
        }
    }

    pub async fn load_manifest(&self) -> Result<Manifest, FetchError> {
        let manifest: Manifest = self.get_json("manifest.json").await?;
        *self.revision.write().unwrap() = Some(manifest.generated_at.clone());
        Ok(manifest)
    }

    pub async fn load_route_data(&self, file: &str) -> Result<RouteData, FetchError> {
        self.get_json(file).await
    }

    pub async fn load_schedule_data(&self, file: &str) -> Result<ScheduleData, FetchError> {
        self.get_json(file).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, FetchError> {
        let stamped = self.stamp_revision(path);
        let bytes = self.fetcher.fetch(&stamped).await?;
        serde_json::from_slice(&bytes).map_err(|e| FetchError::Decode {
            path: path.to_string(),
            message: e.to_string(),
        })
    }

    fn stamp_revision(&self, path: &str) -> String {
        match self.revision.read().unwrap().as_deref() {
            Some(revision) => format!("{path}?v={}", urlencoding::encode(revision)),
            None => path.to_string(),
        }
    }
}

/// HTTP fetcher over a dataset root URL. Non-2xx statuses are fetch errors.
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        HttpFetcher { client, base_url }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, path: &str) -> BoxFuture<'static, Result<Vec<u8>, FetchError>> {
        let url = format!("{}/{}", self.base_url, path);
        let path = path.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let response = client.get(&url).send().await.map_err(|e| {
                FetchError::Transport {
                    path: path.clone(),
                    message: e.to_string(),
                }
            })?;

            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Status {
                    path,
                    status: status.as_u16(),
                });
            }

            let bytes = response.bytes().await.map_err(|e| FetchError::Transport {
                path: path.clone(),
                message: e.to_string(),
            })?;
            Ok(bytes.to_vec())
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MemoryFetcher;
    use super::*;
    use serde_json::json;

    fn manifest_json() -> serde_json::Value {
        json!({
            "generatedAt": "2025-11-02T04:10:00+00:00",
            "timezone": "America/New_York",
            "agencies": [{"id": "njt", "label": "NJ Transit"}],
            "routes": []
        })
    }

    #[tokio::test]
    async fn stamps_revision_after_manifest_load() {
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.insert_json("manifest.json", &manifest_json());
        fetcher.insert_json(
            "routes/njt_1.json",
            &json!({"shapes": [], "stops": []}),
        );

        let client = DataClient::new(Arc::new(Arc::clone(&fetcher)));
        let manifest = client.load_manifest().await.unwrap();
        assert_eq!(manifest.timezone.as_deref(), Some("America/New_York"));

        assert_eq!(
            client.stamp_revision("routes/njt_1.json"),
            "routes/njt_1.json?v=2025-11-02T04%3A10%3A00%2B00%3A00"
        );
        client.load_route_data("routes/njt_1.json").await.unwrap();
        assert_eq!(fetcher.fetch_count("routes/njt_1.json"), 1);
    }

    #[tokio::test]
    async fn non_2xx_is_a_fetch_error() {
        let fetcher = Arc::new(MemoryFetcher::new());
        let client = DataClient::new(Arc::new(Arc::clone(&fetcher)));
        let err = client.load_route_data("routes/missing.json").await.unwrap_err();
        assert_eq!(
            err,
            FetchError::Status {
                path: "routes/missing.json".to_string(),
                status: 404
            }
        );
    }

    #[tokio::test]
    async fn decode_failure_is_reported_with_path() {
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.insert("routes/bad.json", b"not json".to_vec());
        let client = DataClient::new(Arc::new(Arc::clone(&fetcher)));
        match client.load_route_data("routes/bad.json").await {
            Err(FetchError::Decode { path, .. }) => assert_eq!(path, "routes/bad.json"),
            other => panic!("expected decode error, got {other:?}"),
        }
    }
}
