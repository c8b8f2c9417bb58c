use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use url::Url;

use crate::keys::models::ProviderConfig;

pub const DEFAULT_API_URL: &str = "https://api.datadoghq.com/api/v1";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const API_KEY_HEADER: &str = "DD-API-KEY";
const APP_KEY_HEADER: &str = "DD-APPLICATION-KEY";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("failed to build datadog client: {0}")]
    Build(#[source] reqwest::Error),
    #[error("invalid datadog api url `{0}`")]
    InvalidBaseUrl(String),
    #[error("refusing datadog {operation} request for malformed key")]
    InvalidKey { operation: &'static str },
    #[error("datadog {operation} request failed: {source}")]
    Request {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("datadog {operation} request failed with status {status}")]
    Status { operation: &'static str, status: u16 },
    #[error("failed to decode datadog {operation} response: {source}")]
    Decode {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },
}

/// Remote side of the engine: mints and destroys Datadog keys.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    async fn create_api_key(&self, name: &str) -> Result<String, ProviderError>;
    async fn create_app_key(&self, name: &str, scopes: &[String])
        -> Result<String, ProviderError>;
    async fn delete_api_key(&self, key: &str) -> Result<(), ProviderError>;
    async fn delete_app_key(&self, key: &str) -> Result<(), ProviderError>;
}

/// Builds a provider client bound to one set of admin credentials.
pub trait ProviderFactory: Send + Sync {
    fn build(&self, config: &ProviderConfig) -> Result<Arc<dyn KeyProvider>, ProviderError>;
}

#[derive(Clone, Debug)]
pub struct DatadogFactory {
    base_url: String,
    timeout: Duration,
}

impl DatadogFactory {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            timeout,
        }
    }
}

impl Default for DatadogFactory {
    fn default() -> Self {
        Self::new(DEFAULT_API_URL, DEFAULT_REQUEST_TIMEOUT)
    }
}

impl ProviderFactory for DatadogFactory {
    fn build(&self, config: &ProviderConfig) -> Result<Arc<dyn KeyProvider>, ProviderError> {
        let client = DatadogClient::new(
            self.base_url.clone(),
            config.api_key.clone(),
            config.app_key.clone(),
            self.timeout,
        )?;
        Ok(Arc::new(client))
    }
}

#[derive(Clone)]
pub struct DatadogClient {
    base: Url,
    api_key: String,
    app_key: String,
    client: Client,
}

#[derive(Deserialize)]
struct CreatedApiKey {
    api_key: String,
}

#[derive(Deserialize)]
struct CreatedAppKey {
    application_key: String,
}

impl DatadogClient {
    pub fn new(
        base: impl Into<String>,
        api_key: impl Into<String>,
        app_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let base = base.into();
        let parsed = Url::parse(&base).map_err(|_| ProviderError::InvalidBaseUrl(base.clone()))?;
        if parsed.cannot_be_a_base() {
            return Err(ProviderError::InvalidBaseUrl(base));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ProviderError::Build)?;
        Ok(Self {
            base: parsed,
            api_key: api_key.into(),
            app_key: app_key.into(),
            client,
        })
    }

    /// Appends `segments` to the base path. Each segment is percent-encoded, so a
    /// value containing `/`, `?` or `#` stays a single path segment.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn send(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<Response, ProviderError> {
        request
            .header(API_KEY_HEADER, &self.api_key)
            .header(APP_KEY_HEADER, &self.app_key)
            .send()
            .await
            .map_err(|source| ProviderError::Request { operation, source })
    }

    async fn delete(
        &self,
        operation: &'static str,
        collection: &str,
        key: &str,
    ) -> Result<(), ProviderError> {
        // Dot segments are dropped when the path is built, which would retarget the
        // request at the collection itself.
        if key.is_empty() || key == "." || key == ".." {
            return Err(ProviderError::InvalidKey { operation });
        }
        let response = self
            .send(operation, self.client.delete(self.endpoint(&[collection, key])))
            .await?;
        // An absent key is already revoked; treating it as success keeps revocation retryable.
        if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!(operation, "datadog key already absent");
            return Ok(());
        }
        ensure_success(operation, response)?;
        Ok(())
    }
}

fn ensure_success(operation: &'static str, response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(ProviderError::Status {
            operation,
            status: status.as_u16(),
        })
    }
}

#[async_trait]
impl KeyProvider for DatadogClient {
    async fn create_api_key(&self, name: &str) -> Result<String, ProviderError> {
        const OPERATION: &str = "create_api_key";
        let request = self
            .client
            .post(self.endpoint(&["api_key"]))
            .json(&json!({ "name": name }));
        let response = ensure_success(OPERATION, self.send(OPERATION, request).await?)?;
        let created: CreatedApiKey = response.json().await.map_err(|source| ProviderError::Decode {
            operation: OPERATION,
            source,
        })?;
        Ok(created.api_key)
    }

    async fn create_app_key(
        &self,
        name: &str,
        scopes: &[String],
    ) -> Result<String, ProviderError> {
        const OPERATION: &str = "create_app_key";
        let request = self
            .client
            .post(self.endpoint(&["application_key"]))
            .json(&json!({ "name": name, "scopes": scopes }));
        let response = ensure_success(OPERATION, self.send(OPERATION, request).await?)?;
        let created: CreatedAppKey = response.json().await.map_err(|source| ProviderError::Decode {
            operation: OPERATION,
            source,
        })?;
        Ok(created.application_key)
    }

    async fn delete_api_key(&self, key: &str) -> Result<(), ProviderError> {
        self.delete("delete_api_key", "api_key", key).await
    }

    async fn delete_app_key(&self, key: &str) -> Result<(), ProviderError> {
        self.delete("delete_app_key", "application_key", key)
            .await
    }
}

/// Recording doubles for exercising the engine without a Datadog account.
pub mod testing {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum ProviderCall {
        CreateApiKey(String),
        CreateAppKey(String, Vec<String>),
        DeleteApiKey(String),
        DeleteAppKey(String),
    }

    pub struct RecordingProvider {
        api_key: String,
        app_key: String,
        calls: Mutex<Vec<ProviderCall>>,
        failing: Mutex<HashSet<&'static str>>,
    }

    impl RecordingProvider {
        pub fn new(api_key: impl Into<String>, app_key: impl Into<String>) -> Self {
            Self {
                api_key: api_key.into(),
                app_key: app_key.into(),
                calls: Mutex::new(Vec::new()),
                failing: Mutex::new(HashSet::new()),
            }
        }

        /// Makes every later call to `operation` (e.g. `"create_app_key"`) fail with a 500.
        pub fn fail_on(&self, operation: &'static str) {
            self.failing
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(operation);
        }

        pub fn calls(&self) -> Vec<ProviderCall> {
            self.calls
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone()
        }

        fn record(&self, operation: &'static str, call: ProviderCall) -> Result<(), ProviderError> {
            self.calls
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(call);
            let failing = self
                .failing
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if failing.contains(operation) {
                return Err(ProviderError::Status {
                    operation,
                    status: 500,
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl KeyProvider for RecordingProvider {
        async fn create_api_key(&self, name: &str) -> Result<String, ProviderError> {
            self.record("create_api_key", ProviderCall::CreateApiKey(name.to_string()))?;
            Ok(self.api_key.clone())
        }

        async fn create_app_key(
            &self,
            name: &str,
            scopes: &[String],
        ) -> Result<String, ProviderError> {
            self.record(
                "create_app_key",
                ProviderCall::CreateAppKey(name.to_string(), scopes.to_vec()),
            )?;
            Ok(self.app_key.clone())
        }

        async fn delete_api_key(&self, key: &str) -> Result<(), ProviderError> {
            self.record("delete_api_key", ProviderCall::DeleteApiKey(key.to_string()))
        }

        async fn delete_app_key(&self, key: &str) -> Result<(), ProviderError> {
            self.record("delete_app_key", ProviderCall::DeleteAppKey(key.to_string()))
        }
    }

    /// Hands out one shared [`RecordingProvider`] and remembers which admin
    /// credentials each build used.
    pub struct RecordingFactory {
        provider: Arc<RecordingProvider>,
        builds: AtomicUsize,
        configs: Mutex<Vec<ProviderConfig>>,
    }

    impl RecordingFactory {
        pub fn new(provider: Arc<RecordingProvider>) -> Self {
            Self {
                provider,
                builds: AtomicUsize::new(0),
                configs: Mutex::new(Vec::new()),
            }
        }

        pub fn builds(&self) -> usize {
            self.builds.load(Ordering::SeqCst)
        }

        pub fn configs(&self) -> Vec<ProviderConfig> {
            self.configs
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone()
        }
    }

    impl ProviderFactory for RecordingFactory {
        fn build(&self, config: &ProviderConfig) -> Result<Arc<dyn KeyProvider>, ProviderError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            self.configs
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(config.clone());
            Ok(self.provider.clone())
        }
    }
}
