use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::EngineSettings;
use crate::error::{EngineError, EngineResult};
use crate::provider::{DatadogFactory, KeyProvider, ProviderFactory};
use crate::storage::Storage;

use super::models::{
    validate_role_name, IssuedCredentialSet, Lease, ProviderConfig, Role, RoleRequest,
};
use super::store::{ConfigStore, RoleStore};

/// Issues Datadog keys for roles and destroys them again when their lease ends.
///
/// The engine keeps no durable state. The only thing it caches is the provider
/// client built from the stored admin credentials; any configuration change drops
/// that client and bumps a generation counter so that a client built from stale
/// credentials is never put back into the cache.
pub struct KeyEngine {
    configs: ConfigStore,
    roles: RoleStore,
    factory: Arc<dyn ProviderFactory>,
    cleanup_partial_issuance: bool,
    client: RwLock<CachedClient>,
}

#[derive(Default)]
struct CachedClient {
    generation: u64,
    client: Option<Arc<dyn KeyProvider>>,
}

impl KeyEngine {
    pub fn new(storage: Arc<dyn Storage>, factory: Arc<dyn ProviderFactory>) -> Self {
        Self {
            configs: ConfigStore::new(storage.clone()),
            roles: RoleStore::new(storage),
            factory,
            cleanup_partial_issuance: false,
            client: RwLock::new(CachedClient::default()),
        }
    }

    pub fn from_settings(storage: Arc<dyn Storage>, settings: &EngineSettings) -> Self {
        let factory = DatadogFactory::new(settings.api_url.clone(), settings.request_timeout);
        Self::new(storage, Arc::new(factory))
            .with_partial_cleanup(settings.cleanup_partial_issuance)
    }

    /// Delete the already-created API key when the application key half of a `both`
    /// issuance fails.
    pub fn with_partial_cleanup(mut self, enabled: bool) -> Self {
        self.cleanup_partial_issuance = enabled;
        self
    }

    pub async fn read_config(&self) -> EngineResult<Option<ProviderConfig>> {
        Ok(self.configs.read().await?)
    }

    pub async fn write_config(&self, config: &ProviderConfig) -> EngineResult<()> {
        self.configs.write(config).await?;
        self.invalidate_client().await;
        info!("datadog backend configuration updated");
        Ok(())
    }

    pub async fn delete_config(&self) -> EngineResult<()> {
        self.configs.delete().await?;
        self.invalidate_client().await;
        info!("datadog backend configuration removed");
        Ok(())
    }

    pub async fn read_role(&self, name: &str) -> EngineResult<Option<Role>> {
        validate_role_name(name)?;
        Ok(self.roles.read(name).await?)
    }

    pub async fn write_role(&self, name: &str, request: RoleRequest) -> EngineResult<Role> {
        let role = request.into_role(name)?;
        self.roles.write(&role).await?;
        info!(role = %role.name, key_type = role.key_type.as_str(), "role stored");
        Ok(role)
    }

    pub async fn delete_role(&self, name: &str) -> EngineResult<()> {
        validate_role_name(name)?;
        self.roles.delete(name).await?;
        info!(role = %name, "role deleted");
        Ok(())
    }

    pub async fn list_roles(&self) -> EngineResult<Vec<String>> {
        Ok(self.roles.list().await?)
    }

    /// Mints the keys described by `role_name` and wraps them in a lease.
    ///
    /// Under a `both` role the API key is created first. If the application key then
    /// fails, the API key is left behind at Datadog unless partial cleanup is enabled.
    pub async fn issue(&self, role_name: &str, key_name: Option<&str>) -> EngineResult<Lease> {
        if role_name.is_empty() {
            return Err(EngineError::MissingRoleName);
        }
        let role = self
            .roles
            .read(role_name)
            .await?
            .ok_or_else(|| EngineError::RoleNotFound(role_name.to_string()))?;
        let client = self.provider_client().await?;

        let key_name = match key_name.filter(|name| !name.is_empty()) {
            Some(name) => name.to_string(),
            None => generated_key_name(role_name, Utc::now()),
        };

        let mut credentials = IssuedCredentialSet::new(role.key_type);
        if role.key_type.includes_api() {
            let key = client.create_api_key(&key_name).await.map_err(|source| {
                EngineError::provider(format!("error creating API key for role {role_name}"), source)
            })?;
            credentials.api_key = Some(key);
        }

        if role.key_type.includes_app() {
            match client.create_app_key(&key_name, &role.scopes).await {
                Ok(key) => credentials.app_key = Some(key),
                Err(source) => {
                    if let Some(orphan) = credentials.api_key.as_deref() {
                        warn!(
                            role = %role_name,
                            %key_name,
                            cleanup = self.cleanup_partial_issuance,
                            "application key creation failed after API key was created"
                        );
                        if self.cleanup_partial_issuance {
                            discard_orphaned_api_key(client.as_ref(), orphan, role_name).await;
                        }
                    }
                    return Err(EngineError::provider(
                        format!("error creating Application key for role {role_name}"),
                        source,
                    ));
                }
            }
        }

        info!(
            role = %role_name,
            %key_name,
            key_type = role.key_type.as_str(),
            ttl = role.ttl,
            max_ttl = role.max_ttl,
            "issued datadog keys"
        );
        Ok(Lease::new(credentials, &role))
    }

    /// Deletes exactly the keys recorded in `credentials`, API key first. The current
    /// role definition is never consulted. Stops at the first failure; deleting keys
    /// that are already gone succeeds, so the host can simply retry.
    pub async fn revoke(&self, credentials: &IssuedCredentialSet) -> EngineResult<()> {
        let client = self.provider_client().await?;

        if let Some(key) = credentials.revocable_api_key() {
            client
                .delete_api_key(key)
                .await
                .map_err(|source| EngineError::provider("error revoking API key", source))?;
        }

        if let Some(key) = credentials.revocable_app_key() {
            client
                .delete_app_key(key)
                .await
                .map_err(|source| EngineError::provider("error revoking Application key", source))?;
        }

        info!(key_type = credentials.key_type.as_str(), "revoked datadog keys");
        Ok(())
    }

    /// Revocation entry point for untyped lease internal data.
    pub async fn revoke_raw(&self, data: Value) -> EngineResult<()> {
        let credentials = IssuedCredentialSet::from_lease_data(data)?;
        self.revoke(&credentials).await
    }

    async fn provider_client(&self) -> EngineResult<Arc<dyn KeyProvider>> {
        let generation = {
            let cached = self.client.read().await;
            if let Some(client) = &cached.client {
                return Ok(client.clone());
            }
            cached.generation
        };

        let config = self.configs.read().await?.ok_or(EngineError::NotConfigured)?;
        let client = self
            .factory
            .build(&config)
            .map_err(|source| EngineError::provider("error building datadog client", source))?;

        let mut cached = self.client.write().await;
        if cached.generation != generation {
            // Configuration changed while we were building; serve this call but do not cache.
            return Ok(client);
        }
        if let Some(existing) = &cached.client {
            return Ok(existing.clone());
        }
        cached.client = Some(client.clone());
        debug!(generation, "datadog client constructed");
        Ok(client)
    }

    async fn invalidate_client(&self) {
        let mut cached = self.client.write().await;
        cached.generation += 1;
        cached.client = None;
    }
}

async fn discard_orphaned_api_key(client: &dyn KeyProvider, key: &str, role_name: &str) {
    match client.delete_api_key(key).await {
        Ok(()) => info!(role = %role_name, "deleted orphaned API key after partial issuance"),
        Err(err) => error!(
            ?err,
            role = %role_name,
            "failed to delete orphaned API key after partial issuance"
        ),
    }
}

fn generated_key_name(role_name: &str, now: DateTime<Utc>) -> String {
    format!("vault-{role_name}-{}", now.timestamp())
}
