use std::sync::Arc;

use crate::error::EngineError;
use crate::storage::{Storage, StorageError};

use super::models::{ProviderConfig, Role};

const CONFIG_KEY: &str = "config";
const ROLE_PREFIX: &str = "role/";

/// Singleton record holding the Datadog admin credentials.
#[derive(Clone)]
pub struct ConfigStore {
    storage: Arc<dyn Storage>,
}

impl ConfigStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn read(&self) -> Result<Option<ProviderConfig>, StorageError> {
        match self.storage.get(CONFIG_KEY).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn write(&self, config: &ProviderConfig) -> Result<(), StorageError> {
        self.storage
            .put(CONFIG_KEY, serde_json::to_value(config)?)
            .await
    }

    pub async fn delete(&self) -> Result<(), StorageError> {
        self.storage.delete(CONFIG_KEY).await
    }
}

#[derive(Clone)]
pub struct RoleStore {
    storage: Arc<dyn Storage>,
}

impl RoleStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn read(&self, name: &str) -> Result<Option<Role>, StorageError> {
        let Some(value) = self.storage.get(&role_key(name)).await? else {
            return Ok(None);
        };
        let mut role: Role = serde_json::from_value(value)?;
        role.name = name.to_string();
        Ok(Some(role))
    }

    /// Validates before touching storage, so a rejected role never leaves a partial write.
    pub async fn write(&self, role: &Role) -> Result<(), EngineError> {
        role.validate()?;
        let body = serde_json::to_value(role).map_err(StorageError::from)?;
        self.storage.put(&role_key(&role.name), body).await?;
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<(), StorageError> {
        self.storage.delete(&role_key(name)).await
    }

    pub async fn list(&self) -> Result<Vec<String>, StorageError> {
        self.storage.list(ROLE_PREFIX).await
    }
}

fn role_key(name: &str) -> String {
    format!("{ROLE_PREFIX}{name}")
}
