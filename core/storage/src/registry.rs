//! Backend registry for resolving a storage facade by name.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use azkeep_common::{Error, Result};

use crate::azure::AzureConfig;
use crate::config::CredentialSource;
use crate::facade::StorageFacade;
use crate::memory::MemoryStorage;

/// Builds a facade from a credential source and backend-specific settings.
pub type BackendFactory =
    Box<dyn Fn(CredentialSource, Value) -> Result<StorageFacade> + Send + Sync>;

/// Registry of storage backend factories.
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a backend factory.
    ///
    /// # Preconditions
    /// - `name` is not yet registered
    ///
    /// # Postconditions
    /// - `resolve(name, ..)` uses `factory`
    ///
    /// # Errors
    /// - `name` is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: BackendFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Backend '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Build a facade with the named backend.
    ///
    /// # Preconditions
    /// - `name` is registered
    ///
    /// # Postconditions
    /// - No request has been sent; credentials are resolved per operation
    ///
    /// # Errors
    /// - Backend not registered
    /// - Settings invalid for the backend
    pub fn resolve(
        &self,
        name: &str,
        source: CredentialSource,
        settings: Value,
    ) -> Result<StorageFacade> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Backend '{}' is not registered", name)))?;
        factory(source, settings)
    }

    /// Registered backend names, sorted.
    pub fn backends(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_backend(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn azure_backend(source: CredentialSource, settings: Value) -> Result<StorageFacade> {
    let config = if settings.is_null() {
        AzureConfig::default()
    } else {
        serde_json::from_value(settings)
            .map_err(|e| Error::Configuration(format!("Invalid azure settings: {}", e)))?
    };
    StorageFacade::azure(source, config)
}

/// A fresh in-memory service. Its account and key come from `settings`
/// when given, otherwise from the credentials `source` resolves now.
fn memory_backend(source: CredentialSource, settings: Value) -> Result<StorageFacade> {
    let setting = |name: &str| settings.get(name).and_then(Value::as_str).map(str::to_string);

    let (account, key) = match (setting("account"), setting("key")) {
        (Some(account), Some(key)) => (account, key),
        (account, key) => {
            let credentials = source.credentials()?;
            (
                account.unwrap_or(credentials.account),
                key.unwrap_or_else(|| credentials.access_key.expose().to_string()),
            )
        }
    };

    let storage = Arc::new(MemoryStorage::new(account, key));
    Ok(StorageFacade::memory(source, storage))
}

/// Create a registry with the built-in backends: `azure` and `memory`.
pub fn create_default_registry() -> Result<BackendRegistry> {
    let mut registry = BackendRegistry::new();
    registry.register("azure", Box::new(azure_backend))?;
    registry.register("memory", Box::new(memory_backend))?;
    Ok(registry)
}
