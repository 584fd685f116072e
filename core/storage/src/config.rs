//! Credential resolution.
//!
//! Credentials come from two layers: the runtime environment, then the
//! deployment configuration. The first non-empty value wins. Resolution is
//! repeated on every handle construction; nothing is cached.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use zeroize::Zeroize;

use azkeep_common::{Error, Result};

/// Environment variable holding the storage account name.
pub const ACCOUNT_ENV: &str = "AZURE_STORAGE_ACCOUNT";
/// Environment variable holding the storage access key.
pub const ACCESS_KEY_ENV: &str = "AZURE_STORAGE_ACCESS_KEY";

/// A logical credential value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKey {
    Account,
    AccessKey,
}

impl CredentialKey {
    /// Environment variable consulted first.
    pub fn env_var(self) -> &'static str {
        match self {
            CredentialKey::Account => ACCOUNT_ENV,
            CredentialKey::AccessKey => ACCESS_KEY_ENV,
        }
    }

    /// Dotted path of the deployment configuration fallback.
    pub fn config_path(self) -> &'static str {
        match self {
            CredentialKey::Account => "azurestorage.account",
            CredentialKey::AccessKey => "azurestorage.key",
        }
    }
}

/// Storage access key that zeroizes on drop.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct AccessKey(String);

impl AccessKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the key as configured (base64 text).
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessKey([REDACTED])")
    }
}

/// A resolved (account, access key) pair.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub account: String,
    pub access_key: AccessKey,
}

impl Credentials {
    pub fn new(account: impl Into<String>, access_key: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            access_key: AccessKey::new(access_key),
        }
    }
}

/// The `azurestorage` section of the deployment configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AzureStorageSection {
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

/// Deployment-time configuration store.
///
/// Loaded from a JSON document such as
/// `{"azurestorage": {"account": "...", "key": "..."}}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentConfig {
    #[serde(default)]
    pub azurestorage: AzureStorageSection,
}

impl DeploymentConfig {
    /// Build a configuration holding the given credentials.
    pub fn with_credentials(account: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            azurestorage: AzureStorageSection {
                account: Some(account.into()),
                key: Some(key.into()),
            },
        }
    }

    /// Load from a JSON file.
    ///
    /// # Errors
    /// - File cannot be read
    /// - File is not a valid configuration document
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    /// Parse from JSON text.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            Error::Configuration(format!("Invalid deployment configuration: {}", e))
        })
    }

    fn get(&self, key: CredentialKey) -> Option<&str> {
        match key {
            CredentialKey::Account => self.azurestorage.account.as_deref(),
            CredentialKey::AccessKey => self.azurestorage.key.as_deref(),
        }
    }
}

/// The environment layer.
#[derive(Debug, Clone)]
pub enum Environment {
    /// The live process environment, read at resolution time.
    Process,
    /// A fixed set of variables.
    Fixed(HashMap<String, String>),
}

impl Environment {
    fn get(&self, name: &str) -> Option<String> {
        match self {
            Environment::Process => std::env::var(name).ok(),
            Environment::Fixed(vars) => vars.get(name).cloned(),
        }
    }
}

/// Layered credential source: environment first, then deployment config.
#[derive(Debug, Clone)]
pub struct CredentialSource {
    env: Environment,
    deployment: DeploymentConfig,
}

impl CredentialSource {
    pub fn new(env: Environment, deployment: DeploymentConfig) -> Self {
        Self { env, deployment }
    }

    /// Source backed by the process environment.
    pub fn from_process(deployment: DeploymentConfig) -> Self {
        Self::new(Environment::Process, deployment)
    }

    /// Source backed by a fixed variable map.
    pub fn from_vars<I, K, V>(vars: I, deployment: DeploymentConfig) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        Self::new(Environment::Fixed(vars), deployment)
    }

    /// Return the first non-empty value for `key`.
    pub fn resolve(&self, key: CredentialKey) -> Option<String> {
        self.env
            .get(key.env_var())
            .filter(|v| !v.is_empty())
            .or_else(|| {
                self.deployment
                    .get(key)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
            })
    }

    /// Resolve both credential values.
    ///
    /// # Errors
    /// - `Configuration` naming the first value neither layer supplies
    pub fn credentials(&self) -> Result<Credentials> {
        let require = |key: CredentialKey| {
            self.resolve(key).ok_or_else(|| {
                Error::Configuration(format!(
                    "No value for {} (set {} or configure {})",
                    match key {
                        CredentialKey::Account => "storage account",
                        CredentialKey::AccessKey => "storage access key",
                    },
                    key.env_var(),
                    key.config_path()
                ))
            })
        };

        Ok(Credentials::new(
            require(CredentialKey::Account)?,
            require(CredentialKey::AccessKey)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_environment_takes_precedence() {
        let source = CredentialSource::from_vars(
            [(ACCOUNT_ENV, "envaccount")],
            DeploymentConfig::with_credentials("cfgaccount", "cfgkey"),
        );

        let creds = source.credentials().unwrap();
        assert_eq!(creds.account, "envaccount");
        assert_eq!(creds.access_key.expose(), "cfgkey");
    }

    #[test]
    fn test_empty_environment_value_falls_through() {
        let source = CredentialSource::from_vars(
            [(ACCOUNT_ENV, ""), (ACCESS_KEY_ENV, "")],
            DeploymentConfig::with_credentials("cfgaccount", "cfgkey"),
        );

        assert_eq!(source.resolve(CredentialKey::Account).as_deref(), Some("cfgaccount"));
        assert_eq!(source.resolve(CredentialKey::AccessKey).as_deref(), Some("cfgkey"));
    }

    #[test]
    fn test_missing_credentials_is_configuration_error() {
        let source = CredentialSource::from_vars(
            [(ACCOUNT_ENV, "only-account")],
            DeploymentConfig::default(),
        );

        match source.credentials() {
            Err(Error::Configuration(msg)) => assert!(msg.contains(ACCESS_KEY_ENV)),
            other => panic!("expected configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_load_deployment_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"azurestorage": {{"account": "deployed", "key": "a2V5"}}}}"#
        )
        .unwrap();

        let config = DeploymentConfig::load(file.path()).unwrap();
        assert_eq!(config.azurestorage.account.as_deref(), Some("deployed"));
        assert_eq!(config.azurestorage.key.as_deref(), Some("a2V5"));
    }

    #[test]
    fn test_invalid_deployment_json() {
        assert!(matches!(
            DeploymentConfig::from_json("{not json"),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_access_key_is_redacted() {
        let creds = Credentials::new("acct", "super-secret");
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("super-secret"));
    }
}
