//! Source credential port and its implementations.
//!
//! A staging pull needs an access key pair for the object store. The engine
//! asks a [`CredentialProvider`] for it by reference name (for example
//! `aws_credentials`) right before building the bulk-load statement.
//! - `EnvCredentialProvider`: reads `<REF>_ACCESS_KEY_ID` / `<REF>_SECRET_ACCESS_KEY`.
//! - `KeyringCredentialProvider`: uses the OS-native credential store.
//! - `StaticCredentialProvider`: in-memory map for tests and dry runs.

use crate::error::PortError;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// An access key pair for the source object store.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl Credentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &"****")
            .field("secret_key", &"****")
            .finish()
    }
}

/// Port resolving a credential reference to an access key pair.
///
/// `resolve` is synchronous and may block (the keyring backend talks to the
/// OS keychain); the executor calls it on tokio's blocking pool.
pub trait CredentialProvider: Send + Sync {
    fn resolve(&self, credential_ref: &str) -> Result<Credentials, PortError>;
}

/// Turn a reference name into an environment variable prefix:
/// `aws_credentials` -> `AWS_CREDENTIALS`.
pub fn env_prefix(credential_ref: &str) -> String {
    credential_ref
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Resolves credentials from environment variables.
pub struct EnvCredentialProvider {
    lookup: EnvLookup,
}

impl EnvCredentialProvider {
    pub fn new() -> Self {
        Self {
            lookup: Arc::new(|var| std::env::var(var).ok()),
        }
    }

    /// Use a custom variable lookup instead of the process environment.
    pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            lookup: Arc::new(lookup),
        }
    }

    fn read(&self, credential_ref: &str, var: String) -> Result<String, PortError> {
        (self.lookup)(&var)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| PortError::Credential {
                credential_ref: credential_ref.to_string(),
                message: format!("environment variable {var} is not set"),
            })
    }
}

impl Default for EnvCredentialProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialProvider for EnvCredentialProvider {
    fn resolve(&self, credential_ref: &str) -> Result<Credentials, PortError> {
        let prefix = env_prefix(credential_ref);
        let access_key = self.read(credential_ref, format!("{prefix}_ACCESS_KEY_ID"))?;
        let secret_key = self.read(credential_ref, format!("{prefix}_SECRET_ACCESS_KEY"))?;
        Ok(Credentials::new(access_key, secret_key))
    }
}

/// OS-native credential store using the `keyring` crate.
///
/// Entries live under service `"starload"` with accounts
/// `"<ref>:access_key"` and `"<ref>:secret_key"`.
pub struct KeyringCredentialProvider {
    service: String,
}

impl KeyringCredentialProvider {
    pub fn new() -> Self {
        Self {
            service: "starload".to_string(),
        }
    }

    fn get(&self, credential_ref: &str, field: &str) -> Result<String, PortError> {
        let account = format!("{credential_ref}:{field}");
        let entry = keyring::Entry::new(&self.service, &account).map_err(|e| {
            PortError::Credential {
                credential_ref: credential_ref.to_string(),
                message: format!("keyring backend not available: {e}"),
            }
        })?;
        entry.get_password().map_err(|e| match e {
            keyring::Error::NoEntry => PortError::Credential {
                credential_ref: credential_ref.to_string(),
                message: format!("no keyring entry for {}:{account}", self.service),
            },
            other => PortError::Credential {
                credential_ref: credential_ref.to_string(),
                message: other.to_string(),
            },
        })
    }
}

impl Default for KeyringCredentialProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialProvider for KeyringCredentialProvider {
    fn resolve(&self, credential_ref: &str) -> Result<Credentials, PortError> {
        let access_key = self.get(credential_ref, "access_key")?;
        let secret_key = self.get(credential_ref, "secret_key")?;
        Ok(Credentials::new(access_key, secret_key))
    }
}

/// In-memory credential provider.
///
/// Thread-safe via `Mutex<HashMap>`. Does not persist across process restarts.
#[derive(Default)]
pub struct StaticCredentialProvider {
    entries: Mutex<HashMap<String, Credentials>>,
    fallback: Option<Credentials>,
}

impl StaticCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, credential_ref: &str, credentials: Credentials) -> Self {
        self.insert(credential_ref, credentials);
        self
    }

    /// Answer every unknown reference with `credentials`.
    pub fn with_fallback(mut self, credentials: Credentials) -> Self {
        self.fallback = Some(credentials);
        self
    }

    pub fn insert(&self, credential_ref: &str, credentials: Credentials) {
        self.entries
            .lock()
            .unwrap()
            .insert(credential_ref.to_string(), credentials);
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn resolve(&self, credential_ref: &str) -> Result<Credentials, PortError> {
        self.entries
            .lock()
            .unwrap()
            .get(credential_ref)
            .cloned()
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| PortError::Credential {
                credential_ref: credential_ref.to_string(),
                message: "no credentials registered".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_prefix() {
        assert_eq!(env_prefix("aws_credentials"), "AWS_CREDENTIALS");
        assert_eq!(env_prefix("s3-prod.key"), "S3_PROD_KEY");
    }

    #[test]
    fn test_env_provider_resolves_pair() {
        let provider = EnvCredentialProvider::with_lookup(|var| match var {
            "AWS_CREDENTIALS_ACCESS_KEY_ID" => Some("AKIA".to_string()),
            "AWS_CREDENTIALS_SECRET_ACCESS_KEY" => Some("secret".to_string()),
            _ => None,
        });
        let creds = provider.resolve("aws_credentials").unwrap();
        assert_eq!(creds, Credentials::new("AKIA", "secret"));
    }

    #[test]
    fn test_env_provider_missing_secret() {
        let provider = EnvCredentialProvider::with_lookup(|var| {
            (var == "AWS_CREDENTIALS_ACCESS_KEY_ID").then(|| "AKIA".to_string())
        });
        let err = provider.resolve("aws_credentials").unwrap_err();
        match err {
            PortError::Credential { message, .. } => {
                assert!(message.contains("AWS_CREDENTIALS_SECRET_ACCESS_KEY"));
            }
            other => panic!("Expected Credential error, got {other:?}"),
        }
    }

    #[test]
    fn test_env_provider_rejects_empty_value() {
        let provider = EnvCredentialProvider::with_lookup(|_| Some(String::new()));
        assert!(provider.resolve("aws_credentials").is_err());
    }

    #[test]
    fn test_static_provider() {
        let provider =
            StaticCredentialProvider::new().with("aws_credentials", Credentials::new("a", "b"));
        assert_eq!(
            provider.resolve("aws_credentials").unwrap(),
            Credentials::new("a", "b")
        );
        assert!(matches!(
            provider.resolve("other"),
            Err(PortError::Credential { .. })
        ));
    }

    #[test]
    fn test_static_provider_fallback() {
        let provider = StaticCredentialProvider::new()
            .with("aws_credentials", Credentials::new("a", "b"))
            .with_fallback(Credentials::new("x", "y"));
        assert_eq!(
            provider.resolve("aws_credentials").unwrap(),
            Credentials::new("a", "b")
        );
        assert_eq!(provider.resolve("other").unwrap(), Credentials::new("x", "y"));
    }

    #[test]
    fn test_credentials_debug_is_masked() {
        let creds = Credentials::new("AKIA123", "topsecret");
        let shown = format!("{:?}", creds);
        assert!(!shown.contains("AKIA123"));
        assert!(!shown.contains("topsecret"));
    }
}
